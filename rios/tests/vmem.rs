//! Virtual-memory tests: demand loading, eviction to swap, TLB sync, and
//! the coremap invariants.

use std::sync::Arc;

use mirage::{mmu, stats, NUM_PHYS_PAGES, PAGE_SIZE};
use rios::system::{boot, coremap, file_system, BootOptions};
use rios::thread;
use rios::userprog::executable::build_image;
use rios::userprog::transfer;
use rios::vm::AddressSpace;
use rios::KernelError;

fn vm_test(f: impl FnOnce()) {
    boot(BootOptions::default(), f);
}

/// Write `image` into a fresh file and build an address space over it,
/// attached to the calling thread so user-memory accesses fault through it.
fn space_for_image(name: &str, image: &[u8], space_id: usize) -> Arc<AddressSpace> {
    let fs = file_system();
    fs.create(name, 0, false).unwrap();
    let file = fs.open(name).unwrap();
    file.write(image).unwrap();
    let space = Arc::new(AddressSpace::new(file, space_id).unwrap());
    thread::with_current(|th| {
        let mut g = th.space.lock();
        *g = Some(space.clone());
        g.unlock();
    });
    space.restore_state();
    space
}

fn detach_and_destroy(space: &Arc<AddressSpace>) {
    thread::with_current(|th| {
        let mut g = th.space.lock();
        *g = None;
        g.unlock();
    });
    space.destroy();
    mmu::invalidate_tlb();
}

fn code_and_data(total: usize) -> (Vec<u8>, Vec<u8>) {
    let code: Vec<u8> = (0..total / 2).map(|i| (i * 13 + 1) as u8).collect();
    let data: Vec<u8> = (0..total - total / 2).map(|i| (i * 5 + 2) as u8).collect();
    (code, data)
}

#[test]
fn demand_loading_reproduces_the_image_past_physical_memory() {
    vm_test(|| {
        // Twice the machine's RAM, so loading it all forces eviction.
        let total = 2 * NUM_PHYS_PAGES * PAGE_SIZE;
        let (code, data) = code_and_data(total);
        let image = build_image(&code, &data, 0);
        let space = space_for_image("prog", &image, 0);

        let faults_before = stats::page_faults();
        let mut expected = code.clone();
        expected.extend_from_slice(&data);

        // Every byte read through the user buffer equals the image byte.
        let mut buf = vec![0u8; expected.len()];
        assert!(transfer::read_buffer_from_user(0, &mut buf));
        assert_eq!(buf, expected);
        assert!(stats::page_faults() > faults_before);

        // Memory pressure forced the swap file into existence.
        let swap = file_system().open("/SWAP.0").unwrap();
        assert_eq!(swap.length(), space.num_pages() * PAGE_SIZE);
        file_system().close_handle(&swap);

        // Destruction removes it again.
        detach_and_destroy(&space);
        assert_eq!(
            file_system().open("/SWAP.0").err(),
            Some(KernelError::NoSuchEntry)
        );
        file_system().remove("prog").unwrap();
        assert!(file_system().check());
    });
}

#[test]
fn dirty_pages_survive_a_swap_round_trip() {
    vm_test(|| {
        let total = 2 * NUM_PHYS_PAGES * PAGE_SIZE;
        let (code, data) = code_and_data(total);
        let image = build_image(&code, &data, 0);
        let space = space_for_image("prog", &image, 0);

        // Scribble on the data segment through user addresses.
        let marker = b"swapped-bytes";
        let data_start = code.len();
        assert!(transfer::write_buffer_to_user(marker, data_start));

        // Touch every page except the scribbled one, finishing with more
        // distinct pages than the machine has frames, so the scribbled page
        // is evicted no matter where LRU stands.
        let v = data_start / PAGE_SIZE;
        let mut sink = [0u8; 1];
        for page in (v + 1..space.num_pages()).chain(0..v) {
            transfer::read_buffer_from_user(page * PAGE_SIZE, &mut sink);
        }
        assert_eq!(
            space.entry(v).virtual_page,
            space.num_pages(),
            "the dirtied page was never swapped out"
        );

        // Faulting it back in reads the scribble from swap, not the image.
        let mut buf = vec![0u8; marker.len()];
        assert!(transfer::read_buffer_from_user(data_start, &mut buf));
        assert_eq!(&buf, marker);

        detach_and_destroy(&space);
        file_system().remove("prog").unwrap();
    });
}

#[test]
fn pure_code_pages_are_read_only() {
    vm_test(|| {
        // Code fills several pages exactly; data begins page-aligned after.
        let code_len = 3 * PAGE_SIZE;
        let code: Vec<u8> = (0..code_len).map(|i| i as u8).collect();
        let data = vec![0xabu8; PAGE_SIZE];
        let image = build_image(&code, &data, 0);
        let space = space_for_image("prog", &image, 0);

        let entry = space.clone().load_page(0).unwrap();
        assert!(entry.read_only, "pure code page writable");
        let data_entry = space.clone().load_page(code_len).unwrap();
        assert!(!data_entry.read_only, "data page read-only");

        detach_and_destroy(&space);
        file_system().remove("prog").unwrap();
    });
}

#[test]
fn coremap_backpointers_match_the_page_tables() {
    vm_test(|| {
        let total = NUM_PHYS_PAGES * PAGE_SIZE / 2;
        let (code, data) = code_and_data(total);
        let image = build_image(&code, &data, 0);
        let space = space_for_image("prog", &image, 0);

        for page in 0..space.num_pages() {
            space.clone().load_page(page * PAGE_SIZE).unwrap();
        }

        // Invariant: a valid page-table entry and the coremap agree, and no
        // frame backs two pages.
        let mut seen_frames = Vec::new();
        for v in 0..space.num_pages() {
            let entry = space.entry(v);
            if !entry.valid {
                continue;
            }
            assert!(
                !seen_frames.contains(&entry.physical_page),
                "frame {} mapped twice",
                entry.physical_page
            );
            seen_frames.push(entry.physical_page);
            let (owner, page) = coremap().owner(entry.physical_page).expect("frame unowned");
            assert!(Arc::ptr_eq(&owner, &space));
            assert_eq!(page, v);
        }
        assert!(!seen_frames.is_empty());

        detach_and_destroy(&space);
        file_system().remove("prog").unwrap();
    });
}

#[test]
fn swapping_a_resident_page_invalidates_its_tlb_entry() {
    vm_test(|| {
        let total = 4 * PAGE_SIZE;
        let (code, data) = code_and_data(total);
        let image = build_image(&code, &data, 0);
        let space = space_for_image("prog", &image, 0);

        // Fault page 1 in through the MMU so the TLB caches it.
        let mut sink = [0u8; 1];
        assert!(transfer::read_buffer_from_user(PAGE_SIZE, &mut sink));
        let entry = space.entry(1);
        assert!(entry.valid);
        let cached = (0..mirage::TLB_SIZE)
            .map(mmu::tlb_entry)
            .any(|e| e.valid && e.virtual_page == 1);
        assert!(cached, "faulted page not in the TLB");

        space.swap_page(1);

        // The sentinel is set and no TLB slot still maps the page or the
        // freed frame.
        assert_eq!(space.entry(1).virtual_page, space.num_pages());
        for slot in 0..mirage::TLB_SIZE {
            let e = mmu::tlb_entry(slot);
            assert!(!e.valid || e.virtual_page != 1);
            assert!(!e.valid || e.physical_page != entry.physical_page);
        }

        detach_and_destroy(&space);
        file_system().remove("prog").unwrap();
    });
}
