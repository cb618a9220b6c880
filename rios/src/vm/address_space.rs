//! Per-process address spaces.
//!
//! Construction maps nothing: every page-table entry starts invalid, and
//! pages materialize on first touch in [`load_page`](AddressSpace::load_page),
//! which the page-fault handler drives. An invalid entry encodes which of
//! two states the page is in:
//!
//! * `virtual_page == v` — never loaded; the page's bytes come from the
//!   executable (zero-filled where no segment covers them);
//! * `virtual_page == num_pages` — the swapped-out sentinel; the bytes are
//!   in the swap file at offset `v * PAGE_SIZE`.
//!
//! The swap file `SWAP.<spaceId>` is created lazily at the root directory
//! on the first eviction, sized for the whole space, and removed when the
//! space is destroyed. Swapping a page the running thread may have in the
//! TLB first syncs that TLB entry's use/dirty bits back and invalidates
//! the slot, then drops any slot still naming the freed frame.

use std::sync::Arc;

use mirage::mmu::{self, TranslationEntry};
use mirage::spinlock::SpinLock;
use mirage::{cpu, trace, PAGE_SIZE, TLB_SIZE, USER_STACK_SIZE};

use crate::fs::OpenFile;
use crate::thread;
use crate::userprog::executable::Executable;
use crate::KernelError;

/// A user process's address space.
pub struct AddressSpace {
    space_id: usize,
    executable: Executable,
    num_pages: usize,
    page_table: SpinLock<Vec<TranslationEntry>>,
    swap: SpinLock<Option<Arc<OpenFile>>>,
    swap_name: String,
}

impl AddressSpace {
    /// Build a space for `executable`, which must be a valid image. The
    /// space covers the image plus [`USER_STACK_SIZE`] bytes of stack.
    pub fn new(executable: Arc<OpenFile>, space_id: usize) -> Result<Self, KernelError> {
        let executable = Executable::parse(executable)?;
        let size = executable.size() + USER_STACK_SIZE;
        let num_pages = size.div_ceil(PAGE_SIZE);
        trace!('a', "space {}: {} pages ({} bytes)", space_id, num_pages, size);
        let page_table = (0..num_pages)
            .map(|v| TranslationEntry {
                virtual_page: v,
                ..TranslationEntry::invalid()
            })
            .collect();
        Ok(Self {
            space_id,
            executable,
            num_pages,
            page_table: SpinLock::new(page_table),
            swap: SpinLock::new(None),
            swap_name: format!("/SWAP.{space_id}"),
        })
    }

    /// This space's id (also the process id user programs see).
    pub fn space_id(&self) -> usize {
        self.space_id
    }

    /// Pages in the space.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// A snapshot of entry `v`, for tests and the fault handler.
    pub fn entry(&self, v: usize) -> TranslationEntry {
        let g = self.page_table.lock();
        let e = g[v];
        g.unlock();
        e
    }

    fn swap_file(&self) -> Arc<OpenFile> {
        let g = self.swap.lock();
        let existing = g.clone();
        g.unlock();
        if let Some(file) = existing {
            return file;
        }
        // First eviction: materialize the swap file, full-size up front so
        // page writes never extend it. Two evictors can race here; the
        // loser adopts the winner's handle.
        let fs = crate::system::file_system();
        match fs.create(&self.swap_name, self.num_pages * PAGE_SIZE, false) {
            Ok(()) | Err(KernelError::FileExist) => {}
            Err(e) => panic!("swap file creation failed: {e:?}"),
        }
        let file = fs.open(&self.swap_name).expect("swap file open failed");
        trace!('a', "space {}: created swap file {}", self.space_id, self.swap_name);
        let mut g = self.swap.lock();
        if let Some(existing) = g.clone() {
            g.unlock();
            fs.close_handle(&file);
            return existing;
        }
        *g = Some(file.clone());
        g.unlock();
        file
    }

    /// Bring the page holding `vaddr` into memory, evicting someone else's
    /// page if the machine is out of frames. Returns the up-to-date
    /// translation entry for the page.
    ///
    /// Takes the `Arc` so the coremap can record this space as the frame's
    /// owner; callers keep their own clone.
    pub fn load_page(self: Arc<Self>, vaddr: usize) -> Result<TranslationEntry, KernelError> {
        let v = vaddr / PAGE_SIZE;
        if v >= self.num_pages {
            return Err(KernelError::BadAddress);
        }
        let swapped = {
            let g = self.page_table.lock();
            let e = g[v];
            g.unlock();
            if e.valid {
                return Ok(e);
            }
            e.virtual_page == self.num_pages
        };

        let frame = crate::system::coremap().find(&self, v);
        let mut page = [0u8; PAGE_SIZE];
        let read_only = if swapped {
            self.unswap_page(v, &mut page);
            false
        } else {
            trace!('a', "space {}: demand-loading page {}", self.space_id, v);
            self.demand_load(v, &mut page)
        };
        mmu::write_frame(frame, &page);

        let entry = TranslationEntry {
            virtual_page: v,
            physical_page: frame,
            valid: true,
            read_only,
            used: false,
            dirty: false,
        };
        let mut g = self.page_table.lock();
        g[v] = entry;
        g.unlock();
        Ok(entry)
    }

    /// Read page `v` back from the swap file.
    fn unswap_page(&self, v: usize, page: &mut [u8; PAGE_SIZE]) {
        trace!('a', "space {}: swapping page {} back in", self.space_id, v);
        let n = self.swap_file().read_at(page, v * PAGE_SIZE);
        debug_assert_eq!(n, PAGE_SIZE);
    }

    /// Fill `page` with the first-touch contents of page `v`: zeros
    /// overlaid with whatever the code and initialized-data segments cover.
    /// Returns whether the page is read-only (wholly inside pure code).
    fn demand_load(&self, v: usize, page: &mut [u8; PAGE_SIZE]) -> bool {
        let start = v * PAGE_SIZE;
        let end = start + PAGE_SIZE;
        let code = self.executable.code();
        let data = self.executable.init_data();

        for segment in [code, data] {
            if let Some((lo, len)) = segment.intersect(start, end) {
                let in_page = lo - start;
                let in_segment = lo - segment.virtual_addr as usize;
                self.executable
                    .read_segment(segment, &mut page[in_page..in_page + len], in_segment);
            }
        }
        // Pages shared with data (or holding any non-code bytes) stay
        // writable.
        code.size > 0
            && code.intersect(start, end) == Some((start, PAGE_SIZE))
            && data.intersect(start, end).is_none()
    }

    /// Evict page `v` to the swap file and release its frame mapping. The
    /// caller (the coremap) owns the freed frame afterwards.
    pub fn swap_page(&self, v: usize) {
        // If the victim belongs to the running thread, the TLB may hold a
        // fresher view of the entry; pull it back before deciding what to
        // write.
        if self.is_current_space() {
            self.sync_tlb_entry(v);
        }
        let entry = {
            let g = self.page_table.lock();
            let e = g[v];
            g.unlock();
            e
        };
        assert!(entry.valid, "swapping an unmapped page");
        trace!('a', "space {}: swapping out page {}", self.space_id, v);

        let mut page = [0u8; PAGE_SIZE];
        mmu::read_frame(entry.physical_page, &mut page);
        self.swap_file()
            .write_at(&page, v * PAGE_SIZE)
            .expect("swap write failed");

        let mut g = self.page_table.lock();
        g[v] = TranslationEntry {
            // The swapped-out sentinel.
            virtual_page: self.num_pages,
            ..TranslationEntry::invalid()
        };
        g.unlock();

        // Nothing may keep translating to the freed frame.
        for slot in 0..TLB_SIZE {
            let e = mmu::tlb_entry(slot);
            if e.valid && e.physical_page == entry.physical_page {
                mmu::set_tlb_entry(slot, TranslationEntry::invalid());
            }
        }
    }

    fn is_current_space(&self) -> bool {
        if !thread::have_current() {
            return false;
        }
        thread::with_current(|th| {
            let g = th.space.lock();
            let same = g
                .as_ref()
                .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), self));
            g.unlock();
            same
        })
    }

    /// Copy one TLB slot's use/dirty bits back into the page table and
    /// invalidate the slot, if the slot maps page `v`.
    fn sync_tlb_entry(&self, v: usize) {
        for slot in 0..TLB_SIZE {
            let e = mmu::tlb_entry(slot);
            if e.valid && e.virtual_page == v {
                let mut g = self.page_table.lock();
                if g[v].valid && g[v].physical_page == e.physical_page {
                    g[v].used = e.used;
                    g[v].dirty = e.dirty;
                }
                g.unlock();
                mmu::set_tlb_entry(slot, TranslationEntry::invalid());
            }
        }
    }

    /// Context-switch out: fold every TLB entry back into the page table
    /// and invalidate the TLB.
    pub fn save_state(&self) {
        let mut g = self.page_table.lock();
        for slot in 0..TLB_SIZE {
            let e = mmu::tlb_entry(slot);
            if e.valid
                && e.virtual_page < self.num_pages
                && g[e.virtual_page].valid
                && g[e.virtual_page].physical_page == e.physical_page
            {
                g[e.virtual_page].used = e.used;
                g[e.virtual_page].dirty = e.dirty;
            }
        }
        g.unlock();
        mmu::invalidate_tlb();
    }

    /// Context-switch in: the new process starts with a cold TLB.
    pub fn restore_state(&self) {
        if mmu::is_tlb_mode() {
            mmu::invalidate_tlb();
        } else {
            let g = self.page_table.lock();
            let table = g.clone();
            g.unlock();
            mmu::publish_page_table(table);
        }
    }

    /// Set the machine registers for entry at the image start: PC at 0 and
    /// the stack pointer just short of the top of the space.
    pub fn init_registers(&self) {
        for r in 0..cpu::NUM_TOTAL_REGS {
            cpu::write_register(r, 0);
        }
        cpu::write_register(cpu::PC_REG, 0);
        cpu::write_register(cpu::NEXT_PC_REG, 4);
        // Leave slack so end-of-space references don't fall off the edge.
        cpu::write_register(cpu::STACK_REG, (self.num_pages * PAGE_SIZE - 16) as u32);
    }

    /// Tear the space down: release every frame, drop the swap file, close
    /// the executable. Called from process exit.
    pub fn destroy(&self) {
        trace!('a', "space {}: destroying", self.space_id);
        let coremap = crate::system::coremap();
        let mut g = self.page_table.lock();
        let mut frames = Vec::new();
        for v in 0..self.num_pages {
            if g[v].valid {
                frames.push(g[v].physical_page);
                g[v] = TranslationEntry::invalid();
            }
        }
        g.unlock();
        for frame in frames {
            coremap.clear(frame);
        }

        let fs = crate::system::file_system();
        let swap = {
            let mut g = self.swap.lock();
            let s = g.take();
            g.unlock();
            s
        };
        if let Some(swap) = swap {
            fs.close_handle(&swap);
            let _ = fs.remove(&self.swap_name);
        }
        fs.close_handle(self.executable.file());
    }
}
