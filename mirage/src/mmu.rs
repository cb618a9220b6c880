//! Memory management unit: physical memory, address translation, TLB.
//!
//! The MMU translates user virtual addresses on every CPU memory access. Two
//! translation modes exist, selected at power-on:
//!
//! * **TLB mode** (the default): translation consults only the
//!   [`TLB_SIZE`]-entry lookaside buffer. A miss raises a page-fault
//!   exception and the access reports failure; the kernel installs the
//!   missing entry and the access is retried. Reference and dirty bits are
//!   set in the TLB entry; the kernel syncs them back into its page table
//!   when it evicts or switches.
//! * **Linear mode**: a page table published with [`publish_page_table`] is
//!   consulted directly. This mode serves the non-paged configuration and
//!   keeps the reference/dirty bits in the published copy.
//!
//! Physical memory is reached by the kernel only through whole-frame
//! copies ([`read_frame`], [`write_frame`], [`zero_frame`]); nothing hands
//! out long-lived borrows of the RAM array.

use crate::cpu::{self, ExceptionKind};
use crate::{stats, MEMORY_SIZE, NUM_PHYS_PAGES, PAGE_SIZE, TLB_SIZE};

/// One virtual-to-physical page mapping, as cached in the TLB and stored in
/// the kernel's page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslationEntry {
    /// The virtual page this entry maps.
    pub virtual_page: usize,
    /// The physical frame holding it.
    pub physical_page: usize,
    /// Whether this entry may be used for translation.
    pub valid: bool,
    /// Writes through this entry raise a read-only exception.
    pub read_only: bool,
    /// Set by the hardware on any access.
    pub used: bool,
    /// Set by the hardware on a write.
    pub dirty: bool,
}

impl TranslationEntry {
    /// An invalid entry.
    pub const fn invalid() -> Self {
        Self {
            virtual_page: 0,
            physical_page: 0,
            valid: false,
            read_only: false,
            used: false,
            dirty: false,
        }
    }
}

struct Mmu {
    memory: Vec<u8>,
    tlb: [TranslationEntry; TLB_SIZE],
    page_table: Vec<TranslationEntry>,
    use_tlb: bool,
}

static mut MMU: Mmu = Mmu {
    memory: Vec::new(),
    tlb: [TranslationEntry::invalid(); TLB_SIZE],
    page_table: Vec::new(),
    use_tlb: true,
};

fn mmu() -> &'static mut Mmu {
    unsafe { &mut MMU }
}

pub(crate) fn reset() {
    let m = mmu();
    m.memory.clear();
    m.memory.resize(MEMORY_SIZE, 0);
    m.tlb = [TranslationEntry::invalid(); TLB_SIZE];
    m.page_table.clear();
    m.use_tlb = true;
}

/// Select linear translation mode. Must be called before any user access.
pub fn use_linear_page_table() {
    mmu().use_tlb = false;
}

/// Whether the MMU is in TLB mode.
pub fn is_tlb_mode() -> bool {
    mmu().use_tlb
}

/// Translate a virtual address, setting reference/dirty bits on success.
fn translate(vaddr: usize, write: bool) -> Result<usize, ExceptionKind> {
    let m = mmu();
    let vpage = vaddr / PAGE_SIZE;
    let offset = vaddr % PAGE_SIZE;
    let entry = if m.use_tlb {
        m.tlb
            .iter_mut()
            .find(|e| e.valid && e.virtual_page == vpage)
    } else {
        m.page_table.get_mut(vpage).filter(|e| e.valid)
    };
    let Some(entry) = entry else {
        stats::add_tlb_miss(1);
        return Err(ExceptionKind::PageFault);
    };
    if entry.read_only && write {
        return Err(ExceptionKind::ReadOnly);
    }
    if entry.physical_page >= NUM_PHYS_PAGES {
        return Err(ExceptionKind::BusError);
    }
    entry.used = true;
    if write {
        entry.dirty = true;
    }
    Ok(entry.physical_page * PAGE_SIZE + offset)
}

fn check_alignment(vaddr: usize, size: usize) -> Result<(), ExceptionKind> {
    match size {
        1 => Ok(()),
        2 | 4 if vaddr % size == 0 => Ok(()),
        2 | 4 => Err(ExceptionKind::AddressError),
        _ => panic!("unsupported access size {size}"),
    }
}

/// Read `size` bytes (1, 2 or 4) at a user virtual address.
///
/// On a translation failure the corresponding exception is raised through
/// the CPU's handler table and `Err` is returned so the caller can retry
/// once the kernel has serviced the fault.
pub fn read_mem(vaddr: usize, size: usize) -> Result<u32, ()> {
    let paddr = check_alignment(vaddr, size)
        .and_then(|()| translate(vaddr, false))
        .map_err(|exc| cpu::raise_exception(exc, vaddr))?;
    let m = mmu();
    let bytes = &m.memory[paddr..paddr + size];
    Ok(match size {
        1 => bytes[0] as u32,
        2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
        _ => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    })
}

/// Write `size` bytes (1, 2 or 4) at a user virtual address. Error contract
/// as for [`read_mem`].
pub fn write_mem(vaddr: usize, size: usize, value: u32) -> Result<(), ()> {
    let paddr = check_alignment(vaddr, size)
        .and_then(|()| translate(vaddr, true))
        .map_err(|exc| cpu::raise_exception(exc, vaddr))?;
    let m = mmu();
    let bytes = value.to_le_bytes();
    m.memory[paddr..paddr + size].copy_from_slice(&bytes[..size]);
    Ok(())
}

/// Copy a physical frame into `buf`.
pub fn read_frame(ppage: usize, buf: &mut [u8; PAGE_SIZE]) {
    assert!(ppage < NUM_PHYS_PAGES);
    let start = ppage * PAGE_SIZE;
    buf.copy_from_slice(&mmu().memory[start..start + PAGE_SIZE]);
}

/// Overwrite a physical frame from `buf`.
pub fn write_frame(ppage: usize, buf: &[u8; PAGE_SIZE]) {
    assert!(ppage < NUM_PHYS_PAGES);
    let start = ppage * PAGE_SIZE;
    mmu().memory[start..start + PAGE_SIZE].copy_from_slice(buf);
}

/// Copy `src` into a frame at `offset`. Used when loading partial pages
/// from an executable.
pub fn write_frame_at(ppage: usize, offset: usize, src: &[u8]) {
    assert!(ppage < NUM_PHYS_PAGES && offset + src.len() <= PAGE_SIZE);
    let start = ppage * PAGE_SIZE + offset;
    mmu().memory[start..start + src.len()].copy_from_slice(src);
}

/// Zero a physical frame.
pub fn zero_frame(ppage: usize) {
    assert!(ppage < NUM_PHYS_PAGES);
    let start = ppage * PAGE_SIZE;
    mmu().memory[start..start + PAGE_SIZE].fill(0);
}

/// Read TLB slot `i`.
pub fn tlb_entry(i: usize) -> TranslationEntry {
    mmu().tlb[i]
}

/// Install `entry` in TLB slot `i`.
pub fn set_tlb_entry(i: usize, entry: TranslationEntry) {
    mmu().tlb[i] = entry;
}

/// Invalidate every TLB slot.
pub fn invalidate_tlb() {
    mmu().tlb = [TranslationEntry::invalid(); TLB_SIZE];
}

/// Publish a page table for linear translation mode.
pub fn publish_page_table(table: Vec<TranslationEntry>) {
    let m = mmu();
    assert!(!m.use_tlb, "page table published while in TLB mode");
    m.page_table = table;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlb_translation_and_bits() {
        let _m = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        crate::power_on();
        crate::cpu::set_handler(ExceptionKind::PageFault, |_| {});
        set_tlb_entry(
            0,
            TranslationEntry {
                virtual_page: 2,
                physical_page: 5,
                valid: true,
                read_only: false,
                used: false,
                dirty: false,
            },
        );
        write_mem(2 * PAGE_SIZE + 8, 4, 0xdead_beef).unwrap();
        assert_eq!(read_mem(2 * PAGE_SIZE + 8, 4), Ok(0xdead_beef));
        let e = tlb_entry(0);
        assert!(e.used && e.dirty);
        // Unmapped page faults.
        assert!(read_mem(7 * PAGE_SIZE, 4).is_err());
    }
}
