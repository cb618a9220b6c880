//! # Mirage: the simulated machine under the RIOS kernel.
//!
//! The RIOS kernel does not run on real hardware. It runs on *mirage*, a
//! self-contained simulation of a small single-CPU workstation: a MIPS-style
//! processor with a software-managed TLB, a few kilobytes of physical memory,
//! a sector-addressed disk that completes requests by interrupt, a serial
//! console, and a periodic timer.
//!
//! The simulation is hosted. Kernel threads are host threads, but exactly one
//! of them holds the simulated CPU at any moment — the [`context`] module
//! implements the permit-passing hand-off that stands in for a real context
//! switch. Simulated time advances in *ticks*: a little on every interrupt
//! re-enable, one tick per interpreted user instruction, and in a jump to the
//! next pending device interrupt when every thread is blocked (see
//! [`interrupt`]).
//!
//! The kernel sees this crate the way a real kernel sees hardware: it
//! registers interrupt and exception handlers, issues device requests, and
//! manipulates CPU and MMU state. Everything above that line lives in the
//! `rios` crate.
//!
//! Only one machine exists per process. [`power_on`] installs a fresh
//! instance and resets simulated time; callers that boot repeatedly (the test
//! harness) must serialize on the machine themselves.

#![allow(static_mut_refs)]

pub mod console;
pub mod context;
pub mod cpu;
pub mod disk;
pub mod interrupt;
pub mod mmu;
pub mod spinlock;
pub mod stats;
pub mod timer;

mod kprint;

pub use kprint::_print;

/// Bytes in a disk sector, the unit of disk I/O.
pub const SECTOR_SIZE: usize = 128;
/// Sectors on the simulated disk.
pub const NUM_SECTORS: usize = 1024;
/// Bytes in a virtual/physical page. Matches the sector size so a page is
/// exactly one swap-file sector run.
pub const PAGE_SIZE: usize = SECTOR_SIZE;
/// Physical page frames in the simulated RAM.
pub const NUM_PHYS_PAGES: usize = 32;
/// Total bytes of simulated physical memory.
pub const MEMORY_SIZE: usize = NUM_PHYS_PAGES * PAGE_SIZE;
/// Entries in the translation lookaside buffer.
pub const TLB_SIZE: usize = 4;
/// Bytes reserved for a user program's stack.
pub const USER_STACK_SIZE: usize = 1024;

/// Ticks a disk request takes to complete.
pub const DISK_DELAY: u64 = 100;
/// Ticks between console character interrupts.
pub const CONSOLE_DELAY: u64 = 10;
/// Ticks between timer interrupts.
pub const TIMER_INTERVAL: u64 = 500;
/// Ticks charged when the kernel re-enables interrupts.
pub const SYSTEM_TICK: u64 = 10;
/// Ticks charged per interpreted user instruction.
pub const USER_TICK: u64 = 1;

/// Serializes unit tests that touch the machine singleton.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

static mut DEBUG_FLAGS: u128 = 0;

/// Enable the debug categories named by the single-letter `flags` string.
///
/// `+` enables everything. Unknown letters are ignored. The conventional
/// categories are `t` threads, `s` synchronization, `f` filesystem, `a`
/// address spaces, `e` exceptions and syscalls, `d` disk, `m` machine.
pub fn set_debug_flags(flags: &str) {
    let mut mask = 0u128;
    for c in flags.bytes() {
        if c == b'+' {
            mask = u128::MAX;
        } else if c.is_ascii_graphic() {
            mask |= 1 << (c - b'!');
        }
    }
    unsafe { DEBUG_FLAGS = mask };
}

#[doc(hidden)]
pub fn debug_enabled(flag: char) -> bool {
    let c = flag as u8;
    c.is_ascii_graphic() && unsafe { DEBUG_FLAGS } & (1 << (c - b'!')) != 0
}

/// Emit a trace line when the given debug category is enabled.
///
/// ```
/// mirage::trace!('f', "creating file {}", "a");
/// ```
#[macro_export]
macro_rules! trace {
    ($flag:literal, $($arg:tt)*) => {
        if $crate::debug_enabled($flag) {
            $crate::print!("[{}] {}\n", $flag, format_args!($($arg)*));
        }
    };
}

static mut SHUTDOWN_HOOK: Option<fn(i32) -> !> = None;

/// Install the routine that ends the simulation on [`power_off`].
///
/// The simulator binary installs `std::process::exit`; the test harness
/// installs a hook that unwinds the boot thread instead.
pub fn set_shutdown_hook(hook: fn(i32) -> !) {
    unsafe { SHUTDOWN_HOOK = Some(hook) };
}

/// Stop the machine. Dumps the accumulated statistics and invokes the
/// shutdown hook; exits the host process if none was installed.
pub fn power_off(code: i32) -> ! {
    stats::dump();
    match unsafe { SHUTDOWN_HOOK } {
        Some(hook) => hook(code),
        None => std::process::exit(code),
    }
}

/// Reset the machine to its power-on state: zeroed memory, cold TLB, no
/// pending interrupts, statistics cleared, simulated time at zero.
///
/// The disk keeps whatever backing file it was last attached to; attach a
/// new one with [`disk::attach`].
pub fn power_on() {
    interrupt::reset();
    mmu::reset();
    cpu::reset();
    stats::reset();
    console::reset();
    unsafe { SHUTDOWN_HOOK = None };
}
