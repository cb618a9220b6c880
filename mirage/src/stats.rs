//! Machine performance counters, dumped on power-off.

use core::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident => $add:ident, $get:ident;)*) => {
        $(static $name: AtomicU64 = AtomicU64::new(0);)*

        $(
            $(#[$doc])*
            pub fn $add(n: u64) {
                $name.fetch_add(n, Ordering::SeqCst);
            }

            #[doc(hidden)]
            pub fn $get() -> u64 {
                $name.load(Ordering::SeqCst)
            }
        )*

        pub(crate) fn reset() {
            $($name.store(0, Ordering::SeqCst);)*
        }
    };
}

counters! {
    /// Ticks spent with the CPU doing work.
    SYSTEM_TICKS => add_system_ticks, system_ticks;
    /// Ticks skipped while every thread was blocked.
    IDLE_TICKS => add_idle_ticks, idle_ticks;
    /// Sectors read from the disk.
    DISK_READS => add_disk_read, disk_reads;
    /// Sectors written to the disk.
    DISK_WRITES => add_disk_write, disk_writes;
    /// Characters read from the console.
    CONSOLE_IN => add_console_in, console_in;
    /// Characters written to the console.
    CONSOLE_OUT => add_console_out, console_out;
    /// Page faults serviced.
    PAGE_FAULTS => add_page_fault, page_faults;
    /// TLB misses taken (a superset of page faults).
    TLB_MISSES => add_tlb_miss, tlb_misses;
    /// User instructions interpreted.
    INSTRUCTIONS => add_instruction, instructions;
}

/// Print every counter, in the traditional shutdown summary format.
pub fn dump() {
    crate::println!("Ticks: total {}, idle {}", crate::interrupt::ticks(), idle_ticks());
    crate::println!("Disk I/O: reads {}, writes {}", disk_reads(), disk_writes());
    crate::println!("Console I/O: reads {}, writes {}", console_in(), console_out());
    crate::println!(
        "Paging: faults {}, TLB misses {}",
        page_faults(),
        tlb_misses()
    );
    crate::println!("Instructions: {}", instructions());
}
