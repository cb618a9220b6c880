//! Kernel singletons and the boot sequence.
//!
//! Exactly one simulated machine exists per host process, so the kernel's
//! well-known objects — the synchronous disk and console, the coremap, the
//! filesystem — are singletons too, reinstalled on every [`boot`]. Boots
//! serialize on an internal lock: the test suite runs many simulations in
//! one process, one at a time.
//!
//! [`boot`] turns the calling host thread into the boot thread, brings the
//! machine and the kernel up in dependency order, runs the supplied
//! kernel-mode closure, and drains any still-runnable threads before
//! returning.

use std::path::PathBuf;
use std::sync::Mutex;

use mirage::interrupt::{self, IntStatus};
use mirage::{console, disk, timer};

use crate::fs::synch_disk::SynchDisk;
use crate::fs::FileSystem;
use crate::thread::scheduler::{scheduler, set_priority_donation, set_scheduler, PriorityScheduler};
use crate::thread::{self, Current};
use crate::userprog::synch_console::SynchConsole;
use crate::vm::coremap::Coremap;

static mut SYNCH_DISK: Option<SynchDisk> = None;
static mut SYNCH_CONSOLE: Option<SynchConsole> = None;
static mut COREMAP: Option<Coremap> = None;
static mut FILE_SYSTEM: Option<FileSystem> = None;

/// The synchronous disk.
pub fn synch_disk() -> &'static SynchDisk {
    unsafe { SYNCH_DISK.as_ref().expect("kernel not booted") }
}

/// The synchronous console.
pub fn synch_console() -> &'static SynchConsole {
    unsafe { SYNCH_CONSOLE.as_ref().expect("kernel not booted") }
}

/// The physical-frame allocator.
pub fn coremap() -> &'static Coremap {
    unsafe { COREMAP.as_ref().expect("kernel not booted") }
}

/// The filesystem.
pub fn file_system() -> &'static FileSystem {
    unsafe { FILE_SYSTEM.as_ref().expect("filesystem not initialized") }
}

/// Whether the filesystem is up (false during early boot and teardown).
pub fn filesystem_ready() -> bool {
    unsafe { FILE_SYSTEM.is_some() }
}

fn disk_interrupt() {
    synch_disk().request_done();
}

fn console_read_interrupt() {
    synch_console().read_ready();
}

fn console_write_interrupt() {
    synch_console().write_ready();
}

fn timer_interrupt() {
    scheduler().timer_tick();
}

/// Boot configuration.
pub struct BootOptions {
    /// Format the disk instead of trusting its contents.
    pub format: bool,
    /// Disk image path; a throwaway image when absent.
    pub disk_path: Option<PathBuf>,
    /// Debug-trace categories, as for the `-d` option.
    pub debug_flags: String,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            format: true,
            disk_path: None,
            debug_flags: String::new(),
        }
    }
}

static BOOT_LOCK: Mutex<()> = Mutex::new(());

fn install_panic_hook() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            // Thread exit unwinds with a private payload; it is not an
            // error and prints nothing.
            if info.payload().downcast_ref::<thread::ThreadExit>().is_none() {
                previous(info);
            }
        }));
    });
}

/// Bring the machine and kernel up, run `f` as the boot thread, and tear
/// down. Returns `f`'s result.
pub fn boot<R>(options: BootOptions, f: impl FnOnce() -> R) -> R {
    let _machine = BOOT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    install_panic_hook();

    mirage::power_on();
    mirage::set_debug_flags(&options.debug_flags);

    // A throwaway image lives in a temp dir that must outlive the boot.
    let mut _scratch = None;
    let disk_path = options.disk_path.unwrap_or_else(|| {
        let dir = tempfile::tempdir().expect("no temp dir for the disk image");
        let path = dir.path().join("DISK.img");
        _scratch = Some(dir);
        path
    });
    disk::attach(&disk_path).expect("failed to attach the disk image");

    unsafe {
        FILE_SYSTEM = None;
        SYNCH_DISK = Some(SynchDisk::new());
        SYNCH_CONSOLE = Some(SynchConsole::new());
        COREMAP = Some(Coremap::new());
    }
    disk::set_handler(disk_interrupt);
    console::set_handlers(console_read_interrupt, console_write_interrupt);
    set_scheduler(PriorityScheduler::new());
    set_priority_donation(true);
    crate::userprog::reset_processes();

    thread::adopt_boot_thread("main");
    interrupt::set_level(IntStatus::On);
    timer::start(timer_interrupt);
    interrupt::set_yield_hook(|| Current::yield_now());

    unsafe {
        FILE_SYSTEM = Some(FileSystem::new(options.format));
    }
    crate::userprog::exception::init();
    file_system().setup_thread();

    let result = f();

    // Let spawned threads that are still runnable finish their work; a
    // thread blocked on an event that never comes is simply abandoned.
    for _ in 0..100_000 {
        if !scheduler().has_runnable() {
            break;
        }
        Current::yield_now();
    }
    file_system().teardown_thread();
    result
}

/// Shut the machine down cleanly. Never returns.
pub fn halt() -> ! {
    mirage::println!("Machine halting.");
    mirage::power_off(0);
}
