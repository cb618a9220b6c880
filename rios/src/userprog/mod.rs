//! User-program support: executables, safe user-memory transfer, the
//! synchronous console, and the syscall/exception dispatch.

pub mod exception;
pub mod executable;
pub mod synch_console;
pub mod transfer;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::sync::Lock;
use crate::thread::Thread;

/// Longest textual path a syscall will read from user space.
pub const MAX_PATH_LEN: usize = 128;

/// A process as the Exec/Join machinery sees it.
pub(crate) struct ProcessRecord {
    pub thread: Arc<Thread>,
    pub joinable: bool,
}

static mut PROCESSES: Option<Lock<BTreeMap<usize, ProcessRecord>>> = None;
static NEXT_SPACE_ID: AtomicUsize = AtomicUsize::new(0);

/// Reset the process table. Called once per boot.
pub(crate) fn reset_processes() {
    unsafe { PROCESSES = Some(Lock::new("process-table", BTreeMap::new())) };
    NEXT_SPACE_ID.store(0, Ordering::SeqCst);
}

pub(crate) fn processes() -> &'static Lock<BTreeMap<usize, ProcessRecord>> {
    unsafe { PROCESSES.as_ref().expect("process table not initialized") }
}

pub(crate) fn next_space_id() -> usize {
    NEXT_SPACE_ID.fetch_add(1, Ordering::SeqCst)
}

/// Release everything a finishing thread holds: its descriptors, its
/// address space (frames, swap file, executable), and its working-directory
/// pin. Runs on the finishing thread itself, before the exit status is
/// published.
pub fn process_cleanup(th: &Arc<Thread>) {
    if !crate::system::filesystem_ready() {
        return;
    }
    let fs = crate::system::file_system();
    for file in th.take_files() {
        fs.close_handle(&file);
    }
    let space = {
        let mut g = th.space.lock();
        let s = g.take();
        g.unlock();
        s
    };
    if let Some(space) = space {
        space.destroy();
    }
    fs.teardown_thread();
}
