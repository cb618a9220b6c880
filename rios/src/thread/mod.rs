//! Thread abstraction.
//!
//! A kernel thread is a host thread that takes turns holding the single
//! simulated CPU. All the machinery of handing the CPU around lives in the
//! [`scheduler`] module and in `mirage::context`; this module defines the
//! thread object itself, parking, joining, and the builder.
//!
//! ## Parking
//!
//! Every blocking primitive in the kernel bottoms out in
//! [`Current::park_with`]: the calling thread marks itself parked, publishes
//! a [`ParkHandle`] to whoever will wake it (inside a closure that runs
//! before the thread actually leaves the CPU), and reschedules. Waking a
//! thread whose park is still in flight is safe — the scheduler resolves it
//! to a no-op park.
//!
//! ## Exit
//!
//! [`Current::exit`] unwinds the thread with a private panic payload so that
//! destructors on the thread's own stack run *while it still owns the CPU*;
//! the landing pad at the bottom of every spawned thread then releases the
//! process's resources, records the exit status for joiners, and hands the
//! CPU away for good.

pub mod scheduler;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use mirage::context::CpuPermit;
use mirage::cpu;
use mirage::interrupt::{self, IntStatus};
use mirage::spinlock::SpinLock;
use mirage::trace;

use crate::fs::path::Path;
use crate::fs::{FileId, OpenFile};
use crate::sync::Semaphore;

/// Ready-queue priorities run from 0 (lowest) to
/// [`MAX_PRIORITY`](scheduler::MAX_PRIORITY).
pub type Priority = usize;

/// The largest file-descriptor table a process may grow.
pub const MAX_OPEN_FILES: usize = 16;

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// In a ready queue, waiting for the CPU.
    Runnable,
    /// Holding the CPU.
    Running,
    /// Blocked; a [`ParkHandle`] for it exists somewhere.
    Parked,
    /// Finished, with its exit code.
    Exited(i32),
}

/// A kernel thread.
pub struct Thread {
    /// Thread id, unique for the life of the machine.
    pub tid: u64,
    /// Debug name.
    pub name: String,
    /// Scheduling priority the thread was created with.
    pub base_priority: Priority,
    /// Priority donated by a lock waiter, if any. See
    /// [`scheduler::Scheduler::donate_priority`].
    pub(crate) donated: SpinLock<Option<Priority>>,
    /// Current state.
    pub state: SpinLock<ThreadState>,
    /// The simulated-CPU permit for this thread's host thread.
    pub(crate) permit: CpuPermit,
    /// Exit status, present once the thread has finished.
    exit_status: SpinLock<Option<i32>>,
    /// Signaled once on exit; joiners re-signal so every joiner passes.
    exit_sem: Semaphore,
    /// Saved user-mode registers while the thread is off the CPU.
    pub(crate) user_regs: SpinLock<[u32; cpu::NUM_TOTAL_REGS]>,
    /// The address space, for threads running a user program.
    pub space: SpinLock<Option<Arc<crate::vm::AddressSpace>>>,
    /// Per-thread descriptor table. 0 and 1 name the console.
    files: SpinLock<BTreeMap<i32, Arc<OpenFile>>>,
    /// Working directory.
    pub cwd: SpinLock<Path>,
    /// The open-file record pinning the working directory.
    pub cwd_file_id: SpinLock<Option<FileId>>,
    /// Set while the kernel moves data through this thread's user memory:
    /// an unservable fault then fails the access instead of killing the
    /// process, so syscalls report bad pointers as errors.
    pub(crate) tolerate_bad_faults: AtomicBool,
}

impl Thread {
    fn new(
        name: String,
        priority: Priority,
        cwd: Path,
        space: Option<Arc<crate::vm::AddressSpace>>,
    ) -> Arc<Self> {
        static TID: AtomicU64 = AtomicU64::new(0);
        Arc::new(Thread {
            tid: TID.fetch_add(1, Ordering::SeqCst),
            name,
            base_priority: priority,
            donated: SpinLock::new(None),
            state: SpinLock::new(ThreadState::Runnable),
            permit: CpuPermit::new(),
            exit_status: SpinLock::new(None),
            exit_sem: Semaphore::new("exit", 0),
            user_regs: SpinLock::new([0; cpu::NUM_TOTAL_REGS]),
            space: SpinLock::new(space),
            files: SpinLock::new(BTreeMap::new()),
            cwd: SpinLock::new(cwd),
            cwd_file_id: SpinLock::new(None),
            tolerate_bad_faults: AtomicBool::new(false),
        })
    }

    /// The priority the scheduler should honor right now: the base priority
    /// unless a higher one has been donated.
    pub fn effective_priority(&self) -> Priority {
        let g = self.donated.lock();
        let p = (*g).map_or(self.base_priority, |d| d.max(self.base_priority));
        g.unlock();
        p
    }

    /// Block until the thread exits, returning its status. May be called by
    /// any number of joiners, any time before or after the exit.
    pub fn wait_exit(&self) -> i32 {
        self.exit_sem.wait();
        self.exit_sem.signal();
        let g = self.exit_status.lock();
        let status = (*g).expect("woken before exit status was recorded");
        g.unlock();
        status
    }

    /// Install `file` at the lowest free descriptor (≥ 2).
    pub fn add_file(&self, file: Arc<OpenFile>) -> Option<i32> {
        let mut g = self.files.lock();
        let fd = (2..).find(|fd| !g.contains_key(fd)).unwrap();
        if g.len() >= MAX_OPEN_FILES {
            g.unlock();
            return None;
        }
        g.insert(fd, file);
        g.unlock();
        Some(fd)
    }

    /// Look up an open descriptor.
    pub fn get_file(&self, fd: i32) -> Option<Arc<OpenFile>> {
        let g = self.files.lock();
        let f = g.get(&fd).cloned();
        g.unlock();
        f
    }

    /// Remove a descriptor, returning what it named.
    pub fn remove_file(&self, fd: i32) -> Option<Arc<OpenFile>> {
        let mut g = self.files.lock();
        let f = g.remove(&fd);
        g.unlock();
        f
    }

    /// Drain the whole descriptor table (at process exit).
    pub(crate) fn take_files(&self) -> Vec<Arc<OpenFile>> {
        let mut g = self.files.lock();
        let files = std::mem::take(&mut *g).into_values().collect();
        g.unlock();
        files
    }

    fn record_exit(&self, status: i32) {
        let mut g = self.exit_status.lock();
        *g = Some(status);
        g.unlock();
        let mut st = self.state.lock();
        *st = ThreadState::Exited(status);
        st.unlock();
        self.exit_sem.signal();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// The thread holding the CPU. Panics on a host thread that is not a kernel
/// thread.
pub fn current() -> Arc<Thread> {
    CURRENT.with(|c| c.borrow().clone()).expect("no current thread")
}

/// Run `f` with the current thread.
pub fn with_current<R>(f: impl FnOnce(&Arc<Thread>) -> R) -> R {
    let th = current();
    f(&th)
}

pub(crate) fn set_current(th: Arc<Thread>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(th));
}

pub(crate) fn have_current() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// A handle that represents a parked thread. Consuming it makes the thread
/// runnable again.
pub struct ParkHandle {
    th: Arc<Thread>,
}

impl ParkHandle {
    /// Consume the handle and unpark the underlying thread.
    pub fn unpark(self) {
        let mut st = self.th.state.lock();
        debug_assert_eq!(*st, ThreadState::Parked);
        *st = ThreadState::Runnable;
        st.unlock();
        scheduler::scheduler().push_to_queue(self.th);
    }
}

/// A handle to join a thread.
pub struct JoinHandle {
    th: Arc<Thread>,
}

impl JoinHandle {
    /// Thread id of the joined thread.
    pub fn tid(&self) -> u64 {
        self.th.tid
    }

    /// The underlying thread.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.th
    }

    /// Block until the thread finishes; returns its exit code (0 for a
    /// normal return, -1 if the thread panicked).
    pub fn join(self) -> i32 {
        self.th.wait_exit()
    }
}

/// Unwind payload carried by [`Current::exit`].
pub(crate) struct ThreadExit(pub i32);

/// The opaque handle for operations on the running thread.
pub struct Current {
    _p: (),
}

impl Current {
    /// Run `f` with a [`ParkHandle`] for the current thread, then park it.
    /// `f` typically enqueues the handle under a lock and releases the lock;
    /// the park itself happens after `f` returns.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        let th = current();
        let mut st = th.state.lock();
        debug_assert_eq!(*st, ThreadState::Running);
        *st = ThreadState::Parked;
        st.unlock();
        f(ParkHandle { th });
        assert_eq!(
            interrupt::status(),
            IntStatus::On,
            "tried to park a thread while holding a lock"
        );
        scheduler::reschedule();
    }

    /// Exit the current thread with `exit_code`. Unwinds so that the
    /// thread's own destructors run before the CPU is handed away.
    pub fn exit(exit_code: i32) -> ! {
        assert_eq!(
            interrupt::status(),
            IntStatus::On,
            "tried to exit a thread while holding a lock"
        );
        std::panic::panic_any(ThreadExit(exit_code));
    }

    /// Give up the CPU to any equal-or-higher-priority runnable thread.
    pub fn yield_now() {
        if have_current() {
            scheduler::reschedule();
        }
    }

    /// The current thread's id.
    pub fn get_tid() -> u64 {
        current().tid
    }
}

/// A builder for spawning kernel threads.
pub struct ThreadBuilder {
    name: String,
    priority: Priority,
    space: Option<Arc<crate::vm::AddressSpace>>,
}

impl ThreadBuilder {
    /// Create a builder for a thread named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            space: None,
        }
    }

    /// Set the thread's scheduling priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        assert!(priority <= scheduler::MAX_PRIORITY);
        self.priority = priority;
        self
    }

    /// Attach an address space: the thread will run a user program. The
    /// space must be attached before the thread first runs, which is why it
    /// goes through the builder rather than the spawned thread.
    pub fn attach_space(mut self, space: Arc<crate::vm::AddressSpace>) -> Self {
        self.space = Some(space);
        self
    }

    /// Spawn the thread and make it runnable.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        // The child starts in the parent's working directory.
        let cwd = if have_current() {
            let th = current();
            let g = th.cwd.lock();
            let cwd = g.clone();
            g.unlock();
            cwd
        } else {
            Path::root()
        };
        let th = Thread::new(self.name, self.priority, cwd, self.space);
        let handle = JoinHandle { th: th.clone() };
        {
            let body = th.clone();
            std::thread::Builder::new()
                .name(body.name.clone())
                .spawn(move || thread_entry(body, thread_fn))
                .expect("host thread spawn failed");
        }
        scheduler::scheduler().push_to_queue(th);
        handle
    }
}

fn thread_entry<F: FnOnce() + Send>(th: Arc<Thread>, thread_fn: F) {
    // Wait for the scheduler to hand us the CPU for the first time. We come
    // in the way any switched-to thread does: interrupts off, our state not
    // yet marked Running.
    th.permit.wait();
    set_current(th.clone());
    scheduler::finish_switch(&th);
    interrupt::set_level(IntStatus::On);

    if crate::system::filesystem_ready() {
        crate::system::file_system().setup_thread();
    }

    let code = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(thread_fn)) {
        Ok(()) => 0,
        Err(payload) => match payload.downcast_ref::<ThreadExit>() {
            Some(ThreadExit(code)) => *code,
            None => -1,
        },
    };

    trace!('t', "thread {} ({}) finishing with {}", th.name, th.tid, code);
    crate::userprog::process_cleanup(&th);
    th.record_exit(code);
    let _ = interrupt::set_level(IntStatus::Off);
    scheduler::switch_out_for_good();
    // The CPU belongs to someone else now; fall off the host thread without
    // touching kernel state.
}

/// Turn the calling host thread into the boot thread. Used once per boot by
/// [`crate::system::boot`].
pub(crate) fn adopt_boot_thread(name: &str) -> Arc<Thread> {
    let th = Thread::new(name.into(), 0, Path::root(), None);
    let mut st = th.state.lock();
    *st = ThreadState::Running;
    st.unlock();
    set_current(th.clone());
    th
}
