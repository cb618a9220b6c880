//! Thread scheduler.
//!
//! The kernel schedules through a [`Scheduler`] trait object installed at
//! boot, so the policy can be swapped without touching the switch machinery.
//! The shipped policy is [`PriorityScheduler`]: strict priority with FIFO
//! order inside each priority, round-robin preemption on timer ticks, and
//! priority donation for lock holders.
//!
//! ## The switch protocol
//!
//! [`reschedule`] is the only place a thread leaves the CPU. It runs with
//! interrupts disabled end to end:
//!
//! 1. If the caller is still `Running` it is demoted to `Runnable` and
//!    pushed on its ready queue, so yielding competes fairly with everyone
//!    else. A parked or exited caller is left out.
//! 2. The highest-priority runnable thread is popped; if none exists the
//!    machine idles forward to the next pending interrupt, whose handler is
//!    expected to unpark somebody.
//! 3. If the winner is the caller itself the switch collapses to a no-op.
//!    Otherwise the caller saves the user-visible machine state and hands
//!    the CPU over; it finishes the protocol when somebody hands it back.
//!
//! The counterpart [`finish_switch`] runs in the resumed thread's own frame
//! (and at the top of a freshly spawned thread), marking it `Running` and
//! restoring its machine state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mirage::context;
use mirage::cpu;
use mirage::interrupt::{self, IntStatus};
use mirage::spinlock::SpinLock;
use mirage::trace;

use super::{current, Priority, Thread, ThreadState};

/// Number of distinct priorities.
pub const NUM_PRIORITIES: usize = 8;
/// The highest priority.
pub const MAX_PRIORITY: Priority = NUM_PRIORITIES - 1;

/// A thread scheduler.
///
/// Implementations decide which runnable thread gets the CPU next; the
/// switch machinery in this module does everything else.
pub trait Scheduler: Send + Sync {
    /// Pop the next thread to run, if any.
    fn next_to_run(&self) -> Option<Arc<Thread>>;

    /// Add a runnable thread to the ready structure.
    fn push_to_queue(&self, th: Arc<Thread>);

    /// Whether any thread is waiting for the CPU.
    fn has_runnable(&self) -> bool;

    /// Called on every timer interrupt.
    fn timer_tick(&self);

    /// Raise `th`'s effective priority to at least `priority` (priority
    /// donation from a lock waiter). Default: no donation support.
    fn donate_priority(&self, _th: &Arc<Thread>, _priority: Priority) {}

    /// Undo any donation to `th`.
    fn restore_priority(&self, _th: &Arc<Thread>) {}

    /// Dump scheduler state for the PS syscall.
    fn dump(&self);
}

static mut SCHEDULER: Option<Box<dyn Scheduler>> = None;

/// Install the kernel scheduler. Called once per boot, before any thread is
/// spawned.
pub fn set_scheduler(s: impl Scheduler + 'static) {
    unsafe { SCHEDULER = Some(Box::new(s)) };
}

/// The installed scheduler.
pub fn scheduler() -> &'static dyn Scheduler {
    unsafe { SCHEDULER.as_deref().expect("no scheduler installed") }
}

static DONATION_ENABLED: AtomicBool = AtomicBool::new(true);

/// Enable or disable priority donation (on by default). Exists so the
/// inversion behavior can be demonstrated both ways.
pub fn set_priority_donation(enabled: bool) {
    DONATION_ENABLED.store(enabled, Ordering::SeqCst);
}

/// Strict-priority ready queues with FIFO order within a priority.
pub struct PriorityScheduler {
    queues: SpinLock<[VecDeque<Arc<Thread>>; NUM_PRIORITIES]>,
}

impl PriorityScheduler {
    /// An empty scheduler.
    pub fn new() -> Self {
        Self {
            queues: SpinLock::new([const { VecDeque::new() }; NUM_PRIORITIES]),
        }
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PriorityScheduler {
    fn next_to_run(&self) -> Option<Arc<Thread>> {
        let mut g = self.queues.lock();
        let th = g.iter_mut().rev().find_map(VecDeque::pop_front);
        g.unlock();
        th
    }

    fn push_to_queue(&self, th: Arc<Thread>) {
        let priority = th.effective_priority();
        let mut g = self.queues.lock();
        g[priority].push_back(th);
        g.unlock();
    }

    fn has_runnable(&self) -> bool {
        let g = self.queues.lock();
        let any = g.iter().any(|q| !q.is_empty());
        g.unlock();
        any
    }

    fn timer_tick(&self) {
        // Round-robin: ask for a reschedule once the dispatch unwinds.
        interrupt::yield_on_return();
    }

    fn donate_priority(&self, th: &Arc<Thread>, priority: Priority) {
        if !DONATION_ENABLED.load(Ordering::SeqCst) || th.effective_priority() >= priority {
            return;
        }
        trace!('t', "donating priority {} to {}", priority, th.name);
        let mut g = th.donated.lock();
        *g = Some(priority);
        g.unlock();
        // If the holder is sitting in a ready queue, move it to the queue
        // its new priority deserves.
        let mut queues = self.queues.lock();
        let found = queues.iter_mut().find_map(|q| {
            q.iter()
                .position(|t| t.tid == th.tid)
                .and_then(|i| q.remove(i))
        });
        if let Some(t) = found {
            queues[priority].push_back(t);
        }
        queues.unlock();
    }

    fn restore_priority(&self, th: &Arc<Thread>) {
        let mut g = th.donated.lock();
        *g = None;
        g.unlock();
    }

    fn dump(&self) {
        let g = self.queues.lock();
        mirage::println!("ready queues:");
        for (priority, q) in g.iter().enumerate().rev() {
            if !q.is_empty() {
                let names: Vec<&str> = q.iter().map(|t| t.name.as_str()).collect();
                mirage::println!("  [{}] {}", priority, names.join(" "));
            }
        }
        g.unlock();
        let th = current();
        mirage::println!("running: {} (tid {})", th.name, th.tid);
    }
}

/// Mark the resumed thread running and bring its machine state back. Runs
/// in the resumed thread's own frame with interrupts off.
pub(crate) fn finish_switch(th: &Arc<Thread>) {
    let mut st = th.state.lock();
    debug_assert!(matches!(*st, ThreadState::Runnable | ThreadState::Running));
    *st = ThreadState::Running;
    st.unlock();
    let space = {
        let g = th.space.lock();
        let s = g.clone();
        g.unlock();
        s
    };
    if let Some(space) = space {
        let regs = th.user_regs.lock();
        cpu::restore_registers(&regs);
        regs.unlock();
        space.restore_state();
    }
}

fn save_machine_state(th: &Arc<Thread>) {
    let space = {
        let g = th.space.lock();
        let s = g.clone();
        g.unlock();
        s
    };
    if let Some(space) = space {
        let mut regs = th.user_regs.lock();
        *regs = cpu::save_registers();
        regs.unlock();
        space.save_state();
    }
}

/// Pick the next runnable thread, idling the machine forward as long as
/// something is pending. Interrupts must be off.
fn pick_next() -> Arc<Thread> {
    let mut idles = 0u64;
    loop {
        if let Some(next) = scheduler().next_to_run() {
            return next;
        }
        // The recurring timer keeps the pending queue nonempty, so a true
        // deadlock idles forever; cap it so a wedged simulation fails loudly.
        idles += 1;
        assert!(
            idles < 1_000_000,
            "machine wedged: idled {idles} times with no thread becoming runnable"
        );
        interrupt::idle();
    }
}

/// Give up the CPU; see the module docs for the full protocol.
pub fn reschedule() {
    let old = interrupt::set_level(IntStatus::Off);
    assert_eq!(old, IntStatus::On, "rescheduled while holding a lock");

    let cur = current();
    {
        let mut st = cur.state.lock();
        if *st == ThreadState::Running {
            *st = ThreadState::Runnable;
            st.unlock();
            scheduler().push_to_queue(cur.clone());
        } else {
            st.unlock();
        }
    }

    let next = pick_next();
    if !Arc::ptr_eq(&next, &cur) {
        save_machine_state(&cur);
        context::switch(&cur.permit, &next.permit);
        // We are back on the CPU, in our own frame.
        finish_switch(&cur);
    } else {
        let mut st = cur.state.lock();
        *st = ThreadState::Running;
        st.unlock();
    }

    interrupt::set_level(IntStatus::On);
}

/// Hand the CPU away forever. The caller's state must already be `Exited`;
/// interrupts must be off. Returns so the host thread can fall off its
/// entry function.
pub(crate) fn switch_out_for_good() {
    let next = pick_next();
    context::switch_and_exit(&next.permit);
}
