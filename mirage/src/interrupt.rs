//! Interrupt engine and simulated time.
//!
//! The machine keeps one clock, measured in ticks. Time advances at three
//! points, the same three the original workstation simulators used:
//!
//! * [`SYSTEM_TICK`](crate::SYSTEM_TICK) ticks whenever the kernel re-enables
//!   interrupts (every [`set_level`] transition from off to on),
//! * [`USER_TICK`](crate::USER_TICK) ticks per interpreted user instruction
//!   (charged by the CPU through [`advance`]),
//! * a jump straight to the next pending interrupt when the scheduler finds
//!   nothing runnable ([`idle`]).
//!
//! Devices post completions with [`schedule`]; a completion fires the first
//! time the clock reaches its due tick while interrupts are enabled (or
//! inside [`idle`], which runs with them disabled — handlers always execute
//! with interrupts off either way). A handler may ask for a preemptive
//! reschedule with [`yield_on_return`]; the request is honored through the
//! hook installed by the kernel once the enabling `set_level` completes, not
//! inside the handler itself.
//!
//! There is exactly one interrupt level for the whole machine. The context
//! switch protocol in [`context`](crate::context) relies on it: every switch
//! happens with interrupts disabled, and the thread that resumes is always
//! inside its own frame that re-enables them.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::{SYSTEM_TICK, stats};

/// Whether interrupts are enabled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IntStatus {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

/// A device completion handler.
pub type Handler = Box<dyn FnOnce() + Send>;

struct Pending {
    when: u64,
    seq: u64,
    handler: Handler,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        (self.when, self.seq) == (other.when, other.seq)
    }
}
impl Eq for Pending {}
impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

struct Engine {
    status: IntStatus,
    ticks: u64,
    seq: u64,
    pending: BinaryHeap<Reverse<Pending>>,
    yield_requested: bool,
    yield_hook: Option<fn()>,
    in_handler: bool,
}

impl Engine {
    fn new() -> Self {
        Self {
            status: IntStatus::Off,
            ticks: 0,
            seq: 0,
            pending: BinaryHeap::new(),
            yield_requested: false,
            yield_hook: None,
            in_handler: false,
        }
    }
}

static mut ENGINE: Option<Engine> = None;

fn engine() -> &'static mut Engine {
    // Exactly one kernel thread runs at a time; the windows in which two host
    // threads are simultaneously awake (inside a context hand-off) never
    // touch the engine.
    unsafe { ENGINE.get_or_insert_with(Engine::new) }
}

pub(crate) fn reset() {
    unsafe { ENGINE = Some(Engine::new()) };
}

/// Current simulated time in ticks.
pub fn ticks() -> u64 {
    engine().ticks
}

/// Current interrupt status.
pub fn status() -> IntStatus {
    engine().status
}

/// Install the routine invoked when a handler requested preemption.
///
/// The kernel points this at its yield path. Called with interrupts enabled.
pub fn set_yield_hook(hook: fn()) {
    engine().yield_hook = Some(hook);
}

/// Request a preemptive reschedule once the pending interrupt dispatch
/// finishes. Only meaningful from inside a handler.
pub fn yield_on_return() {
    let e = engine();
    assert!(e.in_handler, "yield_on_return outside an interrupt handler");
    e.yield_requested = true;
}

/// Schedule `handler` to fire `delay` ticks from now.
pub fn schedule(delay: u64, handler: Handler) {
    let e = engine();
    e.seq += 1;
    e.pending.push(Reverse(Pending {
        when: e.ticks + delay.max(1),
        seq: e.seq,
        handler,
    }));
}

/// Run every pending interrupt that is due. Interrupts stay off across the
/// handlers.
fn dispatch_due() {
    loop {
        let handler = {
            let e = engine();
            let due = e.pending.peek().is_some_and(|Reverse(p)| p.when <= e.ticks);
            if !due {
                break;
            }
            let Reverse(p) = e.pending.pop().unwrap();
            e.in_handler = true;
            p.handler
        };
        handler();
        engine().in_handler = false;
    }
}

/// Change the interrupt level, returning the previous one.
///
/// Turning interrupts on advances the clock by one system tick, fires any
/// due device interrupts, and then honors a pending preemption request.
pub fn set_level(new: IntStatus) -> IntStatus {
    let e = engine();
    let old = e.status;
    if old == IntStatus::Off && new == IntStatus::On {
        e.ticks += SYSTEM_TICK;
        stats::add_system_ticks(SYSTEM_TICK);
        dispatch_due();
        engine().status = IntStatus::On;
        maybe_yield();
    } else {
        e.status = new;
    }
    old
}

/// Charge `n` ticks of running time. Requires interrupts enabled; used by
/// the CPU between instructions.
pub fn advance(n: u64) {
    let e = engine();
    assert_eq!(e.status, IntStatus::On, "clock advanced with interrupts off");
    e.ticks += n;
    e.status = IntStatus::Off;
    dispatch_due();
    engine().status = IntStatus::On;
    maybe_yield();
}

fn maybe_yield() {
    let e = engine();
    if e.yield_requested {
        e.yield_requested = false;
        if let Some(hook) = e.yield_hook {
            hook();
        }
    }
}

/// Fast-forward to the next pending interrupt and run it.
///
/// Called by the scheduler, with interrupts disabled, when no thread is
/// runnable. Panics if nothing is pending: every thread is blocked on an
/// event that can no longer occur.
pub fn idle() {
    let e = engine();
    assert_eq!(e.status, IntStatus::Off, "idle with interrupts enabled");
    let Some(Reverse(next)) = e.pending.peek() else {
        panic!("machine deadlocked: no runnable threads and no pending interrupts");
    };
    let skipped = next.when.saturating_sub(e.ticks);
    e.ticks = e.ticks.max(next.when);
    stats::add_idle_ticks(skipped);
    dispatch_due();
    // Preemption requests raised while idling are moot; whoever the handler
    // woke will be picked by the scheduler that called us.
    engine().yield_requested = false;
}

/// An RAII guard that disables interrupts and restores the previous level on
/// drop. Guards must be dropped in reverse order of creation; Rust scoping
/// upholds this unless a guard is stored away.
pub struct InterruptGuard {
    old: IntStatus,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Disable interrupts, remembering the previous level.
    pub fn new() -> Self {
        Self {
            old: set_level(IntStatus::Off),
            _not_send: core::marker::PhantomData,
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        set_level(self.old);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    #[test]
    fn due_interrupts_fire_on_enable() {
        let _m = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        crate::power_on();
        FIRED.store(0, Ordering::SeqCst);
        set_level(IntStatus::On);
        schedule(5, Box::new(|| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));
        // One system tick is enough to pass the 5-tick delay.
        set_level(IntStatus::Off);
        set_level(IntStatus::On);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_jumps_to_next_pending() {
        let _m = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        crate::power_on();
        FIRED.store(0, Ordering::SeqCst);
        schedule(10_000, Box::new(|| {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }));
        let before = ticks();
        idle();
        assert!(ticks() >= before + 10_000);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
    }
}
