//! Periodic timer device.
//!
//! Raises an interrupt every [`TIMER_INTERVAL`](crate::TIMER_INTERVAL) ticks
//! once started. The kernel's handler typically requests a preemptive yield
//! via [`interrupt::yield_on_return`](crate::interrupt::yield_on_return).

use crate::{interrupt, TIMER_INTERVAL};

static mut HANDLER: Option<fn()> = None;

fn tick() {
    if let Some(handler) = unsafe { HANDLER } {
        handler();
    }
    interrupt::schedule(TIMER_INTERVAL, Box::new(tick));
}

/// Start the timer with the given interrupt handler.
pub fn start(handler: fn()) {
    unsafe { HANDLER = Some(handler) };
    interrupt::schedule(TIMER_INTERVAL, Box::new(tick));
}
