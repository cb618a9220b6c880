//! Simulated console device.
//!
//! A byte-at-a-time serial device. Input bytes are fed into the device (by
//! the simulator binary or a test) and trickle out one per
//! [`CONSOLE_DELAY`](crate::CONSOLE_DELAY) ticks, each arrival raising the
//! read interrupt. Output accepts one byte at a time; the write-done
//! interrupt reports readiness for the next. The synchronous console in the
//! kernel turns these interrupts into blocking `get_char`/`put_char`.

use std::collections::VecDeque;

use crate::{interrupt, stats, CONSOLE_DELAY};

struct Console {
    /// Bytes not yet "typed".
    source: VecDeque<u8>,
    /// Bytes typed and not yet consumed by the kernel.
    avail: VecDeque<u8>,
    /// Whether an arrival interrupt is in flight.
    polling: bool,
    write_busy: bool,
    capture: Option<Vec<u8>>,
    read_handler: Option<fn()>,
    write_handler: Option<fn()>,
}

static mut CONSOLE: Console = Console {
    source: VecDeque::new(),
    avail: VecDeque::new(),
    polling: false,
    write_busy: false,
    capture: None,
    read_handler: None,
    write_handler: None,
};

fn console() -> &'static mut Console {
    unsafe { &mut CONSOLE }
}

pub(crate) fn reset() {
    let c = console();
    c.source.clear();
    c.avail.clear();
    c.polling = false;
    c.write_busy = false;
    c.capture = None;
    c.read_handler = None;
    c.write_handler = None;
}

/// Register the read-ready and write-done interrupt handlers.
pub fn set_handlers(read: fn(), write: fn()) {
    let c = console();
    c.read_handler = Some(read);
    c.write_handler = Some(write);
}

/// Capture console output in memory instead of forwarding it to the host's
/// standard output. Used by tests.
pub fn capture_output() {
    console().capture = Some(Vec::new());
}

/// Take everything captured so far.
pub fn take_output() -> Vec<u8> {
    console().capture.take().unwrap_or_default()
}

fn poll() {
    let c = console();
    match c.source.pop_front() {
        Some(b) => {
            c.avail.push_back(b);
            if let Some(handler) = c.read_handler {
                handler();
            }
            interrupt::schedule(CONSOLE_DELAY, Box::new(poll));
        }
        None => c.polling = false,
    }
}

/// Type `bytes` at the console. Arrival interrupts fire one byte per delay.
pub fn feed_input(bytes: &[u8]) {
    let c = console();
    c.source.extend(bytes);
    if !c.polling && !c.source.is_empty() {
        c.polling = true;
        interrupt::schedule(CONSOLE_DELAY, Box::new(poll));
    }
}

/// Consume one arrived byte, if any. The read interrupt has fired once per
/// arrived byte.
pub fn get_byte() -> Option<u8> {
    let b = console().avail.pop_front();
    if b.is_some() {
        stats::add_console_in(1);
    }
    b
}

/// Emit one byte. The device is busy until the write-done interrupt fires;
/// emitting while busy is a driver bug.
pub fn put_byte(b: u8) {
    let c = console();
    assert!(!c.write_busy, "console write issued while one is outstanding");
    c.write_busy = true;
    match &mut c.capture {
        Some(buf) => buf.push(b),
        None => crate::print!("{}", b as char),
    }
    stats::add_console_out(1);
    interrupt::schedule(
        CONSOLE_DELAY,
        Box::new(|| {
            let c = console();
            c.write_busy = false;
            if let Some(handler) = c.write_handler {
                handler();
            }
        }),
    );
}
