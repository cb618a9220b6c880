//! Synchronous console.
//!
//! The raw device raises an interrupt per arrived byte and per completed
//! write; this layer turns those into blocking `get_char`/`put_char`, with
//! a lock per direction so concurrent readers (or writers) serialize.

use mirage::console;

use crate::sync::{Lock, Semaphore};

/// Blocking access to the console device. Backs descriptors 0 and 1.
pub struct SynchConsole {
    read_lock: Lock<()>,
    write_lock: Lock<()>,
    read_avail: Semaphore,
    write_done: Semaphore,
}

impl SynchConsole {
    /// A fresh interface. The caller routes the device's interrupts to
    /// [`read_ready`](Self::read_ready) / [`write_ready`](Self::write_ready).
    pub fn new() -> Self {
        Self {
            read_lock: Lock::new("console-read", ()),
            write_lock: Lock::new("console-write", ()),
            read_avail: Semaphore::new("console-read", 0),
            write_done: Semaphore::new("console-write", 0),
        }
    }

    /// Read one character, blocking until one arrives.
    pub fn get_char(&self) -> u8 {
        let guard = self.read_lock.acquire();
        self.read_avail.wait();
        let b = console::get_byte().expect("console signaled with no byte");
        drop(guard);
        b
    }

    /// Write one character, blocking until the device takes it.
    pub fn put_char(&self, b: u8) {
        let guard = self.write_lock.acquire();
        console::put_byte(b);
        self.write_done.wait();
        drop(guard);
    }

    /// Called from the character-arrival interrupt.
    pub fn read_ready(&self) {
        self.read_avail.signal();
    }

    /// Called from the write-done interrupt.
    pub fn write_ready(&self) {
        self.write_done.signal();
    }
}

impl Default for SynchConsole {
    fn default() -> Self {
        Self::new()
    }
}
