//! Context switching for the simulated CPU.
//!
//! Kernel threads are host threads, but the machine has one CPU: exactly one
//! host thread may execute kernel code at a time. Each thread owns a
//! [`CpuPermit`], a binary semaphore standing in for "this thread's saved
//! context is loaded". A context switch grants the next thread's permit and
//! then blocks on the switching thread's own — the simulated equivalent of
//! the register save/restore a real kernel would do.
//!
//! Granting before blocking opens a brief window in which two host threads
//! are awake; during it the outgoing thread touches nothing but its own
//! permit, so kernel state never sees two runners. A permit granted to a
//! thread that has not yet blocked is simply consumed when it does block,
//! which makes it safe to wake a thread that is still on its way out.
//!
//! Every switch happens with interrupts disabled, and every resumed thread
//! re-enables them in its own frame; see
//! [`interrupt`](crate::interrupt).

use std::sync::{Condvar, Mutex};

/// The right to run on the simulated CPU.
pub struct CpuPermit {
    granted: Mutex<bool>,
    cv: Condvar,
}

impl CpuPermit {
    /// A permit that has not been granted.
    pub fn new() -> Self {
        Self {
            granted: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Hand the CPU to the owner of this permit.
    pub fn grant(&self) {
        let mut g = self.granted.lock().unwrap_or_else(|e| e.into_inner());
        *g = true;
        self.cv.notify_one();
    }

    /// Block the calling host thread until the CPU is handed to it, then
    /// consume the grant.
    pub fn wait(&self) {
        let mut g = self.granted.lock().unwrap_or_else(|e| e.into_inner());
        while !*g {
            g = self.cv.wait(g).unwrap_or_else(|e| e.into_inner());
        }
        *g = false;
    }
}

impl Default for CpuPermit {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch from the thread owning `current` to the thread owning `next`.
/// Returns when `current` is granted the CPU again.
pub fn switch(current: &CpuPermit, next: &CpuPermit) {
    next.grant();
    current.wait();
}

/// Hand the CPU to `next` without ever taking it back. The caller's host
/// thread must unwind or return afterwards without touching kernel state.
pub fn switch_and_exit(next: &CpuPermit) {
    next.grant();
}
