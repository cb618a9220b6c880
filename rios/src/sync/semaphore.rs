//! Counting semaphore.

use std::collections::VecDeque;

use mirage::spinlock::SpinLock;
use mirage::trace;

use crate::thread::{Current, ParkHandle};

struct Inner {
    value: usize,
    waiters: VecDeque<ParkHandle>,
}

/// A counting semaphore.
///
/// [`wait`](Self::wait) (the classical `P`) decrements the count, blocking
/// while it is zero; [`signal`](Self::signal) (`V`) increments it and wakes
/// the longest-blocked waiter. Waiters are woken strictly in the order they
/// blocked. Atomicity of the test-and-modify comes from the
/// interrupt-disabling spinlock — this is the only primitive in the kernel
/// built directly on interrupt state.
pub struct Semaphore {
    name: &'static str,
    inner: SpinLock<Inner>,
}

impl Semaphore {
    /// A semaphore named `name` (for traces) with `value` initial permits.
    pub fn new(name: &'static str, value: usize) -> Self {
        Self {
            name,
            inner: SpinLock::new(Inner {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Decrement the count, blocking while it is zero.
    pub fn wait(&self) {
        loop {
            let mut g = self.inner.lock();
            if g.value > 0 {
                g.value -= 1;
                g.unlock();
                return;
            }
            trace!('s', "blocking on semaphore {}", self.name);
            Current::park_with(move |handle| {
                g.waiters.push_back(handle);
                g.unlock();
            });
            // Mesa-style wakeup: somebody signaled, but a later arrival may
            // have taken the permit first. Re-test.
        }
    }

    /// Increment the count and wake one waiter, if any.
    pub fn signal(&self) {
        let mut g = self.inner.lock();
        g.value += 1;
        let woken = g.waiters.pop_front();
        g.unlock();
        if let Some(handle) = woken {
            trace!('s', "semaphore {} waking a waiter", self.name);
            handle.unpark();
        }
    }

    /// The current count. Only a snapshot; for tests and debugging.
    pub fn value(&self) -> usize {
        let g = self.inner.lock();
        let v = g.value;
        g.unlock();
        v
    }
}
