//! Condition variable.

use mirage::spinlock::SpinLock;

use super::{Lock, LockGuard, Semaphore};

/// A Mesa-semantics condition variable.
///
/// A waiter atomically releases the lock whose guard it passes in, blocks,
/// and re-acquires the lock on wakeup. Because the semantics are Mesa —
/// the signaled thread merely becomes runnable and contends for the lock
/// with anyone else — the predicate must be re-tested in a loop, which is
/// what [`wait_while`](Self::wait_while) packages up.
///
/// Internally: a waiter count guarded by a spinlock, plus a counting
/// semaphore on which each `signal` banks exactly one wakeup.
pub struct Condition {
    name: &'static str,
    waiting: SpinLock<usize>,
    signal_sem: Semaphore,
}

impl Condition {
    /// A fresh condition variable named `name` (for traces).
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            waiting: SpinLock::new(0),
            signal_sem: Semaphore::new(name, 0),
        }
    }

    /// Release the lock, block until signaled, re-acquire the lock.
    pub fn wait<'a, T>(&self, guard: LockGuard<'a, T>) -> LockGuard<'a, T> {
        let mut w = self.waiting.lock();
        *w += 1;
        w.unlock();

        let lock: &'a Lock<T> = guard.source();
        drop(guard);
        self.signal_sem.wait();
        lock.acquire()
    }

    /// Acquire the lock and block while `predicate` holds, re-testing after
    /// every wakeup. Returns with the lock held and the predicate false.
    pub fn wait_while<'a, T>(
        &self,
        lock: &'a Lock<T>,
        predicate: impl Fn(&mut T) -> bool,
    ) -> LockGuard<'a, T> {
        let mut guard = lock.acquire();
        while predicate(&mut guard) {
            guard = self.wait(guard);
        }
        guard
    }

    /// Wake at most one waiter.
    pub fn signal(&self) {
        let mut w = self.waiting.lock();
        if *w > 0 {
            *w -= 1;
            w.unlock();
            mirage::trace!('s', "condition {} signaling one waiter", self.name);
            self.signal_sem.signal();
        } else {
            w.unlock();
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let mut w = self.waiting.lock();
        let n = *w;
        *w = 0;
        w.unlock();
        for _ in 0..n {
            self.signal_sem.signal();
        }
    }
}
