//! Ownership-tracked mutex with priority donation.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use mirage::spinlock::SpinLock;

use crate::thread::scheduler::scheduler;
use crate::thread::{current, Thread};

use super::Semaphore;

/// A mutual exclusion lock protecting the data it wraps.
///
/// Built on a binary [`Semaphore`] plus a record of the owning thread.
/// Acquiring a lock the current thread already holds is a kernel bug and
/// asserts (the lock is not reentrant). The guard releases on drop, so a
/// release by a non-owner cannot be expressed.
///
/// While a thread waits for the lock it donates its priority to the holder
/// through the scheduler, and the holder's priority is restored on release,
/// so a high-priority waiter cannot be starved by the medium-priority
/// threads an unboosted holder would lose the CPU to.
pub struct Lock<T: ?Sized> {
    name: &'static str,
    semaphore: Semaphore,
    owner: SpinLock<Option<Arc<Thread>>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Lock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Lock<T> {}

impl<T> Lock<T> {
    /// A new, unheld lock named `name` (for traces) wrapping `data`.
    pub fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            semaphore: Semaphore::new(name, 1),
            owner: SpinLock::new(None),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock, returning the protected data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Lock<T> {
    /// Whether the current thread holds this lock.
    pub fn held_by_current(&self) -> bool {
        let me = current();
        let g = self.owner.lock();
        let held = g.as_ref().is_some_and(|o| o.tid == me.tid);
        g.unlock();
        held
    }

    /// Acquire the lock, blocking until it is free.
    #[track_caller]
    pub fn acquire(&self) -> LockGuard<'_, T> {
        assert!(
            !self.held_by_current(),
            "thread re-acquired lock {:?} it already holds",
            self.name
        );
        // If someone holds the lock at a lower effective priority than
        // ours, boost them before we block behind them.
        let me = current();
        {
            let g = self.owner.lock();
            let holder = g.clone();
            g.unlock();
            if let Some(holder) = holder {
                scheduler().donate_priority(&holder, me.effective_priority());
            }
        }
        self.semaphore.wait();
        let mut g = self.owner.lock();
        *g = Some(me);
        g.unlock();
        LockGuard { lock: self }
    }
}

/// RAII guard for a [`Lock`]. Releasing restores the holder's priority and
/// wakes one waiter.
pub struct LockGuard<'a, T: ?Sized> {
    pub(crate) lock: &'a Lock<T>,
}

impl<'a, T: ?Sized> LockGuard<'a, T> {
    /// The lock this guard was taken from.
    pub(crate) fn source(&self) -> &'a Lock<T> {
        self.lock
    }
}

impl<T: ?Sized> Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        let me = {
            let mut g = self.lock.owner.lock();
            let owner = g.take();
            g.unlock();
            owner.expect("lock released while unheld")
        };
        debug_assert_eq!(me.tid, current().tid, "lock released by a non-owner");
        scheduler().restore_priority(&me);
        self.lock.semaphore.signal();
    }
}
