//! Interrupt-disabling spinlock.
//!
//! On a single simulated CPU, mutual exclusion only requires that the holder
//! cannot be preempted: disabling interrupts removes every preemption point.
//! The atomic flag is kept anyway as a cheap diagnostic — if it is ever found
//! set while interrupts are off, a thread blocked while holding a lock, which
//! the kernel forbids.
//!
//! Guards do **not** release on drop. A guard that goes out of scope without
//! an explicit [`SpinLockGuard::unlock`] panics, so forgotten unlocks surface
//! immediately instead of as silent deadlocks.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::interrupt::InterruptGuard;

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
pub struct WouldBlock;

/// A mutual exclusion primitive protecting the data it wraps.
///
/// Data is reached only through the guard returned by [`lock`](Self::lock),
/// and the guard must be explicitly unlocked:
///
/// ```
/// use mirage::spinlock::SpinLock;
///
/// let lock = SpinLock::new(0);
/// let mut guard = lock.lock();
/// *guard += 1;
/// guard.unlock();
/// ```
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, disabling interrupts for the critical section.
    #[track_caller]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let guard = InterruptGuard::new();
        assert!(
            !self.locked.fetch_or(true, Ordering::SeqCst),
            "spinlock held across a suspension point"
        );
        SpinLockGuard {
            lock: self,
            caller: core::panic::Location::caller(),
            intr: Some(guard),
        }
    }

    /// Attempts to acquire this lock without blocking.
    #[track_caller]
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, WouldBlock> {
        let guard = InterruptGuard::new();
        if self.locked.fetch_or(true, Ordering::SeqCst) {
            Err(WouldBlock)
        } else {
            Ok(SpinLockGuard {
                lock: self,
                caller: core::panic::Location::caller(),
                intr: Some(guard),
            })
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// A "scoped lock" of a spinlock. Panics when dropped without
/// [`unlock`](Self::unlock).
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    caller: &'static core::panic::Location<'static>,
    intr: Option<InterruptGuard>,
}

impl<T: ?Sized> SpinLockGuard<'_, T> {
    /// Releases the underlying [`SpinLock`] and restores the interrupt level.
    pub fn unlock(mut self) {
        self.lock.locked.store(false, Ordering::SeqCst);
        self.intr.take();
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        panic!(
            "`.unlock()` must be explicitly called before dropping a SpinLockGuard; \
             the lock was taken at {:?}",
            self.caller
        );
    }
}
