//! Synchronization primitives.
//!
//! Everything here is layered on the [`Semaphore`], and the semaphore is the
//! only primitive that touches the machine's interrupt state (through the
//! interrupt-disabling spinlock). Higher layers compose:
//!
//! * [`Lock`] — an ownership-tracked mutex (binary semaphore + owner), with
//!   priority donation to the holder;
//! * [`Condition`] — Mesa-style condition variable over a [`Lock`];
//! * [`RwLock`] — writer-preferring reader/writer lock built from two
//!   binary semaphores and a reader count;
//! * [`Channel`] — unbuffered rendezvous of an integer, FIFO over a single
//!   waiter list.

mod channel;
mod condition;
mod lock;
mod rwlock;
mod semaphore;

pub use channel::Channel;
pub use condition::Condition;
pub use lock::{Lock, LockGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
