//! Writer-preferring reader/writer lock.

use super::{Lock, Semaphore};

/// A reader/writer lock: any number of readers or exactly one writer.
///
/// The lock is writer-preferring and built from three pieces:
///
/// * `wants_to_write` — a binary semaphore a writer holds for its whole
///   critical section. Arriving readers touch-and-release it
///   (`wait` immediately followed by `signal`), which queues them behind
///   any writer that got there first instead of trickling past it forever.
/// * `readers` — the reader count, under its own [`Lock`].
/// * `in_use` — a binary semaphore held by the writer, or by the first
///   reader on behalf of all current readers (the last reader out releases
///   it).
///
/// The reader entry order — `wants_to_write` barrier first, *then* the
/// reader-count lock — is load-bearing: taking the count lock first would
/// let a stream of readers starve writers.
///
/// The lock protects no data of its own; it serializes access to on-disk
/// structures (file contents, directory contents) that cannot live inside
/// it. Guards release on drop; the raw `acquire`/`release` pairs are also
/// public for callers whose critical section does not nest lexically.
pub struct RwLock {
    readers: Lock<usize>,
    in_use: Semaphore,
    wants_to_write: Semaphore,
}

impl RwLock {
    /// A fresh, unheld lock. `name` shows up in traces.
    pub fn new(name: &'static str) -> Self {
        Self {
            readers: Lock::new(name, 0),
            in_use: Semaphore::new(name, 1),
            wants_to_write: Semaphore::new(name, 1),
        }
    }

    /// Acquire for shared reading.
    pub fn read_acquire(&self) {
        // Queue behind any pending writer.
        self.wants_to_write.wait();
        self.wants_to_write.signal();

        let mut g = self.readers.acquire();
        *g += 1;
        if *g == 1 {
            // First reader in claims the lock for the whole reader group.
            self.in_use.wait();
        }
    }

    /// Release a shared read.
    pub fn read_release(&self) {
        let mut g = self.readers.acquire();
        assert!(*g > 0, "read_release with no readers");
        *g -= 1;
        if *g == 0 {
            self.in_use.signal();
        }
    }

    /// Acquire for exclusive writing.
    pub fn write_acquire(&self) {
        self.wants_to_write.wait();
        self.in_use.wait();
    }

    /// Release an exclusive write.
    pub fn write_release(&self) {
        self.wants_to_write.signal();
        self.in_use.signal();
    }

    /// RAII shared read.
    pub fn read(&self) -> RwLockReadGuard<'_> {
        self.read_acquire();
        RwLockReadGuard { lock: self }
    }

    /// RAII exclusive write.
    pub fn write(&self) -> RwLockWriteGuard<'_> {
        self.write_acquire();
        RwLockWriteGuard { lock: self }
    }
}

/// Releases the shared read when dropped.
pub struct RwLockReadGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for RwLockReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.read_release();
    }
}

/// Releases the exclusive write when dropped.
pub struct RwLockWriteGuard<'a> {
    lock: &'a RwLock,
}

impl Drop for RwLockWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_release();
    }
}
