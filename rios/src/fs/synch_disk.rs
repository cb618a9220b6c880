//! Synchronous disk interface.
//!
//! The raw device copies data immediately but completes by interrupt. This
//! layer serializes requests with a lock and puts the caller to sleep on a
//! semaphore that the completion interrupt signals — the canonical
//! request/completion mailbox. Every higher filesystem layer does its
//! sector I/O through here.

use mirage::{disk, SECTOR_SIZE};

use crate::sync::{Lock, Semaphore};

/// Blocking, one-request-at-a-time access to the disk.
pub struct SynchDisk {
    /// Only one request may use the device at a time.
    lock: Lock<()>,
    /// Signaled by the disk's completion interrupt.
    semaphore: Semaphore,
}

impl SynchDisk {
    /// A fresh interface. The caller must route the disk's completion
    /// interrupt to [`request_done`](Self::request_done).
    pub fn new() -> Self {
        Self {
            lock: Lock::new("synch-disk", ()),
            semaphore: Semaphore::new("synch-disk", 0),
        }
    }

    /// Read `sector` into `buf`, blocking until the request completes.
    pub fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
        let guard = self.lock.acquire();
        disk::read_request(sector, buf);
        self.semaphore.wait();
        drop(guard);
    }

    /// Write `buf` to `sector`, blocking until the request completes.
    pub fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        let guard = self.lock.acquire();
        disk::write_request(sector, buf);
        self.semaphore.wait();
        drop(guard);
    }

    /// Called from the disk interrupt handler.
    pub fn request_done(&self) {
        self.semaphore.signal();
    }
}

impl Default for SynchDisk {
    fn default() -> Self {
        Self::new()
    }
}
