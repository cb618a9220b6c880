//! Open-file handles.
//!
//! An [`OpenFile`] is a positioned I/O handle over one on-disk file. Table
//! handles (from [`FileSystem::open`](super::FileSystem::open)) carry the
//! file's [`FileId`] and its reader/writer lock; the locked operations
//! ([`read_at`](OpenFile::read_at), [`write_at`](OpenFile::write_at) and
//! the cursor forms) hold the lock for the whole transfer, so a reader
//! never observes a half-applied write and writers serialize with
//! extension.
//!
//! Raw handles (no id, no lock) exist for the filesystem's own internals —
//! path resolution and directory/free-map write-backs run under the
//! filesystem's explicit locking protocol, so they use the unchecked
//! operations directly. The header is fetched from disk per operation
//! rather than cached in the handle: two handles to one file always agree
//! about its length.

use mirage::SECTOR_SIZE;

use mirage::spinlock::SpinLock;

use std::sync::Arc;

use crate::sync::RwLock;
use crate::KernelError;

use super::file_header::FileHeader;
use super::file_table::FileId;

/// A handle to one open file.
pub struct OpenFile {
    sector: usize,
    file_id: Option<FileId>,
    lock: Option<Arc<RwLock>>,
    pos: SpinLock<usize>,
}

impl OpenFile {
    /// A table-backed handle: one ticket against the record's refcount.
    pub(crate) fn new(sector: usize, file_id: FileId, lock: Arc<RwLock>) -> Self {
        Self {
            sector,
            file_id: Some(file_id),
            lock: Some(lock),
            pos: SpinLock::new(0),
        }
    }

    /// A raw handle for filesystem internals: no record, no lock.
    pub(crate) fn raw(sector: usize) -> Self {
        Self {
            sector,
            file_id: None,
            lock: None,
            pos: SpinLock::new(0),
        }
    }

    /// The sector holding this file's header.
    pub fn sector(&self) -> usize {
        self.sector
    }

    /// The open-file record this handle is a ticket against.
    pub fn file_id(&self) -> Option<FileId> {
        self.file_id
    }

    /// Current length in bytes.
    pub fn length(&self) -> usize {
        FileHeader::fetch_from(self.sector).file_length()
    }

    /// Move the cursor.
    pub fn seek(&self, position: usize) {
        let mut g = self.pos.lock();
        *g = position;
        g.unlock();
    }

    /// Read without taking the file lock. For callers inside the
    /// filesystem's own locking protocol.
    pub(crate) fn read_at_unchecked(&self, into: &mut [u8], offset: usize) -> usize {
        let header = FileHeader::fetch_from(self.sector);
        let length = header.file_length();
        if offset >= length || into.is_empty() {
            return 0;
        }
        let n = into.len().min(length - offset);
        let disk = crate::system::synch_disk();
        let mut buf = [0u8; SECTOR_SIZE];
        let mut done = 0;
        while done < n {
            let at = offset + done;
            let in_sector = at % SECTOR_SIZE;
            let here = n.min(done + SECTOR_SIZE - in_sector) - done;
            disk.read_sector(header.byte_to_sector(at), &mut buf);
            into[done..done + here].copy_from_slice(&buf[in_sector..in_sector + here]);
            done += here;
        }
        n
    }

    /// Write without taking the file lock, bounded by the current file
    /// length (no extension). For callers inside the filesystem's own
    /// locking protocol.
    pub(crate) fn write_at_unchecked(&self, from: &[u8], offset: usize) -> usize {
        let header = FileHeader::fetch_from(self.sector);
        let length = header.file_length();
        if offset >= length || from.is_empty() {
            return 0;
        }
        let n = from.len().min(length - offset);
        let disk = crate::system::synch_disk();
        let mut buf = [0u8; SECTOR_SIZE];
        let mut done = 0;
        while done < n {
            let at = offset + done;
            let in_sector = at % SECTOR_SIZE;
            let here = n.min(done + SECTOR_SIZE - in_sector) - done;
            let sector = header.byte_to_sector(at);
            // Partial sectors keep their surrounding bytes.
            if in_sector != 0 || here != SECTOR_SIZE {
                disk.read_sector(sector, &mut buf);
            }
            buf[in_sector..in_sector + here].copy_from_slice(&from[done..done + here]);
            disk.write_sector(sector, &buf);
            done += here;
        }
        n
    }

    /// Read `into.len()` bytes at `offset` under the file's read lock.
    /// Returns the bytes read, short at end of file.
    pub fn read_at(&self, into: &mut [u8], offset: usize) -> usize {
        let _r = self.lock.as_ref().map(|l| l.read());
        self.read_at_unchecked(into, offset)
    }

    /// Write `from` at `offset` under the file's write lock, extending the
    /// file first when the write reaches past the end.
    pub fn write_at(&self, from: &[u8], offset: usize) -> Result<usize, KernelError> {
        let _w = self.lock.as_ref().map(|l| l.write());
        let end = offset + from.len();
        if end > self.length() {
            crate::system::file_system().extend_file(self.sector, end)?;
        }
        Ok(self.write_at_unchecked(from, offset))
    }

    /// Read at the cursor, advancing it.
    pub fn read(&self, into: &mut [u8]) -> usize {
        let g = self.pos.lock();
        let at = *g;
        g.unlock();
        let n = self.read_at(into, at);
        let mut g = self.pos.lock();
        *g = at + n;
        g.unlock();
        n
    }

    /// Write at the cursor, advancing it.
    pub fn write(&self, from: &[u8]) -> Result<usize, KernelError> {
        let g = self.pos.lock();
        let at = *g;
        g.unlock();
        let n = self.write_at(from, at)?;
        let mut g = self.pos.lock();
        *g = at + n;
        g.unlock();
        Ok(n)
    }
}
