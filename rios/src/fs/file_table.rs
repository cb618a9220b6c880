//! The open-file table.
//!
//! One record per open on-disk file, keyed by a dense small-integer
//! [`FileId`] rather than by pointer — record lifetime is driven purely by
//! the reference count, and every `OpenFile` handle in the system is a
//! ticket against one count.
//!
//! A record also carries the file's reader/writer lock (shared by every
//! handle to the file) and its deletion state. Deletion is a one-way
//! transition `Open → Tombstoned`: a tombstoned record refuses new opens,
//! and the caller that drops the last reference learns it must perform the
//! physical on-disk removal.

use std::sync::Arc;

use crate::sync::{Lock, RwLock};
use crate::util::Table;

/// Stable handle for one open-file record.
pub type FileId = usize;

/// Deletion state of a record; the only transition is
/// [`Open`](RefState::Open) → [`Tombstoned`](RefState::Tombstoned).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum RefState {
    Open,
    Tombstoned,
}

struct FileRef {
    sector: u32,
    /// Full path the file was first opened under; used to find the owning
    /// directory again at close time. The two well-known files have none.
    name: Option<String>,
    ref_count: usize,
    state: RefState,
    lock: Arc<RwLock>,
}

/// The process-wide table of open files.
pub struct FileTable {
    files: Lock<Table<FileRef>>,
}

impl FileTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            files: Lock::new("file-table", Table::new()),
        }
    }

    /// Open the file whose header lives at `sector`, taking one reference.
    ///
    /// Returns the record's id and the file's reader/writer lock. Fails iff
    /// the record is tombstoned — a removed-while-open file cannot be
    /// reopened.
    pub fn open_file(
        &self,
        sector: u32,
        name: Option<&str>,
    ) -> Result<(FileId, Arc<RwLock>), crate::KernelError> {
        let mut g = self.files.acquire();
        let existing = g.iter().find(|(_, r)| r.sector == sector).map(|(id, _)| id);
        match existing {
            Some(id) => {
                let r = g.get_mut(id).unwrap();
                if r.state == RefState::Tombstoned {
                    return Err(crate::KernelError::Tombstoned);
                }
                r.ref_count += 1;
                Ok((id, r.lock.clone()))
            }
            None => {
                let lock = Arc::new(RwLock::new("file"));
                let id = g.add(FileRef {
                    sector,
                    name: name.map(String::from),
                    ref_count: 1,
                    state: RefState::Open,
                    lock: lock.clone(),
                });
                Ok((id, lock))
            }
        }
    }

    /// Drop one reference. When the count reaches zero the record is
    /// removed; the return value says whether the file must now be
    /// physically deleted from disk (it was tombstoned). The caller
    /// performs that deletion outside the table's lock.
    pub fn close_file(&self, id: FileId) -> bool {
        let mut g = self.files.acquire();
        let Some(r) = g.get_mut(id) else {
            return false;
        };
        assert!(r.ref_count > 0, "close of an unreferenced record");
        r.ref_count -= 1;
        if r.ref_count == 0 {
            let r = g.remove(id).unwrap();
            return r.state == RefState::Tombstoned;
        }
        false
    }

    /// Ask to remove the file at `sector`. With no record the caller may
    /// delete immediately (returns true); otherwise the record is
    /// tombstoned and deletion waits for the last close (returns false).
    pub fn set_remove(&self, sector: u32) -> bool {
        let mut g = self.files.acquire();
        let found = g.iter().find(|(_, r)| r.sector == sector).map(|(id, _)| id);
        match found {
            Some(id) => {
                let r = g.get_mut(id).unwrap();
                // A live record always has ref_count >= 1, so deletion is
                // necessarily deferred.
                r.state = RefState::Tombstoned;
                false
            }
            None => true,
        }
    }

    /// The full path the record was opened under.
    pub fn name(&self, id: FileId) -> Option<String> {
        let g = self.files.acquire();
        g.get(id).and_then(|r| r.name.clone())
    }

    /// The record's header sector.
    pub fn sector(&self, id: FileId) -> Option<u32> {
        let g = self.files.acquire();
        g.get(id).map(|r| r.sector)
    }

    /// The record's reader/writer lock.
    pub fn lock_of(&self, id: FileId) -> Option<Arc<RwLock>> {
        let g = self.files.acquire();
        g.get(id).map(|r| r.lock.clone())
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
