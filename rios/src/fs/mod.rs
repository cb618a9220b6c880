//! The filesystem.
//!
//! Layered bottom-up the way the disk sees it:
//!
//! * [`synch_disk`] — turns the interrupt-driven sector device into
//!   blocking `read_sector`/`write_sector` calls;
//! * [`freemap`] — the free-sector bitmap, persisted as an ordinary file
//!   whose header lives in sector [`FREE_MAP_SECTOR`];
//! * [`file_header`] — the per-file index (inode): direct, single-indirect
//!   and double-indirect sector maps;
//! * [`directory`] — a growable table of name → header-sector entries,
//!   persisted as a file;
//! * [`file_table`] — process-wide reference-counted open-file records,
//!   each owning the file's reader/writer lock and its deferred-delete
//!   flag;
//! * [`open_file`] — a positioned I/O handle over one file;
//! * [`file_system`] — path resolution and the create/open/remove/extend
//!   operations, owner of the two well-known files and of the locking
//!   protocol that ties all of the above together.
//!
//! Lock order, never reversed: directory-tree lock ⊐ per-directory
//! reader/writer lock ⊐ free-map lock.

pub mod directory;
pub mod file_header;
pub mod file_system;
pub mod file_table;
pub mod freemap;
pub mod open_file;
pub mod path;
pub mod synch_disk;

pub use file_system::FileSystem;
pub use file_table::FileId;
pub use open_file::OpenFile;

use mirage::{NUM_SECTORS, SECTOR_SIZE};

/// Sector holding the free-map file's header.
pub const FREE_MAP_SECTOR: usize = 0;
/// Sector holding the root directory's header.
pub const DIRECTORY_SECTOR: usize = 1;

/// Direct sector slots in a file header. Chosen so the serialized header is
/// exactly one sector.
pub const NUM_DIRECT: usize = (SECTOR_SIZE - 4 * 4) / 4;
/// Sector slots in an indirection block.
pub const NUM_INDIRECT: usize = SECTOR_SIZE / 4;
/// The largest file the indirection topology can map.
pub const MAX_FILE_SIZE: usize =
    (NUM_DIRECT + NUM_INDIRECT + NUM_INDIRECT * NUM_INDIRECT) * SECTOR_SIZE;

/// Longest file-name component.
pub const FILE_NAME_MAX_LEN: usize = 9;
/// Serialized size of one directory entry.
pub const DIR_ENTRY_SIZE: usize = 2 + (FILE_NAME_MAX_LEN + 1) + 4;
/// Entries a directory starts with.
pub const NUM_DIR_ENTRIES: usize = 10;
/// Initial size of a directory's backing file: the 32-bit table size plus
/// the initial entries.
pub const DIRECTORY_FILE_SIZE: usize = 4 + NUM_DIR_ENTRIES * DIR_ENTRY_SIZE;
/// Size of the free-map file: one bit per sector.
pub const FREE_MAP_FILE_SIZE: usize = NUM_SECTORS / 8;
