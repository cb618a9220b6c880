//! The free-sector map.
//!
//! One bit per disk sector, persisted as an ordinary file whose header
//! lives in sector [`FREE_MAP_SECTOR`](super::FREE_MAP_SECTOR). A sector is
//! marked used iff it is one of the two well-known sectors or appears in
//! exactly one reachable file header (as header, indirection or data
//! sector) — the consistency checker verifies precisely that.
//!
//! Callers always fetch, modify and write back within one critical section
//! of the filesystem's free-map lock, and the write-back happens before the
//! lock is released.

use core::ops::{Deref, DerefMut};

use mirage::NUM_SECTORS;

use crate::util::Bitmap;

use super::open_file::OpenFile;
use super::FREE_MAP_FILE_SIZE;

/// The free-sector bitmap, with its persistence glue.
pub struct FreeMap(Bitmap);

impl FreeMap {
    /// An all-free map (used only while formatting).
    pub fn new() -> Self {
        Self(Bitmap::new(NUM_SECTORS))
    }

    /// Read the map from its backing file.
    pub fn fetch_from(file: &OpenFile) -> Self {
        let mut buf = vec![0u8; FREE_MAP_FILE_SIZE];
        let read = file.read_at_unchecked(&mut buf, 0);
        assert_eq!(read, FREE_MAP_FILE_SIZE, "free-map file truncated");
        Self(Bitmap::from_bytes(NUM_SECTORS, &buf))
    }

    /// Write the map to its backing file.
    pub fn write_back(&self, file: &OpenFile) {
        let written = file.write_at_unchecked(&self.0.to_bytes(), 0);
        assert_eq!(written, FREE_MAP_FILE_SIZE, "free-map file truncated");
    }
}

impl Default for FreeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for FreeMap {
    type Target = Bitmap;

    fn deref(&self) -> &Bitmap {
        &self.0
    }
}

impl DerefMut for FreeMap {
    fn deref_mut(&mut self) -> &mut Bitmap {
        &mut self.0
    }
}
