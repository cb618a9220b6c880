//! Directories.
//!
//! A directory is a table of fixed-width entries persisted as an ordinary
//! file: a 32-bit table size followed by the entries. Slots are reused as
//! soon as they are freed; when every slot is in use the table grows by one
//! entry, and the caller is told to extend the backing file by
//! [`DIR_ENTRY_SIZE`](super::DIR_ENTRY_SIZE) to match.

use crate::KernelError;

use super::open_file::OpenFile;
use super::{DIR_ENTRY_SIZE, FILE_NAME_MAX_LEN};

/// One directory slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Whether the slot names a live entry.
    pub in_use: bool,
    /// Whether the entry is a subdirectory.
    pub is_dir: bool,
    name: [u8; FILE_NAME_MAX_LEN + 1],
    /// Sector of the entry's file header.
    pub sector: u32,
}

impl DirectoryEntry {
    fn empty() -> Self {
        Self {
            in_use: false,
            is_dir: false,
            name: [0; FILE_NAME_MAX_LEN + 1],
            sector: 0,
        }
    }

    /// The entry's name.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; FILE_NAME_MAX_LEN + 1];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }

    fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        buf[0] = self.in_use as u8;
        buf[1] = self.is_dir as u8;
        buf[2..2 + self.name.len()].copy_from_slice(&self.name);
        buf[DIR_ENTRY_SIZE - 4..].copy_from_slice(&self.sector.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut entry = Self::empty();
        entry.in_use = buf[0] != 0;
        entry.is_dir = buf[1] != 0;
        entry.name.copy_from_slice(&buf[2..2 + FILE_NAME_MAX_LEN + 1]);
        entry.sector = u32::from_le_bytes(buf[DIR_ENTRY_SIZE - 4..DIR_ENTRY_SIZE].try_into().unwrap());
        entry
    }
}

/// An in-memory directory table.
pub struct Directory {
    table: Vec<DirectoryEntry>,
}

impl Directory {
    /// An empty, zero-slot directory. Call [`set_size`](Self::set_size) or
    /// [`fetch_from`](Self::fetch_from) before use.
    pub fn new() -> Self {
        Self { table: Vec::new() }
    }

    /// Reset to `entries` empty slots (used when formatting and when
    /// initializing a newly created directory).
    pub fn set_size(&mut self, entries: usize) {
        self.table = vec![DirectoryEntry::empty(); entries];
    }

    /// Number of slots, used and free.
    pub fn table_size(&self) -> usize {
        self.table.len()
    }

    /// The slots, for the consistency checker.
    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.table
    }

    /// Read the table from its backing file.
    pub fn fetch_from(&mut self, file: &OpenFile) -> Result<(), KernelError> {
        let mut size_buf = [0u8; 4];
        if file.read_at_unchecked(&mut size_buf, 0) != 4 {
            return Err(KernelError::FilesystemCorrupted("directory too short"));
        }
        let entries = u32::from_le_bytes(size_buf) as usize;
        // A table bigger than the disk is a corrupted image, not a request
        // to allocate.
        if entries > mirage::NUM_SECTORS * mirage::SECTOR_SIZE / DIR_ENTRY_SIZE {
            return Err(KernelError::FilesystemCorrupted("directory table size"));
        }
        let mut buf = vec![0u8; entries * DIR_ENTRY_SIZE];
        if file.read_at_unchecked(&mut buf, 4) != buf.len() {
            return Err(KernelError::FilesystemCorrupted("directory truncated"));
        }
        self.table = buf
            .chunks_exact(DIR_ENTRY_SIZE)
            .map(DirectoryEntry::from_bytes)
            .collect();
        Ok(())
    }

    /// Write the table to its backing file. The file must already be large
    /// enough (callers extend before adding the entry that grew the table).
    pub fn write_back(&self, file: &OpenFile) {
        let mut buf = Vec::with_capacity(4 + self.table.len() * DIR_ENTRY_SIZE);
        buf.extend_from_slice(&(self.table.len() as u32).to_le_bytes());
        for entry in &self.table {
            buf.extend_from_slice(&entry.to_bytes());
        }
        let written = file.write_at_unchecked(&buf, 0);
        assert_eq!(written, buf.len(), "directory backing file too small");
    }

    /// The slot index of `name`, if present.
    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.table
            .iter()
            .position(|e| e.in_use && e.name() == name)
    }

    /// Look up `name`.
    pub fn find(&self, name: &str) -> Option<&DirectoryEntry> {
        self.find_index(name).map(|i| &self.table[i])
    }

    /// Add an entry. On success, returns whether the table grew — in which
    /// case the backing file must be extended by one entry before the
    /// write-back.
    pub fn add(&mut self, name: &str, sector: u32, is_dir: bool) -> Result<bool, KernelError> {
        if name.is_empty() || name.len() > FILE_NAME_MAX_LEN {
            return Err(KernelError::InvalidArgument);
        }
        if self.find_index(name).is_some() {
            return Err(KernelError::FileExist);
        }
        let grew = match self.table.iter().position(|e| !e.in_use) {
            Some(_) => false,
            None => {
                self.table.push(DirectoryEntry::empty());
                true
            }
        };
        let slot = self.table.iter().position(|e| !e.in_use).unwrap();
        let entry = &mut self.table[slot];
        entry.in_use = true;
        entry.is_dir = is_dir;
        entry.set_name(name);
        entry.sector = sector;
        Ok(grew)
    }

    /// Remove `name`. The slot is cleared, not compacted.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.find_index(name) {
            Some(i) => {
                self.table[i] = DirectoryEntry::empty();
                true
            }
            None => false,
        }
    }

    /// Whether no slot is in use.
    pub fn is_empty(&self) -> bool {
        self.table.iter().all(|e| !e.in_use)
    }

    /// Print the live entries.
    pub fn list(&self) {
        for entry in self.table.iter().filter(|e| e.in_use) {
            if entry.is_dir {
                mirage::println!("{}/", entry.name());
            } else {
                mirage::println!("{}", entry.name());
            }
        }
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::NUM_DIR_ENTRIES;

    fn dir() -> Directory {
        let mut d = Directory::new();
        d.set_size(NUM_DIR_ENTRIES);
        d
    }

    #[test]
    fn add_find_remove() {
        let mut d = dir();
        assert_eq!(d.add("a", 7, false), Ok(false));
        assert_eq!(d.find("a").map(|e| e.sector), Some(7));
        assert!(d.remove("a"));
        assert!(d.find("a").is_none());
        assert!(d.is_empty());
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut d = dir();
        assert_eq!(d.add("a", 7, false), Ok(false));
        assert_eq!(d.add("a", 9, true), Err(KernelError::FileExist));
    }

    #[test]
    fn long_names_are_rejected() {
        let mut d = dir();
        assert_eq!(
            d.add("0123456789x", 7, false),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn grows_by_one_entry_when_full() {
        let mut d = dir();
        for i in 0..NUM_DIR_ENTRIES {
            assert_eq!(d.add(&format!("f{i}"), i as u32, false), Ok(false));
        }
        assert_eq!(d.add("extra", 99, false), Ok(true));
        assert_eq!(d.table_size(), NUM_DIR_ENTRIES + 1);
        assert_eq!(d.find("extra").map(|e| e.sector), Some(99));
    }

    #[test]
    fn removed_slots_are_reused_without_growth() {
        let mut d = dir();
        for i in 0..NUM_DIR_ENTRIES {
            d.add(&format!("f{i}"), i as u32, false).unwrap();
        }
        assert!(d.remove("f3"));
        assert_eq!(d.add("new", 42, false), Ok(false));
        assert_eq!(d.table_size(), NUM_DIR_ENTRIES);
    }

    #[test]
    fn entry_serialization_round_trips() {
        let mut e = DirectoryEntry::empty();
        e.in_use = true;
        e.is_dir = true;
        e.set_name("swap.3");
        e.sector = 0x1234;
        let back = DirectoryEntry::from_bytes(&e.to_bytes());
        assert_eq!(back, e);
    }
}
