//! Top-level filesystem operations.
//!
//! The filesystem owns the two well-known files — the free-sector map
//! (header in sector 0) and the root directory (header in sector 1) — the
//! open-file table, and the two locks that define the concurrency
//! protocol:
//!
//! * `dir_tree_lock`, a reader/writer lock over the *topology* of the
//!   directory tree. Held in read mode only long enough to resolve a path
//!   and pin the target directory through the open-file table; the pin
//!   (a refcount) is what keeps the directory from being removed after the
//!   lock is dropped.
//! * `free_map_lock`, a mutex over the on-disk bitmap. The map is always
//!   fetched, modified and written back inside one critical section.
//!
//! Per-directory and per-file serialization comes from each open record's
//! reader/writer lock. Acquisition order, never reversed:
//! `dir_tree_lock` ⊐ per-directory lock ⊐ `free_map_lock`.
//!
//! On any failure the in-memory modifications are discarded; nothing dirty
//! is written back. On success every write-back is flushed before any lock
//! is released.

use mirage::trace;

use crate::sync::{Lock, RwLock};
use crate::thread;
use crate::KernelError;

use std::sync::Arc;

use super::directory::Directory;
use super::file_header::FileHeader;
use super::file_table::{FileId, FileTable};
use super::freemap::FreeMap;
use super::open_file::OpenFile;
use super::path::Path;
use super::{
    DIRECTORY_FILE_SIZE, DIRECTORY_SECTOR, DIR_ENTRY_SIZE, FREE_MAP_FILE_SIZE, FREE_MAP_SECTOR,
    MAX_FILE_SIZE, NUM_DIRECT, NUM_DIR_ENTRIES, NUM_INDIRECT,
};

/// What a path resolved to: the header sector of a file or directory.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedEntry {
    /// Header sector.
    pub sector: u32,
    /// Whether it is a directory.
    pub is_dir: bool,
}

/// The filesystem.
pub struct FileSystem {
    free_map_file: OpenFile,
    directory_file: OpenFile,
    open_files: FileTable,
    dir_tree_lock: RwLock,
    free_map_lock: Lock<()>,
}

impl FileSystem {
    /// Bring up the filesystem. With `format` the disk is initialized to an
    /// empty root directory and a free map that accounts for both
    /// well-known files; otherwise the on-disk structures are trusted.
    ///
    /// The two well-known files are opened through the table here and stay
    /// open for the life of the kernel.
    pub fn new(format: bool) -> Self {
        trace!('f', "initializing the file system, format={}", format);
        let open_files = FileTable::new();
        let free_map_file = OpenFile::raw(FREE_MAP_SECTOR);
        let directory_file = OpenFile::raw(DIRECTORY_SECTOR);

        if format {
            let mut free_map = FreeMap::new();
            free_map.mark(FREE_MAP_SECTOR);
            free_map.mark(DIRECTORY_SECTOR);

            let mut map_header = FileHeader::new();
            let mut dir_header = FileHeader::new();
            assert!(map_header.allocate(&mut free_map, FREE_MAP_FILE_SIZE));
            assert!(dir_header.allocate(&mut free_map, DIRECTORY_FILE_SIZE));

            // Headers go out first: file I/O below reads them back off disk.
            map_header.write_back(FREE_MAP_SECTOR);
            dir_header.write_back(DIRECTORY_SECTOR);

            let mut root = Directory::new();
            root.set_size(NUM_DIR_ENTRIES);
            root.write_back(&directory_file);
            free_map.write_back(&free_map_file);
        }

        // The well-known files stay open for the life of the kernel.
        open_files
            .open_file(FREE_MAP_SECTOR as u32, None)
            .expect("free-map record");
        open_files
            .open_file(DIRECTORY_SECTOR as u32, None)
            .expect("root-directory record");

        Self {
            free_map_file,
            directory_file,
            open_files,
            dir_tree_lock: RwLock::new("dir-tree"),
            free_map_lock: Lock::new("free-map", ()),
        }
    }

    /// The open-file table.
    pub fn open_files(&self) -> &FileTable {
        &self.open_files
    }

    fn fetch_free_map(&self) -> FreeMap {
        FreeMap::fetch_from(&self.free_map_file)
    }

    /// Resolve `path` to its entry. The caller must hold `dir_tree_lock`
    /// in at least read mode.
    fn find_path(&self, path: &Path) -> Option<ResolvedEntry> {
        let mut entry = ResolvedEntry {
            sector: DIRECTORY_SECTOR as u32,
            is_dir: true,
        };
        let mut dir = Directory::new();
        for component in path.components() {
            if !entry.is_dir {
                return None;
            }
            let file = OpenFile::raw(entry.sector as usize);
            dir.fetch_from(&file).ok()?;
            let found = dir.find(component)?;
            entry = ResolvedEntry {
                sector: found.sector,
                is_dir: found.is_dir,
            };
        }
        Some(entry)
    }

    /// Resolve the caller's textual `name` against its working directory
    /// into (parent path, leaf).
    fn split_against_cwd(&self, name: &str) -> Result<(Path, String), KernelError> {
        let mut path = {
            let th = thread::current();
            let g = th.cwd.lock();
            let p = g.clone();
            g.unlock();
            p
        };
        path.merge(name);
        let leaf = path.split().ok_or(KernelError::InvalidArgument)?;
        Ok((path, leaf))
    }

    /// Resolve `parent` and pin it through the open-file table, so it
    /// cannot be removed while we work under its lock.
    fn pin_directory(&self, parent: &Path) -> Result<(FileId, Arc<RwLock>, u32), KernelError> {
        self.dir_tree_lock.read_acquire();
        let result = (|| {
            let entry = self.find_path(parent).ok_or(KernelError::NoSuchEntry)?;
            if !entry.is_dir {
                return Err(KernelError::NotDirectory);
            }
            let (id, lock) = self
                .open_files
                .open_file(entry.sector, Some(&parent.to_string()))?;
            Ok((id, lock, entry.sector))
        })();
        self.dir_tree_lock.read_release();
        result
    }

    /// Create a file (or directory shell) of `initial_size` bytes at
    /// `name`, resolved against the caller's working directory.
    pub fn create(&self, name: &str, initial_size: usize, is_dir: bool) -> Result<(), KernelError> {
        assert!(initial_size < MAX_FILE_SIZE);
        trace!('f', "creating {} (dir={}, size={})", name, is_dir, initial_size);
        let (parent, leaf) = self.split_against_cwd(name)?;
        let (dir_id, dir_lock, dir_sector) = self.pin_directory(&parent)?;

        dir_lock.write_acquire();
        let result = (|| {
            let dir_file = OpenFile::raw(dir_sector as usize);
            let mut dir = Directory::new();
            dir.fetch_from(&dir_file)?;
            if dir.find_index(&leaf).is_some() {
                return Err(KernelError::FileExist);
            }

            let fm_guard = self.free_map_lock.acquire();
            let mut free_map = self.fetch_free_map();
            let header_sector = free_map.find().ok_or(KernelError::NoSpace)? as u32;

            let grew = dir.add(&leaf, header_sector, is_dir)?;
            let mut extended_dir_header = None;
            if grew {
                let mut dir_header = FileHeader::fetch_from(dir_sector as usize);
                let new_size = dir_header.file_length() + DIR_ENTRY_SIZE;
                if !dir_header.extend(&mut free_map, new_size) {
                    return Err(KernelError::NoSpace);
                }
                extended_dir_header = Some(dir_header);
            }

            let mut header = FileHeader::new();
            if !header.allocate(&mut free_map, initial_size) {
                return Err(KernelError::NoSpace);
            }

            // Success: flush everything while both locks are still held.
            header.write_back(header_sector as usize);
            if let Some(dir_header) = extended_dir_header {
                dir_header.write_back(dir_sector as usize);
            }
            dir.write_back(&dir_file);
            free_map.write_back(&self.free_map_file);
            drop(fm_guard);

            if is_dir {
                // Give the new directory its empty table.
                let mut child = Directory::new();
                child.set_size(initial_size.saturating_sub(4) / DIR_ENTRY_SIZE);
                child.write_back(&OpenFile::raw(header_sector as usize));
            }
            Ok(())
        })();
        dir_lock.write_release();
        self.close(dir_id);
        result
    }

    /// Create a directory at `name`.
    pub fn mkdir(&self, name: &str) -> Result<(), KernelError> {
        self.create(name, DIRECTORY_FILE_SIZE, true)
    }

    /// Open the file at `name` for reading and writing.
    pub fn open(&self, name: &str) -> Result<Arc<OpenFile>, KernelError> {
        trace!('f', "opening {}", name);
        let (parent, leaf) = self.split_against_cwd(name)?;
        let full = {
            let mut p = parent.clone();
            p.merge(&leaf);
            p.to_string()
        };
        let (dir_id, dir_lock, dir_sector) = self.pin_directory(&parent)?;

        dir_lock.read_acquire();
        let result = (|| {
            let mut dir = Directory::new();
            dir.fetch_from(&OpenFile::raw(dir_sector as usize))?;
            let entry = dir.find(&leaf).ok_or(KernelError::NoSuchEntry)?;
            if entry.is_dir {
                return Err(KernelError::IsDirectory);
            }
            let sector = entry.sector;
            let (file_id, file_lock) = self.open_files.open_file(sector, Some(&full))?;
            Ok(Arc::new(OpenFile::new(sector as usize, file_id, file_lock)))
        })();
        dir_lock.read_release();
        self.close(dir_id);
        result
    }

    /// Physically delete the file `leaf` (header at `sector`) from `dir`:
    /// free its sectors, clear its header sector, drop the directory entry,
    /// flush. The caller holds the directory's write lock.
    fn physical_remove(&self, leaf: &str, sector: u32, dir: &mut Directory, dir_file: &OpenFile) {
        trace!('f', "physically removing {} at sector {}", leaf, sector);
        let mut header = FileHeader::fetch_from(sector as usize);

        let fm_guard = self.free_map_lock.acquire();
        let mut free_map = self.fetch_free_map();
        header.deallocate(&mut free_map);
        free_map.clear(sector as usize);
        dir.remove(leaf);
        free_map.write_back(&self.free_map_file);
        drop(fm_guard);

        dir.write_back(dir_file);
    }

    /// Remove the file or empty directory at `name`. Removal of a
    /// still-open file succeeds immediately but the on-disk blocks are
    /// reclaimed only at the last close.
    pub fn remove(&self, name: &str) -> Result<(), KernelError> {
        trace!('f', "removing {}", name);
        let (parent, leaf) = self.split_against_cwd(name)?;
        let full = {
            let mut p = parent.clone();
            p.merge(&leaf);
            p.to_string()
        };
        let (dir_id, dir_lock, dir_sector) = self.pin_directory(&parent)?;

        dir_lock.write_acquire();
        let result = (|| {
            let dir_file = OpenFile::raw(dir_sector as usize);
            let mut dir = Directory::new();
            dir.fetch_from(&dir_file)?;
            let entry = dir.find(&leaf).ok_or(KernelError::NoSuchEntry)?.clone();

            if entry.is_dir {
                // Pin the child and check emptiness under its own write
                // lock, so nobody can slip an entry in while we decide.
                let (child_id, child_lock) = self.open_files.open_file(entry.sector, Some(&full))?;
                child_lock.write_acquire();
                let mut child = Directory::new();
                let empty = child
                    .fetch_from(&OpenFile::raw(entry.sector as usize))
                    .map(|()| child.is_empty());
                match empty {
                    Ok(true) => {
                        // Our pin guarantees deferral; deletion happens when
                        // the pin drops below.
                        let immediate = self.open_files.set_remove(entry.sector);
                        debug_assert!(!immediate);
                        child_lock.write_release();
                        if self.open_files.close_file(child_id) {
                            self.physical_remove(&leaf, entry.sector, &mut dir, &dir_file);
                        }
                        Ok(())
                    }
                    Ok(false) => {
                        child_lock.write_release();
                        // Bookkeeping close only: the child was not
                        // tombstoned, and the full close path would try to
                        // retake the parent lock we hold.
                        self.open_files.close_file(child_id);
                        Err(KernelError::DirectoryNotEmpty)
                    }
                    Err(e) => {
                        child_lock.write_release();
                        self.open_files.close_file(child_id);
                        Err(e)
                    }
                }
            } else if self.open_files.set_remove(entry.sector) {
                self.physical_remove(&leaf, entry.sector, &mut dir, &dir_file);
                Ok(())
            } else {
                // Open somewhere: tombstoned, reclaimed at the last close.
                Ok(())
            }
        })();
        dir_lock.write_release();
        self.close(dir_id);
        result
    }

    /// Drop one reference to an open-file record. If that was the last
    /// reference to a tombstoned file, reclaim its disk blocks under the
    /// owning directory's write lock.
    pub fn close(&self, id: FileId) {
        let Some(sector) = self.open_files.sector(id) else {
            return;
        };
        // The well-known files are never deleted.
        if sector as usize == FREE_MAP_SECTOR || sector as usize == DIRECTORY_SECTOR {
            self.open_files.close_file(id);
            return;
        }
        let mut path = match self.open_files.name(id) {
            Some(name) => Path::parse(&name),
            None => {
                self.open_files.close_file(id);
                return;
            }
        };
        let Some(leaf) = path.split() else {
            self.open_files.close_file(id);
            return;
        };

        let pinned = self.pin_directory(&path);
        let Ok((dir_id, dir_lock, dir_sector)) = pinned else {
            // The owning directory is gone from the tree; just drop the
            // reference.
            self.open_files.close_file(id);
            return;
        };

        dir_lock.write_acquire();
        if self.open_files.close_file(id) {
            let dir_file = OpenFile::raw(dir_sector as usize);
            let mut dir = Directory::new();
            if dir.fetch_from(&dir_file).is_ok() {
                self.physical_remove(&leaf, sector, &mut dir, &dir_file);
            }
        }
        dir_lock.write_release();
        self.close(dir_id);
    }

    /// Close a handle, dropping its table reference.
    pub fn close_handle(&self, file: &OpenFile) {
        if let Some(id) = file.file_id() {
            self.close(id);
        }
    }

    /// Free sectors remaining on the disk.
    pub fn count_free_sectors(&self) -> usize {
        let fm_guard = self.free_map_lock.acquire();
        let free_map = self.fetch_free_map();
        drop(fm_guard);
        free_map.count_clear()
    }

    /// Grow the file whose header lives at `sector` to `new_size` bytes.
    /// The caller must hold the file's write lock.
    pub fn extend_file(&self, sector: usize, new_size: usize) -> Result<(), KernelError> {
        trace!('f', "extending sector {} to {} bytes", sector, new_size);
        let fm_guard = self.free_map_lock.acquire();
        let mut free_map = self.fetch_free_map();
        let mut header = FileHeader::fetch_from(sector);
        if !header.extend(&mut free_map, new_size) {
            return Err(KernelError::NoSpace);
        }
        header.write_back(sector);
        free_map.write_back(&self.free_map_file);
        drop(fm_guard);
        Ok(())
    }

    /// Change the calling thread's working directory, repinning it: the new
    /// directory's record gains a reference, the old one loses its.
    pub fn chdir(&self, new_path: &str) -> Result<(), KernelError> {
        let th = thread::current();
        let mut path = {
            let g = th.cwd.lock();
            let p = g.clone();
            g.unlock();
            p
        };
        path.merge(new_path);

        self.dir_tree_lock.read_acquire();
        let result = (|| {
            let entry = self.find_path(&path).ok_or(KernelError::NoSuchEntry)?;
            if !entry.is_dir {
                return Err(KernelError::NotDirectory);
            }
            let (id, _) = self
                .open_files
                .open_file(entry.sector, Some(&path.to_string()))?;
            Ok(id)
        })();
        self.dir_tree_lock.read_release();
        let new_id = result?;

        let old_id = {
            let mut g = th.cwd_file_id.lock();
            let old = g.replace(new_id);
            g.unlock();
            let mut c = th.cwd.lock();
            *c = path;
            c.unlock();
            old
        };
        if let Some(old_id) = old_id {
            self.close(old_id);
        }
        Ok(())
    }

    /// Pin the calling thread's working directory in the open-file table.
    /// Called once when a thread starts.
    pub fn setup_thread(&self) {
        let th = thread::current();
        let path = {
            let g = th.cwd.lock();
            let p = g.clone();
            g.unlock();
            p
        };
        self.dir_tree_lock.read_acquire();
        let id = self
            .find_path(&path)
            .and_then(|entry| {
                entry
                    .is_dir
                    .then(|| self.open_files.open_file(entry.sector, Some(&path.to_string())).ok())
                    .flatten()
            })
            .map(|(id, _)| id);
        self.dir_tree_lock.read_release();
        let mut g = th.cwd_file_id.lock();
        *g = id;
        g.unlock();
    }

    /// Release the calling thread's working-directory pin. Called when a
    /// thread finishes.
    pub fn teardown_thread(&self) {
        let th = thread::current();
        let mut g = th.cwd_file_id.lock();
        let id = g.take();
        g.unlock();
        if let Some(id) = id {
            self.close(id);
        }
    }

    /// List the calling thread's working directory to the console.
    pub fn list(&self) {
        let th = thread::current();
        let Some(id) = ({
            let g = th.cwd_file_id.lock();
            let id = *g;
            g.unlock();
            id
        }) else {
            return;
        };
        let (Some(sector), Some(lock)) = (self.open_files.sector(id), self.open_files.lock_of(id))
        else {
            return;
        };
        lock.read_acquire();
        let mut dir = Directory::new();
        if dir.fetch_from(&OpenFile::raw(sector as usize)).is_ok() {
            dir.list();
        }
        lock.read_release();
    }
}

// The consistency checker.
impl FileSystem {
    fn check_sector(sector: u32, shadow: &mut crate::util::Bitmap, errors: &mut Vec<String>) {
        let sector = sector as usize;
        if sector >= mirage::NUM_SECTORS {
            errors.push(format!("sector {sector} out of range"));
            return;
        }
        if shadow.test(sector) {
            errors.push(format!("sector {sector} referenced twice"));
        } else {
            shadow.mark(sector);
        }
    }

    fn check_header(
        &self,
        sector: u32,
        shadow: &mut crate::util::Bitmap,
        errors: &mut Vec<String>,
    ) -> FileHeader {
        let header = FileHeader::fetch_from(sector as usize);
        let raw = header.raw();
        if raw.num_sectors as usize
            != (raw.num_bytes as usize).div_ceil(mirage::SECTOR_SIZE)
        {
            errors.push(format!(
                "header {}: {} sectors does not match {} bytes",
                sector, raw.num_sectors, raw.num_bytes
            ));
        }
        if raw.num_sectors as usize >= NUM_DIRECT + NUM_INDIRECT + NUM_INDIRECT * NUM_INDIRECT {
            errors.push(format!("header {sector}: too many sectors"));
            return header;
        }
        for s in header.referenced_sectors() {
            Self::check_sector(s, shadow, errors);
        }
        header
    }

    fn check_directory(
        &self,
        sector: u32,
        shadow: &mut crate::util::Bitmap,
        errors: &mut Vec<String>,
    ) {
        let mut dir = Directory::new();
        if dir.fetch_from(&OpenFile::raw(sector as usize)).is_err() {
            errors.push(format!("directory {sector}: unreadable"));
            return;
        }
        let mut seen: Vec<String> = Vec::new();
        for entry in dir.entries().iter().filter(|e| e.in_use) {
            let name = entry.name().to_string();
            if name.len() > super::FILE_NAME_MAX_LEN {
                errors.push(format!("directory {sector}: name too long"));
            }
            if seen.contains(&name) {
                errors.push(format!("directory {sector}: duplicate name {name}"));
            } else {
                seen.push(name);
            }
            Self::check_sector(entry.sector, shadow, errors);
            self.check_header(entry.sector, shadow, errors);
            if entry.is_dir {
                self.check_directory(entry.sector, shadow, errors);
            }
        }
    }

    /// Walk every reachable structure and verify the invariants: no sector
    /// referenced twice, the shadow map equal to the persisted free map, no
    /// duplicate names, header sizes consistent. Returns true when the
    /// image is clean.
    pub fn check(&self) -> bool {
        trace!('f', "running the consistency check");
        let mut errors = Vec::new();
        let mut shadow = crate::util::Bitmap::new(mirage::NUM_SECTORS);
        shadow.mark(FREE_MAP_SECTOR);
        shadow.mark(DIRECTORY_SECTOR);

        let map_header = self.check_header(FREE_MAP_SECTOR as u32, &mut shadow, &mut errors);
        if map_header.file_length() != FREE_MAP_FILE_SIZE {
            errors.push("free-map file has the wrong size".to_string());
        }
        self.check_header(DIRECTORY_SECTOR as u32, &mut shadow, &mut errors);
        self.check_directory(DIRECTORY_SECTOR as u32, &mut shadow, &mut errors);

        let fm_guard = self.free_map_lock.acquire();
        let free_map = self.fetch_free_map();
        drop(fm_guard);
        for sector in 0..mirage::NUM_SECTORS {
            if free_map.test(sector) != shadow.test(sector) {
                errors.push(format!(
                    "free map disagrees about sector {} (map {}, reachable {})",
                    sector,
                    free_map.test(sector),
                    shadow.test(sector)
                ));
            }
        }

        for error in &errors {
            mirage::println!("check: {}", error);
        }
        errors.is_empty()
    }

    /// Debug dump: both well-known headers and the root listing.
    pub fn print(&self) {
        let map_header = FileHeader::fetch_from(FREE_MAP_SECTOR);
        mirage::println!(
            "free map: {} bytes in {} sectors",
            map_header.file_length(),
            map_header.num_sectors()
        );
        let fm_guard = self.free_map_lock.acquire();
        let free_map = self.fetch_free_map();
        drop(fm_guard);
        free_map.print();
        let mut root = Directory::new();
        if root.fetch_from(&self.directory_file).is_ok() {
            mirage::println!("root directory:");
            root.list();
        }
    }
}
