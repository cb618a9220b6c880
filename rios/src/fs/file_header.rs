//! File headers (inodes).
//!
//! A file header maps file offsets to disk sectors through three tiers:
//! [`NUM_DIRECT`] direct slots, one single-indirect block of
//! [`NUM_INDIRECT`] slots, and one double-indirect block whose slots each
//! name a child indirection block of [`NUM_INDIRECT`] data slots. The
//! serialized header is exactly one sector; indirection blocks are one
//! sector each.
//!
//! The in-memory [`FileHeader`] caches the whole indirection tree alongside
//! the root, and [`write_back`](FileHeader::write_back) persists it leaves
//! first — child blocks, then the double-indirect block, then the
//! single-indirect block, then the root — so a torn write-back cannot leave
//! a root that points at unwritten children. (Crash consistency is not a
//! goal; the ordering just narrows the window.)
//!
//! Allocation never shrinks a file: [`extend`](FileHeader::extend) is
//! monotonic-grow only, reuses slack in the last allocated sector, and
//! promotes direct → single-indirect → double-indirect lazily.

use mirage::SECTOR_SIZE;

use crate::util::Bitmap;

use super::{MAX_FILE_SIZE, NUM_DIRECT, NUM_INDIRECT};

/// Sentinel for "no indirection block".
const NONE: i32 = -1;

/// The on-disk root of a header: sizes, direct slots, two indirection
/// pointers. Exactly [`SECTOR_SIZE`] bytes serialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFileHeader {
    /// File length in bytes.
    pub num_bytes: u32,
    /// Data sectors allocated; always `ceil(num_bytes / SECTOR_SIZE)`.
    pub num_sectors: u32,
    /// Direct data-sector slots.
    pub data_sectors: [u32; NUM_DIRECT],
    /// Sector of the single-indirect block, or -1.
    pub single_indirection: i32,
    /// Sector of the double-indirect block, or -1.
    pub double_indirection: i32,
}

impl RawFileHeader {
    fn new() -> Self {
        Self {
            num_bytes: 0,
            num_sectors: 0,
            data_sectors: [0; NUM_DIRECT],
            single_indirection: NONE,
            double_indirection: NONE,
        }
    }

    fn to_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0..4].copy_from_slice(&self.num_bytes.to_le_bytes());
        buf[4..8].copy_from_slice(&self.num_sectors.to_le_bytes());
        for (i, s) in self.data_sectors.iter().enumerate() {
            let at = 8 + i * 4;
            buf[at..at + 4].copy_from_slice(&s.to_le_bytes());
        }
        let at = 8 + NUM_DIRECT * 4;
        buf[at..at + 4].copy_from_slice(&self.single_indirection.to_le_bytes());
        buf[at + 4..at + 8].copy_from_slice(&self.double_indirection.to_le_bytes());
        buf
    }

    fn from_sector(buf: &[u8; SECTOR_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        let mut data_sectors = [0u32; NUM_DIRECT];
        for (i, s) in data_sectors.iter_mut().enumerate() {
            *s = word(8 + i * 4);
        }
        let at = 8 + NUM_DIRECT * 4;
        Self {
            num_bytes: word(0),
            num_sectors: word(4),
            data_sectors,
            single_indirection: word(at) as i32,
            double_indirection: word(at + 4) as i32,
        }
    }
}

/// One indirection block: a sector full of data-sector indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndirectBlock {
    /// Slot `i` holds the sector of the block's `i`-th child.
    pub data_sectors: [u32; NUM_INDIRECT],
}

impl IndirectBlock {
    fn new() -> Self {
        Self {
            data_sectors: [0; NUM_INDIRECT],
        }
    }

    fn to_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        for (i, s) in self.data_sectors.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&s.to_le_bytes());
        }
        buf
    }

    fn from_sector(buf: &[u8; SECTOR_SIZE]) -> Self {
        let mut block = Self::new();
        for (i, s) in block.data_sectors.iter_mut().enumerate() {
            *s = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        }
        block
    }
}

/// In-memory view of one file's sector map.
pub struct FileHeader {
    raw: RawFileHeader,
    single: IndirectBlock,
    double: IndirectBlock,
    double_blocks: Vec<IndirectBlock>,
}

impl FileHeader {
    /// An empty header for a file about to be allocated.
    pub fn new() -> Self {
        Self {
            raw: RawFileHeader::new(),
            single: IndirectBlock::new(),
            double: IndirectBlock::new(),
            double_blocks: Vec::new(),
        }
    }

    /// File length in bytes.
    pub fn file_length(&self) -> usize {
        self.raw.num_bytes as usize
    }

    /// Allocated data sectors.
    pub fn num_sectors(&self) -> usize {
        self.raw.num_sectors as usize
    }

    /// The serialized root, for the consistency checker.
    pub fn raw(&self) -> &RawFileHeader {
        &self.raw
    }

    /// Indirection blocks currently needed to map `sectors` data sectors.
    fn indirection_blocks_for(sectors: usize) -> usize {
        let mut blocks = 0;
        if sectors > NUM_DIRECT {
            blocks += 1;
        }
        if sectors > NUM_DIRECT + NUM_INDIRECT {
            blocks += 1 + (sectors - NUM_DIRECT - NUM_INDIRECT).div_ceil(NUM_INDIRECT);
        }
        blocks
    }

    fn current_indirection_blocks(&self) -> usize {
        let mut blocks = 0;
        if self.raw.single_indirection != NONE {
            blocks += 1;
        }
        if self.raw.double_indirection != NONE {
            blocks += 1 + self.double_blocks.len();
        }
        blocks
    }

    /// Record `sector` as data sector number `index`, allocating whatever
    /// indirection blocks the slot needs. Data sectors must be placed in
    /// file order.
    fn place(&mut self, index: usize, sector: u32, free_map: &mut Bitmap) {
        if index < NUM_DIRECT {
            self.raw.data_sectors[index] = sector;
            return;
        }
        let index = index - NUM_DIRECT;
        if index < NUM_INDIRECT {
            if self.raw.single_indirection == NONE {
                self.raw.single_indirection = free_map.find().unwrap() as i32;
            }
            self.single.data_sectors[index] = sector;
            return;
        }
        let index = index - NUM_INDIRECT;
        if self.raw.double_indirection == NONE {
            self.raw.double_indirection = free_map.find().unwrap() as i32;
        }
        let child = index / NUM_INDIRECT;
        if child == self.double_blocks.len() {
            self.double.data_sectors[child] = free_map.find().unwrap() as u32;
            self.double_blocks.push(IndirectBlock::new());
        }
        self.double_blocks[child].data_sectors[index % NUM_INDIRECT] = sector;
    }

    /// Initialize a fresh header for a file of `file_size` bytes, taking
    /// data and indirection sectors from `free_map`.
    ///
    /// Returns false — with no state changed and no bits taken — if the
    /// size exceeds [`MAX_FILE_SIZE`] or the map has too few free sectors.
    pub fn allocate(&mut self, free_map: &mut Bitmap, file_size: usize) -> bool {
        assert_eq!(self.raw.num_sectors, 0, "allocate on a populated header");
        if file_size > MAX_FILE_SIZE {
            return false;
        }
        let num_sectors = file_size.div_ceil(SECTOR_SIZE);
        if free_map.count_clear() < num_sectors + Self::indirection_blocks_for(num_sectors) {
            return false;
        }
        self.raw.num_bytes = file_size as u32;
        self.raw.num_sectors = num_sectors as u32;
        for i in 0..num_sectors {
            let sector = free_map.find().unwrap();
            self.place(i, sector as u32, free_map);
        }
        true
    }

    /// Grow the file to `new_size` bytes. Monotonic: shrinking fails.
    ///
    /// Slack in the last allocated sector is reused before anything is
    /// taken from `free_map`; on any failure neither the header nor the
    /// map changes.
    pub fn extend(&mut self, free_map: &mut Bitmap, new_size: usize) -> bool {
        if new_size < self.raw.num_bytes as usize || new_size > MAX_FILE_SIZE {
            return false;
        }
        if new_size <= self.raw.num_sectors as usize * SECTOR_SIZE {
            self.raw.num_bytes = new_size as u32;
            return true;
        }
        let old_sectors = self.raw.num_sectors as usize;
        let new_sectors = new_size.div_ceil(SECTOR_SIZE);
        let headers_needed =
            Self::indirection_blocks_for(new_sectors) - self.current_indirection_blocks();
        if free_map.count_clear() < (new_sectors - old_sectors) + headers_needed {
            return false;
        }
        for i in old_sectors..new_sectors {
            let sector = free_map.find().unwrap();
            self.place(i, sector as u32, free_map);
        }
        self.raw.num_bytes = new_size as u32;
        self.raw.num_sectors = new_sectors as u32;
        true
    }

    /// Return every sector this header references, data and indirection
    /// alike, in file order with indirection blocks interleaved where they
    /// are first needed.
    pub fn referenced_sectors(&self) -> Vec<u32> {
        let mut sectors = Vec::new();
        let n = self.raw.num_sectors as usize;
        sectors.extend_from_slice(&self.raw.data_sectors[..n.min(NUM_DIRECT)]);
        if n > NUM_DIRECT {
            sectors.push(self.raw.single_indirection as u32);
            let in_single = (n - NUM_DIRECT).min(NUM_INDIRECT);
            sectors.extend_from_slice(&self.single.data_sectors[..in_single]);
        }
        if n > NUM_DIRECT + NUM_INDIRECT {
            sectors.push(self.raw.double_indirection as u32);
            let mut remaining = n - NUM_DIRECT - NUM_INDIRECT;
            for (child, block) in self.double_blocks.iter().enumerate() {
                sectors.push(self.double.data_sectors[child]);
                let here = remaining.min(NUM_INDIRECT);
                sectors.extend_from_slice(&block.data_sectors[..here]);
                remaining -= here;
            }
        }
        sectors
    }

    /// Return every sector to `free_map`. Each must currently be marked
    /// used; a clear bit here means the map and the header disagree, which
    /// is a kernel bug.
    pub fn deallocate(&mut self, free_map: &mut Bitmap) {
        for sector in self.referenced_sectors() {
            assert!(
                free_map.test(sector as usize),
                "freeing sector {sector} that was not marked used"
            );
            free_map.clear(sector as usize);
        }
    }

    /// The sector holding the byte at `offset`.
    pub fn byte_to_sector(&self, offset: usize) -> usize {
        assert!(offset < self.raw.num_bytes as usize);
        let index = offset / SECTOR_SIZE;
        if index < NUM_DIRECT {
            return self.raw.data_sectors[index] as usize;
        }
        let index = index - NUM_DIRECT;
        if index < NUM_INDIRECT {
            return self.single.data_sectors[index] as usize;
        }
        let index = index - NUM_INDIRECT;
        self.double_blocks[index / NUM_INDIRECT].data_sectors[index % NUM_INDIRECT] as usize
    }

    /// Read the header and its indirection tree from disk.
    pub fn fetch_from(sector: usize) -> Self {
        let disk = crate::system::synch_disk();
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_sector(sector, &mut buf);
        let raw = RawFileHeader::from_sector(&buf);
        let mut header = Self {
            raw,
            single: IndirectBlock::new(),
            double: IndirectBlock::new(),
            double_blocks: Vec::new(),
        };
        if header.raw.single_indirection != NONE {
            disk.read_sector(header.raw.single_indirection as usize, &mut buf);
            header.single = IndirectBlock::from_sector(&buf);
        }
        if header.raw.double_indirection != NONE {
            disk.read_sector(header.raw.double_indirection as usize, &mut buf);
            header.double = IndirectBlock::from_sector(&buf);
            let children = (header.raw.num_sectors as usize - NUM_DIRECT - NUM_INDIRECT)
                .div_ceil(NUM_INDIRECT)
                .min(NUM_INDIRECT);
            for child in 0..children {
                disk.read_sector(header.double.data_sectors[child] as usize, &mut buf);
                header.double_blocks.push(IndirectBlock::from_sector(&buf));
            }
        }
        header
    }

    /// Persist the header and its indirection tree, leaves first.
    pub fn write_back(&self, sector: usize) {
        let disk = crate::system::synch_disk();
        if self.raw.double_indirection != NONE {
            for (child, block) in self.double_blocks.iter().enumerate() {
                disk.write_sector(self.double.data_sectors[child] as usize, &block.to_sector());
            }
            disk.write_sector(self.raw.double_indirection as usize, &self.double.to_sector());
        }
        if self.raw.single_indirection != NONE {
            disk.write_sector(self.raw.single_indirection as usize, &self.single.to_sector());
        }
        disk.write_sector(sector, &self.raw.to_sector());
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage::NUM_SECTORS;

    fn fresh_map() -> Bitmap {
        Bitmap::new(NUM_SECTORS)
    }

    #[test]
    fn allocate_direct_only() {
        let mut map = fresh_map();
        let mut hdr = FileHeader::new();
        assert!(hdr.allocate(&mut map, 3 * SECTOR_SIZE));
        assert_eq!(hdr.num_sectors(), 3);
        assert_eq!(hdr.raw().single_indirection, -1);
        assert_eq!(map.count_clear(), NUM_SECTORS - 3);
    }

    #[test]
    fn allocate_spills_into_single_indirection() {
        let mut map = fresh_map();
        let mut hdr = FileHeader::new();
        let sectors = NUM_DIRECT + 1;
        assert!(hdr.allocate(&mut map, sectors * SECTOR_SIZE));
        assert_ne!(hdr.raw().single_indirection, -1);
        assert_eq!(hdr.raw().double_indirection, -1);
        // Data sectors plus the indirection block itself.
        assert_eq!(map.count_clear(), NUM_SECTORS - sectors - 1);
    }

    #[test]
    fn allocate_spills_into_double_indirection() {
        let mut map = fresh_map();
        let mut hdr = FileHeader::new();
        let sectors = NUM_DIRECT + NUM_INDIRECT + NUM_INDIRECT + 3;
        assert!(hdr.allocate(&mut map, sectors * SECTOR_SIZE));
        assert_ne!(hdr.raw().double_indirection, -1);
        // single + double + two children.
        assert_eq!(map.count_clear(), NUM_SECTORS - sectors - 4);
        // Every mapped offset translates without touching another file's
        // sectors.
        let all = hdr.referenced_sectors();
        assert_eq!(all.len(), sectors + 4);
        let mut sorted = all.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), all.len(), "duplicate sector in header");
    }

    #[test]
    fn max_file_size_is_the_boundary() {
        // MAX_FILE_SIZE needs more sectors than the simulated disk has, so
        // exercise the boundary on an oversized map.
        let mut map = Bitmap::new(2048);
        let mut hdr = FileHeader::new();
        assert!(hdr.allocate(&mut map, MAX_FILE_SIZE));
        assert_eq!(hdr.file_length(), MAX_FILE_SIZE);
        assert_eq!(
            hdr.num_sectors(),
            NUM_DIRECT + NUM_INDIRECT + NUM_INDIRECT * NUM_INDIRECT
        );

        let mut map = fresh_map();
        let mut hdr = FileHeader::new();
        assert!(!hdr.allocate(&mut map, MAX_FILE_SIZE + 1));
        assert_eq!(map.count_clear(), NUM_SECTORS);
        assert_eq!(hdr.num_sectors(), 0);
    }

    #[test]
    fn allocate_then_deallocate_restores_the_map() {
        let mut map = fresh_map();
        map.mark(0);
        map.mark(1);
        let before = map.clone();
        let mut hdr = FileHeader::new();
        assert!(hdr.allocate(&mut map, (NUM_DIRECT + NUM_INDIRECT + 5) * SECTOR_SIZE));
        hdr.deallocate(&mut map);
        assert_eq!(map, before);
    }

    #[test]
    fn extend_within_slack_allocates_nothing() {
        let mut map = fresh_map();
        let mut hdr = FileHeader::new();
        assert!(hdr.allocate(&mut map, SECTOR_SIZE / 2));
        let clear = map.count_clear();
        assert!(hdr.extend(&mut map, SECTOR_SIZE));
        assert_eq!(map.count_clear(), clear);
        assert_eq!(hdr.file_length(), SECTOR_SIZE);
        assert_eq!(hdr.num_sectors(), 1);
    }

    #[test]
    fn extend_refuses_to_shrink() {
        let mut map = fresh_map();
        let mut hdr = FileHeader::new();
        assert!(hdr.allocate(&mut map, 2 * SECTOR_SIZE));
        assert!(!hdr.extend(&mut map, SECTOR_SIZE));
        assert_eq!(hdr.file_length(), 2 * SECTOR_SIZE);
    }

    #[test]
    fn extend_promotes_across_levels() {
        let mut map = fresh_map();
        let mut hdr = FileHeader::new();
        assert!(hdr.allocate(&mut map, 0));
        assert!(hdr.extend(&mut map, NUM_DIRECT * SECTOR_SIZE));
        assert_eq!(hdr.raw().single_indirection, -1);
        assert!(hdr.extend(&mut map, (NUM_DIRECT + 1) * SECTOR_SIZE));
        assert_ne!(hdr.raw().single_indirection, -1);
        assert_eq!(hdr.raw().double_indirection, -1);
        assert!(hdr.extend(&mut map, (NUM_DIRECT + NUM_INDIRECT + 1) * SECTOR_SIZE));
        assert_ne!(hdr.raw().double_indirection, -1);
        // Offsets across all three levels translate consistently.
        for index in [0, NUM_DIRECT, NUM_DIRECT + NUM_INDIRECT] {
            let sector = hdr.byte_to_sector(index * SECTOR_SIZE);
            assert!(map.test(sector));
        }
    }

    #[test]
    fn extend_fails_cleanly_when_the_map_is_tight() {
        let mut map = Bitmap::new(32);
        let mut hdr = FileHeader::new();
        assert!(hdr.allocate(&mut map, 30 * SECTOR_SIZE));
        let before_len = hdr.file_length();
        let before_clear = map.count_clear();
        assert!(!hdr.extend(&mut map, 40 * SECTOR_SIZE));
        assert_eq!(hdr.file_length(), before_len);
        assert_eq!(map.count_clear(), before_clear);
    }
}
