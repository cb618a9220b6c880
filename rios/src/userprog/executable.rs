//! Executable images.
//!
//! The object format is the traditional teaching-OS one: a fixed header —
//! magic word, then code, initialized-data and uninitialized-data segments,
//! each described by `{ virtual address, file offset, size }` — followed by
//! the raw segment bytes. The user-space compiler and linker that produce
//! these images live outside the kernel; [`build_image`] assembles one
//! in-process for the simulator's utilities and the tests.

use std::sync::Arc;

use crate::fs::OpenFile;
use crate::KernelError;

/// Magic word opening every valid image.
pub const NOFF_MAGIC: u32 = 0x00ba_dfad;

/// Serialized header size.
pub const HEADER_SIZE: usize = 4 + 3 * 12;

/// One segment of an executable.
#[derive(Clone, Copy, Debug, Default)]
pub struct Segment {
    /// Where the segment lives in the user address space.
    pub virtual_addr: u32,
    /// Where its bytes start in the file (0 for uninitialized data).
    pub in_file_addr: u32,
    /// Segment length in bytes.
    pub size: u32,
}

impl Segment {
    fn from_bytes(buf: &[u8]) -> Self {
        let word = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        Self {
            virtual_addr: word(0),
            in_file_addr: word(4),
            size: word(8),
        }
    }

    fn to_bytes(self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.virtual_addr.to_le_bytes());
        buf[4..8].copy_from_slice(&self.in_file_addr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// The intersection of this segment with `[start, end)` in virtual
    /// addresses, as `(virtual start, length)`.
    pub fn intersect(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        let seg_start = self.virtual_addr as usize;
        let seg_end = seg_start + self.size as usize;
        let lo = start.max(seg_start);
        let hi = end.min(seg_end);
        (lo < hi).then_some((lo, hi - lo))
    }
}

/// An executable file with its parsed header.
pub struct Executable {
    file: Arc<OpenFile>,
    code: Segment,
    init_data: Segment,
    uninit_data: Segment,
}

impl Executable {
    /// Parse the header of `file`. Fails with [`KernelError::NoExec`] when
    /// the magic does not match.
    pub fn parse(file: Arc<OpenFile>) -> Result<Self, KernelError> {
        let mut buf = [0u8; HEADER_SIZE];
        if file.read_at(&mut buf, 0) != HEADER_SIZE {
            return Err(KernelError::NoExec);
        }
        if u32::from_le_bytes(buf[0..4].try_into().unwrap()) != NOFF_MAGIC {
            return Err(KernelError::NoExec);
        }
        Ok(Self {
            file,
            code: Segment::from_bytes(&buf[4..16]),
            init_data: Segment::from_bytes(&buf[16..28]),
            uninit_data: Segment::from_bytes(&buf[28..40]),
        })
    }

    /// The backing file.
    pub fn file(&self) -> &Arc<OpenFile> {
        &self.file
    }

    /// The code segment.
    pub fn code(&self) -> Segment {
        self.code
    }

    /// The initialized-data segment.
    pub fn init_data(&self) -> Segment {
        self.init_data
    }

    /// Bytes of user address space the image needs, before the stack.
    pub fn size(&self) -> usize {
        [self.code, self.init_data, self.uninit_data]
            .iter()
            .map(|s| s.virtual_addr as usize + s.size as usize)
            .max()
            .unwrap()
    }

    /// Read `buf.len()` bytes of `segment` starting at `offset` within it.
    pub fn read_segment(&self, segment: Segment, buf: &mut [u8], offset: usize) -> usize {
        debug_assert!(offset + buf.len() <= segment.size as usize);
        self.file
            .read_at(buf, segment.in_file_addr as usize + offset)
    }
}

/// Assemble an image: `code` at virtual address 0, `init_data` directly
/// after it, `uninit_size` bytes of zero-fill after that.
pub fn build_image(code: &[u8], init_data: &[u8], uninit_size: u32) -> Vec<u8> {
    let code_seg = Segment {
        virtual_addr: 0,
        in_file_addr: HEADER_SIZE as u32,
        size: code.len() as u32,
    };
    let data_seg = Segment {
        virtual_addr: code.len() as u32,
        in_file_addr: (HEADER_SIZE + code.len()) as u32,
        size: init_data.len() as u32,
    };
    let uninit_seg = Segment {
        virtual_addr: (code.len() + init_data.len()) as u32,
        in_file_addr: 0,
        size: uninit_size,
    };
    let mut image = Vec::with_capacity(HEADER_SIZE + code.len() + init_data.len());
    image.extend_from_slice(&NOFF_MAGIC.to_le_bytes());
    image.extend_from_slice(&code_seg.to_bytes());
    image.extend_from_slice(&data_seg.to_bytes());
    image.extend_from_slice(&uninit_seg.to_bytes());
    image.extend_from_slice(code);
    image.extend_from_slice(init_data);
    image
}

/// Encode `words` as the little-endian instruction stream the simulated
/// CPU fetches. Tests and the simulator's built-in programs hand-assemble
/// with this.
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
