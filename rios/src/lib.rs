//! # RIOS: an instructional operating system kernel.
//!
//! RIOS runs simulated user programs on the simulated machine provided by
//! the [`mirage`] crate. It exists to demonstrate three tightly coupled
//! systems problems and the layers they rest on:
//!
//! * a multilevel on-disk **filesystem** with hierarchical directories,
//!   dynamically extensible files, free-space management and
//!   reference-counted open-file tracking ([`fs`]);
//! * a demand-paged **virtual-memory** subsystem with TLB management, lazy
//!   loading from the executable, and swap-to-disk eviction under memory
//!   pressure ([`vm`]);
//! * the **thread and synchronization** layer both of them are built from
//!   ([`thread`], [`sync`]).
//!
//! User programs reach the kernel through the syscall and exception
//! dispatch in [`userprog`]. The [`system`] module owns the well-known
//! kernel singletons and the boot sequence.
//!
//! The interlocking is deliberate: the swap file is an ordinary file in the
//! filesystem, the filesystem serializes itself with reader/writer locks
//! built from semaphores, and the semaphores are the only code in the
//! kernel that touches the machine's interrupt state directly.

#![allow(static_mut_refs)]

pub mod fs;
pub mod sync;
pub mod system;
pub mod thread;
pub mod userprog;
pub mod util;
pub mod vm;

/// Errors a kernel operation can produce.
///
/// Layers L0 through L4 report failure through these variants (or plain
/// `bool`/`Option` where the original interface did); the syscall layer
/// folds every one of them into a `-1` return to user space.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// No such file or directory.
    NoSuchEntry,
    /// An entry with this name already exists.
    FileExist,
    /// Path component is not a directory, or a file op hit a directory.
    NotDirectory,
    /// The operation needs a regular file but found a directory.
    IsDirectory,
    /// Directory being removed still has entries.
    DirectoryNotEmpty,
    /// No free sectors (or frames) left.
    NoSpace,
    /// File is tombstoned: removed while open, awaiting last close.
    Tombstoned,
    /// Bad file descriptor.
    BadFileDescriptor,
    /// A user pointer did not survive translation.
    BadAddress,
    /// Malformed argument (empty path, name too long, bad UTF-8).
    InvalidArgument,
    /// The named file is not a valid executable image.
    NoExec,
    /// Too many open files for this process.
    TooManyOpenFile,
    /// The on-disk image is inconsistent.
    FilesystemCorrupted(&'static str),
}

impl KernelError {
    /// The value returned to user space for this error. Every failure is
    /// `-1` at the syscall boundary; the variant only matters inside the
    /// kernel.
    pub fn into_syscall_ret(self) -> i32 {
        -1
    }
}
