//! Safe transfer between kernel and user memory.
//!
//! Every byte moves through the MMU one at a time, so a transfer can fault
//! mid-way exactly like user code would — the fault handler pages the
//! address in and the access is retried. A bounded number of retries
//! tolerates the page being evicted between the fault service and the
//! retry; past the bound the address is treated as bad.

use std::sync::atomic::Ordering;

use mirage::mmu;

use crate::thread;

/// Retries per byte before giving up on an address.
pub const MAX_MMU_RETRIES: usize = 4;

/// While alive, marks the current thread as mid-transfer: a fault the VM
/// layer cannot service fails the access (and ultimately the syscall)
/// instead of killing the process. Restores the previous state so nested
/// transfers compose.
struct TolerantFaults {
    previous: bool,
}

impl TolerantFaults {
    fn new() -> Self {
        let previous = thread::with_current(|th| {
            th.tolerate_bad_faults.swap(true, Ordering::SeqCst)
        });
        Self { previous }
    }
}

impl Drop for TolerantFaults {
    fn drop(&mut self) {
        thread::with_current(|th| {
            th.tolerate_bad_faults.store(self.previous, Ordering::SeqCst)
        });
    }
}

fn read_user_byte(addr: usize) -> Option<u8> {
    for _ in 0..MAX_MMU_RETRIES {
        if let Ok(v) = mmu::read_mem(addr, 1) {
            return Some(v as u8);
        }
    }
    None
}

fn write_user_byte(addr: usize, value: u8) -> bool {
    for _ in 0..MAX_MMU_RETRIES {
        if mmu::write_mem(addr, 1, value as u32).is_ok() {
            return true;
        }
    }
    false
}

fn read_user_word(addr: usize) -> Option<u32> {
    for _ in 0..MAX_MMU_RETRIES {
        if let Ok(v) = mmu::read_mem(addr, 4) {
            return Some(v);
        }
    }
    None
}

/// Copy `out.len()` bytes from user address `addr`.
pub fn read_buffer_from_user(addr: usize, out: &mut [u8]) -> bool {
    let _tolerant = TolerantFaults::new();
    for (i, byte) in out.iter_mut().enumerate() {
        match read_user_byte(addr + i) {
            Some(v) => *byte = v,
            None => return false,
        }
    }
    true
}

/// Read a NUL-terminated string of at most `max_len` bytes from user
/// address `addr`. `None` if the string is unterminated within the bound,
/// not valid UTF-8, or the address goes bad.
pub fn read_string_from_user(addr: usize, max_len: usize) -> Option<String> {
    let _tolerant = TolerantFaults::new();
    let mut bytes = Vec::new();
    for i in 0..=max_len {
        match read_user_byte(addr + i)? {
            0 => return String::from_utf8(bytes).ok(),
            b => bytes.push(b),
        }
    }
    // Never saw the NUL: not well-formed.
    None
}

/// Copy `buf` to user address `addr`.
pub fn write_buffer_to_user(buf: &[u8], addr: usize) -> bool {
    let _tolerant = TolerantFaults::new();
    buf.iter()
        .enumerate()
        .all(|(i, b)| write_user_byte(addr + i, *b))
}

/// Copy `s` and a terminating NUL to user address `addr`.
pub fn write_string_to_user(s: &str, addr: usize) -> bool {
    let _tolerant = TolerantFaults::new();
    write_buffer_to_user(s.as_bytes(), addr) && write_user_byte(addr + s.len(), 0)
}

/// Snapshot an `argv` vector (a NUL-terminated array of string pointers)
/// out of the current address space, before Exec replaces it.
pub fn save_args(argv_addr: usize) -> Option<Vec<String>> {
    const MAX_ARGS: usize = 32;
    let _tolerant = TolerantFaults::new();
    let mut args = Vec::new();
    for i in 0..MAX_ARGS {
        let ptr = read_user_word(argv_addr + i * 4)? as usize;
        if ptr == 0 {
            return Some(args);
        }
        args.push(read_string_from_user(ptr, super::MAX_PATH_LEN)?);
    }
    None
}

/// Lay `args` out on the new program's stack: string bytes first, then the
/// aligned pointer array. Leaves the stack register at the pointer array
/// and returns `argc`; the caller passes the array address as `argv`.
pub fn write_args(args: &[String]) -> Option<u32> {
    let mut sp = mirage::cpu::read_register(mirage::cpu::STACK_REG) as usize;
    let mut pointers = Vec::with_capacity(args.len());
    for arg in args {
        sp -= arg.len() + 1;
        if !write_string_to_user(arg, sp) {
            return None;
        }
        pointers.push(sp as u32);
    }
    sp &= !3;
    sp -= 4 * (args.len() + 1);
    for (i, ptr) in pointers.iter().enumerate() {
        if !write_buffer_to_user(&ptr.to_le_bytes(), sp + i * 4) {
            return None;
        }
    }
    if !write_buffer_to_user(&0u32.to_le_bytes(), sp + 4 * args.len()) {
        return None;
    }
    mirage::cpu::write_register(mirage::cpu::STACK_REG, sp as u32);
    Some(args.len() as u32)
}
