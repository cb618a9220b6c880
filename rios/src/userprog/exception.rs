//! Syscall and exception dispatch.
//!
//! Every user-mode trap lands here, vectored by exception kind:
//!
//! * **Syscall** — id in r2, arguments in r4..r7, result back in r2, and
//!   the PC advanced past the trapping instruction so it is not re-taken.
//! * **Page fault** — the faulting address is paged in through the current
//!   space, the fresh translation goes into the TLB slot picked by a FIFO
//!   cursor, and the frame's recency is refreshed. The PC is left alone so
//!   the instruction retries.
//! * **Read-only violation** — the process is terminated with status -1.
//! * Everything else is a kernel bug or an unrunnable program, and fatal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mirage::cpu::{self, ExceptionKind};
use mirage::{mmu, stats, trace};

use crate::thread::scheduler::scheduler;
use crate::thread::{self, Current, ThreadBuilder};
use crate::vm::AddressSpace;

use super::transfer;
use super::{processes, ProcessRecord, MAX_PATH_LEN};

/// Descriptor 0: console input.
pub const CONSOLE_INPUT: i32 = 0;
/// Descriptor 1: console output.
pub const CONSOLE_OUTPUT: i32 = 1;

/// Syscall identifiers, in ABI order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Syscall {
    /// Shut the machine down cleanly.
    Halt = 0,
    /// Terminate the current process.
    Exit = 1,
    /// Load an executable and run it in a new process.
    Exec = 2,
    /// Wait for a process started with Exec.
    Join = 3,
    /// Create a zero-length file.
    Create = 4,
    /// Remove a file or empty directory.
    Remove = 5,
    /// Open a file, returning a descriptor.
    Open = 6,
    /// Release a descriptor.
    Close = 7,
    /// Read from a descriptor.
    Read = 8,
    /// Write to a descriptor.
    Write = 9,
    /// Dump scheduler state.
    Ps = 10,
}

impl TryFrom<u32> for Syscall {
    type Error = u32;

    fn try_from(id: u32) -> Result<Self, u32> {
        Ok(match id {
            0 => Syscall::Halt,
            1 => Syscall::Exit,
            2 => Syscall::Exec,
            3 => Syscall::Join,
            4 => Syscall::Create,
            5 => Syscall::Remove,
            6 => Syscall::Open,
            7 => Syscall::Close,
            8 => Syscall::Read,
            9 => Syscall::Write,
            10 => Syscall::Ps,
            other => return Err(other),
        })
    }
}

/// Install the kernel's handlers into the CPU's vector table. Called once
/// per boot.
pub fn init() {
    cpu::set_handler(ExceptionKind::Syscall, syscall_handler);
    cpu::set_handler(ExceptionKind::PageFault, page_fault_handler);
    cpu::set_handler(ExceptionKind::ReadOnly, read_only_handler);
    cpu::set_handler(ExceptionKind::BusError, fatal_handler);
    cpu::set_handler(ExceptionKind::AddressError, fatal_handler);
    cpu::set_handler(ExceptionKind::Overflow, fatal_handler);
    cpu::set_handler(ExceptionKind::IllegalInstruction, fatal_handler);
    TLB_CURSOR.store(0, Ordering::SeqCst);
}

static TLB_CURSOR: AtomicUsize = AtomicUsize::new(0);

fn current_space() -> Option<Arc<AddressSpace>> {
    thread::with_current(|th| {
        let g = th.space.lock();
        let s = g.clone();
        g.unlock();
        s
    })
}

fn page_fault_handler(_kind: ExceptionKind) {
    let vaddr = cpu::read_register(cpu::BAD_VADDR_REG) as usize;
    let Some(space) = current_space() else {
        panic!("page fault at {vaddr:#x} with no address space");
    };
    let entry = match space.load_page(vaddr) {
        Ok(entry) => entry,
        Err(_) => {
            trace!('e', "page fault outside the space at {:#x}", vaddr);
            // During a kernel transfer the failure belongs to the access,
            // which will give up after its bounded retries; a user-mode
            // reference this far out kills the process.
            let tolerated = thread::with_current(|th| {
                th.tolerate_bad_faults.load(Ordering::SeqCst)
            });
            if tolerated {
                return;
            }
            Current::exit(-1);
        }
    };
    // FIFO victim selection over the TLB slots.
    let slot = TLB_CURSOR.fetch_add(1, Ordering::SeqCst) % mirage::TLB_SIZE;
    mmu::set_tlb_entry(slot, entry);
    crate::system::coremap().touch(entry.physical_page);
    stats::add_page_fault(1);
    // No PC advance: the faulting instruction retries.
}

fn read_only_handler(_kind: ExceptionKind) {
    trace!('e', "write to a read-only page; killing the process");
    Current::exit(-1);
}

fn fatal_handler(kind: ExceptionKind) {
    panic!(
        "unexpected user-mode exception {:?} (bad vaddr {:#x})",
        kind,
        cpu::read_register(cpu::BAD_VADDR_REG)
    );
}

/// Run a freshly Exec'd program: registers at the image entry, arguments
/// on the stack, then into the interpreter for good.
fn run_program(space: Arc<AddressSpace>, args: Vec<String>) {
    space.init_registers();
    space.restore_state();
    if !args.is_empty() {
        if let Some(argc) = transfer::write_args(&args) {
            let argv_addr = cpu::read_register(cpu::STACK_REG);
            cpu::write_register(cpu::SYSCALL_ARG_REG, argc);
            cpu::write_register(cpu::SYSCALL_ARG_REG + 1, argv_addr);
            // Convention slack below the argument block.
            cpu::write_register(cpu::STACK_REG, argv_addr - 24);
        } else {
            Current::exit(-1);
        }
    }
    cpu::run();
}

/// The Exec syscall body, shared with the simulator's `-x` option.
pub fn exec(path: &str, args: Vec<String>, enable_join: bool) -> Result<usize, crate::KernelError> {
    let fs = crate::system::file_system();
    let file = fs.open(path)?;
    let space_id = super::next_space_id();
    let space = match AddressSpace::new(file.clone(), space_id) {
        Ok(space) => Arc::new(space),
        Err(e) => {
            fs.close_handle(&file);
            return Err(e);
        }
    };
    trace!('e', "exec {} as space {}", path, space_id);
    let priority = thread::current().effective_priority();
    let handle = ThreadBuilder::new(path)
        .priority(priority)
        .attach_space(space.clone())
        .spawn(move || run_program(space, args));
    let mut g = processes().acquire();
    g.insert(
        space_id,
        ProcessRecord {
            thread: handle.thread().clone(),
            joinable: enable_join,
        },
    );
    drop(g);
    Ok(space_id)
}

/// The Join syscall body: the exit status, or 1 for an unknown or
/// unjoinable process id.
pub fn join(space_id: i32) -> i32 {
    if space_id < 0 {
        return -1;
    }
    let g = processes().acquire();
    let record = g
        .get(&(space_id as usize))
        .filter(|r| r.joinable)
        .map(|r| r.thread.clone());
    drop(g);
    match record {
        Some(th) => th.wait_exit(),
        None => 1,
    }
}

fn arg(n: usize) -> u32 {
    cpu::read_register(cpu::SYSCALL_ARG_REG + n)
}

fn syscall_handler(_kind: ExceptionKind) {
    let id = cpu::read_register(cpu::SYSCALL_RET_REG);
    let ret: i32 = match Syscall::try_from(id) {
        Ok(Syscall::Halt) => {
            trace!('e', "halt requested by user program");
            crate::system::halt();
        }
        Ok(Syscall::Exit) => {
            let status = arg(0) as i32;
            trace!('e', "process exiting with status {}", status);
            Current::exit(status);
        }
        Ok(Syscall::Exec) => sc_exec(),
        Ok(Syscall::Join) => join(arg(0) as i32),
        Ok(Syscall::Create) => sc_create(),
        Ok(Syscall::Remove) => sc_remove(),
        Ok(Syscall::Open) => sc_open(),
        Ok(Syscall::Close) => sc_close(),
        Ok(Syscall::Read) => sc_read(),
        Ok(Syscall::Write) => sc_write(),
        Ok(Syscall::Ps) => {
            scheduler().dump();
            0
        }
        Err(other) => panic!("unexpected system call id {other}"),
    };
    cpu::write_register(cpu::SYSCALL_RET_REG, ret as u32);
    cpu::advance_pc();
}

fn read_user_path(addr: u32) -> Option<String> {
    if addr == 0 {
        return None;
    }
    transfer::read_string_from_user(addr as usize, MAX_PATH_LEN)
}

fn sc_exec() -> i32 {
    let Some(path) = read_user_path(arg(0)) else {
        return -1;
    };
    let argv_addr = arg(1) as usize;
    let enable_join = arg(2) != 0;
    let args = if argv_addr != 0 {
        match transfer::save_args(argv_addr) {
            Some(args) => args,
            None => return -1,
        }
    } else {
        Vec::new()
    };
    match exec(&path, args, enable_join) {
        Ok(space_id) => space_id as i32,
        Err(e) => e.into_syscall_ret(),
    }
}

fn sc_create() -> i32 {
    let Some(path) = read_user_path(arg(0)) else {
        return -1;
    };
    match crate::system::file_system().create(&path, 0, false) {
        Ok(()) => 0,
        Err(e) => e.into_syscall_ret(),
    }
}

fn sc_remove() -> i32 {
    let Some(path) = read_user_path(arg(0)) else {
        return -1;
    };
    match crate::system::file_system().remove(&path) {
        Ok(()) => 0,
        Err(e) => e.into_syscall_ret(),
    }
}

fn sc_open() -> i32 {
    let Some(path) = read_user_path(arg(0)) else {
        return -1;
    };
    let fs = crate::system::file_system();
    let file = match fs.open(&path) {
        Ok(file) => file,
        Err(e) => return e.into_syscall_ret(),
    };
    match thread::current().add_file(file.clone()) {
        Some(fd) => fd,
        None => {
            fs.close_handle(&file);
            -1
        }
    }
}

fn sc_close() -> i32 {
    let fd = arg(0) as i32;
    match thread::current().remove_file(fd) {
        Some(file) => {
            crate::system::file_system().close_handle(&file);
            1
        }
        None => 0,
    }
}

fn sc_read() -> i32 {
    let buf_addr = arg(0) as usize;
    let size = arg(1) as usize;
    let fd = arg(2) as i32;
    if buf_addr == 0 {
        return -1;
    }
    let mut data = vec![0u8; size];
    let read = if fd == CONSOLE_INPUT {
        let console = crate::system::synch_console();
        for byte in data.iter_mut() {
            *byte = console.get_char();
        }
        size
    } else {
        match thread::current().get_file(fd) {
            Some(file) => file.read(&mut data),
            None => return -1,
        }
    };
    if !transfer::write_buffer_to_user(&data[..read], buf_addr) {
        return -1;
    }
    read as i32
}

fn sc_write() -> i32 {
    let buf_addr = arg(0) as usize;
    let size = arg(1) as usize;
    let fd = arg(2) as i32;
    if buf_addr == 0 {
        return -1;
    }
    let mut data = vec![0u8; size];
    if !transfer::read_buffer_from_user(buf_addr, &mut data) {
        return -1;
    }
    if fd == CONSOLE_OUTPUT {
        let console = crate::system::synch_console();
        for byte in &data {
            console.put_char(*byte);
        }
        size as i32
    } else {
        match thread::current().get_file(fd) {
            Some(file) => match file.write(&data) {
                Ok(n) => n as i32,
                Err(e) => e.into_syscall_ret(),
            },
            None => -1,
        }
    }
}
