//! Syscall-layer tests: dispatch through the CPU's trap path, safe user
//! transfer, and Exec/Join over hand-assembled programs.

use std::sync::Arc;

use mirage::cpu::{self, ExceptionKind};
use mirage::{console, PAGE_SIZE};
use rios::system::{boot, file_system, BootOptions};
use rios::thread;
use rios::userprog::exception::{self, Syscall, CONSOLE_OUTPUT};
use rios::userprog::executable::{assemble, build_image};
use rios::userprog::transfer;
use rios::vm::AddressSpace;

fn user_test(f: impl FnOnce()) {
    boot(BootOptions::default(), f);
}

/// Attach a scratch address space (all zero-fill) to the boot thread so
/// syscalls can move data through user memory.
fn scratch_space(pages: usize) -> Arc<AddressSpace> {
    let fs = file_system();
    let image = build_image(&[], &[], (pages * PAGE_SIZE) as u32);
    fs.create("scratch", 0, false).unwrap();
    let file = fs.open("scratch").unwrap();
    file.write(&image).unwrap();
    let space = Arc::new(AddressSpace::new(file, 99).unwrap());
    thread::with_current(|th| {
        let mut g = th.space.lock();
        *g = Some(space.clone());
        g.unlock();
    });
    space.restore_state();
    space
}

fn teardown_space(space: &Arc<AddressSpace>) {
    thread::with_current(|th| {
        let mut g = th.space.lock();
        *g = None;
        g.unlock();
    });
    space.destroy();
    mirage::mmu::invalidate_tlb();
    file_system().remove("scratch").unwrap();
}

/// Trap into the kernel the way the CPU does, with the PC registers set up
/// so the advance is observable.
fn raise_syscall(id: Syscall, args: [u32; 3]) -> i32 {
    cpu::write_register(cpu::PC_REG, 100);
    cpu::write_register(cpu::NEXT_PC_REG, 104);
    cpu::write_register(cpu::SYSCALL_RET_REG, id as u32);
    for (i, arg) in args.into_iter().enumerate() {
        cpu::write_register(cpu::SYSCALL_ARG_REG + i, arg);
    }
    cpu::raise_exception(ExceptionKind::Syscall, 0);
    assert_eq!(cpu::read_register(cpu::PC_REG), 104, "PC not advanced");
    cpu::read_register(cpu::SYSCALL_RET_REG) as i32
}

#[test]
fn create_open_write_read_close_via_syscalls() {
    user_test(|| {
        let space = scratch_space(8);
        let path_addr = 0usize;
        let buf_addr = 256usize;
        assert!(transfer::write_string_to_user("notes", path_addr));

        assert_eq!(raise_syscall(Syscall::Create, [0, 0, 0]), 0);
        let fd = raise_syscall(Syscall::Open, [0, 0, 0]);
        assert!(fd >= 2, "descriptors 0 and 1 are reserved");

        assert!(transfer::write_buffer_to_user(b"abcdef", buf_addr));
        assert_eq!(
            raise_syscall(Syscall::Write, [buf_addr as u32, 6, fd as u32]),
            6
        );

        // A second descriptor to the same file sees the data.
        let fd2 = raise_syscall(Syscall::Open, [0, 0, 0]);
        assert!(fd2 >= 2 && fd2 != fd);
        let read_addr = 512usize;
        assert_eq!(
            raise_syscall(Syscall::Read, [read_addr as u32, 6, fd2 as u32]),
            6
        );
        let mut back = [0u8; 6];
        assert!(transfer::read_buffer_from_user(read_addr, &mut back));
        assert_eq!(&back, b"abcdef");

        assert_eq!(raise_syscall(Syscall::Close, [fd as u32, 0, 0]), 1);
        assert_eq!(raise_syscall(Syscall::Close, [fd as u32, 0, 0]), 0);
        assert_eq!(raise_syscall(Syscall::Close, [fd2 as u32, 0, 0]), 1);
        assert_eq!(raise_syscall(Syscall::Remove, [0, 0, 0]), 0);

        teardown_space(&space);
        assert!(file_system().check());
    });
}

#[test]
fn bad_user_pointers_fail_the_syscall() {
    user_test(|| {
        let space = scratch_space(4);
        // Far past the space: the fault handler cannot page it in.
        let wild = (space.num_pages() + 10) * PAGE_SIZE;
        assert_eq!(raise_syscall(Syscall::Create, [wild as u32, 0, 0]), -1);
        assert_eq!(raise_syscall(Syscall::Create, [0, 0, 0]), -1); // NULL path
        teardown_space(&space);
    });
}

#[test]
fn unterminated_strings_are_rejected() {
    user_test(|| {
        let space = scratch_space(4);
        // Fill a stretch with no NUL anywhere near.
        let junk = vec![b'x'; rios::userprog::MAX_PATH_LEN + 2];
        assert!(transfer::write_buffer_to_user(&junk, 0));
        assert_eq!(transfer::read_string_from_user(0, rios::userprog::MAX_PATH_LEN), None);
        teardown_space(&space);
    });
}

#[test]
fn reading_descriptor_zero_takes_console_input() {
    user_test(|| {
        let space = scratch_space(4);
        console::feed_input(b"ok");
        let addr = 64usize;
        assert_eq!(raise_syscall(Syscall::Read, [addr as u32, 2, 0]), 2);
        let mut buf = [0u8; 2];
        assert!(transfer::read_buffer_from_user(addr, &mut buf));
        assert_eq!(&buf, b"ok");
        teardown_space(&space);
    });
}

#[test]
fn join_of_unknown_ids() {
    user_test(|| {
        assert_eq!(exception::join(-3), -1);
        assert_eq!(exception::join(1234), 1);
    });
}

/// addiu r2, r0, imm
fn li_v0(imm: u16) -> u32 {
    0x2402_0000 | imm as u32
}

/// addiu rt, r0, imm
fn li(rt: u32, imm: u16) -> u32 {
    0x2400_0000 | (rt << 16) | imm as u32
}

const SYSCALL_INSTR: u32 = 0x0000_000c;

#[test]
fn exec_runs_a_program_and_join_gets_its_status() {
    user_test(|| {
        // exit(42)
        let program = assemble(&[li_v0(Syscall::Exit as u16), li(4, 42), SYSCALL_INSTR]);
        let image = build_image(&program, &[], 0);
        let fs = file_system();
        fs.create("exit42", 0, false).unwrap();
        let file = fs.open("exit42").unwrap();
        file.write(&image).unwrap();
        fs.close_handle(&file);

        let space_id = exception::exec("exit42", Vec::new(), true).unwrap();
        assert_eq!(exception::join(space_id as i32), 42);

        // The process's swap file and executable pin are gone.
        fs.remove("exit42").unwrap();
        assert!(fs.check());
    });
}

#[test]
fn exec_of_a_non_executable_fails() {
    user_test(|| {
        let fs = file_system();
        fs.create("garbage", 0, false).unwrap();
        let file = fs.open("garbage").unwrap();
        file.write(b"not an image at all").unwrap();
        fs.close_handle(&file);
        assert!(exception::exec("garbage", Vec::new(), true).is_err());
        // The failed exec dropped its open; the file is removable.
        fs.remove("garbage").unwrap();
        assert!(fs.check());
    });
}

#[test]
fn a_user_program_writes_to_the_console() {
    user_test(|| {
        // write(CONSOLE_OUTPUT, &data, 2); exit(0)
        // The data segment starts right after the code.
        let code_words = 8;
        let data_addr = code_words * 4;
        let program = assemble(&[
            li_v0(Syscall::Write as u16),
            li(4, data_addr as u16),
            li(5, 2),
            li(6, CONSOLE_OUTPUT as u16),
            SYSCALL_INSTR,
            li_v0(Syscall::Exit as u16),
            li(4, 0),
            SYSCALL_INSTR,
        ]);
        assert_eq!(program.len(), data_addr);
        let image = build_image(&program, b"hi", 0);

        let fs = file_system();
        fs.create("greeter", 0, false).unwrap();
        let file = fs.open("greeter").unwrap();
        file.write(&image).unwrap();
        fs.close_handle(&file);

        console::capture_output();
        let space_id = exception::exec("greeter", Vec::new(), true).unwrap();
        assert_eq!(exception::join(space_id as i32), 0);
        assert_eq!(console::take_output(), b"hi");

        fs.remove("greeter").unwrap();
        assert!(fs.check());
    });
}

#[test]
fn a_write_to_a_read_only_page_kills_the_process() {
    user_test(|| {
        // sw r0, 0(r0): store into the program's own first (pure code)
        // page. The code must fill whole pages so the page is read-only.
        let mut words = vec![0xac00_0000u32; PAGE_SIZE / 4];
        // Defensive tail in case the store is somehow survived.
        words.push(li_v0(Syscall::Exit as u16));
        words.push(li(4, 0));
        words.push(SYSCALL_INSTR);
        let program = assemble(&words);
        let image = build_image(&program, &[], 0);

        let fs = file_system();
        fs.create("violator", 0, false).unwrap();
        let file = fs.open("violator").unwrap();
        file.write(&image).unwrap();
        fs.close_handle(&file);

        let space_id = exception::exec("violator", Vec::new(), true).unwrap();
        assert_eq!(exception::join(space_id as i32), -1);
        fs.remove("violator").unwrap();
    });
}
