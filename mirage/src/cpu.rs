//! Simulated MIPS-style processor.
//!
//! The register file, exception vectoring, and an interpreter for the
//! instruction subset the user-space runtime is compiled to. The interpreter
//! models delayed branches the way the original simulators did, by keeping
//! three program-counter registers: after an ordinary instruction at `PC`,
//! `PREV_PC ← PC`, `PC ← NEXT_PC`, `NEXT_PC ← NEXT_PC + 4`; a taken branch
//! only replaces the *incoming* `NEXT_PC`, so the delay-slot instruction
//! still executes.
//!
//! Every memory access goes through the [`mmu`](crate::mmu); a failed access
//! raises the exception into the kernel's handler table and the instruction
//! is retried on the next step, which is what makes demand paging invisible
//! to user code.
//!
//! The kernel never calls [`step`] directly; a thread that runs a user
//! program enters [`run`] and leaves it only by exception (process exit or
//! halt).

use crate::{interrupt, mmu, stats, trace, USER_TICK};

/// General-purpose registers.
pub const NUM_GP_REGS: usize = 32;
/// Multiply/divide high result.
pub const HI_REG: usize = 32;
/// Multiply/divide low result.
pub const LO_REG: usize = 33;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter (branch-delay target).
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter.
pub const PREV_PC_REG: usize = 36;
/// The faulting virtual address of the last translation failure.
pub const BAD_VADDR_REG: usize = 37;
/// Total registers saved per thread.
pub const NUM_TOTAL_REGS: usize = 38;

/// Stack pointer (r29 by convention).
pub const STACK_REG: usize = 29;
/// Syscall id and result register (r2).
pub const SYSCALL_RET_REG: usize = 2;
/// First syscall argument register (r4); arguments continue through r7.
pub const SYSCALL_ARG_REG: usize = 4;

/// The kinds of trap a user instruction can take.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExceptionKind {
    /// The `syscall` instruction.
    Syscall,
    /// No valid translation for the access.
    PageFault,
    /// Write through a read-only translation.
    ReadOnly,
    /// Translation produced a nonexistent physical address.
    BusError,
    /// Unaligned or out-of-range address.
    AddressError,
    /// Integer overflow in a trapping arithmetic instruction.
    Overflow,
    /// Undecodable instruction.
    IllegalInstruction,
}

impl ExceptionKind {
    const COUNT: usize = 7;

    fn index(self) -> usize {
        match self {
            ExceptionKind::Syscall => 0,
            ExceptionKind::PageFault => 1,
            ExceptionKind::ReadOnly => 2,
            ExceptionKind::BusError => 3,
            ExceptionKind::AddressError => 4,
            ExceptionKind::Overflow => 5,
            ExceptionKind::IllegalInstruction => 6,
        }
    }
}

struct Cpu {
    regs: [u32; NUM_TOTAL_REGS],
    handlers: [Option<fn(ExceptionKind)>; ExceptionKind::COUNT],
}

static mut CPU: Cpu = Cpu {
    regs: [0; NUM_TOTAL_REGS],
    handlers: [None; ExceptionKind::COUNT],
};

fn cpu() -> &'static mut Cpu {
    unsafe { &mut CPU }
}

pub(crate) fn reset() {
    let c = cpu();
    c.regs = [0; NUM_TOTAL_REGS];
    c.handlers = [None; ExceptionKind::COUNT];
}

/// Read register `r`.
pub fn read_register(r: usize) -> u32 {
    cpu().regs[r]
}

/// Write register `r`. Writes to r0 are discarded.
pub fn write_register(r: usize, value: u32) {
    if r != 0 {
        cpu().regs[r] = value;
    }
}

/// Snapshot the whole register file (for a thread's save area).
pub fn save_registers() -> [u32; NUM_TOTAL_REGS] {
    cpu().regs
}

/// Restore the whole register file from a thread's save area.
pub fn restore_registers(regs: &[u32; NUM_TOTAL_REGS]) {
    cpu().regs = *regs;
}

/// Register the kernel handler for an exception kind.
pub fn set_handler(kind: ExceptionKind, handler: fn(ExceptionKind)) {
    cpu().handlers[kind.index()] = Some(handler);
}

/// Vector an exception into the kernel. `bad_vaddr` is recorded for the
/// handler's benefit (meaningful for memory exceptions, zero otherwise).
pub fn raise_exception(kind: ExceptionKind, bad_vaddr: usize) {
    trace!('m', "exception {:?} at vaddr {:#x}", kind, bad_vaddr);
    cpu().regs[BAD_VADDR_REG] = bad_vaddr as u32;
    match cpu().handlers[kind.index()] {
        Some(handler) => handler(kind),
        None => panic!("unhandled exception {kind:?} (bad vaddr {bad_vaddr:#x})"),
    }
}

fn sign_extend16(v: u32) -> u32 {
    v as u16 as i16 as i32 as u32
}

/// Interpret one instruction. A memory fault leaves the PC untouched so the
/// instruction retries after the kernel services it.
pub fn step() {
    let pc = read_register(PC_REG) as usize;
    let Ok(instr) = mmu::read_mem(pc, 4) else {
        return;
    };
    stats::add_instruction(1);

    let op = instr >> 26;
    let rs = ((instr >> 21) & 0x1f) as usize;
    let rt = ((instr >> 16) & 0x1f) as usize;
    let rd = ((instr >> 11) & 0x1f) as usize;
    let shamt = (instr >> 6) & 0x1f;
    let funct = instr & 0x3f;
    let imm = instr & 0xffff;
    let simm = sign_extend16(imm);
    let target = (pc as u32 & 0xf000_0000) | ((instr & 0x03ff_ffff) << 2);

    let next_pc = read_register(NEXT_PC_REG);
    // Where NEXT_PC goes after this instruction; branches overwrite it.
    let mut pc_after = next_pc.wrapping_add(4);

    let rs_v = read_register(rs);
    let rt_v = read_register(rt);

    match op {
        0 => match funct {
            0x00 => write_register(rd, rt_v << shamt),                    // sll
            0x02 => write_register(rd, rt_v >> shamt),                    // srl
            0x03 => write_register(rd, ((rt_v as i32) >> shamt) as u32),  // sra
            0x08 => pc_after = rs_v,                                      // jr
            0x09 => {
                // jalr
                write_register(rd, next_pc.wrapping_add(4));
                pc_after = rs_v;
            }
            0x0c => {
                // syscall: the kernel handler advances the PC itself so the
                // trap is not re-executed.
                raise_exception(ExceptionKind::Syscall, 0);
                return;
            }
            0x20 => {
                // add, trapping on overflow
                match (rs_v as i32).checked_add(rt_v as i32) {
                    Some(v) => write_register(rd, v as u32),
                    None => {
                        raise_exception(ExceptionKind::Overflow, 0);
                        return;
                    }
                }
            }
            0x21 => write_register(rd, rs_v.wrapping_add(rt_v)),          // addu
            0x23 => write_register(rd, rs_v.wrapping_sub(rt_v)),          // subu
            0x24 => write_register(rd, rs_v & rt_v),                      // and
            0x25 => write_register(rd, rs_v | rt_v),                      // or
            0x26 => write_register(rd, rs_v ^ rt_v),                      // xor
            0x27 => write_register(rd, !(rs_v | rt_v)),                   // nor
            0x2a => write_register(rd, ((rs_v as i32) < (rt_v as i32)) as u32), // slt
            0x2b => write_register(rd, (rs_v < rt_v) as u32),             // sltu
            0x10 => write_register(rd, read_register(HI_REG)),            // mfhi
            0x12 => write_register(rd, read_register(LO_REG)),            // mflo
            _ => {
                raise_exception(ExceptionKind::IllegalInstruction, 0);
                return;
            }
        },
        1 => {
            // bltz / bgez
            let taken = match rt {
                0 => (rs_v as i32) < 0,
                1 => (rs_v as i32) >= 0,
                _ => {
                    raise_exception(ExceptionKind::IllegalInstruction, 0);
                    return;
                }
            };
            if taken {
                pc_after = next_pc.wrapping_add(simm << 2);
            }
        }
        2 => pc_after = target, // j
        3 => {
            // jal
            write_register(31, next_pc.wrapping_add(4));
            pc_after = target;
        }
        4 | 5 => {
            // beq / bne
            let taken = (rs_v == rt_v) == (op == 4);
            if taken {
                pc_after = next_pc.wrapping_add(simm << 2);
            }
        }
        6 => {
            if rs_v as i32 <= 0 {
                pc_after = next_pc.wrapping_add(simm << 2); // blez
            }
        }
        7 => {
            if rs_v as i32 > 0 {
                pc_after = next_pc.wrapping_add(simm << 2); // bgtz
            }
        }
        8 => {
            // addi, trapping on overflow
            match (rs_v as i32).checked_add(simm as i32) {
                Some(v) => write_register(rt, v as u32),
                None => {
                    raise_exception(ExceptionKind::Overflow, 0);
                    return;
                }
            }
        }
        9 => write_register(rt, rs_v.wrapping_add(simm)),                 // addiu
        10 => write_register(rt, ((rs_v as i32) < (simm as i32)) as u32), // slti
        11 => write_register(rt, (rs_v < simm) as u32),                   // sltiu
        12 => write_register(rt, rs_v & imm),                             // andi
        13 => write_register(rt, rs_v | imm),                             // ori
        14 => write_register(rt, rs_v ^ imm),                             // xori
        15 => write_register(rt, imm << 16),                              // lui
        32 | 36 => {
            // lb / lbu
            let addr = rs_v.wrapping_add(simm) as usize;
            let Ok(v) = mmu::read_mem(addr, 1) else { return };
            write_register(rt, if op == 32 { v as u8 as i8 as i32 as u32 } else { v });
        }
        33 | 37 => {
            // lh / lhu
            let addr = rs_v.wrapping_add(simm) as usize;
            let Ok(v) = mmu::read_mem(addr, 2) else { return };
            write_register(rt, if op == 33 { v as u16 as i16 as i32 as u32 } else { v });
        }
        35 => {
            // lw
            let addr = rs_v.wrapping_add(simm) as usize;
            let Ok(v) = mmu::read_mem(addr, 4) else { return };
            write_register(rt, v);
        }
        40 => {
            // sb
            let addr = rs_v.wrapping_add(simm) as usize;
            if mmu::write_mem(addr, 1, rt_v & 0xff).is_err() {
                return;
            }
        }
        41 => {
            // sh
            let addr = rs_v.wrapping_add(simm) as usize;
            if mmu::write_mem(addr, 2, rt_v & 0xffff).is_err() {
                return;
            }
        }
        43 => {
            // sw
            let addr = rs_v.wrapping_add(simm) as usize;
            if mmu::write_mem(addr, 4, rt_v).is_err() {
                return;
            }
        }
        _ => {
            raise_exception(ExceptionKind::IllegalInstruction, 0);
            return;
        }
    }

    let c = cpu();
    c.regs[PREV_PC_REG] = c.regs[PC_REG];
    c.regs[PC_REG] = c.regs[NEXT_PC_REG];
    c.regs[NEXT_PC_REG] = pc_after;
}

/// Run the current thread's user program. Leaves only by exception: process
/// exit and halt deschedule the thread for good inside their handlers.
pub fn run() -> ! {
    loop {
        step();
        interrupt::advance(USER_TICK);
    }
}

/// Advance `PREV_PC`/`PC`/`NEXT_PC` past the trapping instruction. Called by
/// the kernel's syscall dispatcher.
pub fn advance_pc() {
    let c = cpu();
    c.regs[PREV_PC_REG] = c.regs[PC_REG];
    c.regs[PC_REG] = c.regs[NEXT_PC_REG];
    c.regs[NEXT_PC_REG] = c.regs[NEXT_PC_REG].wrapping_add(4);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::TranslationEntry;
    use crate::PAGE_SIZE;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Hand-assembled: addiu r2, r0, 7; syscall.
    const PROGRAM: [u32; 2] = [0x2402_0007, 0x0000_000c];

    static SEEN: AtomicU32 = AtomicU32::new(0);

    #[test]
    fn interprets_addiu_and_vectors_syscall() {
        let _m = crate::TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        crate::power_on();
        // Identity-map page 0 and drop the program at address 0.
        crate::mmu::set_tlb_entry(
            0,
            TranslationEntry {
                virtual_page: 0,
                physical_page: 0,
                valid: true,
                read_only: false,
                used: false,
                dirty: false,
            },
        );
        let mut frame = [0u8; PAGE_SIZE];
        for (i, word) in PROGRAM.iter().enumerate() {
            frame[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        crate::mmu::write_frame(0, &frame);

        set_handler(ExceptionKind::Syscall, |_| {
            SEEN.store(read_register(SYSCALL_RET_REG), Ordering::SeqCst);
            advance_pc();
        });
        write_register(PC_REG, 0);
        write_register(NEXT_PC_REG, 4);
        step();
        step();
        assert_eq!(SEEN.load(Ordering::SeqCst), 7);
        assert_eq!(read_register(PC_REG), 8);
    }
}
