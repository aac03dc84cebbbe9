//! A small 64-bit load/store guest for driving the engine end to end.
//!
//! Sixteen general registers, fixed 4-byte little-endian instructions and a
//! kernel/user mode bit. The mode bit is the only translation flag and selects
//! the soft-MMU bank. [`asm`] builds programs.
//!
//! Instruction word layout:
//!
//! ```text
//!  31            16 15   12 11    8 7      0
//! +----------------+-------+-------+--------+
//! |      imm16     |  rs   |  rd   | opcode |
//! +----------------+-------+-------+--------+
//! ```
//!
//! Three-register ALU ops take `rt` from the low nibble of `imm16`; `jmp` uses
//! bits 8..32 as a signed word offset.

pub mod asm;
mod decode;
pub mod opcode;


pub use decode::ToyFrontEnd;

use xlat_engine::GuestCpu;

pub const GPR_COUNT: u16 = 16;
pub const REG_PC: u16 = 16;
/// Reads 0 in kernel mode, 1 in user mode.
pub const REG_MODE: u16 = 17;

/// Instruction id reported to `INSN` hooks by `syscall`.
pub const INSN_SYSCALL: u32 = 1;
/// Exception raised by a privileged instruction in user mode.
pub const PRIV_FAULT: u32 = 0x8000;

/// `tb_flags` bit set while in user mode.
pub const FLAG_USER: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Kernel,
    User,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToyCpu {
    pub regs: [u64; GPR_COUNT as usize],
    pub pc: u64,
    pub mode: Mode,
}

impl ToyCpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user() -> Self {
        Self {
            mode: Mode::User,
            ..Self::default()
        }
    }
}

impl GuestCpu for ToyCpu {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn reg_count(&self) -> u16 {
        REG_MODE + 1
    }

    fn pc_reg(&self) -> u16 {
        REG_PC
    }

    fn read_reg(&self, reg: u16) -> u64 {
        match reg {
            REG_PC => self.pc,
            REG_MODE => (self.mode == Mode::User) as u64,
            r => self.regs[r as usize],
        }
    }

    fn write_reg(&mut self, reg: u16, value: u64) {
        match reg {
            REG_PC => self.pc = value,
            REG_MODE => {
                self.mode = if value & 1 != 0 { Mode::User } else { Mode::Kernel };
            }
            r => self.regs[r as usize] = value,
        }
    }

    fn tb_flags(&self) -> u32 {
        match self.mode {
            Mode::Kernel => 0,
            Mode::User => FLAG_USER,
        }
    }

    fn mmu_index(&self) -> usize {
        match self.mode {
            Mode::Kernel => 0,
            Mode::User => 1,
        }
    }

    fn stops_on_exception(&self, intno: u32) -> bool {
        self.mode == Mode::User && intno == PRIV_FAULT
    }
}
