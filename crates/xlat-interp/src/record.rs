//! Fixed-width bytecode records.
//!
//! ```text
//! [0]      opcode
//! [1]      aux (width, condition, ALU op, slot)
//! [2..4)   dst register
//! [4..6)   a register
//! [6..8)   b register
//! [8..16)  imm
//! [16..24) imm2
//! ```
//!
//! A `GOTO_TB` record carries its jump slot in `[8..24)`, so the slot is patched in
//! place by the translation cache.

use xlat_tb::{BinOp, Cond, Reg, EMPTY_JUMP_SLOT};
use xlat_types::Width;

pub(crate) const RECORD_SIZE: usize = 24;
pub(crate) const SLOT_OFFSET: usize = 8;

pub(crate) mod op {
    pub const INSN_START: u8 = 0x01;
    pub const HOOK_CODE: u8 = 0x02;
    pub const HOOK_BLOCK: u8 = 0x03;
    pub const MOVI: u8 = 0x10;
    pub const MOV: u8 = 0x11;
    pub const BIN: u8 = 0x12;
    pub const BINI: u8 = 0x13;
    pub const LOAD: u8 = 0x20;
    pub const STORE: u8 = 0x21;
    pub const INSN_HOOK: u8 = 0x30;
    pub const BRCOND: u8 = 0x40;
    pub const SETPC: u8 = 0x41;
    pub const SETPC_REG: u8 = 0x42;
    pub const GOTO_TB: u8 = 0x43;
    pub const EXIT: u8 = 0x44;
    pub const RAISE: u8 = 0x45;
}

pub(crate) const EXIT_NOCHAIN: u16 = 0;
pub(crate) const EXIT_CHAIN: u16 = 1;

const TEMP_BIT: u16 = 0x8000;

pub(crate) fn encode_reg(reg: Reg) -> u16 {
    match reg {
        Reg::Guest(n) => {
            assert!(n < TEMP_BIT, "guest register {n} out of range");
            n
        }
        Reg::Temp(n) => {
            assert!(n < TEMP_BIT, "temporary {n} out of range");
            TEMP_BIT | n
        }
    }
}

#[inline]
pub(crate) fn temp_index(reg: u16) -> Option<usize> {
    (reg & TEMP_BIT != 0).then_some((reg & !TEMP_BIT) as usize)
}

pub(crate) fn encode_binop(op: BinOp) -> u8 {
    match op {
        BinOp::Add => 0,
        BinOp::Sub => 1,
        BinOp::Mul => 2,
        BinOp::And => 3,
        BinOp::Or => 4,
        BinOp::Xor => 5,
        BinOp::Shl => 6,
        BinOp::Shr => 7,
        BinOp::Sar => 8,
    }
}

pub(crate) fn decode_binop(v: u8) -> BinOp {
    match v {
        0 => BinOp::Add,
        1 => BinOp::Sub,
        2 => BinOp::Mul,
        3 => BinOp::And,
        4 => BinOp::Or,
        5 => BinOp::Xor,
        6 => BinOp::Shl,
        7 => BinOp::Shr,
        8 => BinOp::Sar,
        _ => panic!("corrupt ALU op {v}"),
    }
}

pub(crate) fn encode_cond(c: Cond) -> u8 {
    match c {
        Cond::Eq => 0,
        Cond::Ne => 1,
        Cond::Lt => 2,
        Cond::Ge => 3,
        Cond::Ltu => 4,
        Cond::Geu => 5,
    }
}

pub(crate) fn decode_cond(v: u8) -> Cond {
    match v {
        0 => Cond::Eq,
        1 => Cond::Ne,
        2 => Cond::Lt,
        3 => Cond::Ge,
        4 => Cond::Ltu,
        5 => Cond::Geu,
        _ => panic!("corrupt condition {v}"),
    }
}

/// Width in the low nibble, sign-extension flag in bit 4.
pub(crate) fn encode_width(w: Width, signed: bool) -> u8 {
    w.bytes() as u8 | if signed { 0x10 } else { 0 }
}

pub(crate) fn decode_width(v: u8) -> (Width, bool) {
    let width = Width::from_bytes((v & 0xf) as usize)
        .unwrap_or_else(|| panic!("corrupt access width {v:#x}"));
    (width, v & 0x10 != 0)
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Record {
    pub op: u8,
    pub aux: u8,
    pub dst: u16,
    pub a: u16,
    pub b: u16,
    pub imm: u64,
    pub imm2: u64,
}

impl Record {
    pub(crate) fn new(op: u8) -> Self {
        Self {
            op,
            ..Self::default()
        }
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.push(self.op);
        out.push(self.aux);
        out.extend_from_slice(&self.dst.to_le_bytes());
        out.extend_from_slice(&self.a.to_le_bytes());
        out.extend_from_slice(&self.b.to_le_bytes());
        if self.op == op::GOTO_TB {
            out.extend_from_slice(&EMPTY_JUMP_SLOT);
        } else {
            out.extend_from_slice(&self.imm.to_le_bytes());
            out.extend_from_slice(&self.imm2.to_le_bytes());
        }
    }

    #[inline]
    pub(crate) fn read(bytes: &[u8]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u64_at = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(b)
        };
        Self {
            op: bytes[0],
            aux: bytes[1],
            dst: u16_at(2),
            a: u16_at(4),
            b: u16_at(6),
            imm: u64_at(8),
            imm2: u64_at(16),
        }
    }
}
