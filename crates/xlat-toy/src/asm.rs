//! Instruction encoders. Branch and jump offsets are in instructions, relative to
//! the instruction after the branch.

use crate::opcode::*;

fn enc(op: u8, rd: u8, rs: u8, imm: u16) -> u32 {
    op as u32 | ((rd as u32 & 0xf) << 8) | ((rs as u32 & 0xf) << 12) | ((imm as u32) << 16)
}

fn alu(op: u8, rd: u8, rs: u8, rt: u8) -> u32 {
    enc(op, rd, rs, rt as u16 & 0xf)
}

pub fn nop() -> u32 {
    enc(NOP, 0, 0, 0)
}

pub fn add(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(ADD, rd, rs, rt)
}

pub fn sub(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(SUB, rd, rs, rt)
}

pub fn mul(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(MUL, rd, rs, rt)
}

pub fn and(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(AND, rd, rs, rt)
}

pub fn or(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(OR, rd, rs, rt)
}

pub fn xor(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(XOR, rd, rs, rt)
}

pub fn shl(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(SHL, rd, rs, rt)
}

pub fn shr(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(SHR, rd, rs, rt)
}

pub fn sar(rd: u8, rs: u8, rt: u8) -> u32 {
    alu(SAR, rd, rs, rt)
}

pub fn addi(rd: u8, rs: u8, imm: i16) -> u32 {
    enc(ADDI, rd, rs, imm as u16)
}

pub fn andi(rd: u8, rs: u8, imm: u16) -> u32 {
    enc(ANDI, rd, rs, imm)
}

pub fn ori(rd: u8, rs: u8, imm: u16) -> u32 {
    enc(ORI, rd, rs, imm)
}

pub fn xori(rd: u8, rs: u8, imm: u16) -> u32 {
    enc(XORI, rd, rs, imm)
}

pub fn shli(rd: u8, rs: u8, amount: u8) -> u32 {
    enc(SHLI, rd, rs, amount as u16 & 63)
}

pub fn shri(rd: u8, rs: u8, amount: u8) -> u32 {
    enc(SHRI, rd, rs, amount as u16 & 63)
}

pub fn movi(rd: u8, imm: i16) -> u32 {
    enc(MOVI, rd, 0, imm as u16)
}

pub fn shori(rd: u8, imm: u16) -> u32 {
    enc(SHORI, rd, 0, imm)
}

/// Load an arbitrary 64-bit constant: one `movi` plus up to three `shori`.
pub fn li(rd: u8, value: u64) -> Vec<u32> {
    if value as i64 >= i16::MIN as i64 && value as i64 <= i16::MAX as i64 {
        return vec![movi(rd, value as i16)];
    }
    let chunks = [(value >> 48) as u16, (value >> 32) as u16, (value >> 16) as u16, value as u16];
    let first = chunks.iter().position(|&c| c != 0).unwrap_or(3);
    let mut words = vec![enc(MOVI, rd, 0, 0), enc(ORI, rd, rd, chunks[first])];
    words.extend(chunks[first + 1..].iter().map(|&c| shori(rd, c)));
    words
}

pub fn ldb(rd: u8, rs: u8, off: i16) -> u32 {
    enc(LDB, rd, rs, off as u16)
}

pub fn ldw(rd: u8, rs: u8, off: i16) -> u32 {
    enc(LDW, rd, rs, off as u16)
}

pub fn ldd(rd: u8, rs: u8, off: i16) -> u32 {
    enc(LDD, rd, rs, off as u16)
}

pub fn ldws(rd: u8, rs: u8, off: i16) -> u32 {
    enc(LDWS, rd, rs, off as u16)
}

pub fn stb(rd: u8, rs: u8, off: i16) -> u32 {
    enc(STB, rd, rs, off as u16)
}

pub fn stw(rd: u8, rs: u8, off: i16) -> u32 {
    enc(STW, rd, rs, off as u16)
}

pub fn std(rd: u8, rs: u8, off: i16) -> u32 {
    enc(STD, rd, rs, off as u16)
}

pub fn beq(rd: u8, rs: u8, off: i16) -> u32 {
    enc(BEQ, rd, rs, off as u16)
}

pub fn bne(rd: u8, rs: u8, off: i16) -> u32 {
    enc(BNE, rd, rs, off as u16)
}

pub fn blt(rd: u8, rs: u8, off: i16) -> u32 {
    enc(BLT, rd, rs, off as u16)
}

pub fn bge(rd: u8, rs: u8, off: i16) -> u32 {
    enc(BGE, rd, rs, off as u16)
}

pub fn bltu(rd: u8, rs: u8, off: i16) -> u32 {
    enc(BLTU, rd, rs, off as u16)
}

pub fn bgeu(rd: u8, rs: u8, off: i16) -> u32 {
    enc(BGEU, rd, rs, off as u16)
}

/// `off` must fit in 24 signed bits.
pub fn jmp(off: i32) -> u32 {
    JMP as u32 | ((off as u32 & 0x00ff_ffff) << 8)
}

pub fn jr(rs: u8) -> u32 {
    enc(JR, 0, rs, 0)
}

pub fn svc(imm: u16) -> u32 {
    enc(SVC, 0, 0, imm)
}

pub fn syscall() -> u32 {
    enc(SYSCALL, 0, 0, 0)
}

pub fn brk() -> u32 {
    enc(BRK, 0, 0, 0)
}

pub fn hlt() -> u32 {
    enc(HLT, 0, 0, 0)
}

pub fn setmode(user: bool) -> u32 {
    enc(SETMODE, 0, 0, user as u16)
}

/// Word offset for a branch or jump at `from` to reach `to`.
pub fn offset(from: u64, to: u64) -> i32 {
    ((to.wrapping_sub(from + 4) as i64) / 4) as i32
}

/// Little-endian bytes of `words`.
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
