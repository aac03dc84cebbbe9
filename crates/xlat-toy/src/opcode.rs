//! Opcode byte values.

pub const NOP: u8 = 0x00;

pub const ADD: u8 = 0x01;
pub const SUB: u8 = 0x02;
pub const MUL: u8 = 0x03;
pub const AND: u8 = 0x04;
pub const OR: u8 = 0x05;
pub const XOR: u8 = 0x06;
pub const SHL: u8 = 0x07;
pub const SHR: u8 = 0x08;
pub const SAR: u8 = 0x09;

/// `rd = rs + sext(imm)`
pub const ADDI: u8 = 0x10;
pub const ANDI: u8 = 0x11;
pub const ORI: u8 = 0x12;
pub const XORI: u8 = 0x13;
pub const SHLI: u8 = 0x14;
pub const SHRI: u8 = 0x15;
/// `rd = sext(imm)`
pub const MOVI: u8 = 0x16;
/// `rd = (rd << 16) | imm`
pub const SHORI: u8 = 0x17;

/// Loads: `rd = [rs + sext(imm)]`.
pub const LDB: u8 = 0x20;
pub const LDW: u8 = 0x21;
pub const LDD: u8 = 0x22;
/// Sign-extending 4-byte load.
pub const LDWS: u8 = 0x23;
/// Stores: `[rs + sext(imm)] = rd`.
pub const STB: u8 = 0x24;
pub const STW: u8 = 0x25;
pub const STD: u8 = 0x26;

/// Branches compare `rd` with `rs`; the target is `pc + 4 + sext(imm) * 4`.
pub const BEQ: u8 = 0x30;
pub const BNE: u8 = 0x31;
pub const BLT: u8 = 0x32;
pub const BGE: u8 = 0x33;
pub const BLTU: u8 = 0x34;
pub const BGEU: u8 = 0x35;

/// `pc = pc + 4 + sext(imm24) * 4`
pub const JMP: u8 = 0x40;
/// `pc = rs`
pub const JR: u8 = 0x41;

/// Raise exception `imm`, resuming after the instruction.
pub const SVC: u8 = 0x50;
pub const SYSCALL: u8 = 0x51;
pub const BRK: u8 = 0x52;
/// Privileged.
pub const HLT: u8 = 0x53;
/// Privileged. `mode = imm & 1`.
pub const SETMODE: u8 = 0x54;
