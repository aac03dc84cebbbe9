use tracing::trace;
use xlat_tb::{BinOp, BlockEnd, Cond, DecodeError, FrontEnd, IrBlock, IrOp, Reg, TranslateCtx};
use xlat_types::{page_base, FaultKind, Width, EXCP_DEBUG, EXCP_HLT, PAGE_SIZE};

use crate::opcode::*;
use crate::{FLAG_USER, INSN_SYSCALL, PRIV_FAULT, REG_MODE};

const INSN_SIZE: u32 = 4;

/// Decoder for the toy instruction set. Blocks span at most two guest pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToyFrontEnd;

impl ToyFrontEnd {
    pub fn new() -> Self {
        Self
    }
}

/// Fields of one instruction word.
#[derive(Debug, Clone, Copy)]
struct Insn {
    word: u32,
    op: u8,
    rd: u16,
    rs: u16,
    imm: u16,
}

impl Insn {
    fn new(word: u32) -> Self {
        Self {
            word,
            op: word as u8,
            rd: ((word >> 8) & 0xf) as u16,
            rs: ((word >> 12) & 0xf) as u16,
            imm: (word >> 16) as u16,
        }
    }

    fn simm(&self) -> i64 {
        self.imm as i16 as i64
    }

    fn rt(&self) -> Reg {
        Reg::Guest(self.imm & 0xf)
    }

    fn rd(&self) -> Reg {
        Reg::Guest(self.rd)
    }

    fn rs(&self) -> Reg {
        Reg::Guest(self.rs)
    }
}

enum Step {
    Next,
    End(BlockEnd),
    Invalid,
}

/// Fetch a little-endian word, splitting the read at a page boundary.
fn fetch_word(ctx: &mut dyn TranslateCtx, addr: u64) -> Result<u32, (u64, FaultKind)> {
    let mut bytes = [0u8; INSN_SIZE as usize];
    let split = ((page_base(addr) + PAGE_SIZE - addr) as usize).min(bytes.len());
    let (head, tail) = bytes.split_at_mut(split);
    ctx.fetch(addr, head).map_err(|f| (addr, f))?;
    if !tail.is_empty() {
        let next = addr + split as u64;
        ctx.fetch(next, tail).map_err(|f| (next, f))?;
    }
    Ok(u32::from_le_bytes(bytes))
}

fn direct(pc: u64, words: i64) -> u64 {
    pc.wrapping_add(INSN_SIZE as u64)
        .wrapping_add((words as u64).wrapping_mul(INSN_SIZE as u64))
}

fn translate(block: &mut IrBlock, insn: Insn, pc: u64, user: bool, ctx: &dyn TranslateCtx) -> Step {
    let next = pc.wrapping_add(INSN_SIZE as u64);
    let (rd, rs) = (insn.rd(), insn.rs());
    let bin = |op| IrOp::Bin {
        op,
        dst: rd,
        a: rs,
        b: insn.rt(),
    };
    let bin_imm = |op, imm| IrOp::BinImm { op, dst: rd, a: rs, imm };
    let load = |width, signed| IrOp::Load {
        dst: rd,
        addr: rs,
        offset: insn.simm(),
        width,
        signed,
    };
    let store = |width| IrOp::Store {
        src: rd,
        addr: rs,
        offset: insn.simm(),
        width,
    };
    let branch = |cond| {
        Step::End(BlockEnd::Branch {
            cond,
            a: rd,
            b: rs,
            taken: direct(pc, insn.simm()),
            not_taken: next,
            chain_taken: true,
            chain_not_taken: true,
        })
    };

    let op = match insn.op {
        NOP => return Step::Next,
        ADD => bin(BinOp::Add),
        SUB => bin(BinOp::Sub),
        MUL => bin(BinOp::Mul),
        AND => bin(BinOp::And),
        OR => bin(BinOp::Or),
        XOR => bin(BinOp::Xor),
        SHL => bin(BinOp::Shl),
        SHR => bin(BinOp::Shr),
        SAR => bin(BinOp::Sar),

        ADDI => bin_imm(BinOp::Add, insn.simm() as u64),
        ANDI => bin_imm(BinOp::And, insn.imm as u64),
        ORI => bin_imm(BinOp::Or, insn.imm as u64),
        XORI => bin_imm(BinOp::Xor, insn.imm as u64),
        SHLI => bin_imm(BinOp::Shl, insn.imm as u64 & 63),
        SHRI => bin_imm(BinOp::Shr, insn.imm as u64 & 63),
        MOVI => IrOp::MovImm {
            dst: rd,
            imm: insn.simm() as u64,
        },
        SHORI => {
            block.push(IrOp::BinImm {
                op: BinOp::Shl,
                dst: rd,
                a: rd,
                imm: 16,
            });
            IrOp::BinImm {
                op: BinOp::Or,
                dst: rd,
                a: rd,
                imm: insn.imm as u64,
            }
        }

        LDB => load(Width::W8, false),
        LDW => load(Width::W32, false),
        LDD => load(Width::W64, false),
        LDWS => load(Width::W32, true),
        STB => store(Width::W8),
        STW => store(Width::W32),
        STD => store(Width::W64),

        BEQ => return branch(Cond::Eq),
        BNE => return branch(Cond::Ne),
        BLT => return branch(Cond::Lt),
        BGE => return branch(Cond::Ge),
        BLTU => return branch(Cond::Ltu),
        BGEU => return branch(Cond::Geu),
        JMP => {
            let words = (insn.word as i32 >> 8) as i64;
            return Step::End(BlockEnd::Jump {
                target: direct(pc, words),
                chain: true,
            });
        }
        JR => return Step::End(BlockEnd::Indirect { target: rs }),

        SVC => {
            return Step::End(BlockEnd::Raise {
                excp: insn.imm as u32,
                pc: next,
            })
        }
        SYSCALL => {
            if !ctx.wants_insn_hook(INSN_SYSCALL) {
                return Step::Next;
            }
            IrOp::InsnHook { id: INSN_SYSCALL }
        }
        BRK => return Step::End(BlockEnd::Raise { excp: EXCP_DEBUG, pc }),
        HLT | SETMODE if user => return Step::End(BlockEnd::Raise { excp: PRIV_FAULT, pc }),
        HLT => return Step::End(BlockEnd::Raise { excp: EXCP_HLT, pc: next }),
        SETMODE => {
            block.push(IrOp::MovImm {
                dst: Reg::Guest(REG_MODE),
                imm: insn.imm as u64 & 1,
            });
            // The mode is part of the block key; the next block must be looked up again.
            return Step::End(BlockEnd::Exit { next_pc: next });
        }
        _ => return Step::Invalid,
    };
    block.push(op);
    Step::Next
}

impl FrontEnd for ToyFrontEnd {
    fn decode(
        &self,
        ctx: &mut dyn TranslateCtx,
        pc: u64,
        flags: u32,
        max_insns: u32,
    ) -> Result<IrBlock, DecodeError> {
        let user = flags & FLAG_USER != 0;
        let last_page = page_base(pc).wrapping_add(PAGE_SIZE);
        let mut block = IrBlock::new(pc);
        let mut block_hook = None;
        let mut cur = pc;

        block.end = loop {
            if !block.insns.is_empty() {
                if block.icount() >= max_insns {
                    break BlockEnd::Jump {
                        target: cur,
                        chain: true,
                    };
                }
                let insn_last_page = page_base(cur.wrapping_add(INSN_SIZE as u64 - 1));
                if ctx.is_exit(cur) || insn_last_page > last_page {
                    break BlockEnd::Exit { next_pc: cur };
                }
            }

            let word = match fetch_word(ctx, cur) {
                Ok(word) => word,
                Err((addr, fault)) if block.insns.is_empty() => {
                    return Err(DecodeError::Fetch { addr, fault });
                }
                // Reported when a block starts here.
                Err(_) => break BlockEnd::Exit { next_pc: cur },
            };

            let mark = block.ops.len();
            block.start_insn(cur, INSN_SIZE);
            if cur == pc && ctx.wants_block_hook(pc) {
                block_hook = Some(block.ops.len());
                block.push(IrOp::HookBlock { pc, size: 0 });
            }
            if ctx.wants_code_hook(cur) {
                block.push(IrOp::HookCode {
                    pc: cur,
                    size: INSN_SIZE,
                });
            }

            match translate(&mut block, Insn::new(word), cur, user, ctx) {
                Step::Next => cur = cur.wrapping_add(INSN_SIZE as u64),
                Step::End(end) => break end,
                Step::Invalid => {
                    trace!(pc = cur, word, "undecodable instruction");
                    if cur == pc {
                        return Err(DecodeError::InvalidInstruction { pc: cur });
                    }
                    block.insns.pop();
                    block.ops.truncate(mark);
                    break BlockEnd::Exit { next_pc: cur };
                }
            }
        };

        if let Some(idx) = block_hook {
            let size = block.guest_size();
            block.ops[idx] = IrOp::HookBlock { pc, size };
        }
        Ok(block)
    }
}
