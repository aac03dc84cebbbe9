//! Portable back end: lowers block IR to fixed-width bytecode records in the code
//! arena and interprets them.
//!
//! Direct jumps are lowered to a `GOTO_TB` record whose payload is the jump slot
//! itself, so chaining works exactly as it would for native code: once the cache
//! patches the slot, execution continues into the successor block without
//! returning to the dispatch loop.

mod record;

use tracing::trace;
use xlat_tb::{
    read_jump_slot, Backend, BlockEnd, BlockEntry, CodeArena, CompileError, CompiledCode,
    ExecEnv, IrBlock, IrOp, StopToken, TbExit, TbExitReason, TbId, JUMP_SLOT_SIZE,
};

use record::{
    decode_binop, decode_cond, decode_width, encode_binop, encode_cond, encode_reg, encode_width,
    op, temp_index, Record, EXIT_CHAIN, EXIT_NOCHAIN, RECORD_SIZE, SLOT_OFFSET,
};

/// The bytecode interpreter back end. Stateless; all state lives in the arena and
/// the [`ExecEnv`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Interp;

impl Interp {
    pub fn new() -> Self {
        Self
    }
}

fn lower_op(ir: &IrOp, out: &mut Vec<Record>, insn_offsets: &mut Vec<u32>) {
    let rec = match *ir {
        IrOp::InsnStart { pc, size } => {
            insn_offsets.push((out.len() * RECORD_SIZE) as u32);
            Record {
                imm: pc,
                imm2: size as u64,
                ..Record::new(op::INSN_START)
            }
        }
        IrOp::HookCode { pc, size } => Record {
            imm: pc,
            imm2: size as u64,
            ..Record::new(op::HOOK_CODE)
        },
        IrOp::HookBlock { pc, size } => Record {
            imm: pc,
            imm2: size as u64,
            ..Record::new(op::HOOK_BLOCK)
        },
        IrOp::MovImm { dst, imm } => Record {
            dst: encode_reg(dst),
            imm,
            ..Record::new(op::MOVI)
        },
        IrOp::Mov { dst, src } => Record {
            dst: encode_reg(dst),
            a: encode_reg(src),
            ..Record::new(op::MOV)
        },
        IrOp::Bin { op: alu, dst, a, b } => Record {
            aux: encode_binop(alu),
            dst: encode_reg(dst),
            a: encode_reg(a),
            b: encode_reg(b),
            ..Record::new(op::BIN)
        },
        IrOp::BinImm { op: alu, dst, a, imm } => Record {
            aux: encode_binop(alu),
            dst: encode_reg(dst),
            a: encode_reg(a),
            imm,
            ..Record::new(op::BINI)
        },
        IrOp::Load {
            dst,
            addr,
            offset,
            width,
            signed,
        } => Record {
            aux: encode_width(width, signed),
            dst: encode_reg(dst),
            a: encode_reg(addr),
            imm: offset as u64,
            ..Record::new(op::LOAD)
        },
        IrOp::Store {
            src,
            addr,
            offset,
            width,
        } => Record {
            aux: encode_width(width, false),
            a: encode_reg(addr),
            b: encode_reg(src),
            imm: offset as u64,
            ..Record::new(op::STORE)
        },
        IrOp::InsnHook { id } => Record {
            imm: id as u64,
            ..Record::new(op::INSN_HOOK)
        },
    };
    out.push(rec);
}

/// Emit `SETPC target` followed by either a chainable exit through `slot` or a
/// plain exit. Returns the slot offset when one was reserved.
fn lower_direct(target: u64, chain: bool, slot: u8, out: &mut Vec<Record>) -> Option<u32> {
    out.push(Record {
        imm: target,
        ..Record::new(op::SETPC)
    });
    if !chain {
        out.push(exit_record(EXIT_NOCHAIN, 0));
        return None;
    }
    let at = out.len() * RECORD_SIZE + SLOT_OFFSET;
    out.push(Record {
        aux: slot,
        ..Record::new(op::GOTO_TB)
    });
    out.push(exit_record(EXIT_CHAIN, slot));
    Some(at as u32)
}

fn exit_record(reason: u16, slot: u8) -> Record {
    Record {
        aux: slot,
        dst: reason,
        ..Record::new(op::EXIT)
    }
}

fn lower_end(end: &BlockEnd, out: &mut Vec<Record>) -> [Option<u32>; 2] {
    let mut slots = [None; 2];
    match *end {
        BlockEnd::Jump { target, chain } => {
            slots[0] = lower_direct(target, chain, 0, out);
        }
        BlockEnd::Branch {
            cond,
            a,
            b,
            taken,
            not_taken,
            chain_taken,
            chain_not_taken,
        } => {
            let br = out.len();
            out.push(Record {
                aux: encode_cond(cond),
                a: encode_reg(a),
                b: encode_reg(b),
                ..Record::new(op::BRCOND)
            });
            slots[1] = lower_direct(not_taken, chain_not_taken, 1, out);
            out[br].imm = (out.len() * RECORD_SIZE) as u64;
            slots[0] = lower_direct(taken, chain_taken, 0, out);
        }
        BlockEnd::Indirect { target } => {
            out.push(Record {
                a: encode_reg(target),
                ..Record::new(op::SETPC_REG)
            });
            out.push(exit_record(EXIT_NOCHAIN, 0));
        }
        BlockEnd::Exit { next_pc } => {
            out.push(Record {
                imm: next_pc,
                ..Record::new(op::SETPC)
            });
            out.push(exit_record(EXIT_NOCHAIN, 0));
        }
        BlockEnd::Raise { excp, pc } => {
            out.push(Record {
                imm: pc,
                ..Record::new(op::SETPC)
            });
            out.push(Record {
                imm: excp as u64,
                ..Record::new(op::RAISE)
            });
        }
    }
    slots
}

struct Regs {
    temps: Vec<u64>,
}

impl Regs {
    #[inline]
    fn read(&self, env: &dyn ExecEnv, reg: u16) -> u64 {
        match temp_index(reg) {
            Some(i) => self.temps.get(i).copied().unwrap_or(0),
            None => env.read_reg(reg),
        }
    }

    #[inline]
    fn write(&mut self, env: &mut dyn ExecEnv, reg: u16, value: u64) {
        match temp_index(reg) {
            Some(i) => {
                if i >= self.temps.len() {
                    self.temps.resize(i + 1, 0);
                }
                self.temps[i] = value;
            }
            None => env.write_reg(reg, value),
        }
    }
}

fn sign_extend(value: u64, bytes: usize) -> u64 {
    let shift = 64 - bytes as u32 * 8;
    (((value << shift) as i64) >> shift) as u64
}

#[inline]
fn leave(tb: TbId, reason: TbExitReason) -> u64 {
    TbExit::new(tb, reason).pack()
}

impl Backend for Interp {
    fn compile(&self, block: &IrBlock, arena: &mut CodeArena) -> Result<CompiledCode, CompileError> {
        let mut records = Vec::with_capacity(block.ops.len() + 8);
        let mut insn_offsets = Vec::with_capacity(block.insns.len());
        for ir in &block.ops {
            lower_op(ir, &mut records, &mut insn_offsets);
        }
        let jump_slots = lower_end(&block.end, &mut records);

        let mut bytes = Vec::with_capacity(records.len() * RECORD_SIZE);
        for rec in &records {
            rec.write(&mut bytes);
        }
        let offset = arena.emit(&bytes)?;
        trace!(pc = block.pc, offset, records = records.len(), "lowered block");
        Ok(CompiledCode {
            offset,
            size: bytes.len(),
            insn_offsets,
            jump_slots,
        })
    }

    fn execute(&self, tb: TbId, entry: usize, env: &mut dyn ExecEnv, stop: &StopToken) -> u64 {
        match env.enter_block(tb) {
            BlockEntry::Run => {}
            BlockEntry::Exit => return leave(tb, TbExitReason::Requested),
            BlockEntry::CountExpired => return leave(tb, TbExitReason::CountExpired),
        }
        if stop.is_requested() {
            return leave(tb, TbExitReason::Requested);
        }

        let mut regs = Regs { temps: Vec::new() };
        let mut cur = tb;
        let mut base = entry;
        let mut ip = entry;
        // Guest pc of the instruction after the one currently executing.
        let mut next_pc = 0u64;

        loop {
            let code = env.code();
            let Some(bytes) = code.get(ip..ip + RECORD_SIZE) else {
                panic!("interpreter ip {ip:#x} outside code arena of {} bytes", code.len());
            };
            let rec = Record::read(bytes);
            let here = ip;
            ip += RECORD_SIZE;

            match rec.op {
                op::INSN_START => {
                    next_pc = rec.imm.wrapping_add(rec.imm2);
                }
                op::HOOK_CODE => {
                    env.hook_code(rec.imm, rec.imm2 as u32);
                    if stop.is_requested() || env.exit_requested() {
                        return leave(cur, TbExitReason::Requested);
                    }
                }
                op::HOOK_BLOCK => {
                    env.hook_block(rec.imm, rec.imm2 as u32);
                    if stop.is_requested() || env.exit_requested() {
                        return leave(cur, TbExitReason::Requested);
                    }
                }
                op::MOVI => regs.write(env, rec.dst, rec.imm),
                op::MOV => {
                    let v = regs.read(env, rec.a);
                    regs.write(env, rec.dst, v);
                }
                op::BIN => {
                    let v = decode_binop(rec.aux).eval(regs.read(env, rec.a), regs.read(env, rec.b));
                    regs.write(env, rec.dst, v);
                }
                op::BINI => {
                    let v = decode_binop(rec.aux).eval(regs.read(env, rec.a), rec.imm);
                    regs.write(env, rec.dst, v);
                }
                op::LOAD => {
                    let (width, signed) = decode_width(rec.aux);
                    let addr = regs.read(env, rec.a).wrapping_add(rec.imm);
                    let Some(mut value) = env.load(addr, width, here) else {
                        return leave(cur, TbExitReason::Requested);
                    };
                    if signed {
                        value = sign_extend(value, width.bytes());
                    }
                    regs.write(env, rec.dst, value);
                    if stop.is_requested() || env.exit_requested() {
                        env.set_pc(next_pc);
                        return leave(cur, TbExitReason::Requested);
                    }
                }
                op::STORE => {
                    let (width, _) = decode_width(rec.aux);
                    let addr = regs.read(env, rec.a).wrapping_add(rec.imm);
                    let value = regs.read(env, rec.b);
                    if !env.store(addr, width, value, here) {
                        return leave(cur, TbExitReason::Requested);
                    }
                    if stop.is_requested() || env.exit_requested() {
                        env.set_pc(next_pc);
                        return leave(cur, TbExitReason::Requested);
                    }
                }
                op::INSN_HOOK => {
                    env.set_pc(next_pc);
                    env.insn_hook(rec.imm as u32, here);
                    if stop.is_requested() || env.exit_requested() {
                        return leave(cur, TbExitReason::Requested);
                    }
                }
                op::BRCOND => {
                    if decode_cond(rec.aux).eval(regs.read(env, rec.a), regs.read(env, rec.b)) {
                        ip = base + rec.imm as usize;
                    }
                }
                op::SETPC => env.set_pc(rec.imm),
                op::SETPC_REG => {
                    let pc = regs.read(env, rec.a);
                    env.set_pc(pc);
                }
                op::GOTO_TB => {
                    let slot = &env.code()[here + SLOT_OFFSET..here + SLOT_OFFSET + JUMP_SLOT_SIZE];
                    let Some(target) = read_jump_slot(slot) else {
                        continue;
                    };
                    if stop.is_requested() {
                        return leave(cur, TbExitReason::Requested);
                    }
                    match env.enter_block(target.tb) {
                        BlockEntry::Run => {
                            cur = target.tb;
                            base = target.code_offset;
                            ip = target.code_offset;
                            regs.temps.clear();
                        }
                        BlockEntry::Exit => return leave(cur, TbExitReason::Requested),
                        BlockEntry::CountExpired => {
                            return leave(target.tb, TbExitReason::CountExpired)
                        }
                    }
                }
                op::EXIT => {
                    let reason = match rec.dst {
                        EXIT_CHAIN => TbExitReason::Chain { slot: rec.aux },
                        _ => TbExitReason::NoChain,
                    };
                    return leave(cur, reason);
                }
                op::RAISE => {
                    env.raise_exception(rec.imm as u32);
                    return leave(cur, TbExitReason::NoChain);
                }
                other => panic!("corrupt bytecode {other:#x} at {here:#x}"),
            }
        }
    }
}
