//! Block-level IR produced by front ends and consumed by back ends.
//!
//! The IR is deliberately small: guest registers and block-local temporaries,
//! integer ALU ops, guest memory accesses, hook call points and exactly one block
//! terminator.

use xlat_types::Width;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// Architectural register, by the guest's own numbering.
    Guest(u16),
    /// Block-local temporary.
    Temp(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

impl BinOp {
    #[inline]
    pub fn eval(self, a: u64, b: u64) -> u64 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::And => a & b,
            BinOp::Or => a | b,
            BinOp::Xor => a ^ b,
            BinOp::Shl => a.wrapping_shl((b & 63) as u32),
            BinOp::Shr => a.wrapping_shr((b & 63) as u32),
            BinOp::Sar => ((a as i64).wrapping_shr((b & 63) as u32)) as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    /// Signed less-than.
    Lt,
    /// Signed greater-or-equal.
    Ge,
    /// Unsigned less-than.
    Ltu,
    /// Unsigned greater-or-equal.
    Geu,
}

impl Cond {
    #[inline]
    pub fn eval(self, a: u64, b: u64) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => (a as i64) < (b as i64),
            Cond::Ge => (a as i64) >= (b as i64),
            Cond::Ltu => a < b,
            Cond::Geu => a >= b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrOp {
    /// Start of a guest instruction; anchors the pc/host-offset search table.
    InsnStart { pc: u64, size: u32 },
    /// Call `CODE` hooks for the instruction at `pc`.
    HookCode { pc: u64, size: u32 },
    /// Call `BLOCK` hooks for the block at `pc` (`size` guest bytes).
    HookBlock { pc: u64, size: u32 },
    MovImm { dst: Reg, imm: u64 },
    Mov { dst: Reg, src: Reg },
    Bin { op: BinOp, dst: Reg, a: Reg, b: Reg },
    BinImm { op: BinOp, dst: Reg, a: Reg, imm: u64 },
    /// `dst = mem[addr + offset]`, zero- or sign-extended.
    Load {
        dst: Reg,
        addr: Reg,
        offset: i64,
        width: Width,
        signed: bool,
    },
    /// `mem[addr + offset] = src`.
    Store {
        src: Reg,
        addr: Reg,
        offset: i64,
        width: Width,
    },
    /// Call instruction hooks registered for `id`.
    InsnHook { id: u32 },
}

/// How control leaves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    /// Unconditional direct jump. `chain` permits patching the jump to go straight
    /// to the successor block.
    Jump { target: u64, chain: bool },
    /// Conditional direct branch on `cond(a, b)`.
    Branch {
        cond: Cond,
        a: Reg,
        b: Reg,
        taken: u64,
        not_taken: u64,
        chain_taken: bool,
        chain_not_taken: bool,
    },
    /// Jump to the address held in a register.
    Indirect { target: Reg },
    /// Return to the dispatch loop with pc set to `next_pc`.
    Exit { next_pc: u64 },
    /// Raise exception `excp` with pc set to `pc`.
    Raise { excp: u32, pc: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnInfo {
    pub pc: u64,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrBlock {
    pub pc: u64,
    pub ops: Vec<IrOp>,
    pub end: BlockEnd,
    /// Guest instructions in order. Every entry has a matching `InsnStart` op.
    pub insns: Vec<InsnInfo>,
    /// Number of temporaries used.
    pub temps: u16,
}

impl IrBlock {
    pub fn new(pc: u64) -> Self {
        Self {
            pc,
            ops: Vec::new(),
            end: BlockEnd::Exit { next_pc: pc },
            insns: Vec::new(),
            temps: 0,
        }
    }

    /// Guest bytes covered by the block.
    pub fn guest_size(&self) -> u32 {
        self.insns
            .last()
            .map(|last| (last.pc + last.size as u64 - self.pc) as u32)
            .unwrap_or(0)
    }

    pub fn icount(&self) -> u32 {
        self.insns.len() as u32
    }

    /// Allocate a fresh temporary.
    pub fn temp(&mut self) -> Reg {
        let t = Reg::Temp(self.temps);
        self.temps += 1;
        t
    }

    /// Open a new guest instruction.
    pub fn start_insn(&mut self, pc: u64, size: u32) {
        self.insns.push(InsnInfo { pc, size });
        self.ops.push(IrOp::InsnStart { pc, size });
    }

    pub fn push(&mut self, op: IrOp) {
        self.ops.push(op);
    }

    /// Clear chaining permission on every direct exit that `allow` rejects.
    pub fn restrict_chaining(&mut self, allow: impl Fn(u64) -> bool) {
        match &mut self.end {
            BlockEnd::Jump { target, chain } => *chain &= allow(*target),
            BlockEnd::Branch {
                taken,
                not_taken,
                chain_taken,
                chain_not_taken,
                ..
            } => {
                *chain_taken &= allow(*taken);
                *chain_not_taken &= allow(*not_taken);
            }
            BlockEnd::Indirect { .. } | BlockEnd::Exit { .. } | BlockEnd::Raise { .. } => {}
        }
    }
}
