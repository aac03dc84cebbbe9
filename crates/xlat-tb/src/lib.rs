//! Translation-block cache: the IR contract between front and back ends, the code
//! arena compiled blocks live in, and the indices that find, chain and invalidate
//! them.
//!
//! Blocks are addressed by [`TbId`] handles (slot index + slot generation) rather
//! than pointers; a handle to an invalidated block simply stops resolving.

mod arena;
mod cache;
mod exit;
mod ir;
mod jmp_cache;
mod page;
mod search;
mod traits;

pub use arena::{read_jump_slot, CodeArena, JumpSlot, EMPTY_JUMP_SLOT, JUMP_SLOT_SIZE};
pub use cache::{BuildOutcome, Invalidated, TbCache, TbCacheConfig, TbStats, TranslationBlock};
pub use exit::{StopToken, TbExit, TbExitReason};
pub use ir::{BinOp, BlockEnd, Cond, InsnInfo, IrBlock, IrOp, Reg};
pub use page::PageIndex;
pub use traits::{Backend, BlockEntry, CompileError, CompiledCode, DecodeError, ExecEnv, FrontEnd, TranslateCtx};

use std::fmt;

/// Handle to a translation block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TbId {
    pub index: u32,
    pub generation: u16,
}

impl fmt::Debug for TbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TbId({}v{})", self.index, self.generation)
    }
}

impl TbId {
    /// Non-zero 48-bit encoding used in jump slots and exit words.
    #[inline]
    pub fn to_raw(self) -> u64 {
        ((self.index as u64 + 1) << 16) | self.generation as u64
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Option<TbId> {
        let index = raw >> 16;
        if index == 0 || index > u32::MAX as u64 + 1 {
            return None;
        }
        Some(TbId {
            index: (index - 1) as u32,
            generation: raw as u16,
        })
    }
}

/// Per-compile modifiers. Two blocks for the same pc with different hashed
/// cflags are not interchangeable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CFlags(pub u32);

impl CFlags {
    /// Instruction limit for the block; 0 means the configured default.
    pub const COUNT_MASK: u32 = 0x0000_ffff;
    /// One-shot block: not entered into the hash or page indices, discarded after use.
    pub const NOCACHE: u32 = 0x0001_0000;
    /// Single-instruction blocks for single-stepping.
    pub const SINGLE_STEP: u32 = 0x0002_0000;
    /// Never patch direct jumps out of this block.
    pub const NO_GOTO_TB: u32 = 0x0004_0000;
    /// Bits that take part in hash lookup.
    pub const HASH_MASK: u32 = Self::COUNT_MASK | Self::SINGLE_STEP | Self::NO_GOTO_TB;

    pub const fn with_count(count: u32) -> CFlags {
        CFlags(count & Self::COUNT_MASK)
    }

    #[inline]
    pub fn count(self) -> u32 {
        self.0 & Self::COUNT_MASK
    }

    #[inline]
    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    pub fn with(self, bit: u32) -> CFlags {
        CFlags(self.0 | bit)
    }

    #[inline]
    pub fn hashed(self) -> CFlags {
        CFlags(self.0 & Self::HASH_MASK)
    }

    /// Effective instruction budget for a block compiled with these flags.
    pub fn max_insns(self, default: u32) -> u32 {
        if self.has(Self::SINGLE_STEP) {
            return 1;
        }
        match self.count() {
            0 => default.max(1),
            n => n.min(default.max(1)),
        }
    }
}

impl fmt::Debug for CFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CFlags(count={}", self.count())?;
        for (bit, name) in [
            (Self::NOCACHE, "nocache"),
            (Self::SINGLE_STEP, "single_step"),
            (Self::NO_GOTO_TB, "no_goto_tb"),
        ] {
            if self.has(bit) {
                write!(f, "|{name}")?;
            }
        }
        f.write_str(")")
    }
}

/// Whether a direct jump from the block starting at `from_pc` may be patched to
/// go straight to `to_pc`. Only same-page targets are chained.
#[inline]
pub fn can_chain(from_pc: u64, to_pc: u64) -> bool {
    xlat_types::page_base(from_pc) == xlat_types::page_base(to_pc)
}

#[cfg(test)]
mod tests;
