use thiserror::Error;
use xlat_types::{FaultKind, Width};

use crate::arena::CodeArena;
use crate::exit::StopToken;
use crate::ir::IrBlock;
use crate::TbId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("code arena exhausted")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("instruction fetch at {addr:#x} failed: {fault}")]
    Fetch { addr: u64, fault: FaultKind },
    #[error("invalid instruction at {pc:#x}")]
    InvalidInstruction { pc: u64 },
}

/// What the front end may ask of the engine while decoding a block.
pub trait TranslateCtx {
    /// Read guest code bytes. `addr..addr + buf.len()` never crosses a page.
    fn fetch(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), FaultKind>;
    /// Whether a `CODE` hook covers `pc`.
    fn wants_code_hook(&self, pc: u64) -> bool;
    /// Whether a `BLOCK` hook covers `pc`.
    fn wants_block_hook(&self, pc: u64) -> bool;
    /// Whether an instruction hook exists for instruction id `id`.
    fn wants_insn_hook(&self, id: u32) -> bool;
    /// Whether execution must return to the caller before running `pc`.
    fn is_exit(&self, pc: u64) -> bool;
}

/// Per-architecture decoder: guest bytes to [`IrBlock`].
///
/// A block ends at a control transfer, before an exit address, after `max_insns`
/// instructions, or before an instruction it cannot fetch or decode. Failures on
/// the first instruction are reported as errors.
pub trait FrontEnd {
    fn decode(
        &self,
        ctx: &mut dyn TranslateCtx,
        pc: u64,
        flags: u32,
        max_insns: u32,
    ) -> Result<IrBlock, DecodeError>;
}

/// Result of lowering one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCode {
    /// Arena offset of the entry point.
    pub offset: usize,
    pub size: usize,
    /// Offset of each guest instruction's code, relative to `offset`.
    pub insn_offsets: Vec<u32>,
    /// Offset of each direct-jump slot relative to `offset`, by slot number.
    pub jump_slots: [Option<u32>; 2],
}

/// Outcome of entering a block from compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntry {
    Run,
    /// An exit was requested; leave with `Requested`.
    Exit,
    /// Not enough instruction budget left for the whole block.
    CountExpired,
}

/// Services compiled code calls back into.
pub trait ExecEnv {
    /// The whole code arena.
    fn code(&self) -> &[u8];
    fn read_reg(&self, reg: u16) -> u64;
    fn write_reg(&mut self, reg: u16, value: u64);
    fn set_pc(&mut self, pc: u64);
    /// Guest load. `None` means the access faulted and was not resolved; the caller
    /// must leave the block. `host_pc` is the arena offset of the faulting code.
    fn load(&mut self, addr: u64, width: Width, host_pc: usize) -> Option<u64>;
    /// Guest store; `false` on an unresolved fault.
    fn store(&mut self, addr: u64, width: Width, value: u64, host_pc: usize) -> bool;
    fn hook_code(&mut self, pc: u64, size: u32);
    fn hook_block(&mut self, pc: u64, size: u32);
    fn insn_hook(&mut self, id: u32, host_pc: usize);
    /// Raise an exception; the block then exits.
    fn raise_exception(&mut self, excp: u32);
    /// Called before running any block, including chained ones.
    fn enter_block(&mut self, tb: TbId) -> BlockEntry;
    /// Engine-internal request to leave compiled code (current block invalidated,
    /// interrupt raised, pc changed from a hook).
    fn exit_requested(&self) -> bool;
}

/// Lowers IR into the arena and runs it.
pub trait Backend {
    /// Compile `block` at the arena cursor. Must leave the arena untouched on error.
    fn compile(&self, block: &IrBlock, arena: &mut CodeArena) -> Result<CompiledCode, CompileError>;

    /// Run the block `tb` whose code starts at `entry`, following patched jump
    /// slots, until some block exits. Returns a packed [`TbExit`](crate::TbExit).
    ///
    /// `stop` is checked on every block entry and after every hook or memory
    /// helper call.
    fn execute(&self, tb: TbId, entry: usize, env: &mut dyn ExecEnv, stop: &StopToken) -> u64;
}
