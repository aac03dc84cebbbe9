//! The translation engine proper: one guest CPU, its memory map, soft-MMU, hooks
//! and translation cache, driven by [`Emu::start`].
//!
//! Everything lives in one [`Emu`] value owned by the caller. Hooks receive
//! `&mut Emu` and may call back into most of its API (map memory, change
//! registers, stop); [`Emu::start`] itself is not re-entrant.

mod config;
mod cpu;
mod cpu_exec;
mod emu;
mod error;
mod softmmu;
mod timer;
mod translate;

pub use config::EngineConfig;
pub use cpu::GuestCpu;
pub use emu::{Emu, ExecStats, InterruptRequest, Stats, StopHandle, TbInfo};
pub use error::{EmuError, FaultRecord, StopReason};

pub use xlat_hooks::{HookFn, HookHandle, HookOrder, HookRange, HookSpec, HookType, MemAccess};
pub use xlat_mem::{HostAddr, IoError, IoHandler, MappedRegion, ScratchDevice};
pub use xlat_mmu::{MmuStats, TlbConfig, Translation, TLB_SETS};
pub use xlat_tb::TbStats;
pub use xlat_types::{AccessKind, FaultKind, Perm};

#[cfg(test)]
mod tests;
