use thiserror::Error;
use xlat_hooks::HookError;
use xlat_mem::MapError;
use xlat_types::FaultKind;

/// Why [`Emu::start`](crate::Emu::start) returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`Emu::stop`](crate::Emu::stop) or a [`StopHandle`](crate::StopHandle).
    Stopped,
    /// The instruction budget passed to `start` is used up.
    CountExpired,
    Timeout,
    /// The guest halted and has no pending work.
    Halted,
    /// Execution reached the `until` address.
    UntilReached,
    /// The guest hit a breakpoint instruction.
    DebugTrap,
    /// An interrupt request asked the loop to return.
    Interrupted,
    /// The CPU raised exception `intno` in a mode that hands exceptions to the caller.
    Exception { intno: u32 },
}

/// A memory fault no hook resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub addr: u64,
    pub size: usize,
    /// Guest pc of the faulting instruction.
    pub pc: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmuError {
    #[error("emulation is already running")]
    Busy,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error("unhandled {} at {:#x} (size {}, pc {:#x})", .0.kind, .0.addr, .0.size, .0.pc)]
    Fault(FaultRecord),
    #[error("invalid instruction at {pc:#x}")]
    InvalidInstruction { pc: u64 },
    #[error("unhandled interrupt {intno:#x}")]
    UnhandledInterrupt { intno: u32 },
    #[error("no register {0}")]
    InvalidRegister(u16),
}

impl EmuError {
    /// The fault class, for memory faults.
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            EmuError::Fault(record) => Some(record.kind),
            _ => None,
        }
    }
}
