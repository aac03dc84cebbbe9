use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::TbId;

/// Cooperative cancellation flag shared between the driving thread, compiled
/// code and the timeout thread.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbExitReason {
    /// Left through unpatched direct-jump slot `slot`; the loop may link it.
    Chain { slot: u8 },
    /// Left through an exit that can never be chained.
    NoChain,
    /// A stop or exit was requested mid-block.
    Requested,
    /// The block was not entered for lack of instruction budget.
    CountExpired,
}

/// Decoded exit word returned by [`Backend::execute`](crate::Backend::execute).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbExit {
    /// The block that exited (or, for `CountExpired`, the block that was refused).
    pub tb: Option<TbId>,
    pub reason: TbExitReason,
}

const REASON_MASK: u64 = 0x7;
const SLOT_SHIFT: u32 = 4;

impl TbExit {
    pub fn new(tb: TbId, reason: TbExitReason) -> Self {
        Self {
            tb: Some(tb),
            reason,
        }
    }

    /// Bits 0..3 reason, 4..6 slot, 16..64 raw [`TbId`].
    pub fn pack(self) -> u64 {
        let (code, slot) = match self.reason {
            TbExitReason::NoChain => (0u64, 0u64),
            TbExitReason::Chain { slot } => (1, slot as u64),
            TbExitReason::Requested => (2, 0),
            TbExitReason::CountExpired => (3, 0),
        };
        let raw = self.tb.map(TbId::to_raw).unwrap_or(0);
        (raw << 16) | (slot << SLOT_SHIFT) | code
    }

    pub fn unpack(word: u64) -> TbExit {
        let reason = match word & REASON_MASK {
            1 => TbExitReason::Chain {
                slot: ((word >> SLOT_SHIFT) & 0x3) as u8,
            },
            2 => TbExitReason::Requested,
            3 => TbExitReason::CountExpired,
            _ => TbExitReason::NoChain,
        };
        TbExit {
            tb: TbId::from_raw(word >> 16),
            reason,
        }
    }
}
