//! Shared vocabulary for the translation engine: page geometry, access kinds,
//! permissions, access widths and exception numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Number of privilege levels the soft-MMU keeps separate TLB banks for.
pub const MMU_MODES: usize = 4;

/// Exception numbers at or above this value are engine-internal loop exits,
/// never delivered to the guest.
pub const EXCP_INTERRUPT: u32 = 0x10000;
/// `hlt`-style instruction executed; the CPU enters the halted state.
pub const EXCP_HLT: u32 = 0x10001;
/// Debug trap (breakpoint or single-step).
pub const EXCP_DEBUG: u32 = 0x10002;
/// CPU is halted and has nothing to do.
pub const EXCP_HALTED: u32 = 0x10003;

#[inline]
pub const fn page_base(addr: u64) -> u64 {
    addr & PAGE_MASK
}

#[inline]
pub const fn page_offset(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

#[inline]
pub const fn page_number(addr: u64) -> u64 {
    addr >> PAGE_BITS
}

#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    page_offset(addr) == 0
}

/// True if `[addr, addr + len)` touches more than one page.
#[inline]
pub const fn crosses_page(addr: u64, len: u64) -> bool {
    len != 0 && page_offset(addr) + len > PAGE_SIZE
}

bitflags::bitflags! {
    /// Guest-visible protection bits for a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Perm: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Perm {
    pub const RW: Perm = Perm::READ.union(Perm::WRITE);
    pub const RX: Perm = Perm::READ.union(Perm::EXEC);
    pub const RWX: Perm = Perm::all();

    /// Whether these permissions allow an access of `kind`.
    #[inline]
    pub fn allows(self, kind: AccessKind) -> bool {
        self.contains(kind.required_perm())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

impl AccessKind {
    #[inline]
    pub fn required_perm(self) -> Perm {
        match self {
            AccessKind::Read => Perm::READ,
            AccessKind::Write => Perm::WRITE,
            AccessKind::Fetch => Perm::EXEC,
        }
    }

    /// The fault this access raises when no region backs the address.
    #[inline]
    pub fn unmapped_fault(self) -> FaultKind {
        match self {
            AccessKind::Read => FaultKind::ReadUnmapped,
            AccessKind::Write => FaultKind::WriteUnmapped,
            AccessKind::Fetch => FaultKind::FetchUnmapped,
        }
    }

    /// The fault this access raises when the region denies it.
    #[inline]
    pub fn protection_fault(self) -> FaultKind {
        match self {
            AccessKind::Read => FaultKind::ReadProtected,
            AccessKind::Write => FaultKind::WriteProtected,
            AccessKind::Fetch => FaultKind::FetchProtected,
        }
    }
}

/// Memory fault classes surfaced by the soft-MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    FetchUnmapped,
    FetchProtected,
    ReadUnmapped,
    ReadProtected,
    WriteUnmapped,
    WriteProtected,
}

impl FaultKind {
    pub fn access(self) -> AccessKind {
        match self {
            FaultKind::FetchUnmapped | FaultKind::FetchProtected => AccessKind::Fetch,
            FaultKind::ReadUnmapped | FaultKind::ReadProtected => AccessKind::Read,
            FaultKind::WriteUnmapped | FaultKind::WriteProtected => AccessKind::Write,
        }
    }

    pub fn is_unmapped(self) -> bool {
        matches!(
            self,
            FaultKind::FetchUnmapped | FaultKind::ReadUnmapped | FaultKind::WriteUnmapped
        )
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FaultKind::FetchUnmapped => "fetch from unmapped memory",
            FaultKind::FetchProtected => "fetch from non-executable memory",
            FaultKind::ReadUnmapped => "read from unmapped memory",
            FaultKind::ReadProtected => "read from non-readable memory",
            FaultKind::WriteUnmapped => "write to unmapped memory",
            FaultKind::WriteProtected => "write to non-writable memory",
        };
        f.write_str(s)
    }
}

/// Size of a single guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Width {
    W8 = 1,
    W16 = 2,
    W32 = 4,
    W64 = 8,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    pub const fn from_bytes(n: usize) -> Option<Width> {
        match n {
            1 => Some(Width::W8),
            2 => Some(Width::W16),
            4 => Some(Width::W32),
            8 => Some(Width::W64),
            _ => None,
        }
    }

    /// Mask selecting the low `bytes() * 8` bits of a value.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            Width::W64 => u64::MAX,
            w => (1u64 << (w.bytes() * 8)) - 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Assemble a value from `bytes` (exactly `bytes.len()` <= 8 bytes).
    pub fn load(self, bytes: &[u8]) -> u64 {
        let mut v = 0u64;
        match self {
            Endian::Little => {
                for (i, b) in bytes.iter().enumerate() {
                    v |= (*b as u64) << (i * 8);
                }
            }
            Endian::Big => {
                for b in bytes {
                    v = (v << 8) | *b as u64;
                }
            }
        }
        v
    }

    /// Scatter the low `out.len()` bytes of `value` into `out`.
    pub fn store(self, value: u64, out: &mut [u8]) {
        let n = out.len();
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = match self {
                Endian::Little => i * 8,
                Endian::Big => (n - 1 - i) * 8,
            };
            *slot = (value >> shift) as u8;
        }
    }
}
