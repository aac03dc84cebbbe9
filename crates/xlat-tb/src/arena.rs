use crate::traits::CompileError;
use crate::TbId;

/// Size of a direct-jump slot inside compiled code.
///
/// Layout (little-endian): `[0..8)` target code offset, `[8..16)` raw target
/// [`TbId`]. An unpatched slot holds `u64::MAX` and `0`. Back ends reserve the slot
/// in their code and read it at run time; only the cache writes it.
pub const JUMP_SLOT_SIZE: usize = 16;

const UNPATCHED: u64 = u64::MAX;

/// Bytes of a freshly reserved, unpatched jump slot.
pub const EMPTY_JUMP_SLOT: [u8; JUMP_SLOT_SIZE] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// A decoded jump slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpSlot {
    pub code_offset: usize,
    pub tb: TbId,
}

/// Decode the slot at `bytes[..JUMP_SLOT_SIZE]`; `None` if unpatched.
#[inline]
pub fn read_jump_slot(bytes: &[u8]) -> Option<JumpSlot> {
    let off = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
    if off == UNPATCHED {
        return None;
    }
    let tb = TbId::from_raw(u64::from_le_bytes(bytes[8..16].try_into().ok()?))?;
    Some(JumpSlot {
        code_offset: off as usize,
        tb,
    })
}

/// Growable buffer holding compiled code, capped at a fixed capacity.
#[derive(Debug)]
pub struct CodeArena {
    buf: Vec<u8>,
    cap: usize,
}

impl CodeArena {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap.min(1 << 20)),
            cap,
        }
    }

    /// Offset the next `emit` writes at.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn remaining(&self) -> usize {
        self.cap - self.buf.len()
    }

    /// Append bytes, failing with [`CompileError::Overflow`] past the cap.
    pub fn emit(&mut self, bytes: &[u8]) -> Result<usize, CompileError> {
        if bytes.len() > self.remaining() {
            return Err(CompileError::Overflow);
        }
        let at = self.buf.len();
        self.buf.extend_from_slice(bytes);
        Ok(at)
    }

    /// Reserve an unpatched jump slot and return its offset.
    pub fn emit_jump_slot(&mut self) -> Result<usize, CompileError> {
        self.emit(&EMPTY_JUMP_SLOT)
    }

    /// Drop everything at or past `offset`.
    pub fn truncate(&mut self, offset: usize) {
        self.buf.truncate(offset);
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn patch_jump(&mut self, slot_offset: usize, target: Option<JumpSlot>) {
        let (off, raw) = match target {
            Some(t) => (t.code_offset as u64, t.tb.to_raw()),
            None => (UNPATCHED, 0),
        };
        self.buf[slot_offset..slot_offset + 8].copy_from_slice(&off.to_le_bytes());
        self.buf[slot_offset + 8..slot_offset + 16].copy_from_slice(&raw.to_le_bytes());
    }

    pub(crate) fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[offset..offset + len]
    }
}
