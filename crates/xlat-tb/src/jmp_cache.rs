use crate::{CFlags, TbId};

const JMP_CACHE_BITS: u32 = 12;
const JMP_CACHE_SIZE: usize = 1 << JMP_CACHE_BITS;

#[derive(Debug, Clone, Copy)]
struct Entry {
    pc: u64,
    flags: u32,
    cflags: CFlags,
    tb: TbId,
    generation: u64,
}

/// Direct-mapped pc → block cache consulted before the hash index.
///
/// Entries are hints tagged with the cache generation they were filled under; any
/// invalidation or flush bumps the generation and retires them all at once. A hit
/// is still re-validated against the cache by the caller.
#[derive(Debug)]
pub(crate) struct JumpCache {
    entries: Box<[Option<Entry>]>,
}

#[inline]
fn index(pc: u64) -> usize {
    let h = (pc >> 2) ^ (pc >> (2 + JMP_CACHE_BITS as u64));
    (h as usize) & (JMP_CACHE_SIZE - 1)
}

impl JumpCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![None; JMP_CACHE_SIZE].into_boxed_slice(),
        }
    }

    pub(crate) fn get(&self, pc: u64, flags: u32, cflags: CFlags, generation: u64) -> Option<TbId> {
        match self.entries[index(pc)] {
            Some(e) if e.generation == generation && e.pc == pc && e.flags == flags && e.cflags == cflags => {
                Some(e.tb)
            }
            _ => None,
        }
    }

    pub(crate) fn set(&mut self, pc: u64, flags: u32, cflags: CFlags, tb: TbId, generation: u64) {
        self.entries[index(pc)] = Some(Entry {
            pc,
            flags,
            cflags,
            tb,
            generation,
        });
    }
}
