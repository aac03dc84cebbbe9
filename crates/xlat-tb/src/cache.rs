use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use xlat_types::{page_base, PAGE_SIZE};

use crate::arena::{CodeArena, JumpSlot};
use crate::ir::IrBlock;
use crate::jmp_cache::JumpCache;
use crate::page::PageIndex;
use crate::search;
use crate::traits::{Backend, CompileError, CompiledCode};
use crate::{can_chain, CFlags, TbId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TbCacheConfig {
    /// Code arena capacity in bytes.
    pub code_buffer_size: usize,
    /// Default per-block instruction limit.
    pub max_insns: u32,
    /// Writes to a code page before a code bitmap is built for it.
    pub smc_bitmap_threshold: u32,
}

impl Default for TbCacheConfig {
    fn default() -> Self {
        Self {
            code_buffer_size: 32 * 1024 * 1024,
            max_insns: 512,
            smc_bitmap_threshold: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranslationBlock {
    pub pc: u64,
    /// Guest-physical pc. Identical to `pc` under the identity-mapped soft-MMU.
    pub phys_pc: u64,
    pub flags: u32,
    pub cflags: CFlags,
    /// Guest bytes covered.
    pub size: u32,
    pub icount: u32,
    /// First and (for blocks straddling a page boundary) second page.
    pub page_addr: [Option<u64>; 2],
    pub code_offset: usize,
    pub code_size: usize,
    search_offset: usize,
    search_len: usize,
    jump_slots: [Option<u32>; 2],
    jmp_dest: [Option<TbId>; 2],
    /// Blocks whose jump slots point here: `(source, slot)`.
    incoming: Vec<(TbId, u8)>,
    valid: bool,
}

impl TranslationBlock {
    /// Whether the guest byte range `[begin, end)` intersects this block's code.
    pub fn overlaps(&self, begin: u64, end: u64) -> bool {
        let tb_end = self.pc + self.size as u64;
        self.pc < end && begin < tb_end
    }

    pub fn jmp_dest(&self, slot: u8) -> Option<TbId> {
        self.jmp_dest.get(slot as usize).copied().flatten()
    }

    pub fn has_jump_slot(&self, slot: u8) -> bool {
        self.jump_slots.get(slot as usize).copied().flatten().is_some()
    }

    pub fn incoming(&self) -> &[(TbId, u8)] {
        &self.incoming
    }

    fn key(&self) -> TbKey {
        TbKey {
            phys_pc: self.phys_pc,
            pc: self.pc,
            flags: self.flags,
            cflags: self.cflags.hashed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TbKey {
    phys_pc: u64,
    pc: u64,
    flags: u32,
    cflags: CFlags,
}

#[derive(Debug)]
struct Slot {
    generation: u16,
    tb: Option<TranslationBlock>,
}

/// Counters. Always collected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TbStats {
    pub generated: u64,
    pub lookups: u64,
    pub hits: u64,
    pub jmp_cache_hits: u64,
    pub duplicates: u64,
    pub invalidations: u64,
    pub flushes: u64,
    pub overflow_flushes: u64,
    pub links: u64,
    pub unlinks: u64,
    pub bitmap_skips: u64,
}

/// Result of [`TbCache::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOutcome {
    pub tb: TbId,
    /// The arena overflowed and the whole cache was flushed before the retry.
    pub flushed: bool,
}

/// Result of an invalidation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Invalidated {
    pub tbs: Vec<TbId>,
    /// Pages that held code before and hold none now.
    pub code_free_pages: Vec<u64>,
}

impl Invalidated {
    fn merge(&mut self, other: Invalidated) {
        self.tbs.extend(other.tbs);
        for p in other.code_free_pages {
            if !self.code_free_pages.contains(&p) {
                self.code_free_pages.push(p);
            }
        }
    }

    pub fn contains(&self, tb: TbId) -> bool {
        self.tbs.contains(&tb)
    }

    pub fn is_empty(&self) -> bool {
        self.tbs.is_empty()
    }
}

/// Owner of all translation blocks and the code arena.
#[derive(Debug)]
pub struct TbCache {
    config: TbCacheConfig,
    arena: CodeArena,
    slots: Vec<Slot>,
    free: Vec<u32>,
    hash: FxHashMap<TbKey, TbId>,
    /// Code offset → block, for host-pc reverse lookup.
    tree: BTreeMap<usize, TbId>,
    pages: PageIndex,
    jmp_cache: JumpCache,
    generation: u64,
    live: usize,
    stats: TbStats,
}

impl TbCache {
    pub fn new(config: &TbCacheConfig) -> Self {
        Self {
            config: *config,
            arena: CodeArena::new(config.code_buffer_size),
            slots: Vec::new(),
            free: Vec::new(),
            hash: FxHashMap::default(),
            tree: BTreeMap::new(),
            pages: PageIndex::new(),
            jmp_cache: JumpCache::new(),
            generation: 0,
            live: 0,
            stats: TbStats::default(),
        }
    }

    pub fn config(&self) -> &TbCacheConfig {
        &self.config
    }

    #[inline]
    pub fn code(&self) -> &[u8] {
        self.arena.bytes()
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    pub fn pages(&self) -> &PageIndex {
        &self.pages
    }

    #[inline]
    pub fn has_code(&self, page: u64) -> bool {
        self.pages.has_code(page)
    }

    /// Bumped on every invalidation and flush.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of valid blocks.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn stats(&self) -> TbStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = TbStats::default();
    }

    #[inline]
    pub fn get(&self, id: TbId) -> Option<&TranslationBlock> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.tb.as_ref().filter(|tb| tb.valid)
    }

    fn get_mut(&mut self, id: TbId) -> Option<&mut TranslationBlock> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.tb.as_mut().filter(|tb| tb.valid)
    }

    /// Hash-index lookup.
    pub fn lookup(&mut self, pc: u64, flags: u32, cflags: CFlags) -> Option<TbId> {
        self.stats.lookups = self.stats.lookups.wrapping_add(1);
        let key = TbKey {
            phys_pc: pc,
            pc,
            flags,
            cflags: cflags.hashed(),
        };
        let id = *self.hash.get(&key)?;
        debug_assert!(self.get(id).is_some(), "hash index holds invalid block {id:?}");
        self.stats.hits = self.stats.hits.wrapping_add(1);
        Some(id)
    }

    /// Jump-cache lookup falling back to the hash index (and refilling the jump cache).
    pub fn lookup_cached(&mut self, pc: u64, flags: u32, cflags: CFlags) -> Option<TbId> {
        let cflags = cflags.hashed();
        if let Some(id) = self.jmp_cache.get(pc, flags, cflags, self.generation) {
            if self.get(id).is_some() {
                self.stats.jmp_cache_hits = self.stats.jmp_cache_hits.wrapping_add(1);
                return Some(id);
            }
        }
        let id = self.lookup(pc, flags, cflags)?;
        self.jmp_cache.set(pc, flags, cflags, id, self.generation);
        Some(id)
    }

    fn compile_into_arena(
        &mut self,
        backend: &dyn Backend,
        block: &IrBlock,
    ) -> Result<(CompiledCode, usize, usize), CompileError> {
        let code = backend.compile(block, &mut self.arena)?;
        let table = search::encode(
            block.pc,
            block
                .insns
                .iter()
                .zip(code.insn_offsets.iter())
                .map(|(insn, off)| (insn.pc, *off)),
        );
        match self.arena.emit(&table) {
            Ok(at) => Ok((code, at, table.len())),
            Err(e) => {
                self.arena.truncate(code.offset);
                Err(e)
            }
        }
    }

    fn alloc_slot(&mut self, tb: TranslationBlock) -> TbId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.tb = Some(tb);
            return TbId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            tb: Some(tb),
        });
        TbId {
            index,
            generation: 0,
        }
    }

    fn release_slot(&mut self, id: TbId) {
        let slot = &mut self.slots[id.index as usize];
        slot.tb = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
    }

    /// Compile `block` and enter it into the indices.
    ///
    /// On arena exhaustion the whole cache is flushed and compilation retried once.
    /// A block that does not fit an empty arena is an engine configuration bug and
    /// panics. If an equivalent block is already cached, the new code is discarded
    /// and the existing block returned.
    pub fn build(
        &mut self,
        mut block: IrBlock,
        backend: &dyn Backend,
        flags: u32,
        cflags: CFlags,
    ) -> BuildOutcome {
        assert!(!block.insns.is_empty(), "empty block at {:#x}", block.pc);
        let pc = block.pc;
        if cflags.has(CFlags::NO_GOTO_TB) || cflags.has(CFlags::NOCACHE) {
            block.restrict_chaining(|_| false);
        } else {
            block.restrict_chaining(|target| can_chain(pc, target));
        }

        let mut flushed = false;
        let (code, search_offset, search_len) = match self.compile_into_arena(backend, &block) {
            Ok(c) => c,
            Err(CompileError::Overflow) => {
                debug!(pc, "code arena full, flushing translation cache");
                self.flush();
                self.stats.overflow_flushes = self.stats.overflow_flushes.wrapping_add(1);
                flushed = true;
                match self.compile_into_arena(backend, &block) {
                    Ok(c) => c,
                    Err(e) => panic!(
                        "block at {pc:#x} does not fit an empty code arena of {} bytes: {e}",
                        self.arena.capacity()
                    ),
                }
            }
        };

        let size = block.guest_size();
        let first = page_base(pc);
        let last = page_base(pc + size as u64 - 1);
        let tb = TranslationBlock {
            pc,
            phys_pc: pc,
            flags,
            cflags,
            size,
            icount: block.icount(),
            page_addr: [Some(first), (last != first).then_some(last)],
            code_offset: code.offset,
            code_size: code.size,
            search_offset,
            search_len,
            jump_slots: code.jump_slots,
            jmp_dest: [None; 2],
            incoming: Vec::new(),
            valid: true,
        };

        let key = tb.key();
        if !cflags.has(CFlags::NOCACHE) {
            if let Some(&existing) = self.hash.get(&key) {
                if self.get(existing).is_some() {
                    if self.arena.cursor() == search_offset + search_len {
                        self.arena.truncate(code.offset);
                    }
                    self.stats.duplicates = self.stats.duplicates.wrapping_add(1);
                    return BuildOutcome {
                        tb: existing,
                        flushed,
                    };
                }
            }
        }

        let pages = tb.page_addr;
        let id = self.alloc_slot(tb);
        if !cflags.has(CFlags::NOCACHE) {
            self.hash.insert(key, id);
        }
        self.tree.insert(code.offset, id);
        for (slot, page) in pages.iter().enumerate() {
            if let Some(page) = page {
                self.pages.add(*page, id, slot as u8);
            }
        }
        self.live += 1;
        self.stats.generated = self.stats.generated.wrapping_add(1);
        trace!(pc, ?id, size, code_size = code.size, ?cflags, "translated block");
        BuildOutcome { tb: id, flushed }
    }

    /// Patch jump slot `slot` of `from` to enter `to` directly.
    ///
    /// Returns `false` (and changes nothing) if either block is gone or `from` has
    /// no such slot.
    pub fn link(&mut self, from: TbId, slot: u8, to: TbId) -> bool {
        let Some(target) = self.get(to).map(|t| t.code_offset) else {
            return false;
        };
        let Some(src) = self.get(from) else {
            return false;
        };
        let Some(slot_off) = src.jump_slots.get(slot as usize).copied().flatten() else {
            return false;
        };
        let src_code = src.code_offset;
        let current = src.jmp_dest[slot as usize];
        match current {
            Some(cur) if cur == to => return true,
            Some(cur) => self.unlink(from, slot, cur),
            None => {}
        }

        self.arena.patch_jump(
            src_code + slot_off as usize,
            Some(JumpSlot {
                code_offset: target,
                tb: to,
            }),
        );
        if let Some(src) = self.get_mut(from) {
            src.jmp_dest[slot as usize] = Some(to);
        }
        if let Some(dst) = self.get_mut(to) {
            dst.incoming.push((from, slot));
        }
        self.stats.links = self.stats.links.wrapping_add(1);
        true
    }

    /// Clear `from`'s record of slot `slot` and return the slot's arena offset.
    fn reset_slot(&mut self, from: TbId, slot: u8) -> Option<usize> {
        let src = self.get_mut(from)?;
        src.jmp_dest[slot as usize] = None;
        src.jump_slots[slot as usize].map(|off| src.code_offset + off as usize)
    }

    fn unlink(&mut self, from: TbId, slot: u8, to: TbId) {
        if let Some(at) = self.reset_slot(from, slot) {
            self.arena.patch_jump(at, None);
        }
        if let Some(dst) = self.get_mut(to) {
            dst.incoming.retain(|&(t, s)| !(t == from && s == slot));
        }
        self.stats.unlinks = self.stats.unlinks.wrapping_add(1);
    }

    /// Remove `id` from every index and unlink all jumps into and out of it.
    pub fn invalidate(&mut self, id: TbId) -> Invalidated {
        let mut out = Invalidated::default();
        let Some(tb) = self.get_mut(id) else {
            return out;
        };
        tb.valid = false;
        let key = tb.key();
        let code_offset = tb.code_offset;
        let pages = tb.page_addr;
        let incoming = std::mem::take(&mut tb.incoming);
        let outgoing = tb.jmp_dest;

        if self.hash.get(&key) == Some(&id) {
            self.hash.remove(&key);
        }
        if self.tree.get(&code_offset) == Some(&id) {
            self.tree.remove(&code_offset);
        }
        for page in pages.into_iter().flatten() {
            if self.pages.remove(page, id) {
                out.code_free_pages.push(page);
            }
        }

        for (src, slot) in incoming {
            if src == id {
                continue;
            }
            if let Some(at) = self.reset_slot(src, slot) {
                self.arena.patch_jump(at, None);
            }
            self.stats.unlinks = self.stats.unlinks.wrapping_add(1);
        }
        for (slot, dest) in outgoing.iter().enumerate() {
            if let Some(dest) = dest {
                if let Some(d) = self.get_mut(*dest) {
                    d.incoming.retain(|&(t, s)| !(t == id && s as usize == slot));
                }
            }
        }
        self.release_slot(id);
        self.live -= 1;
        // Retires every jump-cache hint at once.
        self.generation = self.generation.wrapping_add(1);
        self.stats.invalidations = self.stats.invalidations.wrapping_add(1);
        out.tbs.push(id);
        out
    }

    fn page_range(begin: u64, end: u64) -> impl Iterator<Item = u64> {
        let first = page_base(begin);
        let count = if end <= begin {
            0
        } else {
            (end - 1 - first) / PAGE_SIZE + 1
        };
        (0..count).map(move |i| first + i * PAGE_SIZE)
    }

    /// Invalidate blocks whose code intersects the guest range `[begin, end)`, as
    /// after a guest write. Pages with a code bitmap skip writes that provably miss
    /// all code.
    pub fn invalidate_range(&mut self, begin: u64, end: u64) -> Invalidated {
        let mut out = Invalidated::default();
        for page in Self::page_range(begin, end) {
            if !self.pages.has_code(page) {
                continue;
            }
            let lo = begin.max(page);
            let hi = end.min(page + PAGE_SIZE);
            if !self.pages.has_bitmap(page)
                && self.pages.note_write(page, self.config.smc_bitmap_threshold)
            {
                self.build_bitmap(page);
            }
            if !self.pages.may_hit_code(lo, hi - lo) {
                self.stats.bitmap_skips = self.stats.bitmap_skips.wrapping_add(1);
                continue;
            }
            let victims: Vec<TbId> = self
                .pages
                .tbs(page)
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| self.get(*id).is_some_and(|tb| tb.overlaps(lo, hi)))
                .collect();
            for id in victims {
                out.merge(self.invalidate(id));
            }
        }
        if !out.is_empty() {
            trace!(begin, end, count = out.tbs.len(), "invalidated blocks");
        }
        out
    }

    fn build_bitmap(&mut self, page: u64) {
        let ranges: Vec<(u64, u64)> = self
            .pages
            .tbs(page)
            .iter()
            .filter_map(|(id, _)| self.get(*id))
            .map(|tb| {
                let start = tb.pc.max(page) - page;
                let end = (tb.pc + tb.size as u64).min(page + PAGE_SIZE) - page;
                (start, end)
            })
            .collect();
        self.pages.set_bitmap(page, ranges.into_iter());
    }

    /// Invalidate every block overlapping the page containing `addr`.
    pub fn invalidate_page(&mut self, addr: u64) -> Invalidated {
        let page = page_base(addr);
        let mut out = Invalidated::default();
        let victims: Vec<TbId> = self.pages.tbs(page).iter().map(|(id, _)| *id).collect();
        for id in victims {
            out.merge(self.invalidate(id));
        }
        out
    }

    /// Drop every block and reset the arena.
    pub fn flush(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.tb.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.hash.clear();
        self.tree.clear();
        self.pages.clear();
        self.arena.reset();
        self.live = 0;
        self.generation = self.generation.wrapping_add(1);
        self.stats.flushes = self.stats.flushes.wrapping_add(1);
        debug!("translation cache flushed");
    }

    /// Block whose compiled code contains arena offset `offset`.
    pub fn find_by_host_offset(&self, offset: usize) -> Option<TbId> {
        let (&start, &id) = self.tree.range(..=offset).next_back()?;
        let tb = self.get(id)?;
        (offset < start + tb.code_size).then_some(id)
    }

    /// Recover `(guest pc, instruction index)` for arena offset `host_offset`
    /// inside block `id`.
    pub fn restore_state(&self, id: TbId, host_offset: usize) -> Option<(u64, u32)> {
        let tb = self.get(id)?;
        if host_offset < tb.code_offset || host_offset >= tb.code_offset + tb.code_size {
            return None;
        }
        let table = self.arena.slice(tb.search_offset, tb.search_len);
        search::restore(table, tb.pc, (host_offset - tb.code_offset) as u32)
    }

    /// Invalidate a one-shot block, reclaiming its arena space if it was the last
    /// thing allocated.
    pub fn discard(&mut self, id: TbId) -> Invalidated {
        let Some(tb) = self.get(id) else {
            return Invalidated::default();
        };
        let (start, end) = (tb.code_offset, tb.search_offset + tb.search_len);
        let out = self.invalidate(id);
        if self.arena.cursor() == end {
            self.arena.truncate(start);
        }
        out
    }
}
