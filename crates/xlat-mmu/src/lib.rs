//! Soft-MMU: guest address → host RAM / device translation with a software TLB.
//!
//! Each privilege level owns a direct-mapped table of [`TLB_SETS`] entries plus a
//! small victim array. Entries carry per-class (read/write/fetch) permission tags,
//! an I/O marker and a "notdirty" marker that forces writes to pages holding
//! translated code onto the slow path.
//!
//! The guest address space is identity mapped onto the memory map: there are no
//! guest page tables, so "virtual" and "physical" addresses coincide.
//!
//! Hook policy (fault callbacks, retry) lives in the engine; this crate only
//! answers "hit / refilled / fault".

mod tlb;

use serde::{Deserialize, Serialize};
use tracing::trace;
use xlat_mem::{HostAddr, MemoryMap};
use xlat_types::{page_base, page_offset, AccessKind, FaultKind, MMU_MODES, PAGE_SIZE};

use tlb::{TlbBank, TlbEntry};

pub use tlb::SETS as TLB_SETS;

/// Ranges larger than this many pages flush the whole TLB instead of page by page.
const RANGE_FLUSH_LIMIT: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlbConfig {
    /// Victim array entries per privilege level. Zero disables the victim array.
    pub victim_entries: usize,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self { victim_entries: 8 }
    }
}

/// Successful translation of a single in-page access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Guest RAM. `notdirty` means the page holds translated code and a write must
    /// go through the invalidating slow path before touching `host`.
    Ram { host: HostAddr, notdirty: bool },
    /// A device region; the access must be dispatched as a transaction.
    Io,
}

/// TLB counters. Always collected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    pub lookups: u64,
    pub hits: u64,
    pub victim_hits: u64,
    pub misses: u64,
    /// Region lookups against the memory map performed to refill the TLB.
    pub region_lookups: u64,
    pub flush_all: u64,
    pub flush_page: u64,
}

#[derive(Debug, Clone)]
pub struct SoftMmu {
    banks: Vec<TlbBank>,
    stats: MmuStats,
}

impl SoftMmu {
    pub fn new(config: &TlbConfig) -> Self {
        Self {
            banks: (0..MMU_MODES)
                .map(|_| TlbBank::new(config.victim_entries))
                .collect(),
            stats: MmuStats::default(),
        }
    }

    fn resolve(entry: &TlbEntry, addr: u64) -> Translation {
        match entry.host() {
            Some(host) if !entry.is_io() => Translation::Ram {
                host: host.add(page_offset(addr) as usize),
                notdirty: entry.notdirty(),
            },
            _ => Translation::Io,
        }
    }

    /// Translate the access at `addr` (which must not cross a page boundary).
    ///
    /// A miss consults the victim array, then performs exactly one region lookup and
    /// refills the slot. `is_code_page` tells the refill whether the page currently
    /// holds translated code so writes are routed through the notdirty path.
    pub fn translate(
        &mut self,
        mem: &MemoryMap,
        addr: u64,
        kind: AccessKind,
        mmu_idx: usize,
        is_code_page: &dyn Fn(u64) -> bool,
    ) -> Result<Translation, FaultKind> {
        let page = page_base(addr);
        self.stats.lookups = self.stats.lookups.wrapping_add(1);

        let bank = &mut self.banks[mmu_idx.min(MMU_MODES - 1)];
        let entry = bank.entries[tlb::set_index(page)];
        if entry.hit(page, kind) {
            self.stats.hits = self.stats.hits.wrapping_add(1);
            return Ok(Self::resolve(&entry, addr));
        }
        if bank.victim_swap(page, kind) {
            let entry = bank.entries[tlb::set_index(page)];
            self.stats.victim_hits = self.stats.victim_hits.wrapping_add(1);
            return Ok(Self::resolve(&entry, addr));
        }

        self.stats.misses = self.stats.misses.wrapping_add(1);
        self.stats.region_lookups = self.stats.region_lookups.wrapping_add(1);
        let Some(region) = mem.region_lookup(page, PAGE_SIZE) else {
            trace!(addr, ?kind, "tlb refill: unmapped");
            return Err(kind.unmapped_fault());
        };
        let host = region.host_for(page);
        let entry = TlbEntry::new(page, region.perms, host, is_code_page(page));
        self.banks[mmu_idx.min(MMU_MODES - 1)].install(entry);
        if !region.perms.allows(kind) {
            trace!(addr, ?kind, perms = ?region.perms, "tlb refill: protected");
            return Err(kind.protection_fault());
        }
        Ok(Self::resolve(&entry, addr))
    }

    /// Fast-path lookup without refill; `None` on any miss.
    #[cfg(test)]
    pub(crate) fn peek(&self, addr: u64, kind: AccessKind, mmu_idx: usize) -> Option<Translation> {
        let page = page_base(addr);
        let entry = &self.banks[mmu_idx.min(MMU_MODES - 1)].entries[tlb::set_index(page)];
        entry.hit(page, kind).then(|| Self::resolve(entry, addr))
    }

    /// Drop every entry of every bank, victims included.
    pub fn flush_all(&mut self) {
        self.banks.iter_mut().for_each(TlbBank::flush);
        self.stats.flush_all = self.stats.flush_all.wrapping_add(1);
    }

    /// Drop entries for the page containing `addr` in every bank.
    pub fn flush_page(&mut self, addr: u64) {
        let page = page_base(addr);
        for bank in &mut self.banks {
            bank.flush_page(page);
        }
        self.stats.flush_page = self.stats.flush_page.wrapping_add(1);
    }

    /// Drop entries for `[begin, end)`.
    pub fn flush_range(&mut self, begin: u64, end: u64) {
        if end <= begin {
            return;
        }
        let first = page_base(begin);
        let pages = (end - 1 - first) / PAGE_SIZE + 1;
        if pages > RANGE_FLUSH_LIMIT {
            self.flush_all();
            return;
        }
        for i in 0..pages {
            self.flush_page(first + i * PAGE_SIZE);
        }
    }

    /// Route future writes to `page` through the notdirty path.
    pub fn protect_code(&mut self, page: u64) {
        let page = page_base(page);
        for bank in &mut self.banks {
            bank.for_page_mut(page, |e| e.set_notdirty(true));
        }
    }

    /// `page` no longer holds translated code; let writes hit the fast path again.
    pub fn set_dirty(&mut self, page: u64) {
        let page = page_base(page);
        for bank in &mut self.banks {
            bank.for_page_mut(page, |e| e.set_notdirty(false));
        }
    }

    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = MmuStats::default();
    }
}
