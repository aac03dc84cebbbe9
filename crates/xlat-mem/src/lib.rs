//! Guest address space: a sorted set of non-overlapping RAM and device regions.
//!
//! The map itself knows nothing about TLBs or translated code. Callers that cache
//! lookups (the soft-MMU, the TB cache) must be told about every `map`/`unmap`/`protect`
//! by whoever owns both; see `xlat-engine`.

mod io;

pub use io::{IoError, IoHandler, ScratchDevice};

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::trace;
use xlat_types::{is_page_aligned, Perm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("address {addr:#x} or size {size:#x} is not page aligned")]
    Unaligned { addr: u64, size: u64 },
    #[error("zero-sized mapping at {addr:#x}")]
    Empty { addr: u64 },
    #[error("range {addr:#x}+{size:#x} overflows the address space")]
    Overflow { addr: u64, size: u64 },
    #[error("range {addr:#x}+{size:#x} overlaps an existing region")]
    Overlap { addr: u64, size: u64 },
    #[error("address {addr:#x} is not mapped")]
    NotMapped { addr: u64 },
}

/// Location of guest RAM on the host: a backing block plus a byte offset into it.
///
/// This is the engine's stand-in for a raw host pointer; it stays valid until the
/// region that produced it is unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostAddr {
    pub block: u32,
    pub offset: usize,
}

impl HostAddr {
    #[inline]
    pub fn add(self, delta: usize) -> HostAddr {
        HostAddr {
            block: self.block,
            offset: self.offset + delta,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u32);

#[derive(Clone)]
enum Backing {
    Ram { block: u32, offset: usize },
    Io {
        handler: Rc<RefCell<dyn IoHandler>>,
        base: u64,
    },
}

#[derive(Clone)]
struct Region {
    id: RegionId,
    begin: u64,
    /// Exclusive.
    end: u64,
    perms: Perm,
    backing: Backing,
}

impl Region {
    fn contains(&self, addr: u64) -> bool {
        self.begin <= addr && addr < self.end
    }
}

/// What `region_lookup` reports about the region backing an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: RegionId,
    pub begin: u64,
    /// Exclusive.
    pub end: u64,
    pub perms: Perm,
    /// Host location of `begin` for RAM regions; `None` for device regions.
    pub ram: Option<HostAddr>,
}

impl RegionInfo {
    #[inline]
    pub fn is_io(&self) -> bool {
        self.ram.is_none()
    }

    /// Host location backing `addr`, which must lie inside the region.
    #[inline]
    pub fn host_for(&self, addr: u64) -> Option<HostAddr> {
        debug_assert!(self.begin <= addr && addr < self.end);
        self.ram.map(|h| h.add((addr - self.begin) as usize))
    }
}

/// Public summary of a mapped region, as returned by [`MemoryMap::regions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub begin: u64,
    /// Inclusive, matching how embedders usually print ranges.
    pub last: u64,
    pub perms: Perm,
    pub is_io: bool,
}

struct RamBlock {
    data: Vec<u8>,
    refs: u32,
}

#[derive(Default)]
pub struct MemoryMap {
    regions: BTreeMap<u64, Region>,
    blocks: Vec<Option<RamBlock>>,
    next_id: u32,
    /// `begin` key of the region that satisfied the previous lookup.
    last_hit: Cell<Option<u64>>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_range(addr: u64, size: u64) -> Result<u64, MapError> {
        if size == 0 {
            return Err(MapError::Empty { addr });
        }
        if !is_page_aligned(addr) || !is_page_aligned(size) {
            return Err(MapError::Unaligned { addr, size });
        }
        addr.checked_add(size)
            .ok_or(MapError::Overflow { addr, size })
    }

    fn overlaps(&self, begin: u64, end: u64) -> bool {
        if let Some((_, r)) = self.regions.range(..end).next_back() {
            return r.end > begin;
        }
        false
    }

    fn alloc_id(&mut self) -> RegionId {
        let id = RegionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, begin: u64, end: u64, perms: Perm, backing: Backing) -> RegionId {
        let id = self.alloc_id();
        self.regions.insert(
            begin,
            Region {
                id,
                begin,
                end,
                perms,
                backing,
            },
        );
        id
    }

    /// Map zero-filled RAM at `[addr, addr + size)`.
    pub fn map_ram(&mut self, addr: u64, size: u64, perms: Perm) -> Result<RegionId, MapError> {
        let end = Self::check_range(addr, size)?;
        if self.overlaps(addr, end) {
            return Err(MapError::Overlap { addr, size });
        }
        let len = usize::try_from(size).map_err(|_| MapError::Overflow { addr, size })?;
        let block = self.blocks.len() as u32;
        self.blocks.push(Some(RamBlock {
            data: vec![0; len],
            refs: 1,
        }));
        trace!(addr, size, ?perms, "map ram");
        Ok(self.insert(addr, end, perms, Backing::Ram { block, offset: 0 }))
    }

    /// Map a device window at `[addr, addr + size)`.
    pub fn map_io<H>(&mut self, addr: u64, size: u64, perms: Perm, handler: H) -> Result<RegionId, MapError>
    where
        H: IoHandler + 'static,
    {
        let end = Self::check_range(addr, size)?;
        if self.overlaps(addr, end) {
            return Err(MapError::Overlap { addr, size });
        }
        let handler: Rc<RefCell<dyn IoHandler>> = Rc::new(RefCell::new(handler));
        trace!(addr, size, ?perms, "map io");
        Ok(self.insert(addr, end, perms, Backing::Io { handler, base: 0 }))
    }

    /// Every page of `[addr, end)` must be covered by some region.
    fn ensure_covered(&self, addr: u64, end: u64) -> Result<(), MapError> {
        let mut cur = addr;
        while cur < end {
            match self.find(cur) {
                Some(r) => cur = r.end,
                None => return Err(MapError::NotMapped { addr: cur }),
            }
        }
        Ok(())
    }

    /// Split the region containing `at` so that a region boundary falls on `at`.
    fn split_at(&mut self, at: u64) {
        let Some(key) = self.find(at).map(|r| r.begin) else {
            return;
        };
        if key == at {
            return;
        }
        let Some(left) = self.regions.get_mut(&key) else {
            return;
        };
        let delta = at - left.begin;
        let mut right = left.clone();
        left.end = at;
        right.begin = at;
        right.backing = match right.backing {
            Backing::Ram { block, offset } => {
                if let Some(Some(b)) = self.blocks.get_mut(block as usize) {
                    b.refs += 1;
                }
                Backing::Ram {
                    block,
                    offset: offset + delta as usize,
                }
            }
            Backing::Io { handler, base } => Backing::Io {
                handler,
                base: base + delta,
            },
        };
        right.id = self.alloc_id();
        self.regions.insert(at, right);
    }

    fn release(&mut self, backing: &Backing) {
        if let Backing::Ram { block, .. } = backing {
            let slot = &mut self.blocks[*block as usize];
            if let Some(b) = slot {
                b.refs -= 1;
                if b.refs == 0 {
                    *slot = None;
                }
            }
        }
    }

    /// Remove `[addr, addr + size)`, splitting regions that straddle the edges.
    pub fn unmap(&mut self, addr: u64, size: u64) -> Result<(), MapError> {
        let end = Self::check_range(addr, size)?;
        self.ensure_covered(addr, end)?;
        self.split_at(addr);
        self.split_at(end);
        let keys: Vec<u64> = self.regions.range(addr..end).map(|(k, _)| *k).collect();
        for k in keys {
            if let Some(r) = self.regions.remove(&k) {
                self.release(&r.backing);
            }
        }
        self.last_hit.set(None);
        trace!(addr, size, "unmap");
        Ok(())
    }

    /// Change permissions of `[addr, addr + size)`, splitting regions as needed.
    pub fn protect(&mut self, addr: u64, size: u64, perms: Perm) -> Result<(), MapError> {
        let end = Self::check_range(addr, size)?;
        self.ensure_covered(addr, end)?;
        self.split_at(addr);
        self.split_at(end);
        for (_, r) in self.regions.range_mut(addr..end) {
            r.perms = perms;
        }
        self.last_hit.set(None);
        trace!(addr, size, ?perms, "protect");
        Ok(())
    }

    fn find(&self, addr: u64) -> Option<&Region> {
        if let Some(key) = self.last_hit.get() {
            if let Some(r) = self.regions.get(&key) {
                if r.contains(addr) {
                    return Some(r);
                }
            }
        }
        let (_, r) = self.regions.range(..=addr).next_back()?;
        if r.contains(addr) {
            self.last_hit.set(Some(r.begin));
            Some(r)
        } else {
            None
        }
    }

    fn info(r: &Region) -> RegionInfo {
        RegionInfo {
            id: r.id,
            begin: r.begin,
            end: r.end,
            perms: r.perms,
            ram: match r.backing {
                Backing::Ram { block, offset } => Some(HostAddr { block, offset }),
                Backing::Io { .. } => None,
            },
        }
    }

    /// Find the single region covering all of `[addr, addr + len)`.
    pub fn region_lookup(&self, addr: u64, len: u64) -> Option<RegionInfo> {
        let r = self.find(addr)?;
        let last = addr.checked_add(len.max(1) - 1)?;
        if last >= r.end {
            return None;
        }
        Some(Self::info(r))
    }

    pub fn regions(&self) -> Vec<MappedRegion> {
        self.regions
            .values()
            .map(|r| MappedRegion {
                begin: r.begin,
                last: r.end - 1,
                perms: r.perms,
                is_io: matches!(r.backing, Backing::Io { .. }),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn ram(&self, host: HostAddr, len: usize) -> &[u8] {
        match &self.blocks[host.block as usize] {
            Some(b) => &b.data[host.offset..host.offset + len],
            None => panic!("stale host address {host:?}"),
        }
    }

    pub fn ram_mut(&mut self, host: HostAddr, len: usize) -> &mut [u8] {
        match &mut self.blocks[host.block as usize] {
            Some(b) => &mut b.data[host.offset..host.offset + len],
            None => panic!("stale host address {host:?}"),
        }
    }

    fn io_of(&self, addr: u64) -> Option<(Rc<RefCell<dyn IoHandler>>, u64)> {
        let r = self.find(addr)?;
        match &r.backing {
            Backing::Io { handler, base } => Some((handler.clone(), base + (addr - r.begin))),
            Backing::Ram { .. } => None,
        }
    }

    /// Run a device read transaction. `addr` must lie in a device region.
    pub fn io_read(&self, addr: u64, size: usize) -> Result<u64, IoError> {
        let (h, offset) = self
            .io_of(addr)
            .ok_or(IoError::Rejected { offset: addr, size })?;
        // Bound so the `RefMut` temporary is dropped before `h`.
        let v = h.borrow_mut().read(offset, size);
        v
    }

    /// Run a device write transaction. `addr` must lie in a device region.
    pub fn io_write(&self, addr: u64, size: usize, value: u64) -> Result<(), IoError> {
        let (h, offset) = self
            .io_of(addr)
            .ok_or(IoError::Rejected { offset: addr, size })?;
        // Same as in `io_read`: the borrow must end before `h` does.
        let r = h.borrow_mut().write(offset, size, value);
        r
    }

    /// Host-side bulk read; ignores permissions but not holes or device regions.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MapError> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr.wrapping_add(done as u64);
            let r = self.find(cur).ok_or(MapError::NotMapped { addr: cur })?;
            let Backing::Ram { block, offset } = r.backing else {
                return Err(MapError::NotMapped { addr: cur });
            };
            let n = ((r.end - cur) as usize).min(buf.len() - done);
            let host = HostAddr { block, offset }.add((cur - r.begin) as usize);
            buf[done..done + n].copy_from_slice(self.ram(host, n));
            done += n;
        }
        Ok(())
    }

    /// Host-side bulk write; ignores permissions but not holes or device regions.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MapError> {
        // Validate first so a failing write leaves memory untouched.
        let mut done = 0usize;
        let mut chunks = Vec::new();
        while done < data.len() {
            let cur = addr.wrapping_add(done as u64);
            let r = self.find(cur).ok_or(MapError::NotMapped { addr: cur })?;
            let Backing::Ram { block, offset } = r.backing else {
                return Err(MapError::NotMapped { addr: cur });
            };
            let n = ((r.end - cur) as usize).min(data.len() - done);
            chunks.push((HostAddr { block, offset }.add((cur - r.begin) as usize), done, n));
            done += n;
        }
        for (host, at, n) in chunks {
            self.ram_mut(host, n).copy_from_slice(&data[at..at + n]);
        }
        Ok(())
    }
}
