use xlat_mem::HostAddr;
use xlat_types::{page_number, AccessKind, Perm};

pub const SETS: usize = 256;

const FLAG_READ: u8 = 1 << 0;
const FLAG_WRITE: u8 = 1 << 1;
const FLAG_CODE: u8 = 1 << 2;
const FLAG_IO: u8 = 1 << 3;
/// Writes must take the slow path so translated code on the page gets invalidated.
const FLAG_NOTDIRTY: u8 = 1 << 4;
const FLAG_VALID: u8 = 1 << 5;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TlbEntry {
    page: u64,
    /// Host location of `page`; `None` for device pages.
    host: Option<HostAddr>,
    flags: u8,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self {
            page: 0,
            host: None,
            flags: 0,
        }
    }
}

#[inline]
fn access_flag(kind: AccessKind) -> u8 {
    match kind {
        AccessKind::Read => FLAG_READ,
        AccessKind::Write => FLAG_WRITE,
        AccessKind::Fetch => FLAG_CODE,
    }
}

impl TlbEntry {
    pub(crate) fn new(page: u64, perms: Perm, host: Option<HostAddr>, notdirty: bool) -> Self {
        let mut flags = FLAG_VALID;
        if perms.contains(Perm::READ) {
            flags |= FLAG_READ;
        }
        if perms.contains(Perm::WRITE) {
            flags |= FLAG_WRITE;
            if notdirty {
                flags |= FLAG_NOTDIRTY;
            }
        }
        if perms.contains(Perm::EXEC) {
            flags |= FLAG_CODE;
        }
        if host.is_none() {
            flags |= FLAG_IO;
        }
        Self {
            page,
            host,
            flags,
        }
    }

    #[inline]
    pub(crate) fn valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    #[inline]
    pub(crate) fn is_page(&self, page: u64) -> bool {
        self.valid() && self.page == page
    }

    /// Tag match for one access class.
    #[inline]
    pub(crate) fn hit(&self, page: u64, kind: AccessKind) -> bool {
        self.is_page(page) && self.flags & access_flag(kind) != 0
    }

    #[inline]
    pub(crate) fn host(&self) -> Option<HostAddr> {
        self.host
    }

    #[inline]
    pub(crate) fn is_io(&self) -> bool {
        self.flags & FLAG_IO != 0
    }

    #[inline]
    pub(crate) fn notdirty(&self) -> bool {
        self.flags & FLAG_NOTDIRTY != 0
    }

    #[inline]
    pub(crate) fn set_notdirty(&mut self, notdirty: bool) {
        if notdirty {
            if self.flags & FLAG_WRITE != 0 {
                self.flags |= FLAG_NOTDIRTY;
            }
        } else {
            self.flags &= !FLAG_NOTDIRTY;
        }
    }

    #[inline]
    pub(crate) fn invalidate(&mut self) {
        self.flags = 0;
    }
}

#[inline]
pub(crate) fn set_index(page: u64) -> usize {
    (page_number(page) as usize) & (SETS - 1)
}

/// One privilege level's direct-mapped table plus its victim array.
#[derive(Debug, Clone)]
pub(crate) struct TlbBank {
    pub(crate) entries: Box<[TlbEntry; SETS]>,
    pub(crate) victims: Vec<TlbEntry>,
    next_victim: usize,
}

impl TlbBank {
    pub(crate) fn new(victims: usize) -> Self {
        Self {
            entries: Box::new([TlbEntry::default(); SETS]),
            victims: vec![TlbEntry::default(); victims],
            next_victim: 0,
        }
    }

    pub(crate) fn flush(&mut self) {
        self.entries.iter_mut().for_each(TlbEntry::invalidate);
        self.victims.iter_mut().for_each(TlbEntry::invalidate);
        self.next_victim = 0;
    }

    pub(crate) fn flush_page(&mut self, page: u64) {
        let e = &mut self.entries[set_index(page)];
        if e.is_page(page) {
            e.invalidate();
        }
        for v in self.victims.iter_mut().filter(|v| v.is_page(page)) {
            v.invalidate();
        }
    }

    /// Install `entry`, pushing a valid occupant of a different page into the victim array.
    pub(crate) fn install(&mut self, entry: TlbEntry) {
        let idx = set_index(entry.page);
        let old = std::mem::replace(&mut self.entries[idx], entry);
        if old.valid() && old.page != entry.page && !self.victims.is_empty() {
            // Drop any stale victim copy of the incoming page first.
            for v in self.victims.iter_mut().filter(|v| v.is_page(entry.page)) {
                v.invalidate();
            }
            let slot = self.next_victim;
            self.victims[slot] = old;
            self.next_victim = (slot + 1) % self.victims.len();
        }
    }

    /// Look for `page` in the victim array; on a hit swap it back into the main table.
    pub(crate) fn victim_swap(&mut self, page: u64, kind: AccessKind) -> bool {
        let idx = set_index(page);
        let Some(pos) = self.victims.iter().position(|v| v.hit(page, kind)) else {
            return false;
        };
        std::mem::swap(&mut self.entries[idx], &mut self.victims[pos]);
        true
    }

    pub(crate) fn for_page_mut(&mut self, page: u64, mut f: impl FnMut(&mut TlbEntry)) {
        let e = &mut self.entries[set_index(page)];
        if e.is_page(page) {
            f(e);
        }
        for v in self.victims.iter_mut().filter(|v| v.is_page(page)) {
            f(v);
        }
    }
}
