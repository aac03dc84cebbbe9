use rustc_hash::FxHashMap;
use xlat_types::{page_base, page_offset, PAGE_SIZE};

use crate::TbId;

const BITMAP_WORDS: usize = (PAGE_SIZE / 64) as usize;

/// Per-page list of blocks overlapping the page, plus the optional code bitmap.
#[derive(Debug, Default)]
struct PageDesc {
    /// `(block, which of the block's page anchors this page is)`.
    tbs: Vec<(TbId, u8)>,
    /// One bit per byte of the page covered by some block's guest code.
    bitmap: Option<Box<[u64; BITMAP_WORDS]>>,
    /// Code-page writes seen while no bitmap existed.
    write_count: u32,
}

/// Guest page → blocks overlapping it.
#[derive(Debug, Default)]
pub struct PageIndex {
    pages: FxHashMap<u64, PageDesc>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, page: u64, tb: TbId, slot: u8) {
        let desc = self.pages.entry(page_base(page)).or_default();
        desc.tbs.push((tb, slot));
        // The bitmap no longer describes every block on the page.
        desc.bitmap = None;
        desc.write_count = 0;
    }

    /// Unlink `tb` from `page`. Returns `true` if the page no longer holds code.
    pub(crate) fn remove(&mut self, page: u64, tb: TbId) -> bool {
        let page = page_base(page);
        let Some(desc) = self.pages.get_mut(&page) else {
            return true;
        };
        desc.tbs.retain(|(t, _)| *t != tb);
        desc.bitmap = None;
        if desc.tbs.is_empty() {
            self.pages.remove(&page);
            return true;
        }
        false
    }

    /// Blocks overlapping `page`, with their anchor slot.
    pub fn tbs(&self, page: u64) -> &[(TbId, u8)] {
        self.pages
            .get(&page_base(page))
            .map(|d| d.tbs.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_code(&self, page: u64) -> bool {
        self.pages.contains_key(&page_base(page))
    }

    pub fn has_bitmap(&self, page: u64) -> bool {
        self.pages
            .get(&page_base(page))
            .is_some_and(|d| d.bitmap.is_some())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.pages.clear();
    }

    /// Count a write against `page` and report whether it has crossed `threshold`
    /// and should get a bitmap built.
    pub(crate) fn note_write(&mut self, page: u64, threshold: u32) -> bool {
        match self.pages.get_mut(&page_base(page)) {
            Some(desc) if desc.bitmap.is_none() => {
                desc.write_count = desc.write_count.saturating_add(1);
                desc.write_count >= threshold
            }
            _ => false,
        }
    }

    /// Install a bitmap built from `[start, end)` byte ranges within `page`.
    pub(crate) fn set_bitmap(&mut self, page: u64, ranges: impl Iterator<Item = (u64, u64)>) {
        let Some(desc) = self.pages.get_mut(&page_base(page)) else {
            return;
        };
        let mut bits = Box::new([0u64; BITMAP_WORDS]);
        for (start, end) in ranges {
            for b in start..end.min(PAGE_SIZE) {
                bits[(b / 64) as usize] |= 1 << (b % 64);
            }
        }
        desc.bitmap = Some(bits);
    }

    /// With a bitmap present, whether `[addr, addr + len)` (within one page) might
    /// touch code. Without one, always `true`.
    pub(crate) fn may_hit_code(&self, addr: u64, len: u64) -> bool {
        let Some(desc) = self.pages.get(&page_base(addr)) else {
            return false;
        };
        let Some(bits) = &desc.bitmap else {
            return true;
        };
        let start = page_offset(addr);
        let end = (start + len).min(PAGE_SIZE);
        (start..end).any(|b| bits[(b / 64) as usize] & (1 << (b % 64)) != 0)
    }
}
