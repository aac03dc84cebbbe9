//! Caller-registered callbacks, grouped into one ordered list per event class.
//!
//! A single registration may cover several classes (e.g. every unmapped-access
//! class); it is then linked into each of those lists and shared through `Rc`, so
//! it is freed once the last list drops it. Unregistering only marks a hook as
//! deleted; lists are compacted by [`HookRegistry::purge`] at a point where no
//! dispatch is in flight.
//!
//! `C` is the context handed to every callback (in practice the engine itself).
//! Dispatch therefore works on a snapshot of `Rc` links so callbacks may freely
//! register or unregister hooks through the context.

mod dispatch;

pub use dispatch::{dispatch_code, dispatch_insn, dispatch_insn_invalid, dispatch_intr, dispatch_mem, dispatch_mem_fault};

use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HookType: u32 {
        /// Interrupt / exception delivery.
        const INTR = 1 << 0;
        /// Specific instructions (selected by an instruction id filter).
        const INSN = 1 << 1;
        /// Every executed instruction.
        const CODE = 1 << 2;
        /// Every executed basic block.
        const BLOCK = 1 << 3;
        const MEM_READ_UNMAPPED = 1 << 4;
        const MEM_WRITE_UNMAPPED = 1 << 5;
        const MEM_FETCH_UNMAPPED = 1 << 6;
        const MEM_READ_PROT = 1 << 7;
        const MEM_WRITE_PROT = 1 << 8;
        const MEM_FETCH_PROT = 1 << 9;
        /// Successful reads, reported once the access completes.
        const MEM_READ = 1 << 10;
        /// Successful writes, reported after memory is updated.
        const MEM_WRITE = 1 << 11;
        /// Successful instruction fetches, reported when code is translated.
        const MEM_FETCH = 1 << 12;
        /// Successful reads, with the value that was read.
        const MEM_READ_AFTER = 1 << 13;
        /// Undecodable instruction.
        const INSN_INVALID = 1 << 14;

        const MEM_UNMAPPED = Self::MEM_READ_UNMAPPED.bits()
            | Self::MEM_WRITE_UNMAPPED.bits()
            | Self::MEM_FETCH_UNMAPPED.bits();
        const MEM_PROT = Self::MEM_READ_PROT.bits()
            | Self::MEM_WRITE_PROT.bits()
            | Self::MEM_FETCH_PROT.bits();
        const MEM_READ_INVALID = Self::MEM_READ_UNMAPPED.bits() | Self::MEM_READ_PROT.bits();
        const MEM_WRITE_INVALID = Self::MEM_WRITE_UNMAPPED.bits() | Self::MEM_WRITE_PROT.bits();
        const MEM_FETCH_INVALID = Self::MEM_FETCH_UNMAPPED.bits() | Self::MEM_FETCH_PROT.bits();
        const MEM_INVALID = Self::MEM_UNMAPPED.bits() | Self::MEM_PROT.bits();
        const MEM_VALID = Self::MEM_READ.bits()
            | Self::MEM_WRITE.bits()
            | Self::MEM_FETCH.bits()
            | Self::MEM_READ_AFTER.bits();
    }
}

/// Number of distinct single-bit hook classes.
pub const HOOK_KINDS: usize = 15;

impl HookType {
    /// Hook classes whose presence changes the code the front end emits.
    pub const TRANSLATION: HookType = HookType::CODE
        .union(HookType::BLOCK)
        .union(HookType::INSN);

    #[inline]
    fn kind_index(self) -> usize {
        debug_assert_eq!(self.bits().count_ones(), 1);
        self.bits().trailing_zeros() as usize
    }

    fn kinds(self) -> impl Iterator<Item = HookType> {
        (0..HOOK_KINDS as u32)
            .map(|i| HookType::from_bits_retain(1 << i))
            .filter(move |k| self.contains(*k))
    }
}

/// Memory event reported to memory hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    Read,
    Write,
    Fetch,
    ReadUnmapped,
    WriteUnmapped,
    FetchUnmapped,
    ReadProt,
    WriteProt,
    FetchProt,
    ReadAfter,
}

impl MemAccess {
    /// The hook class that observes this event.
    pub fn hook_type(self) -> HookType {
        match self {
            MemAccess::Read => HookType::MEM_READ,
            MemAccess::Write => HookType::MEM_WRITE,
            MemAccess::Fetch => HookType::MEM_FETCH,
            MemAccess::ReadUnmapped => HookType::MEM_READ_UNMAPPED,
            MemAccess::WriteUnmapped => HookType::MEM_WRITE_UNMAPPED,
            MemAccess::FetchUnmapped => HookType::MEM_FETCH_UNMAPPED,
            MemAccess::ReadProt => HookType::MEM_READ_PROT,
            MemAccess::WriteProt => HookType::MEM_WRITE_PROT,
            MemAccess::FetchProt => HookType::MEM_FETCH_PROT,
            MemAccess::ReadAfter => HookType::MEM_READ_AFTER,
        }
    }
}

/// Inclusive address range a hook applies to. `begin > end` means "everywhere".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRange {
    pub begin: u64,
    pub end: u64,
}

impl HookRange {
    pub const ALL: HookRange = HookRange { begin: 1, end: 0 };

    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.begin > self.end
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.is_unbounded() || (self.begin <= addr && addr <= self.end)
    }
}

impl Default for HookRange {
    fn default() -> Self {
        HookRange::ALL
    }
}

/// Where a new hook goes relative to existing hooks of the same class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HookOrder {
    #[default]
    Append,
    Prepend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookHandle(u64);

impl HookHandle {
    pub fn raw(self) -> u64 {
        self.0
    }
}

pub type CodeHookFn<C> = Box<dyn FnMut(&mut C, u64, u32)>;
pub type MemHookFn<C> = Box<dyn FnMut(&mut C, MemAccess, u64, usize, u64)>;
pub type MemFaultHookFn<C> = Box<dyn FnMut(&mut C, MemAccess, u64, usize, u64) -> bool>;
pub type IntrHookFn<C> = Box<dyn FnMut(&mut C, u32)>;
pub type InsnHookFn<C> = Box<dyn FnMut(&mut C, u32)>;
pub type InsnInvalidHookFn<C> = Box<dyn FnMut(&mut C) -> bool>;

/// Callback shapes, one per family of hook classes.
pub enum HookFn<C> {
    /// `CODE` / `BLOCK`: `(ctx, address, size)`.
    Code(CodeHookFn<C>),
    /// Successful memory access: `(ctx, access, address, size, value)`.
    Mem(MemHookFn<C>),
    /// Faulting memory access; returning `true` marks the fault handled.
    MemFault(MemFaultHookFn<C>),
    /// `(ctx, exception number)`.
    Intr(IntrHookFn<C>),
    /// `(ctx, instruction id)`.
    Insn(InsnHookFn<C>),
    /// Returning `true` means the hook dealt with the instruction and execution may go on.
    InsnInvalid(InsnInvalidHookFn<C>),
}

impl<C> HookFn<C> {
    fn accepts(&self) -> HookType {
        match self {
            HookFn::Code(_) => HookType::CODE | HookType::BLOCK,
            HookFn::Mem(_) => HookType::MEM_VALID,
            HookFn::MemFault(_) => HookType::MEM_INVALID,
            HookFn::Intr(_) => HookType::INTR,
            HookFn::Insn(_) => HookType::INSN,
            HookFn::InsnInvalid(_) => HookType::INSN_INVALID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("hook type {0:?} is empty or unknown")]
    InvalidType(HookType),
    #[error("callback shape does not fit hook type {0:?}")]
    CallbackMismatch(HookType),
    #[error("instruction hooks need an instruction id")]
    MissingInsn,
    #[error("no hook registered with handle {0:?}")]
    UnknownHandle(HookHandle),
}

pub struct Hook<C> {
    handle: HookHandle,
    ty: HookType,
    range: HookRange,
    insn: Option<u32>,
    deleted: Cell<bool>,
    callback: RefCell<HookFn<C>>,
}

impl<C> Hook<C> {
    pub fn handle(&self) -> HookHandle {
        self.handle
    }

    pub fn hook_type(&self) -> HookType {
        self.ty
    }

    pub fn range(&self) -> HookRange {
        self.range
    }

    pub fn insn(&self) -> Option<u32> {
        self.insn
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    #[inline]
    pub fn covers(&self, addr: u64) -> bool {
        !self.is_deleted() && self.range.contains(addr)
    }

    /// Borrow the callback for a call. `None` if the hook was deleted or is already
    /// running further up the stack (callbacks are not re-entered).
    pub(crate) fn callback(&self) -> Option<RefMut<'_, HookFn<C>>> {
        if self.is_deleted() {
            return None;
        }
        self.callback.try_borrow_mut().ok()
    }
}

/// Everything needed to register one hook.
pub struct HookSpec<C> {
    pub ty: HookType,
    pub range: HookRange,
    pub insn: Option<u32>,
    pub callback: HookFn<C>,
}

pub struct HookRegistry<C> {
    lists: [Vec<Rc<Hook<C>>>; HOOK_KINDS],
    by_handle: FxHashMap<HookHandle, Rc<Hook<C>>>,
    next_handle: u64,
    dirty: bool,
}

impl<C> Default for HookRegistry<C> {
    fn default() -> Self {
        Self {
            lists: std::array::from_fn(|_| Vec::new()),
            by_handle: FxHashMap::default(),
            next_handle: 1,
            dirty: false,
        }
    }
}

impl<C> HookRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, spec: HookSpec<C>, order: HookOrder) -> Result<HookHandle, HookError> {
        let HookSpec {
            ty,
            range,
            insn,
            callback,
        } = spec;
        if ty.is_empty() || ty.bits() & !HookType::all().bits() != 0 {
            return Err(HookError::InvalidType(ty));
        }
        if !callback.accepts().contains(ty) {
            return Err(HookError::CallbackMismatch(ty));
        }
        if ty.contains(HookType::INSN) && insn.is_none() {
            return Err(HookError::MissingInsn);
        }

        let handle = HookHandle(self.next_handle);
        self.next_handle += 1;
        let hook = Rc::new(Hook {
            handle,
            ty,
            range,
            insn,
            deleted: Cell::new(false),
            callback: RefCell::new(callback),
        });
        for kind in ty.kinds() {
            let list = &mut self.lists[kind.kind_index()];
            match order {
                HookOrder::Append => list.push(hook.clone()),
                HookOrder::Prepend => list.insert(0, hook.clone()),
            }
        }
        trace!(handle = handle.0, ?ty, ?range, "hook added");
        self.by_handle.insert(handle, hook);
        Ok(handle)
    }

    /// Mark a hook deleted. It stops firing immediately; its list links are dropped on
    /// the next [`purge`](Self::purge). Returns the classes it was registered for.
    pub fn remove(&mut self, handle: HookHandle) -> Result<HookType, HookError> {
        let hook = self
            .by_handle
            .remove(&handle)
            .ok_or(HookError::UnknownHandle(handle))?;
        hook.deleted.set(true);
        self.dirty = true;
        trace!(handle = handle.0, ty = ?hook.ty, "hook removed");
        Ok(hook.ty)
    }

    /// Drop links to deleted hooks.
    pub fn purge(&mut self) {
        if !self.dirty {
            return;
        }
        for list in &mut self.lists {
            list.retain(|h| !h.is_deleted());
        }
        self.dirty = false;
    }

    /// Whether any live hook of class `kind` (a single class) exists.
    pub fn has(&self, kind: HookType) -> bool {
        self.lists[kind.kind_index()].iter().any(|h| !h.is_deleted())
    }

    /// Whether any live hook of class `kind` covers `addr`.
    pub fn covers(&self, kind: HookType, addr: u64) -> bool {
        self.lists[kind.kind_index()].iter().any(|h| h.covers(addr))
    }

    /// Live hooks of class `kind` covering `addr`, in dispatch order.
    pub fn matching(&self, kind: HookType, addr: u64) -> Vec<Rc<Hook<C>>> {
        self.lists[kind.kind_index()]
            .iter()
            .filter(|h| h.covers(addr))
            .cloned()
            .collect()
    }

    /// Live `INSN` hooks filtering on `insn`, in dispatch order.
    pub fn matching_insn(&self, insn: u32, addr: u64) -> Vec<Rc<Hook<C>>> {
        self.lists[HookType::INSN.kind_index()]
            .iter()
            .filter(|h| h.insn == Some(insn) && h.covers(addr))
            .cloned()
            .collect()
    }

    /// Whether an `INSN` hook exists for `insn` anywhere.
    pub fn has_insn(&self, insn: u32) -> bool {
        self.lists[HookType::INSN.kind_index()]
            .iter()
            .any(|h| !h.is_deleted() && h.insn == Some(insn))
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    /// Number of list links held for class `kind`, deleted hooks included.
    #[cfg(test)]
    pub(crate) fn links(&self, kind: HookType) -> usize {
        self.lists[kind.kind_index()].len()
    }
}

#[cfg(test)]
mod tests;
