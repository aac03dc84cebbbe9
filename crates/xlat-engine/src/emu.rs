use std::rc::Rc;

use bitflags::bitflags;
use rustc_hash::FxHashSet;
use tracing::{debug, trace};
use xlat_hooks::{
    HookFn, HookHandle, HookOrder, HookRange, HookRegistry, HookSpec, HookType, MemAccess,
};
use xlat_mem::{IoHandler, MappedRegion, MemoryMap};
use xlat_mmu::{MmuStats, SoftMmu};
use xlat_tb::{Backend, CFlags, FrontEnd, Invalidated, StopToken, TbCache, TbId, TbStats, TranslationBlock};
use xlat_types::Perm;

use crate::config::EngineConfig;
use crate::cpu::GuestCpu;
use crate::error::{EmuError, FaultRecord};

bitflags! {
    /// Asynchronous requests checked between blocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InterruptRequest: u32 {
        /// Wake a halted CPU and return to the caller with `StopReason::Interrupted`.
        const HARD = 1 << 0;
        /// Force a return to the dispatch loop at the next block boundary.
        const EXITTB = 1 << 1;
    }
}

/// Dispatch-loop counters. Always collected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecStats {
    pub runs: u64,
    pub blocks_executed: u64,
    pub exits_requested: u64,
    pub count_expired: u64,
    pub nocache_blocks: u64,
    pub faults: u64,
    pub exceptions: u64,
}

/// Snapshot of every counter the engine keeps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub exec: ExecStats,
    pub tb: TbStats,
    pub tlb: MmuStats,
}

/// Public view of a cached translation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbInfo {
    pub pc: u64,
    /// Guest bytes covered.
    pub size: u32,
    pub icount: u32,
}

impl From<&TranslationBlock> for TbInfo {
    fn from(tb: &TranslationBlock) -> Self {
        Self {
            pc: tb.pc,
            size: tb.size,
            icount: tb.icount,
        }
    }
}

/// Cloneable, `Send` handle that stops a running [`Emu`] from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle(StopToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.request();
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CountLimit {
    pub limit: u64,
    pub executed: u64,
    pub hook: HookHandle,
}

impl CountLimit {
    pub(crate) fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.executed)
    }
}

/// One guest CPU plus everything needed to translate and run its code.
pub struct Emu {
    pub(crate) config: EngineConfig,
    pub(crate) cpu: Box<dyn GuestCpu>,
    pub(crate) front_end: Rc<dyn FrontEnd>,
    pub(crate) backend: Rc<dyn Backend>,
    pub(crate) mem: MemoryMap,
    pub(crate) mmu: SoftMmu,
    pub(crate) tbs: TbCache,
    pub(crate) hooks: HookRegistry<Emu>,
    pub(crate) stop: StopToken,

    /// Inside `start`.
    pub(crate) running: bool,
    /// Inside compiled code.
    pub(crate) in_code: bool,
    pub(crate) exit_request: bool,
    /// A hook wrote the pc; compiled code must not overwrite it on the way out.
    pub(crate) pc_forced: bool,
    pub(crate) flush_pending: bool,
    pub(crate) interrupt_request: InterruptRequest,
    pub(crate) exception: Option<u32>,
    pub(crate) halted: bool,
    pub(crate) fault: Option<FaultRecord>,
    pub(crate) current_tb: Option<TbId>,
    pub(crate) translating_pc: u64,
    pub(crate) exits: FxHashSet<u64>,
    pub(crate) count: Option<CountLimit>,
    pub(crate) single_step: bool,
    pub(crate) stats: ExecStats,
}

impl Emu {
    pub fn new(
        config: EngineConfig,
        cpu: Box<dyn GuestCpu>,
        front_end: Rc<dyn FrontEnd>,
        backend: Rc<dyn Backend>,
    ) -> Self {
        Self {
            cpu,
            front_end,
            backend,
            mem: MemoryMap::new(),
            mmu: SoftMmu::new(&config.tlb),
            tbs: TbCache::new(&config.tb_cache()),
            hooks: HookRegistry::new(),
            stop: StopToken::new(),
            running: false,
            in_code: false,
            exit_request: false,
            pc_forced: false,
            flush_pending: false,
            interrupt_request: InterruptRequest::empty(),
            exception: None,
            halted: false,
            fault: None,
            current_tb: None,
            translating_pc: 0,
            exits: FxHashSet::default(),
            count: None,
            single_step: config.single_step,
            stats: ExecStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cpu(&self) -> &dyn GuestCpu {
        &*self.cpu
    }

    /// Direct access to CPU state. Changes made here while running are not
    /// noticed by compiled code until the next block boundary; use
    /// [`reg_write`](Self::reg_write) from hooks.
    pub fn cpu_mut(&mut self) -> &mut dyn GuestCpu {
        &mut *self.cpu
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    // ---- memory ----

    pub fn mem_map(&mut self, addr: u64, size: u64, perms: Perm) -> Result<(), EmuError> {
        self.mem.map_ram(addr, size, perms)?;
        self.mmu.flush_range(addr, addr.saturating_add(size));
        Ok(())
    }

    pub fn mem_map_io<H>(&mut self, addr: u64, size: u64, perms: Perm, handler: H) -> Result<(), EmuError>
    where
        H: IoHandler + 'static,
    {
        self.mem.map_io(addr, size, perms, handler)?;
        self.mmu.flush_range(addr, addr.saturating_add(size));
        Ok(())
    }

    /// Unmap `[addr, addr + size)`. Translated code from the range is dropped.
    pub fn mem_unmap(&mut self, addr: u64, size: u64) -> Result<(), EmuError> {
        self.mem.unmap(addr, size)?;
        self.after_remap(addr, addr.saturating_add(size));
        Ok(())
    }

    /// Change permissions of `[addr, addr + size)`. Translated code from the range is
    /// dropped so the next fetch re-checks execute permission.
    pub fn mem_protect(&mut self, addr: u64, size: u64, perms: Perm) -> Result<(), EmuError> {
        self.mem.protect(addr, size, perms)?;
        self.after_remap(addr, addr.saturating_add(size));
        Ok(())
    }

    fn after_remap(&mut self, begin: u64, end: u64) {
        self.mmu.flush_range(begin, end);
        let mut gone = Invalidated::default();
        for page in page_starts(begin, end) {
            let inv = self.tbs.invalidate_page(page);
            gone.tbs.extend(inv.tbs);
            gone.code_free_pages.extend(inv.code_free_pages);
        }
        self.after_invalidate(gone);
    }

    pub fn mem_regions(&self) -> Vec<MappedRegion> {
        self.mem.regions()
    }

    /// Host-side read; ignores permissions and hooks.
    pub fn mem_read(&self, addr: u64, buf: &mut [u8]) -> Result<(), EmuError> {
        self.mem.read(addr, buf)?;
        Ok(())
    }

    /// Host-side write; ignores permissions and hooks. Translated code overlapping
    /// the written bytes is dropped.
    pub fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), EmuError> {
        self.mem.write(addr, data)?;
        if !data.is_empty() {
            let inv = self.tbs.invalidate_range(addr, addr.saturating_add(data.len() as u64));
            self.after_invalidate(inv);
        }
        Ok(())
    }

    /// Clear notdirty tracking for pages that lost their last block and leave
    /// compiled code if the running block was among the victims.
    pub(crate) fn after_invalidate(&mut self, inv: Invalidated) {
        if inv.is_empty() {
            return;
        }
        for page in &inv.code_free_pages {
            self.mmu.set_dirty(*page);
        }
        if let Some(cur) = self.current_tb {
            if self.in_code && inv.contains(cur) {
                trace!(?cur, "running block invalidated");
                self.exit_request = true;
            }
        }
    }

    // ---- registers ----

    fn check_reg(&self, reg: u16) -> Result<(), EmuError> {
        if reg >= self.cpu.reg_count() {
            return Err(EmuError::InvalidRegister(reg));
        }
        Ok(())
    }

    pub fn reg_read(&self, reg: u16) -> Result<u64, EmuError> {
        self.check_reg(reg)?;
        Ok(self.cpu.read_reg(reg))
    }

    /// Write a register. Writing the pc (or anything that changes the translation
    /// mode) from a hook makes execution continue at the new state.
    pub fn reg_write(&mut self, reg: u16, value: u64) -> Result<(), EmuError> {
        self.check_reg(reg)?;
        if reg == self.cpu.pc_reg() {
            self.set_pc(value);
            return Ok(());
        }
        let flags = self.cpu.tb_flags();
        self.cpu.write_reg(reg, value);
        if self.in_code && self.cpu.tb_flags() != flags {
            self.exit_request = true;
        }
        Ok(())
    }

    pub fn pc(&self) -> u64 {
        self.cpu.pc()
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.cpu.set_pc(pc);
        self.halted = false;
        if self.in_code {
            self.pc_forced = true;
            self.exit_request = true;
        }
    }

    // ---- hooks ----

    /// Register a hook with the configured default order.
    pub fn hook_add(&mut self, ty: HookType, range: HookRange, callback: HookFn<Emu>) -> Result<HookHandle, EmuError> {
        let order = self.config.hook_order;
        self.hook_add_with(
            HookSpec {
                ty,
                range,
                insn: None,
                callback,
            },
            order,
        )
    }

    /// Register an `INSN` hook for instruction id `insn`.
    pub fn hook_add_insn(
        &mut self,
        insn: u32,
        range: HookRange,
        callback: impl FnMut(&mut Emu, u32) + 'static,
    ) -> Result<HookHandle, EmuError> {
        let order = self.config.hook_order;
        self.hook_add_with(
            HookSpec {
                ty: HookType::INSN,
                range,
                insn: Some(insn),
                callback: HookFn::Insn(Box::new(callback)),
            },
            order,
        )
    }

    pub fn hook_add_with(&mut self, spec: HookSpec<Emu>, order: HookOrder) -> Result<HookHandle, EmuError> {
        let ty = spec.ty;
        let handle = self.hooks.add(spec, order)?;
        if ty.intersects(HookType::TRANSLATION) {
            self.request_flush();
        }
        Ok(handle)
    }

    /// Unregister a hook. Safe from inside any callback, including its own.
    pub fn hook_del(&mut self, handle: HookHandle) -> Result<(), EmuError> {
        let ty = self.hooks.remove(handle)?;
        if ty.intersects(HookType::TRANSLATION) {
            self.request_flush();
        }
        self.hooks.purge();
        Ok(())
    }

    pub fn add_code_hook(
        &mut self,
        range: HookRange,
        callback: impl FnMut(&mut Emu, u64, u32) + 'static,
    ) -> Result<HookHandle, EmuError> {
        self.hook_add(HookType::CODE, range, HookFn::Code(Box::new(callback)))
    }

    pub fn add_block_hook(
        &mut self,
        range: HookRange,
        callback: impl FnMut(&mut Emu, u64, u32) + 'static,
    ) -> Result<HookHandle, EmuError> {
        self.hook_add(HookType::BLOCK, range, HookFn::Code(Box::new(callback)))
    }

    /// Observation hook for `MEM_READ` / `MEM_WRITE` / `MEM_FETCH` / `MEM_READ_AFTER`
    /// (or any union of them).
    pub fn add_mem_hook(
        &mut self,
        ty: HookType,
        range: HookRange,
        callback: impl FnMut(&mut Emu, MemAccess, u64, usize, u64) + 'static,
    ) -> Result<HookHandle, EmuError> {
        self.hook_add(ty, range, HookFn::Mem(Box::new(callback)))
    }

    /// Fault hook for any union of the unmapped / protection classes. Returning
    /// `true` marks the fault handled; the access is then retried once.
    pub fn add_fault_hook(
        &mut self,
        ty: HookType,
        range: HookRange,
        callback: impl FnMut(&mut Emu, MemAccess, u64, usize, u64) -> bool + 'static,
    ) -> Result<HookHandle, EmuError> {
        self.hook_add(ty, range, HookFn::MemFault(Box::new(callback)))
    }

    pub fn add_intr_hook(&mut self, callback: impl FnMut(&mut Emu, u32) + 'static) -> Result<HookHandle, EmuError> {
        self.hook_add(HookType::INTR, HookRange::ALL, HookFn::Intr(Box::new(callback)))
    }

    pub fn add_insn_invalid_hook(
        &mut self,
        callback: impl FnMut(&mut Emu) -> bool + 'static,
    ) -> Result<HookHandle, EmuError> {
        self.hook_add(
            HookType::INSN_INVALID,
            HookRange::ALL,
            HookFn::InsnInvalid(Box::new(callback)),
        )
    }

    // ---- control ----

    /// Ask the running emulation to stop at its next checkpoint.
    pub fn stop(&mut self) {
        self.stop.request();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn interrupt(&mut self, mask: InterruptRequest) {
        self.interrupt_request |= mask;
        if self.in_code {
            self.exit_request = true;
        }
    }

    pub fn set_single_step(&mut self, enabled: bool) {
        self.single_step = enabled;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The last memory fault no hook resolved.
    pub fn last_fault(&self) -> Option<FaultRecord> {
        self.fault
    }

    // ---- translation cache ----

    /// While running, the flush waits for the current block to finish; block entry
    /// refuses to chain until it has happened.
    fn request_flush(&mut self) {
        if self.running {
            self.flush_pending = true;
        } else {
            self.flush_now();
        }
    }

    pub(crate) fn flush_now(&mut self) {
        self.tbs.flush();
        self.mmu.flush_all();
        self.current_tb = None;
    }

    /// Drop all translated code. While running, this happens at the next block
    /// boundary.
    pub fn flush_tb_cache(&mut self) {
        self.request_flush();
    }

    /// Drop translated code intersecting `[begin, end)`.
    pub fn remove_cache(&mut self, begin: u64, end: u64) {
        if end <= begin {
            return;
        }
        let inv = self.tbs.invalidate_range(begin, end);
        debug!(begin, end, dropped = inv.tbs.len(), "remove cache");
        self.after_invalidate(inv);
    }

    /// Translate the block at `pc` in the current mode without running it.
    pub fn request_cache(&mut self, pc: u64) -> Result<TbInfo, EmuError> {
        if self.in_code {
            return Err(EmuError::Busy);
        }
        let flags = self.cpu.tb_flags();
        let cflags = self.cflags();
        let tb = match self.tbs.lookup(pc, flags, cflags) {
            Some(tb) => tb,
            None => self.tb_gen(pc, flags, cflags)?.ok_or(EmuError::InvalidInstruction { pc })?,
        };
        self.tbs
            .get(tb)
            .map(TbInfo::from)
            .ok_or(EmuError::InvalidInstruction { pc })
    }

    /// The cached block for `pc` in the current mode, if any.
    pub fn tb_lookup(&mut self, pc: u64) -> Option<TbInfo> {
        let flags = self.cpu.tb_flags();
        let cflags = self.cflags();
        let tb = self.tbs.lookup(pc, flags, cflags)?;
        self.tbs.get(tb).map(TbInfo::from)
    }

    pub(crate) fn cflags(&self) -> CFlags {
        if self.single_step {
            CFlags::default().with(CFlags::SINGLE_STEP)
        } else {
            CFlags::default()
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            exec: self.stats,
            tb: self.tbs.stats(),
            tlb: self.mmu.stats(),
        }
    }

    /// Zero every counter. Cached code and TLB contents are untouched.
    pub fn reset_stats(&mut self) {
        self.stats = ExecStats::default();
        self.tbs.reset_stats();
        self.mmu.reset_stats();
    }
}

pub(crate) fn page_starts(begin: u64, end: u64) -> impl Iterator<Item = u64> {
    use xlat_types::{page_base, PAGE_SIZE};
    let first = page_base(begin);
    let count = if end <= begin {
        0
    } else {
        (end - 1 - first) / PAGE_SIZE + 1
    };
    (0..count).map(move |i| first + i * PAGE_SIZE)
}
