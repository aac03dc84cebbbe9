//! Hook-aware memory access paths layered over [`xlat_mmu::SoftMmu`].
//!
//! Every access resolves through the TLB. A fault is offered to the matching
//! fault-hook chain; if a hook reports it handled, the translation is retried
//! exactly once. An unresolved fault is recorded and, while running, raises the
//! stop flag so compiled code leaves at its next checkpoint.

use tracing::{debug, warn};
use xlat_hooks::{dispatch_mem, dispatch_mem_fault, MemAccess};
use xlat_mmu::Translation;
use xlat_types::{crosses_page, page_base, AccessKind, FaultKind, Width};

use crate::emu::Emu;
use crate::error::FaultRecord;

pub(crate) fn fault_access(kind: FaultKind) -> MemAccess {
    match kind {
        FaultKind::FetchUnmapped => MemAccess::FetchUnmapped,
        FaultKind::FetchProtected => MemAccess::FetchProt,
        FaultKind::ReadUnmapped => MemAccess::ReadUnmapped,
        FaultKind::ReadProtected => MemAccess::ReadProt,
        FaultKind::WriteUnmapped => MemAccess::WriteUnmapped,
        FaultKind::WriteProtected => MemAccess::WriteProt,
    }
}

impl Emu {
    /// Plain TLB translation: no hooks, no fault record.
    pub(crate) fn tlb_translate(&mut self, addr: u64, kind: AccessKind) -> Result<Translation, FaultKind> {
        let idx = self.cpu.mmu_index();
        let tbs = &self.tbs;
        self.mmu
            .translate(&self.mem, addr, kind, idx, &|page| tbs.has_code(page))
    }

    /// Point the guest pc at the instruction whose code contains `host_pc`.
    pub(crate) fn sync_pc(&mut self, host_pc: usize) {
        let Some(tb) = self.tbs.find_by_host_offset(host_pc) else {
            return;
        };
        if let Some((pc, _)) = self.tbs.restore_state(tb, host_pc) {
            if !self.pc_forced {
                self.cpu.set_pc(pc);
            }
        }
    }

    /// Offer `fault` to its hook chain. Returns whether a hook handled it.
    fn offer_fault(&mut self, fault: FaultKind, addr: u64, size: usize, value: u64) -> bool {
        let access = fault_access(fault);
        let hooks = self.hooks.matching(access.hook_type(), addr);
        if hooks.is_empty() {
            return false;
        }
        dispatch_mem_fault(&hooks, self, access, addr, size, value)
    }

    pub(crate) fn record_fault(&mut self, kind: FaultKind, addr: u64, size: usize) -> FaultRecord {
        let record = FaultRecord {
            kind,
            addr,
            size,
            pc: self.cpu.pc(),
        };
        debug!(%kind, addr, size, pc = record.pc, "unhandled memory fault");
        self.fault = Some(record);
        self.stats.faults = self.stats.faults.wrapping_add(1);
        if self.running {
            self.stop.request();
        }
        record
    }

    /// TLB translation with the fault-hook chain and a single retry.
    pub(crate) fn translate_access(
        &mut self,
        addr: u64,
        size: usize,
        kind: AccessKind,
        value: u64,
        host_pc: Option<usize>,
    ) -> Result<Translation, FaultKind> {
        let fault = match self.tlb_translate(addr, kind) {
            Ok(t) => return Ok(t),
            Err(f) => f,
        };
        if let Some(host_pc) = host_pc {
            self.sync_pc(host_pc);
        }
        if !self.offer_fault(fault, addr, size, value) {
            return Err(self.record_fault(fault, addr, size).kind);
        }
        match self.tlb_translate(addr, kind) {
            Ok(t) => Ok(t),
            Err(again) => {
                warn!(%again, addr, "memory fault persists after a hook handled it");
                Err(self.record_fault(again, addr, size).kind)
            }
        }
    }

    /// Run observation hooks of `access`'s class, if any cover `addr`.
    pub(crate) fn observe(&mut self, access: MemAccess, addr: u64, size: usize, value: u64) {
        let ty = access.hook_type();
        if !self.hooks.covers(ty, addr) {
            return;
        }
        let hooks = self.hooks.matching(ty, addr);
        dispatch_mem(&hooks, self, access, addr, size, value);
    }

    /// Public soft-MMU access check: `Ok` with the resolved target, or the fault that no
    /// hook resolved. An access straddling two pages must be allowed on both.
    pub fn probe(&mut self, addr: u64, size: usize, kind: AccessKind) -> Result<Translation, FaultKind> {
        let size = size.max(1);
        if crosses_page(addr, size as u64) {
            let last = addr.wrapping_add(size as u64 - 1);
            self.translate_access(page_base(last), 1, kind, 0, None)?;
        }
        self.translate_access(addr, size, kind, 0, None)
    }

    fn io_read(&mut self, addr: u64, size: usize, host_pc: Option<usize>) -> Result<u64, FaultKind> {
        match self.mem.io_read(addr, size) {
            Ok(v) => return Ok(v),
            Err(e) => debug!(addr, size, error = %e, "device read failed"),
        }
        if let Some(host_pc) = host_pc {
            self.sync_pc(host_pc);
        }
        let fault = AccessKind::Read.unmapped_fault();
        if self.offer_fault(fault, addr, size, 0) {
            if let Ok(v) = self.mem.io_read(addr, size) {
                return Ok(v);
            }
        }
        Err(self.record_fault(fault, addr, size).kind)
    }

    fn io_write(&mut self, addr: u64, size: usize, value: u64, host_pc: Option<usize>) -> Result<(), FaultKind> {
        match self.mem.io_write(addr, size, value) {
            Ok(()) => return Ok(()),
            Err(e) => debug!(addr, size, error = %e, "device write failed"),
        }
        if let Some(host_pc) = host_pc {
            self.sync_pc(host_pc);
        }
        let fault = AccessKind::Write.unmapped_fault();
        if self.offer_fault(fault, addr, size, value) && self.mem.io_write(addr, size, value).is_ok() {
            return Ok(());
        }
        Err(self.record_fault(fault, addr, size).kind)
    }

    /// Guest data load of `width` bytes at `addr`.
    pub(crate) fn read_mem(&mut self, addr: u64, width: Width, host_pc: Option<usize>) -> Result<u64, FaultKind> {
        let size = width.bytes();
        let value = if crosses_page(addr, size as u64) {
            self.read_split(addr, size, host_pc)?
        } else {
            match self.translate_access(addr, size, AccessKind::Read, 0, host_pc)? {
                Translation::Ram { host, .. } => self.cpu.endian().load(self.mem.ram(host, size)),
                Translation::Io => self.io_read(addr, size, host_pc)?,
            }
        };
        self.observe(MemAccess::Read, addr, size, 0);
        self.observe(MemAccess::ReadAfter, addr, size, value);
        Ok(value)
    }

    /// Byte-wise slow path for loads straddling a page boundary.
    fn read_split(&mut self, addr: u64, size: usize, host_pc: Option<usize>) -> Result<u64, FaultKind> {
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate().take(size) {
            let a = addr.wrapping_add(i as u64);
            *byte = match self.translate_access(a, 1, AccessKind::Read, 0, host_pc)? {
                Translation::Ram { host, .. } => self.mem.ram(host, 1)[0],
                Translation::Io => self.io_read(a, 1, host_pc)? as u8,
            };
        }
        Ok(self.cpu.endian().load(&bytes[..size]))
    }

    /// Guest data store of the low `width` bytes of `value` at `addr`.
    pub(crate) fn write_mem(
        &mut self,
        addr: u64,
        width: Width,
        value: u64,
        host_pc: Option<usize>,
    ) -> Result<(), FaultKind> {
        let size = width.bytes();
        let value = value & width.mask();
        if crosses_page(addr, size as u64) {
            self.write_split(addr, size, value, host_pc)?;
        } else {
            match self.translate_access(addr, size, AccessKind::Write, value, host_pc)? {
                Translation::Ram { host, notdirty } => {
                    if notdirty {
                        self.notdirty_write(addr, size);
                    }
                    let endian = self.cpu.endian();
                    endian.store(value, self.mem.ram_mut(host, size));
                }
                Translation::Io => self.io_write(addr, size, value, host_pc)?,
            }
        }
        self.observe(MemAccess::Write, addr, size, value);
        Ok(())
    }

    /// Byte-wise slow path for stores straddling a page boundary. Both pages are
    /// checked before any byte lands.
    fn write_split(&mut self, addr: u64, size: usize, value: u64, host_pc: Option<usize>) -> Result<(), FaultKind> {
        let last = addr.wrapping_add(size as u64 - 1);
        self.translate_access(addr, size, AccessKind::Write, value, host_pc)?;
        self.translate_access(page_base(last), size, AccessKind::Write, value, host_pc)?;
        let mut bytes = [0u8; 8];
        self.cpu.endian().store(value, &mut bytes[..size]);
        for (i, byte) in bytes.iter().enumerate().take(size) {
            let a = addr.wrapping_add(i as u64);
            match self.translate_access(a, 1, AccessKind::Write, value, host_pc)? {
                Translation::Ram { host, notdirty } => {
                    if notdirty {
                        self.notdirty_write(a, 1);
                    }
                    self.mem.ram_mut(host, 1)[0] = *byte;
                }
                Translation::Io => self.io_write(a, 1, *byte as u64, host_pc)?,
            }
        }
        Ok(())
    }

    /// A write to a page holding translated code: drop the blocks it overlaps.
    fn notdirty_write(&mut self, addr: u64, size: usize) {
        let inv = self.tbs.invalidate_range(addr, addr.wrapping_add(size as u64));
        self.after_invalidate(inv);
    }
}
