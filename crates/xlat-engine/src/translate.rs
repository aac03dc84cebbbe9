use std::rc::Rc;

use tracing::trace;
use xlat_hooks::{dispatch_insn_invalid, HookType, MemAccess};
use xlat_mmu::Translation;
use xlat_tb::{CFlags, DecodeError, TbId, TranslateCtx};
use xlat_types::{page_base, AccessKind, FaultKind};

use crate::emu::Emu;
use crate::error::EmuError;

impl TranslateCtx for Emu {
    /// Fetches on the block's first page go through the fault hooks; a failure
    /// further on only ends the block early, and the next block reports it.
    fn fetch(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), FaultKind> {
        let size = buf.len();
        let first_page = page_base(addr) == page_base(self.translating_pc);
        let target = if first_page {
            self.translate_access(addr, size, AccessKind::Fetch, 0, None)?
        } else {
            self.tlb_translate(addr, AccessKind::Fetch)?
        };
        let Translation::Ram { host, .. } = target else {
            let fault = AccessKind::Fetch.protection_fault();
            if first_page {
                self.record_fault(fault, addr, size);
            }
            return Err(fault);
        };
        buf.copy_from_slice(self.mem.ram(host, size));
        self.observe(MemAccess::Fetch, addr, size, 0);
        Ok(())
    }

    fn wants_code_hook(&self, pc: u64) -> bool {
        self.hooks.covers(HookType::CODE, pc)
    }

    fn wants_block_hook(&self, pc: u64) -> bool {
        self.hooks.covers(HookType::BLOCK, pc)
    }

    fn wants_insn_hook(&self, id: u32) -> bool {
        self.hooks.has_insn(id)
    }

    fn is_exit(&self, pc: u64) -> bool {
        self.exits.contains(&pc)
    }
}

impl Emu {
    /// Decode and compile the block at `pc`.
    ///
    /// `Ok(None)` means the first instruction was undecodable but an
    /// `INSN_INVALID` hook took care of it; the caller should re-dispatch.
    pub(crate) fn tb_gen(&mut self, pc: u64, flags: u32, cflags: CFlags) -> Result<Option<TbId>, EmuError> {
        self.translating_pc = pc;
        let max_insns = cflags.max_insns(self.tbs.config().max_insns);
        let front_end = Rc::clone(&self.front_end);
        let block = match front_end.decode(self, pc, flags, max_insns) {
            Ok(block) => block,
            Err(DecodeError::Fetch { addr, fault }) => {
                let record = match self.fault {
                    Some(record) if record.kind == fault && record.addr == addr => record,
                    _ => self.record_fault(fault, addr, 1),
                };
                return Err(EmuError::Fault(record));
            }
            Err(DecodeError::InvalidInstruction { pc }) => {
                let hooks = self.hooks.matching(HookType::INSN_INVALID, pc);
                if dispatch_insn_invalid(&hooks, self) {
                    return Ok(None);
                }
                return Err(EmuError::InvalidInstruction { pc });
            }
        };

        let backend = Rc::clone(&self.backend);
        let outcome = self.tbs.build(block, &*backend, flags, cflags);
        if outcome.flushed {
            self.mmu.flush_all();
        }
        let tb = outcome.tb;
        if let Some(info) = self.tbs.get(tb) {
            trace!(pc, size = info.size, icount = info.icount, ?cflags, "generated block");
            for page in info.page_addr.into_iter().flatten() {
                self.mmu.protect_code(page);
            }
        }
        Ok(Some(tb))
    }

    /// Find the block for `pc` in the current mode, translating it on a miss.
    pub(crate) fn tb_find(&mut self, pc: u64, cflags: CFlags) -> Result<Option<TbId>, EmuError> {
        let flags = self.cpu.tb_flags();
        if let Some(tb) = self.tbs.lookup_cached(pc, flags, cflags) {
            return Ok(Some(tb));
        }
        self.tb_gen(pc, flags, cflags)
    }
}
