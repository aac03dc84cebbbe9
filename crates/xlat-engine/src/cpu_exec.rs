//! The dispatch loop.
//!
//! ```text
//! ENTER -> DISPATCH -> { EXEC_BLOCK <-> DISPATCH } -> STOPPED
//!              \-> HANDLE_EXCEPTION -/
//! ```
//!
//! The outer loop delivers pending exceptions; the inner loop finds or translates
//! the next block, optionally links it behind the previous one, and runs it.

use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, trace};
use xlat_hooks::{
    dispatch_code, dispatch_insn, dispatch_intr, HookFn, HookOrder, HookRange, HookSpec, HookType,
};
use xlat_tb::{BlockEntry, CFlags, ExecEnv, StopToken, TbExit, TbExitReason, TbId};
use xlat_types::{Width, EXCP_DEBUG, EXCP_HALTED, EXCP_HLT, EXCP_INTERRUPT};

use crate::emu::{CountLimit, Emu, InterruptRequest};
use crate::error::{EmuError, StopReason};
use crate::timer::Timeout;

impl Emu {
    /// Run from `begin` until something stops execution.
    ///
    /// * `until`: stop with [`StopReason::UntilReached`] before executing this address.
    /// * `timeout`: stop with [`StopReason::Timeout`] after this long.
    /// * `count`: stop with [`StopReason::CountExpired`] after this many instructions.
    ///
    /// A halted CPU restarted at the pc it halted at stays halted; any other
    /// `begin` is a new entry point and wakes it.
    ///
    /// The translation cache is flushed before returning, whatever the outcome.
    pub fn start(
        &mut self,
        begin: u64,
        until: Option<u64>,
        timeout: Option<Duration>,
        count: Option<u64>,
    ) -> Result<StopReason, EmuError> {
        if self.running {
            return Err(EmuError::Busy);
        }
        self.stop.clear();
        self.fault = None;
        self.exception = None;
        self.exit_request = false;
        self.pc_forced = false;
        if begin != self.cpu.pc() {
            self.halted = false;
        }
        self.cpu.set_pc(begin);
        self.exits.clear();
        self.exits.extend(until);
        if let Some(limit) = count.filter(|&c| c > 0) {
            self.install_count_hook(limit)?;
        }
        // Blocks cached before the exit was known may run straight across it.
        if until.is_some() || self.flush_pending {
            self.flush_pending = false;
            self.flush_now();
        }
        self.running = true;
        self.stats.runs = self.stats.runs.wrapping_add(1);
        debug!(begin, ?until, ?timeout, ?count, "emulation start");

        let timer = timeout.map(|t| Timeout::spawn(t, self.stop.clone()));
        let result = self.cpu_exec();
        let timed_out = timer.is_some_and(Timeout::finish);

        self.running = false;
        self.in_code = false;
        self.current_tb = None;
        if let Some(count) = self.count.take() {
            let _ = self.hooks.remove(count.hook);
        }
        self.hooks.purge();
        self.exits.clear();
        self.flush_pending = false;
        self.flush_now();

        let result = match result {
            Ok(StopReason::Stopped) if timed_out => Ok(StopReason::Timeout),
            other => other,
        };
        debug!(?result, pc = self.cpu.pc(), "emulation stopped");
        result
    }

    /// Instruction counting is a prepended `CODE` hook over the whole address
    /// space; block entry refuses blocks that would overrun the budget.
    fn install_count_hook(&mut self, limit: u64) -> Result<(), EmuError> {
        let hook = self.hooks.add(
            HookSpec {
                ty: HookType::CODE,
                range: HookRange::ALL,
                insn: None,
                callback: HookFn::Code(Box::new(|emu: &mut Emu, _pc: u64, _size: u32| {
                    emu.count_tick()
                })),
            },
            HookOrder::Prepend,
        )?;
        self.count = Some(CountLimit {
            limit,
            executed: 0,
            hook,
        });
        // Blocks translated earlier carry no count checkpoints.
        self.flush_now();
        Ok(())
    }

    fn count_tick(&mut self) {
        if let Some(count) = self.count.as_mut() {
            count.executed += 1;
            if count.executed > count.limit {
                self.stop.request();
            }
        }
    }

    fn stopped(&mut self) -> Result<StopReason, EmuError> {
        match self.fault {
            Some(record) => Err(EmuError::Fault(record)),
            None => Ok(StopReason::Stopped),
        }
    }

    fn cpu_exec(&mut self) -> Result<StopReason, EmuError> {
        if self.halted && !self.interrupt_request.contains(InterruptRequest::HARD) {
            return Ok(StopReason::Halted);
        }
        let stop = self.stop.clone();

        loop {
            if let Some(excp) = self.exception.take() {
                if let Some(reason) = self.handle_exception(excp)? {
                    return Ok(reason);
                }
            }

            let mut last: Option<(TbId, u8)> = None;
            while self.exception.is_none() {
                if stop.is_requested() {
                    return self.stopped();
                }
                self.exit_request = false;
                self.pc_forced = false;
                if self.flush_pending {
                    self.flush_pending = false;
                    self.flush_now();
                    last = None;
                }
                if !self.interrupt_request.is_empty() {
                    let pending = std::mem::take(&mut self.interrupt_request);
                    last = None;
                    if pending.contains(InterruptRequest::HARD) {
                        self.halted = false;
                        self.exception = Some(EXCP_INTERRUPT);
                        break;
                    }
                }

                let pc = self.cpu.pc();
                if self.exits.contains(&pc) {
                    return Ok(StopReason::UntilReached);
                }

                let cflags = self.cflags();
                let Some(tb) = self.tb_find(pc, cflags)? else {
                    last = None;
                    continue;
                };
                if let Some((from, slot)) = last.take() {
                    if self.tbs.link(from, slot, tb) {
                        trace!(?from, slot, to = ?tb, "chained");
                    }
                }

                let exit = self.run_block(tb, &stop);
                match exit.reason {
                    TbExitReason::Chain { slot } => last = exit.tb.map(|from| (from, slot)),
                    TbExitReason::NoChain => {}
                    TbExitReason::Requested => {
                        self.stats.exits_requested = self.stats.exits_requested.wrapping_add(1);
                    }
                    TbExitReason::CountExpired => {
                        if let Some(reason) = self.count_expired(&stop)? {
                            return Ok(reason);
                        }
                    }
                }
            }
        }
    }

    fn run_block(&mut self, tb: TbId, stop: &StopToken) -> TbExit {
        let Some(entry) = self.tbs.get(tb).map(|t| t.code_offset) else {
            panic!("dispatching invalid block {tb:?}");
        };
        let backend = Rc::clone(&self.backend);
        self.in_code = true;
        let word = backend.execute(tb, entry, self, stop);
        self.in_code = false;
        self.current_tb = None;
        TbExit::unpack(word)
    }

    /// A block was refused for lack of budget. Run what is left of the budget
    /// through a one-shot block, or report the budget spent.
    fn count_expired(&mut self, stop: &StopToken) -> Result<Option<StopReason>, EmuError> {
        self.stats.count_expired = self.stats.count_expired.wrapping_add(1);
        let remaining = self.count.map(|c| c.remaining()).unwrap_or(0);
        if remaining == 0 {
            return Ok(Some(StopReason::CountExpired));
        }
        let pc = self.cpu.pc();
        if self.exits.contains(&pc) {
            return Ok(Some(StopReason::UntilReached));
        }
        let budget = remaining.min(CFlags::COUNT_MASK as u64) as u32;
        let cflags = self.cflags().with(CFlags::NOCACHE);
        let cflags = CFlags(cflags.0 | CFlags::with_count(budget).0);
        let flags = self.cpu.tb_flags();
        let Some(tb) = self.tb_gen(pc, flags, cflags)? else {
            return Ok(None);
        };
        self.stats.nocache_blocks = self.stats.nocache_blocks.wrapping_add(1);
        trace!(pc, budget, "running one-shot block");
        let exit = self.run_block(tb, stop);
        if exit.reason == TbExitReason::Requested {
            self.stats.exits_requested = self.stats.exits_requested.wrapping_add(1);
        }
        let inv = self.tbs.discard(tb);
        self.after_invalidate(inv);
        Ok(None)
    }

    /// Deliver exception `excp`. `Some` ends the run.
    fn handle_exception(&mut self, excp: u32) -> Result<Option<StopReason>, EmuError> {
        self.stats.exceptions = self.stats.exceptions.wrapping_add(1);
        match excp {
            EXCP_DEBUG => return Ok(Some(StopReason::DebugTrap)),
            EXCP_HLT | EXCP_HALTED => {
                self.halted = true;
                return Ok(Some(StopReason::Halted));
            }
            e if e >= EXCP_INTERRUPT => return Ok(Some(StopReason::Interrupted)),
            _ => {}
        }
        if self.cpu.stops_on_exception(excp) {
            return Ok(Some(StopReason::Exception { intno: excp }));
        }
        if !self.hooks.has(HookType::INTR) {
            debug!(intno = excp, pc = self.cpu.pc(), "no interrupt hook");
            self.halted = true;
            return Err(EmuError::UnhandledInterrupt { intno: excp });
        }
        let hooks = self.hooks.matching(HookType::INTR, self.cpu.pc());
        dispatch_intr(&hooks, self, excp);
        Ok(None)
    }
}

impl ExecEnv for Emu {
    fn code(&self) -> &[u8] {
        self.tbs.code()
    }

    fn read_reg(&self, reg: u16) -> u64 {
        self.cpu.read_reg(reg)
    }

    fn write_reg(&mut self, reg: u16, value: u64) {
        self.cpu.write_reg(reg, value);
    }

    fn set_pc(&mut self, pc: u64) {
        if !self.pc_forced {
            self.cpu.set_pc(pc);
        }
    }

    fn load(&mut self, addr: u64, width: Width, host_pc: usize) -> Option<u64> {
        self.read_mem(addr, width, Some(host_pc)).ok()
    }

    fn store(&mut self, addr: u64, width: Width, value: u64, host_pc: usize) -> bool {
        self.write_mem(addr, width, value, Some(host_pc)).is_ok()
    }

    fn hook_code(&mut self, pc: u64, size: u32) {
        if !self.pc_forced {
            self.cpu.set_pc(pc);
        }
        let hooks = self.hooks.matching(HookType::CODE, pc);
        dispatch_code(&hooks, self, pc, size);
    }

    fn hook_block(&mut self, pc: u64, size: u32) {
        let hooks = self.hooks.matching(HookType::BLOCK, pc);
        dispatch_code(&hooks, self, pc, size);
    }

    fn insn_hook(&mut self, id: u32, host_pc: usize) {
        let pc = self
            .tbs
            .find_by_host_offset(host_pc)
            .and_then(|tb| self.tbs.restore_state(tb, host_pc))
            .map(|(pc, _)| pc)
            .unwrap_or_else(|| self.cpu.pc());
        let hooks = self.hooks.matching_insn(id, pc);
        dispatch_insn(&hooks, self, id);
    }

    fn raise_exception(&mut self, excp: u32) {
        self.exception = Some(excp);
    }

    fn enter_block(&mut self, tb: TbId) -> BlockEntry {
        if self.exit_request || self.flush_pending || !self.interrupt_request.is_empty() {
            return BlockEntry::Exit;
        }
        if let Some(count) = self.count {
            let icount = self.tbs.get(tb).map(|t| t.icount).unwrap_or(0);
            if icount as u64 > count.remaining() {
                return BlockEntry::CountExpired;
            }
        }
        self.current_tb = Some(tb);
        self.stats.blocks_executed = self.stats.blocks_executed.wrapping_add(1);
        BlockEntry::Run
    }

    fn exit_requested(&self) -> bool {
        self.exit_request || !self.interrupt_request.is_empty()
    }
}
