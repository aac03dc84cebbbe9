use std::cell::{Cell, RefCell};
use std::rc::Rc;

use xlat_interp::Interp;
use xlat_tb::{BinOp, BlockEnd, DecodeError, FrontEnd, IrBlock, IrOp, Reg, TranslateCtx};
use xlat_types::{EXCP_HLT, PAGE_SIZE};

use super::*;

/// One accumulator register and three instructions, enough to drive the loop:
/// `0x00` increments `r0`, `0x01` jumps to `word >> 8`, `0x02` halts.
struct Mini {
    pc: u64,
    r0: u64,
}

const MINI_PC: u16 = 1;

impl GuestCpu for Mini {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn reg_count(&self) -> u16 {
        2
    }

    fn pc_reg(&self) -> u16 {
        MINI_PC
    }

    fn read_reg(&self, reg: u16) -> u64 {
        match reg {
            MINI_PC => self.pc,
            _ => self.r0,
        }
    }

    fn write_reg(&mut self, reg: u16, value: u64) {
        match reg {
            MINI_PC => self.pc = value,
            _ => self.r0 = value,
        }
    }

    fn tb_flags(&self) -> u32 {
        0
    }

    fn mmu_index(&self) -> usize {
        0
    }
}

struct MiniFrontEnd;

impl FrontEnd for MiniFrontEnd {
    fn decode(
        &self,
        ctx: &mut dyn TranslateCtx,
        pc: u64,
        _flags: u32,
        max_insns: u32,
    ) -> Result<IrBlock, DecodeError> {
        let mut block = IrBlock::new(pc);
        let mut cur = pc;
        loop {
            let first = block.insns.is_empty();
            if !first && (block.icount() >= max_insns || ctx.is_exit(cur)) {
                block.end = BlockEnd::Exit { next_pc: cur };
                return Ok(block);
            }
            let mut word = [0u8; 4];
            if let Err(fault) = ctx.fetch(cur, &mut word) {
                if first {
                    return Err(DecodeError::Fetch { addr: cur, fault });
                }
                block.end = BlockEnd::Exit { next_pc: cur };
                return Ok(block);
            }
            let word = u32::from_le_bytes(word);
            let mark = block.ops.len();
            block.start_insn(cur, 4);
            if ctx.wants_code_hook(cur) {
                block.push(IrOp::HookCode { pc: cur, size: 4 });
            }
            match word & 0xff {
                0x00 => block.push(IrOp::BinImm {
                    op: BinOp::Add,
                    dst: Reg::Guest(0),
                    a: Reg::Guest(0),
                    imm: 1,
                }),
                0x01 => {
                    block.end = BlockEnd::Jump {
                        target: (word >> 8) as u64,
                        chain: true,
                    };
                    return Ok(block);
                }
                0x02 => {
                    block.end = BlockEnd::Raise {
                        excp: EXCP_HLT,
                        pc: cur + 4,
                    };
                    return Ok(block);
                }
                _ => {
                    block.insns.pop();
                    block.ops.truncate(mark);
                    if block.insns.is_empty() {
                        return Err(DecodeError::InvalidInstruction { pc: cur });
                    }
                    block.end = BlockEnd::Exit { next_pc: cur };
                    return Ok(block);
                }
            }
            cur += 4;
        }
    }
}

const INC: u32 = 0x00;
const HLT: u32 = 0x02;

fn jmp(target: u64) -> u32 {
    ((target as u32) << 8) | 0x01
}

fn emu() -> Emu {
    emu_with(EngineConfig::default().with_code_buffer_size(1 << 20))
}

fn emu_with(config: EngineConfig) -> Emu {
    Emu::new(
        config,
        Box::new(Mini { pc: 0, r0: 0 }),
        Rc::new(MiniFrontEnd),
        Rc::new(Interp::new()),
    )
}

fn load(emu: &mut Emu, addr: u64, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    emu.mem_write(addr, &bytes).unwrap();
}

#[test]
fn config_round_trips_through_json_and_fills_defaults() {
    let config = EngineConfig::default()
        .with_max_insns(32)
        .with_victim_entries(0)
        .with_hook_order(HookOrder::Prepend);
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(serde_json::from_str::<EngineConfig>(&json).unwrap(), config);

    let partial: EngineConfig = serde_json::from_str(r#"{"single_step": true}"#).unwrap();
    assert!(partial.single_step);
    assert_eq!(partial.max_insns, EngineConfig::default().max_insns);
    assert_eq!(partial.tlb, EngineConfig::default().tlb);
}

#[test]
fn register_access_is_bounds_checked() {
    let mut emu = emu();
    emu.reg_write(0, 7).unwrap();
    assert_eq!(emu.reg_read(0).unwrap(), 7);
    emu.reg_write(MINI_PC, 0x40).unwrap();
    assert_eq!(emu.pc(), 0x40);
    assert_eq!(emu.reg_read(9), Err(EmuError::InvalidRegister(9)));
    assert_eq!(emu.reg_write(2, 0), Err(EmuError::InvalidRegister(2)));
}

#[test]
fn runs_until_halt() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, INC, INC, HLT]);
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Halted));
    assert_eq!(emu.reg_read(0).unwrap(), 3);
    assert_eq!(emu.pc(), 0x1010);
    assert!(emu.is_halted());

    // Restarted where it stopped, a halted CPU with nothing pending stays put...
    assert_eq!(emu.start(0x1010, None, None, None), Ok(StopReason::Halted));
    assert_eq!(emu.reg_read(0).unwrap(), 3);
    // A new entry point wakes it.
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Halted));
    assert_eq!(emu.reg_read(0).unwrap(), 6);

    emu.set_pc(0x1000);
    assert!(!emu.is_halted());
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Halted));
    assert_eq!(emu.reg_read(0).unwrap(), 9);
}

#[test]
fn until_address_stops_before_executing_it() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, INC, INC, INC, HLT]);
    assert_eq!(
        emu.start(0x1000, Some(0x1008), None, None),
        Ok(StopReason::UntilReached)
    );
    assert_eq!(emu.reg_read(0).unwrap(), 2);
    assert_eq!(emu.pc(), 0x1008);
}

#[test]
fn count_limit_is_exact_across_chained_blocks() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, INC, INC, jmp(0x1000)]);
    assert_eq!(emu.start(0x1000, None, None, Some(10)), Ok(StopReason::CountExpired));
    // Ten instructions: two full loops (8) then two more increments.
    assert_eq!(emu.reg_read(0).unwrap(), 8);
    assert_eq!(emu.pc(), 0x1008);
    assert!(emu.stats().exec.nocache_blocks >= 1);
}

#[test]
fn fetch_from_unmapped_memory_is_reported() {
    let mut emu = emu();
    let err = emu.start(0x8000, None, None, None).unwrap_err();
    assert_eq!(err.fault_kind(), Some(FaultKind::FetchUnmapped));
    let record = emu.last_fault().unwrap();
    assert_eq!((record.addr, record.pc), (0x8000, 0x8000));
}

#[test]
fn fetch_fault_hook_can_map_the_page() {
    let mut emu = emu();
    let calls = Rc::new(Cell::new(0));
    let seen = calls.clone();
    emu.add_fault_hook(HookType::MEM_FETCH_UNMAPPED, HookRange::ALL, move |emu, access, addr, _, _| {
        seen.set(seen.get() + 1);
        assert_eq!(access, MemAccess::FetchUnmapped);
        emu.mem_map(addr & !(PAGE_SIZE - 1), PAGE_SIZE, Perm::RWX).unwrap();
        emu.mem_write(addr, &HLT.to_le_bytes()).unwrap();
        true
    })
    .unwrap();
    assert_eq!(emu.start(0x8000, None, None, None), Ok(StopReason::Halted));
    assert_eq!(calls.get(), 1);
}

#[test]
fn handled_fault_is_retried_exactly_once() {
    let mut emu = emu();
    let calls = Rc::new(Cell::new(0));
    let seen = calls.clone();
    emu.add_fault_hook(HookType::MEM_READ_UNMAPPED, HookRange::ALL, move |_, _, _, _, _| {
        seen.set(seen.get() + 1);
        true
    })
    .unwrap();
    assert_eq!(emu.probe(0x5000, 4, AccessKind::Read), Err(FaultKind::ReadUnmapped));
    assert_eq!(calls.get(), 1);
    assert_eq!(emu.last_fault().map(|f| f.addr), Some(0x5000));
}

#[test]
fn write_to_read_only_page_needs_a_hook() {
    let mut emu = emu();
    emu.mem_map(0x2000, PAGE_SIZE, Perm::READ).unwrap();
    assert!(emu.probe(0x2000, 8, AccessKind::Read).is_ok());
    assert_eq!(emu.probe(0x2000, 8, AccessKind::Write), Err(FaultKind::WriteProtected));

    emu.add_fault_hook(HookType::MEM_WRITE_PROT, HookRange::new(0x2000, 0x2fff), |emu, _, addr, _, _| {
        emu.mem_protect(addr & !(PAGE_SIZE - 1), PAGE_SIZE, Perm::RW).is_ok()
    })
    .unwrap();
    assert!(matches!(
        emu.probe(0x2000, 8, AccessKind::Write),
        Ok(Translation::Ram { .. })
    ));
}

#[test]
fn straddling_access_checks_both_pages() {
    let mut emu = emu();
    emu.mem_map(0x3000, PAGE_SIZE, Perm::RW).unwrap();
    assert_eq!(
        emu.probe(0x3ffc, 8, AccessKind::Read),
        Err(FaultKind::ReadUnmapped)
    );
    assert_eq!(emu.last_fault().map(|f| f.addr), Some(0x4000));
}

#[test]
fn nested_start_is_rejected() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, HLT]);
    let nested = Rc::new(RefCell::new(None));
    let out = nested.clone();
    emu.add_code_hook(HookRange::new(0x1000, 0x1000), move |emu, _, _| {
        *out.borrow_mut() = Some(emu.start(0x1000, None, None, None));
    })
    .unwrap();
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Halted));
    assert_eq!(*nested.borrow(), Some(Err(EmuError::Busy)));
    assert!(!emu.is_running());
}

#[test]
fn stop_from_a_code_hook() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, INC, jmp(0x1000)]);
    emu.add_code_hook(HookRange::new(0x1004, 0x1004), |emu, _, _| {
        if emu.reg_read(0).unwrap() >= 5 {
            emu.stop();
        }
    })
    .unwrap();
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Stopped));
    assert_eq!(emu.reg_read(0).unwrap(), 5);
    assert_eq!(emu.pc(), 0x1004);
}

#[test]
fn hook_writing_pc_redirects_execution() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, INC, HLT]);
    load(&mut emu, 0x1100, &[INC, INC, INC, INC, HLT]);
    emu.add_code_hook(HookRange::new(0x1004, 0x1004), |emu, _, _| {
        emu.reg_write(MINI_PC, 0x1100).unwrap();
    })
    .unwrap();
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Halted));
    assert_eq!(emu.reg_read(0).unwrap(), 5);
    assert_eq!(emu.pc(), 0x1114);
}

#[test]
fn invalid_instruction_without_hook_is_an_error() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, 0xff]);
    assert_eq!(
        emu.start(0x1000, None, None, None),
        Err(EmuError::InvalidInstruction { pc: 0x1004 })
    );
    assert_eq!(emu.reg_read(0).unwrap(), 1);
}

#[test]
fn invalid_instruction_hook_may_skip_it() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, 0xff, INC, HLT]);
    emu.add_insn_invalid_hook(|emu| {
        let pc = emu.pc();
        emu.set_pc(pc + 4);
        true
    })
    .unwrap();
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Halted));
    assert_eq!(emu.reg_read(0).unwrap(), 2);
}

#[test]
fn request_cache_translates_and_lookup_finds_it() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, INC, jmp(0x1000)]);
    assert_eq!(emu.tb_lookup(0x1000), None);
    let info = emu.request_cache(0x1000).unwrap();
    assert_eq!(info, TbInfo { pc: 0x1000, size: 12, icount: 3 });
    assert_eq!(emu.tb_lookup(0x1000), Some(info));

    emu.remove_cache(0x1008, 0x100c);
    assert_eq!(emu.tb_lookup(0x1000), None);
}

#[test]
fn adding_a_code_hook_flushes_translations() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, HLT]);
    emu.request_cache(0x1000).unwrap();
    emu.add_code_hook(HookRange::ALL, |_, _, _| {}).unwrap();
    assert_eq!(emu.tb_lookup(0x1000), None);
}

#[test]
fn hard_interrupt_returns_to_the_caller() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, jmp(0x1000)]);
    emu.add_code_hook(HookRange::new(0x1000, 0x1000), |emu, _, _| {
        if emu.reg_read(0).unwrap() == 3 {
            emu.interrupt(InterruptRequest::HARD);
        }
    })
    .unwrap();
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Interrupted));
    assert_eq!(emu.reg_read(0).unwrap(), 3);
}

#[test]
fn reset_stats_zeroes_every_counter() {
    let mut emu = emu();
    emu.mem_map(0x1000, PAGE_SIZE, Perm::RWX).unwrap();
    load(&mut emu, 0x1000, &[INC, HLT]);
    assert_eq!(emu.start(0x1000, None, None, None), Ok(StopReason::Halted));
    let before = emu.stats();
    assert_eq!(before.exec.runs, 1);
    assert_eq!(before.tb.generated, 1);
    assert!(before.tlb.lookups > 0);

    emu.reset_stats();
    assert_eq!(emu.stats(), Stats::default());
}
