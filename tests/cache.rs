mod harness;

use harness::{config, emu, emu_with, load, reg, CODE};
use xlat_engine::{Perm, StopReason, TbInfo};
use xlat_toy::asm::*;
use xlat_toy::ToyCpu;
use xlat_types::PAGE_SIZE;

#[test]
fn lookup_is_stable_until_invalidated() {
    let mut emu = emu();
    load(&mut emu, CODE, &[movi(1, 1), movi(2, 2), jmp(-3)]);
    let info = emu.request_cache(CODE).unwrap();
    assert_eq!(
        info,
        TbInfo {
            pc: CODE,
            size: 12,
            icount: 3
        }
    );
    for _ in 0..3 {
        assert_eq!(emu.tb_lookup(CODE), Some(info));
    }
    assert_eq!(emu.request_cache(CODE).unwrap(), info);
    assert_eq!(emu.stats().tb.generated, 1);

    emu.remove_cache(CODE + 8, CODE + 9);
    assert_eq!(emu.tb_lookup(CODE), None);
}

#[test]
fn cache_is_flushed_when_start_returns() {
    let mut emu = emu();
    load(&mut emu, CODE, &[nop(), hlt()]);
    assert_eq!(emu.start(CODE, None, None, None), Ok(StopReason::Halted));
    assert_eq!(emu.tb_lookup(CODE), None);
}

#[test]
fn block_spanning_two_pages_is_invalidated_through_either() {
    let mut emu = emu_with(config(), ToyCpu::new());
    emu.mem_map(CODE, 2 * PAGE_SIZE, Perm::RWX).unwrap();
    let start = CODE + PAGE_SIZE - 8;
    load(&mut emu, start, &[nop(), nop(), nop(), hlt()]);

    let info = emu.request_cache(start).unwrap();
    assert_eq!((info.size, info.icount), (16, 4));

    emu.mem_write(CODE + PAGE_SIZE + 4, &hlt().to_le_bytes()).unwrap();
    assert_eq!(emu.tb_lookup(start), None);

    emu.request_cache(start).unwrap();
    emu.mem_write(start, &nop().to_le_bytes()).unwrap();
    assert_eq!(emu.tb_lookup(start), None);
}

#[test]
fn writes_next_to_code_leave_it_cached() {
    let mut emu = emu();
    load(&mut emu, CODE, &[nop(), hlt()]);
    emu.request_cache(CODE).unwrap();
    emu.mem_write(CODE + 8, &[0xaa; 8]).unwrap();
    assert!(emu.tb_lookup(CODE).is_some());
}

#[test]
fn guest_store_into_the_running_block_takes_effect() {
    let mut emu = emu();
    let patched = movi(3, 7);
    let mut program = li(1, patched as u64);
    program.extend(li(2, CODE + 28));
    assert_eq!(program.len(), 6);
    // The store rewrites the instruction right behind it, inside the same block.
    program.extend([stw(1, 2, 0), movi(3, 1), hlt()]);
    load(&mut emu, CODE, &program);

    assert_eq!(emu.start(CODE, None, None, None), Ok(StopReason::Halted));
    assert_eq!(reg(&emu, 3), 7);
    assert!(emu.stats().exec.exits_requested >= 1);
}

#[test]
fn arena_overflow_flushes_and_retries() {
    let mut emu = emu_with(config().with_code_buffer_size(1024), ToyCpu::new());
    emu.mem_map(CODE, PAGE_SIZE, Perm::RWX).unwrap();
    let mut program = Vec::new();
    for _ in 0..40 {
        program.extend([addi(1, 1, 1), jmp(0)]);
    }
    program.push(hlt());
    load(&mut emu, CODE, &program);

    assert_eq!(emu.start(CODE, None, None, None), Ok(StopReason::Halted));
    assert_eq!(reg(&emu, 1), 40);
    let tb = emu.stats().tb;
    assert!(tb.overflow_flushes >= 1);
    assert_eq!(tb.generated, 41);
}
