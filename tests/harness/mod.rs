#![allow(dead_code)]

use std::rc::Rc;

use xlat_engine::{Emu, EngineConfig, Perm};
use xlat_interp::Interp;
use xlat_toy::asm::assemble;
use xlat_toy::{ToyCpu, ToyFrontEnd};
use xlat_types::PAGE_SIZE;

pub const CODE: u64 = 0x1_0000;
pub const DATA: u64 = 0x8_0000;

/// Route engine logs to the test harness's captured output. Safe to call more
/// than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn config() -> EngineConfig {
    EngineConfig::default().with_code_buffer_size(1 << 20)
}

pub fn emu_with(config: EngineConfig, cpu: ToyCpu) -> Emu {
    init_tracing();
    Emu::new(
        config,
        Box::new(cpu),
        Rc::new(ToyFrontEnd::new()),
        Rc::new(Interp::new()),
    )
}

/// Kernel-mode toy CPU with one RWX code page at [`CODE`] and one RW data page
/// at [`DATA`].
pub fn emu() -> Emu {
    let mut emu = emu_with(config(), ToyCpu::new());
    emu.mem_map(CODE, PAGE_SIZE, Perm::RWX).unwrap();
    emu.mem_map(DATA, PAGE_SIZE, Perm::RW).unwrap();
    emu
}

pub fn load(emu: &mut Emu, addr: u64, program: &[u32]) {
    emu.mem_write(addr, &assemble(program)).unwrap();
}

pub fn reg(emu: &Emu, r: u16) -> u64 {
    emu.reg_read(r).unwrap()
}
