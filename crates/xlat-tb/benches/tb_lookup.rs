#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use xlat_tb::{
    Backend, BlockEnd, CFlags, CodeArena, CompileError, CompiledCode, ExecEnv, IrBlock, StopToken,
    TbCache, TbCacheConfig, TbExit, TbExitReason, TbId,
};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("XLAT_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
struct NopBackend;

#[cfg(not(target_arch = "wasm32"))]
impl Backend for NopBackend {
    fn compile(&self, block: &IrBlock, arena: &mut CodeArena) -> Result<CompiledCode, CompileError> {
        let offset = arena.emit(&[0u8; 16])?;
        Ok(CompiledCode {
            offset,
            size: 16,
            insn_offsets: vec![0; block.insns.len()],
            jump_slots: [None; 2],
        })
    }

    fn execute(&self, tb: TbId, _entry: usize, _env: &mut dyn ExecEnv, _stop: &StopToken) -> u64 {
        TbExit::new(tb, TbExitReason::NoChain).pack()
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_lookup(c: &mut Criterion) {
    const BLOCKS: u64 = 1024;
    let mut cache = TbCache::new(&TbCacheConfig::default());
    for i in 0..BLOCKS {
        let pc = 0x10_0000 + i * 16;
        let mut b = IrBlock::new(pc);
        b.start_insn(pc, 4);
        b.end = BlockEnd::Exit { next_pc: pc + 4 };
        cache.build(b, &NopBackend, 0, CFlags::default());
    }

    let mut group = c.benchmark_group("tb_cache");
    group.throughput(Throughput::Elements(BLOCKS));
    group.bench_function("hash_lookup", |b| {
        b.iter(|| {
            for i in 0..BLOCKS {
                black_box(cache.lookup(black_box(0x10_0000 + i * 16), 0, CFlags::default()));
            }
        })
    });
    group.bench_function("jump_cache_lookup", |b| {
        b.iter(|| {
            for i in 0..BLOCKS {
                black_box(cache.lookup_cached(black_box(0x10_0000 + i * 16), 0, CFlags::default()));
            }
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_lookup
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
