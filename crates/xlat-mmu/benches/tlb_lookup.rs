#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use xlat_mem::MemoryMap;
#[cfg(not(target_arch = "wasm32"))]
use xlat_mmu::{SoftMmu, TlbConfig};
#[cfg(not(target_arch = "wasm32"))]
use xlat_types::{AccessKind, Perm, PAGE_SIZE};

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
fn no_code(_: u64) -> bool {
    false
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_tlb(c: &mut Criterion) {
    const PAGES: u64 = 64;
    let mut mem = MemoryMap::new();
    mem.map_ram(0, PAGES * PAGE_SIZE, Perm::RW).unwrap();

    let mut group = c.benchmark_group("tlb");
    group.throughput(Throughput::Elements(PAGES));

    group.bench_function("hit", |b| {
        let mut mmu = SoftMmu::new(&TlbConfig::default());
        for p in 0..PAGES {
            mmu.translate(&mem, p * PAGE_SIZE, AccessKind::Read, 0, &no_code)
                .unwrap();
        }
        b.iter(|| {
            for p in 0..PAGES {
                black_box(
                    mmu.translate(&mem, black_box(p * PAGE_SIZE + 8), AccessKind::Read, 0, &no_code)
                        .unwrap(),
                );
            }
        })
    });

    group.bench_function("miss_refill", |b| {
        let mut mmu = SoftMmu::new(&TlbConfig::default());
        b.iter(|| {
            mmu.flush_all();
            for p in 0..PAGES {
                black_box(
                    mmu.translate(&mem, black_box(p * PAGE_SIZE), AccessKind::Write, 0, &no_code)
                        .unwrap(),
                );
            }
        })
    });

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_tlb
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
