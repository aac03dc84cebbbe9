use super::*;
use proptest::prelude::*;
use xlat_types::PAGE_SIZE;

/// Emits `BYTES_PER_INSN` filler bytes per instruction plus one jump slot per
/// chainable exit. Never executed.
struct FillBackend;

const BYTES_PER_INSN: usize = 32;

impl FillBackend {
    fn emit(block: &IrBlock, arena: &mut CodeArena, start: usize) -> Result<CompiledCode, CompileError> {
        let mut insn_offsets = Vec::new();
        for _ in &block.insns {
            insn_offsets.push((arena.cursor() - start) as u32);
            arena.emit(&[0xcc; BYTES_PER_INSN])?;
        }
        let chains = match block.end {
            BlockEnd::Jump { chain, .. } => [chain, false],
            BlockEnd::Branch {
                chain_taken,
                chain_not_taken,
                ..
            } => [chain_taken, chain_not_taken],
            _ => [false, false],
        };
        let mut jump_slots = [None; 2];
        for (slot, chain) in chains.into_iter().enumerate() {
            if chain {
                jump_slots[slot] = Some((arena.emit_jump_slot()? - start) as u32);
            }
        }
        Ok(CompiledCode {
            offset: start,
            size: arena.cursor() - start,
            insn_offsets,
            jump_slots,
        })
    }
}

impl Backend for FillBackend {
    fn compile(&self, block: &IrBlock, arena: &mut CodeArena) -> Result<CompiledCode, CompileError> {
        let start = arena.cursor();
        let out = Self::emit(block, arena, start);
        if out.is_err() {
            arena.truncate(start);
        }
        out
    }

    fn execute(&self, tb: TbId, _entry: usize, _env: &mut dyn ExecEnv, _stop: &StopToken) -> u64 {
        TbExit::new(tb, TbExitReason::NoChain).pack()
    }
}

fn block(pc: u64, insns: u32, end: BlockEnd) -> IrBlock {
    let mut b = IrBlock::new(pc);
    for i in 0..insns {
        b.start_insn(pc + 4 * i as u64, 4);
    }
    b.end = end;
    b
}

fn jump(pc: u64, insns: u32, target: u64) -> IrBlock {
    block(pc, insns, BlockEnd::Jump { target, chain: true })
}

fn cache() -> TbCache {
    TbCache::new(&TbCacheConfig::default())
}

#[test]
fn lookup_returns_same_block_until_invalidated() {
    let mut c = cache();
    let id = c.build(jump(0x1000, 2, 0x1000), &FillBackend, 0, CFlags::default()).tb;
    assert_eq!(c.lookup(0x1000, 0, CFlags::default()), Some(id));
    assert_eq!(c.lookup(0x1000, 0, CFlags::default()), Some(id));
    assert_eq!(c.lookup(0x1000, 1, CFlags::default()), None);
    assert_eq!(c.lookup(0x1000, 0, CFlags(CFlags::SINGLE_STEP)), None);
    // NOCACHE is not part of the key.
    assert_eq!(c.lookup(0x1000, 0, CFlags(CFlags::NOCACHE)), Some(id));

    let gen = c.generation();
    let out = c.invalidate(id);
    assert_eq!(out.tbs, vec![id]);
    assert_eq!(out.code_free_pages, vec![0x1000]);
    assert!(c.generation() > gen);
    assert_eq!(c.lookup(0x1000, 0, CFlags::default()), None);
    assert!(c.get(id).is_none());
    assert!(!c.has_code(0x1000));
    assert!(c.is_empty());
}

#[test]
fn invalidate_range_only_drops_overlapping_blocks() {
    let mut c = cache();
    let a = c.build(jump(0x1000, 2, 0x1000), &FillBackend, 0, CFlags::default()).tb;
    let b = c.build(jump(0x1100, 2, 0x1100), &FillBackend, 0, CFlags::default()).tb;
    let out = c.invalidate_range(0x1104, 0x1106);
    assert_eq!(out.tbs, vec![b]);
    assert!(out.code_free_pages.is_empty());
    assert!(c.get(a).is_some());
    assert_eq!(c.pages().tbs(0x1000), &[(a, 0)]);
    assert_eq!(c.lookup(0x1100, 0, CFlags::default()), None);
}

#[test]
fn cross_page_block_is_anchored_on_both_pages() {
    let mut c = cache();
    let pc = 2 * PAGE_SIZE - 4;
    let id = c
        .build(block(pc, 2, BlockEnd::Exit { next_pc: pc + 8 }), &FillBackend, 0, CFlags::default())
        .tb;
    let tb = c.get(id).unwrap();
    assert_eq!(tb.page_addr, [Some(PAGE_SIZE), Some(2 * PAGE_SIZE)]);
    assert_eq!(c.pages().tbs(PAGE_SIZE), &[(id, 0)]);
    assert_eq!(c.pages().tbs(2 * PAGE_SIZE), &[(id, 1)]);

    let out = c.invalidate_range(2 * PAGE_SIZE, 2 * PAGE_SIZE + 1);
    assert!(out.contains(id));
    assert_eq!(out.code_free_pages.len(), 2);
    assert!(c.pages().is_empty());
}

#[test]
fn link_patches_slot_and_invalidation_unlinks() {
    let mut c = cache();
    let a = c.build(jump(0x1000, 1, 0x1010), &FillBackend, 0, CFlags::default()).tb;
    let b = c.build(jump(0x1010, 1, 0x1000), &FillBackend, 0, CFlags::default()).tb;
    assert!(c.link(a, 0, b));
    assert!(c.link(b, 0, a));
    assert!(!c.link(a, 1, b), "jump blocks have no second slot");

    let slot_at = |c: &TbCache, id: TbId| {
        let tb = c.get(id).unwrap();
        tb.code_offset + BYTES_PER_INSN
    };
    let at = slot_at(&c, a);
    let slot = read_jump_slot(&c.code()[at..]).unwrap();
    assert_eq!(slot.tb, b);
    assert_eq!(slot.code_offset, c.get(b).unwrap().code_offset);
    assert_eq!(c.get(b).unwrap().incoming(), &[(a, 0)]);

    c.invalidate(b);
    assert!(read_jump_slot(&c.code()[at..]).is_none());
    assert_eq!(c.get(a).unwrap().jmp_dest(0), None);
    assert!(c.get(a).unwrap().incoming().is_empty());
    assert!(!c.link(a, 0, b));
}

#[test]
fn self_loop_link_survives_invalidation() {
    let mut c = cache();
    let a = c.build(jump(0x2000, 2, 0x2000), &FillBackend, 0, CFlags::default()).tb;
    assert!(c.link(a, 0, a));
    assert_eq!(c.get(a).unwrap().jmp_dest(0), Some(a));
    c.invalidate(a);
    assert!(c.is_empty());
}

#[test]
fn cross_page_and_nochain_targets_get_no_slot() {
    let mut c = cache();
    let a = c.build(jump(0x1000, 1, 0x5000), &FillBackend, 0, CFlags::default()).tb;
    assert!(!c.get(a).unwrap().has_jump_slot(0));
    let b = c
        .build(jump(0x1100, 1, 0x1100), &FillBackend, 0, CFlags(CFlags::NO_GOTO_TB))
        .tb;
    assert!(!c.get(b).unwrap().has_jump_slot(0));
    let d = c
        .build(
            block(
                0x1200,
                1,
                BlockEnd::Branch {
                    cond: Cond::Eq,
                    a: Reg::Guest(0),
                    b: Reg::Guest(1),
                    taken: 0x1200,
                    not_taken: 0x9000,
                    chain_taken: true,
                    chain_not_taken: true,
                },
            ),
            &FillBackend,
            0,
            CFlags::default(),
        )
        .tb;
    assert!(c.get(d).unwrap().has_jump_slot(0));
    assert!(!c.get(d).unwrap().has_jump_slot(1));
}

#[test]
fn arena_overflow_flushes_once_and_retries() {
    let cfg = TbCacheConfig {
        code_buffer_size: 1024,
        ..TbCacheConfig::default()
    };
    let mut c = TbCache::new(&cfg);
    let mut ids = Vec::new();
    let mut flushes = 0;
    for i in 0..10u64 {
        let out = c.build(jump(0x1000 + i * 0x40, 4, 0x1000), &FillBackend, 0, CFlags::default());
        if out.flushed {
            flushes += 1;
            assert!(ids.iter().all(|id| c.get(*id).is_none()));
            ids.clear();
        }
        ids.push(out.tb);
    }
    assert!(flushes >= 1);
    assert_eq!(c.stats().overflow_flushes, flushes);
    assert_eq!(c.stats().flushes, flushes);
    assert!(ids.iter().all(|id| c.get(*id).is_some()));
}

#[test]
#[should_panic(expected = "does not fit an empty code arena")]
fn block_larger_than_arena_is_fatal() {
    let cfg = TbCacheConfig {
        code_buffer_size: 64,
        ..TbCacheConfig::default()
    };
    let mut c = TbCache::new(&cfg);
    c.build(jump(0x1000, 8, 0x1000), &FillBackend, 0, CFlags::default());
}

#[test]
fn duplicate_generation_keeps_existing_block() {
    let mut c = cache();
    let a = c.build(jump(0x3000, 2, 0x3000), &FillBackend, 0, CFlags::default()).tb;
    let cursor = c.arena().cursor();
    let again = c.build(jump(0x3000, 2, 0x3000), &FillBackend, 0, CFlags::default()).tb;
    assert_eq!(again, a);
    assert_eq!(c.arena().cursor(), cursor);
    assert_eq!(c.stats().duplicates, 1);
    assert_eq!(c.len(), 1);
}

#[test]
fn code_bitmap_skips_writes_that_miss_code() {
    let cfg = TbCacheConfig {
        smc_bitmap_threshold: 2,
        ..TbCacheConfig::default()
    };
    let mut c = TbCache::new(&cfg);
    let a = c.build(jump(0x1000, 2, 0x1000), &FillBackend, 0, CFlags::default()).tb;
    for _ in 0..4 {
        assert!(c.invalidate_range(0x1800, 0x1804).is_empty());
    }
    assert!(c.pages().has_bitmap(0x1000));
    assert!(c.stats().bitmap_skips >= 2);
    assert!(c.get(a).is_some());

    let out = c.invalidate_range(0x1004, 0x1005);
    assert_eq!(out.tbs, vec![a]);
}

#[test]
fn host_offset_maps_back_to_guest_instruction() {
    let mut c = cache();
    c.build(jump(0x1000, 1, 0x1000), &FillBackend, 0, CFlags::default());
    let id = c.build(jump(0x2000, 3, 0x2000), &FillBackend, 0, CFlags::default()).tb;
    let base = c.get(id).unwrap().code_offset;

    assert_eq!(c.find_by_host_offset(base), Some(id));
    assert_eq!(c.find_by_host_offset(base + 2 * BYTES_PER_INSN + 5), Some(id));
    assert_eq!(c.restore_state(id, base), Some((0x2000, 0)));
    assert_eq!(c.restore_state(id, base + BYTES_PER_INSN + 1), Some((0x2004, 1)));
    assert_eq!(c.restore_state(id, base + 2 * BYTES_PER_INSN), Some((0x2008, 2)));
    assert_eq!(c.find_by_host_offset(c.arena().cursor() + 100), None);
}

#[test]
fn nocache_blocks_stay_out_of_hash_and_reclaim_space() {
    let mut c = cache();
    let cursor = c.arena().cursor();
    let id = c
        .build(jump(0x4000, 2, 0x4000), &FillBackend, 0, CFlags(CFlags::NOCACHE))
        .tb;
    assert!(c.lookup(0x4000, 0, CFlags::default()).is_none());
    assert!(c.has_code(0x4000));
    assert_eq!(c.find_by_host_offset(cursor), Some(id));
    c.discard(id);
    assert_eq!(c.arena().cursor(), cursor);
    assert!(c.get(id).is_none());
    assert!(!c.has_code(0x4000));
}

#[test]
fn jump_cache_refills_from_hash_and_drops_invalid_entries() {
    let mut c = cache();
    let a = c.build(jump(0x1000, 1, 0x1000), &FillBackend, 0, CFlags::default()).tb;
    assert_eq!(c.lookup_cached(0x1000, 0, CFlags::default()), Some(a));
    assert_eq!(c.lookup_cached(0x1000, 0, CFlags::default()), Some(a));
    assert_eq!(c.stats().jmp_cache_hits, 1);
    c.invalidate(a);
    assert_eq!(c.lookup_cached(0x1000, 0, CFlags::default()), None);
    let b = c.build(jump(0x1000, 1, 0x1000), &FillBackend, 0, CFlags::default()).tb;
    assert_ne!(a, b);
    assert_eq!(c.lookup_cached(0x1000, 0, CFlags::default()), Some(b));
}

#[test]
fn any_invalidation_retires_jump_cache_hints() {
    let mut c = cache();
    let a = c.build(jump(0x1000, 1, 0x1000), &FillBackend, 0, CFlags::default()).tb;
    let b = c.build(jump(0x3000, 1, 0x3000), &FillBackend, 0, CFlags::default()).tb;
    c.lookup_cached(0x1000, 0, CFlags::default());
    c.lookup_cached(0x1000, 0, CFlags::default());
    assert_eq!(c.stats().jmp_cache_hits, 1);

    c.invalidate(b);
    // Refilled from the hash index under the new generation, then hit again.
    assert_eq!(c.lookup_cached(0x1000, 0, CFlags::default()), Some(a));
    assert_eq!(c.stats().jmp_cache_hits, 1);
    assert_eq!(c.lookup_cached(0x1000, 0, CFlags::default()), Some(a));
    assert_eq!(c.stats().jmp_cache_hits, 2);
}

#[test]
fn exit_word_packing() {
    let id = TbId {
        index: 7,
        generation: 3,
    };
    for reason in [
        TbExitReason::NoChain,
        TbExitReason::Chain { slot: 1 },
        TbExitReason::Requested,
        TbExitReason::CountExpired,
    ] {
        assert_eq!(TbExit::unpack(TbExit::new(id, reason).pack()), TbExit::new(id, reason));
    }
    assert_eq!(TbExit::unpack(0).tb, None);
}

#[test]
fn cflags_budget() {
    assert_eq!(CFlags::default().max_insns(512), 512);
    assert_eq!(CFlags::with_count(3).max_insns(512), 3);
    assert_eq!(CFlags(CFlags::SINGLE_STEP).max_insns(512), 1);
    assert_eq!(CFlags::with_count(1000).max_insns(512), 512);
}

proptest! {
    #[test]
    fn invalidated_blocks_never_resurface(ops in proptest::collection::vec((0u64..16, 1u32..6, any::<bool>()), 1..64)) {
        let mut c = cache();
        let mut dead = Vec::new();
        for (slot, insns, write) in ops {
            let pc = 0x1000 + slot * 0x30;
            if write {
                let out = c.invalidate_range(pc, pc + 4);
                dead.extend(out.tbs);
            } else if c.lookup(pc, 0, CFlags::default()).is_none() {
                c.build(jump(pc, insns, pc), &FillBackend, 0, CFlags::default());
            }
            for id in &dead {
                prop_assert!(c.get(*id).is_none());
            }
            for page in [0x1000u64, 0x2000] {
                for (id, _) in c.pages().tbs(page) {
                    prop_assert!(c.get(*id).is_some());
                }
            }
        }
    }
}
