use super::*;
use std::cell::Cell;

#[derive(Default)]
struct Ctx {
    hooks: HookRegistry<Ctx>,
    log: Vec<(u32, u64)>,
}

fn code_hook(tag: u32, range: HookRange) -> HookSpec<Ctx> {
    HookSpec {
        ty: HookType::CODE,
        range,
        insn: None,
        callback: HookFn::Code(Box::new(move |ctx: &mut Ctx, addr, _size| ctx.log.push((tag, addr)))),
    }
}

fn fire_code(ctx: &mut Ctx, addr: u64) {
    let list = ctx.hooks.matching(HookType::CODE, addr);
    dispatch_code(&list, ctx, addr, 4);
}

#[test]
fn hooks_fire_in_registration_order_within_range() {
    let mut ctx = Ctx::default();
    for tag in 0..3 {
        ctx.hooks
            .add(code_hook(tag, HookRange::new(0x1000, 0x1fff)), HookOrder::Append)
            .unwrap();
    }
    fire_code(&mut ctx, 0x1800);
    fire_code(&mut ctx, 0x2000);
    assert_eq!(ctx.log, vec![(0, 0x1800), (1, 0x1800), (2, 0x1800)]);
}

#[test]
fn prepend_runs_first_and_unbounded_range_matches_everything() {
    let mut ctx = Ctx::default();
    ctx.hooks
        .add(code_hook(1, HookRange::new(0, 0x10)), HookOrder::Append)
        .unwrap();
    ctx.hooks.add(code_hook(0, HookRange::ALL), HookOrder::Prepend).unwrap();
    fire_code(&mut ctx, 0x8);
    fire_code(&mut ctx, u64::MAX);
    assert_eq!(ctx.log, vec![(0, 0x8), (1, 0x8), (0, u64::MAX)]);
}

#[test]
fn callback_shape_is_validated() {
    let mut reg: HookRegistry<Ctx> = HookRegistry::new();
    let err = reg
        .add(
            HookSpec {
                ty: HookType::MEM_WRITE,
                range: HookRange::ALL,
                insn: None,
                callback: HookFn::Code(Box::new(|_, _, _| {})),
            },
            HookOrder::Append,
        )
        .unwrap_err();
    assert_eq!(err, HookError::CallbackMismatch(HookType::MEM_WRITE));

    let err = reg
        .add(
            HookSpec {
                ty: HookType::INSN,
                range: HookRange::ALL,
                insn: None,
                callback: HookFn::Insn(Box::new(|_, _| {})),
            },
            HookOrder::Append,
        )
        .unwrap_err();
    assert_eq!(err, HookError::MissingInsn);
    assert!(reg.is_empty());
}

#[test]
fn combined_type_links_into_every_list_and_is_freed_with_last_link() {
    let mut reg: HookRegistry<Ctx> = HookRegistry::new();
    let h = reg
        .add(
            HookSpec {
                ty: HookType::MEM_UNMAPPED,
                range: HookRange::ALL,
                insn: None,
                callback: HookFn::MemFault(Box::new(|_, _, _, _, _| true)),
            },
            HookOrder::Append,
        )
        .unwrap();
    assert_eq!(reg.links(HookType::MEM_READ_UNMAPPED), 1);
    assert_eq!(reg.links(HookType::MEM_FETCH_UNMAPPED), 1);
    let snapshot = reg.matching(HookType::MEM_WRITE_UNMAPPED, 0);
    assert_eq!(Rc::strong_count(&snapshot[0]), 5);

    assert_eq!(reg.remove(h), Ok(HookType::MEM_UNMAPPED));
    assert!(!reg.has(HookType::MEM_READ_UNMAPPED));
    reg.purge();
    assert_eq!(reg.links(HookType::MEM_WRITE_UNMAPPED), 0);
    assert_eq!(Rc::strong_count(&snapshot[0]), 1);
    assert_eq!(reg.remove(h), Err(HookError::UnknownHandle(h)));
}

#[test]
fn fault_chain_stops_at_first_handler() {
    let mut ctx = Ctx::default();
    for (tag, handled) in [(0u32, false), (1, true), (2, true)] {
        ctx.hooks
            .add(
                HookSpec {
                    ty: HookType::MEM_WRITE_PROT,
                    range: HookRange::ALL,
                    insn: None,
                    callback: HookFn::MemFault(Box::new(move |ctx: &mut Ctx, _, addr, _, _| {
                        ctx.log.push((tag, addr));
                        handled
                    })),
                },
                HookOrder::Append,
            )
            .unwrap();
    }
    let list = ctx.hooks.matching(HookType::MEM_WRITE_PROT, 0x40);
    assert!(dispatch_mem_fault(&list, &mut ctx, MemAccess::WriteProt, 0x40, 4, 0));
    assert_eq!(ctx.log, vec![(0, 0x40), (1, 0x40)]);
}

#[test]
fn deleting_during_dispatch_skips_later_hooks_without_disturbing_snapshot() {
    let mut ctx = Ctx::default();
    let victim: Rc<Cell<Option<HookHandle>>> = Rc::default();
    let v = victim.clone();
    ctx.hooks
        .add(
            HookSpec {
                ty: HookType::CODE,
                range: HookRange::ALL,
                insn: None,
                callback: HookFn::Code(Box::new(move |ctx: &mut Ctx, addr, _| {
                    ctx.log.push((0, addr));
                    if let Some(h) = v.take() {
                        ctx.hooks.remove(h).unwrap();
                    }
                })),
            },
            HookOrder::Append,
        )
        .unwrap();
    let h = ctx.hooks.add(code_hook(1, HookRange::ALL), HookOrder::Append).unwrap();
    ctx.hooks.add(code_hook(2, HookRange::ALL), HookOrder::Append).unwrap();
    victim.set(Some(h));

    fire_code(&mut ctx, 0x10);
    ctx.hooks.purge();
    fire_code(&mut ctx, 0x20);
    assert_eq!(ctx.log, vec![(0, 0x10), (2, 0x10), (0, 0x20), (2, 0x20)]);
    assert_eq!(ctx.hooks.links(HookType::CODE), 2);
}

#[test]
fn insn_filter_and_range_queries() {
    let mut ctx = Ctx::default();
    ctx.hooks
        .add(
            HookSpec {
                ty: HookType::INSN,
                range: HookRange::new(0x100, 0x1ff),
                insn: Some(7),
                callback: HookFn::Insn(Box::new(|ctx: &mut Ctx, insn| ctx.log.push((insn, 0)))),
            },
            HookOrder::Append,
        )
        .unwrap();
    assert!(ctx.hooks.has_insn(7));
    assert!(!ctx.hooks.has_insn(8));
    assert!(ctx.hooks.matching_insn(8, 0x100).is_empty());
    assert!(ctx.hooks.matching_insn(7, 0x200).is_empty());
    let list = ctx.hooks.matching_insn(7, 0x150);
    assert!(dispatch_insn(&list, &mut ctx, 7));
    assert_eq!(ctx.log, vec![(7, 0)]);
}
