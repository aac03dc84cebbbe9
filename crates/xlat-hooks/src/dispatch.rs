//! Calling snapshots of hooks.
//!
//! Each function takes a list produced by [`HookRegistry::matching`](crate::HookRegistry::matching)
//! (or `matching_insn`) and the context. Hooks deleted after the snapshot was taken
//! are skipped.

use std::rc::Rc;

use crate::{Hook, HookFn, MemAccess};

/// Run every `CODE`/`BLOCK` hook.
pub fn dispatch_code<C>(hooks: &[Rc<Hook<C>>], ctx: &mut C, addr: u64, size: u32) {
    for hook in hooks {
        if let Some(mut cb) = hook.callback() {
            if let HookFn::Code(f) = &mut *cb {
                f(ctx, addr, size);
            }
        }
    }
}

/// Run every observation memory hook.
pub fn dispatch_mem<C>(
    hooks: &[Rc<Hook<C>>],
    ctx: &mut C,
    access: MemAccess,
    addr: u64,
    size: usize,
    value: u64,
) {
    for hook in hooks {
        if let Some(mut cb) = hook.callback() {
            if let HookFn::Mem(f) = &mut *cb {
                f(ctx, access, addr, size, value);
            }
        }
    }
}

/// Offer a fault to each hook until one reports it handled.
///
/// Returns whether any hook handled it.
pub fn dispatch_mem_fault<C>(
    hooks: &[Rc<Hook<C>>],
    ctx: &mut C,
    access: MemAccess,
    addr: u64,
    size: usize,
    value: u64,
) -> bool {
    for hook in hooks {
        if let Some(mut cb) = hook.callback() {
            if let HookFn::MemFault(f) = &mut *cb {
                if f(ctx, access, addr, size, value) {
                    return true;
                }
            }
        }
    }
    false
}

/// Run every interrupt hook. Returns whether at least one ran.
pub fn dispatch_intr<C>(hooks: &[Rc<Hook<C>>], ctx: &mut C, intno: u32) -> bool {
    let mut ran = false;
    for hook in hooks {
        if let Some(mut cb) = hook.callback() {
            if let HookFn::Intr(f) = &mut *cb {
                f(ctx, intno);
                ran = true;
            }
        }
    }
    ran
}

/// Run every instruction hook. Returns whether at least one ran.
pub fn dispatch_insn<C>(hooks: &[Rc<Hook<C>>], ctx: &mut C, insn: u32) -> bool {
    let mut ran = false;
    for hook in hooks {
        if let Some(mut cb) = hook.callback() {
            if let HookFn::Insn(f) = &mut *cb {
                f(ctx, insn);
                ran = true;
            }
        }
    }
    ran
}

/// Offer an undecodable instruction to each hook until one accepts it.
pub fn dispatch_insn_invalid<C>(hooks: &[Rc<Hook<C>>], ctx: &mut C) -> bool {
    for hook in hooks {
        if let Some(mut cb) = hook.callback() {
            if let HookFn::InsnInvalid(f) = &mut *cb {
                if f(ctx) {
                    return true;
                }
            }
        }
    }
    false
}
