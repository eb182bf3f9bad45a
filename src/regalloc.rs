// Registers are identities, not numbers. A swap exchanges the numbers
// of two identities and fixes the number-to-identity table, so every
// register site and memory site holding an identity follows the moved
// value without being rewritten. The cost selector, steal, replace,
// and validate below mirror that discipline: they work on identities
// and only read numbers at the last moment.

//! The register allocator.
//!
//! Selection is cost ranked: a reserved or frozen register costs 6 and
//! is never chosen ahead of anything cheaper; a used register costs 1,
//! 3 if it is the value's only site, and ref-counted registers add 2.
//! Stealing spills a single-sited value to a frame home first; if no
//! home exists the occupant is relocated to a different register via a
//! swap.

use std::cell::Cell;

use crate::assembler::{Assembler, BinaryOperation, Operand, BYTES_PER_WORD};
use crate::context::{Context, Local, RegId, SiteId, StackNode, ValueId};
use crate::read::{read_intersect, FrameIndex};
use crate::site::{frame_site, Site};
use crate::value::{add_site, find_site, remove_site};
use crate::AssemblerClient;

/// Reserve a register for the duration of the current event.
pub fn freeze(c: &mut Context, r: RegId) {
    assert!(
        c.available_register_count > 0,
        "freeze with no registers available"
    );
    log::trace!(
        "freeze {} to {}",
        c.registers[r].number,
        c.registers[r].freeze_count + 1
    );
    c.registers[r].freeze_count += 1;
    c.available_register_count -= 1;
}

pub fn thaw(c: &mut Context, r: RegId) {
    assert!(c.registers[r].freeze_count > 0, "unbalanced register thaw");
    log::trace!(
        "thaw {} to {}",
        c.registers[r].number,
        c.registers[r].freeze_count - 1
    );
    c.registers[r].freeze_count -= 1;
    c.available_register_count += 1;
}

/// Count a memory-site reference to the register holding `number`.
pub fn increment(c: &mut Context, number: u8) -> RegId {
    let r = c.register_by_number(number);
    log::trace!("increment {} to {}", number, c.registers[r].ref_count + 1);
    c.registers[r].ref_count += 1;
    r
}

pub fn decrement(c: &mut Context, r: RegId) {
    assert!(c.registers[r].ref_count > 0, "unbalanced register decrement");
    log::trace!(
        "decrement {} to {}",
        c.registers[r].number,
        c.registers[r].ref_count - 1
    );
    c.registers[r].ref_count -= 1;
}

/// Whether the register's bound site is still attached to its value.
fn used(c: &Context, r: RegId) -> bool {
    match (c.registers[r].value, c.registers[r].site) {
        (Some(v), Some(s)) => find_site(c, v, s),
        _ => false,
    }
}

fn used_exclusively(c: &Context, r: RegId) -> bool {
    used(c, r) && c.values[c.registers[r].value.unwrap()].sites.len() == 1
}

fn register_cost(c: &Context, r: RegId) -> u32 {
    let reg = &c.registers[r];
    if reg.reserved || reg.freeze_count > 0 {
        return 6;
    }
    let mut cost = 0;
    if used(c, r) {
        cost += 1;
        if used_exclusively(c, r) {
            cost += 2;
        }
    }
    if reg.ref_count > 0 {
        cost += 2;
    }
    cost
}

/// The cheapest register whose bit is set in `mask`. An exact
/// single-register mask short-circuits, reserved or not.
pub fn pick_register(c: &Context, mask: u32) -> RegId {
    let mut best: Option<RegId> = None;
    let mut best_cost = 5;
    for number in (0..c.arch.register_count() as u8).rev() {
        if mask & (1u32 << number) == 0 {
            continue;
        }
        let r = c.register_by_number(number);
        if mask == 1u32 << number {
            return r;
        }
        let cost = register_cost(c, r);
        if cost < best_cost {
            best = Some(r);
            best_cost = cost;
        }
    }
    best.unwrap_or_else(|| panic!("no register satisfies mask {mask:#010x}"))
}

/// Exchange the numbers of two register identities, emitting a machine
/// swap. Sites holding either identity follow automatically.
fn swap_registers(c: &mut Context, asm: &mut dyn Assembler, a: RegId, b: RegId) {
    assert_ne!(a, b);
    let an = c.registers[a].number;
    let bn = c.registers[b].number;
    assert_ne!(an, bn);

    asm.apply2(
        c,
        BinaryOperation::Swap,
        BYTES_PER_WORD,
        Operand::Register { low: an, high: None },
        BYTES_PER_WORD,
        Operand::Register { low: bn, high: None },
    );

    c.register_map.swap(an as usize, bn as usize);
    c.registers[a].number = bn;
    c.registers[b].number = an;
}

/// Try to free `r` by spilling or forgetting its current value.
/// Fails only when the value is single-sited and has no frame home.
fn try_steal(
    c: &mut Context,
    asm: &mut dyn Assembler,
    r: RegId,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[Cell<Local>]>,
) -> bool {
    assert_eq!(c.registers[r].ref_count, 0);

    let v = c.registers[r].value.expect("steal from an empty register");
    assert!(c.values[v].reads.is_some());

    log::trace!(
        "try steal {} from {v:?}: sites {}",
        c.registers[r].number,
        c.values[v].sites.len()
    );

    if c.values[v].sites.len() == 1 {
        let mut save_site: Option<SiteId> = None;

        if let Some(locals) = locals {
            for i in 0..c.local_footprint {
                if locals[i as usize].get().value == Some(v) {
                    save_site = Some(frame_site(c, i));
                    break;
                }
            }
        }

        if save_site.is_none() {
            let mut node = stack;
            while let Some(s) = node {
                if s.value == v {
                    let mut type_mask = !0u8;
                    let mut register_mask = !0u64;
                    let mut frame_index = FrameIndex::Any;
                    let head = c.values[v].reads.unwrap();
                    read_intersect(c, head, &mut type_mask, &mut register_mask, &mut frame_index);

                    let index = match frame_index {
                        FrameIndex::At(i) => i,
                        _ => c.stack_slot(s),
                    };
                    save_site = Some(frame_site(c, index));
                    break;
                }
                node = s.next;
            }
        }

        match save_site {
            Some(save) => {
                let size = c.registers[r].size;
                let site = c.registers[r].site.unwrap();
                add_site(c, asm, None, None, size, v, save);
                crate::emit::apply_binary(c, asm, BinaryOperation::Move, size, site, size, save);
            }
            None => {
                log::trace!("unable to steal {} from {v:?}", c.registers[r].number);
                return false;
            }
        }
    }

    let site = c.registers[r].site.unwrap();
    remove_site(c, v, site);
    true
}

/// Relocate the occupant of `r` to another register satisfying its
/// site mask, then swap so the occupant's sites stay coherent.
fn replace(
    c: &mut Context,
    asm: &mut dyn Assembler,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[Cell<Local>]>,
    r: RegId,
) -> RegId {
    let mask = if c.registers[r].freeze_count > 0 {
        match c.sites[c.registers[r].site.unwrap()] {
            Site::Register { mask, .. } => mask as u32,
            _ => unreachable!("register bound to a non-register site"),
        }
    } else {
        !0u32
    };

    freeze(c, r);
    let size = c.registers[r].size;
    let value = c.registers[r].value.unwrap();
    let site = c.registers[r].site.unwrap();
    let s = acquire(c, asm, mask, stack, locals, size, value, site);
    thaw(c, r);

    log::trace!(
        "replace {} with {}",
        c.registers[r].number,
        c.registers[s].number
    );

    swap_registers(c, asm, r, s);
    s
}

/// Acquire a register satisfying `mask` and bind it to `value` through
/// `site`. Reserved registers are returned unchanged; occupied ones
/// are stolen or relocated first.
pub fn acquire(
    c: &mut Context,
    asm: &mut dyn Assembler,
    mask: u32,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[Cell<Local>]>,
    new_size: u32,
    new_value: ValueId,
    new_site: SiteId,
) -> RegId {
    let mut r = pick_register(c, mask);

    if c.registers[r].reserved {
        return r;
    }

    log::trace!(
        "acquire {} value {new_value:?} site {new_site:?} freeze {} ref {} used {} exclusive {}",
        c.registers[r].number,
        c.registers[r].freeze_count,
        c.registers[r].ref_count,
        used(c, r),
        used_exclusively(c, r)
    );

    if c.registers[r].ref_count > 0 {
        r = replace(c, asm, stack, locals, r);
    } else if let Some(old_value) = c.registers[r].value {
        let old_site = c.registers[r].site;
        if old_value != new_value && old_site.is_some_and(|s| find_site(c, old_value, s)) {
            if !try_steal(c, asm, r, stack, locals) {
                r = replace(c, asm, stack, locals, r);
            }
        }
    }

    c.registers[r].size = new_size;
    c.registers[r].value = Some(new_value);
    c.registers[r].site = Some(new_site);
    r
}

/// Unbind a register.
pub fn release_register(c: &mut Context, r: RegId) {
    log::trace!("release {}", c.registers[r].number);
    c.registers[r].size = 0;
    c.registers[r].value = None;
    c.registers[r].site = None;
}

/// Ensure `site`'s half is in a register satisfying `mask`, reusing
/// `current` when possible and moving the value when not.
pub fn validate(
    c: &mut Context,
    asm: &mut dyn Assembler,
    mask: u32,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[Cell<Local>]>,
    size: u32,
    value: ValueId,
    site: SiteId,
    current: Option<RegId>,
) -> RegId {
    if let Some(cur) = current {
        if mask & (1u32 << c.registers[cur].number) != 0 {
            if c.registers[cur].reserved || c.registers[cur].value == Some(value) {
                return cur;
            }
            match c.registers[cur].value {
                None => {
                    log::trace!(
                        "validate acquire {} value {value:?} site {site:?}",
                        c.registers[cur].number
                    );
                    c.registers[cur].size = size;
                    c.registers[cur].value = Some(value);
                    c.registers[cur].site = Some(site);
                    return cur;
                }
                Some(occupant) => {
                    let occupant_site = c.registers[cur].site.unwrap();
                    remove_site(c, occupant, occupant_site);
                }
            }
        }
    }

    let r = acquire(c, asm, mask, stack, locals, size, value, site);

    if let Some(cur) = current {
        if cur != r {
            release_register(c, cur);
            let cn = c.registers[cur].number;
            let rn = c.registers[r].number;
            asm.apply2(
                c,
                BinaryOperation::Move,
                BYTES_PER_WORD,
                Operand::Register { low: cn, high: None },
                BYTES_PER_WORD,
                Operand::Register { low: rn, high: None },
            );
        }
    }

    r
}

impl AssemblerClient for Context<'_> {
    fn acquire_temporary(&mut self, mask: u32) -> u8 {
        let r = pick_register(self, mask);
        assert_eq!(
            self.registers[r].ref_count, 0,
            "temporary request would clobber a live base register"
        );
        assert!(
            self.registers[r].value.is_none(),
            "temporary request would clobber a live value"
        );
        let number = self.registers[r].number;
        increment(self, number);
        number
    }

    fn release_temporary(&mut self, number: u8) {
        let r = self.register_by_number(number);
        decrement(self, r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::free_register_site;
    use crate::testing::{NullClient, RecordingAssembler, TestArch};
    use bumpalo::Bump;

    fn with_context(f: impl FnOnce(&mut Context, &mut RecordingAssembler)) {
        let arena = Bump::new();
        let arch = TestArch::new();
        let client = NullClient;
        let mut c = Context::new(&arena, &arch, &client);
        c.local_footprint = 0;
        c.aligned_frame_size = 8;
        c.frame_resources = (0..8).map(|_| Default::default()).collect();
        let mut asm = RecordingAssembler::new();
        f(&mut c, &mut asm);
    }

    #[test]
    fn test_free_registers_cost_nothing() {
        with_context(|c, _| {
            let r = c.register_by_number(0);
            assert_eq!(register_cost(c, r), 0);
        });
    }

    #[test]
    fn test_reserved_registers_cost_six() {
        with_context(|c, _| {
            let stack = c.register_by_number(c.arch.stack());
            assert_eq!(register_cost(c, stack), 6);
        });
    }

    #[test]
    fn test_frozen_registers_are_not_picked() {
        with_context(|c, _| {
            let r5 = c.register_by_number(5);
            freeze(c, r5);
            let picked = pick_register(c, 0b11_0000);
            assert_eq!(c.registers[picked].number, 4);
            thaw(c, r5);
        });
    }

    #[test]
    fn test_exact_mask_returns_the_register() {
        with_context(|c, _| {
            let picked = pick_register(c, 1 << 3);
            assert_eq!(c.registers[picked].number, 3);
        });
    }

    #[test]
    fn test_acquire_binds_and_release_unbinds() {
        with_context(|c, asm| {
            let v = crate::value::value(c, None, None);
            let site = free_register_site(c, !0);
            let r = acquire(c, asm, !0, None, None, 8, v, site);
            assert_eq!(c.registers[r].value, Some(v));
            assert_eq!(c.registers[r].site, Some(site));

            release_register(c, r);
            assert!(c.registers[r].value.is_none());
            assert_eq!(c.registers[r].size, 0);
        });
    }

    #[test]
    fn test_freeze_thaw_balances_available_count() {
        with_context(|c, _| {
            let before = c.available_register_count;
            let r = c.register_by_number(2);
            freeze(c, r);
            assert_eq!(c.available_register_count, before - 1);
            thaw(c, r);
            assert_eq!(c.available_register_count, before);
        });
    }
}
