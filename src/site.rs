//! Operand locations.
//!
//! A site is one concrete place a value can live: a constant pool
//! promise, an absolute address, a register pair, or a memory
//! expression. The original design used a virtual hierarchy here; the
//! crate keeps each variant a plain record in a tagged enum and
//! dispatches on the tag, so sites are cheap to mint in bulk.
//!
//! Copy costs are tiny integers used only for ranking candidates:
//! identical site 0, constant 1, register 2, address 3, memory 4.

use crate::assembler::{Operand, OperandType, BYTES_PER_WORD};
use crate::context::{Context, Local, RegId, SiteId, StackNode, ValueId};
use crate::frame::{acquire_frame_index, local_offset, local_offset_to_frame_index,
                   release_frame_index};
use crate::promise::PromiseId;
use crate::regalloc::{decrement, freeze, increment, release_register, thaw, validate};
use crate::{Assembler, FrameIndex};

/// One concrete operand location.
#[derive(Debug, Clone, Copy)]
pub enum Site {
    Constant {
        value: PromiseId,
    },
    Address {
        address: PromiseId,
    },
    Register {
        /// Allowed registers: low half in bits 0..32, high half in
        /// bits 32..64.
        mask: u64,
        low: Option<RegId>,
        high: Option<RegId>,
    },
    Memory {
        /// Base register number at creation; superseded by `base`
        /// once acquired.
        base_num: u8,
        offset: i32,
        index_num: Option<u8>,
        scale: u32,
        /// Acquired register identities. Numbers are re-derived from
        /// these so the operand follows register swaps.
        base: Option<RegId>,
        index: Option<RegId>,
    },
}

pub fn constant_site(c: &mut Context, value: PromiseId) -> SiteId {
    c.sites.push(Site::Constant { value })
}

pub fn address_site(c: &mut Context, address: PromiseId) -> SiteId {
    c.sites.push(Site::Address { address })
}

/// A register site pinned to concrete registers.
pub fn register_site(c: &mut Context, low: u8, high: Option<u8>) -> SiteId {
    assert!((low as u32) < c.arch.register_count());
    if let Some(h) = high {
        assert!((h as u32) < c.arch.register_count());
    }
    let low = Some(c.register_by_number(low));
    let high = high.map(|h| c.register_by_number(h));
    c.sites.push(Site::Register {
        mask: !0,
        low,
        high,
    })
}

/// A register site that will pick any register satisfying `mask`.
pub fn free_register_site(c: &mut Context, mask: u64) -> SiteId {
    c.sites.push(Site::Register {
        mask,
        low: None,
        high: None,
    })
}

pub fn memory_site(
    c: &mut Context,
    base: u8,
    offset: i32,
    index: Option<u8>,
    scale: u32,
) -> SiteId {
    c.sites.push(Site::Memory {
        base_num: base,
        offset,
        index_num: index,
        scale,
        base: None,
        index: None,
    })
}

/// The memory site backing a frame slot.
pub fn frame_site(c: &mut Context, frame_index: u32) -> SiteId {
    let offset = local_offset(c, frame_index);
    let stack = c.arch.stack();
    memory_site(c, stack, offset, None, 1)
}

/// Current register numbers of a memory site, following swaps.
fn memory_regs(c: &Context, site: SiteId) -> (u8, Option<u8>, i32, u32) {
    match c.sites[site] {
        Site::Memory {
            base_num,
            offset,
            index_num,
            scale,
            base,
            index,
        } => {
            let b = base.map_or(base_num, |id| c.registers[id].number);
            let i = match (index, index_num) {
                (Some(id), _) => Some(c.registers[id].number),
                (None, n) => n,
            };
            (b, i, offset, scale)
        }
        _ => unreachable!("not a memory site"),
    }
}

/// Current register numbers of a register site.
fn register_nums(c: &Context, site: SiteId) -> (u8, Option<u8>) {
    match c.sites[site] {
        Site::Register { low, high, .. } => {
            let low = low.expect("register site inspected before it was acquired");
            (
                c.registers[low].number,
                high.map(|h| c.registers[h].number),
            )
        }
        _ => unreachable!("not a register site"),
    }
}

pub fn site_type(c: &Context, site: SiteId) -> OperandType {
    match c.sites[site] {
        Site::Constant { .. } => OperandType::Constant,
        Site::Address { .. } => OperandType::Address,
        Site::Register { .. } => OperandType::Register,
        Site::Memory { .. } => OperandType::Memory,
    }
}

/// Cost of materializing this site's value at `target` (`None` means
/// an unconstrained fresh location).
pub fn copy_cost(c: &Context, site: SiteId, target: Option<SiteId>) -> u32 {
    if target == Some(site) {
        return 0;
    }
    match c.sites[site] {
        Site::Constant { .. } => 1,
        Site::Address { .. } => 3,
        Site::Register { .. } => {
            let (low, high) = register_nums(c, site);
            if let Some(t) = target {
                if let Site::Register { mask, .. } = c.sites[t] {
                    let low_ok = mask & (1u64 << low) != 0;
                    let high_ok = match high {
                        None => true,
                        Some(h) => mask & (1u64 << (h as u32 + 32)) != 0,
                    };
                    if low_ok && high_ok {
                        return 0;
                    }
                }
            }
            2
        }
        Site::Memory { .. } => {
            let mine = memory_regs(c, site);
            if let Some(t) = target {
                if matches!(c.sites[t], Site::Memory { .. }) && memory_regs(c, t) == mine {
                    return 0;
                }
            }
            4
        }
    }
}

/// Whether this site satisfies a read constraint.
pub fn site_match(
    c: &Context,
    site: SiteId,
    type_mask: u8,
    register_mask: u64,
    frame_index: FrameIndex,
) -> bool {
    match c.sites[site] {
        Site::Constant { .. } => type_mask & OperandType::Constant.bit() != 0,
        Site::Address { .. } => type_mask & OperandType::Address.bit() != 0,
        Site::Register { low, .. } => {
            if type_mask & OperandType::Register.bit() == 0 || low.is_none() {
                return false;
            }
            let (low, high) = register_nums(c, site);
            let low_ok = register_mask & (1u64 << low) != 0;
            let high_ok = match high {
                None => true,
                Some(h) => register_mask & (1u64 << (h as u32 + 32)) != 0,
            };
            low_ok && high_ok
        }
        Site::Memory { .. } => {
            if type_mask & OperandType::Memory.bit() == 0 {
                return false;
            }
            let (base, index, offset, _) = memory_regs(c, site);
            if base == c.arch.stack() {
                assert!(index.is_none(), "stack-based site with an index register");
                match frame_index {
                    FrameIndex::Any => true,
                    FrameIndex::No => false,
                    FrameIndex::At(i) => local_offset(c, i) == offset,
                }
            } else {
                false
            }
        }
    }
}

/// Bind the site to `value`, claiming its underlying resources.
pub fn site_acquire(
    c: &mut Context,
    asm: &mut dyn Assembler,
    site: SiteId,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[std::cell::Cell<Local>]>,
    size: u32,
    value: Option<ValueId>,
) {
    match c.sites[site] {
        Site::Constant { .. } | Site::Address { .. } => {}
        Site::Register { mask, low, .. } => {
            let v = value.expect("register site acquired without a value");
            let new_low = validate(c, asm, mask as u32, stack, locals, size, v, site, low);
            if let Site::Register { low, .. } = &mut c.sites[site] {
                *low = Some(new_low);
            }
            if size > BYTES_PER_WORD {
                freeze(c, new_low);
                let old_high = match c.sites[site] {
                    Site::Register { high, .. } => high,
                    _ => unreachable!(),
                };
                let new_high = validate(
                    c,
                    asm,
                    (mask >> 32) as u32,
                    stack,
                    locals,
                    size,
                    v,
                    site,
                    old_high,
                );
                thaw(c, new_low);
                if let Site::Register { high, .. } = &mut c.sites[site] {
                    *high = Some(new_high);
                }
            }
        }
        Site::Memory {
            base_num,
            offset,
            index_num,
            ..
        } => {
            let base = increment(c, base_num);
            if let Site::Memory { base: b, .. } = &mut c.sites[site] {
                *b = Some(base);
            }
            if let Some(ix) = index_num {
                let index = increment(c, ix);
                if let Site::Memory { index: i, .. } = &mut c.sites[site] {
                    *i = Some(index);
                }
            }
            if base_num == c.arch.stack() {
                assert!(index_num.is_none(), "stack-based site with an index register");
                let frame_index = local_offset_to_frame_index(c, offset);
                acquire_frame_index(
                    c,
                    frame_index,
                    stack,
                    locals,
                    size,
                    value.expect("frame slot acquired without a value"),
                    site,
                    true,
                );
            }
        }
    }
}

/// Release the site's underlying resources.
pub fn site_release(c: &mut Context, site: SiteId) {
    match c.sites[site] {
        Site::Constant { .. } | Site::Address { .. } => {}
        Site::Register { low, high, .. } => {
            let low = low.expect("register site released before it was acquired");
            release_register(c, low);
            if let Some(high) = high {
                release_register(c, high);
            }
        }
        Site::Memory { .. } => {
            let (base_number, _, offset, _) = memory_regs(c, site);
            if base_number == c.arch.stack() {
                let frame_index = local_offset_to_frame_index(c, offset);
                release_frame_index(c, frame_index, true);
            }
            if let Site::Memory { base, index, .. } = c.sites[site] {
                decrement(c, base.expect("memory site released before it was acquired"));
                if let Some(index) = index {
                    decrement(c, index);
                }
            }
        }
    }
}

/// Protect the site from the allocator for the duration of the
/// current event.
pub fn site_freeze(c: &mut Context, site: SiteId) {
    match c.sites[site] {
        Site::Constant { .. } | Site::Address { .. } => {}
        Site::Register { low, high, .. } => {
            let low = low.expect("register site frozen before it was acquired");
            freeze(c, low);
            if let Some(high) = high {
                freeze(c, high);
            }
        }
        Site::Memory { .. } => {
            let (base, _, offset, _) = memory_regs(c, site);
            if base == c.arch.stack() {
                let frame_index = local_offset_to_frame_index(c, offset);
                c.frame_resources[frame_index as usize].freeze_count += 1;
            }
        }
    }
}

pub fn site_thaw(c: &mut Context, site: SiteId) {
    match c.sites[site] {
        Site::Constant { .. } | Site::Address { .. } => {}
        Site::Register { low, high, .. } => {
            let low = low.expect("register site thawed before it was acquired");
            thaw(c, low);
            if let Some(high) = high {
                thaw(c, high);
            }
        }
        Site::Memory { .. } => {
            let (base, _, offset, _) = memory_regs(c, site);
            if base == c.arch.stack() {
                let frame_index = local_offset_to_frame_index(c, offset) as usize;
                assert!(
                    c.frame_resources[frame_index].freeze_count > 0,
                    "unbalanced frame slot thaw"
                );
                c.frame_resources[frame_index].freeze_count -= 1;
            }
        }
    }
}

/// Narrow a register site's mask to exactly its current registers.
/// Used when a junction site becomes a value's canonical home.
pub fn site_make_specific(c: &mut Context, site: SiteId) {
    if let Site::Register { low, high, .. } = c.sites[site] {
        let low = low.expect("register site specialized before it was acquired");
        let mut mask = 1u64 << c.registers[low].number;
        if let Some(high) = high {
            mask |= 1u64 << (c.registers[high].number as u32 + 32);
        }
        if let Site::Register { mask: m, .. } = &mut c.sites[site] {
            *m = mask;
        }
    }
}

/// The assembler-level view of the site.
pub fn as_operand(c: &Context, site: SiteId) -> Operand {
    match c.sites[site] {
        Site::Constant { value } => Operand::Constant(value),
        Site::Address { address } => Operand::Address(address),
        Site::Register { .. } => {
            let (low, high) = register_nums(c, site);
            Operand::Register { low, high }
        }
        Site::Memory { .. } => {
            let (base, index, offset, scale) = memory_regs(c, site);
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NullClient, TestArch};
    use bumpalo::Bump;

    fn with_context(f: impl FnOnce(&mut Context)) {
        let arena = Bump::new();
        let arch = TestArch::new();
        let client = NullClient;
        let mut c = Context::new(&arena, &arch, &client);
        c.parameter_footprint = 0;
        c.local_footprint = 2;
        c.aligned_frame_size = 8;
        c.frame_resources = (0..8).map(|_| Default::default()).collect();
        f(&mut c);
    }

    #[test]
    fn test_constant_copy_costs() {
        with_context(|c| {
            let p = crate::context::resolved(c, 42);
            let a = constant_site(c, p);
            let b = constant_site(c, p);
            assert_eq!(copy_cost(c, a, Some(a)), 0);
            assert_eq!(copy_cost(c, a, Some(b)), 1);
            assert_eq!(copy_cost(c, a, None), 1);
        });
    }

    #[test]
    fn test_register_cost_respects_target_mask() {
        with_context(|c| {
            let a = register_site(c, 1, None);
            let wide = free_register_site(c, !0);
            let narrow = free_register_site(c, 1 << 2);
            assert_eq!(copy_cost(c, a, Some(wide)), 0);
            assert_eq!(copy_cost(c, a, Some(narrow)), 2);
            assert_eq!(copy_cost(c, a, None), 2);
        });
    }

    #[test]
    fn test_memory_cost_compares_the_whole_expression() {
        with_context(|c| {
            let a = memory_site(c, 1, 16, None, 1);
            let same = memory_site(c, 1, 16, None, 1);
            let other = memory_site(c, 1, 24, None, 1);
            assert_eq!(copy_cost(c, a, Some(same)), 0);
            assert_eq!(copy_cost(c, a, Some(other)), 4);
        });
    }

    #[test]
    fn test_frame_site_matches_its_own_index() {
        with_context(|c| {
            let s = frame_site(c, 1);
            assert!(site_match(c, s, ANY, !0, FrameIndex::At(1)));
            assert!(!site_match(c, s, ANY, !0, FrameIndex::At(0)));
            assert!(site_match(c, s, ANY, !0, FrameIndex::Any));
            assert!(!site_match(c, s, ANY, !0, FrameIndex::No));
        });
    }

    const ANY: u8 = crate::assembler::ANY_TYPE;

    #[test]
    fn test_make_specific_pins_the_mask() {
        with_context(|c| {
            let s = register_site(c, 3, None);
            site_make_specific(c, s);
            match c.sites[s] {
                Site::Register { mask, .. } => assert_eq!(mask, 1 << 3),
                _ => unreachable!(),
            }
        });
    }
}
