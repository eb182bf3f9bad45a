//! Reads: per-use placement constraints.
//!
//! Every use of a value is recorded as a read carrying the addressing
//! modes that use will accept. Reads chain in event order per value;
//! the head of the chain defines liveness. Three shapes exist:
//!
//! - a single read holds one fixed constraint,
//! - a multi read folds the constraints of every successor path of a
//!   saved state, and advances a per-path target cursor as emission
//!   crosses the save point,
//! - a stub read is a forward declaration installed at a junction edge
//!   and filled in when the branch is finalized in pass 2.
//!
//! Stub and multi reads can form cycles through junctions; the
//! `visited` markers keep the queries terminating.

use std::collections::VecDeque;

use crate::assembler::{OperandType, ANY_REGISTERS, ANY_TYPE};
use crate::context::{Context, EventId, ReadId, SiteId, ValueId};
use crate::site::{copy_cost, free_register_site, frame_site, site_match};

/// Frame slot constraint attached to a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameIndex {
    /// Any frame slot is acceptable.
    Any,
    /// No frame slot may be used.
    No,
    /// Exactly this slot.
    At(u32),
}

/// Intersection over frame slot constraints: `No` dominates, `Any` is
/// the identity, equal slots survive, and distinct slots clash to `No`.
pub fn intersect_frame_indexes(a: FrameIndex, b: FrameIndex) -> FrameIndex {
    match (a, b) {
        (FrameIndex::No, _) | (_, FrameIndex::No) => FrameIndex::No,
        (FrameIndex::Any, x) => x,
        (x, FrameIndex::Any) => x,
        (FrameIndex::At(x), FrameIndex::At(y)) if x == y => FrameIndex::At(x),
        _ => FrameIndex::No,
    }
}

/// One use of a value.
pub struct Read {
    /// Size of the use in bytes.
    pub size: u32,
    pub value: Option<ValueId>,
    /// The event consuming this read, if it belongs to one.
    pub event: Option<EventId>,
    /// Next read in the owning event's read list.
    pub event_next: Option<ReadId>,
    pub kind: ReadKind,
}

pub enum ReadKind {
    Single {
        type_mask: u8,
        register_mask: u64,
        frame_index: FrameIndex,
        /// Next read of the same value, in event order.
        next: Option<ReadId>,
    },
    Multi {
        children: Vec<ReadId>,
        /// One entry per successor path, in save/restore order. The
        /// front entry is consumed when emission crosses the save
        /// point; the back entry receives the next read appended.
        targets: VecDeque<Option<ReadId>>,
        visited: bool,
    },
    Stub {
        read: Option<ReadId>,
        visited: bool,
    },
}

pub fn single_read(
    c: &mut Context,
    size: u32,
    type_mask: u8,
    register_mask: u64,
    frame_index: FrameIndex,
) -> ReadId {
    // A memory-only constraint is meaningless without a concrete slot.
    assert!(
        type_mask != OperandType::Memory.bit() || matches!(frame_index, FrameIndex::At(_)),
        "memory-only read without a frame index"
    );
    c.reads.push(Read {
        size,
        value: None,
        event: None,
        event_next: None,
        kind: ReadKind::Single {
            type_mask,
            register_mask,
            frame_index,
            next: None,
        },
    })
}

pub fn multi_read(c: &mut Context, size: u32) -> ReadId {
    c.reads.push(Read {
        size,
        value: None,
        event: None,
        event_next: None,
        kind: ReadKind::Multi {
            children: Vec::new(),
            targets: VecDeque::new(),
            visited: false,
        },
    })
}

pub fn stub_read(c: &mut Context, size: u32) -> ReadId {
    c.reads.push(Read {
        size,
        value: None,
        event: None,
        event_next: None,
        kind: ReadKind::Stub {
            read: None,
            visited: false,
        },
    })
}

/// A read accepting any register.
pub fn any_register_read(c: &mut Context, size: u32) -> ReadId {
    single_read(
        c,
        size,
        OperandType::Register.bit(),
        ANY_REGISTERS,
        FrameIndex::No,
    )
}

/// A read accepting any register or a constant.
pub fn register_or_constant_read(c: &mut Context, size: u32) -> ReadId {
    single_read(
        c,
        size,
        OperandType::Register.bit() | OperandType::Constant.bit(),
        ANY_REGISTERS,
        FrameIndex::No,
    )
}

/// A read pinned to a concrete register (pair).
pub fn fixed_register_read(c: &mut Context, size: u32, low: u8, high: Option<u8>) -> ReadId {
    let mask = match high {
        None => (!0u64 << 32) | (1u64 << low),
        Some(h) => (1u64 << (h as u32 + 32)) | (1u64 << low),
    };
    single_read(c, size, OperandType::Register.bit(), mask, FrameIndex::No)
}

/// Whether this read still represents a pending use. Invalid children
/// of compound reads are pruned as a side effect.
pub fn read_valid(c: &mut Context, read: ReadId) -> bool {
    match &c.reads[read].kind {
        ReadKind::Single { .. } => true,
        ReadKind::Stub { .. } => true,
        ReadKind::Multi { visited, .. } => {
            if *visited {
                return false;
            }
            set_multi_visited(c, read, true);
            let children = take_children(c, read);
            let mut kept = Vec::with_capacity(children.len());
            let mut result = false;
            for child in children {
                if read_valid(c, child) {
                    result = true;
                    kept.push(child);
                }
            }
            put_children(c, read, kept);
            set_multi_visited(c, read, false);
            result
        }
    }
}

/// Fold this read's constraint into the accumulators. Returns whether
/// the read is still valid.
pub fn read_intersect(
    c: &mut Context,
    read: ReadId,
    type_mask: &mut u8,
    register_mask: &mut u64,
    frame_index: &mut FrameIndex,
) -> bool {
    match &c.reads[read].kind {
        ReadKind::Single {
            type_mask: tm,
            register_mask: rm,
            frame_index: fi,
            ..
        } => {
            *type_mask &= tm;
            *register_mask &= rm;
            *frame_index = intersect_frame_indexes(*frame_index, *fi);
            true
        }
        ReadKind::Multi { visited, .. } => {
            if *visited {
                return false;
            }
            set_multi_visited(c, read, true);
            let children = take_children(c, read);
            let mut kept = Vec::with_capacity(children.len());
            let mut result = false;
            for child in children {
                if read_intersect(c, child, type_mask, register_mask, frame_index) {
                    result = true;
                    kept.push(child);
                }
            }
            put_children(c, read, kept);
            set_multi_visited(c, read, false);
            result
        }
        ReadKind::Stub { read: inner, visited } => {
            if *visited {
                return true;
            }
            let inner = *inner;
            set_stub_visited(c, read, true);
            if let Some(inner) = inner {
                if !read_intersect(c, inner, type_mask, register_mask, frame_index) {
                    if let ReadKind::Stub { read: r, .. } = &mut c.reads[read].kind {
                        *r = None;
                    }
                }
            }
            set_stub_visited(c, read, false);
            true
        }
    }
}

fn set_multi_visited(c: &mut Context, read: ReadId, v: bool) {
    if let ReadKind::Multi { visited, .. } = &mut c.reads[read].kind {
        *visited = v;
    }
}

fn set_stub_visited(c: &mut Context, read: ReadId, v: bool) {
    if let ReadKind::Stub { visited, .. } = &mut c.reads[read].kind {
        *visited = v;
    }
}

fn take_children(c: &mut Context, read: ReadId) -> Vec<ReadId> {
    match &mut c.reads[read].kind {
        ReadKind::Multi { children, .. } => std::mem::take(children),
        _ => unreachable!(),
    }
}

fn put_children(c: &mut Context, read: ReadId, children: Vec<ReadId>) {
    if let ReadKind::Multi { children: slot, .. } = &mut c.reads[read].kind {
        *slot = children;
    }
}

/// Chain `next` after `read` in the owning value's read order.
pub fn read_append(c: &mut Context, read: ReadId, next_read: ReadId) {
    match &mut c.reads[read].kind {
        ReadKind::Single { next, .. } => {
            assert!(next.is_none(), "single read appended twice");
            *next = Some(next_read);
        }
        ReadKind::Multi { children, targets, .. } => {
            children.push(next_read);
            let back = targets
                .back_mut()
                .expect("multi read appended before a target was allocated");
            *back = Some(next_read);
        }
        ReadKind::Stub { read: inner, .. } => {
            *inner = Some(next_read);
        }
    }
}

/// The read after this one in the value's chain. Only single reads
/// advance this way; compound reads advance through their targets.
pub fn read_next(c: &Context, read: ReadId) -> Option<ReadId> {
    match &c.reads[read].kind {
        ReadKind::Single { next, .. } => *next,
        _ => unreachable!("read chain advanced through a compound read"),
    }
}

/// Reserve a target slot for the continuation about to be compiled.
pub fn multi_allocate_target(c: &mut Context, read: ReadId) {
    match &mut c.reads[read].kind {
        ReadKind::Multi { targets, .. } => targets.push_back(None),
        _ => unreachable!("target allocated on a non-multi read"),
    }
}

/// Consume the next target slot when emission crosses the save point.
pub fn multi_next_target(c: &mut Context, read: ReadId) -> Option<ReadId> {
    match &mut c.reads[read].kind {
        ReadKind::Multi { targets, .. } => targets
            .pop_front()
            .expect("multi read advanced past its last target"),
        _ => unreachable!("target consumed on a non-multi read"),
    }
}

/// The effective constraint of a read, folding compound shapes.
pub fn read_constraint(c: &mut Context, read: ReadId) -> (u8, u64, FrameIndex) {
    match c.reads[read].kind {
        ReadKind::Single {
            type_mask,
            register_mask,
            frame_index,
            ..
        } => (type_mask, register_mask, frame_index),
        _ => {
            let mut type_mask = ANY_TYPE;
            let mut register_mask = ANY_REGISTERS;
            let mut frame_index = FrameIndex::Any;
            read_intersect(c, read, &mut type_mask, &mut register_mask, &mut frame_index);
            (type_mask, register_mask, frame_index)
        }
    }
}

/// Cheapest existing site of `value` satisfying the constraint.
pub fn pick_site(
    c: &Context,
    value: ValueId,
    type_mask: u8,
    register_mask: u64,
    frame_index: FrameIndex,
) -> Option<SiteId> {
    let mut best = None;
    let mut best_cost = u32::MAX;
    for &s in &c.values[value].sites {
        if site_match(c, s, type_mask, register_mask, frame_index) {
            let cost = copy_cost(c, s, None);
            if cost < best_cost {
                best = Some(s);
                best_cost = cost;
            }
        }
    }
    best
}

/// A fresh site satisfying the constraint, if one can be minted.
pub fn allocate_site(
    c: &mut Context,
    type_mask: u8,
    register_mask: u64,
    frame_index: FrameIndex,
) -> Option<SiteId> {
    if type_mask & OperandType::Register.bit() != 0 && register_mask != 0 {
        Some(free_register_site(c, register_mask))
    } else if let FrameIndex::At(i) = frame_index {
        Some(frame_site(c, i))
    } else {
        None
    }
}

/// [`pick_site`] under this read's constraint.
pub fn read_pick_site(c: &mut Context, read: ReadId, value: ValueId) -> Option<SiteId> {
    let (tm, rm, fi) = read_constraint(c, read);
    pick_site(c, value, tm, rm, fi)
}

/// [`allocate_site`] under this read's constraint.
pub fn read_allocate_site(c: &mut Context, read: ReadId) -> Option<SiteId> {
    let (tm, rm, fi) = read_constraint(c, read);
    allocate_site(c, tm, rm, fi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_index_intersection_algebra() {
        use FrameIndex::*;
        assert_eq!(intersect_frame_indexes(No, Any), No);
        assert_eq!(intersect_frame_indexes(No, At(3)), No);
        assert_eq!(intersect_frame_indexes(Any, At(3)), At(3));
        assert_eq!(intersect_frame_indexes(At(3), Any), At(3));
        assert_eq!(intersect_frame_indexes(Any, Any), Any);
        assert_eq!(intersect_frame_indexes(At(3), At(3)), At(3));
        assert_eq!(intersect_frame_indexes(At(3), At(4)), No);
    }

    #[test]
    fn test_single_read_intersection_is_bitwise() {
        use crate::testing::{NullClient, TestArch};
        use bumpalo::Bump;

        let arena = Bump::new();
        let arch = TestArch::new();
        let client = NullClient;
        let mut c = Context::new(&arena, &arch, &client);

        let r = single_read(&mut c, 8, 0b0110, 0x0f, FrameIndex::Any);
        let mut tm = 0b1100u8;
        let mut rm = 0x33u64;
        let mut fi = FrameIndex::At(2);
        assert!(read_intersect(&mut c, r, &mut tm, &mut rm, &mut fi));
        assert_eq!(tm, 0b0100);
        assert_eq!(rm, 0x03);
        assert_eq!(fi, FrameIndex::At(2));
    }

    #[test]
    fn test_empty_multi_read_is_dead() {
        use crate::testing::{NullClient, TestArch};
        use bumpalo::Bump;

        let arena = Bump::new();
        let arch = TestArch::new();
        let client = NullClient;
        let mut c = Context::new(&arena, &arch, &client);

        let m = multi_read(&mut c, 8);
        assert!(!read_valid(&mut c, m));

        multi_allocate_target(&mut c, m);
        let child = single_read(&mut c, 8, ANY_TYPE, ANY_REGISTERS, FrameIndex::Any);
        read_append(&mut c, m, child);
        assert!(read_valid(&mut c, m));
    }

    #[test]
    fn test_stub_read_is_permissive_until_resolved() {
        use crate::testing::{NullClient, TestArch};
        use bumpalo::Bump;

        let arena = Bump::new();
        let arch = TestArch::new();
        let client = NullClient;
        let mut c = Context::new(&arena, &arch, &client);

        let s = stub_read(&mut c, 8);
        assert!(read_valid(&mut c, s));
        let mut tm = ANY_TYPE;
        let mut rm = ANY_REGISTERS;
        let mut fi = FrameIndex::Any;
        assert!(read_intersect(&mut c, s, &mut tm, &mut rm, &mut fi));
        assert_eq!(tm, ANY_TYPE);
        assert_eq!(fi, FrameIndex::Any);
    }
}
