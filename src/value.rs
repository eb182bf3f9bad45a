//! Value bookkeeping: site lists, liveness, read consumption.

use smallvec::SmallVec;

use crate::assembler::{Assembler, BinaryOperation, OperandType};
use crate::context::{Context, EventId, Local, ReadId, SiteId, StackNode, ValueId, Value};
use crate::emit::apply_binary;
use crate::read::{read_allocate_site, read_next, read_pick_site, read_valid};
use crate::site::{free_register_site, site_acquire, site_release, site_type, Site};
use crate::FrameIndex;

/// Mint a value, optionally seeded with a site and a target hint.
pub fn value(c: &mut Context, site: Option<SiteId>, target: Option<SiteId>) -> ValueId {
    let mut sites = SmallVec::new();
    if let Some(s) = site {
        sites.push(s);
    }
    c.values.push(Value {
        reads: None,
        last_read: None,
        sites,
        source: None,
        target,
        visited: false,
    })
}

pub fn find_site(c: &Context, v: ValueId, site: SiteId) -> bool {
    c.values[v].sites.contains(&site)
}

/// Attach `site` to `v`, acquiring its resources. Recently added
/// sites sort first so selection ties break toward them.
pub fn add_site(
    c: &mut Context,
    asm: &mut dyn Assembler,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[std::cell::Cell<Local>]>,
    size: u32,
    v: ValueId,
    site: SiteId,
) {
    if !find_site(c, v, site) {
        log::trace!("add site {site:?} ({:?}) to {v:?}", site_type(c, site));
        site_acquire(c, asm, site, stack, locals, size, Some(v));
        c.values[v].sites.insert(0, site);
    }
}

/// Detach `site` from `v`, releasing its resources.
pub fn remove_site(c: &mut Context, v: ValueId, site: SiteId) {
    if let Some(pos) = c.values[v].sites.iter().position(|&s| s == site) {
        log::trace!("remove site {site:?} ({:?}) from {v:?}", site_type(c, site));
        site_release(c, site);
        c.values[v].sites.remove(pos);
    }
}

/// Release every site of `v`.
pub fn clear_sites(c: &mut Context, v: ValueId) {
    let sites = std::mem::take(&mut c.values[v].sites);
    for s in &sites {
        site_release(c, *s);
    }
}

/// A value is live while the head of its read chain is valid.
pub fn live(c: &mut Context, v: ValueId) -> bool {
    match c.values[v].reads {
        Some(r) => read_valid(c, r),
        None => false,
    }
}

/// Consume the head read of `v`, which must belong to `event`. A value
/// that dies here gives up its sites immediately.
pub fn next_read(c: &mut Context, event: EventId, v: ValueId) {
    let head = c.values[v].reads.expect("read consumed on a value with no reads");
    assert_eq!(
        c.reads[head].event,
        Some(event),
        "read consumed by an event that does not own it"
    );
    c.values[v].reads = read_next(c, head);
    if !live(c, v) {
        clear_sites(c, v);
    }
}

/// The first constant site of `v`, if any.
pub fn find_constant_site(c: &Context, v: ValueId) -> Option<SiteId> {
    c.values[v]
        .sites
        .iter()
        .copied()
        .find(|&s| matches!(c.sites[s], Site::Constant { .. }))
}

/// Where the value should go for `read`: its target hint, an existing
/// matching site, or a fresh site from the read's constraint.
pub fn target_or_null_for_read(c: &mut Context, v: ValueId, read: ReadId) -> Option<SiteId> {
    if let Some(t) = c.values[v].target {
        return Some(t);
    }
    if let Some(s) = read_pick_site(c, read, v) {
        return Some(s);
    }
    read_allocate_site(c, read)
}

/// As [`target_or_null_for_read`] against the value's pending head read.
pub fn target_or_null(c: &mut Context, v: ValueId) -> Option<SiteId> {
    if let Some(t) = c.values[v].target {
        return Some(t);
    }
    if live(c, v) {
        let r = c.values[v].reads.unwrap();
        if let Some(s) = read_pick_site(c, r, v) {
            return Some(s);
        }
        return read_allocate_site(c, r);
    }
    None
}

/// As [`target_or_null`], falling back to any free register.
pub fn target_or_register(c: &mut Context, v: ValueId) -> SiteId {
    match target_or_null(c, v) {
        Some(s) => s,
        None => free_register_site(c, !0),
    }
}

/// Cheapest site of `v` relative to `target`.
pub fn pick(c: &Context, v: ValueId, target: Option<SiteId>) -> (Option<SiteId>, u32) {
    let mut best = None;
    let mut best_cost = u32::MAX;
    for &s in &c.values[v].sites {
        let cost = crate::site::copy_cost(c, s, target);
        if cost < best_cost {
            best = Some(s);
            best_cost = cost;
        }
    }
    (best, best_cost)
}

/// Copy `v` from `src` into `dst`, routing memory-to-memory transfers
/// through a scratch register.
pub fn move_site(
    c: &mut Context,
    asm: &mut dyn Assembler,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[std::cell::Cell<Local>]>,
    size: u32,
    v: ValueId,
    src: SiteId,
    dst: SiteId,
) {
    let mut src = src;
    if site_type(c, dst) == OperandType::Memory && site_type(c, src) == OperandType::Memory {
        let tmp = free_register_site(c, !0);
        add_site(c, asm, stack, locals, size, v, tmp);
        apply_binary(c, asm, BinaryOperation::Move, size, src, size, tmp);
        src = tmp;
    }
    add_site(c, asm, stack, locals, size, v, dst);
    apply_binary(c, asm, BinaryOperation::Move, size, src, size, dst);
}

/// Copy a single-sited value somewhere safe before its only site is
/// repurposed.
pub fn preserve(
    c: &mut Context,
    asm: &mut dyn Assembler,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[std::cell::Cell<Local>]>,
    size: u32,
    v: ValueId,
    site: SiteId,
    read: ReadId,
) {
    assert!(
        c.values[v].sites.len() == 1 && c.values[v].sites[0] == site,
        "preserve on a value not solely resident in the given site"
    );
    let r = match target_or_null_for_read(c, v, read) {
        Some(t) if t != site => t,
        _ => free_register_site(c, !0),
    };
    move_site(c, asm, stack, locals, size, v, site, r);
}

/// Preserve `v` only if it is read again and `site` is its only home.
pub fn maybe_preserve(
    c: &mut Context,
    asm: &mut dyn Assembler,
    stack: Option<&StackNode<'_>>,
    locals: Option<&[std::cell::Cell<Local>]>,
    size: u32,
    v: ValueId,
    site: SiteId,
) {
    let head = c.values[v].reads.expect("preserve on a value with no reads");
    let following = read_next(c, head);
    let needed = match following {
        Some(r) => read_valid(c, r),
        None => false,
    };
    if needed && c.values[v].sites.len() == 1 {
        preserve(c, asm, stack, locals, size, v, site, following.unwrap());
    }
}

/// Drop every site of `v` that is not a frame home.
pub fn clean_value(c: &mut Context, v: ValueId) {
    let sites: Vec<SiteId> = c.values[v].sites.iter().copied().collect();
    for s in sites {
        if !crate::site::site_match(c, s, OperandType::Memory.bit(), 0, FrameIndex::Any) {
            remove_site(c, v, s);
        }
    }
}
