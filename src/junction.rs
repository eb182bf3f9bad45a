//! Junction reconciliation.
//!
//! At a control-flow join, every value live into a successor must be
//! left in the same site by every predecessor. The first predecessor
//! to reach pass 2 chooses a site per frame slot and records it in a
//! table shared (by propagation) with every event feeding the join;
//! later predecessors move their copy of each value into the recorded
//! site. Events with several successors additionally snapshot their
//! sites so straight-line successors can adopt them.

use crate::assembler::{Assembler, OperandType};
use crate::context::{Context, EventId, JunctionId, ReadId, SiteId, ValueId};
use crate::read::{read_allocate_site, read_pick_site, stub_read, ReadKind};
use crate::site::{frame_site, free_register_site, site_freeze, site_make_specific, site_thaw,
                  site_type};
use crate::value::{add_site, clear_sites, live, move_site, pick};
use crate::event::add_read;

/// Choose a home for `v` at junction slot `index`: an existing
/// register or memory site satisfying the pending read, a fresh site
/// from the read's constraint, or any free register. Under register
/// scarcity the frame slot itself is the only safe choice.
fn pick_junction_site(c: &mut Context, v: ValueId, r: ReadId, index: u32) -> SiteId {
    if c.available_register_count > 1 {
        if let Some(s) = read_pick_site(c, r, v) {
            if matches!(
                site_type(c, s),
                OperandType::Memory | OperandType::Register
            ) {
                return s;
            }
        }
        if let Some(s) = read_allocate_site(c, r) {
            return s;
        }
        free_register_site(c, !0)
    } else {
        frame_site(c, index)
    }
}

/// Bring `v` to the junction site recorded for `index`, choosing and
/// pinning one if this is the first predecessor to resolve the slot.
/// Newly chosen sites are frozen until the whole table settles.
fn resolve_junction_site(
    c: &mut Context,
    asm: &mut dyn Assembler,
    e: EventId,
    v: ValueId,
    index: u32,
    frozen: &mut Vec<SiteId>,
) {
    let stack_after = c.events[e].stack_after;
    assert!(index < c.frame_footprint(stack_after));

    if !live(c, v) {
        return;
    }
    assert!(!c.values[v].sites.is_empty());

    let r = c.values[v].reads.unwrap();
    let table = c.events[e].junction_sites.unwrap();
    let original = c.junctions[table][index as usize];

    let target = match original {
        Some(t) => t,
        None => {
            let t = pick_junction_site(c, v, r, index);
            c.junctions[table][index as usize] = Some(t);
            t
        }
    };

    let (site, cost) = pick(c, v, Some(target));
    let target = if cost != 0 {
        let size = c.reads[r].size;
        let locals_after = c.events[e].locals_after;
        move_site(c, asm, stack_after, locals_after, size, v, site.unwrap(), target);
        target
    } else {
        site.unwrap()
    };

    site_make_specific(c, target);

    log::trace!(
        "resolve junction slot {index} for {v:?} at {target:?} ({:?})",
        site_type(c, target)
    );

    if original.is_none() {
        // Pin the concrete resolved site so later predecessors
        // converge on the same location.
        c.junctions[table][index as usize] = Some(target);
        frozen.push(target);
        site_freeze(c, target);
    }
}

/// Share `table` with every event reachable through the predecessor
/// edges of `e` that has not adopted a table yet.
fn propagate_junction_sites(c: &mut Context, e: EventId, table: JunctionId) {
    let preds: Vec<EventId> = c.events[e].predecessors.to_vec();
    for p in preds {
        if c.events[p].junction_sites.is_none() {
            c.events[p].junction_sites = Some(table);
            let succs: Vec<EventId> = c.events[p].successors.to_vec();
            for s in succs {
                propagate_junction_sites(c, s, table);
            }
        }
    }
}

/// After `e` has emitted, resolve its junction table (if any) for
/// every live value it leaves behind, allocating and propagating a
/// table when a successor is a join. Events with several successors
/// snapshot their sites as `saved_sites`.
pub fn populate_site_tables(c: &mut Context, asm: &mut dyn Assembler, e: EventId) {
    let mut frozen: Vec<SiteId> = Vec::new();

    // First settle the slots an earlier predecessor already decided.
    if c.events[e].junction_sites.is_some() {
        resolve_slots(c, asm, e, &mut frozen, true);
    } else {
        let succs: Vec<EventId> = c.events[e].successors.to_vec();
        for s in succs {
            if c.events[s].predecessors.len() > 1 {
                let footprint = c.frame_footprint(c.events[e].stack_after);
                let table = c.junctions.push(vec![None; footprint as usize]);
                log::debug!("junction table {table:?} of {footprint} slots for join at {s:?}");
                propagate_junction_sites(c, s, table);
                break;
            }
        }
    }

    // Then fill the rest, if this event now carries a table.
    if c.events[e].junction_sites.is_some() {
        resolve_slots(c, asm, e, &mut frozen, false);
    }

    for s in frozen.drain(..).rev() {
        site_thaw(c, s);
    }

    if c.events[e].successors.len() > 1 {
        let footprint = c.frame_footprint(c.events[e].stack_after) as usize;
        let mut saved: Vec<Option<SiteId>> = vec![None; footprint];

        let locals_after = c.events[e].locals_after.unwrap();
        for i in 0..c.local_footprint {
            if let Some(v) = locals_after[i as usize].get().value {
                saved[i as usize] = c.values[v].sites.first().copied();
                log::trace!("save {:?} for {v:?} at slot {i}", saved[i as usize]);
            }
        }

        let mut node = c.events[e].stack_after;
        while let Some(s) = node {
            let slot = c.stack_slot(s) as usize;
            saved[slot] = c.values[s.value].sites.first().copied();
            log::trace!("save {:?} for {:?} at slot {slot}", saved[slot], s.value);
            node = s.next;
        }

        c.events[e].saved_sites = Some(saved);
    }
}

/// One sweep over the junction slots of `e`. With `already_decided`
/// only slots with a recorded site resolve; otherwise only empty ones.
fn resolve_slots(
    c: &mut Context,
    asm: &mut dyn Assembler,
    e: EventId,
    frozen: &mut Vec<SiteId>,
    already_decided: bool,
) {
    let table = c.events[e].junction_sites.unwrap();

    let mut node = c.events[e].stack_after;
    while let Some(s) = node {
        let slot = c.stack_slot(s);
        let decided = c.junctions[table][slot as usize].is_some();
        if decided == already_decided {
            resolve_junction_site(c, asm, e, s.value, slot, frozen);
        }
        node = s.next;
    }

    let locals_after = c.events[e].locals_after.unwrap();
    for i in (0..c.local_footprint).rev() {
        if let Some(v) = locals_after[i as usize].get().value {
            let decided = c.junctions[table][i as usize].is_some();
            if decided == already_decided {
                resolve_junction_site(c, asm, e, v, i, frozen);
            }
        }
    }
}

/// Replace every live value's sites with the per-slot sites recorded
/// by the chosen predecessor, so this event starts from the agreed
/// state.
pub fn set_sites(c: &mut Context, asm: &mut dyn Assembler, e: EventId, sites: &[Option<SiteId>]) {
    let locals_before = c.events[e].locals_before;
    for i in 0..c.local_footprint {
        if let Some(v) = locals_before[i as usize].get().value {
            clear_sites(c, v);
            if live(c, v) {
                let size = c.reads[c.values[v].reads.unwrap()].size;
                let site = sites[i as usize]
                    .expect("live value with no site recorded at its junction slot");
                log::trace!("set site {site:?} for {v:?} at slot {i}");
                add_site(c, asm, None, None, size, v, site);
            }
        }
    }

    let mut node = c.events[e].stack_before;
    while let Some(s) = node {
        let v = s.value;
        clear_sites(c, v);
        if live(c, v) {
            let size = c.reads[c.values[v].reads.unwrap()].size;
            let slot = c.stack_slot(s) as usize;
            let site =
                sites[slot].expect("live value with no site recorded at its junction slot");
            log::trace!("set site {site:?} for {v:?} at slot {slot}");
            add_site(c, asm, None, None, size, v, site);
        }
        node = s.next;
    }
}

fn add_stub_read(c: &mut Context, v: ValueId, size: u32, pairs: &mut Vec<(ValueId, ReadId)>) {
    let r = if c.values[v].visited {
        let last = c.values[v].last_read.unwrap();
        assert!(
            matches!(c.reads[last].kind, ReadKind::Stub { .. }),
            "revisited value whose last read is not a stub"
        );
        last
    } else {
        c.values[v].visited = true;
        let r = stub_read(c, size);
        add_read(c, None, v, r);
        r
    };
    pairs.push((v, r));
}

/// Install a stub read for every value live at the current builder
/// position, recording the pairs on `e` so the junction can resolve
/// them in pass 2.
pub fn populate_junction_reads(c: &mut Context, e: EventId) {
    let mut pairs = Vec::new();

    for i in 0..c.local_footprint {
        let local = c.locals[i as usize].get();
        if let Some(v) = local.value {
            add_stub_read(c, v, local.size, &mut pairs);
        }
    }

    let mut node = c.stack;
    while let Some(s) = node {
        add_stub_read(
            c,
            s.value,
            s.size * crate::assembler::BYTES_PER_WORD,
            &mut pairs,
        );
        node = s.next;
    }

    for &(v, _) in &pairs {
        c.values[v].visited = false;
    }

    c.events[e].junction_reads = pairs;
}

/// Point each of the predecessor's junction stubs at the current head
/// read of its value, so liveness and constraints flow across the
/// edge. The first resolution wins.
pub fn update_junction_reads(c: &mut Context, e: EventId) {
    let pairs = c.events[e].junction_reads.clone();
    let mut cursor = pairs.iter();

    let locals_after = c.events[e].locals_after.unwrap();
    for i in 0..c.local_footprint {
        if let Some(v) = locals_after[i as usize].get().value {
            let &(_, stub) = cursor.next().expect("junction read list out of sync");
            let head = c.values[v].reads;
            if let ReadKind::Stub { read, .. } = &mut c.reads[stub].kind {
                if read.is_none() {
                    *read = head;
                }
            }
        }
    }

    let mut node = c.events[e].stack_after;
    while let Some(s) = node {
        let &(_, stub) = cursor.next().expect("junction read list out of sync");
        let head = c.values[s.value].reads;
        if let ReadKind::Stub { read, .. } = &mut c.reads[stub].kind {
            if read.is_none() {
                *read = head;
            }
        }
        node = s.next;
    }
}
