//! Pass 2: scheduling and emission.
//!
//! Once every event exists, the engine walks the list in order. Per
//! event it advances saved multi-read cursors, adopts junction or
//! saved sites from its predecessors, resolves each read to a source
//! site (moving values when nothing matches), emits the event, and
//! populates the junction tables its successors will read. Block
//! boundaries fall where consecutive events belong to different or
//! non-adjacent logical instructions; a final walk resolves block
//! start offsets through the assembler.

use crate::assembler::{
    Assembler, AssemblerBlock, BinaryOperation, TernaryOperation, UnaryOperation,
};
use crate::context::{Context, EventId, ReadId, SiteId};
use crate::event::{append_dummy, compile_event};
use crate::junction::{populate_site_tables, set_sites, update_junction_reads};
use crate::promise::Promise;
use crate::read::{multi_next_target, read_allocate_site, read_pick_site};
use crate::site::{as_operand, site_freeze, site_thaw};
use crate::value::{move_site, pick};

/// A contiguous span of emitted code.
pub struct Block {
    pub head: EventId,
    pub next_instruction: Option<u32>,
    pub assembler_block: Option<AssemblerBlock>,
    pub start: u32,
}

/// Emit a one-operand operation from a site.
pub fn apply_unary(
    c: &mut Context,
    asm: &mut dyn Assembler,
    op: UnaryOperation,
    size: u32,
    a: SiteId,
) {
    let operand = as_operand(c, a);
    asm.apply1(c, op, size, operand);
}

/// Emit a two-operand operation from sites.
pub fn apply_binary(
    c: &mut Context,
    asm: &mut dyn Assembler,
    op: BinaryOperation,
    a_size: u32,
    a: SiteId,
    b_size: u32,
    b: SiteId,
) {
    let a_operand = as_operand(c, a);
    let b_operand = as_operand(c, b);
    asm.apply2(c, op, a_size, a_operand, b_size, b_operand);
}

/// Emit a three-operand operation from sites.
#[allow(clippy::too_many_arguments)]
pub fn apply_ternary(
    c: &mut Context,
    asm: &mut dyn Assembler,
    op: TernaryOperation,
    a_size: u32,
    a: SiteId,
    b_size: u32,
    b: SiteId,
    c_size: u32,
    c_site: SiteId,
) {
    let a_operand = as_operand(c, a);
    let b_operand = as_operand(c, b);
    let c_operand = as_operand(c, c_site);
    asm.apply3(c, op, a_size, a_operand, b_size, b_operand, c_size, c_operand);
}

/// Resolve one read to a source site, moving the value into a fresh
/// site when nothing it currently occupies matches.
fn read_source(c: &mut Context, asm: &mut dyn Assembler, e: EventId, r: ReadId) -> Option<SiteId> {
    let v = c.reads[r].value.unwrap();
    if c.values[v].sites.is_empty() {
        return None;
    }

    if let Some(site) = read_pick_site(c, r, v) {
        return Some(site);
    }

    let target = read_allocate_site(c, r)
        .expect("read satisfiable by no existing or fresh site");
    let (site, cost) = pick(c, v, Some(target));
    assert!(cost != 0, "unmatched read with a zero-cost site");
    let size = c.reads[r].size;
    let stack = c.events[e].stack_before;
    let locals = c.events[e].locals_before;
    move_site(c, asm, stack, Some(locals), size, v, site.unwrap(), target);
    Some(target)
}

/// Resolve and freeze every source of the event; thaw after. Frozen
/// sources cannot be repurposed while later reads of the same event
/// allocate.
fn populate_sources(c: &mut Context, asm: &mut dyn Assembler, e: EventId) {
    let mut frozen: Vec<SiteId> = Vec::with_capacity(c.events[e].read_count as usize);

    let mut cursor = c.events[e].reads;
    while let Some(r) = cursor {
        let source = read_source(c, asm, e, r);
        let v = c.reads[r].value.unwrap();
        c.values[v].source = source;
        if let Some(s) = source {
            frozen.push(s);
            site_freeze(c, s);
        }
        cursor = c.reads[r].event_next;
    }

    for s in frozen.drain(..).rev() {
        site_thaw(c, s);
    }
}

/// The next logical instruction at or past `index + 1` that produced
/// events.
fn next_logical(c: &Context, index: u32) -> Option<u32> {
    ((index + 1)..c.logical_code.len() as u32).find(|&n| c.logical_code[n as usize].is_some())
}

/// Run pass 2 over the whole event list. Returns the code size.
pub fn compile_pass(c: &mut Context, asm: &mut dyn Assembler) -> u32 {
    if let Some(ip) = c.logical_ip {
        if c.logical(ip).last_event.is_none() {
            append_dummy(c);
        }
    }

    let first_event = c.first_event.expect("compile with no events appended");
    let first_block = c.blocks.push(Block {
        head: first_event,
        next_instruction: None,
        assembler_block: None,
        start: 0,
    });
    let mut block = first_block;

    asm.allocate_frame(c.aligned_frame_size);

    let mut cursor = Some(first_event);
    while let Some(e) = cursor {
        c.events[e].block = Some(block);

        let ip = c.events[e].logical_instruction;
        log::debug!(
            "compile {} at ip {ip} with {} preds, {} succs",
            c.events[e].kind.name(),
            c.events[e].predecessors.len(),
            c.events[e].successors.len()
        );

        if c.logical(ip).machine_offset.is_none() {
            let offset = asm.offset();
            c.logical_mut(ip).machine_offset = Some(offset);
        }

        // Crossing a save point: each saved value's read chain skips
        // to the reads of the continuation now being emitted.
        if let Some(state) = c.events[e].state {
            let pairs = c.states[state].reads.clone();
            for (v, r) in pairs {
                let target = multi_next_target(c, r);
                c.values[v].reads = target;
            }
        }

        let preds: Vec<EventId> = c.events[e].predecessors.to_vec();
        if let Some(&adopted) = preds.first() {
            if preds.len() > 1 {
                // A join: resolve every non-immediate predecessor's
                // junction stubs, then adopt the shared table.
                for &p in &preds[..preds.len() - 1] {
                    update_junction_reads(c, p);
                }
                let table = c.events[adopted]
                    .junction_sites
                    .expect("join predecessor without a junction table");
                let sites = c.junctions[table].clone();
                set_sites(c, asm, e, &sites);
            } else if c.events[adopted].successors.len() > 1 {
                let saved = c.events[adopted]
                    .saved_sites
                    .clone()
                    .expect("branching predecessor without saved sites");
                set_sites(c, asm, e, &saved);
            }
        }

        populate_sources(c, asm, e);

        compile_event(c, asm, e);

        if !c.events[e].successors.is_empty() {
            populate_site_tables(c, asm, e);
        }

        let offset = asm.offset();
        let promises = c.events[e].promises.clone();
        for p in promises {
            if let Promise::Code { offset: o } = &mut c.promises[p] {
                *o = Some(offset);
            }
        }

        let next_instruction = next_logical(c, ip);
        let next_event = c.events[e].next;
        let boundary = match next_event {
            None => true,
            Some(n) => {
                let n_ip = c.events[n].logical_instruction;
                n_ip != ip
                    && (c.logical(ip).last_event == Some(e) || Some(n_ip) != next_instruction)
            }
        };
        if boundary {
            c.blocks[block].next_instruction = next_instruction;
            c.blocks[block].assembler_block = Some(asm.end_block(next_event.is_some()));
            if let Some(n) = next_event {
                block = c.blocks.push(Block {
                    head: n,
                    next_instruction: None,
                    assembler_block: None,
                    start: 0,
                });
            }
        }

        cursor = next_event;
    }

    debug_assert!(
        c.registers.values().all(|r| r.freeze_count == 0),
        "register freeze counts unbalanced after emission"
    );
    debug_assert!(
        c.frame_resources.iter().all(|r| r.freeze_count == 0),
        "frame slot freeze counts unbalanced after emission"
    );

    // Chain the blocks, fixing each start offset and letting the
    // assembler patch cross-block branches.
    let mut b = first_block;
    loop {
        match c.blocks[b].next_instruction {
            Some(ip) => {
                let head = c
                    .logical(ip)
                    .first_event
                    .expect("block chain reached an empty instruction");
                let nb = c.events[head].block.unwrap();
                let this = c.blocks[b].assembler_block.unwrap();
                let next = c.blocks[nb].assembler_block.unwrap();
                let start = asm.resolve_block(this, c.blocks[b].start, Some(next));
                c.blocks[nb].start = start;
                b = nb;
            }
            None => {
                let this = c.blocks[b].assembler_block.unwrap();
                let size = asm.resolve_block(this, c.blocks[b].start, None);
                c.compiled = true;
                return size;
            }
        }
    }
}
