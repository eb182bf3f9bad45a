//! Builder state snapshots.
//!
//! `save_state` captures the stack, locals, predecessor, and logical
//! position, and installs a multi read on every live value; each
//! continuation compiled from the snapshot contributes its reads as
//! children of those multi reads, and pass 2 advances the per-path
//! target cursor when emission crosses the save point. This is how
//! control-flow rejoins are modeled without a CFG.

use std::cell::Cell;

use crate::assembler::BYTES_PER_WORD;
use crate::context::{Context, EventId, Local, ReadId, StackNode, StateId, ValueId};
use crate::event::{add_read, append_dummy};
use crate::read::{multi_allocate_target, multi_read};

/// A saved builder position.
pub struct State<'a> {
    pub stack: Option<&'a StackNode<'a>>,
    pub locals: &'a [Cell<Local>],
    pub predecessor: Option<EventId>,
    pub logical_ip: Option<u32>,
    /// The multi read installed per live value.
    pub reads: Vec<(ValueId, ReadId)>,
}

fn add_multi_read(c: &mut Context, v: ValueId, size: u32, pairs: &mut Vec<(ValueId, ReadId)>) {
    if !c.values[v].visited {
        c.values[v].visited = true;
        let r = multi_read(c, size);
        add_read(c, None, v, r);
        pairs.push((v, r));
    }
}

/// Open a target slot on every saved multi read for the continuation
/// about to be appended, and route subsequent reads into the multi.
fn allocate_targets(c: &mut Context, state: StateId) {
    let pairs = c.states[state].reads.clone();
    for (v, r) in pairs {
        c.values[v].last_read = Some(r);
        multi_allocate_target(c, r);
    }
}

/// Capture the current builder position.
pub fn save_state<'a>(c: &mut Context<'a>) -> StateId {
    let state = c.states.push(State {
        stack: c.stack,
        locals: c.locals,
        predecessor: c.predecessor,
        logical_ip: c.logical_ip,
        reads: Vec::new(),
    });

    if c.predecessor.is_some() {
        c.state = Some(state);

        let mut pairs = Vec::new();
        for i in 0..c.local_footprint {
            let local = c.locals[i as usize].get();
            if let Some(v) = local.value {
                add_multi_read(c, v, local.size, &mut pairs);
            }
        }
        let mut node = c.stack;
        while let Some(s) = node {
            add_multi_read(c, s.value, s.size * BYTES_PER_WORD, &mut pairs);
            node = s.next;
        }

        for &(v, _) in &pairs {
            c.values[v].visited = false;
        }

        log::debug!(
            "save state {state:?} at ip {:?} with {} live values",
            c.logical_ip,
            pairs.len()
        );

        c.states[state].reads = pairs;
        allocate_targets(c, state);
    }

    state
}

/// Rewind the builder to a saved position and open target slots for
/// the continuation that follows.
pub fn restore_state(c: &mut Context, state: StateId) {
    if let Some(ip) = c.logical_ip {
        if c.logical(ip).last_event.is_none() {
            append_dummy(c);
        }
    }

    c.stack = c.states[state].stack;
    c.locals = c.states[state].locals;
    c.predecessor = c.states[state].predecessor;
    c.logical_ip = c.states[state].logical_ip;

    log::debug!("restore state {state:?} at ip {:?}", c.logical_ip);

    if c.predecessor.is_some() {
        c.state = Some(state);
        allocate_targets(c, state);
    }
}
