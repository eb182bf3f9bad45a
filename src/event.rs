//! Events: the scheduled IR nodes.
//!
//! Pass 1 appends events in program order. Each event captures the
//! stack and locals at its append point, links itself to the current
//! predecessor, and declares reads on the values it will consume.
//! Pass 2 walks the list, resolves each read to a concrete site, and
//! asks the event to emit machine code.

use std::cell::Cell;

use smallvec::SmallVec;

use crate::assembler::{
    Assembler, BinaryOperation, Operand, OperandType, Operation, TernaryOperation,
    UnaryOperation, ANY_REGISTERS, ANY_TYPE, BYTES_PER_WORD,
};
use crate::context::{
    ConstantCompare, Context, EventId, Local, ReadId, SiteId, StackNode, ValueId,
};
use crate::emit::{apply_binary, apply_ternary, apply_unary};
use crate::promise::{Promise, PromiseId};
use crate::read::{
    any_register_read, fixed_register_read, read_allocate_site, read_append, read_constraint,
    read_next, read_valid, register_or_constant_read, single_read, FrameIndex,
};
use crate::site::{
    as_operand, constant_site, free_register_site, memory_site, register_site, site_match,
    site_type, Site,
};
use crate::value::{
    add_site, clean_value, find_constant_site, live, maybe_preserve, next_read, remove_site,
    target_or_register, value,
};
use crate::TraceHandler;

/// Call flag: emit the aligned call variant for patchable sites.
pub const CALL_ALIGNED: u32 = 1;

/// Kind-specific payload of an event.
#[derive(Clone, Copy)]
pub enum EventKind<'a> {
    Call {
        address: ValueId,
        trace: Option<&'a dyn TraceHandler>,
        result: ValueId,
        flags: u32,
        result_size: u32,
    },
    Return {
        value: Option<ValueId>,
    },
    Move {
        op: BinaryOperation,
        src_size: u32,
        src: ValueId,
        dst_size: u32,
        dst: ValueId,
        /// Constraint for the destination; not attached to the event.
        dst_read: ReadId,
    },
    Compare {
        size: u32,
        first: ValueId,
        second: ValueId,
    },
    Combine {
        op: TernaryOperation,
        first_size: u32,
        first: ValueId,
        second_size: u32,
        second: ValueId,
        result_size: u32,
        result: ValueId,
        result_read: ReadId,
    },
    Translate {
        op: BinaryOperation,
        size: u32,
        value: ValueId,
        result: ValueId,
    },
    Memory {
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u32,
        result: ValueId,
    },
    Branch {
        op: UnaryOperation,
        address: ValueId,
    },
    BoundsCheck {
        object: ValueId,
        length_offset: u32,
        index: ValueId,
        handler: i64,
    },
    FrameSite {
        value: ValueId,
        size: u32,
        index: u32,
    },
    Dummy,
}

impl EventKind<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Call { .. } => "call",
            EventKind::Return { .. } => "return",
            EventKind::Move { .. } => "move",
            EventKind::Compare { .. } => "compare",
            EventKind::Combine { .. } => "combine",
            EventKind::Translate { .. } => "translate",
            EventKind::Memory { .. } => "memory",
            EventKind::Branch { .. } => "branch",
            EventKind::BoundsCheck { .. } => "bounds-check",
            EventKind::FrameSite { .. } => "frame-site",
            EventKind::Dummy => "dummy",
        }
    }
}

/// One scheduled node.
pub struct Event<'a> {
    pub next: Option<EventId>,
    pub stack_before: Option<&'a StackNode<'a>>,
    pub locals_before: &'a [Cell<Local>],
    pub stack_after: Option<&'a StackNode<'a>>,
    pub locals_after: Option<&'a [Cell<Local>]>,
    /// Code promises owned by this event; their offsets are captured
    /// right after it emits.
    pub promises: Vec<PromiseId>,
    /// Head of this event's read list.
    pub reads: Option<ReadId>,
    pub read_count: u32,
    /// Shared junction table, once the event participates in a join.
    pub junction_sites: Option<crate::context::JunctionId>,
    /// Per-slot site snapshot for successors that are not joins.
    pub saved_sites: Option<Vec<Option<SiteId>>>,
    /// Most recently linked first.
    pub predecessors: SmallVec<[EventId; 2]>,
    pub successors: SmallVec<[EventId; 2]>,
    pub block: Option<crate::context::BlockId>,
    pub logical_instruction: u32,
    pub state: Option<crate::context::StateId>,
    /// Stub reads installed when a junction edge was recorded here.
    pub junction_reads: Vec<(ValueId, ReadId)>,
    pub kind: EventKind<'a>,
}

/// Append an event at the current builder position, linking it into
/// the event list, the predecessor graph, and the current logical
/// instruction.
pub fn new_event<'a>(c: &mut Context<'a>, kind: EventKind<'a>) -> EventId {
    let ip = c
        .logical_ip
        .expect("event appended before any logical instruction started");

    let e = c.events.push(Event {
        next: None,
        stack_before: c.stack,
        locals_before: c.locals,
        stack_after: None,
        locals_after: None,
        promises: Vec::new(),
        reads: None,
        read_count: 0,
        junction_sites: None,
        saved_sites: None,
        predecessors: SmallVec::new(),
        successors: SmallVec::new(),
        block: None,
        logical_instruction: ip,
        state: c.state.take(),
        junction_reads: Vec::new(),
        kind,
    });

    log::debug!("append {} at ip {ip}", c.events[e].kind.name());

    match c.last_event {
        Some(last) => c.events[last].next = Some(e),
        None => c.first_event = Some(e),
    }
    c.last_event = Some(e);

    if let Some(p) = c.predecessor {
        c.events[p].stack_after = c.stack;
        c.events[p].locals_after = Some(c.locals);
        c.events[e].predecessors.push(p);
        c.events[p].successors.insert(0, e);
    }
    c.predecessor = Some(e);

    let li = c.logical_mut(ip);
    if li.first_event.is_none() {
        li.first_event = Some(e);
    }
    li.last_event = Some(e);

    e
}

/// Declare that `event` (or a pending junction, when `None`) reads
/// `v` under the constraint `r`.
pub fn add_read(c: &mut Context, event: Option<EventId>, v: ValueId, r: ReadId) {
    c.reads[r].value = Some(v);
    if let Some(e) = event {
        c.reads[r].event = Some(e);
        c.reads[r].event_next = c.events[e].reads;
        c.events[e].reads = Some(r);
        c.events[e].read_count += 1;
    }

    match c.values[v].last_read {
        Some(last) => read_append(c, last, r),
        None => c.values[v].reads = Some(r),
    }
    c.values[v].last_read = Some(r);
}

/// Consume every read of the event and drop all non-frame sites of
/// the values visible across it. Used by calls, whose targets may
/// clobber anything outside the frame.
fn clean_across(
    c: &mut Context,
    e: EventId,
    stack: Option<&StackNode<'_>>,
    locals: &[Cell<Local>],
) {
    for i in 0..c.local_footprint {
        if let Some(v) = locals[i as usize].get().value {
            clean_value(c, v);
        }
    }

    let mut node = stack;
    while let Some(s) = node {
        clean_value(c, s.value);
        node = s.next;
    }

    let mut r = c.events[e].reads;
    while let Some(read) = r {
        let v = c.reads[read].value.unwrap();
        next_read(c, e, v);
        r = c.reads[read].event_next;
    }
}

pub fn append_call<'a>(
    c: &mut Context<'a>,
    address: ValueId,
    flags: u32,
    trace: Option<&'a dyn TraceHandler>,
    result: ValueId,
    result_size: u32,
    argument_stack: Option<&'a StackNode<'a>>,
    argument_count: u32,
    stack_argument_footprint: u32,
) -> EventId {
    let e = new_event(
        c,
        EventKind::Call {
            address,
            trace,
            result,
            flags,
            result_size,
        },
    );

    let mut register_mask = !0u32;
    let mut node = argument_stack;
    let mut index = 0;
    let mut frame_index = c.aligned_frame_size + c.parameter_footprint;

    for _ in 0..argument_count {
        let s = node.expect("argument count exceeds the argument stack");
        let size = s.size * BYTES_PER_WORD;
        let target = if index < c.arch.argument_register_count() {
            let r = c.arch.argument_register(index);
            register_mask &= !(1u32 << r);
            fixed_register_read(c, size, r, None)
        } else {
            frame_index -= s.size;
            single_read(
                c,
                size,
                OperandType::Memory.bit(),
                0,
                FrameIndex::At(frame_index),
            )
        };
        add_read(c, Some(e), s.value, target);
        index += s.size;
        node = s.next;
    }

    // The call target may live anywhere except the argument registers.
    let address_mask = ((register_mask as u64) << 32) | register_mask as u64;
    let address_read = single_read(c, BYTES_PER_WORD, ANY_TYPE, address_mask, FrameIndex::Any);
    add_read(c, Some(e), address, address_read);

    // Everything on the pre-call stack and in live locals must be in
    // its frame home across the call.
    let mut footprint = stack_argument_footprint as i64;
    let mut node = c.events[e].stack_before;
    while let Some(s) = node {
        let size = s.size * BYTES_PER_WORD;
        let read = if footprint > 0 {
            frame_index -= s.size;
            single_read(
                c,
                size,
                OperandType::Memory.bit(),
                0,
                FrameIndex::At(frame_index),
            )
        } else {
            let home = c.stack_slot(s);
            if footprint == 0 {
                assert!(home <= frame_index);
                s.padding.set(frame_index - home);
            }
            single_read(c, size, OperandType::Memory.bit(), 0, FrameIndex::At(home))
        };
        add_read(c, Some(e), s.value, read);
        footprint -= s.size as i64;
        node = s.next;
    }

    let locals = c.events[e].locals_before;
    for i in 0..c.local_footprint {
        let local = locals[i as usize].get();
        if let Some(v) = local.value {
            let read = single_read(
                c,
                local.size,
                OperandType::Memory.bit(),
                0,
                FrameIndex::At(i),
            );
            add_read(c, Some(e), v, read);
        }
    }

    e
}

pub fn append_return(c: &mut Context, size: u32, v: Option<ValueId>) -> EventId {
    let e = new_event(c, EventKind::Return { value: v });
    if let Some(v) = v {
        let high = if size > BYTES_PER_WORD {
            Some(c.arch.return_high())
        } else {
            None
        };
        let low = c.arch.return_low();
        let read = fixed_register_read(c, size, low, high);
        add_read(c, Some(e), v, read);
    }
    e
}

pub fn append_move(
    c: &mut Context,
    op: BinaryOperation,
    src_size: u32,
    src: ValueId,
    dst_size: u32,
    dst: ValueId,
) -> EventId {
    let plan = c.arch.plan_binary(op, src_size, dst_size);
    assert!(!plan.thunk, "no thunk path for moves");

    let src_read = single_read(
        c,
        src_size,
        plan.first.types,
        plan.first.registers,
        FrameIndex::Any,
    );
    let dst_read = single_read(
        c,
        dst_size,
        plan.second.types,
        plan.second.registers,
        FrameIndex::Any,
    );

    let e = new_event(
        c,
        EventKind::Move {
            op,
            src_size,
            src,
            dst_size,
            dst,
            dst_read,
        },
    );
    add_read(c, Some(e), src, src_read);
    e
}

pub fn append_compare(c: &mut Context, size: u32, first: ValueId, second: ValueId) -> EventId {
    let plan = c.arch.plan_binary(BinaryOperation::Compare, size, size);
    assert!(!plan.thunk, "no thunk path for compares");

    let first_read = single_read(
        c,
        size,
        plan.first.types,
        plan.first.registers,
        FrameIndex::Any,
    );
    let second_read = single_read(
        c,
        size,
        plan.second.types,
        plan.second.registers,
        FrameIndex::Any,
    );

    let e = new_event(c, EventKind::Compare { size, first, second });
    add_read(c, Some(e), first, first_read);
    add_read(c, Some(e), second, second_read);
    e
}

pub fn append_combine(
    c: &mut Context,
    op: TernaryOperation,
    first_size: u32,
    first: ValueId,
    second_size: u32,
    second: ValueId,
    result_size: u32,
    result: ValueId,
) -> EventId {
    let plan = c.arch.plan_ternary(op, first_size, second_size, result_size);

    if plan.thunk {
        // The target cannot do this inline; push the operands and call
        // the runtime helper instead.
        let old_stack = c.stack;
        c.stack_push(second_size, second);
        c.stack_push(first_size, first);
        let argument_stack = c.stack;
        c.stack = old_stack;

        let thunk = c.client.thunk(op, result_size);
        let promise = crate::context::resolved(c, thunk);
        let site = constant_site(c, promise);
        let address = value(c, Some(site), None);
        return append_call(c, address, 0, None, result, result_size, argument_stack, 2, 0);
    }

    let result_read = single_read(
        c,
        result_size,
        plan.result.types,
        plan.result.registers,
        FrameIndex::Any,
    );
    let second_read = if c.arch.condensed_addressing() {
        result_read
    } else {
        single_read(
            c,
            second_size,
            plan.second.types,
            plan.second.registers,
            FrameIndex::Any,
        )
    };
    let first_read = single_read(
        c,
        first_size,
        plan.first.types,
        plan.first.registers,
        FrameIndex::Any,
    );

    let e = new_event(
        c,
        EventKind::Combine {
            op,
            first_size,
            first,
            second_size,
            second,
            result_size,
            result,
            result_read,
        },
    );
    add_read(c, Some(e), first, first_read);
    add_read(c, Some(e), second, second_read);
    e
}

pub fn append_translate(
    c: &mut Context,
    op: BinaryOperation,
    size: u32,
    v: ValueId,
    result: ValueId,
) -> EventId {
    let plan = c.arch.plan_binary(op, size, size);
    assert!(!plan.thunk, "no thunk path for unary translations");

    let read = single_read(
        c,
        size,
        plan.first.types,
        plan.first.registers,
        FrameIndex::Any,
    );

    let e = new_event(
        c,
        EventKind::Translate {
            op,
            size,
            value: v,
            result,
        },
    );
    add_read(c, Some(e), v, read);
    e
}

pub fn append_memory(
    c: &mut Context,
    base: ValueId,
    displacement: i32,
    index: Option<ValueId>,
    scale: u32,
    result: ValueId,
) -> EventId {
    let e = new_event(
        c,
        EventKind::Memory {
            base,
            displacement,
            index,
            scale,
            result,
        },
    );
    let base_read = any_register_read(c, BYTES_PER_WORD);
    add_read(c, Some(e), base, base_read);
    if let Some(ix) = index {
        let index_read = register_or_constant_read(c, BYTES_PER_WORD);
        add_read(c, Some(e), ix, index_read);
    }
    e
}

pub fn append_branch(c: &mut Context, op: UnaryOperation, address: ValueId) -> EventId {
    let e = new_event(c, EventKind::Branch { op, address });
    let read = single_read(c, BYTES_PER_WORD, ANY_TYPE, ANY_REGISTERS, FrameIndex::Any);
    add_read(c, Some(e), address, read);
    e
}

pub fn append_bounds_check(
    c: &mut Context,
    object: ValueId,
    length_offset: u32,
    index: ValueId,
    handler: i64,
) -> EventId {
    let e = new_event(
        c,
        EventKind::BoundsCheck {
            object,
            length_offset,
            index,
            handler,
        },
    );
    let object_read = any_register_read(c, BYTES_PER_WORD);
    add_read(c, Some(e), object, object_read);
    let index_read = register_or_constant_read(c, BYTES_PER_WORD);
    add_read(c, Some(e), index, index_read);
    e
}

pub fn append_frame_site(c: &mut Context, v: ValueId, size: u32, index: u32) -> EventId {
    new_event(c, EventKind::FrameSite { value: v, size, index })
}

/// Append an empty placeholder so the current logical instruction has
/// at least one event. Uses the instruction's own snapshots.
pub fn append_dummy(c: &mut Context) {
    let stack = c.stack;
    let locals = c.locals;
    let ip = c.logical_ip.unwrap();
    c.stack = c.logical(ip).stack;
    c.locals = c.logical(ip).locals;

    new_event(c, EventKind::Dummy);

    c.stack = stack;
    c.locals = locals;
}

/// Emit machine code for one event. Sources have been resolved and
/// frozen by the caller.
pub fn compile_event(c: &mut Context, asm: &mut dyn Assembler, e: EventId) {
    let kind = c.events[e].kind;
    match kind {
        EventKind::Dummy => {}

        EventKind::FrameSite { value: v, size, index } => {
            let stack = c.events[e].stack_before;
            let locals = c.events[e].locals_before;
            let site = crate::site::frame_site(c, index);
            add_site(c, asm, stack, Some(locals), size, v, site);
        }

        EventKind::Return { value: v } => {
            if let Some(v) = v {
                next_read(c, e, v);
            }
            asm.pop_frame();
            asm.apply0(Operation::Return);
        }

        EventKind::Move {
            op,
            src_size,
            src,
            dst_size,
            dst,
            dst_read,
        } => compile_move(c, asm, e, op, src_size, src, dst_size, dst, dst_read),

        EventKind::Compare { size, first, second } => {
            let first_constant = find_constant_site(c, first);
            let second_constant = find_constant_site(c, second);

            if let (Some(a), Some(b)) = (first_constant, second_constant) {
                let av = constant_value(c, a);
                let bv = constant_value(c, b);
                c.constant_compare = match av.wrapping_sub(bv) {
                    d if d < 0 => ConstantCompare::Less,
                    d if d > 0 => ConstantCompare::Greater,
                    _ => ConstantCompare::Equal,
                };
            } else {
                c.constant_compare = ConstantCompare::None;
                let a = c.values[first].source.unwrap();
                let b = c.values[second].source.unwrap();
                apply_binary(c, asm, BinaryOperation::Compare, size, a, size, b);
            }

            next_read(c, e, first);
            next_read(c, e, second);
        }

        EventKind::Combine {
            op,
            first_size,
            first,
            second_size,
            second,
            result_size,
            result,
            result_read,
        } => {
            let stack = c.events[e].stack_before;
            let locals = c.events[e].locals_before;

            let target = if c.arch.condensed_addressing() {
                let second_source = c.values[second].source.unwrap();
                maybe_preserve(c, asm, stack, Some(locals), second_size, second, second_source);
                c.values[second].source.unwrap()
            } else {
                let t = read_allocate_site(c, result_read)
                    .expect("no location available for a combine result");
                add_site(c, asm, stack, Some(locals), result_size, result, t);
                t
            };

            let a = c.values[first].source.unwrap();
            let b = c.values[second].source.unwrap();
            apply_ternary(c, asm, op, first_size, a, second_size, b, result_size, target);

            next_read(c, e, first);
            next_read(c, e, second);

            if c.arch.condensed_addressing() {
                let second_source = target;
                remove_site(c, second, second_source);
                if c.values[result].reads.is_some() {
                    add_site(c, asm, None, None, result_size, result, second_source);
                }
            }
        }

        EventKind::Translate { op, size, value: v, result } => {
            let stack = c.events[e].stack_before;
            let locals = c.events[e].locals_before;
            let source = c.values[v].source.unwrap();
            maybe_preserve(c, asm, stack, Some(locals), size, v, source);

            // The operation runs in place; the source site becomes the
            // result's home.
            apply_binary(c, asm, op, size, source, size, source);

            next_read(c, e, v);

            remove_site(c, v, source);
            if live(c, result) {
                add_site(c, asm, None, None, size, result, source);
            }
        }

        EventKind::Memory {
            base,
            displacement,
            index,
            scale,
            result,
        } => compile_memory(c, asm, e, base, displacement, index, scale, result),

        EventKind::Branch { op, address } => compile_branch(c, asm, e, op, address),

        EventKind::Call {
            address,
            trace,
            result,
            flags,
            result_size,
        } => {
            let op = if flags & CALL_ALIGNED != 0 {
                UnaryOperation::AlignedCall
            } else {
                UnaryOperation::Call
            };
            let source = c.values[address].source.unwrap();
            apply_unary(c, asm, op, BYTES_PER_WORD, source);

            if let Some(handler) = trace {
                let promise = c.promises.push(Promise::Code {
                    offset: Some(asm.offset()),
                });
                handler.handle_trace(promise);
            }

            let stack = c.events[e].stack_before;
            let locals = c.events[e].locals_before;
            clean_across(c, e, stack, locals);

            if result_size > 0 && live(c, result) {
                let high = if result_size > BYTES_PER_WORD {
                    Some(c.arch.return_high())
                } else {
                    None
                };
                let low = c.arch.return_low();
                let site = register_site(c, low, high);
                add_site(c, asm, None, None, result_size, result, site);
            }
        }

        EventKind::BoundsCheck {
            object,
            length_offset,
            index,
            handler,
        } => compile_bounds_check(c, asm, e, object, length_offset, index, handler),
    }
}

fn constant_value(c: &Context, site: SiteId) -> i64 {
    match c.sites[site] {
        Site::Constant { value } => crate::promise::PromiseResolver::promise_value(c, value),
        _ => unreachable!("not a constant site"),
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_move(
    c: &mut Context,
    asm: &mut dyn Assembler,
    e: EventId,
    op: BinaryOperation,
    src_size: u32,
    src: ValueId,
    dst_size: u32,
    dst: ValueId,
    dst_read: ReadId,
) {
    let stack = c.events[e].stack_before;
    let locals = c.events[e].locals_before;

    // A load feeds a value read nowhere else afterwards; a store
    // writes a value nobody reads through this event.
    let src_head = c.values[src].reads.unwrap();
    let is_load = match read_next(c, src_head) {
        Some(r) => !read_valid(c, r),
        None => true,
    };
    let is_store = match c.values[dst].reads {
        Some(r) => !read_valid(c, r),
        None => true,
    };

    let mut target = target_or_register(c, dst);
    let source = c.values[src].source.unwrap();
    let cost = crate::site::copy_cost(c, source, Some(target));
    if cost == 0 && (is_load || is_store) {
        target = source;
    }

    assert!(
        is_load || is_store || target != source,
        "move between live aliased sites"
    );

    if target == source {
        remove_site(c, src, target);
    }

    if !is_store {
        add_site(c, asm, stack, Some(locals), dst_size, dst, target);
    }

    if cost != 0 || op != BinaryOperation::Move {
        let (type_mask, register_mask, frame_index) = read_constraint(c, dst_read);

        let memory_to_memory = site_type(c, target) == OperandType::Memory
            && site_type(c, source) == OperandType::Memory;

        if site_match(c, target, type_mask, register_mask, frame_index) && !memory_to_memory {
            apply_binary(c, asm, op, src_size, source, dst_size, target);
        } else {
            assert!(
                type_mask & OperandType::Register.bit() != 0,
                "move destination accepts neither its target nor a register"
            );

            let tmp = free_register_site(c, register_mask);
            add_site(c, asm, stack, Some(locals), dst_size, dst, tmp);

            apply_binary(c, asm, op, src_size, source, dst_size, tmp);

            if is_store {
                remove_site(c, dst, tmp);
            }

            if memory_to_memory || is_store {
                apply_binary(c, asm, BinaryOperation::Move, dst_size, tmp, dst_size, target);
            } else {
                remove_site(c, dst, target);
            }
        }
    }

    if is_store {
        remove_site(c, dst, target);
    }

    next_read(c, e, src);
}

fn compile_memory(
    c: &mut Context,
    asm: &mut dyn Assembler,
    e: EventId,
    base: ValueId,
    displacement: i32,
    index: Option<ValueId>,
    scale: u32,
    result: ValueId,
) {
    let mut displacement = displacement;
    let mut scale = scale;
    let mut index_number: Option<u8> = None;

    if let Some(ix) = index {
        match find_constant_site(c, ix) {
            Some(site) => {
                displacement += (constant_value(c, site) * scale as i64) as i32;
                scale = 1;
            }
            None => {
                let source = c.values[ix].source.unwrap();
                assert_eq!(site_type(c, source), OperandType::Register);
                index_number = Some(match as_operand(c, source) {
                    Operand::Register { low, .. } => low,
                    _ => unreachable!(),
                });
            }
        }
    }

    let base_source = c.values[base].source.unwrap();
    assert_eq!(site_type(c, base_source), OperandType::Register);
    let base_number = match as_operand(c, base_source) {
        Operand::Register { low, .. } => low,
        _ => unreachable!(),
    };

    next_read(c, e, base);
    if let Some(ix) = index {
        // Widen a register index before it joins an 8-byte address
        // computation.
        if index_number.is_some() {
            let source = c.values[ix].source.unwrap();
            apply_binary(c, asm, BinaryOperation::Move, 4, source, 8, source);
        }
        next_read(c, e, ix);
    }

    let site = memory_site(c, base_number, displacement, index_number, scale);
    c.values[result].target = Some(site);
    add_site(c, asm, None, None, 0, result, site);
}

fn compile_branch(
    c: &mut Context,
    asm: &mut dyn Assembler,
    e: EventId,
    op: UnaryOperation,
    address: ValueId,
) {
    use UnaryOperation::*;

    let mut op = op;
    let jump = if op == Jump {
        true
    } else {
        match c.constant_compare {
            ConstantCompare::None => true,
            ConstantCompare::Less => match op {
                JumpIfLess | JumpIfLessOrEqual | JumpIfNotEqual => {
                    op = Jump;
                    true
                }
                _ => false,
            },
            ConstantCompare::Greater => match op {
                JumpIfGreater | JumpIfGreaterOrEqual | JumpIfNotEqual => {
                    op = Jump;
                    true
                }
                _ => false,
            },
            ConstantCompare::Equal => match op {
                JumpIfEqual | JumpIfLessOrEqual | JumpIfGreaterOrEqual => {
                    op = Jump;
                    true
                }
                _ => false,
            },
        }
    };

    if jump {
        let source = c.values[address].source.unwrap();
        apply_unary(c, asm, op, BYTES_PER_WORD, source);
    }

    next_read(c, e, address);
}

fn compile_bounds_check(
    c: &mut Context,
    asm: &mut dyn Assembler,
    e: EventId,
    object: ValueId,
    length_offset: u32,
    index: ValueId,
    handler: i64,
) {
    let constant = find_constant_site(c, index);
    let constant_index = constant.map(|s| constant_value(c, s));

    if let Some(value) = constant_index {
        if value < 0 {
            // Always out of bounds; no compares needed.
            let promise = crate::context::resolved(c, handler);
            asm.apply1(
                c,
                UnaryOperation::Call,
                BYTES_PER_WORD,
                Operand::Constant(promise),
            );
            next_read(c, e, object);
            next_read(c, e, index);
            return;
        }
    }

    let next_promise = c.promises.push(Promise::Code { offset: None });
    let mut out_of_bounds = None;

    if constant_index.is_none() {
        let oob = c.promises.push(Promise::Code { offset: None });
        out_of_bounds = Some(oob);

        let zero_promise = crate::context::resolved(c, 0);
        let zero = constant_site(c, zero_promise);
        let index_source = c.values[index].source.unwrap();
        apply_binary(c, asm, BinaryOperation::Compare, 4, index_source, 4, zero);
        asm.apply1(
            c,
            UnaryOperation::JumpIfLess,
            BYTES_PER_WORD,
            Operand::Constant(oob),
        );
    }

    let object_source = c.values[object].source.unwrap();
    assert_eq!(site_type(c, object_source), OperandType::Register);
    let base = match as_operand(c, object_source) {
        Operand::Register { low, .. } => low,
        _ => unreachable!(),
    };

    let length = memory_site(c, base, length_offset as i32, None, 1);
    crate::site::site_acquire(c, asm, length, None, None, 0, None);

    let index_source = c.values[index].source.unwrap();
    apply_binary(c, asm, BinaryOperation::Compare, 4, index_source, 4, length);

    crate::site::site_release(c, length);

    asm.apply1(
        c,
        UnaryOperation::JumpIfLess,
        BYTES_PER_WORD,
        Operand::Constant(next_promise),
    );

    if let Some(oob) = out_of_bounds {
        let offset = asm.offset();
        if let Promise::Code { offset: o } = &mut c.promises[oob] {
            *o = Some(offset);
        }
    }

    let handler_promise = crate::context::resolved(c, handler);
    asm.apply1(
        c,
        UnaryOperation::Call,
        BYTES_PER_WORD,
        Operand::Constant(handler_promise),
    );

    let offset = asm.offset();
    if let Promise::Code { offset: o } = &mut c.promises[next_promise] {
        *o = Some(offset);
    }

    next_read(c, e, object);
    next_read(c, e, index);
}
