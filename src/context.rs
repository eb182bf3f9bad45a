// The context is the single mutable handle threaded through every
// operation of the back-end. It owns the entity pools that replace the
// original pointer graph (values, reads, sites, events, states,
// promises, blocks, junction tables, register identities), the current
// builder position (stack, locals, predecessor, logical ip), and the
// compilation-wide allocator state. Arena-lifetime data (stack nodes
// and locals slices) lives in a caller-provided bump arena so that
// snapshots shared between events alias exactly the way the event
// graph expects.

//! Compilation context and entity pools.

use std::cell::Cell;

use bumpalo::Bump;
use cranelift_entity::{entity_impl, PrimaryMap};
use smallvec::SmallVec;

use crate::assembler::{pad, Architecture, Client, BYTES_PER_WORD};
use crate::event::Event;
use crate::promise::{Promise, PromiseId, PromiseResolver};
use crate::read::Read;
use crate::site::Site;
use crate::state::State;

/// Index of a value in the context pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);
entity_impl!(ValueId, "value");

/// Index of a read in the context pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadId(u32);
entity_impl!(ReadId, "read");

/// Index of a site in the context pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(u32);
entity_impl!(SiteId, "site");

/// Index of an event in the context pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u32);
entity_impl!(EventId, "event");

/// Index of a saved builder state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u32);
entity_impl!(StateId, "state");

/// Identity of a register, stable across swaps.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegId(u32);
entity_impl!(RegId, "reg");

/// Index of an emitted-code block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "block");

/// Index of a shared junction site table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JunctionId(u32);
entity_impl!(JunctionId, "junction");

/// An abstract operand. A value may occupy several sites at once; its
/// pending uses hang off the read chain.
pub struct Value {
    /// Head of the read chain. The value is live while this is a valid
    /// read.
    pub reads: Option<ReadId>,
    /// Tail of the read chain; new reads append here.
    pub last_read: Option<ReadId>,
    /// Current sites, most recently added first.
    pub sites: SmallVec<[SiteId; 4]>,
    /// The site chosen for this value while the current event emits.
    pub source: Option<SiteId>,
    /// Preferred site for the next definition, if any.
    pub target: Option<SiteId>,
    /// Scratch marker used while collecting state snapshots.
    pub visited: bool,
}

/// One local variable slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct Local {
    pub value: Option<ValueId>,
    /// Size in bytes; zero while the slot is uninitialized.
    pub size: u32,
}

/// One element of the abstract operand stack. Snapshots share the
/// tails of these persistent lists.
pub struct StackNode<'a> {
    /// Word position of this element's bottom word, counted from the
    /// start of the stack area.
    pub index: u32,
    /// Size in words.
    pub size: u32,
    /// Extra words between this element's home slot and the outgoing
    /// argument area of a call, filled in while call events build
    /// their reads.
    pub padding: Cell<u32>,
    pub value: ValueId,
    pub next: Option<&'a StackNode<'a>>,
}

impl<'a> StackNode<'a> {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn padding(&self) -> u32 {
        self.padding.get()
    }
}

/// A machine register. Identity is separate from the number so that
/// swapping two registers redirects every site holding the identity.
pub struct Register {
    pub number: u8,
    /// Value currently resident, if any.
    pub value: Option<ValueId>,
    /// The register site binding the value.
    pub site: Option<SiteId>,
    pub size: u32,
    /// Number of memory sites using this register as base or index.
    pub ref_count: u32,
    /// Transient reservations during a single event's emission.
    pub freeze_count: u32,
    pub reserved: bool,
}

/// One frame slot, parallel to [`Register`] but keyed by frame index.
#[derive(Default)]
pub struct FrameResource {
    pub value: Option<ValueId>,
    pub site: Option<SiteId>,
    pub size: u32,
    pub freeze_count: u32,
}

/// All events produced for one source-level instruction index.
pub struct LogicalInstruction<'a> {
    pub index: u32,
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    pub stack: Option<&'a StackNode<'a>>,
    pub locals: &'a [Cell<Local>],
    /// Byte offset of the first emitted instruction, captured in pass 2.
    pub machine_offset: Option<u32>,
}

/// Outcome of a compare between two resolved constants, consumed by
/// the next branch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantCompare {
    None,
    Less,
    Greater,
    Equal,
}

/// Mutable state of one compilation.
pub struct Context<'a> {
    pub arena: &'a Bump,
    pub arch: &'a dyn Architecture,
    pub client: &'a dyn Client,

    pub values: PrimaryMap<ValueId, Value>,
    pub reads: PrimaryMap<ReadId, Read>,
    pub sites: PrimaryMap<SiteId, Site>,
    pub events: PrimaryMap<EventId, Event<'a>>,
    pub states: PrimaryMap<StateId, State<'a>>,
    pub promises: PrimaryMap<PromiseId, Promise>,
    pub blocks: PrimaryMap<BlockId, crate::emit::Block>,
    pub junctions: PrimaryMap<JunctionId, Vec<Option<SiteId>>>,

    pub registers: PrimaryMap<RegId, Register>,
    /// Register number to identity. Swaps permute this table.
    pub register_map: Vec<RegId>,
    pub frame_resources: Vec<FrameResource>,
    pub logical_code: Vec<Option<LogicalInstruction<'a>>>,
    /// Constant pool entries in insertion order.
    pub constants: Vec<PromiseId>,

    pub stack: Option<&'a StackNode<'a>>,
    pub locals: &'a [Cell<Local>],
    pub predecessor: Option<EventId>,
    pub first_event: Option<EventId>,
    pub last_event: Option<EventId>,
    /// State captured by the most recent save/restore, adopted by the
    /// next event appended.
    pub state: Option<StateId>,
    pub logical_ip: Option<u32>,

    pub parameter_footprint: u32,
    pub local_footprint: u32,
    pub aligned_frame_size: u32,
    pub available_register_count: u32,
    pub constant_compare: ConstantCompare,

    /// Base address of the output buffer, set by the writer.
    pub machine_code: Option<usize>,
    pub machine_code_size: u32,
    pub compiled: bool,
}

impl<'a> Context<'a> {
    pub fn new(arena: &'a Bump, arch: &'a dyn Architecture, client: &'a dyn Client) -> Self {
        let count = arch.register_count();
        assert!(count <= 32, "register masks hold at most 32 registers");

        let mut registers = PrimaryMap::new();
        let mut register_map = Vec::with_capacity(count as usize);
        let mut available = count;
        for number in 0..count as u8 {
            let reserved = arch.reserved(number);
            if reserved {
                available -= 1;
            }
            let id = registers.push(Register {
                number,
                value: None,
                site: None,
                size: 0,
                ref_count: 0,
                freeze_count: 0,
                reserved,
            });
            register_map.push(id);
        }

        Self {
            arena,
            arch,
            client,
            values: PrimaryMap::new(),
            reads: PrimaryMap::new(),
            sites: PrimaryMap::new(),
            events: PrimaryMap::new(),
            states: PrimaryMap::new(),
            promises: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            junctions: PrimaryMap::new(),
            registers,
            register_map,
            frame_resources: Vec::new(),
            logical_code: Vec::new(),
            constants: Vec::new(),
            stack: None,
            locals: &[],
            predecessor: None,
            first_event: None,
            last_event: None,
            state: None,
            logical_ip: None,
            parameter_footprint: 0,
            local_footprint: 0,
            aligned_frame_size: 0,
            available_register_count: available,
            constant_compare: ConstantCompare::None,
            machine_code: None,
            machine_code_size: 0,
            compiled: false,
        }
    }

    /// The register identity currently holding `number`.
    pub fn register_by_number(&self, number: u8) -> RegId {
        self.register_map[number as usize]
    }

    /// The logical instruction at `ip`; aborts if it was never started.
    pub fn logical(&self, ip: u32) -> &LogicalInstruction<'a> {
        self.logical_code[ip as usize]
            .as_ref()
            .expect("logical ip was never started")
    }

    pub fn logical_mut(&mut self, ip: u32) -> &mut LogicalInstruction<'a> {
        self.logical_code[ip as usize]
            .as_mut()
            .expect("logical ip was never started")
    }

    /// Words occupied by locals plus the live operand stack.
    pub fn frame_footprint(&self, stack: Option<&StackNode<'a>>) -> u32 {
        self.local_footprint + stack.map_or(0, |s| s.index + s.size)
    }

    /// Frame index of the slot backing a stack node.
    pub fn stack_slot(&self, node: &StackNode<'a>) -> u32 {
        node.index + self.local_footprint
    }

    /// Push `value` onto the abstract stack.
    pub fn stack_push(&mut self, size: u32, value: ValueId) {
        let words = crate::assembler::ceiling(size, BYTES_PER_WORD);
        assert!(words > 0);
        let index = self.stack.map_or(0, |s| s.index + s.size);
        let node = self.arena.alloc(StackNode {
            index,
            size: words,
            padding: Cell::new(0),
            value,
            next: self.stack,
        });
        self.stack = Some(node);
    }

    /// Pop the top stack element, which must have the given size.
    pub fn stack_pop(&mut self, size: u32) -> ValueId {
        let top = self.stack.expect("pop from an empty operand stack");
        assert_eq!(crate::assembler::ceiling(size, BYTES_PER_WORD), top.size);
        self.stack = top.next;
        top.value
    }

    /// Allocate a fresh locals snapshot, copying the current one.
    pub fn clone_locals(&self) -> &'a [Cell<Local>] {
        let current = self.locals;
        self.arena
            .alloc_slice_fill_with(current.len(), |i| Cell::new(current[i].get()))
    }

    /// Allocate a zeroed locals snapshot.
    pub fn fresh_locals(&self) -> &'a [Cell<Local>] {
        self.arena
            .alloc_slice_fill_with(self.local_footprint as usize, |_| Cell::new(Local::default()))
    }
}

impl PromiseResolver for Context<'_> {
    fn promise_value(&self, promise: PromiseId) -> i64 {
        match self.promises[promise] {
            Promise::Resolved { value } => value,
            Promise::Pool { key } => {
                let base = self
                    .machine_code
                    .expect("pool promise read before code was written");
                base as i64 + pad(self.machine_code_size) as i64 + (key * BYTES_PER_WORD) as i64
            }
            Promise::Code { offset } => {
                let base = self
                    .machine_code
                    .expect("code promise read before code was written");
                let offset = offset.expect("code promise read before its offset was captured");
                base as i64 + offset as i64
            }
            Promise::Ip { logical_ip } => {
                let base = self
                    .machine_code
                    .expect("ip promise read before code was written");
                let offset = self
                    .logical(logical_ip)
                    .machine_offset
                    .expect("ip promise read before pass 2 reached the instruction");
                base as i64 + offset as i64
            }
        }
    }

    fn promise_resolved(&self, promise: PromiseId) -> bool {
        match self.promises[promise] {
            Promise::Resolved { .. } => true,
            Promise::Pool { .. } => self.machine_code.is_some(),
            Promise::Code { offset } => self.machine_code.is_some() && offset.is_some(),
            Promise::Ip { logical_ip } => {
                self.machine_code.is_some()
                    && self.logical_code[logical_ip as usize]
                        .as_ref()
                        .is_some_and(|l| l.machine_offset.is_some())
            }
        }
    }
}

/// Allocate a resolved promise.
pub fn resolved(c: &mut Context, value: i64) -> PromiseId {
    c.promises.push(Promise::Resolved { value })
}
