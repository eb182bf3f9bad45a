//! The builder facade.
//!
//! An IR producer drives one [`Compiler`] per compilation: it appends
//! operations in program order (pass 1), then calls [`Compiler::compile`]
//! to run the emission engine (pass 2) and [`Compiler::write_to`] to
//! produce the final bytes plus the appended constant pool.
//!
//! ```ignore
//! let arena = Bump::new();
//! let mut compiler = Compiler::new(&arena, &arch, assembler, &client);
//! compiler.init(code_length, parameters, locals, aligned_frame_size);
//! compiler.start_logical_ip(0);
//! let sum = compiler.add(8, a, b);
//! compiler.return_(8, Some(sum));
//! let size = compiler.compile();
//! let mut out = vec![0; (size + compiler.pool_size()) as usize + 8];
//! compiler.write_to(&mut out)?;
//! ```

use bumpalo::Bump;

use crate::assembler::{
    pad, Architecture, Assembler, BinaryOperation, TernaryOperation, UnaryOperation,
    BYTES_PER_WORD,
};
use crate::context::{resolved, Context, Local, StackNode, StateId, ValueId};
use crate::emit::compile_pass;
use crate::error::EmitError;
use crate::event::{
    append_bounds_check, append_branch, append_call, append_combine, append_compare,
    append_dummy, append_frame_site, append_move, append_return, append_translate,
};
use crate::junction::populate_junction_reads;
use crate::promise::{Promise, PromiseId, PromiseResolver};
use crate::site::{address_site, constant_site, frame_site, register_site};
use crate::state::{restore_state, save_state};
use crate::value::value;
use crate::{Client, TraceHandler};

/// The back-end facade. See the module documentation for the driving
/// protocol.
pub struct Compiler<'a, A: Assembler> {
    ctx: Context<'a>,
    assembler: A,
}

impl<'a, A: Assembler> Compiler<'a, A> {
    pub fn new(
        arena: &'a Bump,
        arch: &'a dyn Architecture,
        assembler: A,
        client: &'a dyn Client,
    ) -> Self {
        Self {
            ctx: Context::new(arena, arch, client),
            assembler,
        }
    }

    /// Size the compilation: how many logical instructions may start,
    /// and the frame geometry in words.
    pub fn init(
        &mut self,
        code_length: u32,
        parameter_footprint: u32,
        local_footprint: u32,
        aligned_frame_size: u32,
    ) {
        let c = &mut self.ctx;
        c.parameter_footprint = parameter_footprint;
        c.local_footprint = local_footprint;
        c.aligned_frame_size = aligned_frame_size;

        c.frame_resources = ((0..aligned_frame_size + parameter_footprint)
            .map(|_| Default::default()))
        .collect();
        c.logical_code = (0..code_length).map(|_| None).collect();
        c.locals = c.fresh_locals();
    }

    /// Begin the logical instruction at `ip`. Each ip starts at most
    /// once.
    pub fn start_logical_ip(&mut self, ip: u32) {
        let c = &mut self.ctx;
        assert!((ip as usize) < c.logical_code.len(), "logical ip out of range");
        assert!(
            c.logical_code[ip as usize].is_none(),
            "logical ip {ip} started twice"
        );

        log::debug!("-- ip: {ip}");

        if let Some(current) = c.logical_ip {
            if c.logical(current).last_event.is_none() {
                append_dummy(c);
            }
        }

        c.logical_code[ip as usize] = Some(crate::context::LogicalInstruction {
            index: ip,
            first_event: None,
            last_event: None,
            stack: c.stack,
            locals: c.locals,
            machine_offset: None,
        });
        c.logical_ip = Some(ip);
    }

    /// Record a control-flow edge from the current position to the
    /// already-started instruction at `ip`.
    pub fn visit_logical_ip(&mut self, ip: u32) {
        let c = &mut self.ctx;
        assert!((ip as usize) < c.logical_code.len(), "logical ip out of range");

        let target = c
            .logical(ip)
            .first_event
            .expect("visited instruction has no events");

        if let Some(p) = c.predecessor {
            c.events[p].stack_after = c.stack;
            c.events[p].locals_after = Some(c.locals);

            c.events[p].successors.insert(0, target);
            populate_junction_reads(c, p);
            c.events[target].predecessors.insert(0, p);
        }
    }

    /// Snapshot the builder position for a later rejoin.
    pub fn save_state(&mut self) -> StateId {
        save_state(&mut self.ctx)
    }

    /// Rewind to a snapshot.
    pub fn restore_state(&mut self, state: StateId) {
        restore_state(&mut self.ctx, state);
    }

    /// A promise for the machine address of the instruction at `ip`.
    pub fn machine_ip(&mut self, ip: u32) -> PromiseId {
        self.ctx.promises.push(Promise::Ip { logical_ip: ip })
    }

    /// Append `value` to the constant pool; the promise resolves to
    /// the pool slot's address.
    pub fn pool_append(&mut self, value: i64) -> PromiseId {
        let p = resolved(&mut self.ctx, value);
        self.pool_append_promise(p)
    }

    /// Append a deferred value to the constant pool.
    pub fn pool_append_promise(&mut self, value: PromiseId) -> PromiseId {
        let key = self.ctx.constants.len() as u32;
        let pool = self.ctx.promises.push(Promise::Pool { key });
        self.ctx.constants.push(value);
        pool
    }

    /// An operand holding a known constant.
    pub fn constant(&mut self, v: i64) -> ValueId {
        let p = resolved(&mut self.ctx, v);
        self.promise_constant(p)
    }

    /// An operand holding a deferred constant.
    pub fn promise_constant(&mut self, p: PromiseId) -> ValueId {
        let site = constant_site(&mut self.ctx, p);
        value(&mut self.ctx, Some(site), None)
    }

    /// An operand holding a deferred absolute address.
    pub fn address(&mut self, p: PromiseId) -> ValueId {
        let site = address_site(&mut self.ctx, p);
        value(&mut self.ctx, Some(site), None)
    }

    /// An operand designating `[base + displacement + index * scale]`.
    /// Appends the event that materializes the memory expression.
    pub fn memory(
        &mut self,
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u32,
    ) -> ValueId {
        let result = value(&mut self.ctx, None, None);
        crate::event::append_memory(&mut self.ctx, base, displacement, index, scale, result);
        result
    }

    /// The stack register as an operand.
    pub fn stack(&mut self) -> ValueId {
        let number = self.ctx.arch.stack();
        let site = register_site(&mut self.ctx, number, None);
        value(&mut self.ctx, Some(site), Some(site))
    }

    /// The thread register as an operand.
    pub fn thread(&mut self) -> ValueId {
        let number = self.ctx.arch.thread();
        let site = register_site(&mut self.ctx, number, None);
        value(&mut self.ctx, Some(site), Some(site))
    }

    /// The top-of-stack frame slot as an operand.
    pub fn stack_top(&mut self) -> ValueId {
        let top = self.ctx.stack.expect("stack_top on an empty stack");
        let slot = self.ctx.stack_slot(top);
        let site = frame_site(&mut self.ctx, slot);
        value(&mut self.ctx, Some(site), Some(site))
    }

    /// Push `v` onto the abstract stack.
    pub fn push(&mut self, size: u32, v: ValueId) {
        self.ctx.stack_push(size, v);
    }

    /// Pop the top of the abstract stack.
    pub fn pop(&mut self, size: u32) -> ValueId {
        self.ctx.stack_pop(size)
    }

    /// Acknowledge a word already pushed by emitted code: mint a value
    /// homed in the slot above the current top.
    pub fn pushed(&mut self) {
        let c = &mut self.ctx;
        let index = c.local_footprint + c.stack.map_or(0, |s| s.index + s.size);
        let v = value(c, None, None);
        append_frame_site(c, v, BYTES_PER_WORD, index);
        c.stack_push(BYTES_PER_WORD, v);
    }

    /// Acknowledge a word already popped by emitted code.
    pub fn popped(&mut self) {
        let top = self.ctx.stack.expect("popped on an empty stack");
        self.ctx.stack = top.next;
    }

    /// The top stack element, if any.
    pub fn top(&self) -> Option<&'a StackNode<'a>> {
        self.ctx.stack
    }

    /// The stack element `index` words below the top.
    pub fn peek(&self, size: u32, index: u32) -> ValueId {
        let mut node = self.ctx.stack.expect("peek on an empty stack");
        let mut i = index;
        while i > 0 {
            i -= node.size;
            node = node.next.expect("peek past the bottom of the stack");
        }
        assert_eq!(node.size, crate::assembler::ceiling(size, BYTES_PER_WORD));
        node.value
    }

    /// Initialize the local slot at `index` with a fresh value homed
    /// in its frame slot.
    pub fn init_local(&mut self, size: u32, index: u32) {
        let c = &mut self.ctx;
        assert!(index < c.local_footprint, "local index out of range");

        let v = value(c, None, None);
        log::debug!("init local {v:?} of size {size} at {index}");
        append_frame_site(c, v, size, index);

        c.locals[index as usize].set(Local {
            value: Some(v),
            size,
        });
    }

    /// Reinitialize every local that was live on entry to `ip`.
    pub fn init_locals_from_logical_ip(&mut self, ip: u32) {
        assert!(
            (ip as usize) < self.ctx.logical_code.len(),
            "logical ip out of range"
        );

        self.ctx.locals = self.ctx.fresh_locals();

        let e = self
            .ctx
            .logical(ip)
            .first_event
            .expect("instruction has no events");
        let template = self.ctx.events[e].locals_before;
        for i in 0..self.ctx.local_footprint {
            let local = template[i as usize].get();
            if local.value.is_some() {
                self.init_local(local.size, i);
            }
        }
    }

    /// Bind the local slot at `index` to `src`, versioning the locals
    /// array so earlier snapshots keep the old binding.
    pub fn store_local(&mut self, size: u32, src: ValueId, index: u32) {
        let c = &mut self.ctx;
        assert!(index < c.local_footprint, "local index out of range");

        c.locals = c.clone_locals();

        log::debug!("store local {src:?} of size {size} at {index}");

        c.locals[index as usize].set(Local {
            value: Some(src),
            size,
        });
    }

    /// The value bound to the local slot at `index`.
    pub fn load_local(&mut self, size: u32, index: u32) -> ValueId {
        let c = &self.ctx;
        assert!(index < c.local_footprint, "local index out of range");
        let local = c.locals[index as usize].get();
        let v = local.value.expect("load from an uninitialized local");
        assert_eq!(pad(local.size), pad(size), "local loaded at the wrong size");
        v
    }

    /// Array bounds check: `index` against the length word at
    /// `object + length_offset`, calling `handler` when out of range.
    pub fn check_bounds(&mut self, object: ValueId, length_offset: u32, index: ValueId, handler: i64) {
        append_bounds_check(&mut self.ctx, object, length_offset, index, handler);
    }

    /// Copy `src` into the operand designated by `dst`.
    pub fn store(&mut self, size: u32, src: ValueId, dst: ValueId) {
        append_move(&mut self.ctx, BinaryOperation::Move, size, src, size, dst);
    }

    /// Read the operand designated by `src`.
    pub fn load(&mut self, size: u32, src: ValueId) -> ValueId {
        let dst = value(&mut self.ctx, None, None);
        append_move(&mut self.ctx, BinaryOperation::Move, size, src, size, dst);
        dst
    }

    /// Read with zero extension.
    pub fn loadz(&mut self, size: u32, src: ValueId) -> ValueId {
        let dst = value(&mut self.ctx, None, None);
        append_move(&mut self.ctx, BinaryOperation::MoveZ, size, src, size, dst);
        dst
    }

    /// Read a 4-byte operand sign-extended to 8 bytes.
    pub fn load4_to_8(&mut self, src: ValueId) -> ValueId {
        let dst = value(&mut self.ctx, None, None);
        append_move(&mut self.ctx, BinaryOperation::Move, 4, src, 8, dst);
        dst
    }

    /// Three-way long comparison producing -1, 0, or 1.
    pub fn lcmp(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let result = value(&mut self.ctx, None, None);
        append_combine(
            &mut self.ctx,
            TernaryOperation::LongCompare,
            8,
            a,
            8,
            b,
            8,
            result,
        );
        result
    }

    /// Compare two operands, priming the condition consumed by the
    /// next branch.
    pub fn cmp(&mut self, size: u32, a: ValueId, b: ValueId) {
        append_compare(&mut self.ctx, size, a, b);
    }

    pub fn jl(&mut self, address: ValueId) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfLess, address);
    }

    pub fn jg(&mut self, address: ValueId) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfGreater, address);
    }

    pub fn jle(&mut self, address: ValueId) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfLessOrEqual, address);
    }

    pub fn jge(&mut self, address: ValueId) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfGreaterOrEqual, address);
    }

    pub fn je(&mut self, address: ValueId) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfEqual, address);
    }

    pub fn jne(&mut self, address: ValueId) {
        append_branch(&mut self.ctx, UnaryOperation::JumpIfNotEqual, address);
    }

    pub fn jmp(&mut self, address: ValueId) {
        append_branch(&mut self.ctx, UnaryOperation::Jump, address);
    }

    pub fn add(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Add, size, size, a, b)
    }

    pub fn sub(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Subtract, size, size, a, b)
    }

    pub fn mul(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Multiply, size, size, a, b)
    }

    pub fn div(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Divide, size, size, a, b)
    }

    pub fn rem(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Remainder, size, size, a, b)
    }

    // Shift counts are planned at word size regardless of the nominal
    // operation size.
    pub fn shl(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::ShiftLeft, BYTES_PER_WORD, size, a, b)
    }

    pub fn shr(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::ShiftRight, BYTES_PER_WORD, size, a, b)
    }

    pub fn ushr(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(
            TernaryOperation::UnsignedShiftRight,
            BYTES_PER_WORD,
            size,
            a,
            b,
        )
    }

    pub fn and(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::And, size, size, a, b)
    }

    pub fn or(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Or, size, size, a, b)
    }

    pub fn xor(&mut self, size: u32, a: ValueId, b: ValueId) -> ValueId {
        self.combine(TernaryOperation::Xor, size, size, a, b)
    }

    fn combine(
        &mut self,
        op: TernaryOperation,
        first_size: u32,
        size: u32,
        a: ValueId,
        b: ValueId,
    ) -> ValueId {
        let result = value(&mut self.ctx, None, None);
        append_combine(&mut self.ctx, op, first_size, a, size, b, size, result);
        result
    }

    /// Arithmetic negation.
    pub fn neg(&mut self, size: u32, a: ValueId) -> ValueId {
        let result = value(&mut self.ctx, None, None);
        append_translate(&mut self.ctx, BinaryOperation::Negate, size, a, result);
        result
    }

    /// Call `address` with register-and-frame argument placement.
    /// Arguments are `(value, size_in_bytes)` pairs in source order.
    pub fn call(
        &mut self,
        address: ValueId,
        flags: u32,
        trace: Option<&'a dyn TraceHandler>,
        result_size: u32,
        arguments: &[(ValueId, u32)],
    ) -> ValueId {
        let c = &mut self.ctx;

        let old_stack = c.stack;
        for &(v, size) in arguments.iter().rev() {
            c.stack_push(size, v);
        }
        let argument_stack = c.stack;
        c.stack = old_stack;

        let result = value(c, None, None);
        append_call(
            c,
            address,
            flags,
            trace,
            result,
            result_size,
            argument_stack,
            arguments.len() as u32,
            0,
        );
        result
    }

    /// Call `address` passing the top `argument_footprint` stack words
    /// in the outgoing argument area.
    pub fn stack_call(
        &mut self,
        address: ValueId,
        flags: u32,
        trace: Option<&'a dyn TraceHandler>,
        result_size: u32,
        argument_footprint: u32,
    ) -> ValueId {
        let c = &mut self.ctx;
        let result = value(c, None, None);
        let stack = c.stack;
        append_call(
            c,
            address,
            flags,
            trace,
            result,
            result_size,
            stack,
            0,
            argument_footprint,
        );
        result
    }

    /// Pop the frame and return `v`, if any.
    pub fn return_(&mut self, size: u32, v: Option<ValueId>) {
        append_return(&mut self.ctx, size, v);
    }

    /// Run pass 2. Returns the machine code size in bytes.
    pub fn compile(&mut self) -> u32 {
        let size = compile_pass(&mut self.ctx, &mut self.assembler);
        self.ctx.machine_code_size = size;
        size
    }

    /// Size of the appended constant pool in bytes.
    pub fn pool_size(&self) -> u32 {
        self.ctx.constants.len() as u32 * BYTES_PER_WORD
    }

    /// Write machine code plus the word-aligned constant pool into
    /// `dst`, resolving every promise against the buffer address.
    pub fn write_to(&mut self, dst: &mut [u8]) -> Result<(), EmitError> {
        if !self.ctx.compiled {
            return Err(EmitError::NotCompiled);
        }

        let needed = pad(self.ctx.machine_code_size) as usize + self.pool_size() as usize;
        if dst.len() < needed {
            return Err(EmitError::BufferTooSmall {
                needed,
                available: dst.len(),
            });
        }

        self.ctx.machine_code = Some(dst.as_ptr() as usize);

        let Self { ctx, assembler } = self;
        assembler.write_to(&*ctx, dst);

        let base = pad(ctx.machine_code_size) as usize;
        for (i, &constant) in ctx.constants.iter().enumerate() {
            let v = ctx.promise_value(constant);
            let at = base + i * BYTES_PER_WORD as usize;
            dst[at..at + BYTES_PER_WORD as usize].copy_from_slice(&v.to_le_bytes());
        }

        Ok(())
    }

    /// The promise resolver for this compilation, usable once code has
    /// been written.
    pub fn resolver(&self) -> &dyn PromiseResolver {
        &self.ctx
    }

    /// The underlying assembler.
    pub fn assembler(&self) -> &A {
        &self.assembler
    }

    /// Consume the compiler, keeping the assembler.
    pub fn into_assembler(self) -> A {
        self.assembler
    }
}
