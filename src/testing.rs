//! Test support: a reference architecture, a recording assembler, and
//! a straight-line interpreter.
//!
//! The recording assembler captures the operation stream instead of
//! encoding bytes, so tests can assert on exactly what the back-end
//! decided to emit. The interpreter executes recorded straight-line
//! code (moves, arithmetic, swaps) over a small register file and a
//! sparse memory, which lets arithmetic scenarios check final results
//! rather than instruction shapes.

use std::collections::HashMap;

use crate::assembler::{
    Architecture, Assembler, AssemblerBlock, AssemblerClient, BinaryOperation, BinaryPlan,
    Client, Operand, OperandMask, OperandType, Operation, TernaryOperation, TernaryPlan,
    UnaryOperation, ANY_REGISTERS,
};
use crate::promise::PromiseResolver;

/// Register numbers of the reference architecture.
pub const REG_RETURN_LOW: u8 = 0;
pub const REG_ARG0: u8 = 1;
pub const REG_ARG1: u8 = 2;
pub const REG_RETURN_HIGH: u8 = 3;
pub const REG_STACK: u8 = 6;
pub const REG_THREAD: u8 = 7;

/// An eight-register architecture with two argument registers and a
/// reserved stack/thread pair. Generous operand plans keep most sites
/// legal; combines want their second operand in a register.
pub struct TestArch {
    pub condensed: bool,
    /// Report `Remainder` as unsupported so the thunk rewrite can be
    /// exercised.
    pub remainder_thunk: bool,
}

impl TestArch {
    pub fn new() -> Self {
        Self {
            condensed: false,
            remainder_thunk: false,
        }
    }

    pub fn condensed() -> Self {
        Self {
            condensed: true,
            remainder_thunk: false,
        }
    }

    pub fn with_remainder_thunk() -> Self {
        Self {
            condensed: false,
            remainder_thunk: true,
        }
    }
}

impl Default for TestArch {
    fn default() -> Self {
        Self::new()
    }
}

impl Architecture for TestArch {
    fn register_count(&self) -> u32 {
        8
    }

    fn reserved(&self, number: u8) -> bool {
        number == REG_STACK || number == REG_THREAD
    }

    fn argument_register_count(&self) -> u32 {
        2
    }

    fn argument_register(&self, index: u32) -> u8 {
        match index {
            0 => REG_ARG0,
            1 => REG_ARG1,
            _ => unreachable!("argument register {index} out of range"),
        }
    }

    fn stack(&self) -> u8 {
        REG_STACK
    }

    fn thread(&self) -> u8 {
        REG_THREAD
    }

    fn return_low(&self) -> u8 {
        REG_RETURN_LOW
    }

    fn return_high(&self) -> u8 {
        REG_RETURN_HIGH
    }

    fn frame_header_size(&self) -> u32 {
        2
    }

    fn frame_footer_size(&self) -> u32 {
        1
    }

    fn condensed_addressing(&self) -> bool {
        self.condensed
    }

    fn plan_binary(&self, op: BinaryOperation, _first_size: u32, _second_size: u32) -> BinaryPlan {
        let loose = OperandType::Constant.bit()
            | OperandType::Register.bit()
            | OperandType::Memory.bit()
            | OperandType::Address.bit();
        let writable = OperandType::Register.bit() | OperandType::Memory.bit();
        match op {
            BinaryOperation::Move | BinaryOperation::MoveZ => BinaryPlan {
                first: OperandMask {
                    types: loose,
                    registers: ANY_REGISTERS,
                },
                second: OperandMask {
                    types: writable,
                    registers: ANY_REGISTERS,
                },
                thunk: false,
            },
            BinaryOperation::Compare => BinaryPlan {
                first: OperandMask::any(),
                second: OperandMask::any(),
                thunk: false,
            },
            BinaryOperation::Negate | BinaryOperation::Swap => BinaryPlan {
                first: OperandMask {
                    types: OperandType::Register.bit(),
                    registers: ANY_REGISTERS,
                },
                second: OperandMask {
                    types: OperandType::Register.bit(),
                    registers: ANY_REGISTERS,
                },
                thunk: false,
            },
        }
    }

    fn plan_ternary(
        &self,
        op: TernaryOperation,
        _first_size: u32,
        _second_size: u32,
        _result_size: u32,
    ) -> TernaryPlan {
        TernaryPlan {
            first: OperandMask {
                types: OperandType::Register.bit() | OperandType::Constant.bit(),
                registers: ANY_REGISTERS,
            },
            second: OperandMask {
                types: OperandType::Register.bit(),
                registers: ANY_REGISTERS,
            },
            result: OperandMask {
                types: OperandType::Register.bit(),
                registers: ANY_REGISTERS,
            },
            thunk: op == TernaryOperation::Remainder && self.remainder_thunk,
        }
    }
}

/// A client whose thunk addresses encode the operation, so tests can
/// recognize which thunk a call targets.
pub struct NullClient;

/// Base of the synthetic thunk address space.
pub const THUNK_BASE: i64 = 0x7000_0000;

impl Client for NullClient {
    fn thunk(&self, op: TernaryOperation, _result_size: u32) -> i64 {
        THUNK_BASE + op as i64
    }
}

/// One recorded assembler operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    FrameAllocated(u32),
    FramePopped,
    Op0(Operation),
    Op1(UnaryOperation, u32, Operand),
    Op2(BinaryOperation, u32, Operand, u32, Operand),
    Op3(TernaryOperation, u32, Operand, u32, Operand, u32, Operand),
}

/// Records the operation stream; every operation occupies four bytes
/// of pretend code so offsets and block spans stay meaningful.
pub struct RecordingAssembler {
    pub emitted: Vec<Emitted>,
    blocks: Vec<(usize, usize)>,
    open_block_start: usize,
}

const BYTES_PER_OP: u32 = 4;

impl RecordingAssembler {
    pub fn new() -> Self {
        Self {
            emitted: Vec::new(),
            blocks: Vec::new(),
            open_block_start: 0,
        }
    }

    /// Operations recorded for the given block.
    pub fn block_ops(&self, block: AssemblerBlock) -> &[Emitted] {
        let (start, end) = self.blocks[block.0 as usize];
        &self.emitted[start..end]
    }

    /// Number of blocks closed so far.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn count_binary(&self, op: BinaryOperation) -> usize {
        self.emitted
            .iter()
            .filter(|e| matches!(e, Emitted::Op2(o, ..) if *o == op))
            .count()
    }

    pub fn count_unary(&self, op: UnaryOperation) -> usize {
        self.emitted
            .iter()
            .filter(|e| matches!(e, Emitted::Op1(o, ..) if *o == op))
            .count()
    }

    /// Destinations of every `Move` whose source is a constant.
    pub fn constant_move_destinations(&self) -> Vec<Operand> {
        self.emitted
            .iter()
            .filter_map(|e| match e {
                Emitted::Op2(BinaryOperation::Move, _, Operand::Constant(_), _, dst) => Some(*dst),
                _ => None,
            })
            .collect()
    }
}

impl Default for RecordingAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler for RecordingAssembler {
    fn allocate_frame(&mut self, aligned_frame_size: u32) {
        self.emitted.push(Emitted::FrameAllocated(aligned_frame_size));
    }

    fn pop_frame(&mut self) {
        self.emitted.push(Emitted::FramePopped);
    }

    fn apply0(&mut self, op: Operation) {
        self.emitted.push(Emitted::Op0(op));
    }

    fn apply1(&mut self, _client: &mut dyn AssemblerClient, op: UnaryOperation, size: u32, a: Operand) {
        self.emitted.push(Emitted::Op1(op, size, a));
    }

    fn apply2(
        &mut self,
        _client: &mut dyn AssemblerClient,
        op: BinaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
    ) {
        self.emitted.push(Emitted::Op2(op, a_size, a, b_size, b));
    }

    fn apply3(
        &mut self,
        _client: &mut dyn AssemblerClient,
        op: TernaryOperation,
        a_size: u32,
        a: Operand,
        b_size: u32,
        b: Operand,
        c_size: u32,
        c: Operand,
    ) {
        self.emitted.push(Emitted::Op3(op, a_size, a, b_size, b, c_size, c));
    }

    fn offset(&self) -> u32 {
        self.emitted.len() as u32 * BYTES_PER_OP
    }

    fn end_block(&mut self, _has_following: bool) -> AssemblerBlock {
        let block = AssemblerBlock(self.blocks.len() as u32);
        self.blocks.push((self.open_block_start, self.emitted.len()));
        self.open_block_start = self.emitted.len();
        block
    }

    fn resolve_block(
        &mut self,
        block: AssemblerBlock,
        start: u32,
        _next: Option<AssemblerBlock>,
    ) -> u32 {
        let (s, e) = self.blocks[block.0 as usize];
        start + (e - s) as u32 * BYTES_PER_OP
    }

    fn write_to(&mut self, resolver: &dyn PromiseResolver, dst: &mut [u8]) {
        for (i, op) in self.emitted.iter().enumerate() {
            // Resolve embedded promises the way a real encoder would.
            match op {
                Emitted::Op1(_, _, Operand::Constant(p) | Operand::Address(p)) => {
                    let _ = resolver.promise_value(*p);
                }
                Emitted::Op2(_, _, Operand::Constant(p) | Operand::Address(p), _, _) => {
                    let _ = resolver.promise_value(*p);
                }
                _ => {}
            }
            dst[i * BYTES_PER_OP as usize] = tag(op);
        }
    }
}

fn tag(op: &Emitted) -> u8 {
    match op {
        Emitted::FrameAllocated(_) => 1,
        Emitted::FramePopped => 2,
        Emitted::Op0(_) => 3,
        Emitted::Op1(..) => 4,
        Emitted::Op2(..) => 5,
        Emitted::Op3(..) => 6,
    }
}

/// Interpreter state for recorded straight-line code.
pub struct Machine {
    pub regs: [i64; 8],
    pub memory: HashMap<i64, i64>,
    /// Condition from the last compare: first operand minus second.
    /// A conditional such as `JumpIfLess` is taken when it is negative.
    pub condition: i64,
}

/// Synthetic frame base loaded into the stack register.
pub const STACK_BASE: i64 = 0x10_0000;

impl Machine {
    pub fn new() -> Self {
        let mut regs = [0; 8];
        regs[REG_STACK as usize] = STACK_BASE;
        Self {
            regs,
            memory: HashMap::new(),
            condition: 0,
        }
    }

    fn address(&self, base: u8, offset: i32, index: Option<u8>, scale: u32) -> i64 {
        let mut addr = self.regs[base as usize] + offset as i64;
        if let Some(ix) = index {
            addr += self.regs[ix as usize] * scale as i64;
        }
        addr
    }

    fn read(&self, resolver: &dyn PromiseResolver, operand: Operand) -> i64 {
        match operand {
            Operand::Constant(p) | Operand::Address(p) => resolver.promise_value(p),
            Operand::Register { low, .. } => self.regs[low as usize],
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => *self
                .memory
                .get(&self.address(base, offset, index, scale))
                .unwrap_or(&0),
        }
    }

    fn write(&mut self, operand: Operand, value: i64) {
        match operand {
            Operand::Register { low, .. } => self.regs[low as usize] = value,
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => {
                let addr = self.address(base, offset, index, scale);
                self.memory.insert(addr, value);
            }
            _ => panic!("write to a read-only operand"),
        }
    }

    /// Execute recorded straight-line code until the end or a Return.
    pub fn run(&mut self, code: &[Emitted], resolver: &dyn PromiseResolver) {
        for op in code {
            match *op {
                Emitted::FrameAllocated(_) | Emitted::FramePopped => {}
                Emitted::Op0(Operation::Return) => return,
                Emitted::Op1(op, ..) => panic!("straight-line interpreter hit {op:?}"),
                Emitted::Op2(op, a_size, a, _b_size, b) => match op {
                    BinaryOperation::Move => {
                        let v = self.read(resolver, a);
                        self.write(b, v);
                    }
                    BinaryOperation::MoveZ => {
                        let mask = if a_size >= 8 {
                            -1i64
                        } else {
                            (1i64 << (a_size * 8)) - 1
                        };
                        let v = self.read(resolver, a) & mask;
                        self.write(b, v);
                    }
                    BinaryOperation::Compare => {
                        self.condition =
                            self.read(resolver, a).wrapping_sub(self.read(resolver, b));
                    }
                    BinaryOperation::Negate => {
                        let v = self.read(resolver, a);
                        self.write(b, v.wrapping_neg());
                    }
                    BinaryOperation::Swap => {
                        let av = self.read(resolver, a);
                        let bv = self.read(resolver, b);
                        self.write(a, bv);
                        self.write(b, av);
                    }
                },
                Emitted::Op3(op, _, a, _, b, _, t) => {
                    let first = self.read(resolver, a);
                    let second = self.read(resolver, b);
                    // Two-address convention: the result is the second
                    // operand combined with the first.
                    let result = match op {
                        TernaryOperation::Add => second.wrapping_add(first),
                        TernaryOperation::Subtract => second.wrapping_sub(first),
                        TernaryOperation::Multiply => second.wrapping_mul(first),
                        TernaryOperation::Divide => second / first,
                        TernaryOperation::Remainder => second % first,
                        TernaryOperation::ShiftLeft => second << (first & 63),
                        TernaryOperation::ShiftRight => second >> (first & 63),
                        TernaryOperation::UnsignedShiftRight => {
                            ((second as u64) >> (first & 63)) as i64
                        }
                        TernaryOperation::And => second & first,
                        TernaryOperation::Or => second | first,
                        TernaryOperation::Xor => second ^ first,
                        TernaryOperation::LongCompare => match second.cmp(&first) {
                            std::cmp::Ordering::Less => -1,
                            std::cmp::Ordering::Equal => 0,
                            std::cmp::Ordering::Greater => 1,
                        },
                    };
                    self.write(t, result);
                }
            }
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
