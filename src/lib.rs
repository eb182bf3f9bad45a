//! kiln - an event-graph JIT back-end.
//!
//! kiln lowers a linear stream of machine-independent three-address
//! operations over abstract values into native code through a
//! pluggable assembler. Values may occupy several sites (constant,
//! address, register, memory) at once; every use carries an
//! addressing-mode constraint, and a cost-driven selector decides
//! where each value lives at each program point. Register pressure is
//! handled on the fly with spills to frame slots, and a junction
//! resolver reconciles operand locations across control-flow joins so
//! every path agrees on where live values reside.
//!
//! # Driving the compiler
//!
//! ```ignore
//! use bumpalo::Bump;
//! use kiln::Compiler;
//!
//! let arena = Bump::new();
//! let mut c = Compiler::new(&arena, &arch, assembler, &client);
//! c.init(code_length, parameter_footprint, local_footprint, frame_size);
//! c.start_logical_ip(0);
//! let sum = c.add(8, c.constant(1), c.constant(2));
//! c.return_(8, Some(sum));
//! let size = c.compile();
//! ```
//!
//! # Modules
//!
//! - [`compiler`] - the builder facade an IR producer drives
//! - [`event`] - the scheduled IR nodes and their emission rules
//! - [`site`], [`read`], [`value`] - the operand placement model
//! - [`regalloc`], [`frame`] - register and frame-slot allocators
//! - [`junction`], [`state`], [`emit`] - joins, snapshots, and pass 2
//! - [`assembler`] - the traits the machine layer implements
//! - [`testing`] - a reference architecture, recording assembler, and
//!   straight-line interpreter for tests

pub mod assembler;
pub mod compiler;
pub mod context;
pub mod emit;
pub mod error;
pub mod event;
pub mod frame;
pub mod junction;
pub mod promise;
pub mod read;
pub mod regalloc;
pub mod site;
pub mod state;
pub mod testing;
pub mod value;

pub use assembler::{
    Architecture, Assembler, AssemblerBlock, AssemblerClient, BinaryOperation, BinaryPlan,
    Client, Operand, OperandMask, OperandType, Operation, TernaryOperation, TernaryPlan,
    TraceHandler, UnaryOperation, BYTES_PER_WORD,
};
pub use compiler::Compiler;
pub use context::{StateId, ValueId};
pub use error::EmitError;
pub use event::CALL_ALIGNED;
pub use promise::{PromiseId, PromiseResolver};
pub use read::FrameIndex;
