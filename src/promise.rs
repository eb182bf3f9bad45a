//! Deferred integers.
//!
//! A promise stands for an integer whose value depends on something
//! known only later, usually the address of the code buffer. Constant
//! operands, pool entries, and branch targets all carry promises; the
//! writer resolves them after `write_to` has fixed the base address.

use cranelift_entity::entity_impl;

/// Index of a promise in the context pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(u32);
entity_impl!(PromiseId, "promise");

/// A deferred integer value.
#[derive(Debug, Clone, Copy)]
pub enum Promise {
    /// Known up front.
    Resolved { value: i64 },
    /// Address of the `key`-th constant pool slot, past the padded
    /// machine code.
    Pool { key: u32 },
    /// Address of a byte offset inside the emitted code. The offset is
    /// filled in while the owning event compiles.
    Code { offset: Option<u32> },
    /// Address of the first machine instruction of a logical
    /// instruction.
    Ip { logical_ip: u32 },
}

/// Resolves promises to concrete integers.
///
/// The compiler context implements this; the assembler consumes it
/// when writing out code.
pub trait PromiseResolver {
    /// The promise's value. Aborts the compilation if it is requested
    /// before resolution.
    fn promise_value(&self, promise: PromiseId) -> i64;

    /// Whether the promise can be read yet.
    fn promise_resolved(&self, promise: PromiseId) -> bool;
}
