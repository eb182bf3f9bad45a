//! Caller-visible errors.
//!
//! Invariant violations inside a compilation abort with a diagnostic;
//! only the machine-code writer has a recoverable failure surface.

use thiserror::Error;

/// Errors reported by [`crate::Compiler::write_to`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("code buffer too small: need {needed} bytes, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("compile() must run before machine code can be written")]
    NotCompiled,
}
