//! Crate-wide error type.
//!
//! One variant per error kind named in the back end's error handling
//! design: the first three are recoverable at the driver level (the
//! failing function is simply not committed), the last two propagate
//! fatally out of [`crate::driver::JitDriver::make_executable`].

use std::fmt;

/// Errors produced by the JIT back end.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// An IR opcode outside the enumerated instruction set.
    #[error("unsupported opcode {opcode:?} at IR index {index}")]
    UnsupportedOpCode {
        /// Human-readable rendering of the offending opcode.
        opcode: String,
        /// Index of the instruction within the function's IR stream.
        index: usize,
    },

    /// An operand combination that is statically impossible given
    /// well-typed IR, or a programmer error such as `mov reg,[abs64]`
    /// targeting a register other than `RAX`.
    #[error("invalid operand: {0}")]
    InvalidOperand(String),

    /// A function references a virtual register unknown within its own
    /// body.
    #[error("function {function:?} references unknown virtual register v{vreg}")]
    InvalidFunction {
        /// Name of the function being compiled.
        function: String,
        /// Index of the offending virtual register.
        vreg: usize,
    },

    /// A call site's callee still has a null entry point at
    /// finalisation time.
    #[error("unresolved symbol {name:?}")]
    UnresolvedSymbol {
        /// Name of the unresolved callee.
        name: String,
    },

    /// The OS refused a memory-protection change.
    #[error("failed to change memory protection: {0}")]
    MemoryProtectionFailed(OsErrorCode),

    /// A back end bug, e.g. `idiv` encoded with a non-RAX destination.
    /// Must never be suppressed: it indicates the encoder was asked to
    /// do something the typed facade should have made unreachable.
    #[error("internal encoder invariant violated at {location}: {detail}")]
    InternalEncoderInvariant {
        /// Source location (module/function) that detected the bug.
        location: &'static str,
        /// Description of the violated invariant.
        detail: String,
    },
}

/// Opaque OS error code, printed as returned by `GetLastError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsErrorCode(pub u32);

impl fmt::Display for OsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, JitError>;
