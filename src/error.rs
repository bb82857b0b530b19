use thiserror::Error;

/// Errors surfaced by the interpreter and the runtime API.
///
/// Every instruction step returns `Result<(), VmError>`; errors bubble out of
/// [`crate::Runtime::execute`] unchanged. The runtime itself never aborts:
/// even allocation failure is reported here and is recoverable by the caller.
#[derive(Debug, Error)]
pub enum VmError {
    /// An operand had the wrong type for the attempted operation.
    #[error("type mismatch in {op}: {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },

    /// Integer division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// Array access outside the live range.
    #[error("index {index} out of range (length {length})")]
    OutOfBounds { index: i64, length: u32 },

    /// GET_GLOBAL past the globals vector's current extent.
    #[error("undefined global {0}")]
    UndefinedGlobal(usize),

    /// Call depth exceeded the configured limit.
    #[error("stack overflow: call depth {0} exceeded")]
    StackOverflow(usize),

    /// Robustness net for corrupted instruction streams.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// The allocator returned null. The caller decides whether to retry
    /// after a collection or to give up.
    #[error("allocation of {0} bytes failed")]
    AllocationFailure(usize),

    /// Attempt to call a value that is neither a function nor a callable.
    #[error("attempt to call a {0} value")]
    NotCallable(&'static str),

    /// A function id with no registry entry.
    #[error("unknown function id {0}")]
    UnknownFunction(u32),

    /// Jump target or register index outside the frame.
    #[error("instruction operand out of range at pc {pc}")]
    MalformedInstruction { pc: usize },
}
