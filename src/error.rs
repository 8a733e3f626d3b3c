//! Runtime interpreter error implementation

use thiserror::Error;

/// Terminal result codes of the execution loop.
///
/// A successful run is `Ok(())`; every variant here aborts the loop and is
/// reported to the embedder. `Panic` carries no payload by itself — the
/// panic state lives on the fiber that raised it and can be inspected
/// through [`crate::interpreter::Vm::panic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum VmError {
    /// A domain violation was detected and the current fiber's try-stack
    /// could not absorb it. The fiber carries the panic payload.
    #[error("execution panicked")]
    Panic,
    /// A call frame did not fit in the fiber's register stack. Bypasses
    /// try/catch; out-of-resource is not a recoverable in-language
    /// condition.
    #[error("stack overflow")]
    StackOverflow,
    /// The heap's live-object budget is exhausted. Bypasses try/catch.
    #[error("out of memory")]
    OutOfMemory,
    /// The instruction stream reached a state the interpreter cannot
    /// attribute to a well-formed program.
    #[error("unknown execution error")]
    Unknown,
}

/// Per-fiber panic state.
///
/// Static messages are cheap (`&'static str`, no allocation); formatted
/// messages own their buffer. A formatted message that itself fails to
/// allocate degrades to `InflightOom`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Panic {
    /// No panic is pending.
    #[default]
    None,
    /// A static message literal.
    StaticMsg(&'static str),
    /// An owned, formatted message.
    Msg(String),
    /// A formatted panic could not allocate its message.
    InflightOom,
}

impl Panic {
    /// The pending message, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Panic::None => None,
            Panic::StaticMsg(msg) => Some(msg),
            Panic::Msg(msg) => Some(msg),
            Panic::InflightOom => Some("out of memory while panicking"),
        }
    }

    /// Whether a panic is pending.
    pub fn is_set(&self) -> bool {
        !matches!(self, Panic::None)
    }
}

/// Static panic messages shared by the dispatch loop.
pub(crate) mod msg {
    pub const EXPECTED_NUMBER: &str = "Expected number operand.";
    pub const FIELD_MISSING: &str = "Field not found in value.";
    pub const NOT_AN_ERROR: &str = "Not an error.";
    pub const UNCAUGHT_ERROR: &str = "Uncaught error.";
    pub const NOT_A_FUNCTION: &str = "Not a function.";
    pub const INDEX_OUT_OF_BOUNDS: &str = "Index out of bounds.";
    pub const UNSUPPORTED_INDEX: &str = "Unsupported index operation.";
    pub const UNSUPPORTED_SLICE: &str = "Unsupported slice operation.";
}
