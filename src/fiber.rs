//! Fiber state records.
//!
//! Exactly one fiber is current at any instant; the current fiber's state
//! lives directly on the VM. A `Fiber` record stores the suspended form:
//! the register stack, the saved pc offset (or [`crate::consts::NULL_U32`]
//! once finished), the resume-chain parent, and the fiber's own try-frame
//! stack and panic state. The main fiber's record is VM-resident and is
//! never heap-allocated.

use crate::error::Panic;
use crate::value::Value;

/// A try frame pushed by `PushTry` and consumed by `PopTry` or `Throw`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryFrame {
    /// Frame base of the function that pushed the handler.
    pub fp: u32,
    /// Absolute pc of the handler.
    pub catch_pc: u32,
    /// Register receiving the thrown error, relative to `fp`.
    pub catch_err_dst: u8,
}

/// Suspended execution state of one fiber.
#[derive(Debug, Default)]
pub struct Fiber {
    /// The fiber's register stack.
    pub stack: Vec<Value>,
    /// Saved frame base.
    pub fp: u32,
    /// Saved pc offset; `NULL_U32` marks a finished fiber.
    pub pc_offset: u32,
    /// Fiber to switch back to on yield/return: `NONE` for the main fiber.
    /// Non-owning; only set while this fiber is current.
    pub parent: Value,
    /// Register in the parent's frame that receives the next yielded or
    /// returned value. Recorded at resume time.
    pub parent_dst_local: u8,
    /// The fiber's own try-frame stack.
    pub try_stack: Vec<TryFrame>,
    /// The fiber's own panic state.
    pub panic: Panic,
}

impl Fiber {
    /// `true` once the fiber has run to `Coreturn`.
    pub fn is_finished(&self) -> bool {
        self.pc_offset == crate::consts::NULL_U32
    }
}
