//! VM parameters

/// Sentinel for an absent `u32` id (finished fiber pc, cleared type id).
pub const NULL_U32: u32 = u32::MAX;

/// Sentinel for an absent `u8` (field offset misses).
pub const NULL_U8: u8 = u8::MAX;

/// Number of frame-header slots preceding the arguments of a call window:
/// `[retVal, retInfo, retPc, retFp]`.
pub const CALL_ARG_START: usize = 4;

/// Length of the `Call` instruction, recorded in `retInfo` so unwinding can
/// locate the call site from a return address.
pub const CALL_INST_LEN: u8 = 4;

/// Length of `CallSym` and its IC variants, including the reserved cache bytes.
pub const CALL_SYM_INST_LEN: u8 = 12;

/// Length of `CallObjSym` and its IC variants, including the reserved cache
/// bytes.
pub const CALL_OBJ_SYM_INST_LEN: u8 = 16;

/// Register count of a fiber stack unless the embedder asks otherwise.
pub const DEFAULT_STACK_SIZE: usize = 1024;

/// Default live-object budget of the heap. Exhaustion surfaces as
/// [`crate::error::VmError::OutOfMemory`].
pub const DEFAULT_HEAP_BUDGET: usize = 64 * 1024;

/// Static strings keep their length in a 15-bit window of the value word.
pub const MAX_STATIC_STRING_LEN: usize = (1 << 15) - 1;

/// Closures with more captures than this take the external allocation path.
pub const CLOSURE_POOL_CAPTURES: usize = 2;
