//! [`Vm`] implementation.

use crate::bytecode;
use crate::error::{Panic, VmError};
use crate::fiber::{Fiber, TryFrame};
use crate::heap::Heap;
use crate::symbols::{
    FieldSymbolMap, FuncSig, FuncSymbol, MethodEntry, MethodSym, NameId, ResolvedSym, SemaTypeId,
    StaticVar, TypeId, VmType,
};
use crate::value::Value;

use hashbrown::HashMap;

mod constructors;
mod executor;
mod fibers;
mod fields;
mod flow;
mod ops;

/// Argument window of a native call: a live span of the current fiber's
/// register stack.
#[derive(Debug, Clone, Copy)]
pub struct ArgSpan {
    pub base: u32,
    pub len: u8,
}

/// Dispatch counters. The inline-cache hit counts are what the cache tests
/// observe; the heap keeps its own retain/release accounting.
#[derive(Debug, Default, Clone, Copy)]
pub struct VmStats {
    pub field_ic_hits: u64,
    pub call_ic_hits: u64,
    pub deopts: u64,
}

/// The virtual machine: program tables, heap, and the execution state of
/// the current fiber.
///
/// Single-threaded by design; fibers are the only concurrency and switch
/// only at the cooperative suspension opcodes.
#[derive(Debug)]
pub struct Vm {
    // Program handoff. `ops` is self-modified by the inline caches of the
    // executing fiber only.
    pub(crate) ops: Vec<u8>,
    pub(crate) consts: Vec<Value>,
    pub(crate) str_buf: Vec<u8>,
    pub(crate) field_syms: Vec<FieldSymbolMap>,
    pub(crate) field_table: HashMap<(TypeId, u32), u8>,
    pub(crate) func_syms: Vec<FuncSymbol>,
    pub(crate) func_sigs: Vec<FuncSig>,
    pub(crate) method_syms: Vec<MethodSym>,
    pub(crate) method_entries: Vec<MethodEntry>,
    pub(crate) method_table: HashMap<(TypeId, u32), u32>,
    pub(crate) types: Vec<VmType>,
    pub(crate) resolved_syms: Vec<ResolvedSym>,
    pub(crate) names: Vec<String>,
    pub(crate) var_syms: Vec<StaticVar>,

    pub(crate) heap: Heap,

    // Execution state of the current fiber. `pc` and `fp` shadow locals of
    // the dispatch loop and are written back on every escape.
    pub(crate) stack: Vec<Value>,
    pub(crate) fp: usize,
    pub(crate) pc: usize,
    pub(crate) try_stack: Vec<TryFrame>,
    pub(crate) panic: Panic,

    /// Storage for the main fiber while a coroutine runs.
    pub(crate) main_fiber: Fiber,
    /// Pointer value of the current fiber; `NONE` while the main fiber
    /// runs.
    pub(crate) cur_fiber: Value,

    pub(crate) end_local: u8,
    pub(crate) stats: VmStats,
}

impl Vm {
    /// The current fiber's register stack.
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// A register of the current frame.
    pub fn register(&self, i: u8) -> Value {
        self.stack[self.fp + i as usize]
    }

    /// The instruction stream, inline-cache mutations included.
    pub fn ops(&self) -> &[u8] {
        &self.ops
    }

    /// Current pc offset.
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Move the pc for the next [`Vm::run`]; embedders use this to re-enter
    /// a program at a chosen offset.
    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    /// Current frame base.
    pub fn fp(&self) -> usize {
        self.fp
    }

    /// Heap handle, for embedder diagnostics and tests.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap handle; native functions allocate through this.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Dispatch counters.
    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    /// Pending panic of the current fiber.
    pub fn panic(&self) -> &Panic {
        &self.panic
    }

    /// Take the pending panic, clearing it.
    pub fn take_panic(&mut self) -> Panic {
        core::mem::take(&mut self.panic)
    }

    /// The register named by the last executed `End`.
    pub fn result(&self) -> Value {
        self.stack[self.fp + self.end_local as usize]
    }

    /// Increment a value's refcount.
    pub fn retain(&mut self, val: Value) {
        self.heap.retain(val);
    }

    /// Decrement a value's refcount, freeing at zero.
    pub fn release(&mut self, val: Value) {
        self.heap.release(val);
    }

    /// The argument values of a native call.
    pub fn args(&self, span: ArgSpan) -> &[Value] {
        &self.stack[span.base as usize..span.base as usize + span.len as usize]
    }

    /// Runtime type id of a value.
    pub fn type_id_of(&self, val: Value) -> TypeId {
        self.heap.type_id_of(val)
    }

    /// Set a static panic message on the current fiber.
    pub(crate) fn panic_static(&mut self, msg: &'static str) {
        tracing::debug!(msg, "panic");
        self.panic = Panic::StaticMsg(msg);
    }

    /// Set a formatted panic message on the current fiber.
    pub(crate) fn panic_msg(&mut self, msg: String) {
        tracing::debug!(msg = msg.as_str(), "panic");
        self.panic = Panic::Msg(msg);
    }

    /// Interned name text.
    pub(crate) fn name(&self, id: NameId) -> &str {
        &self.names[id as usize]
    }

    /// Name of a resolved sema symbol.
    pub(crate) fn sema_sym_name(&self, id: SemaTypeId) -> &str {
        self.name(self.resolved_syms[id as usize].name_id)
    }

    /// Name of a runtime type.
    pub(crate) fn type_name(&self, id: TypeId) -> &str {
        &self.types[id as usize].name
    }

    /// Bytes of a static string value.
    pub(crate) fn static_string_bytes(&self, val: Value) -> &[u8] {
        let (start, len) = val.static_string_slice();
        &self.str_buf[start as usize..(start + len) as usize]
    }

    #[inline]
    pub(crate) fn op_at(&self, pc: usize, i: usize) -> u8 {
        self.ops[pc + i]
    }

    #[inline]
    pub(crate) fn read_u16(&self, at: usize) -> u16 {
        bytecode::read_u16(&self.ops, at)
    }

    #[inline]
    pub(crate) fn read_i16(&self, at: usize) -> i16 {
        bytecode::read_i16(&self.ops, at)
    }

    #[inline]
    pub(crate) fn read_u32(&self, at: usize) -> u32 {
        bytecode::read_u32(&self.ops, at)
    }

    #[inline]
    pub(crate) fn read_u48(&self, at: usize) -> u64 {
        bytecode::read_u48(&self.ops, at)
    }

    #[inline]
    pub(crate) fn write_u16(&mut self, at: usize, v: u16) {
        bytecode::write_u16(&mut self.ops, at, v);
    }

    #[inline]
    pub(crate) fn write_u32(&mut self, at: usize, v: u32) {
        bytecode::write_u32(&mut self.ops, at, v);
    }

    #[inline]
    pub(crate) fn write_u48(&mut self, at: usize, v: u64) {
        bytecode::write_u48(&mut self.ops, at, v);
    }

    #[inline]
    pub(crate) fn reg(&self, fp: usize, i: u8) -> Value {
        self.stack[fp + i as usize]
    }

    #[inline]
    pub(crate) fn set_reg(&mut self, fp: usize, i: u8, val: Value) {
        self.stack[fp + i as usize] = val;
    }

    /// Fail the current dispatch with [`VmError::Panic`]; the panic state
    /// is already set.
    #[inline]
    pub(crate) fn escape_panic<T>(&self) -> Result<T, VmError> {
        Err(VmError::Panic)
    }
}
