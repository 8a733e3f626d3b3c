//! Exposed constructors API for the [`Vm`].

use super::{Vm, VmStats};
use crate::consts::{DEFAULT_HEAP_BUDGET, DEFAULT_STACK_SIZE};
use crate::error::Panic;
use crate::fiber::Fiber;
use crate::heap::Heap;
use crate::program::Program;
use crate::value::Value;

impl Vm {
    /// Create a VM over a compiled program with the default stack size and
    /// heap budget.
    pub fn new(program: Program) -> Self {
        Self::with_capacity(program, DEFAULT_STACK_SIZE, DEFAULT_HEAP_BUDGET)
    }

    /// Create a VM with an explicit main-fiber stack size and live-object
    /// budget.
    pub fn with_capacity(program: Program, stack_size: usize, heap_budget: usize) -> Self {
        let mut stack = vec![Value::NONE; stack_size];
        // Top-level frame header: a return with the top-level flag set
        // terminates the loop with success.
        stack[1] = Value::ret_info(0, 1, 0);

        Self {
            ops: program.ops,
            consts: program.consts,
            str_buf: program.str_buf,
            field_syms: program.field_syms,
            field_table: program.field_table,
            func_syms: program.func_syms,
            func_sigs: program.func_sigs,
            method_syms: program.method_syms,
            method_entries: program.method_entries,
            method_table: program.method_table,
            types: program.types,
            resolved_syms: program.resolved_syms,
            names: program.names,
            var_syms: program.var_syms,
            heap: Heap::new(heap_budget),
            stack,
            fp: 0,
            pc: 0,
            try_stack: Vec::new(),
            panic: Panic::None,
            main_fiber: Fiber::default(),
            cur_fiber: Value::NONE,
            end_local: 0,
            stats: VmStats::default(),
        }
    }
}
