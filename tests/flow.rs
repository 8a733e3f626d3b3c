//! Call protocol: frame layout, symbol calls, inline-cache rewrites,
//! callee values, and type-checked calls.

use skein_vm::consts::{CALL_SYM_INST_LEN, DEFAULT_HEAP_BUDGET};
use skein_vm::prelude::*;
use skein_vm::symbols::{SEMA_ANY, SEMA_NUMBER, SEMA_STRING};

fn read_u16(ops: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([ops[at], ops[at + 1]])
}

fn read_u48(ops: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b[..6].copy_from_slice(&ops[at..at + 6]);
    u64::from_le_bytes(b)
}

/// Main calls a two-argument bytecode function through `CallSym`.
fn call_sym_program() -> Program {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.const_i8(3, 9); // 0..3: arg0 at start+4
    asm.const_i8(4, 10); // 3..6: arg1
    asm.call_sym(5, 2, 1, 0); // 6..18
    asm.end(5); // 18..20
    let func_pc = asm.pos() as u32;
    asm.binary(OpCode::Add, 4, 5, 0); // 20..24: r0 = arg0 + arg1
    asm.ret1(); // 24..25
    prog.ops = asm.into_ops();
    prog.add_func_sym(
        "add2",
        FuncEntry::Func { pc: func_pc, num_params: 2, stack_size: 8, r_func_sig_id: 0 },
    );
    prog
}

#[test]
fn call_sym_builds_a_frame_and_returns() {
    let mut vm = Vm::new(call_sym_program());
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(7.0));
    assert_eq!(vm.fp(), 0, "frame restored to the caller");
}

#[test]
fn call_sym_specializes_and_the_cache_is_taken() {
    let mut vm = Vm::new(call_sym_program());
    vm.run().unwrap();

    let ops = vm.ops();
    assert_eq!(ops[6], OpCode::CallFuncIC as u8);
    assert_eq!(ops[6 + 4], 8, "cached local count");
    assert_eq!(read_u48(ops, 6 + 6), 20, "cached function pc");
    assert_eq!(vm.stats().call_ic_hits, 0);

    vm.set_pc(0);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(7.0));
    assert_eq!(vm.stats().call_ic_hits, 1);
}

#[test]
fn frame_header_records_return_pc_and_caller_base() {
    // The callee stops at End, leaving its frame live for inspection.
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.call_sym(5, 0, 0, 0); // 0..12
    asm.ret0(); // 12..13 (unreached)
    let func_pc = asm.pos() as u32;
    asm.end(0); // 13..15: callee halts
    prog.ops = asm.into_ops();
    prog.add_func_sym(
        "halt",
        FuncEntry::Func { pc: func_pc, num_params: 0, stack_size: 4, r_func_sig_id: 0 },
    );

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.fp(), 5);
    assert_eq!(vm.stack()[5 + 2].bits(), CALL_SYM_INST_LEN as u64, "return pc");
    assert_eq!(vm.stack()[5 + 3].bits(), 0, "caller frame base");
    let ret_info = vm.stack()[5 + 1];
    assert_eq!(ret_info.bits() & 0xff, 0, "requested return count");
}

#[test]
fn call_dispatches_on_a_lambda_value() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.jump(8); // 0..3 -> 8
    asm.binary(OpCode::Add, 4, 5, 0); // 3..7: lambda body
    asm.ret1(); // 7..8
    asm.lambda(5, 2, 8, 0, 8); // 8..15: func_pc = 8 - 5 = 3
    asm.const_i8(2, 13); // 15..18: args at 9+4
    asm.const_i8(3, 14); // 18..21
    asm.copy_retain_src(8, 15); // 21..24: callee slot 9+2+4
    asm.call(9, 2, 1); // 24..28
    asm.release(8); // 28..30
    asm.release(15); // 30..32
    asm.end(9); // 32..34
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(5.0));
    assert_eq!(vm.heap().live(), 0, "lambda fully released");
}

#[test]
fn call_arity_mismatch_panics() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.jump(8); // 0..3
    asm.binary(OpCode::Add, 4, 5, 0); // 3..7
    asm.ret1(); // 7..8
    asm.lambda(5, 2, 8, 0, 8); // 8..15
    asm.copy_retain_src(8, 13); // 15..18: callee at 9+0+4
    asm.call(9, 0, 1); // 18..22: zero args for a 2-param fn
    asm.end(9);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    assert_eq!(vm.run(), Err(VmError::Panic));
    let message = vm.panic().message().unwrap().to_string();
    assert!(message.contains("Expected 2 arguments"), "{message}");
}

#[test]
fn call_of_a_non_function_panics() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.const_i8(1, 13); // callee slot 9+0+4 holds a number
    asm.call(9, 0, 0);
    asm.end(0);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    assert_eq!(vm.run(), Err(VmError::Panic));
    assert_eq!(vm.panic().message(), Some("Not a function."));
}

#[test]
fn closure_capture_reads_through_the_box() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.jump(11); // 0..3 -> 11
    asm.captured(4, 0, 5); // 3..7: closure local is slot 4
    asm.box_value(5, 0); // 7..10
    asm.ret1(); // 10..11
    asm.const_i8(42, 1); // 11..14
    asm.box_value_of(1, 2); // 14..17: r2 = box(42)
    asm.closure(14, 0, 8, 0, 4, 3, &[2]); // 17..27: func_pc = 17 - 14 = 3
    asm.copy(3, 9); // 27..30: callee at 5+0+4
    asm.call(5, 0, 1); // 30..34
    asm.release(3); // 34..36
    asm.release(2); // 36..38
    asm.end(5); // 38..40
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(42.0));
    assert_eq!(vm.heap().live(), 0, "closure and box fully released");
    assert_eq!(vm.heap().ref_total(), 0);
}

fn native_sum(vm: &mut Vm, span: ArgSpan) -> Value {
    let sum = vm.args(span).iter().map(|v| v.as_f64()).sum();
    Value::number(sum)
}

#[test]
fn call_sym_native_specializes_to_the_native_cache() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.const_i8(3, 9);
    asm.const_i8(4, 10);
    asm.call_sym(5, 2, 1, 0); // 6..18
    asm.end(5);
    prog.ops = asm.into_ops();
    let sym = prog.add_func_sym(
        "sum",
        FuncEntry::Native { func: native_sum, num_params: 2, r_func_sig_id: 0 },
    );
    assert_eq!(sym, 0);

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(7.0));
    assert_eq!(vm.ops()[6], OpCode::CallNativeFuncIC as u8);
    assert_eq!(read_u48(vm.ops(), 6 + 6), 0, "cached symbol index");

    vm.set_pc(0);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(7.0));
    assert_eq!(vm.stats().call_ic_hits, 1);
}

fn method_get_field(vm: &mut Vm, recv: Value, _span: ArgSpan) -> Value {
    match &vm.heap().get(recv.as_object_id()).data {
        HeapData::Object { fields } => fields[0],
        _ => Value::NONE,
    }
}

#[test]
fn call_obj_sym_dispatches_a_bytecode_method() {
    let mut prog = Program::new();
    let field = prog.add_field_sym("x");
    prog.set_field_offset(100, field, 0);
    let method = prog.add_method_sym("get");
    let mut asm = Asm::new();
    asm.const_i8(42, 2); // 0..3
    asm.object_small(100, 2, 1, 0); // 3..8
    asm.copy(0, 9); // 8..11: receiver is the last argument
    asm.call_obj_sym(5, 1, 1, method, 0); // 11..27
    asm.release(0); // 27..29
    asm.end(5); // 29..31
    let method_pc = asm.pos() as u32;
    asm.field(4, 0, field as u16); // 31..39: receiver at slot 4
    asm.ret1(); // 39..40
    prog.ops = asm.into_ops();
    prog.add_method(100, method, MethodEntry::Func { pc: method_pc, num_params: 1, stack_size: 8 });

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(42.0));
    assert_eq!(vm.ops()[11], OpCode::CallObjFuncIC as u8);
    assert_eq!(read_u16(vm.ops(), 11 + 14), 100, "cached receiver type");

    vm.set_pc(0);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(42.0));
    assert!(vm.stats().call_ic_hits >= 1);
}

#[test]
fn call_obj_sym_dispatches_a_native_method() {
    let mut prog = Program::new();
    let method = prog.add_method_sym("get");
    let mut asm = Asm::new();
    asm.const_i8(7, 2);
    asm.object_small(100, 2, 1, 0); // 3..8
    asm.copy(0, 9); // 8..11
    asm.call_obj_sym(5, 1, 1, method, 0); // 11..27
    asm.release(0); // 27..29
    asm.end(5); // 29..31
    prog.ops = asm.into_ops();
    prog.add_method(100, method, MethodEntry::Native { func: method_get_field });

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(7.0));
    assert_eq!(vm.ops()[11], OpCode::CallObjNativeFuncIC as u8);
    assert_eq!(read_u16(vm.ops(), 11 + 14), 100);
}

#[test]
fn call_obj_sym_missing_method_panics() {
    let mut prog = Program::new();
    let method = prog.add_method_sym("get");
    let mut asm = Asm::new();
    asm.const_i8(7, 9); // receiver is a number
    asm.call_obj_sym(5, 1, 1, method, 0);
    asm.end(5);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    assert_eq!(vm.run(), Err(VmError::Panic));
    let message = vm.panic().message().unwrap().to_string();
    assert!(message.contains("`get` not found in `number`"), "{message}");
}

fn type_check_program(second_arg_is_string: bool) -> Program {
    let mut prog = Program::new();
    let s = prog.add_static_string("x");
    let sig = prog.add_func_sig(vec![SEMA_NUMBER, SEMA_STRING], SEMA_ANY);
    let mut asm = Asm::new();
    asm.const_i8(1, 9); // 0..3
    if second_arg_is_string {
        asm.const_op(s, 10); // 3..7
    } else {
        asm.const_i8(2, 10); // 3..6
        asm.unary(OpCode::True, 11); // pad to keep the layout fixed: 6..8
        asm.copy(10, 10); // 8..11 (no-op)
    }
    // CallTypeCheck sits right before the call so the panic path can name
    // the function.
    asm.call_type_check(9, 2, sig);
    asm.call_sym(5, 2, 1, 0);
    asm.end(5);
    let func_pc = asm.pos() as u32;
    asm.copy(4, 0);
    asm.ret1();
    prog.ops = asm.into_ops();
    prog.add_func_sym(
        "typed",
        FuncEntry::Func { pc: func_pc, num_params: 2, stack_size: 8, r_func_sig_id: sig },
    );
    prog
}

#[test]
fn type_checked_call_accepts_compatible_arguments() {
    let mut vm = Vm::new(type_check_program(true));
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(1.0));
}

#[test]
fn type_checked_call_rejects_and_skips_the_call() {
    let mut vm = Vm::new(type_check_program(false));
    assert_eq!(vm.run(), Err(VmError::Panic));
    let message = vm.panic().message().unwrap().to_string();
    assert!(message.contains("incompatible"), "{message}");
    assert!(message.contains("typed"), "{message}");
    assert_eq!(vm.stack()[5], Value::NONE, "the call never ran");
}

#[test]
fn deep_recursion_faults_with_stack_overflow() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.call_sym(4, 0, 0, 0); // 0..12: main calls f
    asm.end(0); // 12..14
    let func_pc = asm.pos() as u32;
    asm.call_sym(4, 0, 0, 0); // f calls f
    asm.ret0();
    prog.ops = asm.into_ops();
    prog.add_func_sym(
        "loopy",
        FuncEntry::Func { pc: func_pc, num_params: 0, stack_size: 8, r_func_sig_id: 0 },
    );

    let mut vm = Vm::with_capacity(prog, 256, DEFAULT_HEAP_BUDGET);
    assert_eq!(vm.run(), Err(VmError::StackOverflow));
}
