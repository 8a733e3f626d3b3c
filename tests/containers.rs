//! Lists, maps, slices, string templates, and static symbols.

use skein_vm::prelude::*;

#[test]
fn list_build_and_index() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.const_i8(10, 5); // 0..3
    asm.const_i8(20, 6); // 3..6
    asm.list(5, 2, 0); // 6..10: r0 = [10, 20]
    asm.const_i8(1, 7); // 10..13
    asm.index(0, 7, 1); // 13..17: r1 = r0[1]
    asm.const_i8(2, 8); // 17..20
    asm.reverse_index(0, 8, 2); // 20..24: r2 = r0[len - 2]
    asm.release(0); // 24..26
    asm.end(1); // 26..28
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(20.0));
    assert_eq!(vm.stack()[2], Value::number(10.0));
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn list_index_out_of_bounds_panics() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.list(5, 0, 0);
    asm.const_i8(3, 7);
    asm.index(0, 7, 1);
    asm.end(1);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    assert_eq!(vm.run(), Err(VmError::Panic));
    assert_eq!(vm.panic().message(), Some("Index out of bounds."));
}

#[test]
fn set_index_release_swaps_list_slots() {
    let mut asm = Asm::new();
    asm.const_i8(1, 5); // 0..3
    asm.list(5, 1, 0); // 3..7: r0 = [1]
    asm.list(6, 0, 1); // 7..11: r1 = []
    asm.const_i8(0, 7); // 11..14
    asm.set_index_release(0, 7, 1); // 14..18: r0[0] = r1, old 1.0 dropped
    asm.const_i8(9, 8); // 18..21
    asm.set_index_release(0, 7, 8); // 21..25: r0[0] = 9.0, inner list freed
    asm.release(0); // 25..27
    asm.end(0); // 27..29
    let mut prog = Program::new();
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.heap().live(), 0);
    assert_eq!(vm.heap().stats().frees, 2, "inner list and outer list");
}

#[test]
fn map_roundtrip_through_registers() {
    let mut prog = Program::new();
    let key = prog.add_const(Value::integer(1));
    let mut asm = Asm::new();
    asm.const_i8(42, 5); // 0..3
    asm.map(5, &[key], 0); // 3..9: r0 = {1: 42}
    asm.const_op(key, 7); // 9..13
    asm.index(0, 7, 1); // 13..17
    asm.release(0); // 17..19
    asm.end(1); // 19..21
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(42.0));
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn empty_map_misses_read_as_none() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.map_empty(0); // 0..2
    asm.const_i8(1, 7); // 2..5
    asm.index(0, 7, 1); // 5..9
    asm.release(0); // 9..11
    asm.end(1); // 11..13
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::NONE);
}

#[test]
fn slice_of_a_list_copies_and_retains() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.const_i8(10, 5); // 0..3
    asm.const_i8(20, 6); // 3..6
    asm.const_i8(30, 7); // 6..9
    asm.list(5, 3, 0); // 9..13: r0 = [10, 20, 30]
    asm.const_i8(1, 8); // 13..16
    asm.unary(OpCode::None, 9); // 16..18: open end
    asm.slice(0, 8, 9, 1); // 18..23: r1 = r0[1..]
    asm.const_i8(0, 8); // 23..26
    asm.index(1, 8, 2); // 26..30: r2 = 20
    asm.release(0); // 30..32
    asm.release(1); // 32..34
    asm.end(2); // 34..36
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(20.0));
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn slice_of_a_static_string_stays_static() {
    let mut prog = Program::new();
    let s = prog.add_static_string("hello");
    let mut asm = Asm::new();
    asm.const_op(s, 0); // 0..4
    asm.const_i8(1, 5); // 4..7
    asm.const_i8(3, 6); // 7..10
    asm.slice(0, 5, 6, 1); // 10..15: "el"
    asm.end(1); // 15..17
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    let out = vm.result();
    assert!(!out.is_pointer(), "still a value-encoded string");
    assert_eq!(out.static_string_slice().1, 2);
    assert_eq!(vm.heap().live(), 0, "no allocation for static slices");
}

#[test]
fn string_template_interleaves_parts_and_values() {
    let mut prog = Program::new();
    let head = prog.add_static_string("x=");
    let tail = prog.add_static_string("!");
    let mut asm = Asm::new();
    asm.const_i8(4, 5); // 0..3
    asm.string_template(5, 1, 0, &[head as u8, tail as u8]); // 3..9
    asm.end(0); // 9..11
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    let out = vm.result();
    assert!(out.is_pointer());
    match &vm.heap().get(out.as_object_id()).data {
        HeapData::Astring { bytes } => assert_eq!(bytes, b"x=4"),
        other => panic!("expected an ascii string, got {other:?}"),
    }
}

#[test]
fn static_func_materializes_a_lambda_value() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.static_func(0, 8); // 0..4: r8 = lambda for sym 0
    asm.const_i8(6, 13); // 4..7: arg
    asm.copy_retain_src(8, 14); // 7..10: callee at 9+1+4
    asm.call(9, 1, 1); // 10..14
    asm.release(8); // 14..16
    asm.release(14); // 16..18
    asm.end(9); // 18..20
    let func_pc = asm.pos() as u32;
    asm.binary(OpCode::Add, 4, 4, 0); // 20..24: doubles its argument
    asm.ret1(); // 24..25
    prog.ops = asm.into_ops();
    prog.add_func_sym(
        "double",
        FuncEntry::Func { pc: func_pc, num_params: 1, stack_size: 8, r_func_sig_id: 0 },
    );

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(12.0));
    assert_eq!(vm.heap().live(), 0);
}

fn native_one(_vm: &mut Vm, _span: ArgSpan) -> Value {
    Value::number(1.0)
}

#[test]
fn set_static_func_rebinds_a_symbol() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.call_sym(5, 0, 1, 0); // 0..12: calls the original native
    asm.copy(5, 1); // 12..15: r1 = 1.0
    asm.jump(7); // 15..18: skip the lambda body -> 22
    let body = asm.pos() as u32; // 18
    asm.const_i8(2, 0); // 18..21: lambda body returns 2.0
    asm.ret1(); // 21..22
    asm.lambda(4, 0, 8, 0, 2); // 22..29: func_pc = 22 - 4 = 18
    asm.set_static_func(0, 2); // 29..33
    asm.release(2); // 33..35
    asm.end(1); // 35..37
    prog.ops = asm.into_ops();
    assert_eq!(body, 18);
    prog.add_func_sym(
        "one",
        FuncEntry::Native { func: native_one, num_params: 0, r_func_sig_id: 0 },
    );

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(1.0));
    // The symbol now resolves to the lambda.
    match vm.heap().live() {
        0 => {}
        n => panic!("lambda value should be fully released, live={n}"),
    }
}

#[test]
fn tag_and_symbol_literals() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.tag(3, 7, 0); // 0..4
    asm.tag_literal(9, 1); // 4..7
    asm.sym(1, 500, 2); // 7..14: metatype value
    asm.release(2); // 14..16
    asm.end(0); // 16..18
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::enum_member(3, 7));
    assert_eq!(vm.stack()[1], Value::symbol(9));
    assert_eq!(vm.heap().live(), 0);
}
