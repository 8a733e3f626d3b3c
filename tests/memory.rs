//! Retain/release balance across whole programs.

use skein_vm::prelude::*;

#[test]
fn copy_retain_then_double_release_finalizes_once() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.list(5, 0, 0); // 0..4: r0 = []
    asm.copy_retain_src(0, 1); // 4..7
    asm.release(0); // 7..9
    asm.release(1); // 9..11
    asm.end(0); // 11..13
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.heap().stats().frees, 1, "finalizer ran exactly once");
    assert_eq!(vm.heap().live(), 0);
    assert_eq!(vm.heap().ref_total(), 0);
}

#[test]
fn plain_copy_does_not_touch_refcounts() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.list(5, 0, 0); // r0 = []
    asm.copy(0, 1);
    asm.release(0);
    asm.end(0);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.heap().stats().retains, 0);
    assert_eq!(vm.heap().stats().frees, 1);
}

#[test]
fn copy_release_dst_drops_the_overwritten_value() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.list(5, 0, 0); // r0 = []
    asm.list(5, 0, 1); // r1 = []
    asm.copy_retain_release(0, 1); // retain src, release old dst
    asm.release(0);
    asm.release(1);
    asm.end(0);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.heap().live(), 0);
    assert_eq!(vm.heap().ref_total(), 0);
}

#[test]
fn release_n_releases_each_named_register() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.list(5, 0, 0);
    asm.list(5, 0, 1);
    asm.list(5, 0, 2);
    asm.release_n(&[0, 1, 2]);
    asm.end(0);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.heap().live(), 0);
    assert_eq!(vm.heap().stats().frees, 3);
}

#[test]
fn nested_ownership_is_released_transitively() {
    // A list holding a box holding a list; one release tears it all down.
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.list(8, 0, 5); // 0..4: r5 = inner []
    asm.box_value_of(5, 6); // 4..7: r6 = box(inner), inner ref moves
    asm.list(6, 1, 0); // 7..11: r0 = [box], box ref moves
    asm.release(0); // 11..13
    asm.end(0);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.heap().live(), 0);
    assert_eq!(vm.heap().stats().frees, 3);
    assert_eq!(vm.heap().ref_total(), 0);
}

#[test]
fn static_var_slots_own_one_reference() {
    let mut prog = Program::new();
    let var = prog.add_static_var(Value::number(3.0));
    let mut asm = Asm::new();
    asm.static_var(var, 0); // 0..4: r0 = 3.0 (retained, no-op for numbers)
    asm.list(5, 0, 1); // 4..8: r1 = []
    asm.set_static_var(var, 1); // 8..12: slot takes the list ref
    asm.static_var(var, 2); // 12..16: r2 = list, retained
    asm.release(2); // 16..18
    asm.end(0); // 18..20
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(3.0));
    // The slot still owns the list.
    assert_eq!(vm.heap().live(), 1);
    assert_eq!(vm.heap().ref_total(), 1);
}

#[test]
fn box_store_and_load_round_trip() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.const_i8(1, 1); // 0..3
    asm.box_value_of(1, 0); // 3..6: r0 = box(1.0)
    asm.const_i8(7, 2); // 6..9
    asm.set_box_value_release(0, 2); // 9..12
    asm.box_value(0, 3); // 12..15
    asm.release(0); // 15..17
    asm.end(3); // 17..19
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(7.0));
    assert_eq!(vm.heap().live(), 0);
}

#[test]
fn heap_budget_exhaustion_is_a_fault_not_a_panic() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    // Even under a try frame, OOM returns to the embedder directly.
    asm.push_try(0, 20); // 0..4
    asm.list(5, 0, 1); // 4..8
    asm.list(5, 0, 2); // 8..12
    asm.end(0);
    prog.ops = asm.into_ops();

    let mut vm = Vm::with_capacity(prog, 64, 1);
    assert_eq!(vm.run(), Err(VmError::OutOfMemory));
    assert!(!vm.panic().is_set());
}
