//! Cooperative fiber scheduling.

use skein_vm::consts::NULL_U32;
use skein_vm::prelude::*;

#[test]
fn coyield_on_the_main_fiber_is_a_nop() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.coyield(); // 0..3
    asm.const_i8(5, 0); // 3..6
    asm.end(0);
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::number(5.0));
}

/// A fiber that publishes 7 and 8 into a shared box before yielding, then
/// returns 9. Three resumes observe 7, 8, 9; a fourth is a no-op.
fn fiber_round_trip_program() -> Program {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.const_i8(0, 1); // 0..3
    asm.box_value_of(1, 0); // 3..6: r0 = box, shared with the fiber
    asm.retain(0); // 6..8: the fiber arg takes its own ref
    asm.coinit(0, 1, 28, 16, 2); // 8..14: fiber code at 14, main resumes at 36
    // Fiber body; its box argument lands in slot 4.
    asm.const_i8(7, 5); // 14..17
    asm.set_box_value_release(4, 5); // 17..20
    asm.coyield(); // 20..23
    asm.const_i8(8, 5); // 23..26
    asm.set_box_value_release(4, 5); // 26..29
    asm.coyield(); // 29..32
    asm.const_i8(9, 1); // 32..35: Coreturn reads slot 1
    asm.coreturn(); // 35..36
    // Main resumes here.
    asm.retain(2); // 36..38: each resume consumes one fiber ref
    asm.coresume(2, 3); // 38..41
    asm.box_value(0, 4); // 41..44: r4 = 7
    asm.retain(2); // 44..46
    asm.coresume(2, 3); // 46..49
    asm.box_value(0, 5); // 49..52: r5 = 8
    asm.retain(2); // 52..54
    asm.coresume(2, 6); // 54..57: r6 = 9 via Coreturn
    asm.retain(2); // 57..59
    asm.coresume(2, 7); // 59..62: finished fiber, no-op + release
    asm.end(6); // 62..64
    prog.ops = asm.into_ops();
    prog
}

#[test]
fn fiber_round_trip_yields_then_returns() {
    let mut vm = Vm::new(fiber_round_trip_program());
    vm.run().unwrap();

    assert_eq!(vm.stack()[4], Value::number(7.0));
    assert_eq!(vm.stack()[5], Value::number(8.0));
    assert_eq!(vm.stack()[6], Value::number(9.0));
    assert_eq!(vm.result(), Value::number(9.0));

    // Yields produce a none result in the resumer's destination register.
    assert_eq!(vm.stack()[3], Value::NONE);
    // The fourth resume never wrote its destination.
    assert_eq!(vm.stack()[7], Value::NONE);

    // The fiber is terminal and still inspectable through r2.
    let fiber_val = vm.stack()[2];
    assert!(fiber_val.is_pointer());
    match &vm.heap().get(fiber_val.as_object_id()).data {
        HeapData::Fiber(fiber) => assert_eq!(fiber.pc_offset, NULL_U32),
        other => panic!("expected a fiber, got {other:?}"),
    }
}

#[test]
fn abandoned_fiber_finalizer_releases_its_stack() {
    let mut vm = Vm::new(fiber_round_trip_program());
    vm.run().unwrap();
    assert_eq!(vm.heap().live(), 2, "fiber and box");

    // Dropping the last references tears both down; the fiber's stack
    // still holds its box argument.
    let fiber_val = vm.stack()[2];
    let box_val = vm.stack()[0];
    vm.release(fiber_val);
    vm.release(box_val);
    assert_eq!(vm.heap().live(), 0);
    assert_eq!(vm.heap().ref_total(), 0);
}

#[test]
fn coresume_of_a_non_fiber_releases_the_handle() {
    let mut prog = Program::new();
    let mut asm = Asm::new();
    asm.list(5, 0, 0); // 0..4: r0 = []
    asm.coresume(0, 1); // 4..7: not a fiber -> release, no switch
    asm.end(1); // 7..9
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    vm.run().unwrap();
    assert_eq!(vm.result(), Value::NONE);
    assert_eq!(vm.heap().live(), 0, "handle released");
}

#[test]
fn fibers_keep_independent_panic_state() {
    // The fiber throws with no handler: the loop reports a panic while the
    // fiber is current. The error is recorded on that fiber, not on main.
    let mut prog = Program::new();
    let err = prog.add_const(Value::error(3));
    let mut asm = Asm::new();
    asm.coinit(0, 0, 16, 8, 0); // 0..6: fiber code at 6, main at 16
    asm.const_op(err, 1); // 6..10
    asm.throw(1); // 10..12
    asm.coreturn(); // 12..13 (unreached)
    asm.jump(3); // 13..16 (padding, unreached)
    asm.retain(0); // 16..18
    asm.coresume(0, 1); // 18..21
    asm.end(1); // 21..23 (unreached: the panic aborts the loop)
    prog.ops = asm.into_ops();

    let mut vm = Vm::new(prog);
    assert_eq!(vm.run(), Err(VmError::Panic));
    assert_eq!(vm.panic().message(), Some("Uncaught error."));
}
