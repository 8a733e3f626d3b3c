//! The dispatch loop.
//!
//! `pc` and `fp` live in locals for the duration of the loop and are
//! written back to the VM only on escape: a terminal result, a panic, or a
//! helper that can observe them (native calls, fiber switches). Jump
//! opcodes overwrite `pc`; everything else advances it by the instruction's
//! declared length.

use super::Vm;
use crate::bytecode::OpCode;
use crate::consts::{CALL_INST_LEN, CALL_OBJ_SYM_INST_LEN, CALL_SYM_INST_LEN, NULL_U32, NULL_U8};
use crate::error::{msg, VmError};
use crate::fiber::TryFrame;
use crate::heap::HeapData;
use crate::value::Value;

use tracing::trace;

impl Vm {
    /// Run bytecode from the current `(pc, fp)` until `End`, a top-level
    /// return, or a failure code.
    pub fn run(&mut self) -> Result<(), VmError> {
        let mut pc = self.pc;
        let mut fp = self.fp;

        macro_rules! flush {
            () => {{
                self.pc = pc;
                self.fp = fp;
            }};
        }
        macro_rules! fail {
            ($err:expr) => {{
                flush!();
                return Err($err);
            }};
        }
        macro_rules! vm_try {
            ($e:expr) => {
                match $e {
                    Ok(v) => v,
                    Err(err) => fail!(err),
                }
            };
        }
        // Binary arithmetic/logic over two number operands; mismatches
        // panic without touching the destination.
        macro_rules! num_binop {
            (|$a:ident, $b:ident| $res:expr) => {{
                let left = self.reg(fp, self.op_at(pc, 1));
                let right = self.reg(fp, self.op_at(pc, 2));
                if Value::both_numbers(left, right) {
                    let $a = left.as_f64();
                    let $b = right.as_f64();
                    self.set_reg(fp, self.op_at(pc, 3), $res);
                    pc += 4;
                } else {
                    self.panic_static(msg::EXPECTED_NUMBER);
                    fail!(VmError::Panic);
                }
            }};
        }

        loop {
            let op = match OpCode::try_from(self.ops[pc]) {
                Ok(op) => op,
                Err(_) => fail!(VmError::Unknown),
            };
            trace!(pc, ?op, "dispatch");
            match op {
                OpCode::ConstOp => {
                    let val = self.consts[self.read_u16(pc + 1) as usize];
                    self.set_reg(fp, self.op_at(pc, 3), val);
                    pc += 4;
                }
                OpCode::ConstI8 => {
                    let imm = self.op_at(pc, 1) as i8;
                    self.set_reg(fp, self.op_at(pc, 2), Value::number(imm as f64));
                    pc += 3;
                }
                OpCode::ConstI8Int => {
                    let imm = self.op_at(pc, 1) as i8;
                    self.set_reg(fp, self.op_at(pc, 2), Value::integer(imm as i32));
                    pc += 3;
                }
                OpCode::Add => num_binop!(|a, b| Value::number(a + b)),
                OpCode::Sub => num_binop!(|a, b| Value::number(a - b)),
                OpCode::Mul => num_binop!(|a, b| Value::number(a * b)),
                OpCode::Div => num_binop!(|a, b| Value::number(a / b)),
                OpCode::Pow => num_binop!(|a, b| Value::number(a.powf(b))),
                OpCode::Mod => num_binop!(|a, b| Value::number(a % b)),
                OpCode::Less => num_binop!(|a, b| Value::boolean(a < b)),
                OpCode::Greater => num_binop!(|a, b| Value::boolean(a > b)),
                OpCode::LessEqual => num_binop!(|a, b| Value::boolean(a <= b)),
                OpCode::GreaterEqual => num_binop!(|a, b| Value::boolean(a >= b)),
                OpCode::BitwiseAnd => {
                    num_binop!(|a, b| Value::number(((a as i32) & (b as i32)) as f64))
                }
                OpCode::BitwiseOr => {
                    num_binop!(|a, b| Value::number(((a as i32) | (b as i32)) as f64))
                }
                OpCode::BitwiseXor => {
                    num_binop!(|a, b| Value::number(((a as i32) ^ (b as i32)) as f64))
                }
                OpCode::BitwiseLeftShift => {
                    num_binop!(|a, b| Value::number(((a as i32) << (b as i32)) as f64))
                }
                OpCode::BitwiseRightShift => {
                    num_binop!(|a, b| Value::number(((a as i32) >> (b as i32)) as f64))
                }
                OpCode::True => {
                    self.set_reg(fp, self.op_at(pc, 1), Value::TRUE);
                    pc += 2;
                }
                OpCode::False => {
                    self.set_reg(fp, self.op_at(pc, 1), Value::FALSE);
                    pc += 2;
                }
                OpCode::None => {
                    self.set_reg(fp, self.op_at(pc, 1), Value::NONE);
                    pc += 2;
                }
                OpCode::Not => {
                    let dst = self.op_at(pc, 1);
                    let val = self.reg(fp, dst);
                    self.set_reg(fp, dst, Value::boolean(!val.truthy()));
                    pc += 2;
                }
                OpCode::Neg => {
                    let dst = self.op_at(pc, 1);
                    let val = self.reg(fp, dst);
                    if val.is_number() {
                        self.set_reg(fp, dst, Value::number(-val.as_f64()));
                        pc += 2;
                    } else {
                        self.panic_static(msg::EXPECTED_NUMBER);
                        fail!(VmError::Panic);
                    }
                }
                OpCode::BitwiseNot => {
                    let dst = self.op_at(pc, 1);
                    let val = self.reg(fp, dst);
                    if val.is_number() {
                        self.set_reg(fp, dst, Value::number(!val.as_f64_to_i32() as f64));
                        pc += 2;
                    } else {
                        self.panic_static(msg::EXPECTED_NUMBER);
                        fail!(VmError::Panic);
                    }
                }
                OpCode::Copy => {
                    let val = self.reg(fp, self.op_at(pc, 1));
                    self.set_reg(fp, self.op_at(pc, 2), val);
                    pc += 3;
                }
                OpCode::CopyReleaseDst => {
                    let dst = self.op_at(pc, 2);
                    let old = self.reg(fp, dst);
                    self.heap.release(old);
                    let val = self.reg(fp, self.op_at(pc, 1));
                    self.set_reg(fp, dst, val);
                    pc += 3;
                }
                OpCode::CopyRetainSrc => {
                    let val = self.reg(fp, self.op_at(pc, 1));
                    self.heap.retain(val);
                    self.set_reg(fp, self.op_at(pc, 2), val);
                    pc += 3;
                }
                OpCode::CopyRetainRelease => {
                    let src = self.op_at(pc, 1);
                    let dst = self.op_at(pc, 2);
                    let val = self.reg(fp, src);
                    self.heap.retain(val);
                    let old = self.reg(fp, dst);
                    self.heap.release(old);
                    self.set_reg(fp, dst, val);
                    pc += 3;
                }
                OpCode::Release => {
                    let val = self.reg(fp, self.op_at(pc, 1));
                    self.heap.release(val);
                    pc += 2;
                }
                OpCode::ReleaseN => {
                    let n = self.op_at(pc, 1) as usize;
                    for i in 0..n {
                        let val = self.reg(fp, self.op_at(pc, 2 + i));
                        self.heap.release(val);
                    }
                    pc += 2 + n;
                }
                OpCode::Retain => {
                    let val = self.reg(fp, self.op_at(pc, 1));
                    self.heap.retain(val);
                    pc += 2;
                }
                OpCode::SetIndex => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    let index = self.reg(fp, self.op_at(pc, 2));
                    let right = self.reg(fp, self.op_at(pc, 3));
                    vm_try!(self.set_index(recv, index, right, false));
                    pc += 4;
                }
                OpCode::SetIndexRelease => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    let index = self.reg(fp, self.op_at(pc, 2));
                    let right = self.reg(fp, self.op_at(pc, 3));
                    vm_try!(self.set_index(recv, index, right, true));
                    pc += 4;
                }
                OpCode::Index => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    let index = self.reg(fp, self.op_at(pc, 2));
                    let val = vm_try!(self.get_index(recv, index));
                    self.set_reg(fp, self.op_at(pc, 3), val);
                    pc += 4;
                }
                OpCode::ReverseIndex => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    let index = self.reg(fp, self.op_at(pc, 2));
                    let val = vm_try!(self.get_reverse_index(recv, index));
                    self.set_reg(fp, self.op_at(pc, 3), val);
                    pc += 4;
                }
                OpCode::List => {
                    let start = self.op_at(pc, 1) as usize;
                    let n = self.op_at(pc, 2) as usize;
                    let elems = self.stack[fp + start..fp + start + n].to_vec();
                    let val = vm_try!(self.heap.new_list(elems));
                    self.set_reg(fp, self.op_at(pc, 3), val);
                    pc += 4;
                }
                OpCode::Map => {
                    let start = self.op_at(pc, 1) as usize;
                    let n = self.op_at(pc, 2) as usize;
                    let mut entries = hashbrown::HashMap::with_capacity(n);
                    for i in 0..n {
                        let key = self.consts[self.read_u16(pc + 4 + i * 2) as usize];
                        entries.insert(key, self.stack[fp + start + i]);
                    }
                    let val = vm_try!(self.heap.new_map(entries));
                    self.set_reg(fp, self.op_at(pc, 3), val);
                    pc += 4 + n * 2;
                }
                OpCode::MapEmpty => {
                    let val = vm_try!(self.heap.new_empty_map());
                    self.set_reg(fp, self.op_at(pc, 1), val);
                    pc += 2;
                }
                OpCode::Slice => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    let start = self.reg(fp, self.op_at(pc, 2));
                    let end = self.reg(fp, self.op_at(pc, 3));
                    let val = vm_try!(self.slice(recv, start, end));
                    self.set_reg(fp, self.op_at(pc, 4), val);
                    pc += 5;
                }
                OpCode::JumpNotCond => {
                    let cond = self.reg(fp, self.op_at(pc, 1));
                    if !cond.truthy() {
                        pc += self.read_u16(pc + 2) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::JumpCond => {
                    let offset = self.read_i16(pc + 1);
                    let cond = self.reg(fp, self.op_at(pc, 3));
                    if cond.truthy() {
                        pc = (pc as isize + offset as isize) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::Jump => {
                    pc = (pc as isize + self.read_i16(pc + 1) as isize) as usize;
                }
                OpCode::JumpNotNone => {
                    let offset = self.read_i16(pc + 1);
                    if !self.reg(fp, self.op_at(pc, 3)).is_none() {
                        pc = (pc as isize + offset as isize) as usize;
                    } else {
                        pc += 4;
                    }
                }
                OpCode::CallObjSym => {
                    let start_local = self.op_at(pc, 1);
                    let num_args = self.op_at(pc, 2);
                    let num_ret = self.op_at(pc, 3);
                    let sym_id = self.op_at(pc, 4);
                    let recv = self.reg(fp, start_local + num_args + 4 - 1);
                    let type_id = self.type_id_of(recv);
                    flush!();
                    let (npc, nfp) = vm_try!(self.call_obj_sym(
                        pc,
                        fp,
                        recv,
                        type_id,
                        sym_id,
                        start_local,
                        num_args,
                        num_ret,
                    ));
                    pc = npc;
                    fp = nfp;
                }
                OpCode::CallObjNativeFuncIC => {
                    let start_local = self.op_at(pc, 1);
                    let num_args = self.op_at(pc, 2);
                    let recv = self.reg(fp, start_local + num_args + 4 - 1);
                    let type_id = self.type_id_of(recv);
                    let cached = self.read_u16(pc + 14) as u32;
                    if type_id == cached {
                        self.stats.call_ic_hits += 1;
                        let new_fp = fp + start_local as usize;
                        self.pc = pc;
                        self.fp = new_fp;
                        let entry = self.read_u48(pc + 8) as usize;
                        let func = match self.method_entries[entry] {
                            crate::symbols::MethodEntry::Native { func } => func,
                            _ => fail!(VmError::Unknown),
                        };
                        let span =
                            super::ArgSpan { base: (new_fp + 4) as u32, len: num_args };
                        let res = func(self, recv, span);
                        if res == Value::INTERRUPT {
                            fail!(VmError::Panic);
                        }
                        match self.op_at(pc, 3) {
                            1 => self.stack[new_fp] = res,
                            0 => self.heap.release(res),
                            _ => fail!(VmError::Unknown),
                        }
                        pc += CALL_OBJ_SYM_INST_LEN as usize;
                    } else {
                        self.deopt(pc, op);
                    }
                }
                OpCode::CallObjFuncIC => {
                    let start_local = self.op_at(pc, 1);
                    let num_args = self.op_at(pc, 2);
                    let recv = self.reg(fp, start_local + num_args + 4 - 1);
                    let type_id = self.type_id_of(recv);
                    let cached = self.read_u16(pc + 14) as u32;
                    if type_id == cached {
                        self.stats.call_ic_hits += 1;
                        let num_locals = self.op_at(pc, 7) as usize;
                        let new_fp = fp + start_local as usize;
                        if new_fp + num_locals > self.stack.len() {
                            fail!(VmError::StackOverflow);
                        }
                        self.stack[new_fp + 1] =
                            Value::ret_info(self.op_at(pc, 3), 0, CALL_OBJ_SYM_INST_LEN);
                        self.stack[new_fp + 2] =
                            Value::raw((pc + CALL_OBJ_SYM_INST_LEN as usize) as u64);
                        self.stack[new_fp + 3] = Value::raw(fp as u64);
                        pc = self.read_u32(pc + 8) as usize;
                        fp = new_fp;
                    } else {
                        self.deopt(pc, op);
                    }
                }
                OpCode::CallTypeCheck => {
                    let arg_start = self.op_at(pc, 1);
                    let num_args = self.op_at(pc, 2);
                    let sig_id = self.read_u16(pc + 3);
                    vm_try!(self.call_type_check(pc, fp, arg_start, num_args, sig_id));
                    pc += 5;
                }
                OpCode::CallSym => {
                    let start_local = self.op_at(pc, 1);
                    let num_args = self.op_at(pc, 2);
                    let num_ret = self.op_at(pc, 3);
                    let sym_id = self.read_u16(pc + 4);
                    flush!();
                    let (npc, nfp) =
                        vm_try!(self.call_sym(pc, fp, sym_id, start_local, num_args, num_ret));
                    pc = npc;
                    fp = nfp;
                }
                OpCode::CallFuncIC => {
                    self.stats.call_ic_hits += 1;
                    let start_local = self.op_at(pc, 1);
                    let num_locals = self.op_at(pc, 4) as usize;
                    let new_fp = fp + start_local as usize;
                    if new_fp + num_locals > self.stack.len() {
                        fail!(VmError::StackOverflow);
                    }
                    self.stack[new_fp + 1] =
                        Value::ret_info(self.op_at(pc, 3), 0, CALL_SYM_INST_LEN);
                    self.stack[new_fp + 2] = Value::raw((pc + CALL_SYM_INST_LEN as usize) as u64);
                    self.stack[new_fp + 3] = Value::raw(fp as u64);
                    pc = self.read_u48(pc + 6) as usize;
                    fp = new_fp;
                }
                OpCode::CallNativeFuncIC => {
                    self.stats.call_ic_hits += 1;
                    let start_local = self.op_at(pc, 1);
                    let num_args = self.op_at(pc, 2);
                    let new_fp = fp + start_local as usize;
                    self.pc = pc;
                    self.fp = new_fp;
                    let entry = self.read_u48(pc + 6) as usize;
                    let func = match self.func_syms[entry].entry {
                        crate::symbols::FuncEntry::Native { func, .. } => func,
                        _ => fail!(VmError::Unknown),
                    };
                    let span = super::ArgSpan { base: (new_fp + 4) as u32, len: num_args };
                    let res = func(self, span);
                    if res == Value::INTERRUPT {
                        fail!(VmError::Panic);
                    }
                    match self.op_at(pc, 3) {
                        1 => self.stack[new_fp] = res,
                        0 => self.heap.release(res),
                        _ => fail!(VmError::Unknown),
                    }
                    pc += CALL_SYM_INST_LEN as usize;
                }
                OpCode::Ret1 => {
                    let ret_info = self.stack[fp + 1];
                    let req = ret_info.ret_info_num_ret();
                    if req != 1 {
                        match req {
                            0 => {
                                let val = self.stack[fp];
                                self.heap.release(val);
                            }
                            _ => fail!(VmError::Unknown),
                        }
                    }
                    let npc = self.stack[fp + 2].bits() as usize;
                    let nfp = self.stack[fp + 3].bits() as usize;
                    pc = npc;
                    fp = nfp;
                    if ret_info.ret_info_ret_flag() != 0 {
                        flush!();
                        return Ok(());
                    }
                }
                OpCode::Ret0 => {
                    let ret_info = self.stack[fp + 1];
                    let req = ret_info.ret_info_num_ret();
                    if req != 0 {
                        match req {
                            1 => self.stack[fp] = Value::NONE,
                            _ => fail!(VmError::Unknown),
                        }
                    }
                    let npc = self.stack[fp + 2].bits() as usize;
                    let nfp = self.stack[fp + 3].bits() as usize;
                    pc = npc;
                    fp = nfp;
                    if ret_info.ret_info_ret_flag() != 0 {
                        flush!();
                        return Ok(());
                    }
                }
                OpCode::Call => {
                    let start_local = self.op_at(pc, 1);
                    let num_args = self.op_at(pc, 2);
                    let num_ret = self.op_at(pc, 3);
                    pc += 4;
                    let callee = self.reg(fp, start_local + num_args + 4);
                    let ret_info = Value::ret_info(num_ret, 0, CALL_INST_LEN);
                    flush!();
                    let (npc, nfp) =
                        vm_try!(self.call_value(pc, fp, callee, start_local, num_args, ret_info));
                    pc = npc;
                    fp = nfp;
                }
                OpCode::Field => {
                    vm_try!(self.op_field(pc, fp, false));
                    pc += 8;
                }
                OpCode::FieldRetain => {
                    vm_try!(self.op_field(pc, fp, true));
                    pc += 8;
                }
                OpCode::FieldIC | OpCode::FieldRetainIC => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    if !recv.is_pointer() {
                        self.panic_static(msg::FIELD_MISSING);
                        fail!(VmError::Panic);
                    }
                    let id = recv.as_object_id();
                    if self.heap.get(id).header.type_id == self.read_u16(pc + 5) as u32 {
                        self.stats.field_ic_hits += 1;
                        let offset = self.op_at(pc, 7);
                        let val = match &self.heap.get(id).data {
                            HeapData::Object { fields } => fields[offset as usize],
                            _ => fail!(VmError::Unknown),
                        };
                        if op == OpCode::FieldRetainIC {
                            self.heap.retain(val);
                        }
                        self.set_reg(fp, self.op_at(pc, 2), val);
                        pc += 8;
                    } else {
                        self.deopt(pc, op);
                    }
                }
                OpCode::Lambda => {
                    let func_pc = pc as u32 - self.op_at(pc, 1) as u32;
                    let num_params = self.op_at(pc, 2);
                    let stack_size = self.op_at(pc, 3);
                    let sig = self.read_u16(pc + 4);
                    let val = vm_try!(self.heap.new_lambda(func_pc, num_params, stack_size, sig));
                    self.set_reg(fp, self.op_at(pc, 6), val);
                    pc += 7;
                }
                OpCode::Closure => {
                    let func_pc = pc as u32 - self.op_at(pc, 1) as u32;
                    let num_params = self.op_at(pc, 2);
                    let num_captured = self.op_at(pc, 3) as usize;
                    let stack_size = self.op_at(pc, 4);
                    let sig = self.read_u16(pc + 5);
                    let local = self.op_at(pc, 7);
                    let dst = self.op_at(pc, 8);
                    let captured: Vec<Value> = (0..num_captured)
                        .map(|i| self.reg(fp, self.op_at(pc, 9 + i)))
                        .collect();
                    let val = vm_try!(self.heap.new_closure(
                        func_pc, num_params, stack_size, local, sig, captured
                    ));
                    self.set_reg(fp, dst, val);
                    pc += 9 + num_captured;
                }
                OpCode::Compare => {
                    let left = self.reg(fp, self.op_at(pc, 1));
                    let right = self.reg(fp, self.op_at(pc, 2));
                    let res = if left == right {
                        Value::TRUE
                    } else {
                        Value::boolean(self.deep_equal(left, right))
                    };
                    self.set_reg(fp, self.op_at(pc, 3), res);
                    pc += 4;
                }
                OpCode::CompareNot => {
                    let left = self.reg(fp, self.op_at(pc, 1));
                    let right = self.reg(fp, self.op_at(pc, 2));
                    let res = if left == right {
                        Value::FALSE
                    } else {
                        Value::boolean(!self.deep_equal(left, right))
                    };
                    self.set_reg(fp, self.op_at(pc, 3), res);
                    pc += 4;
                }
                OpCode::StringTemplate => {
                    let start = self.op_at(pc, 1);
                    let expr_count = self.op_at(pc, 2) as usize;
                    let dst = self.op_at(pc, 3);
                    let str_count = expr_count + 1;
                    let val = vm_try!(self.string_template(pc + 4, str_count, fp, start));
                    self.set_reg(fp, dst, val);
                    pc += 4 + str_count;
                }
                OpCode::Init => {
                    let start = self.op_at(pc, 1);
                    let n = self.op_at(pc, 2);
                    for i in start..start + n {
                        self.set_reg(fp, i, Value::NONE);
                    }
                    pc += 3;
                }
                OpCode::ObjectSmall | OpCode::Object => {
                    let type_id = self.op_at(pc, 1) as u32;
                    let start = self.op_at(pc, 2) as usize;
                    let n = self.op_at(pc, 3) as usize;
                    let fields = self.stack[fp + start..fp + start + n].to_vec();
                    let val = if op == OpCode::ObjectSmall {
                        vm_try!(self.heap.new_object_small(type_id, fields))
                    } else {
                        vm_try!(self.heap.new_object(type_id, fields))
                    };
                    self.set_reg(fp, self.op_at(pc, 4), val);
                    pc += 5;
                }
                OpCode::SetField => {
                    let sym_id = self.op_at(pc, 1) as u32;
                    let recv = self.reg(fp, self.op_at(pc, 2));
                    let val = self.reg(fp, self.op_at(pc, 3));
                    vm_try!(self.set_field(recv, sym_id, val));
                    pc += 4;
                }
                OpCode::SetFieldRelease => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    let val = self.reg(fp, self.op_at(pc, 2));
                    let sym_id = self.op_at(pc, 3) as u32;
                    vm_try!(self.set_field_release(pc, recv, sym_id, val));
                    pc += 7;
                }
                OpCode::SetFieldReleaseIC => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    if !recv.is_pointer() {
                        fail!(VmError::Unknown);
                    }
                    let id = recv.as_object_id();
                    if self.heap.get(id).header.type_id == self.read_u16(pc + 4) as u32 {
                        self.stats.field_ic_hits += 1;
                        let offset = self.op_at(pc, 6) as usize;
                        let val = self.reg(fp, self.op_at(pc, 2));
                        let old = match &mut self.heap.get_mut(id).data {
                            HeapData::Object { fields } => {
                                core::mem::replace(&mut fields[offset], val)
                            }
                            _ => fail!(VmError::Unknown),
                        };
                        self.heap.release(old);
                        pc += 7;
                    } else {
                        self.deopt(pc, op);
                    }
                }
                OpCode::SetCheckFieldRelease => {
                    let recv = self.reg(fp, self.op_at(pc, 1));
                    let val = self.reg(fp, self.op_at(pc, 2));
                    let sym_id = self.op_at(pc, 3) as u32;
                    vm_try!(self.set_check_field_release(recv, sym_id, val));
                    pc += 7;
                }
                OpCode::PushTry => {
                    let err_dst = self.op_at(pc, 1);
                    let catch_offset = self.read_u16(pc + 2);
                    self.try_stack.push(TryFrame {
                        fp: fp as u32,
                        catch_pc: pc as u32 + catch_offset as u32,
                        catch_err_dst: err_dst,
                    });
                    pc += 4;
                }
                OpCode::PopTry => {
                    self.try_stack.pop();
                    pc += self.read_u16(pc + 1) as usize;
                }
                OpCode::Throw => {
                    let err = self.reg(fp, self.op_at(pc, 1));
                    if err.is_error() {
                        let (npc, nfp) = vm_try!(self.throw(err));
                        pc = npc;
                        fp = nfp;
                    } else {
                        self.panic_static(msg::NOT_AN_ERROR);
                        fail!(VmError::Panic);
                    }
                }
                OpCode::Coinit => {
                    let arg_start = self.op_at(pc, 1);
                    let num_args = self.op_at(pc, 2);
                    let jump = self.op_at(pc, 3);
                    let stack_size = self.op_at(pc, 4);
                    let dst = self.op_at(pc, 5);
                    let val = vm_try!(self.alloc_fiber(
                        (pc + 6) as u32,
                        fp + arg_start as usize,
                        num_args,
                        stack_size,
                    ));
                    self.set_reg(fp, dst, val);
                    pc += jump as usize;
                }
                OpCode::Coyield => {
                    if self.cur_fiber.is_none() {
                        pc += 3;
                    } else {
                        let (npc, nfp) = self.pop_fiber(pc as u32, fp, Value::NONE);
                        pc = npc;
                        fp = nfp;
                    }
                }
                OpCode::Coresume => {
                    let fiber = self.reg(fp, self.op_at(pc, 1));
                    if fiber.is_pointer() {
                        let id = fiber.as_object_id();
                        let resumable = self.heap.get(id).header.type_id
                            == crate::types::TYPE_FIBER
                            && self.cur_fiber != fiber;
                        if resumable && !self.fiber_finished(id) {
                            let dst = self.op_at(pc, 2);
                            let (npc, nfp) = self.push_fiber((pc + 3) as u32, fp, id, dst);
                            pc = npc;
                            fp = nfp;
                            continue;
                        }
                        self.heap.release_object(id);
                    }
                    pc += 3;
                }
                OpCode::Coreturn => {
                    pc += 1;
                    if !self.cur_fiber.is_none() {
                        let res = self.stack[fp + 1];
                        let (npc, nfp) = self.pop_fiber(NULL_U32, fp, res);
                        pc = npc;
                        fp = nfp;
                    }
                }
                OpCode::Box => {
                    let val = self.reg(fp, self.op_at(pc, 1));
                    let boxed = vm_try!(self.heap.new_box(val));
                    self.set_reg(fp, self.op_at(pc, 2), boxed);
                    pc += 3;
                }
                OpCode::SetBoxValue | OpCode::SetBoxValueRelease => {
                    let boxed = self.reg(fp, self.op_at(pc, 1));
                    let rval = self.reg(fp, self.op_at(pc, 2));
                    debug_assert!(boxed.is_pointer());
                    let id = boxed.as_object_id();
                    let old = match &mut self.heap.get_mut(id).data {
                        HeapData::Box { val } => core::mem::replace(val, rval),
                        _ => fail!(VmError::Unknown),
                    };
                    if op == OpCode::SetBoxValueRelease {
                        self.heap.release(old);
                    }
                    pc += 3;
                }
                OpCode::BoxValue | OpCode::BoxValueRetain => {
                    let boxed = self.reg(fp, self.op_at(pc, 1));
                    debug_assert!(boxed.is_pointer());
                    let val = match &self.heap.get(boxed.as_object_id()).data {
                        HeapData::Box { val } => *val,
                        _ => fail!(VmError::Unknown),
                    };
                    if op == OpCode::BoxValueRetain {
                        self.heap.retain(val);
                    }
                    self.set_reg(fp, self.op_at(pc, 2), val);
                    pc += 3;
                }
                OpCode::Captured => {
                    let closure = self.reg(fp, self.op_at(pc, 1));
                    debug_assert!(closure.is_pointer());
                    let idx = self.op_at(pc, 2) as usize;
                    let val = match &self.heap.get(closure.as_object_id()).data {
                        HeapData::Closure { captured, .. } => captured[idx],
                        _ => fail!(VmError::Unknown),
                    };
                    self.set_reg(fp, self.op_at(pc, 3), val);
                    pc += 4;
                }
                OpCode::Tag => {
                    let tag_id = self.op_at(pc, 1);
                    let member = self.op_at(pc, 2);
                    self.set_reg(fp, self.op_at(pc, 3), Value::enum_member(tag_id, member));
                    pc += 4;
                }
                OpCode::TagLiteral => {
                    let sym = self.op_at(pc, 1);
                    self.set_reg(fp, self.op_at(pc, 2), Value::symbol(sym));
                    pc += 3;
                }
                OpCode::Cast => {
                    let val = self.reg(fp, self.op_at(pc, 1));
                    let expected = self.read_u16(pc + 2) as u32;
                    if self.type_id_of(val) == expected {
                        pc += 4;
                    } else {
                        let found = self.type_name(self.type_id_of(val)).to_string();
                        let want = self.type_name(expected).to_string();
                        self.panic_msg(format!("Can not cast `{found}` to `{want}`."));
                        fail!(VmError::Panic);
                    }
                }
                OpCode::CastAbstract => {
                    let val = self.reg(fp, self.op_at(pc, 1));
                    let expected = self.read_u16(pc + 2) as u32;
                    if self.cast_abstract_ok(val, expected) {
                        pc += 4;
                    } else {
                        let found = self.type_name(self.type_id_of(val)).to_string();
                        let want = self.sema_sym_name(expected).to_string();
                        self.panic_msg(format!("Can not cast `{found}` to `{want}`."));
                        fail!(VmError::Panic);
                    }
                }
                OpCode::AddInt => {
                    let left = self.reg(fp, self.op_at(pc, 1));
                    let right = self.reg(fp, self.op_at(pc, 2));
                    let res = Value::integer(left.as_integer().wrapping_add(right.as_integer()));
                    self.set_reg(fp, self.op_at(pc, 3), res);
                    pc += 4;
                }
                OpCode::SubInt => {
                    let left = self.reg(fp, self.op_at(pc, 1));
                    let right = self.reg(fp, self.op_at(pc, 2));
                    let res = Value::integer(left.as_integer().wrapping_sub(right.as_integer()));
                    self.set_reg(fp, self.op_at(pc, 3), res);
                    pc += 4;
                }
                OpCode::LessInt => {
                    let left = self.reg(fp, self.op_at(pc, 1));
                    let right = self.reg(fp, self.op_at(pc, 2));
                    let res = Value::boolean(left.as_integer() < right.as_integer());
                    self.set_reg(fp, self.op_at(pc, 3), res);
                    pc += 4;
                }
                OpCode::ForRangeInit => {
                    let start = self.to_f64(self.reg(fp, self.op_at(pc, 1)));
                    let end = self.to_f64(self.reg(fp, self.op_at(pc, 2)));
                    self.set_reg(fp, self.op_at(pc, 2), Value::number(end));
                    let step = self.to_f64(self.reg(fp, self.op_at(pc, 3))).abs();
                    self.set_reg(fp, self.op_at(pc, 3), Value::number(step));
                    if start == end {
                        pc += self.read_u16(pc + 6) as usize + 7;
                    } else {
                        self.set_reg(fp, self.op_at(pc, 4), Value::number(start));
                        self.set_reg(fp, self.op_at(pc, 5), Value::number(start));
                        let offset = self.read_u16(pc + 6) as usize;
                        self.ops[pc + offset] = if start < end {
                            OpCode::ForRange as u8
                        } else {
                            OpCode::ForRangeReverse as u8
                        };
                        pc += 8;
                    }
                }
                OpCode::ForRange => {
                    let counter = self.reg(fp, self.op_at(pc, 1)).as_f64()
                        + self.reg(fp, self.op_at(pc, 2)).as_f64();
                    if counter < self.reg(fp, self.op_at(pc, 3)).as_f64() {
                        self.set_reg(fp, self.op_at(pc, 1), Value::number(counter));
                        self.set_reg(fp, self.op_at(pc, 4), Value::number(counter));
                        pc -= self.read_u16(pc + 5) as usize;
                    } else {
                        pc += 7;
                    }
                }
                OpCode::ForRangeReverse => {
                    let counter = self.reg(fp, self.op_at(pc, 1)).as_f64()
                        - self.reg(fp, self.op_at(pc, 2)).as_f64();
                    if counter > self.reg(fp, self.op_at(pc, 3)).as_f64() {
                        self.set_reg(fp, self.op_at(pc, 1), Value::number(counter));
                        self.set_reg(fp, self.op_at(pc, 4), Value::number(counter));
                        pc -= self.read_u16(pc + 5) as usize;
                    } else {
                        pc += 7;
                    }
                }
                OpCode::Match => {
                    pc += self.op_match(pc, fp);
                }
                OpCode::StaticFunc => {
                    let func_id = self.read_u16(pc + 1);
                    let val = vm_try!(self.func_from_sym(func_id));
                    self.set_reg(fp, self.op_at(pc, 3), val);
                    pc += 4;
                }
                OpCode::StaticVar => {
                    let sym_id = self.read_u16(pc + 1);
                    let val = self.var_syms[sym_id as usize].value;
                    self.heap.retain(val);
                    self.set_reg(fp, self.op_at(pc, 3), val);
                    pc += 4;
                }
                OpCode::SetStaticVar => {
                    let sym_id = self.read_u16(pc + 1);
                    let val = self.reg(fp, self.op_at(pc, 3));
                    let prev = core::mem::replace(
                        &mut self.var_syms[sym_id as usize].value,
                        val,
                    );
                    self.heap.release(prev);
                    pc += 4;
                }
                OpCode::SetStaticFunc => {
                    let func_id = self.read_u16(pc + 1);
                    let val = self.reg(fp, self.op_at(pc, 3));
                    vm_try!(self.set_static_func(func_id, val));
                    pc += 4;
                }
                OpCode::Sym => {
                    let kind = self.op_at(pc, 1);
                    let sym_id = self.read_u32(pc + 2);
                    let val = vm_try!(self.heap.new_metatype(kind, sym_id));
                    self.set_reg(fp, self.op_at(pc, 6), val);
                    pc += 7;
                }
                OpCode::End => {
                    self.end_local = self.op_at(pc, 1);
                    flush!();
                    return Ok(());
                }
            }
        }
    }

    /// Rewrite an IC opcode back to its generic form.
    fn deopt(&mut self, pc: usize, op: OpCode) {
        tracing::debug!(pc, ?op, "inline cache deoptimized");
        self.stats.deopts += 1;
        self.ops[pc] = op.deopt() as u8;
    }

    /// `true` iff the fiber object has run to completion.
    fn fiber_finished(&self, id: crate::heap::ObjectId) -> bool {
        match &self.heap.get(id).data {
            HeapData::Fiber(fiber) => fiber.pc_offset == NULL_U32,
            _ => true,
        }
    }

    /// `true` iff `val` satisfies the abstract sema type `expected`.
    fn cast_abstract_ok(&self, val: Value, expected: u32) -> bool {
        use crate::symbols::{SEMA_ANY, SEMA_RAWSTRING, SEMA_STRING};
        match expected {
            SEMA_ANY => true,
            SEMA_STRING => self.value_is_string(val),
            SEMA_RAWSTRING => self.value_is_rawstring(val),
            _ => false,
        }
    }

    /// Field offset of `(receiver, field sym)`, through the symbol's mru
    /// cache with the offset table as fallback. `NULL_U8` on a miss.
    pub(crate) fn field_offset(&mut self, type_id: u32, sym_id: u32) -> u8 {
        let sym = &self.field_syms[sym_id as usize];
        if sym.mru_type_id == type_id {
            return sym.mru_offset as u8;
        }
        match self.field_table.get(&(type_id, sym_id)) {
            Some(offset) => {
                let offset = *offset;
                let sym = &mut self.field_syms[sym_id as usize];
                sym.mru_type_id = type_id;
                sym.mru_offset = offset as u16;
                offset
            }
            None => NULL_U8,
        }
    }
}
