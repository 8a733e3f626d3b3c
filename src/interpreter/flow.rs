//! Call and return protocol.
//!
//! Every bytecode call builds the same frame: the callee's window starts at
//! the caller's `fp + startLocal`, slot 0 is the return-value landing site,
//! slots 1..4 hold `(retInfo, retPc, retFp)`, arguments sit at 4.., locals
//! past them. Native calls stay on the caller's frame: the VM publishes the
//! would-be window and invokes the function pointer directly.
//!
//! Successful dynamic dispatches rewrite their own opcode byte to a
//! specialized variant and cache the witnessed type plus the resolved
//! target in the instruction's reserved bytes. Only the executing fiber
//! touches its own instructions, so the rewrite is single-writer by
//! construction.

use super::{ArgSpan, Vm};
use crate::bytecode::OpCode;
use crate::consts::{CALL_OBJ_SYM_INST_LEN, CALL_SYM_INST_LEN};
use crate::error::{msg, VmError};
use crate::heap::HeapData;
use crate::symbols::{is_type_sym_compat, FuncEntry, MethodEntry, TypeId};
use crate::value::Value;

use itertools::Itertools;

/// Copied-out callee shape, so frame building never overlaps a heap borrow.
enum CalleeKind {
    Func { func_pc: u32, num_params: u8, stack_size: u8, local: Option<u8> },
    Native(crate::symbols::NativeFn),
    Other,
}

impl Vm {
    /// Build a bytecode frame at `fp + start_local`; returns the callee's
    /// `(pc, fp)`.
    fn build_frame(
        &mut self,
        ret_pc: usize,
        fp: usize,
        start_local: u8,
        num_locals: u8,
        ret_info: Value,
        func_pc: u32,
    ) -> Result<(usize, usize), VmError> {
        let new_fp = fp + start_local as usize;
        if new_fp + num_locals as usize > self.stack.len() {
            return Err(VmError::StackOverflow);
        }
        self.stack[new_fp + 1] = ret_info;
        self.stack[new_fp + 2] = Value::raw(ret_pc as u64);
        self.stack[new_fp + 3] = Value::raw(fp as u64);
        Ok((func_pc as usize, new_fp))
    }

    /// `Call`: dispatch on a callee value. `pc` is already advanced past
    /// the call instruction.
    pub(crate) fn call_value(
        &mut self,
        pc: usize,
        fp: usize,
        callee: Value,
        start_local: u8,
        num_args: u8,
        ret_info: Value,
    ) -> Result<(usize, usize), VmError> {
        if !callee.is_pointer() {
            self.panic_static(msg::NOT_A_FUNCTION);
            return self.escape_panic();
        }
        let id = callee.as_object_id();
        let kind = match &self.heap.get(id).data {
            HeapData::Lambda { func_pc, num_params, stack_size, .. } => CalleeKind::Func {
                func_pc: *func_pc,
                num_params: *num_params,
                stack_size: *stack_size,
                local: None,
            },
            HeapData::Closure { func_pc, num_params, stack_size, local, .. } => {
                CalleeKind::Func {
                    func_pc: *func_pc,
                    num_params: *num_params,
                    stack_size: *stack_size,
                    local: Some(*local),
                }
            }
            HeapData::NativeFunc { func, .. } => CalleeKind::Native(*func),
            _ => CalleeKind::Other,
        };
        match kind {
            CalleeKind::Func { func_pc, num_params, stack_size, local } => {
                if num_args != num_params {
                    return self.panic_arity(num_params, num_args);
                }
                let frame = self.build_frame(pc, fp, start_local, stack_size, ret_info, func_pc)?;
                if let Some(local) = local {
                    // The closure value moves into its declared local so
                    // `Captured` can reach it from inside the body.
                    self.stack[frame.1 + local as usize] = callee;
                }
                Ok(frame)
            }
            CalleeKind::Native(func) => {
                let new_fp = fp + start_local as usize;
                self.fp = new_fp;
                let span = ArgSpan { base: (new_fp + 4) as u32, len: num_args };
                let res = func(self, span);
                if res == Value::INTERRUPT {
                    return Err(VmError::Panic);
                }
                if ret_info.ret_info_num_ret() == 1 {
                    self.stack[new_fp] = res;
                } else {
                    self.heap.release(res);
                }
                self.fp = fp;
                Ok((pc, fp))
            }
            CalleeKind::Other => {
                self.panic_static(msg::NOT_A_FUNCTION);
                self.escape_panic()
            }
        }
    }

    /// `CallSym`: call a statically-known function symbol, specializing the
    /// instruction on success.
    pub(crate) fn call_sym(
        &mut self,
        pc: usize,
        fp: usize,
        sym_id: u16,
        start_local: u8,
        num_args: u8,
        num_ret: u8,
    ) -> Result<(usize, usize), VmError> {
        let entry = self.func_syms[sym_id as usize].entry;
        match entry {
            FuncEntry::Func { pc: func_pc, stack_size, .. } => {
                let ret_info = Value::ret_info(num_ret, 0, CALL_SYM_INST_LEN);
                let frame = self.build_frame(
                    pc + CALL_SYM_INST_LEN as usize,
                    fp,
                    start_local,
                    stack_size,
                    ret_info,
                    func_pc,
                )?;
                self.ops[pc] = OpCode::CallFuncIC as u8;
                self.ops[pc + 4] = stack_size;
                self.write_u48(pc + 6, func_pc as u64);
                Ok(frame)
            }
            FuncEntry::Native { func, .. } => {
                let new_fp = fp + start_local as usize;
                self.fp = new_fp;
                let span = ArgSpan { base: (new_fp + 4) as u32, len: num_args };
                let res = func(self, span);
                if res == Value::INTERRUPT {
                    return Err(VmError::Panic);
                }
                match num_ret {
                    1 => self.stack[new_fp] = res,
                    0 => self.heap.release(res),
                    _ => return Err(VmError::Unknown),
                }
                self.fp = fp;
                self.ops[pc] = OpCode::CallNativeFuncIC as u8;
                self.write_u48(pc + 6, sym_id as u64);
                Ok((pc + CALL_SYM_INST_LEN as usize, fp))
            }
            FuncEntry::Closure(id) => {
                let callee = Value::pointer(id);
                let ret_info = Value::ret_info(num_ret, 0, CALL_SYM_INST_LEN);
                self.call_value(
                    pc + CALL_SYM_INST_LEN as usize,
                    fp,
                    callee,
                    start_local,
                    num_args,
                    ret_info,
                )
            }
        }
    }

    /// `CallObjSym`: method dispatch on `(receiver type, method sym)`
    /// through the symbol's mru cache, specializing the instruction on a
    /// resolution.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn call_obj_sym(
        &mut self,
        pc: usize,
        fp: usize,
        recv: Value,
        type_id: TypeId,
        sym_id: u8,
        start_local: u8,
        num_args: u8,
        num_ret: u8,
    ) -> Result<(usize, usize), VmError> {
        let entry_idx = {
            let sym = &self.method_syms[sym_id as usize];
            if sym.mru_type_id == type_id {
                Some(sym.mru_entry)
            } else {
                self.method_table.get(&(type_id, sym_id as u32)).copied()
            }
        };
        let Some(entry_idx) = entry_idx else {
            let name = self.name(self.method_syms[sym_id as usize].name_id).to_string();
            let type_name = self.type_name(type_id).to_string();
            self.panic_msg(format!("Method `{name}` not found in `{type_name}`."));
            return self.escape_panic();
        };
        {
            let sym = &mut self.method_syms[sym_id as usize];
            sym.mru_type_id = type_id;
            sym.mru_entry = entry_idx;
        }
        let entry = self.method_entries[entry_idx as usize];
        match entry {
            MethodEntry::Func { pc: func_pc, num_params, stack_size } => {
                if num_args != num_params {
                    return self.panic_arity(num_params, num_args);
                }
                let ret_info = Value::ret_info(num_ret, 0, CALL_OBJ_SYM_INST_LEN);
                let frame = self.build_frame(
                    pc + CALL_OBJ_SYM_INST_LEN as usize,
                    fp,
                    start_local,
                    stack_size,
                    ret_info,
                    func_pc,
                )?;
                self.ops[pc] = OpCode::CallObjFuncIC as u8;
                self.ops[pc + 7] = stack_size;
                self.write_u32(pc + 8, func_pc);
                self.write_u16(pc + 14, type_id as u16);
                Ok(frame)
            }
            MethodEntry::Native { func } => {
                let new_fp = fp + start_local as usize;
                self.fp = new_fp;
                let span = ArgSpan { base: (new_fp + 4) as u32, len: num_args };
                let res = func(self, recv, span);
                if res == Value::INTERRUPT {
                    return Err(VmError::Panic);
                }
                match num_ret {
                    1 => self.stack[new_fp] = res,
                    0 => self.heap.release(res),
                    _ => return Err(VmError::Unknown),
                }
                self.fp = fp;
                self.ops[pc] = OpCode::CallObjNativeFuncIC as u8;
                self.write_u48(pc + 8, entry_idx as u64);
                self.write_u16(pc + 14, type_id as u16);
                Ok((pc + CALL_OBJ_SYM_INST_LEN as usize, fp))
            }
        }
    }

    /// `CallTypeCheck`: verify arity and per-argument sema compatibility
    /// against a resolved signature. The following instruction is the call
    /// itself; its function symbol names the panic.
    pub(crate) fn call_type_check(
        &mut self,
        pc: usize,
        fp: usize,
        arg_start: u8,
        num_args: u8,
        sig_id: u16,
    ) -> Result<(), VmError> {
        let param_len = self.func_sigs[sig_id as usize].params.len();
        if num_args as usize != param_len {
            return self.panic_incompatible_sig(pc, fp, arg_start, num_args);
        }
        for i in 0..param_len {
            let cstr = self.func_sigs[sig_id as usize].params[i];
            let arg = self.reg(fp, arg_start + i as u8);
            let arg_sema = self.types[self.type_id_of(arg) as usize].type_sym_id;
            if !is_type_sym_compat(arg_sema, cstr) {
                return self.panic_incompatible_sig(pc, fp, arg_start, num_args);
            }
        }
        Ok(())
    }

    fn panic_incompatible_sig(
        &mut self,
        pc: usize,
        fp: usize,
        arg_start: u8,
        num_args: u8,
    ) -> Result<(), VmError> {
        // The next instruction is CallSym or one of its IC variants; its
        // function symbol sits at offset 4.
        let func_id = self.read_u16(pc + 5 + 4);
        let name = self.name(self.func_syms[func_id as usize].name_id).to_string();
        let args = (0..num_args)
            .map(|i| {
                let arg = self.reg(fp, arg_start + i);
                self.type_name(self.type_id_of(arg))
            })
            .join(", ");
        self.panic_msg(format!("Call to `{name}` has incompatible arguments ({args})."));
        self.escape_panic()
    }

    fn panic_arity<T>(&mut self, expected: u8, got: u8) -> Result<T, VmError> {
        self.panic_msg(format!("Expected {expected} arguments, got {got}."));
        self.escape_panic()
    }

    /// `StaticFunc`: materialize a function symbol as a value.
    pub(crate) fn func_from_sym(&mut self, func_id: u16) -> Result<Value, VmError> {
        let entry = self.func_syms[func_id as usize].entry;
        match entry {
            FuncEntry::Native { func, num_params, r_func_sig_id } => {
                self.heap.new_native_func(func, num_params, r_func_sig_id)
            }
            FuncEntry::Func { pc, num_params, stack_size, r_func_sig_id } => {
                self.heap.new_lambda(pc, num_params, stack_size, r_func_sig_id)
            }
            FuncEntry::Closure(id) => {
                self.heap.retain_object(id);
                Ok(Value::pointer(id))
            }
        }
    }

    /// `SetStaticFunc`: rebind a function symbol from a function value.
    pub(crate) fn set_static_func(&mut self, func_id: u16, val: Value) -> Result<(), VmError> {
        if !val.is_pointer() {
            self.panic_static(msg::NOT_A_FUNCTION);
            return self.escape_panic();
        }
        let id = val.as_object_id();
        let entry = match &self.heap.get(id).data {
            HeapData::Lambda { func_pc, num_params, stack_size, r_func_sig_id } => {
                Some(FuncEntry::Func {
                    pc: *func_pc,
                    num_params: *num_params,
                    stack_size: *stack_size,
                    r_func_sig_id: *r_func_sig_id,
                })
            }
            HeapData::NativeFunc { func, num_params, r_func_sig_id } => Some(FuncEntry::Native {
                func: *func,
                num_params: *num_params,
                r_func_sig_id: *r_func_sig_id,
            }),
            HeapData::Closure { .. } => Some(FuncEntry::Closure(id)),
            _ => None,
        };
        let Some(entry) = entry else {
            self.panic_static(msg::NOT_A_FUNCTION);
            return self.escape_panic();
        };
        if let FuncEntry::Closure(_) = entry {
            self.heap.retain_object(id);
        }
        let prev = core::mem::replace(&mut self.func_syms[func_id as usize].entry, entry);
        if let FuncEntry::Closure(prev_id) = prev {
            self.heap.release_object(prev_id);
        }
        Ok(())
    }
}
