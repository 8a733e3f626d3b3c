//! Fiber allocation, cooperative switching, and throw unwinding.
//!
//! Switching transfers `(stack, fp, pc, try-stack, panic)` between the VM's
//! active set and a suspended [`Fiber`] record; the main fiber's record is
//! VM-resident. Switches happen only at `Coinit`/`Coyield`/`Coresume`/
//! `Coreturn`, so there is exactly one current fiber at any instant.

use super::Vm;
use crate::bytecode::OpCode;
use crate::consts::{CALL_ARG_START, NULL_U32};
use crate::error::{msg, Panic, VmError};
use crate::fiber::Fiber;
use crate::heap::{HeapData, ObjectId};
use crate::value::Value;

use tracing::debug;

impl Vm {
    /// `Coinit`: allocate a fiber whose code starts at `pc_offset`,
    /// copying the arguments into the argument slots of its first frame.
    pub(crate) fn alloc_fiber(
        &mut self,
        pc_offset: u32,
        args_base: usize,
        num_args: u8,
        stack_size: u8,
    ) -> Result<Value, VmError> {
        let len = (stack_size as usize).max(CALL_ARG_START + num_args as usize);
        let mut stack = vec![Value::NONE; len];
        stack[CALL_ARG_START..CALL_ARG_START + num_args as usize]
            .copy_from_slice(&self.stack[args_base..args_base + num_args as usize]);
        let fiber = Fiber { stack, pc_offset, ..Fiber::default() };
        self.heap.new_fiber(fiber)
    }

    /// Swap the active execution state with a fiber record.
    fn swap_state(&mut self, fiber: &mut Fiber, fp: usize, pc_offset: u32) -> (usize, usize) {
        core::mem::swap(&mut self.stack, &mut fiber.stack);
        core::mem::swap(&mut self.try_stack, &mut fiber.try_stack);
        core::mem::swap(&mut self.panic, &mut fiber.panic);
        let resume_pc = fiber.pc_offset;
        let resume_fp = fiber.fp;
        fiber.pc_offset = pc_offset;
        fiber.fp = fp as u32;
        (resume_pc as usize, resume_fp as usize)
    }

    /// `Coresume`: suspend the current fiber at `ret_pc_offset` and switch
    /// to `target`, recording where the produced value lands in this
    /// frame. Returns the target's `(pc, fp)`.
    pub(crate) fn push_fiber(
        &mut self,
        ret_pc_offset: u32,
        fp: usize,
        target: ObjectId,
        parent_dst_local: u8,
    ) -> (usize, usize) {
        debug!(fiber = target.0, "resume fiber");
        let parent = self.cur_fiber;
        let mut target_state = match &mut self.heap.get_mut(target).data {
            HeapData::Fiber(fiber) => core::mem::take(fiber.as_mut()),
            _ => unreachable!("coresume checked the fiber type"),
        };
        let (mut pc, fp_new) = self.swap_state(&mut target_state, fp, ret_pc_offset);
        // `target_state` now holds the suspended current fiber; store it
        // where that fiber lives.
        self.store_fiber_state(parent, target_state);
        // While the target runs, its record carries only the resume chain.
        if let HeapData::Fiber(fiber) = &mut self.heap.get_mut(target).data {
            fiber.parent = parent;
            fiber.parent_dst_local = parent_dst_local;
        }
        self.cur_fiber = Value::pointer(target);
        // A fiber parked on its own Coyield resumes right after it.
        if self.ops[pc] == OpCode::Coyield as u8 {
            pc += OpCode::Coyield.inst_len().unwrap_or(3);
        }
        (pc, fp_new)
    }

    /// `Coyield`/`Coreturn`: park the current fiber (terminal when
    /// `pc_offset` is `NULL_U32`), switch back to its parent, hand over the
    /// produced value, and drop the resume reference. Returns the parent's
    /// `(pc, fp)`.
    pub(crate) fn pop_fiber(&mut self, pc_offset: u32, fp: usize, ret: Value) -> (usize, usize) {
        let cur = self.cur_fiber;
        debug_assert!(cur.is_pointer(), "pop of the main fiber");
        let id = cur.as_object_id();
        let (parent, dst) = match &self.heap.get(id).data {
            HeapData::Fiber(fiber) => (fiber.parent, fiber.parent_dst_local),
            _ => (Value::NONE, 0),
        };
        debug!(fiber = id.0, finished = pc_offset == NULL_U32, "suspend fiber");

        let mut parent_state = self.take_fiber_state(parent);
        let (pc, new_fp) = self.swap_state(&mut parent_state, fp, pc_offset);
        parent_state.parent = Value::NONE;
        // `parent_state` now holds the suspended current fiber.
        match &mut self.heap.get_mut(id).data {
            HeapData::Fiber(fiber) => **fiber = parent_state,
            _ => {}
        }
        self.cur_fiber = parent;
        self.stack[new_fp + dst as usize] = ret;
        // The resume reference is consumed by the switch back.
        self.heap.release_object(id);
        (pc, new_fp)
    }

    fn store_fiber_state(&mut self, owner: Value, state: Fiber) {
        if owner.is_pointer() {
            if let HeapData::Fiber(fiber) = &mut self.heap.get_mut(owner.as_object_id()).data {
                **fiber = state;
            }
        } else {
            self.main_fiber = state;
        }
    }

    fn take_fiber_state(&mut self, owner: Value) -> Fiber {
        if owner.is_pointer() {
            match &mut self.heap.get_mut(owner.as_object_id()).data {
                HeapData::Fiber(fiber) => core::mem::take(fiber.as_mut()),
                _ => Fiber::default(),
            }
        } else {
            core::mem::take(&mut self.main_fiber)
        }
    }

    /// `Throw`: unwind to the nearest try frame of the current fiber. With
    /// an empty try-stack the error is uncaught and becomes a panic.
    pub(crate) fn throw(&mut self, err: Value) -> Result<(usize, usize), VmError> {
        match self.try_stack.pop() {
            Some(frame) => {
                let fp = frame.fp as usize;
                self.stack[fp + frame.catch_err_dst as usize] = err;
                Ok((frame.catch_pc as usize, fp))
            }
            None => {
                self.heap.release(err);
                self.panic_static(msg::UNCAUGHT_ERROR);
                self.escape_panic()
            }
        }
    }

    /// Clear a pending panic and its payload. Exposed for embedders that
    /// recover and re-enter the VM.
    pub fn clear_panic(&mut self) {
        self.panic = Panic::None;
    }
}
