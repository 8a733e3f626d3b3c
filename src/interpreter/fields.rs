//! Field access.
//!
//! Reads and writes go through the field symbol's most-recently-used type
//! cache, with the compiler's offset table as fallback. A successful
//! generic access rewrites itself to the IC variant and caches the
//! witnessed `(type, offset)` pair in the instruction's reserved bytes.

use super::Vm;
use crate::bytecode::OpCode;
use crate::consts::NULL_U8;
use crate::error::{msg, VmError};
use crate::heap::{HeapData, ObjectId};
use crate::symbols::is_type_sym_compat;
use crate::value::Value;

impl Vm {
    fn object_field(&self, id: ObjectId, offset: u8) -> Result<Value, VmError> {
        match &self.heap.get(id).data {
            HeapData::Object { fields } => Ok(fields[offset as usize]),
            _ => Err(VmError::Unknown),
        }
    }

    fn replace_object_field(
        &mut self,
        id: ObjectId,
        offset: u8,
        val: Value,
    ) -> Result<Value, VmError> {
        match &mut self.heap.get_mut(id).data {
            HeapData::Object { fields } => {
                Ok(core::mem::replace(&mut fields[offset as usize], val))
            }
            _ => Err(VmError::Unknown),
        }
    }

    /// `Field` / `FieldRetain`: read `(recv, sym) -> dst`, specializing the
    /// instruction on an offset-table hit.
    pub(crate) fn op_field(&mut self, pc: usize, fp: usize, retain: bool) -> Result<(), VmError> {
        let recv = self.reg(fp, self.op_at(pc, 1));
        let dst = self.op_at(pc, 2);
        let sym_id = self.read_u16(pc + 3) as u32;
        if !recv.is_pointer() {
            self.panic_static(msg::FIELD_MISSING);
            return self.escape_panic();
        }
        let id = recv.as_object_id();
        let type_id = self.heap.get(id).header.type_id;
        let offset = self.field_offset(type_id, sym_id);
        let val = if offset != NULL_U8 {
            let val = self.object_field(id, offset)?;
            let ic = if retain { OpCode::FieldRetainIC } else { OpCode::FieldIC };
            self.ops[pc] = ic as u8;
            self.write_u16(pc + 5, type_id as u16);
            self.ops[pc + 7] = offset;
            val
        } else {
            self.field_fallback(id, sym_id)
        };
        if retain {
            self.heap.retain(val);
        }
        self.set_reg(fp, dst, val);
        Ok(())
    }

    /// Dynamic fallback for receivers without a resolved field layout:
    /// maps answer by key name, everything else reads as `none`.
    fn field_fallback(&mut self, id: ObjectId, sym_id: u32) -> Value {
        let name_id = self.field_syms[sym_id as usize].name_id;
        match &self.heap.get(id).data {
            HeapData::Map { entries } => {
                let name = &self.names[name_id as usize];
                entries
                    .iter()
                    .find(|(k, _)| self.static_string_eq(**k, name))
                    .map(|(_, v)| *v)
                    .unwrap_or(Value::NONE)
            }
            _ => Value::NONE,
        }
    }

    /// `SetField`: raw field store; the stored reference moves from the
    /// register.
    pub(crate) fn set_field(&mut self, recv: Value, sym_id: u32, val: Value) -> Result<(), VmError> {
        if !recv.is_pointer() {
            return Err(VmError::Unknown);
        }
        let id = recv.as_object_id();
        let type_id = self.heap.get(id).header.type_id;
        let offset = self.field_offset(type_id, sym_id);
        if offset == NULL_U8 {
            return Err(VmError::Unknown);
        }
        self.replace_object_field(id, offset, val)?;
        Ok(())
    }

    /// `SetFieldRelease`: release the displaced value, then store,
    /// specializing the instruction.
    pub(crate) fn set_field_release(
        &mut self,
        pc: usize,
        recv: Value,
        sym_id: u32,
        val: Value,
    ) -> Result<(), VmError> {
        if !recv.is_pointer() {
            return Err(VmError::Unknown);
        }
        let id = recv.as_object_id();
        let type_id = self.heap.get(id).header.type_id;
        let offset = self.field_offset(type_id, sym_id);
        if offset == NULL_U8 {
            return Err(VmError::Unknown);
        }
        let old = self.replace_object_field(id, offset, val)?;
        self.heap.release(old);
        self.ops[pc] = OpCode::SetFieldReleaseIC as u8;
        self.write_u16(pc + 4, type_id as u16);
        self.ops[pc + 6] = offset;
        Ok(())
    }

    /// `SetCheckFieldRelease`: enforce the field's declared sema type
    /// before the store.
    pub(crate) fn set_check_field_release(
        &mut self,
        recv: Value,
        sym_id: u32,
        val: Value,
    ) -> Result<(), VmError> {
        if !recv.is_pointer() {
            return Err(VmError::Unknown);
        }
        let id = recv.as_object_id();
        let type_id = self.heap.get(id).header.type_id;
        let offset = self.field_offset(type_id, sym_id);
        if offset == NULL_U8 {
            return Err(VmError::Unknown);
        }
        let field_sema = self.field_syms[sym_id as usize].mru_field_type_sym_id;
        let val_sema = self.types[self.type_id_of(val) as usize].type_sym_id;
        if !is_type_sym_compat(val_sema, field_sema) {
            let field_type = self.sema_sym_name(field_sema).to_string();
            let val_type = self.type_name(self.type_id_of(val)).to_string();
            self.panic_msg(format!(
                "Assigning to `{field_type}` member with incompatible type `{val_type}`."
            ));
            self.heap.release(val);
            return self.escape_panic();
        }
        let old = self.replace_object_field(id, offset, val)?;
        self.heap.release(old);
        Ok(())
    }

    /// Bit-compare a map key against an interned name, seeing through
    /// static strings.
    fn static_string_eq(&self, key: Value, name: &str) -> bool {
        if key.is_pointer() || !key.assume_not_ptr_is_static_string() {
            return false;
        }
        self.static_string_bytes(key) == name.as_bytes()
    }
}
