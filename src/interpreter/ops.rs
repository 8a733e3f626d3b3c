//! Container and string operations reached from the dispatch loop:
//! indexing, slicing, deep comparison, number coercion, string templates,
//! and `Match`.

use super::Vm;
use crate::error::{msg, VmError};
use crate::heap::HeapData;
use crate::value::Value;

use itertools::Itertools;

/// Result of an index lookup, copied out before any panic is raised.
enum Found {
    Val(Value),
    OutOfBounds,
    Unsupported,
}

/// Result of an index store.
enum Stored {
    Old(Option<Value>),
    OutOfBounds,
    Unsupported,
}

/// Sliceable receiver shapes.
enum SliceSrc {
    List,
    Astring,
}

impl Vm {
    /// Coerce any value to a double. Numbers pass through; the fallback
    /// maps `none` to 0, booleans to 0/1, integers to their value, strings
    /// through parsing, and anything else to 0.
    pub(crate) fn to_f64(&self, val: Value) -> f64 {
        if val.is_number() {
            return val.as_f64();
        }
        if val.is_boolean() {
            return if val.as_boolean() { 1.0 } else { 0.0 };
        }
        if val.is_integer() {
            return val.as_integer() as f64;
        }
        match self.value_str(val) {
            Some(s) => s.parse().unwrap_or(0.0),
            None => 0.0,
        }
    }

    /// `true` iff the value is string-shaped: a static string or one of the
    /// heap string types.
    pub(crate) fn value_is_string(&self, val: Value) -> bool {
        if val.is_pointer() {
            matches!(
                self.heap.get(val.as_object_id()).data,
                HeapData::Astring { .. } | HeapData::Ustring { .. } | HeapData::StringSlice { .. }
            )
        } else {
            val.assume_not_ptr_is_static_string()
        }
    }

    /// `true` iff the value is in the raw string family.
    pub(crate) fn value_is_rawstring(&self, val: Value) -> bool {
        val.is_pointer()
            && matches!(
                self.heap.get(val.as_object_id()).data,
                HeapData::RawString { .. } | HeapData::RawStringSlice { .. }
            )
    }

    /// UTF-8 text of a string-shaped value, if it is one.
    pub(crate) fn value_str(&self, val: Value) -> Option<&str> {
        if val.is_pointer() {
            match &self.heap.get(val.as_object_id()).data {
                HeapData::Astring { bytes } => core::str::from_utf8(bytes).ok(),
                HeapData::Ustring { s } => Some(s),
                HeapData::StringSlice { parent, start, len } => self
                    .value_str(*parent)
                    .and_then(|s| s.get(*start as usize..(*start + *len) as usize)),
                _ => None,
            }
        } else if val.assume_not_ptr_is_static_string() {
            core::str::from_utf8(self.static_string_bytes(val)).ok()
        } else {
            None
        }
    }

    /// Deep equality behind `Compare`'s bit-equality fast path: numbers by
    /// value, strings by content, lists element-wise. Everything else is
    /// identity, which the fast path already decided.
    pub(crate) fn deep_equal(&self, left: Value, right: Value) -> bool {
        if Value::both_numbers(left, right) {
            return left.as_f64() == right.as_f64();
        }
        if let (Some(l), Some(r)) = (self.value_str(left), self.value_str(right)) {
            return l == r;
        }
        if left.is_pointer() && right.is_pointer() {
            let (l, r) = (
                &self.heap.get(left.as_object_id()).data,
                &self.heap.get(right.as_object_id()).data,
            );
            if let (HeapData::List { elems: l }, HeapData::List { elems: r }) = (l, r) {
                return l.len() == r.len()
                    && l.iter().zip(r).all(|(a, b)| a == b || self.deep_equal(*a, *b));
            }
        }
        false
    }

    /// `Index`: the produced value is retained for the destination.
    pub(crate) fn get_index(&mut self, recv: Value, index: Value) -> Result<Value, VmError> {
        let val = self.lookup_index(recv, index)?;
        self.heap.retain(val);
        Ok(val)
    }

    fn lookup_index(&mut self, recv: Value, index: Value) -> Result<Value, VmError> {
        let found = if recv.is_pointer() {
            match &self.heap.get(recv.as_object_id()).data {
                HeapData::List { elems } => {
                    let i = index.as_f64_to_i32();
                    if index.is_number() && i >= 0 && (i as usize) < elems.len() {
                        Found::Val(elems[i as usize])
                    } else {
                        Found::OutOfBounds
                    }
                }
                HeapData::Map { entries } => {
                    Found::Val(entries.get(&index).copied().unwrap_or(Value::NONE))
                }
                _ => Found::Unsupported,
            }
        } else {
            Found::Unsupported
        };
        self.resolve_found(found)
    }

    /// `ReverseIndex`: count from the end of a list.
    pub(crate) fn get_reverse_index(&mut self, recv: Value, index: Value) -> Result<Value, VmError> {
        let found = if recv.is_pointer() {
            match &self.heap.get(recv.as_object_id()).data {
                HeapData::List { elems } => {
                    let i = index.as_f64_to_i32();
                    if index.is_number() && i > 0 && i as usize <= elems.len() {
                        Found::Val(elems[elems.len() - i as usize])
                    } else {
                        Found::OutOfBounds
                    }
                }
                _ => Found::Unsupported,
            }
        } else {
            Found::Unsupported
        };
        let val = self.resolve_found(found)?;
        self.heap.retain(val);
        Ok(val)
    }

    fn resolve_found(&mut self, found: Found) -> Result<Value, VmError> {
        match found {
            Found::Val(val) => Ok(val),
            Found::OutOfBounds => {
                self.panic_static(msg::INDEX_OUT_OF_BOUNDS);
                self.escape_panic()
            }
            Found::Unsupported => {
                self.panic_static(msg::UNSUPPORTED_INDEX);
                self.escape_panic()
            }
        }
    }

    /// `SetIndex`/`SetIndexRelease`: the stored reference moves from the
    /// register; the release variant drops the displaced value.
    pub(crate) fn set_index(
        &mut self,
        recv: Value,
        index: Value,
        right: Value,
        release_old: bool,
    ) -> Result<(), VmError> {
        let stored = if recv.is_pointer() {
            match &mut self.heap.get_mut(recv.as_object_id()).data {
                HeapData::List { elems } => {
                    let i = index.as_f64_to_i32();
                    if index.is_number() && i >= 0 && (i as usize) < elems.len() {
                        Stored::Old(Some(core::mem::replace(&mut elems[i as usize], right)))
                    } else {
                        Stored::OutOfBounds
                    }
                }
                HeapData::Map { entries } => Stored::Old(entries.insert(index, right)),
                _ => Stored::Unsupported,
            }
        } else {
            Stored::Unsupported
        };
        match stored {
            Stored::Old(old) => {
                if release_old {
                    if let Some(old) = old {
                        self.heap.release(old);
                    }
                }
                Ok(())
            }
            Stored::OutOfBounds => {
                self.panic_static(msg::INDEX_OUT_OF_BOUNDS);
                self.escape_panic()
            }
            Stored::Unsupported => {
                self.panic_static(msg::UNSUPPORTED_INDEX);
                self.escape_panic()
            }
        }
    }

    /// `Slice` over lists and the string family. List slices retain the
    /// copied elements; heap-string slices retain their parent.
    pub(crate) fn slice(&mut self, recv: Value, start: Value, end: Value) -> Result<Value, VmError> {
        let start_i = if start.is_none() { 0 } else { self.to_f64(start) as i64 };
        let end_val = |len: i64, vm: &Vm| if end.is_none() { len } else { vm.to_f64(end) as i64 };

        if recv.is_pointer() {
            let id = recv.as_object_id();
            let src = match &self.heap.get(id).data {
                HeapData::List { elems } => Some((SliceSrc::List, elems.len())),
                HeapData::Astring { bytes } => Some((SliceSrc::Astring, bytes.len())),
                _ => None,
            };
            let Some((src, len)) = src else {
                self.panic_static(msg::UNSUPPORTED_SLICE);
                return self.escape_panic();
            };
            let end_i = end_val(len as i64, self);
            if start_i < 0 || end_i < start_i || end_i as usize > len {
                self.panic_static(msg::INDEX_OUT_OF_BOUNDS);
                return self.escape_panic();
            }
            return match src {
                SliceSrc::List => {
                    let slice = match &self.heap.get(id).data {
                        HeapData::List { elems } => {
                            elems[start_i as usize..end_i as usize].to_vec()
                        }
                        _ => Vec::new(),
                    };
                    for v in &slice {
                        self.heap.retain(*v);
                    }
                    self.heap.new_list(slice)
                }
                SliceSrc::Astring => {
                    self.heap.retain(recv);
                    self.heap.new_string_slice(recv, start_i as u32, (end_i - start_i) as u32)
                }
            };
        }
        if recv.assume_not_ptr_is_static_string() {
            let (s_start, s_len) = recv.static_string_slice();
            let end_i = end_val(s_len as i64, self);
            if start_i < 0 || end_i < start_i || end_i as u32 > s_len {
                self.panic_static(msg::INDEX_OUT_OF_BOUNDS);
                return self.escape_panic();
            }
            return Ok(Value::static_astring(
                s_start + start_i as u32,
                (end_i - start_i) as u16,
            ));
        }
        self.panic_static(msg::UNSUPPORTED_SLICE);
        self.escape_panic()
    }

    /// `StringTemplate`: interleave the n+1 constant string parts with the
    /// n stringified expression values.
    pub(crate) fn string_template(
        &mut self,
        idx_base: usize,
        str_count: usize,
        fp: usize,
        start: u8,
    ) -> Result<Value, VmError> {
        let parts: Vec<String> = (0..str_count)
            .map(|i| {
                let part = self.consts[self.op_at(idx_base + i, 0) as usize];
                self.value_display(part)
            })
            .collect();
        let exprs: Vec<String> = (0..str_count - 1)
            .map(|i| self.value_display(self.reg(fp, start + i as u8)))
            .collect();
        let out: String = parts.iter().interleave(exprs.iter()).join("");
        if out.is_ascii() {
            self.heap.new_astring(out.into_bytes())
        } else {
            self.heap.new_ustring(out)
        }
    }

    /// Human form of a value, used by templates.
    pub(crate) fn value_display(&self, val: Value) -> String {
        if val.is_number() {
            let n = val.as_f64();
            if n.fract() == 0.0 && n.abs() < 1e15 {
                return format!("{}", n as i64);
            }
            return format!("{n}");
        }
        if let Some(s) = self.value_str(val) {
            return s.to_string();
        }
        if val.is_none() {
            return "none".to_string();
        }
        if val.is_boolean() {
            return val.as_boolean().to_string();
        }
        if val.is_integer() {
            return val.as_integer().to_string();
        }
        if val.is_error() {
            return format!("error.{}", val.as_error_payload());
        }
        if val.is_pointer() {
            return self.type_name(self.type_id_of(val)).to_string();
        }
        match val.tag() {
            crate::value::TAG_SYMBOL => format!("#{}", val.bits() as u32),
            crate::value::TAG_ENUM => format!("enum({:#x})", val.bits() as u16),
            _ => format!("{val:?}"),
        }
    }

    /// `Match`: compare the expression register against each case constant
    /// (bit equality, then deep equality); returns the pc advance of the
    /// winning case or the else arm.
    pub(crate) fn op_match(&mut self, pc: usize, fp: usize) -> usize {
        let expr = self.reg(fp, self.op_at(pc, 1));
        let num_cases = self.op_at(pc, 2) as usize;
        for i in 0..num_cases {
            let const_idx = self.read_u16(pc + 3 + i * 4);
            let case = self.consts[const_idx as usize];
            if expr == case || self.deep_equal(expr, case) {
                return self.read_u16(pc + 5 + i * 4) as usize;
            }
        }
        self.read_u16(pc + 3 + num_cases * 4) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Program;

    fn vm() -> Vm {
        Vm::new(Program::new())
    }

    #[test]
    fn to_f64_fallback_coercions() {
        let vm = vm();
        assert_eq!(vm.to_f64(Value::number(2.5)), 2.5);
        assert_eq!(vm.to_f64(Value::NONE), 0.0);
        assert_eq!(vm.to_f64(Value::TRUE), 1.0);
        assert_eq!(vm.to_f64(Value::FALSE), 0.0);
        assert_eq!(vm.to_f64(Value::integer(-3)), -3.0);
        assert_eq!(vm.to_f64(Value::symbol(1)), 0.0);
    }

    #[test]
    fn deep_equal_sees_string_content() {
        let mut prog = Program::new();
        let a = prog.static_string("abc");
        let b = prog.static_string("abc");
        let c = prog.static_string("abd");
        let vm = Vm::new(prog);
        assert_ne!(a, b, "distinct slices of the buffer");
        assert!(vm.deep_equal(a, b));
        assert!(!vm.deep_equal(a, c));
    }

    #[test]
    fn list_index_bounds() {
        let mut vm = vm();
        let list = vm.heap.new_list(vec![Value::number(1.0)]).unwrap();
        assert_eq!(vm.get_index(list, Value::number(0.0)), Ok(Value::number(1.0)));
        assert_eq!(vm.get_index(list, Value::number(1.0)), Err(VmError::Panic));
        assert_eq!(
            vm.panic().message(),
            Some(msg::INDEX_OUT_OF_BOUNDS)
        );
    }

    #[test]
    fn map_index_misses_are_none() {
        let mut vm = vm();
        let map = vm.heap.new_empty_map().unwrap();
        assert_eq!(vm.get_index(map, Value::integer(1)), Ok(Value::NONE));
        vm.set_index(map, Value::integer(1), Value::number(4.0), false).unwrap();
        assert_eq!(vm.get_index(map, Value::integer(1)), Ok(Value::number(4.0)));
    }

    #[test]
    fn value_display_forms() {
        let mut prog = Program::new();
        let s = prog.static_string("hi");
        let vm = Vm::new(prog);
        assert_eq!(vm.value_display(Value::number(4.0)), "4");
        assert_eq!(vm.value_display(Value::number(1.5)), "1.5");
        assert_eq!(vm.value_display(Value::NONE), "none");
        assert_eq!(vm.value_display(Value::TRUE), "true");
        assert_eq!(vm.value_display(Value::integer(7)), "7");
        assert_eq!(vm.value_display(s), "hi");
    }

    #[test]
    fn types_are_never_deep_equal_across_kinds() {
        let vm = vm();
        assert!(!vm.deep_equal(Value::NONE, Value::FALSE));
        assert!(!vm.deep_equal(Value::integer(1), Value::number(1.0)));
    }
}
