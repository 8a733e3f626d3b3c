//! Heap objects and reference counting.
//!
//! Objects live in a slab: a pointer value carries a slot index, never a
//! machine address. Two allocation entry points mirror the allocator's size
//! classes — a pool for small fixed-shape objects and an external path for
//! variable-size ones — both drawing on the same slot vector and the same
//! live-object budget.
//!
//! Every live reachable pointer value contributes exactly one to its
//! target's refcount, and `ref_total` equals the sum of all object
//! refcounts. An object is freed exactly when its count drops from 1 to 0;
//! the finalizer releases contained values and returns the slot to the free
//! list with its type id cleared, so debug builds can catch revived
//! references.

use crate::consts::{CLOSURE_POOL_CAPTURES, NULL_U32};
use crate::error::VmError;
use crate::fiber::Fiber;
use crate::symbols::{NativeFn, TypeId};
use crate::types;
use crate::value::Value;

use hashbrown::HashMap;

/// Index of a heap slot. The payload of a pointer [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub(crate) u32);

impl ObjectId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Object header: runtime type id and reference count.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub type_id: TypeId,
    pub rc: u32,
}

/// A heap slot.
#[derive(Debug)]
pub struct HeapObject {
    pub header: Header,
    pub data: HeapData,
}

/// Concrete object shapes. All share the [`Header`].
#[derive(Debug)]
pub enum HeapData {
    /// Slot is on the free list.
    Free,
    /// User-defined composite; fields are raw values.
    Object { fields: Vec<Value> },
    /// Function with captured locals. Captured slots hold `Box` values.
    Closure {
        func_pc: u32,
        num_params: u8,
        stack_size: u8,
        /// Frame slot the closure value is copied into on call, so
        /// `Captured` can reach it.
        local: u8,
        r_func_sig_id: u16,
        captured: Vec<Value>,
    },
    /// Captureless function value.
    Lambda { func_pc: u32, num_params: u8, stack_size: u8, r_func_sig_id: u16 },
    /// Single-cell mutable box; desugars captured locals.
    Box { val: Value },
    /// Native function value.
    NativeFunc { func: NativeFn, num_params: u8, r_func_sig_id: u16 },
    /// A type reified as a value.
    MetaType { kind: u8, sym_id: u32 },
    /// Cooperative thread of execution; carries its own register stack.
    Fiber(Box<Fiber>),
    List { elems: Vec<Value> },
    Map { entries: HashMap<Value, Value> },
    /// Heap ASCII string.
    Astring { bytes: Vec<u8> },
    /// Heap UTF-8 string.
    Ustring { s: String },
    /// Substring view keeping its parent string alive.
    StringSlice { parent: Value, start: u32, len: u32 },
    RawString { bytes: Vec<u8> },
    RawStringSlice { parent: Value, start: u32, len: u32 },
}

/// Always-on retain/release accounting, used by the invariant-checking
/// tests and the embedder's leak diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub retains: u64,
    pub releases: u64,
    pub allocs: u64,
    pub pool_allocs: u64,
    pub external_allocs: u64,
    pub frees: u64,
}

/// Slab heap with a free list and a live-object budget.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<HeapObject>,
    free: Vec<u32>,
    live: usize,
    max_objects: usize,
    /// Sum of all object refcounts.
    ref_total: u64,
    pub(crate) stats: HeapStats,
}

impl Heap {
    pub fn new(max_objects: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            max_objects,
            ref_total: 0,
            stats: HeapStats::default(),
        }
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Sum of all object refcounts.
    pub fn ref_total(&self) -> u64 {
        self.ref_total
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    #[inline]
    pub fn get(&self, id: ObjectId) -> &HeapObject {
        &self.slots[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: ObjectId) -> &mut HeapObject {
        &mut self.slots[id.index()]
    }

    /// Runtime type id of any value; never allocates, never panics.
    #[inline]
    pub fn type_id_of(&self, val: Value) -> TypeId {
        if val.is_pointer() {
            self.get(val.as_object_id()).header.type_id
        } else {
            types::primitive_type_id(val)
        }
    }

    fn alloc(&mut self, type_id: TypeId, data: HeapData) -> Result<ObjectId, VmError> {
        if self.live >= self.max_objects {
            return Err(VmError::OutOfMemory);
        }
        self.live += 1;
        self.ref_total += 1;
        self.stats.allocs += 1;
        let obj = HeapObject { header: Header { type_id, rc: 1 }, data };
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = obj;
                Ok(ObjectId(slot))
            }
            None => {
                self.slots.push(obj);
                Ok(ObjectId(self.slots.len() as u32 - 1))
            }
        }
    }

    /// Pool entry point for small fixed-shape objects.
    pub(crate) fn alloc_pool(&mut self, type_id: TypeId, data: HeapData) -> Result<Value, VmError> {
        let id = self.alloc(type_id, data)?;
        self.stats.pool_allocs += 1;
        Ok(Value::pointer(id))
    }

    /// External entry point for variable-size objects.
    pub(crate) fn alloc_external(
        &mut self,
        type_id: TypeId,
        data: HeapData,
    ) -> Result<Value, VmError> {
        let id = self.alloc(type_id, data)?;
        self.stats.external_allocs += 1;
        Ok(Value::pointer(id))
    }

    pub fn new_object(&mut self, type_id: TypeId, fields: Vec<Value>) -> Result<Value, VmError> {
        self.alloc_external(type_id, HeapData::Object { fields })
    }

    pub fn new_object_small(
        &mut self,
        type_id: TypeId,
        fields: Vec<Value>,
    ) -> Result<Value, VmError> {
        self.alloc_pool(type_id, HeapData::Object { fields })
    }

    pub fn new_lambda(
        &mut self,
        func_pc: u32,
        num_params: u8,
        stack_size: u8,
        r_func_sig_id: u16,
    ) -> Result<Value, VmError> {
        self.alloc_pool(
            types::TYPE_LAMBDA,
            HeapData::Lambda { func_pc, num_params, stack_size, r_func_sig_id },
        )
    }

    /// Closures with few captures fit the pool; larger ones go external.
    /// Captured slots are retained as they are copied in.
    #[allow(clippy::too_many_arguments)]
    pub fn new_closure(
        &mut self,
        func_pc: u32,
        num_params: u8,
        stack_size: u8,
        local: u8,
        r_func_sig_id: u16,
        captured: Vec<Value>,
    ) -> Result<Value, VmError> {
        for cap in &captured {
            debug_assert!(
                cap.is_pointer() && self.get(cap.as_object_id()).header.type_id == types::TYPE_BOX,
                "captured slot must hold a box value"
            );
            self.retain(*cap);
        }
        let pooled = captured.len() <= CLOSURE_POOL_CAPTURES;
        let data = HeapData::Closure {
            func_pc,
            num_params,
            stack_size,
            local,
            r_func_sig_id,
            captured,
        };
        if pooled {
            self.alloc_pool(types::TYPE_CLOSURE, data)
        } else {
            self.alloc_external(types::TYPE_CLOSURE, data)
        }
    }

    pub fn new_box(&mut self, val: Value) -> Result<Value, VmError> {
        self.alloc_pool(types::TYPE_BOX, HeapData::Box { val })
    }

    pub fn new_native_func(
        &mut self,
        func: NativeFn,
        num_params: u8,
        r_func_sig_id: u16,
    ) -> Result<Value, VmError> {
        self.alloc_pool(
            types::TYPE_NATIVE_FUNC,
            HeapData::NativeFunc { func, num_params, r_func_sig_id },
        )
    }

    pub fn new_metatype(&mut self, kind: u8, sym_id: u32) -> Result<Value, VmError> {
        self.alloc_pool(types::TYPE_METATYPE, HeapData::MetaType { kind, sym_id })
    }

    pub fn new_fiber(&mut self, fiber: Fiber) -> Result<Value, VmError> {
        self.alloc_external(types::TYPE_FIBER, HeapData::Fiber(Box::new(fiber)))
    }

    pub fn new_list(&mut self, elems: Vec<Value>) -> Result<Value, VmError> {
        self.alloc_external(types::TYPE_LIST, HeapData::List { elems })
    }

    pub fn new_map(&mut self, entries: HashMap<Value, Value>) -> Result<Value, VmError> {
        self.alloc_external(types::TYPE_MAP, HeapData::Map { entries })
    }

    pub fn new_empty_map(&mut self) -> Result<Value, VmError> {
        self.alloc_pool(types::TYPE_MAP, HeapData::Map { entries: HashMap::new() })
    }

    pub fn new_astring(&mut self, bytes: Vec<u8>) -> Result<Value, VmError> {
        self.alloc_external(types::TYPE_ASTRING, HeapData::Astring { bytes })
    }

    pub fn new_ustring(&mut self, s: String) -> Result<Value, VmError> {
        self.alloc_external(types::TYPE_USTRING, HeapData::Ustring { s })
    }

    pub fn new_string_slice(
        &mut self,
        parent: Value,
        start: u32,
        len: u32,
    ) -> Result<Value, VmError> {
        self.alloc_pool(types::TYPE_STRING_SLICE, HeapData::StringSlice { parent, start, len })
    }

    pub fn new_rawstring(&mut self, bytes: Vec<u8>) -> Result<Value, VmError> {
        self.alloc_external(types::TYPE_RAWSTRING, HeapData::RawString { bytes })
    }

    pub fn new_rawstring_slice(
        &mut self,
        parent: Value,
        start: u32,
        len: u32,
    ) -> Result<Value, VmError> {
        self.alloc_pool(
            types::TYPE_RAWSTRING_SLICE,
            HeapData::RawStringSlice { parent, start, len },
        )
    }

    /// Increment the target's refcount. No-op for non-pointers.
    #[inline]
    pub fn retain(&mut self, val: Value) {
        if val.is_pointer() {
            self.retain_object(val.as_object_id());
        }
    }

    #[inline]
    pub fn retain_object(&mut self, id: ObjectId) {
        debug_assert_ne!(self.get(id).header.type_id, NULL_U32, "retain of freed object");
        self.slots[id.index()].header.rc += 1;
        self.ref_total += 1;
        self.stats.retains += 1;
    }

    /// Decrement the target's refcount, freeing it when the count reaches
    /// zero. The finalizer releases contained values iteratively, so deep
    /// ownership chains do not recurse.
    #[inline]
    pub fn release(&mut self, val: Value) {
        if val.is_pointer() {
            self.release_object(val.as_object_id());
        }
    }

    pub fn release_object(&mut self, id: ObjectId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let obj = &mut self.slots[id.index()];
            debug_assert_ne!(obj.header.type_id, NULL_U32, "release of freed object");
            obj.header.rc -= 1;
            self.ref_total -= 1;
            self.stats.releases += 1;
            if obj.header.rc == 0 {
                self.free_object(id, &mut work);
            }
        }
    }

    /// Free hook: queue contained pointers for release and recycle the
    /// slot. The cleared type id flags the slot as dead until reuse.
    fn free_object(&mut self, id: ObjectId, work: &mut Vec<ObjectId>) {
        let obj = &mut self.slots[id.index()];
        obj.header.type_id = NULL_U32;
        let data = core::mem::replace(&mut obj.data, HeapData::Free);
        let mut queue = |val: Value| {
            if val.is_pointer() {
                work.push(val.as_object_id());
            }
        };
        match data {
            HeapData::Free => {}
            HeapData::Object { fields } => fields.into_iter().for_each(&mut queue),
            HeapData::Closure { captured, .. } => captured.into_iter().for_each(&mut queue),
            HeapData::Lambda { .. }
            | HeapData::NativeFunc { .. }
            | HeapData::MetaType { .. }
            | HeapData::Astring { .. }
            | HeapData::Ustring { .. }
            | HeapData::RawString { .. } => {}
            HeapData::Box { val } => queue(val),
            HeapData::Fiber(fiber) => {
                // Frame-header words on the stack are raw indices, never
                // pointer-tagged, so a blanket release is sound.
                fiber.stack.into_iter().for_each(&mut queue);
            }
            HeapData::List { elems } => elems.into_iter().for_each(&mut queue),
            HeapData::Map { entries } => {
                for (k, v) in entries {
                    queue(k);
                    queue(v);
                }
            }
            HeapData::StringSlice { parent, .. } | HeapData::RawStringSlice { parent, .. } => {
                queue(parent)
            }
        }
        self.free.push(id.0);
        self.live -= 1;
        self.stats.frees += 1;
    }
}
