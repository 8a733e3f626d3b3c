//! Compiler output consumed by the VM.
//!
//! A [`Program`] bundles the instruction stream, the constant pool, the
//! static string buffer and every symbol table of the handoff contract. The
//! VM takes ownership at construction: inline caches rewrite `ops`, the
//! field/method caches update their mru slots, and static slots are
//! runtime-mutable.

use crate::consts::MAX_STATIC_STRING_LEN;
use crate::symbols::{
    FieldSymbolMap, FuncEntry, FuncSig, FuncSymbol, MethodEntry, MethodSym, NameId, ResolvedSym,
    SemaTypeId, StaticVar, TypeId, VmType, FIRST_USER_SEMA, SEMA_RAWSTRING, SEMA_STATICSTRING,
    SEMA_STRING,
};
use crate::types;
use crate::value::Value;

use hashbrown::HashMap;

/// Everything the compiler hands the VM.
#[derive(Debug)]
pub struct Program {
    /// Byte-addressed instruction stream. Owned and writable: the inline
    /// caches self-modify it.
    pub ops: Vec<u8>,
    /// Constant pool of 64-bit value words.
    pub consts: Vec<Value>,
    /// Backing buffer for static string values.
    pub str_buf: Vec<u8>,
    /// Register count of the top-level frame.
    pub main_stack_size: u8,

    pub field_syms: Vec<FieldSymbolMap>,
    /// Fallback field-offset table: `(type, field sym) -> offset`.
    pub field_table: HashMap<(TypeId, u32), u8>,
    pub func_syms: Vec<FuncSymbol>,
    pub func_sigs: Vec<FuncSig>,
    pub method_syms: Vec<MethodSym>,
    /// Registry of method resolutions; inline caches store indices into it.
    pub method_entries: Vec<MethodEntry>,
    /// `(type, method sym) -> method entry index`.
    pub method_table: HashMap<(TypeId, u32), u32>,
    pub types: Vec<VmType>,
    pub resolved_syms: Vec<ResolvedSym>,
    pub names: Vec<String>,
    pub var_syms: Vec<StaticVar>,
}

impl Program {
    /// An empty program with the builtin type and sema tables installed.
    pub fn new() -> Self {
        let mut prog = Self {
            ops: Vec::new(),
            consts: Vec::new(),
            str_buf: Vec::new(),
            main_stack_size: 8,
            field_syms: Vec::new(),
            field_table: HashMap::new(),
            func_syms: Vec::new(),
            func_sigs: Vec::new(),
            method_syms: Vec::new(),
            method_entries: Vec::new(),
            method_table: HashMap::new(),
            types: Vec::new(),
            resolved_syms: Vec::new(),
            names: Vec::new(),
            var_syms: Vec::new(),
        };
        prog.install_builtins();
        prog
    }

    fn install_builtins(&mut self) {
        // Abstract sema symbols first, pinned to their reserved ids.
        for name in ["any", "dynamic", "number", "string", "staticstring", "rawstring"] {
            let name_id = self.intern_name(name);
            self.resolved_syms.push(ResolvedSym { name_id });
        }
        debug_assert_eq!(self.resolved_syms.len() as SemaTypeId, FIRST_USER_SEMA);

        // Concrete builtin types; string-shaped ones share the abstract
        // string semas so casts and type checks see through the shapes.
        let builtin: [(&str, Option<SemaTypeId>); 22] = [
            ("none", None),
            ("boolean", None),
            ("error", None),
            ("staticAstring", Some(SEMA_STATICSTRING)),
            ("staticUstring", Some(SEMA_STATICSTRING)),
            ("enum", None),
            ("symbol", None),
            ("int", None),
            ("number", Some(crate::symbols::SEMA_NUMBER)),
            ("List", None),
            ("Map", None),
            ("Closure", None),
            ("Lambda", None),
            ("Astring", Some(SEMA_STRING)),
            ("Ustring", Some(SEMA_STRING)),
            ("StringSlice", Some(SEMA_STRING)),
            ("rawstring", Some(SEMA_RAWSTRING)),
            ("RawStringSlice", Some(SEMA_RAWSTRING)),
            ("Fiber", None),
            ("Box", None),
            ("NativeFunc", None),
            ("MetaType", None),
        ];
        for (name, sema) in builtin {
            let type_sym_id = match sema {
                Some(id) => id,
                None => {
                    let name_id = self.intern_name(name);
                    self.resolved_syms.push(ResolvedSym { name_id });
                    self.resolved_syms.len() as SemaTypeId - 1
                }
            };
            self.types.push(VmType { type_sym_id, name: name.to_string() });
        }
        debug_assert_eq!(self.types.len() as TypeId, types::FIRST_USER_TYPE);
    }

    /// Intern a name, returning its id.
    pub fn intern_name(&mut self, name: &str) -> NameId {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            return pos as NameId;
        }
        self.names.push(name.to_string());
        self.names.len() as NameId - 1
    }

    /// Register a user object type, returning its runtime type id.
    pub fn add_type(&mut self, name: &str) -> TypeId {
        let name_id = self.intern_name(name);
        self.resolved_syms.push(ResolvedSym { name_id });
        let type_sym_id = self.resolved_syms.len() as SemaTypeId - 1;
        self.types.push(VmType { type_sym_id, name: name.to_string() });
        self.types.len() as TypeId - 1
    }

    /// Register a field symbol, returning its id.
    pub fn add_field_sym(&mut self, name: &str) -> u32 {
        let name_id = self.intern_name(name);
        self.field_syms.push(FieldSymbolMap::new(name_id));
        self.field_syms.len() as u32 - 1
    }

    /// Record a field offset for `(type, field sym)`.
    pub fn set_field_offset(&mut self, type_id: TypeId, field_sym: u32, offset: u8) {
        self.field_table.insert((type_id, field_sym), offset);
    }

    /// Declare the sema type constraint of a field symbol.
    pub fn set_field_constraint(&mut self, field_sym: u32, sema: SemaTypeId) {
        self.field_syms[field_sym as usize].mru_field_type_sym_id = sema;
    }

    /// Register a function symbol, returning its id.
    pub fn add_func_sym(&mut self, name: &str, entry: FuncEntry) -> u16 {
        let name_id = self.intern_name(name);
        self.func_syms.push(FuncSymbol { name_id, entry });
        self.func_syms.len() as u16 - 1
    }

    /// Register a resolved function signature, returning its id.
    pub fn add_func_sig(&mut self, params: Vec<SemaTypeId>, ret: SemaTypeId) -> u16 {
        self.func_sigs.push(FuncSig { params, ret });
        self.func_sigs.len() as u16 - 1
    }

    /// Register a method symbol, returning its id.
    pub fn add_method_sym(&mut self, name: &str) -> u8 {
        let name_id = self.intern_name(name);
        self.method_syms.push(MethodSym::new(name_id));
        self.method_syms.len() as u8 - 1
    }

    /// Bind a method entry for `(type, method sym)`.
    pub fn add_method(&mut self, type_id: TypeId, method_sym: u8, entry: MethodEntry) {
        self.method_entries.push(entry);
        let idx = self.method_entries.len() as u32 - 1;
        self.method_table.insert((type_id, method_sym as u32), idx);
    }

    /// Register a static variable slot, returning its id. The slot takes
    /// ownership of one reference when the value is a pointer — the
    /// embedder retains before handoff if it keeps its own.
    pub fn add_static_var(&mut self, value: Value) -> u16 {
        self.var_syms.push(StaticVar { value });
        self.var_syms.len() as u16 - 1
    }

    /// Append a constant word, returning its pool index.
    pub fn add_const(&mut self, value: Value) -> u16 {
        self.consts.push(value);
        self.consts.len() as u16 - 1
    }

    /// Append string bytes to the static buffer and pool the resulting
    /// static string value, returning its pool index.
    pub fn add_static_string(&mut self, s: &str) -> u16 {
        let value = self.static_string(s);
        self.add_const(value)
    }

    /// Build a static string value over the buffer without pooling it.
    pub fn static_string(&mut self, s: &str) -> Value {
        assert!(s.len() <= MAX_STATIC_STRING_LEN, "static string too long");
        let start = self.str_buf.len() as u32;
        self.str_buf.extend_from_slice(s.as_bytes());
        if s.is_ascii() {
            Value::static_astring(start, s.len() as u16)
        } else {
            Value::static_ustring(start, s.len() as u16)
        }
    }
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}
