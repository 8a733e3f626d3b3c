//! Instruction stream representation.
//!
//! The stream is byte-addressed: an opcode byte followed by a fixed
//! per-opcode operand block, multi-byte fields little-endian. Inline-cache
//! variants reserve trailing bytes that the dispatcher writes after a miss;
//! a generic opcode and its IC variants always share one length, so cache
//! rewrites never move neighboring instructions. Any change to an opcode's
//! length is a wire break between the compiler and the VM.

use num_enum::TryFromPrimitive;
use strum::EnumIter;

/// Opcode set of the dispatch loop.
///
/// Discriminants are the wire encoding. Operand layouts are listed as
/// `[name:width]` with byte offsets implied by order; `..` marks bytes
/// reserved for inline-cache data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    /// `[idx:u16, dst:u8]` — copy a constant-pool word.
    ConstOp = 0,
    /// `[imm:i8, dst:u8]` — sign-extend an immediate into a number.
    ConstI8 = 1,
    /// `[imm:i8, dst:u8]` — sign-extend an immediate into a tagged integer.
    ConstI8Int = 2,
    /// `[left:u8, right:u8, dst:u8]`
    Add = 3,
    Sub = 4,
    /// `[dst:u8]`
    True = 5,
    False = 6,
    None = 7,
    /// `[dst:u8]` — logical negation in place, with truthiness coercion.
    Not = 8,
    /// `[src:u8, dst:u8]` — copy without touching refcounts.
    Copy = 9,
    /// `[src:u8, dst:u8]` — release the old destination, then copy.
    CopyReleaseDst = 10,
    /// `[recv:u8, index:u8, right:u8]`
    SetIndex = 11,
    SetIndexRelease = 12,
    /// `[src:u8, dst:u8]` — copy and retain the source.
    CopyRetainSrc = 13,
    /// `[recv:u8, index:u8, dst:u8]`
    Index = 14,
    ReverseIndex = 15,
    /// `[start:u8, n:u8, dst:u8]` — build a list from a register span.
    List = 16,
    /// `[start:u8, n:u8, dst:u8, keyIdx:u16 × n]` — build a map from
    /// constant-pool keys and a register span of values.
    Map = 17,
    /// `[dst:u8]`
    MapEmpty = 18,
    /// `[recv:u8, start:u8, end:u8, dst:u8]`
    Slice = 19,
    /// `[cond:u8, offset:u16]` — forward branch when falsey.
    JumpNotCond = 20,
    /// `[offset:i16, cond:u8]` — relative branch when truthy.
    JumpCond = 21,
    /// `[offset:i16]` — unconditional relative branch.
    Jump = 22,
    /// `[local:u8]`
    Release = 23,
    /// `[n:u8, local:u8 × n]`
    ReleaseN = 24,
    /// `[start:u8, nargs:u8, nret:u8, sym:u8, anySelfSig:u16, ..]` — method
    /// dispatch on the receiver type.
    CallObjSym = 25,
    /// IC variant: `[.., entry:u48@8, type:u16@14]`.
    CallObjNativeFuncIC = 26,
    /// IC variant: `[.., nlocals:u8@7, pc:u32@8, type:u16@14]`.
    CallObjFuncIC = 27,
    /// `[argStart:u8, nargs:u8, sig:u16]` — check arguments against a
    /// resolved signature before the following call instruction.
    CallTypeCheck = 28,
    /// `[start:u8, nargs:u8, nret:u8, sym:u16, ..]`
    CallSym = 29,
    /// IC variant: `[.., nlocals:u8@4, pc:u48@6]`.
    CallFuncIC = 30,
    /// IC variant: `[.., entry:u48@6]`.
    CallNativeFuncIC = 31,
    /// Return one value.
    Ret1 = 32,
    /// Return no value.
    Ret0 = 33,
    /// `[start:u8, nargs:u8, nret:u8]` — call a callee value in a register.
    Call = 34,
    /// `[recv:u8, dst:u8, sym:u16, ..]` — field read.
    Field = 35,
    /// IC variant: `[.., type:u16@5, offset:u8@7]`.
    FieldIC = 36,
    FieldRetain = 37,
    FieldRetainIC = 38,
    /// `[negOffset:u8, nparams:u8, stackSize:u8, sig:u16, dst:u8]`
    Lambda = 39,
    /// `[negOffset:u8, nparams:u8, ncaptured:u8, stackSize:u8, sig:u16,
    /// local:u8, dst:u8, captured:u8 × n]`
    Closure = 40,
    /// `[left:u8, right:u8, dst:u8]` — bit-equal fast path, then deep
    /// compare.
    Compare = 41,
    Less = 42,
    Greater = 43,
    LessEqual = 44,
    GreaterEqual = 45,
    Mul = 46,
    Div = 47,
    Pow = 48,
    Mod = 49,
    CompareNot = 50,
    /// `[start:u8, nexprs:u8, dst:u8, strIdx:u8 × (n+1)]`
    StringTemplate = 51,
    /// `[dst:u8]` — numeric negation in place.
    Neg = 52,
    /// `[start:u8, n:u8]` — fill locals with `none`.
    Init = 53,
    /// `[type:u8, start:u8, nfields:u8, dst:u8]` — pool allocation.
    ObjectSmall = 54,
    /// `[type:u8, start:u8, nfields:u8, dst:u8]` — external allocation.
    Object = 55,
    /// `[sym:u8, recv:u8, right:u8]`
    SetField = 56,
    /// `[recv:u8, right:u8, sym:u8, ..]`
    SetFieldRelease = 57,
    /// IC variant: `[.., type:u16@4, offset:u8@6]`.
    SetFieldReleaseIC = 58,
    /// `[recv:u8, right:u8, sym:u8, ..]` — type-checked field store.
    SetCheckFieldRelease = 59,
    /// `[errDst:u8, catchOffset:u16]`
    PushTry = 60,
    /// `[offset:u16]` — pop the try frame and jump past the handler.
    PopTry = 61,
    /// `[err:u8]`
    Throw = 62,
    /// `[argStart:u8, nargs:u8, jump:u8, stackSize:u8, dst:u8]`
    Coinit = 63,
    /// No operands used; length reserves the resume offset.
    Coyield = 64,
    /// `[fiber:u8, dst:u8]`
    Coresume = 65,
    Coreturn = 66,
    /// `[local:u8]`
    Retain = 67,
    /// `[src:u8, dst:u8]`
    CopyRetainRelease = 68,
    /// `[src:u8, dst:u8]` — box a value into a fresh cell.
    Box = 69,
    /// `[box:u8, right:u8]`
    SetBoxValue = 70,
    SetBoxValueRelease = 71,
    /// `[box:u8, dst:u8]`
    BoxValue = 72,
    BoxValueRetain = 73,
    /// `[closure:u8, idx:u8, dst:u8]` — read a captured box.
    Captured = 74,
    /// `[tag:u8, member:u8, dst:u8]`
    Tag = 75,
    /// `[sym:u8, dst:u8]`
    TagLiteral = 76,
    /// `[val:u8, type:u16]` — concrete type check.
    Cast = 77,
    /// `[val:u8, semaType:u16]` — abstract type check.
    CastAbstract = 78,
    BitwiseAnd = 79,
    BitwiseOr = 80,
    BitwiseXor = 81,
    /// `[dst:u8]` — in place.
    BitwiseNot = 82,
    BitwiseLeftShift = 83,
    BitwiseRightShift = 84,
    /// `[offset:i16, val:u8]`
    JumpNotNone = 85,
    /// Integer fast path; no type check.
    AddInt = 86,
    SubInt = 87,
    LessInt = 88,
    /// `[start:u8, end:u8, step:u8, counter:u8, userVar:u8, bodyOffset:u16]`
    ForRangeInit = 89,
    /// `[counter:u8, step:u8, end:u8, userVar:u8, backOffset:u16]`
    ForRange = 90,
    ForRangeReverse = 91,
    /// `[expr:u8, ncases:u8, (constIdx:u16, offset:u16) × n, elseOffset:u16]`
    Match = 92,
    /// `[func:u16, dst:u8]`
    StaticFunc = 93,
    /// `[sym:u16, dst:u8]`
    StaticVar = 94,
    /// `[sym:u16, src:u8]`
    SetStaticVar = 95,
    /// `[func:u16, src:u8]`
    SetStaticFunc = 96,
    /// `[kind:u8, sym:u32, dst:u8]` — reify a type as a value.
    Sym = 97,
    /// `[result:u8]` — finalize execution with success.
    End = 98,
}

impl OpCode {
    /// Instruction length in bytes, opcode included. `None` for the
    /// variable-length instructions (`Map`, `ReleaseN`, `Closure`,
    /// `StringTemplate`, `Match`). IC variants share the generic form's
    /// length by construction.
    pub const fn inst_len(self) -> Option<usize> {
        use OpCode::*;
        let len = match self {
            Ret1 | Ret0 | Coreturn => 1,
            True | False | None | Not | Neg | BitwiseNot | Release | Retain | Throw | MapEmpty
            | End => 2,
            ConstI8 | ConstI8Int | Copy | CopyReleaseDst | CopyRetainSrc | CopyRetainRelease
            | Jump | PopTry | Coyield | Coresume | Box | SetBoxValue | SetBoxValueRelease
            | BoxValue | BoxValueRetain | TagLiteral | Init => 3,
            ConstOp | Add | Sub | Mul | Div | Pow | Mod | Less | Greater | LessEqual
            | GreaterEqual | Compare | CompareNot | BitwiseAnd | BitwiseOr | BitwiseXor
            | BitwiseLeftShift | BitwiseRightShift | AddInt | SubInt | LessInt | SetIndex
            | SetIndexRelease | Index | ReverseIndex | List | JumpNotCond | JumpCond
            | JumpNotNone | Call | SetField | PushTry | Captured | Tag | Cast | CastAbstract
            | StaticFunc | StaticVar | SetStaticVar | SetStaticFunc => 4,
            Slice | CallTypeCheck | ObjectSmall | Object => 5,
            Coinit => 6,
            Lambda | Sym | ForRange | ForRangeReverse | SetFieldRelease | SetFieldReleaseIC
            | SetCheckFieldRelease => 7,
            Field | FieldIC | FieldRetain | FieldRetainIC | ForRangeInit => 8,
            CallSym | CallFuncIC | CallNativeFuncIC => crate::consts::CALL_SYM_INST_LEN as usize,
            CallObjSym | CallObjNativeFuncIC | CallObjFuncIC => {
                crate::consts::CALL_OBJ_SYM_INST_LEN as usize
            }
            Map | ReleaseN | Closure | StringTemplate | Match => return Option::None,
        };
        Some(len)
    }

    /// The generic form an IC variant deoptimizes back to; identity for
    /// non-IC opcodes.
    pub const fn deopt(self) -> OpCode {
        use OpCode::*;
        match self {
            CallObjNativeFuncIC | CallObjFuncIC => CallObjSym,
            CallFuncIC | CallNativeFuncIC => CallSym,
            FieldIC => Field,
            FieldRetainIC => FieldRetain,
            SetFieldReleaseIC => SetFieldRelease,
            other => other,
        }
    }
}

#[inline]
pub(crate) fn read_u16(ops: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([ops[at], ops[at + 1]])
}

#[inline]
pub(crate) fn read_i16(ops: &[u8], at: usize) -> i16 {
    read_u16(ops, at) as i16
}

#[inline]
pub(crate) fn read_u32(ops: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([ops[at], ops[at + 1], ops[at + 2], ops[at + 3]])
}

#[inline]
pub(crate) fn read_u48(ops: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..6].copy_from_slice(&ops[at..at + 6]);
    u64::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn write_u16(ops: &mut [u8], at: usize, v: u16) {
    ops[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_u32(ops: &mut [u8], at: usize, v: u32) {
    ops[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub(crate) fn write_u48(ops: &mut [u8], at: usize, v: u64) {
    ops[at..at + 6].copy_from_slice(&v.to_le_bytes()[..6]);
}

/// Instruction writer.
///
/// Emits instructions with the exact operand layouts the dispatch loop
/// expects, zero-filling IC reserve bytes. The compiler front end and the
/// test suite both assemble programs through this.
#[derive(Debug, Default, Clone)]
pub struct Asm {
    buf: Vec<u8>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte offset; the pc of the next emitted instruction.
    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    /// Finished instruction stream.
    pub fn into_ops(self) -> Vec<u8> {
        self.buf
    }

    fn op(&mut self, op: OpCode) -> &mut Self {
        self.buf.push(op as u8);
        self
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i16(&mut self, v: i16) -> &mut Self {
        self.u16(v as u16)
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn reserve(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    pub fn const_op(&mut self, idx: u16, dst: u8) -> &mut Self {
        self.op(OpCode::ConstOp).u16(idx).u8(dst)
    }

    pub fn const_i8(&mut self, imm: i8, dst: u8) -> &mut Self {
        self.op(OpCode::ConstI8).u8(imm as u8).u8(dst)
    }

    pub fn const_i8_int(&mut self, imm: i8, dst: u8) -> &mut Self {
        self.op(OpCode::ConstI8Int).u8(imm as u8).u8(dst)
    }

    /// Any `[left, right, dst]` binary operator.
    pub fn binary(&mut self, op: OpCode, left: u8, right: u8, dst: u8) -> &mut Self {
        self.op(op).u8(left).u8(right).u8(dst)
    }

    /// Any `[dst]` single-register opcode (`True`, `Not`, `Neg`, ...).
    pub fn unary(&mut self, op: OpCode, dst: u8) -> &mut Self {
        self.op(op).u8(dst)
    }

    pub fn copy(&mut self, src: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Copy).u8(src).u8(dst)
    }

    pub fn copy_retain_src(&mut self, src: u8, dst: u8) -> &mut Self {
        self.op(OpCode::CopyRetainSrc).u8(src).u8(dst)
    }

    pub fn copy_release_dst(&mut self, src: u8, dst: u8) -> &mut Self {
        self.op(OpCode::CopyReleaseDst).u8(src).u8(dst)
    }

    pub fn copy_retain_release(&mut self, src: u8, dst: u8) -> &mut Self {
        self.op(OpCode::CopyRetainRelease).u8(src).u8(dst)
    }

    pub fn release(&mut self, local: u8) -> &mut Self {
        self.op(OpCode::Release).u8(local)
    }

    pub fn release_n(&mut self, locals: &[u8]) -> &mut Self {
        self.op(OpCode::ReleaseN).u8(locals.len() as u8);
        self.buf.extend_from_slice(locals);
        self
    }

    pub fn retain(&mut self, local: u8) -> &mut Self {
        self.op(OpCode::Retain).u8(local)
    }

    pub fn list(&mut self, start: u8, n: u8, dst: u8) -> &mut Self {
        self.op(OpCode::List).u8(start).u8(n).u8(dst)
    }

    pub fn map(&mut self, start: u8, key_idxs: &[u16], dst: u8) -> &mut Self {
        self.op(OpCode::Map).u8(start).u8(key_idxs.len() as u8).u8(dst);
        for idx in key_idxs {
            self.u16(*idx);
        }
        self
    }

    pub fn map_empty(&mut self, dst: u8) -> &mut Self {
        self.op(OpCode::MapEmpty).u8(dst)
    }

    pub fn index(&mut self, recv: u8, idx: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Index).u8(recv).u8(idx).u8(dst)
    }

    pub fn reverse_index(&mut self, recv: u8, idx: u8, dst: u8) -> &mut Self {
        self.op(OpCode::ReverseIndex).u8(recv).u8(idx).u8(dst)
    }

    pub fn set_index(&mut self, recv: u8, idx: u8, right: u8) -> &mut Self {
        self.op(OpCode::SetIndex).u8(recv).u8(idx).u8(right)
    }

    pub fn set_index_release(&mut self, recv: u8, idx: u8, right: u8) -> &mut Self {
        self.op(OpCode::SetIndexRelease).u8(recv).u8(idx).u8(right)
    }

    pub fn slice(&mut self, recv: u8, start: u8, end: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Slice).u8(recv).u8(start).u8(end).u8(dst)
    }

    pub fn jump(&mut self, offset: i16) -> &mut Self {
        self.op(OpCode::Jump).i16(offset)
    }

    pub fn jump_cond(&mut self, offset: i16, cond: u8) -> &mut Self {
        self.op(OpCode::JumpCond).i16(offset).u8(cond)
    }

    pub fn jump_not_cond(&mut self, cond: u8, offset: u16) -> &mut Self {
        self.op(OpCode::JumpNotCond).u8(cond).u16(offset)
    }

    pub fn jump_not_none(&mut self, offset: i16, val: u8) -> &mut Self {
        self.op(OpCode::JumpNotNone).i16(offset).u8(val)
    }

    pub fn call(&mut self, start: u8, nargs: u8, nret: u8) -> &mut Self {
        self.op(OpCode::Call).u8(start).u8(nargs).u8(nret)
    }

    pub fn call_sym(&mut self, start: u8, nargs: u8, nret: u8, sym: u16) -> &mut Self {
        self.op(OpCode::CallSym).u8(start).u8(nargs).u8(nret).u16(sym).reserve(6)
    }

    pub fn call_obj_sym(
        &mut self,
        start: u8,
        nargs: u8,
        nret: u8,
        sym: u8,
        any_self_sig: u16,
    ) -> &mut Self {
        self.op(OpCode::CallObjSym)
            .u8(start)
            .u8(nargs)
            .u8(nret)
            .u8(sym)
            .u16(any_self_sig)
            .reserve(9)
    }

    pub fn call_type_check(&mut self, arg_start: u8, nargs: u8, sig: u16) -> &mut Self {
        self.op(OpCode::CallTypeCheck).u8(arg_start).u8(nargs).u16(sig)
    }

    pub fn ret0(&mut self) -> &mut Self {
        self.op(OpCode::Ret0)
    }

    pub fn ret1(&mut self) -> &mut Self {
        self.op(OpCode::Ret1)
    }

    pub fn field(&mut self, recv: u8, dst: u8, sym: u16) -> &mut Self {
        self.op(OpCode::Field).u8(recv).u8(dst).u16(sym).reserve(3)
    }

    pub fn field_retain(&mut self, recv: u8, dst: u8, sym: u16) -> &mut Self {
        self.op(OpCode::FieldRetain).u8(recv).u8(dst).u16(sym).reserve(3)
    }

    pub fn set_field(&mut self, sym: u8, recv: u8, right: u8) -> &mut Self {
        self.op(OpCode::SetField).u8(sym).u8(recv).u8(right)
    }

    pub fn set_field_release(&mut self, recv: u8, right: u8, sym: u8) -> &mut Self {
        self.op(OpCode::SetFieldRelease).u8(recv).u8(right).u8(sym).reserve(3)
    }

    pub fn set_check_field_release(&mut self, recv: u8, right: u8, sym: u8) -> &mut Self {
        self.op(OpCode::SetCheckFieldRelease).u8(recv).u8(right).u8(sym).reserve(3)
    }

    pub fn lambda(
        &mut self,
        neg_offset: u8,
        nparams: u8,
        stack_size: u8,
        sig: u16,
        dst: u8,
    ) -> &mut Self {
        self.op(OpCode::Lambda).u8(neg_offset).u8(nparams).u8(stack_size).u16(sig).u8(dst)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn closure(
        &mut self,
        neg_offset: u8,
        nparams: u8,
        stack_size: u8,
        sig: u16,
        local: u8,
        dst: u8,
        captured: &[u8],
    ) -> &mut Self {
        self.op(OpCode::Closure)
            .u8(neg_offset)
            .u8(nparams)
            .u8(captured.len() as u8)
            .u8(stack_size)
            .u16(sig)
            .u8(local)
            .u8(dst);
        self.buf.extend_from_slice(captured);
        self
    }

    pub fn string_template(&mut self, start: u8, nexprs: u8, dst: u8, str_idxs: &[u8]) -> &mut Self {
        self.op(OpCode::StringTemplate).u8(start).u8(nexprs).u8(dst);
        self.buf.extend_from_slice(str_idxs);
        self
    }

    pub fn init(&mut self, start: u8, n: u8) -> &mut Self {
        self.op(OpCode::Init).u8(start).u8(n)
    }

    pub fn object_small(&mut self, type_id: u8, start: u8, nfields: u8, dst: u8) -> &mut Self {
        self.op(OpCode::ObjectSmall).u8(type_id).u8(start).u8(nfields).u8(dst)
    }

    pub fn object(&mut self, type_id: u8, start: u8, nfields: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Object).u8(type_id).u8(start).u8(nfields).u8(dst)
    }

    pub fn push_try(&mut self, err_dst: u8, catch_offset: u16) -> &mut Self {
        self.op(OpCode::PushTry).u8(err_dst).u16(catch_offset)
    }

    pub fn pop_try(&mut self, offset: u16) -> &mut Self {
        self.op(OpCode::PopTry).u16(offset)
    }

    pub fn throw(&mut self, err: u8) -> &mut Self {
        self.op(OpCode::Throw).u8(err)
    }

    pub fn coinit(&mut self, arg_start: u8, nargs: u8, jump: u8, stack_size: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Coinit).u8(arg_start).u8(nargs).u8(jump).u8(stack_size).u8(dst)
    }

    pub fn coyield(&mut self) -> &mut Self {
        self.op(OpCode::Coyield).reserve(2)
    }

    pub fn coresume(&mut self, fiber: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Coresume).u8(fiber).u8(dst)
    }

    pub fn coreturn(&mut self) -> &mut Self {
        self.op(OpCode::Coreturn)
    }

    pub fn box_value_of(&mut self, src: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Box).u8(src).u8(dst)
    }

    pub fn set_box_value(&mut self, boxed: u8, right: u8) -> &mut Self {
        self.op(OpCode::SetBoxValue).u8(boxed).u8(right)
    }

    pub fn set_box_value_release(&mut self, boxed: u8, right: u8) -> &mut Self {
        self.op(OpCode::SetBoxValueRelease).u8(boxed).u8(right)
    }

    pub fn box_value(&mut self, boxed: u8, dst: u8) -> &mut Self {
        self.op(OpCode::BoxValue).u8(boxed).u8(dst)
    }

    pub fn box_value_retain(&mut self, boxed: u8, dst: u8) -> &mut Self {
        self.op(OpCode::BoxValueRetain).u8(boxed).u8(dst)
    }

    pub fn captured(&mut self, closure: u8, idx: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Captured).u8(closure).u8(idx).u8(dst)
    }

    pub fn tag(&mut self, tag_id: u8, member: u8, dst: u8) -> &mut Self {
        self.op(OpCode::Tag).u8(tag_id).u8(member).u8(dst)
    }

    pub fn tag_literal(&mut self, sym: u8, dst: u8) -> &mut Self {
        self.op(OpCode::TagLiteral).u8(sym).u8(dst)
    }

    pub fn cast(&mut self, val: u8, type_id: u16) -> &mut Self {
        self.op(OpCode::Cast).u8(val).u16(type_id)
    }

    pub fn cast_abstract(&mut self, val: u8, sema_type: u16) -> &mut Self {
        self.op(OpCode::CastAbstract).u8(val).u16(sema_type)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn for_range_init(
        &mut self,
        start: u8,
        end: u8,
        step: u8,
        counter: u8,
        user_var: u8,
        body_offset: u16,
    ) -> &mut Self {
        self.op(OpCode::ForRangeInit)
            .u8(start)
            .u8(end)
            .u8(step)
            .u8(counter)
            .u8(user_var)
            .u16(body_offset)
    }

    pub fn for_range(
        &mut self,
        counter: u8,
        step: u8,
        end: u8,
        user_var: u8,
        back_offset: u16,
    ) -> &mut Self {
        self.op(OpCode::ForRange).u8(counter).u8(step).u8(end).u8(user_var).u16(back_offset)
    }

    pub fn match_op(&mut self, expr: u8, cases: &[(u16, u16)], else_offset: u16) -> &mut Self {
        self.op(OpCode::Match).u8(expr).u8(cases.len() as u8);
        for (const_idx, offset) in cases {
            self.u16(*const_idx).u16(*offset);
        }
        self.u16(else_offset)
    }

    pub fn static_func(&mut self, func: u16, dst: u8) -> &mut Self {
        self.op(OpCode::StaticFunc).u16(func).u8(dst)
    }

    pub fn static_var(&mut self, sym: u16, dst: u8) -> &mut Self {
        self.op(OpCode::StaticVar).u16(sym).u8(dst)
    }

    pub fn set_static_var(&mut self, sym: u16, src: u8) -> &mut Self {
        self.op(OpCode::SetStaticVar).u16(sym).u8(src)
    }

    pub fn set_static_func(&mut self, func: u16, src: u8) -> &mut Self {
        self.op(OpCode::SetStaticFunc).u16(func).u8(src)
    }

    pub fn sym(&mut self, kind: u8, sym: u32, dst: u8) -> &mut Self {
        self.op(OpCode::Sym).u8(kind).u32(sym).u8(dst)
    }

    pub fn end(&mut self, result: u8) -> &mut Self {
        self.op(OpCode::End).u8(result)
    }
}
