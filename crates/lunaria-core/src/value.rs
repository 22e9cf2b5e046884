//! NaN-boxed Lua value.
//!
//! Every value is a single u64. Any bit pattern that is not a quiet NaN with
//! the tag bits set is an f64 number (Lua 5.2 numbers are always doubles).
//! The quiet-NaN payload space holds nil, booleans, and handles to heap
//! objects. Heap handles carry a 3-bit sub-tag plus an arena index.

use crate::heap::{GcIdx, LuaClosure, NativeFunction, UpVal, UserData};
use crate::string::StringId;
use crate::table::Table;
use std::marker::PhantomData;

/// Quiet-NaN tag base: all boxed (non-number) values have these bits set.
const QNAN: u64 = 0x7ffc_0000_0000_0000;
/// Sign bit, used to mark heap handles within the QNAN space.
const SIGN: u64 = 0x8000_0000_0000_0000;
/// The canonical NaN all real NaN results are normalized to.
const CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

const NIL_BITS: u64 = QNAN | 1;
const FALSE_BITS: u64 = QNAN | 2;
const TRUE_BITS: u64 = QNAN | 3;

/// Sub-tags for heap handles (bits 44-46 of the payload).
pub const SUB_STRING: u64 = 0;
pub const SUB_TABLE: u64 = 1;
pub const SUB_CLOSURE: u64 = 2;
pub const SUB_NATIVE: u64 = 3;
pub const SUB_UPVAL: u64 = 4;
pub const SUB_THREAD: u64 = 5;
pub const SUB_USERDATA: u64 = 6;

const SUB_SHIFT: u64 = 44;
const SUB_MASK: u64 = 0x7;
/// Lower 44 bits of the payload hold the arena index.
const INDEX_MASK: u64 = (1u64 << 44) - 1;

/// A Lua value.
#[derive(Clone, Copy)]
pub struct Value(u64);

impl Value {
    #[inline(always)]
    pub fn nil() -> Value {
        Value(NIL_BITS)
    }

    #[inline(always)]
    pub fn from_bool(b: bool) -> Value {
        Value(if b { TRUE_BITS } else { FALSE_BITS })
    }

    /// Box a number. Real NaNs are canonicalized so they never collide with
    /// the tag space.
    #[inline(always)]
    pub fn from_number(f: f64) -> Value {
        if f.is_nan() {
            Value(CANONICAL_NAN)
        } else {
            Value(f.to_bits())
        }
    }

    #[inline(always)]
    fn from_handle(sub: u64, index: u32) -> Value {
        debug_assert!((index as u64) <= INDEX_MASK);
        Value(SIGN | QNAN | (sub << SUB_SHIFT) | index as u64)
    }

    #[inline(always)]
    pub fn from_string_id(sid: StringId) -> Value {
        Value::from_handle(SUB_STRING, sid.0)
    }

    #[inline(always)]
    pub fn from_table(idx: GcIdx<Table>) -> Value {
        Value::from_handle(SUB_TABLE, idx.0)
    }

    #[inline(always)]
    pub fn from_closure(idx: GcIdx<LuaClosure>) -> Value {
        Value::from_handle(SUB_CLOSURE, idx.0)
    }

    #[inline(always)]
    pub fn from_native(idx: GcIdx<NativeFunction>) -> Value {
        Value::from_handle(SUB_NATIVE, idx.0)
    }

    #[inline(always)]
    pub fn from_upval(idx: GcIdx<UpVal>) -> Value {
        Value::from_handle(SUB_UPVAL, idx.0)
    }

    /// Thread handles index the VM's thread list, not a heap arena.
    #[inline(always)]
    pub fn from_thread(index: u32) -> Value {
        Value::from_handle(SUB_THREAD, index)
    }

    #[inline(always)]
    pub fn from_userdata(idx: GcIdx<UserData>) -> Value {
        Value::from_handle(SUB_USERDATA, idx.0)
    }

    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self.0 == NIL_BITS
    }

    #[inline(always)]
    pub fn is_bool(self) -> bool {
        self.0 == TRUE_BITS || self.0 == FALSE_BITS
    }

    #[inline(always)]
    pub fn is_number(self) -> bool {
        (self.0 & QNAN) != QNAN
    }

    /// Lua truth: everything except nil and false is truthy.
    #[inline(always)]
    pub fn is_truthy(self) -> bool {
        self.0 != NIL_BITS && self.0 != FALSE_BITS
    }

    #[inline(always)]
    pub fn is_falsy(self) -> bool {
        !self.is_truthy()
    }

    #[inline(always)]
    pub fn is_handle(self) -> bool {
        (self.0 & (SIGN | QNAN)) == (SIGN | QNAN)
    }

    #[inline(always)]
    pub fn sub_tag(self) -> Option<u64> {
        if self.is_handle() {
            Some((self.0 >> SUB_SHIFT) & SUB_MASK)
        } else {
            None
        }
    }

    #[inline(always)]
    fn handle_index(self) -> u32 {
        (self.0 & INDEX_MASK) as u32
    }

    #[inline(always)]
    pub fn is_string(self) -> bool {
        self.sub_tag() == Some(SUB_STRING)
    }

    #[inline(always)]
    pub fn is_table(self) -> bool {
        self.sub_tag() == Some(SUB_TABLE)
    }

    #[inline(always)]
    pub fn is_function(self) -> bool {
        matches!(self.sub_tag(), Some(SUB_CLOSURE) | Some(SUB_NATIVE))
    }

    #[inline(always)]
    pub fn is_thread(self) -> bool {
        self.sub_tag() == Some(SUB_THREAD)
    }

    #[inline(always)]
    pub fn as_number(self) -> Option<f64> {
        if self.is_number() {
            Some(f64::from_bits(self.0))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_bool(self) -> Option<bool> {
        match self.0 {
            TRUE_BITS => Some(true),
            FALSE_BITS => Some(false),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn as_string_id(self) -> Option<StringId> {
        if self.is_string() {
            Some(StringId(self.handle_index()))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_table_idx(self) -> Option<GcIdx<Table>> {
        if self.is_table() {
            Some(GcIdx(self.handle_index(), PhantomData))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_closure_idx(self) -> Option<GcIdx<LuaClosure>> {
        if self.sub_tag() == Some(SUB_CLOSURE) {
            Some(GcIdx(self.handle_index(), PhantomData))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_native_idx(self) -> Option<GcIdx<NativeFunction>> {
        if self.sub_tag() == Some(SUB_NATIVE) {
            Some(GcIdx(self.handle_index(), PhantomData))
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_thread_idx(self) -> Option<u32> {
        if self.is_thread() {
            Some(self.handle_index())
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn as_userdata_idx(self) -> Option<GcIdx<UserData>> {
        if self.sub_tag() == Some(SUB_USERDATA) {
            Some(GcIdx(self.handle_index(), PhantomData))
        } else {
            None
        }
    }

    /// Raw bit pattern, used for identity comparison and table keys.
    #[inline(always)]
    pub fn raw_bits(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn from_raw_bits(bits: u64) -> Value {
        Value(bits)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else if let Some(b) = self.as_bool() {
            write!(f, "{b}")
        } else if let Some(n) = self.as_number() {
            write!(f, "{n}")
        } else {
            match self.sub_tag() {
                Some(SUB_STRING) => write!(f, "string#{}", self.handle_index()),
                Some(SUB_TABLE) => write!(f, "table#{}", self.handle_index()),
                Some(SUB_CLOSURE) => write!(f, "function#{}", self.handle_index()),
                Some(SUB_NATIVE) => write!(f, "builtin#{}", self.handle_index()),
                Some(SUB_UPVAL) => write!(f, "upval#{}", self.handle_index()),
                Some(SUB_THREAD) => write!(f, "thread#{}", self.handle_index()),
                Some(SUB_USERDATA) => write!(f, "userdata#{}", self.handle_index()),
                _ => write!(f, "<invalid 0x{:016x}>", self.0),
            }
        }
    }
}
