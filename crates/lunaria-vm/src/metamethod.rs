//! Metamethod lookup.
//!
//! Every operator follows the same two-phase shape: try the fast path on the
//! raw value tags, then look up a named field in the operand's metatable and
//! make a nested call. This module is the lookup half; the calls happen in
//! the dispatch loop.

use lunaria_core::heap::{GcIdx, Heap};
use lunaria_core::string::{StringId, StringInterner};
use lunaria_core::table::Table;
use lunaria_core::value::Value;

/// Pre-interned metamethod names, resolved once per VM run so lookups are
/// plain id comparisons.
#[derive(Clone, Copy, Debug)]
pub struct MetamethodNames {
    pub index: StringId,
    pub newindex: StringId,
    pub call: StringId,
    pub add: StringId,
    pub sub: StringId,
    pub mul: StringId,
    pub div: StringId,
    pub modulo: StringId,
    pub pow: StringId,
    pub unm: StringId,
    pub len: StringId,
    pub concat: StringId,
    pub eq: StringId,
    pub lt: StringId,
    pub le: StringId,
    pub tostring: StringId,
    pub metatable: StringId,
    pub pairs: StringId,
    pub ipairs: StringId,
}

impl MetamethodNames {
    pub fn intern(strings: &mut StringInterner) -> MetamethodNames {
        MetamethodNames {
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            add: strings.intern(b"__add"),
            sub: strings.intern(b"__sub"),
            mul: strings.intern(b"__mul"),
            div: strings.intern(b"__div"),
            modulo: strings.intern(b"__mod"),
            pow: strings.intern(b"__pow"),
            unm: strings.intern(b"__unm"),
            len: strings.intern(b"__len"),
            concat: strings.intern(b"__concat"),
            eq: strings.intern(b"__eq"),
            lt: strings.intern(b"__lt"),
            le: strings.intern(b"__le"),
            tostring: strings.intern(b"__tostring"),
            metatable: strings.intern(b"__metatable"),
            pairs: strings.intern(b"__pairs"),
            ipairs: strings.intern(b"__ipairs"),
        }
    }
}

/// The metatable of a value, if it has one. Only tables and userdata carry
/// individual metatables.
pub fn get_metatable(val: Value, heap: &Heap) -> Option<GcIdx<Table>> {
    if let Some(idx) = val.as_table_idx() {
        heap.get_table(idx).metatable
    } else if let Some(idx) = val.as_userdata_idx() {
        heap.get_userdata(idx).metatable
    } else {
        None
    }
}

/// Look up a named metamethod on a value. Returns `None` when the value has
/// no metatable or the field is nil.
pub fn get_metamethod(val: Value, name: StringId, heap: &Heap) -> Option<Value> {
    let mt = get_metatable(val, heap)?;
    let handler = heap.get_table(mt).raw_get_str(name);
    if handler.is_nil() {
        None
    } else {
        Some(handler)
    }
}
