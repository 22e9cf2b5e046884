//! Equality and ordering fast paths.

use lunaria_core::string::StringInterner;
use lunaria_core::value::Value;

pub enum CompareResult {
    Done(bool),
    NeedMetamethod,
}

/// Raw equality. The second flag says whether `__eq` should be consulted
/// when the raw answer is false: only when both operands are tables or both
/// are userdata.
pub fn lua_eq(a: Value, b: Value, _strings: &StringInterner) -> (bool, bool) {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        // NaN compares unequal to itself.
        return (x == y, false);
    }
    if let (Some(x), Some(y)) = (a.as_string_id(), b.as_string_id()) {
        // The interner deduplicates, so id equality is byte equality.
        return (x == y, false);
    }
    if a.raw_bits() == b.raw_bits() {
        return (true, false);
    }
    let both_tables = a.is_table() && b.is_table();
    let both_userdata = a.as_userdata_idx().is_some() && b.as_userdata_idx().is_some();
    (false, both_tables || both_userdata)
}

/// `a < b` for numbers and strings; anything else defers to `__lt`.
pub fn lua_lt(a: Value, b: Value, strings: &StringInterner) -> CompareResult {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return CompareResult::Done(x < y);
    }
    if let (Some(x), Some(y)) = (a.as_string_id(), b.as_string_id()) {
        return CompareResult::Done(strings.get_bytes(x) < strings.get_bytes(y));
    }
    CompareResult::NeedMetamethod
}

/// `a <= b` for numbers and strings; anything else defers to `__le`, and
/// from there to `__lt` with swapped operands.
pub fn lua_le(a: Value, b: Value, strings: &StringInterner) -> CompareResult {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        return CompareResult::Done(x <= y);
    }
    if let (Some(x), Some(y)) = (a.as_string_id(), b.as_string_id()) {
        return CompareResult::Done(strings.get_bytes(x) <= strings.get_bytes(y));
    }
    CompareResult::NeedMetamethod
}
