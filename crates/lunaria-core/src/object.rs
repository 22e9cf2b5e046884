//! Lua type names, as reported by `type()` and error messages.

use crate::value::{self, Value};

pub fn lua_type_name(val: Value) -> &'static str {
    if val.is_nil() {
        "nil"
    } else if val.is_bool() {
        "boolean"
    } else if val.is_number() {
        "number"
    } else {
        match val.sub_tag() {
            Some(value::SUB_STRING) => "string",
            Some(value::SUB_TABLE) => "table",
            Some(value::SUB_CLOSURE) | Some(value::SUB_NATIVE) => "function",
            Some(value::SUB_THREAD) => "thread",
            Some(value::SUB_USERDATA) => "userdata",
            _ => "userdata",
        }
    }
}
