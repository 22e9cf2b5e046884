//! Arithmetic fast paths.
//!
//! Each binary arithmetic opcode tries numeric coercion on both operands
//! first; when that fails the dispatch loop falls back to the operator's
//! metamethod.

use crate::coerce;
use lunaria_core::string::StringInterner;
use lunaria_core::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl ArithOp {
    pub fn name(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Mod => "mod",
            ArithOp::Pow => "pow",
        }
    }
}

pub enum ArithResult {
    Done(Value),
    NeedMetamethod,
}

/// Binary arithmetic with string-to-number coercion on both sides.
pub fn arith_op(op: ArithOp, va: Value, vb: Value, strings: &StringInterner) -> ArithResult {
    let (a, b) = match (coerce::to_number(va, strings), coerce::to_number(vb, strings)) {
        (Some(a), Some(b)) => (a, b),
        _ => return ArithResult::NeedMetamethod,
    };
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => lua_mod(a, b),
        ArithOp::Pow => a.powf(b),
    };
    ArithResult::Done(Value::from_number(result))
}

/// Unary minus with string coercion.
pub fn arith_unm(v: Value, strings: &StringInterner) -> ArithResult {
    match coerce::to_number(v, strings) {
        Some(n) => ArithResult::Done(Value::from_number(-n)),
        None => ArithResult::NeedMetamethod,
    }
}

/// Lua's modulo: the result takes the sign of the divisor.
pub fn lua_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

/// Bytes a value contributes to concatenation, or `None` when it is neither
/// a string nor a number.
pub fn concat_bytes(v: Value, strings: &StringInterner) -> Option<Vec<u8>> {
    if let Some(sid) = v.as_string_id() {
        return Some(strings.get_bytes(sid).to_vec());
    }
    if let Some(n) = v.as_number() {
        return Some(coerce::format_number(n).into_bytes());
    }
    None
}
