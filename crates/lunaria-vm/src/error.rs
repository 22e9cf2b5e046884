use lunaria_core::string::StringInterner;
use lunaria_core::value::Value;
use std::fmt;

/// Everything that can abort Lua execution.
///
/// `Yield` is not an error in the Lua sense: it rides the same unwind path so
/// that a suspended coroutine's frames survive intact, but `pcall` must never
/// catch it. The same goes for `Cancelled`, which always propagates to the
/// host.
#[derive(Clone, Debug)]
pub enum LuaError {
    /// A runtime error raised by the VM itself, with a plain message.
    Runtime(String),
    /// An error value raised from Lua via `error(v)`; may be any value.
    Value(Value),
    /// The call stack exceeded its depth limit.
    StackOverflow,
    /// The host's cancel token was triggered.
    Cancelled,
    /// A coroutine suspended itself, carrying the yielded values.
    Yield(Vec<Value>),
}

impl LuaError {
    /// Whether a protected call may catch this.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            LuaError::Runtime(_) | LuaError::Value(_) | LuaError::StackOverflow
        )
    }

    /// The Lua value handed to pcall results and error handlers.
    pub fn to_value(&self, strings: &mut StringInterner) -> Value {
        match self {
            LuaError::Runtime(msg) => Value::from_string_id(strings.intern(msg.as_bytes())),
            LuaError::Value(v) => *v,
            LuaError::StackOverflow => Value::from_string_id(strings.intern(b"stack overflow")),
            LuaError::Cancelled => Value::from_string_id(strings.intern(b"execution cancelled")),
            LuaError::Yield(_) => Value::from_string_id(
                strings.intern(b"attempt to yield across a C-call boundary"),
            ),
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::Runtime(msg) => write!(f, "{msg}"),
            LuaError::Value(_) => write!(f, "error object is not a string"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
            LuaError::Cancelled => write!(f, "execution cancelled"),
            LuaError::Yield(_) => write!(f, "attempt to yield from outside a coroutine"),
        }
    }
}

impl std::error::Error for LuaError {}
