//! Lunaria VM: register-based bytecode interpreter, coroutines, and binary
//! chunk dump/undump for Lua 5.2.

pub mod arith;
pub mod callinfo;
pub mod chunk;
pub mod coerce;
pub mod compare;
pub mod dispatch;
pub mod error;
pub mod metamethod;
pub mod vm;

pub use error::LuaError;
pub use vm::Vm;

use lunaria_compiler::compiler::{compile, CompileError};
use lunaria_compiler::proto::Proto;
use lunaria_core::string::StringInterner;

/// Failure while turning an input into a runnable prototype.
#[derive(Debug)]
pub enum LoadError {
    Compile(CompileError),
    Chunk(chunk::ChunkError),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Compile(e) => write!(f, "{e}"),
            LoadError::Chunk(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<CompileError> for LoadError {
    fn from(e: CompileError) -> LoadError {
        LoadError::Compile(e)
    }
}

impl From<chunk::ChunkError> for LoadError {
    fn from(e: chunk::ChunkError) -> LoadError {
        LoadError::Chunk(e)
    }
}

/// Load source text or a precompiled binary chunk, dispatching on the chunk
/// signature the way `lua_load` does.
pub fn load_chunk(bytes: &[u8], name: &str) -> Result<(Proto, StringInterner), LoadError> {
    if bytes.starts_with(chunk::SIGNATURE) {
        let mut strings = StringInterner::new();
        let proto = chunk::undump(bytes, &mut strings)?;
        Ok((proto, strings))
    } else {
        Ok(compile(bytes, name)?)
    }
}
