//! Lunaria compiler: lexer, parser, and bytecode compiler for Lua 5.2.

pub mod compiler;
pub mod disasm;
pub mod lexer;
pub mod opcode;
pub mod proto;
pub mod token;
