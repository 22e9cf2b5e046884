//! Lunaria core: the value model shared by the compiler and the VM.

pub mod cancel;
pub mod heap;
pub mod object;
pub mod string;
pub mod table;
pub mod value;
