//! The back-end of the compiler: structured 6502 assembly, the builder
//! that constructs it, the code generator that lowers IL into it, register
//! allocation, the peephole optimizer, and the ACME text emitter.

pub mod asm;
pub mod asm_opt;
pub mod builder;
pub mod codegen;
pub mod emitter;
pub mod regalloc;

pub use asm::*;
pub use codegen::{generate, BASIC_STUB_LEN};
