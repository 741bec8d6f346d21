//! Bytecode compiler and stack-based interpreter for the rye runtime: a
//! dynamically typed, lazily evaluated, lexically scoped language with
//! first-class functions, call-by-need argument passing, and generic
//! method dispatch.

pub mod code;
pub mod codestream;
pub mod compiler;
pub mod disasm;
pub mod frame;
pub mod interp;
pub mod opcodes;
pub mod pool;
pub mod runtime;
pub mod stack;
pub mod verify;

pub use code::{
    CodeObject, CompiledBody, FunctionObject, PromiseCode, DOTS_ARG_IDX, MISSING_ARG_IDX,
};
pub use codestream::{compute_stack_depth, CodeStream, Label};
pub use compiler::{compile, compile_closure};
pub use disasm::{disassemble, disassemble_function};
pub use frame::{Frame, FrameKind};
pub use interp::Interp;
pub use opcodes::Op;
pub use pool::Pool;
pub use runtime::Runtime;
pub use stack::OStack;
pub use verify::{verify_code, verify_function};
