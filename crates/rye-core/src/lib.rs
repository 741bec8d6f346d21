//! Core value model, environments, and the builtin registry consumed by the
//! rye virtual machine.

pub mod ast;
pub mod builtins;
pub mod env;
pub mod error;
pub mod intern;
pub mod match_args;
pub mod value;

pub use builtins::{
    arith, as_logical_scalar, compare, condition_to_bool, extract2, install_base, lgl_and,
    lgl_or, subassign, subset1, ArithOp, BuiltinDef, BuiltinFn, BuiltinKind, CmpOp, Evaluator,
    Visibility, COND_LENGTH_WARNING,
};
pub use env::Env;
pub use error::{
    Eval, RyeError, Unwind, COND_LENGTH_ZERO, COND_NA_LOGICAL, COND_NOT_LOGICAL,
};
pub use intern::{ddval, intern, resolve, sym, with_resolved, Spur};
pub use match_args::{match_args, Binding};
pub use value::{
    Arg, Call, ClosureData, CodeRef, Formal, Kind, Lgl, PromiseData, Value, NA_INT,
};
