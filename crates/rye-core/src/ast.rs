//! Convenience constructors for language objects, used by tests and by the
//! compiler when it synthesizes rewritten accessor calls.

use crate::intern::{intern, Spur};
use crate::value::{Arg, Formal, Value};

pub fn sym(name: &str) -> Value {
    Value::sym(name)
}

pub fn real(x: f64) -> Value {
    Value::real(x)
}

pub fn int(i: i32) -> Value {
    Value::int(i)
}

pub fn lgl(b: bool) -> Value {
    Value::lgl(b)
}

pub fn str_(s: &str) -> Value {
    Value::str(s)
}

/// `fun(args...)` with positional arguments.
pub fn call(fun: &str, args: Vec<Value>) -> Value {
    Value::lang(sym(fun), args.into_iter().map(Arg::pos).collect())
}

/// `fun(args...)` with explicit tags.
pub fn call_tagged(fun: &str, args: Vec<Arg>) -> Value {
    Value::lang(sym(fun), args)
}

pub fn named(tag: &str, value: Value) -> Arg {
    Arg::named(intern(tag), value)
}

pub fn pos(value: Value) -> Arg {
    Arg::pos(value)
}

/// `name <- value`.
pub fn assign(lhs: Value, rhs: Value) -> Value {
    Value::lang(sym("<-"), vec![Arg::pos(lhs), Arg::pos(rhs)])
}

/// `{ exprs... }`.
pub fn block(exprs: Vec<Value>) -> Value {
    Value::lang(sym("{"), exprs.into_iter().map(Arg::pos).collect())
}

/// A `function(formals) body` definition expression.
pub fn function(formals: Vec<(&str, Option<Value>)>, body: Value) -> Value {
    let params = formals
        .into_iter()
        .map(|(name, default)| Arg {
            tag: Some(intern(name)),
            value: default.unwrap_or_else(Value::missing),
        })
        .collect();
    Value::lang(
        sym("function"),
        vec![Arg::pos(Value::pairlist(params)), Arg::pos(body)],
    )
}

/// Formals as the closure data structure (for direct compilation).
pub fn formals(params: Vec<(&str, Option<Value>)>) -> Vec<Formal> {
    params.into_iter()
        .map(|(name, default)| Formal {
            name: intern(name),
            default,
        })
        .collect()
}

pub fn tag(name: &str) -> Spur {
    intern(name)
}
