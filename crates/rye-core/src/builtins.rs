use std::rc::Rc;

use crate::env::Env;
use crate::error::{
    Eval, RyeError, Unwind, COND_LENGTH_ZERO, COND_NA_LOGICAL, COND_NOT_LOGICAL,
};
use crate::intern::{intern, resolve, sym, Spur};
use crate::value::{Arg, Formal, Kind, Lgl, Value, NA_INT};

/// Callback surface the interpreter exposes to builtins and specials.
/// Re-entry happens through these methods (e.g. `eval`, argument forcing).
pub trait Evaluator {
    /// Evaluate an expression in `env`. Non-local transfers pass through
    /// untouched so control specials compose.
    fn eval(&mut self, expr: &Value, env: &Env) -> Eval<Value>;

    /// Force a promise value (no-op for already-forced promises).
    fn force(&mut self, promise: &Value) -> Eval<Value>;

    /// Apply a callable to already-evaluated arguments.
    fn apply(&mut self, call: &Value, callee: &Value, args: Vec<Arg>, env: &Env) -> Eval<Value>;

    /// `findFun`: resolve `name` to a callable, skipping non-function
    /// bindings along the chain.
    fn find_function(&mut self, name: Spur, env: &Env) -> Eval<Value>;

    /// Single-dispatch method lookup: `generic.class` then `generic.default`
    /// along the class attribute. Returns None when nothing applies.
    fn dispatch_s3(
        &mut self,
        generic: &str,
        obj: &Value,
        call: &Value,
        args: Vec<Arg>,
        env: &Env,
    ) -> Eval<Option<Value>>;

    fn register_s4_method(&mut self, selector: Spur, class: Spur, method: Value);

    fn warn(&mut self, msg: String);

    fn print_line(&mut self, line: String);

    fn set_visible(&mut self, visible: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// Receives its arguments already evaluated.
    Builtin,
    /// Receives its arguments as unevaluated expressions.
    Special,
}

/// What a call does to the visibility flag, FUNTAB-style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    On,
    Off,
    /// The callee manages visibility itself.
    Keep,
}

pub type BuiltinFn = fn(&mut dyn Evaluator, &Value, &[Arg], &Env) -> Eval<Value>;

pub struct BuiltinDef {
    pub name: &'static str,
    pub kind: BuiltinKind,
    pub visibility: Visibility,
    pub func: BuiltinFn,
}

impl BuiltinDef {
    pub fn is_special(&self) -> bool {
        self.kind == BuiltinKind::Special
    }
}

impl std::fmt::Debug for BuiltinDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{:?} {}>", self.kind, self.name)
    }
}

fn err(msg: impl Into<String>) -> Unwind {
    Unwind::Error(RyeError::Eval(msg.into()))
}

// ── Condition reduction ───────────────────────────────────────────

/// Reduce a condition value (an `if`/`while` test) to a bool.
/// On success also reports whether a length warning applies; on failure
/// returns the exact host message.
pub fn condition_to_bool(v: &Value) -> Result<(bool, bool), &'static str> {
    let len = v.length();
    let warn = len > 1;
    let cond: Lgl = if len == 0 {
        None
    } else {
        match &*v.kind() {
            Kind::Logical(xs) => xs[0],
            Kind::Int(xs) => {
                if xs[0] == NA_INT {
                    None
                } else {
                    Some(xs[0] != 0)
                }
            }
            Kind::Real(xs) => {
                if xs[0].is_nan() {
                    None
                } else {
                    Some(xs[0] != 0.0)
                }
            }
            Kind::Str(xs) => match &*xs[0] {
                "TRUE" | "true" | "T" => Some(true),
                "FALSE" | "false" | "F" => Some(false),
                _ => None,
            },
            _ => None,
        }
    };
    match cond {
        Some(b) => Ok((b, warn)),
        None => Err(if len == 0 {
            COND_LENGTH_ZERO
        } else if matches!(&*v.kind(), Kind::Logical(_)) {
            COND_NA_LOGICAL
        } else {
            COND_NOT_LOGICAL
        }),
    }
}

pub const COND_LENGTH_WARNING: &str =
    "the condition has length > 1 and only the first element will be used";

fn check_condition(ev: &mut dyn Evaluator, v: &Value) -> Eval<bool> {
    match condition_to_bool(v) {
        Ok((b, warn)) => {
            if warn {
                ev.warn(COND_LENGTH_WARNING.to_string());
            }
            Ok(b)
        }
        Err(msg) => Err(Unwind::Error(RyeError::Condition(msg))),
    }
}

/// Conversion used by `&&`/`||` and the `aslogical` instruction: first
/// element as a three-valued logical, no errors.
pub fn as_logical_scalar(v: &Value) -> Lgl {
    if v.length() == 0 {
        return None;
    }
    match &*v.kind() {
        Kind::Logical(xs) => xs[0],
        Kind::Int(xs) => {
            if xs[0] == NA_INT {
                None
            } else {
                Some(xs[0] != 0)
            }
        }
        Kind::Real(xs) => {
            if xs[0].is_nan() {
                None
            } else {
                Some(xs[0] != 0.0)
            }
        }
        Kind::Str(xs) => match &*xs[0] {
            "TRUE" | "true" | "T" => Some(true),
            "FALSE" | "false" | "F" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ── Arithmetic & comparison ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Eq,
}

fn real_elems(v: &Value) -> Option<Vec<f64>> {
    match &*v.kind() {
        Kind::Real(xs) => Some(xs.clone()),
        Kind::Int(xs) => Some(
            xs.iter()
                .map(|&i| if i == NA_INT { f64::NAN } else { i as f64 })
                .collect(),
        ),
        Kind::Logical(xs) => Some(
            xs.iter()
                .map(|l| match l {
                    Some(true) => 1.0,
                    Some(false) => 0.0,
                    None => f64::NAN,
                })
                .collect(),
        ),
        _ => None,
    }
}

fn recycled(n: usize, m: usize) -> Result<usize, Unwind> {
    if n == m || n == 1 || m == 1 {
        Ok(n.max(m))
    } else {
        Err(err("non-conformable operand lengths"))
    }
}

/// Binary arithmetic over numeric vectors with scalar recycling.
/// Integer pairs stay integer (except division); anything else goes
/// through double.
pub fn arith(op: ArithOp, lhs: &Value, rhs: &Value) -> Eval<Value> {
    if lhs.length() == 0 || rhs.length() == 0 {
        return Err(err(format!(
            "non-numeric argument to binary operator ({} {:?} {})",
            lhs.type_name(),
            op,
            rhs.type_name()
        )));
    }
    if op != ArithOp::Div {
        if let (Kind::Int(a), Kind::Int(b)) = (&*lhs.kind(), &*rhs.kind()) {
            let n = recycled(a.len(), b.len())?;
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                let (x, y) = (a[i % a.len()], b[i % b.len()]);
                out.push(if x == NA_INT || y == NA_INT {
                    NA_INT
                } else {
                    let r = match op {
                        ArithOp::Add => x.checked_add(y),
                        ArithOp::Sub => x.checked_sub(y),
                        ArithOp::Mul => x.checked_mul(y),
                        ArithOp::Div => unreachable!(),
                    };
                    r.unwrap_or(NA_INT)
                });
            }
            return Ok(Value::ints(out));
        }
    }
    let (a, b) = match (real_elems(lhs), real_elems(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(err("non-numeric argument to binary operator"));
        }
    };
    let n = recycled(a.len(), b.len())?;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let (x, y) = (a[i % a.len()], b[i % b.len()]);
        out.push(match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
        });
    }
    Ok(Value::reals(out))
}

/// Elementwise comparison producing a logical vector; NA operands yield NA.
pub fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Eval<Value> {
    if let (Kind::Str(a), Kind::Str(b)) = (&*lhs.kind(), &*rhs.kind()) {
        let n = recycled(a.len(), b.len())?;
        let out = (0..n)
            .map(|i| {
                let (x, y) = (&a[i % a.len()], &b[i % b.len()]);
                Some(match op {
                    CmpOp::Lt => x < y,
                    CmpOp::Gt => x > y,
                    CmpOp::Eq => x == y,
                })
            })
            .collect();
        return Ok(Value::logical(out));
    }
    let (a, b) = match (real_elems(lhs), real_elems(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(err("comparison is possible only for atomic types")),
    };
    let n = recycled(a.len(), b.len())?;
    let out = (0..n)
        .map(|i| {
            let (x, y) = (a[i % a.len()], b[i % b.len()]);
            if x.is_nan() || y.is_nan() {
                None
            } else {
                Some(match op {
                    CmpOp::Lt => x < y,
                    CmpOp::Gt => x > y,
                    CmpOp::Eq => x == y,
                })
            }
        })
        .collect();
    Ok(Value::logical(out))
}

// ── Subsetting ────────────────────────────────────────────────────

fn index_of(idx: &Value) -> Option<i64> {
    match &*idx.kind() {
        Kind::Int(v) if v.len() == 1 && v[0] != NA_INT => Some(v[0] as i64),
        Kind::Real(v) if v.len() == 1 && !v[0].is_nan() => Some(v[0] as i64),
        Kind::Logical(v) if v.len() == 1 => v[0].map(|b| b as i64),
        _ => None,
    }
}

fn name_of(idx: &Value) -> Option<Rc<str>> {
    match &*idx.kind() {
        Kind::Str(v) if v.len() == 1 => Some(v[0].clone()),
        Kind::Symbol(s) => Some(Rc::from(resolve(*s).as_str())),
        _ => None,
    }
}

fn names_attr(x: &Value) -> Vec<Rc<str>> {
    match x.get_attr(sym::names()) {
        Some(n) => match &*n.kind() {
            Kind::Str(v) => v.clone(),
            _ => Vec::new(),
        },
        None => Vec::new(),
    }
}

fn position_by_name(x: &Value, name: &str) -> Option<usize> {
    if let Some(items) = x.as_pairlist() {
        return items
            .iter()
            .position(|a| a.tag.map(resolve).as_deref() == Some(name));
    }
    names_attr(x).iter().position(|n| &**n == name)
}

fn vector_elem(x: &Value, i: usize) -> Option<Value> {
    match &*x.kind() {
        Kind::Logical(v) => v.get(i).map(|&l| Value::logical(vec![l])),
        Kind::Int(v) => v.get(i).map(|&n| Value::int(n)),
        Kind::Real(v) => v.get(i).map(|&x| Value::real(x)),
        Kind::Str(v) => v.get(i).map(|s| Value::strs(vec![s.clone()])),
        Kind::List(v) => v.get(i).cloned(),
        Kind::Pairlist(v) => v.get(i).map(|a| a.value.clone()),
        _ => None,
    }
}

/// `x[[i]]` with a scalar integer or character index.
pub fn extract2(x: &Value, idx: &Value) -> Eval<Value> {
    if let Some(name) = name_of(idx) {
        let pos = position_by_name(x, &name)
            .ok_or(Unwind::Error(RyeError::OutOfBounds))?;
        return vector_elem(x, pos).ok_or(Unwind::Error(RyeError::OutOfBounds));
    }
    let i = index_of(idx).ok_or_else(|| err("invalid subscript"))?;
    if i < 1 {
        return Err(Unwind::Error(RyeError::OutOfBounds));
    }
    vector_elem(x, (i - 1) as usize).ok_or(Unwind::Error(RyeError::OutOfBounds))
}

/// `x[i]`: subset preserving the container type.
pub fn subset1(x: &Value, idx: &Value) -> Eval<Value> {
    let positions: Vec<usize> = match &*idx.kind() {
        Kind::Int(v) => v
            .iter()
            .map(|&i| {
                if i >= 1 {
                    Ok((i - 1) as usize)
                } else {
                    Err(err("invalid subscript"))
                }
            })
            .collect::<Result<_, _>>()?,
        Kind::Real(v) => v
            .iter()
            .map(|&x| {
                if x >= 1.0 {
                    Ok(x as usize - 1)
                } else {
                    Err(err("invalid subscript"))
                }
            })
            .collect::<Result<_, _>>()?,
        _ => {
            if let Some(name) = name_of(idx) {
                match position_by_name(x, &name) {
                    Some(p) => vec![p],
                    None => return Err(Unwind::Error(RyeError::OutOfBounds)),
                }
            } else {
                return Err(err("invalid subscript type"));
            }
        }
    };
    macro_rules! take {
        ($v:expr, $na:expr) => {
            positions
                .iter()
                .map(|&p| $v.get(p).cloned().unwrap_or($na))
                .collect()
        };
    }
    let out = match &*x.kind() {
        Kind::Logical(v) => Value::logical(take!(v, None)),
        Kind::Int(v) => Value::ints(take!(v, NA_INT)),
        Kind::Real(v) => Value::reals(take!(v, f64::NAN)),
        Kind::Str(v) => Value::strs(
            positions
                .iter()
                .map(|&p| v.get(p).cloned().unwrap_or_else(|| Rc::from("NA")))
                .collect(),
        ),
        Kind::List(v) => Value::list(
            positions
                .iter()
                .map(|&p| v.get(p).cloned().unwrap_or_else(Value::null))
                .collect(),
        ),
        _ => return Err(err(format!("object of type '{}' is not subsettable", x.type_name()))),
    };
    Ok(out)
}

/// Shared helper for the subset-assignment builtins: duplicate when shared,
/// then write in place.
fn prepare_for_write(x: &Value) -> Value {
    if x.maybe_shared() {
        x.shallow_duplicate()
    } else {
        x.clone()
    }
}

fn assign_elem(x: &Value, pos: usize, value: Value) -> Eval<()> {
    let mut kind = x.kind_mut();
    match &mut *kind {
        Kind::List(v) => {
            if pos == v.len() {
                v.push(value);
            } else if pos < v.len() {
                v[pos] = value;
            } else {
                return Err(Unwind::Error(RyeError::OutOfBounds));
            }
        }
        Kind::Pairlist(v) => {
            if pos == v.len() {
                v.push(Arg::pos(value));
            } else if pos < v.len() {
                v[pos].value = value;
            } else {
                return Err(Unwind::Error(RyeError::OutOfBounds));
            }
        }
        Kind::Real(v) => {
            let x = value
                .as_real_scalar()
                .or_else(|| value.as_int_scalar().map(|i| i as f64))
                .ok_or_else(|| err("replacement value is not a scalar double"))?;
            if pos == v.len() {
                v.push(x);
            } else if pos < v.len() {
                v[pos] = x;
            } else {
                return Err(Unwind::Error(RyeError::OutOfBounds));
            }
        }
        Kind::Int(v) => {
            let x = value
                .as_int_scalar()
                .ok_or_else(|| err("replacement value is not a scalar integer"))?;
            if pos == v.len() {
                v.push(x);
            } else if pos < v.len() {
                v[pos] = x;
            } else {
                return Err(Unwind::Error(RyeError::OutOfBounds));
            }
        }
        _ => return Err(err("target of assignment is not subsettable")),
    }
    Ok(())
}

fn append_name(x: &Value, name: &str) {
    let mut names = names_attr(x);
    let len = x.length();
    while names.len() < len - 1 {
        names.push(Rc::from(""));
    }
    names.push(Rc::from(name));
    x.set_attr(sym::names(), Value::strs(names));
}

/// `x[[i]] <- value` / `x[i] <- value` / `x$name <- value` share this core.
pub fn subassign(x: &Value, idx: &Value, value: Value) -> Eval<Value> {
    let out = prepare_for_write(x);
    if let Some(name) = name_of(idx) {
        match position_by_name(&out, &name) {
            Some(pos) => assign_elem(&out, pos, value)?,
            None => {
                let pos = out.length();
                if out.is_pairlist() {
                    if let Kind::Pairlist(v) = &mut *out.kind_mut() {
                        v.push(Arg::named(intern(&name), value));
                    }
                } else {
                    assign_elem(&out, pos, value)?;
                    append_name(&out, &name);
                }
            }
        }
        return Ok(out);
    }
    let i = index_of(idx).ok_or_else(|| err("invalid subscript"))?;
    if i < 1 {
        return Err(Unwind::Error(RyeError::OutOfBounds));
    }
    assign_elem(&out, (i - 1) as usize, value)?;
    Ok(out)
}

// ── The FUNTAB ────────────────────────────────────────────────────

macro_rules! args_exactly {
    ($args:expr, $name:expr, $n:expr) => {
        if $args.len() != $n {
            return Err(err(format!("{} argument{} expected by '{}'", $n,
                if $n == 1 { "" } else { "s" }, $name)));
        }
    };
}

fn bi_add(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "+", 2);
    arith(ArithOp::Add, &args[0].value, &args[1].value)
}
fn bi_sub(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "-", 2);
    arith(ArithOp::Sub, &args[0].value, &args[1].value)
}
fn bi_mul(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "*", 2);
    arith(ArithOp::Mul, &args[0].value, &args[1].value)
}
fn bi_div(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "/", 2);
    arith(ArithOp::Div, &args[0].value, &args[1].value)
}

fn bi_lt(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "<", 2);
    compare(CmpOp::Lt, &args[0].value, &args[1].value)
}
fn bi_gt(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, ">", 2);
    compare(CmpOp::Gt, &args[0].value, &args[1].value)
}
fn bi_eq(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "==", 2);
    compare(CmpOp::Eq, &args[0].value, &args[1].value)
}

fn bi_colon(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, ":", 2);
    let from = index_of(&args[0].value).ok_or_else(|| err("NA/NaN argument"))?;
    let to = index_of(&args[1].value).ok_or_else(|| err("NA/NaN argument"))?;
    let seq: Vec<i32> = if from <= to {
        (from..=to).map(|i| i as i32).collect()
    } else {
        (to..=from).rev().map(|i| i as i32).collect()
    };
    Ok(Value::ints(seq))
}

fn bi_c(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    // type rank: logical < integer < double < character < list
    let mut rank = 0;
    for a in args {
        let r = match &*a.value.kind() {
            Kind::Null => 0,
            Kind::Logical(_) => 1,
            Kind::Int(_) => 2,
            Kind::Real(_) => 3,
            Kind::Str(_) => 4,
            _ => 5,
        };
        rank = rank.max(r);
    }
    match rank {
        0 => Ok(Value::null()),
        1 => {
            let mut out = Vec::new();
            for a in args {
                if let Kind::Logical(v) = &*a.value.kind() {
                    out.extend_from_slice(v);
                }
            }
            Ok(Value::logical(out))
        }
        2 => {
            let mut out = Vec::new();
            for a in args {
                match &*a.value.kind() {
                    Kind::Int(v) => out.extend_from_slice(v),
                    Kind::Logical(v) => out.extend(v.iter().map(|l| match l {
                        Some(true) => 1,
                        Some(false) => 0,
                        None => NA_INT,
                    })),
                    Kind::Null => {}
                    _ => unreachable!(),
                }
            }
            Ok(Value::ints(out))
        }
        3 => {
            let mut out = Vec::new();
            for a in args {
                match real_elems(&a.value) {
                    Some(v) => out.extend(v),
                    None => {}
                }
            }
            Ok(Value::reals(out))
        }
        4 => {
            let mut out: Vec<Rc<str>> = Vec::new();
            for a in args {
                match &*a.value.kind() {
                    Kind::Str(v) => out.extend(v.iter().cloned()),
                    Kind::Null => {}
                    other => {
                        let n = match other {
                            Kind::Logical(v) => v.len(),
                            Kind::Int(v) => v.len(),
                            Kind::Real(v) => v.len(),
                            _ => 0,
                        };
                        for i in 0..n {
                            let elem = vector_elem(&a.value, i).unwrap();
                            out.push(Rc::from(elem.deparse().as_str()));
                        }
                    }
                }
            }
            Ok(Value::strs(out))
        }
        _ => {
            let mut out = Vec::new();
            for a in args {
                match &*a.value.kind() {
                    Kind::List(v) => out.extend(v.iter().cloned()),
                    Kind::Null => {}
                    _ => {
                        let n = a.value.length().max(1);
                        if matches!(
                            &*a.value.kind(),
                            Kind::Logical(_) | Kind::Int(_) | Kind::Real(_) | Kind::Str(_)
                        ) {
                            for i in 0..n {
                                out.push(vector_elem(&a.value, i).unwrap());
                            }
                        } else {
                            out.push(a.value.clone());
                        }
                    }
                }
            }
            Ok(Value::list(out))
        }
    }
}

fn bi_list(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    let out = Value::list(args.iter().map(|a| a.value.clone()).collect());
    if args.iter().any(|a| a.tag.is_some()) {
        let names: Vec<Rc<str>> = args
            .iter()
            .map(|a| match a.tag {
                Some(t) => Rc::from(resolve(t).as_str()),
                None => Rc::from(""),
            })
            .collect();
        out.set_attr(sym::names(), Value::strs(names));
    }
    Ok(out)
}

fn bi_length(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "length", 1);
    Ok(Value::int(args[0].value.length() as i32))
}

fn bi_extract2(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "[[", 2);
    extract2(&args[0].value, &args[1].value)
}

fn bi_subset1(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "[", 2);
    subset1(&args[0].value, &args[1].value)
}

fn value_arg<'a>(name: &str, args: &'a [Arg]) -> Eval<&'a Value> {
    let v = args.iter().rev().find(|a| a.tag == Some(sym::value()));
    match v {
        Some(a) => Ok(&a.value),
        None => args
            .last()
            .map(|a| &a.value)
            .ok_or_else(|| err(format!("'{}' requires a value argument", name))),
    }
}

fn bi_subassign2(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    if args.len() != 3 {
        return Err(err("3 arguments expected by '[[<-'"));
    }
    let value = value_arg("[[<-", args)?.clone();
    subassign(&args[0].value, &args[1].value, value)
}

fn bi_subassign1(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    if args.len() != 3 {
        return Err(err("3 arguments expected by '[<-'"));
    }
    let value = value_arg("[<-", args)?.clone();
    subassign(&args[0].value, &args[1].value, value)
}

fn bi_dollar(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "$", 2);
    let name = name_of(&args[1].value).ok_or_else(|| err("invalid name for '$'"))?;
    match position_by_name(&args[0].value, &name) {
        Some(pos) => Ok(vector_elem(&args[0].value, pos).unwrap_or_else(Value::null)),
        None => Ok(Value::null()),
    }
}

fn bi_dollar_assign(
    _ev: &mut dyn Evaluator,
    _call: &Value,
    args: &[Arg],
    _env: &Env,
) -> Eval<Value> {
    if args.len() != 3 {
        return Err(err("3 arguments expected by '$<-'"));
    }
    let value = value_arg("$<-", args)?.clone();
    subassign(&args[0].value, &args[1].value, value)
}

fn bi_class(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "class", 1);
    let x = &args[0].value;
    if let Some(c) = x.get_attr(sym::class()) {
        return Ok(c);
    }
    let implicit = match &*x.kind() {
        Kind::Null => "NULL",
        Kind::Logical(_) => "logical",
        Kind::Int(_) => "integer",
        Kind::Real(_) => "numeric",
        Kind::Str(_) => "character",
        Kind::List(_) => "list",
        Kind::Closure(_) | Kind::Builtin(_) => "function",
        Kind::Environment(_) => "environment",
        Kind::Lang(_) => "call",
        Kind::Symbol(_) => "name",
        _ => "language",
    };
    Ok(Value::str(implicit))
}

fn bi_class_assign(
    _ev: &mut dyn Evaluator,
    _call: &Value,
    args: &[Arg],
    _env: &Env,
) -> Eval<Value> {
    args_exactly!(args, "class<-", 2);
    let value = value_arg("class<-", args)?.clone();
    let out = prepare_for_write(&args[0].value);
    out.set_attr(sym::class(), value);
    Ok(out)
}

fn bi_attr(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "attr", 2);
    let name = name_of(&args[1].value).ok_or_else(|| err("invalid attribute name"))?;
    Ok(args[0]
        .value
        .get_attr(intern(&name))
        .unwrap_or_else(Value::null))
}

fn bi_names(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "names", 1);
    Ok(args[0]
        .value
        .get_attr(sym::names())
        .unwrap_or_else(Value::null))
}

fn bi_stop(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    let msg = args
        .first()
        .and_then(|a| a.value.as_str_scalar())
        .map(|s| s.to_string())
        .unwrap_or_default();
    Err(err(msg))
}

fn bi_warning(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    let msg = args
        .first()
        .and_then(|a| a.value.as_str_scalar())
        .map(|s| s.to_string())
        .unwrap_or_default();
    ev.warn(msg.clone());
    ev.set_visible(false);
    Ok(Value::str(&msg))
}

fn bi_invisible(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    ev.set_visible(false);
    Ok(args
        .first()
        .map(|a| a.value.clone())
        .unwrap_or_else(Value::null))
}

fn bi_eval(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    if args.is_empty() {
        return Err(err("'eval' needs an expression"));
    }
    let target_env = match args.get(1) {
        Some(a) => a
            .value
            .as_env()
            .ok_or_else(|| err("invalid 'envir' argument"))?,
        None => env.clone(),
    };
    ev.eval(&args[0].value, &target_env)
}

fn bi_is_null(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "is.null", 1);
    Ok(Value::lgl(args[0].value.is_null()))
}

fn bi_is_list(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "is.list", 1);
    let v = &args[0].value;
    Ok(Value::lgl(v.is_list() || v.is_pairlist()))
}

fn bi_is_pairlist(
    _ev: &mut dyn Evaluator,
    _call: &Value,
    args: &[Arg],
    _env: &Env,
) -> Eval<Value> {
    args_exactly!(args, "is.pairlist", 1);
    let v = &args[0].value;
    Ok(Value::lgl(v.is_pairlist() || v.is_null()))
}

fn bi_print(ev: &mut dyn Evaluator, call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    args_exactly!(args, "print", 1);
    let x = &args[0].value;
    if x.is_object() {
        if let Some(res) =
            ev.dispatch_s3("print", x, call, vec![Arg::pos(x.clone())], env)?
        {
            return Ok(res);
        }
    }
    ev.print_line(x.deparse());
    ev.set_visible(false);
    Ok(x.clone())
}

fn bi_set_method(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "setMethod", 3);
    let selector = name_of(&args[0].value).ok_or_else(|| err("invalid generic name"))?;
    let class = name_of(&args[1].value).ok_or_else(|| err("invalid class name"))?;
    if !args[2].value.is_function() {
        return Err(err("method must be a function"));
    }
    ev.register_s4_method(intern(&selector), intern(&class), args[2].value.clone());
    ev.set_visible(false);
    Ok(Value::null())
}

fn bi_as_s4(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "asS4", 1);
    let out = prepare_for_write(&args[0].value);
    out.set_s4(true);
    Ok(out)
}

// ── Specials ──────────────────────────────────────────────────────

fn sp_quote(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], _env: &Env) -> Eval<Value> {
    args_exactly!(args, "quote", 1);
    Ok(args[0].value.clone())
}

fn sp_function(_ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    if args.len() < 2 {
        return Err(err("invalid function definition"));
    }
    let formals = match &*args[0].value.kind() {
        Kind::Null => Vec::new(),
        Kind::Pairlist(items) => items
            .iter()
            .map(|a| {
                let name = a
                    .tag
                    .ok_or_else(|| err("invalid formal argument list"))?;
                let default = if a.value.is_missing() {
                    None
                } else {
                    Some(a.value.clone())
                };
                Ok(Formal { name, default })
            })
            .collect::<Eval<Vec<_>>>()?,
        _ => return Err(err("invalid formal argument list")),
    };
    Ok(Value::closure(formals, args[1].value.clone(), env.clone()))
}

fn sp_if(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    if args.len() < 2 {
        return Err(err("'if' needs a condition and a branch"));
    }
    let cond = ev.eval(&args[0].value, env)?;
    if check_condition(ev, &cond)? {
        ev.eval(&args[1].value, env)
    } else if let Some(alt) = args.get(2) {
        ev.eval(&alt.value, env)
    } else {
        ev.set_visible(false);
        Ok(Value::null())
    }
}

fn sp_while(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    args_exactly!(args, "while", 2);
    loop {
        let cond = ev.eval(&args[0].value, env)?;
        if !check_condition(ev, &cond)? {
            break;
        }
        match ev.eval(&args[1].value, env) {
            Ok(_) => {}
            Err(Unwind::Break) => break,
            Err(Unwind::Next) => continue,
            Err(e) => return Err(e),
        }
    }
    ev.set_visible(false);
    Ok(Value::null())
}

fn sp_repeat(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    args_exactly!(args, "repeat", 1);
    loop {
        match ev.eval(&args[0].value, env) {
            Ok(_) => {}
            Err(Unwind::Break) => break,
            Err(Unwind::Next) => continue,
            Err(e) => return Err(e),
        }
    }
    ev.set_visible(false);
    Ok(Value::null())
}

fn sp_for(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    args_exactly!(args, "for", 3);
    let var = args[0]
        .value
        .as_symbol()
        .ok_or_else(|| err("invalid for() loop variable"))?;
    let seq = ev.eval(&args[1].value, env)?;
    for i in 0..seq.length() {
        let elem = vector_elem(&seq, i).unwrap_or_else(Value::null);
        elem.bump_named();
        env.define(var, elem);
        match ev.eval(&args[2].value, env) {
            Ok(_) => {}
            Err(Unwind::Break) => break,
            Err(Unwind::Next) => continue,
            Err(e) => return Err(e),
        }
    }
    ev.set_visible(false);
    Ok(Value::null())
}

fn sp_break(_ev: &mut dyn Evaluator, _call: &Value, _args: &[Arg], _env: &Env) -> Eval<Value> {
    Err(Unwind::Break)
}

fn sp_next(_ev: &mut dyn Evaluator, _call: &Value, _args: &[Arg], _env: &Env) -> Eval<Value> {
    Err(Unwind::Next)
}

fn sp_return(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    let value = match args.first() {
        Some(a) => ev.eval(&a.value, env)?,
        None => Value::null(),
    };
    Err(Unwind::Return(value))
}

fn sp_block(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    let mut last = Value::null();
    for a in args {
        last = ev.eval(&a.value, env)?;
    }
    Ok(last)
}

fn sp_paren(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    args_exactly!(args, "(", 1);
    let v = ev.eval(&args[0].value, env)?;
    ev.set_visible(true);
    Ok(v)
}

fn sp_and(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    args_exactly!(args, "&&", 2);
    let lhs = as_logical_scalar(&ev.eval(&args[0].value, env)?);
    if lhs == Some(false) {
        return Ok(Value::lgl(false));
    }
    let rhs = as_logical_scalar(&ev.eval(&args[1].value, env)?);
    Ok(Value::logical(vec![lgl_and(lhs, rhs)]))
}

fn sp_or(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    args_exactly!(args, "||", 2);
    let lhs = as_logical_scalar(&ev.eval(&args[0].value, env)?);
    if lhs == Some(true) {
        return Ok(Value::lgl(true));
    }
    let rhs = as_logical_scalar(&ev.eval(&args[1].value, env)?);
    Ok(Value::logical(vec![lgl_or(lhs, rhs)]))
}

/// Three-valued conjunction.
pub fn lgl_and(a: Lgl, b: Lgl) -> Lgl {
    match (a, b) {
        (Some(true), Some(true)) => Some(true),
        (Some(false), _) | (_, Some(false)) => Some(false),
        _ => None,
    }
}

/// Three-valued disjunction.
pub fn lgl_or(a: Lgl, b: Lgl) -> Lgl {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn sp_use_method(ev: &mut dyn Evaluator, call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    if args.is_empty() || args.len() > 2 {
        return Err(err("'UseMethod' expects a generic name and an object"));
    }
    let generic_v = ev.eval(&args[0].value, env)?;
    let generic = generic_v
        .as_str_scalar()
        .ok_or_else(|| err("'UseMethod' generic must be a character string"))?;
    let obj = match args.get(1) {
        Some(a) => ev.eval(&a.value, env)?,
        None => return Err(err("'UseMethod' called without an object")),
    };
    match ev.dispatch_s3(&generic, &obj, call, vec![Arg::pos(obj.clone())], env)? {
        Some(res) => Err(Unwind::Return(res)),
        None => Err(err(format!(
            "no applicable method for '{}' applied to an object of class \"{}\"",
            generic,
            obj.class_names()
                .first()
                .map(|c| c.to_string())
                .unwrap_or_else(|| obj.type_name().to_string())
        ))),
    }
}

fn sp_assign(ev: &mut dyn Evaluator, _call: &Value, args: &[Arg], env: &Env) -> Eval<Value> {
    args_exactly!(args, "<-", 2);
    let value = ev.eval(&args[1].value, env)?;
    value.bump_named();
    assign_into(ev, &args[0].value, value.clone(), env)?;
    ev.set_visible(false);
    Ok(value)
}

/// Dynamic (non-inlined) assignment: recursively expand
/// `f(x, a) <- v` into `x <- \`f<-\`(x, a, value = v)`.
fn assign_into(ev: &mut dyn Evaluator, lhs: &Value, value: Value, env: &Env) -> Eval<()> {
    if let Some(name) = lhs.as_symbol() {
        env.define(name, value);
        return Ok(());
    }
    if let Some(s) = lhs.as_str_scalar() {
        env.define(intern(&s), value);
        return Ok(());
    }
    let call = lhs
        .as_lang()
        .ok_or(Unwind::Error(RyeError::InvalidAssignTarget))?;
    let getter = call
        .fun
        .as_symbol()
        .ok_or(Unwind::Error(RyeError::InvalidAssignTarget))?;
    if call.args.is_empty() {
        return Err(Unwind::Error(RyeError::InvalidAssignTarget));
    }
    let target = &call.args[0].value;

    let mut setter_args = vec![call.args[0].clone()];
    for a in &call.args[1..] {
        // `$` takes its element name literally
        let v = if getter == sym::dollar() {
            match a.value.as_symbol() {
                Some(s) => Arg {
                    tag: a.tag,
                    value: Value::str(&resolve(s)),
                },
                None => a.clone(),
            }
        } else {
            a.clone()
        };
        setter_args.push(v);
    }
    setter_args.push(Arg::named(sym::value(), Value::quoted(value)));

    let setter_call = Value::lang(Value::symbol(sym::setter_for(getter)), setter_args);
    let new_target = ev.eval(&setter_call, env)?;
    assign_into(ev, target, new_target, env)
}

// ── Installation ──────────────────────────────────────────────────

fn defs() -> Vec<BuiltinDef> {
    use BuiltinKind::*;
    use Visibility::*;

    macro_rules! def {
        ($name:literal, $kind:expr, $vis:expr, $func:path) => {
            BuiltinDef {
                name: $name,
                kind: $kind,
                visibility: $vis,
                func: $func,
            }
        };
    }

    vec![
        def!("+", Builtin, On, bi_add),
        def!("-", Builtin, On, bi_sub),
        def!("*", Builtin, On, bi_mul),
        def!("/", Builtin, On, bi_div),
        def!("<", Builtin, On, bi_lt),
        def!(">", Builtin, On, bi_gt),
        def!("==", Builtin, On, bi_eq),
        def!(":", Builtin, On, bi_colon),
        def!("c", Builtin, On, bi_c),
        def!("list", Builtin, On, bi_list),
        def!("length", Builtin, On, bi_length),
        def!("[[", Builtin, On, bi_extract2),
        def!("[", Builtin, On, bi_subset1),
        def!("[[<-", Builtin, Keep, bi_subassign2),
        def!("[<-", Builtin, Keep, bi_subassign1),
        def!("$", Builtin, On, bi_dollar),
        def!("$<-", Builtin, Keep, bi_dollar_assign),
        def!("class", Builtin, On, bi_class),
        def!("class<-", Builtin, Keep, bi_class_assign),
        def!("attr", Builtin, On, bi_attr),
        def!("names", Builtin, On, bi_names),
        def!("stop", Builtin, On, bi_stop),
        def!("warning", Builtin, Keep, bi_warning),
        def!("invisible", Builtin, Keep, bi_invisible),
        def!("eval", Builtin, On, bi_eval),
        def!("is.null", Builtin, On, bi_is_null),
        def!("is.list", Builtin, On, bi_is_list),
        def!("is.pairlist", Builtin, On, bi_is_pairlist),
        def!("print", Builtin, Keep, bi_print),
        def!("setMethod", Builtin, Keep, bi_set_method),
        def!("asS4", Builtin, On, bi_as_s4),
        def!("quote", Special, On, sp_quote),
        def!("function", Special, On, sp_function),
        def!("if", Special, Keep, sp_if),
        def!("while", Special, Off, sp_while),
        def!("repeat", Special, Off, sp_repeat),
        def!("for", Special, Off, sp_for),
        def!("break", Special, Keep, sp_break),
        def!("next", Special, Keep, sp_next),
        def!("return", Special, Keep, sp_return),
        def!("{", Special, Keep, sp_block),
        def!("(", Special, On, sp_paren),
        def!("&&", Special, On, sp_and),
        def!("||", Special, On, sp_or),
        def!("UseMethod", Special, Keep, sp_use_method),
        def!("<-", Special, Off, sp_assign),
        def!("=", Special, Off, sp_assign),
    ]
}

/// Populate `env` with the base library.
pub fn install_base(env: &Env) {
    for def in defs() {
        let name = intern(def.name);
        env.define(name, Value::builtin(Rc::new(def)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lgl_and_truth_table() {
        assert_eq!(lgl_and(None, Some(false)), Some(false));
        assert_eq!(lgl_and(None, Some(true)), None);
        assert_eq!(lgl_and(Some(false), None), Some(false));
        assert_eq!(lgl_and(Some(true), Some(true)), Some(true));
    }

    #[test]
    fn test_lgl_or_truth_table() {
        assert_eq!(lgl_or(None, Some(true)), Some(true));
        assert_eq!(lgl_or(None, Some(false)), None);
        assert_eq!(lgl_or(Some(false), Some(false)), Some(false));
    }

    #[test]
    fn test_condition_to_bool() {
        assert_eq!(condition_to_bool(&Value::lgl(true)), Ok((true, false)));
        assert_eq!(condition_to_bool(&Value::real(0.0)), Ok((false, false)));
        assert_eq!(
            condition_to_bool(&Value::logical(vec![Some(true), Some(false)])),
            Ok((true, true))
        );
        assert_eq!(
            condition_to_bool(&Value::logical(vec![])),
            Err(COND_LENGTH_ZERO)
        );
        assert_eq!(
            condition_to_bool(&Value::lgl_na()),
            Err(COND_NA_LOGICAL)
        );
        assert_eq!(
            condition_to_bool(&Value::str("banana")),
            Err(COND_NOT_LOGICAL)
        );
    }

    #[test]
    fn test_arith_int_stays_int() {
        let r = arith(ArithOp::Add, &Value::int(2), &Value::int(3)).unwrap();
        assert_eq!(r.as_int_scalar(), Some(5));
        let r = arith(ArithOp::Div, &Value::int(7), &Value::int(2)).unwrap();
        assert_eq!(r.as_real_scalar(), Some(3.5));
    }

    #[test]
    fn test_arith_real_recycling() {
        let r = arith(
            ArithOp::Mul,
            &Value::reals(vec![1.0, 2.0, 3.0]),
            &Value::real(2.0),
        )
        .unwrap();
        assert_eq!(r, Value::reals(vec![2.0, 4.0, 6.0]));
    }

    #[test]
    fn test_compare_na_propagates() {
        let r = compare(CmpOp::Lt, &Value::real(f64::NAN), &Value::real(1.0)).unwrap();
        assert_eq!(r.as_lgl_scalar(), Some(None));
    }

    #[test]
    fn test_extract2_by_index_and_name() {
        let x = Value::list(vec![Value::real(1.0), Value::real(2.0)]);
        x.set_attr(sym::names(), Value::strs(vec!["a".into(), "b".into()]));
        assert_eq!(
            extract2(&x, &Value::int(2)).unwrap().as_real_scalar(),
            Some(2.0)
        );
        assert_eq!(
            extract2(&x, &Value::str("a")).unwrap().as_real_scalar(),
            Some(1.0)
        );
        assert!(matches!(
            extract2(&x, &Value::int(3)),
            Err(Unwind::Error(RyeError::OutOfBounds))
        ));
    }

    #[test]
    fn test_subassign_copies_when_shared() {
        let x = Value::list(vec![Value::real(1.0)]);
        x.mark_shared();
        let y = subassign(&x, &Value::int(1), Value::real(9.0)).unwrap();
        assert!(!y.ptr_eq(&x));
        assert_eq!(extract2(&x, &Value::int(1)).unwrap().as_real_scalar(), Some(1.0));
        assert_eq!(extract2(&y, &Value::int(1)).unwrap().as_real_scalar(), Some(9.0));
    }

    #[test]
    fn test_subassign_in_place_when_unshared() {
        let x = Value::list(vec![Value::real(1.0)]);
        let y = subassign(&x, &Value::int(1), Value::real(9.0)).unwrap();
        assert!(y.ptr_eq(&x));
    }

    #[test]
    fn test_subassign_by_new_name_extends() {
        let x = Value::list(vec![Value::real(1.0)]);
        x.set_attr(sym::names(), Value::strs(vec!["a".into()]));
        let y = subassign(&x, &Value::str("b"), Value::real(2.0)).unwrap();
        assert_eq!(y.length(), 2);
        assert_eq!(extract2(&y, &Value::str("b")).unwrap().as_real_scalar(), Some(2.0));
    }
}
