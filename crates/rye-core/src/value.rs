use std::any::Any;
use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::builtins::BuiltinDef;
use crate::env::Env;
use crate::intern::{intern, resolve, sym, Spur};

/// A scalar of the three-valued logical type.
pub type Lgl = Option<bool>;

/// NA sentinel for integer vectors, same bit pattern as the host runtime.
pub const NA_INT: i32 = i32::MIN;

/// One (optionally tagged) element of an argument list, a pair list, or a
/// `...` binding.
#[derive(Debug, Clone)]
pub struct Arg {
    pub tag: Option<Spur>,
    pub value: Value,
}

impl Arg {
    pub fn pos(value: Value) -> Arg {
        Arg { tag: None, value }
    }

    pub fn named(tag: Spur, value: Value) -> Arg {
        Arg {
            tag: Some(tag),
            value,
        }
    }
}

/// A language call: callee plus tagged arguments.
#[derive(Debug, Clone)]
pub struct Call {
    pub fun: Value,
    pub args: Vec<Arg>,
}

/// One formal parameter of a closure. `default` is the unevaluated default
/// expression, absent for mandatory parameters and for `...`.
#[derive(Debug, Clone)]
pub struct Formal {
    pub name: Spur,
    pub default: Option<Value>,
}

/// A user-defined function: formals, body AST, defining environment.
/// `compiled` is filled in by the VM on first use (compile on demand) and is
/// opaque to this crate.
pub struct ClosureData {
    pub formals: Vec<Formal>,
    pub body: Value,
    pub compiled: RefCell<Option<Rc<dyn Any>>>,
    pub env: Env,
}

impl fmt::Debug for ClosureData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<closure/{}>", self.formals.len())
    }
}

/// A suspended computation. `expr` is always the source expression; `code`
/// (when present) is the VM's compiled body for it, which also keeps the
/// owning function object alive. Once `value` is set, further forces return
/// it without re-evaluation.
pub struct PromiseData {
    pub expr: Value,
    pub code: RefCell<Option<Rc<dyn Any>>>,
    pub env: Env,
    pub value: RefCell<Option<Value>>,
}

impl fmt::Debug for PromiseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.borrow().is_some() {
            write!(f, "<promise (forced)>")
        } else {
            write!(f, "<promise>")
        }
    }
}

/// A first-class reference to a compiled code body, as pushed by the
/// `quote` lowering. Escaped back to `ast` whenever it would become visible
/// to user code.
#[derive(Clone)]
pub struct CodeRef {
    pub handle: Rc<dyn Any>,
    pub ast: Value,
}

impl fmt::Debug for CodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<code {:?}>", self.ast)
    }
}

#[derive(Debug)]
pub enum Kind {
    Null,
    /// The distinguished missing-argument token.
    Missing,
    Symbol(Spur),
    Logical(Vec<Lgl>),
    Int(Vec<i32>),
    Real(Vec<f64>),
    Str(Vec<Rc<str>>),
    /// Generic vector.
    List(Vec<Value>),
    Pairlist(Vec<Arg>),
    Lang(Call),
    Closure(Rc<ClosureData>),
    Builtin(Rc<BuiltinDef>),
    Promise(Rc<PromiseData>),
    Environment(Env),
    /// The expanded `...` binding: pending (usually promised) arguments.
    Dots(Vec<Arg>),
    Code(CodeRef),
}

const NAMED_MASK: u8 = 0b0011;
const S4_FLAG: u8 = 0b0100;

struct Obj {
    kind: RefCell<Kind>,
    attrs: RefCell<Vec<(Spur, Value)>>,
    flags: Cell<u8>,
}

/// The shared value type. Cheap to clone; interior mutation is guarded by
/// the `named` sharing indicator, exactly as in the host runtime.
#[derive(Clone)]
pub struct Value(Rc<Obj>);

impl Value {
    fn from_kind(kind: Kind) -> Value {
        Value(Rc::new(Obj {
            kind: RefCell::new(kind),
            attrs: RefCell::new(Vec::new()),
            flags: Cell::new(0),
        }))
    }

    // -- Constructors --

    pub fn null() -> Value {
        Value::from_kind(Kind::Null)
    }

    pub fn missing() -> Value {
        Value::from_kind(Kind::Missing)
    }

    pub fn symbol(s: Spur) -> Value {
        Value::from_kind(Kind::Symbol(s))
    }

    pub fn sym(name: &str) -> Value {
        Value::symbol(intern(name))
    }

    pub fn lgl(b: bool) -> Value {
        Value::from_kind(Kind::Logical(vec![Some(b)]))
    }

    pub fn lgl_na() -> Value {
        Value::from_kind(Kind::Logical(vec![None]))
    }

    pub fn logical(v: Vec<Lgl>) -> Value {
        Value::from_kind(Kind::Logical(v))
    }

    pub fn int(i: i32) -> Value {
        Value::from_kind(Kind::Int(vec![i]))
    }

    pub fn ints(v: Vec<i32>) -> Value {
        Value::from_kind(Kind::Int(v))
    }

    pub fn real(x: f64) -> Value {
        Value::from_kind(Kind::Real(vec![x]))
    }

    pub fn reals(v: Vec<f64>) -> Value {
        Value::from_kind(Kind::Real(v))
    }

    pub fn str(s: &str) -> Value {
        Value::from_kind(Kind::Str(vec![Rc::from(s)]))
    }

    pub fn strs(v: Vec<Rc<str>>) -> Value {
        Value::from_kind(Kind::Str(v))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::from_kind(Kind::List(items))
    }

    pub fn pairlist(items: Vec<Arg>) -> Value {
        Value::from_kind(Kind::Pairlist(items))
    }

    pub fn lang(fun: Value, args: Vec<Arg>) -> Value {
        Value::from_kind(Kind::Lang(Call { fun, args }))
    }

    pub fn closure(formals: Vec<Formal>, body: Value, env: Env) -> Value {
        Value::from_kind(Kind::Closure(Rc::new(ClosureData {
            formals,
            body,
            compiled: RefCell::new(None),
            env,
        })))
    }

    pub fn builtin(def: Rc<BuiltinDef>) -> Value {
        Value::from_kind(Kind::Builtin(def))
    }

    pub fn promise(expr: Value, env: Env) -> Value {
        Value::from_kind(Kind::Promise(Rc::new(PromiseData {
            expr,
            code: RefCell::new(None),
            env,
            value: RefCell::new(None),
        })))
    }

    pub fn promise_data(data: Rc<PromiseData>) -> Value {
        Value::from_kind(Kind::Promise(data))
    }

    pub fn environment(env: Env) -> Value {
        Value::from_kind(Kind::Environment(env))
    }

    pub fn dots(args: Vec<Arg>) -> Value {
        Value::from_kind(Kind::Dots(args))
    }

    pub fn code(handle: Rc<dyn Any>, ast: Value) -> Value {
        Value::from_kind(Kind::Code(CodeRef { handle, ast }))
    }

    /// Wrap `v` in `quote(v)` so re-evaluation yields it unchanged.
    pub fn quoted(v: Value) -> Value {
        Value::lang(Value::symbol(sym::quote()), vec![Arg::pos(v)])
    }

    // -- Kind access --

    pub fn kind(&self) -> Ref<'_, Kind> {
        self.0.kind.borrow()
    }

    /// Mutable access to the data; callers must have established exclusive
    /// ownership (`named` below 2) first.
    pub fn kind_mut(&self) -> std::cell::RefMut<'_, Kind> {
        self.0.kind.borrow_mut()
    }

    // -- Predicates --

    pub fn is_null(&self) -> bool {
        matches!(&*self.kind(), Kind::Null)
    }

    pub fn is_missing(&self) -> bool {
        matches!(&*self.kind(), Kind::Missing)
    }

    pub fn is_symbol(&self) -> bool {
        matches!(&*self.kind(), Kind::Symbol(_))
    }

    pub fn is_lang(&self) -> bool {
        matches!(&*self.kind(), Kind::Lang(_))
    }

    pub fn is_pairlist(&self) -> bool {
        matches!(&*self.kind(), Kind::Pairlist(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(&*self.kind(), Kind::List(_))
    }

    pub fn is_closure(&self) -> bool {
        matches!(&*self.kind(), Kind::Closure(_))
    }

    pub fn is_builtin(&self) -> bool {
        matches!(&*self.kind(), Kind::Builtin(d) if !d.is_special())
    }

    pub fn is_special(&self) -> bool {
        matches!(&*self.kind(), Kind::Builtin(d) if d.is_special())
    }

    pub fn is_function(&self) -> bool {
        matches!(&*self.kind(), Kind::Closure(_) | Kind::Builtin(_))
    }

    pub fn is_promise(&self) -> bool {
        matches!(&*self.kind(), Kind::Promise(_))
    }

    pub fn is_environment(&self) -> bool {
        matches!(&*self.kind(), Kind::Environment(_))
    }

    pub fn is_dots(&self) -> bool {
        matches!(&*self.kind(), Kind::Dots(_))
    }

    pub fn is_code(&self) -> bool {
        matches!(&*self.kind(), Kind::Code(_))
    }

    pub fn is_dots_symbol(&self) -> bool {
        self.as_symbol() == Some(sym::dots())
    }

    /// Does this value carry a class attribute?
    pub fn is_object(&self) -> bool {
        self.get_attr(sym::class()).is_some()
    }

    pub fn is_s4(&self) -> bool {
        self.0.flags.get() & S4_FLAG != 0
    }

    pub fn set_s4(&self, yes: bool) {
        let f = self.0.flags.get();
        self.0
            .flags
            .set(if yes { f | S4_FLAG } else { f & !S4_FLAG });
    }

    // -- Accessors --

    pub fn as_symbol(&self) -> Option<Spur> {
        match &*self.kind() {
            Kind::Symbol(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_lang(&self) -> Option<Call> {
        match &*self.kind() {
            Kind::Lang(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<Rc<ClosureData>> {
        match &*self.kind() {
            Kind::Closure(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn as_builtin(&self) -> Option<Rc<BuiltinDef>> {
        match &*self.kind() {
            Kind::Builtin(d) => Some(d.clone()),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<Rc<PromiseData>> {
        match &*self.kind() {
            Kind::Promise(p) => Some(p.clone()),
            _ => None,
        }
    }

    pub fn as_env(&self) -> Option<Env> {
        match &*self.kind() {
            Kind::Environment(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn as_pairlist(&self) -> Option<Vec<Arg>> {
        match &*self.kind() {
            Kind::Pairlist(items) => Some(items.clone()),
            _ => None,
        }
    }

    pub fn as_dots(&self) -> Option<Vec<Arg>> {
        match &*self.kind() {
            Kind::Dots(items) => Some(items.clone()),
            _ => None,
        }
    }

    pub fn as_code(&self) -> Option<CodeRef> {
        match &*self.kind() {
            Kind::Code(c) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn as_real_scalar(&self) -> Option<f64> {
        match &*self.kind() {
            Kind::Real(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_int_scalar(&self) -> Option<i32> {
        match &*self.kind() {
            Kind::Int(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_lgl_scalar(&self) -> Option<Lgl> {
        match &*self.kind() {
            Kind::Logical(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_str_scalar(&self) -> Option<Rc<str>> {
        match &*self.kind() {
            Kind::Str(v) if v.len() == 1 => Some(v[0].clone()),
            _ => None,
        }
    }

    /// Host-style length: element count for vectors and lists, 0 for null,
    /// 1 for everything else.
    pub fn length(&self) -> usize {
        match &*self.kind() {
            Kind::Null => 0,
            Kind::Logical(v) => v.len(),
            Kind::Int(v) => v.len(),
            Kind::Real(v) => v.len(),
            Kind::Str(v) => v.len(),
            Kind::List(v) => v.len(),
            Kind::Pairlist(v) => v.len(),
            Kind::Dots(v) => v.len(),
            _ => 1,
        }
    }

    // -- Sharing indicator --

    pub fn named(&self) -> u8 {
        self.0.flags.get() & NAMED_MASK
    }

    pub fn set_named(&self, n: u8) {
        debug_assert!(n <= 2);
        let f = self.0.flags.get() & !NAMED_MASK;
        self.0.flags.set(f | (n & NAMED_MASK));
    }

    pub fn bump_named(&self) {
        let n = self.named();
        if n < 2 {
            self.set_named(n + 1);
        }
    }

    /// Mark as shared; in-place mutation is no longer allowed.
    pub fn mark_shared(&self) {
        self.set_named(2);
    }

    pub fn maybe_shared(&self) -> bool {
        self.named() >= 2
    }

    /// Same heap object?
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // -- Attributes --

    pub fn get_attr(&self, name: Spur) -> Option<Value> {
        self.0
            .attrs
            .borrow()
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn set_attr(&self, name: Spur, value: Value) {
        let mut attrs = self.0.attrs.borrow_mut();
        if value.is_null() {
            attrs.retain(|(k, _)| *k != name);
            return;
        }
        if let Some(slot) = attrs.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            attrs.push((name, value));
        }
    }

    pub fn has_attrs(&self) -> bool {
        !self.0.attrs.borrow().is_empty()
    }

    /// The class attribute as strings, empty when unclassed.
    pub fn class_names(&self) -> Vec<Rc<str>> {
        match self.get_attr(sym::class()) {
            Some(c) => match &*c.kind() {
                Kind::Str(v) => v.clone(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        }
    }

    /// Fresh copy of the data and attributes; the copy starts unshared.
    pub fn shallow_duplicate(&self) -> Value {
        let kind = match &*self.kind() {
            Kind::Null => Kind::Null,
            Kind::Missing => Kind::Missing,
            Kind::Symbol(s) => Kind::Symbol(*s),
            Kind::Logical(v) => Kind::Logical(v.clone()),
            Kind::Int(v) => Kind::Int(v.clone()),
            Kind::Real(v) => Kind::Real(v.clone()),
            Kind::Str(v) => Kind::Str(v.clone()),
            Kind::List(v) => Kind::List(v.clone()),
            Kind::Pairlist(v) => Kind::Pairlist(v.clone()),
            Kind::Lang(c) => Kind::Lang(c.clone()),
            Kind::Closure(c) => Kind::Closure(c.clone()),
            Kind::Builtin(d) => Kind::Builtin(d.clone()),
            Kind::Promise(p) => Kind::Promise(p.clone()),
            Kind::Environment(e) => Kind::Environment(e.clone()),
            Kind::Dots(v) => Kind::Dots(v.clone()),
            Kind::Code(c) => Kind::Code(c.clone()),
        };
        let out = Value::from_kind(kind);
        *out.0.attrs.borrow_mut() = self.0.attrs.borrow().clone();
        if self.is_s4() {
            out.set_s4(true);
        }
        out
    }

    /// Minimal deparser for error messages and disassembly.
    pub fn deparse(&self) -> String {
        match &*self.kind() {
            Kind::Null => "NULL".into(),
            Kind::Missing => String::new(),
            Kind::Symbol(s) => resolve(*s),
            Kind::Logical(v) if v.len() == 1 => match v[0] {
                Some(true) => "TRUE".into(),
                Some(false) => "FALSE".into(),
                None => "NA".into(),
            },
            Kind::Int(v) if v.len() == 1 => {
                if v[0] == NA_INT {
                    "NA_integer_".into()
                } else {
                    format!("{}L", v[0])
                }
            }
            Kind::Real(v) if v.len() == 1 => format!("{}", v[0]),
            Kind::Str(v) if v.len() == 1 => format!("{:?}", &*v[0]),
            Kind::Lang(c) => {
                let args = c
                    .args
                    .iter()
                    .map(|a| match a.tag {
                        Some(t) => format!("{} = {}", resolve(t), a.value.deparse()),
                        None => a.value.deparse(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{}({})", c.fun.deparse(), args)
            }
            Kind::Closure(_) => "<closure>".into(),
            Kind::Builtin(d) => format!("<builtin {}>", d.name),
            Kind::Promise(_) => "<promise>".into(),
            Kind::Environment(_) => "<environment>".into(),
            Kind::Code(_) => "<code>".into(),
            other => format!("<{}>", kind_name(other)),
        }
    }
}

fn kind_name(kind: &Kind) -> &'static str {
    match kind {
        Kind::Null => "NULL",
        Kind::Missing => "missing",
        Kind::Symbol(_) => "symbol",
        Kind::Logical(_) => "logical",
        Kind::Int(_) => "integer",
        Kind::Real(_) => "double",
        Kind::Str(_) => "character",
        Kind::List(_) => "list",
        Kind::Pairlist(_) => "pairlist",
        Kind::Lang(_) => "language",
        Kind::Closure(_) => "closure",
        Kind::Builtin(d) => {
            if d.is_special() {
                "special"
            } else {
                "builtin"
            }
        }
        Kind::Promise(_) => "promise",
        Kind::Environment(_) => "environment",
        Kind::Dots(_) => "...",
        Kind::Code(_) => "code",
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        kind_name(&self.kind())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.deparse())
    }
}

/// Structural equality for data, identity for closures, environments,
/// builtins and promises. Used for constant dedup and AST comparison.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        match (&*self.kind(), &*other.kind()) {
            (Kind::Null, Kind::Null) => true,
            (Kind::Missing, Kind::Missing) => true,
            (Kind::Symbol(a), Kind::Symbol(b)) => a == b,
            (Kind::Logical(a), Kind::Logical(b)) => a == b,
            (Kind::Int(a), Kind::Int(b)) => a == b,
            (Kind::Real(a), Kind::Real(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x == y || (x.is_nan() && y.is_nan()))
            }
            (Kind::Str(a), Kind::Str(b)) => a == b,
            (Kind::List(a), Kind::List(b)) => a == b,
            (Kind::Pairlist(a), Kind::Pairlist(b)) | (Kind::Dots(a), Kind::Dots(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.tag == y.tag && x.value == y.value)
            }
            (Kind::Lang(a), Kind::Lang(b)) => {
                a.fun == b.fun
                    && a.args.len() == b.args.len()
                    && a.args
                        .iter()
                        .zip(b.args.iter())
                        .all(|(x, y)| x.tag == y.tag && x.value == y.value)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_accessors() {
        assert_eq!(Value::real(1.5).as_real_scalar(), Some(1.5));
        assert_eq!(Value::int(7).as_int_scalar(), Some(7));
        assert_eq!(Value::lgl(true).as_lgl_scalar(), Some(Some(true)));
        assert_eq!(Value::reals(vec![1.0, 2.0]).as_real_scalar(), None);
    }

    #[test]
    fn test_named_discipline() {
        let v = Value::real(1.0);
        assert_eq!(v.named(), 0);
        v.bump_named();
        assert_eq!(v.named(), 1);
        assert!(!v.maybe_shared());
        v.bump_named();
        assert!(v.maybe_shared());
        v.bump_named();
        assert_eq!(v.named(), 2);
    }

    #[test]
    fn test_shallow_duplicate_is_unshared() {
        let v = Value::reals(vec![1.0, 2.0]);
        v.set_attr(sym::class(), Value::str("foo"));
        v.mark_shared();
        let d = v.shallow_duplicate();
        assert_eq!(d.named(), 0);
        assert!(d.is_object());
        assert!(!d.ptr_eq(&v));
        assert_eq!(d, v);
    }

    #[test]
    fn test_structural_equality_of_calls() {
        let a = Value::lang(
            Value::sym("f"),
            vec![Arg::pos(Value::real(1.0)), Arg::named(intern("x"), Value::sym("y"))],
        );
        let b = Value::lang(
            Value::sym("f"),
            vec![Arg::pos(Value::real(1.0)), Arg::named(intern("x"), Value::sym("y"))],
        );
        assert_eq!(a, b);
        let c = Value::lang(Value::sym("g"), vec![Arg::pos(Value::real(1.0))]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_class_names() {
        let v = Value::list(vec![]);
        assert!(v.class_names().is_empty());
        v.set_attr(sym::class(), Value::strs(vec!["foo".into(), "bar".into()]));
        let classes = v.class_names();
        assert_eq!(&*classes[0], "foo");
        assert_eq!(&*classes[1], "bar");
        assert!(v.is_object());
    }

    #[test]
    fn test_set_attr_null_removes() {
        let v = Value::list(vec![]);
        v.set_attr(sym::class(), Value::str("foo"));
        assert!(v.is_object());
        v.set_attr(sym::class(), Value::null());
        assert!(!v.is_object());
        assert!(!v.has_attrs());
    }
}
