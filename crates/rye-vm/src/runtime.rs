use std::cell::{Cell, RefCell};
use std::rc::Rc;

use hashbrown::HashMap;

use rye_core::{install_base, BuiltinDef, Env, Spur, Value};

use crate::pool::Pool;

/// The process-wide state of one interpreter instance: constant and source
/// pools, the visibility flag, the warning and output sinks, the formal
/// method registry, and the base environment. Created once at startup and
/// threaded by reference through the compiler and the interpreter.
pub struct Runtime {
    pub cpool: RefCell<Pool>,
    pub spool: RefCell<Pool>,
    pub visible: Cell<bool>,
    pub warnings: RefCell<Vec<String>>,
    pub output: RefCell<Vec<String>>,
    s4_methods: RefCell<HashMap<(Spur, Spur), Value>>,
    base: Env,
}

impl Runtime {
    pub fn new() -> Runtime {
        let base = Env::global();
        install_base(&base);
        Runtime {
            cpool: RefCell::new(Pool::new()),
            spool: RefCell::new(Pool::with_reserved_zero()),
            visible: Cell::new(true),
            warnings: RefCell::new(Vec::new()),
            output: RefCell::new(Vec::new()),
            s4_methods: RefCell::new(HashMap::new()),
            base,
        }
    }

    /// The base environment holding the builtin library.
    pub fn base_env(&self) -> &Env {
        &self.base
    }

    /// A fresh user environment whose parent is the base environment.
    pub fn new_global_env(&self) -> Env {
        self.base.child()
    }

    pub fn const_at(&self, idx: u32) -> Value {
        self.cpool.borrow().get(idx)
    }

    pub fn src_at(&self, idx: u32) -> Value {
        self.spool.borrow().get(idx)
    }

    pub fn warn(&self, msg: String) {
        self.warnings.borrow_mut().push(msg);
    }

    pub fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut self.warnings.borrow_mut())
    }

    pub fn print_line(&self, line: String) {
        self.output.borrow_mut().push(line);
    }

    pub fn take_output(&self) -> Vec<String> {
        std::mem::take(&mut self.output.borrow_mut())
    }

    // ── Formal (multi-argument) method registry ───────────────────

    pub fn register_s4_method(&self, selector: Spur, class: Spur, method: Value) {
        self.s4_methods
            .borrow_mut()
            .insert((selector, class), method);
    }

    /// Does `selector` have any formal methods at all?
    pub fn has_s4_methods(&self, selector: Spur) -> bool {
        self.s4_methods
            .borrow()
            .keys()
            .any(|(sel, _)| *sel == selector)
    }

    pub fn s4_method(&self, selector: Spur, class: Spur) -> Option<Value> {
        self.s4_methods.borrow().get(&(selector, class)).cloned()
    }

    /// Resolve the base definition of a builtin by name; used by guard
    /// checks and fast-path fallbacks.
    pub fn base_builtin(&self, name: Spur) -> Option<Rc<BuiltinDef>> {
        self.base.get_local(name).and_then(|v| v.as_builtin())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rye_core::intern;

    #[test]
    fn test_base_env_has_builtins() {
        let rt = Runtime::new();
        assert!(rt.base_builtin(intern("+")).is_some());
        assert!(rt.base_builtin(intern("while")).unwrap().is_special());
        assert!(rt.base_builtin(intern("no.such.fn")).is_none());
    }

    #[test]
    fn test_s4_registry() {
        let rt = Runtime::new();
        let sel = intern("summary");
        let cls = intern("track");
        assert!(!rt.has_s4_methods(sel));
        rt.register_s4_method(sel, cls, Value::null());
        assert!(rt.has_s4_methods(sel));
        assert!(rt.s4_method(sel, cls).is_some());
        assert!(rt.s4_method(sel, intern("other")).is_none());
    }
}
