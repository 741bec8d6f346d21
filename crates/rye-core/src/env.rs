use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::intern::Spur;
use crate::value::Value;

struct EnvData {
    vars: RefCell<HashMap<Spur, Value>>,
    parent: Option<Env>,
}

/// A first-class environment: a symbol-to-value frame chained to a parent.
/// The global environment has no parent.
#[derive(Clone)]
pub struct Env(Rc<EnvData>);

impl Env {
    pub fn global() -> Env {
        Env(Rc::new(EnvData {
            vars: RefCell::new(HashMap::new()),
            parent: None,
        }))
    }

    /// A fresh child frame of `self`.
    pub fn child(&self) -> Env {
        Env(Rc::new(EnvData {
            vars: RefCell::new(HashMap::new()),
            parent: Some(self.clone()),
        }))
    }

    pub fn parent(&self) -> Option<Env> {
        self.0.parent.clone()
    }

    /// Look up locally, without walking the chain.
    pub fn get_local(&self, sym: Spur) -> Option<Value> {
        self.0.vars.borrow().get(&sym).cloned()
    }

    /// Walk the chain for `sym`.
    pub fn get(&self, sym: Spur) -> Option<Value> {
        let mut env = Some(self.clone());
        while let Some(e) = env {
            if let Some(v) = e.get_local(sym) {
                return Some(v);
            }
            env = e.parent();
        }
        None
    }

    /// Bind `sym` in this frame, shadowing any outer binding.
    pub fn define(&self, sym: Spur, value: Value) {
        self.0.vars.borrow_mut().insert(sym, value);
    }

    /// Reassign the innermost existing binding of `sym`; returns false when
    /// no frame in the chain binds it.
    pub fn set_existing(&self, sym: Spur, value: Value) -> bool {
        let mut env = Some(self.clone());
        while let Some(e) = env {
            if e.0.vars.borrow().contains_key(&sym) {
                e.0.vars.borrow_mut().insert(sym, value);
                return true;
            }
            env = e.parent();
        }
        false
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<environment {:p}>", Rc::as_ptr(&self.0))
    }
}
