//! Lexically-nested symbol environments.
//!
//! An `Env` is a cheap shared handle; closures keep the defining scope
//! alive by holding one. Lookup and assignment walk the parent chain,
//! definition always writes the local frame.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::runtime::value::Value;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnvError {
    #[error("symbol already defined")]
    AlreadyDefined,
    #[error("symbol not defined")]
    NotDefined,
    #[error("constant can not be changed")]
    Constant,
}

struct Binding {
    value: Value,
    readonly: bool,
}

struct Scope {
    store: HashMap<String, Binding>,
    parent: Option<Env>,
}

#[derive(Clone)]
pub struct Env(Rc<RefCell<Scope>>);

impl Env {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(Scope {
            store: HashMap::new(),
            parent: None,
        })))
    }

    /// A child scope whose lookups fall through to `self`.
    pub fn enclosed(&self) -> Self {
        Self(Rc::new(RefCell::new(Scope {
            store: HashMap::new(),
            parent: Some(self.clone()),
        })))
    }

    pub fn parent(&self) -> Option<Env> {
        self.0.borrow().parent.clone()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let scope = self.0.borrow();
        if let Some(binding) = scope.store.get(name) {
            return Some(binding.value.clone());
        }
        scope.parent.as_ref().and_then(|parent| parent.get(name))
    }

    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.0
            .borrow()
            .store
            .get(name)
            .map(|binding| binding.value.clone())
    }

    pub fn is_const(&self, name: &str) -> bool {
        let scope = self.0.borrow();
        if let Some(binding) = scope.store.get(name) {
            return binding.readonly;
        }
        scope
            .parent
            .as_ref()
            .map(|parent| parent.is_const(name))
            .unwrap_or(false)
    }

    /// Define a new mutable binding in this frame.
    pub fn create(&self, name: &str, value: Value) -> Result<(), EnvError> {
        self.create_binding(name, value, false)
    }

    /// Define a new read-only binding in this frame.
    pub fn create_const(&self, name: &str, value: Value) -> Result<(), EnvError> {
        self.create_binding(name, value, true)
    }

    fn create_binding(&self, name: &str, value: Value, readonly: bool) -> Result<(), EnvError> {
        let mut scope = self.0.borrow_mut();
        if scope.store.contains_key(name) {
            return Err(EnvError::AlreadyDefined);
        }
        scope
            .store
            .insert(name.to_string(), Binding { value, readonly });
        Ok(())
    }

    /// Assign to the nearest enclosing binding.
    pub fn set(&self, name: &str, value: Value) -> Result<(), EnvError> {
        let mut scope = self.0.borrow_mut();
        if let Some(binding) = scope.store.get_mut(name) {
            if binding.readonly {
                return Err(EnvError::Constant);
            }
            binding.value = value;
            return Ok(());
        }
        match &scope.parent {
            Some(parent) => parent.set(name, value),
            None => Err(EnvError::NotDefined),
        }
    }

    /// Define-or-overwrite in this frame, bypassing const checks. Used by
    /// hosts seeding root constants and instance field stores.
    pub fn set_force(&self, name: &str, value: Value, readonly: bool) {
        self.0
            .borrow_mut()
            .store
            .insert(name.to_string(), Binding { value, readonly });
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Names defined directly in this frame, for diagnostics and iteration.
    pub fn local_names(&self) -> Vec<String> {
        self.0.borrow().store.keys().cloned().collect()
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defines_and_reads_back() {
        let env = Env::new();
        env.create("x", Value::Int(5)).expect("create failed");
        assert_eq!(env.get("x"), Some(Value::Int(5)));
        assert_eq!(env.get("y"), None);
    }

    #[test]
    fn rejects_redefinition_in_same_frame() {
        let env = Env::new();
        env.create("x", Value::Int(1)).expect("create failed");
        assert_eq!(env.create("x", Value::Int(2)), Err(EnvError::AlreadyDefined));
    }

    #[test]
    fn lookup_walks_the_chain() {
        let root = Env::new();
        root.create("x", Value::Int(1)).expect("create failed");
        let child = root.enclosed();
        assert_eq!(child.get("x"), Some(Value::Int(1)));
        assert_eq!(child.get_local("x"), None);
    }

    #[test]
    fn inner_definitions_shadow_outer() {
        let root = Env::new();
        root.create("x", Value::Int(1)).expect("create failed");
        let child = root.enclosed();
        child.create("x", Value::Int(2)).expect("create failed");
        assert_eq!(child.get("x"), Some(Value::Int(2)));
        assert_eq!(root.get("x"), Some(Value::Int(1)));
    }

    #[test]
    fn assignment_mutates_nearest_binding() {
        let root = Env::new();
        root.create("x", Value::Int(1)).expect("create failed");
        let child = root.enclosed();
        child.set("x", Value::Int(7)).expect("set failed");
        assert_eq!(root.get("x"), Some(Value::Int(7)));
    }

    #[test]
    fn assignment_to_undefined_fails() {
        let env = Env::new();
        assert_eq!(env.set("x", Value::Int(1)), Err(EnvError::NotDefined));
    }

    #[test]
    fn constants_reject_reassignment() {
        let env = Env::new();
        env.create_const("PI", Value::Int(3)).expect("create failed");
        assert_eq!(env.set("PI", Value::Int(4)), Err(EnvError::Constant));
        assert!(env.is_const("PI"));

        let child = env.enclosed();
        assert_eq!(child.set("PI", Value::Int(4)), Err(EnvError::Constant));
    }

    #[test]
    fn closures_see_later_mutations() {
        // Capture-by-reference: a closure holding the scope observes
        // subsequent writes through that scope.
        let root = Env::new();
        root.create("x", Value::Int(1)).expect("create failed");
        let captured = root.clone();
        root.set("x", Value::Int(42)).expect("set failed");
        assert_eq!(captured.get("x"), Some(Value::Int(42)));
    }
}
