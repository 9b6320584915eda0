//! Tagged runtime value shared by the evaluator and the VM.
//!
//! Aggregates (arrays, hashes, instances) are reference values behind
//! `Rc<RefCell<..>>`; scalars are plain. Control-flow markers (return,
//! break, continue) are ordinary variants threaded up the recursion so
//! both backends unwind the same way without host exceptions.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::ast::Block;
use crate::bytecode::CodeBlock;
use crate::runtime::builtins::Builtin;
use crate::runtime::env::Env;

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
pub type HashRef = Rc<RefCell<HashMap<HashKey, HashPair>>>;

#[derive(Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bool(bool),
    Null,
    Array(ArrayRef),
    Hash(HashRef),
    Function(Rc<Function>),
    VmFunction(Rc<VmFunction>),
    Builtin(Builtin),
    Class(Rc<Class>),
    Instance(Rc<Instance>),
    Module(Rc<Module>),
    Exception(Rc<Exception>),
    Error(Rc<str>),

    // Control-flow markers, never observed by user code.
    Return(Box<Value>),
    LoopBreak,
    LoopContinue,
}

/// Hashable key kinds. Floats key by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    Int(i64),
    Bool(bool),
    Str(Rc<str>),
    Float(u64),
}

#[derive(Clone)]
pub struct HashPair {
    pub key: Value,
    pub value: Value,
}

/// Closure for the tree-walking backend.
pub struct Function {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Block,
    pub env: Env,
}

/// Closure for the VM backend.
pub struct VmFunction {
    pub name: String,
    pub parameters: Vec<String>,
    pub body: Rc<CodeBlock>,
    pub env: Env,
}

pub struct Class {
    pub name: String,
    pub parent: Option<Rc<Class>>,
    /// Field defaults, evaluated at class-definition time.
    pub fields: Vec<(String, Value)>,
    pub methods: HashMap<String, Value>,
}

impl Class {
    /// Walks the inheritance chain, subclass first.
    pub fn find_method(&self, name: &str) -> Option<Value> {
        if let Some(method) = self.methods.get(name) {
            return Some(method.clone());
        }
        self.parent.as_ref().and_then(|p| p.find_method(name))
    }

    /// Collects field defaults with the subclass shadowing its parents.
    pub fn all_fields(&self) -> Vec<(String, Value)> {
        let mut fields = self
            .parent
            .as_ref()
            .map(|p| p.all_fields())
            .unwrap_or_default();
        for (name, default) in &self.fields {
            if let Some(existing) = fields.iter_mut().find(|(n, _)| n == name) {
                existing.1 = default.clone();
            } else {
                fields.push((name.clone(), default.clone()));
            }
        }
        fields
    }
}

pub struct Instance {
    pub class: Rc<Class>,
    /// Per-instance mutable field store.
    pub fields: Env,
}

pub struct Module {
    pub name: String,
    pub methods: HashMap<String, Builtin>,
    pub vars: HashMap<String, Value>,
}

pub struct Exception {
    pub message: String,
    pub payload: Option<Value>,
    /// Interrupt exceptions unwind past every catch.
    pub catchable: bool,
    /// A caught exception is inert data; only uncaught ones unwind.
    pub caught: bool,
}

impl Value {
    pub fn string(value: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(value.as_ref()))
    }

    pub fn array(elements: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn hash(pairs: HashMap<HashKey, HashPair>) -> Self {
        Value::Hash(Rc::new(RefCell::new(pairs)))
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Value::Exception(Rc::new(Exception {
            message: message.into(),
            payload: None,
            catchable: true,
            caught: false,
        }))
    }

    pub fn interrupt_exception() -> Self {
        Value::Exception(Rc::new(Exception {
            message: "execution interrupted".to_string(),
            payload: None,
            catchable: false,
            caught: false,
        }))
    }

    /// The inert form a catch block binds: same message and payload, but
    /// no longer unwinding.
    pub fn defused(exception: &Rc<Exception>) -> Self {
        Value::Exception(Rc::new(Exception {
            message: exception.message.clone(),
            payload: exception.payload.clone(),
            catchable: exception.catchable,
            caught: true,
        }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Value::Error(Rc::from(message.into().as_str()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Str(_) => "STRING",
            Value::Bool(_) => "BOOLEAN",
            Value::Null => "NULL",
            Value::Array(_) => "ARRAY",
            Value::Hash(_) => "HASH",
            Value::Function(_) | Value::VmFunction(_) => "FUNCTION",
            Value::Builtin(_) => "BUILTIN",
            Value::Class(_) => "CLASS",
            Value::Instance(_) => "INSTANCE",
            Value::Module(_) => "MODULE",
            Value::Exception(_) => "EXCEPTION",
            Value::Error(_) => "ERROR",
            Value::Return(_) => "RETURN",
            Value::LoopBreak | Value::LoopContinue => "LOOP_CONTROL",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(value) => *value,
            Value::Null => false,
            Value::Int(value) => *value != 0,
            Value::Float(value) => *value != 0.0,
            Value::Str(value) => !value.is_empty(),
            _ => true,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Float(_) | Value::Str(_) | Value::Bool(_) | Value::Null
        )
    }

    /// True for an exception that is actively unwinding.
    pub fn is_raised(&self) -> bool {
        matches!(self, Value::Exception(exception) if !exception.caught)
    }

    /// True for anything that must unwind the current construct.
    pub fn is_control(&self) -> bool {
        match self {
            Value::Return(_) | Value::LoopBreak | Value::LoopContinue => true,
            Value::Exception(exception) => !exception.caught,
            _ => false,
        }
    }

    /// Binds `self` into a method closure's scope, producing the callable
    /// both backends use for instance method dispatch.
    pub fn bind_self(&self, instance: Value) -> Option<Value> {
        match self {
            Value::Function(function) => {
                let env = function.env.enclosed();
                env.set_force("self", instance, true);
                Some(Value::Function(Rc::new(Function {
                    name: function.name.clone(),
                    parameters: function.parameters.clone(),
                    body: function.body.clone(),
                    env,
                })))
            }
            Value::VmFunction(function) => {
                let env = function.env.enclosed();
                env.set_force("self", instance, true);
                Some(Value::VmFunction(Rc::new(VmFunction {
                    name: function.name.clone(),
                    parameters: function.parameters.clone(),
                    body: function.body.clone(),
                    env,
                })))
            }
            _ => None,
        }
    }

    /// Rendering used by `print` and result display: strings are raw.
    pub fn render(&self) -> String {
        match self {
            Value::Str(value) => value.to_string(),
            other => other.inspect(),
        }
    }

    /// Debug-ish rendering used for inspection output.
    pub fn inspect(&self) -> String {
        match self {
            Value::Int(value) => value.to_string(),
            Value::Float(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    format!("{value:.1}")
                } else {
                    value.to_string()
                }
            }
            Value::Str(value) => format!("\"{value}\""),
            Value::Bool(value) => value.to_string(),
            Value::Null => "null".to_string(),
            Value::Array(elements) => {
                let rendered = elements
                    .borrow()
                    .iter()
                    .map(Value::inspect)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("[{rendered}]")
            }
            Value::Hash(pairs) => {
                let rendered = pairs
                    .borrow()
                    .values()
                    .map(|pair| format!("{}: {}", pair.key.inspect(), pair.value.inspect()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{rendered}}}")
            }
            Value::Function(function) => format!("<function {}>", function.name),
            Value::VmFunction(function) => format!("<function {}>", function.name),
            Value::Builtin(builtin) => format!("<builtin {}>", builtin.name),
            Value::Class(class) => format!("<class {}>", class.name),
            Value::Instance(instance) => format!("<instance of {}>", instance.class.name),
            Value::Module(module) => format!("<module {}>", module.name),
            Value::Exception(exception) => format!("Exception: {}", exception.message),
            Value::Error(message) => format!("Error: {message}"),
            Value::Return(value) => value.inspect(),
            Value::LoopBreak => "break".to_string(),
            Value::LoopContinue => "continue".to_string(),
        }
    }
}

/// Scalars compare by value, aggregates by reference identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(l), Value::Int(r)) => l == r,
            (Value::Float(l), Value::Float(r)) => l == r,
            (Value::Str(l), Value::Str(r)) => l == r,
            (Value::Bool(l), Value::Bool(r)) => l == r,
            (Value::Null, Value::Null) => true,
            (Value::Array(l), Value::Array(r)) => Rc::ptr_eq(l, r),
            (Value::Hash(l), Value::Hash(r)) => Rc::ptr_eq(l, r),
            (Value::Function(l), Value::Function(r)) => Rc::ptr_eq(l, r),
            (Value::VmFunction(l), Value::VmFunction(r)) => Rc::ptr_eq(l, r),
            (Value::Builtin(l), Value::Builtin(r)) => l.name == r.name,
            (Value::Class(l), Value::Class(r)) => Rc::ptr_eq(l, r),
            (Value::Instance(l), Value::Instance(r)) => Rc::ptr_eq(l, r),
            (Value::Module(l), Value::Module(r)) => Rc::ptr_eq(l, r),
            (Value::Exception(l), Value::Exception(r)) => l.message == r.message,
            (Value::Error(l), Value::Error(r)) => l == r,
            (Value::Return(l), Value::Return(r)) => l == r,
            (Value::LoopBreak, Value::LoopBreak) => true,
            (Value::LoopContinue, Value::LoopContinue) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self.inspect())
    }
}
