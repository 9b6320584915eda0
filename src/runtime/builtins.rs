//! Builtin function and module registries.
//!
//! A registry is populated once when an interpreter or VM is constructed
//! and is read-only while scripts run. Both backends consult the same
//! instance, and neither lets user code rebind a registered name. Builtins
//! write printed output into the host-owned output buffer.

use std::collections::HashMap;
use std::rc::Rc;

use crate::runtime::value::{Module, Value};

pub type BuiltinFn = fn(&mut String, Vec<Value>) -> Value;

#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

pub struct Registry {
    functions: HashMap<&'static str, Builtin>,
    modules: HashMap<String, Rc<Module>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
            modules: HashMap::new(),
        }
    }

    /// The default builtin set every embedder gets unless it opts out.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("print", builtin_print);
        registry.register("println", builtin_println);
        registry.register("len", builtin_len);
        registry.register("first", builtin_first);
        registry.register("last", builtin_last);
        registry.register("rest", builtin_rest);
        registry.register("push", builtin_push);
        registry.register("keys", builtin_keys);
        registry.register("range", builtin_range);
        registry.register("toString", builtin_to_string);
        registry.register("toInt", builtin_to_int);
        registry.register("toFloat", builtin_to_float);
        registry.register("type", builtin_type);
        registry.register("error", builtin_error);
        registry.register("isError", builtin_is_error);
        registry.register("dis", builtin_dis);
        registry.register_module(string_module());
        registry
    }

    pub fn register(&mut self, name: &'static str, func: BuiltinFn) {
        self.functions.insert(name, Builtin { name, func });
    }

    pub fn register_module(&mut self, module: Module) {
        self.modules.insert(module.name.clone(), Rc::new(module));
    }

    pub fn get(&self, name: &str) -> Option<Builtin> {
        self.functions.get(name).copied()
    }

    pub fn get_module(&self, name: &str) -> Option<Rc<Module>> {
        self.modules.get(name).cloned()
    }

    /// True if defining `name` would shadow a builtin or module.
    pub fn protects(&self, name: &str) -> bool {
        self.functions.contains_key(name) || self.modules.contains_key(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn check_args(_name: &str, expected: usize, args: &[Value]) -> Option<Value> {
    if args.len() != expected {
        return Some(Value::exception(format!(
            "Incorrect number of arguments. Got {}, expected {expected}",
            args.len()
        )));
    }
    None
}

fn expect_array(name: &str, value: &Value) -> Result<Vec<Value>, Value> {
    match value {
        Value::Array(elements) => Ok(elements.borrow().clone()),
        other => Err(Value::exception(format!(
            "Argument to `{name}` must be ARRAY, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_print(output: &mut String, args: Vec<Value>) -> Value {
    let rendered = args.iter().map(Value::render).collect::<Vec<_>>();
    output.push_str(&rendered.join(" "));
    Value::Null
}

fn builtin_println(output: &mut String, args: Vec<Value>) -> Value {
    builtin_print(output, args);
    output.push('\n');
    Value::Null
}

fn builtin_len(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("len", 1, &args) {
        return exception;
    }
    match &args[0] {
        Value::Str(value) => Value::Int(value.chars().count() as i64),
        Value::Array(elements) => Value::Int(elements.borrow().len() as i64),
        Value::Hash(pairs) => Value::Int(pairs.borrow().len() as i64),
        Value::Null => Value::Int(0),
        other => Value::exception(format!("Unsupported type {}", other.type_name())),
    }
}

fn builtin_first(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("first", 1, &args) {
        return exception;
    }
    match expect_array("first", &args[0]) {
        Ok(elements) => elements.first().cloned().unwrap_or(Value::Null),
        Err(exception) => exception,
    }
}

fn builtin_last(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("last", 1, &args) {
        return exception;
    }
    match expect_array("last", &args[0]) {
        Ok(elements) => elements.last().cloned().unwrap_or(Value::Null),
        Err(exception) => exception,
    }
}

fn builtin_rest(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("rest", 1, &args) {
        return exception;
    }
    match expect_array("rest", &args[0]) {
        Ok(elements) => {
            if elements.is_empty() {
                Value::Null
            } else {
                Value::array(elements[1..].to_vec())
            }
        }
        Err(exception) => exception,
    }
}

fn builtin_push(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("push", 2, &args) {
        return exception;
    }
    match &args[0] {
        Value::Array(elements) => {
            elements.borrow_mut().push(args[1].clone());
            args[0].clone()
        }
        other => Value::exception(format!(
            "Argument to `push` must be ARRAY, got {}",
            other.type_name()
        )),
    }
}

fn builtin_keys(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("keys", 1, &args) {
        return exception;
    }
    match &args[0] {
        Value::Hash(pairs) => Value::array(
            pairs
                .borrow()
                .values()
                .map(|pair| pair.key.clone())
                .collect(),
        ),
        other => Value::exception(format!(
            "Argument to `keys` must be HASH, got {}",
            other.type_name()
        )),
    }
}

fn builtin_range(_output: &mut String, args: Vec<Value>) -> Value {
    let (start, stop) = match args.as_slice() {
        [Value::Int(stop)] => (0, *stop),
        [Value::Int(start), Value::Int(stop)] => (*start, *stop),
        [other] | [other, _] => {
            return Value::exception(format!(
                "Argument to `range` must be INTEGER, got {}",
                other.type_name()
            ));
        }
        _ => {
            return Value::exception(format!(
                "Incorrect number of arguments. Got {}, expected 1",
                args.len()
            ));
        }
    };
    Value::array((start..stop).map(Value::Int).collect())
}

fn builtin_to_string(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("toString", 1, &args) {
        return exception;
    }
    Value::string(args[0].render())
}

fn builtin_to_int(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("toInt", 1, &args) {
        return exception;
    }
    match &args[0] {
        Value::Int(value) => Value::Int(*value),
        Value::Float(value) => Value::Int(*value as i64),
        Value::Str(value) => match value.trim().parse::<i64>() {
            Ok(parsed) => Value::Int(parsed),
            Err(_) => Value::error(format!("cannot convert \"{value}\" to INTEGER")),
        },
        other => Value::exception(format!("Unsupported type {}", other.type_name())),
    }
}

fn builtin_to_float(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("toFloat", 1, &args) {
        return exception;
    }
    match &args[0] {
        Value::Int(value) => Value::Float(*value as f64),
        Value::Float(value) => Value::Float(*value),
        Value::Str(value) => match value.trim().parse::<f64>() {
            Ok(parsed) => Value::Float(parsed),
            Err(_) => Value::error(format!("cannot convert \"{value}\" to FLOAT")),
        },
        other => Value::exception(format!("Unsupported type {}", other.type_name())),
    }
}

fn builtin_type(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("type", 1, &args) {
        return exception;
    }
    Value::string(args[0].type_name())
}

fn builtin_error(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("error", 1, &args) {
        return exception;
    }
    Value::error(args[0].render())
}

fn builtin_is_error(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("isError", 1, &args) {
        return exception;
    }
    Value::Bool(matches!(args[0], Value::Error(_)))
}

/// Renders a compiled function's code block for inspection.
fn builtin_dis(output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("dis", 1, &args) {
        return exception;
    }
    match &args[0] {
        Value::VmFunction(function) => {
            let code = &function.body;
            output.push_str(&format!(
                "Name: {}\nFilename: {}\nLocalCount: {}\nMaxStackSize: {}\nMaxBlockSize: {}\n",
                code.name, code.filename, code.local_count, code.max_stack, code.max_block_depth
            ));
            output.push_str(&code.disassemble());
            Value::Null
        }
        other => Value::exception(format!(
            "dis expected a compiled func, got {}",
            other.type_name()
        )),
    }
}

fn string_module() -> Module {
    let mut methods = HashMap::new();
    methods.insert(
        "splitN".to_string(),
        Builtin {
            name: "splitN",
            func: string_split_n,
        },
    );
    methods.insert(
        "trimSpace".to_string(),
        Builtin {
            name: "trimSpace",
            func: string_trim_space,
        },
    );
    methods.insert(
        "dedup".to_string(),
        Builtin {
            name: "dedup",
            func: string_dedup,
        },
    );
    Module {
        name: "string".to_string(),
        methods,
        vars: HashMap::new(),
    }
}

fn string_split_n(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("splitN", 3, &args) {
        return exception;
    }
    let (Value::Str(target), Value::Str(sep), Value::Int(count)) =
        (&args[0], &args[1], &args[2])
    else {
        return Value::exception(format!(
            "splitN expected (STRING, STRING, INTEGER), got ({}, {}, {})",
            args[0].type_name(),
            args[1].type_name(),
            args[2].type_name()
        ));
    };
    let pieces: Vec<&str> = if *count < 0 {
        target.split(sep.as_ref()).collect()
    } else {
        target.splitn(*count as usize, sep.as_ref()).collect()
    };
    Value::array(pieces.into_iter().map(Value::string).collect())
}

fn string_trim_space(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("trimSpace", 1, &args) {
        return exception;
    }
    match &args[0] {
        Value::Str(value) => Value::string(value.trim()),
        other => Value::exception(format!("trimSpace expected a STRING, got {}", other.type_name())),
    }
}

/// Collapses runs of one character into a single occurrence.
fn string_dedup(_output: &mut String, args: Vec<Value>) -> Value {
    if let Some(exception) = check_args("dedup", 2, &args) {
        return exception;
    }
    let (Value::Str(target), Value::Str(needle)) = (&args[0], &args[1]) else {
        return Value::exception(format!(
            "dedup expected (STRING, STRING), got ({}, {})",
            args[0].type_name(),
            args[1].type_name()
        ));
    };
    let Some(needle) = needle.chars().next() else {
        return Value::exception("dedup expected a one character STRING");
    };
    let mut deduped = String::with_capacity(target.len());
    let mut last: Option<char> = None;
    for c in target.chars() {
        if c == needle && last == Some(c) {
            continue;
        }
        deduped.push(c);
        last = Some(c);
    }
    Value::string(deduped)
}
