//! Bytecode backend: a frame-based stack machine.
//!
//! Each call runs in a `Frame` holding an operand stack, a local slot
//! array, a block stack for loops, try handlers, and scopes, and an
//! environment handle for chained name resolution. Exceptions are plain
//! values: raising walks the block stack for a try handler and otherwise
//! returns the exception from the frame, mirroring the evaluator's
//! marker propagation.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::ast::{InfixOp, PrefixOp, Program};
use crate::backend::{finish_run, Backend, PreparedBackend};
use crate::bytecode::{ArgWidth, CmpOp, CodeBlock, Constant, Opcode};
use crate::compiler;
use crate::runtime::builtins::Registry;
use crate::runtime::env::{Env, EnvError};
use crate::runtime::ops;
use crate::runtime::value::{Class, Instance, Value, VmFunction};

pub struct Vm {
    interrupt: Arc<AtomicBool>,
}

impl Vm {
    pub fn new() -> Self {
        Self {
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative interrupt flag, checked on backward jumps.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for Vm {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn prepare(&self, program: &Program) -> Result<Box<dyn PreparedBackend>> {
        let code = compiler::compile(program)?;
        Ok(Box::new(PreparedVm {
            code: Rc::new(code),
            interrupt: self.interrupt.clone(),
        }))
    }
}

pub struct PreparedVm {
    code: Rc<CodeBlock>,
    interrupt: Arc<AtomicBool>,
}

impl PreparedVm {
    pub fn code(&self) -> Rc<CodeBlock> {
        self.code.clone()
    }
}

impl PreparedBackend for PreparedVm {
    fn run(&self) -> Result<String> {
        let mut machine = Machine::new(Rc::new(Registry::with_defaults()), self.interrupt.clone());
        let result = machine.execute(self.code.clone(), Env::new());
        finish_run(machine.take_output(), result)
    }
}

enum BlockEntry {
    Loop {
        break_target: usize,
        continue_target: usize,
        depth: usize,
        env: Env,
    },
    Try {
        catch_target: usize,
        depth: usize,
        env: Env,
    },
    Scope {
        env: Env,
    },
}

struct Frame {
    code: Rc<CodeBlock>,
    ip: usize,
    stack: Vec<Value>,
    blocks: Vec<BlockEntry>,
    locals: Vec<Value>,
    env: Env,
}

impl Frame {
    fn new(code: Rc<CodeBlock>, env: Env) -> Self {
        let local_count = code.local_count as usize;
        let max_stack = code.max_stack as usize;
        let max_blocks = code.max_block_depth as usize;
        Self {
            code,
            ip: 0,
            stack: Vec::with_capacity(max_stack),
            blocks: Vec::with_capacity(max_blocks),
            locals: vec![Value::Null; local_count],
            env,
        }
    }
}

pub struct Machine {
    registry: Rc<Registry>,
    interrupt: Arc<AtomicBool>,
    output: String,
}

impl Machine {
    pub fn new(registry: Rc<Registry>, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            interrupt,
            output: String::new(),
        }
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Executes a module code block against the given root environment.
    pub fn execute(&mut self, code: Rc<CodeBlock>, env: Env) -> Value {
        let mut frame = Frame::new(code, env);
        self.run_frame(&mut frame)
    }

    fn run_frame(&mut self, frame: &mut Frame) -> Value {
        macro_rules! pop {
            () => {
                match frame.stack.pop() {
                    Some(value) => value,
                    None => return Value::exception("stack underflow"),
                }
            };
        }
        // Raising either lands on a catch target in this frame or returns
        // the exception to the caller.
        macro_rules! raise {
            ($exception:expr) => {
                match raise_in_frame(frame, $exception) {
                    None => continue,
                    Some(exception) => return exception,
                }
            };
        }
        // Pushes an operation result, diverting exceptions to the raise
        // path.
        macro_rules! push_result {
            ($result:expr) => {{
                let result = $result;
                if result.is_raised() {
                    raise!(result);
                }
                frame.stack.push(result);
            }};
        }

        loop {
            let inst_start = frame.ip;
            let Some(&byte) = frame.code.code.get(frame.ip) else {
                return Value::Null;
            };
            let Some(op) = Opcode::from_byte(byte) else {
                return Value::exception(format!("invalid opcode {byte:#04x}"));
            };
            frame.ip += 1;

            let mut arg1 = 0u16;
            let mut arg2 = 0u16;
            match op.arg_width() {
                ArgWidth::None => {}
                ArgWidth::Byte => {
                    let Some(&value) = frame.code.code.get(frame.ip) else {
                        return Value::exception("truncated bytecode");
                    };
                    arg1 = value as u16;
                    frame.ip += 1;
                }
                ArgWidth::One => {
                    let Some(value) = read_u16(&frame.code.code, frame.ip) else {
                        return Value::exception("truncated bytecode");
                    };
                    arg1 = value;
                    frame.ip += 2;
                }
                ArgWidth::Two => {
                    let (Some(first), Some(second)) = (
                        read_u16(&frame.code.code, frame.ip),
                        read_u16(&frame.code.code, frame.ip + 2),
                    ) else {
                        return Value::exception("truncated bytecode");
                    };
                    arg1 = first;
                    arg2 = second;
                    frame.ip += 4;
                }
            }

            match op {
                Opcode::Pop => {
                    pop!();
                }
                Opcode::Dup => {
                    let value = pop!();
                    frame.stack.push(value.clone());
                    frame.stack.push(value);
                }
                Opcode::LoadNull => frame.stack.push(Value::Null),
                Opcode::LoadConst => {
                    let Some(constant) = frame.code.constants.get(arg1 as usize) else {
                        return Value::exception("constant index out of range");
                    };
                    let value = match constant {
                        Constant::Null => Value::Null,
                        Constant::Int(value) => Value::Int(*value),
                        Constant::Float(value) => Value::Float(*value),
                        Constant::Str(value) => Value::string(value),
                        Constant::Bool(value) => Value::Bool(*value),
                        Constant::Code(_) => {
                            return Value::exception("code constant cannot be loaded directly");
                        }
                    };
                    frame.stack.push(value);
                }
                Opcode::LoadFast => {
                    let Some(value) = frame.locals.get(arg1 as usize) else {
                        return Value::exception("local slot out of range");
                    };
                    frame.stack.push(value.clone());
                }
                Opcode::LoadGlobal => {
                    let Some(name) = frame.code.names.get(arg1 as usize) else {
                        return Value::exception("name index out of range");
                    };
                    if let Some(value) = frame.env.get(name) {
                        frame.stack.push(value);
                    } else if let Some(builtin) = self.registry.get(name) {
                        frame.stack.push(Value::Builtin(builtin));
                    } else if let Some(module) = self.registry.get_module(name) {
                        frame.stack.push(Value::Module(module));
                    } else {
                        raise!(Value::exception(format!("identifier not found: {name}")));
                    }
                }
                Opcode::LoadIndex => {
                    let index = pop!();
                    let target = pop!();
                    push_result!(ops::index_get(&target, &index));
                }
                Opcode::LoadAttribute => {
                    let Some(name) = frame.code.names.get(arg1 as usize) else {
                        return Value::exception("name index out of range");
                    };
                    let object = pop!();
                    push_result!(ops::member_get(&object, name));
                }
                Opcode::StoreFast => {
                    let value = pop!();
                    let Some(slot) = frame.locals.get_mut(arg1 as usize) else {
                        return Value::exception("local slot out of range");
                    };
                    *slot = value;
                }
                Opcode::StoreConst => {
                    let value = pop!();
                    if !value.is_scalar() {
                        raise!(Value::exception(
                            "Constants must be int, float, string, bool or null"
                        ));
                    }
                    let Some(slot) = frame.locals.get_mut(arg1 as usize) else {
                        return Value::exception("local slot out of range");
                    };
                    *slot = value;
                }
                Opcode::StoreGlobal => {
                    let Some(name) = frame.code.names.get(arg1 as usize) else {
                        return Value::exception("name index out of range");
                    };
                    let value = pop!();
                    if self.registry.protects(name) {
                        raise!(Value::exception(format!(
                            "Attempted redeclaration of builtin function '{name}'"
                        )));
                    }
                    match frame.env.set(name, value) {
                        Ok(()) => {}
                        Err(EnvError::Constant) => {
                            raise!(Value::exception(format!(
                                "Assignment to declared constant {name}"
                            )));
                        }
                        Err(_) => {
                            raise!(Value::exception(format!(
                                "Assignment to uninitialized variable {name}"
                            )));
                        }
                    }
                }
                Opcode::StoreIndex => {
                    let value = pop!();
                    let index = pop!();
                    let target = pop!();
                    let result = ops::index_set(&target, &index, value);
                    if result.is_raised() {
                        raise!(result);
                    }
                }
                Opcode::StoreAttribute => {
                    let Some(name) = frame.code.names.get(arg1 as usize) else {
                        return Value::exception("name index out of range");
                    };
                    let value = pop!();
                    let object = pop!();
                    let result = ops::member_set(&object, name, value);
                    if result.is_raised() {
                        raise!(result);
                    }
                }
                Opcode::Define | Opcode::DefineConst => {
                    let Some(name) = frame.code.names.get(arg1 as usize) else {
                        return Value::exception("name index out of range");
                    };
                    let value = pop!();
                    if self.registry.protects(name) {
                        raise!(Value::exception(format!(
                            "Attempted redeclaration of builtin function '{name}'"
                        )));
                    }
                    let created = if op == Opcode::DefineConst {
                        if !value.is_scalar() {
                            raise!(Value::exception(
                                "Constants must be int, float, string, bool or null"
                            ));
                        }
                        frame.env.create_const(name, value)
                    } else {
                        frame.env.create(name, value)
                    };
                    if created.is_err() {
                        raise!(Value::exception(format!("symbol {name} already defined")));
                    }
                }
                Opcode::BinaryAdd
                | Opcode::BinarySub
                | Opcode::BinaryMul
                | Opcode::BinaryDivide
                | Opcode::BinaryMod
                | Opcode::BinaryShiftL
                | Opcode::BinaryShiftR
                | Opcode::BinaryAnd
                | Opcode::BinaryAndNot
                | Opcode::BinaryOr
                | Opcode::BinaryNot => {
                    let right = pop!();
                    let left = pop!();
                    push_result!(ops::binary_op(binary_infix(op), &left, &right));
                }
                Opcode::UnaryNot => {
                    let value = pop!();
                    push_result!(ops::prefix_op(PrefixOp::Not, &value));
                }
                Opcode::UnaryNeg => {
                    let value = pop!();
                    push_result!(ops::prefix_op(PrefixOp::Neg, &value));
                }
                Opcode::Compare => {
                    let Some(cmp) = CmpOp::from_byte(arg1 as u8) else {
                        return Value::exception(format!("invalid compare operation {arg1}"));
                    };
                    let right = pop!();
                    let left = pop!();
                    push_result!(ops::binary_op(cmp.to_infix(), &left, &right));
                }
                Opcode::JumpAbs => {
                    let target = arg1 as usize;
                    if target <= inst_start && self.interrupt.load(Ordering::Relaxed) {
                        raise!(Value::interrupt_exception());
                    }
                    frame.ip = target;
                }
                Opcode::JumpForward => {
                    frame.ip += arg1 as usize;
                }
                Opcode::PopJumpIfTrue => {
                    if pop!().is_truthy() {
                        frame.ip = arg1 as usize;
                    }
                }
                Opcode::PopJumpIfFalse => {
                    if !pop!().is_truthy() {
                        frame.ip = arg1 as usize;
                    }
                }
                Opcode::JumpIfTrueOrPop => {
                    match frame.stack.last() {
                        Some(top) if top.is_truthy() => frame.ip = arg1 as usize,
                        Some(_) => {
                            pop!();
                        }
                        None => return Value::exception("stack underflow"),
                    }
                }
                Opcode::JumpIfFalseOrPop => {
                    match frame.stack.last() {
                        Some(top) if !top.is_truthy() => frame.ip = arg1 as usize,
                        Some(_) => {
                            pop!();
                        }
                        None => return Value::exception("stack underflow"),
                    }
                }
                Opcode::Call => {
                    let callee = pop!();
                    let argc = arg1 as usize;
                    let mut args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        args.push(pop!());
                    }
                    args.reverse();
                    push_result!(self.call_value(&callee, args));
                }
                Opcode::Return => {
                    return pop!();
                }
                Opcode::MakeArray => {
                    let count = arg1 as usize;
                    let mut elements = Vec::with_capacity(count);
                    for _ in 0..count {
                        elements.push(pop!());
                    }
                    elements.reverse();
                    frame.stack.push(Value::array(elements));
                }
                Opcode::MakeMap => {
                    let count = arg1 as usize;
                    let mut pairs = Vec::with_capacity(count);
                    for _ in 0..count {
                        let value = pop!();
                        let key = pop!();
                        pairs.push((key, value));
                    }
                    match ops::hash_from_pairs(pairs) {
                        Ok(hash) => frame.stack.push(hash),
                        Err(exception) => raise!(exception),
                    }
                }
                Opcode::MakeFunction => {
                    let name = pop!();
                    let params_value = pop!();
                    let Value::Str(name) = name else {
                        return Value::exception("function name must be a string");
                    };
                    let Value::Array(params) = params_value else {
                        return Value::exception("function parameters must be an array");
                    };
                    let mut parameters = Vec::with_capacity(params.borrow().len());
                    for param in params.borrow().iter() {
                        let Value::Str(param) = param else {
                            return Value::exception("function parameter must be a string");
                        };
                        parameters.push(param.to_string());
                    }
                    let Some(Constant::Code(body)) = frame.code.constants.get(arg1 as usize)
                    else {
                        return Value::exception("function body constant missing");
                    };
                    frame.stack.push(Value::VmFunction(Rc::new(VmFunction {
                        name: name.to_string(),
                        parameters,
                        body: body.clone(),
                        env: frame.env.clone(),
                    })));
                }
                Opcode::MakeClass => {
                    let field_count = arg1 as usize;
                    let method_count = arg2 as usize;
                    let name = pop!();
                    let Value::Str(name) = name else {
                        return Value::exception("class name must be a string");
                    };
                    let parent = match pop!() {
                        Value::Null => None,
                        Value::Class(parent) => Some(parent),
                        other => {
                            raise!(Value::exception(format!(
                                "cannot inherit from non-class {}",
                                other.type_name()
                            )));
                        }
                    };
                    let mut fields = Vec::with_capacity(field_count);
                    for _ in 0..field_count {
                        let value = pop!();
                        let field_name = pop!();
                        let Value::Str(field_name) = field_name else {
                            return Value::exception("field name must be a string");
                        };
                        fields.push((field_name.to_string(), value));
                    }
                    fields.reverse();
                    let mut methods = std::collections::HashMap::new();
                    for _ in 0..method_count {
                        let method = pop!();
                        let Value::VmFunction(function) = &method else {
                            return Value::exception("class method must be a function");
                        };
                        methods.insert(function.name.clone(), method.clone());
                    }
                    frame.stack.push(Value::Class(Rc::new(Class {
                        name: name.to_string(),
                        parent,
                        fields,
                        methods,
                    })));
                }
                Opcode::MakeInstance => {
                    let class = pop!();
                    let argc = arg1 as usize;
                    let mut args = Vec::with_capacity(argc);
                    for _ in 0..argc {
                        args.push(pop!());
                    }
                    args.reverse();
                    match class {
                        Value::Class(class) => {
                            push_result!(self.instantiate(&class, args));
                        }
                        _ => {
                            let name = frame
                                .code
                                .names
                                .get(arg2 as usize)
                                .cloned()
                                .unwrap_or_default();
                            raise!(Value::exception(format!("{name} is not a class")));
                        }
                    }
                }
                Opcode::MakeIter => {
                    let value = pop!();
                    match ops::iter_pairs(&value) {
                        Ok(pairs) => {
                            let items = pairs
                                .into_iter()
                                .map(|(key, value)| Value::array(vec![key, value]))
                                .collect();
                            frame.stack.push(Value::array(items));
                        }
                        Err(exception) => raise!(exception),
                    }
                }
                Opcode::StartLoop => {
                    frame.blocks.push(BlockEntry::Loop {
                        break_target: arg1 as usize,
                        continue_target: arg2 as usize,
                        depth: frame.stack.len(),
                        env: frame.env.clone(),
                    });
                }
                Opcode::StartTry => {
                    frame.blocks.push(BlockEntry::Try {
                        catch_target: arg1 as usize,
                        depth: frame.stack.len(),
                        env: frame.env.clone(),
                    });
                }
                Opcode::EndBlock => {
                    if frame.blocks.pop().is_none() {
                        return Value::exception("block stack underflow");
                    }
                }
                Opcode::Break => loop {
                    match frame.blocks.pop() {
                        Some(BlockEntry::Loop {
                            break_target,
                            depth,
                            env,
                            ..
                        }) => {
                            frame.stack.truncate(depth);
                            frame.env = env;
                            frame.ip = break_target;
                            break;
                        }
                        Some(_) => continue,
                        None => return Value::exception("break used outside of a loop"),
                    }
                },
                Opcode::Continue => loop {
                    match frame.blocks.last() {
                        Some(BlockEntry::Loop {
                            continue_target,
                            depth,
                            env,
                            ..
                        }) => {
                            let (target, depth, env) = (*continue_target, *depth, env.clone());
                            frame.stack.truncate(depth);
                            frame.env = env;
                            frame.ip = target;
                            break;
                        }
                        Some(_) => {
                            frame.blocks.pop();
                        }
                        None => return Value::exception("continue used outside of a loop"),
                    }
                },
                Opcode::Throw => {
                    let value = pop!();
                    raise!(ops::throw_value(value));
                }
                Opcode::OpenScope => {
                    frame.blocks.push(BlockEntry::Scope {
                        env: frame.env.clone(),
                    });
                    frame.env = frame.env.enclosed();
                }
                Opcode::CloseScope => match frame.blocks.pop() {
                    Some(BlockEntry::Scope { env }) => frame.env = env,
                    _ => return Value::exception("scope stack corrupted"),
                },
            }
        }
    }

    /// Dispatches a call to a compiled closure or builtin.
    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Value {
        match callee {
            Value::VmFunction(function) => {
                if self.interrupt.load(Ordering::Relaxed) {
                    return Value::interrupt_exception();
                }
                if args.len() != function.parameters.len() {
                    return Value::exception(format!(
                        "Incorrect number of arguments. Got {}, expected {}",
                        args.len(),
                        function.parameters.len()
                    ));
                }
                let mut frame = Frame::new(function.body.clone(), function.env.enclosed());
                for (slot, value) in args.into_iter().enumerate() {
                    frame.locals[slot] = value;
                }
                self.run_frame(&mut frame)
            }
            Value::Builtin(builtin) => (builtin.func)(&mut self.output, args),
            other => Value::exception(format!("{} is not a function", other.type_name())),
        }
    }

    /// Allocates an instance, seeds field defaults, and runs `init`.
    fn instantiate(&mut self, class: &Rc<Class>, args: Vec<Value>) -> Value {
        let fields = Env::new();
        for (name, default) in class.all_fields() {
            fields.set_force(&name, default, false);
        }
        let instance = Value::Instance(Rc::new(Instance {
            class: class.clone(),
            fields,
        }));

        match class.find_method("init") {
            Some(init) => {
                let bound = init
                    .bind_self(instance.clone())
                    .unwrap_or_else(|| init.clone());
                let result = self.call_value(&bound, args);
                if result.is_raised() {
                    return result;
                }
            }
            None => {
                if !args.is_empty() {
                    return Value::exception(format!("class {} has no init method", class.name));
                }
            }
        }

        instance
    }
}

/// Walks the block stack for a try handler; uncatchable exceptions and
/// unhandled frames propagate to the caller.
fn raise_in_frame(frame: &mut Frame, exception: Value) -> Option<Value> {
    let catchable = matches!(&exception, Value::Exception(e) if e.catchable);
    if catchable {
        while let Some(entry) = frame.blocks.pop() {
            if let BlockEntry::Try {
                catch_target,
                depth,
                env,
            } = entry
            {
                let bound = match &exception {
                    Value::Exception(raised) => Value::defused(raised),
                    other => other.clone(),
                };
                frame.stack.truncate(depth);
                frame.env = env;
                frame.stack.push(bound);
                frame.ip = catch_target;
                return None;
            }
        }
    }
    Some(exception)
}

fn binary_infix(op: Opcode) -> InfixOp {
    match op {
        Opcode::BinaryAdd => InfixOp::Add,
        Opcode::BinarySub => InfixOp::Sub,
        Opcode::BinaryMul => InfixOp::Mul,
        Opcode::BinaryDivide => InfixOp::Div,
        Opcode::BinaryMod => InfixOp::Mod,
        Opcode::BinaryShiftL => InfixOp::ShiftLeft,
        Opcode::BinaryShiftR => InfixOp::ShiftRight,
        Opcode::BinaryAnd => InfixOp::BitAnd,
        Opcode::BinaryAndNot => InfixOp::BitAndNot,
        Opcode::BinaryOr => InfixOp::BitOr,
        _ => InfixOp::BitXor,
    }
}

fn read_u16(code: &[u8], offset: usize) -> Option<u16> {
    let lo = *code.get(offset)?;
    let hi = *code.get(offset + 1)?;
    Some(u16::from_le_bytes([lo, hi]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use indoc::indoc;

    fn vm_value(source: &str) -> Value {
        let program = parser::parse(source).expect("parse failed");
        let code = compiler::compile(&program).expect("compile failed");
        let mut machine = Machine::new(
            Rc::new(Registry::with_defaults()),
            Arc::new(AtomicBool::new(false)),
        );
        machine.execute(Rc::new(code), Env::new())
    }

    fn run(source: &str) -> Result<String> {
        let program = parser::parse(source).expect("parse failed");
        Vm::new().run(&program)
    }

    fn expect_exception(source: &str, fragment: &str) {
        let result = vm_value(source);
        let Value::Exception(exception) = &result else {
            panic!("expected exception for {source:?}, got {result:?}");
        };
        assert!(
            exception.message.contains(fragment),
            "expected {fragment:?} in {:?}",
            exception.message
        );
    }

    #[test]
    fn executes_arithmetic() {
        assert_eq!(vm_value("def a = 1; def b = 2; a + b"), Value::Int(3));
        assert_eq!(vm_value("2 * (3 + 4)"), Value::Int(14));
        assert_eq!(vm_value("1.5 + 2.5"), Value::Float(4.0));
        assert_eq!(vm_value("\"foo\" + \"bar\""), Value::string("foobar"));
        assert_eq!(vm_value("7 % 3"), Value::Int(1));
        assert_eq!(vm_value("-5 + 1"), Value::Int(-4));
        assert_eq!(vm_value("!0"), Value::Bool(true));
    }

    #[test]
    fn executes_comparisons_and_logic() {
        assert_eq!(vm_value("1 < 2"), Value::Bool(true));
        assert_eq!(vm_value("1 == 1.0"), Value::Bool(false));
        assert_eq!(vm_value("2 >= 2"), Value::Bool(true));

        assert_eq!(vm_value("0 && 5"), Value::Int(0));
        assert_eq!(vm_value("1 && 5"), Value::Int(5));
        assert_eq!(vm_value("0 || 5"), Value::Int(5));
        assert_eq!(vm_value("3 || 5"), Value::Int(3));
    }

    #[test]
    fn executes_functions_and_closures() {
        assert_eq!(
            vm_value("def add = func(x, y) { x + y }; add(3, 4)"),
            Value::Int(7)
        );
        assert_eq!(
            vm_value("def f = func() { return 1; 2 }; f()"),
            Value::Int(1)
        );
        let source = indoc! {"
            def x = 1
            def get = func() { x }
            x = 42
            get()
        "};
        assert_eq!(vm_value(source), Value::Int(42));
    }

    #[test]
    fn closures_capture_function_locals_by_reference() {
        let source = indoc! {"
            def makeCounter = func() {
                def count = 0
                func() { count = count + 1; count }
            }
            def tick = makeCounter()
            tick(); tick(); tick()
        "};
        assert_eq!(vm_value(source), Value::Int(3));
    }

    #[test]
    fn executes_recursion() {
        let source = indoc! {"
            def fib = func(n) {
                if n < 2 { n } else { fib(n - 1) + fib(n - 2) }
            }
            fib(10)
        "};
        assert_eq!(vm_value(source), Value::Int(55));
    }

    #[test]
    fn executes_loops() {
        let source = indoc! {"
            def sum = func(n) {
                def s = 0
                for (def i = 0; i < n; i = i + 1) {
                    s = s + i
                }
                s
            }
            sum(10)
        "};
        assert_eq!(vm_value(source), Value::Int(45));

        let source = indoc! {"
            def n = 0
            loop {
                n = n + 1
                if n >= 5 { break }
            }
            n
        "};
        assert_eq!(vm_value(source), Value::Int(5));

        let source = indoc! {"
            def s = 0
            for (def i = 0; i < 10; i = i + 1) {
                if i % 2 == 0 { continue }
                s = s + i
            }
            s
        "};
        assert_eq!(vm_value(source), Value::Int(25));
    }

    #[test]
    fn executes_iter_loops() {
        let source = indoc! {"
            def total = 0
            for x in [1, 2, 3] { total = total + x }
            total
        "};
        assert_eq!(vm_value(source), Value::Int(6));

        let source = indoc! {"
            def keys = 0
            for k, v in {\"a\": 1, \"b\": 2} { keys = keys + 1 }
            keys
        "};
        assert_eq!(vm_value(source), Value::Int(2));

        expect_exception("for x in 5 { x }", "Cannot iterate over INTEGER");
    }

    #[test]
    fn executes_arrays_and_hashes() {
        assert_eq!(vm_value("def a = [1, 2, 3]; a[-1]"), Value::Int(3));
        assert_eq!(vm_value("def a = [1, 2, 3]; a[9]"), Value::Null);
        assert_eq!(vm_value("def a = [1, 2]; a[1] = 7; a[1]"), Value::Int(7));
        assert_eq!(
            vm_value("def h = {\"k\": 1}; h[\"k\"]"),
            Value::Int(1)
        );
        assert_eq!(
            vm_value("def h = {}; h[\"k\"] = 9; h[\"k\"]"),
            Value::Int(9)
        );
        expect_exception("def a = [1]; a[5] = 0", "Index out of bounds: 5");
    }

    #[test]
    fn scope_isolation_matches_the_evaluator() {
        expect_exception("{ def x = 1; x }; x", "identifier not found: x");
        assert_eq!(vm_value("def x = 1; { def y = x + 1; y }"), Value::Int(2));
        assert_eq!(vm_value("def x = 1; { x = 5 }; x"), Value::Int(5));
    }

    #[test]
    fn definition_errors_match_the_evaluator() {
        expect_exception("def x = 1; def x = 2", "symbol x already defined");
        expect_exception("y = 1", "Assignment to uninitialized variable y");
    }

    #[test]
    fn try_catch_and_throw() {
        let result = vm_value("try { 1 / 0 } catch e { e }");
        let Value::Exception(exception) = &result else {
            panic!("expected caught exception value, got {result:?}");
        };
        assert!(exception.message.contains("division by zero"));

        assert_eq!(vm_value("try { 5 } catch { 0 }"), Value::Int(5));
        assert_eq!(vm_value("try { throw \"x\" } catch { 7 }"), Value::Int(7));
        expect_exception("throw \"boom\"", "boom");

        // Exceptions unwind across call frames to the nearest handler.
        let source = indoc! {"
            def f = func() { 1 / 0 }
            try { f() } catch e { e }
        "};
        let Value::Exception(exception) = vm_value(source) else {
            panic!("expected exception value");
        };
        assert!(exception.message.contains("division by zero"));
    }

    #[test]
    fn break_inside_try_unwinds_to_the_loop() {
        let source = indoc! {"
            def n = 0
            loop {
                try {
                    n = n + 1
                    if n >= 3 { break }
                } catch { 0 }
            }
            n
        "};
        assert_eq!(vm_value(source), Value::Int(3));
    }

    #[test]
    fn executes_classes() {
        let source = indoc! {"
            class Point {
                x = 0
                y = 0
                init(a, b) {
                    self.x = a
                    self.y = b
                }
            }
            def p = new Point(3, 4)
            p.x + p.y
        "};
        assert_eq!(vm_value(source), Value::Int(7));
    }

    #[test]
    fn executes_inheritance_with_child_precedence() {
        let source = indoc! {"
            class Animal {
                legs = 4
                sound() { \"...\" }
                describe() { self.sound() }
            }
            class Bird : Animal {
                legs = 2
                sound() { \"tweet\" }
            }
            def b = new Bird()
            [b.legs, b.describe()]
        "};
        let Value::Array(elements) = vm_value(source) else {
            panic!("expected array result");
        };
        assert_eq!(
            *elements.borrow(),
            vec![Value::Int(2), Value::string("tweet")]
        );
    }

    #[test]
    fn instantiation_errors() {
        expect_exception("def x = 5; new x()", "x is not a class");
        expect_exception(
            "class P { init(a) { self.a = a } }; new P()",
            "Incorrect number of arguments. Got 0, expected 1",
        );
    }

    #[test]
    fn builtins_work_through_the_vm() {
        assert_eq!(vm_value("len(\"foobar\")"), Value::Int(6));
        assert_eq!(vm_value("first([7, 8])"), Value::Int(7));
        assert_eq!(
            vm_value("string.trimSpace(\"  hi  \")"),
            Value::string("hi")
        );
        expect_exception("missing()", "identifier not found: missing");
        expect_exception("5(1)", "INTEGER is not a function");
    }

    #[test]
    fn dis_builtin_renders_bytecode() {
        let output = run(indoc! {"
            def add = func(a, b) { a + b }
            dis(add)
        "})
        .expect("run failed");
        assert!(output.contains("Name: add"), "{output}");
        assert!(output.contains("BinaryAdd"), "{output}");
        assert!(output.contains("LoadFast 0 (a)"), "{output}");
    }

    #[test]
    fn backend_output_matches_contract() {
        let output = run("println(\"hi\"); def a = 1; def b = 2; a + b").expect("run failed");
        assert_eq!(output, "hi\n3\n");

        let error = run("1 / 0").expect_err("expected failure");
        assert!(error.to_string().contains("division by zero"));
    }

    #[test]
    fn const_reassignment_fails_at_compile_time() {
        let program = parser::parse("const PI = 3; PI = 4").expect("parse failed");
        let error = compiler::compile(&program).expect_err("expected compile failure");
        assert_eq!(
            error.to_string(),
            "Assignment to declared constant PI"
        );
    }

    #[test]
    fn interrupt_stops_loops() {
        let program = parser::parse("loop { 1 }").expect("parse failed");
        let vm = Vm::new();
        vm.interrupt_flag().store(true, Ordering::Relaxed);
        let error = vm.run(&program).expect_err("expected interrupt");
        assert!(error.to_string().contains("execution interrupted"));
    }
}
