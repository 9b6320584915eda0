//! Tree-walking backend.
//!
//! The evaluator is a recursive switch over node kinds. Control flow is
//! threaded through return values: `Return`, `LoopBreak`, `LoopContinue`,
//! and exception values unwind the recursion until a construct consumes
//! them, which keeps semantics aligned with the VM's block stack.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::ast::{Block, ClassLiteral, Expression, FunctionLiteral, Program, Statement};
use crate::backend::{finish_run, Backend, PreparedBackend};
use crate::runtime::builtins::Registry;
use crate::runtime::env::{Env, EnvError};
use crate::runtime::ops;
use crate::runtime::value::{Class, Function, Instance, Value};

pub struct Interpreter {
    interrupt: Arc<AtomicBool>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative interrupt flag, checked at statement boundaries.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for Interpreter {
    fn name(&self) -> &'static str {
        "eval"
    }

    fn prepare(&self, program: &Program) -> Result<Box<dyn PreparedBackend>> {
        Ok(Box::new(PreparedInterpreter {
            program: program.clone(),
            interrupt: self.interrupt.clone(),
        }))
    }
}

pub struct PreparedInterpreter {
    program: Program,
    interrupt: Arc<AtomicBool>,
}

impl PreparedBackend for PreparedInterpreter {
    fn run(&self) -> Result<String> {
        let mut evaluator = Evaluator::new(Rc::new(Registry::with_defaults()), self.interrupt.clone());
        let env = Env::new();
        let result = evaluator.eval_program(&self.program, &env);
        finish_run(evaluator.take_output(), result)
    }
}

pub struct Evaluator {
    registry: Rc<Registry>,
    interrupt: Arc<AtomicBool>,
    output: String,
}

impl Evaluator {
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

    /// Evaluates a whole program, unwrapping a top-level return.
    pub fn eval_program(&mut self, program: &Program, env: &Env) -> Value {
        let mut result = Value::Null;
        for statement in &program.statements {
            if let Some(interrupted) = self.check_interrupt() {
                return interrupted;
            }
            result = self.eval_statement(statement, env);
            match result {
                Value::Return(value) => return *value,
                Value::Exception(ref exception) if !exception.caught => return result,
                Value::LoopBreak => return Value::exception("break used outside of a loop"),
                Value::LoopContinue => {
                    return Value::exception("continue used outside of a loop");
                }
                _ => {}
            }
        }
        result
    }

    fn eval_statement(&mut self, statement: &Statement, env: &Env) -> Value {
        if let Some(interrupted) = self.check_interrupt() {
            return interrupted;
        }
        match statement {
            Statement::Expression(expression) => self.eval_expression(expression, env),
            Statement::Block(block) => self.eval_block(block, &env.enclosed()),
            Statement::Def {
                name,
                value,
                constant,
            } => self.eval_def(name, value, *constant, env),
            Statement::Return(value) => {
                let value = self.eval_expression(value, env);
                if value.is_control() {
                    return value;
                }
                Value::Return(Box::new(value))
            }
            Statement::Throw(value) => {
                let value = self.eval_expression(value, env);
                if value.is_control() {
                    return value;
                }
                ops::throw_value(value)
            }
            Statement::Break => Value::LoopBreak,
            Statement::Continue => Value::LoopContinue,
            Statement::Loop {
                init,
                condition,
                step,
                body,
            } => self.eval_loop(init.as_deref(), condition.as_ref(), step.as_ref(), body, env),
            Statement::IterLoop {
                key,
                value,
                iterable,
                body,
            } => self.eval_iter_loop(key.as_deref(), value, iterable, body, env),
        }
    }

    /// Evaluates statements in the given scope; the block's value is the
    /// last statement's value.
    fn eval_block(&mut self, block: &Block, env: &Env) -> Value {
        let mut result = Value::Null;
        for statement in block.statements.iter() {
            result = self.eval_statement(statement, env);
            if result.is_control() {
                return result;
            }
        }
        result
    }

    fn eval_def(&mut self, name: &str, value: &Expression, constant: bool, env: &Env) -> Value {
        if self.registry.protects(name) {
            return Value::exception(format!(
                "Attempted redeclaration of builtin function '{name}'"
            ));
        }
        let value = self.eval_expression(value, env);
        if value.is_control() {
            return value;
        }
        if constant && !value.is_scalar() {
            return Value::exception("Constants must be int, float, string, bool or null");
        }
        let created = if constant {
            env.create_const(name, value)
        } else {
            env.create(name, value)
        };
        match created {
            Ok(()) => Value::Null,
            Err(_) => Value::exception(format!("symbol {name} already defined")),
        }
    }

    fn eval_expression(&mut self, expression: &Expression, env: &Env) -> Value {
        match expression {
            Expression::Integer(value) => Value::Int(*value),
            Expression::Float(value) => Value::Float(*value),
            Expression::Str(value) => Value::string(value),
            Expression::Boolean(value) => Value::Bool(*value),
            Expression::Null => Value::Null,
            Expression::Identifier(name) => self.eval_identifier(name, env),
            Expression::Array(elements) => {
                let mut values = Vec::with_capacity(elements.len());
                for element in elements {
                    let value = self.eval_expression(element, env);
                    if value.is_control() {
                        return value;
                    }
                    values.push(value);
                }
                Value::array(values)
            }
            Expression::Hash(entries) => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.eval_expression(key, env);
                    if key.is_control() {
                        return key;
                    }
                    let value = self.eval_expression(value, env);
                    if value.is_control() {
                        return value;
                    }
                    pairs.push((key, value));
                }
                match ops::hash_from_pairs(pairs) {
                    Ok(hash) => hash,
                    Err(exception) => exception,
                }
            }
            Expression::Prefix { op, right } => {
                let right = self.eval_expression(right, env);
                if right.is_control() {
                    return right;
                }
                ops::prefix_op(*op, &right)
            }
            Expression::Infix { left, op, right } => {
                let left = self.eval_expression(left, env);
                if left.is_control() {
                    return left;
                }
                let right = self.eval_expression(right, env);
                if right.is_control() {
                    return right;
                }
                ops::binary_op(*op, &left, &right)
            }
            Expression::Logical { left, op, right } => {
                let left = self.eval_expression(left, env);
                if left.is_control() {
                    return left;
                }
                // Short-circuit: the falsy (or truthy, for ||) operand is
                // the expression's value.
                match op {
                    crate::ast::LogicalOp::And if !left.is_truthy() => left,
                    crate::ast::LogicalOp::Or if left.is_truthy() => left,
                    _ => self.eval_expression(right, env),
                }
            }
            Expression::Assign { target, value } => self.eval_assign(target, value, env),
            Expression::Index { left, index } => {
                let left = self.eval_expression(left, env);
                if left.is_control() {
                    return left;
                }
                let index = self.eval_expression(index, env);
                if index.is_control() {
                    return index;
                }
                ops::index_get(&left, &index)
            }
            Expression::Member { object, property } => {
                let object = self.eval_expression(object, env);
                if object.is_control() {
                    return object;
                }
                ops::member_get(&object, property)
            }
            Expression::Call {
                function,
                arguments,
            } => {
                let callee = self.eval_expression(function, env);
                if callee.is_control() {
                    return callee;
                }
                let mut args = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    let value = self.eval_expression(argument, env);
                    if value.is_control() {
                        return value;
                    }
                    args.push(value);
                }
                self.call_value(&callee, args)
            }
            Expression::If {
                condition,
                consequence,
                alternative,
            } => {
                let condition = self.eval_expression(condition, env);
                if condition.is_control() {
                    return condition;
                }
                if condition.is_truthy() {
                    self.eval_block(consequence, &env.enclosed())
                } else if let Some(alternative) = alternative {
                    self.eval_block(alternative, &env.enclosed())
                } else {
                    Value::Null
                }
            }
            Expression::TryCatch {
                try_block,
                symbol,
                catch_block,
            } => {
                let result = self.eval_block(try_block, &env.enclosed());
                match result {
                    Value::Exception(ref exception)
                        if exception.catchable && !exception.caught =>
                    {
                        let catch_env = env.enclosed();
                        if let Some(symbol) = symbol {
                            catch_env.set_force(symbol, Value::defused(exception), false);
                        }
                        self.eval_block(catch_block, &catch_env)
                    }
                    other => other,
                }
            }
            Expression::Function(literal) => self.eval_function_literal(literal, env),
            Expression::Class(literal) => self.eval_class_literal(literal, env),
            Expression::New { class, arguments } => {
                let class_value = self.eval_identifier(class, env);
                if class_value.is_control() {
                    return class_value;
                }
                let Value::Class(class) = class_value else {
                    return Value::exception(format!("{class} is not a class"));
                };
                let mut args = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    let value = self.eval_expression(argument, env);
                    if value.is_control() {
                        return value;
                    }
                    args.push(value);
                }
                self.instantiate(&class, args)
            }
        }
    }

    fn eval_identifier(&mut self, name: &str, env: &Env) -> Value {
        if let Some(value) = env.get(name) {
            return value;
        }
        if let Some(builtin) = self.registry.get(name) {
            return Value::Builtin(builtin);
        }
        if let Some(module) = self.registry.get_module(name) {
            return Value::Module(module);
        }
        Value::exception(format!("identifier not found: {name}"))
    }

    fn eval_assign(&mut self, target: &Expression, value: &Expression, env: &Env) -> Value {
        match target {
            Expression::Identifier(name) => {
                if self.registry.protects(name) {
                    return Value::exception(format!(
                        "Attempted redeclaration of builtin function '{name}'"
                    ));
                }
                let value = self.eval_expression(value, env);
                if value.is_control() {
                    return value;
                }
                match env.set(name, value) {
                    Ok(()) => Value::Null,
                    Err(EnvError::Constant) => {
                        Value::exception(format!("Assignment to declared constant {name}"))
                    }
                    Err(_) => {
                        Value::exception(format!("Assignment to uninitialized variable {name}"))
                    }
                }
            }
            Expression::Index { left, index } => {
                let target = self.eval_expression(left, env);
                if target.is_control() {
                    return target;
                }
                let index = self.eval_expression(index, env);
                if index.is_control() {
                    return index;
                }
                let value = self.eval_expression(value, env);
                if value.is_control() {
                    return value;
                }
                ops::index_set(&target, &index, value)
            }
            Expression::Member { object, property } => {
                let object = self.eval_expression(object, env);
                if object.is_control() {
                    return object;
                }
                let value = self.eval_expression(value, env);
                if value.is_control() {
                    return value;
                }
                ops::member_set(&object, property, value)
            }
            other => Value::exception(format!("Invalid assignment target: {other}")),
        }
    }

    fn eval_function_literal(&mut self, literal: &FunctionLiteral, env: &Env) -> Value {
        Value::Function(Rc::new(Function {
            name: literal
                .name
                .clone()
                .unwrap_or_else(|| "(anonymous)".to_string()),
            parameters: literal.parameters.clone(),
            body: literal.body.clone(),
            env: env.clone(),
        }))
    }

    fn eval_class_literal(&mut self, literal: &ClassLiteral, env: &Env) -> Value {
        let parent = match &literal.parent {
            Some(name) => {
                let value = self.eval_identifier(name, env);
                if value.is_control() {
                    return value;
                }
                match value {
                    Value::Class(parent) => Some(parent),
                    other => {
                        return Value::exception(format!(
                            "cannot inherit from non-class {}",
                            other.type_name()
                        ));
                    }
                }
            }
            None => None,
        };

        let mut fields = Vec::with_capacity(literal.fields.len());
        for (name, default) in &literal.fields {
            let value = self.eval_expression(default, env);
            if value.is_control() {
                return value;
            }
            fields.push((name.clone(), value));
        }

        let mut methods = std::collections::HashMap::new();
        for method in &literal.methods {
            let function = self.eval_function_literal(method, env);
            let name = method.name.clone().unwrap_or_default();
            methods.insert(name, function);
        }

        let class = Value::Class(Rc::new(Class {
            name: literal.name.clone(),
            parent,
            fields,
            methods,
        }));

        if self.registry.protects(&literal.name) {
            return Value::exception(format!(
                "Attempted redeclaration of builtin function '{}'",
                literal.name
            ));
        }
        if env.create(&literal.name, class.clone()).is_err() {
            return Value::exception(format!("symbol {} already defined", literal.name));
        }
        class
    }

    /// Dispatches a call to a closure or builtin.
    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> Value {
        match callee {
            Value::Function(function) => {
                if args.len() != function.parameters.len() {
                    return Value::exception(format!(
                        "Incorrect number of arguments. Got {}, expected {}",
                        args.len(),
                        function.parameters.len()
                    ));
                }
                let call_env = function.env.enclosed();
                for (parameter, value) in function.parameters.iter().zip(args) {
                    call_env.set_force(parameter, value, false);
                }
                let result = self.eval_block(&function.body, &call_env);
                match result {
                    Value::Return(value) => *value,
                    Value::LoopBreak => Value::exception("break used outside of a loop"),
                    Value::LoopContinue => Value::exception("continue used outside of a loop"),
                    other => other,
                }
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
                    return Value::exception(format!(
                        "class {} has no init method",
                        class.name
                    ));
                }
            }
        }

        instance
    }

    fn eval_loop(
        &mut self,
        init: Option<&Statement>,
        condition: Option<&Expression>,
        step: Option<&Expression>,
        body: &Block,
        env: &Env,
    ) -> Value {
        let loop_env = env.enclosed();
        if let Some(init) = init {
            let result = self.eval_statement(init, &loop_env);
            if result.is_control() {
                return result;
            }
        }

        loop {
            if let Some(interrupted) = self.check_interrupt() {
                return interrupted;
            }

            if let Some(condition) = condition {
                let value = self.eval_expression(condition, &loop_env);
                if value.is_control() {
                    return value;
                }
                if !value.is_truthy() {
                    break;
                }
            }

            let result = self.eval_block(body, &loop_env.enclosed());
            match result {
                Value::LoopBreak => break,
                Value::LoopContinue => {}
                other if other.is_control() => return other,
                _ => {}
            }

            if let Some(step) = step {
                let value = self.eval_expression(step, &loop_env);
                if value.is_control() {
                    return value;
                }
            }
        }

        Value::Null
    }

    fn eval_iter_loop(
        &mut self,
        key: Option<&str>,
        value_name: &str,
        iterable: &Expression,
        body: &Block,
        env: &Env,
    ) -> Value {
        let iterable = self.eval_expression(iterable, env);
        if iterable.is_control() {
            return iterable;
        }

        let items = match ops::iter_pairs(&iterable) {
            Ok(items) => items,
            Err(exception) => return exception,
        };

        for (item_key, item_value) in items {
            if let Some(interrupted) = self.check_interrupt() {
                return interrupted;
            }
            let iter_env = env.enclosed();
            if let Some(key) = key {
                iter_env.set_force(key, item_key, false);
            }
            iter_env.set_force(value_name, item_value, false);

            let result = self.eval_block(body, &iter_env);
            match result {
                Value::LoopBreak => break,
                Value::LoopContinue => {}
                other if other.is_control() => return other,
                _ => {}
            }
        }

        Value::Null
    }

    fn check_interrupt(&self) -> Option<Value> {
        if self.interrupt.load(Ordering::Relaxed) {
            Some(Value::interrupt_exception())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use indoc::indoc;

    fn eval_value(source: &str) -> Value {
        let program = parser::parse(source).expect("parse failed");
        let mut evaluator = Evaluator::new(
            Rc::new(Registry::with_defaults()),
            Arc::new(AtomicBool::new(false)),
        );
        evaluator.eval_program(&program, &Env::new())
    }

    fn run(source: &str) -> Result<String> {
        let program = parser::parse(source).expect("parse failed");
        Interpreter::new().run(&program)
    }

    fn expect_exception(source: &str, fragment: &str) {
        let result = eval_value(source);
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
    fn evaluates_arithmetic() {
        assert_eq!(eval_value("def a = 1; def b = 2; a + b"), Value::Int(3));
        assert_eq!(eval_value("2 * (3 + 4)"), Value::Int(14));
        assert_eq!(eval_value("10 % 3"), Value::Int(1));
        assert_eq!(eval_value("1.5 + 2.5"), Value::Float(4.0));
        assert_eq!(eval_value("\"foo\" + \"bar\""), Value::string("foobar"));
    }

    #[test]
    fn evaluates_comparisons_and_logic() {
        assert_eq!(eval_value("1 < 2"), Value::Bool(true));
        assert_eq!(eval_value("2 <= 1"), Value::Bool(false));
        assert_eq!(eval_value("1 == 1.0"), Value::Bool(false));
        assert_eq!(eval_value("\"a\" == \"a\""), Value::Bool(true));
        assert_eq!(eval_value("null == null"), Value::Bool(true));

        // Short-circuit operators return an operand, not a boolean.
        assert_eq!(eval_value("0 && 5"), Value::Int(0));
        assert_eq!(eval_value("1 && 5"), Value::Int(5));
        assert_eq!(eval_value("0 || 5"), Value::Int(5));
        assert_eq!(eval_value("3 || 5"), Value::Int(3));
    }

    #[test]
    fn short_circuit_skips_right_operand() {
        let source = indoc! {"
            def called = false;
            def mark = func() { called = true; true };
            false && mark();
            called
        "};
        assert_eq!(eval_value(source), Value::Bool(false));
    }

    #[test]
    fn bitwise_and_shift_operators() {
        assert_eq!(eval_value("\\xF0 | \\x0F"), Value::Int(0xFF));
        assert_eq!(eval_value("6 & 3"), Value::Int(2));
        assert_eq!(eval_value("6 ^ 3"), Value::Int(5));
        assert_eq!(eval_value("1 << 4"), Value::Int(16));
        assert_eq!(eval_value("16 >> 2"), Value::Int(4));
    }

    #[test]
    fn definition_and_scope_law() {
        assert_eq!(eval_value("def x = 7; x"), Value::Int(7));
        expect_exception("def x = 1; def x = 2", "symbol x already defined");
        expect_exception("x = 1", "Assignment to uninitialized variable x");
        expect_exception("const PI = 3; PI = 4", "Assignment to declared constant PI");
        // Inner block definitions do not leak out.
        expect_exception("{ def x = 1; x }; x", "identifier not found: x");
    }

    #[test]
    fn block_scope_isolates_but_reads_outer() {
        assert_eq!(eval_value("def x = 1; { def y = x + 1; y }"), Value::Int(2));
        assert_eq!(eval_value("def x = 1; { x = 5 }; x"), Value::Int(5));
    }

    #[test]
    fn const_initializer_must_be_scalar() {
        assert_eq!(eval_value("const N = 1 + 2; N"), Value::Int(3));
        expect_exception(
            "const A = [1]",
            "Constants must be int, float, string, bool or null",
        );
    }

    #[test]
    fn builtin_names_are_protected() {
        expect_exception(
            "def len = 5",
            "Attempted redeclaration of builtin function 'len'",
        );
        expect_exception(
            "len = 5",
            "Attempted redeclaration of builtin function 'len'",
        );
    }

    #[test]
    fn functions_and_closures() {
        assert_eq!(
            eval_value("def add = func(x, y) { x + y }; add(3, 4)"),
            Value::Int(7)
        );
        // Implicit return of the last statement value.
        assert_eq!(eval_value("def f = func() { 42 }; f()"), Value::Int(42));
        // Explicit return short-circuits the body.
        assert_eq!(
            eval_value("def f = func() { return 1; 2 }; f()"),
            Value::Int(1)
        );
        // Closures capture the defining environment by reference.
        let source = indoc! {"
            def x = 1
            def get = func() { x }
            x = 42
            get()
        "};
        assert_eq!(eval_value(source), Value::Int(42));
    }

    #[test]
    fn counter_closure_keeps_private_state() {
        let source = indoc! {"
            def makeCounter = func() {
                def count = 0
                func() { count = count + 1; count }
            }
            def tick = makeCounter()
            tick(); tick(); tick()
        "};
        assert_eq!(eval_value(source), Value::Int(3));
    }

    #[test]
    fn recursion() {
        let source = indoc! {"
            def fib = func(n) {
                if n < 2 { n } else { fib(n - 1) + fib(n - 2) }
            }
            fib(10)
        "};
        assert_eq!(eval_value(source), Value::Int(55));
    }

    #[test]
    fn call_errors() {
        expect_exception("def f = func(x) { x }; f()", "Incorrect number of arguments. Got 0, expected 1");
        expect_exception("5(1)", "INTEGER is not a function");
    }

    #[test]
    fn for_loop_sums() {
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
        assert_eq!(eval_value(source), Value::Int(45));
    }

    #[test]
    fn while_and_infinite_loops_with_break_continue() {
        let source = indoc! {"
            def n = 0
            while (n < 10) { n = n + 1 }
            n
        "};
        assert_eq!(eval_value(source), Value::Int(10));

        let source = indoc! {"
            def n = 0
            loop {
                n = n + 1
                if n >= 5 { break }
            }
            n
        "};
        assert_eq!(eval_value(source), Value::Int(5));

        let source = indoc! {"
            def s = 0
            for (def i = 0; i < 10; i = i + 1) {
                if i % 2 == 0 { continue }
                s = s + i
            }
            s
        "};
        assert_eq!(eval_value(source), Value::Int(25));
    }

    #[test]
    fn break_outside_loop_is_an_exception() {
        expect_exception("break", "break used outside of a loop");
    }

    #[test]
    fn iter_loops_over_arrays_hashes_and_strings() {
        let source = indoc! {"
            def total = 0
            for x in [1, 2, 3] { total = total + x }
            total
        "};
        assert_eq!(eval_value(source), Value::Int(6));

        let source = indoc! {"
            def indexes = 0
            for i, x in [10, 20, 30] { indexes = indexes + i }
            indexes
        "};
        assert_eq!(eval_value(source), Value::Int(3));

        let source = indoc! {"
            def total = 0
            for k, v in {\"a\": 1, \"b\": 2} { total = total + v }
            total
        "};
        assert_eq!(eval_value(source), Value::Int(3));

        let source = indoc! {"
            def count = 0
            for c in \"abc\" { count = count + 1 }
            count
        "};
        assert_eq!(eval_value(source), Value::Int(3));

        expect_exception("for x in 5 { x }", "Cannot iterate over INTEGER");
    }

    #[test]
    fn arrays_and_negative_indexing() {
        assert_eq!(eval_value("def a = [1, 2, 3]; a[-1]"), Value::Int(3));
        assert_eq!(eval_value("def a = [1, 2, 3]; a[0]"), Value::Int(1));
        assert_eq!(eval_value("def a = [1, 2, 3]; a[5]"), Value::Null);
        assert_eq!(eval_value("def a = [1, 2]; a[0] = 9; a[0]"), Value::Int(9));
        expect_exception("def a = [1]; a[3] = 0", "Index out of bounds: 3");
    }

    #[test]
    fn hashes() {
        assert_eq!(
            eval_value("def h = {\"a\": 1, 2: \"b\"}; h[\"a\"]"),
            Value::Int(1)
        );
        assert_eq!(eval_value("def h = {2: \"b\"}; h[2]"), Value::string("b"));
        assert_eq!(eval_value("def h = {}; h[\"missing\"]"), Value::Null);
        assert_eq!(
            eval_value("def h = {}; h[\"k\"] = 5; h[\"k\"]"),
            Value::Int(5)
        );
        expect_exception("def h = {}; h[[1]]", "Invalid map key: ARRAY");
    }

    #[test]
    fn division_by_zero_and_try_catch() {
        expect_exception("1 / 0", "division by zero");

        let result = eval_value("try { 1 / 0 } catch e { e }");
        let Value::Exception(exception) = &result else {
            panic!("expected caught exception value, got {result:?}");
        };
        assert!(exception.message.contains("division by zero"));

        // No exception: the try block's value flows through.
        assert_eq!(eval_value("try { 5 } catch { 0 }"), Value::Int(5));
        // Caught: the catch block's value is the result.
        assert_eq!(eval_value("try { throw \"x\" } catch { 7 }"), Value::Int(7));
    }

    #[test]
    fn throw_and_rethrow() {
        expect_exception("throw \"boom\"", "boom");
        let source = indoc! {"
            try {
                try { throw \"inner\" } catch e { throw e }
            } catch e { e }
        "};
        let Value::Exception(exception) = eval_value(source) else {
            panic!("expected exception value");
        };
        assert_eq!(exception.message, "inner");
    }

    #[test]
    fn thrown_payloads_are_preserved() {
        let source = "try { throw [1, 2] } catch e { e }";
        let Value::Exception(exception) = eval_value(source) else {
            panic!("expected exception value");
        };
        assert!(matches!(exception.payload, Some(Value::Array(_))));
    }

    #[test]
    fn error_values_do_not_unwind() {
        assert_eq!(
            eval_value("def e = error(\"nope\"); isError(e)"),
            Value::Bool(true)
        );
        // try/catch ignores error values.
        assert_eq!(
            eval_value("try { error(\"nope\") } catch { 0 }; 1"),
            Value::Int(1)
        );
    }

    #[test]
    fn if_expression_values() {
        assert_eq!(eval_value("if 1 < 2 { \"yes\" } else { \"no\" }"), Value::string("yes"));
        assert_eq!(eval_value("if 0 { 1 }"), Value::Null);
        assert_eq!(
            eval_value("def grade = if 95 >= 90 { \"A\" } elif 95 >= 80 { \"B\" } else { \"C\" }; grade"),
            Value::string("A")
        );
    }

    #[test]
    fn classes_and_instances() {
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
        assert_eq!(eval_value(source), Value::Int(7));
    }

    #[test]
    fn class_methods_and_defaults() {
        let source = indoc! {"
            class Counter {
                count = 0
                bump() { self.count = self.count + 1 }
                value() { self.count }
            }
            def c = new Counter()
            c.bump()
            c.bump()
            c.value()
        "};
        assert_eq!(eval_value(source), Value::Int(2));
    }

    #[test]
    fn inheritance_child_wins_on_fields_and_methods() {
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
        let Value::Array(elements) = eval_value(source) else {
            panic!("expected array result");
        };
        assert_eq!(
            *elements.borrow(),
            vec![Value::Int(2), Value::string("tweet")]
        );
    }

    #[test]
    fn instantiation_errors() {
        expect_exception("new Missing()", "identifier not found: Missing");
        expect_exception("def x = 5; new x()", "x is not a class");
        expect_exception(
            "class P { init(a) { self.a = a } }; new P()",
            "Incorrect number of arguments. Got 0, expected 1",
        );
    }

    #[test]
    fn module_member_access() {
        assert_eq!(
            eval_value("string.trimSpace(\"  hi  \")"),
            Value::string("hi")
        );
        expect_exception("string.missing(1)", "Unknown member 'missing' for module string");
    }

    #[test]
    fn backend_output_includes_prints_and_final_value() {
        let output = run("println(\"hi\"); def a = 1; def b = 2; a + b").expect("run failed");
        assert_eq!(output, "hi\n3\n");

        let output = run("def s = \"foo\" + \"bar\"; len(s)").expect("run failed");
        assert_eq!(output, "6\n");

        // Null results print nothing.
        let output = run("def x = 1").expect("run failed");
        assert_eq!(output, "");
    }

    #[test]
    fn uncaught_exception_surfaces_as_error() {
        let error = run("const PI = 3; PI = 4").expect_err("expected failure");
        let message = error.to_string();
        assert!(message.contains("Uncaught exception"), "{message}");
        assert!(message.contains("Assignment to declared constant PI"), "{message}");
    }

    #[test]
    fn interrupt_unwinds_execution() {
        let program = parser::parse("loop { 1 }").expect("parse failed");
        let interpreter = Interpreter::new();
        interpreter.interrupt_flag().store(true, Ordering::Relaxed);
        let error = interpreter.run(&program).expect_err("expected interrupt");
        assert!(error.to_string().contains("execution interrupted"));
    }

    #[test]
    fn interrupt_is_not_catchable() {
        let program = parser::parse("try { loop { 1 } } catch { 99 }").expect("parse failed");
        let interpreter = Interpreter::new();
        interpreter.interrupt_flag().store(true, Ordering::Relaxed);
        let error = interpreter.run(&program).expect_err("expected interrupt");
        assert!(error.to_string().contains("execution interrupted"));
    }
}
