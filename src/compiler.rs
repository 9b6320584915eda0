//! AST to bytecode lowering.
//!
//! The compiler emits a symbolic instruction buffer whose jump arguments
//! are named labels; a single link pass resolves labels to byte offsets
//! and writes the final code vector, so no byte arithmetic happens during
//! emission.
//!
//! Name binding: module-level definitions and any local captured by a
//! nested function live in the environment chain (`Define`/`LoadGlobal`);
//! uncaptured function-level definitions and parameters get local slots
//! (`LoadFast`/`StoreFast`). Every block is bracketed by
//! `OpenScope`/`CloseScope`, which keeps scope shape identical to the
//! evaluator's enclosed environments.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use thiserror::Error;

use crate::ast::{
    Block, ClassLiteral, Expression, FunctionLiteral, InfixOp, LogicalOp, PrefixOp, Program,
    Statement,
};
use crate::bytecode::{CmpOp, CodeBlock, Constant, Opcode};
use crate::runtime::builtins::Registry;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CompileError(pub String);

type CResult<T> = Result<T, CompileError>;

/// Compiles a program into a module `CodeBlock` using the default builtin
/// registry for name-protection checks.
pub fn compile(program: &Program) -> CResult<CodeBlock> {
    compile_with(program, "<module>", &Registry::with_defaults())
}

pub fn compile_with(program: &Program, name: &str, registry: &Registry) -> CResult<CodeBlock> {
    let mut ctx = FnCtx::new(name, &program.filename, true, registry);
    let body = Block {
        statements: program.statements.clone(),
    };
    ctx.compile_statements_value(&body)?;
    ctx.emit(Opcode::Return, vec![]);
    Ok(ctx.finish())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum Arg {
    U16(u16),
    U8(u8),
    /// Absolute byte offset of a label.
    Abs(Label),
    /// Byte distance from the end of this instruction to a label.
    Rel(Label),
}

enum Entry {
    Inst(Opcode, Vec<Arg>),
    Mark(Label),
}

#[derive(Debug, Clone, Copy)]
enum Symbol {
    Slot { index: u16, constant: bool },
    Scoped { constant: bool },
}

struct FnCtx<'a> {
    name: String,
    filename: String,
    registry: &'a Registry,
    entries: Vec<Entry>,
    next_label: usize,
    constants: Vec<Constant>,
    names: Vec<String>,
    locals: Vec<String>,
    scopes: Vec<HashMap<String, Symbol>>,
    captured: HashSet<String>,
    is_module: bool,
    loop_depth: usize,
    block_depth: u16,
    max_block_depth: u16,
    hidden: usize,
}

impl<'a> FnCtx<'a> {
    fn new(name: &str, filename: &str, is_module: bool, registry: &'a Registry) -> Self {
        Self {
            name: name.to_string(),
            filename: filename.to_string(),
            registry,
            entries: Vec::new(),
            next_label: 0,
            constants: Vec::new(),
            names: Vec::new(),
            locals: Vec::new(),
            scopes: vec![HashMap::new()],
            captured: HashSet::new(),
            is_module,
            loop_depth: 0,
            block_depth: 0,
            max_block_depth: 0,
            hidden: 0,
        }
    }

    // ---- emission primitives ----

    fn emit(&mut self, op: Opcode, args: Vec<Arg>) {
        match op {
            Opcode::StartLoop | Opcode::StartTry | Opcode::OpenScope => {
                self.block_depth += 1;
                self.max_block_depth = self.max_block_depth.max(self.block_depth);
            }
            Opcode::EndBlock | Opcode::CloseScope => {
                self.block_depth = self.block_depth.saturating_sub(1);
            }
            _ => {}
        }
        self.entries.push(Entry::Inst(op, args));
    }

    fn new_label(&mut self) -> Label {
        self.next_label += 1;
        Label(self.next_label - 1)
    }

    fn mark(&mut self, label: Label) {
        self.entries.push(Entry::Mark(label));
    }

    fn add_constant(&mut self, constant: Constant) -> u16 {
        if !matches!(constant, Constant::Code(_)) {
            if let Some(index) = self.constants.iter().position(|c| *c == constant) {
                return index as u16;
            }
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u16
    }

    fn add_name(&mut self, name: &str) -> u16 {
        if let Some(index) = self.names.iter().position(|n| n == name) {
            return index as u16;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u16
    }

    fn alloc_slot(&mut self, name: &str) -> u16 {
        self.locals.push(name.to_string());
        (self.locals.len() - 1) as u16
    }

    fn alloc_hidden_slot(&mut self, stem: &str) -> u16 {
        self.hidden += 1;
        let name = format!("__{stem}{}", self.hidden);
        self.alloc_slot(&name)
    }

    // ---- symbol table ----

    fn resolve(&self, name: &str) -> Option<Symbol> {
        for scope in self.scopes.iter().rev() {
            if let Some(symbol) = scope.get(name) {
                return Some(*symbol);
            }
        }
        None
    }

    fn record(&mut self, name: &str, symbol: Symbol) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), symbol);
        }
    }

    fn defined_in_current_scope(&self, name: &str) -> bool {
        self.scopes
            .last()
            .map(|scope| scope.contains_key(name))
            .unwrap_or(false)
    }

    fn is_env_allocated(&self, name: &str) -> bool {
        self.is_module || self.captured.contains(name)
    }

    // ---- statements ----

    fn compile_statement(&mut self, statement: &Statement) -> CResult<()> {
        match statement {
            Statement::Expression(expression) => {
                self.compile_expression(expression)?;
                self.emit(Opcode::Pop, vec![]);
            }
            Statement::Block(block) => self.compile_block_stmt(block)?,
            Statement::Def {
                name,
                value,
                constant,
            } => self.compile_def(name, value, *constant)?,
            Statement::Return(value) => {
                self.compile_expression(value)?;
                self.emit(Opcode::Return, vec![]);
            }
            Statement::Throw(value) => {
                self.compile_expression(value)?;
                self.emit(Opcode::Throw, vec![]);
            }
            Statement::Break => {
                if self.loop_depth == 0 {
                    return Err(CompileError("break used outside of a loop".to_string()));
                }
                self.emit(Opcode::Break, vec![]);
            }
            Statement::Continue => {
                if self.loop_depth == 0 {
                    return Err(CompileError("continue used outside of a loop".to_string()));
                }
                self.emit(Opcode::Continue, vec![]);
            }
            Statement::Loop {
                init,
                condition,
                step,
                body,
            } => self.compile_loop(init.as_deref(), condition.as_ref(), step.as_ref(), body)?,
            Statement::IterLoop {
                key,
                value,
                iterable,
                body,
            } => self.compile_iter_loop(key.as_deref(), value, iterable, body)?,
        }
        Ok(())
    }

    fn compile_def(&mut self, name: &str, value: &Expression, constant: bool) -> CResult<()> {
        if self.registry.protects(name) {
            return Err(CompileError(format!(
                "Attempted redeclaration of builtin function '{name}'"
            )));
        }
        if self.is_env_allocated(name) {
            self.compile_expression(value)?;
            let index = self.add_name(name);
            let op = if constant {
                Opcode::DefineConst
            } else {
                Opcode::Define
            };
            self.emit(op, vec![Arg::U16(index)]);
            self.record(name, Symbol::Scoped { constant });
        } else {
            if self.defined_in_current_scope(name) {
                return Err(CompileError(format!("symbol {name} already defined")));
            }
            self.compile_expression(value)?;
            let slot = self.alloc_slot(name);
            let op = if constant {
                Opcode::StoreConst
            } else {
                Opcode::StoreFast
            };
            self.emit(op, vec![Arg::U16(slot)]);
            self.record(name, Symbol::Slot { index: slot, constant });
        }
        Ok(())
    }

    /// A block in statement position: scoped, leaves nothing on the stack.
    fn compile_block_stmt(&mut self, block: &Block) -> CResult<()> {
        self.scopes.push(HashMap::new());
        self.emit(Opcode::OpenScope, vec![]);
        for statement in &block.statements {
            self.compile_statement(statement)?;
        }
        self.emit(Opcode::CloseScope, vec![]);
        self.scopes.pop();
        Ok(())
    }

    /// A block in value position: scoped, leaves the last statement's
    /// value on the stack.
    fn compile_block_value(&mut self, block: &Block) -> CResult<()> {
        self.scopes.push(HashMap::new());
        self.emit(Opcode::OpenScope, vec![]);
        self.compile_statements_value(block)?;
        self.emit(Opcode::CloseScope, vec![]);
        self.scopes.pop();
        Ok(())
    }

    /// Statement list whose last statement provides the value; runs in the
    /// current scope (used for frame bodies, catch bodies, and scoped
    /// blocks).
    fn compile_statements_value(&mut self, block: &Block) -> CResult<()> {
        match block.statements.split_last() {
            None => self.emit(Opcode::LoadNull, vec![]),
            Some((last, rest)) => {
                for statement in rest {
                    self.compile_statement(statement)?;
                }
                match last {
                    Statement::Expression(expression) => self.compile_expression(expression)?,
                    Statement::Block(inner) => self.compile_block_value(inner)?,
                    other => {
                        self.compile_statement(other)?;
                        self.emit(Opcode::LoadNull, vec![]);
                    }
                }
            }
        }
        Ok(())
    }

    fn compile_loop(
        &mut self,
        init: Option<&Statement>,
        condition: Option<&Expression>,
        step: Option<&Expression>,
        body: &Block,
    ) -> CResult<()> {
        self.scopes.push(HashMap::new());
        self.emit(Opcode::OpenScope, vec![]);
        if let Some(init) = init {
            self.compile_statement(init)?;
        }

        let l_cond = self.new_label();
        let l_step = self.new_label();
        let l_exit = self.new_label();
        let l_break = self.new_label();
        let continue_target = if step.is_some() { l_step } else { l_cond };

        self.emit(
            Opcode::StartLoop,
            vec![Arg::Abs(l_break), Arg::Abs(continue_target)],
        );
        self.mark(l_cond);
        if let Some(condition) = condition {
            self.compile_expression(condition)?;
            self.emit(Opcode::PopJumpIfFalse, vec![Arg::Abs(l_exit)]);
        }

        self.loop_depth += 1;
        let body_result = self.compile_block_stmt(body);
        self.loop_depth -= 1;
        body_result?;

        if let Some(step) = step {
            self.mark(l_step);
            self.compile_expression(step)?;
            self.emit(Opcode::Pop, vec![]);
        }
        // Back edge; the VM checks the interrupt flag here.
        self.emit(Opcode::JumpAbs, vec![Arg::Abs(l_cond)]);

        self.mark(l_exit);
        self.emit(Opcode::EndBlock, vec![]);
        self.mark(l_break);
        self.emit(Opcode::CloseScope, vec![]);
        self.scopes.pop();
        Ok(())
    }

    /// Iteration loops index a materialized pair array through hidden
    /// slots; a null read past the end terminates the loop.
    fn compile_iter_loop(
        &mut self,
        key: Option<&str>,
        value_name: &str,
        iterable: &Expression,
        body: &Block,
    ) -> CResult<()> {
        self.scopes.push(HashMap::new());
        self.emit(Opcode::OpenScope, vec![]);

        self.compile_expression(iterable)?;
        self.emit(Opcode::MakeIter, vec![]);
        let pairs_slot = self.alloc_hidden_slot("pairs");
        self.emit(Opcode::StoreFast, vec![Arg::U16(pairs_slot)]);
        let zero = self.add_constant(Constant::Int(0));
        self.emit(Opcode::LoadConst, vec![Arg::U16(zero)]);
        let index_slot = self.alloc_hidden_slot("index");
        self.emit(Opcode::StoreFast, vec![Arg::U16(index_slot)]);

        let l_cond = self.new_label();
        let l_step = self.new_label();
        let l_exit = self.new_label();
        let l_break = self.new_label();

        self.emit(Opcode::StartLoop, vec![Arg::Abs(l_break), Arg::Abs(l_step)]);
        self.mark(l_cond);
        self.emit(Opcode::LoadFast, vec![Arg::U16(pairs_slot)]);
        self.emit(Opcode::LoadFast, vec![Arg::U16(index_slot)]);
        self.emit(Opcode::LoadIndex, vec![]);
        self.emit(Opcode::Dup, vec![]);
        self.emit(Opcode::PopJumpIfFalse, vec![Arg::Abs(l_exit)]);

        // Per-iteration scope holding the loop variables.
        self.scopes.push(HashMap::new());
        self.emit(Opcode::OpenScope, vec![]);
        let one = self.add_constant(Constant::Int(1));
        self.emit(Opcode::Dup, vec![]);
        self.emit(Opcode::LoadConst, vec![Arg::U16(one)]);
        self.emit(Opcode::LoadIndex, vec![]);
        self.store_fresh(value_name);
        if let Some(key) = key {
            self.emit(Opcode::Dup, vec![]);
            let zero = self.add_constant(Constant::Int(0));
            self.emit(Opcode::LoadConst, vec![Arg::U16(zero)]);
            self.emit(Opcode::LoadIndex, vec![]);
            self.store_fresh(key);
        }
        self.emit(Opcode::Pop, vec![]);

        self.loop_depth += 1;
        let mut body_result = Ok(());
        for statement in &body.statements {
            body_result = self.compile_statement(statement);
            if body_result.is_err() {
                break;
            }
        }
        self.loop_depth -= 1;
        body_result?;

        self.emit(Opcode::CloseScope, vec![]);
        self.scopes.pop();

        self.mark(l_step);
        self.emit(Opcode::LoadFast, vec![Arg::U16(index_slot)]);
        self.emit(Opcode::LoadConst, vec![Arg::U16(one)]);
        self.emit(Opcode::BinaryAdd, vec![]);
        self.emit(Opcode::StoreFast, vec![Arg::U16(index_slot)]);
        self.emit(Opcode::JumpAbs, vec![Arg::Abs(l_cond)]);

        self.mark(l_exit);
        self.emit(Opcode::Pop, vec![]);
        self.emit(Opcode::EndBlock, vec![]);
        self.mark(l_break);
        self.emit(Opcode::CloseScope, vec![]);
        self.scopes.pop();
        Ok(())
    }

    /// Stores the value on top of the stack into a freshly bound loop
    /// variable.
    fn store_fresh(&mut self, name: &str) {
        if self.is_env_allocated(name) {
            let index = self.add_name(name);
            self.emit(Opcode::Define, vec![Arg::U16(index)]);
            self.record(name, Symbol::Scoped { constant: false });
        } else {
            // Always a fresh slot so shadowed loop variables never clobber
            // an outer binding.
            let slot = self.alloc_slot(name);
            self.emit(Opcode::StoreFast, vec![Arg::U16(slot)]);
            self.record(
                name,
                Symbol::Slot {
                    index: slot,
                    constant: false,
                },
            );
        }
    }

    // ---- expressions ----

    fn compile_expression(&mut self, expression: &Expression) -> CResult<()> {
        match expression {
            Expression::Integer(value) => {
                let index = self.add_constant(Constant::Int(*value));
                self.emit(Opcode::LoadConst, vec![Arg::U16(index)]);
            }
            Expression::Float(value) => {
                let index = self.add_constant(Constant::Float(*value));
                self.emit(Opcode::LoadConst, vec![Arg::U16(index)]);
            }
            Expression::Str(value) => {
                let index = self.add_constant(Constant::Str(value.clone()));
                self.emit(Opcode::LoadConst, vec![Arg::U16(index)]);
            }
            Expression::Boolean(value) => {
                let index = self.add_constant(Constant::Bool(*value));
                self.emit(Opcode::LoadConst, vec![Arg::U16(index)]);
            }
            Expression::Null => self.emit(Opcode::LoadNull, vec![]),
            Expression::Identifier(name) => self.compile_identifier(name),
            Expression::Array(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit(Opcode::MakeArray, vec![Arg::U16(elements.len() as u16)]);
            }
            Expression::Hash(pairs) => {
                for (key, value) in pairs {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit(Opcode::MakeMap, vec![Arg::U16(pairs.len() as u16)]);
            }
            Expression::Prefix { op, right } => {
                self.compile_expression(right)?;
                let opcode = match op {
                    PrefixOp::Not => Opcode::UnaryNot,
                    PrefixOp::Neg => Opcode::UnaryNeg,
                };
                self.emit(opcode, vec![]);
            }
            Expression::Infix { left, op, right } => {
                self.compile_expression(left)?;
                self.compile_expression(right)?;
                self.compile_infix_op(*op);
            }
            Expression::Logical { left, op, right } => {
                self.compile_expression(left)?;
                let l_end = self.new_label();
                let opcode = match op {
                    LogicalOp::And => Opcode::JumpIfFalseOrPop,
                    LogicalOp::Or => Opcode::JumpIfTrueOrPop,
                };
                self.emit(opcode, vec![Arg::Abs(l_end)]);
                self.compile_expression(right)?;
                self.mark(l_end);
            }
            Expression::Assign { target, value } => {
                self.compile_assign(target, value)?;
            }
            Expression::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.emit(Opcode::LoadIndex, vec![]);
            }
            Expression::Member { object, property } => {
                self.compile_expression(object)?;
                let index = self.add_name(property);
                self.emit(Opcode::LoadAttribute, vec![Arg::U16(index)]);
            }
            Expression::Call {
                function,
                arguments,
            } => {
                // Arguments evaluate left to right, then the callee.
                for argument in arguments {
                    self.compile_expression(argument)?;
                }
                self.compile_expression(function)?;
                self.emit(Opcode::Call, vec![Arg::U16(arguments.len() as u16)]);
            }
            Expression::If {
                condition,
                consequence,
                alternative,
            } => {
                self.compile_expression(condition)?;
                let l_else = self.new_label();
                let l_end = self.new_label();
                self.emit(Opcode::PopJumpIfFalse, vec![Arg::Abs(l_else)]);
                self.compile_block_value(consequence)?;
                self.emit(Opcode::JumpForward, vec![Arg::Rel(l_end)]);
                self.mark(l_else);
                match alternative {
                    Some(alternative) => self.compile_block_value(alternative)?,
                    None => self.emit(Opcode::LoadNull, vec![]),
                }
                self.mark(l_end);
            }
            Expression::TryCatch {
                try_block,
                symbol,
                catch_block,
            } => {
                let l_catch = self.new_label();
                let l_end = self.new_label();
                self.emit(Opcode::StartTry, vec![Arg::Abs(l_catch)]);
                self.compile_block_value(try_block)?;
                self.emit(Opcode::EndBlock, vec![]);
                self.emit(Opcode::JumpForward, vec![Arg::Rel(l_end)]);
                self.mark(l_catch);
                self.compile_catch(symbol.as_deref(), catch_block)?;
                self.mark(l_end);
            }
            Expression::Function(literal) => self.compile_function_literal(literal)?,
            Expression::Class(literal) => self.compile_class_literal(literal)?,
            Expression::New { class, arguments } => {
                for argument in arguments {
                    self.compile_expression(argument)?;
                }
                self.compile_identifier(class);
                let name_index = self.add_name(class);
                self.emit(
                    Opcode::MakeInstance,
                    vec![Arg::U16(arguments.len() as u16), Arg::U16(name_index)],
                );
            }
        }
        Ok(())
    }

    fn compile_infix_op(&mut self, op: InfixOp) {
        if let Some(cmp) = CmpOp::from_infix(op) {
            self.emit(Opcode::Compare, vec![Arg::U8(cmp as u8)]);
            return;
        }
        let opcode = match op {
            InfixOp::Add => Opcode::BinaryAdd,
            InfixOp::Sub => Opcode::BinarySub,
            InfixOp::Mul => Opcode::BinaryMul,
            InfixOp::Div => Opcode::BinaryDivide,
            InfixOp::Mod => Opcode::BinaryMod,
            InfixOp::ShiftLeft => Opcode::BinaryShiftL,
            InfixOp::ShiftRight => Opcode::BinaryShiftR,
            InfixOp::BitAnd => Opcode::BinaryAnd,
            InfixOp::BitAndNot => Opcode::BinaryAndNot,
            InfixOp::BitOr => Opcode::BinaryOr,
            InfixOp::BitXor => Opcode::BinaryNot,
            // Comparisons are handled above.
            _ => Opcode::Compare,
        };
        self.emit(opcode, vec![]);
    }

    fn compile_identifier(&mut self, name: &str) {
        match self.resolve(name) {
            Some(Symbol::Slot { index, .. }) => {
                self.emit(Opcode::LoadFast, vec![Arg::U16(index)]);
            }
            _ => {
                let index = self.add_name(name);
                self.emit(Opcode::LoadGlobal, vec![Arg::U16(index)]);
            }
        }
    }

    /// Assignment leaves null on the stack (its value as an expression).
    fn compile_assign(&mut self, target: &Expression, value: &Expression) -> CResult<()> {
        match target {
            Expression::Identifier(name) => {
                match self.resolve(name) {
                    Some(Symbol::Slot { constant: true, .. })
                    | Some(Symbol::Scoped { constant: true }) => {
                        return Err(CompileError(format!(
                            "Assignment to declared constant {name}"
                        )));
                    }
                    Some(Symbol::Slot { index, .. }) => {
                        self.compile_expression(value)?;
                        self.emit(Opcode::StoreFast, vec![Arg::U16(index)]);
                    }
                    _ => {
                        if self.resolve(name).is_none() && self.registry.protects(name) {
                            return Err(CompileError(format!(
                                "Attempted redeclaration of builtin function '{name}'"
                            )));
                        }
                        self.compile_expression(value)?;
                        let index = self.add_name(name);
                        self.emit(Opcode::StoreGlobal, vec![Arg::U16(index)]);
                    }
                }
            }
            Expression::Index { left, index } => {
                self.compile_expression(left)?;
                self.compile_expression(index)?;
                self.compile_expression(value)?;
                self.emit(Opcode::StoreIndex, vec![]);
            }
            Expression::Member { object, property } => {
                self.compile_expression(object)?;
                self.compile_expression(value)?;
                let index = self.add_name(property);
                self.emit(Opcode::StoreAttribute, vec![Arg::U16(index)]);
            }
            other => {
                return Err(CompileError(format!(
                    "Invalid assignment target: {other}"
                )));
            }
        }
        self.emit(Opcode::LoadNull, vec![]);
        Ok(())
    }

    /// The VM pushes the exception value before jumping here.
    fn compile_catch(&mut self, symbol: Option<&str>, block: &Block) -> CResult<()> {
        self.scopes.push(HashMap::new());
        self.emit(Opcode::OpenScope, vec![]);
        match symbol {
            Some(name) => self.store_fresh(name),
            None => self.emit(Opcode::Pop, vec![]),
        }
        self.compile_statements_value(block)?;
        self.emit(Opcode::CloseScope, vec![]);
        self.scopes.pop();
        Ok(())
    }

    fn compile_function_literal(&mut self, literal: &FunctionLiteral) -> CResult<()> {
        let fn_name = literal
            .name
            .clone()
            .unwrap_or_else(|| "(anonymous)".to_string());

        let mut inner = FnCtx::new(&fn_name, &self.filename, false, self.registry);
        inner.captured = collect_captured(&literal.body);

        // Parameters occupy the first local slots.
        for parameter in &literal.parameters {
            let slot = inner.alloc_slot(parameter);
            inner.record(
                parameter,
                Symbol::Slot {
                    index: slot,
                    constant: false,
                },
            );
        }
        // Captured parameters are promoted into the frame environment so
        // nested closures resolve them through the chain.
        for parameter in &literal.parameters {
            if inner.captured.contains(parameter) {
                if let Some(Symbol::Slot { index, .. }) = inner.resolve(parameter) {
                    inner.emit(Opcode::LoadFast, vec![Arg::U16(index)]);
                    let name_index = inner.add_name(parameter);
                    inner.emit(Opcode::Define, vec![Arg::U16(name_index)]);
                    inner.record(parameter, Symbol::Scoped { constant: false });
                }
            }
        }

        inner.compile_statements_value(&literal.body)?;
        inner.emit(Opcode::Return, vec![]);
        let code = inner.finish();

        for parameter in &literal.parameters {
            let index = self.add_constant(Constant::Str(parameter.clone()));
            self.emit(Opcode::LoadConst, vec![Arg::U16(index)]);
        }
        self.emit(
            Opcode::MakeArray,
            vec![Arg::U16(literal.parameters.len() as u16)],
        );
        let name_const = self.add_constant(Constant::Str(fn_name));
        self.emit(Opcode::LoadConst, vec![Arg::U16(name_const)]);
        self.constants.push(Constant::Code(Rc::new(code)));
        let code_const = (self.constants.len() - 1) as u16;
        self.emit(Opcode::MakeFunction, vec![Arg::U16(code_const)]);
        Ok(())
    }

    /// A class literal leaves the class on the stack and defines its name.
    fn compile_class_literal(&mut self, literal: &ClassLiteral) -> CResult<()> {
        if self.registry.protects(&literal.name) {
            return Err(CompileError(format!(
                "Attempted redeclaration of builtin function '{}'",
                literal.name
            )));
        }

        for method in &literal.methods {
            self.compile_function_literal(method)?;
        }
        for (field, default) in &literal.fields {
            let index = self.add_constant(Constant::Str(field.clone()));
            self.emit(Opcode::LoadConst, vec![Arg::U16(index)]);
            self.compile_expression(default)?;
        }
        match &literal.parent {
            Some(parent) => self.compile_identifier(parent),
            None => self.emit(Opcode::LoadNull, vec![]),
        }
        let name_const = self.add_constant(Constant::Str(literal.name.clone()));
        self.emit(Opcode::LoadConst, vec![Arg::U16(name_const)]);
        self.emit(
            Opcode::MakeClass,
            vec![
                Arg::U16(literal.fields.len() as u16),
                Arg::U16(literal.methods.len() as u16),
            ],
        );

        self.emit(Opcode::Dup, vec![]);
        let name_index = self.add_name(&literal.name);
        self.emit(Opcode::Define, vec![Arg::U16(name_index)]);
        self.record(&literal.name, Symbol::Scoped { constant: false });
        Ok(())
    }

    // ---- linking ----

    fn finish(self) -> CodeBlock {
        let mut offsets = Vec::with_capacity(self.entries.len());
        let mut labels: HashMap<Label, u16> = HashMap::new();
        let mut offset = 0u16;
        for entry in &self.entries {
            offsets.push(offset);
            match entry {
                Entry::Mark(label) => {
                    labels.insert(*label, offset);
                }
                Entry::Inst(op, _) => {
                    offset += 1 + op.arg_width().byte_len() as u16;
                }
            }
        }

        let mut code = Vec::with_capacity(offset as usize);
        for entry in &self.entries {
            let Entry::Inst(op, args) = entry else {
                continue;
            };
            code.push(*op as u8);
            let end_of_inst = (code.len() + op.arg_width().byte_len()) as u16;
            for arg in args {
                match arg {
                    Arg::U8(value) => code.push(*value),
                    Arg::U16(value) => code.extend_from_slice(&value.to_le_bytes()),
                    Arg::Abs(label) => {
                        let target = labels.get(label).copied().unwrap_or(0);
                        code.extend_from_slice(&target.to_le_bytes());
                    }
                    Arg::Rel(label) => {
                        let target = labels.get(label).copied().unwrap_or(0);
                        let delta = target.saturating_sub(end_of_inst);
                        code.extend_from_slice(&delta.to_le_bytes());
                    }
                }
            }
        }

        let max_stack = compute_max_stack(&self.entries, &labels, &offsets);

        CodeBlock {
            name: self.name,
            filename: self.filename,
            local_count: self.locals.len() as u16,
            max_stack,
            max_block_depth: self.max_block_depth,
            code,
            names: self.names,
            locals: self.locals,
            constants: self.constants,
        }
    }
}

/// Names referenced inside any nested function literal; these must live in
/// the environment chain rather than local slots.
fn collect_captured(block: &Block) -> HashSet<String> {
    let mut captured = HashSet::new();
    walk_block(block, &mut |expression| match expression {
        Expression::Function(function) => {
            collect_identifiers(&function.body, &mut captured);
        }
        Expression::Class(class) => {
            for method in &class.methods {
                collect_identifiers(&method.body, &mut captured);
            }
        }
        _ => {}
    });
    captured
}

fn collect_identifiers(block: &Block, out: &mut HashSet<String>) {
    walk_block(block, &mut |expression| match expression {
        Expression::Identifier(name) => {
            out.insert(name.clone());
        }
        Expression::New { class, .. } => {
            out.insert(class.clone());
        }
        _ => {}
    });
}

/// Visits every expression in a block's subtree, including nested blocks
/// and function bodies.
fn walk_block(block: &Block, visit: &mut impl FnMut(&Expression)) {
    for statement in &block.statements {
        walk_statement(statement, visit);
    }
}

fn walk_statement(statement: &Statement, visit: &mut impl FnMut(&Expression)) {
    match statement {
        Statement::Expression(expression)
        | Statement::Return(expression)
        | Statement::Throw(expression) => walk_expression(expression, visit),
        Statement::Def { value, .. } => walk_expression(value, visit),
        Statement::Block(block) => walk_block(block, visit),
        Statement::Break | Statement::Continue => {}
        Statement::Loop {
            init,
            condition,
            step,
            body,
        } => {
            if let Some(init) = init {
                walk_statement(init, visit);
            }
            if let Some(condition) = condition {
                walk_expression(condition, visit);
            }
            if let Some(step) = step {
                walk_expression(step, visit);
            }
            walk_block(body, visit);
        }
        Statement::IterLoop { iterable, body, .. } => {
            walk_expression(iterable, visit);
            walk_block(body, visit);
        }
    }
}

fn walk_expression(expression: &Expression, visit: &mut impl FnMut(&Expression)) {
    visit(expression);
    match expression {
        Expression::Array(elements) => {
            for element in elements {
                walk_expression(element, visit);
            }
        }
        Expression::Hash(pairs) => {
            for (key, value) in pairs {
                walk_expression(key, visit);
                walk_expression(value, visit);
            }
        }
        Expression::Prefix { right, .. } => walk_expression(right, visit),
        Expression::Infix { left, right, .. } | Expression::Logical { left, right, .. } => {
            walk_expression(left, visit);
            walk_expression(right, visit);
        }
        Expression::Assign { target, value } => {
            walk_expression(target, visit);
            walk_expression(value, visit);
        }
        Expression::Index { left, index } => {
            walk_expression(left, visit);
            walk_expression(index, visit);
        }
        Expression::Member { object, .. } => walk_expression(object, visit),
        Expression::Call {
            function,
            arguments,
        } => {
            walk_expression(function, visit);
            for argument in arguments {
                walk_expression(argument, visit);
            }
        }
        Expression::If {
            condition,
            consequence,
            alternative,
        } => {
            walk_expression(condition, visit);
            walk_block(consequence, visit);
            if let Some(alternative) = alternative {
                walk_block(alternative, visit);
            }
        }
        Expression::TryCatch {
            try_block,
            catch_block,
            ..
        } => {
            walk_block(try_block, visit);
            walk_block(catch_block, visit);
        }
        Expression::Function(function) => walk_block(&function.body, visit),
        Expression::Class(class) => {
            for (_, default) in &class.fields {
                walk_expression(default, visit);
            }
            for method in &class.methods {
                walk_block(&method.body, visit);
            }
        }
        Expression::New { arguments, .. } => {
            for argument in arguments {
                walk_expression(argument, visit);
            }
        }
        _ => {}
    }
}

/// Worklist dataflow over the symbolic buffer; returns the deepest
/// operand-stack level any path can reach.
fn compute_max_stack(entries: &[Entry], labels: &HashMap<Label, u16>, offsets: &[u16]) -> u16 {
    // Map label byte offsets back to entry indices.
    let mut entry_at_offset: HashMap<u16, usize> = HashMap::new();
    for (index, offset) in offsets.iter().enumerate() {
        entry_at_offset.entry(*offset).or_insert(index);
    }
    let entry_for_label = |label: &Label| -> Option<usize> {
        labels
            .get(label)
            .and_then(|offset| entry_at_offset.get(offset))
            .copied()
    };

    let mut best: Vec<Option<usize>> = vec![None; entries.len() + 1];
    let mut max_depth = 0usize;
    let mut worklist = vec![(0usize, 0usize)];

    while let Some((index, depth)) = worklist.pop() {
        if index >= entries.len() {
            continue;
        }
        if let Some(seen) = best[index] {
            if seen >= depth {
                continue;
            }
        }
        best[index] = Some(depth);
        max_depth = max_depth.max(depth);

        let Entry::Inst(op, args) = &entries[index] else {
            worklist.push((index + 1, depth));
            continue;
        };

        let arg_u16 = |position: usize| -> usize {
            match args.get(position) {
                Some(Arg::U16(value)) => *value as usize,
                _ => 0,
            }
        };
        let label_target = |position: usize| -> Option<usize> {
            match args.get(position) {
                Some(Arg::Abs(label)) | Some(Arg::Rel(label)) => entry_for_label(label),
                _ => None,
            }
        };

        match op {
            Opcode::JumpAbs | Opcode::JumpForward => {
                if let Some(target) = label_target(0) {
                    worklist.push((target, depth));
                }
            }
            Opcode::PopJumpIfTrue | Opcode::PopJumpIfFalse => {
                let after = depth.saturating_sub(1);
                worklist.push((index + 1, after));
                if let Some(target) = label_target(0) {
                    worklist.push((target, after));
                }
            }
            Opcode::JumpIfTrueOrPop | Opcode::JumpIfFalseOrPop => {
                worklist.push((index + 1, depth.saturating_sub(1)));
                if let Some(target) = label_target(0) {
                    worklist.push((target, depth));
                }
            }
            Opcode::StartTry => {
                worklist.push((index + 1, depth));
                if let Some(target) = label_target(0) {
                    worklist.push((target, depth + 1));
                }
                max_depth = max_depth.max(depth + 1);
            }
            Opcode::StartLoop => {
                worklist.push((index + 1, depth));
                if let Some(target) = label_target(0) {
                    worklist.push((target, depth));
                }
                if let Some(target) = label_target(1) {
                    worklist.push((target, depth));
                }
            }
            Opcode::Return | Opcode::Throw | Opcode::Break | Opcode::Continue => {}
            _ => {
                let (pops, pushes) = match op {
                    Opcode::Pop => (1, 0),
                    Opcode::Dup => (1, 2),
                    Opcode::LoadNull
                    | Opcode::LoadConst
                    | Opcode::LoadFast
                    | Opcode::LoadGlobal => (0, 1),
                    Opcode::LoadIndex => (2, 1),
                    Opcode::LoadAttribute => (1, 1),
                    Opcode::StoreFast
                    | Opcode::StoreConst
                    | Opcode::StoreGlobal
                    | Opcode::Define
                    | Opcode::DefineConst => (1, 0),
                    Opcode::StoreIndex => (3, 0),
                    Opcode::StoreAttribute => (2, 0),
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
                    | Opcode::BinaryNot
                    | Opcode::Compare => (2, 1),
                    Opcode::UnaryNot | Opcode::UnaryNeg | Opcode::MakeIter => (1, 1),
                    Opcode::Call => (arg_u16(0) + 1, 1),
                    Opcode::MakeArray => (arg_u16(0), 1),
                    Opcode::MakeMap => (arg_u16(0) * 2, 1),
                    Opcode::MakeFunction => (2, 1),
                    Opcode::MakeClass => (arg_u16(0) * 2 + arg_u16(1) + 2, 1),
                    Opcode::MakeInstance => (arg_u16(0) + 1, 1),
                    _ => (0, 0),
                };
                let after = depth.saturating_sub(pops) + pushes;
                max_depth = max_depth.max(after);
                worklist.push((index + 1, after));
            }
        }
    }

    max_depth as u16
}
