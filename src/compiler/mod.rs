//! Syntax tree to bytecode.
//!
//! One `CompilationScope` per function body being compiled, mirrored by a
//! scope in the `SymbolTable`. Jumps are emitted with a placeholder operand
//! and backpatched once their target is known.

use std::rc::Rc;

use crate::ast::{Block, Expr, InfixOp, PrefixOp, Program, Span, Stmt};
use crate::builtins;
use crate::bytecode::Bytecode;
use crate::code::{self, Instructions, Opcode};
use crate::value::{CompiledFunction, Value};

pub mod symbol_table;
pub use symbol_table::{Symbol, SymbolScope, SymbolTable};

/// Operand written into a jump before its target is known.
const PLACEHOLDER: usize = 9999;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{file}: {kind}")]
pub struct CompileError {
    pub file: String,
    pub span: Span,
    pub kind: CompileErrorKind,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("undefined variable: {name}")]
    UndefinedVariable { name: String },
    #[error("cannot assign to constant '{name}'")]
    ConstantReassignment { name: String },
    #[error("cannot assign to {what} '{name}'")]
    NotAssignable { name: String, what: &'static str },
    #[error("unknown operator: {op}")]
    UnknownOperator { op: String },
    #[error("invalid assignment target")]
    InvalidAssignTarget,
    #[error("unknown builtin: {namespace}.{name}")]
    UnknownBuiltin { namespace: String, name: String },
    #[error("{name} expects {expected} argument(s), got {got}")]
    ArityMismatch { name: String, expected: usize, got: usize },
    #[error("return outside of a function")]
    ReturnOutsideFunction,
    #[error("{keyword} outside of a loop")]
    OutsideLoop { keyword: &'static str },
    #[error("operand {value} of {op} does not fit in 16 bits")]
    OperandOverflow { op: &'static str, value: usize },
}

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

#[derive(Debug, Default)]
struct LoopContext {
    start: usize,
    breaks: Vec<usize>,
}

#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Vec<u8>,
    last: Option<EmittedInstruction>,
    previous: Option<EmittedInstruction>,
    loops: Vec<LoopContext>,
}

pub struct Compiler {
    file: String,
    constants: Vec<Value>,
    symbols: SymbolTable,
    scopes: Vec<CompilationScope>,
    span: Span,
}

type CompileResult<T> = Result<T, CompileError>;

impl Compiler {
    /// `file` identifies the compilation unit in error messages.
    pub fn new(file: impl Into<String>) -> Self {
        let mut symbols = SymbolTable::new();
        for (i, builtin) in builtins::BUILTINS.iter().enumerate() {
            symbols.define_builtin(i, builtin.name);
        }
        Self::with_state(file, symbols, Vec::new())
    }

    /// Continue from the globals and constants of an earlier compilation.
    pub fn with_state(file: impl Into<String>, symbols: SymbolTable, constants: Vec<Value>) -> Self {
        Compiler {
            file: file.into(),
            constants,
            symbols,
            scopes: vec![CompilationScope::default()],
            span: Span::UNKNOWN,
        }
    }

    pub fn into_state(self) -> (SymbolTable, Vec<Value>) {
        (self.symbols, self.constants)
    }

    pub fn compile(&mut self, program: &Program) -> CompileResult<()> {
        for stmt in &program.statements {
            self.span = stmt.span;
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: Instructions(self.scope().instructions.clone()),
            constants: self.constants.clone(),
        }
    }

    fn error(&self, kind: CompileErrorKind) -> CompileError {
        CompileError { file: self.file.clone(), span: self.span, kind }
    }

    // ── Emission ────────────────────────────────────────────────────

    fn scope(&self) -> &CompilationScope {
        &self.scopes[self.scopes.len() - 1]
    }

    fn scope_mut(&mut self) -> &mut CompilationScope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn emit(&mut self, op: Opcode, operands: &[usize]) -> CompileResult<usize> {
        for &value in operands {
            if value > u16::MAX as usize {
                return Err(self.error(CompileErrorKind::OperandOverflow { op: op.name(), value }));
            }
        }
        let instruction = code::make(op, operands);
        let scope = self.scope_mut();
        let position = scope.instructions.len();
        scope.instructions.extend_from_slice(&instruction);
        scope.previous = scope.last;
        scope.last = Some(EmittedInstruction { opcode: op, position });
        Ok(position)
    }

    fn add_constant(&mut self, value: Value) -> usize {
        let dedupe = !matches!(value, Value::CompiledFunction(_));
        if dedupe {
            if let Some(i) = self.constants.iter().position(|c| c.same(&value)) {
                return i;
            }
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn current_position(&self) -> usize {
        self.scope().instructions.len()
    }

    fn last_is(&self, op: Opcode) -> bool {
        self.scope().last.is_some_and(|last| last.opcode == op)
    }

    fn remove_last_pop(&mut self) {
        let scope = self.scope_mut();
        if let Some(last) = scope.last {
            scope.instructions.truncate(last.position);
            scope.last = scope.previous;
        }
    }

    fn replace_last_pop_with_return(&mut self) {
        let scope = self.scope_mut();
        if let Some(last) = scope.last.as_mut() {
            scope.instructions[last.position] = Opcode::ReturnValue as u8;
            last.opcode = Opcode::ReturnValue;
        }
    }

    /// Rewrite the operand of the jump at `position` to point at `target`.
    fn patch_jump(&mut self, position: usize, target: usize) -> CompileResult<()> {
        if target > u16::MAX as usize {
            return Err(self.error(CompileErrorKind::OperandOverflow { op: "jump", value: target }));
        }
        let bytes = (target as u16).to_be_bytes();
        let ins = &mut self.scope_mut().instructions;
        ins[position + 1] = bytes[0];
        ins[position + 2] = bytes[1];
        Ok(())
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        self.symbols.push_scope();
    }

    fn leave_scope(&mut self) -> (Vec<u8>, Vec<Symbol>) {
        let scope = self.scopes.pop().unwrap_or_default();
        let free = self.symbols.pop_scope();
        (scope.instructions, free)
    }

    // ── Statements ──────────────────────────────────────────────────

    fn compile_block(&mut self, block: &Block) -> CompileResult<()> {
        for stmt in block {
            self.span = stmt.span;
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Expr(Expr::Function { name: Some(name), params, body }) => {
                let symbol = self.symbols.define(name, false);
                self.compile_function(Some(name), params, body)?;
                self.store(&symbol)?;
            }
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Opcode::Pop, &[])?;
            }
            Stmt::Var { name, mutable, value } => {
                self.compile_expr(value)?;
                let symbol = self.symbols.define(name, *mutable);
                self.store(&symbol)?;
            }
            Stmt::Assign { target, value } => self.compile_assign(target, value)?,
            Stmt::Return(value) => {
                if self.symbols.is_global() {
                    return Err(self.error(CompileErrorKind::ReturnOutsideFunction));
                }
                match value {
                    Some(expr) => {
                        self.compile_expr(expr)?;
                        self.emit(Opcode::ReturnValue, &[])?;
                    }
                    None => {
                        self.emit(Opcode::Return, &[])?;
                    }
                }
            }
            Stmt::While { condition, body } => self.compile_while(condition, body)?,
            Stmt::Break => {
                if self.scope().loops.is_empty() {
                    return Err(self.error(CompileErrorKind::OutsideLoop { keyword: "break" }));
                }
                let jump = self.emit(Opcode::Jump, &[PLACEHOLDER])?;
                if let Some(ctx) = self.scope_mut().loops.last_mut() {
                    ctx.breaks.push(jump);
                }
            }
            Stmt::Continue => {
                let start = match self.scope().loops.last() {
                    Some(ctx) => ctx.start,
                    None => return Err(self.error(CompileErrorKind::OutsideLoop { keyword: "continue" })),
                };
                self.emit(Opcode::Jump, &[start])?;
            }
        }
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &Block) -> CompileResult<()> {
        let start = self.current_position();
        self.compile_expr(condition)?;
        let exit_jump = self.emit(Opcode::JumpNotTruthy, &[PLACEHOLDER])?;

        self.scope_mut().loops.push(LoopContext { start, breaks: Vec::new() });
        let result = self.compile_block(body);
        let ctx = self.scope_mut().loops.pop().unwrap_or_default();
        result?;

        self.emit(Opcode::Jump, &[start])?;
        let exit = self.current_position();
        self.patch_jump(exit_jump, exit)?;
        for jump in ctx.breaks {
            self.patch_jump(jump, exit)?;
        }
        self.emit(Opcode::LoopEnd, &[])?;
        Ok(())
    }

    fn compile_assign(&mut self, target: &Expr, value: &Expr) -> CompileResult<()> {
        match target {
            Expr::Ident(name) => {
                let symbol = self.assignable(name)?;
                self.compile_expr(value)?;
                self.store(&symbol)
            }
            Expr::Index { left, index } => {
                let Expr::Ident(name) = left.as_ref() else {
                    return Err(self.error(CompileErrorKind::InvalidAssignTarget));
                };
                let symbol = self.assignable(name)?;
                self.load(&symbol)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit(Opcode::SetIndex, &[])?;
                self.store(&symbol)
            }
            Expr::Member { object, property } => {
                let Expr::Ident(name) = object.as_ref() else {
                    return Err(self.error(CompileErrorKind::InvalidAssignTarget));
                };
                let symbol = self.assignable(name)?;
                self.load(&symbol)?;
                let key = self.add_constant(Value::string(property.as_str()));
                self.emit(Opcode::Constant, &[key])?;
                self.compile_expr(value)?;
                self.emit(Opcode::SetIndex, &[])?;
                self.store(&symbol)
            }
            _ => Err(self.error(CompileErrorKind::InvalidAssignTarget)),
        }
    }

    fn assignable(&mut self, name: &str) -> CompileResult<Symbol> {
        let symbol = self
            .symbols
            .resolve(name)
            .ok_or_else(|| self.error(CompileErrorKind::UndefinedVariable { name: name.to_string() }))?;
        let what = match symbol.scope {
            SymbolScope::Global | SymbolScope::Local if !symbol.mutable => {
                return Err(self.error(CompileErrorKind::ConstantReassignment { name: name.to_string() }));
            }
            SymbolScope::Global | SymbolScope::Local => return Ok(symbol),
            SymbolScope::Free => "captured variable",
            SymbolScope::Builtin => "builtin",
            SymbolScope::Function => "function",
        };
        Err(self.error(CompileErrorKind::NotAssignable { name: name.to_string(), what }))
    }

    fn store(&mut self, symbol: &Symbol) -> CompileResult<()> {
        let op = match symbol.scope {
            SymbolScope::Global => Opcode::SetGlobal,
            SymbolScope::Local => Opcode::SetLocal,
            _ => {
                return Err(self.error(CompileErrorKind::NotAssignable {
                    name: symbol.name.clone(),
                    what: "binding",
                }));
            }
        };
        self.emit(op, &[symbol.index])?;
        Ok(())
    }

    fn load(&mut self, symbol: &Symbol) -> CompileResult<()> {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index])?,
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index])?,
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index])?,
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[symbol.index])?,
            SymbolScope::Function => self.emit(Opcode::CurrentClosure, &[])?,
        };
        Ok(())
    }

    // ── Expressions ─────────────────────────────────────────────────

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match expr {
            Expr::Integer(n) => self.emit_constant(Value::Integer(*n))?,
            Expr::Float(n) => self.emit_constant(Value::Float(*n))?,
            Expr::Str(s) => self.emit_constant(Value::string(s.as_str()))?,
            Expr::Boolean(true) => {
                self.emit(Opcode::True, &[])?;
            }
            Expr::Boolean(false) => {
                self.emit(Opcode::False, &[])?;
            }
            Expr::Null => {
                self.emit(Opcode::Null, &[])?;
            }
            Expr::Ident(name) => {
                let symbol = self
                    .symbols
                    .resolve(name)
                    .ok_or_else(|| self.error(CompileErrorKind::UndefinedVariable { name: name.clone() }))?;
                self.load(&symbol)?;
            }
            Expr::Prefix { op, right } => {
                self.compile_expr(right)?;
                let opcode = match op {
                    PrefixOp::Negate => Opcode::Minus,
                    PrefixOp::Not => Opcode::Bang,
                };
                self.emit(opcode, &[])?;
            }
            Expr::Infix { op: InfixOp::And, left, right } => {
                self.compile_expr(left)?;
                let to_false = self.emit(Opcode::JumpNotTruthy, &[PLACEHOLDER])?;
                self.compile_expr(right)?;
                let to_end = self.emit(Opcode::Jump, &[PLACEHOLDER])?;
                let false_branch = self.current_position();
                self.patch_jump(to_false, false_branch)?;
                self.emit(Opcode::False, &[])?;
                let end = self.current_position();
                self.patch_jump(to_end, end)?;
            }
            Expr::Infix { op: InfixOp::Or, left, right } => {
                self.compile_expr(left)?;
                let to_right = self.emit(Opcode::JumpNotTruthy, &[PLACEHOLDER])?;
                self.emit(Opcode::True, &[])?;
                let to_end = self.emit(Opcode::Jump, &[PLACEHOLDER])?;
                let right_branch = self.current_position();
                self.patch_jump(to_right, right_branch)?;
                self.compile_expr(right)?;
                let end = self.current_position();
                self.patch_jump(to_end, end)?;
            }
            Expr::Infix { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let opcode = infix_opcode(*op)
                    .ok_or_else(|| self.error(CompileErrorKind::UnknownOperator { op: op.to_string() }))?;
                self.emit(opcode, &[])?;
            }
            Expr::If { condition, consequence, alternative } => {
                self.compile_if(condition, consequence, alternative.as_ref())?
            }
            Expr::Function { name, params, body } => {
                self.compile_function(name.as_deref(), params, body)?
            }
            Expr::Call { function, args } => {
                if let Some((name, arity)) = self.namespaced_builtin_arity(function) {
                    if arity != args.len() {
                        return Err(self.error(CompileErrorKind::ArityMismatch {
                            name,
                            expected: arity,
                            got: args.len(),
                        }));
                    }
                }
                self.compile_expr(function)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Opcode::Call, &[args.len()])?;
            }
            Expr::Index { left, index } => {
                self.compile_expr(left)?;
                self.compile_expr(index)?;
                self.emit(Opcode::Index, &[])?;
            }
            Expr::Member { object, property } => {
                if let Some(namespace) = self.builtin_namespace(object) {
                    let index = builtins::lookup_global(&namespace, property).ok_or_else(|| {
                        self.error(CompileErrorKind::UnknownBuiltin {
                            namespace: namespace.clone(),
                            name: property.clone(),
                        })
                    })?;
                    self.emit(Opcode::GetGlobalBuiltin, &[index])?;
                } else {
                    self.compile_expr(object)?;
                    self.emit_constant(Value::string(property.as_str()))?;
                    self.emit(Opcode::Index, &[])?;
                }
            }
            Expr::Array(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(Opcode::Array, &[items.len()])?;
            }
            Expr::Hash(pairs) => {
                for (key, value) in pairs {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit(Opcode::Hash, &[pairs.len() * 2])?;
            }
        }
        Ok(())
    }

    fn emit_constant(&mut self, value: Value) -> CompileResult<()> {
        let index = self.add_constant(value);
        self.emit(Opcode::Constant, &[index])?;
        Ok(())
    }

    /// `ns` in `ns.name` when it names a builtin namespace and is not shadowed
    /// by a user binding.
    fn builtin_namespace(&mut self, object: &Expr) -> Option<String> {
        let Expr::Ident(ns) = object else { return None };
        if !builtins::is_namespace(ns) || self.symbols.resolve(ns).is_some() {
            return None;
        }
        Some(ns.clone())
    }

    fn namespaced_builtin_arity(&mut self, function: &Expr) -> Option<(String, usize)> {
        let Expr::Member { object, property } = function else { return None };
        let namespace = self.builtin_namespace(object)?;
        let index = builtins::lookup_global(&namespace, property)?;
        let arity = builtins::GLOBAL_BUILTINS[index].arity?;
        Some((format!("{}.{}", namespace, property), arity))
    }

    fn compile_if(&mut self, condition: &Expr, consequence: &Block, alternative: Option<&Block>) -> CompileResult<()> {
        self.compile_expr(condition)?;
        let to_alternative = self.emit(Opcode::JumpNotTruthy, &[PLACEHOLDER])?;

        self.compile_branch(consequence)?;
        let to_end = self.emit(Opcode::Jump, &[PLACEHOLDER])?;

        let alternative_start = self.current_position();
        self.patch_jump(to_alternative, alternative_start)?;
        match alternative {
            Some(block) => self.compile_branch(block)?,
            None => {
                self.emit(Opcode::Null, &[])?;
            }
        }
        let end = self.current_position();
        self.patch_jump(to_end, end)
    }

    /// Compile an if-branch so that it leaves exactly one value on the stack.
    fn compile_branch(&mut self, block: &Block) -> CompileResult<()> {
        self.compile_block(block)?;
        if self.last_is(Opcode::Pop) {
            self.remove_last_pop();
        } else {
            self.emit(Opcode::Null, &[])?;
        }
        Ok(())
    }

    fn compile_function(&mut self, name: Option<&str>, params: &[String], body: &Block) -> CompileResult<()> {
        let span = self.span;
        self.enter_scope();
        if let Some(name) = name {
            self.symbols.define_function_name(name);
        }
        for param in params {
            self.symbols.define(param, true);
        }

        let result = self.compile_function_body(body);
        let num_locals = self.symbols.num_definitions();
        let (instructions, free) = self.leave_scope();
        self.span = span;
        result?;

        for symbol in &free {
            self.load(symbol)?;
        }
        let function = CompiledFunction {
            instructions: Instructions(instructions),
            num_locals,
            num_parameters: params.len(),
        };
        let index = self.add_constant(Value::CompiledFunction(Rc::new(function)));
        self.emit(Opcode::Closure, &[index, free.len()])?;
        Ok(())
    }

    fn compile_function_body(&mut self, body: &Block) -> CompileResult<()> {
        self.compile_block(body)?;
        if self.last_is(Opcode::Pop) {
            self.replace_last_pop_with_return();
        }
        if !self.last_is(Opcode::ReturnValue) {
            self.emit(Opcode::Return, &[])?;
        }
        Ok(())
    }
}

/// Opcode for a strict binary operator. `&&` and `||` have none.
fn infix_opcode(op: InfixOp) -> Option<Opcode> {
    Some(match op {
        InfixOp::Add => Opcode::Add,
        InfixOp::Subtract => Opcode::Sub,
        InfixOp::Multiply => Opcode::Mul,
        InfixOp::Divide => Opcode::Div,
        InfixOp::Power => Opcode::Pow,
        InfixOp::Modulo => Opcode::Mod,
        InfixOp::Equals => Opcode::Equal,
        InfixOp::NotEquals => Opcode::NotEqual,
        InfixOp::LessThan => Opcode::LessThan,
        InfixOp::GreaterThan => Opcode::GreaterThan,
        InfixOp::LessOrEqual => Opcode::LessEqual,
        InfixOp::GreaterOrEqual => Opcode::GreaterEqual,
        InfixOp::And | InfixOp::Or => return None,
    })
}
