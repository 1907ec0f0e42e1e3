use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Write;
use std::rc::Rc;

use tracing::debug;

use crate::builtins::{BUILTINS, GLOBAL_BUILTINS};
use crate::bytecode::Bytecode;
use crate::code::{DecodeError, Opcode, read_u16};
use crate::value::{self, ArithError, ArithOp, Closure, CompiledFunction, HashKey, Value};

mod frame;
pub use frame::Frame;

pub const STACK_SIZE: usize = 2048;
pub const MAX_FRAMES: usize = 1024;
/// Nesting limit for builtins calling back into zen code. Each level costs
/// native stack, so this sits well below `MAX_FRAMES`.
pub const MAX_REENTRY: usize = 32;

/// Global variable slots, shared between successive VMs (REPL) and forked views.
pub type Globals = Rc<RefCell<Vec<Value>>>;

pub fn new_globals() -> Globals {
    Rc::new(RefCell::new(Vec::new()))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("wrong number of arguments: want={expected}, got={got}")]
    ArityMismatch { expected: usize, got: usize },
    #[error("stack overflow")]
    StackOverflow,
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("index operator not supported: {left}[{index}]")]
    UnsupportedIndex { left: &'static str, index: &'static str },
    #[error("unusable as hash key: {type_name}")]
    UnusableHashKey { type_name: &'static str },
    #[error("unsupported operand types for {op}: {left} and {right}")]
    TypeMismatch { op: &'static str, left: &'static str, right: &'static str },
    #[error("unsupported operand type for {op}: {operand}")]
    UnsupportedOperand { op: &'static str, operand: &'static str },
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("calling non-function: {type_name}")]
    NotCallable { type_name: &'static str },
    #[error("unknown opcode: {op}")]
    UnknownOpcode { op: u8 },
    #[error("malformed instruction: {name}")]
    MalformedInstruction { name: &'static str },
    #[error("no {what} at index {index}")]
    BadOperand { what: &'static str, index: usize },
    #[error("{name}: {message}")]
    Builtin { name: &'static str, message: String },
}

type VmResult<T> = Result<T, VmError>;

impl From<DecodeError> for VmError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::UnknownOpcode { op } => VmError::UnknownOpcode { op },
            DecodeError::TruncatedOperand { name } => VmError::MalformedInstruction { name },
        }
    }
}

impl From<ArithError> for VmError {
    fn from(e: ArithError) -> Self {
        match e {
            ArithError::DivisionByZero => VmError::DivisionByZero,
            ArithError::ModuloByZero => VmError::ModuloByZero,
            ArithError::Unsupported { op, left, right } => VmError::TypeMismatch { op, left, right },
        }
    }
}

/// Where `print` writes.
#[derive(Debug, Clone, Default)]
pub enum Output {
    #[default]
    Stdout,
    Captured(String),
}

impl Output {
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            Output::Stdout => writeln!(std::io::stdout().lock(), "{}", line),
            Output::Captured(buf) => {
                buf.push_str(line);
                buf.push('\n');
                Ok(())
            }
        }
    }
}

pub struct Vm {
    constants: Rc<Vec<Value>>,
    globals: Globals,
    output: Rc<RefCell<Output>>,
    main: Rc<Closure>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    last_popped: Value,
    /// Frames held by the VMs this one was forked from.
    outer_depth: usize,
    /// How many `fork`s deep this view is.
    reentry: usize,
}

impl Vm {
    pub fn new(bytecode: &Bytecode) -> Self {
        Self::with_globals(bytecode, new_globals())
    }

    /// Run against an existing global store, e.g. one carried across REPL inputs.
    pub fn with_globals(bytecode: &Bytecode, globals: Globals) -> Self {
        let main = Rc::new(Closure {
            func: Rc::new(CompiledFunction {
                instructions: bytecode.instructions.clone(),
                num_locals: 0,
                num_parameters: 0,
            }),
            free: Vec::new(),
        });
        Vm {
            constants: Rc::new(bytecode.constants.clone()),
            globals,
            output: Rc::new(RefCell::new(Output::Stdout)),
            main,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            last_popped: Value::Null,
            outer_depth: 0,
            reentry: 0,
        }
    }

    /// Send `print` output to an in-memory buffer instead of stdout.
    pub fn capture_output(self) -> Self {
        *self.output.borrow_mut() = Output::Captured(String::new());
        self
    }

    pub fn captured_output(&self) -> Option<String> {
        match &*self.output.borrow() {
            Output::Captured(buf) => Some(buf.clone()),
            Output::Stdout => None,
        }
    }

    pub fn write_line(&self, line: &str) -> std::io::Result<()> {
        self.output.borrow_mut().write_line(line)
    }

    pub fn globals(&self) -> Globals {
        Rc::clone(&self.globals)
    }

    /// Value removed by the most recent `pop` instruction; `null` before any.
    pub fn last_popped(&self) -> &Value {
        &self.last_popped
    }

    /// A view sharing constants, globals and output with a fresh stack, for
    /// calling back into user code from a builtin.
    pub fn fork(&self) -> Vm {
        Vm {
            constants: Rc::clone(&self.constants),
            globals: Rc::clone(&self.globals),
            output: Rc::clone(&self.output),
            main: Rc::clone(&self.main),
            stack: Vec::new(),
            frames: Vec::new(),
            last_popped: Value::Null,
            outer_depth: self.outer_depth + self.frames.len(),
            reentry: self.reentry + 1,
        }
    }

    pub fn run(&mut self) -> VmResult<()> {
        debug!(
            target: "zen::vm",
            instructions = self.main.func.instructions.len(),
            constants = self.constants.len(),
            "run"
        );
        self.stack.clear();
        self.frames.clear();
        self.frames.push(Frame::new(Rc::clone(&self.main), 0));
        let result = self.execute(0);
        debug!(target: "zen::vm", ok = result.is_ok(), "finished");
        result
    }

    /// Call a closure or builtin to completion on this VM.
    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> VmResult<Value> {
        if self.reentry > MAX_REENTRY {
            return Err(VmError::StackOverflow);
        }
        match callee {
            Value::Builtin(builtin) => builtin.invoke(self, args),
            Value::Closure(closure) => {
                let depth = self.frames.len();
                self.push(callee.clone())?;
                for arg in args {
                    self.push(arg.clone())?;
                }
                self.call_closure(Rc::clone(closure), args.len())?;
                self.execute(depth)?;
                Ok(self.pop())
            }
            other => Err(VmError::NotCallable { type_name: other.type_name() }),
        }
    }

    // ── Stack ───────────────────────────────────────────────────────

    fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= STACK_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    fn pop_n(&mut self, n: usize) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }

    fn current_frame(&mut self) -> VmResult<&mut Frame> {
        self.frames.last_mut().ok_or(VmError::BadOperand { what: "frame", index: 0 })
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Run until the frame stack is back down to `stop_depth` frames.
    fn execute(&mut self, stop_depth: usize) -> VmResult<()> {
        while self.frames.len() > stop_depth {
            let frame = self.current_frame()?;
            let closure = Rc::clone(&frame.closure);
            let ip = frame.ip;
            let base = frame.base_pointer;
            let bytes = closure.func.instructions.as_bytes();

            if ip >= bytes.len() {
                self.return_from_frame(Value::Null)?;
                continue;
            }

            let op = Opcode::try_from(bytes[ip])?;
            let width = op.width();
            if ip + width > bytes.len() {
                return Err(VmError::MalformedInstruction { name: op.name() });
            }
            let operand = if width >= 3 { read_u16(bytes, ip + 1) } else { 0 };
            self.current_frame()?.ip = ip + width;

            match op {
                Opcode::Constant => {
                    let value = self
                        .constants
                        .get(operand)
                        .cloned()
                        .ok_or(VmError::BadOperand { what: "constant", index: operand })?;
                    self.push(value)?;
                }
                Opcode::Pop => {
                    self.last_popped = self.pop();
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Pow | Opcode::Mod => {
                    let right = self.pop();
                    let left = self.pop();
                    let result = binary_operation(op, &left, &right)?;
                    self.push(result)?;
                }
                Opcode::True => self.push(Value::Boolean(true))?,
                Opcode::False => self.push(Value::Boolean(false))?,
                Opcode::Null => self.push(Value::Null)?,
                Opcode::Equal | Opcode::NotEqual => {
                    let right = self.pop();
                    let left = self.pop();
                    let equal = left == right;
                    self.push(Value::Boolean(if op == Opcode::Equal { equal } else { !equal }))?;
                }
                Opcode::GreaterThan | Opcode::GreaterEqual | Opcode::LessThan | Opcode::LessEqual => {
                    let right = self.pop();
                    let left = self.pop();
                    let result = comparison(op, &left, &right)?;
                    self.push(Value::Boolean(result))?;
                }
                Opcode::Minus => {
                    let result = match self.pop() {
                        Value::Integer(n) => Value::Integer(n.wrapping_neg()),
                        Value::Float(n) => Value::Float(-n),
                        other => return Err(VmError::UnsupportedOperand { op: "-", operand: other.type_name() }),
                    };
                    self.push(result)?;
                }
                Opcode::Bang => {
                    let value = self.pop();
                    self.push(Value::Boolean(!value.is_truthy()))?;
                }
                Opcode::JumpNotTruthy => {
                    if !self.pop().is_truthy() {
                        self.current_frame()?.ip = operand;
                    }
                }
                Opcode::Jump => {
                    self.current_frame()?.ip = operand;
                }
                Opcode::GetGlobal => {
                    let value = self.globals.borrow().get(operand).cloned().unwrap_or(Value::Null);
                    self.push(value)?;
                }
                Opcode::SetGlobal => {
                    let value = self.pop();
                    let mut globals = self.globals.borrow_mut();
                    if globals.len() <= operand {
                        globals.resize(operand + 1, Value::Null);
                    }
                    globals[operand] = value;
                }
                Opcode::GetLocal => {
                    let value = self
                        .stack
                        .get(base + operand)
                        .cloned()
                        .ok_or(VmError::BadOperand { what: "local", index: operand })?;
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let value = self.pop();
                    let slot = self
                        .stack
                        .get_mut(base + operand)
                        .ok_or(VmError::BadOperand { what: "local", index: operand })?;
                    *slot = value;
                }
                Opcode::GetFree => {
                    let value = closure
                        .free
                        .get(operand)
                        .cloned()
                        .ok_or(VmError::BadOperand { what: "free variable", index: operand })?;
                    self.push(value)?;
                }
                Opcode::GetBuiltin => {
                    let builtin = BUILTINS.get(operand).ok_or(VmError::BadOperand { what: "builtin", index: operand })?;
                    self.push(Value::Builtin(builtin))?;
                }
                Opcode::GetGlobalBuiltin => {
                    let builtin = GLOBAL_BUILTINS
                        .get(operand)
                        .ok_or(VmError::BadOperand { what: "global builtin", index: operand })?;
                    self.push(Value::Builtin(builtin))?;
                }
                Opcode::CurrentClosure => {
                    self.push(Value::Closure(Rc::clone(&closure)))?;
                }
                Opcode::Array => {
                    let items = self.pop_n(operand);
                    self.push(Value::array(items))?;
                }
                Opcode::Hash => {
                    let items = self.pop_n(operand);
                    let hash = build_hash(items)?;
                    self.push(hash)?;
                }
                Opcode::Index => {
                    let index = self.pop();
                    let left = self.pop();
                    let value = index_value(&left, &index)?;
                    self.push(value)?;
                }
                Opcode::SetIndex => {
                    let value = self.pop();
                    let key = self.pop();
                    let collection = self.pop();
                    let updated = set_index(collection, key, value)?;
                    self.push(updated)?;
                }
                Opcode::Call => self.call(operand)?,
                Opcode::ReturnValue => {
                    let value = self.pop();
                    self.return_from_frame(value)?;
                }
                Opcode::Return => self.return_from_frame(Value::Null)?,
                Opcode::Closure => {
                    let num_free = read_u16(bytes, ip + 3);
                    let func = match self.constants.get(operand) {
                        Some(Value::CompiledFunction(func)) => Rc::clone(func),
                        _ => return Err(VmError::BadOperand { what: "function constant", index: operand }),
                    };
                    let free = self.pop_n(num_free);
                    self.push(Value::Closure(Rc::new(Closure { func, free })))?;
                }
                Opcode::LoopEnd => {}
            }
        }
        Ok(())
    }

    fn call(&mut self, num_args: usize) -> VmResult<()> {
        let callee_index = self
            .stack
            .len()
            .checked_sub(num_args + 1)
            .ok_or(VmError::BadOperand { what: "callee", index: num_args })?;
        match self.stack[callee_index].clone() {
            Value::Closure(closure) => self.call_closure(closure, num_args),
            Value::Builtin(builtin) => {
                let args = self.pop_n(num_args);
                self.pop();
                let result = builtin.invoke(self, &args)?;
                self.push(result)
            }
            other => Err(VmError::NotCallable { type_name: other.type_name() }),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, num_args: usize) -> VmResult<()> {
        if closure.func.num_parameters != num_args {
            return Err(VmError::ArityMismatch { expected: closure.func.num_parameters, got: num_args });
        }
        if self.outer_depth + self.frames.len() >= MAX_FRAMES {
            return Err(VmError::StackOverflow);
        }
        let base_pointer = self.stack.len() - num_args;
        let top = base_pointer + closure.func.num_locals;
        if top > STACK_SIZE {
            return Err(VmError::StackOverflow);
        }
        // Locals past the arguments start out null.
        if top > self.stack.len() {
            self.stack.resize(top, Value::Null);
        }
        self.frames.push(Frame::new(closure, base_pointer));
        Ok(())
    }

    fn return_from_frame(&mut self, value: Value) -> VmResult<()> {
        let Some(frame) = self.frames.pop() else { return Ok(()) };
        // Drop the callee slot as well as the arguments and locals.
        self.stack.truncate(frame.base_pointer.saturating_sub(1));
        if !self.frames.is_empty() || frame.base_pointer > 0 {
            self.push(value)?;
        }
        Ok(())
    }
}

fn binary_operation(op: Opcode, left: &Value, right: &Value) -> VmResult<Value> {
    let arith = match op {
        Opcode::Add => ArithOp::Add,
        Opcode::Sub => ArithOp::Sub,
        Opcode::Mul => ArithOp::Mul,
        Opcode::Div => ArithOp::Div,
        Opcode::Pow => ArithOp::Pow,
        _ => ArithOp::Mod,
    };
    if let (ArithOp::Add, Value::String(a), Value::String(b)) = (arith, left, right) {
        let mut joined = String::with_capacity(a.len() + b.len());
        joined.push_str(a);
        joined.push_str(b);
        return Ok(Value::string(joined));
    }
    Ok(value::arithmetic(arith, left, right)?)
}

fn comparison(op: Opcode, left: &Value, right: &Value) -> VmResult<bool> {
    let symbol = match op {
        Opcode::GreaterThan => ">",
        Opcode::GreaterEqual => ">=",
        Opcode::LessThan => "<",
        _ => "<=",
    };
    let ordering = left.compare(right).ok_or(VmError::TypeMismatch {
        op: symbol,
        left: left.type_name(),
        right: right.type_name(),
    })?;
    Ok(match op {
        Opcode::GreaterThan => ordering.is_gt(),
        Opcode::GreaterEqual => ordering.is_ge(),
        Opcode::LessThan => ordering.is_lt(),
        _ => ordering.is_le(),
    })
}

fn hash_key(value: &Value) -> VmResult<HashKey> {
    HashKey::from_value(value).ok_or(VmError::UnusableHashKey { type_name: value.type_name() })
}

fn build_hash(items: Vec<Value>) -> VmResult<Value> {
    let mut map = BTreeMap::new();
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        map.insert(hash_key(&key)?, value);
    }
    Ok(Value::Hash(Rc::new(map)))
}

fn array_position(index: i64, len: usize) -> VmResult<usize> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < len)
        .ok_or(VmError::IndexOutOfBounds { index, len })
}

fn index_value(left: &Value, index: &Value) -> VmResult<Value> {
    match (left, index) {
        (Value::Array(items), Value::Integer(i)) => Ok(items[array_position(*i, items.len())?].clone()),
        (Value::Hash(map), key) => Ok(map.get(&hash_key(key)?).cloned().unwrap_or(Value::Null)),
        _ => Err(VmError::UnsupportedIndex { left: left.type_name(), index: index.type_name() }),
    }
}

/// Collections are immutable values: assignment through an index builds a
/// new collection.
fn set_index(collection: Value, key: Value, value: Value) -> VmResult<Value> {
    match (collection, &key) {
        (Value::Array(items), Value::Integer(i)) => {
            let position = array_position(*i, items.len())?;
            let mut items = Rc::unwrap_or_clone(items);
            items[position] = value;
            Ok(Value::array(items))
        }
        (Value::Hash(map), key) => {
            let key = hash_key(key)?;
            let mut map = Rc::unwrap_or_clone(map);
            map.insert(key, value);
            Ok(Value::Hash(Rc::new(map)))
        }
        (other, key) => Err(VmError::UnsupportedIndex { left: other.type_name(), index: key.type_name() }),
    }
}
