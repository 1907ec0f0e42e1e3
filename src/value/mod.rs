use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::builtins::Builtin;
use crate::code::Instructions;

/// A runtime value. Collections are immutable and shared by reference count.
#[derive(Debug, Clone)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(Rc<str>),
    Null,
    Array(Rc<Vec<Value>>),
    Hash(Rc<BTreeMap<HashKey, Value>>),
    CompiledFunction(Rc<CompiledFunction>),
    Closure(Rc<Closure>),
    Builtin(&'static Builtin),
}

/// A function body produced by the compiler and stored in the constant pool.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    pub num_locals: usize,
    pub num_parameters: usize,
}

/// A compiled function paired with the values it captured when it was created.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub func: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

/// The subset of values usable as hash keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum HashKey {
    Integer(i64),
    Boolean(bool),
    String(Rc<str>),
}

impl HashKey {
    pub fn from_value(value: &Value) -> Option<HashKey> {
        match value {
            Value::Integer(n) => Some(HashKey::Integer(*n)),
            Value::Boolean(b) => Some(HashKey::Boolean(*b)),
            Value::String(s) => Some(HashKey::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            HashKey::Integer(n) => Value::Integer(*n),
            HashKey::Boolean(b) => Value::Boolean(*b),
            HashKey::String(s) => Value::String(s.clone()),
        }
    }
}

/// Numeric binary operators shared by the VM and the constant folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
}

impl ArithOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Pow => "^",
            ArithOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArithError {
    #[error("division by zero")]
    DivisionByZero,
    #[error("modulo by zero")]
    ModuloByZero,
    #[error("unsupported operand types for {op}: {left} and {right}")]
    Unsupported { op: &'static str, left: &'static str, right: &'static str },
}

/// Apply a numeric operator. Integers stay integers unless either side is a
/// float, in which case the result is a float.
pub fn arithmetic(op: ArithOp, left: &Value, right: &Value) -> Result<Value, ArithError> {
    match (left, right) {
        (Value::Integer(a), Value::Integer(b)) => integer_arithmetic(op, *a, *b),
        (Value::Integer(a), Value::Float(b)) => Ok(Value::Float(float_arithmetic(op, *a as f64, *b))),
        (Value::Float(a), Value::Integer(b)) => Ok(Value::Float(float_arithmetic(op, *a, *b as f64))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_arithmetic(op, *a, *b))),
        _ => Err(ArithError::Unsupported {
            op: op.symbol(),
            left: left.type_name(),
            right: right.type_name(),
        }),
    }
}

fn integer_arithmetic(op: ArithOp, a: i64, b: i64) -> Result<Value, ArithError> {
    Ok(match op {
        ArithOp::Add => Value::Integer(a.wrapping_add(b)),
        ArithOp::Sub => Value::Integer(a.wrapping_sub(b)),
        ArithOp::Mul => Value::Integer(a.wrapping_mul(b)),
        ArithOp::Div => {
            if b == 0 {
                return Err(ArithError::DivisionByZero);
            }
            Value::Integer(a.wrapping_div(b))
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(ArithError::ModuloByZero);
            }
            Value::Integer(a.wrapping_rem(b))
        }
        ArithOp::Pow => match u32::try_from(b) {
            Ok(exp) => Value::Integer(a.wrapping_pow(exp)),
            Err(_) => Value::Float((a as f64).powf(b as f64)),
        },
    })
}

fn float_arithmetic(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
        ArithOp::Pow => a.powf(b),
    }
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "INTEGER",
            Value::Float(_) => "FLOAT",
            Value::Boolean(_) => "BOOLEAN",
            Value::String(_) => "STRING",
            Value::Null => "NULL",
            Value::Array(_) => "ARRAY",
            Value::Hash(_) => "HASH",
            Value::CompiledFunction(_) => "COMPILED_FUNCTION",
            Value::Closure(_) => "CLOSURE",
            Value::Builtin(_) => "BUILTIN",
        }
    }

    /// Only `false` and `null` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Boolean(false) | Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    /// Ordering for `<`, `>`, `<=`, `>=`: numbers (with promotion) and strings.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }
}

impl PartialEq for Value {
    /// Structural equality; integers and floats compare numerically.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => (*a as f64) == *b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Hash(a), Value::Hash(b)) => a == b,
            (Value::CompiledFunction(a), Value::CompiledFunction(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            _ => false,
        }
    }
}

impl Value {
    /// Equality that also distinguishes `1` from `1.0`; used where the
    /// representation matters (constant pools, serialization round-trips).
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Integer(_), Value::Float(_)) | (Value::Float(_), Value::Integer(_)) => false,
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Null => write!(f, "null"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Hash(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k.to_value(), v)?;
                }
                write!(f, "}}")
            }
            Value::CompiledFunction(func) => write!(f, "<compiled fn/{}>", func.num_parameters),
            Value::Closure(c) => write!(f, "<closure/{}>", c.func.num_parameters),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_stays_integer() {
        assert!(arithmetic(ArithOp::Add, &Value::Integer(1), &Value::Integer(2))
            .unwrap()
            .same(&Value::Integer(3)));
        assert!(arithmetic(ArithOp::Div, &Value::Integer(7), &Value::Integer(2))
            .unwrap()
            .same(&Value::Integer(3)));
        assert!(arithmetic(ArithOp::Pow, &Value::Integer(2), &Value::Integer(10))
            .unwrap()
            .same(&Value::Integer(1024)));
        assert!(arithmetic(ArithOp::Mod, &Value::Integer(-7), &Value::Integer(3))
            .unwrap()
            .same(&Value::Integer(-1)));
    }

    #[test]
    fn float_operand_promotes() {
        let v = arithmetic(ArithOp::Add, &Value::Integer(1), &Value::Float(2.0)).unwrap();
        assert!(v.same(&Value::Float(3.0)));
        let v = arithmetic(ArithOp::Mul, &Value::Float(1.5), &Value::Integer(2)).unwrap();
        assert!(v.same(&Value::Float(3.0)));
    }

    #[test]
    fn negative_integer_exponent_goes_float() {
        let v = arithmetic(ArithOp::Pow, &Value::Integer(2), &Value::Integer(-1)).unwrap();
        assert!(v.same(&Value::Float(0.5)));
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        assert_eq!(
            arithmetic(ArithOp::Div, &Value::Integer(1), &Value::Integer(0)),
            Err(ArithError::DivisionByZero)
        );
        assert_eq!(
            arithmetic(ArithOp::Mod, &Value::Integer(1), &Value::Integer(0)),
            Err(ArithError::ModuloByZero)
        );
    }

    #[test]
    fn float_division_by_zero_is_infinite() {
        let v = arithmetic(ArithOp::Div, &Value::Float(1.0), &Value::Integer(0)).unwrap();
        assert!(v.same(&Value::Float(f64::INFINITY)));
    }

    #[test]
    fn arithmetic_on_strings_is_unsupported() {
        let err = arithmetic(ArithOp::Sub, &Value::string("a"), &Value::Integer(1)).unwrap_err();
        assert!(err.to_string().contains("STRING"));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
        assert!(Value::Integer(0).is_truthy());
        assert!(Value::string("").is_truthy());
    }

    #[test]
    fn same_distinguishes_int_and_float() {
        assert_eq!(Value::Integer(1), Value::Float(1.0));
        assert!(!Value::Integer(1).same(&Value::Float(1.0)));
    }

    #[test]
    fn display() {
        assert_eq!(Value::Float(3.0).to_string(), "3.0");
        assert_eq!(Value::array(vec![Value::Integer(1), Value::string("a")]).to_string(), "[1, a]");
        let mut map = BTreeMap::new();
        map.insert(HashKey::String("k".into()), Value::Boolean(true));
        assert_eq!(Value::Hash(Rc::new(map)).to_string(), "{k: true}");
    }

    #[test]
    fn compare_mixed_numbers() {
        use std::cmp::Ordering;
        assert_eq!(Value::Integer(1).compare(&Value::Float(1.5)), Some(Ordering::Less));
        assert_eq!(Value::string("b").compare(&Value::string("a")), Some(Ordering::Greater));
        assert_eq!(Value::Null.compare(&Value::Integer(1)), None);
    }
}
