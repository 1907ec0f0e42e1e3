//! Host functions callable from zen code.
//!
//! Two tables, matching the two calling conventions: `BUILTINS` is addressed
//! by `OpGetBuiltin` (plain names like `len`), `GLOBAL_BUILTINS` by
//! `OpGetGlobalBuiltin` (namespaced names like `math.abs`).

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::value::{HashKey, Value};
use crate::vm::{Vm, VmError};

pub type BuiltinFn = fn(&Vm, &[Value]) -> Result<Value, VmError>;

pub struct Builtin {
    pub name: &'static str,
    /// `None` for variadic builtins.
    pub arity: Option<usize>,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

impl Builtin {
    /// Check the argument count, then run. Both the `OpCall` path and
    /// callbacks from `map`/`filter` come through here.
    pub fn invoke(&self, vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
        if let Some(expected) = self.arity.filter(|&n| n != args.len()) {
            return Err(VmError::ArityMismatch { expected, got: args.len() });
        }
        (self.func)(vm, args)
    }
}

const fn builtin(name: &'static str, arity: usize, func: BuiltinFn) -> Builtin {
    Builtin { name, arity: Some(arity), func }
}

pub static BUILTINS: &[Builtin] = &[
    builtin("len", 1, len),
    Builtin { name: "print", arity: None, func: print },
    builtin("first", 1, first),
    builtin("last", 1, last),
    builtin("rest", 1, rest),
    builtin("push", 2, push),
    builtin("type", 1, type_of),
    builtin("str", 1, to_str),
    builtin("map", 2, map),
    builtin("filter", 2, filter),
];

pub static GLOBAL_BUILTINS: &[Builtin] = &[
    builtin("math.abs", 1, math_abs),
    builtin("math.max", 2, math_max),
    builtin("math.min", 2, math_min),
    builtin("math.sqrt", 1, math_sqrt),
    builtin("math.floor", 1, math_floor),
    builtin("math.random", 2, math_random),
    builtin("string.upper", 1, string_upper),
    builtin("string.lower", 1, string_lower),
    builtin("string.split", 2, string_split),
    builtin("string.join", 2, string_join),
    builtin("string.match", 2, string_match),
    builtin("json.encode", 1, json_encode),
    builtin("json.decode", 1, json_decode),
];

/// Slot of `namespace.name` in `GLOBAL_BUILTINS`.
pub fn lookup_global(namespace: &str, name: &str) -> Option<usize> {
    GLOBAL_BUILTINS.iter().position(|b| {
        b.name
            .split_once('.')
            .is_some_and(|(ns, n)| ns == namespace && n == name)
    })
}

pub fn is_namespace(name: &str) -> bool {
    GLOBAL_BUILTINS
        .iter()
        .any(|b| b.name.split_once('.').is_some_and(|(ns, _)| ns == name))
}

fn fail(name: &'static str, message: impl Into<String>) -> VmError {
    VmError::Builtin { name, message: message.into() }
}

fn wrong_type(name: &'static str, want: &str, got: &Value) -> VmError {
    fail(name, format!("expected {}, got {}", want, got.type_name()))
}

fn array_arg<'a>(name: &'static str, value: &'a Value) -> Result<&'a [Value], VmError> {
    match value {
        Value::Array(items) => Ok(items.as_slice()),
        other => Err(wrong_type(name, "ARRAY", other)),
    }
}

fn string_arg<'a>(name: &'static str, value: &'a Value) -> Result<&'a str, VmError> {
    match value {
        Value::String(s) => Ok(&**s),
        other => Err(wrong_type(name, "STRING", other)),
    }
}

// ── Local builtins ──────────────────────────────────────────────────

fn len(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let n = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Hash(map) => map.len(),
        other => return Err(wrong_type("len", "STRING, ARRAY or HASH", other)),
    };
    Ok(Value::Integer(n as i64))
}

fn print(vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let line = args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(" ");
    vm.write_line(&line).map_err(|e| fail("print", e.to_string()))?;
    Ok(Value::Null)
}

fn first(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    Ok(array_arg("first", &args[0])?.first().cloned().unwrap_or(Value::Null))
}

fn last(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    Ok(array_arg("last", &args[0])?.last().cloned().unwrap_or(Value::Null))
}

fn rest(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    match array_arg("rest", &args[0])? {
        [] => Ok(Value::Null),
        [_, tail @ ..] => Ok(Value::array(tail.to_vec())),
    }
}

fn push(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let mut items = array_arg("push", &args[0])?.to_vec();
    items.push(args[1].clone());
    Ok(Value::array(items))
}

fn type_of(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::string(args[0].type_name()))
}

fn to_str(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::string(args[0].to_string()))
}

fn map(vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let items = array_arg("map", &args[0])?;
    let mut view = vm.fork();
    let mapped = items
        .iter()
        .map(|item| view.call_value(&args[1], std::slice::from_ref(item)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::array(mapped))
}

fn filter(vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let items = array_arg("filter", &args[0])?;
    let mut view = vm.fork();
    let mut kept = Vec::new();
    for item in items {
        if view.call_value(&args[1], std::slice::from_ref(item))?.is_truthy() {
            kept.push(item.clone());
        }
    }
    Ok(Value::array(kept))
}

// ── math ────────────────────────────────────────────────────────────

fn math_abs(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    match &args[0] {
        Value::Integer(n) => Ok(Value::Integer(n.wrapping_abs())),
        Value::Float(n) => Ok(Value::Float(n.abs())),
        other => Err(wrong_type("math.abs", "number", other)),
    }
}

fn pick(name: &'static str, args: &[Value], want_greater: bool) -> Result<Value, VmError> {
    let (a, b) = (&args[0], &args[1]);
    if !a.is_numeric() || !b.is_numeric() {
        let bad = if a.is_numeric() { b } else { a };
        return Err(wrong_type(name, "number", bad));
    }
    let a_wins = a.compare(b).is_some_and(|o| if want_greater { o.is_ge() } else { o.is_le() });
    Ok(if a_wins { a.clone() } else { b.clone() })
}

fn math_max(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    pick("math.max", args, true)
}

fn math_min(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    pick("math.min", args, false)
}

fn math_sqrt(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    match &args[0] {
        Value::Integer(n) => Ok(Value::Float((*n as f64).sqrt())),
        Value::Float(n) => Ok(Value::Float(n.sqrt())),
        other => Err(wrong_type("math.sqrt", "number", other)),
    }
}

fn math_floor(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    match &args[0] {
        Value::Integer(n) => Ok(Value::Integer(*n)),
        Value::Float(n) => Ok(Value::Integer(n.floor() as i64)),
        other => Err(wrong_type("math.floor", "number", other)),
    }
}

fn math_random(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    match (&args[0], &args[1]) {
        (Value::Integer(lo), Value::Integer(hi)) if lo < hi => Ok(Value::Integer(fastrand::i64(*lo..*hi))),
        (Value::Integer(lo), Value::Integer(hi)) => {
            Err(fail("math.random", format!("empty range {}..{}", lo, hi)))
        }
        (Value::Integer(_), other) | (other, _) => Err(wrong_type("math.random", "INTEGER", other)),
    }
}

// ── string ──────────────────────────────────────────────────────────

fn string_upper(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::string(string_arg("string.upper", &args[0])?.to_uppercase()))
}

fn string_lower(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::string(string_arg("string.lower", &args[0])?.to_lowercase()))
}

fn string_split(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let text = string_arg("string.split", &args[0])?;
    let sep = string_arg("string.split", &args[1])?;
    let parts: Vec<Value> = if sep.is_empty() {
        text.chars().map(|c| Value::string(c.to_string())).collect()
    } else {
        text.split(sep).map(Value::string).collect()
    };
    Ok(Value::array(parts))
}

fn string_join(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let items = array_arg("string.join", &args[0])?;
    let sep = string_arg("string.join", &args[1])?;
    let joined = items.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(sep);
    Ok(Value::string(joined))
}

/// `string.match(text, pattern)`: the groups of the first match, whole match
/// first, or `null` when nothing matches.
fn string_match(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let text = string_arg("string.match", &args[0])?;
    let pattern = string_arg("string.match", &args[1])?;
    let re = regex::Regex::new(pattern).map_err(|e| fail("string.match", e.to_string()))?;
    Ok(match re.captures(text) {
        Some(caps) => Value::array(
            caps.iter()
                .map(|group| group.map_or(Value::Null, |m| Value::string(m.as_str())))
                .collect(),
        ),
        None => Value::Null,
    })
}

// ── json ────────────────────────────────────────────────────────────

fn to_json(value: &Value) -> Result<serde_json::Value, VmError> {
    use serde_json::Value as Json;
    Ok(match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(n) => Json::from(*n),
        Value::Float(n) => serde_json::Number::from_f64(*n).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(s.to_string()),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect::<Result<_, _>>()?),
        Value::Hash(map) => {
            let mut object = serde_json::Map::new();
            for (key, v) in map.iter() {
                let key = match key {
                    HashKey::String(s) => s.to_string(),
                    other => other.to_value().to_string(),
                };
                object.insert(key, to_json(v)?);
            }
            Json::Object(object)
        }
        other => return Err(wrong_type("json.encode", "data value", other)),
    })
}

fn from_json(json: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Boolean(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::string(s),
        Json::Array(items) => Value::array(items.into_iter().map(from_json).collect()),
        Json::Object(object) => {
            let map: BTreeMap<HashKey, Value> = object
                .into_iter()
                .map(|(k, v)| (HashKey::String(Rc::from(k)), from_json(v)))
                .collect();
            Value::Hash(Rc::new(map))
        }
    }
}

fn json_encode(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let json = to_json(&args[0])?;
    let text = serde_json::to_string(&json).map_err(|e| fail("json.encode", e.to_string()))?;
    Ok(Value::string(text))
}

fn json_decode(_vm: &Vm, args: &[Value]) -> Result<Value, VmError> {
    let text = string_arg("json.decode", &args[0])?;
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| fail("json.decode", e.to_string()))?;
    Ok(from_json(json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Bytecode;
    use crate::compiler::Compiler;

    fn run(source: &str) -> Result<Value, VmError> {
        let tokens = crate::lexer::lex(source).unwrap();
        let program = crate::parser::parse(tokens).unwrap();
        let mut compiler = Compiler::new("test.zen");
        compiler.compile(&program).unwrap();
        let mut vm = Vm::new(&compiler.bytecode()).capture_output();
        vm.run()?;
        Ok(vm.last_popped().clone())
    }

    fn show(source: &str) -> String {
        run(source).unwrap().to_string()
    }

    #[test]
    fn namespace_lookup() {
        assert_eq!(lookup_global("math", "abs"), Some(0));
        assert!(lookup_global("string", "join").is_some());
        assert_eq!(lookup_global("math", "nope"), None);
        assert!(is_namespace("json"));
        assert!(!is_namespace("len"));
    }

    #[test]
    fn collection_builtins() {
        assert_eq!(show("len(\"héllo\")"), "5");
        assert_eq!(show("len([1, 2, 3])"), "3");
        assert_eq!(show("len({1: 2})"), "1");
        assert_eq!(show("first([7, 8])"), "7");
        assert_eq!(show("last([7, 8])"), "8");
        assert_eq!(show("first([])"), "null");
        assert_eq!(show("rest([1, 2, 3])"), "[2, 3]");
        assert_eq!(show("rest([])"), "null");
        assert_eq!(show("var a = [1]; var b = push(a, 2); [a, b]"), "[[1], [1, 2]]");
        assert_eq!(show("type(1.5)"), "FLOAT");
        assert_eq!(show("str(12) + \"!\""), "12!");
    }

    #[test]
    fn higher_order_builtins_call_closures() {
        assert_eq!(show("var k = 10; map([1, 2, 3], func(x) { x * k })"), "[10, 20, 30]");
        assert_eq!(show("filter([1, 2, 3, 4], func(x) { x % 2 == 0 })"), "[2, 4]");
        assert_eq!(show("map([[1], [2, 3]], len)"), "[1, 2]");
        assert_eq!(show("map([1, 2], func(x) { map([x], func(y) { y + 1 }) })"), "[[2], [3]]");
    }

    #[test]
    fn closure_errors_propagate_out_of_map() {
        assert_eq!(run("map([0], func(x) { 1 / x })").unwrap_err(), VmError::DivisionByZero);
    }

    #[test]
    fn builtin_callbacks_are_arity_checked() {
        let wrong = VmError::ArityMismatch { expected: 2, got: 1 };
        assert_eq!(run("filter([1], math.max)").unwrap_err(), wrong);
        assert_eq!(run("map([[1]], push)").unwrap_err(), wrong);
        assert_eq!(run("map([\"a b\"], string.split)").unwrap_err(), wrong);
        assert_eq!(show("map([1, 2], print)"), "[null, null]");
    }

    #[test]
    fn unbounded_reentry_overflows_cleanly() {
        assert_eq!(run("func f(n) { map([n], f) } f(0)").unwrap_err(), VmError::StackOverflow);
        assert_eq!(run("func g(n) { filter([n], g) } g(0)").unwrap_err(), VmError::StackOverflow);
    }

    #[test]
    fn math_builtins() {
        assert_eq!(show("math.abs(-3)"), "3");
        assert_eq!(show("math.max(2, 3.5)"), "3.5");
        assert_eq!(show("math.min(2, 3.5)"), "2");
        assert_eq!(show("math.sqrt(16)"), "4.0");
        assert_eq!(show("math.floor(2.7)"), "2");
        assert_eq!(show("var r = math.random(5, 6); r"), "5");
        assert!(matches!(run("math.random(3, 3)"), Err(VmError::Builtin { name: "math.random", .. })));
    }

    #[test]
    fn string_builtins() {
        assert_eq!(show("string.upper(\"abc\")"), "ABC");
        assert_eq!(show("string.lower(\"ABC\")"), "abc");
        assert_eq!(show("string.split(\"a,b,c\", \",\")"), "[a, b, c]");
        assert_eq!(show("string.join([1, \"x\", true], \"-\")"), "1-x-true");
        assert_eq!(show("string.match(\"key=42\", \"(\\\\w+)=(\\\\d+)\")"), "[key=42, key, 42]");
        assert_eq!(show("string.match(\"nothing\", \"\\\\d\")"), "null");
    }

    #[test]
    fn json_builtins() {
        assert_eq!(show("json.encode({\"a\": [1, 2.5, null]})"), "{\"a\":[1,2.5,null]}");
        assert_eq!(show("json.decode(\"[1, 2.5, true]\")"), "[1, 2.5, true]");
        assert_eq!(show("json.decode(\"{\\\"x\\\": 1}\").x"), "1");
        assert!(matches!(run("json.encode(len)"), Err(VmError::Builtin { name: "json.encode", .. })));
        assert!(matches!(run("json.decode(\"{\")"), Err(VmError::Builtin { name: "json.decode", .. })));
    }

    #[test]
    fn type_errors_name_the_builtin() {
        assert_eq!(
            run("len(1)").unwrap_err(),
            VmError::Builtin { name: "len", message: "expected STRING, ARRAY or HASH, got INTEGER".into() }
        );
    }

    #[test]
    fn print_writes_to_vm_output() {
        let program = crate::parser::parse(crate::lexer::lex("print(1, \"two\", [3])").unwrap()).unwrap();
        let mut compiler = Compiler::new("test.zen");
        compiler.compile(&program).unwrap();
        let bytecode: Bytecode = compiler.bytecode();
        let mut vm = Vm::new(&bytecode).capture_output();
        vm.run().unwrap();
        assert_eq!(vm.captured_output().as_deref(), Some("1 two [3]\n"));
        assert_eq!(vm.last_popped().to_string(), "null");
    }
}
