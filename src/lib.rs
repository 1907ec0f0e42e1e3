//! zen: a bytecode compiler, optimizer and stack VM for a small dynamic
//! scripting language.
//!
//! The pipeline is `lexer` -> `parser` -> `compiler` -> `optimizer` -> `vm`.
//! Compiled programs can be written to and read back from the `ZENB` binary
//! format in `bytecode`.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod code;
pub mod compiler;
pub mod diagnostic;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod value;
pub mod vm;

use ast::Program;
use bytecode::Bytecode;
use value::Value;

/// Any failure along the source-to-result pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] lexer::LexError),
    #[error(transparent)]
    Parse(#[from] parser::ParseError),
    #[error(transparent)]
    Compile(#[from] compiler::CompileError),
    #[error(transparent)]
    Runtime(#[from] vm::VmError),
    #[error(transparent)]
    Decode(#[from] bytecode::DecodeError),
    #[error(transparent)]
    Encode(#[from] bytecode::EncodeError),
}

pub fn parse_source(source: &str) -> Result<Program, Error> {
    let tokens = lexer::lex(source)?;
    let mut program = parser::parse(tokens)?;
    program.source = Some(source.to_string());
    Ok(program)
}

/// Compile without optimizing.
pub fn compile_source(file: &str, source: &str) -> Result<Bytecode, Error> {
    let program = parse_source(source)?;
    let mut compiler = compiler::Compiler::new(file);
    compiler.compile(&program)?;
    Ok(compiler.bytecode())
}

/// Compile, optimize with the default number of rounds and run; returns the
/// value of the last expression statement.
pub fn run_source(file: &str, source: &str) -> Result<Value, Error> {
    let bytecode = optimizer::optimize(&compile_source(file, source)?);
    let mut vm = vm::Vm::new(&bytecode);
    vm.run()?;
    Ok(vm.last_popped().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_source_returns_last_value() {
        let v = run_source("t.zen", "var a = 2; var b = a * 21; b").unwrap();
        assert!(v.same(&Value::Integer(42)));
    }

    #[test]
    fn errors_keep_their_stage() {
        assert!(matches!(run_source("t.zen", "var a = #"), Err(Error::Lex(_))));
        assert!(matches!(run_source("t.zen", "var = 1"), Err(Error::Parse(_))));
        assert!(matches!(run_source("t.zen", "nope"), Err(Error::Compile(_))));
        assert!(matches!(run_source("t.zen", "1 / 0"), Err(Error::Runtime(vm::VmError::DivisionByZero))));
    }

    #[test]
    fn compile_error_display_names_file() {
        let err = compile_source("main.zen", "const x = 1; x = 2").unwrap_err();
        assert_eq!(err.to_string(), "main.zen: cannot assign to constant 'x'");
    }
}
