//! Compiler output: a top-level instruction stream and its constant pool.

use crate::code::{Instructions, Opcode, format_instruction};
use crate::value::Value;

pub mod serialize;
pub use serialize::{DecodeError, EncodeError, deserialize, serialize};

#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Value>,
}

impl Bytecode {
    pub fn new(instructions: Instructions, constants: Vec<Value>) -> Self {
        Bytecode { instructions, constants }
    }

    /// Identical instructions and constants, where `1` and `1.0` differ.
    pub fn same(&self, other: &Bytecode) -> bool {
        self.instructions == other.instructions
            && self.constants.len() == other.constants.len()
            && self.constants.iter().zip(&other.constants).all(|(a, b)| a.same(b))
    }

    /// Text listing of the program. The body of each function is printed,
    /// indented one level per nesting depth, right before the closure
    /// instruction that creates it.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_stream(&self.instructions, 0, &mut out);
        out
    }

    fn disassemble_stream(&self, instructions: &Instructions, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        let decoded = match instructions.decode() {
            Ok(d) => d,
            Err(e) => {
                out.push_str(&format!("{indent}ERROR: {e}\n"));
                return;
            }
        };
        for (offset, op, operands) in decoded {
            if op == Opcode::Closure {
                if let Some(Value::CompiledFunction(func)) = self.constants.get(operands[0]) {
                    out.push_str(&format!(
                        "{indent}  fn#{} params={} locals={}:\n",
                        operands[0], func.num_parameters, func.num_locals
                    ));
                    self.disassemble_stream(&func.instructions, depth + 1, out);
                }
            }
            out.push_str(&indent);
            out.push_str(&format_instruction(offset, op, &operands));
            out.push('\n');
        }
    }

    /// Every instruction stream in the program: the top level first, then
    /// each compiled function in constant-pool order.
    pub fn streams(&self) -> impl Iterator<Item = &Instructions> {
        std::iter::once(&self.instructions).chain(self.constants.iter().filter_map(|c| match c {
            Value::CompiledFunction(f) => Some(&f.instructions),
            _ => None,
        }))
    }
}
