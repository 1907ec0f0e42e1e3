//! The instruction set: opcodes, operand layout, encoding and decoding.
//!
//! Every instruction is one opcode byte followed by zero or more big-endian
//! operands whose widths are fixed per opcode. Jump operands are absolute
//! byte offsets into the same instruction stream.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An encoded instruction stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructions(pub Vec<u8>);

impl Instructions {
    pub fn new() -> Self {
        Instructions(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode the stream into `(offset, opcode, operands)` triples.
    pub fn decode(&self) -> Result<Vec<(usize, Opcode, Vec<usize>)>, DecodeError> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.0.len() {
            let op = Opcode::try_from(self.0[offset])?;
            let (operands, read) = read_operands(op, &self.0[offset + 1..])?;
            out.push((offset, op, operands));
            offset += 1 + read;
        }
        Ok(out)
    }
}

impl From<Vec<u8>> for Instructions {
    fn from(bytes: Vec<u8>) -> Self {
        Instructions(bytes)
    }
}

impl fmt::Display for Instructions {
    /// One `<offset> <name> <operands...>` line per instruction.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decoded = match self.decode() {
            Ok(d) => d,
            Err(e) => return writeln!(f, "ERROR: {}", e),
        };
        for (offset, op, operands) in decoded {
            writeln!(f, "{}", format_instruction(offset, op, &operands))?;
        }
        Ok(())
    }
}

pub fn format_instruction(offset: usize, op: Opcode, operands: &[usize]) -> String {
    let mut line = format!("{:04} {}", offset, op.name());
    for operand in operands {
        line.push(' ');
        line.push_str(&operand.to_string());
    }
    line
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown opcode: {op}")]
    UnknownOpcode { op: u8 },
    #[error("truncated operand for {name}")]
    TruncatedOperand { name: &'static str },
}

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $variant:ident = $byte:literal, $name:literal, [$($width:literal),*]; )*) => {
        /// An 8-bit operation tag understood by the VM.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $( $(#[$doc])* $variant = $byte, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),*];

            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$variant => $name, )*
                }
            }

            /// Byte width of each operand, in order.
            pub fn operand_widths(self) -> &'static [usize] {
                match self {
                    $( Opcode::$variant => &[$($width),*], )*
                }
            }
        }

        impl TryFrom<u8> for Opcode {
            type Error = DecodeError;

            fn try_from(byte: u8) -> Result<Self, DecodeError> {
                match byte {
                    $( $byte => Ok(Opcode::$variant), )*
                    op => Err(DecodeError::UnknownOpcode { op }),
                }
            }
        }
    };
}

opcodes! {
    /// Push `constants[idx]`.
    Constant = 0, "OpConstant", [2];
    Pop = 1, "OpPop", [];
    Add = 2, "OpAdd", [];
    Sub = 3, "OpSub", [];
    Mul = 4, "OpMul", [];
    Div = 5, "OpDiv", [];
    Pow = 6, "OpPow", [];
    Mod = 7, "OpMod", [];
    True = 8, "OpTrue", [];
    False = 9, "OpFalse", [];
    Null = 10, "OpNull", [];
    Equal = 11, "OpEqual", [];
    NotEqual = 12, "OpNotEqual", [];
    GreaterThan = 13, "OpGreaterThan", [];
    GreaterEqual = 14, "OpGreaterEqual", [];
    LessThan = 15, "OpLessThan", [];
    LessEqual = 16, "OpLessEqual", [];
    Minus = 17, "OpMinus", [];
    Bang = 18, "OpBang", [];
    /// Pop the condition; jump to the absolute offset when it is falsy.
    JumpNotTruthy = 19, "OpJumpNotTruthy", [2];
    Jump = 20, "OpJump", [2];
    GetGlobal = 21, "OpGetGlobal", [2];
    SetGlobal = 22, "OpSetGlobal", [2];
    GetLocal = 23, "OpGetLocal", [2];
    SetLocal = 24, "OpSetLocal", [2];
    GetFree = 25, "OpGetFree", [2];
    /// Push a local builtin by slot.
    GetBuiltin = 26, "OpGetBuiltin", [2];
    /// Push a namespaced builtin (`math.abs`) by slot.
    GetGlobalBuiltin = 27, "OpGetGlobalBuiltin", [2];
    /// Push the closure of the running frame (recursion through the function's own name).
    CurrentClosure = 28, "OpCurrentClosure", [];
    /// Build an array from the top `n` stack values.
    Array = 29, "OpArray", [2];
    /// Build a hash from the top `n` stack values (`n` = 2 * pairs).
    Hash = 30, "OpHash", [2];
    Index = 31, "OpIndex", [];
    /// `[collection, key, value] -> [updated collection]`
    SetIndex = 32, "OpSetIndex", [];
    /// Call the value below the top `n` arguments.
    Call = 33, "OpCall", [2];
    ReturnValue = 34, "OpReturnValue", [];
    Return = 35, "OpReturn", [];
    /// Operands: function constant index, number of captured values on the stack.
    Closure = 36, "OpClosure", [2, 2];
    /// Marks the exit of a loop; no runtime effect.
    LoopEnd = 37, "OpLoopEnd", [];
}

impl Opcode {
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpNotTruthy)
    }

    /// Total encoded width: opcode byte plus operands.
    pub fn width(self) -> usize {
        1 + self.operand_widths().iter().sum::<usize>()
    }
}

/// Encode one instruction. Operands beyond the opcode's layout are ignored.
pub fn make(op: Opcode, operands: &[usize]) -> Vec<u8> {
    let widths = op.operand_widths();
    let mut instruction = Vec::with_capacity(op.width());
    instruction.push(op as u8);
    for (operand, width) in operands.iter().zip(widths) {
        match *width {
            2 => instruction.extend_from_slice(&(*operand as u16).to_be_bytes()),
            1 => instruction.push(*operand as u8),
            _ => {}
        }
    }
    instruction
}

/// Decode the operands following an opcode byte. Returns the operands and
/// how many bytes they occupied.
pub fn read_operands(op: Opcode, bytes: &[u8]) -> Result<(Vec<usize>, usize), DecodeError> {
    let widths = op.operand_widths();
    let mut operands = Vec::with_capacity(widths.len());
    let mut offset = 0;
    for &width in widths {
        let slice = bytes
            .get(offset..offset + width)
            .ok_or(DecodeError::TruncatedOperand { name: op.name() })?;
        let value = match width {
            2 => u16::from_be_bytes([slice[0], slice[1]]) as usize,
            1 => slice[0] as usize,
            _ => 0,
        };
        operands.push(value);
        offset += width;
    }
    Ok((operands, offset))
}

/// Read a big-endian u16 at `offset`. The caller guarantees the bytes exist.
#[inline]
pub fn read_u16(bytes: &[u8], offset: usize) -> usize {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize
}

/// Concatenate several encoded instructions.
pub fn concat(parts: &[Vec<u8>]) -> Instructions {
    Instructions(parts.concat())
}
