//! Binary form of `Bytecode`. All integers are big-endian.
//!
//! ```text
//! "ZENB" | version:u8 | ins_len:u32 | ins | const_count:u32 | constants...
//! ```

use std::rc::Rc;

use crate::code::Instructions;
use crate::value::{CompiledFunction, Value};

use super::Bytecode;

pub const MAGIC: &[u8; 4] = b"ZENB";
pub const VERSION: u8 = 1;

const TAG_NULL: u8 = 1;
const TAG_INTEGER: u8 = 10;
const TAG_FLOAT: u8 = 11;
const TAG_BOOLEAN: u8 = 12;
const TAG_STRING: u8 = 13;
const TAG_FUNCTION: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("constant {index} of type {type_name} cannot be serialized")]
    UnsupportedConstant { index: usize, type_name: &'static str },
    #[error("{what} of length {len} exceeds the 32-bit limit")]
    TooLarge { what: &'static str, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("not a zen bytecode file (magic {found:?})")]
    BadMagic { found: Vec<u8> },
    #[error("unsupported bytecode version {version} (expected 1)")]
    UnsupportedVersion { version: u8 },
    #[error("unexpected end of input while reading {what}")]
    Truncated { what: &'static str },
    #[error("unknown constant tag {tag}")]
    UnknownTag { tag: u8 },
    #[error("invalid boolean byte {byte}")]
    InvalidBoolean { byte: u8 },
    #[error("string constant is not valid UTF-8")]
    InvalidUtf8,
    #[error("{count} trailing byte(s) after the constant pool")]
    TrailingBytes { count: usize },
}

pub fn serialize(bytecode: &Bytecode) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(16 + bytecode.instructions.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    write_bytes(&mut out, bytecode.instructions.as_bytes(), "instructions")?;
    write_len(&mut out, bytecode.constants.len(), "constant pool")?;
    for (index, constant) in bytecode.constants.iter().enumerate() {
        write_constant(&mut out, index, constant)?;
    }
    Ok(out)
}

fn write_len(out: &mut Vec<u8>, len: usize, what: &'static str) -> Result<(), EncodeError> {
    let len32 = u32::try_from(len).map_err(|_| EncodeError::TooLarge { what, len })?;
    out.extend_from_slice(&len32.to_be_bytes());
    Ok(())
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8], what: &'static str) -> Result<(), EncodeError> {
    write_len(out, bytes.len(), what)?;
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_constant(out: &mut Vec<u8>, index: usize, constant: &Value) -> Result<(), EncodeError> {
    match constant {
        Value::Null => out.push(TAG_NULL),
        Value::Integer(n) => {
            out.push(TAG_INTEGER);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Value::Float(n) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&n.to_bits().to_be_bytes());
        }
        Value::Boolean(b) => {
            out.push(TAG_BOOLEAN);
            out.push(u8::from(*b));
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            write_bytes(out, s.as_bytes(), "string constant")?;
        }
        Value::CompiledFunction(func) => {
            out.push(TAG_FUNCTION);
            write_len(out, func.num_locals, "local count")?;
            write_len(out, func.num_parameters, "parameter count")?;
            write_bytes(out, func.instructions.as_bytes(), "function body")?;
        }
        other => {
            return Err(EncodeError::UnsupportedConstant { index, type_name: other.type_name() });
        }
    }
    Ok(())
}

/// Parse a serialized program. Nothing is returned unless the whole input is valid.
pub fn deserialize(bytes: &[u8]) -> Result<Bytecode, DecodeError> {
    let mut reader = Reader { bytes, pos: 0 };

    let magic = reader.take(4, "magic")?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic { found: magic.to_vec() });
    }
    let version = reader.u8("version")?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion { version });
    }

    let instructions = Instructions(reader.sized("instructions")?.to_vec());
    let count = reader.u32("constant count")? as usize;
    let mut constants = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        constants.push(reader.constant()?);
    }

    let rest = bytes.len() - reader.pos;
    if rest > 0 {
        return Err(DecodeError::TrailingBytes { count: rest });
    }
    Ok(Bytecode { instructions, constants })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated { what })?;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated { what })?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DecodeError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N, what)?);
        Ok(buf)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array(what)?))
    }

    /// A u32 length prefix followed by that many bytes.
    fn sized(&mut self, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.u32(what)? as usize;
        self.take(len, what)
    }

    fn constant(&mut self) -> Result<Value, DecodeError> {
        let tag = self.u8("constant tag")?;
        Ok(match tag {
            TAG_NULL => Value::Null,
            TAG_INTEGER => Value::Integer(i64::from_be_bytes(self.array("integer constant")?)),
            TAG_FLOAT => Value::Float(f64::from_bits(u64::from_be_bytes(self.array("float constant")?))),
            TAG_BOOLEAN => match self.u8("boolean constant")? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                byte => return Err(DecodeError::InvalidBoolean { byte }),
            },
            TAG_STRING => {
                let raw = self.sized("string constant")?;
                let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
                Value::string(s)
            }
            TAG_FUNCTION => {
                let num_locals = self.u32("local count")? as usize;
                let num_parameters = self.u32("parameter count")? as usize;
                let instructions = Instructions(self.sized("function body")?.to_vec());
                Value::CompiledFunction(Rc::new(CompiledFunction { instructions, num_locals, num_parameters }))
            }
            tag => return Err(DecodeError::UnknownTag { tag }),
        })
    }
}
