//! Argument-list encoding
//!
//! Encodes a flat list of primitive values into a `ProcessMessage` and
//! back: a u16 count followed by `(tag, value)` pairs, big-endian
//! throughout. This is the payload format for every function call, reply
//! and servers-query result in the system.

use crate::error::{CodecError, CodecResult};
use crate::message::ProcessMessage;
use byteorder::{BigEndian, ByteOrder};

const TAG_NULL: u8 = 0;
const TAG_I32: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_STRING: u8 = 3;

/// One value in an argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Null,
    I32(i32),
    I64(i64),
    Str(String),
}

impl ArgValue {
    /// Returns the string payload, or `None` for any other kind.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            ArgValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ArgValue::Null)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        ArgValue::I32(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::I64(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => ArgValue::Null,
        }
    }
}

/// Encodes `args` into a fresh `ProcessMessage`.
pub fn encode_args(args: &[ArgValue]) -> CodecResult<ProcessMessage> {
    if args.len() > u16::MAX as usize {
        return Err(CodecError::TooManyArguments {
            count: args.len(),
            max: u16::MAX as usize,
        });
    }
    let mut out = Vec::with_capacity(2 + args.len() * 9);
    out.extend_from_slice(&(args.len() as u16).to_be_bytes());
    for arg in args {
        match arg {
            ArgValue::Null => out.push(TAG_NULL),
            ArgValue::I32(v) => {
                out.push(TAG_I32);
                out.extend_from_slice(&v.to_be_bytes());
            }
            ArgValue::I64(v) => {
                out.push(TAG_I64);
                out.extend_from_slice(&v.to_be_bytes());
            }
            ArgValue::Str(s) => {
                if s.len() > u16::MAX as usize {
                    return Err(CodecError::StringTooLong {
                        len: s.len(),
                        max: u16::MAX as usize,
                    });
                }
                out.push(TAG_STRING);
                out.extend_from_slice(&(s.len() as u16).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }
    Ok(ProcessMessage::new(out))
}

struct ArgReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ArgReader<'a> {
    fn take(&mut self, need: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(need).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(CodecError::Truncated {
                need,
                got: self.buf.len().saturating_sub(self.pos),
                offset: self.pos,
            }),
        }
    }

    fn read_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> CodecResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn read_arg(&mut self) -> CodecResult<ArgValue> {
        let tag_offset = self.pos;
        let tag = self.read_u8()?;
        match tag {
            TAG_NULL => Ok(ArgValue::Null),
            TAG_I32 => Ok(ArgValue::I32(BigEndian::read_i32(self.take(4)?))),
            TAG_I64 => Ok(ArgValue::I64(BigEndian::read_i64(self.take(8)?))),
            TAG_STRING => {
                let len = self.read_u16()? as usize;
                let str_offset = self.pos;
                let bytes = self.take(len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| CodecError::InvalidUtf8 { offset: str_offset })?;
                Ok(ArgValue::Str(s.to_string()))
            }
            tag => Err(CodecError::UnknownTag {
                tag,
                offset: tag_offset,
            }),
        }
    }
}

/// Decodes the argument list starting at `offset` bytes into the message.
pub fn decode_args_list(message: &ProcessMessage, offset: usize) -> CodecResult<Vec<ArgValue>> {
    let buf = message.as_bytes();
    if offset > buf.len() {
        return Err(CodecError::Truncated {
            need: offset,
            got: buf.len(),
            offset: 0,
        });
    }
    let mut reader = ArgReader {
        buf: &buf[offset..],
        pos: 0,
    };
    let count = reader.read_u16()? as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(reader.read_arg()?);
    }
    Ok(args)
}

/// Decodes an argument list where every element must be a string or null.
pub fn decode_string_args(message: &ProcessMessage) -> CodecResult<Vec<Option<String>>> {
    decode_args_list(message, 0)?
        .into_iter()
        .enumerate()
        .map(|(index, arg)| match arg {
            ArgValue::Null => Ok(None),
            ArgValue::Str(s) => Ok(Some(s)),
            _ => Err(CodecError::UnsupportedArgument { index }),
        })
        .collect()
}
