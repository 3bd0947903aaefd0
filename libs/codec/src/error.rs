//! Codec errors
//!
//! Every variant is fatal to the decode call that produced it. A bad tag or
//! a truncated buffer means the message bytes are corrupt or were produced
//! by an incompatible peer; recovery belongs to the layer that owns the
//! transport, not to the decoder.

use thiserror::Error;

/// Argument-list decoding errors with buffer context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A type tag outside the known set (0=null, 1=i32, 2=i64, 3=string).
    #[error("unknown argument tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    /// The buffer ended before the declared value was complete.
    #[error("truncated message: need {need} bytes at offset {offset}, buffer has {got}")]
    Truncated {
        need: usize,
        got: usize,
        offset: usize,
    },

    /// A string value whose bytes are not valid UTF-8.
    #[error("invalid UTF-8 in string argument at offset {offset}")]
    InvalidUtf8 { offset: usize },

    /// An argument that has no encoding in the wire format.
    #[error("argument {index} is not encodable: expected null, i32, i64 or string")]
    UnsupportedArgument { index: usize },

    /// A string argument longer than the u16 length prefix can carry.
    #[error("string argument of {len} bytes exceeds the {max}-byte limit")]
    StringTooLong { len: usize, max: usize },

    /// More arguments than the u16 count prefix can carry.
    #[error("argument list of {count} entries exceeds the {max}-entry limit")]
    TooManyArguments { count: usize, max: usize },
}

/// Result type for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
