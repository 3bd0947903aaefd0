//! Strand Message Codec
//!
//! The "rules" layer of the Strand runtime: the `ProcessMessage` envelope
//! used for every function argument, reply, broadcast payload and error,
//! plus the compact argument-list encoding that rides inside it.
//!
//! ## Wire Contract
//!
//! The argument-list format is self-delimiting and big-endian:
//!
//! ```text
//! ┌──────────┬───────────────────────────────────────────┐
//! │ u16 count│ count × (u8 tag, value)                   │
//! ├──────────┼───────────────────────────────────────────┤
//! │          │ tag 0: null            (no value bytes)   │
//! │          │ tag 1: i32             (4 bytes)          │
//! │          │ tag 2: i64             (8 bytes)          │
//! │          │ tag 3: UTF-8 string    (u16 len + bytes)  │
//! └──────────┴───────────────────────────────────────────┘
//! ```
//!
//! Any other tag is a fatal `CodecError::UnknownTag`; decoding never
//! silently coerces. Length prefixes make partial reads unambiguous.
//!
//! ## What This Crate Does NOT Contain
//! - Queues, channels, or delivery (belongs in libs/actors)
//! - Identifier types (belongs in libs/types)

pub mod args;
pub mod error;
pub mod message;

pub use args::{decode_args_list, decode_string_args, encode_args, ArgValue};
pub use error::{CodecError, CodecResult};
pub use message::ProcessMessage;
