//! Strand Identifier Types
//!
//! Pure data structures for the Strand process runtime: globally unique
//! process ids, broadcast channel identifiers, and serializable channel
//! cursors ("session state"). Everything in this crate is I/O free and
//! round-trips exactly through its string form.
//!
//! ## Architecture Role
//!
//! ```text
//! libs/types → libs/codec → libs/actors
//!     ↑             ↓            ↓
//! Pure Data    Wire Codec     Runtime
//! ProcessId    ProcessMessage ProcessServer
//! Cursors      Arg lists      Channels/Clients
//! ```
//!
//! ## What This Crate Contains
//! - `ProcessId`: partition + temporally-ordered value, 24-char string form
//! - `ProcessChannel`: one broadcast stream of a process
//! - `ChannelSessionState`: resumable cursor with sequence-aware ordering
//! - `ServiceAddress` and the availability/format error taxonomy
//!
//! ## What This Crate Does NOT Contain
//! - Message payload encoding (belongs in libs/codec)
//! - Queues, actors, or any runtime state (belongs in libs/actors)

pub mod channel;
pub mod encoding;
pub mod error;
pub mod identity;

pub use channel::{ChannelSessionState, ProcessChannel};
pub use error::{FormatError, ProcessUnavailable, ServiceAddress, UnavailableReason};
pub use identity::ProcessId;
