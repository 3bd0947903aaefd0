//! The `ProcessMessage` envelope
//!
//! An immutable, sized byte sequence used uniformly for function
//! arguments, replies, broadcast payloads and error descriptions. Cheap to
//! clone (reference counted) so one broadcast payload can fan out to many
//! consumers without copying.

use bytes::Bytes;
use std::io::{Cursor, Read};

/// Immutable message payload with a stream view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessMessage {
    data: Bytes,
}

impl ProcessMessage {
    /// Wraps an owned byte buffer.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// The empty/null message used for one-way calls carrying no payload
    /// and for normalizing a `None` handler reply.
    pub fn empty() -> Self {
        Self { data: Bytes::new() }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrowed view of the payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Stream view over the payload.
    pub fn reader(&self) -> impl Read + '_ {
        Cursor::new(self.as_bytes())
    }

    /// Shared handle to the underlying buffer.
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl From<Vec<u8>> for ProcessMessage {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<Bytes> for ProcessMessage {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_empty_message() {
        let msg = ProcessMessage::empty();
        assert_eq!(msg.len(), 0);
        assert!(msg.is_empty());
        assert_eq!(msg.as_bytes(), &[] as &[u8]);
    }

    #[test]
    fn test_reader_sees_full_payload() {
        let msg = ProcessMessage::new(vec![1u8, 2, 3, 4]);
        let mut out = Vec::new();
        msg.reader().read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_clone_is_shallow() {
        let msg = ProcessMessage::new(vec![9u8; 1024]);
        let copy = msg.clone();
        // Bytes clones share the same backing buffer.
        assert_eq!(msg.to_bytes().as_ptr(), copy.to_bytes().as_ptr());
    }
}
