//! Error taxonomy for identifier parsing and process availability
//!
//! `FormatError` is fatal to the parse call that produced it: a malformed
//! id or session-state string indicates protocol or storage corruption and
//! is never silently defaulted. `ProcessUnavailable` is the opposite: a
//! retryable condition reported when a process server cannot currently be
//! reached, and never proof that the target process is dead.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Malformed identifier, channel, or session-state string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Input is the wrong length for the fixed-width encoding.
    #[error("wrong length: expected {expected} characters, got {got}")]
    WrongLength { expected: usize, got: usize },

    /// A character outside the encoding alphabet.
    #[error("invalid character {ch:?} at offset {offset}")]
    InvalidCharacter { ch: char, offset: usize },

    /// Session-state string has no ':' separating cursor from channel.
    #[error("missing ':' delimiter in session state")]
    MissingDelimiter,

    /// A hex field failed to parse as a number.
    #[error("invalid {field} value {value:?}")]
    InvalidNumber {
        field: &'static str,
        value: String,
    },
}

/// Opaque address of a process server, carried in availability errors so
/// callers can report which node was unreachable. The string form does not
/// expose anything about the processes hosted there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAddress(String);

impl ServiceAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a process server could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnavailableReason {
    /// The process is reported as being unavailable.
    Unavailable,
    /// A query failed to respond within an acceptable timeout period.
    Timeout,
    /// The service is known to be down from periodic heartbeat checks.
    NoHeartbeat,
}

/// A target process server cannot currently be reached.
///
/// Callers must treat this as retryable-with-backoff. During a cluster
/// fan-out an individual `ProcessUnavailable` becomes a per-server partial
/// result, never a whole-query failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("process service {location} unavailable ({reason:?}): {message}")]
pub struct ProcessUnavailable {
    pub reason: UnavailableReason,
    pub location: ServiceAddress,
    pub message: String,
}

impl ProcessUnavailable {
    pub fn new(
        reason: UnavailableReason,
        location: ServiceAddress,
        message: impl Into<String>,
    ) -> Self {
        Self {
            reason,
            location,
            message: message.into(),
        }
    }

    /// Shorthand for the common "node is down" case.
    pub fn unreachable(location: ServiceAddress) -> Self {
        Self::new(
            UnavailableReason::Unavailable,
            location,
            "process server unreachable",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_display_names_location() {
        let err = ProcessUnavailable::unreachable(ServiceAddress::new("node-b:9710"));
        let text = err.to_string();
        assert!(text.contains("node-b:9710"));
        assert!(text.contains("Unavailable"));
    }

    #[test]
    fn test_format_error_display() {
        let err = FormatError::WrongLength {
            expected: 24,
            got: 7,
        };
        assert_eq!(err.to_string(), "wrong length: expected 24 characters, got 7");
    }
}
