//! Input messages and reply routing
//!
//! Everything a process consumes arrives as an [`InputMessage`]: a fresh
//! function call, a broadcast it subscribed to, the return (or failure)
//! of a call it made, or a timer it scheduled. A `FunctionInvoke` carries
//! a crate-private [`ReplyPath`] back to whoever is waiting; consuming the
//! message by value when replying is what enforces the single-reply rule.

use codec::{decode_string_args, encode_args, ArgValue, ProcessMessage};
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use types::ChannelSessionState;

/// A failure produced while servicing a function call.
///
/// Travels back to the caller as a `ReturnException`. The `log` flag is
/// local routing, not payload: expected business failures (bad user
/// input, a missing record) skip the host's error log, everything else
/// lands in it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{error_type}: {message}")]
pub struct FunctionError {
    pub error_type: String,
    pub message: String,
    log: bool,
}

impl FunctionError {
    /// A failure the host should log.
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            log: true,
        }
    }

    /// An anticipated failure that is part of the function's contract.
    pub fn expected(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            log: false,
            ..Self::new(error_type, message)
        }
    }

    pub fn should_log(&self) -> bool {
        self.log
    }

    /// Wire form: a two-string argument list.
    pub fn to_message(&self) -> ProcessMessage {
        encode_args(&[
            ArgValue::from(self.error_type.as_str()),
            ArgValue::from(self.message.as_str()),
        ])
        .unwrap_or_else(|_| ProcessMessage::empty())
    }

    /// Rebuilds a failure from its wire form. Arrivals over the wire are
    /// always loggable; the expected/unexpected distinction is local to
    /// the process that raised the failure.
    pub fn from_message(message: &ProcessMessage) -> Self {
        let mut args = decode_string_args(message).unwrap_or_default().into_iter();
        let error_type = args.next().flatten().unwrap_or_else(|| "unknown".to_string());
        let text = args.next().flatten().unwrap_or_default();
        Self::new(error_type, text)
    }
}

/// One entry on a process input queue.
#[derive(Debug)]
pub enum InputMessage {
    /// A function call addressed to this process.
    FunctionInvoke {
        message: ProcessMessage,
        call_id: i32,
        reply: ReplyPath,
    },
    /// A broadcast from a channel this process listens to, stamped with
    /// the cursor to resume from.
    Broadcast {
        message: ProcessMessage,
        session_state: ChannelSessionState,
    },
    /// Successful return of a call this process made earlier.
    Return { call_id: i32, message: ProcessMessage },
    /// Failed return of a call this process made earlier.
    ReturnException { call_id: i32, error: FunctionError },
    /// A timer scheduled by this process came due.
    TimedCallback { call_id: i32, message: ProcessMessage },
}

impl InputMessage {
    /// The correlation id, if this message kind carries one.
    pub fn call_id(&self) -> Option<i32> {
        match self {
            InputMessage::FunctionInvoke { call_id, .. }
            | InputMessage::Return { call_id, .. }
            | InputMessage::ReturnException { call_id, .. }
            | InputMessage::TimedCallback { call_id, .. } => Some(*call_id),
            InputMessage::Broadcast { .. } => None,
        }
    }

    /// The payload, if this message kind carries one.
    pub fn message(&self) -> Option<&ProcessMessage> {
        match self {
            InputMessage::FunctionInvoke { message, .. }
            | InputMessage::Broadcast { message, .. }
            | InputMessage::Return { message, .. }
            | InputMessage::TimedCallback { message, .. } => Some(message),
            InputMessage::ReturnException { .. } => None,
        }
    }

    /// The failure, for `ReturnException` messages.
    pub fn error(&self) -> Option<&FunctionError> {
        match self {
            InputMessage::ReturnException { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The resume cursor, for `Broadcast` messages.
    pub fn session_state(&self) -> Option<&ChannelSessionState> {
        match self {
            InputMessage::Broadcast { session_state, .. } => Some(session_state),
            _ => None,
        }
    }
}

/// Where the reply to a `FunctionInvoke` goes.
///
/// Opaque routing detail: handlers never inspect this, they hand the
/// whole invoke message back to the runtime which follows the path.
pub struct ReplyPath {
    route: ReplyRoute,
}

pub(crate) enum ReplyRoute {
    /// One-way call; the reply is discarded.
    None,
    /// Reply lands on another process's input queue.
    Queue {
        target: Weak<crate::instance::InstanceInner>,
    },
    /// Reply completes a client-side pending result.
    Pending(Arc<crate::client::PendingShared>),
}

impl ReplyPath {
    pub(crate) fn none() -> Self {
        Self {
            route: ReplyRoute::None,
        }
    }

    pub(crate) fn queue(target: Weak<crate::instance::InstanceInner>) -> Self {
        Self {
            route: ReplyRoute::Queue { target },
        }
    }

    pub(crate) fn pending(shared: Arc<crate::client::PendingShared>) -> Self {
        Self {
            route: ReplyRoute::Pending(shared),
        }
    }

    pub(crate) fn into_route(self) -> ReplyRoute {
        self.route
    }
}

impl fmt::Debug for ReplyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.route {
            ReplyRoute::None => f.write_str("ReplyPath::None"),
            ReplyRoute::Queue { .. } => f.write_str("ReplyPath::Queue"),
            ReplyRoute::Pending(shared) => {
                write!(f, "ReplyPath::Pending(call_id={})", shared.call_id())
            }
        }
    }
}

/// Serializes a servers-query JSON answer into a reply payload.
pub(crate) fn json_reply(value: &serde_json::Value) -> ProcessMessage {
    encode_args(&[ArgValue::from(value.to_string())])
        .unwrap_or_else(|_| ProcessMessage::empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_error_wire_round_trip() {
        let err = FunctionError::new("state", "no such cart");
        let back = FunctionError::from_message(&err.to_message());
        assert_eq!(back.error_type, "state");
        assert_eq!(back.message, "no such cart");
        assert!(back.should_log());
    }

    #[test]
    fn test_expected_errors_skip_the_log() {
        assert!(!FunctionError::expected("auth", "bad token").should_log());
        assert!(FunctionError::new("io", "disk full").should_log());
    }

    #[test]
    fn test_call_id_accessor() {
        let msg = InputMessage::Return {
            call_id: 42,
            message: ProcessMessage::empty(),
        };
        assert_eq!(msg.call_id(), Some(42));

        let broadcast = InputMessage::Broadcast {
            message: ProcessMessage::empty(),
            session_state: "00----------------------e:10".parse().unwrap(),
        };
        assert_eq!(broadcast.call_id(), None);
        assert!(broadcast.session_state().is_some());
    }

    #[test]
    fn test_exception_carries_error_not_payload() {
        let msg = InputMessage::ReturnException {
            call_id: 7,
            error: FunctionError::new("x", "y"),
        };
        assert!(msg.message().is_none());
        assert_eq!(msg.error().unwrap().error_type, "x");
    }
}
