//! Runtime errors
//!
//! Errors raised by the client tier and the channel-listener surface.
//! Delivery problems between processes never surface here: a failed
//! function call comes back as a `ReturnException` input message on the
//! caller's queue, carrying a [`FunctionError`](crate::FunctionError).

use std::time::Duration;
use thiserror::Error;
use types::{ProcessChannel, ProcessUnavailable};

/// A bounded wait for a call result expired before the reply arrived.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no result after waiting {waited:?}")]
pub struct ResultTimeout {
    /// How long the caller waited.
    pub waited: Duration,
}

/// Channel listener registration failures.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// A listener is already installed for this channel. Replace it by
    /// removing the old one first; silent replacement hides lost wiring.
    #[error("a listener is already set on channel {0}")]
    AlreadySet(ProcessChannel),

    /// The channel's broadcaster could not be reached.
    #[error(transparent)]
    Unavailable(#[from] ProcessUnavailable),
}
