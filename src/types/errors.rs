//! Application error types.
//!
//! Every failure a caller can observe from `submit` is a distinct variant so
//! callers branch on the kind rather than on message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error name the dispatcher uses for admission-queue overflow.
pub const OVERFLOW_NAME: &str = "Overflow";
/// Error name the dispatcher uses for calls dropped by disposal.
pub const DISPOSED_NAME: &str = "Disposed";
/// Error name the dispatcher uses for requests it could not decode.
pub const PROTOCOL_VIOLATION_NAME: &str = "ProtocolViolation";

/// Serialized form of an error raised by the remote implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: None,
            stack: None,
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: Some(name.into()),
            stack: None,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Main error enum for the broker, dispatcher and cache.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The remote implementation failed.
    #[error("remote failure: {0}")]
    RemoteFailure(RemoteError),

    /// No response within the configured window.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller withdrew interest via its cancellation token.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The broker or dispatcher was torn down while the call was outstanding.
    #[error("disposed: {0}")]
    Disposed(String),

    /// The server-side admission queue was full.
    #[error("overflow: {0}")]
    Overflow(String),

    /// A message arrived malformed or failed to deserialize.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The channel went away underneath outstanding requests.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Posting a single message on the channel failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Invalid configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Discriminant of [`Error`], for matching without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RemoteFailure,
    Timeout,
    Cancelled,
    Disposed,
    Overflow,
    ProtocolViolation,
    ChannelClosed,
    Send,
    Validation,
    Serialization,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RemoteFailure(_) => ErrorKind::RemoteFailure,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Disposed(_) => ErrorKind::Disposed,
            Error::Overflow(_) => ErrorKind::Overflow,
            Error::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Error::ChannelClosed(_) => ErrorKind::ChannelClosed,
            Error::Send(_) => ErrorKind::Send,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// True for failures a caller may safely resubmit.
    ///
    /// A `RemoteFailure` may already have had side effects on the remote
    /// side, so it is never reported as retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Overflow(_))
    }

    /// Serialize this error for a `Response { ok: false }`.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            Error::RemoteFailure(remote) => remote.clone(),
            Error::Overflow(msg) => RemoteError::named(OVERFLOW_NAME, msg.clone()),
            Error::Disposed(msg) => RemoteError::named(DISPOSED_NAME, msg.clone()),
            Error::ProtocolViolation(msg) => RemoteError::named(PROTOCOL_VIOLATION_NAME, msg.clone()),
            other => RemoteError::named(format!("{:?}", other.kind()), other.to_string()),
        }
    }

    /// Reconstruct a client-side error from a serialized remote error.
    pub fn from_remote(remote: RemoteError) -> Self {
        match remote.name.as_deref() {
            Some(OVERFLOW_NAME) => Error::Overflow(remote.message),
            Some(DISPOSED_NAME) => Error::Disposed(remote.message),
            Some(PROTOCOL_VIOLATION_NAME) => Error::ProtocolViolation(remote.message),
            _ => Error::RemoteFailure(remote),
        }
    }
}

// Convenience constructors
impl Error {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::RemoteFailure(RemoteError::new(message))
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn disposed(msg: impl Into<String>) -> Self {
        Self::Disposed(msg.into())
    }

    pub fn overflow(msg: impl Into<String>) -> Self {
        Self::Overflow(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    pub fn send(msg: impl Into<String>) -> Self {
        Self::Send(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
