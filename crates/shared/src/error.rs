use thiserror::Error;

use crate::domain::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("broker unreachable at {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("broker rejected the session: {0}")]
    Rejected(String),
    #[error("broker did not answer within {0} ms")]
    TimedOut(u64),
    #[error("not connected to the broker")]
    NotConnected,
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error("unsupported broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("broker transport failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to load conversation with user {recipient_id}: {reason}")]
pub struct LoadError {
    pub recipient_id: UserId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("correspondent {0} is not in the roster")]
pub struct NotFoundError(pub UserId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header {0:?}")]
    InvalidEscape(String),
    #[error("frame body is not terminated by NUL")]
    Unterminated,
    #[error("content-length {declared} exceeds body of {actual} bytes")]
    ContentLength { declared: usize, actual: usize },
}

/// Failures of coordinator-level operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error("no conversation is open")]
    NoConversation,
}
