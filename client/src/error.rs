//! Error types for the client.

use tether_engine::{ClassName, Record};
use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out")]
    Timeout,

    /// The server rejected the whole request.
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// One failed member of a batch, with the record it belongs to.
#[derive(Debug, Clone)]
pub struct MemberError {
    pub record: Record,
    pub error: Error,
}

/// Errors surfaced by save, destroy and fetch.
///
/// Clone so that one batch outcome can be handed to every member.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] tether_engine::Error),

    #[error("transport error: {0}")]
    Transport(TransportError),

    /// The server rejected this record.
    #[error("server error {code}: {message}")]
    Server { code: i64, message: String },

    /// The remaining records point at each other and none can be saved first.
    #[error("cannot save {remaining} record(s): their pointers form a cycle")]
    Cycle { remaining: usize },

    #[error("{} batch member(s) failed", .0.len())]
    Aggregate(Vec<MemberError>),

    #[error("{class_name} has no object id")]
    MissingObjectId { class_name: ClassName },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("task was dropped before it completed")]
    TaskAborted,
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Server { code, message } => Error::Server { code, message },
            other => Error::Transport(other),
        }
    }
}

impl Error {
    /// Per-member failures of an aggregate error; empty otherwise.
    pub fn member_errors(&self) -> &[MemberError] {
        match self {
            Error::Aggregate(errors) => errors,
            _ => &[],
        }
    }

    /// Whether the failure happened below the request level.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
