//! Error types and status-code mapping.
//!
//! Merlin defines five user-visible error kinds. The validator and the
//! repository produce them directly; store failures are classified into them
//! at the repository boundary; anything else that reaches the RPC facade is
//! remapped to [`Error::Internal`] with the original message preserved.

use thiserror::Error;

/// User-visible Merlin error conditions.
#[derive(Debug, Error)]
pub enum Error {
    /// The record failed validation.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The target record, or a CreateServer's parent service, does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A create targeted an occupied key.
    #[error("already exists: {what}")]
    AlreadyExists { what: String },

    /// The store backend is unreachable or timed out.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// Unexpected failure, wrapped once with the original message.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create an InvalidArgument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Create an Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error indicates the operation may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type using Merlin's domain error.
pub type Result<T> = std::result::Result<T, Error>;

/// Map a domain error to its canonical transport status.
///
/// This is the only place domain errors become gRPC statuses.
pub fn to_status(err: Error) -> tonic::Status {
    match err {
        Error::InvalidArgument { reason } => tonic::Status::invalid_argument(reason),
        Error::NotFound { what } => tonic::Status::not_found(what),
        Error::AlreadyExists { what } => tonic::Status::already_exists(what),
        Error::Unavailable { message } => tonic::Status::unavailable(message),
        Error::Internal { message } => tonic::Status::internal(message),
    }
}
