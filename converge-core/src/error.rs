//! Error types.

use std::time::Duration;

use thiserror::Error;

use crate::driver::Phase;
use crate::kind::SubResourceKind;

/// Which side of a match a duplicate key was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSide {
    Desired,
    Observed,
}

impl std::fmt::Display for RuleSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleSide::Desired => f.write_str("desired"),
            RuleSide::Observed => f.write_str("observed"),
        }
    }
}

/// Errors raised by the reconciliation engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Observed wire data could not be parsed.
    #[error("malformed {kind} state: {reason}")]
    MalformedState {
        kind: SubResourceKind,
        reason: String,
    },

    /// More than one rule on one side shares a match key.
    #[error("ambiguous {kind} match: several {side} rules share key {key}")]
    AmbiguousMatch {
        kind: SubResourceKind,
        side: RuleSide,
        key: String,
    },

    /// Resource or sub-resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials rejected by the remote.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Retryable remote failure. The engine itself never retries.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// A remote call did not complete before its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Non-retryable remote failure.
    #[error("permanent remote failure: {0}")]
    Permanent(String),

    /// Desired configuration or policy is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Driver state machine was asked to make an illegal move.
    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy returned by [`crate::StateSource`] and [`crate::StateMutator`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::NotFound(m) => Error::NotFound(m),
            RemoteError::Auth(m) => Error::Auth(m),
            RemoteError::Transient(m) => Error::Transient(m),
            RemoteError::Permanent(m) => Error::Permanent(m),
        }
    }
}

impl Error {
    pub(crate) fn malformed(kind: SubResourceKind, reason: impl Into<String>) -> Self {
        Error::MalformedState {
            kind,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidConfig(reason.into())
    }

    /// Whether the caller may re-run the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Timeout { .. })
    }
}
