//! Failure kinds that cross component boundaries.
//!
//! Internal plumbing uses `anyhow`; these enums exist where a caller has to
//! branch on the kind of failure (terminal capability loss vs. a remote hiccup
//! that the next sync tick will absorb vs. a rejected request).

use thiserror::Error;

/// Camera or detection model could not be brought up. Terminal for the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("face detection model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("camera is already held by another detector")]
    Busy,
}

/// Remote store could not complete an operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("remote payload could not be decoded: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::Decode(err.to_string())
    }
}

/// Request rejected before any side effect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
