//! Error types for handle parsing.

use thiserror::Error;

/// Errors that can occur when parsing a handle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The handle string is empty.
    #[error("handle cannot be empty")]
    Empty,

    /// The handle carries another resource's prefix.
    #[error("invalid handle prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The handle is missing the underscore separator.
    #[error("handle missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the handle is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
