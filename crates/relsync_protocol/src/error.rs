//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by protocol types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to encode a wire message.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Failed to decode a wire message.
    #[error("decoding failed: {0}")]
    Decoding(String),

    /// A table or column name is not a plain identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A row lacks a column the table spec requires.
    #[error("row in table {table} is missing column {column}")]
    MissingColumn {
        /// Table name.
        table: String,
        /// Missing column.
        column: String,
    },

    /// A version column holds something other than an integer.
    #[error("version column {column} in table {table} is not an integer")]
    InvalidVersion {
        /// Table name.
        table: String,
        /// Version column.
        column: String,
    },

    /// Two records passed to a resolver do not describe the same row.
    #[error("cannot resolve records for different rows: {0}")]
    MismatchedRecords(String),

    /// A custom merge function failed or panicked.
    #[error("merge policy {policy} failed: {message}")]
    MergeFailed {
        /// Name of the merge policy.
        policy: String,
        /// Failure description.
        message: String,
    },
}

impl ProtocolError {
    /// Creates a merge failure error.
    pub fn merge_failed(policy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MergeFailed {
            policy: policy.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::MissingColumn {
            table: "scripts".into(),
            column: "id".into(),
        };
        assert_eq!(err.to_string(), "row in table scripts is missing column id");

        let err = ProtocolError::merge_failed("notes", "boom");
        assert!(err.to_string().contains("notes"));
        assert!(err.to_string().contains("boom"));
    }
}
