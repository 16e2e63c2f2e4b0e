use thiserror::Error;

use super::ColumnType;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("column '{column}' of {model} expects {expected}, got {actual}")]
    ColumnTypeMismatch {
        model: &'static str,
        column: &'static str,
        expected: ColumnType,
        actual: ColumnType,
    },

    #[error("row for {model} is missing column '{column}'")]
    MissingColumn {
        model: &'static str,
        column: &'static str,
    },

    #[error("timestamp {timestamp} is out of range")]
    InvalidTimestamp { timestamp: i64 },

    #[error("{bucket} is not a valid time bucket: {reason}")]
    InvalidBucket { bucket: i64, reason: &'static str },
}
