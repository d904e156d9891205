//! Error types for the native protocol client.
//!
//! Four families, matching how the caller should react:
//! - transport (`Io`, `Timeout`, `Closed`): the connection is dead
//! - decode (`Decode`, `Type`): only the current decode failed
//! - server exceptions (`Exception`): data, the connection stays usable
//! - caller contract (`RowMismatch`, `InvalidInput`): detected before any bytes move

use std::time::Duration;
use thiserror::Error;

use crate::protocol::packet::Exception;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Connection closed")]
    Closed,

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Type error: {0}")]
    Type(#[from] TypeError),

    /// A block column's wire type does not fit its target.
    #[error("Column {index} ({name:?}): {source}")]
    ColumnType {
        index: usize,
        name: String,
        #[source]
        source: TypeError,
    },

    #[error("Server exception: {0}")]
    Exception(Box<Exception>),

    #[error("Query cancelled")]
    Cancelled,

    /// A column's row count disagrees with the block it is being encoded into.
    #[error("Column {column:?} has {rows} rows, block expects {expected}")]
    RowMismatch {
        column: String,
        rows: usize,
        expected: usize,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Transport failures leave the connection unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout { .. } | Error::Closed)
    }

    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::Decode(_) | Error::Type(_) | Error::ColumnType { .. }
        )
    }

    /// Whether the connection must be dropped after this error.
    ///
    /// Decode errors are fatal to the connection too: the stream position is
    /// unknown once a packet failed to decode halfway.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Exception(_) | Error::RowMismatch { .. } | Error::InvalidInput(_)
        )
    }

    /// The server exception carried by this error, if any.
    pub fn exception(&self) -> Option<&Exception> {
        match self {
            Error::Exception(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Exception> for Error {
    fn from(e: Exception) -> Self {
        Error::Exception(Box::new(e))
    }
}

/// Errors produced while decoding wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Source ended exactly at a value boundary.
    #[error("unexpected end of data at offset {offset}")]
    Eof { offset: u64 },

    /// Source ended in the middle of a value.
    #[error("truncated value at offset {offset}: needed {needed} bytes, got {got}")]
    Truncated { offset: u64, needed: usize, got: usize },

    #[error("varint overflow at offset {offset}")]
    VarintOverflow { offset: u64 },

    #[error("invalid UTF-8 at offset {offset}")]
    InvalidUtf8 { offset: u64 },

    #[error("invalid bool byte {value:#04x} at offset {offset}")]
    InvalidBool { offset: u64, value: u8 },

    #[error("{what} {value} exceeds limit {max}")]
    Bound {
        what: &'static str,
        value: u64,
        max: u64,
    },

    #[error("{type_name}: value {value} has no mapping")]
    UnknownEnumValue { type_name: String, value: i64 },

    #[error("unknown compression method {0:#04x}")]
    UnknownMethod(u8),

    #[error("checksum mismatch: frame says {expected:#034x}, computed {actual:#034x}")]
    Checksum { expected: u128, actual: u128 },

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("unknown server packet code {code}")]
    UnknownPacket { code: u64 },

    #[error("column {index} ({name:?}): {source}")]
    Column {
        index: usize,
        name: String,
        #[source]
        source: Box<DecodeError>,
    },

    #[error("{0}")]
    Invalid(String),
}

impl DecodeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DecodeError::Invalid(message.into())
    }

    /// Whether the source ran out (cleanly or mid-value) rather than carrying bad bytes.
    pub fn is_short_read(&self) -> bool {
        match self {
            DecodeError::Eof { .. } | DecodeError::Truncated { .. } => true,
            DecodeError::Column { source, .. } => source.is_short_read(),
            _ => false,
        }
    }

    /// Attach column position and name.
    pub fn in_column(self, index: usize, name: &str) -> Self {
        DecodeError::Column {
            index,
            name: name.to_string(),
            source: Box::new(self),
        }
    }
}

/// Errors in type strings and column inference.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("malformed type {input:?}: {reason}")]
    Malformed { input: String, reason: String },

    #[error("unsupported type {0:?}")]
    Unsupported(String),

    #[error("type conflict: column is {have:?}, got {want:?}")]
    Conflict { have: String, want: String },
}

impl TypeError {
    pub fn malformed(input: &str, reason: impl Into<String>) -> Self {
        TypeError::Malformed {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::RowMismatch {
            column: "id".to_string(),
            rows: 3,
            expected: 4,
        };
        assert_eq!(err.to_string(), "Column \"id\" has 3 rows, block expects 4");

        let err = DecodeError::Truncated {
            offset: 12,
            needed: 8,
            got: 3,
        };
        assert_eq!(
            err.to_string(),
            "truncated value at offset 12: needed 8 bytes, got 3"
        );
    }

    #[test]
    fn test_column_context() {
        let err = DecodeError::Eof { offset: 7 }.in_column(2, "name");
        assert!(err.is_short_read());
        assert_eq!(
            err.to_string(),
            "column 2 (\"name\"): unexpected end of data at offset 7"
        );
    }

    #[test]
    fn test_classification() {
        assert!(Error::Closed.is_transport());
        assert!(Error::Closed.is_fatal());
        assert!(Error::from(DecodeError::InvalidUtf8 { offset: 0 }).is_decode());
        assert!(!Error::InvalidInput("x".into()).is_fatal());
        assert!(!Error::from(Exception::default()).is_fatal());
    }
}
