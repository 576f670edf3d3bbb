//! Error types for the protocol library.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Top-level protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Line exceeded the 512-byte protocol maximum.
    #[error("line too long: {0} bytes")]
    LineTooLong(usize),

    /// Failed to parse a protocol line.
    #[error("invalid line: {line}")]
    InvalidLine {
        /// The raw line, truncated for logging.
        line: String,
        /// The underlying parse error.
        #[source]
        cause: ParseError,
    },
}

/// Errors encountered when parsing protocol lines.
///
/// The framer drops the offending line on either of these; it never
/// closes the connection on its own.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// More than the 15 parameters the grammar allows.
    #[error("too many parameters")]
    TooManyParams,

    /// The line ended before a verb was seen (e.g. a bare prefix).
    #[error("truncated line")]
    TruncatedLine,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::LineTooLong(1024);
        assert_eq!(format!("{}", err), "line too long: 1024 bytes");
        assert_eq!(format!("{}", ParseError::TooManyParams), "too many parameters");
    }

    #[test]
    fn test_error_source_chaining() {
        let err = ProtocolError::InvalidLine {
            line: ":x".to_string(),
            cause: ParseError::TruncatedLine,
        };
        let source = std::error::Error::source(&err);
        assert!(source.is_some());
        assert_eq!(source.unwrap().to_string(), "truncated line");
    }
}
