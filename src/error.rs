use std::num::{ParseFloatError, ParseIntError};

use serde::Serialize;

/// Custom Result type for sheetsql operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for sheetsql
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// SQL lexing, parsing or predicate compilation error
    #[error("parse error {0}")]
    Parse(String),
    /// Unknown workbook, sheet or column
    #[error("reference error {0}")]
    Reference(String),
    /// INSERT value count does not line up with the target columns
    #[error("cardinality error {0}")]
    Cardinality(String),
    /// Missing, unreadable or corrupt workbook file
    #[error("io error {0}")]
    Io(String),
    /// Query exceeded the configured timeout
    #[error("timeout {0}")]
    Timeout(String),
    /// Internal error (serialization, worker pool, etc.)
    #[error("internal error {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable code reported to callers
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "PARSE_ERROR",
            Error::Reference(_) => "REFERENCE_ERROR",
            Error::Cardinality(_) => "CARDINALITY_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Errors caused by the statement itself rather than by the system
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Parse(_) | Error::Reference(_) | Error::Cardinality(_)
        )
    }

    /// HTTP-style status: 400 for user errors, 500 otherwise
    pub fn status(&self) -> u16 {
        if self.is_user_error() { 400 } else { 500 }
    }

    /// The message without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            Error::Parse(m)
            | Error::Reference(m)
            | Error::Cardinality(m)
            | Error::Io(m)
            | Error::Timeout(m)
            | Error::Internal(m) => m,
        }
    }
}

/// Structured failure handed to external callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub error_code: String,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            success: false,
            message: err.message().to_string(),
            error_code: err.code().to_string(),
        }
    }
}

impl From<ParseIntError> for Error {
    fn from(value: ParseIntError) -> Self {
        Error::Parse(value.to_string())
    }
}

impl From<ParseFloatError> for Error {
    fn from(value: ParseFloatError) -> Self {
        Error::Parse(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value.to_string())
    }
}

impl From<tempfile::PersistError> for Error {
    fn from(value: tempfile::PersistError) -> Self {
        Error::Io(value.error.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(value: bincode::Error) -> Self {
        Error::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Internal(value.to_string())
    }
}

impl From<calamine::Error> for Error {
    fn from(value: calamine::Error) -> Self {
        Error::Io(value.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for Error {
    fn from(value: rust_xlsxwriter::XlsxError) -> Self {
        Error::Io(value.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(value: csv::Error) -> Self {
        Error::Io(value.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(value: regex::Error) -> Self {
        Error::Parse(value.to_string())
    }
}
