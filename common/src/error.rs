use std::time::Duration;
use thiserror::Error;

/// Backend conditions that are retried before they reach a caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Transient {
    #[error("flood wait of {0:?}")]
    FloodWait(Duration),

    #[error("redirect to {0}")]
    Redirect(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Range {start}-{end} not satisfiable for size {total}")]
    InvalidRange { start: u64, end: u64, total: u64 },

    #[error("Backend transient error: {0}")]
    BackendTransient(Transient),

    #[error("Backend error: {0}")]
    BackendFatal(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BackendTransient(_))
    }

    /// HTTP status a transport answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::InvalidOperation(_) | Error::InvalidPath(_) => 422,
            Error::InvalidRange { .. } => 416,
            Error::BackendTransient(_) => 503,
            Error::BackendFatal(_) => 502,
            // never answered, the peer is gone
            Error::Aborted => 499,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
