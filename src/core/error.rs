use thiserror::Error;

/// Crate-wide error taxonomy. Wire-visible gRPC statuses are mapped in
/// `crate::flight::error`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlexusError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("batch too large: {0}")]
    BatchTooLarge(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("leaked buffers: {0}")]
    LeakedBuffers(String),
    #[error("cannot parse config: {0}")]
    ConfigError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for PlexusError {
    fn from(err: std::io::Error) -> Self {
        PlexusError::IoError(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for PlexusError {
    fn from(err: arrow::error::ArrowError) -> Self {
        PlexusError::Internal(err.to_string())
    }
}
