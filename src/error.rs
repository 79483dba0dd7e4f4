use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the content manager subsystem.
///
/// Grounded in the teacher's `HeimdallError`: a single flat enum instead of
/// nested error types per module, `Arc<std::io::Error>` so the error stays
/// `Clone` without re-opening the underlying IO failure.
#[derive(Debug, Clone, Error)]
pub enum ContentError {
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    #[error("local file is missing: {0}")]
    FileMissing(String),
    #[error("local file is inaccessible: {0}")]
    FileInaccessible(String),
    #[error("requested path escapes the web root: {0}")]
    PathEscape(String),

    #[error("host is neither IPv4 nor IPv6: {0}")]
    InvalidHost(String),
    #[error("failed to create outbound socket: {0}")]
    SocketCreate(String),
}

impl From<std::io::Error> for ContentError {
    fn from(err: std::io::Error) -> Self {
        ContentError::IoError(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, ContentError>;
