//! Error types for the searchstore engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// True for errors that indicate on-disk damage rather than caller mistakes.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::CorruptData(_))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::CorruptData(err.to_string())
    }
}
