//! Error taxonomy for every storage operation.
//!
//! Not-found is never an error here: lookups return `Ok(None)` and
//! `update_in_array` returns `Ok(false)`. Everything below is a real failure
//! the caller can branch on.

use std::fmt::{Display, Formatter};

use serde_json::Error as SerdeError;

#[derive(Debug)]
pub enum StorageError {
    /// The key-value backend refused or failed the operation.
    Backend(String),
    /// Stored or supplied JSON could not be parsed or produced.
    Serialization(String),
    /// A section write was attempted before the document existed.
    Uninitialized(String),
    /// The value has the wrong shape for the requested operation.
    Validation(String),
    FileTooLarge { size: usize, max: usize },
    /// Aggregate quota; also raised by a backend that ran out of capacity.
    QuotaExceeded { requested: usize, used: usize, max: usize },
    /// Another handle wrote the document since it was loaded.
    Conflict { expected: u64, found: u64 },
    Io(String),
    Image(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Backend(msg) => write!(f, "Backend error: {}", msg),
            StorageError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            StorageError::Uninitialized(msg) => write!(f, "Storage not initialized: {}", msg),
            StorageError::Validation(msg) => write!(f, "Validation error: {}", msg),
            StorageError::FileTooLarge { size, max } => {
                write!(f, "File too large: {} bytes (max {} bytes)", size, max)
            }
            StorageError::QuotaExceeded { requested, used, max } => write!(
                f,
                "Storage quota exceeded: {} bytes requested, {} of {} bytes used",
                requested, used, max
            ),
            StorageError::Conflict { expected, found } => write!(
                f,
                "Concurrent write detected: expected revision {}, found {}",
                expected, found
            ),
            StorageError::Io(msg) => write!(f, "IO error: {}", msg),
            StorageError::Image(msg) => write!(f, "Image error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<SerdeError> for StorageError {
    fn from(err: SerdeError) -> Self {
        StorageError::Serialization(format!("JSON serialization error: {}", err))
    }
}

impl From<lmdb::Error> for StorageError {
    fn from(err: lmdb::Error) -> Self {
        match err {
            lmdb::Error::MapFull => {
                StorageError::Backend("LMDB map is full".to_string())
            }
            lmdb::Error::Corrupted => {
                StorageError::Backend("LMDB environment is corrupted".to_string())
            }
            _ => StorageError::Backend(format!("LMDB error: {}", err)),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<image::ImageError> for StorageError {
    fn from(err: image::ImageError) -> Self {
        StorageError::Image(err.to_string())
    }
}

impl From<base64::DecodeError> for StorageError {
    fn from(err: base64::DecodeError) -> Self {
        StorageError::Serialization(format!("Invalid base64 payload: {}", err))
    }
}

impl StorageError {
    /// Short machine-readable tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Backend(_) => "backend",
            StorageError::Serialization(_) => "serialization",
            StorageError::Uninitialized(_) => "uninitialized",
            StorageError::Validation(_) => "validation",
            StorageError::FileTooLarge { .. } => "file_too_large",
            StorageError::QuotaExceeded { .. } => "quota_exceeded",
            StorageError::Conflict { .. } => "conflict",
            StorageError::Io(_) => "io",
            StorageError::Image(_) => "image",
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
