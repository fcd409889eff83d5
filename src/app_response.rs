use std::fmt::{Display, Formatter};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeError;

use crate::storage_error::StorageError;

/// JSON envelope returned by every C ABI function.
#[derive(Debug, Serialize, Deserialize)]
pub enum AppResponse {
    DatabaseError(String),
    SerializationError(String),
    NotFound(String),
    ValidationError(String),
    QuotaExceeded(String),
    Conflict(String),
    BadRequest(String),
    Ok(String),
}

impl Display for AppResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AppResponse::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppResponse::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            AppResponse::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppResponse::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppResponse::QuotaExceeded(msg) => write!(f, "Quota exceeded: {}", msg),
            AppResponse::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppResponse::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            AppResponse::Ok(msg) => write!(f, "Ok: {}", msg),
        }
    }
}

impl From<StorageError> for AppResponse {
    fn from(err: StorageError) -> Self {
        let msg = err.to_string();
        debug!("Storage call failed ({}): {}", err.kind(), msg);
        match err {
            StorageError::Serialization(_) => AppResponse::SerializationError(msg),
            StorageError::Validation(_) | StorageError::Image(_) => {
                AppResponse::ValidationError(msg)
            }
            StorageError::FileTooLarge { .. } | StorageError::QuotaExceeded { .. } => {
                AppResponse::QuotaExceeded(msg)
            }
            StorageError::Conflict { .. } => AppResponse::Conflict(msg),
            StorageError::Backend(_) | StorageError::Uninitialized(_) | StorageError::Io(_) => {
                AppResponse::DatabaseError(msg)
            }
        }
    }
}

impl From<SerdeError> for AppResponse {
    fn from(err: SerdeError) -> Self {
        AppResponse::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl AppResponse {
    pub fn success(msg: impl Into<String>) -> Self {
        AppResponse::Ok(msg.into())
    }
}
