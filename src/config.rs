//! Storage configuration.
//!
//! Defaults match the production web client. Overrides come from
//! `METROTECH_*` environment variables or from a JSON document with the same
//! field names in camelCase.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const DEFAULT_DATA_KEY: &str = "metrotech_data";
pub const DEFAULT_FILES_KEY: &str = "metrotech_files";
pub const DOCUMENT_VERSION: &str = "1.0.0";
pub const BACKUP_VERSION: &str = "1.0";

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidValue(String, String),
    Parse(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(var, msg) => {
                write!(f, "Invalid value for {}: {}", var, msg)
            }
            ConfigError::Parse(msg) => write!(f, "Invalid storage configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Backend key holding the record document.
    pub data_key: String,
    /// Backend key holding the file map.
    pub files_key: String,
    pub max_file_size: usize,
    pub max_total_storage: usize,
    /// Used when the document's settings carry no `dataRetention`.
    pub default_retention_days: u32,
    /// JPEG quality for `resize_image`, 1-100.
    pub image_quality: u8,
    /// LMDB map size; bounds the durable backend the way the browser bounds
    /// an origin's local storage.
    pub lmdb_map_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_key: DEFAULT_DATA_KEY.to_string(),
            files_key: DEFAULT_FILES_KEY.to_string(),
            max_file_size: 5 * MIB,
            max_total_storage: 50 * MIB,
            default_retention_days: 30,
            image_quality: 80,
            lmdb_map_size: 256 * MIB,
        }
    }
}

impl StorageConfig {
    /// Defaults overridden by any `METROTECH_*` variable that is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(key) = std::env::var("METROTECH_DATA_KEY") {
            config.data_key = key;
        }
        if let Ok(key) = std::env::var("METROTECH_FILES_KEY") {
            config.files_key = key;
        }
        if let Some(v) = env_number::<usize>("METROTECH_MAX_FILE_SIZE")? {
            config.max_file_size = v;
        }
        if let Some(v) = env_number::<usize>("METROTECH_MAX_TOTAL_STORAGE")? {
            config.max_total_storage = v;
        }
        if let Some(v) = env_number::<u32>("METROTECH_RETENTION_DAYS")? {
            config.default_retention_days = v;
        }
        if let Some(v) = env_number::<u8>("METROTECH_IMAGE_QUALITY")? {
            config.image_quality = v;
        }
        if let Some(v) = env_number::<usize>("METROTECH_LMDB_MAP_SIZE")? {
            config.lmdb_map_size = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: StorageConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_key.is_empty() || self.files_key.is_empty() {
            return Err(ConfigError::Parse("backend keys must not be empty".to_string()));
        }
        if self.data_key == self.files_key {
            return Err(ConfigError::Parse(
                "dataKey and filesKey must be distinct".to_string(),
            ));
        }
        if self.max_file_size > self.max_total_storage {
            return Err(ConfigError::Parse(format!(
                "maxFileSize ({}) exceeds maxTotalStorage ({})",
                self.max_file_size, self.max_total_storage
            )));
        }
        if !(1..=100).contains(&self.image_quality) {
            return Err(ConfigError::Parse(format!(
                "imageQuality must be within 1..=100, got {}",
                self.image_quality
            )));
        }
        Ok(())
    }
}

fn env_number<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(var.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}
