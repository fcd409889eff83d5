//! Quota-bound file store.
//!
//! Files are kept apart from the record document, as one JSON object mapping
//! file id to [`FileRecord`] under the configured files key. Sizes are the
//! byte length of the stored data URL. Both quotas are checked at write time
//! only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::backend::KeyValueBackend;
use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::image_resize::{self, DataUrl};
use crate::storage_error::{StorageError, StorageResult};

pub const IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

pub const DOCUMENT_TYPES: [&str; 7] = [
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/plain",
    "text/csv",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Base64 data URL.
    pub data: String,
    pub size: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// Stored shape of a file entry. Older writers keyed entries by id without
/// repeating it and never recorded `lastAccessed`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredFile {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(rename = "type")]
    mime_type: String,
    data: String,
    size: usize,
    created_at: DateTime<Utc>,
    #[serde(default)]
    last_accessed: Option<DateTime<Utc>>,
}

impl StoredFile {
    fn into_record(self, key: &str) -> FileRecord {
        FileRecord {
            id: self.id.unwrap_or_else(|| key.to_string()),
            name: self.name,
            mime_type: self.mime_type,
            data: self.data,
            size: self.size,
            last_accessed: self.last_accessed.unwrap_or(self.created_at),
            created_at: self.created_at,
        }
    }
}

/// What an upload form knows about a file before it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCandidate {
    pub name: String,
    pub mime_type: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Self { valid: true, error: None }
    }

    fn rejected(msg: String) -> Self {
        Self {
            valid: false,
            error: Some(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStorageStats {
    pub total_size: usize,
    pub file_count: usize,
    /// Keyed by the top-level MIME type: `image`, `application`, `text`...
    pub by_type: BTreeMap<String, usize>,
    pub oldest_file: Option<DateTime<Utc>>,
    pub remaining: usize,
}

type FileMap = BTreeMap<String, FileRecord>;

pub struct FileStore {
    backend: Arc<dyn KeyValueBackend>,
    clock: Arc<dyn Clock>,
    config: StorageConfig,
}

impl FileStore {
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            clock,
            config,
        }
    }

    fn load(&self) -> StorageResult<FileMap> {
        let Some(raw) = self.backend.get_item(&self.config.files_key)? else {
            return Ok(FileMap::new());
        };
        let stored: BTreeMap<String, StoredFile> = serde_json::from_str(&raw).map_err(|e| {
            warn!("File map under '{}' is unreadable: {e}", self.config.files_key);
            StorageError::from(e)
        })?;
        Ok(stored
            .into_iter()
            .map(|(key, file)| {
                let record = file.into_record(&key);
                (key, record)
            })
            .collect())
    }

    fn store(&self, files: &FileMap) -> StorageResult<()> {
        let json = serde_json::to_string(files)?;
        self.backend.set_item(&self.config.files_key, &json)
    }

    /// Stores `data` under `id`, replacing any file with the same id.
    pub fn save_file(
        &self,
        id: &str,
        data: &str,
        name: &str,
        mime_type: &str,
    ) -> StorageResult<FileRecord> {
        let size = data.len();
        if size > self.config.max_file_size {
            warn!("Rejected '{}': {} bytes over the per-file limit", name, size);
            return Err(StorageError::FileTooLarge {
                size,
                max: self.config.max_file_size,
            });
        }

        let mut files = self.load()?;
        let used: usize = files
            .values()
            .filter(|f| f.id != id)
            .map(|f| f.size)
            .sum();
        if used + size > self.config.max_total_storage {
            warn!("Rejected '{}': aggregate quota exhausted", name);
            return Err(StorageError::QuotaExceeded {
                requested: size,
                used,
                max: self.config.max_total_storage,
            });
        }

        let now = self.clock.now();
        let record = FileRecord {
            id: id.to_string(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            data: data.to_string(),
            size,
            created_at: now,
            last_accessed: now,
        };
        files.insert(id.to_string(), record.clone());
        self.store(&files)?;
        info!("Stored file '{}' ({} bytes)", name, size);
        Ok(record)
    }

    /// Reading refreshes `lastAccessed`; a failure to persist that stamp is
    /// logged and does not fail the read.
    pub fn get_file(&self, id: &str) -> StorageResult<Option<FileRecord>> {
        let mut files = self.load()?;
        let Some(record) = files.get_mut(id) else {
            return Ok(None);
        };
        record.last_accessed = self.clock.now();
        let record = record.clone();
        if let Err(e) = self.store(&files) {
            warn!("Could not refresh lastAccessed for '{}': {e}", id);
        }
        Ok(Some(record))
    }

    /// Returns whether a file was removed. Unknown ids are not an error.
    pub fn delete_file(&self, id: &str) -> StorageResult<bool> {
        let mut files = self.load()?;
        let existed = files.remove(id).is_some();
        if existed {
            self.store(&files)?;
            debug!("Deleted file '{}'", id);
        }
        Ok(existed)
    }

    /// All files, oldest first.
    pub fn get_all_files(&self) -> StorageResult<Vec<FileRecord>> {
        let mut files: Vec<FileRecord> = self.load()?.into_values().collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(files)
    }

    pub fn validate_image(&self, file: &FileCandidate) -> Validation {
        self.validate_against(file, &IMAGE_TYPES, "image")
    }

    pub fn validate_document(&self, file: &FileCandidate) -> Validation {
        self.validate_against(file, &DOCUMENT_TYPES, "document")
    }

    fn validate_against(&self, file: &FileCandidate, allowed: &[&str], label: &str) -> Validation {
        if !allowed.contains(&file.mime_type.as_str()) {
            return Validation::rejected(format!(
                "Unsupported {} type '{}' for '{}'",
                label, file.mime_type, file.name
            ));
        }
        if file.size > self.config.max_file_size {
            return Validation::rejected(format!(
                "'{}' is {} bytes; the limit is {} bytes",
                file.name, file.size, self.config.max_file_size
            ));
        }
        Validation::ok()
    }

    pub fn resize_image(
        &self,
        data_url: &str,
        max_width: u32,
        max_height: u32,
    ) -> StorageResult<String> {
        image_resize::resize_image(data_url, max_width, max_height, self.config.image_quality)
    }

    /// Deletes files created more than `days_old` days ago. A cutoff before
    /// the earliest representable date matches nothing.
    pub fn clean_old_files(&self, days_old: u32) -> StorageResult<usize> {
        let Some(cutoff) = self
            .clock
            .now()
            .checked_sub_signed(Duration::days(i64::from(days_old)))
        else {
            return Ok(0);
        };
        let mut files = self.load()?;
        let before = files.len();
        files.retain(|_, f| f.created_at >= cutoff);
        let removed = before - files.len();
        if removed > 0 {
            self.store(&files)?;
            info!("Removed {} files older than {} days", removed, days_old);
        }
        Ok(removed)
    }

    pub fn get_file_storage_stats(&self) -> StorageResult<FileStorageStats> {
        let files = self.load()?;
        let total_size: usize = files.values().map(|f| f.size).sum();
        let mut by_type = BTreeMap::new();
        for file in files.values() {
            let top = file
                .mime_type
                .split('/')
                .next()
                .filter(|t| !t.is_empty())
                .unwrap_or("unknown");
            *by_type.entry(top.to_string()).or_insert(0) += 1;
        }
        Ok(FileStorageStats {
            total_size,
            file_count: files.len(),
            by_type,
            oldest_file: files.values().map(|f| f.created_at).min(),
            remaining: self.config.max_total_storage.saturating_sub(total_size),
        })
    }

    /// Writes the decoded file into `dest_dir` under its stored name and
    /// returns the path. `Ok(None)` for an unknown id.
    pub fn download_file(&self, id: &str, dest_dir: &Path) -> StorageResult<Option<PathBuf>> {
        let Some(record) = self.get_file(id)? else {
            return Ok(None);
        };
        let decoded = DataUrl::parse(&record.data)?;
        let file_name = Path::new(&record.name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| record.id.clone().into());

        std::fs::create_dir_all(dest_dir)?;
        let path = dest_dir.join(file_name);
        std::fs::write(&path, &decoded.bytes)?;
        info!("Downloaded '{}' to {}", record.name, path.display());
        Ok(Some(path))
    }
}
