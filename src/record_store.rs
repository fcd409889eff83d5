//! Namespaced record store: one JSON [`Document`] under one backend key.
//!
//! Every mutation is a read-modify-write of the whole document. Writes carry
//! the revision they were read at; if another handle wrote in between, the
//! write is refused with [`StorageError::Conflict`] instead of silently
//! overwriting the other change.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};

use crate::backend::KeyValueBackend;
use crate::clock::Clock;
use crate::config::{StorageConfig, BACKUP_VERSION};
use crate::document::{Document, Settings};
use crate::record::{record_id, record_timestamp, shallow_merge, SectionKind};
use crate::storage_error::{StorageError, StorageResult};

/// Legacy top-level keys written by the per-key storage layout, and the
/// section each one maps to. `logs.<kind>` targets a log array.
pub const LEGACY_KEYS: [(&str, &str); 11] = [
    ("metrotech_forms", "forms"),
    ("metrotech_users", "users"),
    ("metrotech_news", "news"),
    ("metrotech_drafts", "drafts"),
    ("metrotech_completed", "completed"),
    ("metrotech_connections", "connections"),
    ("metrotech_messages", "messages"),
    ("metrotech_settings", "settings"),
    ("site_visits", "visits"),
    ("metrotech_login_logs", "logs.logins"),
    ("metrotech_email_logs", "logs.emails"),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_size: usize,
    pub forms_count: usize,
    pub visits_count: usize,
    pub news_count: usize,
    pub version: String,
    pub revision: u64,
    pub last_update: DateTime<Utc>,
    pub last_backup: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub retention_days: u64,
    pub visits_removed: usize,
    pub logs_removed: usize,
}

impl CleanupReport {
    pub fn total_removed(&self) -> usize {
        self.visits_removed + self.logs_removed
    }
}

pub struct DataStorage {
    backend: Arc<dyn KeyValueBackend>,
    clock: Arc<dyn Clock>,
    config: StorageConfig,
}

impl DataStorage {
    /// Opens the store and writes a default document if none exists yet.
    pub fn open(
        backend: Arc<dyn KeyValueBackend>,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        let store = Self {
            backend,
            clock,
            config,
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> StorageResult<()> {
        if self.backend.get_item(&self.config.data_key)?.is_some() {
            return Ok(());
        }
        let doc = Document::new(self.clock.now());
        self.write_document(&doc)?;
        info!("Initialized record document under '{}'", self.config.data_key);
        Ok(())
    }

    fn write_document(&self, doc: &Document) -> StorageResult<()> {
        let json = serde_json::to_string(doc)?;
        self.backend.set_item(&self.config.data_key, &json)
    }

    fn stored_revision(&self) -> StorageResult<Option<u64>> {
        Ok(self.get_all_data()?.map(|doc| doc.revision))
    }

    /// The whole document, normalized. `Ok(None)` if the key is absent.
    pub fn get_all_data(&self) -> StorageResult<Option<Document>> {
        let Some(raw) = self.backend.get_item(&self.config.data_key)? else {
            return Ok(None);
        };
        let mut doc: Document = serde_json::from_str(&raw).map_err(|e| {
            warn!("Stored document under '{}' is unreadable: {e}", self.config.data_key);
            StorageError::from(e)
        })?;
        doc.normalize(self.clock.now());
        Ok(Some(doc))
    }

    /// Writes `doc` if nobody else wrote since it was read.
    ///
    /// On success `doc.updated_at` and `doc.revision` reflect what was stored.
    /// An unreadable stored document has no revision to compare against and
    /// is overwritten.
    pub fn save_all_data(&self, doc: &mut Document) -> StorageResult<()> {
        let stored = match self.stored_revision() {
            Ok(found) => found,
            Err(StorageError::Serialization(e)) => {
                warn!("Overwriting unreadable document under '{}': {e}", self.config.data_key);
                None
            }
            Err(e) => return Err(e),
        };
        if let Some(found) = stored {
            if found != doc.revision {
                warn!(
                    "Refusing stale write: document read at revision {}, store is at {}",
                    doc.revision, found
                );
                return Err(StorageError::Conflict {
                    expected: doc.revision,
                    found,
                });
            }
        }

        let previous = (doc.updated_at, doc.revision);
        doc.updated_at = self.clock.now();
        doc.revision += 1;

        if let Err(e) = self.write_document(doc) {
            warn!("Failed to save document: {e}");
            (doc.updated_at, doc.revision) = previous;
            return Err(e);
        }
        debug!("Saved document at revision {}", doc.revision);
        Ok(())
    }

    fn load_existing(&self, op: &str) -> StorageResult<Document> {
        self.get_all_data()?.ok_or_else(|| {
            StorageError::Uninitialized(format!(
                "{op}: no document under '{}'",
                self.config.data_key
            ))
        })
    }

    pub fn get_data(&self, section: &str) -> StorageResult<Option<JsonValue>> {
        Ok(self
            .get_all_data()?
            .and_then(|doc| doc.section(section).cloned()))
    }

    pub fn save_data(&self, section: &str, value: JsonValue) -> StorageResult<()> {
        let kind = SectionKind::parse(section);
        if !kind.accepts(&value) {
            return Err(StorageError::Validation(format!(
                "section '{}' cannot hold this value",
                section
            )));
        }
        let mut doc = self.load_existing("save_data")?;
        doc.set_section(section, value);
        self.save_all_data(&mut doc)
    }

    fn section_array(doc: &Document, section: &str) -> StorageResult<Vec<JsonValue>> {
        match doc.section(section) {
            None | Some(JsonValue::Null) => Ok(Vec::new()),
            Some(JsonValue::Array(items)) => Ok(items.clone()),
            Some(_) => Err(StorageError::Validation(format!(
                "section '{}' is not an array",
                section
            ))),
        }
    }

    pub fn add_to_array(&self, section: &str, item: JsonValue) -> StorageResult<()> {
        let mut doc = self.load_existing("add_to_array")?;
        let mut items = Self::section_array(&doc, section)?;
        items.push(item);
        doc.set_section(section, JsonValue::Array(items));
        self.save_all_data(&mut doc)
    }

    /// Removes every element whose `id` matches. Zero matches still writes
    /// and succeeds.
    pub fn remove_from_array(&self, section: &str, id: &str) -> StorageResult<usize> {
        let mut doc = self.load_existing("remove_from_array")?;
        let items = Self::section_array(&doc, section)?;
        let before = items.len();
        let kept: Vec<JsonValue> = items
            .into_iter()
            .filter(|item| record_id(item) != Some(id))
            .collect();
        let removed = before - kept.len();
        doc.set_section(section, JsonValue::Array(kept));
        self.save_all_data(&mut doc)?;
        Ok(removed)
    }

    /// Shallow-merges `patch` into the first element with this `id`.
    /// `Ok(false)` without writing when no element matches.
    pub fn update_in_array(
        &self,
        section: &str,
        id: &str,
        patch: JsonValue,
    ) -> StorageResult<bool> {
        let JsonValue::Object(patch) = patch else {
            return Err(StorageError::Validation(
                "update patch must be a JSON object".to_string(),
            ));
        };

        let mut doc = self.load_existing("update_in_array")?;
        let mut items = Self::section_array(&doc, section)?;
        let Some(target) = items.iter_mut().find(|item| record_id(item) == Some(id)) else {
            debug!("update_in_array: no '{}' in '{}'", id, section);
            return Ok(false);
        };
        if !shallow_merge(target, &patch) {
            return Err(StorageError::Validation(format!(
                "element '{}' in '{}' is not an object",
                id, section
            )));
        }
        doc.set_section(section, JsonValue::Array(items));
        self.save_all_data(&mut doc)?;
        Ok(true)
    }

    /// Pretty JSON of the document plus a top-level export `timestamp`.
    pub fn export_data(&self) -> StorageResult<String> {
        let doc = self.load_existing("export_data")?;
        let mut value = serde_json::to_value(&doc)?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "timestamp".to_string(),
                JsonValue::String(self.clock.now().to_rfc3339()),
            );
        }
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Replaces the document wholesale. A parse failure leaves the stored
    /// document untouched.
    pub fn import_data(&self, json: &str) -> StorageResult<()> {
        let value: JsonValue = serde_json::from_str(json).map_err(|e| {
            warn!("Rejected import: {e}");
            StorageError::from(e)
        })?;
        let mut doc = Document::from_export(value, self.clock.now())?;
        let quarantined = doc.normalize(self.clock.now());
        if !quarantined.is_empty() {
            warn!("Import quarantined sections: {:?}", quarantined);
        }

        doc.revision = self.stored_revision().unwrap_or(None).unwrap_or(0) + 1;
        doc.updated_at = self.clock.now();
        self.write_document(&doc)?;
        info!("Imported document (revision {})", doc.revision);
        Ok(())
    }

    /// Pretty JSON of the document plus `backupDate`/`backupVersion`;
    /// stamps `lastBackup` on the stored document.
    pub fn create_backup(&self) -> StorageResult<String> {
        let mut doc = self.load_existing("create_backup")?;
        let now = self.clock.now();
        doc.last_backup = Some(now);
        self.save_all_data(&mut doc)?;

        let mut value = serde_json::to_value(&doc)?;
        if let Some(map) = value.as_object_mut() {
            map.insert("backupDate".to_string(), JsonValue::String(now.to_rfc3339()));
            map.insert(
                "backupVersion".to_string(),
                JsonValue::String(BACKUP_VERSION.to_string()),
            );
        }
        info!("Created backup at revision {}", doc.revision);
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Drops visits and log entries older than the retention window.
    ///
    /// Entries are kept only when `timestamp > now - retention`; an entry
    /// without a readable timestamp is dropped. A window reaching past the
    /// earliest representable date keeps everything.
    pub fn clean_old_data(&self) -> StorageResult<CleanupReport> {
        let mut doc = self.load_existing("clean_old_data")?;
        let retention_days = doc
            .section(SectionKind::Settings.as_str())
            .and_then(|s| s.get("dataRetention"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(u64::from(self.config.default_retention_days));

        let mut report = CleanupReport {
            retention_days,
            ..CleanupReport::default()
        };

        let Some(cutoff) = retention_cutoff(self.clock.now(), retention_days) else {
            info!("Retention window of {} days removes nothing", retention_days);
            return Ok(report);
        };

        if let Some(JsonValue::Array(visits)) = doc.sections.get_mut(SectionKind::Visits.as_str()) {
            report.visits_removed = retain_recent(visits, cutoff);
        }
        if let Some(JsonValue::Object(logs)) = doc.sections.get_mut(SectionKind::Logs.as_str()) {
            for entries in logs.values_mut() {
                if let JsonValue::Array(entries) = entries {
                    report.logs_removed += retain_recent(entries, cutoff);
                }
            }
        }

        self.save_all_data(&mut doc)?;
        info!(
            "Retention cleanup ({} days): {} visits, {} log entries removed",
            retention_days, report.visits_removed, report.logs_removed
        );
        Ok(report)
    }

    pub fn get_storage_stats(&self) -> StorageResult<StorageStats> {
        let doc = self.load_existing("get_storage_stats")?;
        let total_size = serde_json::to_string(&doc)?.len();
        Ok(StorageStats {
            total_size,
            forms_count: doc.array_len(SectionKind::Forms.as_str()),
            visits_count: doc.array_len(SectionKind::Visits.as_str()),
            news_count: doc.array_len(SectionKind::News.as_str()),
            version: doc.version.clone(),
            revision: doc.revision,
            last_update: doc.updated_at,
            last_backup: doc.last_backup,
        })
    }

    /// Overwrites the stored document with a fresh default one.
    pub fn reset(&self) -> StorageResult<()> {
        let mut doc = Document::new(self.clock.now());
        doc.revision = self.stored_revision().unwrap_or(None).unwrap_or(0) + 1;
        self.write_document(&doc)?;
        info!("Record document reset");
        Ok(())
    }

    pub fn get_settings(&self) -> StorageResult<Settings> {
        Ok(self.load_existing("get_settings")?.settings())
    }

    pub fn save_settings(&self, settings: &Settings) -> StorageResult<()> {
        self.save_data(SectionKind::Settings.as_str(), serde_json::to_value(settings)?)
    }

    /// Appends to `logs.<kind>`, stamping `timestamp` when the entry has none.
    pub fn append_log(&self, kind: &str, mut entry: JsonValue) -> StorageResult<()> {
        let Some(fields) = entry.as_object_mut() else {
            return Err(StorageError::Validation(
                "log entry must be a JSON object".to_string(),
            ));
        };
        fields
            .entry("timestamp".to_string())
            .or_insert_with(|| JsonValue::String(self.clock.now().to_rfc3339()));

        let mut doc = self.load_existing("append_log")?;
        let logs = doc
            .sections
            .entry(SectionKind::Logs.as_str().to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        let Some(logs) = logs.as_object_mut() else {
            return Err(StorageError::Validation("logs section is not an object".to_string()));
        };
        match logs
            .entry(kind.to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()))
        {
            JsonValue::Array(entries) => entries.push(entry),
            _ => {
                return Err(StorageError::Validation(format!(
                    "logs.{} is not an array",
                    kind
                )))
            }
        }
        self.save_all_data(&mut doc)
    }

    /// Folds the legacy one-key-per-section layout into the document.
    ///
    /// Only sections that are still empty are filled, so running this twice
    /// is harmless. Legacy keys are left in place.
    pub fn migrate_legacy_keys(&self) -> StorageResult<Vec<String>> {
        let mut doc = self.load_existing("migrate_legacy_keys")?;
        let mut migrated = Vec::new();

        for (key, target) in LEGACY_KEYS {
            let Some(raw) = self.backend.get_item(key)? else {
                continue;
            };
            let value: JsonValue = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Skipping unreadable legacy key '{}': {e}", key);
                    continue;
                }
            };
            if migrate_into(&mut doc, target, value) {
                migrated.push(target.to_string());
            }
        }

        if !migrated.is_empty() {
            self.save_all_data(&mut doc)?;
            info!("Migrated legacy keys into sections {:?}", migrated);
        }
        Ok(migrated)
    }
}

fn retention_cutoff(now: DateTime<Utc>, days: u64) -> Option<DateTime<Utc>> {
    let days = u32::try_from(days).ok()?;
    now.checked_sub_signed(Duration::days(i64::from(days)))
}

fn retain_recent(entries: &mut Vec<JsonValue>, cutoff: DateTime<Utc>) -> usize {
    let before = entries.len();
    entries.retain(|entry| matches!(record_timestamp(entry, "timestamp"), Some(ts) if ts > cutoff));
    before - entries.len()
}

fn is_empty_section(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::Array(items)) => items.is_empty(),
        _ => false,
    }
}

fn migrate_into(doc: &mut Document, target: &str, value: JsonValue) -> bool {
    if let Some(kind) = target.strip_prefix("logs.") {
        if !value.is_array() {
            warn!("Legacy log '{}' is not an array", kind);
            return false;
        }
        let logs = doc
            .sections
            .entry(SectionKind::Logs.as_str().to_string())
            .or_insert_with(|| json!({}));
        let Some(logs) = logs.as_object_mut() else {
            return false;
        };
        if !is_empty_section(logs.get(kind)) {
            return false;
        }
        logs.insert(kind.to_string(), value);
        return true;
    }

    let kind = SectionKind::parse(target);
    if !kind.accepts(&value) {
        warn!("Legacy value for '{}' has an unexpected shape", target);
        return false;
    }
    if kind == SectionKind::Settings {
        // Settings are an object, so "empty" means never customised.
        let current = doc.settings();
        if current != Settings::default() {
            return false;
        }
    } else if !is_empty_section(doc.section(target)) {
        return false;
    }
    doc.set_section(target, value);
    true
}
