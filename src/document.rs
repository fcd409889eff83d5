//! The single JSON document behind the record store.
//!
//! Metadata fields live at the top level next to the sections, so the stored
//! JSON reads `{"version": .., "createdAt": .., "forms": [..], ...}`.

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::config::DOCUMENT_VERSION;
use crate::record::SectionKind;

pub const QUARANTINE_SECTION: &str = "quarantine";

/// Top-level keys a backup or export adds on top of the document.
pub(crate) const ENVELOPE_KEYS: [&str; 3] = ["backupDate", "backupVersion", "timestamp"];

pub const LOG_KINDS: [&str; 3] = ["logins", "emails", "actions"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every successful write.
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub sections: Map<String, JsonValue>,
}

impl Document {
    /// A document with every default section present.
    pub fn new(now: DateTime<Utc>) -> Self {
        let mut doc = Self {
            version: DOCUMENT_VERSION.to_string(),
            created_at: now,
            updated_at: now,
            revision: 0,
            last_backup: None,
            sections: Map::new(),
        };
        doc.fill_missing_sections();
        doc
    }

    pub fn section(&self, name: &str) -> Option<&JsonValue> {
        self.sections.get(name)
    }

    pub fn set_section(&mut self, name: &str, value: JsonValue) {
        self.sections.insert(name.to_string(), value);
    }

    /// Typed settings; unreadable settings fall back to defaults.
    pub fn settings(&self) -> Settings {
        match self.sections.get(SectionKind::Settings.as_str()) {
            Some(value) => match serde_json::from_value::<Settings>(value.clone()) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Unreadable settings section, using defaults: {e}");
                    Settings::default()
                }
            },
            None => Settings::default(),
        }
    }

    pub fn array_len(&self, name: &str) -> usize {
        self.sections
            .get(name)
            .and_then(JsonValue::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn fill_missing_sections(&mut self) {
        for kind in SectionKind::ARRAY_SECTIONS.iter() {
            self.sections
                .entry(kind.as_str().to_string())
                .or_insert_with(|| JsonValue::Array(Vec::new()));
        }
        self.sections
            .entry(SectionKind::Settings.as_str().to_string())
            .or_insert_with(|| json!(Settings::default()));
        let logs = self
            .sections
            .entry(SectionKind::Logs.as_str().to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
        if let Some(logs) = logs.as_object_mut() {
            for kind in LOG_KINDS {
                logs.entry(kind.to_string())
                    .or_insert_with(|| JsonValue::Array(Vec::new()));
            }
        }
    }

    /// Brings a loaded document to the current layout.
    ///
    /// Known sections with the wrong shape are moved into the quarantine
    /// section and reset; an older `version` gets its missing sections added.
    /// Returns the names of quarantined sections.
    pub fn normalize(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut quarantined = Vec::new();

        let names: Vec<String> = self.sections.keys().cloned().collect();
        for name in names {
            if name == QUARANTINE_SECTION {
                continue;
            }
            let kind = SectionKind::parse(&name);
            let Some(value) = self.sections.get(&name) else {
                continue;
            };
            if kind.accepts(value) {
                continue;
            }

            warn!(
                "Section '{}' has an unexpected shape; moving it to quarantine",
                name
            );
            if let Some(bad) = self.sections.remove(&name) {
                let quarantine = self
                    .sections
                    .entry(QUARANTINE_SECTION.to_string())
                    .or_insert_with(|| JsonValue::Object(Map::new()));
                if let Some(q) = quarantine.as_object_mut() {
                    q.insert(
                        name.clone(),
                        json!({ "value": bad, "quarantinedAt": now.to_rfc3339() }),
                    );
                }
            }
            quarantined.push(name);
        }

        if self.version != DOCUMENT_VERSION {
            warn!(
                "Migrating document from version {} to {}",
                self.version, DOCUMENT_VERSION
            );
            self.version = DOCUMENT_VERSION.to_string();
        }
        self.fill_missing_sections();

        quarantined
    }

    /// Parses an export or backup, dropping its envelope keys and filling any
    /// missing metadata from `now`.
    pub fn from_export(value: JsonValue, now: DateTime<Utc>) -> Result<Self, serde_json::Error> {
        let mut map = match value {
            JsonValue::Object(map) => map,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected a JSON object, found {}",
                    json_type_name(&other)
                )))
            }
        };
        for key in ENVELOPE_KEYS {
            map.remove(key);
        }
        map.entry("version".to_string())
            .or_insert_with(|| JsonValue::String(DOCUMENT_VERSION.to_string()));
        map.entry("createdAt".to_string())
            .or_insert_with(|| JsonValue::String(now.to_rfc3339()));
        map.entry("updatedAt".to_string())
            .or_insert_with(|| JsonValue::String(now.to_rfc3339()));

        serde_json::from_value(JsonValue::Object(map))
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Back-office preferences. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub theme: String,
    pub language: String,
    pub auto_save: bool,
    /// Seconds.
    pub auto_save_interval: u64,
    pub email_notifications: bool,
    pub browser_notifications: bool,
    /// Days.
    pub data_retention: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: "light".to_string(),
            language: "fr".to_string(),
            auto_save: true,
            auto_save_interval: 30,
            email_notifications: true,
            browser_notifications: true,
            data_retention: 30,
        }
    }
}
