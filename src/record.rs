//! Records, section kinds and the helpers shared by the array operations.

use chrono::{DateTime, TimeZone, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// An element of an array-valued section.
///
/// Only `id` is interpreted by the store; everything else is carried through
/// untouched.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: JsonValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn into_value(self) -> JsonValue {
        let mut map = self.fields;
        map.insert("id".to_string(), JsonValue::String(self.id));
        JsonValue::Object(map)
    }
}

/// `<prefix>_<epoch-ms>_<9 base36 chars>`, the id shape the web client uses.
pub fn generate_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{prefix}_{millis}_{suffix}")
}

/// Known sections of the record document and the shape each one must have.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Forms,
    Users,
    Visits,
    News,
    Drafts,
    Completed,
    Connections,
    Messages,
    Settings,
    Logs,
    Custom(String),
}

impl SectionKind {
    pub const ARRAY_SECTIONS: [SectionKind; 8] = [
        SectionKind::Forms,
        SectionKind::Users,
        SectionKind::Visits,
        SectionKind::News,
        SectionKind::Drafts,
        SectionKind::Completed,
        SectionKind::Connections,
        SectionKind::Messages,
    ];

    pub fn parse(name: &str) -> Self {
        match name {
            "forms" => SectionKind::Forms,
            "users" => SectionKind::Users,
            "visits" => SectionKind::Visits,
            "news" => SectionKind::News,
            "drafts" => SectionKind::Drafts,
            "completed" => SectionKind::Completed,
            "connections" => SectionKind::Connections,
            "messages" => SectionKind::Messages,
            "settings" => SectionKind::Settings,
            "logs" => SectionKind::Logs,
            other => SectionKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SectionKind::Forms => "forms",
            SectionKind::Users => "users",
            SectionKind::Visits => "visits",
            SectionKind::News => "news",
            SectionKind::Drafts => "drafts",
            SectionKind::Completed => "completed",
            SectionKind::Connections => "connections",
            SectionKind::Messages => "messages",
            SectionKind::Settings => "settings",
            SectionKind::Logs => "logs",
            SectionKind::Custom(name) => name,
        }
    }

    /// Whether `value` has the shape this section requires. Custom sections
    /// accept anything.
    pub fn accepts(&self, value: &JsonValue) -> bool {
        match self {
            SectionKind::Settings | SectionKind::Logs => value.is_object(),
            SectionKind::Custom(_) => true,
            _ => value.is_array(),
        }
    }
}

pub(crate) fn record_id(value: &JsonValue) -> Option<&str> {
    value.get("id").and_then(JsonValue::as_str)
}

/// Reads a `timestamp` field stored either as RFC 3339 text or epoch millis.
pub(crate) fn record_timestamp(value: &JsonValue, field: &str) -> Option<DateTime<Utc>> {
    match value.get(field)? {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// `{...existing, ...patch}`. Both sides must be objects.
pub(crate) fn shallow_merge(existing: &mut JsonValue, patch: &Map<String, JsonValue>) -> bool {
    match existing.as_object_mut() {
        Some(target) => {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
            true
        }
        None => false,
    }
}
