//! In-memory mirror of one backend key that follows other tabs' writes.
//!
//! Every `set`/`update` is its own synchronous write; nothing is debounced.
//! If a write fails the new value stays in memory and the backend keeps the
//! old one until the next successful write or `sync`.

use std::sync::mpsc::{Receiver, TryRecvError};

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::KeyValueBackend;
use crate::storage_error::StorageResult;
use crate::sync::{StorageEvent, TabHandle};

pub struct PersistedValue<T> {
    tab: TabHandle,
    key: String,
    default: T,
    value: T,
    events: Option<Receiver<StorageEvent>>,
}

impl<T> PersistedValue<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Reads `key` through `tab`; missing or invalid JSON yields `default`.
    pub fn new(tab: &TabHandle, key: &str, default: T) -> Self {
        let events = match tab.subscribe() {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("'{}' will not follow other tabs: {e}", key);
                None
            }
        };
        let mut handle = Self {
            tab: tab.clone(),
            key: key.to_string(),
            value: default.clone(),
            default,
            events,
        };
        handle.value = handle.read_or_default();
        handle
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) -> StorageResult<()> {
        self.value = value;
        self.persist()
    }

    /// Functional update: `next = f(&previous)`.
    pub fn update<F>(&mut self, f: F) -> StorageResult<()>
    where
        F: FnOnce(&T) -> T,
    {
        self.value = f(&self.value);
        self.persist()
    }

    /// Applies pending changes made by other tabs. Returns whether the local
    /// value was replaced; local uncommitted state is overwritten.
    pub fn sync(&mut self) -> bool {
        let Some(events) = self.events.as_ref() else {
            return false;
        };

        let mut latest: Option<Option<String>> = None;
        loop {
            match events.try_recv() {
                Ok(event) => match event.key.as_deref() {
                    Some(k) if k == self.key => latest = Some(event.new_value),
                    Some(_) => {}
                    None => latest = Some(None),
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.events = None;
                    break;
                }
            }
        }

        match latest {
            Some(raw) => {
                self.value = self.parse_or_default(raw.as_deref());
                true
            }
            None => false,
        }
    }

    /// Re-reads the backend unconditionally, for periodic polling.
    pub fn reload(&mut self) {
        self.value = self.read_or_default();
    }

    fn persist(&self) -> StorageResult<()> {
        let json = serde_json::to_string(&self.value).map_err(|e| {
            warn!("Could not serialize '{}': {e}", self.key);
            e
        })?;
        self.tab.set_item(&self.key, &json).map_err(|e| {
            warn!("Could not persist '{}': {e}", self.key);
            e
        })
    }

    fn read_or_default(&self) -> T {
        match self.tab.get_item(&self.key) {
            Ok(raw) => self.parse_or_default(raw.as_deref()),
            Err(e) => {
                warn!("Could not read '{}': {e}", self.key);
                self.default.clone()
            }
        }
    }

    fn parse_or_default(&self, raw: Option<&str>) -> T {
        match raw {
            Some(raw) => match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Invalid JSON under '{}', using default: {e}", self.key);
                    self.default.clone()
                }
            },
            None => self.default.clone(),
        }
    }
}
