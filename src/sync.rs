//! Cross-handle change notification.
//!
//! A [`StorageHub`] owns one shared backend. Each [`TabHandle`] opened on it
//! is a full [`KeyValueBackend`]; its writes are forwarded to the backend and
//! announced to the subscribers of every *other* tab, never to the writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::backend::KeyValueBackend;
use crate::storage_error::{StorageError, StorageResult};

/// One backend mutation as seen by another tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// `None` when the whole backend was cleared.
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

struct Subscriber {
    tab_id: u64,
    sender: Sender<StorageEvent>,
}

struct HubInner {
    backend: Arc<dyn KeyValueBackend>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_tab: AtomicU64,
}

#[derive(Clone)]
pub struct StorageHub {
    inner: Arc<HubInner>,
}

impl StorageHub {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                backend,
                subscribers: Mutex::new(Vec::new()),
                next_tab: AtomicU64::new(1),
            }),
        }
    }

    pub fn open_tab(&self) -> TabHandle {
        let id = self.inner.next_tab.fetch_add(1, Ordering::Relaxed);
        debug!("opened storage tab {}", id);
        TabHandle {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl HubInner {
    fn publish(&self, origin: u64, event: StorageEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        // Dropped receivers are pruned here.
        subscribers.retain(|sub| {
            if sub.tab_id == origin {
                return true;
            }
            sub.sender.send(event.clone()).is_ok()
        });
    }
}

#[derive(Clone)]
pub struct TabHandle {
    inner: Arc<HubInner>,
    id: u64,
}

impl TabHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receives every change made through other tabs from now on.
    pub fn subscribe(&self) -> StorageResult<Receiver<StorageEvent>> {
        let (sender, receiver) = channel();
        self.inner
            .subscribers
            .lock()
            .map_err(|_| StorageError::Backend("subscriber list lock poisoned".to_string()))?
            .push(Subscriber {
                tab_id: self.id,
                sender,
            });
        Ok(receiver)
    }
}

impl KeyValueBackend for TabHandle {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        self.inner.backend.get_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let old_value = self.inner.backend.get_item(key)?;
        self.inner.backend.set_item(key, value)?;
        self.inner.publish(
            self.id,
            StorageEvent {
                key: Some(key.to_string()),
                old_value,
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        let old_value = self.inner.backend.get_item(key)?;
        self.inner.backend.remove_item(key)?;
        if old_value.is_some() {
            self.inner.publish(
                self.id,
                StorageEvent {
                    key: Some(key.to_string()),
                    old_value,
                    new_value: None,
                },
            );
        }
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        self.inner.backend.keys()
    }

    fn clear(&self) -> StorageResult<()> {
        self.inner.backend.clear()?;
        self.inner.publish(
            self.id,
            StorageEvent {
                key: None,
                old_value: None,
                new_value: None,
            },
        );
        Ok(())
    }
}
