//! Durable [`KeyValueBackend`] on LMDB.
//!
//! The environment lives in `<name>.lmdb/` and holds a single named database
//! of UTF-8 keys and values. Closing drops the environment; every later call
//! fails with [`StorageError::Backend`] until the backend is reset.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{debug, info, warn};

use crate::backend::KeyValueBackend;
use crate::storage_error::{StorageError, StorageResult};

const DB_NAME: &str = "metrotech";

struct LmdbHandle {
    env: Environment,
    db: Database,
}

pub struct LmdbBackend {
    handle: RwLock<Option<LmdbHandle>>,
    path: RwLock<PathBuf>,
    map_size: usize,
}

impl LmdbBackend {
    /// Opens (or creates) `<name>.lmdb`.
    pub fn open(name: &str, map_size: usize) -> StorageResult<Self> {
        let path = lmdb_dir(name);
        let handle = open_handle(&path, map_size)?;
        info!("LMDB backend ready at {}", path.display());

        Ok(Self {
            handle: RwLock::new(Some(handle)),
            path: RwLock::new(path),
            map_size,
        })
    }

    pub fn path(&self) -> PathBuf {
        match self.path.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.read().map(|h| h.is_some()).unwrap_or(false)
    }

    /// Drops the environment. Safe to call twice.
    pub fn close(&self) -> StorageResult<()> {
        let mut guard = self
            .handle
            .write()
            .map_err(|_| StorageError::Backend("LMDB handle lock poisoned".to_string()))?;

        if let Some(handle) = guard.take() {
            if let Err(e) = handle.env.sync(true) {
                warn!("LMDB sync before close failed: {e}");
            }
            info!("LMDB environment closed");
        }
        Ok(())
    }

    /// Closes, deletes the current directory and opens a fresh `<name>.lmdb`.
    pub fn reset(&self, name: &str) -> StorageResult<()> {
        self.close()?;

        let old = self.path();
        if old.exists() {
            std::fs::remove_dir_all(&old)?;
            info!("Removed LMDB directory {}", old.display());
        }

        let new_path = lmdb_dir(name);
        let handle = open_handle(&new_path, self.map_size)?;

        let mut guard = self
            .handle
            .write()
            .map_err(|_| StorageError::Backend("LMDB handle lock poisoned".to_string()))?;
        *guard = Some(handle);
        if let Ok(mut p) = self.path.write() {
            *p = new_path;
        }
        Ok(())
    }

    fn with_handle<T>(&self, f: impl FnOnce(&LmdbHandle) -> StorageResult<T>) -> StorageResult<T> {
        let guard = self
            .handle
            .read()
            .map_err(|_| StorageError::Backend("LMDB handle lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(handle) => f(handle),
            None => Err(StorageError::Backend("LMDB environment is closed".to_string())),
        }
    }
}

impl KeyValueBackend for LmdbBackend {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        self.with_handle(|h| {
            let txn = h.env.begin_ro_txn()?;
            let value = match txn.get(h.db, &key) {
                Ok(bytes) => Some(String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StorageError::Serialization(format!("Non UTF-8 value under {key}: {e}"))
                })?),
                Err(lmdb::Error::NotFound) => None,
                Err(e) => return Err(e.into()),
            };
            txn.abort();
            Ok(value)
        })
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        self.with_handle(|h| {
            let mut txn = h.env.begin_rw_txn()?;
            match txn.put(h.db, &key, &value, WriteFlags::empty()) {
                Ok(()) => {}
                Err(lmdb::Error::MapFull) => {
                    return Err(StorageError::QuotaExceeded {
                        requested: key.len() + value.len(),
                        used: 0,
                        max: self.map_size,
                    })
                }
                Err(e) => return Err(e.into()),
            }
            txn.commit()?;
            debug!("LMDB wrote {} ({} bytes)", key, value.len());
            Ok(())
        })
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        self.with_handle(|h| {
            let mut txn = h.env.begin_rw_txn()?;
            match txn.del(h.db, &key, None) {
                Ok(()) | Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
            txn.commit()?;
            Ok(())
        })
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        self.with_handle(|h| {
            let txn = h.env.begin_ro_txn()?;
            let mut keys = Vec::new();
            {
                let mut cursor = txn.open_ro_cursor(h.db)?;
                for (key, _) in cursor.iter_start() {
                    match std::str::from_utf8(key) {
                        Ok(k) => keys.push(k.to_string()),
                        Err(e) => warn!("Skipping non UTF-8 LMDB key: {e}"),
                    }
                }
            }
            txn.abort();
            Ok(keys)
        })
    }

    fn clear(&self) -> StorageResult<()> {
        self.with_handle(|h| {
            let mut txn = h.env.begin_rw_txn()?;
            txn.clear_db(h.db)?;
            txn.commit()?;
            info!("LMDB database cleared");
            Ok(())
        })
    }
}

fn lmdb_dir(name: &str) -> PathBuf {
    PathBuf::from(format!("{name}.lmdb"))
}

fn open_handle(path: &Path, map_size: usize) -> StorageResult<LmdbHandle> {
    std::fs::create_dir_all(path)?;
    let env = Environment::new()
        .set_max_dbs(1)
        .set_map_size(map_size)
        .open(path)?;
    let db = env.create_db(Some(DB_NAME), DatabaseFlags::empty())?;
    Ok(LmdbHandle { env, db })
}
