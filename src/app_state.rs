use std::sync::Arc;

use log::info;

use crate::backend::{KeyValueBackend, MemoryBackend};
use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::file_store::FileStore;
use crate::lmdb_backend::LmdbBackend;
use crate::record_store::DataStorage;
use crate::storage_error::StorageResult;

/// Record store and file store sharing one backend; the object handed out
/// across the C ABI.
pub struct AppStorage {
    lmdb: Option<Arc<LmdbBackend>>,
    pub records: DataStorage,
    pub files: FileStore,
}

impl AppStorage {
    /// Opens `<name>.lmdb` and initializes the record document if needed.
    pub fn open_lmdb(name: &str, config: StorageConfig) -> StorageResult<Self> {
        let lmdb = Arc::new(LmdbBackend::open(name, config.lmdb_map_size)?);
        let backend: Arc<dyn KeyValueBackend> = lmdb.clone();
        let mut app = Self::with_backend(backend, config, Arc::new(SystemClock))?;
        app.lmdb = Some(lmdb);
        info!("Storage '{}' opened", name);
        Ok(app)
    }

    pub fn in_memory(config: StorageConfig, clock: Arc<dyn Clock>) -> StorageResult<Self> {
        Self::with_backend(Arc::new(MemoryBackend::new()), config, clock)
    }

    pub fn with_backend(
        backend: Arc<dyn KeyValueBackend>,
        config: StorageConfig,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        let records = DataStorage::open(Arc::clone(&backend), config.clone(), Arc::clone(&clock))?;
        let files = FileStore::new(backend, config, clock);
        Ok(Self {
            lmdb: None,
            records,
            files,
        })
    }

    /// Releases the LMDB environment. In-memory storage has nothing to close.
    pub fn close(&self) -> StorageResult<()> {
        match &self.lmdb {
            Some(lmdb) => lmdb.close(),
            None => Ok(()),
        }
    }
}
