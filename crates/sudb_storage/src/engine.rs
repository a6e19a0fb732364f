//! The storage engine: composition root for collections, the memory store,
//! tables, and backups. The engine owns the store and hands it the data
//! root at construction; shutdown is a downward call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use sudb_common::{StorageType, SudbError, SudbResult};
use sudb_security::CryptoManager;

use crate::backup::{BackupInfo, BackupManager};
use crate::collection::{Collection, CollectionManager};
use crate::memory::{AutosaveHandle, MemoryStore};
use crate::table::TableStore;

pub struct StorageEngine {
    data_dir: PathBuf,
    collections: CollectionManager,
    memory: Arc<MemoryStore>,
    backups: BackupManager,
    autosave: Mutex<Option<AutosaveHandle>>,
}

impl StorageEngine {
    /// Open the engine: create both roots, load collection metadata and
    /// on-disk records, and start the autosave loop.
    pub fn open(
        data_dir: impl Into<PathBuf>,
        builtin_dir: impl Into<PathBuf>,
        crypto: Arc<CryptoManager>,
        save_interval: Duration,
    ) -> SudbResult<Self> {
        let data_dir = data_dir.into();
        let builtin_dir = builtin_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&builtin_dir)?;

        let collections = CollectionManager::new(&data_dir, crypto)?;

        let memory = Arc::new(MemoryStore::new(&data_dir, save_interval));
        if let Err(e) = memory.load_from_disk() {
            tracing::warn!("加载数据失败: {e}");
        }
        let autosave = memory.start_autosave();

        let backups = BackupManager::new(builtin_dir.join("backups"), &data_dir)?;

        Ok(Self {
            data_dir,
            collections,
            memory,
            backups,
            autosave: Mutex::new(Some(autosave)),
        })
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ── Collections ──

    pub fn create_collection(&self, name: &str, owner: &str) -> SudbResult<Collection> {
        self.collections.create_collection(name, owner)
    }

    pub fn create_database(
        &self,
        collection: &str,
        database: &str,
        db_type: StorageType,
        description: &str,
    ) -> SudbResult<()> {
        self.collections
            .create_database(collection, database, db_type, description)
    }

    pub fn get_collection(&self, name: &str) -> SudbResult<Collection> {
        self.collections.get_collection(name)
    }

    pub fn list_collections(&self) -> Vec<Collection> {
        self.collections.list_collections()
    }

    pub fn delete_collection(&self, name: &str) -> SudbResult<()> {
        self.collections.delete_collection(name)
    }

    // ── Tables ──

    /// The table store for a `TYPE table` database.
    pub fn table_store(&self, collection: &str, database: &str) -> SudbResult<TableStore> {
        let meta = self.collections.get_collection(collection)?;
        let db = meta
            .databases
            .get(database)
            .ok_or_else(|| SudbError::NotFound(format!("数据库不存在: {database}")))?;
        if db.db_type != StorageType::Table {
            return Err(SudbError::Conflict(format!(
                "数据库类型不是table: {database}"
            )));
        }
        TableStore::new(&self.data_dir.join(collection).join(database))
    }

    // ── Backups ──

    pub fn backup_collection(&self, name: &str, description: &str) -> SudbResult<BackupInfo> {
        // Resolve through the collection map first so unknown names fail
        // before any archive work.
        self.collections.get_collection(name)?;
        self.backups.backup_collection(name, description)
    }

    /// Restore a backup and reload collection metadata and records.
    pub fn restore_collection(&self, backup_id: &str) -> SudbResult<BackupInfo> {
        let info = self.backups.restore_collection(backup_id)?;
        self.collections.reload()?;
        self.memory.load_from_disk()?;
        Ok(info)
    }

    pub fn list_backups(&self) -> SudbResult<Vec<BackupInfo>> {
        self.backups.list_backups()
    }

    pub fn delete_backup(&self, backup_id: &str) -> SudbResult<()> {
        self.backups.delete_backup(backup_id)
    }

    /// Stop the autosave loop and flush the store. Idempotent.
    pub fn shutdown(&self) {
        if let Some(handle) = self.autosave.lock().take() {
            handle.stop();
        }
        if let Err(e) = self.memory.save_to_disk() {
            tracing::warn!("保存数据失败: {e}");
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
