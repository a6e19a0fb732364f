//! Collection and database layout on disk.
//!
//! ```text
//! <dataDir>/<collection>/meta.sudb              encrypted JSON of Collection
//! <dataDir>/<collection>/<database>/meta.sudb   encrypted {type,version,created}
//! <dataDir>/<collection>/<database>/...         per-type scaffolding
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sudb_common::{StorageType, SudbError, SudbResult};
use sudb_security::CryptoManager;

/// Databases allowed per collection.
pub const MAX_DATABASES: usize = 8;

/// Collection metadata file name.
pub const META_FILE: &str = "meta.sudb";

/// Metadata for one database inside a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: StorageType,
    pub description: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// A named container of up to [`MAX_DATABASES`] databases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub owner: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub databases: HashMap<String, DatabaseMeta>,
}

/// Database-level metadata sidecar, written encrypted into the database dir.
#[derive(Debug, Serialize, Deserialize)]
struct DbSidecar {
    #[serde(rename = "type")]
    db_type: StorageType,
    version: String,
    created: DateTime<Utc>,
}

/// Owns the collection map and the data root.
pub struct CollectionManager {
    collections: RwLock<HashMap<String, Collection>>,
    data_dir: PathBuf,
    crypto: Arc<CryptoManager>,
}

impl CollectionManager {
    pub fn new(data_dir: impl Into<PathBuf>, crypto: Arc<CryptoManager>) -> SudbResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let cm = Self {
            collections: RwLock::new(HashMap::new()),
            data_dir,
            crypto,
        };
        cm.reload()?;
        Ok(cm)
    }

    /// Walk the data root and load every decryptable collection. Entries
    /// whose metadata cannot be decrypted or parsed are skipped.
    pub fn reload(&self) -> SudbResult<()> {
        let mut loaded = HashMap::new();

        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join(META_FILE);
            let Ok(encrypted) = fs::read(&meta_path) else {
                continue;
            };
            let decrypted = match self.crypto.decrypt(&encrypted) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("跳过无法解密的集合 {:?}: {e}", entry.path());
                    continue;
                }
            };
            let collection: Collection = match serde_json::from_slice(&decrypted) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("跳过无法解析的集合 {:?}: {e}", entry.path());
                    continue;
                }
            };
            loaded.insert(collection.name.clone(), collection);
        }

        *self.collections.write() = loaded;
        Ok(())
    }

    /// Create a collection. On any failure the directory is removed and the
    /// map entry rolled back.
    pub fn create_collection(&self, name: &str, owner: &str) -> SudbResult<Collection> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(SudbError::Conflict(format!("集合已存在: {name}")));
        }

        let path = self.data_dir.join(name);
        fs::create_dir_all(&path)?;

        let now = Utc::now();
        let collection = Collection {
            name: name.to_string(),
            owner: owner.to_string(),
            created: now,
            updated: now,
            databases: HashMap::new(),
        };

        collections.insert(name.to_string(), collection.clone());
        if let Err(e) = self.save_meta(&collection) {
            let _ = fs::remove_dir_all(&path);
            collections.remove(name);
            return Err(e);
        }

        Ok(collection)
    }

    /// Create a database inside a collection, scaffolding its directories by
    /// storage type. Enforces the per-collection quota and name uniqueness;
    /// rolls back the directory and map entry on failure.
    pub fn create_database(
        &self,
        collection_name: &str,
        db_name: &str,
        db_type: StorageType,
        description: &str,
    ) -> SudbResult<()> {
        let mut collections = self.collections.write();
        let collection = collections
            .get_mut(collection_name)
            .ok_or_else(|| SudbError::NotFound(format!("集合不存在: {collection_name}")))?;

        if collection.databases.contains_key(db_name) {
            return Err(SudbError::Conflict(format!("数据库已存在: {db_name}")));
        }
        if collection.databases.len() >= MAX_DATABASES {
            return Err(SudbError::Conflict(format!(
                "集合 {collection_name} 已达到最大数据库数量: {MAX_DATABASES}"
            )));
        }

        let db_path = self.data_dir.join(collection_name).join(db_name);
        fs::create_dir_all(&db_path)?;

        let now = Utc::now();
        collection.databases.insert(
            db_name.to_string(),
            DatabaseMeta {
                name: db_name.to_string(),
                db_type,
                description: description.to_string(),
                created: now,
                updated: now,
            },
        );
        collection.updated = now;

        let result = self
            .scaffold_database(&db_path, db_type)
            .and_then(|()| self.save_meta(collection));
        if let Err(e) = result {
            collection.databases.remove(db_name);
            let _ = fs::remove_dir_all(&db_path);
            return Err(e);
        }
        Ok(())
    }

    /// Per-type directory scaffolding plus the encrypted database sidecar.
    fn scaffold_database(&self, db_path: &Path, db_type: StorageType) -> SudbResult<()> {
        match db_type {
            StorageType::Json => {
                fs::create_dir_all(db_path.join("data"))?;
            }
            StorageType::Text => {
                fs::create_dir_all(db_path.join("texts"))?;
            }
            StorageType::Table => {
                fs::create_dir_all(db_path.join("tables"))?;
                fs::create_dir_all(db_path.join("indexes"))?;
            }
            StorageType::Graph => {
                fs::create_dir_all(db_path.join("nodes"))?;
                fs::create_dir_all(db_path.join("edges"))?;
                fs::create_dir_all(db_path.join("indexes"))?;
            }
        }

        let sidecar = DbSidecar {
            db_type,
            version: "1.0".into(),
            created: Utc::now(),
        };
        let data = serde_json::to_vec_pretty(&sidecar)?;
        let encrypted = self.crypto.encrypt(&data)?;
        write_restricted(&db_path.join(META_FILE), &encrypted)
    }

    /// Rewrite a collection's encrypted metadata sidecar.
    fn save_meta(&self, collection: &Collection) -> SudbResult<()> {
        let data = serde_json::to_vec_pretty(collection)?;
        let encrypted = self.crypto.encrypt(&data)?;
        let meta_path = self.data_dir.join(&collection.name).join(META_FILE);
        write_restricted(&meta_path, &encrypted)
    }

    /// Remove a collection's directory tree and map entry.
    pub fn delete_collection(&self, name: &str) -> SudbResult<()> {
        let mut collections = self.collections.write();
        if !collections.contains_key(name) {
            return Err(SudbError::NotFound(format!("集合不存在: {name}")));
        }
        fs::remove_dir_all(self.data_dir.join(name))?;
        collections.remove(name);
        Ok(())
    }

    pub fn get_collection(&self, name: &str) -> SudbResult<Collection> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SudbError::NotFound(format!("集合不存在: {name}")))
    }

    pub fn list_collections(&self) -> Vec<Collection> {
        self.collections.read().values().cloned().collect()
    }

    pub fn collection_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn write_restricted(path: &Path, bytes: &[u8]) -> SudbResult<()> {
    fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
