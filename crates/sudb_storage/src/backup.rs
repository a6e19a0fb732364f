//! Collection backup and restore.
//!
//! A backup is a gzip-compressed tar archive of the collection directory,
//! entries relative to the data root so `restore` can unpack and rename the
//! tree into place atomically. Each archive gets a JSON manifest sibling.

use std::fs::{self, File};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use sudb_common::{SudbError, SudbResult};

/// Manifest written next to each archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub collection_name: String,
    #[serde(rename = "type")]
    pub backup_type: String,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub status: String,
    pub description: String,
}

/// Archives collections out of the data root into the backup directory.
pub struct BackupManager {
    backup_dir: PathBuf,
    data_dir: PathBuf,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> SudbResult<Self> {
        let backup_dir = backup_dir.into();
        fs::create_dir_all(&backup_dir)?;
        Ok(Self {
            backup_dir,
            data_dir: data_dir.into(),
        })
    }

    /// Stream a full backup of `collection` and write its manifest.
    /// `backup_id = <name>_<yyyymmddHHMMSS>`.
    pub fn backup_collection(
        &self,
        collection: &str,
        description: &str,
    ) -> SudbResult<BackupInfo> {
        let source = self.data_dir.join(collection);
        if !source.is_dir() {
            return Err(SudbError::NotFound(format!("集合不存在: {collection}")));
        }

        let backup_id = format!("{collection}_{}", Utc::now().format("%Y%m%d%H%M%S"));
        let archive_path = self.archive_path(&backup_id);

        let file = File::create(&archive_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        // One entry per directory and file, paths relative to the data root,
        // preserving name/mode/mtime.
        builder
            .append_dir_all(collection, &source)
            .and_then(|()| builder.into_inner())
            .and_then(|encoder| encoder.finish())
            .map_err(|e| {
                let _ = fs::remove_file(&archive_path);
                SudbError::Io(e)
            })?;

        let info = BackupInfo {
            id: backup_id.clone(),
            collection_name: collection.to_string(),
            backup_type: "full".into(),
            created: Utc::now(),
            size: fs::metadata(&archive_path)?.len(),
            status: "completed".into(),
            description: description.to_string(),
        };
        self.save_manifest(&info)?;
        Ok(info)
    }

    /// Unpack a backup into a temporary sibling, delete the live collection
    /// directory, and rename the restored tree into place. The caller is
    /// responsible for reloading collection metadata afterwards.
    pub fn restore_collection(&self, backup_id: &str) -> SudbResult<BackupInfo> {
        let info = self.load_manifest(backup_id)?;

        let archive_path = self.archive_path(backup_id);
        let file = File::open(&archive_path)
            .map_err(|e| SudbError::NotFound(format!("打开备份文件失败 {archive_path:?}: {e}")))?;

        let temp_dir = self.backup_dir.join(format!("restore_{backup_id}"));
        fs::create_dir_all(&temp_dir)?;

        let result = (|| -> SudbResult<()> {
            let mut archive = tar::Archive::new(GzDecoder::new(file));
            archive.unpack(&temp_dir)?;

            let restored = temp_dir.join(&info.collection_name);
            if !restored.is_dir() {
                return Err(SudbError::Integrity(format!(
                    "备份中缺少集合目录: {}",
                    info.collection_name
                )));
            }

            let live = self.data_dir.join(&info.collection_name);
            if live.exists() {
                fs::remove_dir_all(&live)?;
            }
            fs::rename(&restored, &live)?;
            Ok(())
        })();

        let _ = fs::remove_dir_all(&temp_dir);
        result?;
        Ok(info)
    }

    /// Every manifest in the backup directory.
    pub fn list_backups(&self) -> SudbResult<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.backup_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match self.load_manifest(stem) {
                    Ok(info) => backups.push(info),
                    Err(e) => tracing::warn!("跳过无效的备份清单 {path:?}: {e}"),
                }
            }
        }
        Ok(backups)
    }

    /// Remove the archive and manifest; absent files are tolerated.
    pub fn delete_backup(&self, backup_id: &str) -> SudbResult<()> {
        for path in [self.archive_path(backup_id), self.manifest_path(backup_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn archive_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{backup_id}.tar.gz"))
    }

    fn manifest_path(&self, backup_id: &str) -> PathBuf {
        self.backup_dir.join(format!("{backup_id}.json"))
    }

    fn save_manifest(&self, info: &BackupInfo) -> SudbResult<()> {
        let data = serde_json::to_vec_pretty(info)?;
        fs::write(self.manifest_path(&info.id), data)?;
        Ok(())
    }

    fn load_manifest(&self, backup_id: &str) -> SudbResult<BackupInfo> {
        let path = self.manifest_path(backup_id);
        let data = fs::read(&path)
            .map_err(|e| SudbError::NotFound(format!("备份不存在 {backup_id}: {e}")))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn seed_collection(data_dir: &Path, name: &str) {
        let db = data_dir.join(name).join("users");
        fs::create_dir_all(&db).unwrap();
        fs::write(data_dir.join(name).join("meta.sudb"), b"encrypted-meta").unwrap();
        fs::write(db.join("data.sudb"), br#"[{"name":"Alice"}]"#).unwrap();
    }

    fn setup() -> (TempDir, BackupManager) {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir_all(&data_dir).unwrap();
        seed_collection(&data_dir, "myapp");
        let bm = BackupManager::new(dir.path().join("backups"), &data_dir).unwrap();
        (dir, bm)
    }

    #[test]
    fn test_backup_creates_archive_and_manifest() {
        let (dir, bm) = setup();
        let info = bm.backup_collection("myapp", "nightly").unwrap();

        assert!(info.id.starts_with("myapp_"));
        assert_eq!(info.collection_name, "myapp");
        assert_eq!(info.backup_type, "full");
        assert_eq!(info.status, "completed");
        assert!(info.size > 0);

        let backups = dir.path().join("backups");
        assert!(backups.join(format!("{}.tar.gz", info.id)).exists());
        assert!(backups.join(format!("{}.json", info.id)).exists());
    }

    #[test]
    fn test_backup_missing_collection() {
        let (_dir, bm) = setup();
        assert!(bm.backup_collection("ghost", "").is_err());
    }

    #[test]
    fn test_restore_replaces_live_tree() {
        let (dir, bm) = setup();
        let info = bm.backup_collection("myapp", "").unwrap();

        // Mutate and partially destroy the live tree after the backup.
        let data_file = dir.path().join("data/myapp/users/data.sudb");
        fs::write(&data_file, br#"[{"name":"Mallory"}]"#).unwrap();
        fs::write(dir.path().join("data/myapp/extra.tmp"), b"junk").unwrap();

        bm.restore_collection(&info.id).unwrap();

        let restored = fs::read_to_string(&data_file).unwrap();
        assert!(restored.contains("Alice"));
        assert!(!dir.path().join("data/myapp/extra.tmp").exists());
        // The temporary restore directory is cleaned up.
        assert!(!dir
            .path()
            .join(format!("backups/restore_{}", info.id))
            .exists());
    }

    #[test]
    fn test_restore_missing_backup() {
        let (_dir, bm) = setup();
        let err = bm.restore_collection("ghost_20240101000000").unwrap_err();
        assert!(matches!(err, SudbError::NotFound(_)));
    }

    #[test]
    fn test_list_backups() {
        let (_dir, bm) = setup();
        assert!(bm.list_backups().unwrap().is_empty());
        bm.backup_collection("myapp", "first").unwrap();
        let listed = bm.list_backups().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description, "first");
    }

    #[test]
    fn test_delete_backup() {
        let (dir, bm) = setup();
        let info = bm.backup_collection("myapp", "").unwrap();
        bm.delete_backup(&info.id).unwrap();
        assert!(!dir
            .path()
            .join(format!("backups/{}.tar.gz", info.id))
            .exists());
        assert!(bm.list_backups().unwrap().is_empty());
        // Deleting an absent backup is tolerated.
        bm.delete_backup(&info.id).unwrap();
    }

    #[test]
    fn test_restore_after_collection_deleted() {
        let (dir, bm) = setup();
        let info = bm.backup_collection("myapp", "").unwrap();
        fs::remove_dir_all(dir.path().join("data/myapp")).unwrap();

        bm.restore_collection(&info.id).unwrap();
        assert!(dir.path().join("data/myapp/users/data.sudb").exists());
    }
}
