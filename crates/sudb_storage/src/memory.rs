//! In-memory document store with periodic durable snapshots.
//!
//! Records live in a two-level map `collection → database → Vec<Row>`. A
//! dirty flag drives the autosave loop; snapshots use the
//! `.tmp → .bak ← live` pattern so a crash mid-save never loses the last
//! committed state.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use sudb_common::shutdown::ShutdownSignal;
use sudb_common::value::{matches_filter, Filter, Row};
use sudb_common::SudbResult;

/// Live data file name inside a database directory.
pub const DATA_FILE: &str = "data.sudb";

pub(crate) struct StoreInner {
    pub(crate) data: HashMap<String, HashMap<String, Vec<Row>>>,
    pub(crate) dirty: bool,
    last_save: Instant,
}

/// The in-RAM record store. One read-write lock guards the whole map:
/// reads share, mutations and snapshot bookkeeping are exclusive.
pub struct MemoryStore {
    pub(crate) inner: RwLock<StoreInner>,
    data_dir: PathBuf,
    save_interval: Duration,
}

impl MemoryStore {
    pub fn new(data_dir: impl Into<PathBuf>, save_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                data: HashMap::new(),
                dirty: false,
                last_save: Instant::now(),
            }),
            data_dir: data_dir.into(),
            save_interval,
        }
    }

    /// Append a record, lazily creating the containers.
    pub fn insert(&self, collection: &str, database: &str, record: Row) {
        let mut inner = self.inner.write();
        inner
            .data
            .entry(collection.to_string())
            .or_default()
            .entry(database.to_string())
            .or_default()
            .push(record);
        inner.dirty = true;
    }

    /// Records matching the filter. A missing container yields an empty
    /// result, never an error.
    pub fn query(&self, collection: &str, database: &str, filter: Option<&Filter>) -> Vec<Row> {
        let inner = self.inner.read();
        let Some(records) = inner.data.get(collection).and_then(|dbs| dbs.get(database)) else {
            return Vec::new();
        };
        match filter {
            None => records.clone(),
            Some(f) => records
                .iter()
                .filter(|r| matches_filter(r, Some(f)))
                .cloned()
                .collect(),
        }
    }

    /// Apply every key/value write in `updates` to each matching record.
    /// Returns the number of records touched.
    pub fn update(
        &self,
        collection: &str,
        database: &str,
        updates: &Row,
        filter: Option<&Filter>,
    ) -> usize {
        let mut inner = self.inner.write();
        let Some(records) = inner
            .data
            .get_mut(collection)
            .and_then(|dbs| dbs.get_mut(database))
        else {
            return 0;
        };
        let mut touched = 0;
        for record in records.iter_mut() {
            if matches_filter(record, filter) {
                for (k, v) in updates {
                    record.insert(k.clone(), v.clone());
                }
                touched += 1;
            }
        }
        if touched > 0 {
            inner.dirty = true;
        }
        touched
    }

    /// Retain only records that do not match the filter. Returns the number
    /// removed.
    pub fn delete(&self, collection: &str, database: &str, filter: Option<&Filter>) -> usize {
        let mut inner = self.inner.write();
        let Some(records) = inner
            .data
            .get_mut(collection)
            .and_then(|dbs| dbs.get_mut(database))
        else {
            return 0;
        };
        let before = records.len();
        records.retain(|r| !matches_filter(r, filter));
        let removed = before - records.len();
        if removed > 0 {
            inner.dirty = true;
        }
        removed
    }

    /// Snapshot every database to disk. Per-database failures are logged
    /// and skipped so one bad volume cannot block the rest.
    ///
    /// Per `(collection, database)`:
    /// 1. serialize the records to pretty JSON
    /// 2. ensure the directory exists
    /// 3. rename the previous live file to `.bak`
    /// 4. write the bytes to `.tmp`
    /// 5. atomically rename `.tmp` onto the live name
    pub fn save_to_disk(&self) -> SudbResult<()> {
        {
            let inner = self.inner.read();
            for (collection, databases) in &inner.data {
                let collection_path = self.data_dir.join(collection);
                for (database, records) in databases {
                    let db_path = collection_path.join(database);
                    if let Err(e) = fs::create_dir_all(&db_path) {
                        tracing::warn!("创建数据库目录失败 {db_path:?}: {e}");
                        continue;
                    }

                    let data = match serde_json::to_vec_pretty(records) {
                        Ok(d) => d,
                        Err(e) => {
                            tracing::warn!("序列化数据失败 {collection}.{database}: {e}");
                            continue;
                        }
                    };

                    let live = db_path.join(DATA_FILE);
                    let tmp = db_path.join(format!("{DATA_FILE}.tmp"));
                    let bak = db_path.join(format!("{DATA_FILE}.bak"));

                    if live.exists() {
                        if let Err(e) = fs::rename(&live, &bak) {
                            tracing::warn!("创建备份失败 {live:?}: {e}");
                        }
                    }
                    if let Err(e) = fs::write(&tmp, &data) {
                        tracing::warn!("写入临时文件失败 {tmp:?}: {e}");
                        continue;
                    }
                    if let Err(e) = fs::rename(&tmp, &live) {
                        let _ = fs::remove_file(&tmp);
                        tracing::warn!("重命名文件失败 {live:?}: {e}");
                        continue;
                    }
                    tracing::debug!("保存数据成功: {live:?} ({} 条记录)", records.len());
                }
            }
        }

        let mut inner = self.inner.write();
        inner.dirty = false;
        inner.last_save = Instant::now();
        Ok(())
    }

    /// Load every `data.sudb` under the two-level tree, falling back to the
    /// `.bak` copy when the live file fails to parse. The accepted bytes
    /// refresh the backup.
    pub fn load_from_disk(&self) -> SudbResult<()> {
        let mut data: HashMap<String, HashMap<String, Vec<Row>>> = HashMap::new();

        let collections = match fs::read_dir(&self.data_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut inner = self.inner.write();
                inner.data = data;
                inner.dirty = false;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for col in collections.filter_map(|e| e.ok()) {
            if !col.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(databases) = fs::read_dir(col.path()) else {
                continue;
            };
            for db in databases.filter_map(|e| e.ok()) {
                if !db.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let live = db.path().join(DATA_FILE);
                let Ok(mut bytes) = fs::read(&live) else {
                    continue;
                };

                let records: Vec<Row> = match serde_json::from_slice(&bytes) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("数据文件损坏，尝试从备份恢复 {live:?}: {e}");
                        let bak = db.path().join(format!("{DATA_FILE}.bak"));
                        match fs::read(&bak).ok().and_then(|b| {
                            serde_json::from_slice::<Vec<Row>>(&b).ok().map(|r| (b, r))
                        }) {
                            Some((bak_bytes, r)) => {
                                bytes = bak_bytes;
                                r
                            }
                            None => {
                                tracing::warn!("备份文件不存在或损坏，跳过加载: {bak:?}");
                                continue;
                            }
                        }
                    }
                };

                let collection_name = col.file_name().to_string_lossy().into_owned();
                let database_name = db.file_name().to_string_lossy().into_owned();
                tracing::debug!("加载数据成功: {live:?} ({} 条记录)", records.len());
                data.entry(collection_name)
                    .or_default()
                    .insert(database_name, records);

                // Refresh the backup with the bytes we accepted.
                let bak = db.path().join(format!("{DATA_FILE}.bak"));
                if let Err(e) = fs::write(&bak, &bytes) {
                    tracing::warn!("创建备份失败 {bak:?}: {e}");
                }
            }
        }

        let mut inner = self.inner.write();
        inner.data = data;
        inner.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Instant of the last completed snapshot.
    pub fn last_save(&self) -> Instant {
        self.inner.read().last_save
    }

    /// Spawn the cooperative autosave loop. The thread wakes every
    /// `save_interval`, saves when dirty, and exits on the stop signal.
    pub fn start_autosave(self: &Arc<Self>) -> AutosaveHandle {
        let signal = ShutdownSignal::new();
        let store = Arc::clone(self);
        let thread_signal = signal.clone();
        let thread = std::thread::Builder::new()
            .name("sudb-autosave".into())
            .spawn(move || loop {
                if thread_signal.wait_timeout(store.save_interval) {
                    return;
                }
                if store.is_dirty() {
                    if let Err(e) = store.save_to_disk() {
                        // Keep the dirty flag so the next tick retries.
                        tracing::warn!("自动保存失败: {e}");
                    }
                }
            })
            .expect("failed to spawn autosave thread");

        AutosaveHandle {
            signal,
            thread: Some(thread),
            store: Arc::clone(self),
        }
    }
}

/// Owns the autosave thread; `stop()` signals, joins, and performs the final
/// save when the store is still dirty.
pub struct AutosaveHandle {
    signal: ShutdownSignal,
    thread: Option<JoinHandle<()>>,
    store: Arc<MemoryStore>,
}

impl AutosaveHandle {
    pub fn stop(mut self) {
        self.signal.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if self.store.is_dirty() {
            if let Err(e) = self.store.save_to_disk() {
                tracing::warn!("最终保存失败: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(v: serde_json::Value) -> Row {
        v.as_object().unwrap().clone()
    }

    fn filter(v: serde_json::Value) -> Filter {
        v.as_object().unwrap().clone()
    }

    fn store(dir: &TempDir) -> MemoryStore {
        MemoryStore::new(dir.path().join("data"), Duration::from_secs(1800))
    }

    #[test]
    fn test_insert_and_query_all() {
        let dir = TempDir::new().unwrap();
        let ms = store(&dir);
        ms.insert("c", "d", row(json!({"name": "Alice", "age": 25})));
        ms.insert("c", "d", row(json!({"name": "Bob", "age": 30})));

        let all = ms.query("c", "d", None);
        assert_eq!(all.len(), 2);
        assert!(ms.is_dirty());
    }

    #[test]
    fn test_query_missing_containers() {
        let dir = TempDir::new().unwrap();
        let ms = store(&dir);
        assert!(ms.query("ghost", "d", None).is_empty());
    }

    #[test]
    fn test_query_with_operator_filter() {
        let dir = TempDir::new().unwrap();
        let ms = store(&dir);
        for age in [22, 25, 30] {
            ms.insert("c", "d", row(json!({"age": age})));
        }
        let f = filter(json!({"age": {"operator": ">", "value": 25}}));
        let hits = ms.query("c", "d", Some(&f));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["age"], json!(30));
    }

    #[test]
    fn test_update_matching_records() {
        let dir = TempDir::new().unwrap();
        let ms = store(&dir);
        ms.insert("c", "d", row(json!({"name": "Alice", "age": 25})));
        ms.insert("c", "d", row(json!({"name": "Bob", "age": 25})));
        ms.insert("c", "d", row(json!({"name": "Carol", "age": 30})));

        let updates = row(json!({"age": 26, "checked": true}));
        let f = filter(json!({"age": 25}));
        assert_eq!(ms.update("c", "d", &updates, Some(&f)), 2);

        let hits = ms.query("c", "d", Some(&filter(json!({"age": 26}))));
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r["checked"] == json!(true)));
    }

    #[test]
    fn test_delete_retains_non_matching() {
        let dir = TempDir::new().unwrap();
        let ms = store(&dir);
        for age in [22, 25, 30] {
            ms.insert("c", "d", row(json!({"age": age})));
        }
        let removed = ms.delete("c", "d", Some(&filter(json!({"age": 25}))));
        assert_eq!(removed, 1);
        assert_eq!(ms.query("c", "d", None).len(), 2);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ms = store(&dir);
        let before = ms.last_save();
        ms.insert("c", "d", row(json!({"name": "Alice"})));
        ms.save_to_disk().unwrap();
        assert!(!ms.is_dirty());
        assert!(ms.last_save() >= before);
        assert!(dir.path().join("data/c/d/data.sudb").exists());

        let fresh = store(&dir);
        fresh.load_from_disk().unwrap();
        let all = fresh.query("c", "d", None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["name"], json!("Alice"));
    }

    #[test]
    fn test_second_save_creates_bak() {
        let dir = TempDir::new().unwrap();
        let ms = store(&dir);
        ms.insert("c", "d", row(json!({"v": 1})));
        ms.save_to_disk().unwrap();
        ms.insert("c", "d", row(json!({"v": 2})));
        ms.save_to_disk().unwrap();
        assert!(dir.path().join("data/c/d/data.sudb.bak").exists());
        assert!(!dir.path().join("data/c/d/data.sudb.tmp").exists());
    }

    #[test]
    fn test_corrupt_live_file_recovers_from_bak() {
        let dir = TempDir::new().unwrap();
        let ms = store(&dir);
        ms.insert("c", "d", row(json!({"v": 1})));
        ms.save_to_disk().unwrap();
        ms.insert("c", "d", row(json!({"v": 2})));
        ms.save_to_disk().unwrap();

        // Simulate a crash that left a torn live file: the .bak still holds
        // the previous committed snapshot.
        let live = dir.path().join("data/c/d/data.sudb");
        std::fs::write(&live, b"{torn write").unwrap();

        let fresh = store(&dir);
        fresh.load_from_disk().unwrap();
        let all = fresh.query("c", "d", None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["v"], json!(1));

        // The accepted bytes refreshed the backup.
        let bak = std::fs::read(dir.path().join("data/c/d/data.sudb.bak")).unwrap();
        let parsed: Vec<Row> = serde_json::from_slice(&bak).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_both_files_corrupt_skips_database() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("data/c/d");
        std::fs::create_dir_all(&db).unwrap();
        std::fs::write(db.join("data.sudb"), b"{bad").unwrap();
        std::fs::write(db.join("data.sudb.bak"), b"{also bad").unwrap();

        let ms = store(&dir);
        ms.load_from_disk().unwrap();
        assert!(ms.query("c", "d", None).is_empty());
    }

    #[test]
    fn test_load_missing_data_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let ms = MemoryStore::new(dir.path().join("nonexistent"), Duration::from_secs(1));
        ms.load_from_disk().unwrap();
        assert!(ms.query("a", "b", None).is_empty());
    }

    #[test]
    fn test_autosave_saves_dirty_data() {
        let dir = TempDir::new().unwrap();
        let ms = Arc::new(MemoryStore::new(
            dir.path().join("data"),
            Duration::from_millis(30),
        ));
        let handle = ms.start_autosave();
        ms.insert("c", "d", row(json!({"v": 1})));

        let deadline = Instant::now() + Duration::from_secs(2);
        while ms.is_dirty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!ms.is_dirty(), "autosave should have flushed the store");
        assert!(dir.path().join("data/c/d/data.sudb").exists());
        handle.stop();
    }

    #[test]
    fn test_stop_performs_final_save() {
        let dir = TempDir::new().unwrap();
        let ms = Arc::new(MemoryStore::new(
            dir.path().join("data"),
            Duration::from_secs(3600),
        ));
        let handle = ms.start_autosave();
        ms.insert("c", "d", row(json!({"v": 1})));
        assert!(ms.is_dirty());
        handle.stop();
        assert!(!ms.is_dirty());
        assert!(dir.path().join("data/c/d/data.sudb").exists());
    }
}
