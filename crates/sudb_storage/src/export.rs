//! SQL dump export and line-oriented import.
//!
//! The importer rewrites every collection namespace in the dump to the
//! target collection, so a dump can be redirected into a chosen namespace
//! without editing. Cross-collection dumps therefore collapse into one
//! collection by design.

use std::fs;
use std::path::Path;

use chrono::Utc;

use sudb_common::value::Row;
use sudb_common::{SudbError, SudbResult};

use crate::memory::MemoryStore;

impl MemoryStore {
    /// Emit a SQL dump of one database. Holds read access for the duration
    /// of the emit, so the dump is a consistent snapshot. Fails when either
    /// container is absent.
    pub fn export_database(
        &self,
        collection: &str,
        database: &str,
        path: &Path,
    ) -> SudbResult<()> {
        let inner = self.inner.read();
        let records = inner
            .data
            .get(collection)
            .ok_or_else(|| SudbError::NotFound(format!("集合不存在: {collection}")))?
            .get(database)
            .ok_or_else(|| SudbError::NotFound(format!("数据库不存在: {database}")))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut out = String::new();
        out.push_str(&format!(
            "-- SuDB 导出\n-- 集合: {collection}\n-- 数据库: {database}\n-- 导出时间: {}\n-- 版本: 1.0\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
        ));
        out.push_str(&format!("CREATE COLLECTION IF NOT EXISTS {collection};\n\n"));
        out.push_str(&format!(
            "CREATE DATABASE IF NOT EXISTS {collection}.{database} TYPE json DESCRIPTION '导出的数据库';\n\n"
        ));

        for record in records {
            let json = serde_json::to_string_pretty(record)?;
            out.push_str(&format!("INSERT INTO {collection}.{database} VALUES {json};\n"));
        }

        fs::write(path, out)?;
        Ok(())
    }

    /// Read a dump and apply its statements, rewriting every collection
    /// namespace to `target_collection`. Multi-line JSON after `VALUES` is
    /// accumulated until the terminating semicolon.
    pub fn import_from_file(&self, path: &Path, target_collection: &str) -> SudbResult<()> {
        let data = fs::read_to_string(path)
            .map_err(|e| SudbError::NotFound(format!("读取文件失败 {path:?}: {e}")))?;

        let mut statements = Vec::new();
        let mut current = String::new();
        let mut in_values = false;

        for line in data.lines() {
            let line = line.trim();
            if line.starts_with("--") || line.is_empty() {
                continue;
            }
            if line.to_ascii_uppercase().contains("VALUES") {
                in_values = true;
            }
            if in_values {
                current.push_str(line);
            } else {
                current.push(' ');
                current.push_str(line);
            }
            if line.ends_with(';') {
                statements.push(current.trim().to_string());
                current.clear();
                in_values = false;
            }
        }

        tracing::debug!("解析到 {} 条SQL语句", statements.len());
        for (i, stmt) in statements.iter().enumerate() {
            self.apply_import_statement(stmt, target_collection)
                .map_err(|e| e.with_context(format!("执行语句失败 [{}]", i + 1)))?;
        }

        self.inner.write().dirty = true;
        Ok(())
    }

    fn apply_import_statement(&self, stmt: &str, target_collection: &str) -> SudbResult<()> {
        let stmt = stmt.trim_end_matches(';').trim();
        let upper = stmt.to_ascii_uppercase();

        if upper.starts_with("CREATE COLLECTION") {
            let mut inner = self.inner.write();
            inner.data.entry(target_collection.to_string()).or_default();
        } else if upper.starts_with("CREATE DATABASE") {
            let database = parse_create_database_name(stmt)?;
            let mut inner = self.inner.write();
            inner
                .data
                .entry(target_collection.to_string())
                .or_default()
                .entry(database)
                .or_default();
        } else if upper.starts_with("INSERT INTO") {
            let parts: Vec<&str> = stmt.split_whitespace().collect();
            if parts.len() < 4 {
                return Err(SudbError::Parse("无效的INSERT语句".into()));
            }
            let names: Vec<&str> = parts[2].split('.').collect();
            if names.len() != 2 {
                return Err(SudbError::Parse(format!(
                    "无效的数据库名称格式: {}",
                    parts[2]
                )));
            }
            let database = names[1].to_string();

            let values_at = upper
                .find("VALUES")
                .ok_or_else(|| SudbError::Parse("无效的INSERT语句：缺少VALUES关键字".into()))?;
            let json = stmt[values_at + "VALUES".len()..].trim();
            let record: Row = serde_json::from_str(json)
                .map_err(|e| SudbError::Parse(format!("解析JSON数据失败: {e}")))?;

            self.insert(target_collection, &database, record);
        }
        // Anything else in the dump is ignored.
        Ok(())
    }
}

/// Pull the `<coll>.<db>` token out of a `CREATE DATABASE [IF NOT EXISTS]`
/// statement and return the database half.
fn parse_create_database_name(stmt: &str) -> SudbResult<String> {
    let parts: Vec<&str> = stmt.split_whitespace().collect();
    let mut i = 0;
    while i < parts.len() {
        if parts[i].eq_ignore_ascii_case("DATABASE") {
            i += 1;
            if i >= parts.len() {
                return Err(SudbError::Parse("缺少数据库名称".into()));
            }
            if i + 3 < parts.len()
                && parts[i].eq_ignore_ascii_case("IF")
                && parts[i + 1].eq_ignore_ascii_case("NOT")
                && parts[i + 2].eq_ignore_ascii_case("EXISTS")
            {
                i += 3;
            }
            let names: Vec<&str> = parts[i].split('.').collect();
            if names.len() != 2 {
                return Err(SudbError::Parse(format!(
                    "无效的数据库名称格式: {}",
                    parts[i]
                )));
            }
            return Ok(names[1].to_string());
        }
        i += 1;
    }
    Err(SudbError::Parse("无效的CREATE DATABASE语句".into()))
}
