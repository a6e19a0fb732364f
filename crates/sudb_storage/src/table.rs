//! Column-typed tables: the storage shape behind `TYPE table` databases.
//!
//! A table is a JSON file under `<db>/tables/` holding its column
//! definitions and rows; B+-tree indexes over single columns live under
//! `<db>/indexes/` and accelerate equality lookups.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use sudb_common::value::{matches_condition, CompareOp, Condition, Row};
use sudb_common::{SudbError, SudbResult};

use crate::index::BPlusTreeIndex;

/// Default B+-tree fanout for new column indexes.
const INDEX_DEGREE: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Declared type: "string", "int", "float", "bool".
    #[serde(rename = "type")]
    pub col_type: String,
    #[serde(default)]
    pub indexed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

/// Tables and their indexes for one `TYPE table` database directory.
pub struct TableStore {
    tables_dir: PathBuf,
    indexes_dir: PathBuf,
    indexes: parking_lot::Mutex<HashMap<String, BPlusTreeIndex>>,
}

impl TableStore {
    pub fn new(db_path: &Path) -> SudbResult<Self> {
        let tables_dir = db_path.join("tables");
        let indexes_dir = db_path.join("indexes");
        fs::create_dir_all(&tables_dir)?;
        fs::create_dir_all(&indexes_dir)?;
        Ok(Self {
            tables_dir,
            indexes_dir,
            indexes: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn create_table(&self, name: &str, columns: Vec<Column>) -> SudbResult<()> {
        let path = self.table_path(name);
        if path.exists() {
            return Err(SudbError::Conflict(format!("表已存在: {name}")));
        }
        let table = Table {
            name: name.to_string(),
            columns,
            rows: Vec::new(),
        };
        self.save_table(&table)
    }

    /// Insert a validated row, updating every column index.
    pub fn insert(&self, table_name: &str, row: Row) -> SudbResult<()> {
        let mut table = self.load_table(table_name)?;
        validate_row(&table, &row)?;

        let row_id = table.rows.len() as u64;
        for col in table.columns.iter().filter(|c| c.indexed) {
            if let Some(value) = row.get(&col.name) {
                self.with_index(table_name, &col.name, |idx| idx.add(value, row_id))?;
            }
        }
        table.rows.push(row);
        self.save_table(&table)
    }

    /// Select rows matching the condition, using a column index when the
    /// condition is an indexed equality.
    pub fn select(
        &self,
        table_name: &str,
        columns: &[String],
        condition: Option<&Condition>,
    ) -> SudbResult<Vec<Row>> {
        let table = self.load_table(table_name)?;

        let candidate_rows: Vec<&Row> = match condition {
            Some(cond)
                if cond.op == CompareOp::Eq
                    && table
                        .columns
                        .iter()
                        .any(|c| c.indexed && c.name == cond.column) =>
            {
                let ids = self.with_index(table_name, &cond.column, |idx| {
                    Ok(idx.find(&cond.value))
                })?;
                ids.into_iter()
                    .filter_map(|id| table.rows.get(id as usize))
                    .collect()
            }
            _ => table.rows.iter().collect(),
        };

        let mut out = Vec::new();
        for row in candidate_rows {
            let matched = match condition {
                None => true,
                Some(c) => matches_condition(row, &c.column, c.op, &c.value),
            };
            if matched {
                if columns.is_empty() {
                    out.push(row.clone());
                } else {
                    out.push(sudb_common::value::project_row(row, columns));
                }
            }
        }
        Ok(out)
    }

    /// Apply updates to every matching row. Index maintenance re-keys the
    /// touched columns.
    pub fn update(
        &self,
        table_name: &str,
        updates: &Row,
        condition: Option<&Condition>,
    ) -> SudbResult<usize> {
        let mut table = self.load_table(table_name)?;
        let indexed: Vec<String> = table
            .columns
            .iter()
            .filter(|c| c.indexed)
            .map(|c| c.name.clone())
            .collect();

        let mut touched = 0;
        for (row_id, row) in table.rows.iter_mut().enumerate() {
            let matched = match condition {
                None => true,
                Some(c) => matches_condition(row, &c.column, c.op, &c.value),
            };
            if !matched {
                continue;
            }
            for (k, v) in updates {
                let old = row.insert(k.clone(), v.clone());
                if indexed.iter().any(|c| c == k) {
                    if let Some(old) = old {
                        self.with_index(table_name, k, |idx| idx.remove(&old, row_id as u64))?;
                    }
                    self.with_index(table_name, k, |idx| idx.add(v, row_id as u64))?;
                }
            }
            touched += 1;
        }
        self.save_table(&table)?;
        Ok(touched)
    }

    /// Delete matching rows. Row ids shift, so the affected column indexes
    /// are rebuilt from the survivors.
    pub fn delete(
        &self,
        table_name: &str,
        condition: Option<&Condition>,
    ) -> SudbResult<usize> {
        let mut table = self.load_table(table_name)?;
        let before = table.rows.len();
        table.rows.retain(|row| match condition {
            None => false,
            Some(c) => !matches_condition(row, &c.column, c.op, &c.value),
        });
        let removed = before - table.rows.len();
        if removed > 0 {
            self.rebuild_indexes(&table)?;
        }
        self.save_table(&table)?;
        Ok(removed)
    }

    /// Create a B+-tree index over a column and backfill it from existing
    /// rows.
    pub fn create_index(&self, table_name: &str, column_name: &str) -> SudbResult<()> {
        let mut table = self.load_table(table_name)?;
        let col = table
            .columns
            .iter_mut()
            .find(|c| c.name == column_name)
            .ok_or_else(|| SudbError::NotFound(format!("列不存在: {column_name}")))?;
        col.indexed = true;

        for (row_id, row) in table.rows.iter().enumerate() {
            if let Some(value) = row.get(column_name) {
                self.with_index(table_name, column_name, |idx| idx.add(value, row_id as u64))?;
            }
        }
        self.save_table(&table)
    }

    fn rebuild_indexes(&self, table: &Table) -> SudbResult<()> {
        for col in table.columns.iter().filter(|c| c.indexed) {
            let path = self.index_path(&table.name, &col.name);
            let _ = fs::remove_file(&path);
            self.indexes
                .lock()
                .remove(&index_cache_key(&table.name, &col.name));
            for (row_id, row) in table.rows.iter().enumerate() {
                if let Some(value) = row.get(&col.name) {
                    self.with_index(&table.name, &col.name, |idx| idx.add(value, row_id as u64))?;
                }
            }
        }
        Ok(())
    }

    fn with_index<T>(
        &self,
        table_name: &str,
        column_name: &str,
        f: impl FnOnce(&BPlusTreeIndex) -> SudbResult<T>,
    ) -> SudbResult<T> {
        let mut indexes = self.indexes.lock();
        let key = index_cache_key(table_name, column_name);
        if !indexes.contains_key(&key) {
            let idx = BPlusTreeIndex::open(self.index_path(table_name, column_name), INDEX_DEGREE)?;
            indexes.insert(key.clone(), idx);
        }
        f(&indexes[&key])
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.tables_dir.join(format!("{name}.sudb"))
    }

    fn index_path(&self, table: &str, column: &str) -> PathBuf {
        self.indexes_dir.join(format!("{table}_{column}.idx"))
    }

    fn load_table(&self, name: &str) -> SudbResult<Table> {
        let bytes = fs::read(self.table_path(name))
            .map_err(|_| SudbError::NotFound(format!("表不存在: {name}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save_table(&self, table: &Table) -> SudbResult<()> {
        let bytes = serde_json::to_vec_pretty(table)?;
        fs::write(self.table_path(&table.name), bytes)?;
        Ok(())
    }
}

fn index_cache_key(table: &str, column: &str) -> String {
    format!("{table}\u{1}{column}")
}

/// Check a row against the table's declared columns: every column must be
/// present with a value of the declared shape.
fn validate_row(table: &Table, row: &Row) -> SudbResult<()> {
    for col in &table.columns {
        let Some(value) = row.get(&col.name) else {
            return Err(SudbError::Parse(format!("missing column: {}", col.name)));
        };
        let ok = match col.col_type.as_str() {
            "string" => value.is_string(),
            "int" | "float" => value.is_number(),
            "bool" => value.is_boolean(),
            _ => true,
        };
        if !ok {
            return Err(SudbError::Parse(format!(
                "invalid type for column {}: expected {}",
                col.name, col.col_type
            )));
        }
    }
    Ok(())
}
