use sudb_common::value::{Filter, Row};
use sudb_common::StorageType;

/// A structurally parsed dialect statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `INSERT INTO <coll>.<db> VALUES <json-object>`
    Insert {
        collection: String,
        database: String,
        row: Row,
    },
    /// `SELECT <cols|'*'> FROM <coll>.<db> [WHERE <json-object>]`
    Select {
        collection: String,
        database: String,
        /// `None` means all columns.
        columns: Option<Vec<String>>,
        filter: Option<Filter>,
    },
    /// `UPDATE <coll>.<db> SET k1=v1[, ...] [WHERE k=v]`
    Update {
        collection: String,
        database: String,
        assignments: Row,
        filter: Option<Filter>,
    },
    /// `CREATE COLLECTION <name>`
    CreateCollection { name: String, owner: String },
    /// `CREATE DATABASE <coll>.<db> TYPE <t> DESCRIPTION '<desc>'`
    CreateDatabase {
        collection: String,
        database: String,
        db_type: StorageType,
        description: String,
    },
    /// `SHOW COLLECTIONS`
    ShowCollections,
    /// `SHOW DATABASES FROM <coll>`
    ShowDatabases { collection: String },
    /// `IMPORT FROM <path> TO <collection>`
    Import { path: String, collection: String },
    /// `EXPORT <coll>.<db> TO <path>`
    Export {
        collection: String,
        database: String,
        path: String,
    },
}

impl Statement {
    /// Normalized upper-case command tag, used for dispatch and audit.
    pub fn type_name(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "INSERT",
            Statement::Select { .. } => "SELECT",
            Statement::Update { .. } => "UPDATE",
            Statement::CreateCollection { .. } => "CREATE_COLLECTION",
            Statement::CreateDatabase { .. } => "CREATE_DATABASE",
            Statement::ShowCollections => "SHOW_COLLECTIONS",
            Statement::ShowDatabases { .. } => "SHOW_DATABASES",
            Statement::Import { .. } => "IMPORT",
            Statement::Export { .. } => "EXPORT",
        }
    }
}
