//! RBAC-gated statement dispatch.
//!
//! Each parsed statement maps to a `(permission, resource)` pair; non-root
//! users must pass the permission check before execution. IMPORT and UPDATE
//! execute inline without an RBAC gate, matching the established dispatch
//! table. Every processed query — including denials and failures — produces
//! exactly one audit record.

use std::sync::Arc;

use serde_json::json;

use sudb_common::value::project_row;
use sudb_common::{SudbError, SudbResult};
use sudb_dialect::Statement;
use sudb_security::{
    AuditEntry, AuditLevel, AuditLogger, Permission, Resource, UserManager,
};
use sudb_storage::StorageEngine;

/// Executes statements against the engine on behalf of a session user.
pub struct QueryHandler {
    engine: Arc<StorageEngine>,
    users: Arc<UserManager>,
    audit: Arc<AuditLogger>,
}

impl QueryHandler {
    pub fn new(
        engine: Arc<StorageEngine>,
        users: Arc<UserManager>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            engine,
            users,
            audit,
        }
    }

    /// Parse, gate, execute, and audit one query. Returns the JSON payload
    /// for the `Result` frame.
    pub fn handle_query(&self, user: &str, remote_addr: &str, raw: &str) -> SudbResult<Vec<u8>> {
        let stmt = sudb_dialect::parse(raw)?;

        let gate = statement_gate(&stmt);
        let (action, object) = match &gate {
            Some((perm, res)) => (perm.to_string(), format!("{}:{}", res.kind, res.name)),
            None => (stmt.type_name().to_string(), String::new()),
        };

        if let Some((perm, res)) = &gate {
            if user != sudb_security::user::DEFAULT_USER
                && !self.users.check_permission(user, *perm, res)
            {
                let entry = AuditEntry::new(AuditLevel::Warn, user, &action, &object)
                    .with_status("FAILED")
                    .with_details("权限不足")
                    .with_ip(remote_addr);
                if let Err(e) = self.audit.log(&entry) {
                    tracing::warn!("审计日志写入失败: {e}");
                }
                return Err(SudbError::Permission("权限不足".into()));
            }
        }

        match self.execute(&stmt) {
            Ok(payload) => {
                let entry = AuditEntry::new(AuditLevel::Info, user, &action, &object)
                    .with_status("SUCCESS")
                    .with_details(format!("操作成功: {raw}"))
                    .with_ip(remote_addr);
                if let Err(e) = self.audit.log(&entry) {
                    tracing::warn!("审计日志写入失败: {e}");
                }
                Ok(payload)
            }
            Err(err) => {
                let entry = AuditEntry::new(AuditLevel::Error, user, &action, &object)
                    .with_status("FAILED")
                    .with_details(err.wire_message())
                    .with_ip(remote_addr);
                if let Err(e) = self.audit.log(&entry) {
                    tracing::warn!("审计日志写入失败: {e}");
                }
                Err(err)
            }
        }
    }

    fn execute(&self, stmt: &Statement) -> SudbResult<Vec<u8>> {
        match stmt {
            Statement::Insert {
                collection,
                database,
                row,
            } => {
                self.engine.memory().insert(collection, database, row.clone());
                Ok(serde_json::to_vec(&json!({"message": "插入成功"}))?)
            }

            Statement::Select {
                collection,
                database,
                columns,
                filter,
            } => {
                let mut records = self
                    .engine
                    .memory()
                    .query(collection, database, filter.as_ref());
                if let Some(cols) = columns {
                    records = records.iter().map(|r| project_row(r, cols)).collect();
                }
                Ok(serde_json::to_vec(&records)?)
            }

            Statement::Update {
                collection,
                database,
                assignments,
                filter,
            } => {
                self.engine
                    .memory()
                    .update(collection, database, assignments, filter.as_ref());
                Ok(serde_json::to_vec(&json!({"message": "更新成功"}))?)
            }

            Statement::CreateCollection { name, owner } => {
                self.engine.create_collection(name, owner)?;
                Ok(serde_json::to_vec(&json!({
                    "message": "集合创建成功",
                    "name": name,
                }))?)
            }

            Statement::CreateDatabase {
                collection,
                database,
                db_type,
                description,
            } => {
                self.engine
                    .create_database(collection, database, *db_type, description)?;
                Ok(serde_json::to_vec(&json!({
                    "message": "数据库创建成功",
                    "collection": collection,
                    "database": database,
                    "type": db_type.to_string(),
                }))?)
            }

            Statement::ShowCollections => {
                let collections = self.engine.list_collections();
                let result: Vec<_> = collections
                    .iter()
                    .map(|c| json!({"name": c.name, "owner": c.owner}))
                    .collect();
                Ok(serde_json::to_vec(&result)?)
            }

            Statement::ShowDatabases { collection } => {
                let c = self.engine.get_collection(collection)?;
                let result: Vec<_> = c
                    .databases
                    .values()
                    .map(|db| {
                        json!({
                            "name": db.name,
                            "type": db.db_type.to_string(),
                            "description": db.description,
                            "created": db.created,
                            "updated": db.updated,
                        })
                    })
                    .collect();
                Ok(serde_json::to_vec(&result)?)
            }

            Statement::Export {
                collection,
                database,
                path,
            } => {
                // Resolve through collection metadata before touching disk.
                let c = self.engine.get_collection(collection)?;
                if !c.databases.contains_key(database) {
                    return Err(SudbError::NotFound(format!("数据库不存在: {database}")));
                }
                self.engine
                    .memory()
                    .export_database(collection, database, std::path::Path::new(path))?;
                Ok(serde_json::to_vec(&json!({
                    "message": "导出成功",
                    "path": path,
                }))?)
            }

            Statement::Import { path, collection } => {
                self.engine
                    .memory()
                    .import_from_file(std::path::Path::new(path), collection)?;
                Ok(serde_json::to_vec(&json!({
                    "message": "导入成功",
                    "path": path,
                    "target": collection,
                }))?)
            }
        }
    }
}

/// The `(permission, resource)` gate for a statement, or `None` for the two
/// inline paths (IMPORT, UPDATE).
fn statement_gate(stmt: &Statement) -> Option<(Permission, Resource)> {
    match stmt {
        Statement::Insert {
            collection,
            database,
            ..
        } => Some((
            Permission::Insert,
            Resource::database(format!("{collection}.{database}")),
        )),
        Statement::Select {
            collection,
            database,
            ..
        } => Some((
            Permission::Select,
            Resource::database(format!("{collection}.{database}")),
        )),
        Statement::ShowCollections => Some((Permission::Select, Resource::any_database())),
        Statement::ShowDatabases { .. } => Some((Permission::Select, Resource::any_database())),
        Statement::CreateCollection { .. } => {
            Some((Permission::CreateDatabase, Resource::any_database()))
        }
        Statement::CreateDatabase { .. } => {
            Some((Permission::CreateDatabase, Resource::any_database()))
        }
        Statement::Export {
            collection,
            database,
            ..
        } => Some((
            Permission::Select,
            Resource::database(format!("{collection}.{database}")),
        )),
        Statement::Import { .. } | Statement::Update { .. } => None,
    }
}
