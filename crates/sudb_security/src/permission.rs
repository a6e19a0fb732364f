//! Role-based access control: roles, direct grants, and rule matching.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sudb_common::{SudbError, SudbResult};

/// System-defined permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    // Database operations
    CreateDatabase,
    DropDatabase,
    CreateTable,
    DropTable,
    AlterTable,
    // Data operations
    Select,
    Insert,
    Update,
    Delete,
    // User management
    CreateUser,
    DropUser,
    Grant,
    Revoke,
    // System management
    Backup,
    Restore,
    ViewAudit,
    ManageAudit,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreateDatabase => "CREATE_DATABASE",
            Self::DropDatabase => "DROP_DATABASE",
            Self::CreateTable => "CREATE_TABLE",
            Self::DropTable => "DROP_TABLE",
            Self::AlterTable => "ALTER_TABLE",
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::CreateUser => "CREATE_USER",
            Self::DropUser => "DROP_USER",
            Self::Grant => "GRANT",
            Self::Revoke => "REVOKE",
            Self::Backup => "BACKUP",
            Self::Restore => "RESTORE",
            Self::ViewAudit => "VIEW_AUDIT",
            Self::ManageAudit => "MANAGE_AUDIT",
        };
        write!(f, "{s}")
    }
}

/// Resource type a rule or request refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceType {
    Database,
    Table,
    Column,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "DATABASE"),
            Self::Table => write!(f, "TABLE"),
            Self::Column => write!(f, "COLUMN"),
        }
    }
}

/// A resource identifier. An empty `name` in a rule matches every resource
/// of the same type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    #[serde(default)]
    pub name: String,
    /// Sub-resource, e.g. a column name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
}

impl Resource {
    pub fn database(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceType::Database,
            name: name.into(),
            sub: String::new(),
        }
    }

    pub fn any_database() -> Self {
        Self::database("")
    }

    pub fn table(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceType::Table,
            name: name.into(),
            sub: String::new(),
        }
    }
}

/// One grant: a permission over a resource pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub permission: Permission,
    pub resource: Resource,
    /// Whether the holder may grant this rule onward.
    #[serde(default)]
    pub grantable: bool,
    /// Condition expression. Unused by the matcher today.
    #[serde(default)]
    pub condition: String,
}

impl PermissionRule {
    pub fn new(permission: Permission, resource: Resource) -> Self {
        Self {
            permission,
            resource,
            grantable: false,
            condition: String::new(),
        }
    }
}

/// A named role: an ordered list of rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub description: String,
    pub rules: Vec<PermissionRule>,
}

/// The permission engine: built-in roles, per-user role assignments, and
/// per-user direct rules.
pub struct PermissionManager {
    roles: RwLock<HashMap<String, Role>>,
    user_roles: RwLock<HashMap<String, Vec<String>>>,
    user_rules: RwLock<HashMap<String, Vec<PermissionRule>>>,
}

impl PermissionManager {
    pub fn new() -> Self {
        let pm = Self {
            roles: RwLock::new(HashMap::new()),
            user_roles: RwLock::new(HashMap::new()),
            user_rules: RwLock::new(HashMap::new()),
        };
        pm.seed_builtin_roles();
        pm
    }

    fn seed_builtin_roles(&self) {
        use Permission::*;

        let admin = Role {
            name: "admin".into(),
            description: "系统管理员".into(),
            rules: [
                CreateDatabase,
                DropDatabase,
                CreateUser,
                DropUser,
                Grant,
                Revoke,
                Backup,
                Restore,
                ViewAudit,
                ManageAudit,
            ]
            .into_iter()
            .map(|p| PermissionRule::new(p, Resource::any_database()))
            .collect(),
        };

        let readonly = Role {
            name: "readonly".into(),
            description: "只读用户".into(),
            rules: vec![PermissionRule::new(Select, Resource::table(""))],
        };

        let developer = Role {
            name: "developer".into(),
            description: "开发人员".into(),
            rules: vec![
                PermissionRule::new(Select, Resource::table("")),
                PermissionRule::new(Insert, Resource::table("")),
                PermissionRule::new(Update, Resource::table("")),
                PermissionRule::new(Delete, Resource::table("")),
                PermissionRule::new(CreateTable, Resource::any_database()),
                PermissionRule::new(AlterTable, Resource::table("")),
            ],
        };

        let mut roles = self.roles.write();
        for role in [admin, readonly, developer] {
            roles.insert(role.name.clone(), role);
        }
    }

    /// Assign a role to a user. Assigning a held role is a no-op success.
    pub fn assign_role(&self, username: &str, role_name: &str) -> SudbResult<()> {
        if !self.roles.read().contains_key(role_name) {
            return Err(SudbError::NotFound(format!("角色不存在: {role_name}")));
        }
        let mut user_roles = self.user_roles.write();
        let roles = user_roles.entry(username.to_string()).or_default();
        if !roles.iter().any(|r| r == role_name) {
            roles.push(role_name.to_string());
        }
        Ok(())
    }

    /// Grant a direct rule to a user.
    pub fn grant_rule(&self, username: &str, rule: PermissionRule) {
        self.user_rules
            .write()
            .entry(username.to_string())
            .or_default()
            .push(rule);
    }

    /// Check `(user, permission, resource)`: direct rules first, then every
    /// rule of every assigned role.
    pub fn check_permission(&self, username: &str, perm: Permission, res: &Resource) -> bool {
        if let Some(rules) = self.user_rules.read().get(username) {
            if rules.iter().any(|r| rule_matches(r, perm, res)) {
                return true;
            }
        }

        let user_roles = self.user_roles.read();
        let Some(assigned) = user_roles.get(username) else {
            return false;
        };
        let roles = self.roles.read();
        assigned
            .iter()
            .filter_map(|name| roles.get(name))
            .flat_map(|role| role.rules.iter())
            .any(|r| rule_matches(r, perm, res))
    }

    /// All rules a user holds, direct plus role-carried.
    pub fn list_user_rules(&self, username: &str) -> Vec<PermissionRule> {
        let mut all = Vec::new();
        if let Some(rules) = self.user_rules.read().get(username) {
            all.extend(rules.iter().cloned());
        }
        if let Some(assigned) = self.user_roles.read().get(username) {
            let roles = self.roles.read();
            for name in assigned {
                if let Some(role) = roles.get(name) {
                    all.extend(role.rules.iter().cloned());
                }
            }
        }
        all
    }

    /// Roles assigned to a user.
    pub fn user_roles(&self, username: &str) -> Vec<String> {
        self.user_roles
            .read()
            .get(username)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A rule matches a request iff the permission and resource type are equal
/// and the rule name is empty, exact, or a glob (`*` → `.*`) match.
fn rule_matches(rule: &PermissionRule, perm: Permission, res: &Resource) -> bool {
    if rule.permission != perm || rule.resource.kind != res.kind {
        return false;
    }
    if rule.resource.name.is_empty() {
        return true;
    }
    if rule.resource.name.contains('*') {
        return glob_matches(&rule.resource.name, &res.name);
    }
    rule.resource.name == res.name
}

/// `*` is the only wildcard; everything else is literal and the match
/// covers the whole name.
fn glob_matches(pattern: &str, name: &str) -> bool {
    let mut regex_pattern = String::with_capacity(pattern.len() + 4);
    regex_pattern.push('^');
    for ch in pattern.chars() {
        if ch == '*' {
            regex_pattern.push_str(".*");
        } else {
            regex_pattern.push_str(&regex::escape(&ch.to_string()));
        }
    }
    regex_pattern.push('$');
    regex::Regex::new(&regex_pattern)
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}
