//! Persistent user directory with encrypted storage.
//!
//! The directory lives as a single encrypted JSON file. At bootstrap, an
//! absent, empty, undecipherable, or unparseable store is replaced by a
//! default administrator `root`/`123456` with role `admin` — the store is
//! system state, never worth a fatal.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sudb_common::{SudbError, SudbResult};

use crate::crypto::CryptoManager;
use crate::password;
use crate::permission::{Permission, PermissionManager, PermissionRule, Resource};

pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PASSWORD: &str = "123456";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Locked,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// PBKDF2 hash string, never the plaintext.
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub status: UserStatus,
}

/// The user manager: in-memory map persisted encrypted, plus the permission
/// engine it feeds role assignments into.
pub struct UserManager {
    users: RwLock<HashMap<String, User>>,
    crypto: Arc<CryptoManager>,
    path: PathBuf,
    perms: PermissionManager,
}

impl UserManager {
    /// Open (or bootstrap) the user store at `path`.
    pub fn open(path: impl Into<PathBuf>, crypto: Arc<CryptoManager>) -> SudbResult<Self> {
        let path = path.into();
        let um = Self {
            users: RwLock::new(HashMap::new()),
            crypto,
            path,
            perms: PermissionManager::new(),
        };

        match um.load() {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!("用户存储不可用，重建默认用户: {e}");
                um.users.write().clear();
            }
        }

        if um.users.read().is_empty() {
            um.create_user(DEFAULT_USER, DEFAULT_PASSWORD, vec!["admin".into()])?;
        } else {
            // Re-register persisted role assignments with the permission
            // engine, which starts empty on every boot.
            let users = um.users.read();
            for user in users.values() {
                for role in &user.roles {
                    if let Err(e) = um.perms.assign_role(&user.username, role) {
                        tracing::warn!("跳过无效角色 {role} (用户 {}): {e}", user.username);
                    }
                }
            }
        }

        Ok(um)
    }

    fn load(&self) -> SudbResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let data = fs::read(&self.path)?;
        if data.is_empty() {
            return Ok(());
        }
        let decrypted = self.crypto.decrypt(&data)?;
        let users: HashMap<String, User> = serde_json::from_slice(&decrypted)?;
        *self.users.write() = users;
        Ok(())
    }

    /// Serialize, encrypt, and persist the directory (mode 0600).
    fn save(&self) -> SudbResult<()> {
        let data = {
            let users = self.users.read();
            serde_json::to_vec_pretty(&*users)?
        };
        let encrypted = self.crypto.encrypt(&data)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, encrypted)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Create a user with the given roles.
    pub fn create_user(&self, username: &str, pass: &str, roles: Vec<String>) -> SudbResult<()> {
        {
            let mut users = self.users.write();
            if users.contains_key(username) {
                return Err(SudbError::Conflict("用户已存在".into()));
            }
            users.insert(
                username.to_string(),
                User {
                    username: username.to_string(),
                    password: password::hash_password(pass),
                    roles: roles.clone(),
                    status: UserStatus::Active,
                },
            );
        }

        for role in &roles {
            self.perms.assign_role(username, role)?;
        }
        self.save()
    }

    /// Remove a user and persist.
    pub fn delete_user(&self, username: &str) -> SudbResult<()> {
        if self.users.write().remove(username).is_none() {
            return Err(SudbError::NotFound("用户不存在".into()));
        }
        self.save()
    }

    /// True iff the user exists, is active, and the password verifies.
    pub fn validate_user(&self, username: &str, pass: &str) -> bool {
        let users = self.users.read();
        let Some(user) = users.get(username) else {
            return false;
        };
        if user.status != UserStatus::Active {
            return false;
        }
        password::verify_password(pass, &user.password)
    }

    /// RBAC gate: `root` always passes, then any user carrying the `admin`
    /// role, then the permission engine.
    pub fn check_permission(&self, username: &str, perm: Permission, res: &Resource) -> bool {
        {
            let users = self.users.read();
            let Some(user) = users.get(username) else {
                return false;
            };
            if user.status != UserStatus::Active {
                return false;
            }
            if username == DEFAULT_USER {
                return true;
            }
            if user.roles.iter().any(|r| r == "admin") {
                return true;
            }
        }
        self.perms.check_permission(username, perm, res)
    }

    /// Assign an additional role and persist.
    pub fn assign_role(&self, username: &str, role: &str) -> SudbResult<()> {
        {
            let mut users = self.users.write();
            let user = users
                .get_mut(username)
                .ok_or_else(|| SudbError::NotFound("用户不存在".into()))?;
            if !user.roles.iter().any(|r| r == role) {
                user.roles.push(role.to_string());
            }
        }
        self.perms.assign_role(username, role)?;
        self.save()
    }

    /// Grant a direct rule (not persisted into the user record; direct rules
    /// live in the permission engine for the process lifetime).
    pub fn grant_rule(&self, username: &str, rule: PermissionRule) {
        self.perms.grant_rule(username, rule);
    }

    pub fn lock_user(&self, username: &str) -> SudbResult<()> {
        self.set_status(username, UserStatus::Locked)
    }

    pub fn unlock_user(&self, username: &str) -> SudbResult<()> {
        self.set_status(username, UserStatus::Active)
    }

    pub fn disable_user(&self, username: &str) -> SudbResult<()> {
        self.set_status(username, UserStatus::Disabled)
    }

    fn set_status(&self, username: &str, status: UserStatus) -> SudbResult<()> {
        {
            let mut users = self.users.write();
            let user = users
                .get_mut(username)
                .ok_or_else(|| SudbError::NotFound("用户不存在".into()))?;
            user.status = status;
        }
        self.save()
    }

    pub fn list_users(&self) -> Vec<User> {
        self.users.read().values().cloned().collect()
    }

    pub fn get_user(&self, username: &str) -> Option<User> {
        self.users.read().get(username).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<CryptoManager>, UserManager) {
        let dir = TempDir::new().unwrap();
        let crypto = Arc::new(CryptoManager::generate());
        let um = UserManager::open(dir.path().join("user.sudb"), crypto.clone()).unwrap();
        (dir, crypto, um)
    }

    #[test]
    fn test_bootstrap_creates_root() {
        let (_dir, _crypto, um) = setup();
        assert!(um.validate_user(DEFAULT_USER, DEFAULT_PASSWORD));
        let root = um.get_user(DEFAULT_USER).unwrap();
        assert_eq!(root.roles, vec!["admin".to_string()]);
        assert_eq!(root.status, UserStatus::Active);
        // The stored password is hashed, never the plaintext.
        assert_ne!(root.password, DEFAULT_PASSWORD);
    }

    #[test]
    fn test_validate_rejects_wrong_password() {
        let (_dir, _crypto, um) = setup();
        assert!(!um.validate_user(DEFAULT_USER, "wrong"));
        assert!(!um.validate_user("ghost", DEFAULT_PASSWORD));
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let (_dir, _crypto, um) = setup();
        um.create_user("bob", "pw", vec!["readonly".into()]).unwrap();
        assert!(um.create_user("bob", "pw2", vec![]).is_err());
    }

    #[test]
    fn test_persisted_store_reloads() {
        let dir = TempDir::new().unwrap();
        let crypto = Arc::new(CryptoManager::generate());
        let path = dir.path().join("user.sudb");
        {
            let um = UserManager::open(&path, crypto.clone()).unwrap();
            um.create_user("bob", "secret", vec!["readonly".into()]).unwrap();
        }
        let um = UserManager::open(&path, crypto).unwrap();
        assert!(um.validate_user("bob", "secret"));
        // Role assignments survive the reload into the permission engine.
        assert!(um.check_permission("bob", Permission::Select, &Resource::table("t")));
    }

    #[test]
    fn test_undecipherable_store_resets_to_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("user.sudb");
        std::fs::write(&path, b"garbage that is not a ciphertext").unwrap();
        let um = UserManager::open(&path, Arc::new(CryptoManager::generate())).unwrap();
        assert!(um.validate_user(DEFAULT_USER, DEFAULT_PASSWORD));
    }

    #[test]
    fn test_empty_store_resets_to_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("user.sudb");
        std::fs::write(&path, b"").unwrap();
        let um = UserManager::open(&path, Arc::new(CryptoManager::generate())).unwrap();
        assert!(um.validate_user(DEFAULT_USER, DEFAULT_PASSWORD));
    }

    #[test]
    fn test_status_transitions() {
        let (_dir, _crypto, um) = setup();
        um.create_user("bob", "pw", vec![]).unwrap();
        um.lock_user("bob").unwrap();
        assert!(!um.validate_user("bob", "pw"));
        um.unlock_user("bob").unwrap();
        assert!(um.validate_user("bob", "pw"));
        um.disable_user("bob").unwrap();
        assert!(!um.validate_user("bob", "pw"));
        assert!(um.lock_user("ghost").is_err());
    }

    #[test]
    fn test_root_bypasses_rbac() {
        let (_dir, _crypto, um) = setup();
        assert!(um.check_permission(DEFAULT_USER, Permission::Delete, &Resource::table("t")));
    }

    #[test]
    fn test_admin_role_bypasses_rbac() {
        let (_dir, _crypto, um) = setup();
        um.create_user("ops", "pw", vec!["admin".into()]).unwrap();
        assert!(um.check_permission("ops", Permission::Delete, &Resource::table("t")));
    }

    #[test]
    fn test_readonly_user_denied_writes() {
        let (_dir, _crypto, um) = setup();
        um.create_user("bob", "pw", vec!["readonly".into()]).unwrap();
        assert!(um.check_permission("bob", Permission::Select, &Resource::table("t")));
        assert!(!um.check_permission("bob", Permission::CreateDatabase, &Resource::any_database()));
    }

    #[test]
    fn test_inactive_user_denied_everything() {
        let (_dir, _crypto, um) = setup();
        um.create_user("bob", "pw", vec!["admin".into()]).unwrap();
        um.lock_user("bob").unwrap();
        assert!(!um.check_permission("bob", Permission::Select, &Resource::table("t")));
    }

    #[test]
    fn test_direct_rule_grant() {
        let (_dir, _crypto, um) = setup();
        um.create_user("bob", "pw", vec![]).unwrap();
        assert!(!um.check_permission("bob", Permission::Select, &Resource::database("a.b")));
        um.grant_rule(
            "bob",
            PermissionRule::new(Permission::Select, Resource::database("a.b")),
        );
        assert!(um.check_permission("bob", Permission::Select, &Resource::database("a.b")));
    }

    #[test]
    fn test_delete_user() {
        let (_dir, _crypto, um) = setup();
        um.create_user("bob", "pw", vec![]).unwrap();
        um.delete_user("bob").unwrap();
        assert!(um.get_user("bob").is_none());
        assert!(um.delete_user("bob").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_is_0600() {
        use std::os::unix::fs::PermissionsExt;
        let (dir, _crypto, _um) = setup();
        let mode = std::fs::metadata(dir.path().join("user.sudb"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
