use serde::{Deserialize, Serialize};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SudbConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP listen address. A bare ":port" binds all interfaces.
    pub listen_addr: String,
    /// Max concurrent client connections.
    pub max_clients: usize,
    /// Per-frame read deadline in seconds. Expiry re-enters the read loop
    /// without closing the session.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Graceful shutdown drain window in seconds.
    #[serde(default = "default_drain_timeout_secs")]
    pub shutdown_drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ":5432".into(),
            max_clients: 1000,
            read_timeout_secs: default_read_timeout_secs(),
            shutdown_drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// User data root (collections live here).
    pub data_dir: String,
    /// System file root (keys, users, audit logs, backups).
    pub builtin_dir: String,
    /// Autosave interval for the memory store, in seconds.
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            builtin_dir: "./builtin".into(),
            save_interval_secs: default_save_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Size threshold that triggers audit log rotation, in bytes.
    pub max_file_size: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
        }
    }
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_save_interval_secs() -> u64 {
    30 * 60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SudbConfig::default();
        assert_eq!(cfg.server.listen_addr, ":5432");
        assert_eq!(cfg.server.max_clients, 1000);
        assert_eq!(cfg.server.read_timeout_secs, 30);
        assert_eq!(cfg.server.shutdown_drain_timeout_secs, 5);
        assert_eq!(cfg.storage.data_dir, "./data");
        assert_eq!(cfg.storage.save_interval_secs, 1800);
        assert_eq!(cfg.audit.max_file_size, 10 * 1024 * 1024);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"listen_addr": ":6000", "max_clients": 10}"#).unwrap();
        assert_eq!(cfg.listen_addr, ":6000");
        assert_eq!(cfg.read_timeout_secs, 30);
    }
}
