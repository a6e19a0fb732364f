//! Encrypted, size-rotated, append-only audit trail.
//!
//! Each record is compact JSON, encrypted with the data key, and appended as
//! one `ciphertext ‖ 0x0A` line. When the current file reaches `max_size`
//! the logger rotates to a fresh `audit_<yyyymmddHHMMSS>.log`. Read-back
//! walks every `.log` file and silently skips lines it cannot decrypt or
//! parse.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sudb_common::{SudbError, SudbResult};

use crate::crypto::CryptoManager;

/// Default rotation threshold: 10 MiB.
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub user: String,
    pub action: String,
    pub object: String,
    pub status: String,
    pub details: String,
    pub ip: String,
}

impl AuditEntry {
    pub fn new(level: AuditLevel, user: &str, action: &str, object: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            user: user.to_string(),
            action: action.to_string(),
            object: object.to_string(),
            status: String::new(),
            details: String::new(),
            ip: String::new(),
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }
}

struct LoggerInner {
    file: Option<File>,
    cur_size: u64,
}

/// Append-only encrypted audit logger.
pub struct AuditLogger {
    inner: Mutex<LoggerInner>,
    crypto: Arc<CryptoManager>,
    dir: PathBuf,
    max_size: u64,
}

impl AuditLogger {
    pub fn new(
        dir: impl Into<PathBuf>,
        crypto: Arc<CryptoManager>,
        max_size: u64,
    ) -> SudbResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let logger = Self {
            inner: Mutex::new(LoggerInner {
                file: None,
                cur_size: 0,
            }),
            crypto,
            dir,
            max_size,
        };
        logger.rotate(&mut logger.inner.lock())?;
        Ok(logger)
    }

    /// Append one record. Rotates first when the size threshold is reached.
    pub fn log(&self, entry: &AuditEntry) -> SudbResult<()> {
        let mut inner = self.inner.lock();

        if inner.cur_size >= self.max_size {
            self.rotate(&mut inner)?;
        }

        let data = serde_json::to_vec(entry)?;
        let mut line = self.crypto.encrypt(&data)?;
        line.push(b'\n');

        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| SudbError::Internal("审计日志已关闭".into()))?;
        file.write_all(&line)?;
        inner.cur_size += line.len() as u64;
        Ok(())
    }

    fn rotate(&self, inner: &mut LoggerInner) -> SudbResult<()> {
        // Dropping the old handle closes it.
        inner.file = None;

        let filename = format!("audit_{}.log", Utc::now().format("%Y%m%d%H%M%S"));
        let path = self.dir.join(filename);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        inner.cur_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        inner.file = Some(file);
        Ok(())
    }

    /// All entries with `start ≤ timestamp ≤ end`, across every log file.
    /// Lines that fail to decrypt or parse are skipped.
    pub fn read_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SudbResult<Vec<AuditEntry>> {
        let _guard = self.inner.lock();

        let mut names: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
            .collect();
        // Rotation stamps order files chronologically by name.
        names.sort();

        let mut entries = Vec::new();
        for path in names {
            let data = fs::read(&path)?;
            for line in data.split(|b| *b == b'\n') {
                if line.is_empty() {
                    continue;
                }
                let Ok(decrypted) = self.crypto.decrypt(line) else {
                    continue;
                };
                let Ok(entry) = serde_json::from_slice::<AuditEntry>(&decrypted) else {
                    continue;
                };
                if entry.timestamp >= start && entry.timestamp <= end {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Flush and close the current file.
    pub fn close(&self) -> SudbResult<()> {
        let mut inner = self.inner.lock();
        if let Some(mut file) = inner.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}
