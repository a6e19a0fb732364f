use thiserror::Error;

/// Convenience alias for `Result<T, SudbError>`.
pub type SudbResult<T> = Result<T, SudbError>;

/// Error classification for session handling decisions.
///
/// - `Protocol`   — malformed frame, unknown type; tears down the connection
/// - `Auth`       — missing/invalid credentials, unauthenticated access
/// - `Parse`      — dialect syntax error
/// - `Permission` — RBAC denial
/// - `NotFound`   — missing collection/database/user/backup
/// - `Conflict`   — duplicate name, exceeded quota
/// - `Io`         — disk failure
/// - `Integrity`  — decryption or JSON parse failure on persisted state
/// - `Internal`   — should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Auth,
    Parse,
    Permission,
    NotFound,
    Conflict,
    Io,
    Integrity,
    Internal,
}

/// Top-level error type shared by every crate in the workspace.
#[derive(Error, Debug)]
pub enum SudbError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SudbError {
    /// Classify this error for session handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SudbError::Protocol(_) => ErrorKind::Protocol,
            SudbError::Auth(_) => ErrorKind::Auth,
            SudbError::Parse(_) => ErrorKind::Parse,
            SudbError::Permission(_) => ErrorKind::Permission,
            SudbError::NotFound(_) => ErrorKind::NotFound,
            SudbError::Conflict(_) => ErrorKind::Conflict,
            SudbError::Io(_) => ErrorKind::Io,
            SudbError::Integrity(_) => ErrorKind::Integrity,
            SudbError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only protocol faults close the session; every other error is reported
    /// in an `Error` frame and the connection keeps its state.
    pub fn closes_connection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol)
    }

    /// The bare message carried on the wire in an `Error` frame.
    ///
    /// Clients match on these strings (e.g. "需要认证", "权限不足"), so the
    /// kind prefix of the `Display` impl must not leak into the payload.
    pub fn wire_message(&self) -> String {
        match self {
            SudbError::Protocol(m)
            | SudbError::Auth(m)
            | SudbError::Parse(m)
            | SudbError::Permission(m)
            | SudbError::NotFound(m)
            | SudbError::Conflict(m)
            | SudbError::Integrity(m)
            | SudbError::Internal(m) => m.clone(),
            SudbError::Io(e) => e.to_string(),
        }
    }

    /// Add context to an error, preserving its classification.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            SudbError::Protocol(m) => SudbError::Protocol(format!("{ctx}: {m}")),
            SudbError::Auth(m) => SudbError::Auth(format!("{ctx}: {m}")),
            SudbError::Parse(m) => SudbError::Parse(format!("{ctx}: {m}")),
            SudbError::Permission(m) => SudbError::Permission(format!("{ctx}: {m}")),
            SudbError::NotFound(m) => SudbError::NotFound(format!("{ctx}: {m}")),
            SudbError::Conflict(m) => SudbError::Conflict(format!("{ctx}: {m}")),
            SudbError::Integrity(m) => SudbError::Integrity(format!("{ctx}: {m}")),
            SudbError::Internal(m) => SudbError::Internal(format!("{ctx}: {m}")),
            SudbError::Io(e) => SudbError::Internal(format!("{ctx}: {e}")),
        }
    }
}

impl From<serde_json::Error> for SudbError {
    fn from(e: serde_json::Error) -> Self {
        SudbError::Integrity(format!("JSON error: {e}"))
    }
}

/// Add context to a Result, preserving error classification.
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> SudbResult<T>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> SudbResult<T>;
}

impl<T, E: Into<SudbError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> SudbResult<T> {
        self.map_err(|e| e.into().with_context(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> SudbResult<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}
