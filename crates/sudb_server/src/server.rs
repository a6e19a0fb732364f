//! TCP accept loop and per-connection workers.
//!
//! One task per accepted connection. Frames are read under a 30-second
//! deadline; a deadline expiry re-enters the loop without dropping the
//! session, while protocol faults and EOF close it. Shutdown stops the
//! accept loop, drains in-flight connections for up to the configured
//! window, flushes the memory store, and closes the audit trail.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};

use sudb_common::config::ServerConfig;
use sudb_common::SudbError;
use sudb_protocol::{read_message, write_message, Message, MessageKind};
use sudb_security::{AuditEntry, AuditLevel, AuditLogger, UserManager};
use sudb_storage::StorageEngine;

use crate::dispatch::QueryHandler;
use crate::session::{Session, SessionRegistry};

#[derive(Debug, Deserialize)]
struct AuthPayload {
    username: String,
    password: String,
}

/// The SuDB server: listener, session registry, and shared managers.
pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    engine: Arc<StorageEngine>,
    users: Arc<UserManager>,
    audit: Arc<AuditLogger>,
    handler: Arc<QueryHandler>,
    sessions: Arc<SessionRegistry>,
}

impl Server {
    /// Bind the listener and assemble the server.
    pub async fn bind(
        config: ServerConfig,
        engine: Arc<StorageEngine>,
        users: Arc<UserManager>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, SudbError> {
        let addr = normalize_addr(&config.listen_addr);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("服务器启动，监听地址: {}", listener.local_addr()?);

        let handler = Arc::new(QueryHandler::new(
            engine.clone(),
            users.clone(),
            audit.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new(config.max_clients));

        Ok(Self {
            listener,
            config,
            engine,
            users,
            audit,
            handler,
            sessions,
        })
    }

    /// The bound address (useful when the config asked for port 0).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves, then drain and flush.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<(), SudbError> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    self.spawn_connection(stream, addr.to_string());
                }
                _ = &mut shutdown => {
                    tracing::info!("正在关闭服务器...");
                    break;
                }
            }
        }

        // Drain in-flight connections.
        let drain = Duration::from_secs(self.config.shutdown_drain_timeout_secs);
        let deadline = tokio::time::Instant::now() + drain;
        while self.sessions.count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("服务器关闭超时，仍有 {} 个连接", self.sessions.count());
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Flush the store, record the shutdown, close the audit trail.
        self.engine.shutdown();
        let entry = AuditEntry::new(AuditLevel::Info, "SYSTEM", "SHUTDOWN", "SERVER")
            .with_status("SUCCESS")
            .with_details("服务器正常关闭");
        if let Err(e) = self.audit.log(&entry) {
            tracing::warn!("审计日志写入失败: {e}");
        }
        if let Err(e) = self.audit.close() {
            tracing::warn!("关闭审计日志失败: {e}");
        }
        tracing::info!("服务器已关闭");
        Ok(())
    }

    fn spawn_connection(&self, mut stream: TcpStream, addr: String) {
        let Some(session) = self.sessions.register(Session::new(addr.clone())) else {
            tracing::warn!("连接数已达上限，拒绝 {addr}");
            tokio::spawn(async move {
                let reply = Message::error("连接数已达上限");
                let _ = write_message(&mut stream, &reply).await;
            });
            return;
        };

        let session_id = session.lock().id;
        let sessions = self.sessions.clone();
        let users = self.users.clone();
        let audit = self.audit.clone();
        let handler = self.handler.clone();
        let read_timeout = Duration::from_secs(self.config.read_timeout_secs);

        tracing::info!("新客户端连接: {addr}");
        tokio::spawn(async move {
            let worker = ConnectionWorker {
                users,
                audit,
                handler,
                session,
                read_timeout,
            };
            worker.run(&mut stream).await;
            sessions.remove(session_id);
            tracing::info!("客户端断开连接: {addr}");
        });
    }
}

struct ConnectionWorker {
    users: Arc<UserManager>,
    audit: Arc<AuditLogger>,
    handler: Arc<QueryHandler>,
    session: Arc<parking_lot::Mutex<Session>>,
    read_timeout: Duration,
}

impl ConnectionWorker {
    async fn run(&self, stream: &mut TcpStream) {
        loop {
            let msg = match tokio::time::timeout(self.read_timeout, read_message(stream)).await {
                // A read deadline re-enters the loop; the session survives.
                Err(_elapsed) => continue,
                Ok(Err(e)) => {
                    if !matches!(&e, sudb_protocol::WireError::Io(io)
                        if io.kind() == std::io::ErrorKind::UnexpectedEof)
                    {
                        tracing::warn!("读取消息错误: {e}");
                    }
                    break;
                }
                Ok(Ok(msg)) => msg,
            };

            let reply = self.process(&msg);
            if write_message(stream, &reply).await.is_err() {
                break;
            }
        }
        self.session.lock().close();
    }

    /// Map one request frame to its reply frame.
    fn process(&self, msg: &Message) -> Message {
        let (authenticated, user, addr) = {
            let s = self.session.lock();
            (s.is_authenticated(), s.user.clone(), s.remote_addr.clone())
        };

        if !authenticated && msg.kind != MessageKind::Auth {
            return Message::error("需要认证");
        }

        match msg.kind {
            MessageKind::Auth => self.handle_auth(msg),
            MessageKind::Query => {
                self.session.lock().on_request();
                let raw = msg.payload_str();
                tracing::debug!("收到请求 [{addr}]: {raw}");
                match self.handler.handle_query(&user, &addr, &raw) {
                    Ok(payload) => Message::result(payload),
                    Err(e) => Message::error(&e.wire_message()),
                }
            }
            // Result/Error frames are server-to-client only.
            _ => Message::error("未知的消息类型"),
        }
    }

    fn handle_auth(&self, msg: &Message) -> Message {
        let auth: AuthPayload = match serde_json::from_slice(&msg.payload) {
            Ok(a) => a,
            Err(e) => return Message::error(&format!("无效的认证数据: {e}")),
        };

        if !self.users.validate_user(&auth.username, &auth.password) {
            return Message::error("认证失败");
        }

        let addr = {
            let mut s = self.session.lock();
            s.on_auth_ok(&auth.username);
            s.remote_addr.clone()
        };

        let entry = AuditEntry::new(AuditLevel::Info, &auth.username, "AUTH", "USER")
            .with_status("SUCCESS")
            .with_details("用户登录成功")
            .with_ip(addr);
        if let Err(e) = self.audit.log(&entry) {
            tracing::warn!("审计日志写入失败: {e}");
        }

        Message::result("认证成功".as_bytes().to_vec())
    }
}

/// Accept the bare ":port" form by binding all interfaces.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":5432"), "0.0.0.0:5432");
        assert_eq!(normalize_addr("127.0.0.1:5432"), "127.0.0.1:5432");
    }
}
