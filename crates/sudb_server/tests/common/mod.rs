#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use sudb_common::config::ServerConfig;
use sudb_protocol::{read_message, write_message, Message, MessageKind};
use sudb_security::{AuditLogger, CryptoManager, UserManager};
use sudb_server::Server;
use sudb_storage::StorageEngine;

/// A running server plus the handle needed to stop it cleanly.
pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub users: Arc<UserManager>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Spin up a full server stack rooted at `dir` on an ephemeral port.
    pub async fn start(dir: &Path) -> Self {
        let builtin = dir.join("builtin");
        std::fs::create_dir_all(&builtin).unwrap();

        let crypto = Arc::new(CryptoManager::load_or_generate(&builtin).unwrap());
        let users =
            Arc::new(UserManager::open(builtin.join("user.sudb"), crypto.clone()).unwrap());
        let audit = Arc::new(
            AuditLogger::new(builtin.join("logs/audit"), crypto.clone(), 10 * 1024 * 1024)
                .unwrap(),
        );
        let engine = Arc::new(
            StorageEngine::open(dir.join("data"), &builtin, crypto, Duration::from_secs(1800))
                .unwrap(),
        );

        // A short drain window keeps shutdown snappy when a test leaves its
        // client connected.
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            max_clients: 16,
            read_timeout_secs: 30,
            shutdown_drain_timeout_secs: 1,
        };

        let server = Server::bind(config, engine, users.clone(), audit)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (shutdown, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .run_with_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            users,
            shutdown,
            task,
        }
    }

    /// Graceful shutdown: flushes the store before returning.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

/// A framed client connection.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self { stream }
    }

    pub async fn send(&mut self, msg: Message) -> Message {
        write_message(&mut self.stream, &msg).await.unwrap();
        read_message(&mut self.stream).await.unwrap()
    }

    pub async fn auth(&mut self, username: &str, password: &str) -> Message {
        let payload = serde_json::json!({"username": username, "password": password});
        self.send(Message::auth(serde_json::to_vec(&payload).unwrap()))
            .await
    }

    pub async fn query(&mut self, sql: &str) -> Message {
        self.send(Message::query(sql)).await
    }

    /// Issue a query and parse the `Result` payload as JSON, panicking on an
    /// `Error` frame.
    pub async fn query_json(&mut self, sql: &str) -> serde_json::Value {
        let reply = self.query(sql).await;
        assert_eq!(
            reply.kind,
            MessageKind::Result,
            "query failed: {}",
            reply.payload_str()
        );
        serde_json::from_slice(&reply.payload).unwrap()
    }
}
