use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use sudb_common::config::ServerConfig;
use sudb_security::{AuditLogger, CryptoManager, UserManager};
use sudb_server::Server;
use sudb_storage::StorageEngine;

/// System file directory (keys, users, audit logs, backups).
const BUILTIN_DIR: &str = "./builtin";

#[derive(Parser, Debug)]
#[command(name = "sudb", about = "SuDB — networked multi-tenant document database")]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = ":5432")]
    addr: String,

    /// User data directory.
    #[arg(long, default_value = "./data")]
    data: String,

    /// Maximum concurrent client connections.
    #[arg(long, default_value = "1000")]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing();
    tracing::info!("Starting SuDB...");

    let builtin_dir = Path::new(BUILTIN_DIR);
    std::fs::create_dir_all(builtin_dir).context("创建系统目录失败")?;
    std::fs::create_dir_all(&cli.data).context("创建数据目录失败")?;

    let crypto =
        Arc::new(CryptoManager::load_or_generate(builtin_dir).context("加载密钥失败")?);

    let users = Arc::new(
        UserManager::open(builtin_dir.join("user.sudb"), crypto.clone())
            .context("初始化用户管理器失败")?,
    );

    let audit = Arc::new(
        AuditLogger::new(
            builtin_dir.join("logs").join("audit"),
            crypto.clone(),
            sudb_security::audit::DEFAULT_MAX_SIZE,
        )
        .context("初始化审计日志失败")?,
    );

    let engine = Arc::new(
        StorageEngine::open(
            &cli.data,
            builtin_dir,
            crypto,
            Duration::from_secs(30 * 60),
        )
        .context("初始化存储引擎失败")?,
    );

    let config = ServerConfig {
        listen_addr: cli.addr,
        max_clients: cli.max_clients,
        ..Default::default()
    };

    let server = Server::bind(config, engine, users, audit)
        .await
        .context("监听端口失败")?;

    server
        .run_with_shutdown(wait_for_shutdown_signal())
        .await
        .context("服务器运行失败")?;

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sudb=debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .unwrap_or_else(|e| panic!("Failed to register SIGTERM handler: {e}"));
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
