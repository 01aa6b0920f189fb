use std::net::SocketAddr;
use std::sync::Arc;

use cadence_core::config::CadenceConfig;
use cadence_scheduler::{
    handlers::register_builtin, HandlerRegistry, SchedulerCenter, SqliteJobStore, SqliteLogStore,
    SystemClock,
};
use clap::Parser;
use tracing::{info, warn};

mod app;
mod http;

#[derive(Debug, Parser)]
#[command(name = "cadence-gateway", version, about = "Cadence job scheduler gateway")]
struct Cli {
    /// Path to cadence.toml (defaults to ~/.cadence/cadence.toml)
    #[arg(long, env = "CADENCE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_gateway=info,cadence_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let cli = Cli::parse();
    let config = CadenceConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    // single SQLite file shared by the job and log stores
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    cadence_scheduler::db::init_db(&db)?;
    info!("database migrations complete");

    // each store gets its own connection
    let jobs = Arc::new(SqliteJobStore::new(rusqlite::Connection::open(db_path)?)?);
    let logs = Arc::new(SqliteLogStore::new(rusqlite::Connection::open(db_path)?)?);

    let mut registry = HandlerRegistry::new();
    register_builtin(&mut registry);
    let handler_keys: Vec<String> = registry.keys().iter().map(ToString::to_string).collect();
    info!(count = registry.len(), handlers = ?handler_keys, "job handlers registered");

    let center = SchedulerCenter::new(
        jobs,
        logs,
        registry,
        config.scheduler.clone(),
        Arc::new(SystemClock),
    );
    let report = center.start().await?;
    for (job_id, reason) in &report.failed {
        warn!(%job_id, "enabled job left unarmed: {reason}");
    }

    let state = Arc::new(app::AppState::new(config, Arc::clone(&center)));
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", bind, port).parse()?;
    info!("Cadence gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    center.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), "could not create database directory: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_parent_dir_creates_nested_directories() {
        let root = tempfile::tempdir().unwrap();
        let db = root.path().join("data/cadence/cadence.db");
        ensure_parent_dir(db.to_str().unwrap());
        assert!(root.path().join("data/cadence").is_dir());
    }

    #[test]
    fn ensure_parent_dir_survives_an_unusable_parent() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        // parent path runs through a regular file, so creation fails and is logged
        ensure_parent_dir(blocker.join("cadence.db").to_str().unwrap());
        assert!(blocker.is_file());
    }
}
