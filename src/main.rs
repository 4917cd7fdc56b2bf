//! wamux server binary: load config, open the database, restore sessions,
//! start the queue workers and sweeps, and serve the HTTP gateway.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wamux::autoreply::AutoReplyEngine;
use wamux::bulk::BulkEngine;
use wamux::config::{wamux_home, Config};
use wamux::gateway::{self, AppState};
use wamux::media::MediaStore;
use wamux::queue::worker::WorkerPool;
use wamux::queue::JobQueue;
use wamux::session::SessionManager;
use wamux::wa::sim::SimClientFactory;
use wamux::wa::ClientFactory;
use wamux::webhook::WebhookDispatcher;
use wamux::{db, logging};

#[derive(Parser)]
#[command(name = "wamux", version, about = "Multi-tenant WhatsApp session manager")]
struct Cli {
    /// Config file path (default: ~/.wamux/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the gateway bind address
    #[arg(long)]
    bind: Option<String>,

    /// Override the gateway port
    #[arg(long)]
    port: Option<u16>,

    /// Override the log filter (e.g. "wamux=debug")
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| wamux_home().join("config.toml"));
    let mut config = Config::load(&config_path)?;
    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    if let Some(filter) = cli.log_filter {
        config.logging.filter = filter;
    }

    let _log_guard = logging::init(&config.logging)?;
    tracing::info!("wamux {} starting", wamux::VERSION);

    let pool = db::connect(&config.database.path).await?;
    let media = Arc::new(MediaStore::new(&config.media)?);

    let factory: Arc<dyn ClientFactory> = match config.transport.kind.as_str() {
        "sim" => Arc::new(SimClientFactory::new()),
        other => anyhow::bail!(
            "unknown transport kind {other:?}; an external protocol adapter must register it"
        ),
    };

    let manager = SessionManager::new(
        pool.clone(),
        factory,
        config.sessions.clone(),
        WebhookDispatcher::new(config.webhook.clone()),
        media.clone(),
    );
    let autoreply = AutoReplyEngine::new(pool.clone(), &manager, config.auto_reply.clone());
    manager.attach_auto_reply(autoreply.clone());
    manager.restore_sessions().await?;

    let bulk = BulkEngine::new(manager.clone(), pool.clone());
    let queue = JobQueue::new(pool.clone());
    queue.release_stale_running().await?;

    let shutdown = CancellationToken::new();
    let workers = WorkerPool::new(
        queue.clone(),
        manager.clone(),
        bulk.clone(),
        config.queue.clone(),
        shutdown.clone(),
    );
    let worker_handles = workers.start();
    let reset_task = autoreply.spawn_daily_reset(shutdown.clone());
    spawn_retention_sweep(
        bulk.clone(),
        queue.clone(),
        Duration::from_secs(config.bulk.retention_hours * 3600),
        Duration::from_secs(config.queue.retention_days * 86_400),
        shutdown.clone(),
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let state = AppState {
        manager,
        bulk,
        queue,
        autoreply,
        media,
        queue_defaults: config.queue.clone(),
    };
    gateway::start_server(&config.gateway, state, shutdown.clone()).await?;

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    reset_task.abort();
    tracing::info!("wamux stopped");
    Ok(())
}

/// Hourly sweep dropping finished bulk jobs and terminal queue rows past
/// their retention windows.
fn spawn_retention_sweep(
    bulk: Arc<BulkEngine>,
    queue: JobQueue,
    bulk_ttl: Duration,
    queue_ttl: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = bulk.cleanup_older_than(bulk_ttl).await;
                    if removed > 0 {
                        tracing::info!("bulk cleanup removed {removed} finished jobs");
                    }
                    if let Err(e) = queue.cleanup_older_than(queue_ttl).await {
                        tracing::warn!("queue cleanup failed: {e}");
                    }
                }
            }
        }
    });
}
