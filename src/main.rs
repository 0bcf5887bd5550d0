// =============================================================================
// Candle Sync — Main Entry Point
// =============================================================================
//
// Roles (first CLI argument):
//   publisher   Binance kline WebSocket → latest-value store
//   worker      latest-value store → reconciled candle buffer (default)
//   standalone  both in one process over an in-memory store
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod error;
mod history;
mod market_data;
mod reconcile;
mod runtime_config;
mod store;
mod types;
mod worker;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::BinanceClient;
use crate::reconcile::Reconciler;
use crate::runtime_config::RuntimeConfig;
use crate::store::{LatestValueStore, MemoryStore, RedisStore};
use crate::worker::Worker;

const CONFIG_PATH: &str = "runtime_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Publisher,
    Worker,
    Standalone,
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "publisher" | "master" => Ok(Self::Publisher),
            "worker" => Ok(Self::Worker),
            "standalone" => Ok(Self::Standalone),
            other => bail!("unknown role {other:?} (expected publisher, worker or standalone)"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let role: Role = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => Role::Worker,
    };

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        let defaults = RuntimeConfig::default();
        if let Err(e) = defaults.save(CONFIG_PATH) {
            warn!(error = %e, "Failed to write default config");
        }
        defaults
    });
    config.apply_overrides(|name| std::env::var(name).ok());

    info!(role = ?role, "Candle Sync starting");

    // ── 2. Spawn the selected role(s) ────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut publishers: JoinSet<()> = JoinSet::new();
    let mut worker: Option<JoinHandle<()>> = None;

    match role {
        Role::Publisher => {
            let store: Arc<dyn LatestValueStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
            spawn_publishers(&mut publishers, &config, store)?;
        }
        Role::Worker => {
            let store: Arc<dyn LatestValueStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);
            worker = Some(spawn_worker(&config, store, shutdown_rx).await?);
        }
        Role::Standalone => {
            let store: Arc<dyn LatestValueStore> = Arc::new(MemoryStore::new());
            let worker_topic = config.worker_key().topic();
            if !config.publisher_topics.iter().any(|t| t.eq_ignore_ascii_case(&worker_topic)) {
                config.publisher_topics.push(worker_topic);
            }
            spawn_publishers(&mut publishers, &config, store.clone())?;
            worker = Some(spawn_worker(&config, store, shutdown_rx).await?);
        }
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 3. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");
    let _ = shutdown_tx.send(true);

    // Publisher loops reconnect forever; the worker drains and returns.
    publishers.abort_all();
    if let Some(handle) = worker {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task failed");
        }
    }

    info!("Candle Sync shut down complete.");
    Ok(())
}

/// One reconnecting stream task per configured series.
fn spawn_publishers(
    tasks: &mut JoinSet<()>,
    config: &RuntimeConfig,
    store: Arc<dyn LatestValueStore>,
) -> anyhow::Result<()> {
    let keys = config.publisher_keys()?;
    if keys.is_empty() {
        bail!("no publisher topics configured");
    }

    for key in keys {
        let store = store.clone();
        let ws_base = config.binance_ws_url.clone();
        let delay = config.reconnect_delay();
        tasks.spawn(async move {
            loop {
                if let Err(e) = market_data::kline_stream::run_kline_stream(&key, &ws_base, store.as_ref()).await {
                    error!(key = %key, error = %e, "Kline stream error, reconnecting");
                }
                tokio::time::sleep(delay).await;
            }
        });
    }

    info!(topics = ?config.publisher_topics, "Kline publishers launched");
    Ok(())
}

/// Seed the reconciler once, then hand it to a polling worker task.
async fn spawn_worker(
    config: &RuntimeConfig,
    store: Arc<dyn LatestValueStore>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let api_key = std::env::var("BINANCE_API_KEY").ok();
    let client = BinanceClient::new(api_key.as_deref(), &config.binance_rest_url)
        .context("failed to build Binance client")?;

    let key = config.worker_key();
    let mut reconciler = Reconciler::new(key.clone(), Arc::new(client), config.retry_policy(), config.seed_count);

    match reconciler.seed(config.seed_count).await {
        Ok(merged) => info!(key = %key, merged, "Initial seed complete"),
        Err(e) => warn!(key = %key, error = %e, "Initial seed failed, will retry on first update"),
    }

    let worker = Worker::new(store, reconciler, config.poll_interval());
    Ok(tokio::spawn(async move {
        let reconciler = worker.run(shutdown).await;
        info!(key = %reconciler.key(), bars = reconciler.len(), "Worker finished");
    }))
}
