use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewall::config::{RatewallConfig, StoreConfig};
use ratewall::ratelimit::{MemoryStore, RateLimiter, RedisStore, ScoreStore};
use ratewall::server::HttpServer;

/// Sliding-window HTTP rate limiter.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to serve HTTP on, overrides the configuration file
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Score store backend, overrides the configuration file
    #[arg(long, value_enum)]
    store: Option<StoreKind>,

    /// Redis URL used with `--store redis`
    #[arg(long, default_value = "redis://127.0.0.1/")]
    redis_url: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreKind {
    Memory,
    Redis,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Ratewall");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match args.config {
        Some(ref path) => RatewallConfig::from_file(path)?,
        None => RatewallConfig::default(),
    };
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    match args.store {
        Some(StoreKind::Memory) => config.store = StoreConfig::default(),
        Some(StoreKind::Redis) => config.store = StoreConfig::redis(args.redis_url.clone()),
        None => {}
    }
    config.rate_limiting = config.rate_limiting.with_env_overrides()?;

    info!(
        http_addr = %config.server.http_addr,
        limit = config.rate_limiting.max_requests_per_time,
        timeframe = %config.rate_limiting.timeframe,
        "Configuration loaded"
    );

    let window = config.rate_limiting.timeframe.duration();
    let store: Arc<dyn ScoreStore> = match config.store {
        StoreConfig::Memory { sweep_interval_secs } => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(window, Duration::from_secs(sweep_interval_secs.max(1)));
            info!("Using in-memory score store");
            store as Arc<dyn ScoreStore>
        }
        ref redis @ StoreConfig::Redis { .. } => {
            let (url, settings) = redis
                .redis_settings()
                .ok_or_else(|| anyhow::anyhow!("redis store settings missing"))?;
            Arc::new(RedisStore::connect_with_config(url, settings).await?)
        }
    };

    let rate_limiter = Arc::new(RateLimiter::from_config(store, &config.rate_limiting)?);
    info!(limiter = ?rate_limiter, "Rate limiter initialized");

    let server = HttpServer::with_default_app(config.server.http_addr, rate_limiter.clone());
    server.serve_with_shutdown(shutdown_signal()).await?;

    let stats = rate_limiter.stats();
    info!(
        admitted = stats.admitted,
        limited = stats.limited,
        store_failures = stats.store_failures,
        missed_records = stats.missed_records,
        "Ratewall stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
