//! Faucet service binary

use anyhow::Context;
use clap::Parser;
use drip_common::utils::config::load_config;
use drip_common::utils::logging::init_logging;
use drip_faucet::clock::{Clock, SystemClock};
use drip_faucet::store::{CooldownStore, CounterStore, MemoryStore, RedisStore};
use drip_faucet::transfer::TransferExecutor;
use drip_faucet::{api, Backends, FaucetConfig, FaucetService, RpcTransferExecutor, SledLedger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const RELAY_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Faucet service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path (TOML, YAML or JSON)
    #[arg(short, long, env = "FAUCET_CONFIG")]
    config: Option<String>,

    /// Server address
    #[arg(long)]
    server_addr: Option<String>,

    /// Signing relay RPC URL
    #[arg(long)]
    rpc_url: Option<String>,

    /// Redis URL for the shared counter store
    #[arg(long)]
    redis_url: Option<String>,

    /// Ledger database path
    #[arg(long)]
    db_path: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn resolve_config(args: &Args) -> anyhow::Result<FaucetConfig> {
    let mut config: FaucetConfig = match &args.config {
        Some(path) => load_config(path)?,
        None => FaucetConfig::default(),
    };
    config.apply_env()?;

    if let Some(addr) = &args.server_addr {
        config.server_addr = addr.clone();
    }
    if let Some(rpc_url) = &args.rpc_url {
        config.rpc_url = rpc_url.clone();
    }
    if let Some(redis_url) = &args.redis_url {
        config.redis_url = Some(redis_url.clone());
    }
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.clone();
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = resolve_config(&args)?;

    let _log_guard = init_logging(&config.logging)?;

    info!("Starting Drip Faucet v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Server address: {}", config.server_addr);
    info!("  Network: {}", config.network);
    info!("  Default amount: {}", config.default_amount);
    info!(
        "  Rate limits: {} global / {} per source every {}s",
        config.global_limit, config.source_limit, config.rate_limit_window_secs
    );
    info!("  Wallet cooldown: {}s ({:?})", config.wallet_cooldown_secs, config.cooldown_mode);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (counters, cooldowns): (Arc<dyn CounterStore>, Arc<dyn CooldownStore>) = match &config.redis_url {
        Some(url) => {
            let store = Arc::new(RedisStore::connect(url).await?);
            if let Err(e) = store.ping().await {
                warn!(error = %e, "Redis did not answer PING, continuing");
            }
            let counters: Arc<dyn CounterStore> = store.clone();
            let cooldowns: Arc<dyn CooldownStore> = store;
            (counters, cooldowns)
        }
        None => {
            warn!("No redis_url configured, counters are local to this instance");
            let store = Arc::new(MemoryStore::new(clock.clone()));
            let purge = store.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    interval.tick().await;
                    let purged = purge.purge_expired();
                    if purged > 0 {
                        debug!("Purged {} expired counter entries", purged);
                    }
                }
            });
            let counters: Arc<dyn CounterStore> = store.clone();
            let cooldowns: Arc<dyn CooldownStore> = store;
            (counters, cooldowns)
        }
    };

    // Initialize ledger
    let ledger = Arc::new(SledLedger::open(&config.db_path)?);
    match ledger.statistics() {
        Ok(stats) => {
            info!("Previous statistics:");
            info!("  Ledger entries: {}", stats.total_entries);
            info!("  Successful dispatches: {}", stats.successful);
            info!("  Unique wallets: {}", stats.unique_wallets);
        }
        Err(e) => warn!(error = %e, "Failed to read ledger statistics"),
    }

    let executor = Arc::new(RpcTransferExecutor::new(
        config.rpc_url.clone(),
        config.faucet_wallet()?,
        config.rpc_timeout(),
    )?);
    match executor.initialize().await {
        Ok(balance) => info!("Signing relay ready, faucet balance {}", balance),
        Err(e) => {
            warn!(error = %e, "Signing relay unavailable, retrying in the background");
            let relay = executor.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(RELAY_RETRY_INTERVAL);
                interval.tick().await;
                while !relay.is_ready() {
                    interval.tick().await;
                    match relay.initialize().await {
                        Ok(balance) => info!("Signing relay ready, faucet balance {}", balance),
                        Err(e) => warn!(error = %e, "Signing relay still unavailable"),
                    }
                }
            });
        }
    }

    let backends = Backends {
        counters,
        cooldowns,
        executor,
        ledger: ledger.clone(),
        clock,
    };
    let (service, recorder) = FaucetService::start(config.clone(), backends)?;
    info!("Faucet service initialized");

    let app = api::router(service.clone());

    // Start server
    let addr: SocketAddr = config
        .server_addr
        .parse()
        .with_context(|| format!("invalid server address {}", config.server_addr))?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down gracefully");
    service.flush().await;
    drop(service);
    if tokio::time::timeout(Duration::from_secs(5), recorder).await.is_err() {
        warn!("Outcome recorder did not stop in time");
    }
    if let Err(e) = ledger.flush().await {
        error!(error = %e, "Failed to flush ledger");
    }
    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
