//! Faucet configuration
//!
//! Resolved in layers: defaults, an optional config file, `FAUCET_*`
//! environment variables, then command line flags. `validate` runs last.

use crate::address::WalletAddress;
use crate::admission::PacingConfig;
use crate::cooldown::{CooldownMode, StoreFailurePolicy};
use crate::error::{FaucetError, FaucetResult};
use crate::store::{KeySpace, TierPolicy};
use drip_common::utils::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaucetConfig {
    /// Server address
    pub server_addr: String,

    /// Network name shown by the info endpoints
    pub network: String,

    /// JSON-RPC endpoint of the signing relay
    pub rpc_url: String,

    /// Request timeout for the signing relay (seconds)
    pub rpc_timeout_secs: u64,

    /// Address the faucet sends from
    pub faucet_address: Option<String>,

    /// Bearer key required on `POST /faucet/request`
    pub api_key: Option<String>,

    /// Bearer key for the admin routes. Admin routes are not mounted without it.
    pub admin_api_key: Option<String>,

    /// Amount sent when the request names none (base units)
    pub default_amount: u64,

    /// Largest amount a single request may ask for (base units)
    pub max_amount: u64,

    /// Dispatch stops while the faucet balance is below this (base units)
    pub min_reserve_balance: u64,

    /// Rate limit window shared by the global and source tiers (seconds)
    pub rate_limit_window_secs: u64,

    /// Requests per window across all callers
    pub global_limit: u32,

    /// Requests per window from one source address
    pub source_limit: u32,

    /// Block duration after a tier is exceeded (seconds). Defaults to the window.
    pub block_duration_secs: Option<u64>,

    /// Spread admitted requests across the window
    pub pacing_enabled: bool,

    /// Upper bound on a single pacing delay (milliseconds)
    pub pacing_max_delay_ms: u64,

    /// Minimum time between two successful dispatches to one wallet (seconds)
    pub wallet_cooldown_secs: u64,

    pub cooldown_mode: CooldownMode,

    /// Behaviour of the wallet gate when its store is unreachable
    pub wallet_store_failure_policy: StoreFailurePolicy,

    /// Shared counter store. The in-process store is used when absent.
    pub redis_url: Option<String>,

    /// Prefix for every counter store key
    pub key_prefix: String,

    /// Ledger database path
    pub db_path: String,

    /// Capacity of the outcome recorder queue
    pub recorder_queue_capacity: usize,

    /// Enable CORS
    pub cors_enabled: bool,

    /// Allowed origins
    pub allowed_origins: Vec<String>,

    pub logging: LoggingConfig,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            server_addr: "0.0.0.0:3001".to_string(),
            network: "testnet".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            rpc_timeout_secs: 30,
            faucet_address: None,
            api_key: None,
            admin_api_key: None,
            default_amount: 100_000_000,
            max_amount: 1_000_000_000,
            min_reserve_balance: 1_000_000_000,
            rate_limit_window_secs: 3600,
            global_limit: 1000,
            source_limit: 100,
            block_duration_secs: None,
            pacing_enabled: true,
            pacing_max_delay_ms: 30_000,
            wallet_cooldown_secs: 3600,
            cooldown_mode: CooldownMode::default(),
            wallet_store_failure_policy: StoreFailurePolicy::default(),
            redis_url: None,
            key_prefix: "faucet:".to_string(),
            db_path: "./faucet_data".to_string(),
            recorder_queue_capacity: 1024,
            cors_enabled: true,
            allowed_origins: vec!["*".to_string()],
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> FaucetResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FaucetError::ConfigError(format!("{} has an invalid value: '{}'", name, value)))
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl FaucetConfig {
    /// Apply `FAUCET_*` environment overrides.
    pub fn apply_env(&mut self) -> FaucetResult<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> FaucetResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FAUCET_SERVER_ADDR") {
            self.server_addr = v;
        }
        if let Some(v) = lookup("FAUCET_NETWORK") {
            self.network = v;
        }
        if let Some(v) = lookup("FAUCET_RPC_URL") {
            self.rpc_url = v;
        }
        if let Some(v) = lookup("FAUCET_RPC_TIMEOUT") {
            self.rpc_timeout_secs = parse_var("FAUCET_RPC_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("FAUCET_ADDRESS") {
            self.faucet_address = Some(v);
        }
        if let Some(v) = lookup("FAUCET_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("FAUCET_ADMIN_API_KEY") {
            self.admin_api_key = Some(v);
        }
        if let Some(v) = lookup("FAUCET_DEFAULT_AMOUNT") {
            self.default_amount = parse_var("FAUCET_DEFAULT_AMOUNT", &v)?;
        }
        if let Some(v) = lookup("FAUCET_MAX_AMOUNT") {
            self.max_amount = parse_var("FAUCET_MAX_AMOUNT", &v)?;
        }
        if let Some(v) = lookup("FAUCET_MIN_RESERVE") {
            self.min_reserve_balance = parse_var("FAUCET_MIN_RESERVE", &v)?;
        }
        if let Some(v) = lookup("FAUCET_RATE_LIMIT_WINDOW") {
            self.rate_limit_window_secs = parse_var("FAUCET_RATE_LIMIT_WINDOW", &v)?;
        }
        if let Some(v) = lookup("FAUCET_GLOBAL_LIMIT") {
            self.global_limit = parse_var("FAUCET_GLOBAL_LIMIT", &v)?;
        }
        if let Some(v) = lookup("FAUCET_SOURCE_LIMIT") {
            self.source_limit = parse_var("FAUCET_SOURCE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("FAUCET_BLOCK_DURATION") {
            self.block_duration_secs = Some(parse_var("FAUCET_BLOCK_DURATION", &v)?);
        }
        if let Some(v) = lookup("FAUCET_PACING_ENABLED") {
            self.pacing_enabled = parse_flag(&v);
        }
        if let Some(v) = lookup("FAUCET_PACING_MAX_DELAY_MS") {
            self.pacing_max_delay_ms = parse_var("FAUCET_PACING_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("FAUCET_WALLET_COOLDOWN") {
            self.wallet_cooldown_secs = parse_var("FAUCET_WALLET_COOLDOWN", &v)?;
        }
        if let Some(v) = lookup("FAUCET_COOLDOWN_MODE") {
            self.cooldown_mode = v.parse()?;
        }
        if let Some(v) = lookup("FAUCET_STORE_FAILURE_POLICY") {
            self.wallet_store_failure_policy = v.parse()?;
        }
        if let Some(v) = lookup("FAUCET_REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = lookup("FAUCET_KEY_PREFIX") {
            self.key_prefix = v;
        }
        if let Some(v) = lookup("FAUCET_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = lookup("FAUCET_RECORDER_QUEUE") {
            self.recorder_queue_capacity = parse_var("FAUCET_RECORDER_QUEUE", &v)?;
        }
        if let Some(v) = lookup("FAUCET_CORS_ENABLED") {
            self.cors_enabled = parse_flag(&v);
        }
        if let Some(v) = lookup("FAUCET_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> FaucetResult<()> {
        let invalid = |msg: &str| -> FaucetResult<()> { Err(FaucetError::ConfigError(msg.to_string())) };

        if self.server_addr.parse::<SocketAddr>().is_err() {
            return Err(FaucetError::ConfigError(format!(
                "server address '{}' is not a valid socket address",
                self.server_addr
            )));
        }
        if self.rate_limit_window_secs == 0 {
            return invalid("rate limit window must be greater than zero");
        }
        if self.global_limit == 0 || self.source_limit == 0 {
            return invalid("rate limits must be greater than zero");
        }
        if self.wallet_cooldown_secs == 0 {
            return invalid("wallet cooldown must be greater than zero");
        }
        if self.default_amount == 0 {
            return invalid("default amount must be greater than zero");
        }
        if self.default_amount > self.max_amount {
            return invalid("default amount must not exceed the maximum amount");
        }
        if self.recorder_queue_capacity == 0 {
            return invalid("recorder queue capacity must be greater than zero");
        }
        if let Some(address) = &self.faucet_address {
            WalletAddress::parse(address)
                .map_err(|e| FaucetError::ConfigError(format!("faucet address: {}", e)))?;
        }
        Ok(())
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    fn block_duration(&self) -> Duration {
        self.block_duration_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.rate_limit_window())
    }

    pub fn global_policy(&self) -> TierPolicy {
        TierPolicy::new(self.global_limit, self.rate_limit_window()).with_block(self.block_duration())
    }

    pub fn source_policy(&self) -> TierPolicy {
        TierPolicy::new(self.source_limit, self.rate_limit_window()).with_block(self.block_duration())
    }

    pub fn wallet_cooldown(&self) -> Duration {
        Duration::from_secs(self.wallet_cooldown_secs)
    }

    pub fn pacing(&self) -> PacingConfig {
        if !self.pacing_enabled {
            return PacingConfig::disabled();
        }
        PacingConfig {
            enabled: true,
            max_delay: Duration::from_millis(self.pacing_max_delay_ms),
        }
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix.clone())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn faucet_wallet(&self) -> FaucetResult<Option<WalletAddress>> {
        self.faucet_address.as_deref().map(WalletAddress::parse).transpose()
    }
}
