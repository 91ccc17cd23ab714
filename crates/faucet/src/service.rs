//! Faucet service core logic
//!
//! Wires admission, the wallet cooldown, dispatch and recording together.
//! Everything is constructed once at startup and shared behind an `Arc`.

use crate::address::WalletAddress;
use crate::admission::{Admission, AdmissionController, RateLimitInfo, Scope};
use crate::clock::{Clock, SystemClock};
use crate::config::FaucetConfig;
use crate::cooldown::{CooldownMode, WalletCooldownTracker};
use crate::database::{Ledger, MemoryLedger};
use crate::dispatch::DispatchOrchestrator;
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::FaucetMetrics;
use crate::recorder::{OutcomeRecorder, REQUESTS_FAILED, REQUESTS_SUCCESS, REQUESTS_TOTAL};
use crate::store::{CooldownStore, CounterStore, KeySpace, MemoryStore};
use crate::transfer::TransferExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// External collaborators the service runs against.
pub struct Backends {
    pub counters: Arc<dyn CounterStore>,
    pub cooldowns: Arc<dyn CooldownStore>,
    pub executor: Arc<dyn TransferExecutor>,
    pub ledger: Arc<dyn Ledger>,
    pub clock: Arc<dyn Clock>,
}

impl Backends {
    /// Single-process backends: in-memory store and ledger, system clock.
    pub fn in_memory(executor: Arc<dyn TransferExecutor>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Self {
            counters: store.clone(),
            cooldowns: store,
            executor,
            ledger: Arc::new(MemoryLedger::new()),
            clock,
        }
    }
}

/// Body of `POST /faucet/request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaucetRequest {
    pub wallet_address: String,
    /// Base units as a decimal string.
    #[serde(default)]
    pub amount: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaucetResponse {
    pub success: bool,
    pub message: String,
    pub request_id: String,
    pub transaction_hash: String,
    pub amount: String,
    pub wallet_address: String,
    pub faucet_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierSummary {
    pub limit: u32,
    pub window_seconds: u64,
    pub block_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsSummary {
    pub global: TierSummary,
    pub source: TierSummary,
    pub wallet_cooldown_seconds: u64,
    pub cooldown_mode: CooldownMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatistics {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
}

/// Operational snapshot for `GET /faucet/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaucetStatus {
    pub network: String,
    pub faucet_address: Option<String>,
    pub ready: bool,
    /// `None` when the balance could not be read.
    pub balance: Option<String>,
    pub min_reserve_balance: String,
    pub low_balance: bool,
    pub default_amount: String,
    pub max_amount: String,
    pub limits: LimitsSummary,
    pub statistics: Option<RequestStatistics>,
}

/// Public configuration summary for `GET /faucet/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaucetInfo {
    pub network: String,
    pub faucet_address: Option<String>,
    pub default_amount: String,
    pub max_amount: String,
    pub limits: LimitsSummary,
    pub auth_required: bool,
}

/// Faucet service
pub struct FaucetService {
    config: FaucetConfig,
    admission: AdmissionController,
    cooldown: WalletCooldownTracker,
    dispatcher: DispatchOrchestrator,
    recorder: OutcomeRecorder,
    metrics: Arc<FaucetMetrics>,
    counters: Arc<dyn CounterStore>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    faucet_address: Option<WalletAddress>,
}

impl FaucetService {
    /// Build the service and spawn the recorder worker. Must run inside a
    /// Tokio runtime.
    pub fn start(config: FaucetConfig, backends: Backends) -> FaucetResult<(Arc<Self>, JoinHandle<()>)> {
        config.validate()?;

        let metrics = Arc::new(
            FaucetMetrics::new().map_err(|e| FaucetError::InternalError(format!("metrics: {}", e)))?,
        );
        let keys = config.key_space();
        let faucet_address = match config.faucet_wallet()? {
            Some(address) => Some(address),
            None => backends.executor.faucet_address(),
        };

        let admission = AdmissionController::new(
            backends.counters.clone(),
            backends.clock.clone(),
            keys.clone(),
            config.global_policy(),
            config.source_policy(),
            config.pacing(),
        );
        let cooldown = WalletCooldownTracker::new(
            backends.cooldowns,
            backends.clock.clone(),
            keys.clone(),
            config.wallet_cooldown(),
            config.cooldown_mode,
            config.wallet_store_failure_policy,
        );
        let dispatcher = DispatchOrchestrator::new(
            backends.executor,
            metrics.clone(),
            config.min_reserve_balance,
            config.max_amount,
        );
        let (recorder, worker) = OutcomeRecorder::start(
            backends.counters.clone(),
            backends.ledger,
            keys.clone(),
            metrics.clone(),
            backends.clock.clone(),
            config.recorder_queue_capacity,
        );

        info!(
            "Faucet service configured: global {}/{}s, source {}/{}s, wallet cooldown {}s ({:?})",
            config.global_limit,
            config.rate_limit_window_secs,
            config.source_limit,
            config.rate_limit_window_secs,
            config.wallet_cooldown_secs,
            config.cooldown_mode
        );

        let service = Arc::new(Self {
            config,
            admission,
            cooldown,
            dispatcher,
            recorder,
            metrics,
            counters: backends.counters,
            keys,
            clock: backends.clock,
            faucet_address,
        });
        Ok((service, worker))
    }

    pub fn config(&self) -> &FaucetConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<FaucetMetrics> {
        &self.metrics
    }

    pub fn is_ready(&self) -> bool {
        self.dispatcher.executor().is_ready()
    }

    /// Run the global and source tiers for one inbound request.
    pub async fn admit(&self, source: &str) -> FaucetResult<RateLimitInfo> {
        let admission = self.admission.admit(source).await?;
        if let Admission::Rejected { scope, .. } = &admission {
            self.metrics.record_rate_limited(scope.as_str());
        }
        admission.into_result()
    }

    fn parse_wallet(&self, raw: &str) -> FaucetResult<WalletAddress> {
        let wallet = WalletAddress::parse(raw)?;
        if wallet.is_zero() {
            return Err(FaucetError::InvalidAddress("zero address not allowed".to_string()));
        }
        if self.faucet_address.as_ref() == Some(&wallet) {
            return Err(FaucetError::InvalidAddress("cannot send to the faucet address".to_string()));
        }
        Ok(wallet)
    }

    fn parse_amount(&self, raw: Option<&str>) -> FaucetResult<u64> {
        match raw.map(str::trim) {
            None | Some("") => Ok(self.config.default_amount),
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| FaucetError::InvalidAmount(format!("'{}' is not a valid amount", value))),
        }
    }

    fn wallet_denied(&self, request_id: &str, err: FaucetError) -> FaucetError {
        if let FaucetError::RateLimitExceeded { retry_after, .. } = &err {
            self.metrics.record_rate_limited(Scope::Wallet.as_str());
            warn!(request_id, retry_after, "Wallet is cooling down");
        }
        err
    }

    /// Wallet gate, dispatch, cooldown bookkeeping and recording for one
    /// admitted request.
    pub async fn request_tokens(&self, request: FaucetRequest, source: &str) -> FaucetResult<FaucetResponse> {
        let wallet = self.parse_wallet(&request.wallet_address)?;
        let amount = self.parse_amount(request.amount.as_deref())?;
        let request_id = Uuid::new_v4().to_string();

        info!(request_id = %request_id, wallet = %wallet, source, amount, "Faucet request");

        self.cooldown.check(&wallet).await?.into_result().map_err(|e| self.wallet_denied(&request_id, e))?;

        let started = Instant::now();
        let result = match self.dispatcher.preflight(amount, &request_id).await {
            Err(short_circuit) => short_circuit,
            Ok(()) => {
                self.cooldown.claim(&wallet).await?.into_result().map_err(|e| self.wallet_denied(&request_id, e))?;
                self.dispatcher.transfer(&wallet, amount, &request_id).await
            }
        };
        self.metrics.observe_dispatch(started.elapsed());

        if result.is_success() {
            if let Err(e) = self.cooldown.record_success(&wallet, self.clock.now_millis()).await {
                warn!(request_id = %request_id, wallet = %wallet, error = %e, "Failed to record wallet cooldown");
            }
        }

        self.recorder.record(&request_id, &wallet, amount, source, &result);

        match result.transaction_hash() {
            Some(hash) => Ok(FaucetResponse {
                success: true,
                message: format!("Successfully sent {} to {}", amount, wallet),
                request_id,
                transaction_hash: hash.to_string(),
                amount: amount.to_string(),
                wallet_address: wallet.to_string(),
                faucet_address: self.faucet_address.as_ref().map(ToString::to_string),
            }),
            None => Err(result
                .into_error()
                .unwrap_or_else(|| FaucetError::InternalError("dispatch produced no outcome".to_string()))),
        }
    }

    fn limits(&self) -> LimitsSummary {
        let tier = |policy: &crate::store::TierPolicy| TierSummary {
            limit: policy.limit,
            window_seconds: policy.window.as_secs(),
            block_seconds: policy.block.as_secs(),
        };
        LimitsSummary {
            global: tier(self.admission.global_policy()),
            source: tier(self.admission.source_policy()),
            wallet_cooldown_seconds: self.cooldown.window().as_secs(),
            cooldown_mode: self.cooldown.mode(),
        }
    }

    async fn statistics(&self) -> FaucetResult<RequestStatistics> {
        Ok(RequestStatistics {
            requests_total: self.counters.counter(&self.keys.metric(REQUESTS_TOTAL)).await?,
            requests_success: self.counters.counter(&self.keys.metric(REQUESTS_SUCCESS)).await?,
            requests_failed: self.counters.counter(&self.keys.metric(REQUESTS_FAILED)).await?,
        })
    }

    pub async fn status(&self) -> FaucetStatus {
        let executor = self.dispatcher.executor();
        let balance = match executor.reserve_balance().await {
            Ok(balance) => {
                self.metrics.set_reserve_balance(balance);
                Some(balance)
            }
            Err(e) => {
                warn!(error = %e, "Failed to read faucet balance for status");
                None
            }
        };
        let statistics = match self.statistics().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Failed to read shared request counters");
                None
            }
        };

        FaucetStatus {
            network: self.config.network.clone(),
            faucet_address: self.faucet_address.as_ref().map(ToString::to_string),
            ready: executor.is_ready(),
            balance: balance.map(|b| b.to_string()),
            min_reserve_balance: self.dispatcher.min_reserve().to_string(),
            low_balance: balance.map_or(true, |b| b < self.dispatcher.min_reserve()),
            default_amount: self.config.default_amount.to_string(),
            max_amount: self.dispatcher.max_amount().to_string(),
            limits: self.limits(),
            statistics,
        }
    }

    pub fn info(&self) -> FaucetInfo {
        FaucetInfo {
            network: self.config.network.clone(),
            faucet_address: self.faucet_address.as_ref().map(ToString::to_string),
            default_amount: self.config.default_amount.to_string(),
            max_amount: self.config.max_amount.to_string(),
            limits: self.limits(),
            auth_required: self.config.api_key.is_some(),
        }
    }

    /// Clear one rate limit key. Returns true if state existed.
    pub async fn reset_rate_limit(&self, scope: Scope, identifier: &str) -> FaucetResult<bool> {
        match scope {
            Scope::Wallet => self.cooldown.reset(&WalletAddress::parse(identifier)?).await,
            _ => self.admission.reset(scope, identifier).await,
        }
    }

    pub async fn rate_limit_status(&self, scope: Scope, identifier: &str) -> FaucetResult<RateLimitInfo> {
        match scope {
            Scope::Wallet => self.cooldown.status(&WalletAddress::parse(identifier)?).await,
            _ => self.admission.status(scope, identifier).await,
        }
    }

    /// Wait for queued outcomes to reach the shared counters and the ledger.
    pub async fn flush(&self) {
        self.recorder.flush().await;
    }
}
