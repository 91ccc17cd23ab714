//! Per-wallet cooldown.
//!
//! One successful dispatch per wallet per cooldown window. In the default
//! [`CooldownMode::RecordOnSuccess`] the gate reads the last success and the
//! record is written only after a confirmed transfer, so a failed attempt
//! never penalizes the wallet. Two concurrent requests for the same wallet
//! can both pass that gate. [`CooldownMode::ReserveBeforeTransfer`] closes
//! the gap with an atomic set-if-absent before the transfer, at the price of
//! keeping the reservation when the transfer fails.

use crate::address::WalletAddress;
use crate::admission::{retry_after_secs, RateLimitInfo, Scope};
use crate::clock::Clock;
use crate::error::{FaucetError, FaucetResult};
use crate::store::{CooldownStore, KeySpace};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownMode {
    #[default]
    RecordOnSuccess,
    ReserveBeforeTransfer,
}

/// What the wallet gate does when its store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Let the request through and log the failure.
    #[default]
    FailOpen,
    /// Propagate the store error.
    FailClosed,
}

impl FromStr for CooldownMode {
    type Err = FaucetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "record_on_success" => Ok(CooldownMode::RecordOnSuccess),
            "reserve_before_transfer" => Ok(CooldownMode::ReserveBeforeTransfer),
            other => Err(FaucetError::ConfigError(format!("unknown cooldown mode '{}'", other))),
        }
    }
}

impl FromStr for StoreFailurePolicy {
    type Err = FaucetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" => Ok(StoreFailurePolicy::FailOpen),
            "fail_closed" => Ok(StoreFailurePolicy::FailClosed),
            other => Err(FaucetError::ConfigError(format!("unknown store failure policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownCheck {
    Allowed,
    Denied { retry_after: u64, info: RateLimitInfo },
}

impl CooldownCheck {
    pub fn into_result(self) -> FaucetResult<()> {
        match self {
            CooldownCheck::Allowed => Ok(()),
            CooldownCheck::Denied { retry_after, info } => Err(FaucetError::RateLimitExceeded {
                scope: Scope::Wallet,
                retry_after,
                info: Some(info),
            }),
        }
    }
}

pub struct WalletCooldownTracker {
    store: Arc<dyn CooldownStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    window: Duration,
    mode: CooldownMode,
    failure_policy: StoreFailurePolicy,
}

impl WalletCooldownTracker {
    pub fn new(
        store: Arc<dyn CooldownStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        window: Duration,
        mode: CooldownMode,
        failure_policy: StoreFailurePolicy,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            window,
            mode,
            failure_policy,
        }
    }

    pub fn mode(&self) -> CooldownMode {
        self.mode
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn window_millis(&self) -> i64 {
        self.window.as_millis() as i64
    }

    fn reset_at(&self, last_success: i64) -> DateTime<Utc> {
        let at = last_success + self.window_millis();
        DateTime::from_timestamp_millis(at)
            .unwrap_or_else(|| self.clock.now() + ChronoDuration::milliseconds(self.window_millis()))
    }

    fn denial(&self, last_success: i64, now: i64) -> Option<CooldownCheck> {
        let elapsed = now - last_success;
        if elapsed >= self.window_millis() {
            return None;
        }
        Some(CooldownCheck::Denied {
            retry_after: retry_after_secs(self.window_millis() - elapsed),
            info: RateLimitInfo {
                scope: Scope::Wallet,
                limit: 1,
                remaining: 0,
                reset_at: self.reset_at(last_success),
            },
        })
    }

    fn on_store_error(&self, wallet: &WalletAddress, err: FaucetError) -> FaucetResult<CooldownCheck> {
        match self.failure_policy {
            StoreFailurePolicy::FailOpen => {
                warn!(wallet = %wallet, error = %err, "Cooldown store unavailable, allowing request");
                Ok(CooldownCheck::Allowed)
            }
            StoreFailurePolicy::FailClosed => Err(err),
        }
    }

    /// Read-only gate: denies while the last success is inside the window.
    pub async fn check(&self, wallet: &WalletAddress) -> FaucetResult<CooldownCheck> {
        let key = self.keys.wallet(wallet.as_str());
        match self.store.last_success(&key).await {
            Ok(None) => Ok(CooldownCheck::Allowed),
            Ok(Some(last)) => {
                let now = self.clock.now_millis();
                Ok(self.denial(last, now).unwrap_or(CooldownCheck::Allowed))
            }
            Err(err) => self.on_store_error(wallet, err),
        }
    }

    /// Atomically claim the window for `wallet`. Denies when a live record exists.
    pub async fn try_reserve(&self, wallet: &WalletAddress) -> FaucetResult<CooldownCheck> {
        let key = self.keys.wallet(wallet.as_str());
        let now = self.clock.now_millis();
        match self.store.record_if_absent(&key, now, self.window).await {
            Ok(true) => {
                debug!(wallet = %wallet, "Cooldown window reserved");
                Ok(CooldownCheck::Allowed)
            }
            Ok(false) => {
                let last = match self.store.last_success(&key).await {
                    Ok(last) => last.unwrap_or(now),
                    Err(err) => return self.on_store_error(wallet, err),
                };
                Ok(self.denial(last, now).unwrap_or(CooldownCheck::Denied {
                    retry_after: 1,
                    info: RateLimitInfo {
                        scope: Scope::Wallet,
                        limit: 1,
                        remaining: 0,
                        reset_at: self.clock.now(),
                    },
                }))
            }
            Err(err) => self.on_store_error(wallet, err),
        }
    }

    /// Run right before the transfer. Only [`CooldownMode::ReserveBeforeTransfer`]
    /// writes here; the other mode waits for `record_success`.
    pub async fn claim(&self, wallet: &WalletAddress) -> FaucetResult<CooldownCheck> {
        match self.mode {
            CooldownMode::RecordOnSuccess => Ok(CooldownCheck::Allowed),
            CooldownMode::ReserveBeforeTransfer => self.try_reserve(wallet).await,
        }
    }

    /// Store the confirmed success time. Must only run after a successful transfer.
    pub async fn record_success(&self, wallet: &WalletAddress, timestamp: i64) -> FaucetResult<()> {
        let key = self.keys.wallet(wallet.as_str());
        self.store.record(&key, timestamp, self.window).await?;
        debug!(wallet = %wallet, timestamp, "Wallet cooldown recorded");
        Ok(())
    }

    pub async fn status(&self, wallet: &WalletAddress) -> FaucetResult<RateLimitInfo> {
        let key = self.keys.wallet(wallet.as_str());
        let now = self.clock.now_millis();
        let last = self.store.last_success(&key).await?;

        Ok(match last.filter(|last| now - last < self.window_millis()) {
            Some(last) => RateLimitInfo {
                scope: Scope::Wallet,
                limit: 1,
                remaining: 0,
                reset_at: self.reset_at(last),
            },
            None => RateLimitInfo {
                scope: Scope::Wallet,
                limit: 1,
                remaining: 1,
                reset_at: self.clock.now(),
            },
        })
    }

    pub async fn reset(&self, wallet: &WalletAddress) -> FaucetResult<bool> {
        let key = self.keys.wallet(wallet.as_str());
        let existed = self.store.clear(&key).await?;
        info!(wallet = %wallet, existed, "Wallet cooldown reset");
        Ok(existed)
    }
}
