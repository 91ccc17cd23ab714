//! Layered admission control.
//!
//! Every faucet request passes the global tier and then the per-source tier.
//! A tier is a windowed point counter in the shared [`CounterStore`]; the
//! store is the only synchronization point, so several faucet instances can
//! share one budget. Store failures propagate: admission never guesses.

use crate::clock::Clock;
use crate::error::{FaucetError, FaucetResult};
use crate::store::{ConsumeOutcome, CounterStore, KeySpace, TierPolicy};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Identifier used for the single global tier key.
pub const GLOBAL_IDENTIFIER: &str = "global";

/// Rate limit layer a decision belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Global,
    #[serde(alias = "ip")]
    Source,
    Wallet,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Source => "source",
            Scope::Wallet => "wallet",
        }
    }

    /// Caller-facing text for a denial in this scope.
    pub fn denial_message(&self) -> &'static str {
        match self {
            Scope::Global => "Faucet is receiving too many requests. Please try again later.",
            Scope::Source => "Too many requests from this IP address. Please try again later.",
            Scope::Wallet => {
                "This wallet has already received tokens recently. Please wait before requesting again."
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = FaucetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Scope::Global),
            "source" | "ip" => Ok(Scope::Source),
            "wallet" => Ok(Scope::Wallet),
            other => Err(FaucetError::InvalidRequest(format!("unknown rate limit scope '{}'", other))),
        }
    }
}

/// Metadata surfaced as `X-RateLimit-*` headers and in admin status replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub scope: Scope,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Pacing spreads allowed consumptions across the window instead of letting
/// a full burst through at every window start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub enabled: bool,
    pub max_delay: Duration,
}

impl PacingConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Outcome of consuming one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed { info: RateLimitInfo, delay: Duration },
    Denied { retry_after: u64, info: RateLimitInfo },
}

/// Outcome of the full tier chain for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Carries the source tier metadata.
    Admitted(RateLimitInfo),
    Rejected {
        scope: Scope,
        retry_after: u64,
        info: RateLimitInfo,
    },
}

impl Admission {
    pub fn into_result(self) -> FaucetResult<RateLimitInfo> {
        match self {
            Admission::Admitted(info) => Ok(info),
            Admission::Rejected {
                scope,
                retry_after,
                info,
            } => Err(FaucetError::RateLimitExceeded {
                scope,
                retry_after,
                info: Some(info),
            }),
        }
    }
}

/// Whole seconds until `ms` elapses, never below one.
pub fn retry_after_secs(ms: i64) -> u64 {
    let ms = ms.max(0) as u64;
    ms.div_ceil(1000).max(1)
}

/// Delay to apply after an allowed consumption.
///
/// The first point of a window goes through at once. Later points wait
/// `ceil(ms_before_next / (remaining + 2))`, raised to
/// `consumed * window / limit` when that is smaller than `window / limit`.
pub fn pacing_delay(outcome: &ConsumeOutcome, policy: &TierPolicy, pacing: &PacingConfig) -> Duration {
    if !pacing.enabled || !outcome.allowed || outcome.first_in_window || policy.limit == 0 {
        return Duration::ZERO;
    }

    let divisor = outcome.remaining_points as u64 + 2;
    let mut delay_ms = (outcome.ms_before_next.max(0) as u64).div_ceil(divisor);
    let min_delay_ms = policy.window_millis().max(0) as u64 / policy.limit as u64;
    if delay_ms < min_delay_ms {
        delay_ms = outcome.consumed_points as u64 * min_delay_ms;
    }

    Duration::from_millis(delay_ms).min(pacing.max_delay)
}

pub struct AdmissionController {
    counters: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    global: TierPolicy,
    source: TierPolicy,
    pacing: PacingConfig,
}

impl AdmissionController {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        global: TierPolicy,
        source: TierPolicy,
        pacing: PacingConfig,
    ) -> Self {
        Self {
            counters,
            clock,
            keys,
            global,
            source,
            pacing,
        }
    }

    pub fn global_policy(&self) -> &TierPolicy {
        &self.global
    }

    pub fn source_policy(&self) -> &TierPolicy {
        &self.source
    }

    fn tier(&self, scope: Scope, identifier: &str) -> FaucetResult<(String, &TierPolicy)> {
        match scope {
            Scope::Global => Ok((self.keys.global(), &self.global)),
            Scope::Source => Ok((self.keys.source(identifier), &self.source)),
            Scope::Wallet => Err(FaucetError::InternalError(
                "wallet scope is tracked by the cooldown tracker".to_string(),
            )),
        }
    }

    fn reset_at(&self, ms: i64) -> DateTime<Utc> {
        self.clock.now() + ChronoDuration::milliseconds(ms.max(0))
    }

    /// Consume one point from a single tier.
    pub async fn consume(&self, scope: Scope, identifier: &str) -> FaucetResult<Decision> {
        let (key, policy) = self.tier(scope, identifier)?;
        let outcome = self.counters.consume(&key, policy).await?;

        if outcome.allowed {
            let delay = pacing_delay(&outcome, policy, &self.pacing);
            debug!(
                scope = %scope,
                identifier,
                remaining = outcome.remaining_points,
                delay_ms = delay.as_millis() as u64,
                "Rate limit point consumed"
            );
            return Ok(Decision::Allowed {
                info: RateLimitInfo {
                    scope,
                    limit: policy.limit,
                    remaining: outcome.remaining_points,
                    reset_at: self.reset_at(outcome.ms_before_next),
                },
                delay,
            });
        }

        let retry_after = retry_after_secs(outcome.ms_before_next);
        warn!(scope = %scope, identifier, retry_after, "Rate limit exceeded");
        Ok(Decision::Denied {
            retry_after,
            info: RateLimitInfo {
                scope,
                limit: policy.limit,
                remaining: 0,
                reset_at: self.reset_at(outcome.ms_before_next),
            },
        })
    }

    /// Run the global tier, then the source tier. A global denial returns
    /// before the source tier is touched.
    pub async fn admit(&self, source: &str) -> FaucetResult<Admission> {
        let global_delay = match self.consume(Scope::Global, GLOBAL_IDENTIFIER).await? {
            Decision::Allowed { delay, .. } => delay,
            Decision::Denied { retry_after, info } => {
                return Ok(Admission::Rejected {
                    scope: Scope::Global,
                    retry_after,
                    info,
                })
            }
        };

        let (info, source_delay) = match self.consume(Scope::Source, source).await? {
            Decision::Allowed { info, delay } => (info, delay),
            Decision::Denied { retry_after, info } => {
                return Ok(Admission::Rejected {
                    scope: Scope::Source,
                    retry_after,
                    info,
                })
            }
        };

        let delay = global_delay.max(source_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(Admission::Admitted(info))
    }

    /// Clear one tier key, restoring its full budget. Returns true if state existed.
    pub async fn reset(&self, scope: Scope, identifier: &str) -> FaucetResult<bool> {
        let (key, _) = self.tier(scope, identifier)?;
        let existed = self.counters.delete(&key).await?;
        warn!(scope = %scope, identifier, existed, "Rate limit reset");
        Ok(existed)
    }

    /// Current budget of one tier key without consuming from it.
    pub async fn status(&self, scope: Scope, identifier: &str) -> FaucetResult<RateLimitInfo> {
        let (key, policy) = self.tier(scope, identifier)?;
        let now = self.clock.now_millis();

        let info = match self.counters.get(&key).await? {
            None => RateLimitInfo {
                scope,
                limit: policy.limit,
                remaining: policy.limit,
                reset_at: self.reset_at(policy.window_millis()),
            },
            Some(state) => match state.blocked_until {
                Some(until) => RateLimitInfo {
                    scope,
                    limit: policy.limit,
                    remaining: 0,
                    reset_at: self.reset_at(until - now),
                },
                None => RateLimitInfo {
                    scope,
                    limit: policy.limit,
                    remaining: policy.limit.saturating_sub(state.points_consumed),
                    reset_at: self.reset_at(state.ms_before_reset),
                },
            },
        };
        Ok(info)
    }
}
