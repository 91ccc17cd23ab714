//! Shared counter store.
//!
//! All cross-request coordination goes through these traits: admission tiers
//! consume windowed points, the wallet cooldown keeps one timestamp per
//! wallet, and the outcome recorder bumps aggregate counters. Implementations
//! must make `consume`, `increment` and `record_if_absent` atomic per key.

pub mod memory;
pub mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::FaucetResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limit, window and block duration of one rate limit tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub limit: u32,
    pub window: Duration,
    pub block: Duration,
}

impl TierPolicy {
    /// Block duration defaults to the window length.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            block: window,
        }
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn window_millis(&self) -> i64 {
        self.window.as_millis() as i64
    }

    pub fn block_millis(&self) -> i64 {
        self.block.as_millis() as i64
    }
}

/// Result of consuming one point from a tier key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// Points consumed in the current window, never above the limit.
    pub consumed_points: u32,
    pub remaining_points: u32,
    /// Milliseconds until the window resets, or until the block lifts when denied.
    pub ms_before_next: i64,
    /// True when this consumption opened a new window.
    pub first_in_window: bool,
}

/// Snapshot of one tier key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub points_consumed: u32,
    pub window_start: i64,
    pub blocked_until: Option<i64>,
    /// Milliseconds until the key expires.
    pub ms_before_reset: i64,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Consume one point for `key` under `policy`.
    async fn consume(&self, key: &str, policy: &TierPolicy) -> FaucetResult<ConsumeOutcome>;

    async fn get(&self, key: &str) -> FaucetResult<Option<RateLimitState>>;

    /// Returns true if the key existed.
    async fn delete(&self, key: &str) -> FaucetResult<bool>;

    /// Atomically increment a plain counter, returning the new value.
    async fn increment(&self, key: &str) -> FaucetResult<u64>;

    /// Current value of a plain counter, zero when absent.
    async fn counter(&self, key: &str) -> FaucetResult<u64>;
}

#[async_trait]
pub trait CooldownStore: Send + Sync {
    async fn last_success(&self, key: &str) -> FaucetResult<Option<i64>>;

    async fn record(&self, key: &str, timestamp: i64, ttl: Duration) -> FaucetResult<()>;

    /// Store `timestamp` only when no live record exists. Returns true if stored.
    async fn record_if_absent(&self, key: &str, timestamp: i64, ttl: Duration) -> FaucetResult<bool>;

    async fn clear(&self, key: &str) -> FaucetResult<bool>;
}

/// Key layout shared by every backend.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn global(&self) -> String {
        format!("{}global_limit:global", self.prefix)
    }

    pub fn source(&self, source: &str) -> String {
        format!("{}ip_limit:{}", self.prefix, source)
    }

    pub fn wallet(&self, wallet: &str) -> String {
        format!("{}wallets:{}", self.prefix, wallet)
    }

    pub fn metric(&self, name: &str) -> String {
        format!("{}metrics:{}", self.prefix, name)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("faucet:")
    }
}
