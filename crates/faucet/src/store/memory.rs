//! In-process store.
//!
//! Each key lives in a `DashMap` shard, so the read-modify-write in `consume`
//! runs under that shard's write lock and is atomic per key. Expiry is
//! evaluated lazily against the injected clock; `purge_expired` reclaims
//! memory for keys nobody touches again.

use super::{ConsumeOutcome, CooldownStore, CounterStore, RateLimitState, TierPolicy};
use crate::clock::Clock;
use crate::error::FaucetResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct TierEntry {
    points: u32,
    window_start: i64,
    blocked_until: Option<i64>,
    expires_at: i64,
}

impl TierEntry {
    fn open(now: i64, policy: &TierPolicy) -> Self {
        Self {
            points: 0,
            window_start: now,
            blocked_until: None,
            expires_at: now + policy.window_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ValueEntry {
    value: i64,
    expires_at: Option<i64>,
}

impl ValueEntry {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

pub struct MemoryStore {
    tiers: DashMap<String, TierEntry>,
    values: DashMap<String, ValueEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tiers: DashMap::new(),
            values: DashMap::new(),
            clock,
        }
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.tiers.retain(|_, entry| {
            let live = entry.expires_at > now;
            removed += usize::from(!live);
            live
        });
        self.values.retain(|_, entry| {
            let live = entry.is_live(now);
            removed += usize::from(!live);
            live
        });
        debug!("Purged {} expired keys from memory store", removed);
        removed
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn consume(&self, key: &str, policy: &TierPolicy) -> FaucetResult<ConsumeOutcome> {
        let now = self.clock.now_millis();
        let mut entry = self
            .tiers
            .entry(key.to_string())
            .or_insert_with(|| TierEntry::open(now, policy));

        if entry.expires_at <= now {
            *entry = TierEntry::open(now, policy);
        }

        if let Some(until) = entry.blocked_until {
            if until > now {
                return Ok(ConsumeOutcome {
                    allowed: false,
                    consumed_points: entry.points,
                    remaining_points: 0,
                    ms_before_next: until - now,
                    first_in_window: false,
                });
            }
        }

        if entry.points.saturating_add(1) > policy.limit {
            let ms_before_next = if policy.block_millis() > 0 {
                let until = now + policy.block_millis();
                entry.blocked_until = Some(until);
                entry.expires_at = entry.expires_at.max(until);
                until - now
            } else {
                entry.expires_at - now
            };
            return Ok(ConsumeOutcome {
                allowed: false,
                consumed_points: entry.points,
                remaining_points: 0,
                ms_before_next,
                first_in_window: false,
            });
        }

        entry.points += 1;
        Ok(ConsumeOutcome {
            allowed: true,
            consumed_points: entry.points,
            remaining_points: policy.limit - entry.points,
            ms_before_next: entry.expires_at - now,
            first_in_window: entry.points == 1,
        })
    }

    async fn get(&self, key: &str) -> FaucetResult<Option<RateLimitState>> {
        let now = self.clock.now_millis();
        Ok(self
            .tiers
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| RateLimitState {
                points_consumed: entry.points,
                window_start: entry.window_start,
                blocked_until: entry.blocked_until.filter(|until| *until > now),
                ms_before_reset: entry.expires_at - now,
            }))
    }

    async fn delete(&self, key: &str) -> FaucetResult<bool> {
        let tier = self.tiers.remove(key).is_some();
        let value = self.values.remove(key).is_some();
        Ok(tier || value)
    }

    async fn increment(&self, key: &str) -> FaucetResult<u64> {
        let mut entry = self.values.entry(key.to_string()).or_insert(ValueEntry {
            value: 0,
            expires_at: None,
        });
        entry.value += 1;
        Ok(entry.value as u64)
    }

    async fn counter(&self, key: &str) -> FaucetResult<u64> {
        Ok(self.values.get(key).map_or(0, |entry| entry.value.max(0) as u64))
    }
}

#[async_trait]
impl CooldownStore for MemoryStore {
    async fn last_success(&self, key: &str) -> FaucetResult<Option<i64>> {
        let now = self.clock.now_millis();
        Ok(self
            .values
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn record(&self, key: &str, timestamp: i64, ttl: Duration) -> FaucetResult<()> {
        let expires_at = self.clock.now_millis() + ttl.as_millis() as i64;
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: timestamp,
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn record_if_absent(&self, key: &str, timestamp: i64, ttl: Duration) -> FaucetResult<bool> {
        let now = self.clock.now_millis();
        let fresh = ValueEntry {
            value: timestamp,
            expires_at: Some(now + ttl.as_millis() as i64),
        };

        let mut entry = self.values.entry(key.to_string()).or_insert(ValueEntry {
            value: timestamp,
            expires_at: Some(now),
        });
        if entry.is_live(now) {
            return Ok(false);
        }
        *entry = fresh;
        Ok(true)
    }

    async fn clear(&self, key: &str) -> FaucetResult<bool> {
        Ok(self.values.remove(key).is_some())
    }
}
