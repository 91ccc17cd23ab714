//! Redis-backed store.
//!
//! Shares admission and cooldown state across every faucet instance. Window
//! consumption runs as a single Lua script so the check, the increment and
//! the block transition are one atomic step on the server, timed by the
//! server clock.
//!
//! Tier keys are hashes with fields `points`, `start` and `blocked`, expiring
//! with the window (or the block, when longer). Cooldown records and metric
//! counters are plain string keys.

use super::{ConsumeOutcome, CooldownStore, CounterStore, RateLimitState, TierPolicy};
use crate::error::{FaucetError, FaucetResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::info;

const CONSUME_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local block_ms = tonumber(ARGV[3])
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local state = redis.call('HMGET', key, 'points', 'start', 'blocked')
local points = tonumber(state[1])
local start = tonumber(state[2])
local blocked = tonumber(state[3])
local first = 0

if points == nil then
  points = 0
  start = now
  blocked = 0
  redis.call('HSET', key, 'points', 0, 'start', now, 'blocked', 0)
  redis.call('PEXPIRE', key, window_ms)
end

local ttl = redis.call('PTTL', key)
if ttl < 0 then ttl = window_ms end

if blocked > now then
  return {0, points, blocked - now, 0}
end

if points + 1 > limit then
  if block_ms > 0 then
    redis.call('HSET', key, 'blocked', now + block_ms)
    if block_ms > ttl then
      redis.call('PEXPIRE', key, block_ms)
    end
    return {0, points, block_ms, 0}
  end
  return {0, points, ttl, 0}
end

points = redis.call('HINCRBY', key, 'points', 1)
if points == 1 then first = 1 end
return {1, points, ttl, first}
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    consume_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> FaucetResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis counter store");
        Ok(Self {
            conn,
            consume_script: Script::new(CONSUME_SCRIPT),
        })
    }

    /// Round-trip check used by the health endpoint.
    pub async fn ping(&self) -> FaucetResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn decode_consume(reply: &[i64], limit: u32) -> FaucetResult<ConsumeOutcome> {
    let [allowed, points, ms_before_next, first] = reply else {
        return Err(FaucetError::StoreError(format!(
            "unexpected consume reply of {} values",
            reply.len()
        )));
    };
    let consumed_points = (*points).clamp(0, u32::MAX as i64) as u32;
    let allowed = *allowed == 1;
    Ok(ConsumeOutcome {
        allowed,
        consumed_points,
        remaining_points: if allowed { limit.saturating_sub(consumed_points) } else { 0 },
        ms_before_next: *ms_before_next,
        first_in_window: *first == 1,
    })
}

type TierFields = (Option<i64>, Option<i64>, Option<i64>);

/// `time` is the server's `TIME` reply, so block expiry is judged on the same
/// clock the consume script writes with.
fn decode_state(fields: TierFields, ttl: i64, time: (i64, i64)) -> Option<RateLimitState> {
    let (Some(points), Some(start), blocked) = fields else {
        return None;
    };
    let now = time.0 * 1000 + time.1 / 1000;
    Some(RateLimitState {
        points_consumed: points.clamp(0, u32::MAX as i64) as u32,
        window_start: start,
        blocked_until: blocked.filter(|until| *until > now),
        ms_before_reset: ttl.max(0),
    })
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn consume(&self, key: &str, policy: &TierPolicy) -> FaucetResult<ConsumeOutcome> {
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = self
            .consume_script
            .key(key)
            .arg(policy.limit)
            .arg(policy.window_millis())
            .arg(policy.block_millis())
            .invoke_async(&mut conn)
            .await?;
        decode_consume(&reply, policy.limit)
    }

    async fn get(&self, key: &str) -> FaucetResult<Option<RateLimitState>> {
        let mut conn = self.conn.clone();
        let (fields, ttl, time): (TierFields, i64, (i64, i64)) = redis::pipe()
            .cmd("HMGET").arg(key).arg("points").arg("start").arg("blocked")
            .cmd("PTTL").arg(key)
            .cmd("TIME")
            .query_async(&mut conn)
            .await?;
        Ok(decode_state(fields, ttl, time))
    }

    async fn delete(&self, key: &str) -> FaucetResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str) -> FaucetResult<u64> {
        let mut conn = self.conn.clone();
        let value: u64 = conn.incr(key, 1u64).await?;
        Ok(value)
    }

    async fn counter(&self, key: &str) -> FaucetResult<u64> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(key).await?;
        Ok(value.unwrap_or(0))
    }
}

#[async_trait]
impl CooldownStore for RedisStore {
    async fn last_success(&self, key: &str) -> FaucetResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn record(&self, key: &str, timestamp: i64, ttl: Duration) -> FaucetResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(timestamp)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_if_absent(&self, key: &str, timestamp: i64, ttl: Duration) -> FaucetResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(timestamp)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn clear(&self, key: &str) -> FaucetResult<bool> {
        CounterStore::delete(self, key).await
    }
}
