//! Dispatch ledger.
//!
//! Append-only history of dispatch attempts. The request path only ever
//! appends; the only read is the startup summary.

use crate::error::{FaucetError, FaucetResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Success,
    /// The transfer was attempted and failed.
    Failed,
    /// Dispatch stopped before the transfer.
    NotAttempted,
}

/// One dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub request_id: String,
    pub wallet_address: String,
    pub amount: u64,
    pub status: LedgerStatus,
    pub transaction_hash: Option<String>,
    pub error_message: Option<String>,
    pub source_address: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl LedgerEntry {
    /// Chronological key: zero-padded creation time, then the request id.
    fn key(&self) -> String {
        format!("{:020}:{}", self.created_at.max(0), self.request_id)
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn append(&self, entry: LedgerEntry) -> FaucetResult<()>;
}

/// Aggregate view over the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStatistics {
    pub total_entries: usize,
    pub successful: usize,
    pub failed: usize,
    pub not_attempted: usize,
    /// Sum of successful amounts, as a decimal string.
    pub total_dispensed: String,
    pub unique_wallets: u64,
}

fn summarize<'a>(entries: impl Iterator<Item = &'a LedgerEntry>) -> LedgerStatistics {
    let mut stats = LedgerStatistics::default();
    let mut dispensed = 0u128;
    let mut wallets = HashSet::new();

    for entry in entries {
        stats.total_entries += 1;
        match entry.status {
            LedgerStatus::Success => {
                stats.successful += 1;
                dispensed += entry.amount as u128;
                wallets.insert(entry.wallet_address.clone());
            }
            LedgerStatus::Failed => stats.failed += 1,
            LedgerStatus::NotAttempted => stats.not_attempted += 1,
        }
    }

    stats.total_dispensed = dispensed.to_string();
    stats.unique_wallets = wallets.len() as u64;
    stats
}

/// Sled-backed ledger
pub struct SledLedger {
    _db: Arc<Db>,
    entries: Tree,
}

impl SledLedger {
    /// Create or open the ledger database
    pub fn open(path: &str) -> FaucetResult<Self> {
        info!("Opening faucet ledger at: {}", path);

        let db = sled::Config::default()
            .path(path)
            .cache_capacity(64 * 1024 * 1024)
            .open()?;
        let entries = db.open_tree("dispatch_ledger")?;

        Ok(Self {
            _db: Arc::new(db),
            entries,
        })
    }

    fn decode(value: &[u8]) -> FaucetResult<LedgerEntry> {
        bincode::deserialize(value).map_err(|e| FaucetError::InternalError(e.to_string()))
    }

    fn insert(&self, entry: &LedgerEntry) -> FaucetResult<()> {
        let value = bincode::serialize(entry).map_err(|e| FaucetError::InternalError(e.to_string()))?;
        self.entries.insert(entry.key(), value)?;
        debug!(request_id = %entry.request_id, "Ledger entry appended");
        Ok(())
    }

    pub fn statistics(&self) -> FaucetResult<LedgerStatistics> {
        let mut all = Vec::with_capacity(self.entries.len());
        for item in self.entries.iter() {
            let (_, value) = item?;
            all.push(Self::decode(&value)?);
        }
        Ok(summarize(all.iter()))
    }

    pub async fn flush(&self) -> FaucetResult<()> {
        self.entries.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl Ledger for SledLedger {
    async fn append(&self, entry: LedgerEntry) -> FaucetResult<()> {
        self.insert(&entry)
    }
}

/// In-memory ledger for tests and for running without persistence.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn append(&self, entry: LedgerEntry) -> FaucetResult<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(request_id: &str, wallet: &str, status: LedgerStatus, created_at: i64) -> LedgerEntry {
        LedgerEntry {
            request_id: request_id.to_string(),
            wallet_address: wallet.to_string(),
            amount: 100,
            status,
            transaction_hash: (status == LedgerStatus::Success).then(|| format!("0x{}", request_id)),
            error_message: (status != LedgerStatus::Success).then(|| "boom".to_string()),
            source_address: "127.0.0.1".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_sled_ledger_summarizes() {
        let dir = tempdir().unwrap();
        let ledger = SledLedger::open(dir.path().join("ledger").to_str().unwrap()).unwrap();

        ledger.append(entry("a", "0x1", LedgerStatus::Success, 1_000)).await.unwrap();
        ledger.append(entry("b", "0x2", LedgerStatus::Failed, 2_000)).await.unwrap();
        ledger.append(entry("c", "0x1", LedgerStatus::Success, 3_000)).await.unwrap();
        ledger.append(entry("d", "0x3", LedgerStatus::NotAttempted, 4_000)).await.unwrap();

        let stats = ledger.statistics().unwrap();
        assert_eq!(stats.total_entries, 4);
        assert_eq!(stats.successful, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.not_attempted, 1);
        assert_eq!(stats.total_dispensed, "200");
        assert_eq!(stats.unique_wallets, 1);
    }

    #[tokio::test]
    async fn test_sled_ledger_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger");
        {
            let ledger = SledLedger::open(path.to_str().unwrap()).unwrap();
            ledger.append(entry("a", "0x1", LedgerStatus::Success, 1_000)).await.unwrap();
            ledger.flush().await.unwrap();
        }
        let reopened = SledLedger::open(path.to_str().unwrap()).unwrap();
        assert_eq!(reopened.statistics().unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn test_memory_ledger() {
        let ledger = MemoryLedger::new();
        ledger.append(entry("a", "0x1", LedgerStatus::Failed, 1)).await.unwrap();
        let entries = ledger.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, LedgerStatus::Failed);
    }

    #[test]
    fn test_entry_serializes_camel_case() {
        let json = serde_json::to_value(entry("a", "0x1", LedgerStatus::NotAttempted, 5)).unwrap();
        assert_eq!(json["status"], "not_attempted");
        assert_eq!(json["requestId"], "a");
        assert_eq!(json["createdAt"], 5);
    }
}
