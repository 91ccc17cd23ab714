//! Outcome recording.
//!
//! `record` never waits on I/O: it bumps the local Prometheus counters and
//! hands the entry to a bounded queue. A background worker drains the queue,
//! increments the shared counters and appends to the ledger. Failures there
//! are logged and counted, never surfaced to the caller.

use crate::address::WalletAddress;
use crate::clock::Clock;
use crate::database::{Ledger, LedgerEntry, LedgerStatus};
use crate::dispatch::{DispatchOutcome, DispatchResult};
use crate::metrics::FaucetMetrics;
use crate::store::{CounterStore, KeySpace};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const REQUESTS_TOTAL: &str = "requests_total";
pub const REQUESTS_SUCCESS: &str = "requests_success";
pub const REQUESTS_FAILED: &str = "requests_failed";

enum RecorderMessage {
    Record(LedgerEntry),
    Flush(oneshot::Sender<()>),
}

pub fn ledger_status(result: &DispatchResult) -> LedgerStatus {
    match result.outcome() {
        DispatchOutcome::Success => LedgerStatus::Success,
        DispatchOutcome::TransferFailed => LedgerStatus::Failed,
        DispatchOutcome::ValidationFailed
        | DispatchOutcome::InsufficientReserve
        | DispatchOutcome::ServiceUnavailable => LedgerStatus::NotAttempted,
    }
}

pub struct OutcomeRecorder {
    tx: mpsc::Sender<RecorderMessage>,
    metrics: Arc<FaucetMetrics>,
    clock: Arc<dyn Clock>,
}

struct RecorderWorker {
    rx: mpsc::Receiver<RecorderMessage>,
    counters: Arc<dyn CounterStore>,
    ledger: Arc<dyn Ledger>,
    keys: KeySpace,
    metrics: Arc<FaucetMetrics>,
}

impl OutcomeRecorder {
    /// Spawn the drain worker. The worker exits once every recorder handle is dropped.
    pub fn start(
        counters: Arc<dyn CounterStore>,
        ledger: Arc<dyn Ledger>,
        keys: KeySpace,
        metrics: Arc<FaucetMetrics>,
        clock: Arc<dyn Clock>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = RecorderWorker {
            rx,
            counters,
            ledger,
            keys,
            metrics: metrics.clone(),
        };
        let handle = tokio::spawn(worker.run());
        (Self { tx, metrics, clock }, handle)
    }

    pub fn record(
        &self,
        request_id: &str,
        wallet: &WalletAddress,
        amount: u64,
        source: &str,
        result: &DispatchResult,
    ) {
        self.metrics.record_outcome(result.is_success());

        let entry = LedgerEntry {
            request_id: request_id.to_string(),
            wallet_address: wallet.to_string(),
            amount,
            status: ledger_status(result),
            transaction_hash: result.transaction_hash().map(str::to_string),
            error_message: result.error_detail().map(str::to_string),
            source_address: source.to_string(),
            created_at: self.clock.now_millis(),
        };

        match self.tx.try_send(RecorderMessage::Record(entry)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.recorder_dropped_total.inc();
                warn!(request_id, "Recorder queue full, outcome dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.recorder_dropped_total.inc();
                error!(request_id, "Recorder worker stopped, outcome dropped");
            }
        }
    }

    /// Wait until every outcome queued before this call has been processed.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(RecorderMessage::Flush(done)).await.is_err() {
            return;
        }
        let _ = wait.await;
    }
}

impl RecorderWorker {
    async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            match message {
                RecorderMessage::Record(entry) => self.persist(entry).await,
                RecorderMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Outcome recorder drained");
    }

    async fn bump(&self, name: &str) {
        if let Err(e) = self.counters.increment(&self.keys.metric(name)).await {
            self.metrics.recorder_errors_total.inc();
            warn!(counter = name, error = %e, "Failed to update shared counter");
        }
    }

    async fn persist(&self, entry: LedgerEntry) {
        self.bump(REQUESTS_TOTAL).await;
        if entry.status == LedgerStatus::Success {
            self.bump(REQUESTS_SUCCESS).await;
        } else {
            self.bump(REQUESTS_FAILED).await;
        }

        let request_id = entry.request_id.clone();
        if let Err(e) = self.ledger.append(entry).await {
            self.metrics.recorder_errors_total.inc();
            error!(request_id = %request_id, error = %e, "Failed to append ledger entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::MemoryLedger;
    use crate::error::{FaucetError, FaucetResult};
    use crate::store::MemoryStore;
    use crate::transfer::TransferReceipt;
    use async_trait::async_trait;

    struct Harness {
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        metrics: Arc<FaucetMetrics>,
        recorder: OutcomeRecorder,
    }

    fn harness(capacity: usize) -> Harness {
        let clock = Arc::new(ManualClock::new(42));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let ledger = Arc::new(MemoryLedger::new());
        let metrics = Arc::new(FaucetMetrics::new().unwrap());
        let (recorder, _handle) = OutcomeRecorder::start(
            store.clone(),
            ledger.clone(),
            KeySpace::default(),
            metrics.clone(),
            clock,
            capacity,
        );
        Harness {
            store,
            ledger,
            metrics,
            recorder,
        }
    }

    fn wallet() -> WalletAddress {
        WalletAddress::parse("0x1234").unwrap()
    }

    #[tokio::test]
    async fn test_failed_transfer_counts_once() {
        let h = harness(16);
        let result = DispatchResult::transfer_failed("insufficient gas");
        h.recorder.record("req-1", &wallet(), 100, "10.0.0.1", &result);
        h.recorder.flush().await;

        let keys = KeySpace::default();
        assert_eq!(h.store.counter(&keys.metric(REQUESTS_FAILED)).await.unwrap(), 1);
        assert_eq!(h.store.counter(&keys.metric(REQUESTS_TOTAL)).await.unwrap(), 1);
        assert_eq!(h.store.counter(&keys.metric(REQUESTS_SUCCESS)).await.unwrap(), 0);
        assert_eq!(h.metrics.requests_failed_total.get(), 1.0);

        let entries = h.ledger.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, LedgerStatus::Failed);
        assert_eq!(entries[0].error_message.as_deref(), Some("insufficient gas"));
        assert_eq!(entries[0].created_at, 42);
    }

    #[tokio::test]
    async fn test_statuses_follow_outcome() {
        let h = harness(16);
        let success = DispatchResult::from_receipt(TransferReceipt {
            hash: "0xabc".to_string(),
            fee: None,
        });
        h.recorder.record("ok", &wallet(), 1, "s", &success);
        h.recorder.record("low", &wallet(), 1, "s", &DispatchResult::insufficient_reserve("low"));
        h.recorder.flush().await;

        let entries = h.ledger.entries().await;
        assert_eq!(entries[0].status, LedgerStatus::Success);
        assert_eq!(entries[0].transaction_hash.as_deref(), Some("0xabc"));
        assert_eq!(entries[1].status, LedgerStatus::NotAttempted);
        assert!(entries[1].transaction_hash.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let metrics = Arc::new(FaucetMetrics::new().unwrap());
        // Nobody drains this channel.
        let (tx, _rx) = mpsc::channel(1);
        let recorder = OutcomeRecorder {
            tx,
            metrics: metrics.clone(),
            clock: Arc::new(ManualClock::new(0)),
        };

        let result = DispatchResult::service_unavailable("not ready");
        recorder.record("a", &wallet(), 1, "s", &result);
        recorder.record("b", &wallet(), 1, "s", &result);
        assert_eq!(metrics.recorder_dropped_total.get(), 1.0);
        assert_eq!(metrics.requests_total.get(), 2.0);
    }

    struct FailingLedger;

    #[async_trait]
    impl Ledger for FailingLedger {
        async fn append(&self, _entry: LedgerEntry) -> FaucetResult<()> {
            Err(FaucetError::InternalError("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_ledger_failure_is_absorbed() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(FaucetMetrics::new().unwrap());
        let (recorder, _handle) = OutcomeRecorder::start(
            Arc::new(MemoryStore::new(clock.clone())),
            Arc::new(FailingLedger),
            KeySpace::default(),
            metrics.clone(),
            clock,
            4,
        );
        recorder.record("a", &wallet(), 1, "s", &DispatchResult::transfer_failed("x"));
        recorder.flush().await;
        assert_eq!(metrics.recorder_errors_total.get(), 1.0);
    }
}
