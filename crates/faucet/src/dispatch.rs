//! Dispatch orchestration.
//!
//! Steps run in order and stop at the first failure: readiness, reserve
//! balance, amount ceiling, transfer, classification. A failed transfer is
//! never retried here.

use crate::address::WalletAddress;
use crate::error::FaucetError;
use crate::metrics::FaucetMetrics;
use crate::transfer::{TransferExecutor, TransferReceipt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success,
    ValidationFailed,
    InsufficientReserve,
    TransferFailed,
    ServiceUnavailable,
}

/// Immutable result of one dispatch. A `Success` always carries a non-empty
/// transaction hash and no other outcome carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    outcome: DispatchOutcome,
    transaction_hash: Option<String>,
    fee: Option<u64>,
    error_detail: Option<String>,
}

impl DispatchResult {
    /// Classify a backend acknowledgement. An empty hash is a failed transfer.
    pub fn from_receipt(receipt: TransferReceipt) -> Self {
        if receipt.hash.trim().is_empty() {
            return Self::transfer_failed("transfer backend returned no transaction hash");
        }
        Self {
            outcome: DispatchOutcome::Success,
            transaction_hash: Some(receipt.hash),
            fee: receipt.fee,
            error_detail: None,
        }
    }

    fn failure(outcome: DispatchOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            transaction_hash: None,
            fee: None,
            error_detail: Some(detail.into()),
        }
    }

    pub fn validation_failed(detail: impl Into<String>) -> Self {
        Self::failure(DispatchOutcome::ValidationFailed, detail)
    }

    pub fn insufficient_reserve(detail: impl Into<String>) -> Self {
        Self::failure(DispatchOutcome::InsufficientReserve, detail)
    }

    pub fn transfer_failed(detail: impl Into<String>) -> Self {
        Self::failure(DispatchOutcome::TransferFailed, detail)
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::failure(DispatchOutcome::ServiceUnavailable, detail)
    }

    pub fn outcome(&self) -> DispatchOutcome {
        self.outcome
    }

    pub fn is_success(&self) -> bool {
        self.outcome == DispatchOutcome::Success
    }

    /// True when the transfer backend was actually asked to send.
    pub fn transfer_attempted(&self) -> bool {
        matches!(
            self.outcome,
            DispatchOutcome::Success | DispatchOutcome::TransferFailed
        )
    }

    pub fn transaction_hash(&self) -> Option<&str> {
        self.transaction_hash.as_deref()
    }

    pub fn fee(&self) -> Option<u64> {
        self.fee
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    /// Map a non-success outcome onto the HTTP error taxonomy.
    pub fn into_error(self) -> Option<FaucetError> {
        let detail = self.error_detail.unwrap_or_default();
        match self.outcome {
            DispatchOutcome::Success => None,
            DispatchOutcome::ValidationFailed => Some(FaucetError::InvalidAmount(detail)),
            DispatchOutcome::InsufficientReserve => Some(FaucetError::InsufficientReserve(detail)),
            DispatchOutcome::TransferFailed => Some(FaucetError::TransferFailed(detail)),
            DispatchOutcome::ServiceUnavailable => Some(FaucetError::ServiceUnavailable(detail)),
        }
    }
}

pub struct DispatchOrchestrator {
    executor: Arc<dyn TransferExecutor>,
    metrics: Arc<FaucetMetrics>,
    min_reserve: u64,
    max_amount: u64,
}

impl DispatchOrchestrator {
    pub fn new(
        executor: Arc<dyn TransferExecutor>,
        metrics: Arc<FaucetMetrics>,
        min_reserve: u64,
        max_amount: u64,
    ) -> Self {
        Self {
            executor,
            metrics,
            min_reserve,
            max_amount,
        }
    }

    pub fn executor(&self) -> &Arc<dyn TransferExecutor> {
        &self.executor
    }

    pub fn min_reserve(&self) -> u64 {
        self.min_reserve
    }

    pub fn max_amount(&self) -> u64 {
        self.max_amount
    }

    /// Readiness, reserve floor and amount ceiling, then the transfer.
    pub async fn dispatch(&self, wallet: &WalletAddress, amount: u64, request_id: &str) -> DispatchResult {
        if let Err(result) = self.preflight(amount, request_id).await {
            return result;
        }
        self.transfer(wallet, amount, request_id).await
    }

    /// Every step before the transfer. `Err` carries the short-circuit outcome.
    pub async fn preflight(&self, amount: u64, request_id: &str) -> Result<(), DispatchResult> {
        if !self.executor.is_ready() {
            warn!(request_id, "Transfer backend not ready");
            return Err(DispatchResult::service_unavailable("transfer backend is not initialized"));
        }

        match self.executor.reserve_balance().await {
            Ok(balance) => {
                self.metrics.set_reserve_balance(balance);
                if balance < self.min_reserve {
                    warn!(
                        request_id,
                        balance,
                        min_reserve = self.min_reserve,
                        "Faucet reserve below threshold"
                    );
                    return Err(DispatchResult::insufficient_reserve(format!(
                        "faucet balance {} is below the minimum reserve of {}",
                        balance, self.min_reserve
                    )));
                }
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to read faucet reserve");
                return Err(DispatchResult::service_unavailable(format!(
                    "unable to read faucet balance: {}",
                    e
                )));
            }
        }

        if amount == 0 {
            return Err(DispatchResult::validation_failed("amount must be greater than zero"));
        }
        if amount > self.max_amount {
            return Err(DispatchResult::validation_failed(format!(
                "requested amount {} exceeds the maximum of {}",
                amount, self.max_amount
            )));
        }
        Ok(())
    }

    /// Send through the executor and classify the reply. Callers run
    /// [`preflight`](Self::preflight) first.
    pub async fn transfer(&self, wallet: &WalletAddress, amount: u64, request_id: &str) -> DispatchResult {
        let result = match self.executor.send(wallet, amount).await {
            Ok(receipt) => DispatchResult::from_receipt(receipt),
            Err(e) => DispatchResult::transfer_failed(e.message()),
        };

        match result.transaction_hash() {
            Some(hash) => info!(request_id, wallet = %wallet, amount, hash, "Transfer submitted"),
            None => error!(
                request_id,
                wallet = %wallet,
                amount,
                detail = result.error_detail().unwrap_or_default(),
                "Transfer failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockExecutor {
        ready: bool,
        balance: Result<u64, TransferError>,
        reply: Result<TransferReceipt, TransferError>,
        sends: AtomicUsize,
    }

    impl MockExecutor {
        fn healthy() -> Self {
            Self {
                ready: true,
                balance: Ok(10_000),
                reply: Ok(TransferReceipt {
                    hash: "0xabc".to_string(),
                    fee: Some(21),
                }),
                sends: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TransferExecutor for MockExecutor {
        fn is_ready(&self) -> bool {
            self.ready
        }

        async fn reserve_balance(&self) -> Result<u64, TransferError> {
            self.balance.clone()
        }

        async fn send(&self, _to: &WalletAddress, _amount: u64) -> Result<TransferReceipt, TransferError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }

        fn faucet_address(&self) -> Option<WalletAddress> {
            None
        }
    }

    fn orchestrator(executor: Arc<MockExecutor>) -> DispatchOrchestrator {
        DispatchOrchestrator::new(executor, Arc::new(FaucetMetrics::new().unwrap()), 1_000, 500)
    }

    fn wallet() -> WalletAddress {
        WalletAddress::parse("0xbeef").unwrap()
    }

    #[tokio::test]
    async fn test_success_carries_hash() {
        let executor = Arc::new(MockExecutor::healthy());
        let result = orchestrator(executor.clone()).dispatch(&wallet(), 100, "r1").await;
        assert_eq!(result.outcome(), DispatchOutcome::Success);
        assert_eq!(result.transaction_hash(), Some("0xabc"));
        assert_eq!(result.fee(), Some(21));
        assert!(result.error_detail().is_none());
        assert_eq!(executor.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_amount_over_max_never_reaches_backend() {
        let executor = Arc::new(MockExecutor::healthy());
        let result = orchestrator(executor.clone()).dispatch(&wallet(), 501, "r1").await;
        assert_eq!(result.outcome(), DispatchOutcome::ValidationFailed);
        assert!(result.transaction_hash().is_none());
        assert_eq!(executor.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_low_reserve_short_circuits() {
        let executor = Arc::new(MockExecutor {
            balance: Ok(999),
            ..MockExecutor::healthy()
        });
        let orchestrator = orchestrator(executor.clone());
        let result = orchestrator.dispatch(&wallet(), 100, "r1").await;
        assert_eq!(result.outcome(), DispatchOutcome::InsufficientReserve);
        assert!(!result.transfer_attempted());
        assert_eq!(executor.sends.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.metrics.reserve_balance.get(), 999.0);
    }

    #[tokio::test]
    async fn test_backend_error_is_kept_verbatim() {
        let executor = Arc::new(MockExecutor {
            reply: Err(TransferError::new("insufficient gas")),
            ..MockExecutor::healthy()
        });
        let result = orchestrator(executor).dispatch(&wallet(), 100, "r1").await;
        assert_eq!(result.outcome(), DispatchOutcome::TransferFailed);
        assert_eq!(result.error_detail(), Some("insufficient gas"));
        assert!(result.transaction_hash().is_none());
        assert!(result.transfer_attempted());
    }

    #[tokio::test]
    async fn test_empty_hash_is_a_failure() {
        let executor = Arc::new(MockExecutor {
            reply: Ok(TransferReceipt {
                hash: "  ".to_string(),
                fee: Some(1),
            }),
            ..MockExecutor::healthy()
        });
        let result = orchestrator(executor).dispatch(&wallet(), 100, "r1").await;
        assert_eq!(result.outcome(), DispatchOutcome::TransferFailed);
        assert!(result.transaction_hash().is_none());
        assert!(result.fee().is_none());
    }

    #[tokio::test]
    async fn test_not_ready_and_unreadable_balance() {
        let not_ready = Arc::new(MockExecutor {
            ready: false,
            ..MockExecutor::healthy()
        });
        let result = orchestrator(not_ready.clone()).dispatch(&wallet(), 100, "r1").await;
        assert_eq!(result.outcome(), DispatchOutcome::ServiceUnavailable);
        assert_eq!(not_ready.sends.load(Ordering::SeqCst), 0);

        let no_balance = Arc::new(MockExecutor {
            balance: Err(TransferError::new("timeout")),
            ..MockExecutor::healthy()
        });
        let result = orchestrator(no_balance).dispatch(&wallet(), 100, "r1").await;
        assert_eq!(result.outcome(), DispatchOutcome::ServiceUnavailable);
    }

    #[test]
    fn test_error_mapping() {
        assert!(DispatchResult::from_receipt(TransferReceipt {
            hash: "0x1".to_string(),
            fee: None
        })
        .into_error()
        .is_none());
        assert!(matches!(
            DispatchResult::insufficient_reserve("low").into_error(),
            Some(FaucetError::InsufficientReserve(_))
        ));
        assert!(matches!(
            DispatchResult::validation_failed("too much").into_error(),
            Some(FaucetError::InvalidAmount(_))
        ));
    }
}
