#![allow(dead_code)]

use async_trait::async_trait;
use drip_faucet::clock::ManualClock;
use drip_faucet::database::MemoryLedger;
use drip_faucet::store::MemoryStore;
use drip_faucet::transfer::{TransferError, TransferExecutor, TransferReceipt};
use drip_faucet::{Backends, FaucetConfig, FaucetRequest, FaucetService, WalletAddress};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const START_MILLIS: i64 = 1_700_000_000_000;

/// Signing relay stand-in with switchable behaviour.
pub struct MockRelay {
    ready: AtomicBool,
    balance: Mutex<Result<u64, TransferError>>,
    reply: Mutex<Result<TransferReceipt, TransferError>>,
    send_delay: Mutex<Option<Duration>>,
    sends: AtomicUsize,
}

impl MockRelay {
    pub fn healthy() -> Self {
        Self {
            ready: AtomicBool::new(true),
            balance: Mutex::new(Ok(1_000_000)),
            reply: Mutex::new(Ok(TransferReceipt {
                hash: "0xfeed".to_string(),
                fee: Some(21),
            })),
            send_delay: Mutex::new(None),
            sends: AtomicUsize::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_balance(&self, balance: u64) {
        *self.balance.lock().unwrap() = Ok(balance);
    }

    pub fn fail_sends(&self, message: &str) {
        *self.reply.lock().unwrap() = Err(TransferError::new(message));
    }

    pub fn succeed_sends(&self) {
        *self.reply.lock().unwrap() = Ok(TransferReceipt {
            hash: "0xfeed".to_string(),
            fee: Some(21),
        });
    }

    pub fn delay_sends(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferExecutor for MockRelay {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn reserve_balance(&self) -> Result<u64, TransferError> {
        self.balance.lock().unwrap().clone()
    }

    async fn send(&self, _to: &WalletAddress, _amount: u64) -> Result<TransferReceipt, TransferError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.reply.lock().unwrap().clone()
    }

    fn faucet_address(&self) -> Option<WalletAddress> {
        None
    }
}

pub struct Harness {
    pub service: Arc<FaucetService>,
    pub relay: Arc<MockRelay>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MemoryLedger>,
}

/// Defaults with pacing off so tests never sleep on admission.
pub fn test_config() -> FaucetConfig {
    FaucetConfig {
        pacing_enabled: false,
        default_amount: 100,
        max_amount: 500,
        min_reserve_balance: 1_000,
        wallet_cooldown_secs: 3600,
        ..FaucetConfig::default()
    }
}

pub fn harness(config: FaucetConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let ledger = Arc::new(MemoryLedger::new());
    let relay = Arc::new(MockRelay::healthy());

    let backends = Backends {
        counters: store.clone(),
        cooldowns: store.clone(),
        executor: relay.clone(),
        ledger: ledger.clone(),
        clock: clock.clone(),
    };
    let (service, _worker) = FaucetService::start(config, backends).unwrap();

    Harness {
        service,
        relay,
        clock,
        store,
        ledger,
    }
}

pub fn request(wallet: &str) -> FaucetRequest {
    FaucetRequest {
        wallet_address: wallet.to_string(),
        amount: None,
    }
}

pub fn request_amount(wallet: &str, amount: &str) -> FaucetRequest {
    FaucetRequest {
        wallet_address: wallet.to_string(),
        amount: Some(amount.to_string()),
    }
}
