//! Faucet service with layered admission control
//!
//! Requests pass through:
//! - a global and a per-source rate limit tier (shared counter store)
//! - a per-wallet cooldown
//! - dispatch against the signing relay, guarded by a reserve floor
//! - asynchronous outcome recording (shared counters and a sled ledger)

pub mod address;
pub mod admission;
pub mod api;
pub mod clock;
pub mod config;
pub mod cooldown;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod recorder;
pub mod service;
pub mod store;
pub mod transfer;

pub use address::WalletAddress;
pub use admission::{AdmissionController, RateLimitInfo, Scope};
pub use config::FaucetConfig;
pub use cooldown::{CooldownMode, StoreFailurePolicy, WalletCooldownTracker};
pub use database::{Ledger, LedgerEntry, LedgerStatistics, LedgerStatus, SledLedger};
pub use dispatch::{DispatchOrchestrator, DispatchOutcome, DispatchResult};
pub use error::{FaucetError, FaucetResult};
pub use service::{Backends, FaucetRequest, FaucetResponse, FaucetService, FaucetStatus};
pub use transfer::{RpcTransferExecutor, TransferExecutor};
