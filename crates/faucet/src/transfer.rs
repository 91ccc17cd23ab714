//! Transfer backend.
//!
//! The faucet never signs anything itself. [`TransferExecutor`] is the seam to
//! whatever holds the faucet key; [`RpcTransferExecutor`] talks JSON-RPC 2.0 to
//! a signing relay that exposes `faucet_getBalance` and `faucet_transfer`.

use crate::address::WalletAddress;
use crate::error::{FaucetError, FaucetResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error reported by the transfer backend. The message is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransferError(String);

impl TransferError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Backend acknowledgement of a submitted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// True once the backend has been initialized and can sign transfers.
    fn is_ready(&self) -> bool;

    /// Faucet holding balance in base units.
    async fn reserve_balance(&self) -> Result<u64, TransferError>;

    async fn send(&self, to: &WalletAddress, amount: u64) -> Result<TransferReceipt, TransferError>;

    /// Address the faucet sends from, when known.
    fn faucet_address(&self) -> Option<WalletAddress>;
}

/// Parse an amount from a JSON number, a decimal string or a `0x` hex string.
pub fn parse_amount(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        _ => None,
    }
}

/// JSON-RPC client for the signing relay.
pub struct RpcTransferExecutor {
    rpc_url: String,
    client: reqwest::Client,
    faucet_address: Option<WalletAddress>,
    ready: AtomicBool,
}

impl RpcTransferExecutor {
    pub fn new(
        rpc_url: impl Into<String>,
        faucet_address: Option<WalletAddress>,
        timeout: Duration,
    ) -> FaucetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FaucetError::RpcError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            rpc_url: rpc_url.into(),
            client,
            faucet_address,
            ready: AtomicBool::new(false),
        })
    }

    /// Check the relay and mark the executor ready. Returns the reserve balance.
    pub async fn initialize(&self) -> FaucetResult<u64> {
        let balance = self
            .reserve_balance()
            .await
            .map_err(|e| FaucetError::RpcError(format!("Signing relay unavailable: {}", e)))?;
        self.ready.store(true, Ordering::SeqCst);
        info!("Transfer backend ready at {} (reserve balance {})", self.rpc_url, balance);
        Ok(balance)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransferError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransferError::new(format!("Request failed: {}", e)))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| TransferError::new(format!("Invalid response: {}", e)))?;

        if let Some(error) = body.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(TransferError::new(message));
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl TransferExecutor for RpcTransferExecutor {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn reserve_balance(&self) -> Result<u64, TransferError> {
        let params = match &self.faucet_address {
            Some(address) => json!([address.as_str()]),
            None => json!([]),
        };
        let result = self.call("faucet_getBalance", params).await?;
        parse_amount(&result).ok_or_else(|| TransferError::new(format!("Unexpected balance value: {}", result)))
    }

    async fn send(&self, to: &WalletAddress, amount: u64) -> Result<TransferReceipt, TransferError> {
        debug!("Submitting transfer of {} to {}", amount, to);
        let result = self
            .call(
                "faucet_transfer",
                json!([{ "to": to.as_str(), "amount": amount.to_string() }]),
            )
            .await?;

        let receipt = match &result {
            Value::String(hash) => TransferReceipt {
                hash: hash.clone(),
                fee: None,
            },
            Value::Object(fields) => TransferReceipt {
                hash: fields
                    .get("hash")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                fee: fields.get("fee").and_then(parse_amount),
            },
            _ => {
                warn!("Signing relay returned no transaction hash: {}", result);
                TransferReceipt {
                    hash: String::new(),
                    fee: None,
                }
            }
        };
        Ok(receipt)
    }

    fn faucet_address(&self) -> Option<WalletAddress> {
        self.faucet_address.clone()
    }
}
