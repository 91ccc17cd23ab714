//! Wallet address parsing and normalization

use crate::error::{FaucetError, FaucetResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address length in bytes.
pub const ADDRESS_LENGTH: usize = 32;

/// A normalized wallet address: `0x` followed by 64 lowercase hex characters.
///
/// Short inputs are left-padded with zeros, so `0x2` and
/// `0x000…0002` name the same wallet and share one cooldown record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(input: &str) -> FaucetResult<Self> {
        let trimmed = input.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if hex_part.is_empty() {
            return Err(FaucetError::InvalidAddress("address is empty".to_string()));
        }
        if hex_part.len() > ADDRESS_LENGTH * 2 {
            return Err(FaucetError::InvalidAddress(format!(
                "address must be at most {} hex characters",
                ADDRESS_LENGTH * 2
            )));
        }
        let padded = format!("{:0>width$}", hex_part.to_ascii_lowercase(), width = ADDRESS_LENGTH * 2);
        hex::decode(&padded)
            .map_err(|_| FaucetError::InvalidAddress("address must be hexadecimal".to_string()))?;

        Ok(Self(format!("0x{}", padded)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = FaucetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}
