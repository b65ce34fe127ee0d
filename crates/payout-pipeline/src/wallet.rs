use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use arena_domain::{Amount, PlayerId};

/// Port onto the external wallet/signing service. Implementations must
/// behave identically in simulate-only mode; the pipeline cannot tell the
/// difference and must not need to.
#[async_trait]
pub trait WalletPort: Send + Sync {
    async fn resolve_address(&self, player: &PlayerId) -> Result<Option<String>, String>;

    /// Submits one transfer and returns the settlement network's transfer
    /// id. "No response" is an `Err` like any other failure.
    async fn transfer(&self, address: &str, amount: Amount, memo: &str)
        -> Result<String, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransfer {
    pub address: String,
    pub amount: Amount,
    pub memo: String,
    pub transfer_id: String,
}

/// Test/local wallet: scripted addresses, scripted failures, recorded
/// transfers.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWallet {
    addresses: Arc<Mutex<HashMap<PlayerId, String>>>,
    pub transfers: Arc<Mutex<Vec<WalletTransfer>>>,
    fail_remaining: Arc<Mutex<u32>>,
    next_transfer_id: Arc<Mutex<Option<String>>>,
}

impl InMemoryWallet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_address(&self, player: PlayerId, address: impl Into<String>) {
        if let Ok(mut guard) = self.addresses.lock() {
            guard.insert(player, address.into());
        }
    }

    /// Makes the next `count` transfers fail before succeeding again.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut guard) = self.fail_remaining.lock() {
            *guard = count;
        }
    }

    pub fn set_next_transfer_id(&self, transfer_id: impl Into<String>) {
        if let Ok(mut guard) = self.next_transfer_id.lock() {
            *guard = Some(transfer_id.into());
        }
    }

    #[must_use]
    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().map(|guard| guard.len()).unwrap_or(0)
    }
}

#[async_trait]
impl WalletPort for InMemoryWallet {
    async fn resolve_address(&self, player: &PlayerId) -> Result<Option<String>, String> {
        Ok(self
            .addresses
            .lock()
            .map_err(|_| "wallet addresses lock poisoned".to_string())?
            .get(player)
            .cloned())
    }

    async fn transfer(
        &self,
        address: &str,
        amount: Amount,
        memo: &str,
    ) -> Result<String, String> {
        {
            let mut remaining = self
                .fail_remaining
                .lock()
                .map_err(|_| "wallet failure lock poisoned".to_string())?;
            if *remaining > 0 {
                *remaining -= 1;
                return Err("wallet transfer failed".to_string());
            }
        }
        let mut transfers = self
            .transfers
            .lock()
            .map_err(|_| "wallet transfers lock poisoned".to_string())?;
        let transfer_id = self
            .next_transfer_id
            .lock()
            .map_err(|_| "wallet id lock poisoned".to_string())?
            .take()
            .unwrap_or_else(|| format!("transfer-{}", transfers.len() + 1));
        transfers.push(WalletTransfer {
            address: address.to_string(),
            amount,
            memo: memo.to_string(),
            transfer_id: transfer_id.clone(),
        });
        Ok(transfer_id)
    }
}
