use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use arena_domain::{Amount, PlayerId};
use audit_log::health::HealthProbe;
use payout_pipeline::WalletPort;
use replay_guard::AddressResolver;

use crate::config::WalletSection;

/// HTTP client for the external wallet/signing service. In simulate mode
/// the service is asked not to move funds; every other code path is
/// identical, which keeps retry and idempotency behavior honest in
/// non-production environments.
#[derive(Debug, Clone)]
pub struct HttpWalletService {
    base_url: String,
    simulate: bool,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ResolveAddressRequest<'a> {
    player: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResolveAddressResponse {
    address: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    address: &'a str,
    amount: u64,
    memo: &'a str,
    simulate: bool,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    success: bool,
    transfer_id: Option<String>,
    error: Option<String>,
}

impl HttpWalletService {
    #[must_use]
    pub fn new(cfg: &WalletSection) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            base_url: cfg.endpoint.trim_end_matches('/').to_string(),
            simulate: cfg.simulate,
            client,
        }
    }
}

#[async_trait]
impl WalletPort for HttpWalletService {
    async fn resolve_address(&self, player: &PlayerId) -> Result<Option<String>, String> {
        let response = self
            .client
            .post(format!("{}/v1/address/resolve", self.base_url))
            .json(&ResolveAddressRequest {
                player: player.as_str(),
            })
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let payload: ResolveAddressResponse = response.json().await.map_err(|e| e.to_string())?;
        Ok(payload.address)
    }

    async fn transfer(
        &self,
        address: &str,
        amount: Amount,
        memo: &str,
    ) -> Result<String, String> {
        debug!(address, amount = %amount, simulate = self.simulate, "submitting transfer");
        let response = self
            .client
            .post(format!("{}/v1/transfer", self.base_url))
            .json(&TransferRequest {
                address,
                amount: amount.as_u64(),
                memo,
                simulate: self.simulate,
            })
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let payload: TransferResponse = response.json().await.map_err(|e| e.to_string())?;
        if !payload.success {
            return Err(payload
                .error
                .unwrap_or_else(|| "transfer rejected without detail".to_string()));
        }
        payload
            .transfer_id
            .ok_or_else(|| "transfer succeeded without a transfer id".to_string())
    }
}

#[async_trait]
impl AddressResolver for HttpWalletService {
    async fn resolve_address(&self, player: &PlayerId) -> Result<Option<String>, String> {
        WalletPort::resolve_address(self, player).await
    }
}

#[async_trait]
impl HealthProbe for HttpWalletService {
    async fn probe(&self) -> bool {
        match self
            .client
            .get(format!("{}/v1/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
