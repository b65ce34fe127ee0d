use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

use replay_guard::{ChainQueryPort, ChainTransaction};

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    block_time: i64,
    success: bool,
    signers: Vec<String>,
    /// Net change per account for the settlement asset, smallest units.
    balance_deltas: HashMap<String, i128>,
}

/// JSON-RPC client for the blockchain query layer, asking for finalized
/// transactions only.
#[derive(Debug, Clone)]
pub struct JsonRpcChainClient {
    endpoint: String,
    client: reqwest::Client,
}

impl JsonRpcChainClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn rpc_call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, String> {
        let body = serde_json::json!({
            "jsonrpc":"2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let payload: JsonRpcResponse<T> = resp.json().await.map_err(|e| e.to_string())?;
        if let Some(err) = payload.error {
            return Err(format!("rpc code={} message={}", err.code, err.message));
        }
        payload.result.ok_or_else(|| "missing result".to_string())
    }
}

#[async_trait]
impl ChainQueryPort for JsonRpcChainClient {
    async fn transaction_by_signature(
        &self,
        signature: &str,
    ) -> Result<Option<ChainTransaction>, String> {
        let tx: Option<RpcTransaction> = self
            .rpc_call(
                "chain_getTransaction",
                serde_json::json!([signature, {"finality": "final"}]),
            )
            .await?;
        let Some(tx) = tx else {
            return Ok(None);
        };
        let block_time = DateTime::from_timestamp(tx.block_time, 0)
            .ok_or_else(|| format!("invalid block time {}", tx.block_time))?;
        Ok(Some(ChainTransaction {
            signature: signature.to_string(),
            block_time,
            success: tx.success,
            signers: tx.signers,
            balance_deltas: tx.balance_deltas,
        }))
    }
}
