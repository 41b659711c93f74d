//! JSON-RPC clients for the upstream node agent and the overlay node.
//!
//! Both speak bitcoind-style JSON-RPC 1.0 over HTTP with basic auth. The
//! surfaces are traits so the controller and the storage layer can be
//! exercised against recording fakes.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chainsink_core::{OmniTransaction, TETHER_PROPERTY_ID};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::debug;

/// Upstream node agent surface: re-emit requests.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Ask the upstream to republish blocks `[start..end]` onto the bus.
    /// Fire-and-forget: the blocks arrive as regular bus messages.
    async fn send_batch_block(&self, start: i64, end: i64) -> Result<()>;
}

/// Overlay node surface: per-height overlay transactions and balances.
#[async_trait]
pub trait OmniApi: Send + Sync {
    /// Overlay transactions confirmed at `height`.
    async fn get_omni_block(&self, height: i64) -> Result<Vec<OmniTransaction>>;

    /// Current Tether balance of `address` at the overlay tip.
    async fn get_tether_balance(&self, address: &str) -> Result<Decimal>;
}

/// Minimal JSON-RPC 1.0 client.
struct JsonRpcClient {
    http: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
}

impl JsonRpcClient {
    fn new(endpoint: &str, user: &str, password: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "chainsink",
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("rpc {} request failed", method))?;

        let status = response.status();
        let envelope: Value = response
            .json()
            .await
            .with_context(|| format!("rpc {} returned a non-JSON body (HTTP {})", method, status))?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            bail!("rpc {} error: {}", method, error);
        }
        if !status.is_success() {
            bail!("rpc {} failed with HTTP {}", method, status);
        }

        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("rpc {} response has no result", method))
    }
}

/// Client for the upstream node agent.
pub struct NodeClient {
    rpc: JsonRpcClient,
}

impl NodeClient {
    /// Create a client against `endpoint` with basic auth.
    pub fn new(endpoint: &str, user: &str, password: &str) -> Self {
        Self {
            rpc: JsonRpcClient::new(endpoint, user, password),
        }
    }
}

#[async_trait]
impl NodeApi for NodeClient {
    async fn send_batch_block(&self, start: i64, end: i64) -> Result<()> {
        debug!(start, end, "requesting block range re-emit");
        self.rpc
            .call("sendbatchblock", json!([start, end]))
            .await?;
        Ok(())
    }
}

/// Client for the overlay (Omni layer) node.
pub struct OmniClient {
    rpc: JsonRpcClient,
}

impl OmniClient {
    /// Create a client against `endpoint` with basic auth.
    pub fn new(endpoint: &str, user: &str, password: &str) -> Self {
        Self {
            rpc: JsonRpcClient::new(endpoint, user, password),
        }
    }
}

#[async_trait]
impl OmniApi for OmniClient {
    async fn get_omni_block(&self, height: i64) -> Result<Vec<OmniTransaction>> {
        let txids: Vec<String> = serde_json::from_value(
            self.rpc
                .call("omni_listblocktransactions", json!([height]))
                .await?,
        )
        .with_context(|| format!("overlay tx list for height {} is malformed", height))?;

        let mut transactions = Vec::with_capacity(txids.len());
        for txid in txids {
            let raw = self.rpc.call("omni_gettransaction", json!([txid])).await?;
            let tx: OmniTransaction = serde_json::from_value(raw)
                .with_context(|| format!("overlay transaction {} is malformed", txid))?;
            transactions.push(tx);
        }

        Ok(transactions)
    }

    async fn get_tether_balance(&self, address: &str) -> Result<Decimal> {
        let result = self
            .rpc
            .call("omni_getbalance", json!([address, TETHER_PROPERTY_ID]))
            .await?;
        parse_balance(&result)
            .with_context(|| format!("balance for address {} is malformed", address))
    }
}

/// Extract the decimal balance out of an `omni_getbalance` result.
fn parse_balance(result: &Value) -> Result<Decimal> {
    let balance = result
        .get("balance")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing balance field"))?;
    Decimal::from_str(balance).map_err(|e| anyhow!("unparseable balance {:?}: {}", balance, e))
}
