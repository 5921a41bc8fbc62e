//! HTTP client construction for talking to exchange services.
//!
//! Grounded on `confirmation/evm.rs`'s `Client::builder().timeout(..).build()`
//! shape — one long-lived `reqwest::Client` per remote, reused across calls.

use eyre::Result;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// The exchange-phase timeout spec §5 requires (30s).
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ExchangeClient {
    pub base_url: String,
    client: Client,
}

impl ExchangeClient {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder().timeout(EXCHANGE_TIMEOUT).build()?;
        Ok(Self { base_url, client })
    }

    pub async fn get_keys(&self) -> Result<Value> {
        let url = format!("{}/keys", self.base_url.trim_end_matches('/'));
        let resp = self.client.get(&url).send().await?;
        let body: Value = resp.json().await?;
        Ok(body)
    }

    pub async fn post_deposit(&self, body: &Value) -> Result<(u16, Value)> {
        let url = format!("{}/coins/deposit", self.base_url.trim_end_matches('/'));
        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    pub async fn get_transfer(&self, wtid: &str) -> Result<(u16, Value)> {
        let url = format!(
            "{}/transfers/{}",
            self.base_url.trim_end_matches('/'),
            wtid
        );
        let resp = self.client.get(&url).send().await?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }
}
