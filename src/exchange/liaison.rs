//! Exchange liaison pool (spec §4.3).
//!
//! Maintains long-lived connections to trusted exchanges, their current
//! `Keys` and wire-fee table, and answers `find_exchange` lookups for every
//! other subsystem. The in-flight `/keys` fetch dedup reuses
//! `BoundedPendingCache` from the bootstrap cache module, and the periodic
//! refresh loop follows the `tokio::select!`-against-shutdown shape
//! `discovery.rs` uses for its own periodic task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::Result;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util_shim::CancellationToken;
use tracing::{info, warn};

use crate::bounded_cache::BoundedPendingCache;
use crate::config::Config;
use crate::exchange::client::ExchangeClient;
use crate::types::{Amount, PublicKey32};

/// A denomination key as published in an exchange's `/keys` response.
#[derive(Debug, Clone)]
pub struct DenominationInfo {
    pub denom_pub_hash: PublicKey32,
    pub value: Amount,
    pub fee_deposit: Amount,
    pub fee_refund: Amount,
    pub expire_deposit: DateTime<Utc>,
}

/// An exchange's live key material (spec §3).
#[derive(Debug, Clone, Default)]
pub struct Keys {
    pub master_pub: Option<PublicKey32>,
    pub denominations: Vec<DenominationInfo>,
    pub auditors: Vec<crate::auditors::AuditorVouch>,
}

/// One configured, trusted exchange and its liveness state.
struct ExchangeState {
    url: String,
    master_key: PublicKey32,
    client: ExchangeClient,
    keys: RwLock<Keys>,
    wire_fees: RwLock<HashMap<String, Amount>>,
    /// YES until the first successful `/keys` fetch (spec §3).
    pending: RwLock<bool>,
}

pub enum FindExchangeOutcome {
    Found {
        wire_fee: Option<Amount>,
    },
    NotAcceptable,
    NotReachable,
}

pub struct ExchangeLiaison {
    exchanges: HashMap<String, Arc<ExchangeState>>,
    /// Dedupes concurrent in-flight `/keys` fetches per exchange URL (spec
    /// §4.3's concurrency note).
    inflight: Mutex<BoundedPendingCache<Arc<tokio::sync::Notify>>>,
}

impl ExchangeLiaison {
    pub fn startup(config: &Config) -> Result<Self> {
        let mut exchanges = HashMap::new();
        for section in &config.exchanges {
            let client = ExchangeClient::new(section.base_url.clone())?;
            let state = ExchangeState {
                url: section.base_url.clone(),
                master_key: section.master_key,
                client,
                keys: RwLock::new(Keys::default()),
                wire_fees: RwLock::new(HashMap::new()),
                pending: RwLock::new(true),
            };
            exchanges.insert(section.base_url.clone(), Arc::new(state));
        }
        Ok(Self {
            exchanges,
            inflight: Mutex::new(BoundedPendingCache::new(256, 300)),
        })
    }

    /// The trusted-exchange array published in contracts (spec §4.3): URL
    /// and master public key, finalized lazily as `/keys` responses arrive.
    pub fn trusted_exchanges_json(&self) -> Value {
        Value::Array(
            self.exchanges
                .values()
                .map(|e| {
                    serde_json::json!({
                        "url": e.url,
                        "master_pub": e.master_key.to_base32(),
                    })
                })
                .collect(),
        )
    }

    pub fn is_trusted(&self, url: &str) -> bool {
        self.exchanges.contains_key(url)
    }

    pub fn master_key_for(&self, url: &str) -> Option<PublicKey32> {
        self.exchanges.get(url).map(|e| e.master_key)
    }

    /// `find_exchange(url, wire_method_or_nil, timeout)` (spec §4.3).
    ///
    /// Returns fast with `NotAcceptable` for any URL not already in the
    /// trust set — the merchant never downloads `/keys` from an arbitrary
    /// wallet-provided URL to decide trust.
    pub async fn find_exchange(
        &self,
        url: &str,
        wire_method: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<FindExchangeOutcome> {
        let Some(state) = self.exchanges.get(url).cloned() else {
            return Ok(FindExchangeOutcome::NotAcceptable);
        };

        if *state.pending.read().await {
            let refreshed = tokio::select! {
                _ = cancel.cancelled() => return Ok(FindExchangeOutcome::NotReachable),
                result = tokio::time::timeout(timeout, self.refresh_keys(&state)) => result,
            };
            match refreshed {
                Ok(Ok(())) => {}
                _ => return Ok(FindExchangeOutcome::NotReachable),
            }
        }

        let wire_fee = match wire_method {
            None => None,
            Some(method) => state.wire_fees.read().await.get(method).copied(),
        };

        Ok(FindExchangeOutcome::Found { wire_fee })
    }

    /// Fetch `/keys` for one exchange, deduping concurrent callers. Mirrors
    /// `discovery.rs`'s "download once, let everyone else observe the
    /// cached result" shape, generalized from a periodic poll to an
    /// on-demand refresh gated by a pending-cache `Notify`.
    async fn refresh_keys(&self, state: &Arc<ExchangeState>) -> Result<()> {
        let notify = {
            let mut inflight = self.inflight.lock().await;
            let key = url_key(&state.url);
            if let Some(existing) = inflight.get(&key) {
                Some(existing.clone())
            } else {
                let notify = Arc::new(tokio::sync::Notify::new());
                inflight.insert(key, notify.clone());
                None
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            return Ok(());
        }

        let result = state.client.get_keys().await;
        let key = url_key(&state.url);
        let notify = {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&key)
        };

        match result {
            Ok(body) => {
                let keys = parse_keys(&body)?;
                let wire_fees = parse_wire_fees(&body);
                *state.keys.write().await = keys;
                *state.wire_fees.write().await = wire_fees;
                *state.pending.write().await = false;
                info!(exchange = %state.url, "fetched exchange keys");
            }
            Err(e) => {
                warn!(exchange = %state.url, error = %e, "failed to fetch exchange keys");
                crate::metrics::record_key_refresh_failure(&state.url);
                if let Some(n) = notify {
                    n.notify_waiters();
                }
                return Err(e);
            }
        }
        if let Some(n) = notify {
            n.notify_waiters();
        }
        Ok(())
    }

    pub async fn keys_for(&self, url: &str) -> Option<Keys> {
        let state = self.exchanges.get(url)?;
        Some(state.keys.read().await.clone())
    }

    /// Run the periodic `/keys` refresh loop until `shutdown` fires.
    pub async fn run_refresh_loop(&self, mut shutdown: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("exchange liaison refresh loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    for state in self.exchanges.values() {
                        if let Err(e) = self.refresh_keys(state).await {
                            warn!(exchange = %state.url, error = %e, "periodic key refresh failed");
                        }
                    }
                }
            }
        }
    }
}

fn url_key(url: &str) -> [u8; 32] {
    crate::hash::hash_str(url).0
}

fn parse_keys(body: &Value) -> Result<Keys> {
    let master_pub = body
        .get("master_public_key")
        .and_then(Value::as_str)
        .and_then(|s| PublicKey32::from_base32(s).ok());

    let denominations: Vec<DenominationInfo> = body
        .get("denoms")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|d| {
                    Some(DenominationInfo {
                        denom_pub_hash: PublicKey32::from_base32(
                            d.get("denom_pub_hash")?.as_str()?,
                        )
                        .ok()?,
                        value: d.get("value")?.as_str()?.parse().ok()?,
                        fee_deposit: d.get("fee_deposit")?.as_str()?.parse().ok()?,
                        fee_refund: d.get("fee_refund")?.as_str()?.parse().ok()?,
                        expire_deposit: d
                            .get("stamp_expire_deposit")?
                            .as_str()
                            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                            .map(|dt| dt.with_timezone(&Utc))?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let auditors = body
        .get("auditors")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|a| {
                    let auditor_pub = PublicKey32::from_base32(a.get("auditor_pub")?.as_str()?).ok()?;
                    let keys = a.get("denomination_keys")?.as_array()?;
                    Some(keys.iter().filter_map(move |k| {
                        let denom_key_hash = PublicKey32::from_base32(k.as_str()?).ok()?;
                        Some(crate::auditors::AuditorVouch {
                            auditor_pub,
                            denom_key_hash,
                        })
                    }))
                })
                .flatten()
                .collect()
        })
        .unwrap_or_default();

    Ok(Keys {
        master_pub,
        denominations,
        auditors,
    })
}

fn parse_wire_fees(body: &Value) -> HashMap<String, Amount> {
    let mut out = HashMap::new();
    if let Some(wire_fees) = body.get("wire_fees").and_then(Value::as_object) {
        for (method, fee) in wire_fees {
            if let Some(amount) = fee.get("wire_fee").and_then(Value::as_str) {
                if let Ok(amount) = amount.parse() {
                    out.insert(method.clone(), amount);
                }
            }
        }
    }
    out
}

/// Minimal cooperative cancellation token, avoiding a dependency on
/// `tokio-util` (not part of the teacher's stack) for the one primitive
/// `find_exchange` needs: idempotent, synchronous cancel that never invokes
/// a pending continuation (spec §5).
pub mod tokio_util_shim {
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    pub struct CancellationToken {
        inner: Arc<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        cancelled: std::sync::atomic::AtomicBool,
        notify: Notify,
    }

    impl CancellationToken {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.inner
                .cancelled
                .store(true, std::sync::atomic::Ordering::SeqCst);
            self.inner.notify.notify_waiters();
        }

        pub fn is_cancelled(&self) -> bool {
            self.inner.cancelled.load(std::sync::atomic::Ordering::SeqCst)
        }

        pub async fn cancelled(&self) {
            if self.is_cancelled() {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_url_is_not_in_trust_set() {
        let liaison = ExchangeLiaison {
            exchanges: HashMap::new(),
            inflight: Mutex::new(BoundedPendingCache::new(16, 60)),
        };
        assert!(!liaison.is_trusted("https://unknown.example"));
    }

    #[tokio::test]
    async fn find_exchange_rejects_unknown_url() {
        let liaison = ExchangeLiaison {
            exchanges: HashMap::new(),
            inflight: Mutex::new(BoundedPendingCache::new(16, 60)),
        };
        let cancel = tokio_util_shim::CancellationToken::new();
        let outcome = liaison
            .find_exchange(
                "https://unknown.example",
                None,
                Duration::from_secs(1),
                &cancel,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FindExchangeOutcome::NotAcceptable));
    }

    #[test]
    fn cancellation_token_is_idempotent() {
        let token = tokio_util_shim::CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }
}
