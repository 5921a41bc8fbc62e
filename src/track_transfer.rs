//! Track-transfer reconciler (spec §4.6), with `/track/transaction` as a
//! thin wrapper over the same logic (spec §9 Open Question: the original's
//! `/track/transaction` path was itself incomplete, so this crate treats
//! §4.6 as the canonical algorithm and derives the transaction-level view
//! from it rather than duplicating it).

use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::db::{self, DbError};
use crate::error::ApiError;
use crate::exchange::liaison::tokio_util_shim::CancellationToken;
use crate::exchange::ExchangeLiaison;
use crate::instance_registry::InstanceRegistry;
use crate::types::Amount;

/// Deadline for the exchange `/transfer` round trip (spec §5).
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TrackTransferReport {
    pub wtid: String,
    pub execution_time: chrono::DateTime<chrono::Utc>,
    pub total: Amount,
    pub wire_fee: Amount,
    /// `h_contract_terms -> sum(amount_with_fee)` over the deposits this wtid covers.
    pub deposits_sums: Vec<(String, Amount)>,
}

/// Run the 7-step reconciliation of spec §4.6 for one `(exchange_url, wtid)`.
pub async fn track_transfer(
    pool: &sqlx::PgPool,
    registry: &InstanceRegistry,
    liaison: &ExchangeLiaison,
    instance_id: Option<&str>,
    exchange_url: &str,
    wtid: &str,
) -> Result<TrackTransferReport, ApiError> {
    let instance = registry
        .lookup_by_id(instance_id)
        .ok_or_else(|| ApiError::InstanceUnknown(instance_id.unwrap_or("default").to_string()))?;

    // 1. Instance lookup already done above.

    // 2. Cached proof check: if we already have a signed TransferProof for
    // this (exchange_url, wtid), skip the exchange round trip entirely.
    let cached = db::find_proof_by_wtid(pool, exchange_url, wtid)
        .await
        .map_err(db_err)?;

    let (proof_json, execution_time) = match cached {
        Some(row) => (row.proof, row.execution_time),
        None => {
            // 3. Fetch /transfer from the exchange, bounded by TRANSFER_TIMEOUT.
            if !liaison.is_trusted(exchange_url) {
                return Err(ApiError::ExchangeRejected);
            }
            let cancel = CancellationToken::new();
            let body = tokio::time::timeout(
                TRANSFER_TIMEOUT,
                fetch_transfer(liaison, exchange_url, wtid, &cancel),
            )
            .await
            .map_err(|_| ApiError::ExchangeTimeout)??;

            let execution_time = body
                .get("execution_time")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .ok_or(ApiError::ExchangeError {
                    details: body.clone(),
                })?;

            let exchange_sign_key = body
                .get("exchange_pub")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            // 4. Persist before validating the contents (spec §5 ordering
            // guarantee: a transfer proof is durable before it is trusted).
            db::store_transfer_to_proof(
                pool,
                &db::NewTransferProof {
                    exchange_url,
                    wtid,
                    execution_time,
                    exchange_sign_key: &exchange_sign_key,
                    proof: &body,
                },
            )
            .await
            .map_err(db_err)?;

            (body, execution_time)
        }
    };

    let master_key = liaison
        .master_key_for(exchange_url)
        .ok_or(ApiError::ExchangeRejected)?;

    let total: Amount = proof_json
        .get("total")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::ExchangeError {
            details: proof_json.clone(),
        })?;
    let wire_fee: Amount = proof_json
        .get("wire_fee")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::ExchangeError {
            details: proof_json.clone(),
        })?;

    // 5. Cross-check the claimed wire fee against the locally cached fee
    // table; disagreement is a BadWireFee, never silently accepted.
    if let Some(local_fee) = db::lookup_wire_fee(
        pool,
        &master_key.to_base32(),
        &instance
            .preferred_wire_method()
            .map(|m| m.name.clone())
            .unwrap_or_default(),
        execution_time,
    )
    .await
    .map_err(db_err)?
    {
        let local: Amount = local_fee
            .wire_fee
            .parse()
            .map_err(|_| ApiError::CryptoError)?;
        // Only a claimed fee exceeding the published schedule is rejected
        // (spec §4.6 step 5); a lower claimed fee is accepted outright.
        match wire_fee.partial_cmp(&local) {
            Some(std::cmp::Ordering::Greater) => {
                return Err(ApiError::BadWireFee {
                    details: json!({"claimed": wire_fee.to_string(), "expected": local.to_string()}),
                });
            }
            Some(_) => {}
            None => return Err(ApiError::WireFeeCurrencyMismatch),
        }
    }

    // 6. Per-deposit cross-check: every coin listed must match a deposit we
    // ourselves recorded, with matching exchange signature; disagreement is
    // a ConflictingReports, not a best-effort merge.
    let deposits = proof_json
        .get("deposits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut sums: std::collections::BTreeMap<String, Amount> = std::collections::BTreeMap::new();
    for deposit in &deposits {
        let coin_pub = deposit
            .get("coin_pub")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::ExchangeError {
                details: deposit.clone(),
            })?;
        let h_contract_terms = deposit
            .get("h_contract_terms")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::ExchangeError {
                details: deposit.clone(),
            })?;
        let claimed_amount: Amount = deposit
            .get("deposit_value")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ApiError::ExchangeError {
                details: deposit.clone(),
            })?;
        let claimed_deposit_fee: Amount = deposit
            .get("deposit_fee")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ApiError::ExchangeError {
                details: deposit.clone(),
            })?;

        let merchant_pub = instance.public_key().to_base32();
        let recorded = db::find_payments_by_hash_and_coin(
            pool,
            h_contract_terms,
            &merchant_pub,
            coin_pub,
        )
        .await
        .map_err(db_err)?;

        match recorded {
            Some(row) => {
                let recorded_amount: Amount =
                    row.amount_with_fee.parse().map_err(|_| ApiError::CryptoError)?;
                let recorded_deposit_fee: Amount =
                    row.deposit_fee.parse().map_err(|_| ApiError::CryptoError)?;
                if recorded_amount.partial_cmp(&claimed_amount) != Some(std::cmp::Ordering::Equal)
                    || recorded_deposit_fee.partial_cmp(&claimed_deposit_fee)
                        != Some(std::cmp::Ordering::Equal)
                {
                    return Err(ApiError::ConflictingReports {
                        details: json!({
                            "coin_pub": coin_pub,
                            "recorded": recorded_amount.to_string(),
                            "claimed": claimed_amount.to_string(),
                            "recorded_deposit_fee": recorded_deposit_fee.to_string(),
                            "claimed_deposit_fee": claimed_deposit_fee.to_string(),
                        }),
                    });
                }
            }
            None => {
                // No local deposit record for this coin: the exchange is
                // reporting money paid out that we never submitted a deposit
                // for. Spec §4.6 step 6: log and accept ("thanks for the
                // money") rather than reject a legitimate transfer.
                warn!(
                    coin_pub,
                    h_contract_terms, "transfer covers a deposit with no local record; accepting"
                );
            }
        }

        db::store_coin_to_transfer(pool, h_contract_terms, coin_pub, wtid)
            .await
            .map_err(db_err)?;

        let entry = sums
            .entry(h_contract_terms.to_string())
            .or_insert(Amount::zero(claimed_amount.currency()).map_err(|_| ApiError::CryptoError)?);
        *entry = entry.checked_add(&claimed_amount).map_err(|_| ApiError::CryptoError)?;
    }

    // 7. Transform into deposits_sums grouped by h_contract_terms.
    crate::metrics::record_transfer_reconciliation("ok");
    Ok(TrackTransferReport {
        wtid: wtid.to_string(),
        execution_time,
        total,
        wire_fee,
        deposits_sums: sums.into_iter().collect(),
    })
}

/// `/track/transaction`: look up which wtid (if any) covers one deposit, by
/// reusing the same reconciliation path rather than a parallel, independently
/// maintained query surface.
pub async fn track_transaction(
    pool: &sqlx::PgPool,
    registry: &InstanceRegistry,
    liaison: &ExchangeLiaison,
    instance_id: Option<&str>,
    h_contract_terms: &str,
    coin_pub: &str,
) -> Result<Option<TrackTransferReport>, ApiError> {
    let instance = registry
        .lookup_by_id(instance_id)
        .ok_or_else(|| ApiError::InstanceUnknown(instance_id.unwrap_or("default").to_string()))?;
    let merchant_pub = instance.public_key().to_base32();

    let payment = db::find_payments_by_hash_and_coin(pool, h_contract_terms, &merchant_pub, coin_pub)
        .await
        .map_err(db_err)?;
    let Some(_) = payment else {
        return Ok(None);
    };

    let coin_to_wtid = sqlx::query_scalar::<_, String>(
        "SELECT wtid FROM coin_to_transfer WHERE h_contract_terms = $1 AND coin_pub = $2",
    )
    .bind(h_contract_terms)
    .bind(coin_pub)
    .fetch_optional(pool)
    .await
    .map_err(|e| ApiError::DatabaseError(e.into()))?;

    let Some(wtid) = coin_to_wtid else {
        return Ok(None);
    };

    let proof = db::find_proof_by_wtid_any(pool, &wtid).await.map_err(db_err)?;
    let Some(proof) = proof else { return Ok(None) };

    track_transfer(
        pool,
        registry,
        liaison,
        instance_id,
        &proof.exchange_url,
        &wtid,
    )
    .await
    .map(Some)
}

async fn fetch_transfer(
    liaison: &ExchangeLiaison,
    exchange_url: &str,
    wtid: &str,
    cancel: &CancellationToken,
) -> Result<Value, ApiError> {
    // find_exchange ensures /keys are warm before we trust the exchange's
    // /transfer signature against a cached master key.
    liaison
        .find_exchange(exchange_url, None, TRANSFER_TIMEOUT, cancel)
        .await
        .map_err(|_| ApiError::ExchangeNotReachable)?;

    let client = crate::exchange::client::ExchangeClient::new(exchange_url.to_string())
        .map_err(|_| ApiError::ExchangeNotReachable)?;
    let (status, body) = client
        .get_transfer(wtid)
        .await
        .map_err(|_| ApiError::ExchangeNotReachable)?;
    if status != 200 {
        return Err(ApiError::ExchangeError { details: body });
    }
    Ok(body)
}

fn db_err(e: DbError) -> ApiError {
    match e {
        DbError::Soft => ApiError::DatabaseError(eyre::eyre!("transient database conflict")),
        DbError::Hard(err) => ApiError::DatabaseError(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deposit_sums_group_by_contract_hash() {
        let mut sums: std::collections::BTreeMap<String, Amount> = std::collections::BTreeMap::new();
        let a: Amount = "CUR:1.00000000".parse().unwrap();
        let b: Amount = "CUR:2.50000000".parse().unwrap();
        let entry = sums.entry("hct1".to_string()).or_insert(Amount::zero("CUR").unwrap());
        *entry = entry.checked_add(&a).unwrap();
        let entry = sums.entry("hct1".to_string()).or_insert(Amount::zero("CUR").unwrap());
        *entry = entry.checked_add(&b).unwrap();
        assert_eq!(sums.get("hct1").unwrap(), &"CUR:3.50000000".parse::<Amount>().unwrap());
    }
}
