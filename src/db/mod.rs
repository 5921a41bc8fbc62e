#![allow(dead_code)]

//! Database surface (spec §4.7).
//!
//! Free functions per query, the teacher's own style: each takes `&PgPool`
//! and returns `Result<T, DbError>`, where `DbError` distinguishes
//! soft (serialization conflict, retry), hard (fatal), and absent
//! (not found) outcomes — generalized from `writers/retry.rs::classify_error`,
//! which classified stringified RPC errors, to `sqlx::Error`'s Postgres
//! SQLSTATE codes.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::future::Future;
use thiserror::Error;
use tracing::warn;

pub mod models;

pub use models::*;

/// A query either succeeds, is absent (not found, distinct from an error),
/// or errors as soft (retryable) or hard (fatal) per spec §4.7.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("transient database conflict")]
    Soft,
    #[error("database error: {0}")]
    Hard(#[from] sqlx::Error),
}

fn classify(e: sqlx::Error) -> DbError {
    if let sqlx::Error::Database(ref db_err) = e {
        if let Some(code) = db_err.code() {
            // 40001 = serialization_failure, 40P01 = deadlock_detected.
            if code == "40001" || code == "40P01" {
                return DbError::Soft;
            }
        }
    }
    DbError::Hard(e)
}

/// Bound soft-error retries at 5 attempts, re-running the whole enclosing
/// operation from the start on each attempt (spec §4.7 / §4.5.2
/// `DB_SOFT_RETRY`). Mirrors `writers/retry.rs::with_retry`'s shape, without
/// the gas-bump fields that do not apply to a database transaction.
pub async fn with_soft_retry<F, T, Fut>(mut operation: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(v) => return Ok(v),
            Err(DbError::Soft) if attempt < MAX_ATTEMPTS => {
                attempt += 1;
                warn!(attempt, "database soft error, retrying from transaction start");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, DbError> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(DbError::Hard)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| DbError::Hard(sqlx::Error::Migrate(Box::new(e))))
}

/// `find_contract_terms(order_id, merchant_pub) -> (json, last_session_id) | Absent`
pub async fn find_contract_terms(
    pool: &PgPool,
    order_id: &str,
    merchant_pub: &str,
) -> Result<Option<(Value, Option<String>)>, DbError> {
    let row = sqlx::query(
        "SELECT contract_terms, last_session_id FROM proposals WHERE order_id = $1 AND merchant_pub = $2",
    )
    .bind(order_id)
    .bind(merchant_pub)
    .fetch_optional(pool)
    .await
    .map_err(classify)?;

    Ok(row.map(|r| (r.get("contract_terms"), r.get("last_session_id"))))
}

/// `find_proposal_by_transaction_id(h_tid) -> ProposalRow | Absent`, the
/// lookup `GET /proposal?transaction_id=` needs: proposals are keyed by a
/// hash of the caller-supplied transaction-id string, never the string
/// itself (spec §4.4 step 6).
pub async fn find_proposal_by_transaction_id(
    pool: &PgPool,
    h_transaction_id: &str,
) -> Result<Option<ProposalRow>, DbError> {
    sqlx::query_as::<_, ProposalRow>(
        "SELECT * FROM proposals WHERE h_transaction_id = $1",
    )
    .bind(h_transaction_id)
    .fetch_optional(pool)
    .await
    .map_err(classify)
}

/// `find_paid_contract_terms_from_hash(h, merchant_pub) -> json | Absent`
pub async fn find_paid_contract_terms_from_hash(
    pool: &PgPool,
    h_contract_terms: &str,
    merchant_pub: &str,
) -> Result<Option<Value>, DbError> {
    let row = sqlx::query(
        "SELECT contract_terms FROM proposals WHERE h_contract_terms = $1 AND merchant_pub = $2 AND paid",
    )
    .bind(h_contract_terms)
    .bind(merchant_pub)
    .fetch_optional(pool)
    .await
    .map_err(classify)?;

    Ok(row.map(|r| r.get("contract_terms")))
}

/// `insert_proposal_data(h_tid, order_json)`
pub async fn insert_proposal_data(pool: &PgPool, h_transaction_id: &crate::types::HashCode, order: &Value) -> Result<(), DbError> {
    let order_id = order
        .get("order_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let merchant_pub = order
        .get("merchant_pub")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let h_contract_terms = crate::hash::hash_json_canonical(order)
        .map(|h| h.to_base32())
        .unwrap_or_default();

    sqlx::query(
        "INSERT INTO proposals (h_transaction_id, order_id, merchant_pub, contract_terms, h_contract_terms, paid)
         VALUES ($1, $2, $3, $4, $5, false)
         ON CONFLICT (h_transaction_id) DO NOTHING",
    )
    .bind(h_transaction_id.to_base32())
    .bind(order_id)
    .bind(merchant_pub)
    .bind(order)
    .bind(h_contract_terms)
    .execute(pool)
    .await
    .map_err(classify)?;

    Ok(())
}

/// `mark_proposal_paid(h_contract_terms, merchant_pub, session_id)`
///
/// At-most-once per `(order_id, merchant_pub)` (spec §8 invariant): the
/// `WHERE NOT paid` guard makes a second call a no-op rather than a second
/// commit.
pub async fn mark_proposal_paid(
    pool: &PgPool,
    h_contract_terms: &str,
    merchant_pub: &str,
    session_id: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE proposals SET paid = true, last_session_id = $3
         WHERE h_contract_terms = $1 AND merchant_pub = $2 AND NOT paid",
    )
    .bind(h_contract_terms)
    .bind(merchant_pub)
    .bind(session_id)
    .execute(pool)
    .await
    .map_err(classify)?;

    Ok(())
}

/// `find_payments(h_contract_terms, merchant_pub) -> PaidCoinRecord*`
pub async fn find_payments(
    pool: &PgPool,
    h_contract_terms: &str,
    merchant_pub: &str,
) -> Result<Vec<PaidCoinRow>, DbError> {
    sqlx::query_as::<_, PaidCoinRow>(
        "SELECT * FROM paid_coins WHERE h_contract_terms = $1 AND merchant_pub = $2",
    )
    .bind(h_contract_terms)
    .bind(merchant_pub)
    .fetch_all(pool)
    .await
    .map_err(classify)
}

/// `find_payments_by_hash_and_coin(h, merchant_pub, coin_pub) -> PaidCoinRecord | Absent`
pub async fn find_payments_by_hash_and_coin(
    pool: &PgPool,
    h_contract_terms: &str,
    merchant_pub: &str,
    coin_pub: &str,
) -> Result<Option<PaidCoinRow>, DbError> {
    sqlx::query_as::<_, PaidCoinRow>(
        "SELECT * FROM paid_coins WHERE h_contract_terms = $1 AND merchant_pub = $2 AND coin_pub = $3",
    )
    .bind(h_contract_terms)
    .bind(merchant_pub)
    .bind(coin_pub)
    .fetch_optional(pool)
    .await
    .map_err(classify)
}

/// `store_deposit(...)`. At-most-once per `(h_contract_terms, coin_pub)`
/// (spec §8 invariant).
pub async fn store_deposit(pool: &PgPool, deposit: &NewPaidCoin<'_>) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO paid_coins (h_contract_terms, merchant_pub, coin_pub, exchange_url,
            amount_with_fee, deposit_fee, refund_fee, wire_fee, exchange_sign_key, proof)
         VALUES ($1, $2, $3, $4, $5::NUMERIC, $6::NUMERIC, $7::NUMERIC, $8::NUMERIC, $9, $10)
         ON CONFLICT (h_contract_terms, coin_pub) DO NOTHING",
    )
    .bind(deposit.h_contract_terms)
    .bind(deposit.merchant_pub)
    .bind(deposit.coin_pub)
    .bind(deposit.exchange_url)
    .bind(deposit.amount_with_fee)
    .bind(deposit.deposit_fee)
    .bind(deposit.refund_fee)
    .bind(deposit.wire_fee)
    .bind(deposit.exchange_sign_key)
    .bind(deposit.proof)
    .execute(pool)
    .await
    .map_err(classify)?;

    Ok(())
}

/// `get_refunds_from_contract_terms_hash(merchant_pub, h) -> Refund*`
pub async fn get_refunds_from_contract_terms_hash(
    pool: &PgPool,
    merchant_pub: &str,
    h_contract_terms: &str,
) -> Result<Vec<RefundRow>, DbError> {
    sqlx::query_as::<_, RefundRow>(
        "SELECT * FROM refunds WHERE merchant_pub = $1 AND h_contract_terms = $2 ORDER BY rtransaction_id",
    )
    .bind(merchant_pub)
    .bind(h_contract_terms)
    .fetch_all(pool)
    .await
    .map_err(classify)
}

/// `increase_refund_for_contract(h, merchant_pub, amount, justification)`.
/// Caller is responsible for enforcing the "sum of refunds never exceeds
/// sum of amounts_with_fee" invariant (spec §3) before calling this.
pub async fn increase_refund_for_contract(
    pool: &PgPool,
    h_contract_terms: &str,
    merchant_pub: &str,
    coin_pub: &str,
    refund_amount: &str,
    refund_fee: &str,
    justification: &str,
) -> Result<(), DbError> {
    let row = sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(rtransaction_id), 0) + 1 FROM refunds WHERE h_contract_terms = $1 AND coin_pub = $2",
    )
    .bind(h_contract_terms)
    .bind(coin_pub)
    .fetch_one(pool)
    .await
    .map_err(classify)?;

    sqlx::query(
        "INSERT INTO refunds (h_contract_terms, merchant_pub, coin_pub, rtransaction_id, refund_amount, refund_fee, justification)
         VALUES ($1, $2, $3, $4, $5::NUMERIC, $6::NUMERIC, $7)",
    )
    .bind(h_contract_terms)
    .bind(merchant_pub)
    .bind(coin_pub)
    .bind(row)
    .bind(refund_amount)
    .bind(refund_fee)
    .bind(justification)
    .execute(pool)
    .await
    .map_err(classify)?;

    Ok(())
}

/// `lookup_wire_fee(master_pub, wire_method, execution_time) -> fee row | Absent`
pub async fn lookup_wire_fee(
    pool: &PgPool,
    master_pub: &str,
    wire_method: &str,
    execution_time: DateTime<Utc>,
) -> Result<Option<WireFeeRow>, DbError> {
    sqlx::query_as::<_, WireFeeRow>(
        "SELECT * FROM wire_fees WHERE master_pub = $1 AND wire_method = $2
         AND start_date <= $3 AND $3 < end_date",
    )
    .bind(master_pub)
    .bind(wire_method)
    .bind(execution_time)
    .fetch_optional(pool)
    .await
    .map_err(classify)
}

/// `store_transfer_to_proof(url, wtid, execution_time, exchange_pub, json)`.
/// Must commit strictly before any `store_coin_to_transfer` for the same
/// wtid (spec §5 ordering guarantee c) — callers sequence the two calls.
pub async fn store_transfer_to_proof(pool: &PgPool, proof: &NewTransferProof<'_>) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO transfer_proofs (exchange_url, wtid, execution_time, exchange_sign_key, proof)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (exchange_url, wtid) DO NOTHING",
    )
    .bind(proof.exchange_url)
    .bind(proof.wtid)
    .bind(proof.execution_time)
    .bind(proof.exchange_sign_key)
    .bind(proof.proof)
    .execute(pool)
    .await
    .map_err(classify)?;

    Ok(())
}

/// `store_coin_to_transfer(h_contract_terms, coin_pub, wtid)`
pub async fn store_coin_to_transfer(
    pool: &PgPool,
    h_contract_terms: &str,
    coin_pub: &str,
    wtid: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO coin_to_transfer (h_contract_terms, coin_pub, wtid)
         VALUES ($1, $2, $3)
         ON CONFLICT (h_contract_terms, coin_pub) DO NOTHING",
    )
    .bind(h_contract_terms)
    .bind(coin_pub)
    .bind(wtid)
    .execute(pool)
    .await
    .map_err(classify)?;

    Ok(())
}

/// `find_proof_by_wtid(url, wtid) -> hit/miss`
pub async fn find_proof_by_wtid(
    pool: &PgPool,
    exchange_url: &str,
    wtid: &str,
) -> Result<Option<TransferProofRow>, DbError> {
    sqlx::query_as::<_, TransferProofRow>(
        "SELECT * FROM transfer_proofs WHERE exchange_url = $1 AND wtid = $2",
    )
    .bind(exchange_url)
    .bind(wtid)
    .fetch_optional(pool)
    .await
    .map_err(classify)
}

/// `find_session_info(session_id, fulfillment_url, merchant_pub) -> order_id | Absent`
pub async fn find_session_info(
    pool: &PgPool,
    session_id: &str,
    fulfillment_url: &str,
    merchant_pub: &str,
) -> Result<Option<String>, DbError> {
    let row = sqlx::query(
        "SELECT order_id FROM session_bindings WHERE session_id = $1 AND fulfillment_url = $2 AND merchant_pub = $3",
    )
    .bind(session_id)
    .bind(fulfillment_url)
    .bind(merchant_pub)
    .fetch_optional(pool)
    .await
    .map_err(classify)?;

    Ok(row.map(|r| r.get("order_id")))
}

/// `find_proof_by_wtid_any(wtid) -> hit/miss`, used when the caller only
/// knows the wtid (e.g. via `coin_to_transfer`) and not which exchange
/// issued it. Wtids are exchange-issued 32-byte identifiers, unique in
/// practice across the trusted set.
pub async fn find_proof_by_wtid_any(
    pool: &PgPool,
    wtid: &str,
) -> Result<Option<TransferProofRow>, DbError> {
    sqlx::query_as::<_, TransferProofRow>("SELECT * FROM transfer_proofs WHERE wtid = $1")
        .bind(wtid)
        .fetch_optional(pool)
        .await
        .map_err(classify)
}

/// Look up which `(h_contract_terms, coin_pub)` pairs within `coin_pubs`
/// already have a `PaidCoinRow`, used by the pay orchestrator's GROUPED
/// state (spec §4.5.2) to separate already-paid coins from new ones.
pub async fn find_existing_payments(
    pool: &PgPool,
    h_contract_terms: &str,
    merchant_pub: &str,
    coin_pubs: &[String],
) -> Result<Vec<PaidCoinRow>, DbError> {
    sqlx::query_as::<_, PaidCoinRow>(
        "SELECT * FROM paid_coins WHERE h_contract_terms = $1 AND merchant_pub = $2 AND coin_pub = ANY($3)",
    )
    .bind(h_contract_terms)
    .bind(merchant_pub)
    .bind(coin_pubs)
    .fetch_all(pool)
    .await
    .map_err(classify)
}
