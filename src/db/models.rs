#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

// Amount fields are carried as `String` and text-cast in SQL (NUMERIC(28,8))
// to avoid BigDecimal/sqlx version conflicts, the same convention the
// original deposit models used for NUMERIC(78,0) token amounts.

/// One persisted proposal, keyed by a hash of the merchant-supplied
/// transaction-id string (spec §4.4 step 6), not the string itself.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProposalRow {
    pub h_transaction_id: String,
    pub order_id: String,
    pub merchant_pub: String,
    pub contract_terms: Value,
    pub h_contract_terms: String,
    pub paid: bool,
    pub last_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewProposal<'a> {
    pub h_transaction_id: &'a str,
    pub order_id: &'a str,
    pub merchant_pub: &'a str,
    pub contract_terms: &'a Value,
    pub h_contract_terms: &'a str,
}

/// One row per `(h_contract_terms, coin_pub)` (spec §3 PaidCoinRecord).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaidCoinRow {
    pub h_contract_terms: String,
    pub merchant_pub: String,
    pub coin_pub: String,
    pub exchange_url: String,
    pub amount_with_fee: String,
    pub deposit_fee: String,
    pub refund_fee: String,
    pub wire_fee: String,
    pub exchange_sign_key: String,
    pub proof: Value,
    pub created_at: DateTime<Utc>,
}

pub struct NewPaidCoin<'a> {
    pub h_contract_terms: &'a str,
    pub merchant_pub: &'a str,
    pub coin_pub: &'a str,
    pub exchange_url: &'a str,
    pub amount_with_fee: &'a str,
    pub deposit_fee: &'a str,
    pub refund_fee: &'a str,
    pub wire_fee: &'a str,
    pub exchange_sign_key: &'a str,
    pub proof: &'a Value,
}

/// A row per `(h_contract_terms, coin_pub, rtransaction_id)` (spec §3 Refund).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RefundRow {
    pub h_contract_terms: String,
    pub coin_pub: String,
    pub rtransaction_id: i64,
    pub refund_amount: String,
    pub refund_fee: String,
    pub justification: String,
    pub created_at: DateTime<Utc>,
}

/// A row per `(exchange_url, wtid)` (spec §3 TransferProof).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransferProofRow {
    pub exchange_url: String,
    pub wtid: String,
    pub execution_time: DateTime<Utc>,
    pub exchange_sign_key: String,
    pub proof: Value,
    pub created_at: DateTime<Utc>,
}

pub struct NewTransferProof<'a> {
    pub exchange_url: &'a str,
    pub wtid: &'a str,
    pub execution_time: DateTime<Utc>,
    pub exchange_sign_key: &'a str,
    pub proof: &'a Value,
}

/// Many-to-one `(h_contract_terms, coin_pub) -> wtid` link.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CoinToTransferRow {
    pub h_contract_terms: String,
    pub coin_pub: String,
    pub wtid: String,
}

/// `(master_pub, wire_method)` wire-fee schedule entry, with the validity
/// window and the exchange's own signature over it (spec §4.7
/// `lookup_wire_fee`).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WireFeeRow {
    pub master_pub: String,
    pub wire_method: String,
    pub wire_fee: String,
    pub closing_fee: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub master_sig: String,
}

/// Optional `(session_id, fulfillment_url, instance_pubkey) -> order_id`
/// binding (spec §3 Session binding).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SessionInfoRow {
    pub session_id: String,
    pub fulfillment_url: String,
    pub merchant_pub: String,
    pub order_id: String,
}
