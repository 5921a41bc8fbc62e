//! HTTP handlers (spec §6). Each one parses its request, delegates to the
//! relevant subsystem, and lets `ApiError`'s `IntoResponse` impl render the
//! `{code, hint}` error shape on failure.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::db;
use crate::error::ApiError;
use crate::hash::hash_str;
use crate::pay::{Orchestrator, PayRequest};
use crate::track_transfer;

use super::state::SharedState;

pub async fn index(State(state): State<SharedState>) -> Json<Value> {
    Json(json!({
        "name": "taler-merchant-core",
        "currency": state.config.merchant.currency,
        "instances": state.registry.iterate().map(|i| i.id.clone()).collect::<Vec<_>>(),
    }))
}

pub async fn metrics() -> Response {
    (
        [("content-type", "text/plain; charset=utf-8")],
        crate::metrics::encode(),
    )
        .into_response()
}

#[derive(Deserialize)]
pub struct InstanceQuery {
    pub instance: Option<String>,
}

/// `POST /proposal`: sign a merchant-supplied order into contract terms.
pub async fn post_proposal(
    State(state): State<SharedState>,
    Json(order): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let signed = crate::proposal::sign_proposal(
        &state.pool,
        &state.registry,
        &state.auditors,
        &state.liaison,
        order,
    )
    .await?;

    if let Some(instance_id) = signed
        .data
        .get("merchant")
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
    {
        crate::metrics::record_proposal_signed(instance_id);
    }

    Ok(Json(json!({
        "contract_terms": signed.data,
        "sig": String::from(signed.merchant_sig),
        "h_contract_terms": signed.hash.to_base32(),
    })))
}

#[derive(Deserialize)]
pub struct ProposalLookupQuery {
    pub transaction_id: String,
}

/// `GET /proposal?transaction_id=`: retrieve a previously signed proposal.
pub async fn get_proposal(
    State(state): State<SharedState>,
    Query(q): Query<ProposalLookupQuery>,
) -> Result<Json<Value>, ApiError> {
    let h_transaction_id = hash_str(&q.transaction_id).to_base32();
    let row = db::find_proposal_by_transaction_id(&state.pool, &h_transaction_id)
        .await
        .map_err(db_err)?
        .ok_or(ApiError::ProposalLookupNotFound)?;

    Ok(Json(json!({
        "contract_terms": row.contract_terms,
        "h_contract_terms": row.h_contract_terms,
        "paid": row.paid,
    })))
}

/// `POST /pay`: drive one /pay request through the orchestrator, covering
/// both the `pay` and `abort-refund` modes (spec §4.5.1).
pub async fn post_pay(
    State(state): State<SharedState>,
    Query(q): Query<InstanceQuery>,
    Json(request): Json<PayRequest>,
) -> Result<Json<Value>, ApiError> {
    let orchestrator = Orchestrator {
        pool: &state.pool,
        registry: &state.registry,
        auditors: &state.auditors,
        liaison: &state.liaison,
        instance_id: q.instance.as_deref(),
    };
    let outcome = orchestrator.run(request).await?;
    Ok(Json(outcome.body))
}

#[derive(Deserialize)]
pub struct CheckPaymentQuery {
    pub order_id: String,
    pub instance: Option<String>,
}

/// `GET /check-payment`: poll whether an order has been paid yet, without
/// triggering any exchange interaction (spec §6).
pub async fn check_payment(
    State(state): State<SharedState>,
    Query(q): Query<CheckPaymentQuery>,
) -> Result<Json<Value>, ApiError> {
    let instance = state
        .registry
        .lookup_by_id(q.instance.as_deref())
        .ok_or_else(|| ApiError::InstanceUnknown(q.instance.clone().unwrap_or_default()))?;
    let merchant_pub = instance.public_key().to_base32();

    let (contract_terms, _) = db::find_contract_terms(&state.pool, &q.order_id, &merchant_pub)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::OrderUnknown(q.order_id.clone()))?;

    let h_contract_terms = crate::hash::hash_json_canonical(&contract_terms)
        .map_err(|_| ApiError::CryptoError)?
        .to_base32();
    let paid = db::find_paid_contract_terms_from_hash(&state.pool, &h_contract_terms, &merchant_pub)
        .await
        .map_err(db_err)?
        .is_some();

    Ok(Json(json!({ "paid": paid, "order_id": q.order_id })))
}

#[derive(Deserialize)]
pub struct TrackTransferQuery {
    pub exchange_url: String,
    pub wtid: String,
    pub instance: Option<String>,
}

/// `GET /track/transfer`: reconcile one exchange-issued wire transfer (spec §4.6).
pub async fn get_track_transfer(
    State(state): State<SharedState>,
    Query(q): Query<TrackTransferQuery>,
) -> Result<Json<Value>, ApiError> {
    let report = track_transfer::track_transfer(
        &state.pool,
        &state.registry,
        &state.liaison,
        q.instance.as_deref(),
        &q.exchange_url,
        &q.wtid,
    )
    .await?;

    Ok(Json(json!({
        "wtid": report.wtid,
        "execution_time": report.execution_time.to_rfc3339(),
        "total": report.total.to_string(),
        "wire_fee": report.wire_fee.to_string(),
        "deposits_sums": report.deposits_sums.into_iter()
            .map(|(h, amount)| json!({"h_contract_terms": h, "amount": amount.to_string()}))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
pub struct TrackTransactionQuery {
    pub h_contract_terms: String,
    pub coin_pub: String,
    pub instance: Option<String>,
}

/// `GET /track/transaction`: find which wtid (if any) covers one deposit.
pub async fn get_track_transaction(
    State(state): State<SharedState>,
    Query(q): Query<TrackTransactionQuery>,
) -> Result<Json<Value>, ApiError> {
    let report = track_transfer::track_transaction(
        &state.pool,
        &state.registry,
        &state.liaison,
        q.instance.as_deref(),
        &q.h_contract_terms,
        &q.coin_pub,
    )
    .await?;

    match report {
        Some(report) => Ok(Json(json!({
            "wtid": report.wtid,
            "execution_time": report.execution_time.to_rfc3339(),
        }))),
        None => Err(ApiError::ProposalLookupNotFound),
    }
}

/// `POST /refund`: merchant-initiated refund on an already-paid order,
/// routed through the same increase-refund path the abort-refund flow uses.
pub async fn post_refund(
    State(state): State<SharedState>,
    Query(q): Query<InstanceQuery>,
    Json(body): Json<RefundRequest>,
) -> Result<Json<Value>, ApiError> {
    let instance = state
        .registry
        .lookup_by_id(q.instance.as_deref())
        .ok_or_else(|| ApiError::InstanceUnknown(q.instance.clone().unwrap_or_default()))?;
    let merchant_pub = instance.public_key().to_base32();

    let (contract_terms, _) = db::find_contract_terms(&state.pool, &body.order_id, &merchant_pub)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::OrderUnknown(body.order_id.clone()))?;
    let h_contract_terms = crate::hash::hash_json_canonical(&contract_terms)
        .map_err(|_| ApiError::CryptoError)?;
    let h_hex = h_contract_terms.to_base32();

    let payments = db::find_payments(&state.pool, &h_hex, &merchant_pub)
        .await
        .map_err(db_err)?;

    let mut permissions = Vec::new();
    for payment in &payments {
        db::increase_refund_for_contract(
            &state.pool,
            &h_hex,
            &merchant_pub,
            &payment.coin_pub,
            &body.refund_amount,
            "0",
            &body.reason,
        )
        .await
        .map_err(db_err)?;

        let sig = instance.keypair().sign(
            crate::types::SignaturePurpose::MerchantRefund,
            &h_contract_terms.0,
        );
        permissions.push(json!({
            "coin_pub": payment.coin_pub,
            "refund_amount": body.refund_amount,
            "merchant_sig": String::from(sig),
        }));
    }

    Ok(Json(json!({ "refund_permissions": permissions })))
}

#[derive(Deserialize)]
pub struct RefundRequest {
    pub order_id: String,
    pub refund_amount: String,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct RefundLookupQuery {
    pub order_id: String,
    pub instance: Option<String>,
}

/// `GET /refund`: list previously granted refunds for an order.
pub async fn get_refund(
    State(state): State<SharedState>,
    Query(q): Query<RefundLookupQuery>,
) -> Result<Json<Value>, ApiError> {
    let instance = state
        .registry
        .lookup_by_id(q.instance.as_deref())
        .ok_or_else(|| ApiError::InstanceUnknown(q.instance.clone().unwrap_or_default()))?;
    let merchant_pub = instance.public_key().to_base32();

    let (contract_terms, _) = db::find_contract_terms(&state.pool, &q.order_id, &merchant_pub)
        .await
        .map_err(db_err)?
        .ok_or_else(|| ApiError::OrderUnknown(q.order_id.clone()))?;
    let h_hex = crate::hash::hash_json_canonical(&contract_terms)
        .map_err(|_| ApiError::CryptoError)?
        .to_base32();

    let refunds = db::get_refunds_from_contract_terms_hash(&state.pool, &merchant_pub, &h_hex)
        .await
        .map_err(db_err)?;

    Ok(Json(json!({
        "refunds": refunds.into_iter().map(|r| json!({
            "coin_pub": r.coin_pub,
            "rtransaction_id": r.rtransaction_id,
            "refund_amount": r.refund_amount,
            "justification": r.justification,
        })).collect::<Vec<_>>(),
    })))
}

fn db_err(e: db::DbError) -> ApiError {
    match e {
        db::DbError::Soft => ApiError::DatabaseError(eyre::eyre!("transient database conflict")),
        db::DbError::Hard(err) => ApiError::DatabaseError(err.into()),
    }
}

/// Build the `taler://pay/...` payment URI spec §6 defines:
/// `taler://pay/<host>/<uri-path-or-"-">/<instance-or-"-">/<order-id>[/<session-id>][?insecure=1]`.
pub fn build_pay_uri(
    host: &str,
    uri_path: Option<&str>,
    instance_id: &str,
    order_id: &str,
    session_id: Option<&str>,
    insecure: bool,
) -> String {
    let mut uri = format!(
        "taler://pay/{}/{}/{}/{}",
        host,
        uri_path.filter(|p| !p.is_empty()).unwrap_or("-"),
        if instance_id.eq_ignore_ascii_case("default") {
            "-"
        } else {
            instance_id
        },
        order_id,
    );
    if let Some(session_id) = session_id {
        uri.push('/');
        uri.push_str(session_id);
    }
    if insecure {
        uri.push_str("?insecure=1");
    }
    uri
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pay_uri_uses_dash_placeholders_for_default_instance_and_path() {
        let uri = build_pay_uri("shop.example", None, "default", "order-1", None, false);
        assert_eq!(uri, "taler://pay/shop.example/-/-/order-1");
    }

    #[test]
    fn pay_uri_includes_session_and_insecure_flag() {
        let uri = build_pay_uri(
            "shop.example",
            Some("backend"),
            "books",
            "order-2",
            Some("sess-1"),
            true,
        );
        assert_eq!(
            uri,
            "taler://pay/shop.example/backend/books/order-2/sess-1?insecure=1"
        );
    }
}
