//! Proposal / contract-terms signer (spec §4.4).

use eyre::Result;
use serde_json::{json, Value};

use crate::auditors::AuditorTrustSet;
use crate::db;
use crate::error::ApiError;
use crate::exchange::ExchangeLiaison;
use crate::hash::hash_json_canonical;
use crate::instance_registry::InstanceRegistry;
use crate::types::{HashCode, Signature, SignaturePurpose};

pub struct SignedProposal {
    pub data: Value,
    pub merchant_sig: Signature,
    pub hash: HashCode,
}

/// Run the 7-step algorithm of spec §4.4 over a merchant-supplied `order`.
pub async fn sign_proposal(
    pool: &sqlx::PgPool,
    registry: &InstanceRegistry,
    auditors: &AuditorTrustSet,
    liaison: &ExchangeLiaison,
    mut order: Value,
) -> Result<SignedProposal, ApiError> {
    let order_obj = order
        .as_object()
        .ok_or_else(|| ApiError::ParameterMalformed("order".to_string()))?;

    let products = order_obj
        .get("products")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::ParameterMissing("products".to_string()))?;
    for product in products {
        let description = product.get("description").and_then(Value::as_str);
        if description.is_none() {
            return Err(ApiError::ParameterMalformed(
                "products[].description".to_string(),
            ));
        }
    }

    for required in ["amount", "max_fee", "transaction_id", "timestamp", "pay_deadline", "refund_deadline"] {
        if !order_obj.contains_key(required) {
            return Err(ApiError::ParameterMissing(required.to_string()));
        }
    }

    let instance_id = order_obj
        .get("merchant")
        .and_then(Value::as_object)
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str);
    let instance = registry
        .lookup_by_id(instance_id)
        .ok_or_else(|| ApiError::InstanceUnknown(instance_id.unwrap_or("default").to_string()))?;

    let h_wire = instance
        .preferred_wire_method()
        .map(|m| m.h_wire)
        .unwrap_or(HashCode([0u8; 32]));

    let transaction_id = order_obj
        .get("transaction_id")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::ParameterMalformed("transaction_id".to_string()))?
        .to_string();
    let h_transaction_id = crate::hash::hash_str(&transaction_id);

    let order_map = order.as_object_mut().expect("validated above");
    order_map.insert("exchanges".to_string(), liaison.trusted_exchanges_json());
    order_map.insert("auditors".to_string(), auditors.as_json().clone());
    order_map.insert("H_wire".to_string(), json!(h_wire.to_base32()));
    order_map.insert(
        "merchant_pub".to_string(),
        json!(instance.public_key().to_base32()),
    );

    let h_proposal = hash_json_canonical(&order).map_err(|_| ApiError::CryptoError)?;

    let purpose_payload = h_proposal.0;
    let merchant_sig = instance
        .keypair()
        .sign(SignaturePurpose::MerchantContract, &purpose_payload);

    db::insert_proposal_data(pool, &h_transaction_id, &order)
        .await
        .map_err(|e| ApiError::DatabaseError(e.into()))?;

    Ok(SignedProposal {
        data: order,
        merchant_sig,
        hash: h_proposal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_products_are_rejected() {
        let order = json!({
            "products": [{"not_description": "x"}],
            "amount": "CUR:1.0",
            "max_fee": "CUR:0.1",
            "transaction_id": "tid-1",
            "timestamp": 0,
            "pay_deadline": 0,
            "refund_deadline": 0,
        });
        let products = order.get("products").and_then(Value::as_array).unwrap();
        let bad = products
            .iter()
            .any(|p| p.get("description").and_then(Value::as_str).is_none());
        assert!(bad);
    }
}
