//! HTTP-facing error taxonomy (spec §7).
//!
//! Internal plumbing returns `eyre::Result`; everything that can reach a
//! wallet or merchant-backoffice client returns `ApiError`, which renders the
//! stable `{code, hint}` shape spec §7 requires, nesting exchange-forwarded
//! bodies under `details`/`exchange_reply` where applicable.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing parameter: {0}")]
    ParameterMissing(String),
    #[error("malformed parameter: {0}")]
    ParameterMalformed(String),
    #[error("unknown instance: {0}")]
    InstanceUnknown(String),
    #[error("unknown order: {0}")]
    OrderUnknown(String),
    #[error("unknown transaction")]
    ProposalLookupNotFound,
    #[error("wire fee currency mismatch")]
    WireFeeCurrencyMismatch,
    #[error("exchange rejected the request")]
    ExchangeRejected,
    #[error("payment insufficient")]
    PaymentInsufficient,
    #[error("payment insufficient due to fees")]
    PaymentInsufficientDueToFees,
    #[error("deposit fees exceed payment")]
    FeesExceedPayment,
    #[error("abort-refund requested on a completed payment")]
    AbortRefusedPaymentComplete,
    #[error("exchange replied with an error")]
    ExchangeError { details: Value },
    #[error("exchange signatures disagree")]
    ConflictingReports { details: Value },
    #[error("exchange claimed an excessive wire fee")]
    BadWireFee { details: Value },
    #[error("exchange request timed out")]
    ExchangeTimeout,
    #[error("exchange not reachable")]
    ExchangeNotReachable,
    #[error("database error")]
    DatabaseError(#[from] eyre::Error),
    #[error("signature or hash computation failed")]
    CryptoError,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::ParameterMissing(_) => "parameter-missing",
            ApiError::ParameterMalformed(_) => "parameter-malformed",
            ApiError::InstanceUnknown(_) => "instance-unknown",
            ApiError::OrderUnknown(_) => "order-unknown",
            ApiError::ProposalLookupNotFound => "proposal-lookup-not-found",
            ApiError::WireFeeCurrencyMismatch => "wire-fee-currency-mismatch",
            ApiError::ExchangeRejected => "exchange-rejected",
            ApiError::PaymentInsufficient => "payment-insufficient",
            ApiError::PaymentInsufficientDueToFees => "payment-insufficient-due-to-fees",
            ApiError::FeesExceedPayment => "fees-exceed-payment",
            ApiError::AbortRefusedPaymentComplete => "abort-refused-payment-complete",
            ApiError::ExchangeError { .. } => "exchange-error",
            ApiError::ConflictingReports { .. } => "conflicting-reports",
            ApiError::BadWireFee { .. } => "bad-wire-fee",
            ApiError::ExchangeTimeout => "exchange-timeout",
            ApiError::ExchangeNotReachable => "exchange-not-reachable",
            ApiError::DatabaseError(_) => "database-error",
            ApiError::CryptoError => "crypto-error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::ParameterMissing(_) | ApiError::ParameterMalformed(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::InstanceUnknown(_)
            | ApiError::OrderUnknown(_)
            | ApiError::ProposalLookupNotFound => StatusCode::NOT_FOUND,
            ApiError::WireFeeCurrencyMismatch | ApiError::ExchangeRejected => {
                StatusCode::CONFLICT
            }
            ApiError::PaymentInsufficient
            | ApiError::PaymentInsufficientDueToFees
            | ApiError::FeesExceedPayment => StatusCode::NOT_ACCEPTABLE,
            ApiError::AbortRefusedPaymentComplete => StatusCode::FORBIDDEN,
            ApiError::ExchangeError { .. }
            | ApiError::ConflictingReports { .. }
            | ApiError::BadWireFee { .. } => StatusCode::FAILED_DEPENDENCY,
            ApiError::ExchangeTimeout | ApiError::ExchangeNotReachable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::DatabaseError(_) | ApiError::CryptoError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            ApiError::ExchangeError { details }
            | ApiError::ConflictingReports { details }
            | ApiError::BadWireFee { details } => Some(details.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::warn!(error = %self, code = self.code(), "request failed");
        }
        let body = ErrorBody {
            code: self.code(),
            hint: self.to_string(),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}
