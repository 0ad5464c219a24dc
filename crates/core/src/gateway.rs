//! Payment gateway contract, wire DTOs and the status vocabulary mapping.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::payment::{PaymentStatus, TransactionType};
use crate::errors::ApplicationError;

pub const ACTIVE_PAYMENT_MARKER: &str = "active payment";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetMethodsRequest {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetRequisitesRequest {
    pub method: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub order_id: String,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreatePaylinkRequest {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_url: Option<String>,
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreatePayoutRequest {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub requisite_type: String,
    pub requisite_value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_name: Option<String>,
    pub external_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub transaction_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPayoutRequest {
    pub payout_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceiptRequest {
    pub transaction_id: String,
    pub receipt_url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Payin,
    Payout,
}

impl From<WebhookKind> for TransactionType {
    fn from(kind: WebhookKind) -> Self {
        match kind {
            WebhookKind::Payin => TransactionType::Payin,
            WebhookKind::Payout => TransactionType::Payout,
        }
    }
}

/// Asynchronous status notification pushed by the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub transaction_id: String,
    pub status: String,
    #[serde(rename = "type")]
    pub kind: WebhookKind,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount_usdt: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub cancelled_at: Option<String>,
    #[serde(default)]
    pub processed_by: Option<String>,
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
}

/// Decoded 2xx body. Some endpoints wrap their result in `data`, others do not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayResponse {
    pub raw: Value,
}

impl GatewayResponse {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn payload(&self) -> &Value {
        match self.raw.get("data") {
            Some(data @ Value::Object(_)) => data,
            _ => &self.raw,
        }
    }

    pub fn transaction_id(&self) -> Option<String> {
        match self.payload().get("transaction_id")? {
            Value::String(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.payload().get("status").and_then(Value::as_str)
    }

    pub fn payment_url(&self) -> Option<&str> {
        let payload = self.payload();
        payload
            .get("link")
            .and_then(Value::as_str)
            .or_else(|| payload.get("payment_url").and_then(Value::as_str))
    }

    /// Method identifiers; entries may be bare strings or objects with `method`/`id`.
    pub fn method_ids(&self) -> Vec<String> {
        let Some(methods) = self.payload().get("methods").and_then(Value::as_array) else {
            return Vec::new();
        };

        methods
            .iter()
            .filter_map(|method| match method {
                Value::String(id) => Some(id.clone()),
                Value::Object(fields) => fields
                    .get("method")
                    .or_else(|| fields.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }

    pub fn requisites_count(&self) -> usize {
        self.payload().get("requisites").and_then(Value::as_array).map(Vec::len).unwrap_or(0)
    }

    pub fn has_requisites(&self) -> bool {
        let has_details = self
            .payload()
            .get("payment_details")
            .map(|details| !details.is_null())
            .unwrap_or(false);
        self.requisites_count() > 0 || has_details
    }
}

/// Maps a raw gateway status to the local vocabulary. `None` means the value is not
/// recognised and must not move local state.
pub fn classify_status(kind: TransactionType, raw: &str) -> Option<PaymentStatus> {
    let status = raw.trim().to_ascii_lowercase();
    match (kind, status.as_str()) {
        (_, "completed" | "paid" | "success") => Some(PaymentStatus::Paid),
        (TransactionType::Payout, "sent") => Some(PaymentStatus::Paid),
        (_, "failed" | "rejected" | "error" | "cancelled" | "canceled") => {
            Some(PaymentStatus::Failed)
        }
        (TransactionType::Payout, "returned") => Some(PaymentStatus::Failed),
        (_, "refunded") => Some(PaymentStatus::Refunded),
        (_, "expired") => Some(PaymentStatus::Expired),
        (_, "pending" | "processing" | "hold" | "created" | "awaiting") => {
            Some(PaymentStatus::Pending)
        }
        _ => None,
    }
}

pub fn is_active_payment_conflict(message: &str) -> bool {
    message.to_ascii_lowercase().contains(ACTIVE_PAYMENT_MARKER)
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn get_methods(
        &self,
        request: &GetMethodsRequest,
    ) -> Result<GatewayResponse, ApplicationError>;

    async fn get_requisites(
        &self,
        request: &GetRequisitesRequest,
    ) -> Result<GatewayResponse, ApplicationError>;

    async fn create_paylink(
        &self,
        request: &CreatePaylinkRequest,
    ) -> Result<GatewayResponse, ApplicationError>;

    async fn check_status(&self, transaction_id: &str)
        -> Result<GatewayResponse, ApplicationError>;

    async fn confirm_payment(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayResponse, ApplicationError>;

    async fn create_payout(
        &self,
        request: &CreatePayoutRequest,
    ) -> Result<GatewayResponse, ApplicationError>;

    async fn cancel_payment(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayResponse, ApplicationError>;

    async fn cancel_payout(&self, payout_id: &str) -> Result<GatewayResponse, ApplicationError>;

    async fn send_receipt(
        &self,
        request: &SendReceiptRequest,
    ) -> Result<GatewayResponse, ApplicationError>;
}
