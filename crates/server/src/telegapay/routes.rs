//! `/telegapay/*` endpoints: gateway operations for authenticated callers plus the
//! provider webhook.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, warn};

use tgdesk_core::gateway::{
    CancelPayoutRequest, GetMethodsRequest, GetRequisitesRequest, SendReceiptRequest,
    TransactionRequest,
};
use tgdesk_core::{GatewayResponse, WebhookPayload};

use super::reconciler::{
    GatewayActionResult, MethodCheckInput, MethodValidation, PaylinkInput, PaylinkResponse,
    PaymentReconciler, PayoutInput, WebhookAck,
};
use crate::api::{ApiError, AuthenticatedUser, RequestContext};

pub const WEBHOOK_SECRET_HEADER: &str = "x-telegapay-webhook-secret";

#[derive(Clone)]
pub struct TelegapayState {
    pub reconciler: Arc<PaymentReconciler>,
    pub webhook_secret: Option<SecretString>,
}

pub fn router(state: TelegapayState) -> Router {
    Router::new()
        .route("/telegapay/get-methods", post(get_methods))
        .route("/telegapay/get-requisites", post(get_requisites))
        .route("/telegapay/validate-payment-method", post(validate_payment_method))
        .route("/telegapay/create-paylink", post(create_paylink))
        .route("/telegapay/check-status", post(check_status))
        .route("/telegapay/confirm-payment", post(confirm_payment))
        .route("/telegapay/create-payout", post(create_payout))
        .route("/telegapay/cancel-payment", post(cancel_payment))
        .route("/telegapay/cancel-payout", post(cancel_payout))
        .route("/telegapay/send-receipt", post(send_receipt))
        .route("/telegapay/webhook", post(webhook))
        .with_state(state)
}

fn default_currency() -> String {
    "RUB".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreatePaylinkBody {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreatePayoutBody {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub requisite_type: String,
    pub requisite_value: String,
    #[serde(default)]
    pub holder_name: Option<String>,
    #[serde(default)]
    pub bank_name: Option<String>,
    pub external_id: String,
}

async fn get_methods(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(request): Json<GetMethodsRequest>,
) -> Result<Json<GatewayResponse>, ApiError> {
    let response = state.reconciler.get_methods(&request).await.map_err(|error| user.fail(error))?;
    Ok(Json(response))
}

async fn get_requisites(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(request): Json<GetRequisitesRequest>,
) -> Result<Json<GatewayResponse>, ApiError> {
    let response =
        state.reconciler.get_requisites(&request).await.map_err(|error| user.fail(error))?;
    Ok(Json(response))
}

async fn validate_payment_method(
    State(state): State<TelegapayState>,
    _user: AuthenticatedUser,
    Json(request): Json<MethodCheckInput>,
) -> Json<MethodValidation> {
    Json(state.reconciler.validate_payment_method(&request).await)
}

async fn create_paylink(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(body): Json<CreatePaylinkBody>,
) -> Result<(StatusCode, Json<PaylinkResponse>), ApiError> {
    let outcome = state
        .reconciler
        .create_paylink(PaylinkInput {
            user_id: user.user_id,
            amount: body.amount,
            currency: body.currency,
            payment_method: body.payment_method,
            description: body.description,
            return_url: body.return_url,
        })
        .await
        .map_err(|error| user.fail(error))?;
    Ok((StatusCode::CREATED, Json(outcome.response)))
}

async fn check_status(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<GatewayActionResult>, ApiError> {
    let result = state
        .reconciler
        .check_status(&request.transaction_id)
        .await
        .map_err(|error| user.fail(error))?;
    Ok(Json(result))
}

async fn confirm_payment(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<GatewayActionResult>, ApiError> {
    let result = state
        .reconciler
        .confirm_payment(&request.transaction_id)
        .await
        .map_err(|error| user.fail(error))?;
    Ok(Json(result))
}

async fn create_payout(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(body): Json<CreatePayoutBody>,
) -> Result<(StatusCode, Json<GatewayActionResult>), ApiError> {
    let result = state
        .reconciler
        .create_payout(PayoutInput {
            user_id: user.user_id,
            amount: body.amount,
            currency: body.currency,
            requisite_type: body.requisite_type,
            requisite_value: body.requisite_value,
            holder_name: body.holder_name,
            bank_name: body.bank_name,
            external_id: body.external_id,
        })
        .await
        .map_err(|error| user.fail(error))?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn cancel_payment(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<GatewayActionResult>, ApiError> {
    let result = state
        .reconciler
        .cancel_payment(&request.transaction_id)
        .await
        .map_err(|error| user.fail(error))?;
    Ok(Json(result))
}

async fn cancel_payout(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(request): Json<CancelPayoutRequest>,
) -> Result<Json<GatewayActionResult>, ApiError> {
    let result = state
        .reconciler
        .cancel_payout(&request.payout_id)
        .await
        .map_err(|error| user.fail(error))?;
    Ok(Json(result))
}

async fn send_receipt(
    State(state): State<TelegapayState>,
    user: AuthenticatedUser,
    Json(request): Json<SendReceiptRequest>,
) -> Result<Json<GatewayActionResult>, ApiError> {
    let result =
        state.reconciler.send_receipt(&request).await.map_err(|error| user.fail(error))?;
    Ok(Json(result))
}

/// Answers 200 for applied, unknown and malformed notifications so the provider stops retrying.
/// A failed secret check is 401 and a failed write is surfaced so the provider retries.
async fn webhook(
    State(state): State<TelegapayState>,
    context: RequestContext,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    if let Some(secret) = &state.webhook_secret {
        let presented = headers.get(WEBHOOK_SECRET_HEADER).and_then(|value| value.to_str().ok());
        if presented != Some(secret.expose_secret()) {
            warn!(
                event_name = "billing.webhook.unauthorized",
                correlation_id = %context.correlation_id,
                "webhook secret missing or wrong"
            );
            return Err(ApiError::unauthorized("invalid webhook secret", &context.correlation_id));
        }
    }

    let payload = match serde_json::from_slice::<WebhookPayload>(&body) {
        Ok(payload) => payload,
        Err(parse_error) => {
            warn!(
                event_name = "billing.webhook.malformed",
                correlation_id = %context.correlation_id,
                error = %parse_error,
                body = %preview(&body),
                "unparseable webhook acknowledged"
            );
            let message = "Webhook received but not understood".to_string();
            return Ok(Json(WebhookAck { message }));
        }
    };

    match state.reconciler.handle_webhook(&payload).await {
        Ok(ack) => Ok(Json(ack)),
        Err(failure) => {
            error!(
                event_name = "billing.webhook.failed",
                correlation_id = %context.correlation_id,
                transaction_id = %payload.transaction_id,
                error = %failure,
                "webhook could not be applied"
            );
            Err(context.fail(failure))
        }
    }
}

fn preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => value.to_string().chars().take(256).collect(),
        Err(_) => text.chars().take(256).collect(),
    }
}
