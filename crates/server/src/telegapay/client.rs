//! HTTP client for the Telegapay payment gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use tgdesk_core::config::TelegapayConfig;
use tgdesk_core::gateway::{
    is_active_payment_conflict, CancelPayoutRequest, CreatePaylinkRequest, CreatePayoutRequest,
    GetMethodsRequest, GetRequisitesRequest, SendReceiptRequest, TransactionRequest,
};
use tgdesk_core::{ApplicationError, GatewayResponse, PaymentGateway, RetryPolicy};

use crate::outbound;

const TARGET: &str = "telegapay";
const API_KEY_HEADER: &str = "X-API-Key";

pub struct TelegapayClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
    read_retry: RetryPolicy,
}

impl TelegapayClient {
    pub fn new(
        base_url: &str,
        api_key: SecretString,
        timeout: Duration,
        read_retry: RetryPolicy,
    ) -> Result<Self, ApplicationError> {
        Ok(Self {
            client: outbound::build_client(timeout, TARGET)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            read_retry,
        })
    }

    pub fn from_config(config: &TelegapayConfig) -> Result<Self, ApplicationError> {
        Self::new(
            &config.base_url,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_secs),
            RetryPolicy {
                max_retries: config.max_retries,
                base_delay_ms: config.retry_base_delay_ms,
                max_delay_ms: config.retry_max_delay_ms,
            },
        )
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<GatewayResponse, ApplicationError> {
        let url = format!("{}{endpoint}", self.base_url);
        debug!(event_name = "telegapay.request.sent", endpoint, "calling payment gateway");

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|err| {
                error!(
                    event_name = "telegapay.request.transport_failed",
                    endpoint,
                    error = %err,
                    "payment gateway request did not complete"
                );
                outbound::transport_error(TARGET, &err)
            })?;

        let status = response.status();
        let payload = outbound::read_body(TARGET, response).await?;
        if status.is_success() {
            if payload.get("success").and_then(Value::as_bool) == Some(false) {
                let message = outbound::error_message(status, &payload);
                return Err(classify_failure(endpoint, status, message));
            }
            return Ok(GatewayResponse::new(payload));
        }

        let message = outbound::error_message(status, &payload);
        Err(classify_failure(endpoint, status, message))
    }

    /// Read-only calls are safe to repeat on transient failures.
    async fn post_idempotent<B: Serialize + Sync + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.read_retry.run(endpoint, || self.post(endpoint, body)).await
    }
}

fn transaction(transaction_id: &str) -> TransactionRequest {
    TransactionRequest { transaction_id: transaction_id.to_string() }
}

fn classify_failure(endpoint: &str, status: StatusCode, message: String) -> ApplicationError {
    if is_active_payment_conflict(&message) {
        info!(
            event_name = "telegapay.request.active_payment",
            endpoint,
            status = status.as_u16(),
            "gateway reports a payment already in flight"
        );
        return ApplicationError::ActivePaymentConflict(message);
    }

    error!(
        event_name = "telegapay.request.rejected",
        endpoint,
        status = status.as_u16(),
        error = %message,
        "payment gateway rejected request"
    );
    match status {
        StatusCode::BAD_REQUEST => ApplicationError::Validation(message),
        StatusCode::NOT_FOUND => ApplicationError::NotFound(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            ApplicationError::transient_gateway(format!("telegapay returned {status}: {message}"))
        }
        _ => ApplicationError::gateway(format!("telegapay returned {status}: {message}")),
    }
}

#[async_trait]
impl PaymentGateway for TelegapayClient {
    async fn get_methods(
        &self,
        request: &GetMethodsRequest,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.post_idempotent("/get_methods", request).await
    }

    async fn get_requisites(
        &self,
        request: &GetRequisitesRequest,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.post_idempotent("/get_requisites", request).await
    }

    async fn create_paylink(
        &self,
        request: &CreatePaylinkRequest,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.post("/create_paylink", request).await
    }

    async fn check_status(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.post_idempotent("/check_status", &transaction(transaction_id)).await
    }

    async fn confirm_payment(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.post("/confirm_payment", &transaction(transaction_id)).await
    }

    async fn create_payout(
        &self,
        request: &CreatePayoutRequest,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.post("/create_payout", request).await
    }

    async fn cancel_payment(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.post("/cancel_payment", &transaction(transaction_id)).await
    }

    async fn cancel_payout(&self, payout_id: &str) -> Result<GatewayResponse, ApplicationError> {
        self.post("/cancel_payout", &CancelPayoutRequest { payout_id: payout_id.to_string() }).await
    }

    async fn send_receipt(
        &self,
        request: &SendReceiptRequest,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.post("/send_receipt", request).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use rust_decimal::Decimal;
    use secrecy::SecretString;
    use serde_json::json;

    use tgdesk_core::gateway::{CreatePaylinkRequest, GetMethodsRequest};
    use tgdesk_core::{ApplicationError, PaymentGateway, RetryPolicy};

    use super::TelegapayClient;

    fn client(base_url: &str, max_retries: u32) -> TelegapayClient {
        TelegapayClient::new(
            base_url,
            SecretString::from("api-key-1".to_string()),
            Duration::from_secs(2),
            RetryPolicy { max_retries, base_delay_ms: 0, max_delay_ms: 0 },
        )
        .expect("client")
    }

    fn paylink() -> CreatePaylinkRequest {
        CreatePaylinkRequest {
            amount: Decimal::new(1000, 0),
            currency: "RUB".to_string(),
            payment_method: "CARD".to_string(),
            description: None,
            return_url: None,
            user_id: "7".to_string(),
        }
    }

    #[tokio::test]
    async fn create_paylink_sends_api_key_and_reads_transaction() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/create_paylink")
                    .header("X-API-Key", "api-key-1")
                    .json_body(json!({
                        "amount": 1000.0,
                        "currency": "RUB",
                        "payment_method": "CARD",
                        "user_id": "7"
                    }));
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {
                        "transaction_id": "tx-1",
                        "status": "awaiting",
                        "link": "https://pay/tx-1"
                    }
                }));
            })
            .await;

        let response =
            client(&server.base_url(), 0).create_paylink(&paylink()).await.expect("paylink");

        mock.assert_async().await;
        assert_eq!(response.transaction_id().as_deref(), Some("tx-1"));
        assert_eq!(response.payment_url(), Some("https://pay/tx-1"));
    }

    #[tokio::test]
    async fn status_codes_map_to_error_taxonomy() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/confirm_payment")
                    .json_body(json!({ "transaction_id": "bad" }));
                then.status(400).json_body(json!({ "error": "invalid transaction" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/confirm_payment")
                    .json_body(json!({ "transaction_id": "gone" }));
                then.status(404).json_body(json!({ "details": "no such transaction" }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/confirm_payment")
                    .json_body(json!({ "transaction_id": "boom" }));
                then.status(500).json_body(json!({ "error": "db down" }));
            })
            .await;

        let gateway = client(&server.base_url(), 0);
        assert_eq!(
            gateway.confirm_payment("bad").await,
            Err(ApplicationError::Validation("invalid transaction".to_string()))
        );
        assert_eq!(
            gateway.confirm_payment("gone").await,
            Err(ApplicationError::NotFound("no such transaction".to_string()))
        );
        assert!(matches!(
            gateway.confirm_payment("boom").await,
            Err(ApplicationError::Gateway { retryable: false, .. })
        ));
    }

    #[tokio::test]
    async fn active_payment_message_is_a_named_conflict() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/create_paylink");
                then.status(429)
                    .json_body(json!({ "error": "User already has an active payment" }));
            })
            .await;

        let result = client(&server.base_url(), 0).create_paylink(&paylink()).await;
        assert!(matches!(result, Err(ApplicationError::ActivePaymentConflict(_))));
    }

    #[tokio::test]
    async fn success_false_in_2xx_body_is_a_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/cancel_payout");
                then.status(200)
                    .json_body(json!({ "success": false, "error": "payout already sent" }));
            })
            .await;

        let result = client(&server.base_url(), 0).cancel_payout("p-1").await;
        assert!(matches!(result, Err(ApplicationError::Gateway { .. })));
    }

    #[tokio::test]
    async fn read_calls_retry_transient_failures_only() {
        let server = MockServer::start_async().await;
        let flaky = server
            .mock_async(|when, then| {
                when.method(POST).path("/get_methods");
                then.status(503).json_body(json!({ "error": "maintenance" }));
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST).path("/create_paylink");
                then.status(503).json_body(json!({ "error": "maintenance" }));
            })
            .await;

        let gateway = client(&server.base_url(), 2);
        let query = GetMethodsRequest { amount: Decimal::new(500, 0), currency: "RUB".to_string() };
        let methods = gateway.get_methods(&query).await;
        let created = gateway.create_paylink(&paylink()).await;

        assert!(matches!(methods, Err(ApplicationError::Gateway { retryable: true, .. })));
        assert!(created.is_err());
        flaky.assert_hits_async(3).await;
        create.assert_hits_async(1).await;
    }
}
