//! Payment lifecycle against the gateway: local rows are written before the gateway is
//! called, and every later status change goes through the monotonic transition rules.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use tgdesk_core::domain::payment::NewPayment;
use tgdesk_core::gateway::{
    classify_status, CreatePaylinkRequest, CreatePayoutRequest, GetMethodsRequest,
    GetRequisitesRequest, SendReceiptRequest,
};
use tgdesk_core::{
    ApplicationError, GatewayResponse, Payment, PaymentGateway, PaymentStatus, StatusTransition,
    Subscription, SubscriptionStatus, TransactionType, UserId, WebhookPayload,
};
use tgdesk_db::repositories::{PaymentRepository, SubscriptionRepository, UserRepository};
use tgdesk_queue::{BotCommand, Notifier};

const MAX_WRITE_ATTEMPTS: usize = 3;
const PAYOUT_CURRENCIES: [&str; 3] = ["RUB", "USD", "EUR"];
const REQUISITE_TYPES: [&str; 3] = ["CARD", "BANK_ACCOUNT", "EWALLET"];
const DEFAULT_RETURN_URL: &str = "https://example.com/success";

pub const WEBHOOK_NOT_FOUND: &str = "Payment record not found, but webhook acknowledged.";
pub const WEBHOOK_PROCESSED: &str = "Webhook processed successfully";

#[derive(Clone, Debug)]
pub struct ReconcilerSettings {
    pub default_payment_method: String,
    pub subscription_period_days: u32,
    pub payment_page_url: String,
}

#[derive(Clone, Debug)]
pub struct PaylinkInput {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: Option<String>,
    pub description: Option<String>,
    pub return_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaylinkResponse {
    pub success: bool,
    pub payment_id: i64,
    pub transaction_id: String,
    pub payment_url: Option<String>,
    pub status: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    /// Set when the gateway reported a payment already in flight and this link is synthesized.
    pub active_payment_conflict: bool,
}

/// Paylink result with the local row it was recorded on.
#[derive(Clone, Debug)]
pub struct PaylinkOutcome {
    pub payment: Payment,
    pub response: PaylinkResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MethodCheckInput {
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodValidation {
    pub success: bool,
    pub message: String,
    pub method_available: bool,
    pub requisites_available: bool,
    pub requisites_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_methods: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct PayoutInput {
    pub user_id: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub requisite_type: String,
    pub requisite_value: String,
    pub holder_name: Option<String>,
    pub bank_name: Option<String>,
    pub external_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookAck {
    pub message: String,
}

/// Result of a gateway action, with the local payment it touched when one exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayActionResult {
    pub message: String,
    pub transaction_id: String,
    pub payment_id: Option<i64>,
    pub status: Option<PaymentStatus>,
    pub telegapay_response: Value,
}

pub struct PaymentReconciler {
    gateway: Arc<dyn PaymentGateway>,
    users: Arc<dyn UserRepository>,
    payments: Arc<dyn PaymentRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    notifier: Notifier,
    settings: ReconcilerSettings,
}

impl PaymentReconciler {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        users: Arc<dyn UserRepository>,
        payments: Arc<dyn PaymentRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
        notifier: Notifier,
        settings: ReconcilerSettings,
    ) -> Self {
        Self { gateway, users, payments, subscriptions, notifier, settings }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    pub async fn get_methods(
        &self,
        request: &GetMethodsRequest,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.gateway.get_methods(request).await
    }

    pub async fn get_requisites(
        &self,
        request: &GetRequisitesRequest,
    ) -> Result<GatewayResponse, ApplicationError> {
        self.gateway.get_requisites(request).await
    }

    /// Advisory availability check. Gateway failures become an unsuccessful answer.
    pub async fn validate_payment_method(&self, input: &MethodCheckInput) -> MethodValidation {
        let unavailable = |message: String, available_methods: Vec<String>| MethodValidation {
            success: false,
            message,
            method_available: false,
            requisites_available: false,
            requisites_count: 0,
            available_methods,
        };

        let query = GetMethodsRequest { amount: input.amount, currency: input.currency.clone() };
        let methods = match self.gateway.get_methods(&query).await {
            Ok(methods) => methods.method_ids(),
            Err(error) => {
                warn!(
                    event_name = "telegapay.method_check.failed",
                    method = %input.payment_method,
                    error = %error,
                    "payment method lookup failed"
                );
                return unavailable(error.to_string(), Vec::new());
            }
        };

        if !methods.iter().any(|method| method == &input.payment_method) {
            return unavailable(
                format!("Payment method {} is not available", input.payment_method),
                methods,
            );
        }

        let requisites = self
            .gateway
            .get_requisites(&GetRequisitesRequest {
                method: input.payment_method.clone(),
                amount: input.amount,
                currency: input.currency.clone(),
                order_id: format!("validate_{}", Utc::now().timestamp_millis()),
                user_id: "validation_user".to_string(),
            })
            .await;
        match requisites {
            Ok(requisites) => MethodValidation {
                success: true,
                message: "Payment method is available".to_string(),
                method_available: true,
                requisites_available: requisites.requisites_count() > 0,
                requisites_count: requisites.requisites_count(),
                available_methods: Vec::new(),
            },
            Err(error) => unavailable(error.to_string(), Vec::new()),
        }
    }

    /// Creates the local PENDING row, then asks the gateway for a payment link.
    ///
    /// An "active payment" answer fails the row and returns a synthesized awaiting link.
    pub async fn create_paylink(
        &self,
        input: PaylinkInput,
    ) -> Result<PaylinkOutcome, ApplicationError> {
        self.ensure_user(input.user_id).await?;
        if input.amount <= Decimal::ZERO {
            return Err(ApplicationError::Validation("amount must be positive".to_string()));
        }
        let currency = required("currency", &input.currency)?.to_ascii_uppercase();
        let method = input
            .payment_method
            .as_deref()
            .map(str::trim)
            .filter(|method| !method.is_empty())
            .unwrap_or(self.settings.default_payment_method.as_str())
            .to_string();
        let order_id = new_order_id();

        let requisites = self
            .precheck_requisites(&method, input.amount, &currency, &order_id, input.user_id)
            .await?;

        let payment = self
            .payments
            .insert(NewPayment {
                user_id: input.user_id,
                amount: input.amount,
                currency: currency.clone(),
                method: method.clone(),
                description: input.description.clone(),
                order_id: order_id.clone(),
                transaction_type: TransactionType::Payin,
                metadata: json!({
                    "order_id": order_id,
                    "requisites_check": requisites.as_ref().map(|response| response.raw.clone()),
                }),
            })
            .await?;
        info!(
            event_name = "billing.paylink.pending_created",
            payment_id = payment.id.0,
            user_id = input.user_id.0,
            order_id = %order_id,
            "local payment created before gateway call"
        );

        let request = CreatePaylinkRequest {
            amount: input.amount,
            currency: currency.clone(),
            payment_method: method,
            description: input.description,
            return_url: input.return_url.clone(),
            user_id: input.user_id.to_string(),
        };

        match self.gateway.create_paylink(&request).await {
            Ok(response) => self.record_paylink(payment, response).await,
            Err(ApplicationError::ActivePaymentConflict(message)) => {
                let payment =
                    self.fail_payment(payment, &message, "active_payment_conflict").await?;
                let transaction_id = requisites
                    .as_ref()
                    .and_then(GatewayResponse::transaction_id)
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let return_url = input.return_url.as_deref().unwrap_or(DEFAULT_RETURN_URL);
                let payment_url = format!(
                    "{}/payment/{transaction_id}?return_url={return_url}",
                    self.settings.payment_page_url.trim_end_matches('/')
                );
                info!(
                    event_name = "billing.paylink.active_payment_degraded",
                    payment_id = payment.id.0,
                    transaction_id = %transaction_id,
                    "gateway reported an active payment; returning awaiting link"
                );
                Ok(PaylinkOutcome {
                    response: PaylinkResponse {
                        success: true,
                        payment_id: payment.id.0,
                        transaction_id,
                        payment_url: Some(payment_url),
                        status: "awaiting".to_string(),
                        amount: payment.amount,
                        currency: payment.currency.clone(),
                        active_payment_conflict: true,
                    },
                    payment,
                })
            }
            Err(error) => {
                self.fail_payment(payment, &error.to_string(), "paylink_error").await?;
                Err(error)
            }
        }
    }

    /// Optional requisites lookup. An empty answer rejects the request before any row is
    /// written; a failed lookup is only logged.
    async fn precheck_requisites(
        &self,
        method: &str,
        amount: Decimal,
        currency: &str,
        order_id: &str,
        user_id: UserId,
    ) -> Result<Option<GatewayResponse>, ApplicationError> {
        let request = GetRequisitesRequest {
            method: method.to_string(),
            amount,
            currency: currency.to_string(),
            order_id: order_id.to_string(),
            user_id: user_id.to_string(),
        };
        match self.gateway.get_requisites(&request).await {
            Ok(response) if !response.has_requisites() => Err(ApplicationError::Validation(
                format!("no requisites available for payment method {method}"),
            )),
            Ok(response) => Ok(Some(response)),
            Err(error) => {
                warn!(
                    event_name = "billing.paylink.requisites_check_failed",
                    method,
                    error = %error,
                    "requisites pre-check failed; continuing"
                );
                Ok(None)
            }
        }
    }

    async fn record_paylink(
        &self,
        payment: Payment,
        response: GatewayResponse,
    ) -> Result<PaylinkOutcome, ApplicationError> {
        let Some(transaction_id) = response.transaction_id() else {
            let reason = "gateway response carried no transaction_id";
            self.fail_payment(payment, reason, "paylink_error").await?;
            return Err(ApplicationError::gateway("paylink response without transaction_id"));
        };

        let gateway_status = response.status().unwrap_or("awaiting").to_string();
        let raw = response.payload().clone();
        let external_id = transaction_id.clone();
        let status_for_write = gateway_status.clone();
        let (payment, transition) = self
            .write(payment, move |payment| {
                payment.external_id = Some(external_id.clone());
                payment.telegapay_status = Some(status_for_write.clone());
                payment.merge_metadata(json!({ "telegapay_response": raw.clone() }));
                classify_status(TransactionType::Payin, &status_for_write)
                    .map(|next| payment.transition_to(next))
            })
            .await?;
        self.after_transition(&payment, transition).await?;

        info!(
            event_name = "billing.paylink.created",
            payment_id = payment.id.0,
            transaction_id = %transaction_id,
            "paylink created"
        );
        Ok(PaylinkOutcome {
            response: PaylinkResponse {
                success: true,
                payment_id: payment.id.0,
                transaction_id,
                payment_url: response.payment_url().map(str::to_string),
                status: gateway_status,
                amount: payment.amount,
                currency: payment.currency.clone(),
                active_payment_conflict: false,
            },
            payment,
        })
    }

    /// Applies a gateway webhook. Unknown transactions and unknown statuses are acknowledged.
    pub async fn handle_webhook(
        &self,
        payload: &WebhookPayload,
    ) -> Result<WebhookAck, ApplicationError> {
        let kind = TransactionType::from(payload.kind);
        let Some(payment) = self.payments.find_by_external_id(&payload.transaction_id, kind).await?
        else {
            warn!(
                event_name = "billing.webhook.unknown_transaction",
                transaction_id = %payload.transaction_id,
                kind = %kind,
                "webhook for unknown transaction acknowledged"
            );
            return Ok(WebhookAck { message: WEBHOOK_NOT_FOUND.to_string() });
        };

        let next = classify_status(kind, &payload.status);
        if next.is_none() {
            warn!(
                event_name = "billing.webhook.unknown_status",
                payment_id = payment.id.0,
                transaction_id = %payload.transaction_id,
                status = %payload.status,
                "unrecognised gateway status; local status unchanged"
            );
        }

        let mut entry = serde_json::to_value(payload).unwrap_or(Value::Null);
        if let Value::Object(fields) = &mut entry {
            fields.insert("received_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        let raw_status = payload.status.clone();
        let (payment, transition) = self
            .write(payment, move |payment| {
                payment.telegapay_status = Some(raw_status.clone());
                payment.append_metadata("webhooks", entry.clone());
                next.map(|next| payment.transition_to(next))
            })
            .await?;
        self.after_transition(&payment, transition).await?;

        info!(
            event_name = "billing.webhook.applied",
            payment_id = payment.id.0,
            transaction_id = %payload.transaction_id,
            status = %payment.status,
            "webhook reconciled"
        );
        Ok(WebhookAck { message: WEBHOOK_PROCESSED.to_string() })
    }

    /// Polls the gateway once and reconciles the local row when one exists.
    pub async fn check_status(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayActionResult, ApplicationError> {
        let transaction_id = required("transaction_id", transaction_id)?;
        let response = self.gateway.check_status(transaction_id).await?;
        let local = self.find_any(transaction_id).await?;

        let (payment_id, status) = match local {
            Some(payment) => {
                let payment = self.reconcile_poll(payment, &response).await?;
                (Some(payment.id.0), Some(payment.status))
            }
            None => {
                warn!(
                    event_name = "billing.status_check.untracked",
                    transaction_id,
                    "status checked for a transaction with no local record"
                );
                (None, None)
            }
        };

        Ok(GatewayActionResult {
            message: "Payment status retrieved successfully".to_string(),
            transaction_id: transaction_id.to_string(),
            payment_id,
            status,
            telegapay_response: response.payload().clone(),
        })
    }

    /// Single poll for a tracked payment, used by billing for non-terminal rows.
    pub async fn refresh(&self, payment: Payment) -> Result<Payment, ApplicationError> {
        let Some(external_id) = payment.external_id.clone() else {
            return Ok(payment);
        };
        let response = self.gateway.check_status(&external_id).await?;
        self.reconcile_poll(payment, &response).await
    }

    async fn reconcile_poll(
        &self,
        payment: Payment,
        response: &GatewayResponse,
    ) -> Result<Payment, ApplicationError> {
        let raw_status = response.status().map(str::to_string);
        let next = raw_status
            .as_deref()
            .and_then(|status| classify_status(payment.transaction_type, status));
        let entry = json!({
            "checked_at": Utc::now().to_rfc3339(),
            "status": raw_status,
        });
        let (payment, transition) = self
            .write(payment, move |payment| {
                if let Some(status) = &raw_status {
                    payment.telegapay_status = Some(status.clone());
                }
                payment.append_metadata("status_checks", entry.clone());
                next.map(|next| payment.transition_to(next))
            })
            .await?;
        self.after_transition(&payment, transition).await?;
        Ok(payment)
    }

    pub async fn confirm_payment(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayActionResult, ApplicationError> {
        let transaction_id = required("transaction_id", transaction_id)?;
        let payment = self.require_local(transaction_id, TransactionType::Payin).await?;
        let response = self.gateway.confirm_payment(transaction_id).await?;

        let entry = json!({
            "confirmed_at": Utc::now().to_rfc3339(),
            "response": response.payload().clone(),
        });
        let (payment, ()) = self
            .write(payment, move |payment| payment.append_metadata("confirmations", entry.clone()))
            .await?;

        info!(
            event_name = "billing.payment.confirmed",
            payment_id = payment.id.0,
            transaction_id,
            "payment confirmed with gateway"
        );
        Ok(GatewayActionResult {
            message: "Payment confirmed successfully with Telegapay".to_string(),
            transaction_id: transaction_id.to_string(),
            payment_id: Some(payment.id.0),
            status: Some(payment.status),
            telegapay_response: response.payload().clone(),
        })
    }

    /// Creates a PAYOUT row keyed by the caller's `external_id`, then asks the gateway to
    /// disburse it.
    pub async fn create_payout(
        &self,
        input: PayoutInput,
    ) -> Result<GatewayActionResult, ApplicationError> {
        validate_payout(&input)?;
        self.ensure_user(input.user_id).await?;
        let external_id = input.external_id.trim().to_string();
        if self.payments.find_by_order_id(&external_id, TransactionType::Payout).await?.is_some() {
            return Err(ApplicationError::Validation(format!(
                "payout with external_id {external_id} already exists"
            )));
        }

        let currency = input.currency.trim().to_ascii_uppercase();
        let requisite_type = input.requisite_type.trim().to_ascii_uppercase();
        let payment = self
            .payments
            .insert(NewPayment {
                user_id: input.user_id,
                amount: input.amount,
                currency: currency.clone(),
                method: requisite_type.clone(),
                description: Some(format!("Payout {external_id}")),
                order_id: external_id.clone(),
                transaction_type: TransactionType::Payout,
                metadata: json!({
                    "external_id": external_id,
                    "requisite_type": requisite_type,
                    "holder_name": input.holder_name,
                    "bank_name": input.bank_name,
                }),
            })
            .await?;

        let request = CreatePayoutRequest {
            amount: input.amount,
            currency,
            requisite_type,
            requisite_value: input.requisite_value,
            holder_name: input.holder_name,
            bank_name: input.bank_name,
            external_id: external_id.clone(),
        };
        let response = match self.gateway.create_payout(&request).await {
            Ok(response) => response,
            Err(error) => {
                self.fail_payment(payment, &error.to_string(), "payout_error").await?;
                return Err(error);
            }
        };

        let Some(transaction_id) = response.transaction_id() else {
            let reason = "gateway response carried no transaction_id";
            self.fail_payment(payment, reason, "payout_error").await?;
            return Err(ApplicationError::gateway("payout response without transaction_id"));
        };

        let gateway_status = response.status().unwrap_or("created").to_string();
        let raw = response.payload().clone();
        let assigned = transaction_id.clone();
        let status_for_write = gateway_status.clone();
        let (payment, transition) = self
            .write(payment, move |payment| {
                payment.external_id = Some(assigned.clone());
                payment.telegapay_status = Some(status_for_write.clone());
                payment.merge_metadata(json!({ "telegapay_response": raw.clone() }));
                classify_status(TransactionType::Payout, &status_for_write)
                    .map(|next| payment.transition_to(next))
            })
            .await?;
        self.after_transition(&payment, transition).await?;

        info!(
            event_name = "billing.payout.created",
            payment_id = payment.id.0,
            transaction_id = %transaction_id,
            external_id = %external_id,
            "payout created"
        );
        Ok(GatewayActionResult {
            message: "Payout created successfully".to_string(),
            transaction_id,
            payment_id: Some(payment.id.0),
            status: Some(payment.status),
            telegapay_response: response.payload().clone(),
        })
    }

    pub async fn cancel_payment(
        &self,
        transaction_id: &str,
    ) -> Result<GatewayActionResult, ApplicationError> {
        let transaction_id = required("transaction_id", transaction_id)?;
        let response = self.gateway.cancel_payment(transaction_id).await?;
        let Some(payment) =
            self.payments.find_by_external_id(transaction_id, TransactionType::Payin).await?
        else {
            warn!(
                event_name = "billing.payment.cancelled_untracked",
                transaction_id,
                "payment cancelled with gateway; no local record"
            );
            return Ok(GatewayActionResult {
                message: "Payment cancelled successfully (no local record)".to_string(),
                transaction_id: transaction_id.to_string(),
                payment_id: None,
                status: None,
                telegapay_response: response.payload().clone(),
            });
        };

        let payment = self.record_cancellation(payment, &response).await?;
        Ok(GatewayActionResult {
            message: "Payment cancelled successfully".to_string(),
            transaction_id: transaction_id.to_string(),
            payment_id: Some(payment.id.0),
            status: Some(payment.status),
            telegapay_response: response.payload().clone(),
        })
    }

    pub async fn cancel_payout(
        &self,
        payout_id: &str,
    ) -> Result<GatewayActionResult, ApplicationError> {
        let payout_id = required("payout_id", payout_id)?;
        let payment = self.require_local(payout_id, TransactionType::Payout).await?;
        let response = self.gateway.cancel_payout(payout_id).await?;
        let payment = self.record_cancellation(payment, &response).await?;

        Ok(GatewayActionResult {
            message: "Payout cancelled successfully".to_string(),
            transaction_id: payout_id.to_string(),
            payment_id: Some(payment.id.0),
            status: Some(payment.status),
            telegapay_response: response.payload().clone(),
        })
    }

    async fn record_cancellation(
        &self,
        payment: Payment,
        response: &GatewayResponse,
    ) -> Result<Payment, ApplicationError> {
        let entry = json!({
            "cancelled_at": Utc::now().to_rfc3339(),
            "response": response.payload().clone(),
        });
        let (payment, transition) = self
            .write(payment, move |payment| {
                payment.telegapay_status = Some("cancelled".to_string());
                payment.append_metadata("cancellations", entry.clone());
                Some(payment.transition_to(PaymentStatus::Failed))
            })
            .await?;
        self.after_transition(&payment, transition).await?;
        Ok(payment)
    }

    pub async fn send_receipt(
        &self,
        request: &SendReceiptRequest,
    ) -> Result<GatewayActionResult, ApplicationError> {
        let transaction_id = required("transaction_id", &request.transaction_id)?;
        required("receipt_url", &request.receipt_url)?;
        let payment = self.require_local(transaction_id, TransactionType::Payin).await?;
        let response = self.gateway.send_receipt(request).await?;

        let entry = json!({
            "sent_at": Utc::now().to_rfc3339(),
            "receipt_url": request.receipt_url,
            "filename": response.payload().get("filename").cloned(),
        });
        let (payment, ()) = self
            .write(payment, move |payment| payment.append_metadata("receipts", entry.clone()))
            .await?;

        Ok(GatewayActionResult {
            message: "Receipt sent successfully".to_string(),
            transaction_id: transaction_id.to_string(),
            payment_id: Some(payment.id.0),
            status: Some(payment.status),
            telegapay_response: response.payload().clone(),
        })
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<(), ApplicationError> {
        if self.users.exists(user_id).await? {
            Ok(())
        } else {
            Err(ApplicationError::NotFound(format!("user {user_id}")))
        }
    }

    async fn find_any(&self, transaction_id: &str) -> Result<Option<Payment>, ApplicationError> {
        if let Some(payment) =
            self.payments.find_by_external_id(transaction_id, TransactionType::Payin).await?
        {
            return Ok(Some(payment));
        }
        Ok(self.payments.find_by_external_id(transaction_id, TransactionType::Payout).await?)
    }

    async fn require_local(
        &self,
        transaction_id: &str,
        kind: TransactionType,
    ) -> Result<Payment, ApplicationError> {
        self.payments.find_by_external_id(transaction_id, kind).await?.ok_or_else(|| {
            ApplicationError::NotFound(format!("{kind} payment with external id {transaction_id}"))
        })
    }

    /// Marks the row FAILED and records why under `metadata.failure`. The gateway status
    /// field is left to what the provider last reported.
    async fn fail_payment(
        &self,
        payment: Payment,
        reason: &str,
        stage: &'static str,
    ) -> Result<Payment, ApplicationError> {
        let entry = json!({ "at": Utc::now().to_rfc3339(), "stage": stage, "message": reason });
        let (payment, transition) = self
            .write(payment, move |payment| {
                payment.merge_metadata(json!({ "failure": entry.clone() }));
                Some(payment.transition_to(PaymentStatus::Failed))
            })
            .await?;
        self.after_transition(&payment, transition).await?;
        Ok(payment)
    }

    /// Read-modify-write under the payment's version. A lost race re-reads the row and
    /// replays `mutate` on the fresh copy.
    async fn write<T, F>(
        &self,
        current: Payment,
        mut mutate: F,
    ) -> Result<(Payment, T), ApplicationError>
    where
        F: FnMut(&mut Payment) -> T + Send,
        T: Send,
    {
        let mut current = current;
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let mut next = current.clone();
            let outcome = mutate(&mut next);
            next.updated_at = Utc::now();
            if let Some(stored) = self.payments.update_if_version(&next).await? {
                return Ok((stored, outcome));
            }

            warn!(
                event_name = "billing.payment.write_conflict",
                payment_id = current.id.0,
                attempt,
                "concurrent payment update; re-reading"
            );
            current = self
                .payments
                .find_by_id(current.id)
                .await?
                .ok_or_else(|| ApplicationError::NotFound(format!("payment {}", current.id)))?;
        }
        Err(ApplicationError::Persistence(format!(
            "payment {} kept changing under concurrent writers",
            current.id
        )))
    }

    /// Logs rejected transitions and runs subscription side effects for applied ones.
    async fn after_transition(
        &self,
        payment: &Payment,
        transition: Option<StatusTransition<PaymentStatus>>,
    ) -> Result<(), ApplicationError> {
        match transition {
            Some(StatusTransition::Applied { from, to }) => {
                info!(
                    event_name = "billing.payment.transitioned",
                    payment_id = payment.id.0,
                    from = %from,
                    to = %to,
                    "payment status changed"
                );
                self.settle_subscription(payment, to).await
            }
            Some(StatusTransition::Rejected { from, to }) => {
                warn!(
                    event_name = "billing.payment.transition_rejected",
                    payment_id = payment.id.0,
                    from = %from,
                    to = %to,
                    "status change out of a terminal state ignored"
                );
                Ok(())
            }
            Some(StatusTransition::Unchanged) | None => Ok(()),
        }
    }

    /// Brings a subscription linked after the fact in line with its payment's current status.
    pub async fn sync_subscription(&self, payment: &Payment) -> Result<(), ApplicationError> {
        if payment.status == PaymentStatus::Pending {
            return Ok(());
        }
        self.settle_subscription(payment, payment.status).await
    }

    async fn settle_subscription(
        &self,
        payment: &Payment,
        status: PaymentStatus,
    ) -> Result<(), ApplicationError> {
        if payment.transaction_type != TransactionType::Payin {
            return Ok(());
        }
        let Some(mut subscription) = self.subscriptions.find_by_payment(payment.id).await? else {
            return Ok(());
        };

        let expected = subscription.status;
        let moved = match status {
            PaymentStatus::Paid => {
                subscription.activate(Utc::now(), self.settings.subscription_period_days)
            }
            PaymentStatus::Failed | PaymentStatus::Expired | PaymentStatus::Refunded => {
                subscription.cancel()
            }
            PaymentStatus::Pending => Ok(false),
        };

        match moved {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(error) => {
                warn!(
                    event_name = "billing.subscription.transition_rejected",
                    subscription_id = subscription.id.0,
                    payment_id = payment.id.0,
                    error = %error,
                    "subscription left unchanged"
                );
                return Ok(());
            }
        }

        subscription.updated_at = Utc::now();
        if !self.subscriptions.update_if_status(&subscription, expected).await? {
            warn!(
                event_name = "billing.subscription.write_conflict",
                subscription_id = subscription.id.0,
                payment_id = payment.id.0,
                "subscription changed concurrently; skipping"
            );
            return Ok(());
        }

        info!(
            event_name = "billing.subscription.settled",
            subscription_id = subscription.id.0,
            payment_id = payment.id.0,
            status = %subscription.status,
            "subscription follows payment"
        );
        self.notifier.notify(&bot_command(&subscription, status)).await;
        Ok(())
    }
}

fn bot_command(subscription: &Subscription, status: PaymentStatus) -> BotCommand {
    if subscription.status == SubscriptionStatus::Paid {
        BotCommand::SubscriptionActivated {
            user_id: subscription.user_id.0,
            bot_id: subscription.bot_id,
            subscription_id: subscription.id.0,
            plan: subscription.plan.as_str().to_string(),
            period_end: subscription.period_end,
        }
    } else {
        BotCommand::SubscriptionCancelled {
            user_id: subscription.user_id.0,
            bot_id: subscription.bot_id,
            subscription_id: subscription.id.0,
            reason: status.as_str().to_string(),
        }
    }
}

fn new_order_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("paylink_{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, ApplicationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApplicationError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}

fn validate_payout(input: &PayoutInput) -> Result<(), ApplicationError> {
    let currency = input.currency.trim().to_ascii_uppercase();
    if !PAYOUT_CURRENCIES.contains(&currency.as_str()) {
        return Err(ApplicationError::Validation(format!(
            "currency must be one of {}",
            PAYOUT_CURRENCIES.join(", ")
        )));
    }
    let requisite_type = input.requisite_type.trim().to_ascii_uppercase();
    if !REQUISITE_TYPES.contains(&requisite_type.as_str()) {
        return Err(ApplicationError::Validation(format!(
            "requisite_type must be one of {}",
            REQUISITE_TYPES.join(", ")
        )));
    }
    if input.amount < Decimal::ONE {
        return Err(ApplicationError::Validation("amount must be at least 1".to_string()));
    }
    required("requisite_value", &input.requisite_value)?;
    required("external_id", &input.external_id)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use tgdesk_core::gateway::{
        CreatePaylinkRequest, CreatePayoutRequest, GetMethodsRequest, GetRequisitesRequest,
        SendReceiptRequest,
    };
    use tgdesk_core::domain::payment::{NewPayment, PaymentId, TransactionType};
    use tgdesk_core::{
        ApplicationError, GatewayResponse, Payment, PaymentGateway, PaymentStatus, UserId,
    };
    use tgdesk_db::repositories::{
        InMemoryPaymentRepository, InMemorySubscriptionRepository, InMemoryUserRepository,
        PaymentRepository, RepositoryError, UserRepository,
    };
    use tgdesk_queue::{InMemoryPublisher, Notifier};

    use super::{PaymentReconciler, ReconcilerSettings};

    /// Scripted gateway: each endpoint answers from a queue of canned results, falling
    /// back to a generic success.
    #[derive(Default)]
    pub(crate) struct ScriptedGateway {
        scripts: Mutex<HashMap<&'static str, Vec<Result<Value, ApplicationError>>>>,
        pub(crate) calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedGateway {
        pub(crate) fn script(
            &self,
            endpoint: &'static str,
            result: Result<Value, ApplicationError>,
        ) {
            self.scripts.lock().expect("scripts").entry(endpoint).or_default().push(result);
        }

        pub(crate) fn count(&self, endpoint: &str) -> usize {
            self.calls.lock().expect("calls").iter().filter(|call| **call == endpoint).count()
        }

        fn answer(&self, endpoint: &'static str) -> Result<GatewayResponse, ApplicationError> {
            self.calls.lock().expect("calls").push(endpoint);
            let mut scripts = self.scripts.lock().expect("scripts");
            let next = scripts
                .get_mut(endpoint)
                .filter(|queue| !queue.is_empty())
                .map(|queue| queue.remove(0));
            next.unwrap_or_else(|| Ok(default_answer(endpoint))).map(GatewayResponse::new)
        }
    }

    fn default_answer(endpoint: &str) -> Value {
        match endpoint {
            "get_requisites" => json!({
                "success": true,
                "data": { "transaction_id": "req-tx", "requisites": [{ "id": "r1" }] }
            }),
            _ => json!({ "success": true }),
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn get_methods(
            &self,
            _request: &GetMethodsRequest,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("get_methods")
        }

        async fn get_requisites(
            &self,
            _request: &GetRequisitesRequest,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("get_requisites")
        }

        async fn create_paylink(
            &self,
            _request: &CreatePaylinkRequest,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("create_paylink")
        }

        async fn check_status(
            &self,
            _transaction_id: &str,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("check_status")
        }

        async fn confirm_payment(
            &self,
            _transaction_id: &str,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("confirm_payment")
        }

        async fn create_payout(
            &self,
            _request: &CreatePayoutRequest,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("create_payout")
        }

        async fn cancel_payment(
            &self,
            _transaction_id: &str,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("cancel_payment")
        }

        async fn cancel_payout(
            &self,
            _payout_id: &str,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("cancel_payout")
        }

        async fn send_receipt(
            &self,
            _request: &SendReceiptRequest,
        ) -> Result<GatewayResponse, ApplicationError> {
            self.answer("send_receipt")
        }
    }

    pub(crate) struct Harness {
        pub(crate) reconciler: Arc<PaymentReconciler>,
        pub(crate) gateway: Arc<ScriptedGateway>,
        pub(crate) payments: Arc<InMemoryPaymentRepository>,
        pub(crate) subscriptions: Arc<InMemorySubscriptionRepository>,
        pub(crate) publisher: Arc<InMemoryPublisher>,
        pub(crate) user_id: UserId,
    }

    pub(crate) fn settings() -> ReconcilerSettings {
        ReconcilerSettings {
            default_payment_method: "CARD".to_string(),
            subscription_period_days: 30,
            payment_page_url: "https://pay.example".to_string(),
        }
    }

    /// How [`FaultyPayments`] misbehaves on `update_if_version`.
    #[derive(Clone, Copy)]
    pub(crate) enum WriteFault {
        /// The store errors on any write that moves a payment out of `PENDING`.
        RejectSettlement,
        /// Every compare-and-swap loses to a concurrent writer.
        AlwaysStale,
    }

    /// Payment store that reads through to memory and fails writes per [`WriteFault`].
    pub(crate) struct FaultyPayments {
        inner: Arc<InMemoryPaymentRepository>,
        fault: WriteFault,
    }

    impl FaultyPayments {
        pub(crate) fn wrap(
            inner: Arc<InMemoryPaymentRepository>,
            fault: WriteFault,
        ) -> Arc<dyn PaymentRepository> {
            Arc::new(Self { inner, fault })
        }
    }

    #[async_trait]
    impl PaymentRepository for FaultyPayments {
        async fn insert(&self, payment: NewPayment) -> Result<Payment, RepositoryError> {
            self.inner.insert(payment).await
        }

        async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_external_id(
            &self,
            external_id: &str,
            transaction_type: TransactionType,
        ) -> Result<Option<Payment>, RepositoryError> {
            self.inner.find_by_external_id(external_id, transaction_type).await
        }

        async fn find_by_order_id(
            &self,
            order_id: &str,
            transaction_type: TransactionType,
        ) -> Result<Option<Payment>, RepositoryError> {
            self.inner.find_by_order_id(order_id, transaction_type).await
        }

        async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Payment>, RepositoryError> {
            self.inner.list_for_user(user_id).await
        }

        async fn update_if_version(
            &self,
            payment: &Payment,
        ) -> Result<Option<Payment>, RepositoryError> {
            match self.fault {
                WriteFault::RejectSettlement if payment.status != PaymentStatus::Pending => {
                    Err(RepositoryError::Decode("disk full".to_string()))
                }
                WriteFault::RejectSettlement => self.inner.update_if_version(payment).await,
                WriteFault::AlwaysStale => Ok(None),
            }
        }
    }

    pub(crate) async fn harness() -> Harness {
        harness_with(|payments| payments as Arc<dyn PaymentRepository>).await
    }

    /// Builds a harness whose reconciler writes payments through `wrap(payments)`.
    pub(crate) async fn harness_with(
        wrap: impl FnOnce(Arc<InMemoryPaymentRepository>) -> Arc<dyn PaymentRepository>,
    ) -> Harness {
        let users = Arc::new(InMemoryUserRepository::default());
        let user_id = users.create(Some("payer@example.com")).await.expect("user");
        let gateway = Arc::new(ScriptedGateway::default());
        let payments = Arc::new(InMemoryPaymentRepository::default());
        let subscriptions = Arc::new(InMemorySubscriptionRepository::default());
        let publisher = Arc::new(InMemoryPublisher::default());
        let reconciler = Arc::new(PaymentReconciler::new(
            gateway.clone(),
            users,
            wrap(payments.clone()),
            subscriptions.clone(),
            Notifier::new(publisher.clone(), "bot_commands"),
            settings(),
        ));
        Harness { reconciler, gateway, payments, subscriptions, publisher, user_id }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use tgdesk_core::domain::payment::NewPayment;
    use tgdesk_core::domain::subscription::NewSubscription;
    use tgdesk_core::gateway::{SendReceiptRequest, WebhookKind};
    use tgdesk_core::{
        ApplicationError, Payment, PaymentStatus, SubscriptionPlan, SubscriptionStatus,
        TransactionType, UserId, WebhookPayload,
    };
    use tgdesk_db::repositories::{PaymentRepository, SubscriptionRepository};

    use super::test_support::{harness, harness_with, FaultyPayments, Harness, WriteFault};
    use super::{PaylinkInput, PayoutInput, WEBHOOK_NOT_FOUND, WEBHOOK_PROCESSED};

    fn paylink(user_id: UserId) -> PaylinkInput {
        PaylinkInput {
            user_id,
            amount: Decimal::new(1000, 0),
            currency: "RUB".to_string(),
            payment_method: None,
            description: Some("Subscription BASIC".to_string()),
            return_url: None,
        }
    }

    fn webhook(transaction_id: &str, status: &str, kind: WebhookKind) -> WebhookPayload {
        WebhookPayload {
            transaction_id: transaction_id.to_string(),
            status: status.to_string(),
            kind,
            amount: Some(Decimal::new(1000, 0)),
            amount_usdt: None,
            currency: Some("RUB".to_string()),
            created_at: None,
            completed_at: None,
            cancelled_at: None,
            processed_by: None,
            cancellation_reason: None,
            order_id: None,
        }
    }

    /// PENDING payin with `tx1` already assigned, linked to a PENDING subscription.
    async fn tracked_payment(h: &Harness) -> Payment {
        let payment = h
            .payments
            .insert(NewPayment {
                user_id: h.user_id,
                amount: Decimal::new(1000, 0),
                currency: "RUB".to_string(),
                method: "CARD".to_string(),
                description: None,
                order_id: "paylink_1000".to_string(),
                transaction_type: TransactionType::Payin,
                metadata: json!({}),
            })
            .await
            .expect("payment");
        let mut assigned = payment.clone();
        assigned.external_id = Some("tx1".to_string());
        let payment = h.payments.update_if_version(&assigned).await.expect("write").expect("cas");
        h.subscriptions
            .insert(NewSubscription {
                user_id: h.user_id,
                bot_id: 77,
                plan: SubscriptionPlan::Basic,
                payment_id: Some(payment.id),
            })
            .await
            .expect("subscription");
        payment
    }

    #[tokio::test]
    async fn paid_webhook_settles_payment_and_activates_subscription() {
        let h = harness().await;
        let payment = tracked_payment(&h).await;

        let ack = h
            .reconciler
            .handle_webhook(&webhook("tx1", "paid", WebhookKind::Payin))
            .await
            .expect("ack");

        assert_eq!(ack.message, WEBHOOK_PROCESSED);
        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.status, PaymentStatus::Paid);
        assert_eq!(stored.metadata["webhooks"].as_array().map(Vec::len), Some(1));

        let subscription =
            h.subscriptions.find_by_payment(payment.id).await.expect("read").expect("subscription");
        assert_eq!(subscription.status, SubscriptionStatus::Paid);
        let (start, end) = (
            subscription.period_start.expect("start"),
            subscription.period_end.expect("end"),
        );
        assert_eq!(end - start, Duration::days(30));
        assert!(Utc::now() - start < Duration::minutes(1));

        let published = h.publisher.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1["type"], "subscription_activated");
    }

    #[tokio::test]
    async fn webhook_replay_is_idempotent_for_terminal_payments() {
        let h = harness().await;
        let payment = tracked_payment(&h).await;
        let event = webhook("tx1", "paid", WebhookKind::Payin);

        h.reconciler.handle_webhook(&event).await.expect("first");
        let replay = h.reconciler.handle_webhook(&event).await.expect("replay");

        assert_eq!(replay.message, WEBHOOK_PROCESSED);
        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.status, PaymentStatus::Paid);
        assert_eq!(h.publisher.published().await.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_terminal_webhook_is_ignored() {
        let h = harness().await;
        let payment = tracked_payment(&h).await;

        let paid = webhook("tx1", "paid", WebhookKind::Payin);
        h.reconciler.handle_webhook(&paid).await.expect("paid");
        let ack = h
            .reconciler
            .handle_webhook(&webhook("tx1", "failed", WebhookKind::Payin))
            .await
            .expect("ack");

        assert_eq!(ack.message, WEBHOOK_PROCESSED);
        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.status, PaymentStatus::Paid);
        assert_eq!(stored.telegapay_status.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn refund_after_paid_cancels_subscription() {
        let h = harness().await;
        let payment = tracked_payment(&h).await;

        let paid = webhook("tx1", "paid", WebhookKind::Payin);
        h.reconciler.handle_webhook(&paid).await.expect("paid");
        h.reconciler
            .handle_webhook(&webhook("tx1", "refunded", WebhookKind::Payin))
            .await
            .expect("refunded");

        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.status, PaymentStatus::Refunded);
        let subscription =
            h.subscriptions.find_by_payment(payment.id).await.expect("read").expect("subscription");
        assert_eq!(subscription.status, SubscriptionStatus::Cancelled);
        let published = h.publisher.published().await;
        let last_type = published.last().map(|(_, message)| message["type"].clone());
        assert_eq!(last_type, Some(json!("subscription_cancelled")));
    }

    #[tokio::test]
    async fn unknown_transaction_webhook_is_acknowledged() {
        let h = harness().await;

        let ack = h
            .reconciler
            .handle_webhook(&webhook("unknown_tx", "paid", WebhookKind::Payin))
            .await
            .expect("ack");

        assert_eq!(ack.message, WEBHOOK_NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_status_keeps_local_state() {
        let h = harness().await;
        let payment = tracked_payment(&h).await;

        h.reconciler
            .handle_webhook(&webhook("tx1", "mystery", WebhookKind::Payin))
            .await
            .expect("ack");

        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(stored.telegapay_status.as_deref(), Some("mystery"));
    }

    #[tokio::test]
    async fn paylink_records_transaction_id_and_audit_trail() {
        let h = harness().await;
        h.gateway.script("get_requisites", Ok(json!({ "data": { "requisites": [{ "id": 1 }] } })));
        h.gateway.script(
            "create_paylink",
            Ok(json!({
                "data": {
                    "transaction_id": "tx-55",
                    "status": "awaiting",
                    "link": "https://pay/tx-55"
                }
            })),
        );

        let outcome = h.reconciler.create_paylink(paylink(h.user_id)).await.expect("paylink");

        assert!(!outcome.response.active_payment_conflict);
        assert_eq!(outcome.response.payment_url.as_deref(), Some("https://pay/tx-55"));
        let stored =
            h.payments.find_by_id(outcome.payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.external_id.as_deref(), Some("tx-55"));
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(stored.method, "CARD");
        assert!(stored.order_id.starts_with("paylink_"));
        assert!(stored.metadata.get("requisites_check").is_some());
        assert_eq!(stored.metadata["telegapay_response"]["transaction_id"], "tx-55");
    }

    #[tokio::test]
    async fn active_payment_conflict_degrades_to_awaiting_link() {
        let h = harness().await;
        h.gateway.script(
            "create_paylink",
            Err(ApplicationError::ActivePaymentConflict("User has an active payment".to_string())),
        );

        let outcome = h.reconciler.create_paylink(paylink(h.user_id)).await.expect("degraded");

        assert!(outcome.response.success);
        assert!(outcome.response.active_payment_conflict);
        assert_eq!(outcome.response.status, "awaiting");
        let url = outcome.response.payment_url.expect("url");
        assert!(url.starts_with("https://pay.example/payment/req-tx"));
        assert!(url.ends_with("?return_url=https://example.com/success"));

        let stored =
            h.payments.find_by_id(outcome.payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.version, 1);
        assert_eq!(h.gateway.count("create_paylink"), 1);
    }

    #[tokio::test]
    async fn empty_requisites_reject_before_any_row_exists() {
        let h = harness().await;
        h.gateway.script("get_requisites", Ok(json!({ "data": { "requisites": [] } })));
        let mut input = paylink(h.user_id);
        input.payment_method = Some("BANK_SBER".to_string());

        let result = h.reconciler.create_paylink(input).await;

        assert!(matches!(result, Err(ApplicationError::Validation(_))));
        assert!(h.payments.list_for_user(h.user_id).await.expect("list").is_empty());
        assert_eq!(h.gateway.count("create_paylink"), 0);
    }

    #[tokio::test]
    async fn malformed_and_unknown_users_are_rejected() {
        let h = harness().await;

        let unknown = h.reconciler.create_paylink(paylink(UserId(404))).await;
        assert!(matches!(unknown, Err(ApplicationError::NotFound(_))));

        let mut zero = paylink(h.user_id);
        zero.amount = Decimal::ZERO;
        assert!(matches!(
            h.reconciler.create_paylink(zero).await,
            Err(ApplicationError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn create_response_without_transaction_id_fails_the_row() {
        let h = harness().await;
        let response = json!({ "success": true, "data": { "status": "awaiting" } });
        h.gateway.script("create_paylink", Ok(response));

        let result = h.reconciler.create_paylink(paylink(h.user_id)).await;

        assert!(matches!(result, Err(ApplicationError::Gateway { .. })));
        let rows = h.payments.list_for_user(h.user_id).await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, PaymentStatus::Failed);
        assert_eq!(rows[0].external_id, None);
    }

    #[tokio::test]
    async fn gateway_failure_marks_row_failed_and_propagates() {
        let h = harness().await;
        let rejection = ApplicationError::Validation("bad amount".to_string());
        h.gateway.script("create_paylink", Err(rejection.clone()));

        let result = h.reconciler.create_paylink(paylink(h.user_id)).await;

        assert_eq!(result.map(|_| ()), Err(rejection));
        let rows = h.payments.list_for_user(h.user_id).await.expect("list");
        assert_eq!(rows[0].status, PaymentStatus::Failed);
        assert_eq!(rows[0].telegapay_status, None);
        assert_eq!(rows[0].metadata["failure"]["stage"], "paylink_error");
        assert_eq!(rows[0].metadata["failure"]["message"], "validation failed: bad amount");
    }

    #[tokio::test]
    async fn status_poll_reconciles_and_records_check() {
        let h = harness().await;
        let payment = tracked_payment(&h).await;
        h.gateway.script("check_status", Ok(json!({ "data": { "status": "completed" } })));

        let result = h.reconciler.check_status("tx1").await.expect("status");

        assert_eq!(result.status, Some(PaymentStatus::Paid));
        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.metadata["status_checks"].as_array().map(Vec::len), Some(1));
        assert_eq!(
            h.subscriptions.find_by_payment(payment.id).await.expect("read").map(|s| s.status),
            Some(SubscriptionStatus::Paid)
        );
    }

    #[tokio::test]
    async fn confirm_and_receipt_require_a_local_payment() {
        let h = harness().await;
        tracked_payment(&h).await;

        let missing = h.reconciler.confirm_payment("nope").await;
        assert!(matches!(missing, Err(ApplicationError::NotFound(_))));
        assert_eq!(h.gateway.count("confirm_payment"), 0);

        let confirmed = h.reconciler.confirm_payment("tx1").await.expect("confirmed");
        let receipt = h
            .reconciler
            .send_receipt(&SendReceiptRequest {
                transaction_id: "tx1".to_string(),
                receipt_url: "https://receipts/1.pdf".to_string(),
            })
            .await
            .expect("receipt");

        let stored = h
            .payments
            .find_by_id(tgdesk_core::PaymentId(confirmed.payment_id.expect("id")))
            .await
            .expect("read")
            .expect("payment");
        assert_eq!(stored.metadata["confirmations"].as_array().map(Vec::len), Some(1));
        assert_eq!(stored.metadata["receipts"][0]["receipt_url"], "https://receipts/1.pdf");
        assert_eq!(receipt.status, Some(PaymentStatus::Pending));
    }

    #[tokio::test]
    async fn cancel_payment_fails_pending_row_and_tolerates_untracked() {
        let h = harness().await;
        let payment = tracked_payment(&h).await;

        let cancelled = h.reconciler.cancel_payment("tx1").await.expect("cancelled");
        let untracked = h.reconciler.cancel_payment("other").await.expect("untracked");

        assert_eq!(cancelled.status, Some(PaymentStatus::Failed));
        assert_eq!(untracked.payment_id, None);
        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.metadata["cancellations"].as_array().map(Vec::len), Some(1));
        assert_eq!(
            h.subscriptions.find_by_payment(payment.id).await.expect("read").map(|s| s.status),
            Some(SubscriptionStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn every_receipt_sent_is_kept_in_the_audit_trail() {
        let h = harness().await;
        let payment = tracked_payment(&h).await;

        for url in ["https://r/1", "https://r/2"] {
            h.reconciler
                .send_receipt(&SendReceiptRequest {
                    transaction_id: "tx1".to_string(),
                    receipt_url: url.to_string(),
                })
                .await
                .expect("receipt");
        }

        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        let urls: Vec<&str> = stored.metadata["receipts"]
            .as_array()
            .expect("receipts")
            .iter()
            .filter_map(|receipt| receipt["receipt_url"].as_str())
            .collect();
        assert_eq!(urls, vec!["https://r/1", "https://r/2"]);
    }

    #[tokio::test]
    async fn write_gives_up_after_repeated_version_conflicts() {
        let h = harness_with(|payments| FaultyPayments::wrap(payments, WriteFault::AlwaysStale))
            .await;
        let payment = tracked_payment(&h).await;

        let result = h.reconciler.handle_webhook(&webhook("tx1", "paid", WebhookKind::Payin)).await;

        assert!(matches!(
            result,
            Err(ApplicationError::Persistence(ref message))
                if message.contains("concurrent writers")
        ));
        let stored = h.payments.find_by_id(payment.id).await.expect("read").expect("payment");
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert!(h.publisher.published().await.is_empty());
    }

    fn payout(user_id: UserId, external_id: &str) -> PayoutInput {
        PayoutInput {
            user_id,
            amount: Decimal::new(500, 0),
            currency: "rub".to_string(),
            requisite_type: "card".to_string(),
            requisite_value: "2200000000000000".to_string(),
            holder_name: Some("Ivan Petrov".to_string()),
            bank_name: None,
            external_id: external_id.to_string(),
        }
    }

    #[tokio::test]
    async fn payout_is_created_once_per_external_id() {
        let h = harness().await;
        let scripted = json!({ "data": { "transaction_id": "po-1", "status": "processing" } });
        h.gateway.script("create_payout", Ok(scripted));

        let created = h.reconciler.create_payout(payout(h.user_id, "ext-1")).await.expect("payout");
        let duplicate = h.reconciler.create_payout(payout(h.user_id, "ext-1")).await;

        assert_eq!(created.transaction_id, "po-1");
        assert_eq!(created.status, Some(PaymentStatus::Pending));
        assert!(matches!(duplicate, Err(ApplicationError::Validation(_))));
        assert_eq!(h.gateway.count("create_payout"), 1);

        h.reconciler
            .handle_webhook(&webhook("po-1", "sent", WebhookKind::Payout))
            .await
            .expect("webhook");
        let stored = h
            .payments
            .find_by_external_id("po-1", TransactionType::Payout)
            .await
            .expect("read")
            .expect("payout");
        assert_eq!(stored.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn payout_validation_rules() {
        let h = harness().await;

        let mut bad_currency = payout(h.user_id, "a");
        bad_currency.currency = "GBP".to_string();
        let mut bad_type = payout(h.user_id, "b");
        bad_type.requisite_type = "CRYPTO".to_string();
        let mut too_small = payout(h.user_id, "c");
        too_small.amount = Decimal::new(5, 1);
        let blank_external = payout(h.user_id, "  ");

        for input in [bad_currency, bad_type, too_small, blank_external] {
            let result = h.reconciler.create_payout(input).await;
            assert!(matches!(result, Err(ApplicationError::Validation(_))));
        }
        assert_eq!(h.gateway.count("create_payout"), 0);
    }

    #[tokio::test]
    async fn cancel_payout_requires_tracked_payout() {
        let h = harness().await;
        let scripted = json!({ "data": { "transaction_id": "po-2", "status": "created" } });
        h.gateway.script("create_payout", Ok(scripted));
        h.reconciler.create_payout(payout(h.user_id, "ext-2")).await.expect("payout");

        let missing = h.reconciler.cancel_payout("po-unknown").await;
        let cancelled = h.reconciler.cancel_payout("po-2").await.expect("cancelled");

        assert!(matches!(missing, Err(ApplicationError::NotFound(_))));
        assert_eq!(cancelled.status, Some(PaymentStatus::Failed));
    }
}
