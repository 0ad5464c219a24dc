use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tgdesk_core::domain::subscription::{NewSubscription, PlanDetails};
use tgdesk_core::{
    ApplicationError, Payment, PaymentId, Subscription, SubscriptionId, SubscriptionPlan, UserId,
};
use tgdesk_db::repositories::{PaymentRepository, SubscriptionRepository};

use crate::telegapay::reconciler::PaylinkInput;
use crate::telegapay::PaymentReconciler;

const PLAN_CURRENCY: &str = "RUB";

#[derive(Clone, Debug)]
pub struct SubscribeInput {
    pub bot_id: i64,
    pub plan: SubscriptionPlan,
    pub payment_method: Option<String>,
    pub return_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkout {
    pub subscription: Subscription,
    pub payment_id: i64,
    pub transaction_id: String,
    pub payment_url: Option<String>,
    pub active_payment_conflict: bool,
}

/// Subscription purchase and the caller-scoped read side of billing.
#[derive(Clone)]
pub struct BillingService {
    reconciler: Arc<PaymentReconciler>,
    payments: Arc<dyn PaymentRepository>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl BillingService {
    pub fn new(
        reconciler: Arc<PaymentReconciler>,
        payments: Arc<dyn PaymentRepository>,
        subscriptions: Arc<dyn SubscriptionRepository>,
    ) -> Self {
        Self { reconciler, payments, subscriptions }
    }

    fn period_days(&self) -> u32 {
        self.reconciler.settings().subscription_period_days
    }

    pub fn plans(&self) -> Vec<PlanDetails> {
        SubscriptionPlan::catalog(self.period_days())
    }

    pub fn plan(&self, name: &str) -> Result<PlanDetails, ApplicationError> {
        SubscriptionPlan::parse(name)
            .map(|plan| plan.details(self.period_days()))
            .ok_or_else(|| ApplicationError::NotFound(format!("plan {name}")))
    }

    /// Starts a paylink for the plan price and links a PENDING subscription to it.
    pub async fn subscribe(
        &self,
        user_id: UserId,
        input: SubscribeInput,
    ) -> Result<Checkout, ApplicationError> {
        if input.bot_id <= 0 {
            return Err(ApplicationError::Validation("bot_id must be positive".to_string()));
        }

        let outcome = self
            .reconciler
            .create_paylink(PaylinkInput {
                user_id,
                amount: input.plan.price(),
                currency: PLAN_CURRENCY.to_string(),
                payment_method: input.payment_method,
                description: Some(format!("Subscription {}", input.plan.as_str())),
                return_url: input.return_url,
            })
            .await?;

        let subscription = self
            .subscriptions
            .insert(NewSubscription {
                user_id,
                bot_id: input.bot_id,
                plan: input.plan,
                payment_id: Some(outcome.payment.id),
            })
            .await?;
        info!(
            event_name = "billing.subscription.created",
            subscription_id = subscription.id.0,
            payment_id = outcome.payment.id.0,
            plan = input.plan.as_str(),
            "subscription awaiting payment"
        );

        // A webhook may have settled the payment before the subscription row existed, and
        // a conflict fails it up front. Sync against the stored row, not the snapshot.
        let payment =
            self.payments.find_by_id(outcome.payment.id).await?.unwrap_or(outcome.payment);
        self.reconciler.sync_subscription(&payment).await?;
        let subscription =
            self.subscriptions.find_by_id(subscription.id).await?.unwrap_or(subscription);

        Ok(Checkout {
            subscription,
            payment_id: outcome.response.payment_id,
            transaction_id: outcome.response.transaction_id,
            payment_url: outcome.response.payment_url,
            active_payment_conflict: outcome.response.active_payment_conflict,
        })
    }

    pub async fn subscriptions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Subscription>, ApplicationError> {
        Ok(self.subscriptions.list_for_user(user_id).await?)
    }

    pub async fn subscription(
        &self,
        user_id: UserId,
        id: SubscriptionId,
    ) -> Result<Subscription, ApplicationError> {
        self.subscriptions
            .find_by_id(id)
            .await?
            .filter(|subscription| subscription.user_id == user_id)
            .ok_or_else(|| ApplicationError::NotFound(format!("subscription {}", id.0)))
    }

    pub async fn payments(&self, user_id: UserId) -> Result<Vec<Payment>, ApplicationError> {
        Ok(self.payments.list_for_user(user_id).await?)
    }

    /// Stored state for terminal payments; otherwise one gateway poll. A failed poll
    /// falls back to the stored row.
    pub async fn payment_status(
        &self,
        user_id: UserId,
        id: PaymentId,
    ) -> Result<Payment, ApplicationError> {
        let payment = self
            .payments
            .find_by_id(id)
            .await?
            .filter(|payment| payment.user_id == user_id)
            .ok_or_else(|| ApplicationError::NotFound(format!("payment {id}")))?;
        if payment.status.is_terminal() {
            return Ok(payment);
        }

        match self.reconciler.refresh(payment.clone()).await {
            Ok(refreshed) => Ok(refreshed),
            Err(error) => {
                warn!(
                    event_name = "billing.status_poll.failed",
                    payment_id = id.0,
                    error = %error,
                    "gateway poll failed; returning stored state"
                );
                Ok(payment)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use tgdesk_core::domain::subscription::NewSubscription;
    use tgdesk_core::{
        ApplicationError, PaymentId, PaymentStatus, Subscription, SubscriptionId,
        SubscriptionPlan, SubscriptionStatus, UserId, WebhookPayload,
    };
    use tgdesk_db::repositories::{
        InMemorySubscriptionRepository, PaymentRepository, RepositoryError,
        SubscriptionRepository,
    };

    use super::{BillingService, SubscribeInput};
    use crate::telegapay::reconciler::test_support::{harness, Harness};
    use crate::telegapay::PaymentReconciler;

    /// Delivers a gateway webhook right before the subscription row is written.
    struct WebhookBeforeInsert {
        inner: Arc<InMemorySubscriptionRepository>,
        reconciler: Arc<PaymentReconciler>,
        webhook: WebhookPayload,
    }

    #[async_trait]
    impl SubscriptionRepository for WebhookBeforeInsert {
        async fn insert(
            &self,
            subscription: NewSubscription,
        ) -> Result<Subscription, RepositoryError> {
            self.reconciler.handle_webhook(&self.webhook).await.expect("webhook applied");
            self.inner.insert(subscription).await
        }

        async fn find_by_id(
            &self,
            id: SubscriptionId,
        ) -> Result<Option<Subscription>, RepositoryError> {
            self.inner.find_by_id(id).await
        }

        async fn find_by_payment(
            &self,
            payment_id: PaymentId,
        ) -> Result<Option<Subscription>, RepositoryError> {
            self.inner.find_by_payment(payment_id).await
        }

        async fn list_for_user(
            &self,
            user_id: UserId,
        ) -> Result<Vec<Subscription>, RepositoryError> {
            self.inner.list_for_user(user_id).await
        }

        async fn update_if_status(
            &self,
            subscription: &Subscription,
            expected: SubscriptionStatus,
        ) -> Result<bool, RepositoryError> {
            self.inner.update_if_status(subscription, expected).await
        }
    }

    fn service(h: &Harness) -> BillingService {
        BillingService::new(h.reconciler.clone(), h.payments.clone(), h.subscriptions.clone())
    }

    fn premium() -> SubscribeInput {
        SubscribeInput {
            bot_id: 12,
            plan: SubscriptionPlan::Premium,
            payment_method: None,
            return_url: Some("https://bot.example/done".to_string()),
        }
    }

    #[tokio::test]
    async fn subscribe_charges_plan_price_and_links_pending_subscription() {
        let h = harness().await;
        h.gateway.script(
            "create_paylink",
            Ok(json!({
                "data": {
                    "transaction_id": "tx-p",
                    "status": "awaiting",
                    "link": "https://pay/tx-p"
                }
            })),
        );

        let checkout = service(&h).subscribe(h.user_id, premium()).await.expect("checkout");

        assert_eq!(checkout.subscription.status, SubscriptionStatus::Pending);
        assert_eq!(checkout.subscription.plan, SubscriptionPlan::Premium);
        let payment = h
            .payments
            .find_by_id(checkout.subscription.payment_id.expect("linked"))
            .await
            .expect("read")
            .expect("payment");
        assert_eq!(payment.amount, SubscriptionPlan::Premium.price());
        assert_eq!(payment.description.as_deref(), Some("Subscription PREMIUM"));
        assert_eq!(checkout.payment_url.as_deref(), Some("https://pay/tx-p"));
    }

    #[tokio::test]
    async fn webhook_that_beats_the_subscription_row_still_activates_it() {
        let h = harness().await;
        h.gateway.script(
            "create_paylink",
            Ok(json!({ "data": { "transaction_id": "tx-race", "status": "awaiting" } })),
        );
        let webhook = serde_json::from_value(json!({
            "transaction_id": "tx-race",
            "status": "paid",
            "type": "payin"
        }))
        .expect("webhook");
        let racing = Arc::new(WebhookBeforeInsert {
            inner: h.subscriptions.clone(),
            reconciler: h.reconciler.clone(),
            webhook,
        });
        let billing = BillingService::new(h.reconciler.clone(), h.payments.clone(), racing);

        let checkout = billing.subscribe(h.user_id, premium()).await.expect("checkout");

        assert_eq!(checkout.subscription.status, SubscriptionStatus::Paid);
        let payment =
            h.payments.find_by_id(PaymentId(checkout.payment_id)).await.expect("read");
        assert_eq!(payment.map(|payment| payment.status), Some(PaymentStatus::Paid));
        assert_eq!(h.publisher.published().await.len(), 1);
    }

    #[tokio::test]
    async fn conflict_cancels_the_new_subscription() {
        let h = harness().await;
        h.gateway.script(
            "create_paylink",
            Err(ApplicationError::ActivePaymentConflict("active payment exists".to_string())),
        );

        let checkout = service(&h).subscribe(h.user_id, premium()).await.expect("checkout");

        assert!(checkout.active_payment_conflict);
        assert_eq!(checkout.subscription.status, SubscriptionStatus::Cancelled);
        assert!(checkout
            .payment_url
            .as_deref()
            .is_some_and(|url| url.ends_with("return_url=https://bot.example/done")));
    }

    #[tokio::test]
    async fn terminal_payment_status_skips_the_gateway() {
        let h = harness().await;
        h.gateway.script(
            "create_paylink",
            Ok(json!({ "data": { "transaction_id": "tx-t", "status": "failed" } })),
        );
        let billing = service(&h);
        let checkout = billing.subscribe(h.user_id, premium()).await.expect("checkout");

        let payment = billing
            .payment_status(h.user_id, PaymentId(checkout.payment_id))
            .await
            .expect("status");

        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(h.gateway.count("check_status"), 0);
        assert_eq!(checkout.subscription.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn pending_payment_status_polls_once_and_activates() {
        let h = harness().await;
        h.gateway.script(
            "create_paylink",
            Ok(json!({ "data": { "transaction_id": "tx-q", "status": "awaiting" } })),
        );
        h.gateway.script("check_status", Ok(json!({ "data": { "status": "completed" } })));
        let billing = service(&h);
        let checkout = billing.subscribe(h.user_id, premium()).await.expect("checkout");

        let payment = billing
            .payment_status(h.user_id, PaymentId(checkout.payment_id))
            .await
            .expect("status");

        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(h.gateway.count("check_status"), 1);
        let subscription = h
            .subscriptions
            .find_by_id(checkout.subscription.id)
            .await
            .expect("read")
            .expect("subscription");
        assert_eq!(subscription.status, SubscriptionStatus::Paid);
    }

    #[tokio::test]
    async fn other_users_rows_are_not_found() {
        let h = harness().await;
        h.gateway.script("create_paylink", Ok(json!({ "data": { "transaction_id": "tx-o" } })));
        let billing = service(&h);
        let checkout = billing.subscribe(h.user_id, premium()).await.expect("checkout");
        let stranger = UserId(h.user_id.0 + 100);

        assert!(matches!(
            billing.subscription(stranger, checkout.subscription.id).await,
            Err(ApplicationError::NotFound(_))
        ));
        assert!(matches!(
            billing.subscription(h.user_id, SubscriptionId(999)).await,
            Err(ApplicationError::NotFound(_))
        ));
        assert!(billing.payments(stranger).await.expect("list").is_empty());
        assert!(matches!(billing.plan("GOLD"), Err(ApplicationError::NotFound(_))));
        assert_eq!(billing.plans().len(), 3);
    }
}
