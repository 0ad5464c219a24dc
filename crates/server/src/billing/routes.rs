//! `/api/v1/billing` endpoints, scoped to the calling user.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use tgdesk_core::domain::subscription::PlanDetails;
use tgdesk_core::{
    ApplicationError, Payment, PaymentId, Subscription, SubscriptionId, SubscriptionPlan,
};

use super::{BillingService, Checkout, SubscribeInput};
use crate::api::{ApiError, AuthenticatedUser, RequestContext};

#[derive(Clone)]
pub struct BillingState {
    pub billing: BillingService,
}

pub fn router(state: BillingState) -> Router {
    Router::new()
        .route("/api/v1/billing/plans", get(list_plans))
        .route("/api/v1/billing/plans/{plan}", get(get_plan))
        .route("/api/v1/billing/subscriptions", get(list_subscriptions).post(subscribe))
        .route("/api/v1/billing/subscriptions/{id}", get(get_subscription))
        .route("/api/v1/billing/payments", get(list_payments))
        .route("/api/v1/billing/payments/{id}/status", get(payment_status))
        .with_state(state)
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscribeRequest {
    pub bot_id: i64,
    pub plan: String,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
}

async fn list_plans(State(state): State<BillingState>) -> Json<Vec<PlanDetails>> {
    Json(state.billing.plans())
}

async fn get_plan(
    State(state): State<BillingState>,
    context: RequestContext,
    Path(plan): Path<String>,
) -> Result<Json<PlanDetails>, ApiError> {
    let details = state.billing.plan(&plan).map_err(|error| context.fail(error))?;
    Ok(Json(details))
}

async fn subscribe(
    State(state): State<BillingState>,
    user: AuthenticatedUser,
    Json(request): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<Checkout>), ApiError> {
    let plan = SubscriptionPlan::parse(&request.plan)
        .ok_or_else(|| ApplicationError::Validation(format!("unknown plan `{}`", request.plan)))
        .map_err(|error| user.fail(error))?;
    let checkout = state
        .billing
        .subscribe(
            user.user_id,
            SubscribeInput {
                bot_id: request.bot_id,
                plan,
                payment_method: request.payment_method,
                return_url: request.return_url,
            },
        )
        .await
        .map_err(|error| user.fail(error))?;
    Ok((StatusCode::CREATED, Json(checkout)))
}

async fn list_subscriptions(
    State(state): State<BillingState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<Subscription>>, ApiError> {
    let subscriptions =
        state.billing.subscriptions(user.user_id).await.map_err(|error| user.fail(error))?;
    Ok(Json(subscriptions))
}

async fn get_subscription(
    State(state): State<BillingState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<Subscription>, ApiError> {
    let subscription = state
        .billing
        .subscription(user.user_id, SubscriptionId(id))
        .await
        .map_err(|error| user.fail(error))?;
    Ok(Json(subscription))
}

async fn list_payments(
    State(state): State<BillingState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<Payment>>, ApiError> {
    let payments = state.billing.payments(user.user_id).await.map_err(|error| user.fail(error))?;
    Ok(Json(payments))
}

async fn payment_status(
    State(state): State<BillingState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<Payment>, ApiError> {
    let payment = state
        .billing
        .payment_status(user.user_id, PaymentId(id))
        .await
        .map_err(|error| user.fail(error))?;
    Ok(Json(payment))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, BillingState};
    use crate::billing::BillingService;
    use crate::telegapay::reconciler::test_support::{harness, Harness};

    fn state(h: &Harness) -> BillingState {
        BillingState {
            billing: BillingService::new(
                h.reconciler.clone(),
                h.payments.clone(),
                h.subscriptions.clone(),
            ),
        }
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-request-id", "req-billing");
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        let body = body.map(|value| Body::from(value.to_string())).unwrap_or_else(Body::empty);
        builder.body(body).expect("request")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn plan_catalog_is_public() {
        let h = harness().await;

        let all = router(state(&h))
            .oneshot(request("GET", "/api/v1/billing/plans", None, None))
            .await
            .expect("response");
        let basic = router(state(&h))
            .oneshot(request("GET", "/api/v1/billing/plans/basic", None, None))
            .await
            .expect("response");
        let unknown = router(state(&h))
            .oneshot(request("GET", "/api/v1/billing/plans/gold", None, None))
            .await
            .expect("response");

        assert_eq!(all.status(), StatusCode::OK);
        assert_eq!(json_body(all).await.as_array().map(Vec::len), Some(3));
        let basic = json_body(basic).await;
        assert_eq!(basic["id"], "BASIC");
        assert_eq!(basic["duration_days"], 30);
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn subscribe_then_read_back() {
        let h = harness().await;
        h.gateway.script(
            "create_paylink",
            Ok(json!({
                "data": {
                    "transaction_id": "tx-b",
                    "status": "awaiting",
                    "link": "https://pay/tx-b"
                }
            })),
        );
        let user = h.user_id.to_string();

        let created = router(state(&h))
            .oneshot(request(
                "POST",
                "/api/v1/billing/subscriptions",
                Some(&user),
                Some(json!({ "bot_id": 5, "plan": "BASIC" })),
            ))
            .await
            .expect("response");
        assert_eq!(created.status(), StatusCode::CREATED);
        let checkout = json_body(created).await;
        assert_eq!(checkout["subscription"]["status"], "PENDING");
        assert_eq!(checkout["transaction_id"], "tx-b");

        let listed = router(state(&h))
            .oneshot(request("GET", "/api/v1/billing/subscriptions", Some(&user), None))
            .await
            .expect("response");
        assert_eq!(json_body(listed).await.as_array().map(Vec::len), Some(1));

        let payments = router(state(&h))
            .oneshot(request("GET", "/api/v1/billing/payments", Some(&user), None))
            .await
            .expect("response");
        assert_eq!(json_body(payments).await[0]["status"], "PENDING");
    }

    #[tokio::test]
    async fn unknown_plan_is_bad_request_and_foreign_payment_is_not_found() {
        let h = harness().await;
        let user = h.user_id.to_string();

        let bad_plan = router(state(&h))
            .oneshot(request(
                "POST",
                "/api/v1/billing/subscriptions",
                Some(&user),
                Some(json!({ "bot_id": 5, "plan": "GOLD" })),
            ))
            .await
            .expect("response");
        let missing = router(state(&h))
            .oneshot(request("GET", "/api/v1/billing/payments/77/status", Some(&user), None))
            .await
            .expect("response");

        assert_eq!(bad_plan.status(), StatusCode::BAD_REQUEST);
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(missing).await["correlation_id"], "req-billing");
    }
}
