//! `/api/v1/crm` endpoints. Every capability call runs against the caller's own connection.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tgdesk_core::crm::{
    ConfigInput, ContactInput, CrmContact, CrmRecord, CrmUserData, PaymentInput, RecordPatch,
    SubscriptionInput,
};
use tgdesk_core::domain::connection::{CrmConnectionPatch, NewCrmConnection};
use tgdesk_core::{ApplicationError, CrmConnection, CrmConnectionId, CrmProvider, UserId};

use super::{ConnectionService, CrmDispatcher};
use crate::api::{ApiError, AuthenticatedUser, ProviderQuery};

#[derive(Clone)]
pub struct CrmState {
    pub connections: ConnectionService,
    pub dispatcher: Arc<CrmDispatcher>,
}

pub fn router(state: CrmState) -> Router {
    Router::new()
        .route("/api/v1/crm/connections", get(list_connections).post(upsert_connection))
        .route("/api/v1/crm/connections/me", get(my_connection))
        .route(
            "/api/v1/crm/connections/{id}",
            get(get_connection).patch(update_connection).delete(delete_connection),
        )
        .route("/api/v1/crm/contacts", post(create_contact))
        .route(
            "/api/v1/crm/contacts/{id}",
            get(get_contact).patch(update_contact).delete(delete_contact),
        )
        .route("/api/v1/crm/contacts/{id}/data", get(get_all_user_data))
        .route("/api/v1/crm/subscriptions", post(create_subscription))
        .route(
            "/api/v1/crm/subscriptions/{id}",
            get(get_subscription).patch(update_subscription),
        )
        .route("/api/v1/crm/subscriptions/{id}/cancel", post(cancel_subscription))
        .route("/api/v1/crm/payments", post(create_payment))
        .route("/api/v1/crm/payments/{id}", get(get_payment))
        .route("/api/v1/crm/payments/{id}/refund", post(refund_payment))
        .route("/api/v1/crm/servers", get(get_servers))
        .route("/api/v1/crm/servers/{id}", get(get_server))
        .route("/api/v1/crm/servers/{id}/status", put(update_server_status))
        .route("/api/v1/crm/configs", post(generate_config))
        .route("/api/v1/crm/configs/{id}", get(get_config))
        .route("/api/v1/crm/configs/{id}/revoke", post(revoke_config))
        .with_state(state)
}

/// Connection as returned to callers. Credentials never leave the service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionView {
    pub id: i64,
    pub user_id: i64,
    pub provider: CrmProvider,
    pub domain: Option<String>,
    pub has_refresh_token: bool,
    pub other_data: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<CrmConnection> for ConnectionView {
    fn from(connection: CrmConnection) -> Self {
        Self {
            id: connection.id.0,
            user_id: connection.user_id.0,
            provider: connection.provider,
            domain: connection.domain,
            has_refresh_token: connection.refresh_token.is_some(),
            other_data: connection.other_data,
            expires_at: connection.expires_at,
            is_active: connection.is_active,
            created_at: connection.created_at,
            updated_at: connection.updated_at,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpsertConnectionRequest {
    pub provider: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub other_data: Option<Value>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UpdateConnectionRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub other_data: Option<Value>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RefundRequest {
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub amount: Option<Decimal>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerStatusRequest {
    pub status: String,
}

fn parse_provider(raw: &str) -> Result<CrmProvider, ApplicationError> {
    raw.parse()
}

fn require_token(raw: String, field: &str) -> Result<SecretString, ApplicationError> {
    if raw.trim().is_empty() {
        return Err(ApplicationError::Validation(format!("{field} must not be empty")));
    }
    Ok(SecretString::from(raw))
}

fn connection_id(raw: i64) -> Result<CrmConnectionId, ApplicationError> {
    if raw <= 0 {
        let message = format!("connection id must be positive, got {raw}");
        return Err(ApplicationError::Validation(message));
    }
    Ok(CrmConnectionId(raw))
}

async fn list_connections(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<ConnectionView>>, ApiError> {
    let connections =
        state.connections.list(user.user_id).await.map_err(|error| user.fail(error))?;
    Ok(Json(connections.into_iter().map(ConnectionView::from).collect()))
}

async fn upsert_connection(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Json(request): Json<UpsertConnectionRequest>,
) -> Result<(StatusCode, Json<ConnectionView>), ApiError> {
    let connection = build_new_connection(user.user_id, request).map_err(|error| user.fail(error))?;
    let stored = state.connections.upsert(connection).await.map_err(|error| user.fail(error))?;
    Ok((StatusCode::CREATED, Json(stored.into())))
}

fn build_new_connection(
    user_id: UserId,
    request: UpsertConnectionRequest,
) -> Result<NewCrmConnection, ApplicationError> {
    Ok(NewCrmConnection {
        user_id,
        provider: parse_provider(&request.provider)?,
        access_token: require_token(request.access_token, "access_token")?,
        refresh_token: request.refresh_token.map(SecretString::from),
        domain: request.domain,
        other_data: request.other_data,
        expires_at: request.expires_at,
    })
}

async fn my_connection(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
) -> Result<Json<ConnectionView>, ApiError> {
    let connection =
        state.connections.get_for_user(user.user_id).await.map_err(|error| user.fail(error))?;
    Ok(Json(connection.into()))
}

async fn get_connection(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<Json<ConnectionView>, ApiError> {
    let id = connection_id(id).map_err(|error| user.fail(error))?;
    let connection =
        state.connections.get(user.user_id, id).await.map_err(|error| user.fail(error))?;
    Ok(Json(connection.into()))
}

async fn update_connection(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(request): Json<UpdateConnectionRequest>,
) -> Result<Json<ConnectionView>, ApiError> {
    let result = async {
        let id = connection_id(id)?;
        let patch = CrmConnectionPatch {
            provider: request.provider.as_deref().map(parse_provider).transpose()?,
            access_token: request
                .access_token
                .map(|token| require_token(token, "access_token"))
                .transpose()?,
            refresh_token: request.refresh_token.map(SecretString::from),
            domain: request.domain,
            other_data: request.other_data,
            expires_at: request.expires_at,
            is_active: request.is_active,
        };
        state.connections.update(user.user_id, id, patch).await
    }
    .await;
    result.map(|connection| Json(connection.into())).map_err(|error| user.fail(error))
}

async fn delete_connection(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let id = connection_id(id).map_err(|error| user.fail(error))?;
    state.connections.delete(user.user_id, id).await.map_err(|error| user.fail(error))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Resolves the caller's connection and the optional provider assertion.
async fn caller_connection(
    state: &CrmState,
    user: &AuthenticatedUser,
    query: &ProviderQuery,
) -> Result<(CrmConnection, Option<CrmProvider>), ApiError> {
    let expected = query.expected().map_err(|error| user.fail(error))?;
    let connection =
        state.connections.active_for_user(user.user_id).await.map_err(|error| user.fail(error))?;
    Ok((connection, expected))
}

async fn create_contact(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Query(query): Query<ProviderQuery>,
    Json(input): Json<ContactInput>,
) -> Result<(StatusCode, Json<CrmContact>), ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let contact = state
        .dispatcher
        .create_contact(&connection, expected, &input)
        .await
        .map_err(|error| user.fail(error))?;
    Ok((StatusCode::CREATED, Json(contact)))
}

async fn get_contact(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CrmContact>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.get_contact_info(&connection, &id).await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn update_contact(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
    Json(input): Json<ContactInput>,
) -> Result<Json<CrmContact>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        let adapter = state.dispatcher.route(&connection, expected)?;
        adapter.update_contact(&connection, &id, &input).await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn delete_contact(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<StatusCode, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.delete_contact(&connection, &id).await
    }
    .await;
    result.map(|()| StatusCode::NO_CONTENT).map_err(|error| user.fail(error))
}

async fn get_all_user_data(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CrmUserData>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let adapter = state.dispatcher.route(&connection, expected).map_err(|error| user.fail(error))?;
    Ok(Json(adapter.get_all_user_data(&connection, &id).await))
}

async fn create_subscription(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Query(query): Query<ProviderQuery>,
    Json(input): Json<SubscriptionInput>,
) -> Result<(StatusCode, Json<CrmRecord>), ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        let adapter = state.dispatcher.route(&connection, expected)?;
        adapter.create_subscription(&connection, &input).await
    }
    .await;
    result.map(|record| (StatusCode::CREATED, Json(record))).map_err(|error| user.fail(error))
}

async fn get_subscription(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.get_subscription_info(&connection, &id).await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn update_subscription(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
    Json(patch): Json<RecordPatch>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state
            .dispatcher
            .route(&connection, expected)?
            .update_subscription(&connection, &id, &patch)
            .await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn cancel_subscription(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.cancel_subscription(&connection, &id).await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn create_payment(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Query(query): Query<ProviderQuery>,
    Json(input): Json<PaymentInput>,
) -> Result<(StatusCode, Json<CrmRecord>), ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        if input.amount <= Decimal::ZERO {
            return Err(ApplicationError::Validation("amount must be positive".to_string()));
        }
        state.dispatcher.route(&connection, expected)?.create_payment(&connection, &input).await
    }
    .await;
    result.map(|record| (StatusCode::CREATED, Json(record))).map_err(|error| user.fail(error))
}

async fn get_payment(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.get_payment_info(&connection, &id).await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn refund_payment(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
    Json(request): Json<RefundRequest>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state
            .dispatcher
            .route(&connection, expected)?
            .refund_payment(&connection, &id, request.amount)
            .await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn get_servers(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<Vec<CrmRecord>>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result =
        async { state.dispatcher.route(&connection, expected)?.get_servers(&connection).await }
            .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn get_server(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.get_server_info(&connection, &id).await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn update_server_status(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
    Json(request): Json<ServerStatusRequest>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        if request.status.trim().is_empty() {
            return Err(ApplicationError::Validation("status must not be empty".to_string()));
        }
        state
            .dispatcher
            .route(&connection, expected)?
            .update_server_status(&connection, &id, request.status.trim())
            .await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn generate_config(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Query(query): Query<ProviderQuery>,
    Json(input): Json<ConfigInput>,
) -> Result<(StatusCode, Json<CrmRecord>), ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.generate_config(&connection, &input).await
    }
    .await;
    result.map(|record| (StatusCode::CREATED, Json(record))).map_err(|error| user.fail(error))
}

async fn get_config(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.get_config_info(&connection, &id).await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}

async fn revoke_config(
    State(state): State<CrmState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<ProviderQuery>,
) -> Result<Json<CrmRecord>, ApiError> {
    let (connection, expected) = caller_connection(&state, &user, &query).await?;
    let result = async {
        state.dispatcher.route(&connection, expected)?.revoke_config(&connection, &id).await
    }
    .await;
    result.map(Json).map_err(|error| user.fail(error))
}
