//! Request context, caller identity and error rendering shared by the HTTP routers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use tgdesk_core::{ApplicationError, CrmProvider, InterfaceError, UserId};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(error: ApplicationError, correlation_id: &str) -> Self {
        let detail = error.to_string();
        let interface = error.into_interface(correlation_id);
        let status = match &interface {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Internal { .. } => {
                error!(
                    event_name = "http.request.internal_error",
                    correlation_id,
                    error = %detail,
                    "request failed"
                );
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            body: ErrorBody {
                error: interface.public_message(),
                correlation_id: correlation_id.to_string(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>, correlation_id: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorBody { error: message.into(), correlation_id: correlation_id.to_string() },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &ErrorBody {
        &self.body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Per-request correlation id, taken from `x-request-id` or generated.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub correlation_id: String,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let correlation_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty() && value.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self { correlation_id }
    }

    pub fn fail(&self, error: ApplicationError) -> ApiError {
        ApiError::new(error, &self.correlation_id)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

/// Caller identity injected by the upstream auth layer as `x-user-id`.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub context: RequestContext,
}

impl AuthenticatedUser {
    pub fn fail(&self, error: ApplicationError) -> ApiError {
        self.context.fail(error)
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let context = RequestContext::from_headers(&parts.headers);
        let Some(raw) = parts.headers.get(USER_ID_HEADER) else {
            warn!(
                event_name = "http.auth.missing_identity",
                correlation_id = %context.correlation_id,
                "request without caller identity"
            );
            return Err(ApiError::unauthorized("missing caller identity", &context.correlation_id));
        };

        let user_id = raw
            .to_str()
            .map_err(|_| ApplicationError::Validation("malformed user id header".to_string()))
            .and_then(UserId::parse)
            .map_err(|error| context.fail(error))?;
        Ok(Self { user_id, context })
    }
}

/// Optional `?provider=` assertion. Unknown names fail as `UnsupportedProvider`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProviderQuery {
    #[serde(default)]
    pub provider: Option<String>,
}

impl ProviderQuery {
    pub fn expected(&self) -> Result<Option<CrmProvider>, ApplicationError> {
        self.provider
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(str::parse::<CrmProvider>)
            .transpose()
    }
}
