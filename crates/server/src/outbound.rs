//! Shared plumbing for calls to third-party HTTP APIs.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tgdesk_core::ApplicationError;

pub fn build_client(timeout: Duration, purpose: &str) -> Result<Client, ApplicationError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|error| ApplicationError::Configuration(format!("{purpose} http client: {error}")))
}

/// Timeouts and connection failures are transient; anything else from the transport is not.
pub fn transport_error(target: &str, error: &reqwest::Error) -> ApplicationError {
    let message = format!("{target} request failed: {error}");
    if error.is_timeout() || error.is_connect() {
        ApplicationError::transient_gateway(message)
    } else {
        ApplicationError::gateway(message)
    }
}

/// Body is decoded as JSON when possible; a non-JSON body is kept as a string.
pub async fn read_body(
    target: &str,
    response: reqwest::Response,
) -> Result<Value, ApplicationError> {
    let text = response.text().await.map_err(|error| transport_error(target, &error))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

/// Provider error text: `error`, then `details`, then `message`, then the HTTP reason.
pub fn error_message(status: StatusCode, body: &Value) -> String {
    let from_field = |key: &str| match body.get(key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.clone()),
        Some(Value::Object(inner)) => {
            inner.get("message").and_then(Value::as_str).map(str::to_string)
        }
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };

    from_field("error")
        .or_else(|| from_field("details"))
        .or_else(|| from_field("message"))
        .or_else(|| body.as_str().map(str::to_string).filter(|text| text.len() <= 200))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unexpected status").to_string())
}
