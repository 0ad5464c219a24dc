use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde_json::Value;
use tracing::error;

use tgdesk_core::{ApplicationError, CrmConnection, CrmProvider};

use crate::outbound;

/// Bearer-authenticated JSON transport shared by the CRM adapters.
pub struct ProviderHttp {
    client: Client,
    provider: CrmProvider,
}

impl ProviderHttp {
    pub fn new(provider: CrmProvider, timeout: Duration) -> Result<Self, ApplicationError> {
        let client = outbound::build_client(timeout, provider.as_str())?;
        Ok(Self { client, provider })
    }

    pub async fn send(
        &self,
        connection: &CrmConnection,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApplicationError> {
        let target = self.provider.as_str();
        let mut request = self
            .client
            .request(method.clone(), url)
            .bearer_auth(connection.access_token.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|err| {
            error!(
                event_name = "crm.outbound.transport_failed",
                provider = %self.provider,
                connection_id = connection.id.0,
                method = %method,
                url,
                error = %err,
                "crm request did not complete"
            );
            outbound::transport_error(target, &err)
        })?;

        let status = response.status();
        let payload = outbound::read_body(target, response).await?;
        if status.is_success() {
            return Ok(payload);
        }

        let message = outbound::error_message(status, &payload);
        error!(
            event_name = "crm.outbound.rejected",
            provider = %self.provider,
            connection_id = connection.id.0,
            method = %method,
            url,
            status = status.as_u16(),
            error = %message,
            "crm request rejected by provider"
        );

        Err(match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                ApplicationError::Validation(format!("{target}: {message}"))
            }
            StatusCode::NOT_FOUND => ApplicationError::NotFound(format!("{target}: {message}")),
            _ => ApplicationError::gateway(format!("{target} returned {status}: {message}")),
        })
    }
}

/// Account base URL stored on the connection. A bare host gets an https scheme.
pub fn domain_base(connection: &CrmConnection) -> Result<String, ApplicationError> {
    let domain = connection
        .domain
        .as_deref()
        .map(str::trim)
        .filter(|domain| !domain.is_empty())
        .ok_or_else(|| {
            ApplicationError::Validation(format!(
                "{} connection {} has no domain",
                connection.provider, connection.id.0
            ))
        })?;

    let base = domain.trim_end_matches('/');
    if base.contains("://") {
        Ok(base.to_string())
    } else {
        Ok(format!("https://{base}"))
    }
}


#[cfg(test)]
mod tests {
    use tgdesk_core::{ApplicationError, CrmProvider};

    use super::domain_base;
    use super::test_support::connection;

    #[test]
    fn domain_base_normalizes_scheme_and_trailing_slash() {
        let bare = connection(CrmProvider::AmoCrm, Some("acme.amocrm.ru/".to_string()));
        assert_eq!(domain_base(&bare).expect("base"), "https://acme.amocrm.ru");

        let explicit = connection(CrmProvider::Bitrix24, Some("http://127.0.0.1:9000".to_string()));
        assert_eq!(domain_base(&explicit).expect("base"), "http://127.0.0.1:9000");

        let missing = connection(CrmProvider::AmoCrm, None);
        assert!(matches!(domain_base(&missing), Err(ApplicationError::Validation(_))));
    }
}
