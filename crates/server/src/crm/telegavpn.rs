//! TelegaVPN REST adapter.
//!
//! The service has one public base URL from configuration. A connection that carries its
//! own domain (self-hosted panel) overrides it. The bearer token is always the connection's.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use tgdesk_core::crm::{
    string_field, value_to_id, ConfigInput, ContactInput, CrmAdapter, CrmContact, CrmRecord,
    PaymentInput, RecordPatch, SubscriptionInput,
};
use tgdesk_core::{ApplicationError, CrmConnection, CrmProvider};

use super::http::{domain_base, ProviderHttp};

pub struct TelegaVpnAdapter {
    http: ProviderHttp,
    base_url: String,
}

impl TelegaVpnAdapter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApplicationError> {
        Ok(Self {
            http: ProviderHttp::new(CrmProvider::TelegaVpn, timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn base_for(&self, connection: &CrmConnection) -> Result<String, ApplicationError> {
        if connection.domain.as_deref().is_some_and(|domain| !domain.trim().is_empty()) {
            domain_base(connection)
        } else {
            Ok(self.base_url.clone())
        }
    }

    async fn call(
        &self,
        connection: &CrmConnection,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApplicationError> {
        let url = format!("{}{path}", self.base_for(connection)?);
        self.http.send(connection, method, &url, body).await
    }

    async fn fetch(
        &self,
        connection: &CrmConnection,
        path: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        Ok(record(self.call(connection, Method::GET, path, None).await?))
    }
}

#[async_trait]
impl CrmAdapter for TelegaVpnAdapter {
    fn provider(&self) -> CrmProvider {
        CrmProvider::TelegaVpn
    }

    async fn create_contact(
        &self,
        connection: &CrmConnection,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError> {
        let body = serde_json::to_value(input)
            .map_err(|error| ApplicationError::Validation(format!("contact payload: {error}")))?;
        let created = self.call(connection, Method::POST, "/users", Some(&body)).await?;
        Ok(CrmContact {
            id: value_to_id(&created["id"]),
            name: input.display_name(),
            phone: input.phone.clone(),
            email: input.email.clone(),
            raw: created,
        })
    }

    async fn get_contact_info(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> Result<CrmContact, ApplicationError> {
        let body = self.call(connection, Method::GET, &format!("/users/{contact_id}"), None).await?;
        Ok(CrmContact {
            id: value_to_id(&body["id"]),
            name: string_field(&body, "name").or_else(|| string_field(&body, "username")),
            phone: string_field(&body, "phone"),
            email: string_field(&body, "email"),
            raw: body,
        })
    }

    async fn update_contact(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError> {
        let body = serde_json::to_value(input)
            .map_err(|error| ApplicationError::Validation(format!("contact payload: {error}")))?;
        let updated = self
            .call(connection, Method::PATCH, &format!("/users/{contact_id}"), Some(&body))
            .await?;
        Ok(CrmContact {
            id: Some(contact_id.to_string()),
            name: input.display_name(),
            phone: input.phone.clone(),
            email: input.email.clone(),
            raw: updated,
        })
    }

    async fn delete_contact(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> Result<(), ApplicationError> {
        self.call(connection, Method::DELETE, &format!("/users/{contact_id}"), None).await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        connection: &CrmConnection,
        input: &SubscriptionInput,
    ) -> Result<CrmRecord, ApplicationError> {
        let body = json!({ "userId": input.contact_id, "planId": input.plan_id });
        Ok(record(self.call(connection, Method::POST, "/subscriptions", Some(&body)).await?))
    }

    async fn get_subscription_info(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.fetch(connection, &format!("/subscriptions/{subscription_id}")).await
    }

    async fn update_subscription(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
        patch: &RecordPatch,
    ) -> Result<CrmRecord, ApplicationError> {
        let mut body = patch.fields.clone();
        if let Some(status) = &patch.status {
            body.insert("status".to_string(), json!(status));
        }
        let updated = self
            .call(
                connection,
                Method::PATCH,
                &format!("/subscriptions/{subscription_id}"),
                Some(&Value::Object(body)),
            )
            .await?;
        let mut record = record(updated);
        record.id = record.id.or_else(|| Some(subscription_id.to_string()));
        record.status = record.status.or_else(|| patch.status.clone());
        Ok(record)
    }

    async fn cancel_subscription(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let patch = RecordPatch { status: Some("cancelled".to_string()), ..RecordPatch::default() };
        self.update_subscription(connection, subscription_id, &patch).await
    }

    async fn create_payment(
        &self,
        connection: &CrmConnection,
        input: &PaymentInput,
    ) -> Result<CrmRecord, ApplicationError> {
        let body = json!({
            "userId": input.contact_id,
            "amount": input.amount.to_f64(),
            "currency": input.currency,
        });
        Ok(record(self.call(connection, Method::POST, "/payments", Some(&body)).await?))
    }

    async fn get_payment_info(
        &self,
        connection: &CrmConnection,
        payment_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.fetch(connection, &format!("/payments/{payment_id}")).await
    }

    async fn refund_payment(
        &self,
        connection: &CrmConnection,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<CrmRecord, ApplicationError> {
        let body = match amount {
            Some(amount) => json!({ "status": "refunded", "amount": amount.to_f64() }),
            None => json!({ "status": "refunded" }),
        };
        let updated = self
            .call(connection, Method::PATCH, &format!("/payments/{payment_id}"), Some(&body))
            .await?;
        let mut record = record(updated);
        record.id = record.id.or_else(|| Some(payment_id.to_string()));
        Ok(record)
    }

    async fn get_servers(
        &self,
        connection: &CrmConnection,
    ) -> Result<Vec<CrmRecord>, ApplicationError> {
        let body = self.call(connection, Method::GET, "/servers", None).await?;
        match body {
            Value::Array(items) => Ok(items.into_iter().map(record).collect()),
            other => Err(ApplicationError::gateway(format!(
                "TELEGA_VPN server list was not an array: {other}"
            ))),
        }
    }

    async fn get_server_info(
        &self,
        connection: &CrmConnection,
        server_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.fetch(connection, &format!("/servers/{server_id}")).await
    }

    async fn update_server_status(
        &self,
        connection: &CrmConnection,
        server_id: &str,
        status: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let updated = self
            .call(
                connection,
                Method::PUT,
                &format!("/servers/{server_id}/status"),
                Some(&json!({ "status": status })),
            )
            .await?;
        let mut record = record(updated);
        record.id = record.id.or_else(|| Some(server_id.to_string()));
        record.status = Some(status.to_string());
        Ok(record)
    }

    async fn generate_config(
        &self,
        connection: &CrmConnection,
        input: &ConfigInput,
    ) -> Result<CrmRecord, ApplicationError> {
        let body = json!({ "userId": input.contact_id, "serverId": input.server_id });
        Ok(record(self.call(connection, Method::POST, "/configs", Some(&body)).await?))
    }

    async fn get_config_info(
        &self,
        connection: &CrmConnection,
        config_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.fetch(connection, &format!("/configs/{config_id}")).await
    }

    async fn revoke_config(
        &self,
        connection: &CrmConnection,
        config_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let body =
            self.call(connection, Method::DELETE, &format!("/configs/{config_id}"), None).await?;
        Ok(CrmRecord {
            id: Some(config_id.to_string()),
            name: None,
            status: Some("revoked".to_string()),
            raw: body,
        })
    }
}

fn record(body: Value) -> CrmRecord {
    CrmRecord {
        id: value_to_id(&body["id"]),
        name: string_field(&body, "name"),
        status: string_field(&body, "status"),
        raw: body,
    }
}
