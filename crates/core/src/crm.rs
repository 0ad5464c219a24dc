//! Uniform capability contract over external CRM providers.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use crate::domain::connection::{CrmConnection, CrmProvider};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub telegram_id: Option<i64>,
    #[serde(default)]
    pub telegram_username: Option<String>,
    #[serde(default)]
    pub bot_id: Option<i64>,
}

impl ContactInput {
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.name.as_deref().filter(|name| !name.trim().is_empty()) {
            return Some(name.trim().to_string());
        }

        let joined = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!joined.is_empty()).then_some(joined)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInput {
    pub contact_id: String,
    pub plan_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default)]
    pub status: Option<String>,
    /// Provider-specific fields passed through untouched.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentInput {
    pub contact_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInput {
    pub contact_id: String,
    pub server_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub raw: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrmRecord {
    pub id: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub raw: Value,
}

impl CrmRecord {
    pub fn raw(raw: Value) -> Self {
        Self { id: None, name: None, status: None, raw }
    }
}

/// Aggregate lookup; each field is `None` when its own fetch failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrmUserData {
    pub contact: Option<CrmContact>,
    pub subscriptions: Option<CrmRecord>,
    pub payments: Option<CrmRecord>,
}

/// Protocol translation for one provider. Every call carries the caller's own connection.
///
/// Adapters log and return outbound failures without retrying and never touch local state.
#[async_trait]
pub trait CrmAdapter: Send + Sync {
    fn provider(&self) -> CrmProvider;

    async fn create_contact(
        &self,
        connection: &CrmConnection,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError>;

    async fn get_contact_info(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> Result<CrmContact, ApplicationError>;

    async fn update_contact(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError>;

    async fn delete_contact(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> Result<(), ApplicationError>;

    async fn create_subscription(
        &self,
        connection: &CrmConnection,
        input: &SubscriptionInput,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn get_subscription_info(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn update_subscription(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
        patch: &RecordPatch,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn cancel_subscription(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn create_payment(
        &self,
        connection: &CrmConnection,
        input: &PaymentInput,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn get_payment_info(
        &self,
        connection: &CrmConnection,
        payment_id: &str,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn refund_payment(
        &self,
        connection: &CrmConnection,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn get_servers(&self, connection: &CrmConnection)
        -> Result<Vec<CrmRecord>, ApplicationError>;

    async fn get_server_info(
        &self,
        connection: &CrmConnection,
        server_id: &str,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn update_server_status(
        &self,
        connection: &CrmConnection,
        server_id: &str,
        status: &str,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn generate_config(
        &self,
        connection: &CrmConnection,
        input: &ConfigInput,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn get_config_info(
        &self,
        connection: &CrmConnection,
        config_id: &str,
    ) -> Result<CrmRecord, ApplicationError>;

    async fn revoke_config(
        &self,
        connection: &CrmConnection,
        config_id: &str,
    ) -> Result<CrmRecord, ApplicationError>;

    /// Contact, subscription and payment lookups run concurrently; a failing lookup
    /// leaves its field empty and is logged.
    async fn get_all_user_data(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> CrmUserData {
        let (contact, subscriptions, payments) = tokio::join!(
            self.get_contact_info(connection, contact_id),
            self.get_subscription_info(connection, contact_id),
            self.get_payment_info(connection, contact_id),
        );

        CrmUserData {
            contact: keep_or_log(self.provider(), "contact", contact),
            subscriptions: keep_or_log(self.provider(), "subscriptions", subscriptions),
            payments: keep_or_log(self.provider(), "payments", payments),
        }
    }
}

fn keep_or_log<T>(
    provider: CrmProvider,
    field: &'static str,
    result: Result<T, ApplicationError>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            error!(
                event_name = "crm.user_data.partial_failure",
                provider = %provider,
                field,
                error = %err,
                "crm aggregate sub-fetch failed"
            );
            None
        }
    }
}

/// Reads an identifier that providers send either as a JSON string or a number.
pub fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
