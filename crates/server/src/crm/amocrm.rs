//! AmoCRM v4 adapter. Subscriptions, payments and configs are modelled as leads.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{info, warn};

use tgdesk_core::crm::{
    string_field, value_to_id, ConfigInput, ContactInput, CrmAdapter, CrmContact, CrmRecord,
    PaymentInput, RecordPatch, SubscriptionInput,
};
use tgdesk_core::{ApplicationError, CrmConnection, CrmProvider};

use super::http::{domain_base, ProviderHttp};

const PLAN_FIELD_ID: i64 = 123_460;
const SUBSCRIPTION_STATUS_FIELD_ID: i64 = 123_461;
const CURRENCY_FIELD_ID: i64 = 123_462;
const SERVER_CATALOG_ID: i64 = 123_463;
const SERVER_STATUS_FIELD_ID: i64 = 123_464;
const SERVER_FIELD_ID: i64 = 123_465;

const STATUS_CANCELLED: i64 = 143;
const STATUS_REFUNDED: i64 = 144;
const STATUS_REVOKED: i64 = 145;

pub struct AmoCrmAdapter {
    http: ProviderHttp,
}

impl AmoCrmAdapter {
    pub fn new(timeout: Duration) -> Result<Self, ApplicationError> {
        Ok(Self { http: ProviderHttp::new(CrmProvider::AmoCrm, timeout)? })
    }

    async fn call(
        &self,
        connection: &CrmConnection,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApplicationError> {
        let url = format!("{}{path}", domain_base(connection)?);
        self.http.send(connection, method, &url, body).await
    }

    async fn get_lead(
        &self,
        connection: &CrmConnection,
        lead_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let path = format!("/api/v4/leads/{lead_id}");
        let body = self.call(connection, Method::GET, &path, None).await?;
        Ok(lead_record(body))
    }

    async fn create_lead(
        &self,
        connection: &CrmConnection,
        lead: Value,
    ) -> Result<CrmRecord, ApplicationError> {
        let body =
            self.call(connection, Method::POST, "/api/v4/leads", Some(&json!([lead]))).await?;
        let first = first_embedded(&body, "leads").cloned().unwrap_or(Value::Null);
        Ok(CrmRecord { raw: body, ..lead_record(first) })
    }

    async fn patch_lead(
        &self,
        connection: &CrmConnection,
        lead_id: &str,
        patch: Value,
    ) -> Result<CrmRecord, ApplicationError> {
        let body = self
            .call(connection, Method::PATCH, &format!("/api/v4/leads/{lead_id}"), Some(&patch))
            .await?;
        Ok(lead_record(body))
    }
}

#[async_trait]
impl CrmAdapter for AmoCrmAdapter {
    fn provider(&self) -> CrmProvider {
        CrmProvider::AmoCrm
    }

    async fn create_contact(
        &self,
        connection: &CrmConnection,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError> {
        let body = self
            .call(connection, Method::POST, "/api/v4/contacts", Some(&json!([contact_body(input)])))
            .await?;
        let created = first_embedded(&body, "contacts").cloned().unwrap_or(Value::Null);
        info!(
            event_name = "crm.contact.created",
            provider = "AMOCRM",
            connection_id = connection.id.0,
            contact_id = ?value_to_id(&created["id"]),
            "amocrm contact created"
        );
        Ok(CrmContact {
            id: value_to_id(&created["id"]),
            name: input.display_name(),
            phone: input.phone.clone(),
            email: input.email.clone(),
            raw: body,
        })
    }

    async fn get_contact_info(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> Result<CrmContact, ApplicationError> {
        let path = format!("/api/v4/contacts/{contact_id}");
        let body = self.call(connection, Method::GET, &path, None).await?;
        Ok(contact_from_body(body))
    }

    async fn update_contact(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError> {
        let body = self
            .call(
                connection,
                Method::PATCH,
                &format!("/api/v4/contacts/{contact_id}"),
                Some(&contact_body(input)),
            )
            .await?;
        let mut contact = contact_from_body(body);
        contact.id = contact.id.or_else(|| Some(contact_id.to_string()));
        Ok(contact)
    }

    async fn delete_contact(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> Result<(), ApplicationError> {
        // The v4 API exposes no contact deletion; the contact stays in the account.
        warn!(
            event_name = "crm.contact.delete_unsupported",
            provider = "AMOCRM",
            connection_id = connection.id.0,
            contact_id,
            "amocrm does not support contact deletion; request acknowledged without effect"
        );
        Ok(())
    }

    async fn create_subscription(
        &self,
        connection: &CrmConnection,
        input: &SubscriptionInput,
    ) -> Result<CrmRecord, ApplicationError> {
        self.create_lead(
            connection,
            json!({
                "name": format!("Subscription {}", input.plan_id),
                "price": 0,
                "_embedded": { "contacts": [{ "id": contact_ref(&input.contact_id) }] },
                "custom_fields_values": [custom_field(PLAN_FIELD_ID, json!(input.plan_id))],
            }),
        )
        .await
    }

    async fn get_subscription_info(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.get_lead(connection, subscription_id).await
    }

    async fn update_subscription(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
        patch: &RecordPatch,
    ) -> Result<CrmRecord, ApplicationError> {
        let mut body = serde_json::Map::new();
        body.insert("id".to_string(), contact_ref(subscription_id));
        if let Some(status) = patch.status.as_deref() {
            body.insert(
                "custom_fields_values".to_string(),
                json!([custom_field(SUBSCRIPTION_STATUS_FIELD_ID, json!(status))]),
            );
        }
        for (key, value) in &patch.fields {
            body.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.patch_lead(connection, subscription_id, Value::Object(body)).await
    }

    async fn cancel_subscription(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.patch_lead(
            connection,
            subscription_id,
            json!({ "id": contact_ref(subscription_id), "status_id": STATUS_CANCELLED }),
        )
        .await
    }

    async fn create_payment(
        &self,
        connection: &CrmConnection,
        input: &PaymentInput,
    ) -> Result<CrmRecord, ApplicationError> {
        self.create_lead(
            connection,
            json!({
                "name": format!("Payment {} {}", input.amount, input.currency),
                "price": lead_price(input.amount),
                "_embedded": { "contacts": [{ "id": contact_ref(&input.contact_id) }] },
                "custom_fields_values": [custom_field(CURRENCY_FIELD_ID, json!(input.currency))],
            }),
        )
        .await
    }

    async fn get_payment_info(
        &self,
        connection: &CrmConnection,
        payment_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.get_lead(connection, payment_id).await
    }

    async fn refund_payment(
        &self,
        connection: &CrmConnection,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<CrmRecord, ApplicationError> {
        let mut patch = json!({ "id": contact_ref(payment_id), "status_id": STATUS_REFUNDED });
        if let Some(amount) = amount {
            patch["price"] = lead_price(amount);
        }
        self.patch_lead(connection, payment_id, patch).await
    }

    async fn get_servers(
        &self,
        connection: &CrmConnection,
    ) -> Result<Vec<CrmRecord>, ApplicationError> {
        let body = self
            .call(
                connection,
                Method::GET,
                &format!("/api/v4/catalogs/{SERVER_CATALOG_ID}/elements"),
                None,
            )
            .await?;
        let elements = body
            .pointer("/_embedded/elements")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(elements.into_iter().map(lead_record).collect())
    }

    async fn get_server_info(
        &self,
        connection: &CrmConnection,
        server_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let body = self
            .call(
                connection,
                Method::GET,
                &format!("/api/v4/catalogs/{SERVER_CATALOG_ID}/elements/{server_id}"),
                None,
            )
            .await?;
        Ok(lead_record(body))
    }

    async fn update_server_status(
        &self,
        connection: &CrmConnection,
        server_id: &str,
        status: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let body = self
            .call(
                connection,
                Method::PATCH,
                &format!("/api/v4/catalogs/{SERVER_CATALOG_ID}/elements/{server_id}"),
                Some(&json!({
                    "id": contact_ref(server_id),
                    "custom_fields_values": [custom_field(SERVER_STATUS_FIELD_ID, json!(status))],
                })),
            )
            .await?;
        let mut record = lead_record(body);
        record.status = Some(status.to_string());
        Ok(record)
    }

    async fn generate_config(
        &self,
        connection: &CrmConnection,
        input: &ConfigInput,
    ) -> Result<CrmRecord, ApplicationError> {
        self.create_lead(
            connection,
            json!({
                "name": format!("Config for user {}", input.contact_id),
                "_embedded": { "contacts": [{ "id": contact_ref(&input.contact_id) }] },
                "custom_fields_values": [custom_field(SERVER_FIELD_ID, json!(input.server_id))],
            }),
        )
        .await
    }

    async fn get_config_info(
        &self,
        connection: &CrmConnection,
        config_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.get_lead(connection, config_id).await
    }

    async fn revoke_config(
        &self,
        connection: &CrmConnection,
        config_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        self.patch_lead(
            connection,
            config_id,
            json!({ "id": contact_ref(config_id), "status_id": STATUS_REVOKED }),
        )
        .await
    }
}

fn contact_body(input: &ContactInput) -> Value {
    let mut body = serde_json::Map::new();
    if let Some(name) = input.display_name() {
        body.insert("name".to_string(), json!(name));
    }
    if let Some(first_name) = &input.first_name {
        body.insert("first_name".to_string(), json!(first_name));
    }
    if let Some(last_name) = &input.last_name {
        body.insert("last_name".to_string(), json!(last_name));
    }

    let mut fields = Vec::new();
    if let Some(phone) = &input.phone {
        fields.push(json!({ "field_code": "PHONE", "values": [{ "value": phone }] }));
    }
    if let Some(email) = &input.email {
        fields.push(json!({ "field_code": "EMAIL", "values": [{ "value": email }] }));
    }
    if !fields.is_empty() {
        body.insert("custom_fields_values".to_string(), Value::Array(fields));
    }
    Value::Object(body)
}

fn custom_field(field_id: i64, value: Value) -> Value {
    json!({ "field_id": field_id, "values": [{ "value": value }] })
}

/// AmoCRM entity ids are numeric; non-numeric ids are sent as given.
fn contact_ref(id: &str) -> Value {
    id.parse::<i64>().map(Value::from).unwrap_or_else(|_| json!(id))
}

fn lead_price(amount: Decimal) -> Value {
    amount.trunc().to_i64().map(Value::from).unwrap_or_else(|| json!(amount.to_string()))
}

fn first_embedded<'a>(body: &'a Value, collection: &str) -> Option<&'a Value> {
    body.get("_embedded")?.get(collection)?.as_array()?.first()
}

fn field_code_value(entity: &Value, code: &str) -> Option<String> {
    entity
        .get("custom_fields_values")?
        .as_array()?
        .iter()
        .find(|field| field.get("field_code").and_then(Value::as_str) == Some(code))?
        .pointer("/values/0/value")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn contact_from_body(body: Value) -> CrmContact {
    CrmContact {
        id: value_to_id(&body["id"]),
        name: string_field(&body, "name"),
        phone: field_code_value(&body, "PHONE"),
        email: field_code_value(&body, "EMAIL"),
        raw: body,
    }
}

fn lead_record(body: Value) -> CrmRecord {
    CrmRecord {
        id: value_to_id(&body["id"]),
        name: string_field(&body, "name"),
        status: value_to_id(&body["status_id"]),
        raw: body,
    }
}
