//! Bitrix24 REST adapter. Every method is a POST to `/rest/<method>` and answers `{result}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use tgdesk_core::crm::{
    string_field, value_to_id, ConfigInput, ContactInput, CrmAdapter, CrmContact, CrmRecord,
    PaymentInput, RecordPatch, SubscriptionInput,
};
use tgdesk_core::{ApplicationError, CrmConnection, CrmProvider};

use super::http::{domain_base, ProviderHttp};

const SERVER_LIST_BLOCK_ID: i64 = 123;
const DEAL_STAGE_LOST: &str = "C4:LOSE";
const INVOICE_STATUS_REFUNDED: &str = "D";
const TASK_STATUS_DEFERRED: i64 = 5;

pub struct Bitrix24Adapter {
    http: ProviderHttp,
}

impl Bitrix24Adapter {
    pub fn new(timeout: Duration) -> Result<Self, ApplicationError> {
        Ok(Self { http: ProviderHttp::new(CrmProvider::Bitrix24, timeout)? })
    }

    /// Invokes one REST method and unwraps the `result` member.
    async fn rest(
        &self,
        connection: &CrmConnection,
        method: &str,
        params: Value,
    ) -> Result<(Value, Value), ApplicationError> {
        let url = format!("{}/rest/{method}", domain_base(connection)?);
        let body = self.http.send(connection, Method::POST, &url, Some(&params)).await?;
        let result = body.get("result").cloned().unwrap_or(Value::Null);
        Ok((result, body))
    }
}

#[async_trait]
impl CrmAdapter for Bitrix24Adapter {
    fn provider(&self) -> CrmProvider {
        CrmProvider::Bitrix24
    }

    async fn create_contact(
        &self,
        connection: &CrmConnection,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError> {
        let params = json!({ "fields": contact_fields(input) });
        let (result, raw) = self.rest(connection, "crm.contact.add", params).await?;
        Ok(CrmContact {
            id: value_to_id(&result),
            name: input.display_name(),
            phone: input.phone.clone(),
            email: input.email.clone(),
            raw,
        })
    }

    async fn get_contact_info(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> Result<CrmContact, ApplicationError> {
        let (result, raw) =
            self.rest(connection, "crm.contact.get", json!({ "id": contact_id })).await?;
        let name = [string_field(&result, "NAME"), string_field(&result, "LAST_NAME")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        Ok(CrmContact {
            id: value_to_id(&result["ID"]),
            name: (!name.is_empty()).then_some(name),
            phone: multi_field(&result, "PHONE"),
            email: multi_field(&result, "EMAIL"),
            raw,
        })
    }

    async fn update_contact(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
        input: &ContactInput,
    ) -> Result<CrmContact, ApplicationError> {
        let (_, raw) = self
            .rest(
                connection,
                "crm.contact.update",
                json!({ "id": contact_id, "fields": contact_fields(input) }),
            )
            .await?;
        Ok(CrmContact {
            id: Some(contact_id.to_string()),
            name: input.display_name(),
            phone: input.phone.clone(),
            email: input.email.clone(),
            raw,
        })
    }

    async fn delete_contact(
        &self,
        connection: &CrmConnection,
        contact_id: &str,
    ) -> Result<(), ApplicationError> {
        self.rest(connection, "crm.contact.delete", json!({ "id": contact_id })).await?;
        Ok(())
    }

    async fn create_subscription(
        &self,
        connection: &CrmConnection,
        input: &SubscriptionInput,
    ) -> Result<CrmRecord, ApplicationError> {
        let title = format!("Subscription {}", input.plan_id);
        let (result, raw) = self
            .rest(
                connection,
                "crm.deal.add",
                json!({ "fields": { "TITLE": title, "CONTACT_ID": input.contact_id } }),
            )
            .await?;
        Ok(CrmRecord { id: value_to_id(&result), name: Some(title), status: None, raw })
    }

    async fn get_subscription_info(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let (result, raw) =
            self.rest(connection, "crm.deal.get", json!({ "id": subscription_id })).await?;
        Ok(record(&result, "TITLE", "STAGE_ID", raw))
    }

    async fn update_subscription(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
        patch: &RecordPatch,
    ) -> Result<CrmRecord, ApplicationError> {
        let mut fields = patch.fields.clone();
        if let Some(status) = &patch.status {
            fields.insert("STAGE_ID".to_string(), json!(status));
        }
        let (_, raw) = self
            .rest(connection, "crm.deal.update", json!({ "id": subscription_id, "fields": fields }))
            .await?;
        Ok(CrmRecord {
            id: Some(subscription_id.to_string()),
            name: None,
            status: patch.status.clone(),
            raw,
        })
    }

    async fn cancel_subscription(
        &self,
        connection: &CrmConnection,
        subscription_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let (_, raw) = self
            .rest(
                connection,
                "crm.deal.update",
                json!({ "id": subscription_id, "fields": { "STAGE_ID": DEAL_STAGE_LOST } }),
            )
            .await?;
        Ok(CrmRecord {
            id: Some(subscription_id.to_string()),
            name: None,
            status: Some(DEAL_STAGE_LOST.to_string()),
            raw,
        })
    }

    async fn create_payment(
        &self,
        connection: &CrmConnection,
        input: &PaymentInput,
    ) -> Result<CrmRecord, ApplicationError> {
        let (result, raw) = self
            .rest(
                connection,
                "crm.invoice.add",
                json!({
                    "fields": {
                        "UF_CONTACT_ID": input.contact_id,
                        "PRICE": input.amount.to_f64(),
                        "CURRENCY": input.currency,
                    }
                }),
            )
            .await?;
        Ok(CrmRecord { id: value_to_id(&result), name: None, status: None, raw })
    }

    async fn get_payment_info(
        &self,
        connection: &CrmConnection,
        payment_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let (result, raw) =
            self.rest(connection, "crm.invoice.get", json!({ "id": payment_id })).await?;
        Ok(record(&result, "ORDER_TOPIC", "STATUS_ID", raw))
    }

    async fn refund_payment(
        &self,
        connection: &CrmConnection,
        payment_id: &str,
        amount: Option<Decimal>,
    ) -> Result<CrmRecord, ApplicationError> {
        let mut fields = Map::new();
        fields.insert("STATUS_ID".to_string(), json!(INVOICE_STATUS_REFUNDED));
        if let Some(amount) = amount {
            fields.insert("PRICE".to_string(), json!(amount.to_f64()));
        }
        let (_, raw) = self
            .rest(connection, "crm.invoice.update", json!({ "id": payment_id, "fields": fields }))
            .await?;
        Ok(CrmRecord {
            id: Some(payment_id.to_string()),
            name: None,
            status: Some(INVOICE_STATUS_REFUNDED.to_string()),
            raw,
        })
    }

    async fn get_servers(
        &self,
        connection: &CrmConnection,
    ) -> Result<Vec<CrmRecord>, ApplicationError> {
        let (result, _) = self
            .rest(connection, "lists.element.get", json!({ "IBLOCK_ID": SERVER_LIST_BLOCK_ID }))
            .await?;
        Ok(result
            .as_array()
            .map(|items| {
                items.iter().map(|item| record(item, "NAME", "STATUS", item.clone())).collect()
            })
            .unwrap_or_default())
    }

    async fn get_server_info(
        &self,
        connection: &CrmConnection,
        server_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let (result, raw) = self
            .rest(
                connection,
                "lists.element.get",
                json!({ "IBLOCK_ID": SERVER_LIST_BLOCK_ID, "ELEMENT_ID": server_id }),
            )
            .await?;
        let element = result.as_array().and_then(|items| items.first()).cloned().unwrap_or(result);
        Ok(record(&element, "NAME", "STATUS", raw))
    }

    async fn update_server_status(
        &self,
        connection: &CrmConnection,
        server_id: &str,
        status: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let (_, raw) = self
            .rest(
                connection,
                "lists.element.update",
                json!({
                    "IBLOCK_ID": SERVER_LIST_BLOCK_ID,
                    "ELEMENT_ID": server_id,
                    "FIELDS": { "STATUS": status },
                }),
            )
            .await?;
        Ok(CrmRecord {
            id: Some(server_id.to_string()),
            name: None,
            status: Some(status.to_string()),
            raw,
        })
    }

    async fn generate_config(
        &self,
        connection: &CrmConnection,
        input: &ConfigInput,
    ) -> Result<CrmRecord, ApplicationError> {
        let title = format!("Generate config for {}", input.contact_id);
        let (result, raw) = self
            .rest(
                connection,
                "tasks.task.add",
                json!({
                    "fields": {
                        "TITLE": title,
                        "RESPONSIBLE_ID": input.contact_id,
                        "DESCRIPTION": format!("Server ID: {}", input.server_id),
                    }
                }),
            )
            .await?;
        let task = result.get("task").cloned().unwrap_or(Value::Null);
        Ok(CrmRecord {
            id: value_to_id(&task["id"]),
            name: Some(title),
            status: value_to_id(&task["status"]),
            raw,
        })
    }

    async fn get_config_info(
        &self,
        connection: &CrmConnection,
        config_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let (result, raw) =
            self.rest(connection, "tasks.task.get", json!({ "taskId": config_id })).await?;
        let task = result.get("task").cloned().unwrap_or(Value::Null);
        Ok(record(&task, "title", "status", raw))
    }

    async fn revoke_config(
        &self,
        connection: &CrmConnection,
        config_id: &str,
    ) -> Result<CrmRecord, ApplicationError> {
        let (_, raw) = self
            .rest(
                connection,
                "tasks.task.update",
                json!({ "taskId": config_id, "fields": { "STATUS": TASK_STATUS_DEFERRED } }),
            )
            .await?;
        Ok(CrmRecord {
            id: Some(config_id.to_string()),
            name: None,
            status: Some(TASK_STATUS_DEFERRED.to_string()),
            raw,
        })
    }
}

fn contact_fields(input: &ContactInput) -> Value {
    let mut fields = Map::new();
    let first_name = input.first_name.clone().or_else(|| input.name.clone());
    if let Some(first_name) = first_name {
        fields.insert("NAME".to_string(), json!(first_name));
    }
    if let Some(last_name) = &input.last_name {
        fields.insert("LAST_NAME".to_string(), json!(last_name));
    }
    if let Some(phone) = &input.phone {
        fields.insert("PHONE".to_string(), json!([{ "VALUE": phone, "VALUE_TYPE": "WORK" }]));
    }
    if let Some(email) = &input.email {
        fields.insert("EMAIL".to_string(), json!([{ "VALUE": email, "VALUE_TYPE": "WORK" }]));
    }
    Value::Object(fields)
}

/// Bitrix multi-fields (`PHONE`, `EMAIL`) are arrays of `{VALUE, VALUE_TYPE}`.
fn multi_field(entity: &Value, key: &str) -> Option<String> {
    entity.get(key)?.as_array()?.first()?.get("VALUE")?.as_str().map(str::to_string)
}

fn record(entity: &Value, name_key: &str, status_key: &str, raw: Value) -> CrmRecord {
    let id = value_to_id(&entity["ID"]).or_else(|| value_to_id(&entity["id"]));
    CrmRecord {
        id,
        name: string_field(entity, name_key),
        status: value_to_id(&entity[status_key]),
        raw,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use serde_json::json;

    use tgdesk_core::crm::{ConfigInput, ContactInput, CrmAdapter};
    use tgdesk_core::{ApplicationError, CrmProvider};

    use super::Bitrix24Adapter;
    use crate::crm::http::test_support::connection;

    fn adapter() -> Bitrix24Adapter {
        Bitrix24Adapter::new(Duration::from_secs(2)).expect("adapter")
    }

    #[tokio::test]
    async fn contact_add_sends_upper_case_fields_and_reads_result_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rest/crm.contact.add")
                    .header("authorization", "Bearer conn-token")
                    .json_body(json!({
                        "fields": {
                            "NAME": "Oleg",
                            "EMAIL": [{ "VALUE": "oleg@example.com", "VALUE_TYPE": "WORK" }]
                        }
                    }));
                then.status(200).json_body(json!({ "result": 311 }));
            })
            .await;

        let input = ContactInput {
            name: Some("Oleg".to_string()),
            email: Some("oleg@example.com".to_string()),
            ..ContactInput::default()
        };
        let contact = adapter()
            .create_contact(&connection(CrmProvider::Bitrix24, Some(server.base_url())), &input)
            .await
            .expect("contact");

        mock.assert_async().await;
        assert_eq!(contact.id.as_deref(), Some("311"));
    }

    #[tokio::test]
    async fn contact_get_normalizes_multi_fields() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rest/crm.contact.get").json_body(json!({ "id": "311" }));
                then.status(200).json_body(json!({
                    "result": {
                        "ID": "311",
                        "NAME": "Oleg",
                        "LAST_NAME": "Sidorov",
                        "PHONE": [{ "VALUE": "+7922", "VALUE_TYPE": "WORK" }]
                    }
                }));
            })
            .await;

        let contact = adapter()
            .get_contact_info(&connection(CrmProvider::Bitrix24, Some(server.base_url())), "311")
            .await
            .expect("contact");

        assert_eq!(contact.name.as_deref(), Some("Oleg Sidorov"));
        assert_eq!(contact.phone.as_deref(), Some("+7922"));
        assert_eq!(contact.email, None);
    }

    #[tokio::test]
    async fn cancel_and_revoke_use_terminal_stage_codes() {
        let server = MockServer::start_async().await;
        let cancel = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rest/crm.deal.update")
                    .json_body(json!({ "id": "17", "fields": { "STAGE_ID": "C4:LOSE" } }));
                then.status(200).json_body(json!({ "result": true }));
            })
            .await;
        let revoke = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/rest/tasks.task.update")
                    .json_body(json!({ "taskId": "88", "fields": { "STATUS": 5 } }));
                then.status(200).json_body(json!({ "result": { "task": { "id": "88" } } }));
            })
            .await;

        let conn = connection(CrmProvider::Bitrix24, Some(server.base_url()));
        let cancelled = adapter().cancel_subscription(&conn, "17").await.expect("cancel");
        let revoked = adapter().revoke_config(&conn, "88").await.expect("revoke");

        cancel.assert_async().await;
        revoke.assert_async().await;
        assert_eq!(cancelled.status.as_deref(), Some("C4:LOSE"));
        assert_eq!(revoked.status.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn generate_config_reads_task_envelope() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rest/tasks.task.add");
                then.status(200)
                    .json_body(json!({ "result": { "task": { "id": "501", "status": "2" } } }));
            })
            .await;

        let record = adapter()
            .generate_config(
                &connection(CrmProvider::Bitrix24, Some(server.base_url())),
                &ConfigInput { contact_id: "9".to_string(), server_id: "srv-1".to_string() },
            )
            .await
            .expect("config");

        assert_eq!(record.id.as_deref(), Some("501"));
        assert_eq!(record.name.as_deref(), Some("Generate config for 9"));
    }

    #[tokio::test]
    async fn rejected_request_surfaces_validation_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/rest/crm.deal.get");
                then.status(400).json_body(json!({
                    "error": "ERROR_CORE",
                    "error_description": "ID is not defined or invalid."
                }));
            })
            .await;

        let result = adapter()
            .get_subscription_info(&connection(CrmProvider::Bitrix24, Some(server.base_url())), "x")
            .await;

        assert!(matches!(
            result,
            Err(ApplicationError::Validation(message)) if message.contains("ERROR_CORE")
        ));
    }
}
