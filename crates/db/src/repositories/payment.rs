use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use tgdesk_core::domain::connection::UserId;
use tgdesk_core::domain::payment::{
    NewPayment, Payment, PaymentId, PaymentStatus, TransactionType,
};

use super::{parse_timestamp, PaymentRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        id,
        user_id,
        amount,
        currency,
        status,
        method,
        description,
        external_id,
        order_id,
        transaction_type,
        telegapay_status,
        metadata,
        version,
        created_at,
        updated_at
     FROM payment";

pub struct SqlPaymentRepository {
    pool: DbPool,
}

impl SqlPaymentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PaymentRepository for SqlPaymentRepository {
    async fn insert(&self, payment: NewPayment) -> Result<Payment, RepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO payment (
                user_id,
                amount,
                currency,
                status,
                method,
                description,
                external_id,
                order_id,
                transaction_type,
                telegapay_status,
                metadata,
                version,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?, NULL, ?, 0, ?, ?)",
        )
        .bind(payment.user_id.0)
        .bind(payment.amount.to_string())
        .bind(&payment.currency)
        .bind(PaymentStatus::Pending.as_str())
        .bind(&payment.method)
        .bind(payment.description.as_deref())
        .bind(&payment.order_id)
        .bind(payment.transaction_type.as_str())
        .bind(payment.metadata.to_string())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Payment {
            id: PaymentId(result.last_insert_rowid()),
            user_id: payment.user_id,
            amount: payment.amount,
            currency: payment.currency,
            status: PaymentStatus::Pending,
            method: payment.method,
            description: payment.description,
            external_id: None,
            order_id: payment.order_id,
            transaction_type: payment.transaction_type,
            telegapay_status: None,
            metadata: payment.metadata,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(payment_from_row).transpose()
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Payment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE external_id = ? AND transaction_type = ?"
        ))
        .bind(external_id)
        .bind(transaction_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(payment_from_row).transpose()
    }

    async fn find_by_order_id(
        &self,
        order_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Payment>, RepositoryError> {
        let row = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE order_id = ? AND transaction_type = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(order_id)
        .bind(transaction_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(payment_from_row).transpose()
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Payment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE user_id = ? ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(payment_from_row).collect()
    }

    async fn update_if_version(
        &self,
        payment: &Payment,
    ) -> Result<Option<Payment>, RepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE payment SET
                status = ?,
                method = ?,
                description = ?,
                external_id = ?,
                telegapay_status = ?,
                metadata = ?,
                version = version + 1,
                updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(payment.status.as_str())
        .bind(&payment.method)
        .bind(payment.description.as_deref())
        .bind(payment.external_id.as_deref())
        .bind(payment.telegapay_status.as_deref())
        .bind(payment.metadata.to_string())
        .bind(now.to_rfc3339())
        .bind(payment.id.0)
        .bind(payment.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let mut stored = payment.clone();
        stored.version += 1;
        stored.updated_at = now;
        Ok(Some(stored))
    }
}

fn payment_from_row(row: SqliteRow) -> Result<Payment, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = PaymentStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown payment status `{status_raw}`")))?;

    let kind_raw = row.try_get::<String, _>("transaction_type")?;
    let transaction_type = TransactionType::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown transaction type `{kind_raw}`")))?;

    let amount_raw = row.try_get::<String, _>("amount")?;
    let amount = Decimal::from_str(&amount_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid amount `{amount_raw}`: {error}"))
    })?;

    let metadata_raw = row.try_get::<String, _>("metadata")?;
    let metadata = serde_json::from_str(&metadata_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid payment metadata: {error}")))?;

    Ok(Payment {
        id: PaymentId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        amount,
        currency: row.try_get("currency")?,
        status,
        method: row.try_get("method")?,
        description: row.try_get("description")?,
        external_id: row.try_get("external_id")?,
        order_id: row.try_get("order_id")?,
        transaction_type,
        telegapay_status: row.try_get("telegapay_status")?,
        metadata,
        version: row.try_get("version")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
