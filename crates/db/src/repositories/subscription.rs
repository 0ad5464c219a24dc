use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};

use tgdesk_core::domain::connection::UserId;
use tgdesk_core::domain::payment::PaymentId;
use tgdesk_core::domain::subscription::{
    NewSubscription, Subscription, SubscriptionId, SubscriptionPlan, SubscriptionStatus,
};

use super::{parse_optional_timestamp, parse_timestamp, RepositoryError, SubscriptionRepository};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        id,
        user_id,
        bot_id,
        plan,
        status,
        period_start,
        period_end,
        payment_id,
        created_at,
        updated_at
     FROM subscription";

pub struct SqlSubscriptionRepository {
    pool: DbPool,
}

impl SqlSubscriptionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SubscriptionRepository for SqlSubscriptionRepository {
    async fn insert(
        &self,
        subscription: NewSubscription,
    ) -> Result<Subscription, RepositoryError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO subscription (
                user_id,
                bot_id,
                plan,
                status,
                period_start,
                period_end,
                payment_id,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, NULL, NULL, ?, ?, ?)",
        )
        .bind(subscription.user_id.0)
        .bind(subscription.bot_id)
        .bind(subscription.plan.as_str())
        .bind(SubscriptionStatus::Pending.as_str())
        .bind(subscription.payment_id.map(|id| id.0))
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Subscription {
            id: SubscriptionId(result.last_insert_rowid()),
            user_id: subscription.user_id,
            bot_id: subscription.bot_id,
            plan: subscription.plan,
            status: SubscriptionStatus::Pending,
            period_start: None,
            period_end: None,
            payment_id: subscription.payment_id,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_by_id(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(subscription_from_row).transpose()
    }

    async fn find_by_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<Option<Subscription>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE payment_id = ?"))
            .bind(payment_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(subscription_from_row).transpose()
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Subscription>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE user_id = ? ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(subscription_from_row).collect()
    }

    async fn update_if_status(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE subscription SET
                status = ?,
                period_start = ?,
                period_end = ?,
                updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(subscription.status.as_str())
        .bind(subscription.period_start.map(|value| value.to_rfc3339()))
        .bind(subscription.period_end.map(|value| value.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .bind(subscription.id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn subscription_from_row(row: SqliteRow) -> Result<Subscription, RepositoryError> {
    let plan_raw = row.try_get::<String, _>("plan")?;
    let plan = SubscriptionPlan::parse(&plan_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown plan `{plan_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = SubscriptionStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown subscription status `{status_raw}`"))
    })?;

    Ok(Subscription {
        id: SubscriptionId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        bot_id: row.try_get("bot_id")?,
        plan,
        status,
        period_start: parse_optional_timestamp("period_start", row.try_get("period_start")?)?,
        period_end: parse_optional_timestamp("period_end", row.try_get("period_end")?)?,
        payment_id: row.try_get::<Option<i64>, _>("payment_id")?.map(PaymentId),
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
