use sqlx::{sqlite::SqliteRow, Row};

use tgdesk_core::domain::connection::CrmUser;

use super::{parse_timestamp, CrmUserRepository, RepositoryError};
use crate::DbPool;

pub struct SqlCrmUserRepository {
    pool: DbPool,
}

impl SqlCrmUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CrmUserRepository for SqlCrmUserRepository {
    async fn upsert(&self, user: CrmUser) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO crm_user (
                telegram_id,
                username,
                first_name,
                last_name,
                bot_id,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(telegram_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                bot_id = excluded.bot_id,
                updated_at = excluded.updated_at",
        )
        .bind(user.telegram_id)
        .bind(user.username.as_deref())
        .bind(user.first_name.as_deref())
        .bind(user.last_name.as_deref())
        .bind(user.bot_id)
        .bind(user.created_at.to_rfc3339())
        .bind(user.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_telegram_id(
        &self,
        telegram_id: i64,
    ) -> Result<Option<CrmUser>, RepositoryError> {
        let row = sqlx::query(
            "SELECT telegram_id, username, first_name, last_name, bot_id, created_at, updated_at
             FROM crm_user
             WHERE telegram_id = ?",
        )
        .bind(telegram_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(crm_user_from_row).transpose()
    }
}

fn crm_user_from_row(row: SqliteRow) -> Result<CrmUser, RepositoryError> {
    Ok(CrmUser {
        telegram_id: row.try_get("telegram_id")?,
        username: row.try_get("username")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        bot_id: row.try_get("bot_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
