use std::sync::Arc;

use chrono::Utc;
use secrecy::SecretString;
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::warn;

use tgdesk_core::domain::connection::{
    CrmConnection, CrmConnectionId, CrmConnectionPatch, CrmProvider, NewCrmConnection, UserId,
};
use tgdesk_core::EncryptionContext;

use super::{parse_optional_timestamp, parse_timestamp, CrmConnectionRepository, RepositoryError};
use crate::DbPool;

const SELECT_COLUMNS: &str = "SELECT
        id,
        user_id,
        provider,
        access_token,
        refresh_token,
        domain,
        other_data,
        expires_at,
        is_active,
        created_at,
        updated_at
     FROM crm_connection";

/// Ciphertext columns as they are written to disk.
struct SealedSecrets {
    access_token: String,
    refresh_token: Option<String>,
    domain: Option<String>,
    other_data: Option<String>,
}

pub struct SqlCrmConnectionRepository {
    pool: DbPool,
    crypto: Arc<EncryptionContext>,
}

impl SqlCrmConnectionRepository {
    pub fn new(pool: DbPool, crypto: Arc<EncryptionContext>) -> Self {
        Self { pool, crypto }
    }

    fn seal(
        &self,
        access_token: &SecretString,
        refresh_token: Option<&SecretString>,
        domain: Option<&str>,
        other_data: Option<&Value>,
    ) -> Result<SealedSecrets, RepositoryError> {
        let other_data = match other_data {
            Some(value) => Some(self.crypto.encrypt(&value.to_string())?),
            None => None,
        };

        Ok(SealedSecrets {
            access_token: self.crypto.encrypt_secret(access_token)?,
            refresh_token: refresh_token
                .map(|token| self.crypto.encrypt_secret(token))
                .transpose()?,
            domain: domain.map(|domain| self.crypto.encrypt(domain)).transpose()?,
            other_data,
        })
    }

    fn connection_from_row(&self, row: SqliteRow) -> Result<CrmConnection, RepositoryError> {
        let id = CrmConnectionId(row.try_get("id")?);
        let provider_raw = row.try_get::<String, _>("provider")?;
        let provider = CrmProvider::parse(&provider_raw)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown provider `{provider_raw}`")))?;

        let access_token = self.crypto.decrypt_secret(&row.try_get::<String, _>("access_token")?)?;
        let refresh_token = row
            .try_get::<Option<String>, _>("refresh_token")?
            .map(|stored| self.crypto.decrypt_secret(&stored))
            .transpose()?;
        let domain = row
            .try_get::<Option<String>, _>("domain")?
            .map(|stored| self.crypto.decrypt(&stored))
            .transpose()?;
        let other_data = row
            .try_get::<Option<String>, _>("other_data")?
            .and_then(|stored| self.open_other_data(id, &stored));

        Ok(CrmConnection {
            id,
            user_id: UserId(row.try_get("user_id")?),
            provider,
            access_token,
            refresh_token,
            domain,
            other_data,
            expires_at: parse_optional_timestamp("expires_at", row.try_get("expires_at")?)?,
            is_active: row.try_get("is_active")?,
            created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
            updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        })
    }

    /// Auxiliary blob. A blob that fails to open is dropped, not fatal.
    fn open_other_data(&self, id: CrmConnectionId, stored: &str) -> Option<Value> {
        let decoded = self
            .crypto
            .decrypt(stored)
            .map_err(|error| error.to_string())
            .and_then(|plain| serde_json::from_str(&plain).map_err(|error| error.to_string()));

        match decoded {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(
                    event_name = "crm.connection.other_data_unreadable",
                    connection_id = id.0,
                    error = %error,
                    "dropping unreadable connection metadata"
                );
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl CrmConnectionRepository for SqlCrmConnectionRepository {
    async fn upsert_for_user(
        &self,
        connection: NewCrmConnection,
    ) -> Result<CrmConnection, RepositoryError> {
        let sealed = self.seal(
            &connection.access_token,
            connection.refresh_token.as_ref(),
            connection.domain.as_deref(),
            connection.other_data.as_ref(),
        )?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO crm_connection (
                user_id,
                provider,
                access_token,
                refresh_token,
                domain,
                other_data,
                expires_at,
                is_active,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                domain = excluded.domain,
                other_data = excluded.other_data,
                expires_at = excluded.expires_at,
                is_active = 1,
                updated_at = excluded.updated_at",
        )
        .bind(connection.user_id.0)
        .bind(connection.provider.as_str())
        .bind(&sealed.access_token)
        .bind(sealed.refresh_token.as_deref())
        .bind(sealed.domain.as_deref())
        .bind(sealed.other_data.as_deref())
        .bind(connection.expires_at.map(|value| value.to_rfc3339()))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_by_user(connection.user_id).await?.ok_or_else(|| {
            RepositoryError::Decode(format!(
                "connection for user {} vanished after upsert",
                connection.user_id
            ))
        })
    }

    async fn find_by_id(
        &self,
        id: CrmConnectionId,
    ) -> Result<Option<CrmConnection>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.connection_from_row(row)).transpose()
    }

    async fn find_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<CrmConnection>, RepositoryError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE user_id = ?"))
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.connection_from_row(row)).transpose()
    }

    async fn update(
        &self,
        id: CrmConnectionId,
        patch: CrmConnectionPatch,
    ) -> Result<Option<CrmConnection>, RepositoryError> {
        let Some(mut current) = self.find_by_id(id).await? else {
            return Ok(None);
        };

        if let Some(token) = patch.access_token {
            current.access_token = token;
        }
        if let Some(token) = patch.refresh_token {
            current.refresh_token = Some(token);
        }
        if let Some(domain) = patch.domain {
            current.domain = Some(domain);
        }
        if let Some(other_data) = patch.other_data {
            current.other_data = Some(other_data);
        }
        if let Some(expires_at) = patch.expires_at {
            current.expires_at = Some(expires_at);
        }
        if let Some(is_active) = patch.is_active {
            current.is_active = is_active;
        }

        let sealed = self.seal(
            &current.access_token,
            current.refresh_token.as_ref(),
            current.domain.as_deref(),
            current.other_data.as_ref(),
        )?;

        sqlx::query(
            "UPDATE crm_connection SET
                access_token = ?,
                refresh_token = ?,
                domain = ?,
                other_data = ?,
                expires_at = ?,
                is_active = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(&sealed.access_token)
        .bind(sealed.refresh_token.as_deref())
        .bind(sealed.domain.as_deref())
        .bind(sealed.other_data.as_deref())
        .bind(current.expires_at.map(|value| value.to_rfc3339()))
        .bind(current.is_active)
        .bind(Utc::now().to_rfc3339())
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        self.find_by_id(id).await
    }

    async fn delete(&self, id: CrmConnectionId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM crm_connection WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use secrecy::{ExposeSecret, SecretString};
    use serde_json::json;
    use sqlx::Row;

    use tgdesk_core::domain::connection::{
        CrmConnectionPatch, CrmProvider, NewCrmConnection, UserId,
    };
    use tgdesk_core::EncryptionContext;

    use super::SqlCrmConnectionRepository;
    use crate::repositories::test_support::{seed_user, setup_pool};
    use crate::repositories::CrmConnectionRepository;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn crypto() -> Arc<EncryptionContext> {
        Arc::new(EncryptionContext::from_hex_key(KEY).expect("key"))
    }

    fn new_connection(user_id: UserId, token: &str) -> NewCrmConnection {
        NewCrmConnection {
            user_id,
            provider: CrmProvider::AmoCrm,
            access_token: SecretString::from(token.to_string()),
            refresh_token: Some(SecretString::from("refresh-1".to_string())),
            domain: Some("https://acme.amocrm.ru".to_string()),
            other_data: Some(json!({"pipeline": 42})),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn secrets_are_encrypted_at_rest_and_decrypted_on_read() {
        let pool = setup_pool().await;
        let user_id = seed_user(&pool).await;
        let repo = SqlCrmConnectionRepository::new(pool.clone(), crypto());

        let stored =
            repo.upsert_for_user(new_connection(user_id, "amo-token")).await.expect("upsert");
        assert_eq!(stored.access_token.expose_secret(), "amo-token");
        assert_eq!(stored.domain.as_deref(), Some("https://acme.amocrm.ru"));
        assert_eq!(stored.other_data, Some(json!({"pipeline": 42})));

        let raw = sqlx::query("SELECT access_token, domain FROM crm_connection WHERE id = ?")
            .bind(stored.id.0)
            .fetch_one(&pool)
            .await
            .expect("raw row");
        let raw_token: String = raw.get("access_token");
        let raw_domain: String = raw.get("domain");
        assert!(!raw_token.contains("amo-token"));
        assert!(!raw_domain.contains("amocrm"));

        pool.close().await;
    }

    #[tokio::test]
    async fn second_upsert_replaces_credentials_of_same_row() {
        let pool = setup_pool().await;
        let user_id = seed_user(&pool).await;
        let repo = SqlCrmConnectionRepository::new(pool.clone(), crypto());

        let first = repo.upsert_for_user(new_connection(user_id, "old")).await.expect("first");
        let second = repo.upsert_for_user(new_connection(user_id, "new")).await.expect("second");

        assert_eq!(first.id, second.id);
        assert_eq!(second.access_token.expose_secret(), "new");
        let stored = repo.find_by_user(user_id).await.expect("find").expect("present");
        assert_eq!(stored.id, first.id);

        pool.close().await;
    }

    #[tokio::test]
    async fn patch_updates_only_supplied_fields_and_delete_reports_existence() {
        let pool = setup_pool().await;
        let user_id = seed_user(&pool).await;
        let repo = SqlCrmConnectionRepository::new(pool.clone(), crypto());
        let created = repo.upsert_for_user(new_connection(user_id, "tok")).await.expect("upsert");

        let patch = CrmConnectionPatch { is_active: Some(false), ..CrmConnectionPatch::default() };
        let updated = repo.update(created.id, patch).await.expect("update").expect("present");
        assert!(!updated.is_active);
        assert_eq!(updated.access_token.expose_secret(), "tok");
        assert_eq!(updated.provider, CrmProvider::AmoCrm);

        assert!(repo.delete(created.id).await.expect("delete"));
        assert!(!repo.delete(created.id).await.expect("second delete"));
        assert!(repo.find_by_user(user_id).await.expect("find").is_none());

        pool.close().await;
    }

    #[tokio::test]
    async fn unreadable_other_data_is_dropped_not_fatal() {
        let pool = setup_pool().await;
        let user_id = seed_user(&pool).await;
        let repo = SqlCrmConnectionRepository::new(pool.clone(), crypto());
        let created = repo.upsert_for_user(new_connection(user_id, "tok")).await.expect("upsert");

        sqlx::query("UPDATE crm_connection SET other_data = 'garbage' WHERE id = ?")
            .bind(created.id.0)
            .execute(&pool)
            .await
            .expect("corrupt");

        let reloaded = repo.find_by_id(created.id).await.expect("find").expect("present");
        assert_eq!(reloaded.other_data, None);
        assert_eq!(reloaded.access_token.expose_secret(), "tok");

        pool.close().await;
    }

    #[tokio::test]
    async fn connection_requires_existing_user() {
        let pool = setup_pool().await;
        let repo = SqlCrmConnectionRepository::new(pool.clone(), crypto());

        let result = repo.upsert_for_user(new_connection(UserId(404), "tok")).await;
        assert!(result.is_err());

        pool.close().await;
    }
}
