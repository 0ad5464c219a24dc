use chrono::Utc;

use tgdesk_core::domain::connection::UserId;

use super::{RepositoryError, UserRepository};
use crate::DbPool;

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl UserRepository for SqlUserRepository {
    async fn exists(&self, id: UserId) -> Result<bool, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM app_user WHERE id = ?")
            .bind(id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn create(&self, email: Option<&str>) -> Result<UserId, RepositoryError> {
        let result = sqlx::query("INSERT INTO app_user (email, created_at) VALUES (?, ?)")
            .bind(email)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(UserId(result.last_insert_rowid()))
    }
}

#[cfg(test)]
mod tests {
    use tgdesk_core::domain::connection::UserId;

    use super::SqlUserRepository;
    use crate::repositories::test_support::setup_pool;
    use crate::repositories::UserRepository;

    #[tokio::test]
    async fn created_users_exist() {
        let pool = setup_pool().await;
        let repo = SqlUserRepository::new(pool.clone());

        let id = repo.create(None).await.expect("create");
        assert!(repo.exists(id).await.expect("exists"));
        assert!(!repo.exists(UserId(id.0 + 100)).await.expect("exists"));

        pool.close().await;
    }
}
