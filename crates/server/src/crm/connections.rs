use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use tgdesk_core::domain::connection::{CrmConnectionPatch, NewCrmConnection};
use tgdesk_core::{ApplicationError, CrmConnection, CrmConnectionId, UserId};
use tgdesk_db::repositories::{CrmConnectionRepository, UserRepository};

/// Stored CRM connections, scoped to the user that owns them. A row owned by someone
/// else reads as missing.
#[derive(Clone)]
pub struct ConnectionService {
    users: Arc<dyn UserRepository>,
    connections: Arc<dyn CrmConnectionRepository>,
}

impl ConnectionService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        connections: Arc<dyn CrmConnectionRepository>,
    ) -> Self {
        Self { users, connections }
    }

    async fn ensure_user(&self, user_id: UserId) -> Result<(), ApplicationError> {
        if self.users.exists(user_id).await? {
            Ok(())
        } else {
            Err(ApplicationError::NotFound(format!("user {user_id}")))
        }
    }

    /// Creates the caller's connection or refreshes its credentials. Switching provider
    /// requires deleting the connection first.
    pub async fn upsert(
        &self,
        connection: NewCrmConnection,
    ) -> Result<CrmConnection, ApplicationError> {
        self.ensure_user(connection.user_id).await?;
        if let Some(existing) = self.connections.find_by_user(connection.user_id).await? {
            existing.ensure_provider_unchanged(connection.provider)?;
        }

        let stored = self.connections.upsert_for_user(connection).await?;
        info!(
            event_name = "crm.connection.upserted",
            connection_id = stored.id.0,
            user_id = stored.user_id.0,
            provider = %stored.provider,
            "crm connection stored"
        );
        Ok(stored)
    }

    /// At most one row, since a user owns a single connection.
    pub async fn list(&self, owner: UserId) -> Result<Vec<CrmConnection>, ApplicationError> {
        Ok(self.connections.find_by_user(owner).await?.into_iter().collect())
    }

    pub async fn get(
        &self,
        owner: UserId,
        id: CrmConnectionId,
    ) -> Result<CrmConnection, ApplicationError> {
        self.connections
            .find_by_id(id)
            .await?
            .filter(|connection| connection.user_id == owner)
            .ok_or_else(|| ApplicationError::NotFound(format!("crm connection {}", id.0)))
    }

    pub async fn get_for_user(&self, user_id: UserId) -> Result<CrmConnection, ApplicationError> {
        self.connections
            .find_by_user(user_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("crm connection for user {user_id}")))
    }

    /// The caller's connection, ready for an outbound call.
    pub async fn active_for_user(
        &self,
        user_id: UserId,
    ) -> Result<CrmConnection, ApplicationError> {
        let connection = self.get_for_user(user_id).await?;
        if !connection.is_active {
            return Err(ApplicationError::Validation(format!(
                "crm connection {} is disabled",
                connection.id.0
            )));
        }
        if connection.is_expired(Utc::now()) {
            warn!(
                event_name = "crm.connection.expired",
                connection_id = connection.id.0,
                provider = %connection.provider,
                "crm credentials past expiry; provider may reject the call"
            );
        }
        Ok(connection)
    }

    pub async fn update(
        &self,
        owner: UserId,
        id: CrmConnectionId,
        patch: CrmConnectionPatch,
    ) -> Result<CrmConnection, ApplicationError> {
        let current = self.get(owner, id).await?;
        if let Some(provider) = patch.provider {
            current.ensure_provider_unchanged(provider)?;
        }

        let updated = self
            .connections
            .update(id, patch)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("crm connection {}", id.0)))?;
        info!(
            event_name = "crm.connection.updated",
            connection_id = id.0,
            provider = %updated.provider,
            "crm connection updated"
        );
        Ok(updated)
    }

    pub async fn delete(&self, owner: UserId, id: CrmConnectionId) -> Result<(), ApplicationError> {
        self.get(owner, id).await?;
        if !self.connections.delete(id).await? {
            return Err(ApplicationError::NotFound(format!("crm connection {}", id.0)));
        }
        info!(
            event_name = "crm.connection.deleted",
            connection_id = id.0,
            "crm connection deleted"
        );
        Ok(())
    }
}
