use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use tgdesk_core::domain::connection::{
    CrmConnection, CrmConnectionId, CrmConnectionPatch, CrmUser, NewCrmConnection, UserId,
};
use tgdesk_core::domain::payment::{NewPayment, Payment, PaymentId, PaymentStatus, TransactionType};
use tgdesk_core::domain::subscription::{
    NewSubscription, Subscription, SubscriptionId, SubscriptionStatus,
};

use super::{
    CrmConnectionRepository, CrmUserRepository, PaymentRepository, RepositoryError,
    SubscriptionRepository, UserRepository,
};

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<i64, Option<String>>>,
}

#[async_trait::async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn exists(&self, id: UserId) -> Result<bool, RepositoryError> {
        Ok(self.users.read().await.contains_key(&id.0))
    }

    async fn create(&self, email: Option<&str>) -> Result<UserId, RepositoryError> {
        let mut users = self.users.write().await;
        let id = users.keys().max().copied().unwrap_or(0) + 1;
        users.insert(id, email.map(str::to_string));
        Ok(UserId(id))
    }
}

/// Holds connections in plaintext; only the SQL store encrypts.
#[derive(Default)]
pub struct InMemoryCrmConnectionRepository {
    connections: RwLock<HashMap<i64, CrmConnection>>,
}

#[async_trait::async_trait]
impl CrmConnectionRepository for InMemoryCrmConnectionRepository {
    async fn upsert_for_user(
        &self,
        connection: NewCrmConnection,
    ) -> Result<CrmConnection, RepositoryError> {
        let mut connections = self.connections.write().await;
        let now = Utc::now();

        if let Some(existing) =
            connections.values_mut().find(|stored| stored.user_id == connection.user_id)
        {
            existing.access_token = connection.access_token;
            existing.refresh_token = connection.refresh_token;
            existing.domain = connection.domain;
            existing.other_data = connection.other_data;
            existing.expires_at = connection.expires_at;
            existing.is_active = true;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let id = connections.keys().max().copied().unwrap_or(0) + 1;
        let stored = CrmConnection {
            id: CrmConnectionId(id),
            user_id: connection.user_id,
            provider: connection.provider,
            access_token: connection.access_token,
            refresh_token: connection.refresh_token,
            domain: connection.domain,
            other_data: connection.other_data,
            expires_at: connection.expires_at,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        connections.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(
        &self,
        id: CrmConnectionId,
    ) -> Result<Option<CrmConnection>, RepositoryError> {
        Ok(self.connections.read().await.get(&id.0).cloned())
    }

    async fn find_by_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<CrmConnection>, RepositoryError> {
        let connections = self.connections.read().await;
        Ok(connections.values().find(|stored| stored.user_id == user_id).cloned())
    }

    async fn update(
        &self,
        id: CrmConnectionId,
        patch: CrmConnectionPatch,
    ) -> Result<Option<CrmConnection>, RepositoryError> {
        let mut connections = self.connections.write().await;
        let Some(stored) = connections.get_mut(&id.0) else {
            return Ok(None);
        };

        if let Some(token) = patch.access_token {
            stored.access_token = token;
        }
        if let Some(token) = patch.refresh_token {
            stored.refresh_token = Some(token);
        }
        if let Some(domain) = patch.domain {
            stored.domain = Some(domain);
        }
        if let Some(other_data) = patch.other_data {
            stored.other_data = Some(other_data);
        }
        if let Some(expires_at) = patch.expires_at {
            stored.expires_at = Some(expires_at);
        }
        if let Some(is_active) = patch.is_active {
            stored.is_active = is_active;
        }
        stored.updated_at = Utc::now();
        Ok(Some(stored.clone()))
    }

    async fn delete(&self, id: CrmConnectionId) -> Result<bool, RepositoryError> {
        Ok(self.connections.write().await.remove(&id.0).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryCrmUserRepository {
    users: RwLock<HashMap<i64, CrmUser>>,
}

#[async_trait::async_trait]
impl CrmUserRepository for InMemoryCrmUserRepository {
    async fn upsert(&self, user: CrmUser) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        match users.get_mut(&user.telegram_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = CrmUser { created_at, ..user };
            }
            None => {
                users.insert(user.telegram_id, user);
            }
        }
        Ok(())
    }

    async fn find_by_telegram_id(
        &self,
        telegram_id: i64,
    ) -> Result<Option<CrmUser>, RepositoryError> {
        Ok(self.users.read().await.get(&telegram_id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryPaymentRepository {
    payments: RwLock<HashMap<i64, Payment>>,
}

#[async_trait::async_trait]
impl PaymentRepository for InMemoryPaymentRepository {
    async fn insert(&self, payment: NewPayment) -> Result<Payment, RepositoryError> {
        let mut payments = self.payments.write().await;

        if payment.transaction_type == TransactionType::Payout
            && payments.values().any(|stored| {
                stored.transaction_type == TransactionType::Payout
                    && stored.order_id == payment.order_id
            })
        {
            return Err(RepositoryError::Decode(format!(
                "duplicate payout order `{}`",
                payment.order_id
            )));
        }

        let id = payments.keys().max().copied().unwrap_or(0) + 1;
        let now = Utc::now();
        let stored = Payment {
            id: PaymentId(id),
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
        };
        payments.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>, RepositoryError> {
        Ok(self.payments.read().await.get(&id.0).cloned())
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Payment>, RepositoryError> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .find(|stored| {
                stored.transaction_type == transaction_type
                    && stored.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn find_by_order_id(
        &self,
        order_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Payment>, RepositoryError> {
        let payments = self.payments.read().await;
        Ok(payments
            .values()
            .filter(|stored| {
                stored.transaction_type == transaction_type && stored.order_id == order_id
            })
            .max_by_key(|stored| stored.id.0)
            .cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Payment>, RepositoryError> {
        let payments = self.payments.read().await;
        let mut owned: Vec<_> =
            payments.values().filter(|stored| stored.user_id == user_id).cloned().collect();
        owned.sort_by(|left, right| right.id.0.cmp(&left.id.0));
        Ok(owned)
    }

    async fn update_if_version(
        &self,
        payment: &Payment,
    ) -> Result<Option<Payment>, RepositoryError> {
        let mut payments = self.payments.write().await;
        let Some(stored) = payments.get_mut(&payment.id.0) else {
            return Ok(None);
        };
        if stored.version != payment.version {
            return Ok(None);
        }

        let mut next = payment.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next.clone();
        Ok(Some(next))
    }
}

#[derive(Default)]
pub struct InMemorySubscriptionRepository {
    subscriptions: RwLock<HashMap<i64, Subscription>>,
}

#[async_trait::async_trait]
impl SubscriptionRepository for InMemorySubscriptionRepository {
    async fn insert(
        &self,
        subscription: NewSubscription,
    ) -> Result<Subscription, RepositoryError> {
        let mut subscriptions = self.subscriptions.write().await;
        let id = subscriptions.keys().max().copied().unwrap_or(0) + 1;
        let now = Utc::now();
        let stored = Subscription {
            id: SubscriptionId(id),
            user_id: subscription.user_id,
            bot_id: subscription.bot_id,
            plan: subscription.plan,
            status: SubscriptionStatus::Pending,
            period_start: None,
            period_end: None,
            payment_id: subscription.payment_id,
            created_at: now,
            updated_at: now,
        };
        subscriptions.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, RepositoryError> {
        Ok(self.subscriptions.read().await.get(&id.0).cloned())
    }

    async fn find_by_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<Option<Subscription>, RepositoryError> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions.values().find(|stored| stored.payment_id == Some(payment_id)).cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Subscription>, RepositoryError> {
        let subscriptions = self.subscriptions.read().await;
        let mut owned: Vec<_> =
            subscriptions.values().filter(|stored| stored.user_id == user_id).cloned().collect();
        owned.sort_by(|left, right| right.id.0.cmp(&left.id.0));
        Ok(owned)
    }

    async fn update_if_status(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
    ) -> Result<bool, RepositoryError> {
        let mut subscriptions = self.subscriptions.write().await;
        match subscriptions.get_mut(&subscription.id.0) {
            Some(stored) if stored.status == expected => {
                *stored = Subscription { updated_at: Utc::now(), ..subscription.clone() };
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use secrecy::{ExposeSecret, SecretString};
    use serde_json::json;

    use tgdesk_core::domain::connection::{CrmProvider, NewCrmConnection, UserId};
    use tgdesk_core::domain::payment::{NewPayment, PaymentStatus, TransactionType};

    use crate::repositories::{
        CrmConnectionRepository, InMemoryCrmConnectionRepository, InMemoryPaymentRepository,
        PaymentRepository,
    };

    #[tokio::test]
    async fn in_memory_connection_upsert_keeps_one_row_per_user() {
        let repo = InMemoryCrmConnectionRepository::default();
        let connection = |token: &str| NewCrmConnection {
            user_id: UserId(3),
            provider: CrmProvider::TelegaVpn,
            access_token: SecretString::from(token.to_string()),
            refresh_token: None,
            domain: None,
            other_data: None,
            expires_at: None,
        };

        let first = repo.upsert_for_user(connection("a")).await.expect("first");
        let second = repo.upsert_for_user(connection("b")).await.expect("second");

        assert_eq!(first.id, second.id);
        assert_eq!(second.access_token.expose_secret(), "b");
        assert_eq!(repo.connections.read().await.len(), 1);
    }

    #[tokio::test]
    async fn in_memory_payment_cas_matches_sql_semantics() {
        let repo = InMemoryPaymentRepository::default();
        let inserted = repo
            .insert(NewPayment {
                user_id: UserId(1),
                amount: Decimal::new(1000, 0),
                currency: "RUB".to_string(),
                method: "TELEGRAM_PAY".to_string(),
                description: None,
                order_id: "paylink_1".to_string(),
                transaction_type: TransactionType::Payin,
                metadata: json!({}),
            })
            .await
            .expect("insert");

        let mut paid = inserted.clone();
        assert!(paid.transition_to(PaymentStatus::Paid).is_applied());
        let stored = repo.update_if_version(&paid).await.expect("update").expect("applied");
        assert_eq!(stored.version, 1);

        assert!(repo.update_if_version(&inserted).await.expect("stale").is_none());
    }
}
