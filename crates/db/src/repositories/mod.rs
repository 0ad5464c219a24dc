use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tgdesk_core::domain::connection::{
    CrmConnection, CrmConnectionId, CrmConnectionPatch, CrmUser, NewCrmConnection, UserId,
};
use tgdesk_core::domain::payment::{NewPayment, Payment, PaymentId, TransactionType};
use tgdesk_core::domain::subscription::{
    NewSubscription, Subscription, SubscriptionId, SubscriptionStatus,
};
use tgdesk_core::errors::ApplicationError;
use tgdesk_core::CryptoError;

pub mod connection;
pub mod crm_user;
pub mod memory;
pub mod payment;
pub mod subscription;
pub mod user;

pub use connection::SqlCrmConnectionRepository;
pub use crm_user::SqlCrmUserRepository;
pub use memory::{
    InMemoryCrmConnectionRepository, InMemoryCrmUserRepository, InMemoryPaymentRepository,
    InMemorySubscriptionRepository, InMemoryUserRepository,
};
pub use payment::SqlPaymentRepository;
pub use subscription::SqlSubscriptionRepository;
pub use user::SqlUserRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("credential encryption error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        ApplicationError::Persistence(error.to_string())
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn exists(&self, id: UserId) -> Result<bool, RepositoryError>;
    async fn create(&self, email: Option<&str>) -> Result<UserId, RepositoryError>;
}

/// Stored CRM credentials. Implementations encrypt secrets on write and decrypt on read.
#[async_trait]
pub trait CrmConnectionRepository: Send + Sync {
    /// Creates the user's connection or replaces the stored credentials of the existing one.
    async fn upsert_for_user(
        &self,
        connection: NewCrmConnection,
    ) -> Result<CrmConnection, RepositoryError>;

    async fn find_by_id(
        &self,
        id: CrmConnectionId,
    ) -> Result<Option<CrmConnection>, RepositoryError>;

    async fn find_by_user(&self, user_id: UserId)
        -> Result<Option<CrmConnection>, RepositoryError>;

    async fn update(
        &self,
        id: CrmConnectionId,
        patch: CrmConnectionPatch,
    ) -> Result<Option<CrmConnection>, RepositoryError>;

    async fn delete(&self, id: CrmConnectionId) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait CrmUserRepository: Send + Sync {
    async fn upsert(&self, user: CrmUser) -> Result<(), RepositoryError>;
    async fn find_by_telegram_id(
        &self,
        telegram_id: i64,
    ) -> Result<Option<CrmUser>, RepositoryError>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert(&self, payment: NewPayment) -> Result<Payment, RepositoryError>;

    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>, RepositoryError>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Payment>, RepositoryError>;

    async fn find_by_order_id(
        &self,
        order_id: &str,
        transaction_type: TransactionType,
    ) -> Result<Option<Payment>, RepositoryError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Payment>, RepositoryError>;

    /// Compare-and-swap on `payment.version`. Returns the stored row with its bumped
    /// version, or `None` when another writer got there first.
    async fn update_if_version(&self, payment: &Payment)
        -> Result<Option<Payment>, RepositoryError>;
}

#[async_trait]
pub trait SubscriptionRepository: Send + Sync {
    async fn insert(&self, subscription: NewSubscription)
        -> Result<Subscription, RepositoryError>;

    async fn find_by_id(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Subscription>, RepositoryError>;

    async fn find_by_payment(
        &self,
        payment_id: PaymentId,
    ) -> Result<Option<Subscription>, RepositoryError>;

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Subscription>, RepositoryError>;

    /// Persists `subscription` only if the stored status still equals `expected`.
    async fn update_if_status(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
    ) -> Result<bool, RepositoryError>;
}

pub(crate) fn parse_timestamp(
    column: &str,
    value: String,
) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
