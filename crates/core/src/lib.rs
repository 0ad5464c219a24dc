pub mod config;
pub mod crm;
pub mod crypto;
pub mod domain;
pub mod errors;
pub mod gateway;
pub mod retry;

pub use crm::{CrmAdapter, CrmContact, CrmRecord, CrmUserData};
pub use crypto::{CryptoError, EncryptionContext};
pub use domain::connection::{CrmConnection, CrmConnectionId, CrmProvider, CrmUser, UserId};
pub use domain::payment::{Payment, PaymentId, PaymentStatus, StatusTransition, TransactionType};
pub use domain::subscription::{
    Subscription, SubscriptionId, SubscriptionPlan, SubscriptionStatus,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use gateway::{GatewayResponse, PaymentGateway, WebhookPayload};
pub use retry::RetryPolicy;
