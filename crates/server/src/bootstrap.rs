use std::sync::Arc;

use axum::Router;
use tgdesk_core::config::{AppConfig, ConfigError, LoadOptions};
use tgdesk_core::{ApplicationError, CryptoError, EncryptionContext, RetryPolicy};
use tgdesk_db::repositories::{
    SqlCrmConnectionRepository, SqlCrmUserRepository, SqlPaymentRepository,
    SqlSubscriptionRepository, SqlUserRepository,
};
use tgdesk_db::{connect_from_config, migrations, DbPool};
use tgdesk_queue::{AmqpPublisher, MessagePublisher, NoopPublisher, Notifier};
use thiserror::Error;
use tracing::info;

use crate::billing::{self, BillingService, BillingState};
use crate::crm::routes::CrmState;
use crate::crm::{self, ConnectionService, CrmDispatcher};
use crate::health::{self, QueueMode};
use crate::telegapay::{
    self, PaymentReconciler, ReconcilerSettings, TelegapayClient, TelegapayState,
};

/// Broker reconnects back off further than gateway calls do.
const BROKER_RECONNECT: RetryPolicy =
    RetryPolicy { max_retries: 5, base_delay_ms: 500, max_delay_ms: 10_000 };

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub queue: QueueMode,
    pub crm: CrmState,
    pub telegapay: TelegapayState,
    pub billing: BillingState,
}

impl Application {
    pub fn router(&self) -> Router {
        health::router(self.db_pool.clone(), self.queue.clone())
            .merge(crm::routes::router(self.crm.clone()))
            .merge(telegapay::routes::router(self.telegapay.clone()))
            .merge(billing::routes::router(self.billing.clone()))
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("encryption key unusable: {0}")]
    Crypto(#[from] CryptoError),
    #[error("service wiring failed: {0}")]
    Wiring(#[from] ApplicationError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    wire(config, db_pool)
}

/// Builds every service over an already migrated pool.
pub fn wire(config: AppConfig, db_pool: DbPool) -> Result<Application, BootstrapError> {
    let crypto = Arc::new(EncryptionContext::new(&config.encryption.key)?);

    let users = Arc::new(SqlUserRepository::new(db_pool.clone()));
    let connections = Arc::new(SqlCrmConnectionRepository::new(db_pool.clone(), crypto));
    let crm_users = Arc::new(SqlCrmUserRepository::new(db_pool.clone()));
    let payments = Arc::new(SqlPaymentRepository::new(db_pool.clone()));
    let subscriptions = Arc::new(SqlSubscriptionRepository::new(db_pool.clone()));

    let dispatcher = CrmDispatcher::from_config(&config.crm, crm_users)?;
    let gateway = TelegapayClient::from_config(&config.telegapay)?;

    let queue = QueueMode::from_config(&config.queue);
    let publisher: Arc<dyn MessagePublisher> = match (&queue, config.queue.url.as_ref()) {
        (QueueMode::Amqp { .. }, Some(url)) => {
            Arc::new(AmqpPublisher::new(url.clone(), BROKER_RECONNECT))
        }
        _ => Arc::new(NoopPublisher),
    };
    info!(
        event_name = "system.bootstrap.queue_mode",
        correlation_id = "bootstrap",
        enabled = config.queue.enabled,
        queue = %config.queue.bot_commands_queue,
        "bot command publisher initialized"
    );

    let reconciler = Arc::new(PaymentReconciler::new(
        Arc::new(gateway),
        users.clone(),
        payments.clone(),
        subscriptions.clone(),
        Notifier::new(publisher, config.queue.bot_commands_queue.clone()),
        ReconcilerSettings {
            default_payment_method: config.billing.default_payment_method.clone(),
            subscription_period_days: config.billing.subscription_period_days,
            payment_page_url: config.telegapay.payment_page_url.clone(),
        },
    ));

    Ok(Application {
        crm: CrmState {
            connections: ConnectionService::new(users, connections),
            dispatcher: Arc::new(dispatcher),
        },
        telegapay: TelegapayState {
            reconciler: reconciler.clone(),
            webhook_secret: config.telegapay.webhook_secret.clone(),
        },
        billing: BillingState { billing: BillingService::new(reconciler, payments, subscriptions) },
        config,
        db_pool,
        queue,
    })
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tgdesk_core::config::{ConfigOverrides, LoadOptions};
    use tower::ServiceExt;

    use super::{bootstrap, BootstrapError};

    const KEY: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    fn options(database_url: &str, encryption_key: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                telegapay_base_url: Some("http://127.0.0.1:9".to_string()),
                telegapay_api_key: Some("test-key".to_string()),
                encryption_key: Some(encryption_key.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_malformed_encryption_key() {
        let result = bootstrap(options("sqlite::memory:", "not-hex")).await;

        let error = result.err().expect("error");
        assert!(matches!(error, BootstrapError::Config(_)));
        assert!(error.to_string().contains("encryption.key"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_serves_health() {
        let app = bootstrap(options("sqlite::memory:?cache=shared", KEY))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('app_user', 'crm_connection', 'crm_user', 'payment', 'subscription')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 5);

        let response = app
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let health: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(health["database"]["status"], "ready");
        assert_eq!(health["queue"]["status"], "disabled");

        let plans = app
            .router()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/billing/plans")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(plans.status(), StatusCode::OK);

        app.db_pool.close().await;
    }
}
