use std::collections::HashSet;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use tgdesk_core::RetryPolicy;

const PERSISTENT_DELIVERY: u8 = 2;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("queue declaration failed: {0}")]
    Declare(String),
    #[error("message encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, queue: &str, message: &Value) -> Result<(), PublishError>;
}

/// Used when the queue is disabled in configuration.
#[derive(Default)]
pub struct NoopPublisher;

#[async_trait]
impl MessagePublisher for NoopPublisher {
    async fn publish(&self, _queue: &str, _message: &Value) -> Result<(), PublishError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPublisher {
    published: Mutex<Vec<(String, Value)>>,
    failing: bool,
}

impl InMemoryPublisher {
    /// A publisher whose every publish fails, for exercising degrade paths.
    pub fn failing() -> Self {
        Self { published: Mutex::new(Vec::new()), failing: true }
    }

    pub async fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn publish(&self, queue: &str, message: &Value) -> Result<(), PublishError> {
        if self.failing {
            return Err(PublishError::Publish("broker unavailable".to_string()));
        }
        self.published.lock().await.push((queue.to_string(), message.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct BrokerSession {
    connection: Option<Connection>,
    channel: Option<Channel>,
    declared: HashSet<String>,
}

/// AMQP 0.9.1 publisher. Connects lazily and reconnects with backoff when the
/// channel has dropped.
pub struct AmqpPublisher {
    url: SecretString,
    reconnect_policy: RetryPolicy,
    session: Mutex<BrokerSession>,
}

impl AmqpPublisher {
    pub fn new(url: SecretString, reconnect_policy: RetryPolicy) -> Self {
        Self { url, reconnect_policy, session: Mutex::new(BrokerSession::default()) }
    }

    async fn open_channel(&self) -> Result<(Connection, Channel), PublishError> {
        let connection =
            Connection::connect(self.url.expose_secret(), ConnectionProperties::default())
                .await
                .map_err(|error| PublishError::Connect(error.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|error| PublishError::Connect(error.to_string()))?;
        Ok((connection, channel))
    }

    async fn ensure_channel(&self, session: &mut BrokerSession) -> Result<Channel, PublishError> {
        if let Some(channel) = session.channel.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        session.channel = None;
        session.connection = None;
        session.declared.clear();

        let mut attempt = 0;
        loop {
            match self.open_channel().await {
                Ok((connection, channel)) => {
                    info!(
                        event_name = "queue.broker.connected",
                        attempt,
                        "message broker channel opened"
                    );
                    session.connection = Some(connection);
                    session.channel = Some(channel.clone());
                    return Ok(channel);
                }
                Err(error) if attempt < self.reconnect_policy.max_retries => {
                    let delay = self.reconnect_policy.backoff(attempt);
                    warn!(
                        event_name = "queue.broker.reconnect_scheduled",
                        attempt,
                        max_retries = self.reconnect_policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "message broker connection failed"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl MessagePublisher for AmqpPublisher {
    async fn publish(&self, queue: &str, message: &Value) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(message)?;
        let mut session = self.session.lock().await;
        let channel = self.ensure_channel(&mut session).await?;

        if !session.declared.contains(queue) {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() },
                    FieldTable::default(),
                )
                .await
                .map_err(|error| PublishError::Declare(error.to_string()))?;
            session.declared.insert(queue.to_string());
        }

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY),
            )
            .await
            .map_err(|error| PublishError::Publish(error.to_string()))?
            .await
            .map_err(|error| PublishError::Publish(error.to_string()))?;

        Ok(())
    }
}
