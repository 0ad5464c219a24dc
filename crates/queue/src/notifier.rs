use std::sync::Arc;

use tracing::{debug, warn};

use crate::command::BotCommand;
use crate::publisher::MessagePublisher;

/// Fire-and-forget side channel. Failures are logged and never reach the caller.
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn MessagePublisher>,
    queue: String,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn MessagePublisher>, queue: impl Into<String>) -> Self {
        Self { publisher, queue: queue.into() }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn notify(&self, command: &BotCommand) {
        let message = match serde_json::to_value(command) {
            Ok(message) => message,
            Err(error) => {
                warn!(
                    event_name = "queue.publish.encode_failed",
                    command = command.kind(),
                    error = %error,
                    "bot command could not be encoded"
                );
                return;
            }
        };

        match self.publisher.publish(&self.queue, &message).await {
            Ok(()) => debug!(
                event_name = "queue.publish.sent",
                queue = %self.queue,
                command = command.kind(),
                "bot command published"
            ),
            Err(error) => warn!(
                event_name = "queue.publish.failed",
                queue = %self.queue,
                command = command.kind(),
                error = %error,
                "bot command publish failed; continuing"
            ),
        }
    }
}
