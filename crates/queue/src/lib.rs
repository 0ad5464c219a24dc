//! Outbound notifications to bot workers over a message broker.

pub mod command;
pub mod notifier;
pub mod publisher;

pub use command::BotCommand;
pub use notifier::Notifier;
pub use publisher::{
    AmqpPublisher, InMemoryPublisher, MessagePublisher, NoopPublisher, PublishError,
};
