use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message consumed by bot workers. The `type` tag selects the handler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BotCommand {
    #[serde(rename_all = "camelCase")]
    SubscriptionActivated {
        user_id: i64,
        bot_id: i64,
        subscription_id: i64,
        plan: String,
        period_end: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    SubscriptionCancelled {
        user_id: i64,
        bot_id: i64,
        subscription_id: i64,
        reason: String,
    },
}

impl BotCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SubscriptionActivated { .. } => "subscription_activated",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
        }
    }
}
