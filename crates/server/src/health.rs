use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tgdesk_core::config::QueueConfig;
use tgdesk_db::DbPool;

/// How bot commands leave the process. Fixed at wiring time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueMode {
    Disabled,
    Amqp { queue: String },
}

impl QueueMode {
    pub fn from_config(config: &QueueConfig) -> Self {
        match (config.enabled, config.url.as_ref()) {
            (true, Some(_)) => Self::Amqp { queue: config.bot_commands_queue.clone() },
            _ => Self::Disabled,
        }
    }

    fn check(&self) -> HealthCheck {
        match self {
            Self::Amqp { queue } => HealthCheck {
                status: "ready",
                detail: format!("bot commands published to `{queue}` over AMQP"),
            },
            Self::Disabled => HealthCheck {
                status: "disabled",
                detail: "queue disabled; bot commands are dropped".to_string(),
            },
        }
    }
}

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    queue: QueueMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub queue: HealthCheck,
    pub checked_at: String,
}

/// `/health` reports the database and the bot command publisher. Only an unreachable
/// database answers 503; a disabled queue is reported but does not degrade readiness.
pub fn router(db_pool: DbPool, queue: QueueMode) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, queue })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        queue: state.queue.check(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM payment").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "payment store reachable".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
