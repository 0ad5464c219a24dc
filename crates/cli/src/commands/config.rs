use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;
use tgdesk_core::config::AppConfig;
use toml::Value;

use crate::commands::{load_config, CommandResult};

#[derive(Debug, Serialize)]
struct ConfigEntry {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run() -> CommandResult {
    let config = match load_config("config") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let file_path = detect_config_path();
    let file_doc = load_config_file_doc(file_path.as_deref());
    let entries: Vec<ConfigEntry> = effective_values(&config)
        .into_iter()
        .map(|(key, value)| ConfigEntry {
            key,
            value,
            source: field_source(key, file_doc.as_ref(), file_path.as_deref()),
        })
        .collect();

    CommandResult::success_with(
        "config",
        "effective config (source precedence: env > file > default)",
        Some(json!({ "entries": entries })),
    )
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.port", config.server.port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("telegapay.base_url", config.telegapay.base_url.clone()),
        ("telegapay.api_key", redact(Some(&config.telegapay.api_key))),
        ("telegapay.timeout_secs", config.telegapay.timeout_secs.to_string()),
        ("telegapay.max_retries", config.telegapay.max_retries.to_string()),
        ("telegapay.retry_base_delay_ms", config.telegapay.retry_base_delay_ms.to_string()),
        ("telegapay.retry_max_delay_ms", config.telegapay.retry_max_delay_ms.to_string()),
        ("telegapay.webhook_secret", redact(config.telegapay.webhook_secret.as_ref())),
        ("telegapay.payment_page_url", config.telegapay.payment_page_url.clone()),
        ("crm.telegavpn_base_url", config.crm.telegavpn_base_url.clone()),
        ("crm.timeout_secs", config.crm.timeout_secs.to_string()),
        ("encryption.key", redact(Some(&config.encryption.key))),
        ("billing.default_payment_method", config.billing.default_payment_method.clone()),
        ("billing.subscription_period_days", config.billing.subscription_period_days.to_string()),
        ("queue.enabled", config.queue.enabled.to_string()),
        ("queue.url", redact(config.queue.url.as_ref())),
        ("queue.bot_commands_queue", config.queue.bot_commands_queue.clone()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format).to_ascii_lowercase()),
    ]
}

/// `database.url` is read from `TGDESK_DATABASE_URL`.
fn env_key(key_path: &str) -> String {
    format!("TGDESK_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("tgdesk.toml"), PathBuf::from("config/tgdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(key_path: &str, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    let alias = key_path
        .strip_prefix("logging.")
        .map(|field| format!("TGDESK_LOG_{}", field.to_ascii_uppercase()));
    for env_key in std::iter::once(env_key(key_path)).chain(alias) {
        if env::var_os(&env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = file_doc {
        if contains_path(doc, key_path) {
            let file_path = file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact(secret: Option<&SecretString>) -> String {
    match secret.map(|secret| secret.expose_secret().trim()) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(_) => "<redacted>".to_string(),
    }
}
