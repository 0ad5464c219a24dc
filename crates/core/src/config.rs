use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub telegapay: TelegapayConfig,
    pub crm: CrmConfig,
    pub encryption: EncryptionConfig,
    pub billing: BillingConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TelegapayConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub webhook_secret: Option<SecretString>,
    pub payment_page_url: String,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub telegavpn_base_url: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EncryptionConfig {
    /// 32-byte key, hex encoded.
    pub key: SecretString,
}

#[derive(Clone, Debug)]
pub struct BillingConfig {
    pub default_payment_method: String,
    pub subscription_period_days: u32,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub enabled: bool,
    pub url: Option<SecretString>,
    pub bot_commands_queue: String,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub telegapay_base_url: Option<String>,
    pub telegapay_api_key: Option<String>,
    pub telegapay_webhook_secret: Option<String>,
    pub encryption_key: Option<String>,
    pub queue_enabled: Option<bool>,
    pub queue_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://tgdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            telegapay: TelegapayConfig {
                base_url: String::new(),
                api_key: String::new().into(),
                timeout_secs: 10,
                max_retries: 2,
                retry_base_delay_ms: 200,
                retry_max_delay_ms: 2_000,
                webhook_secret: None,
                payment_page_url: "https://pay.telegapay.com".to_string(),
            },
            crm: CrmConfig {
                telegavpn_base_url: "https://api.telegavpn.com".to_string(),
                timeout_secs: 10,
            },
            encryption: EncryptionConfig { key: String::new().into() },
            billing: BillingConfig {
                default_payment_method: "BANK_SBER".to_string(),
                subscription_period_days: 30,
            },
            queue: QueueConfig {
                enabled: false,
                url: None,
                bot_commands_queue: "bot_commands".to_string(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tgdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(telegapay) = patch.telegapay {
            if let Some(base_url) = telegapay.base_url {
                self.telegapay.base_url = base_url;
            }
            if let Some(api_key) = telegapay.api_key {
                self.telegapay.api_key = secret_value(api_key);
            }
            if let Some(timeout_secs) = telegapay.timeout_secs {
                self.telegapay.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = telegapay.max_retries {
                self.telegapay.max_retries = max_retries;
            }
            if let Some(retry_base_delay_ms) = telegapay.retry_base_delay_ms {
                self.telegapay.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_max_delay_ms) = telegapay.retry_max_delay_ms {
                self.telegapay.retry_max_delay_ms = retry_max_delay_ms;
            }
            if let Some(webhook_secret) = telegapay.webhook_secret {
                self.telegapay.webhook_secret = Some(secret_value(webhook_secret));
            }
            if let Some(payment_page_url) = telegapay.payment_page_url {
                self.telegapay.payment_page_url = payment_page_url;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(telegavpn_base_url) = crm.telegavpn_base_url {
                self.crm.telegavpn_base_url = telegavpn_base_url;
            }
            if let Some(timeout_secs) = crm.timeout_secs {
                self.crm.timeout_secs = timeout_secs;
            }
        }

        if let Some(encryption) = patch.encryption {
            if let Some(key) = encryption.key {
                self.encryption.key = secret_value(key);
            }
        }

        if let Some(billing) = patch.billing {
            if let Some(default_payment_method) = billing.default_payment_method {
                self.billing.default_payment_method = default_payment_method;
            }
            if let Some(subscription_period_days) = billing.subscription_period_days {
                self.billing.subscription_period_days = subscription_period_days;
            }
        }

        if let Some(queue) = patch.queue {
            if let Some(enabled) = queue.enabled {
                self.queue.enabled = enabled;
            }
            if let Some(url) = queue.url {
                self.queue.url = Some(secret_value(url));
            }
            if let Some(bot_commands_queue) = queue.bot_commands_queue {
                self.queue.bot_commands_queue = bot_commands_queue;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TGDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TGDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("TGDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TGDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TGDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TGDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TGDESK_SERVER_PORT") {
            self.server.port = parse_u16("TGDESK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("TGDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TGDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("TGDESK_TELEGAPAY_BASE_URL") {
            self.telegapay.base_url = value;
        }
        if let Some(value) = read_env("TGDESK_TELEGAPAY_API_KEY") {
            self.telegapay.api_key = secret_value(value);
        }
        if let Some(value) = read_env("TGDESK_TELEGAPAY_TIMEOUT_SECS") {
            self.telegapay.timeout_secs = parse_u64("TGDESK_TELEGAPAY_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TGDESK_TELEGAPAY_MAX_RETRIES") {
            self.telegapay.max_retries = parse_u32("TGDESK_TELEGAPAY_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("TGDESK_TELEGAPAY_WEBHOOK_SECRET") {
            self.telegapay.webhook_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("TGDESK_TELEGAPAY_PAYMENT_PAGE_URL") {
            self.telegapay.payment_page_url = value;
        }

        if let Some(value) = read_env("TGDESK_CRM_TELEGAVPN_BASE_URL") {
            self.crm.telegavpn_base_url = value;
        }
        if let Some(value) = read_env("TGDESK_CRM_TIMEOUT_SECS") {
            self.crm.timeout_secs = parse_u64("TGDESK_CRM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TGDESK_ENCRYPTION_KEY") {
            self.encryption.key = secret_value(value);
        }

        if let Some(value) = read_env("TGDESK_BILLING_DEFAULT_PAYMENT_METHOD") {
            self.billing.default_payment_method = value;
        }
        if let Some(value) = read_env("TGDESK_BILLING_SUBSCRIPTION_PERIOD_DAYS") {
            self.billing.subscription_period_days =
                parse_u32("TGDESK_BILLING_SUBSCRIPTION_PERIOD_DAYS", &value)?;
        }

        if let Some(value) = read_env("TGDESK_QUEUE_ENABLED") {
            self.queue.enabled = parse_bool("TGDESK_QUEUE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("TGDESK_QUEUE_URL") {
            self.queue.url = Some(secret_value(value));
        }
        if let Some(value) = read_env("TGDESK_QUEUE_BOT_COMMANDS_QUEUE") {
            self.queue.bot_commands_queue = value;
        }

        let log_level = read_env("TGDESK_LOGGING_LEVEL").or_else(|| read_env("TGDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TGDESK_LOGGING_FORMAT").or_else(|| read_env("TGDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(base_url) = overrides.telegapay_base_url {
            self.telegapay.base_url = base_url;
        }
        if let Some(api_key) = overrides.telegapay_api_key {
            self.telegapay.api_key = secret_value(api_key);
        }
        if let Some(webhook_secret) = overrides.telegapay_webhook_secret {
            self.telegapay.webhook_secret = Some(secret_value(webhook_secret));
        }
        if let Some(key) = overrides.encryption_key {
            self.encryption.key = secret_value(key);
        }
        if let Some(enabled) = overrides.queue_enabled {
            self.queue.enabled = enabled;
        }
        if let Some(url) = overrides.queue_url {
            self.queue.url = Some(secret_value(url));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_telegapay(&self.telegapay)?;
        validate_crm(&self.crm)?;
        validate_encryption(&self.encryption)?;
        validate_billing(&self.billing)?;
        validate_queue(&self.queue)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tgdesk.toml"), PathBuf::from("config/tgdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_telegapay(telegapay: &TelegapayConfig) -> Result<(), ConfigError> {
    let base_url = telegapay.base_url.trim();
    if base_url.is_empty() {
        return Err(ConfigError::Validation(
            "telegapay.base_url is required (set TGDESK_TELEGAPAY_BASE_URL)".to_string(),
        ));
    }
    if !is_http_url(base_url) {
        return Err(ConfigError::Validation(
            "telegapay.base_url must start with http:// or https://".to_string(),
        ));
    }

    if telegapay.api_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "telegapay.api_key is required (set TGDESK_TELEGAPAY_API_KEY)".to_string(),
        ));
    }

    if telegapay.timeout_secs == 0 || telegapay.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "telegapay.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    if telegapay.max_retries > 10 {
        return Err(ConfigError::Validation(
            "telegapay.max_retries must be at most 10".to_string(),
        ));
    }

    if telegapay.retry_base_delay_ms > telegapay.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "telegapay.retry_base_delay_ms must not exceed telegapay.retry_max_delay_ms"
                .to_string(),
        ));
    }

    if !is_http_url(telegapay.payment_page_url.trim()) {
        return Err(ConfigError::Validation(
            "telegapay.payment_page_url must start with http:// or https://".to_string(),
        ));
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if !is_http_url(crm.telegavpn_base_url.trim()) {
        return Err(ConfigError::Validation(
            "crm.telegavpn_base_url must start with http:// or https://".to_string(),
        ));
    }

    if crm.timeout_secs == 0 || crm.timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "crm.timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    Ok(())
}

fn validate_encryption(encryption: &EncryptionConfig) -> Result<(), ConfigError> {
    let key = encryption.key.expose_secret().trim();
    if key.is_empty() {
        return Err(ConfigError::Validation(
            "encryption.key is required (64 hex characters, set TGDESK_ENCRYPTION_KEY)"
                .to_string(),
        ));
    }

    if key.len() != 64 || !key.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Err(ConfigError::Validation(
            "encryption.key must be exactly 64 hex characters (32 bytes)".to_string(),
        ));
    }

    Ok(())
}

fn validate_billing(billing: &BillingConfig) -> Result<(), ConfigError> {
    if billing.default_payment_method.trim().is_empty() {
        return Err(ConfigError::Validation(
            "billing.default_payment_method must not be empty".to_string(),
        ));
    }

    if billing.subscription_period_days == 0 {
        return Err(ConfigError::Validation(
            "billing.subscription_period_days must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_queue(queue: &QueueConfig) -> Result<(), ConfigError> {
    if queue.bot_commands_queue.trim().is_empty() {
        return Err(ConfigError::Validation(
            "queue.bot_commands_queue must not be empty".to_string(),
        ));
    }

    if queue.enabled {
        let missing =
            queue.url.as_ref().map(|url| url.expose_secret().trim().is_empty()).unwrap_or(true);
        if missing {
            return Err(ConfigError::Validation(
                "queue.enabled is true but queue.url is not configured".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    telegapay: Option<TelegapayPatch>,
    crm: Option<CrmPatch>,
    encryption: Option<EncryptionPatch>,
    billing: Option<BillingPatch>,
    queue: Option<QueuePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegapayPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    webhook_secret: Option<String>,
    payment_page_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    telegavpn_base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EncryptionPatch {
    key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BillingPatch {
    default_payment_method: Option<String>,
    subscription_period_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct QueuePatch {
    enabled: Option<bool>,
    url: Option<String>,
    bot_commands_queue: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
