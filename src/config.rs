use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 10000;
const CONFIG_DIR: &str = "config";

const DEFAULT_MP_BASE_URL: &str = "https://api.mercadopago.com";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_ACK_TIMEOUT_SECS: u64 = 10;
const DEFAULT_TICKET_COOLDOWN_SECS: u64 = 60;
const DEFAULT_INACTIVITY_CLOSE_SECS: u64 = 600;
const DEFAULT_DELETE_DELAY_MS: u64 = 2_500;
const DEFAULT_AUTO_CLOSE_AFTER_DELIVERY_MS: u64 = 8_000;
const DEFAULT_INTERACTION_DEDUPE_MS: u64 = 12_000;
const DEFAULT_CHANNEL_LOCK_MS: u64 = 15_000;
const DEFAULT_TICKET_LOCK_MS: u64 = 30_000;
const DEFAULT_DELIVERY_LOCK_MS: u64 = 120_000;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[serde(default = "default_env")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Mercado Pago access token (bearer auth for the checkout API)
    pub mp_access_token: String,

    /// Mercado Pago API base URL (override for tests/sandboxes)
    #[serde(default = "default_mp_base_url")]
    pub mp_base_url: String,

    /// Public URL Mercado Pago should deliver payment notifications to
    #[serde(default)]
    pub mp_notification_url: Option<String>,

    /// Shared secret for webhook signature verification; unset disables
    /// signature checking (opt-in hardening)
    #[serde(default)]
    pub mp_webhook_secret: Option<String>,

    /// Game delivery API endpoint
    pub delivery_api_url: String,

    /// Game delivery API token
    pub delivery_api_token: String,

    /// Discord bot token (outbound REST only)
    pub discord_bot_token: String,

    /// Guild the shop operates in
    pub guild_id: String,

    /// Category new ticket channels are created under
    pub ticket_category_id: String,

    /// Channel purchase logs are posted to
    pub log_channel_id: String,

    /// Role allowed to close any ticket
    #[serde(default)]
    pub support_role_id: Option<String>,

    /// Timeout for every outbound collaborator call (seconds)
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Watchdog: maximum time a customer waits for an acknowledgement
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Minimum delay between ticket openings per customer (seconds)
    #[serde(default = "default_ticket_cooldown_secs")]
    pub ticket_cooldown_secs: u64,

    /// Idle time before a ticket channel is closed automatically (seconds)
    #[serde(default = "default_inactivity_close_secs")]
    pub inactivity_close_secs: u64,

    /// Delay between the closing message and channel deletion (ms)
    #[serde(default = "default_delete_delay_ms")]
    pub delete_delay_ms: u64,

    /// Delay before a delivered ticket is closed (ms)
    #[serde(default = "default_auto_close_after_delivery_ms")]
    pub auto_close_after_delivery_ms: u64,

    /// Trailing window in which a repeated interaction id is dropped (ms)
    #[serde(default = "default_interaction_dedupe_ms")]
    pub interaction_dedupe_ms: u64,

    /// TTL of the per-channel charge-creation lock (ms)
    #[serde(default = "default_channel_lock_ms")]
    pub channel_lock_ms: u64,

    /// TTL of the per-customer ticket-creation lock (ms)
    #[serde(default = "default_ticket_lock_ms")]
    pub ticket_lock_ms: u64,

    /// TTL of the per-payment delivery lock (ms); safety net against a
    /// handler that crashed without releasing
    #[serde(default = "default_delivery_lock_ms")]
    pub delivery_lock_ms: u64,
}

fn default_database_url() -> String {
    "sqlite://coinshop.db?mode=rwc".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_env() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_mp_base_url() -> String {
    DEFAULT_MP_BASE_URL.to_string()
}
fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}
fn default_ack_timeout_secs() -> u64 {
    DEFAULT_ACK_TIMEOUT_SECS
}
fn default_ticket_cooldown_secs() -> u64 {
    DEFAULT_TICKET_COOLDOWN_SECS
}
fn default_inactivity_close_secs() -> u64 {
    DEFAULT_INACTIVITY_CLOSE_SECS
}
fn default_delete_delay_ms() -> u64 {
    DEFAULT_DELETE_DELAY_MS
}
fn default_auto_close_after_delivery_ms() -> u64 {
    DEFAULT_AUTO_CLOSE_AFTER_DELIVERY_MS
}
fn default_interaction_dedupe_ms() -> u64 {
    DEFAULT_INTERACTION_DEDUPE_MS
}
fn default_channel_lock_ms() -> u64 {
    DEFAULT_CHANNEL_LOCK_MS
}
fn default_ticket_lock_ms() -> u64 {
    DEFAULT_TICKET_LOCK_MS
}
fn default_delivery_lock_ms() -> u64 {
    DEFAULT_DELIVERY_LOCK_MS
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn ticket_cooldown(&self) -> Duration {
        Duration::from_secs(self.ticket_cooldown_secs)
    }

    pub fn inactivity_close(&self) -> Duration {
        Duration::from_secs(self.inactivity_close_secs)
    }

    pub fn delete_delay(&self) -> Duration {
        Duration::from_millis(self.delete_delay_ms)
    }

    pub fn auto_close_after_delivery(&self) -> Duration {
        Duration::from_millis(self.auto_close_after_delivery_ms)
    }

    pub fn interaction_dedupe_window(&self) -> Duration {
        Duration::from_millis(self.interaction_dedupe_ms)
    }

    pub fn channel_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.channel_lock_ms)
    }

    pub fn ticket_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.ticket_lock_ms)
    }

    pub fn delivery_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.delivery_lock_ms)
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Initializes the global tracing subscriber.
pub fn init_tracing(level: &str, json: bool) {
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    if json {
        let _ = fmt().with_env_filter(EnvFilter::new(filter)).json().try_init();
    } else {
        let _ = fmt().with_env_filter(EnvFilter::new(filter)).try_init();
    }
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    // Required secrets get a clear error before deserialization.
    for key in [
        "mp_access_token",
        "delivery_api_url",
        "delivery_api_token",
        "discord_bot_token",
        "guild_id",
        "ticket_category_id",
        "log_channel_id",
    ] {
        if config.get_string(key).is_err() {
            error!(
                "Missing required configuration '{}'. Set APP__{} or add it to config/{}.toml",
                key,
                key.to_uppercase(),
                run_env
            );
            return Err(AppConfigError::Load(ConfigError::NotFound(format!(
                "{key} is required but not configured"
            ))));
        }
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        host: "127.0.0.1".into(),
        port: 0,
        environment: "development".into(),
        log_level: "debug".into(),
        log_json: false,
        mp_access_token: "TEST-TOKEN".into(),
        mp_base_url: "http://127.0.0.1:0".into(),
        mp_notification_url: None,
        mp_webhook_secret: None,
        delivery_api_url: "http://127.0.0.1:0/give".into(),
        delivery_api_token: "test-delivery-token".into(),
        discord_bot_token: "test-bot-token".into(),
        guild_id: "guild-1".into(),
        ticket_category_id: "category-1".into(),
        log_channel_id: "log-channel".into(),
        support_role_id: None,
        http_timeout_secs: 2,
        ack_timeout_secs: 2,
        ticket_cooldown_secs: 60,
        inactivity_close_secs: 600,
        delete_delay_ms: 10,
        auto_close_after_delivery_ms: 10,
        interaction_dedupe_ms: 12_000,
        channel_lock_ms: 15_000,
        ticket_lock_ms: 30_000,
        delivery_lock_ms: 120_000,
    }
}
