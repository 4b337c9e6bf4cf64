//! Configuration and settings management
//!
//! Loads settings from config files and environment variables. The resulting
//! [`Settings`] is built once at startup and shared read-only behind an `Arc`.

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Telegram's hard limit for a single text message, in characters.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Default interval between two presence actions.
pub const PRESENCE_INTERVAL_MS: u64 = 1000;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_bot_token: String,

    /// OpenAI API key
    pub openai_api_key: String,
    /// Base URL of the OpenAI-compatible API
    #[serde(default = "default_openai_api_base")]
    pub openai_api_base: String,

    /// Model used for text replies
    #[serde(default = "default_gpt_model")]
    pub gpt_model: String,
    /// Model used for image generation
    #[serde(default = "default_dall_e_model")]
    pub dall_e_model: String,
    /// System instruction sent with every text request
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Price of one generated image, in account currency
    #[serde(default = "default_image_price")]
    pub image_price: Decimal,
    /// Size of generated images (always square)
    #[serde(default = "default_image_size")]
    pub image_size: String,
    /// Currency symbol shown in balance messages
    #[serde(default = "default_currency_symbol")]
    pub currency_symbol: String,

    /// Maximum characters per outgoing text message
    #[serde(default = "default_message_chunk_size")]
    pub message_chunk_size: usize,
    /// Milliseconds between two presence actions
    #[serde(default = "default_presence_interval_ms")]
    pub presence_interval_ms: u64,

    /// `enabled` routes provider traffic through the configured proxy
    #[serde(default = "default_proxy_mode")]
    pub proxy_mode: String,
    /// Proxy host
    pub proxy_host: Option<String>,
    /// Proxy port
    pub proxy_port: Option<u16>,
    /// Proxy user
    pub proxy_user: Option<String>,
    /// Proxy password
    pub proxy_pass: Option<String>,
}

fn default_openai_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_gpt_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_dall_e_model() -> String {
    "dall-e-3".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

const fn default_image_price() -> Decimal {
    Decimal::ONE
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_currency_symbol() -> String {
    "₪".to_string()
}

const fn default_message_chunk_size() -> usize {
    TELEGRAM_MESSAGE_LIMIT
}

const fn default_presence_interval_ms() -> u64 {
    PRESENCE_INTERVAL_MS
}

fn default_db_host() -> String {
    "localhost".to_string()
}

const fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_user() -> String {
    "postgres".to_string()
}

fn default_postgres_db() -> String {
    "postgres".to_string()
}

fn default_proxy_mode() -> String {
    "disabled".to_string()
}

/// Build the layered configuration source shared by both binaries.
///
/// # Errors
///
/// Returns a `ConfigError` if a present config file cannot be parsed.
pub fn build_config() -> Result<Config, ConfigError> {
    let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

    Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
        // Not checked into git
        .add_source(File::with_name("config/local").required(false))
        // Eg.. `APP__GPT_MODEL=gpt-4o ./target/chatpix-bot`
        .add_source(Environment::with_prefix("APP").separator("__"))
        // Plain env vars, UPPER_SNAKE_CASE is mapped to snake_case; empty means unset
        .add_source(Environment::default().ignore_empty(true))
        .build()
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chatpix_bot::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a required key is missing.
    pub fn new() -> Result<Self, ConfigError> {
        let settings: Self = build_config()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.message_chunk_size == 0 {
            return Err(ConfigError::Message(
                "MESSAGE_CHUNK_SIZE must be at least 1".to_string(),
            ));
        }
        if self.image_price.is_sign_negative() {
            return Err(ConfigError::Message(
                "IMAGE_PRICE must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between two presence actions
    #[must_use]
    pub const fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence_interval_ms)
    }

    /// Proxy URL for provider traffic, if proxying is enabled and complete
    #[must_use]
    pub fn proxy_url(&self) -> Option<String> {
        if !self.proxy_mode.eq_ignore_ascii_case("enabled") {
            return None;
        }
        let host = self.proxy_host.as_deref()?;
        let port = self.proxy_port?;
        match (&self.proxy_user, &self.proxy_pass) {
            (Some(user), Some(pass)) => Some(format!("http://{user}:{pass}@{host}:{port}")),
            _ => Some(format!("http://{host}:{port}")),
        }
    }
}

/// Account database settings, shared by the bot and the admin CLI
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseSettings {
    /// Database host
    #[serde(default = "default_db_host")]
    pub db_host: String,
    /// Database port
    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,
    /// Database user
    #[serde(default = "default_postgres_user")]
    pub postgres_user: String,
    /// Database password
    #[serde(default)]
    pub postgres_password: String,
    /// Database name
    #[serde(default = "default_postgres_db")]
    pub postgres_db: String,
}

impl DatabaseSettings {
    /// Load database settings from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        build_config()?.try_deserialize()
    }

    /// Connection pool configuration for `deadpool-postgres`
    #[must_use]
    pub fn pool_config(&self) -> deadpool_postgres::Config {
        deadpool_postgres::Config {
            host: Some(self.db_host.clone()),
            port: Some(self.postgres_port),
            user: Some(self.postgres_user.clone()),
            password: Some(self.postgres_password.clone()),
            dbname: Some(self.postgres_db.clone()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        telegram_bot_token: "dummy".to_string(),
        openai_api_key: "sk-test".to_string(),
        openai_api_base: default_openai_api_base(),
        gpt_model: default_gpt_model(),
        dall_e_model: default_dall_e_model(),
        system_prompt: default_system_prompt(),
        image_price: default_image_price(),
        image_size: default_image_size(),
        currency_symbol: default_currency_symbol(),
        message_chunk_size: default_message_chunk_size(),
        presence_interval_ms: default_presence_interval_ms(),
        proxy_mode: default_proxy_mode(),
        proxy_host: None,
        proxy_port: None,
        proxy_user: None,
        proxy_pass: None,
    }
}
