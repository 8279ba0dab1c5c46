use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Deserializer};

/// Control-plane settings, sourced from environment variables with the exact
/// key names the operators know (`BUS_DB_PATH`, `CHAT_API_TOKEN`, ...).
/// Flags arrive as 0/1 integers; use the accessor methods for booleans.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_db_path")]
    pub bus_db_path: String,

    #[serde(default = "default_approval_window")]
    pub approval_window_sec: i64,

    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: usize,
    #[serde(default = "default_breaker_window")]
    pub breaker_window_sec: i64,

    /// 1 = HIGH commands require distinct sources AND distinct actors.
    #[serde(default)]
    pub dual_control_strict: u8,

    #[serde(default)]
    pub chat_enabled: u8,
    #[serde(default, deserialize_with = "de_stringly")]
    pub chat_api_token: Option<String>,
    #[serde(default = "default_chat_api_url")]
    pub chat_api_url: String,
    #[serde(default)]
    pub chat_control_channel: Option<i64>,
    /// Comma-separated user ids. A single bare id is accepted too.
    #[serde(default, deserialize_with = "de_stringly")]
    pub chat_allowlist: Option<String>,
    /// All-digit PINs arrive as numbers from the env layer; keep them as text.
    #[serde(default, deserialize_with = "de_stringly")]
    pub chat_pin: Option<String>,
    #[serde(default = "default_chat_rate_limit")]
    pub chat_rate_limit_per_min: usize,
    #[serde(default = "default_chat_long_poll")]
    pub chat_long_poll_sec: u64,

    #[serde(default = "default_token_len")]
    pub orders_token_len: usize,
}

fn de_stringly<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }))
}

fn default_db_path() -> String {
    "runtime/ctl.db".to_string()
}
fn default_approval_window() -> i64 {
    90
}
fn default_breaker_threshold() -> usize {
    5
}
fn default_breaker_window() -> i64 {
    60
}
fn default_chat_api_url() -> String {
    "https://api.telegram.org".to_string()
}
fn default_chat_rate_limit() -> usize {
    10
}
fn default_chat_long_poll() -> u64 {
    25
}
fn default_token_len() -> usize {
    6
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bus_db_path: default_db_path(),
            approval_window_sec: default_approval_window(),
            breaker_threshold: default_breaker_threshold(),
            breaker_window_sec: default_breaker_window(),
            dual_control_strict: 0,
            chat_enabled: 0,
            chat_api_token: None,
            chat_api_url: default_chat_api_url(),
            chat_control_channel: None,
            chat_allowlist: None,
            chat_pin: None,
            chat_rate_limit_per_min: default_chat_rate_limit(),
            chat_long_poll_sec: default_chat_long_poll(),
            orders_token_len: default_token_len(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let raw = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;
        let settings: Settings = raw.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_db_path.trim().is_empty() {
            return Err(ConfigError::Message("BUS_DB_PATH cannot be empty".into()));
        }
        if self.breaker_threshold == 0 {
            return Err(ConfigError::Message(
                "BREAKER_THRESHOLD must be at least 1".into(),
            ));
        }
        if self.approval_window_sec < 5 {
            return Err(ConfigError::Message(
                "APPROVAL_WINDOW_SEC must be at least 5 seconds".into(),
            ));
        }
        if !(4..=10).contains(&self.orders_token_len) {
            return Err(ConfigError::Message(
                "ORDERS_TOKEN_LEN must be between 4 and 10".into(),
            ));
        }
        if self.chat_enabled() {
            let token_ok = self
                .chat_api_token
                .as_deref()
                .map(|t| !t.trim().is_empty())
                .unwrap_or(false);
            if !token_ok {
                return Err(ConfigError::Message(
                    "CHAT_ENABLED=1 but CHAT_API_TOKEN is missing".into(),
                ));
            }
            if self.chat_control_channel.is_none() {
                return Err(ConfigError::Message(
                    "CHAT_ENABLED=1 but CHAT_CONTROL_CHANNEL is missing".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn chat_enabled(&self) -> bool {
        self.chat_enabled == 1
    }

    pub fn dual_control_strict(&self) -> bool {
        self.dual_control_strict == 1
    }

    pub fn chat_allowlist(&self) -> Vec<i64> {
        self.chat_allowlist
            .as_deref()
            .unwrap_or("")
            .split(',')
            .filter_map(|p| p.trim().parse::<i64>().ok())
            .collect()
    }

    pub fn chat_pin(&self) -> Option<&str> {
        self.chat_pin
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}
