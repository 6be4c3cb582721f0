use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Used when no path is given on the command line. May be absent, in which
/// case everything comes from the environment.
pub const DEFAULT_CONFIG_PATH: &str = "groupmind.json";

pub const DEFAULT_MODELS: [&str; 3] = ["gemini-3-flash", "gemini-2.5-flash", "gemini-1.5-flash"];

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Unknown IANA timezone name.
    InvalidTimezone { name: String, reason: String },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::InvalidTimezone { name, reason } => {
                write!(f, "invalid timezone '{}': {}", name, reason)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::InvalidTimezone { .. } | Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    telegram_bot_token: String,
    gemini_api_key: String,
    /// Public host name Telegram posts updates to.
    domain: String,
    host: Option<String>,
    port: Option<u16>,
    webhook_path: Option<String>,
    webhook_secret: Option<String>,
    /// Users allowed to run admin commands in private chat.
    admin_ids: Vec<i64>,
    models: Option<Vec<String>>,
    rotate_models: bool,
    context_window: Option<usize>,
    cooldown_secs: Option<u64>,
    group_only: Option<bool>,
    command_prefixes: Option<Vec<String>>,
    keywords: Vec<String>,
    timezone: Option<String>,
    request_timeout_secs: Option<u64>,
    retry_backoff_ms: Option<u64>,
    max_input_chars: Option<usize>,
    system_prompt: Option<String>,
    /// Directory for state files (logs). Defaults to current directory.
    data_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    pub gemini_api_key: String,
    pub domain: String,
    pub host: String,
    pub port: u16,
    pub webhook_path: String,
    pub webhook_secret: Option<String>,
    pub admin_ids: HashSet<i64>,
    /// Model ids in fallback order.
    pub models: Vec<String>,
    pub rotate_models: bool,
    /// Turns kept per chat.
    pub context_window: usize,
    pub cooldown: Duration,
    pub group_only: bool,
    pub command_prefixes: Vec<String>,
    pub keywords: Vec<String>,
    pub timezone: Tz,
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_input_chars: usize,
    pub system_prompt: Option<String>,
    /// Directory for state files (logs).
    pub data_dir: PathBuf,
}

impl Config {
    /// Load from `path` (or the default path) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_sources(path, true, |key| std::env::var(key).ok()),
            None => Self::from_sources(Path::new(DEFAULT_CONFIG_PATH), false, |key| std::env::var(key).ok()),
        }
    }

    /// `env` looks up override variables; empty values are ignored.
    fn from_sources(
        path: &Path,
        required: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config_path = path.to_path_buf();
        let mut file: ConfigFile = match std::fs::read_to_string(&config_path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => ConfigFile::default(),
            Err(e) => return Err(ConfigError::ReadFile { path: config_path, source: e }),
        };

        let env = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        if let Some(token) = env("BOT_TOKEN") {
            file.telegram_bot_token = token;
        }
        if let Some(key) = env("GEMINI_API_KEY") {
            file.gemini_api_key = key;
        }
        if let Some(domain) = env("DOMAIN") {
            file.domain = domain;
        }
        if let Some(port) = env("PORT") {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::Validation(format!("PORT '{}' is not a valid port", port)))?;
            file.port = Some(port);
        }
        if let Some(secret) = env("WEBHOOK_SECRET") {
            file.webhook_secret = Some(secret);
        }

        // Validate required fields
        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token is required (or set BOT_TOKEN)".into(),
            ));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into(),
            ));
        }
        if file.gemini_api_key.is_empty() {
            return Err(ConfigError::Validation(
                "gemini_api_key is required (or set GEMINI_API_KEY)".into(),
            ));
        }
        let domain = file
            .domain
            .trim()
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_string();
        if domain.is_empty() {
            return Err(ConfigError::Validation("domain is required (or set DOMAIN)".into()));
        }

        let webhook_path = file.webhook_path.unwrap_or_else(|| "/webhook".to_string());
        if !webhook_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "webhook_path '{}' must start with '/'",
                webhook_path
            )));
        }

        let models: Vec<String> = file
            .models
            .unwrap_or_else(|| DEFAULT_MODELS.iter().map(|m| m.to_string()).collect())
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if models.is_empty() {
            return Err(ConfigError::Validation("models must contain at least one model id".into()));
        }

        let context_window = file.context_window.unwrap_or(6);
        if context_window == 0 {
            return Err(ConfigError::Validation("context_window must be at least 1".into()));
        }

        let request_timeout_secs = file.request_timeout_secs.unwrap_or(15);
        if request_timeout_secs == 0 {
            return Err(ConfigError::Validation("request_timeout_secs must be at least 1".into()));
        }

        let timezone_name = file.timezone.unwrap_or_else(|| "UTC".to_string());
        let timezone = timezone_name
            .parse::<Tz>()
            .map_err(|e| ConfigError::InvalidTimezone { name: timezone_name.clone(), reason: e.to_string() })?;

        let command_prefixes = file
            .command_prefixes
            .unwrap_or_else(|| vec!["/ai".to_string()])
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            telegram_bot_token: file.telegram_bot_token,
            gemini_api_key: file.gemini_api_key,
            domain,
            host: file.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: file.port.unwrap_or(8080),
            webhook_path,
            webhook_secret: file.webhook_secret.filter(|s| !s.is_empty()),
            admin_ids: file.admin_ids.into_iter().collect(),
            models,
            rotate_models: file.rotate_models,
            context_window,
            cooldown: Duration::from_secs(file.cooldown_secs.unwrap_or(3)),
            group_only: file.group_only.unwrap_or(true),
            command_prefixes,
            keywords: file.keywords.into_iter().filter(|k| !k.trim().is_empty()).collect(),
            timezone,
            request_timeout: Duration::from_secs(request_timeout_secs),
            retry_backoff: Duration::from_millis(file.retry_backoff_ms.unwrap_or(500)),
            max_input_chars: file.max_input_chars.unwrap_or(2000),
            system_prompt: file.system_prompt.filter(|p| !p.trim().is_empty()),
            data_dir,
        })
    }

    /// Public URL registered with Telegram.
    pub fn webhook_url(&self) -> String {
        format!("https://{}{}", self.domain, self.webhook_path)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
