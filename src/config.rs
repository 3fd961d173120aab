use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::chatbot::memory::MemoryScope;

pub const DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo";
pub const DEFAULT_MEMORY_FILE: &str = "memory.json";
pub const DEFAULT_SYSTEM_PROMPT_FILE: &str = "prompts/system_prompt.txt";
pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_HISTORY_LIMIT: usize = 10;
pub const DEFAULT_START_MESSAGE: &str = "Your AI bot is now live 🚀";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Errors that can occur when resolving configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// A required setting is absent or empty.
    Missing(&'static str),
    /// A setting is present but unusable.
    Invalid { key: &'static str, reason: String },
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "missing required setting '{key}'"),
            Self::Invalid { key, reason } => write!(f, "invalid setting '{key}': {reason}"),
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Missing(_) | Self::Invalid { .. } => None,
        }
    }
}

/// Process-wide settings, resolved once at startup.
pub struct Config {
    pub telegram_bot_token: String,
    pub openrouter_api_key: String,
    pub model: String,
    pub memory_file: PathBuf,
    pub system_prompt_file: PathBuf,
    /// Chat-completion endpoint (OpenAI-compatible).
    pub api_url: String,
    /// Number of trailing messages kept on disk and replayed to the model.
    pub history_limit: usize,
    pub memory_scope: MemoryScope,
    pub request_timeout: Duration,
    /// Extra attempts for transient completion failures (0 = single attempt).
    pub max_retries: u32,
    /// Reply to `/start`.
    pub start_message: String,
    pub log_dir: PathBuf,
    /// Optional OpenRouter attribution headers.
    pub app_referer: Option<String>,
    pub app_title: Option<String>,
}

impl Config {
    /// Resolve settings from the process environment.
    ///
    /// Keys are looked up as written (`telegram_bot_token`) and then upper-cased
    /// (`TELEGRAM_BOT_TOKEN`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| either_case(key, |k| std::env::var(k).ok()))
    }

    /// Resolve settings from an injected mapping.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| map.get(key).cloned())
    }

    /// Resolve settings from a JSON object file holding the same keys.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: HashMap<String, Value> = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        // Numbers and booleans are accepted alongside strings
        let map = file
            .into_iter()
            .filter_map(|(key, value)| match value {
                Value::Null => None,
                Value::String(s) => Some((key, s)),
                other => Some((key, other.to_string())),
            })
            .collect();

        Self::from_map(&map)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let telegram_bot_token = get("telegram_bot_token").ok_or(ConfigError::Missing("telegram_bot_token"))?;
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Invalid {
                key: "telegram_bot_token",
                reason: "expected format 123456789:ABCdefGHI...".into(),
            });
        }

        let openrouter_api_key = get("openrouter_api_key").ok_or(ConfigError::Missing("openrouter_api_key"))?;

        let history_limit = match get("history_limit") {
            Some(v) => parse_setting::<usize>("history_limit", &v)?,
            None => DEFAULT_HISTORY_LIMIT,
        };
        if history_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "history_limit",
                reason: "must be at least 1".into(),
            });
        }

        let memory_scope = match get("memory_scope") {
            Some(v) => parse_setting::<MemoryScope>("memory_scope", &v)?,
            None => MemoryScope::Shared,
        };

        let timeout_secs = match get("request_timeout_secs") {
            Some(v) => parse_setting::<u64>("request_timeout_secs", &v)?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "request_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }

        let max_retries = match get("max_retries") {
            Some(v) => parse_setting::<u32>("max_retries", &v)?,
            None => 0,
        };

        Ok(Self {
            telegram_bot_token,
            openrouter_api_key,
            model: get("model").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            memory_file: PathBuf::from(get("memory_file").unwrap_or_else(|| DEFAULT_MEMORY_FILE.to_string())),
            system_prompt_file: PathBuf::from(
                get("system_prompt_file").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT_FILE.to_string()),
            ),
            api_url: get("api_url").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            history_limit,
            memory_scope,
            request_timeout: Duration::from_secs(timeout_secs),
            max_retries,
            start_message: get("start_message").unwrap_or_else(|| DEFAULT_START_MESSAGE.to_string()),
            log_dir: PathBuf::from(get("log_dir").unwrap_or_else(|| "logs".to_string())),
            app_referer: get("app_referer"),
            app_title: get("app_title"),
        })
    }
}

/// Look `key` up as written, then upper-cased.
fn either_case<F>(key: &str, get: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    get(key).or_else(|| get(&key.to_uppercase()))
}

fn parse_setting<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid { key, reason: format!("'{value}': {e}") })
}
