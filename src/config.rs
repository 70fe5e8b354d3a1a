//! Runtime configuration from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::pipeline::dispatcher::DispatchSettings;
use crate::pipeline::types::{DEFAULT_TEXT_HASH_MIN_LEN, ForwardMode};
use crate::session::DEFAULT_RATE_LIMIT_BUFFER;

/// Daily at 03:00 UTC.
pub const DEFAULT_PRUNE_SCHEDULE: &str = "0 0 3 * * *";

pub const DEFAULT_DEDUP_RETENTION_DAYS: u32 = 30;

/// Relay configuration.
#[derive(Debug)]
pub struct RelayConfig {
    /// One bot token per account.
    pub bot_tokens: Vec<SecretString>,
    pub rules_path: PathBuf,
    pub db_path: PathBuf,
    pub mode: ForwardMode,
    /// Skip history replay unless a source overrides it.
    pub forward_new_only: bool,
    pub dedup_enabled: bool,
    pub dedup_retention_days: u32,
    pub prune_schedule: cron::Schedule,
    pub rate_limit_buffer: Duration,
    pub text_hash_min_len: usize,
}

impl RelayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which returns the value of a
    /// variable if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bot_tokens: Vec<SecretString> = var("TG_RELAY_BOT_TOKENS")
            .ok_or_else(|| ConfigError::MissingEnvVar("TG_RELAY_BOT_TOKENS".into()))?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.to_string()))
            .collect();
        if bot_tokens.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "TG_RELAY_BOT_TOKENS".into(),
                message: "no tokens listed".into(),
            });
        }

        let rules_path = var("TG_RELAY_RULES_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/rules.json"));

        let db_path = var("TG_RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/tg-relay.db"));

        let mode = match var("TG_RELAY_MODE") {
            Some(raw) => raw.parse().map_err(|message| ConfigError::InvalidValue {
                key: "TG_RELAY_MODE".into(),
                message,
            })?,
            None => ForwardMode::default(),
        };

        let prune_schedule_raw =
            var("TG_RELAY_PRUNE_SCHEDULE").unwrap_or_else(|| DEFAULT_PRUNE_SCHEDULE.to_string());
        let prune_schedule =
            cron::Schedule::from_str(&prune_schedule_raw).map_err(|e| ConfigError::InvalidValue {
                key: "TG_RELAY_PRUNE_SCHEDULE".into(),
                message: format!("invalid cron: {e}"),
            })?;

        Ok(Self {
            bot_tokens,
            rules_path,
            db_path,
            mode,
            forward_new_only: parse_bool(var("TG_RELAY_FORWARD_NEW_ONLY"), "TG_RELAY_FORWARD_NEW_ONLY", true)?,
            dedup_enabled: parse_bool(var("TG_RELAY_DEDUP"), "TG_RELAY_DEDUP", true)?,
            dedup_retention_days: parse_num(
                var("TG_RELAY_DEDUP_RETENTION_DAYS"),
                "TG_RELAY_DEDUP_RETENTION_DAYS",
                DEFAULT_DEDUP_RETENTION_DAYS,
            )?,
            prune_schedule,
            rate_limit_buffer: Duration::from_secs(parse_num(
                var("TG_RELAY_RATE_LIMIT_BUFFER_SECS"),
                "TG_RELAY_RATE_LIMIT_BUFFER_SECS",
                DEFAULT_RATE_LIMIT_BUFFER.as_secs(),
            )?),
            text_hash_min_len: parse_num(
                var("TG_RELAY_TEXT_HASH_MIN_LEN"),
                "TG_RELAY_TEXT_HASH_MIN_LEN",
                DEFAULT_TEXT_HASH_MIN_LEN,
            )?,
        })
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            mode: self.mode,
            dedup_enabled: self.dedup_enabled,
            text_hash_min_len: self.text_hash_min_len,
        }
    }
}

fn parse_bool(raw: Option<String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.into(),
            message: format!("expected a boolean, got '{raw}'"),
        }),
    }
}

fn parse_num<T>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}
