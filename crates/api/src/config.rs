//! Process configuration, read once from the environment at startup.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

use rollcall_auth::credentials::{DEFAULT_ACCESS_TTL_MINUTES, DEFAULT_REFRESH_TTL_MINUTES, MAX_TTL_MINUTES};
use rollcall_auth::{CredentialConfig, PasswordParams};

/// Signing secret used when `JWT_SECRET` is unset. Never use outside dev.
pub const DEV_JWT_SECRET: &str = "dev-secret";

/// Redis consumer name when neither `REDIS_CONSUMER_NAME` nor `HOSTNAME` is set.
pub const DEFAULT_CONSUMER_NAME: &str = "rollcall-api";

/// Longest accepted `SCHEDULE_DELAY_MINUTES` (one year).
pub const MAX_SCHEDULE_DELAY_MINUTES: i64 = 525_600;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} is required when {1} is set")]
    Missing(&'static str, &'static str),
}

#[derive(Clone)]
pub struct AppConfig {
    pub jwt_secret: String,
    pub bind_addr: SocketAddr,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_minutes: i64,
    /// Delay applied by `POST /user/schedule`.
    pub schedule_delay_minutes: i64,
    pub task_max_retries: u32,
    pub consumer_concurrency: usize,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    /// Stable Redis consumer name, so a restarted process finds its own
    /// pending entries again.
    pub redis_consumer_name: String,
    pub password_params: PasswordParams,
}

impl core::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppConfig")
            .field("jwt_secret", &"<redacted>")
            .field("bind_addr", &self.bind_addr)
            .field("access_token_ttl_minutes", &self.access_token_ttl_minutes)
            .field("refresh_token_ttl_minutes", &self.refresh_token_ttl_minutes)
            .field("schedule_delay_minutes", &self.schedule_delay_minutes)
            .field("task_max_retries", &self.task_max_retries)
            .field("consumer_concurrency", &self.consumer_concurrency)
            .field("use_persistent_stores", &self.use_persistent_stores)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("redis_url", &self.redis_url)
            .field("redis_consumer_name", &self.redis_consumer_name)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let jwt_secret = get("JWT_SECRET").unwrap_or_else(|| {
            tracing::warn!("JWT_SECRET not set; using insecure dev default");
            DEV_JWT_SECRET.to_string()
        });

        let config = Self {
            jwt_secret,
            bind_addr: parse(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            access_token_ttl_minutes: parse(&get, "ACCESS_TOKEN_TTL_MINUTES", DEFAULT_ACCESS_TTL_MINUTES)?,
            refresh_token_ttl_minutes: parse(&get, "REFRESH_TOKEN_TTL_MINUTES", DEFAULT_REFRESH_TTL_MINUTES)?,
            schedule_delay_minutes: parse(&get, "SCHEDULE_DELAY_MINUTES", 5)?,
            task_max_retries: parse(&get, "TASK_MAX_RETRIES", 3)?,
            consumer_concurrency: parse(&get, "CONSUMER_CONCURRENCY", 8)?,
            use_persistent_stores: parse_flag(&get, "USE_PERSISTENT_STORES")?,
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            redis_consumer_name: get("REDIS_CONSUMER_NAME")
                .or_else(|| get("HOSTNAME"))
                .unwrap_or_else(|| DEFAULT_CONSUMER_NAME.to_string()),
            password_params: PasswordParams::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// In-memory everything, fast password hashing.
    pub fn for_tests(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            access_token_ttl_minutes: DEFAULT_ACCESS_TTL_MINUTES,
            refresh_token_ttl_minutes: DEFAULT_REFRESH_TTL_MINUTES,
            schedule_delay_minutes: 5,
            task_max_retries: 3,
            consumer_concurrency: 8,
            use_persistent_stores: false,
            database_url: None,
            redis_url: None,
            redis_consumer_name: DEFAULT_CONSUMER_NAME.to_string(),
            password_params: PasswordParams::insecure_fast(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        within("ACCESS_TOKEN_TTL_MINUTES", self.access_token_ttl_minutes, 1, MAX_TTL_MINUTES)?;
        within("REFRESH_TOKEN_TTL_MINUTES", self.refresh_token_ttl_minutes, 1, MAX_TTL_MINUTES)?;
        within("SCHEDULE_DELAY_MINUTES", self.schedule_delay_minutes, 0, MAX_SCHEDULE_DELAY_MINUTES)?;
        if self.consumer_concurrency == 0 {
            return Err(invalid("CONSUMER_CONCURRENCY", 0, "must be at least 1"));
        }
        if self.use_persistent_stores && self.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL", "USE_PERSISTENT_STORES"));
        }
        Ok(())
    }

    pub fn credential_config(&self) -> CredentialConfig {
        CredentialConfig::new(self.jwt_secret.as_bytes())
            .with_ttls(self.access_token_ttl_minutes, self.refresh_token_ttl_minutes)
            .with_password_params(self.password_params)
    }

    pub fn schedule_delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.schedule_delay_minutes)
    }
}

fn invalid(key: &'static str, value: impl Display, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn within(key: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if !(min..=max).contains(&value) {
        return Err(invalid(key, value, format!("must be between {min} and {max}")));
    }
    Ok(())
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<bool, ConfigError> {
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, v, "expected a boolean")),
        },
    }
}
