//! Service configuration from environment variables

use crate::db::ExternalId;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is not a valid {expected}: {value}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub port: u16,
    /// Bootstrapped as super admin; receives registration requests
    pub admin_id: ExternalId,
    pub admin_name: String,
    /// Bot API base URL; messages are only logged when unset
    pub bot_api_url: Option<String>,
    pub store_timeout: Duration,
    pub delivery_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = var("TUTOR_DB_PATH").map_or_else(
            || {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".tutor-desk").join("tutor.db")
            },
            PathBuf::from,
        );

        let admin_id = var("ADMIN_ID").ok_or(ConfigError::Missing("ADMIN_ID"))?;
        let admin_id = parse("ADMIN_ID", "user id", &admin_id)?;

        Ok(Self {
            db_path,
            port: parse_or(&var, "TUTOR_PORT", "port", DEFAULT_PORT)?,
            admin_id,
            admin_name: var("ADMIN_NAME").unwrap_or_else(|| "Administrator".to_string()),
            bot_api_url: var("BOT_API_URL").filter(|url| !url.trim().is_empty()),
            store_timeout: Duration::from_millis(parse_or(
                &var,
                "STORE_TIMEOUT_MS",
                "millisecond count",
                DEFAULT_STORE_TIMEOUT_MS,
            )?),
            delivery_timeout: Duration::from_millis(parse_or(
                &var,
                "DELIVERY_TIMEOUT_MS",
                "millisecond count",
                DEFAULT_DELIVERY_TIMEOUT_MS,
            )?),
        })
    }
}

fn parse<T: std::str::FromStr>(
    name: &'static str,
    expected: &'static str,
    value: &str,
) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        expected,
        value: value.to_string(),
    })
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    var(name).map_or(Ok(default), |value| parse(name, expected, &value))
}
