//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `SecretString` so it never
//! lands in logs.

pub mod secrets;

use std::time::Duration;

use crate::error::{Error, Result};
use crate::scheduler::{DEFAULT_HEARTBEAT_EXPIRATION, SchedulerConfig};
use secrecy::SecretString;

/// Collection used when `OKRA_COLLECTION` is unset.
pub const DEFAULT_COLLECTION: &str = "okra";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub collection: String,
    pub heartbeat_expiration: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let heartbeat_expiration = match std::env::var("OKRA_HEARTBEAT_EXPIRATION_SECS") {
            Ok(raw) => parse_secs("OKRA_HEARTBEAT_EXPIRATION_SECS", &raw)?,
            Err(_) => DEFAULT_HEARTBEAT_EXPIRATION,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            collection: std::env::var("OKRA_COLLECTION")
                .unwrap_or_else(|_| DEFAULT_COLLECTION.to_string()),
            heartbeat_expiration,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// The scheduler settings this configuration describes.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::new(self.collection.clone())
            .heartbeat_expiration(self.heartbeat_expiration)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(Error::Config(format!(
            "{name} must be a positive number of seconds, got {raw:?}"
        ))),
        Ok(secs) => Ok(Duration::from_secs(secs)),
    }
}
