use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Bounded-retry policy shared by the device and database calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub wait: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sync_interval: Duration,
    pub device_retry: RetryPolicy,
    pub device_timeout: Duration,
    pub database_retry: RetryPolicy,
}

impl SyncConfig {
    pub fn new() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let config = SyncConfig {
            database_url,
            sync_interval: Duration::from_secs(parse_var("SYNC_INTERVAL_SECS", 600)?),
            device_retry: RetryPolicy {
                max_attempts: parse_var("DEVICE_MAX_ATTEMPTS", 3)?,
                wait: Duration::from_secs(parse_var("DEVICE_RETRY_WAIT_SECS", 2)?),
            },
            device_timeout: Duration::from_secs(parse_var("DEVICE_TIMEOUT_SECS", 30)?),
            database_retry: RetryPolicy {
                max_attempts: parse_var("DB_MAX_RETRIES", 5)?,
                wait: Duration::from_secs(parse_var("DB_RETRY_WAIT_SECS", 5)?),
            },
        };

        if config.device_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "DEVICE_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }

        info!(
            "Sync every {}s, {} device attempts, {} database attempts",
            config.sync_interval.as_secs(),
            config.device_retry.max_attempts,
            config.database_retry.max_attempts
        );

        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    parse_value(name, env::var(name).ok(), default)
}

fn parse_value<T: FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_values_fall_back_to_default() {
        assert_eq!(parse_value::<u64>("X", None, 7).unwrap(), 7);
    }

    #[test]
    fn values_are_trimmed_and_parsed() {
        assert_eq!(parse_value::<u64>("X", Some(" 42 ".into()), 7).unwrap(), 42);
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = parse_value::<usize>("DEVICE_MAX_ATTEMPTS", Some("three".into()), 3)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "DEVICE_MAX_ATTEMPTS has an invalid value 'three'"
        );
    }
}
