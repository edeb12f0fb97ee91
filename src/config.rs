//! Configuration types.
//!
//! Every struct has a `Default` and a `from_env()` constructor. The env
//! readers go through a lookup function so tests can feed them a map.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::delivery::retry::RetryPolicy;
use crate::error::ConfigError;

/// Delivery engine configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Attempts before a job fails for good.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_backoff_base: Duration,
    /// Ceiling for the retry delay.
    pub max_backoff: Duration,
    /// Global send rate across all workers.
    pub rate_limit_per_minute: u32,
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Sleep after the first empty poll.
    pub idle_backoff_min: Duration,
    /// Longest sleep between empty polls.
    pub idle_backoff_max: Duration,
    /// Jobs held in `processing` longer than this are reclaimed. `None` disables.
    pub processing_lease: Option<Duration>,
    /// How often the lease reaper runs.
    pub reaper_interval: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_base: Duration::from_secs(5 * 60), // 5 minutes
            max_backoff: Duration::from_secs(4 * 60 * 60),   // 4 hours
            rate_limit_per_minute: 60,
            worker_count: 2,
            idle_backoff_min: Duration::from_millis(100),
            idle_backoff_max: Duration::from_secs(5),
            processing_lease: Some(Duration::from_secs(15 * 60)), // 15 minutes
            reaper_interval: Duration::from_secs(60),
        }
    }
}

impl DeliveryConfig {
    /// Build config from `MAIL_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let lease_secs: Option<u64> = parse_var(&lookup, "MAIL_PROCESSING_LEASE_SECS")?;
        let processing_lease = match lease_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.processing_lease,
        };

        Ok(Self {
            max_retries: parse_var(&lookup, "MAIL_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_backoff_base: parse_var(&lookup, "MAIL_RETRY_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_backoff_base),
            max_backoff: parse_var(&lookup, "MAIL_MAX_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_backoff),
            rate_limit_per_minute: parse_var(&lookup, "MAIL_RATE_LIMIT_PER_MINUTE")?
                .unwrap_or(defaults.rate_limit_per_minute),
            worker_count: parse_var(&lookup, "MAIL_WORKERS")?.unwrap_or(defaults.worker_count),
            processing_lease,
            ..defaults
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_backoff_base, self.max_backoff)
    }
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: SecretString,
    pub from_email: String,
    pub from_name: Option<String>,
}

impl SmtpConfig {
    /// Build config from `SMTP_*` environment variables.
    /// Returns `Ok(None)` if `SMTP_HOST` is not set (sending disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(host) = non_empty(&lookup, "SMTP_HOST") else {
            return Ok(None);
        };

        let username = non_empty(&lookup, "SMTP_USERNAME");
        let from_email = non_empty(&lookup, "SMTP_FROM_EMAIL")
            .or_else(|| username.clone())
            .ok_or_else(|| ConfigError::MissingEnvVar("SMTP_FROM_EMAIL".into()))?;

        Ok(Some(Self {
            host,
            port: parse_var(&lookup, "SMTP_PORT")?.unwrap_or(587),
            username,
            password: SecretString::from(lookup("SMTP_PASSWORD").unwrap_or_default()),
            from_email,
            from_name: non_empty(&lookup, "SMTP_FROM_NAME"),
        }))
    }
}

/// Storage locations.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_path: PathBuf,
    pub db_path: PathBuf,
    pub template_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::rooted_at(PathBuf::from("./.data"))
    }
}

impl StoreConfig {
    fn rooted_at(data_path: PathBuf) -> Self {
        Self {
            db_path: data_path.join("mail.db"),
            template_path: data_path.join("templates"),
            data_path,
        }
    }

    /// Build config from `DATA_PATH` and `MJML_TEMPLATE_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = non_empty(&lookup, "DATA_PATH")
            .map(|p| Self::rooted_at(PathBuf::from(p)))
            .unwrap_or_default();
        if let Some(templates) = non_empty(&lookup, "MJML_TEMPLATE_PATH") {
            config.template_path = PathBuf::from(templates);
        }
        config
    }
}

/// Metrics export.
#[derive(Debug, Clone, Default)]
pub struct MetricsConfig {
    /// OTLP/HTTP collector endpoint. Metrics are recorded but not exported when unset.
    pub endpoint: Option<String>,
}

impl MetricsConfig {
    /// Build config from `MAIL_METRICS_ENDPOINT`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            endpoint: non_empty(&lookup, "MAIL_METRICS_ENDPOINT"),
        }
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an optional variable; a present but malformed value is an error.
fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
