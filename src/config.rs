//! Runtime configuration for the grid runner.
//!
//! Covers the image service credentials and polling cadence, the two pool
//! autoscaling envelopes, the notification webhook, and task retention.
//! Values come from the environment with sensible defaults; everything is
//! overridable through builder methods for tests and embedding.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Polling cadence for one image-service queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSettings {
    /// Maximum status polls before the attempt counts as timed out.
    pub max_attempts: u32,
    /// Sleep between consecutive status polls.
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

/// Autoscaling envelope for one worker pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolEnvelope {
    /// Lower bound for the concurrency limit.
    pub min: usize,
    /// Upper bound for the concurrency limit.
    pub max: usize,
    /// Limit delta applied per scaling action.
    pub step: usize,
    /// Minimum spacing between consecutive scale-ups.
    pub scale_up_interval: Duration,
    /// Minimum spacing between consecutive scale-downs.
    pub scale_down_interval: Duration,
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token for the image service. Required for live runs.
    pub api_token: String,
    /// Hard timeout for a single submit request.
    pub submit_timeout: Duration,
    /// Polling cadence for subtasks on the default pool.
    pub poll: PollSettings,
    /// Polling cadence for subtasks on the Lumina pool.
    pub lumina_poll: PollSettings,
    /// Autoscaling envelope for the default pool.
    pub default_pool: PoolEnvelope,
    /// Autoscaling envelope for the Lumina pool.
    pub lumina_pool: PoolEnvelope,
    /// Outbound webhook for task lifecycle notifications, if any.
    pub notify_webhook_url: Option<String>,
    /// Days a finished task is retained before the sweep removes it.
    pub retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            submit_timeout: Duration::from_secs(300),
            poll: PollSettings::new(30, Duration::from_secs_f64(2.0)),
            lumina_poll: PollSettings::new(60, Duration::from_secs_f64(5.0)),
            default_pool: PoolEnvelope {
                min: 10,
                max: 50,
                step: 5,
                scale_up_interval: Duration::from_secs(60),
                scale_down_interval: Duration::from_secs(180),
            },
            lumina_pool: PoolEnvelope {
                min: 20,
                max: 20,
                step: 2,
                scale_up_interval: Duration::from_secs(60),
                scale_down_interval: Duration::from_secs(180),
            },
            notify_webhook_url: None,
            retention_days: 30,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MAKE_API_TOKEN`: image service bearer token (required)
    /// - `IMAGE_MAX_POLLING_ATTEMPTS`: default-queue poll attempts (30)
    /// - `IMAGE_POLLING_INTERVAL_SECS`: default-queue poll interval (2.0)
    /// - `LUMINA_MAX_POLLING_ATTEMPTS`: Lumina poll attempts (60)
    /// - `LUMINA_POLLING_INTERVAL_SECS`: Lumina poll interval (5.0)
    /// - `POOL_MIN` / `POOL_MAX` / `POOL_STEP`: default pool envelope (10/50/5)
    /// - `POOL_SCALE_UP_SECS` / `POOL_SCALE_DOWN_SECS`: default pool spacing (60/180)
    /// - `LUMINA_POOL_MIN` / `LUMINA_POOL_MAX` / `LUMINA_POOL_STEP`: Lumina envelope (20/20/2)
    /// - `LUMINA_POOL_SCALE_UP_SECS` / `LUMINA_POOL_SCALE_DOWN_SECS`: Lumina spacing (60/180)
    /// - `NOTIFY_WEBHOOK_URL`: notification sink (optional)
    /// - `TASK_RETENTION_DAYS`: retention window for the sweep (30)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `MAKE_API_TOKEN` is unset or a variable has
    /// an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.api_token = std::env::var("MAKE_API_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("MAKE_API_TOKEN".to_string()))?;

        if let Ok(val) = std::env::var("IMAGE_MAX_POLLING_ATTEMPTS") {
            config.poll.max_attempts = parse_env_value(&val, "IMAGE_MAX_POLLING_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("IMAGE_POLLING_INTERVAL_SECS") {
            let secs: f64 = parse_env_value(&val, "IMAGE_POLLING_INTERVAL_SECS")?;
            config.poll.interval = Duration::from_secs_f64(secs);
        }
        if let Ok(val) = std::env::var("LUMINA_MAX_POLLING_ATTEMPTS") {
            config.lumina_poll.max_attempts = parse_env_value(&val, "LUMINA_MAX_POLLING_ATTEMPTS")?;
        }
        if let Ok(val) = std::env::var("LUMINA_POLLING_INTERVAL_SECS") {
            let secs: f64 = parse_env_value(&val, "LUMINA_POLLING_INTERVAL_SECS")?;
            config.lumina_poll.interval = Duration::from_secs_f64(secs);
        }

        read_envelope_env(&mut config.default_pool, "POOL")?;
        read_envelope_env(&mut config.lumina_pool, "LUMINA_POOL")?;

        if let Ok(val) = std::env::var("NOTIFY_WEBHOOK_URL") {
            if !val.is_empty() {
                config.notify_webhook_url = Some(val);
            }
        }

        if let Ok(val) = std::env::var("TASK_RETENTION_DAYS") {
            config.retention_days = parse_env_value(&val, "TASK_RETENTION_DAYS")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.max_attempts == 0 || self.lumina_poll.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "polling attempts must be greater than 0".to_string(),
            ));
        }

        for (name, envelope) in [
            ("default pool", &self.default_pool),
            ("lumina pool", &self.lumina_pool),
        ] {
            if envelope.min == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} min must be greater than 0",
                    name
                )));
            }
            if envelope.min > envelope.max {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} min ({}) exceeds max ({})",
                    name, envelope.min, envelope.max
                )));
            }
            if envelope.step == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} step must be greater than 0",
                    name
                )));
            }
        }

        if self.retention_days <= 0 {
            return Err(ConfigError::ValidationFailed(
                "retention_days must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the API token.
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = token.into();
        self
    }

    /// Builder method to set the default-queue polling cadence.
    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Builder method to set the Lumina polling cadence.
    pub fn with_lumina_poll(mut self, poll: PollSettings) -> Self {
        self.lumina_poll = poll;
        self
    }

    /// Builder method to set the default pool envelope.
    pub fn with_default_pool(mut self, envelope: PoolEnvelope) -> Self {
        self.default_pool = envelope;
        self
    }

    /// Builder method to set the Lumina pool envelope.
    pub fn with_lumina_pool(mut self, envelope: PoolEnvelope) -> Self {
        self.lumina_pool = envelope;
        self
    }

    /// Builder method to set the notification webhook.
    pub fn with_notify_webhook_url(mut self, url: impl Into<String>) -> Self {
        self.notify_webhook_url = Some(url.into());
        self
    }

    /// Builder method to set the retention window.
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }
}

/// Reads one pool envelope from `{prefix}_MIN`-style variables.
fn read_envelope_env(envelope: &mut PoolEnvelope, prefix: &str) -> Result<(), ConfigError> {
    let key = format!("{}_MIN", prefix);
    if let Ok(val) = std::env::var(&key) {
        envelope.min = parse_env_value(&val, &key)?;
    }
    let key = format!("{}_MAX", prefix);
    if let Ok(val) = std::env::var(&key) {
        envelope.max = parse_env_value(&val, &key)?;
    }
    let key = format!("{}_STEP", prefix);
    if let Ok(val) = std::env::var(&key) {
        envelope.step = parse_env_value(&val, &key)?;
    }
    let key = format!("{}_SCALE_UP_SECS", prefix);
    if let Ok(val) = std::env::var(&key) {
        let secs: u64 = parse_env_value(&val, &key)?;
        envelope.scale_up_interval = Duration::from_secs(secs);
    }
    let key = format!("{}_SCALE_DOWN_SECS", prefix);
    if let Ok(val) = std::env::var(&key) {
        let secs: u64 = parse_env_value(&val, &key)?;
        envelope.scale_down_interval = Duration::from_secs(secs);
    }
    Ok(())
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll.max_attempts, 30);
        assert_eq!(config.poll.interval, Duration::from_secs(2));
        assert_eq!(config.lumina_poll.max_attempts, 60);
        assert_eq!(config.lumina_poll.interval, Duration::from_secs(5));
        assert_eq!(config.default_pool.min, 10);
        assert_eq!(config.default_pool.max, 50);
        assert_eq!(config.default_pool.step, 5);
        assert_eq!(config.lumina_pool.min, 20);
        assert_eq!(config.lumina_pool.max, 20);
        assert_eq!(config.retention_days, 30);
        assert!(config.notify_webhook_url.is_none());
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = Config::new()
            .with_api_token("token-1")
            .with_poll(PollSettings::new(5, Duration::from_millis(100)))
            .with_notify_webhook_url("https://hooks.example.com/x")
            .with_retention_days(7);

        assert_eq!(config.api_token, "token-1");
        assert_eq!(config.poll.max_attempts, 5);
        assert_eq!(
            config.notify_webhook_url.as_deref(),
            Some("https://hooks.example.com/x")
        );
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let config = Config::default().with_poll(PollSettings::new(0, Duration::from_secs(1)));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_envelope() {
        let config = Config::default().with_default_pool(PoolEnvelope {
            min: 20,
            max: 10,
            step: 5,
            scale_up_interval: Duration::from_secs(60),
            scale_down_interval: Duration::from_secs(180),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds max"));
    }

    #[test]
    fn test_validation_rejects_zero_step() {
        let config = Config::default().with_lumina_pool(PoolEnvelope {
            min: 1,
            max: 2,
            step: 0,
            scale_up_interval: Duration::from_secs(60),
            scale_down_interval: Duration::from_secs(180),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_nonpositive_retention() {
        let config = Config::default().with_retention_days(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env_value::<u32>("42", "KEY").expect("parses"), 42);
        assert!(parse_env_value::<u32>("forty-two", "KEY").is_err());
    }
}
