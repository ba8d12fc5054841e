//! Client configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Log levels accepted in [`Config::log_level`]
pub const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

/// Configuration errors
///
/// Validation stops at the first violation; the variant names the field.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("token is required")]
    MissingToken,

    #[error("region is required")]
    MissingRegion,

    #[error("timeout must be positive")]
    InvalidTimeout,

    #[error("max_retries cannot be negative (got {0})")]
    NegativeMaxRetries(i32),

    #[error("initial_delay must be positive")]
    InvalidInitialDelay,

    #[error("max_delay must be positive")]
    InvalidMaxDelay,

    #[error("backoff multiplier must be positive (got {0})")]
    InvalidMultiplier(f64),

    #[error("at least one protocol must be specified")]
    NoProtocols,

    #[error("invalid log level '{0}', expected one of debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("{field} is required")]
    Missing { field: &'static str },

    #[error("{field} must be between 1 and 65535 (got {value})")]
    InvalidPort { field: &'static str, value: i32 },

    #[error("unsupported protocol '{0}'")]
    UnsupportedProtocol(String),
}

/// Transport protocols in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Quic,
    Grpc,
    #[serde(rename = "websocket")]
    WebSocket,
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Quic => "quic",
            Protocol::Grpc => "grpc",
            Protocol::WebSocket => "websocket",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quic" => Ok(Protocol::Quic),
            "grpc" => Ok(Protocol::Grpc),
            "websocket" | "ws" => Ok(Protocol::WebSocket),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(ConfigError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Exponential backoff parameters for reconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once)
    pub max_retries: i32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries < 0 {
            return Err(ConfigError::NegativeMaxRetries(self.max_retries));
        }
        if self.initial_delay.is_zero() {
            return Err(ConfigError::InvalidInitialDelay);
        }
        if self.max_delay.is_zero() {
            return Err(ConfigError::InvalidMaxDelay);
        }
        if !(self.multiplier > 0.0 && self.multiplier.is_finite()) {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }
        Ok(())
    }
}

/// Client configuration
///
/// Built once, validated as a unit and never mutated afterwards. Reading the
/// environment is left to the caller (the CLI maps `CLOUDBRIDGE_*` variables
/// onto the builder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub token: String,
    pub region: String,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub log_level: String,
    pub retry_policy: RetryPolicy,
    pub protocols: Vec<Protocol>,
    pub insecure_skip_verify: bool,
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            region: "eu-central".to_string(),
            timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            retry_policy: RetryPolicy::default(),
            protocols: vec![Protocol::Quic, Protocol::Grpc, Protocol::WebSocket],
            insecure_skip_verify: false,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check every field, failing on the first violation
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.region.is_empty() {
            return Err(ConfigError::MissingRegion);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        self.retry_policy.validate()?;
        if self.protocols.is_empty() {
            return Err(ConfigError::NoProtocols);
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = region.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Replace the protocol preference list
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.config.protocols = protocols;
        self
    }

    pub fn insecure_skip_verify(mut self, skip: bool) -> Self {
        self.config.insecure_skip_verify = skip;
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Validate a port carried as a signed integer
pub(crate) fn validate_port(field: &'static str, value: i32) -> Result<u16, ConfigError> {
    if (1..=65535).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ConfigError::InvalidPort { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            token: "token".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.region, "eu-central");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.retry_policy.max_retries, 3);
        assert_eq!(config.retry_policy.max_delay, Duration::from_secs(60));
        assert_eq!(
            config.protocols,
            vec![Protocol::Quic, Protocol::Grpc, Protocol::WebSocket]
        );
        assert!(!config.insecure_skip_verify);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .token("test-token")
            .region("us-east")
            .timeout(Duration::from_secs(5))
            .log_level("debug")
            .protocols(vec![Protocol::Tcp])
            .insecure_skip_verify(true)
            .build()
            .unwrap();

        assert_eq!(config.token, "test-token");
        assert_eq!(config.region, "us-east");
        assert_eq!(config.protocols, vec![Protocol::Tcp]);
        assert!(config.insecure_skip_verify);
    }

    #[test]
    fn test_config_builder_missing_token() {
        assert_eq!(Config::builder().build(), Err(ConfigError::MissingToken));
    }

    #[test]
    fn test_each_invalid_field_is_rejected() {
        let cases: Vec<(Config, ConfigError)> = vec![
            (
                Config {
                    region: String::new(),
                    ..valid()
                },
                ConfigError::MissingRegion,
            ),
            (
                Config {
                    timeout: Duration::ZERO,
                    ..valid()
                },
                ConfigError::InvalidTimeout,
            ),
            (
                Config {
                    retry_policy: RetryPolicy {
                        max_retries: -1,
                        ..Default::default()
                    },
                    ..valid()
                },
                ConfigError::NegativeMaxRetries(-1),
            ),
            (
                Config {
                    retry_policy: RetryPolicy {
                        initial_delay: Duration::ZERO,
                        ..Default::default()
                    },
                    ..valid()
                },
                ConfigError::InvalidInitialDelay,
            ),
            (
                Config {
                    retry_policy: RetryPolicy {
                        max_delay: Duration::ZERO,
                        ..Default::default()
                    },
                    ..valid()
                },
                ConfigError::InvalidMaxDelay,
            ),
            (
                Config {
                    retry_policy: RetryPolicy {
                        multiplier: 0.0,
                        ..Default::default()
                    },
                    ..valid()
                },
                ConfigError::InvalidMultiplier(0.0),
            ),
            (
                Config {
                    protocols: Vec::new(),
                    ..valid()
                },
                ConfigError::NoProtocols,
            ),
            (
                Config {
                    log_level: "verbose".to_string(),
                    ..valid()
                },
                ConfigError::InvalidLogLevel("verbose".to_string()),
            ),
        ];

        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
    }

    #[test]
    fn test_first_violation_wins() {
        let config = Config {
            token: String::new(),
            protocols: Vec::new(),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MissingToken));
    }

    #[test]
    fn test_zero_retries_is_valid() {
        let config = Config {
            retry_policy: RetryPolicy {
                max_retries: 0,
                ..Default::default()
            },
            ..valid()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let json = serde_json::to_value(valid()).unwrap();
        assert_eq!(json["timeout"], 30_000);
        assert_eq!(json["retry_policy"]["initial_delay"], 1_000);
        assert_eq!(json["protocols"][2], "websocket");

        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back, valid());
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("QUIC".parse::<Protocol>().unwrap(), Protocol::Quic);
        assert_eq!("ws".parse::<Protocol>().unwrap(), Protocol::WebSocket);
        assert!("carrier-pigeon".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_validate_port() {
        assert_eq!(validate_port("port", 1), Ok(1));
        assert_eq!(validate_port("port", 65535), Ok(65535));
        for bad in [0, -1, 65536] {
            assert_eq!(
                validate_port("port", bad),
                Err(ConfigError::InvalidPort {
                    field: "port",
                    value: bad
                })
            );
        }
    }
}
