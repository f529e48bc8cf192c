//! Configuration module for the controller client.
//!
//! Settings come from environment variables, with defaults for everything
//! except the device to watch. Parsing goes through a lookup function so
//! the same code serves the process environment and tests.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::loader::RetryPolicy;
use crate::record::RecordType;

/// Default controller base URL
const DEFAULT_CONTROLLER_URL: &str = "https://localhost:3333";

/// Default key-value store URL
const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default prefix for cached artefacts
const DEFAULT_CACHING_PREFIX: &str = "cache";

/// Default number of consecutive connection attempts
const DEFAULT_REPEAT_COUNT: u32 = 20;

/// Default delay between connection attempts in seconds
const DEFAULT_REPEAT_DELAY_SECS: u64 = 5;

/// Default timeout for one-shot requests in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Upper bound on the attempt budget
const MAX_REPEAT_COUNT: u32 = 1_000;

/// Bounds on the delay between attempts
const MIN_REPEAT_DELAY_SECS: u64 = 1;
const MAX_REPEAT_DELAY_SECS: u64 = 300;

/// Bounds on the one-shot request timeout
const MIN_REQUEST_TIMEOUT_SECS: u64 = 1;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 600;

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable holds a value of the wrong shape.
    #[error("Configuration error for {var}: '{value}' is not a valid {expected}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    /// A numeric variable is outside its allowed range.
    #[error("Configuration error for {var}: {message}")]
    OutOfRange { var: &'static str, message: String },

    /// A required variable is not set.
    #[error("Configuration error: {var} must be set")]
    Missing { var: &'static str },
}

/// Configuration for the controller client.
///
/// All settings can be configured via environment variables:
/// - `EDGE_CONTROLLER_URL`: controller base URL (default: https://localhost:3333)
/// - `EDGE_CONTROLLER_DIR`: local controller directory (default: .)
/// - `EDGE_CONTROLLER_CA`: PEM CA file; unset accepts self-signed certificates
/// - `EDGE_CONTROLLER_REMOTE`: read from the controller instead of files (default: true)
/// - `EDGE_CONTROLLER_REMOTE_REDIS`: read from key-value streams (default: false)
/// - `EDGE_CONTROLLER_REDIS_URL`: key-value store URL (default: redis://localhost:6379)
/// - `EDGE_CONTROLLER_CACHING`: cache every record (default: false)
/// - `EDGE_CONTROLLER_CACHING_REDIS`: cache into key-value streams (default: false)
/// - `EDGE_CONTROLLER_CACHING_PREFIX`: cache prefix (default: cache)
/// - `EDGE_CONTROLLER_REPEAT_COUNT`: consecutive attempts before failing (default: 20)
/// - `EDGE_CONTROLLER_REPEAT_DELAY_SECS`: delay between attempts (default: 5)
/// - `EDGE_CONTROLLER_REQUEST_TIMEOUT_SECS`: one-shot request timeout, 1-600 (default: 10)
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the controller's admin API
    pub controller_url: String,

    /// Directory of a locally running controller
    pub dir: PathBuf,

    /// CA certificate of the controller, if not self-signed
    pub server_ca: Option<PathBuf>,

    /// Read records from the controller rather than local files
    pub remote: bool,

    /// Read records from key-value streams rather than HTTP
    pub remote_redis: bool,

    /// Key-value store URL
    pub redis_url: String,

    /// Write every record through to a cache
    pub caching: bool,

    /// Cache into key-value streams rather than files
    pub caching_redis: bool,

    /// Prefix that keeps cached artefacts apart from live ones
    pub caching_prefix: String,

    /// Consecutive failed attempts tolerated per call
    pub max_attempts: u32,

    /// Delay between attempts
    pub retry_delay: Duration,

    /// Timeout for one-shot requests
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use edge_controller::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Controller: {}", config.controller_url);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let defaults = Self::default();

        let controller_url = vars
            .string("EDGE_CONTROLLER_URL")
            .unwrap_or(defaults.controller_url);

        let max_attempts = vars
            .number("EDGE_CONTROLLER_REPEAT_COUNT")?
            .map_or(Ok(DEFAULT_REPEAT_COUNT), Self::validate_repeat_count)?;

        let retry_delay_secs = vars
            .number("EDGE_CONTROLLER_REPEAT_DELAY_SECS")?
            .map_or(Ok(DEFAULT_REPEAT_DELAY_SECS), Self::validate_repeat_delay)?;

        let request_timeout_secs = vars
            .number("EDGE_CONTROLLER_REQUEST_TIMEOUT_SECS")?
            .map_or(Ok(DEFAULT_REQUEST_TIMEOUT_SECS), Self::validate_request_timeout)?;

        Ok(Self {
            controller_url,
            dir: vars
                .string("EDGE_CONTROLLER_DIR")
                .map_or(defaults.dir, PathBuf::from),
            server_ca: vars.string("EDGE_CONTROLLER_CA").map(PathBuf::from),
            remote: vars.flag("EDGE_CONTROLLER_REMOTE")?.unwrap_or(defaults.remote),
            remote_redis: vars
                .flag("EDGE_CONTROLLER_REMOTE_REDIS")?
                .unwrap_or(defaults.remote_redis),
            redis_url: vars
                .string("EDGE_CONTROLLER_REDIS_URL")
                .unwrap_or(defaults.redis_url),
            caching: vars.flag("EDGE_CONTROLLER_CACHING")?.unwrap_or(defaults.caching),
            caching_redis: vars
                .flag("EDGE_CONTROLLER_CACHING_REDIS")?
                .unwrap_or(defaults.caching_redis),
            caching_prefix: vars
                .string("EDGE_CONTROLLER_CACHING_PREFIX")
                .unwrap_or(defaults.caching_prefix),
            max_attempts,
            retry_delay: Duration::from_secs(retry_delay_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
        })
    }

    /// Retry policy for remote loaders built from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            request_timeout: self.request_timeout,
            ..RetryPolicy::new(self.max_attempts, self.retry_delay)
        }
    }

    fn validate_repeat_count(count: u32) -> Result<u32, ConfigError> {
        let var = "EDGE_CONTROLLER_REPEAT_COUNT";
        if count == 0 {
            return Err(ConfigError::OutOfRange {
                var,
                message: "attempt count must be greater than 0".to_string(),
            });
        }
        if count > MAX_REPEAT_COUNT {
            return Err(ConfigError::OutOfRange {
                var,
                message: format!("attempt count {count} exceeds maximum ({MAX_REPEAT_COUNT})"),
            });
        }
        Ok(count)
    }

    fn validate_repeat_delay(secs: u64) -> Result<u64, ConfigError> {
        let var = "EDGE_CONTROLLER_REPEAT_DELAY_SECS";
        if secs < MIN_REPEAT_DELAY_SECS {
            return Err(ConfigError::OutOfRange {
                var,
                message: format!("delay {secs} is below minimum ({MIN_REPEAT_DELAY_SECS}s)"),
            });
        }
        if secs > MAX_REPEAT_DELAY_SECS {
            return Err(ConfigError::OutOfRange {
                var,
                message: format!("delay {secs} exceeds maximum ({MAX_REPEAT_DELAY_SECS}s)"),
            });
        }
        Ok(secs)
    }

    fn validate_request_timeout(secs: u64) -> Result<u64, ConfigError> {
        let var = "EDGE_CONTROLLER_REQUEST_TIMEOUT_SECS";
        if secs < MIN_REQUEST_TIMEOUT_SECS {
            return Err(ConfigError::OutOfRange {
                var,
                message: format!("timeout {secs} is below minimum ({MIN_REQUEST_TIMEOUT_SECS}s)"),
            });
        }
        if secs > MAX_REQUEST_TIMEOUT_SECS {
            return Err(ConfigError::OutOfRange {
                var,
                message: format!("timeout {secs} exceeds maximum ({MAX_REQUEST_TIMEOUT_SECS}s)"),
            });
        }
        Ok(secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_url: DEFAULT_CONTROLLER_URL.to_string(),
            dir: PathBuf::from("."),
            server_ca: None,
            remote: true,
            remote_redis: false,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            caching: false,
            caching_redis: false,
            caching_prefix: DEFAULT_CACHING_PREFIX.to_string(),
            max_attempts: DEFAULT_REPEAT_COUNT,
            retry_delay: Duration::from_secs(DEFAULT_REPEAT_DELAY_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// What the binary should watch.
///
/// - `EDGE_CONTROLLER_DEVICE`: device UUID (required)
/// - `EDGE_CONTROLLER_RECORD_TYPE`: `logs` or `info` (default: logs)
/// - `EDGE_CONTROLLER_FOLLOW`: keep waiting for new records (default: false)
/// - `EDGE_CONTROLLER_WATCH_TIMEOUT_SECS`: stream timeout, 0 = none (default: 0)
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub device: Uuid,
    pub record_type: RecordType,
    pub follow: bool,
    pub timeout: Duration,
}

impl WatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let var = "EDGE_CONTROLLER_DEVICE";
        let raw = vars.string(var).ok_or(ConfigError::Missing { var })?;
        let device = Uuid::parse_str(&raw).map_err(|_| ConfigError::Invalid {
            var,
            value: raw.clone(),
            expected: "UUID",
        })?;

        let var = "EDGE_CONTROLLER_RECORD_TYPE";
        let record_type = match vars.string(var) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var,
                value: raw.clone(),
                expected: "record type (logs|info)",
            })?,
            None => RecordType::Logs,
        };

        Ok(Self {
            device,
            record_type,
            follow: vars.flag("EDGE_CONTROLLER_FOLLOW")?.unwrap_or(false),
            timeout: Duration::from_secs(
                vars.number("EDGE_CONTROLLER_WATCH_TIMEOUT_SECS")?.unwrap_or(0),
            ),
        })
    }
}

/// Typed access to a variable source. Empty values count as unset.
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number<T: std::str::FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        self.string(var)
            .map(|value| {
                value.parse().map_err(|_| ConfigError::Invalid {
                    var,
                    value: value.clone(),
                    expected: "number",
                })
            })
            .transpose()
    }

    fn flag(&self, var: &'static str) -> Result<Option<bool>, ConfigError> {
        self.string(var)
            .map(|value| match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    var,
                    value,
                    expected: "boolean",
                }),
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.controller_url, "https://localhost:3333");
        assert!(config.remote);
        assert!(!config.caching);
        assert_eq!(config.caching_prefix, "cache");
        assert_eq!(config.max_attempts, 20);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_config_from_empty_source_uses_defaults() {
        let config = Config::from_lookup(lookup(&[])).expect("Should load with defaults");
        assert_eq!(config.controller_url, "https://localhost:3333");
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.server_ca.is_none());
    }

    #[test]
    fn test_config_custom_values() {
        let config = Config::from_lookup(lookup(&[
            ("EDGE_CONTROLLER_URL", "https://10.1.0.2:3333"),
            ("EDGE_CONTROLLER_DIR", "/srv/controller"),
            ("EDGE_CONTROLLER_CA", "/srv/controller/root-certificate.pem"),
            ("EDGE_CONTROLLER_REMOTE_REDIS", "yes"),
            ("EDGE_CONTROLLER_CACHING", "1"),
            ("EDGE_CONTROLLER_CACHING_PREFIX", "run-7"),
            ("EDGE_CONTROLLER_REPEAT_COUNT", "4"),
            ("EDGE_CONTROLLER_REPEAT_DELAY_SECS", "2"),
        ]))
        .expect("Should load custom values");

        assert_eq!(config.controller_url, "https://10.1.0.2:3333");
        assert_eq!(config.dir, PathBuf::from("/srv/controller"));
        assert!(config.server_ca.is_some());
        assert!(config.remote_redis);
        assert!(config.caching);
        assert_eq!(config.caching_prefix, "run-7");

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert_eq!(policy.inactivity_reset(), Duration::from_secs(4));
    }

    #[test]
    fn test_invalid_flag() {
        let err = Config::from_lookup(lookup(&[("EDGE_CONTROLLER_CACHING", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("EDGE_CONTROLLER_CACHING"));
        assert!(err.to_string().contains("not a valid boolean"));
    }

    #[test]
    fn test_invalid_number() {
        let err =
            Config::from_lookup(lookup(&[("EDGE_CONTROLLER_REPEAT_COUNT", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { expected: "number", .. }));
    }

    #[test]
    fn test_zero_repeat_count() {
        let err = Config::from_lookup(lookup(&[("EDGE_CONTROLLER_REPEAT_COUNT", "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn test_repeat_delay_bounds() {
        let err =
            Config::from_lookup(lookup(&[("EDGE_CONTROLLER_REPEAT_DELAY_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("below minimum"));

        let err = Config::from_lookup(lookup(&[("EDGE_CONTROLLER_REPEAT_DELAY_SECS", "999")]))
            .unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_request_timeout_bounds() {
        let err = Config::from_lookup(lookup(&[("EDGE_CONTROLLER_REQUEST_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange { var: "EDGE_CONTROLLER_REQUEST_TIMEOUT_SECS", .. }
        ));
        assert!(err.to_string().contains("below minimum"));

        let config =
            Config::from_lookup(lookup(&[("EDGE_CONTROLLER_REQUEST_TIMEOUT_SECS", "3")])).unwrap();
        assert_eq!(config.retry_policy().request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_watch_config() {
        let device = Uuid::new_v4().to_string();
        let watch = WatchConfig::from_lookup(lookup(&[
            ("EDGE_CONTROLLER_DEVICE", device.as_str()),
            ("EDGE_CONTROLLER_RECORD_TYPE", "info"),
            ("EDGE_CONTROLLER_FOLLOW", "true"),
            ("EDGE_CONTROLLER_WATCH_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(watch.device.to_string(), device);
        assert_eq!(watch.record_type, RecordType::Info);
        assert!(watch.follow);
        assert_eq!(watch.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_watch_config_requires_device() {
        let err = WatchConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { var: "EDGE_CONTROLLER_DEVICE" }));

        let err =
            WatchConfig::from_lookup(lookup(&[("EDGE_CONTROLLER_DEVICE", "abc")])).unwrap_err();
        assert!(err.to_string().contains("not a valid UUID"));
    }
}
