//! Configuration module for the HEC shipper.
//!
//! This module provides environment-based configuration: where the collector
//! lives, how to authenticate, how batches are sized and retried, and the
//! routing fields stamped on every event.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::client::COLLECTOR_PATH;
use crate::event::{Routing, DEFAULT_INDEX, DEFAULT_SOURCETYPE};
use crate::retry::RetryPolicy;

/// Default collector address
const DEFAULT_SERVER: &str = "localhost:8088";

/// Default protocol for reaching the collector
const DEFAULT_PROTOCOL: &str = "https";

/// Default target size of one batch body (256 KiB)
const DEFAULT_BATCH_SIZE_LIMIT: usize = 262_144;

/// Default request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default number of retries after the first attempt
const DEFAULT_POST_RETRY_MAX: u32 = 0;

/// Default delay between retries in seconds
const DEFAULT_POST_RETRY_INTERVAL_SECS: f64 = 1.0;

/// Default number of events handed to one dispatch call
const DEFAULT_CHUNK_EVENTS: usize = 1_000;

/// Default flush interval in seconds
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

/// Maximum events per dispatch call to bound memory use
const MAX_CHUNK_EVENTS: usize = 100_000;

/// Bounds shared by the timeout and flush interval, in seconds
const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 300;

/// Token used by [`Config::default`]
const DEFAULT_TOKEN: &str = "changeme";

/// Configuration for the HEC shipper.
///
/// All settings can be configured via environment variables:
/// - `HEC_SHIPPER_SERVER`: collector `host:port` (default: localhost:8088)
/// - `HEC_SHIPPER_PROTOCOL`: `https` or `http` (default: https)
/// - `HEC_SHIPPER_TOKEN`: collector token (required)
/// - `HEC_SHIPPER_VERIFY`: verify TLS certificates (default: true)
/// - `HEC_SHIPPER_REQUEST_TIMEOUT_SECS`: request timeout (default: 30)
/// - `HEC_SHIPPER_POST_RETRY_MAX`: retries after the first attempt, or `unlimited` (default: 0)
/// - `HEC_SHIPPER_POST_RETRY_INTERVAL`: seconds between retries (default: 1)
/// - `HEC_SHIPPER_BATCH_SIZE_LIMIT`: target batch bytes, 0 disables splitting (default: 262144)
/// - `HEC_SHIPPER_ALL_ITEMS`: send whole records instead of `message` (default: false)
/// - `HEC_SHIPPER_SOURCE`, `_SOURCETYPE`, `_INDEX`, `_HOST`: routing fields
/// - `HEC_SHIPPER_CHUNK_EVENTS`: events per dispatch call (default: 1000)
/// - `HEC_SHIPPER_FLUSH_INTERVAL_SECS`: seconds between intake flushes (default: 5)
#[derive(Clone)]
pub struct Config {
    /// Collector address as `host:port`
    pub server: String,

    /// `http` or `https`
    pub protocol: String,

    /// Collector token sent as `Authorization: Splunk <token>`
    pub token: String,

    /// Whether TLS certificates are verified
    pub verify: bool,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Retries allowed after the first attempt; `None` is unlimited
    pub post_retry_max: Option<u32>,

    /// Fixed delay between attempts
    pub post_retry_interval: Duration,

    /// Target maximum batch body size in bytes; 0 disables splitting
    pub batch_size_limit: usize,

    /// Send the whole record as the event instead of its `message`
    pub all_items: bool,

    /// Routing fields applied to every event
    pub routing: Routing,

    /// Number of events to accumulate before dispatching
    pub chunk_events: usize,

    /// Duration to wait before dispatching, even if the chunk is not full
    pub flush_interval: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server", &self.server)
            .field("protocol", &self.protocol)
            .field("token", &"<redacted>")
            .field("verify", &self.verify)
            .field("request_timeout", &self.request_timeout)
            .field("post_retry_max", &self.post_retry_max)
            .field("post_retry_interval", &self.post_retry_interval)
            .field("batch_size_limit", &self.batch_size_limit)
            .field("all_items", &self.all_items)
            .field("routing", &self.routing)
            .field("chunk_events", &self.chunk_events)
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn new(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - `HEC_SHIPPER_TOKEN` is missing or empty
    /// - `HEC_SHIPPER_PROTOCOL` is neither `http` nor `https`
    /// - a numeric or boolean variable does not parse or is out of range
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use hec_shipper::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Endpoint: {}", config.endpoint_url());
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = env::var("HEC_SHIPPER_SERVER")
            .unwrap_or_else(|_| DEFAULT_SERVER.to_string())
            .trim_end_matches('/')
            .to_string();

        let protocol = Self::parse_protocol()?;
        let token = Self::parse_token()?;
        let verify = parse_bool("HEC_SHIPPER_VERIFY", true)?;

        let request_timeout_secs = parse_var(
            "HEC_SHIPPER_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        check_range(
            "HEC_SHIPPER_REQUEST_TIMEOUT_SECS",
            request_timeout_secs,
            MIN_INTERVAL_SECS,
            MAX_INTERVAL_SECS,
        )?;

        let post_retry_max = Self::parse_post_retry_max()?;
        let post_retry_interval = Self::parse_post_retry_interval()?;

        let batch_size_limit = parse_var("HEC_SHIPPER_BATCH_SIZE_LIMIT", DEFAULT_BATCH_SIZE_LIMIT)?;
        let all_items = parse_bool("HEC_SHIPPER_ALL_ITEMS", false)?;

        let routing = Routing {
            source: env::var("HEC_SHIPPER_SOURCE").ok().filter(|s| !s.is_empty()),
            sourcetype: env::var("HEC_SHIPPER_SOURCETYPE")
                .unwrap_or_else(|_| DEFAULT_SOURCETYPE.to_string()),
            index: env::var("HEC_SHIPPER_INDEX").unwrap_or_else(|_| DEFAULT_INDEX.to_string()),
            host: env::var("HEC_SHIPPER_HOST").unwrap_or_default(),
        };

        let chunk_events = parse_var("HEC_SHIPPER_CHUNK_EVENTS", DEFAULT_CHUNK_EVENTS)?;
        check_range("HEC_SHIPPER_CHUNK_EVENTS", chunk_events, 1, MAX_CHUNK_EVENTS)?;

        let flush_interval_secs =
            parse_var("HEC_SHIPPER_FLUSH_INTERVAL_SECS", DEFAULT_FLUSH_INTERVAL_SECS)?;
        check_range(
            "HEC_SHIPPER_FLUSH_INTERVAL_SECS",
            flush_interval_secs,
            MIN_INTERVAL_SECS,
            MAX_INTERVAL_SECS,
        )?;

        Ok(Self {
            server,
            protocol,
            token,
            verify,
            request_timeout: Duration::from_secs(request_timeout_secs),
            post_retry_max,
            post_retry_interval,
            batch_size_limit,
            all_items,
            routing,
            chunk_events,
            flush_interval: Duration::from_secs(flush_interval_secs),
        })
    }

    /// Full URL of the collector event endpoint.
    pub fn endpoint_url(&self) -> String {
        format!("{}://{}{}", self.protocol, self.server, COLLECTOR_PATH)
    }

    /// Retry policy derived from `post_retry_max` and `post_retry_interval`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.post_retry_max, self.post_retry_interval)
    }

    fn parse_protocol() -> Result<String, ConfigError> {
        let env_var = "HEC_SHIPPER_PROTOCOL";
        let protocol = env::var(env_var)
            .unwrap_or_else(|_| DEFAULT_PROTOCOL.to_string())
            .to_ascii_lowercase();

        match protocol.as_str() {
            "http" | "https" => Ok(protocol),
            other => Err(ConfigError::new(
                env_var,
                format!("'{}' is not a supported protocol (expected http or https)", other),
            )),
        }
    }

    fn parse_token() -> Result<String, ConfigError> {
        let env_var = "HEC_SHIPPER_TOKEN";
        match env::var(env_var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(ConfigError::new(env_var, "token is required")),
        }
    }

    /// Parse the retry count; `unlimited` removes the bound.
    fn parse_post_retry_max() -> Result<Option<u32>, ConfigError> {
        let env_var = "HEC_SHIPPER_POST_RETRY_MAX";
        match env::var(env_var).map(|value| value.trim().to_string()) {
            Ok(value) if value.eq_ignore_ascii_case("unlimited") => Ok(None),
            Ok(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::new(env_var, format!("'{}' is not a valid number", value))),
            Err(_) => Ok(Some(DEFAULT_POST_RETRY_MAX)),
        }
    }

    /// Parse the retry interval in (possibly fractional) seconds.
    fn parse_post_retry_interval() -> Result<Duration, ConfigError> {
        let env_var = "HEC_SHIPPER_POST_RETRY_INTERVAL";
        let secs: f64 = parse_var(env_var, DEFAULT_POST_RETRY_INTERVAL_SECS)?;

        Duration::try_from_secs_f64(secs).map_err(|_| {
            ConfigError::new(
                env_var,
                format!("interval {} must be a non-negative number of seconds", secs),
            )
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(env_var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(env_var) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::new(env_var, format!("'{}' is not a valid number", value))),
        Err(_) => Ok(default),
    }
}

fn parse_bool(env_var: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(env_var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::new(
                env_var,
                format!("'{}' is not a valid boolean", value),
            )),
        },
        Err(_) => Ok(default),
    }
}

fn check_range<T>(env_var: &str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + fmt::Display,
{
    if value < min {
        return Err(ConfigError::new(
            env_var,
            format!("{} is below minimum ({})", value, min),
        ));
    }
    if value > max {
        return Err(ConfigError::new(
            env_var,
            format!("{} exceeds maximum ({})", value, max),
        ));
    }
    Ok(())
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            token: DEFAULT_TOKEN.to_string(),
            verify: true,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            post_retry_max: Some(DEFAULT_POST_RETRY_MAX),
            post_retry_interval: Duration::from_secs_f64(DEFAULT_POST_RETRY_INTERVAL_SECS),
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            all_items: false,
            routing: Routing::default(),
            chunk_events: DEFAULT_CHUNK_EVENTS,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
        }
    }
}
