//! Configuration types for the Kafka writer.
//!
//! Configuration is loaded from YAML files or built in code, and validated
//! before a writer is created.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::balancer::{Balancer, BalancerKind};
use crate::broker::{Dialer, KafkaDialer};
use crate::error::{ConfigError, ConfigResult};

/// Writer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriterConfig {
    /// Broker addresses, tried in order.
    ///
    /// Supports environment variable expansion: "${KAFKA_BROKER}"
    pub brokers: Vec<String>,

    /// Topic every message is written to.
    pub topic: String,

    /// Built-in balancer used when `balancer` is not set.
    #[serde(default)]
    pub balancer_kind: BalancerKind,

    /// Custom balancer; takes precedence over `balancer_kind`.
    #[serde(skip)]
    pub balancer: Option<Arc<dyn Balancer>>,

    /// Maximum number of messages per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum size of a batch in bytes, per-message overhead included.
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes: u64,

    /// Time after the first buffered message at which an incomplete batch
    /// is flushed.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Dial attempts per connection establishment.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retries of a failed flush before its messages fail. 0 disables retries.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Initial delay between retries in milliseconds; doubled on each retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound of the retry delay in milliseconds.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Whether a retry reuses the partition's connection.
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Interval between partition discoveries in milliseconds. 0 disables them.
    #[serde(default = "default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,

    /// Timeout of a single produce write in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Depth of each partition's intake queue. Defaults to `batch_size`.
    #[serde(default)]
    pub queue_capacity: Option<usize>,

    /// Acknowledgements the broker must collect: 1 (leader) or -1 (all replicas).
    #[serde(default = "default_required_acks")]
    pub required_acks: i16,

    /// Client ID sent with every request.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Custom connection dialer. Defaults to [`KafkaDialer`].
    #[serde(skip)]
    pub dialer: Option<Arc<dyn Dialer>>,
}

/// Connection handling between retries of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Keep the connection unless the failure was connection-level.
    #[default]
    Reuse,
    /// Drop the connection after every failure.
    Redial,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Root configuration of the command-line producer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub writer: WriterConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Default value functions

fn default_batch_size() -> usize {
    100
}

fn default_batch_bytes() -> u64 {
    1_048_576
}

fn default_batch_timeout_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_retry_backoff_max_ms() -> u64 {
    1_000
}

fn default_rebalance_interval_ms() -> u64 {
    15_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_required_acks() -> i16 {
    1
}

fn default_client_id() -> String {
    "kafka-writer".to_string()
}

fn default_metrics_enabled() -> bool {
    false
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Construction, loading and validation

impl WriterConfig {
    /// Create a configuration with every optional field at its default.
    pub fn new(brokers: Vec<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers,
            topic: topic.into(),
            balancer_kind: BalancerKind::default(),
            balancer: None,
            batch_size: default_batch_size(),
            batch_bytes: default_batch_bytes(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_attempts: default_max_attempts(),
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            retry_policy: RetryPolicy::default(),
            rebalance_interval_ms: default_rebalance_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            queue_capacity: None,
            required_acks: default_required_acks(),
            client_id: default_client_id(),
            dialer: None,
        }
    }

    /// Use a custom balancer.
    #[must_use]
    pub fn with_balancer(mut self, balancer: Arc<dyn Balancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    /// Use a custom dialer.
    #[must_use]
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = read_file(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `brokers` is empty or an address is not `host:port`
    /// - `topic` is empty
    /// - `batch_size`, `batch_bytes`, `max_attempts` or `write_timeout_ms` is zero
    /// - `required_acks` is neither 1 nor -1
    pub fn validate(&self) -> ConfigResult<()> {
        if self.brokers.is_empty() {
            return Err(ConfigError::NoBrokers);
        }
        for broker in self.broker_addresses() {
            parse_address(&broker)?;
        }

        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }

        let limits = [
            ("batch_size", self.batch_size as u64),
            ("batch_bytes", self.batch_bytes),
            ("max_attempts", u64::from(self.max_attempts)),
            ("write_timeout_ms", self.write_timeout_ms),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { field, value });
            }
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::ZeroLimit {
                field: "queue_capacity",
                value: 0,
            });
        }

        if !matches!(self.required_acks, 1 | -1) {
            return Err(ConfigError::InvalidRequiredAcks(self.required_acks));
        }

        Ok(())
    }

    /// Broker addresses with environment variables expanded.
    #[must_use]
    pub fn broker_addresses(&self) -> Vec<String> {
        self.brokers.iter().map(|b| expand_env_vars(b)).collect()
    }

    /// The configured balancer, or a fresh instance of `balancer_kind`.
    #[must_use]
    pub fn resolve_balancer(&self) -> Arc<dyn Balancer> {
        self.balancer
            .clone()
            .unwrap_or_else(|| self.balancer_kind.build())
    }

    /// The configured dialer, or a [`KafkaDialer`] built from this configuration.
    #[must_use]
    pub fn resolve_dialer(&self) -> Arc<dyn Dialer> {
        self.dialer
            .clone()
            .unwrap_or_else(|| Arc::new(KafkaDialer::from_config(self)))
    }

    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    /// Intake queue depth of each partition writer.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity.unwrap_or(self.batch_size).max(1)
    }

    /// Delay before retry number `retry` (1-based): exponential, capped, without jitter.
    #[must_use]
    pub fn retry_backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(20);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.retry_backoff_max_ms.max(self.retry_backoff_ms));
        Duration::from_millis(ms)
    }
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = read_file(path.as_ref())?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.writer.validate()?;
        if config.metrics.enabled {
            parse_address(&config.metrics.address)?;
        }
        Ok(config)
    }
}

fn read_file(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.display().to_string(),
        source: e,
    })
}

/// Split an address into host and port.
///
/// # Errors
///
/// Returns an error if the address cannot be parsed.
pub fn parse_address(addr: &str) -> ConfigResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::io::Write;

    fn valid_config() -> WriterConfig {
        WriterConfig::new(vec!["localhost:9092".to_string()], "events")
    }

    #[test]
    fn test_valid_config_passes_validation() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = valid_config();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.batch_bytes, 1_048_576);
        assert_eq!(config.batch_timeout(), Duration::from_secs(1));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retries, 3);
        assert_eq!(config.rebalance_interval(), Duration::from_secs(15));
        assert_eq!(config.write_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry_policy, RetryPolicy::Reuse);
        assert_eq!(config.queue_capacity(), 100);
    }

    #[test]
    fn test_no_brokers() {
        let mut config = valid_config();
        config.brokers.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoBrokers)));
    }

    #[test]
    fn test_empty_topic() {
        let mut config = valid_config();
        config.topic = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyTopic)));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = valid_config();
        config.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroLimit {
                field: "batch_size",
                ..
            })
        ));

        let mut config = valid_config();
        config.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroLimit {
                field: "max_attempts",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_retries_allowed() {
        let mut config = valid_config();
        config.retries = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_broker_address() {
        let mut config = valid_config();
        config.brokers = vec!["localhost".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_required_acks_zero_rejected() {
        let mut config = valid_config();
        config.required_acks = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRequiredAcks(0))
        ));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let mut config = valid_config();
        config.retry_backoff_ms = 100;
        config.retry_backoff_max_ms = 1_000;
        assert_eq!(config.retry_backoff(1), Duration::from_millis(100));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(200));
        assert_eq!(config.retry_backoff(4), Duration::from_millis(800));
        assert_eq!(config.retry_backoff(5), Duration::from_millis(1_000));
        assert_eq!(config.retry_backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_from_yaml_string() {
        let yaml = r"
brokers:
  - 'localhost:9092'
  - 'localhost:9093'
topic: events
balancer_kind: hash
batch_size: 10
batch_bytes: 4096
retry_policy: redial
";
        let config = WriterConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.balancer_kind, BalancerKind::Hash);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_bytes, 4096);
        assert_eq!(config.retry_policy, RetryPolicy::Redial);
        // Defaults still applied
        assert_eq!(config.retries, 3);
        assert!(config.balancer.is_none());
        assert!(config.dialer.is_none());
    }

    #[test]
    fn test_yaml_validation_runs() {
        let yaml = r"
brokers: []
topic: events
";
        assert!(matches!(
            WriterConfig::from_yaml_str(yaml),
            Err(ConfigError::NoBrokers)
        ));
    }

    #[test]
    fn test_app_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r"
writer:
  brokers: ['localhost:9092']
  topic: events
metrics:
  enabled: true
  address: '127.0.0.1:9100'
logging:
  level: debug
  json: true
"
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.writer.topic, "events");
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.address, "127.0.0.1:9100");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_app_config_missing_file() {
        let result = AppConfig::from_file("/nonexistent/kafka-writer.yaml");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_KAFKA_WRITER_BROKER", "kafka-1:9092");

        let config = WriterConfig::new(
            vec!["${TEST_KAFKA_WRITER_BROKER}".to_string()],
            "events",
        );
        assert_eq!(config.broker_addresses(), vec!["kafka-1:9092".to_string()]);
        assert!(config.validate().is_ok());

        std::env::remove_var("TEST_KAFKA_WRITER_BROKER");
    }

    #[test]
    fn test_env_var_expansion_missing_var() {
        assert_eq!(expand_env_vars("${NONEXISTENT_VAR}:9092"), ":9092");
        assert_eq!(expand_env_vars("literal:9092"), "literal:9092");
    }

    #[test]
    fn test_resolve_balancer_prefers_custom() {
        #[derive(Debug)]
        struct Always(i32);
        impl Balancer for Always {
            fn assign(&self, _: &Message, _: &[i32]) -> i32 {
                self.0
            }
        }

        let config = valid_config().with_balancer(Arc::new(Always(9)));
        assert_eq!(config.resolve_balancer().assign(&Message::new("x"), &[0]), 9);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("kafka.example.com:9093").unwrap(),
            ("kafka.example.com".to_string(), 9093)
        );
        assert!(parse_address(":9092").is_err());
        assert!(parse_address("host:notaport").is_err());
    }
}
