use crate::utils::error::{BusError, BusResult};
use config::{Config as RawConfig, Environment, File, FileFormat};
use dotenv::dotenv;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

fn default_port() -> u16 {
    3000
}

fn default_host() -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, 1)
}

fn default_api_key() -> String {
    "mysecretkey".to_string()
}

fn default_diagnostics_roles() -> Vec<String> {
    vec!["SUPERVISORE".to_string(), "ADMIN".to_string()]
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_liveness_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_writer_buffer() -> usize {
    256
}

fn default_publisher_buffer() -> usize {
    200
}

fn default_event_log_throttle() -> Duration {
    Duration::from_secs(300)
}

fn default_bucket_capacity() -> u32 {
    20
}

fn default_refill_per_second() -> f64 {
    5.0
}

fn default_bucket_idle() -> Duration {
    Duration::from_secs(600)
}

fn default_queue_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_max_per_user() -> usize {
    500
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_retries() -> u32 {
    3
}

fn default_ack_check_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_snapshot_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_history_depth() -> usize {
    60
}

fn default_max_error_rate() -> f64 {
    0.25
}

fn default_log_buffer_size() -> usize {
    1000
}

fn default_forward_buffer() -> usize {
    64
}

fn default_client_url() -> String {
    "ws://127.0.0.1:3000/events/stream".to_string()
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(3)
}

fn default_true() -> bool {
    true
}

fn default_max_missed_pings() -> u32 {
    3
}

fn default_health_tick() -> Duration {
    Duration::from_secs(5)
}

fn default_health_gain() -> u8 {
    5
}

fn default_health_penalty() -> u8 {
    30
}

fn default_optimistic_timeout() -> Duration {
    Duration::from_secs(15)
}

fn human_readable_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let duration_str: String = Deserialize::deserialize(deserializer)?;
    humantime::parse_duration(&duration_str).map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: Ipv4Addr,
    #[serde(default = "default_api_key")]
    pub api_key: String,
    /// Stations allowed to read `/diagnostics`.
    #[serde(default = "default_diagnostics_roles")]
    pub diagnostics_roles: Vec<String>,
    /// WebSocket ping cadence on the push stream.
    #[serde(
        default = "default_heartbeat_interval",
        deserialize_with = "human_readable_duration"
    )]
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            api_key: default_api_key(),
            diagnostics_roles: default_diagnostics_roles(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Connections without a heartbeat for this long are unregistered.
    #[serde(
        default = "default_liveness_timeout",
        deserialize_with = "human_readable_duration"
    )]
    pub liveness_timeout: Duration,
    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "human_readable_duration"
    )]
    pub liveness_sweep_interval: Duration,
    #[serde(
        default = "default_flush_interval",
        deserialize_with = "human_readable_duration"
    )]
    pub flush_interval: Duration,
    /// Frames buffered per connection writer before backpressure kicks in.
    #[serde(default = "default_writer_buffer")]
    pub writer_buffer: usize,
    #[serde(default = "default_publisher_buffer")]
    pub publisher_buffer: usize,
    #[serde(
        default = "default_event_log_throttle",
        deserialize_with = "human_readable_duration"
    )]
    pub event_log_throttle: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: default_liveness_timeout(),
            liveness_sweep_interval: default_sweep_interval(),
            flush_interval: default_flush_interval(),
            writer_buffer: default_writer_buffer(),
            publisher_buffer: default_publisher_buffer(),
            event_log_throttle: default_event_log_throttle(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_bucket_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
    #[serde(
        default = "default_bucket_idle",
        deserialize_with = "human_readable_duration"
    )]
    pub idle_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_bucket_capacity(),
            refill_per_second: default_refill_per_second(),
            idle_after: default_bucket_idle(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(
        default = "default_queue_ttl",
        deserialize_with = "human_readable_duration"
    )]
    pub ttl: Duration,
    #[serde(default = "default_max_per_user")]
    pub max_per_user: usize,
    #[serde(
        default = "default_sweep_interval",
        deserialize_with = "human_readable_duration"
    )]
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttl: default_queue_ttl(),
            max_per_user: default_max_per_user(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AckConfig {
    #[serde(
        default = "default_ack_timeout",
        deserialize_with = "human_readable_duration"
    )]
    pub timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(
        default = "default_ack_check_interval",
        deserialize_with = "human_readable_duration"
    )]
    pub check_interval: Duration,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            timeout: default_ack_timeout(),
            max_retries: default_max_retries(),
            check_interval: default_ack_check_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(
        default = "default_snapshot_interval",
        deserialize_with = "human_readable_duration"
    )]
    pub snapshot_interval: Duration,
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
    /// Above this error rate `/health` reports the bus as unhealthy.
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: default_snapshot_interval(),
            history_depth: default_history_depth(),
            max_error_rate: default_max_error_rate(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_buffer_size")]
    pub buffer_size: usize,
    /// Webhook receiving error-level log entries. Unset disables forwarding.
    #[serde(default)]
    pub error_sink_url: Option<String>,
    #[serde(default = "default_forward_buffer")]
    pub forward_buffer: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_log_buffer_size(),
            error_sink_url: None,
            forward_buffer: default_forward_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_client_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub station: String,
    #[serde(
        default = "default_base_delay",
        deserialize_with = "human_readable_duration"
    )]
    pub base_delay: Duration,
    #[serde(
        default = "default_max_delay",
        deserialize_with = "human_readable_duration"
    )]
    pub max_delay: Duration,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub jitter: bool,
    #[serde(
        default = "default_dedup_window",
        deserialize_with = "human_readable_duration"
    )]
    pub dedup_window: Duration,
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,
    #[serde(
        default = "default_heartbeat_interval",
        deserialize_with = "human_readable_duration"
    )]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_max_missed_pings")]
    pub max_missed_pings: u32,
    #[serde(
        default = "default_health_tick",
        deserialize_with = "human_readable_duration"
    )]
    pub health_tick: Duration,
    #[serde(default = "default_health_gain")]
    pub health_gain: u8,
    #[serde(default = "default_health_penalty")]
    pub health_penalty: u8,
    #[serde(
        default = "default_optimistic_timeout",
        deserialize_with = "human_readable_duration"
    )]
    pub optimistic_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_client_url(),
            api_key: None,
            user_id: String::new(),
            tenant_id: String::new(),
            station: String::new(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            jitter: false,
            dedup_window: default_dedup_window(),
            dedup_enabled: true,
            heartbeat_interval: default_heartbeat_interval(),
            max_missed_pings: default_max_missed_pings(),
            health_tick: default_health_tick(),
            health_gain: default_health_gain(),
            health_penalty: default_health_penalty(),
            optimistic_timeout: default_optimistic_timeout(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub ack: AckConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Loads the configuration from an optional file and `BUS__` environment variables.
    pub fn new(config_path: Option<PathBuf>) -> BusResult<Self> {
        dotenv().ok();

        let mut builder = RawConfig::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("BUS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder
            .build()
            .map_err(|e| BusError::ConfigError(e.to_string()))?;
        let cfg: Config = raw
            .try_deserialize()
            .map_err(|e| BusError::ConfigError(e.to_string()))?;

        Ok(cfg)
    }

    pub fn validate(&self) -> BusResult<()> {
        let durations = [
            ("server.heartbeat_interval", self.server.heartbeat_interval),
            ("bus.liveness_timeout", self.bus.liveness_timeout),
            ("bus.liveness_sweep_interval", self.bus.liveness_sweep_interval),
            ("bus.flush_interval", self.bus.flush_interval),
            ("queue.ttl", self.queue.ttl),
            ("queue.sweep_interval", self.queue.sweep_interval),
            ("ack.timeout", self.ack.timeout),
            ("ack.check_interval", self.ack.check_interval),
            ("metrics.snapshot_interval", self.metrics.snapshot_interval),
            ("client.base_delay", self.client.base_delay),
            ("client.heartbeat_interval", self.client.heartbeat_interval),
            ("client.health_tick", self.client.health_tick),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(BusError::ConfigError(format!("{name} must be greater than 0")));
        }

        let sizes = [
            ("bus.writer_buffer", self.bus.writer_buffer),
            ("bus.publisher_buffer", self.bus.publisher_buffer),
            ("rate_limit.capacity", self.rate_limit.capacity as usize),
            ("queue.max_per_user", self.queue.max_per_user),
            ("metrics.history_depth", self.metrics.history_depth),
            ("logging.buffer_size", self.logging.buffer_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, n)| *n == 0) {
            return Err(BusError::ConfigError(format!("{name} must be greater than 0")));
        }

        if self.rate_limit.refill_per_second <= 0.0 {
            return Err(BusError::ConfigError(
                "rate_limit.refill_per_second must be greater than 0".to_string(),
            ));
        }
        if self.client.max_delay < self.client.base_delay {
            return Err(BusError::ConfigError(
                "client.max_delay must not be smaller than client.base_delay".to_string(),
            ));
        }
        if self.bus.liveness_timeout <= self.server.heartbeat_interval {
            return Err(BusError::ConfigError(
                "bus.liveness_timeout must exceed server.heartbeat_interval".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_new_and_validate() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"
            [server]
            port = 3100
            host = "127.0.0.1"
            diagnostics_roles = ["SUPERVISORE"]

            [queue]
            ttl = "60s"
            max_per_user = 50

            [ack]
            timeout = "5s"
            max_retries = 2

            [client]
            base_delay = "500ms"
            max_delay = "10s"
            dedup_window = "2s"
        "#
        )
        .unwrap();
        let config = Config::new(Some(tmp.path().to_path_buf())).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 3100);
        assert_eq!(config.server.diagnostics_roles, vec!["SUPERVISORE"]);
        assert_eq!(config.queue.ttl, Duration::from_secs(60));
        assert_eq!(config.ack.max_retries, 2);
        assert_eq!(config.client.base_delay, Duration::from_millis(500));
        assert_eq!(config.rate_limit.capacity, default_bucket_capacity());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.validate().unwrap();

        config.queue.ttl = Duration::ZERO;
        assert!(matches!(config.validate(), Err(BusError::ConfigError(msg)) if msg.contains("queue.ttl")));

        let mut config = Config::default();
        config.metrics.history_depth = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.max_delay = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }
}
