// Engine defaults and environment overrides.
use std::time::Duration;

pub(crate) const DEFAULT_FETCH_BYTES: i32 = 1024 * 1024;
pub(crate) const DEFAULT_FETCH_MIN_BYTES: i32 = 1;
pub(crate) const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(250);
pub(crate) const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_CHANNEL_BUFFER: usize = 256;
pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue depth of the producer's dispatcher and result channels.
pub(crate) const PRODUCER_QUEUE_DEPTH: usize = 128;

/// Queue depth of a broker executor's request channel.
pub(crate) const EXECUTOR_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub consumer: ConsumerConfig,
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Fetch size every request starts from.
    pub fetch_default_bytes: i32,
    /// Hard cap on the adaptive fetch size; 0 means unbounded.
    pub fetch_max_bytes: i32,
    /// Minimum payload the broker should accumulate before answering.
    pub fetch_min_bytes: i32,
    /// Server-side long-poll ceiling for a fetch.
    pub max_wait_time: Duration,
    /// Shared cooldown: reassign rate limit and post-error broker backoff.
    pub retry_backoff: Duration,
    /// Capacity of each stream's message and error channels.
    pub channel_buffer_size: usize,
    /// When false, stream errors are logged and never delivered on `errors()`.
    pub return_errors: bool,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// How long `stop()` keeps handling acknowledgements before force-closing
    /// the sink.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            fetch_default_bytes: DEFAULT_FETCH_BYTES,
            fetch_max_bytes: 0,
            fetch_min_bytes: DEFAULT_FETCH_MIN_BYTES,
            max_wait_time: DEFAULT_MAX_WAIT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER,
            return_errors: false,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl Config {
    /// Defaults with `KRILL_*` overrides applied.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Some(value) = read_i32_env("KRILL_FETCH_DEFAULT_BYTES") {
            config.consumer.fetch_default_bytes = value;
        }
        if let Some(value) = read_i32_env("KRILL_FETCH_MAX_BYTES") {
            config.consumer.fetch_max_bytes = value;
        }
        if let Some(value) = read_i32_env("KRILL_FETCH_MIN_BYTES") {
            config.consumer.fetch_min_bytes = value;
        }
        if let Some(value) = read_millis_env("KRILL_MAX_WAIT_MS") {
            config.consumer.max_wait_time = value;
        }
        if let Some(value) = read_millis_env("KRILL_RETRY_BACKOFF_MS") {
            config.consumer.retry_backoff = value;
        }
        if let Some(value) = read_usize_env("KRILL_CHANNEL_BUFFER_SIZE") {
            config.consumer.channel_buffer_size = value;
        }
        if let Some(value) = read_bool_env("KRILL_RETURN_ERRORS") {
            config.consumer.return_errors = value;
        }
        if let Some(value) = read_millis_env("KRILL_SHUTDOWN_TIMEOUT_MS") {
            config.producer.shutdown_timeout = value;
        }
        config
    }
}

fn read_i32_env(key: &str) -> Option<i32> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value >= 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_millis_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
