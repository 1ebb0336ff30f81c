use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:8200")]
    pub address: SocketAddr,

    /// Largest NDJSON document accepted, in bytes.
    #[envconfig(default = "307200")]
    pub max_event_size: usize,

    /// Documents decoded before a batch is forwarded.
    #[envconfig(default = "10")]
    pub batch_size: NonZeroUsize,

    /// Streams decoded at once, across every intake endpoint.
    #[envconfig(default = "200")]
    pub max_concurrent_decoders: NonZeroUsize,

    #[envconfig(default = "1000")]
    pub queue_capacity: NonZeroUsize,

    #[envconfig(default = "1000")]
    pub queue_send_timeout_ms: u64,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "intake")]
    pub otel_service_name: String,

    #[envconfig(default = "info")]
    pub log_level: Level,
}

impl Config {
    pub fn queue_send_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_send_timeout_ms)
    }
}
