use std::time::Duration;

use clap::Args;

use crate::bus::config::BusConfig;
use crate::bus::transport::PendingLimits;
use crate::logging::LogFormat;

/// Scale applied to the transport's default pending limits for router
/// subscriptions.
const PENDING_LIMIT_FACTOR: usize = 10;

/// Dispatch runtime settings shared by every router of a process.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Caller request timeout and latency budget of a handled request, in milliseconds.
    pub default_timeout_ms: u64,
    /// Pending message limit of each router subscription.
    pub pending_msgs_limit: usize,
    /// Pending byte limit of each router subscription.
    pub pending_bytes_limit: usize,
}

impl ServiceConfig {
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    #[must_use]
    pub fn pending_limits(&self) -> PendingLimits {
        PendingLimits {
            messages: self.pending_msgs_limit,
            bytes: self.pending_bytes_limit,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let limits = PendingLimits::DEFAULT.scaled(PENDING_LIMIT_FACTOR);
        Self {
            default_timeout_ms: 15_000,
            pending_msgs_limit: limits.messages,
            pending_bytes_limit: limits.bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// RuntimeArgs
// ---------------------------------------------------------------------------

/// Command-line and environment settings common to every service binary.
///
/// Meant to be `#[command(flatten)]`ed into the service's own parser.
#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    /// Comma-separated bus server URLs.
    #[arg(
        long = "bus-urls",
        env = "BUS_URLS",
        value_delimiter = ',',
        default_value = "nats://127.0.0.1:4222"
    )]
    pub bus_urls: Vec<String>,

    /// Connection name reported to the bus.
    #[arg(long = "service-name", env = "SERVICE_NAME", default_value = "")]
    pub service_name: String,

    /// Delay between failed connect attempts, in milliseconds.
    #[arg(long = "bus-connect-retry-ms", env = "BUS_CONNECT_RETRY_MS", default_value_t = 2_000)]
    pub connect_retry_ms: u64,

    /// Request timeout and latency budget, in milliseconds.
    #[arg(long = "service-timeout-ms", env = "SERVICE_TIMEOUT_MS", default_value_t = 15_000)]
    pub timeout_ms: u64,

    /// Log output format.
    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl RuntimeArgs {
    /// Splits the arguments into bus and dispatch settings.
    #[must_use]
    pub fn into_configs(self) -> (BusConfig, ServiceConfig) {
        let bus = BusConfig {
            urls: self.bus_urls,
            name: self.service_name,
            connect_retry_delay_ms: self.connect_retry_ms,
        };
        let service = ServiceConfig {
            default_timeout_ms: self.timeout_ms,
            ..ServiceConfig::default()
        };
        (bus, service)
    }
}
