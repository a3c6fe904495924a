//! Bus connection configuration.

use std::time::Duration;

/// Where and how to connect to the bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Server URLs, tried by the transport in its own order.
    pub urls: Vec<String>,
    /// Connection name reported to the server.
    pub name: String,
    /// Fixed delay between failed connect attempts in milliseconds.
    pub connect_retry_delay_ms: u64,
}

impl BusConfig {
    #[must_use]
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://127.0.0.1:4222".to_string()],
            name: String::new(),
            connect_retry_delay_ms: 2_000,
        }
    }
}
