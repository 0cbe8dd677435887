//! Backend configuration

use flowd_core::DEFAULT_FIREFLY_PORT;
use std::time::Duration;

/// Name of the firefly UDP backend
pub const UDP_FIREFLY: &str = "udp_firefly";

/// Name of the structured log backend
pub const LOG: &str = "log";

/// Firefly backend configuration
#[derive(Debug, Clone)]
pub struct FireflyConfig {
    /// Fixed collector `host:port`; `None` sends each firefly to the flow's
    /// remote address on `port`
    pub collector: Option<String>,
    /// Destination port when no collector is set
    pub port: u16,
    /// Hostname for the syslog header; `None` uses the kernel hostname
    pub hostname: Option<String>,
    /// Socket send buffer size
    pub send_buffer_size: Option<usize>,
}

impl Default for FireflyConfig {
    fn default() -> Self {
        Self {
            collector: None,
            port: DEFAULT_FIREFLY_PORT,
            hostname: None,
            send_buffer_size: None,
        }
    }
}

/// Dispatcher and backend configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Backend names, resolved through the registry
    pub backends: Vec<String>,
    /// Firefly backend settings
    pub firefly: FireflyConfig,
    /// Upper bound for delivering one batch to one backend
    pub send_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backends: vec![UDP_FIREFLY.to_string()],
            firefly: FireflyConfig::default(),
            send_timeout: Duration::from_secs(2),
        }
    }
}
