//! Supervisor configuration

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Liveness and remote-start options
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Host running the workers
    pub worker_host: IpAddr,

    /// Ports probed in order; the first unreachable one is reported
    pub ports: Vec<u16>,

    /// Per-port connect timeout
    pub probe_timeout: Duration,

    /// Wait between issuing a remote start and re-checking
    pub settle_interval: Duration,

    /// Start workers at hub startup when the probe fails
    pub auto_start: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: vec![9000, 9001],
            probe_timeout: Duration::from_secs(2),
            settle_interval: Duration::from_secs(10),
            auto_start: true,
        }
    }
}

impl SupervisorConfig {
    /// Set the worker host
    pub fn worker_host(mut self, host: IpAddr) -> Self {
        self.worker_host = host;
        self
    }

    /// Set the probed ports
    pub fn ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    /// Set the per-port probe timeout
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the settle interval after a remote start
    pub fn settle_interval(mut self, interval: Duration) -> Self {
        self.settle_interval = interval;
        self
    }

    /// Enable or disable remote start at hub startup
    pub fn auto_start(mut self, enabled: bool) -> Self {
        self.auto_start = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();

        assert_eq!(config.ports, vec![9000, 9001]);
        assert_eq!(config.probe_timeout, Duration::from_secs(2));
        assert_eq!(config.settle_interval, Duration::from_secs(10));
        assert!(config.auto_start);
    }

    #[test]
    fn test_builder_ports() {
        let config = SupervisorConfig::default().ports(vec![1, 2, 3]);

        assert_eq!(config.ports, vec![1, 2, 3]);
    }
}
