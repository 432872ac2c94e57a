//! Gateway and hub configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::relay::RelayConfig;
use crate::supervisor::SupervisorConfig;
use crate::worker::config::DEFAULT_COMMAND_PORT;

/// Default hub HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Worker feed ports relayed by default, camera 0 first
pub const DEFAULT_CAMERA_PORTS: [u16; 2] = [9000, 9001];

/// HTTP front end options
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// How long `/camera/{id}` waits for its relay to connect
    pub camera_wait: Duration,

    /// Poll interval during that wait
    pub camera_poll: Duration,

    /// Worker command channel used by `/set_prompt`
    pub command_addr: SocketAddr,

    /// Bound on one command exchange
    pub command_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
            camera_wait: Duration::from_secs(10),
            camera_poll: Duration::from_millis(500),
            command_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_COMMAND_PORT)),
            command_timeout: Duration::from_secs(3),
        }
    }
}

impl GatewayConfig {
    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the camera connect wait and its poll interval
    pub fn camera_wait(mut self, wait: Duration, poll: Duration) -> Self {
        self.camera_wait = wait;
        self.camera_poll = poll.max(Duration::from_millis(1));
        self
    }

    /// Set the worker command channel address
    pub fn command_addr(mut self, addr: SocketAddr) -> Self {
        self.command_addr = addr;
        self
    }

    /// Set the command exchange timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

/// Everything a hub process runs
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub gateway: GatewayConfig,
    pub supervisor: SupervisorConfig,
    /// One relay per camera; the index is the camera id
    pub cameras: Vec<RelayConfig>,
}

impl HubConfig {
    /// Default layout for workers on `host`
    pub fn for_worker_host(host: IpAddr) -> Self {
        let cameras = DEFAULT_CAMERA_PORTS
            .iter()
            .map(|&port| RelayConfig::new(SocketAddr::new(host, port)))
            .collect();

        Self {
            gateway: GatewayConfig::default()
                .command_addr(SocketAddr::new(host, DEFAULT_COMMAND_PORT)),
            supervisor: SupervisorConfig::default()
                .worker_host(host)
                .ports(DEFAULT_CAMERA_PORTS.to_vec()),
            cameras,
        }
    }

    /// Host the workers run on
    pub fn worker_host(&self) -> IpAddr {
        self.supervisor.worker_host
    }

    /// Set the gateway options
    pub fn gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    /// Set the supervisor options
    pub fn supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Replace the relayed cameras
    pub fn cameras(mut self, cameras: Vec<RelayConfig>) -> Self {
        self.cameras = cameras;
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::for_worker_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}
