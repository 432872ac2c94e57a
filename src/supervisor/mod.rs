//! Worker liveness and remote start
//!
//! Liveness is a bare TCP connect to each worker port, in order. A remote
//! start issues the launch, waits a fixed settle interval and probes exactly
//! once more; a worker that is still down is left for manual intervention.

pub mod config;
pub mod launcher;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::LaunchError;

pub use config::SupervisorConfig;
pub use launcher::{CommandLauncher, RemoteLauncher};

/// Result of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Every port accepted a connection
    Healthy,
    /// The first port that did not
    Unreachable { port: u16 },
}

impl Liveness {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Liveness::Healthy)
    }
}

/// Result of a remote start
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The re-check after the settle interval found every port up
    Started,
    /// The launch was issued but a port is still down
    StillUnreachable { port: u16 },
    /// The launch could not be issued
    LaunchFailed(LaunchError),
}

/// Probe `ports` on `host` in order, stopping at the first failure
pub async fn check_workers(host: IpAddr, ports: &[u16], timeout: Duration) -> Liveness {
    for &port in ports {
        let addr = SocketAddr::new(host, port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => drop(stream),
            Ok(Err(e)) => {
                tracing::debug!(addr = %addr, error = %e, "Worker port refused");
                return Liveness::Unreachable { port };
            }
            Err(_) => {
                tracing::debug!(addr = %addr, "Worker port probe timed out");
                return Liveness::Unreachable { port };
            }
        }
    }

    Liveness::Healthy
}

/// Hub-side view of the workers
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    launcher: Option<Arc<dyn RemoteLauncher>>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            launcher: None,
        }
    }

    /// Use `launcher` for remote starts
    pub fn with_launcher(mut self, launcher: Arc<dyn RemoteLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Probe every configured worker port
    pub async fn check(&self) -> Liveness {
        check_workers(
            self.config.worker_host,
            &self.config.ports,
            self.config.probe_timeout,
        )
        .await
    }

    /// Launch the workers, wait the settle interval and re-check once
    pub async fn start_workers(&self) -> StartOutcome {
        let launcher = match &self.launcher {
            Some(launcher) => launcher,
            None => return StartOutcome::LaunchFailed(LaunchError::NotConfigured),
        };

        tracing::info!(host = %self.config.worker_host, "Starting workers remotely");
        if let Err(e) = launcher.launch() {
            tracing::error!(error = %e, "Remote start failed");
            return StartOutcome::LaunchFailed(e);
        }

        tracing::info!(
            settle_secs = self.config.settle_interval.as_secs_f32(),
            "Waiting for workers to come up"
        );
        tokio::time::sleep(self.config.settle_interval).await;

        match self.check().await {
            Liveness::Healthy => {
                tracing::info!("Workers are running");
                StartOutcome::Started
            }
            Liveness::Unreachable { port } => {
                tracing::warn!(port, "Worker still unreachable after remote start");
                StartOutcome::StillUnreachable { port }
            }
        }
    }

    /// Startup check: probe, and if enabled try one remote start
    ///
    /// Never fails; the hub serves regardless and reports health per camera.
    pub async fn ensure_workers(&self) -> Liveness {
        let port = match self.check().await {
            Liveness::Healthy => {
                tracing::info!(host = %self.config.worker_host, "Workers are running");
                return Liveness::Healthy;
            }
            Liveness::Unreachable { port } => port,
        };

        tracing::warn!(host = %self.config.worker_host, port, "Worker not responding");
        if !self.config.auto_start || self.launcher.is_none() {
            self.log_manual_start();
            return Liveness::Unreachable { port };
        }

        match self.start_workers().await {
            StartOutcome::Started => Liveness::Healthy,
            StartOutcome::StillUnreachable { port } => {
                self.log_manual_start();
                Liveness::Unreachable { port }
            }
            StartOutcome::LaunchFailed(_) => {
                self.log_manual_start();
                Liveness::Unreachable { port }
            }
        }
    }

    fn log_manual_start(&self) {
        let how = match &self.launcher {
            Some(launcher) => launcher.describe(),
            None => "start the workers on the worker host".to_string(),
        };
        tracing::error!(
            host = %self.config.worker_host,
            ports = ?self.config.ports,
            "Workers are not running; start them manually: {}",
            how
        );
    }
}

impl std::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("config", &self.config)
            .field("launcher", &self.launcher.as_ref().map(|l| l.describe()))
            .finish()
    }
}
