//! Hub: relays, supervisor and the HTTP front end
//!
//! ```text
//!   HTTP :8080 ──► routes ──► /camera/{id} ──► RelayForwarder[id] ◄── worker feed
//!                        ├──► /status
//!                        ├──► /start_jetson ──► WorkerSupervisor
//!                        └──► /set_prompt ───► worker command channel
//! ```

pub mod config;
pub mod page;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::net::bind_reusable;
use crate::relay::RelayForwarder;
use crate::supervisor::{RemoteLauncher, WorkerSupervisor};

pub use config::{GatewayConfig, HubConfig};
pub use routes::{router, GatewayState};

/// Unstarted hub
pub struct Hub {
    config: HubConfig,
    launcher: Option<Arc<dyn RemoteLauncher>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            launcher: None,
        }
    }

    /// Use `launcher` for remote worker starts
    pub fn with_launcher(mut self, launcher: Arc<dyn RemoteLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Bind the HTTP listener and create one relay per camera
    pub fn bind(self) -> Result<BoundHub> {
        let listener = bind_reusable(self.config.gateway.bind_addr)?;
        let local_addr = listener.local_addr()?;

        let relays: Vec<Arc<RelayForwarder>> = self
            .config
            .cameras
            .iter()
            .cloned()
            .enumerate()
            .map(|(id, camera)| Arc::new(RelayForwarder::new(id, camera)))
            .collect();

        let mut supervisor = WorkerSupervisor::new(self.config.supervisor.clone());
        if let Some(launcher) = self.launcher {
            supervisor = supervisor.with_launcher(launcher);
        }
        let supervisor = Arc::new(supervisor);

        let state = GatewayState::new(
            self.config.gateway.clone(),
            self.config.worker_host(),
            relays.clone(),
            Arc::clone(&supervisor),
        );

        Ok(BoundHub {
            listener,
            local_addr,
            relays,
            supervisor,
            state,
        })
    }

    /// Bind and run until `shutdown` is cancelled
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        self.bind()?.run_until(shutdown).await
    }
}

/// Hub with its HTTP listener bound
pub struct BoundHub {
    listener: TcpListener,
    local_addr: SocketAddr,
    relays: Vec<Arc<RelayForwarder>>,
    supervisor: Arc<WorkerSupervisor>,
    state: GatewayState,
}

impl BoundHub {
    /// HTTP address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Relays indexed by camera id
    pub fn relays(&self) -> &[Arc<RelayForwarder>] {
        &self.relays
    }

    /// Check the workers, start the relays and serve HTTP until `shutdown`
    ///
    /// Worker health never prevents the hub from serving; an unreachable
    /// worker just leaves its cameras disconnected.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        if self.supervisor.config().auto_start {
            self.supervisor.ensure_workers().await;
        } else {
            let liveness = self.supervisor.check().await;
            tracing::info!(liveness = ?liveness, "Worker probe");
        }

        for relay in &self.relays {
            let relay = Arc::clone(relay);
            let token = shutdown.child_token();
            tokio::spawn(async move { relay.run_until(token).await });
        }

        tracing::info!(
            addr = %self.local_addr,
            cameras = self.relays.len(),
            "Hub listening"
        );

        axum::serve(self.listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("Hub stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::relay::RelayConfig;
    use crate::supervisor::SupervisorConfig;

    #[tokio::test]
    async fn test_hub_serves_status_and_stops() {
        let config = HubConfig::default()
            .gateway(GatewayConfig::default().bind("127.0.0.1:0".parse().unwrap()))
            .supervisor(SupervisorConfig::default().ports(vec![]).auto_start(false))
            .cameras(vec![RelayConfig::new("127.0.0.1:9".parse().unwrap())]);
        let hub = Hub::new(config).bind().unwrap();
        let addr = hub.local_addr();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(hub.run_until(shutdown.clone()));

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(b"GET /status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        socket.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200"));
        assert!(raw.contains(r#""cameras":[{"id":0"#));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
