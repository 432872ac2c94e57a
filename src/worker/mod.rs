//! Edge worker: capture, optional detection, stream feeds and command channel
//!
//! A worker opens one shared capture and serves it on up to two feeds:
//!
//! ```text
//!                       +--> raw feed (9001)        no detector
//!   SharedCapture ------+
//!                       +--> annotated feed (9000)  detector + labels
//!
//!   command channel (9003) --set_prompt--> labels
//! ```
//!
//! All listeners share one cancellation token. An exhausted capture cancels
//! it from inside a stream client, and [`BoundWorker::run_until`] then returns
//! the capture error so the process can exit for its supervisor to restart.

pub mod command;
pub mod config;
pub mod labels;
pub mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureStrategy, SharedCapture};
use crate::detect::Detector;
use crate::error::{CaptureError, Result};

pub use command::{send_command, CommandChannel};
pub use config::{CommandConfig, StreamConfig, WorkerConfig};
pub use labels::{parse_prompt, SharedLabels, DEFAULT_PROMPT};
pub use stream::StreamServer;

/// Unstarted worker
pub struct Worker {
    config: WorkerConfig,
    strategies: Vec<Box<dyn CaptureStrategy>>,
    detector: Option<Arc<dyn Detector>>,
    labels: SharedLabels,
}

impl Worker {
    /// Create a worker trying `strategies` in priority order
    pub fn new(config: WorkerConfig, strategies: Vec<Box<dyn CaptureStrategy>>) -> Self {
        Self {
            config,
            strategies,
            detector: None,
            labels: SharedLabels::default(),
        }
    }

    /// Annotate the annotated feed with `detector`
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Start from a custom label set instead of the default prompt
    pub fn with_labels(mut self, labels: SharedLabels) -> Self {
        self.labels = labels;
        self
    }

    /// Label set shared by the command channel and the annotated feed
    pub fn labels(&self) -> &SharedLabels {
        &self.labels
    }

    /// Open the capture and bind every configured listener
    ///
    /// Fails if no capture strategy is usable or a port cannot be bound.
    pub async fn bind(self) -> Result<BoundWorker> {
        let Worker {
            config,
            strategies,
            detector,
            labels,
        } = self;

        let capture_config = config.capture.clone();
        let capture = tokio::task::spawn_blocking(move || SharedCapture::open(strategies, capture_config))
            .await
            .map_err(|e| CaptureError::Read(format!("capture initialization aborted: {}", e)))??;
        let capture = Arc::new(capture);
        tracing::info!(strategy = %capture.strategy(), "Capture ready");

        let raw_feed = match config.raw_feed {
            Some(feed) => Some(BoundService::stream(StreamServer::new(feed, Arc::clone(&capture)))?),
            None => None,
        };

        let annotated_feed = match config.annotated_feed {
            Some(feed) => {
                let mut server = StreamServer::new(feed, Arc::clone(&capture));
                match &detector {
                    Some(detector) => {
                        server = server.with_detector(Arc::clone(detector), labels.clone());
                    }
                    None => {
                        tracing::warn!("No detector configured, annotated feed runs as pass-through");
                    }
                }
                Some(BoundService::stream(server)?)
            }
            None => None,
        };

        let command = match config.command {
            Some(command) => Some(BoundService::command(CommandChannel::new(command, labels.clone()))?),
            None => None,
        };

        Ok(BoundWorker {
            capture,
            raw_feed,
            annotated_feed,
            command,
            labels,
        })
    }

    /// Bind and run until `shutdown` is cancelled or the capture is exhausted
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        self.bind().await?.run_until(shutdown).await
    }
}

struct BoundService<S> {
    service: S,
    listener: TcpListener,
    addr: SocketAddr,
}

impl BoundService<StreamServer> {
    fn stream(server: StreamServer) -> Result<Self> {
        let listener = server.listen()?;
        let addr = listener.local_addr()?;
        Ok(Self {
            service: server,
            listener,
            addr,
        })
    }

    fn spawn(self, running: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.service.serve(self.listener, running).await })
    }
}

impl BoundService<CommandChannel> {
    fn command(channel: CommandChannel) -> Result<Self> {
        let listener = channel.listen()?;
        let addr = listener.local_addr()?;
        Ok(Self {
            service: channel,
            listener,
            addr,
        })
    }

    fn spawn(self, running: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.service.serve(self.listener, running).await })
    }
}

/// Worker with its capture open and listeners bound
pub struct BoundWorker {
    capture: Arc<SharedCapture>,
    raw_feed: Option<BoundService<StreamServer>>,
    annotated_feed: Option<BoundService<StreamServer>>,
    command: Option<BoundService<CommandChannel>>,
    labels: SharedLabels,
}

impl BoundWorker {
    /// Address of the raw feed, if enabled
    pub fn raw_addr(&self) -> Option<SocketAddr> {
        self.raw_feed.as_ref().map(|s| s.addr)
    }

    /// Address of the annotated feed, if enabled
    pub fn annotated_addr(&self) -> Option<SocketAddr> {
        self.annotated_feed.as_ref().map(|s| s.addr)
    }

    /// Address of the command channel, if enabled
    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.command.as_ref().map(|s| s.addr)
    }

    /// Active label set
    pub fn labels(&self) -> &SharedLabels {
        &self.labels
    }

    /// Shared capture
    pub fn capture(&self) -> &Arc<SharedCapture> {
        &self.capture
    }

    /// Serve until `shutdown` is cancelled or the capture is exhausted
    ///
    /// Returns the capture error in the second case.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let running = shutdown.child_token();
        let mut tasks = Vec::with_capacity(3);

        if let Some(feed) = self.raw_feed {
            tasks.push(feed.spawn(running.clone()));
        }
        if let Some(feed) = self.annotated_feed {
            tasks.push(feed.spawn(running.clone()));
        }
        if let Some(command) = self.command {
            tasks.push(command.spawn(running.clone()));
        }

        running.cancelled().await;

        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Worker service stopped with error"),
                Err(e) => tracing::warn!(error = %e, "Worker service task failed"),
            }
        }

        if let Some(e) = self.capture.fatal_error() {
            tracing::error!(error = %e, "Worker stopped: capture exhausted");
            return Err(e.into());
        }

        tracing::info!("Worker stopped");
        Ok(())
    }
}
