//! Multi-client MJPEG stream server
//!
//! Every accepted client gets its own task running an independent cycle:
//!
//! ```text
//!   lock capture -> read frame -> unlock
//!        -> [detect + annotate] -> JPEG encode -> frame -> write
//! ```
//!
//! Only the capture read is serialized across clients. Detection, encoding
//! and the socket write run per client, so a slow client only slows itself.
//! A failed or timed-out write ends that client's task and nothing else.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::capture::jpeg::encode_jpeg;
use crate::capture::{ReadOutcome, SharedCapture};
use crate::detect::{annotate, Detector};
use crate::error::{CaptureError, Result};
use crate::net::{bind_reusable, configure_stream};
use crate::protocol::FramedChunk;
use crate::stats::FpsCounter;
use crate::worker::config::StreamConfig;
use crate::worker::labels::SharedLabels;

/// MJPEG-over-TCP server for one feed of a worker
pub struct StreamServer {
    config: StreamConfig,
    cycle: CycleContext,
    fps: Arc<FpsCounter>,
    active_clients: Arc<AtomicUsize>,
    next_client_id: AtomicU64,
}

/// State each client cycle needs, cheap to clone into a blocking task
#[derive(Clone)]
struct CycleContext {
    capture: Arc<SharedCapture>,
    detector: Option<Arc<dyn Detector>>,
    labels: SharedLabels,
    jpeg_quality: u8,
}

enum CycleOutcome {
    Chunk { bytes: Bytes, detections: usize },
    Retry(CaptureError),
    Fatal(CaptureError),
}

impl StreamServer {
    /// Create a pass-through server (no detector)
    pub fn new(config: StreamConfig, capture: Arc<SharedCapture>) -> Self {
        let fps = Arc::new(FpsCounter::new(config.fps_window));
        let cycle = CycleContext {
            capture,
            detector: None,
            labels: SharedLabels::default(),
            jpeg_quality: config.jpeg_quality,
        };

        Self {
            config,
            cycle,
            fps,
            active_clients: Arc::new(AtomicUsize::new(0)),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Run `detector` on every frame using the given label set
    pub fn with_detector(mut self, detector: Arc<dyn Detector>, labels: SharedLabels) -> Self {
        self.cycle.detector = Some(detector);
        self.cycle.labels = labels;
        self
    }

    /// Get the configuration
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Number of clients currently being served
    pub fn client_count(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Bind the configured address with address reuse
    pub fn listen(&self) -> Result<TcpListener> {
        Ok(bind_reusable(self.config.bind_addr)?)
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.listen()?;
        self.serve(listener, shutdown).await
    }

    /// Serve clients from an already bound listener until `shutdown` is cancelled
    ///
    /// A client that hits an exhausted capture cancels `shutdown` itself, which
    /// stops this loop and every sibling client.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            detector = self.cycle.detector.is_some(),
            "Stream server listening"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(addr = %local_addr, "Stream server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr, &shutdown),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept stream client");
                    }
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr, shutdown: &CancellationToken) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = configure_stream(&socket, self.config.tcp_nodelay) {
            tracing::error!(client_id, error = %e, "Failed to configure socket");
            return;
        }

        let active = self.active_clients.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(client_id, peer = %peer_addr, active, "Stream client connected");

        let client = StreamClient {
            id: client_id,
            socket,
            cycle: self.cycle.clone(),
            fps: Arc::clone(&self.fps),
            config: self.config.clone(),
            shutdown: shutdown.clone(),
        };
        let active_clients = Arc::clone(&self.active_clients);

        tokio::spawn(async move {
            let frames = client.run().await;
            let active = active_clients.fetch_sub(1, Ordering::Relaxed) - 1;
            tracing::info!(client_id, frames, active, "Stream client disconnected");
        });
    }
}

struct StreamClient {
    id: u64,
    socket: TcpStream,
    cycle: CycleContext,
    fps: Arc<FpsCounter>,
    config: StreamConfig,
    shutdown: CancellationToken,
}

impl StreamClient {
    /// Serve frames until the client goes away or the worker stops
    ///
    /// Returns the number of frames written.
    async fn run(mut self) -> u64 {
        let mut frames = 0u64;

        while !self.shutdown.is_cancelled() {
            let cycle = self.cycle.clone();
            let outcome = match tokio::task::spawn_blocking(move || cycle.produce()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(client_id = self.id, error = %e, "Capture cycle panicked");
                    break;
                }
            };

            let (bytes, detections) = match outcome {
                CycleOutcome::Chunk { bytes, detections } => (bytes, detections),
                CycleOutcome::Retry(e) => {
                    tracing::debug!(client_id = self.id, error = %e, "Skipping frame");
                    tokio::time::sleep(self.cycle.capture.config().retry_pause).await;
                    continue;
                }
                CycleOutcome::Fatal(e) => {
                    tracing::error!(client_id = self.id, error = %e, "Capture exhausted, stopping worker");
                    self.shutdown.cancel();
                    break;
                }
            };

            let write = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                write = tokio::time::timeout(self.config.write_timeout, self.socket.write_all(&bytes)) => write,
            };

            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(client_id = self.id, error = %e, "Stream client write failed");
                    break;
                }
                Err(_) => {
                    tracing::debug!(client_id = self.id, "Stream client write timed out");
                    break;
                }
            }

            frames += 1;
            if let Some(sample) = self.fps.record(detections) {
                if self.cycle.detector.is_some() {
                    tracing::info!(
                        fps = format_args!("{:.1}", sample.fps),
                        detections_per_sec = format_args!("{:.1}", sample.detections_per_sec),
                        "Stream throughput"
                    );
                } else {
                    tracing::info!(fps = format_args!("{:.1}", sample.fps), "Stream throughput");
                }
            }
        }

        let _ = self.socket.shutdown().await;
        frames
    }
}

impl CycleContext {
    /// One blocking capture cycle
    fn produce(&self) -> CycleOutcome {
        let mut frame = match self.capture.read() {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::Retry(e) => return CycleOutcome::Retry(e),
            ReadOutcome::Fatal(e) => return CycleOutcome::Fatal(e),
        };

        let mut detections = 0;
        if let Some(detector) = &self.detector {
            let labels = self.labels.snapshot();
            match detector.detect(&frame, &labels) {
                Ok(found) => {
                    detections = found.len();
                    annotate(&mut frame.image, &found);
                }
                Err(e) => {
                    tracing::warn!(sequence = frame.sequence, error = %e, "Detection failed, streaming frame unannotated");
                }
            }
        }

        match encode_jpeg(&frame.image, self.jpeg_quality) {
            Ok(jpeg) => CycleOutcome::Chunk {
                bytes: FramedChunk::encode(&jpeg).into_bytes(),
                detections,
            },
            Err(e) => CycleOutcome::Retry(e),
        }
    }
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("config", &self.config)
            .field("detector", &self.cycle.detector.is_some())
            .finish_non_exhaustive()
    }
}
