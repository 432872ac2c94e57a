//! Hub-side ingest and fan-out for one camera
//!
//! ```text
//!            connect ok                 read/parse error, EOF, timeout
//! Connecting ---------> Streaming -------------------------------+
//!     ^    \                                                     |
//!     |     +--connect error--+                                  |
//!     |                       v                                  v
//!     +---- reconnect delay -- Disconnected <--------------------+
//! ```
//!
//! While streaming, upstream bytes accumulate in a [`ChunkDecoder`]; every
//! complete chunk is handed verbatim to the [`ConsumerRegistry`]. The loop
//! never gives up; only cancellation stops it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{ChunkDecoder, FramedChunk};
use crate::relay::config::RelayConfig;
use crate::relay::registry::{ConsumerRegistry, Subscription};
use crate::stats::{RelayStats, RelayStatsSnapshot};

/// Upstream connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Disconnected,
    Connecting,
    Streaming,
}

impl RelayPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayPhase::Disconnected => "disconnected",
            RelayPhase::Connecting => "connecting",
            RelayPhase::Streaming => "streaming",
        }
    }
}

impl std::fmt::Display for RelayPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay for one camera
#[derive(Debug)]
pub struct RelayForwarder {
    camera: usize,
    config: RelayConfig,
    registry: Arc<ConsumerRegistry>,
    phase: watch::Sender<RelayPhase>,
    stats: RelayStats,
}

impl RelayForwarder {
    pub fn new(camera: usize, config: RelayConfig) -> Self {
        let (phase, _) = watch::channel(RelayPhase::Disconnected);
        Self {
            camera,
            registry: Arc::new(ConsumerRegistry::new(config.consumer_queue_depth)),
            config,
            phase,
            stats: RelayStats::new(),
        }
    }

    /// Camera index
    pub fn camera(&self) -> usize {
        self.camera
    }

    /// Upstream worker feed
    pub fn upstream(&self) -> SocketAddr {
        self.config.upstream
    }

    /// Current phase
    pub fn phase(&self) -> RelayPhase {
        *self.phase.borrow()
    }

    /// Whether the upstream is connected and streaming
    pub fn connected(&self) -> bool {
        self.phase() == RelayPhase::Streaming
    }

    /// Observe phase changes
    pub fn watch_phase(&self) -> watch::Receiver<RelayPhase> {
        self.phase.subscribe()
    }

    /// Poll [`connected`](Self::connected) until it is true or `wait` elapses
    pub async fn wait_connected(&self, wait: Duration, poll: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if self.connected() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Register a new downstream consumer
    pub fn subscribe(&self) -> Subscription {
        let subscription = self.registry.subscribe();
        tracing::info!(
            camera = self.camera,
            consumer_id = subscription.id(),
            consumers = self.registry.len(),
            "Consumer subscribed"
        );
        subscription
    }

    /// Number of registered consumers
    pub fn consumer_count(&self) -> usize {
        self.registry.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the reconnect loop until `shutdown` is cancelled
    pub async fn run_until(&self, shutdown: CancellationToken) {
        tracing::info!(camera = self.camera, upstream = %self.config.upstream, "Relay started");

        while !shutdown.is_cancelled() {
            self.set_phase(RelayPhase::Connecting);
            self.stats.on_connect_attempt();

            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect_and_stream() => result,
            };

            if self.phase() == RelayPhase::Streaming {
                self.stats.on_disconnect();
            }
            self.set_phase(RelayPhase::Disconnected);

            match result {
                Ok(()) => tracing::warn!(camera = self.camera, "Upstream closed the stream"),
                Err(e) => tracing::warn!(
                    camera = self.camera,
                    error = %e,
                    retry_in_ms = self.config.reconnect_delay.as_millis() as u64,
                    "Upstream lost"
                ),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_phase(RelayPhase::Disconnected);
        tracing::info!(camera = self.camera, "Relay stopped");
    }

    /// Connect once and forward until the upstream fails
    ///
    /// Returns `Ok` on a clean EOF.
    async fn connect_and_stream(&self) -> Result<()> {
        let addr = self.config.upstream;
        let mut socket = match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(source)) => return Err(Error::Connect { addr, source }),
            Err(_) => {
                return Err(Error::Connect {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };

        self.set_phase(RelayPhase::Streaming);
        tracing::info!(camera = self.camera, upstream = %addr, "Upstream connected");

        let mut decoder = ChunkDecoder::with_max_chunk_size(self.config.max_chunk_size);
        loop {
            let buf = decoder.buffer_mut();
            buf.reserve(self.config.read_buffer_size);

            let n = tokio::time::timeout(self.config.read_timeout, socket.read_buf(buf))
                .await
                .map_err(|_| Error::Timeout("upstream read"))??;
            if n == 0 {
                return Ok(());
            }

            while let Some(chunk) = decoder.decode()? {
                self.forward(chunk);
            }
        }
    }

    fn forward(&self, chunk: FramedChunk) {
        let bytes = chunk.into_bytes();
        let delivery = self.registry.broadcast(&bytes);

        self.stats.on_chunk(bytes.len());
        if delivery.dropped > 0 {
            self.stats.on_dropped(delivery.dropped);
        }
        if delivery.evicted > 0 {
            self.stats.on_evicted(delivery.evicted);
            tracing::info!(
                camera = self.camera,
                evicted = delivery.evicted,
                consumers = self.registry.len(),
                "Consumers evicted"
            );
        }
    }

    fn set_phase(&self, phase: RelayPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(camera = self.camera, from = %previous, to = %phase, "Relay phase changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::encode_chunk;

    fn fast_config(upstream: SocketAddr) -> RelayConfig {
        RelayConfig::new(upstream)
            .reconnect_delay(Duration::from_millis(50))
            .read_timeout(Duration::from_millis(500))
    }

    fn spawn_relay(relay: &Arc<RelayForwarder>) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let relay = Arc::clone(relay);
        tokio::spawn(async move { relay.run_until(token).await });
        shutdown
    }

    #[tokio::test]
    async fn test_disconnected_before_first_connect() {
        let relay = RelayForwarder::new(0, RelayConfig::new("127.0.0.1:9".parse().unwrap()));

        assert_eq!(relay.phase(), RelayPhase::Disconnected);
        assert!(!relay.connected());
        assert!(!relay.wait_connected(Duration::from_millis(50), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_forwards_verbatim_chunks() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = Arc::new(RelayForwarder::new(0, fast_config(upstream.local_addr().unwrap())));
        let mut consumer = relay.subscribe();
        let shutdown = spawn_relay(&relay);

        let (mut conn, _) = upstream.accept().await.unwrap();
        assert!(relay.wait_connected(Duration::from_secs(1), Duration::from_millis(10)).await);

        let first = encode_chunk(b"\xFF\xD8first\xFF\xD9");
        let second = encode_chunk(b"\xFF\xD8--frame\r\nsecond\xFF\xD9");
        // Split the write mid-header to exercise reassembly
        let mut wire = Vec::new();
        wire.extend_from_slice(&first);
        wire.extend_from_slice(&second);
        conn.write_all(&wire[..7]).await.unwrap();
        conn.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.write_all(&wire[7..]).await.unwrap();

        assert_eq!(consumer.recv().await.unwrap(), first);
        assert_eq!(consumer.recv().await.unwrap(), second);

        let stats = relay.stats();
        assert_eq!(stats.chunks_forwarded, 2);
        assert_eq!(stats.bytes_forwarded, (first.len() + second.len()) as u64);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_dead_consumer_does_not_stop_delivery() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = Arc::new(RelayForwarder::new(0, fast_config(upstream.local_addr().unwrap())));
        let mut alive = relay.subscribe();
        let dead = relay.subscribe();
        let shutdown = spawn_relay(&relay);

        let (mut conn, _) = upstream.accept().await.unwrap();
        drop(dead);
        for i in 0..3u8 {
            conn.write_all(&encode_chunk(&[0xFF, 0xD8, i])).await.unwrap();
        }

        for i in 0..3u8 {
            let chunk = alive.recv().await.unwrap();
            assert_eq!(chunk, encode_chunk(&[0xFF, 0xD8, i]));
        }
        assert_eq!(relay.consumer_count(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_header_forces_reconnect() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = Arc::new(RelayForwarder::new(0, fast_config(upstream.local_addr().unwrap())));
        let mut consumer = relay.subscribe();
        let shutdown = spawn_relay(&relay);

        let (mut conn, _) = upstream.accept().await.unwrap();
        conn.write_all(b"--frame\r\nContent-Type: image/jpeg\r\n\r\nxx\r\n")
            .await
            .unwrap();

        // Relay drops the connection and dials again
        let (mut second, _) = tokio::time::timeout(Duration::from_secs(2), upstream.accept())
            .await
            .unwrap()
            .unwrap();
        second.write_all(&encode_chunk(b"ok")).await.unwrap();

        assert_eq!(consumer.recv().await.unwrap(), encode_chunk(b"ok"));
        assert!(relay.stats().connect_attempts >= 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_upstream_eof_flips_connected() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = Arc::new(
            RelayForwarder::new(
                0,
                fast_config(upstream.local_addr().unwrap()).reconnect_delay(Duration::from_secs(60)),
            ),
        );
        let mut phases = relay.watch_phase();
        let shutdown = spawn_relay(&relay);

        let (conn, _) = upstream.accept().await.unwrap();
        phases
            .wait_for(|p| *p == RelayPhase::Streaming)
            .await
            .unwrap();
        drop(conn);

        tokio::time::timeout(
            Duration::from_secs(1),
            phases.wait_for(|p| *p == RelayPhase::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!relay.connected());
        assert_eq!(relay.stats().disconnects, 1);

        shutdown.cancel();
    }
}
