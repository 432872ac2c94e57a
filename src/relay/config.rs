//! Relay configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::chunk::DEFAULT_MAX_CHUNK_SIZE;

/// Per-camera forwarder options
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream worker feed
    pub upstream: SocketAddr,

    /// Pause between losing the upstream and the next connect attempt
    pub reconnect_delay: Duration,

    /// Upstream connect timeout
    pub connect_timeout: Duration,

    /// Drop the upstream if no bytes arrive for this long
    pub read_timeout: Duration,

    /// Bytes reserved per upstream read
    pub read_buffer_size: usize,

    /// Chunks queued per consumer before frames are dropped for it
    pub consumer_queue_depth: usize,

    /// Largest accepted payload
    pub max_chunk_size: usize,
}

impl RelayConfig {
    /// Create a config for the given upstream with default timings
    pub fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            read_buffer_size: 4 * 1024,
            consumer_queue_depth: 8,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }

    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the upstream read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the per-consumer queue depth (minimum 1)
    pub fn consumer_queue_depth(mut self, depth: usize) -> Self {
        self.consumer_queue_depth = depth.max(1);
        self
    }

    /// Set the maximum payload size
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }
}
