//! Worker configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::capture::CaptureConfig;

/// Default port of the unannotated feed
pub const DEFAULT_RAW_PORT: u16 = 9001;

/// Default port of the annotated feed
pub const DEFAULT_ANNOTATED_PORT: u16 = 9000;

/// Default command channel port
pub const DEFAULT_COMMAND_PORT: u16 = 9003;

/// Per-feed streaming options
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// JPEG quality, 1-100
    pub jpeg_quality: u8,

    /// Give up on a client whose socket accepts no data for this long
    pub write_timeout: Duration,

    /// Enable TCP_NODELAY on client sockets
    pub tcp_nodelay: bool,

    /// Window for the rolling FPS log line
    pub fps_window: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_ANNOTATED_PORT)),
            jpeg_quality: 85,
            write_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            fps_window: Duration::from_secs(5),
        }
    }
}

impl StreamConfig {
    /// Create a config bound to the given address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the JPEG quality (clamped to 1-100)
    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Set the per-write timeout
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the FPS log window
    pub fn fps_window(mut self, window: Duration) -> Self {
        self.fps_window = window;
        self
    }
}

/// Command channel options
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Largest accepted request body
    pub max_request_size: usize,

    /// Time allowed for a client to deliver its request
    pub request_timeout: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_COMMAND_PORT)),
            max_request_size: 4 * 1024,
            request_timeout: Duration::from_secs(3),
        }
    }
}

impl CommandConfig {
    /// Create a config bound to the given address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the request size limit
    pub fn max_request_size(mut self, size: usize) -> Self {
        self.max_request_size = size.max(16);
        self
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Everything a worker process serves
///
/// A feed with `None` config is not started. The annotated feed runs the
/// detector when one is supplied; the raw feed never does.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub raw_feed: Option<StreamConfig>,
    pub annotated_feed: Option<StreamConfig>,
    pub command: Option<CommandConfig>,
    pub capture: CaptureConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            raw_feed: Some(StreamConfig::with_addr(SocketAddr::from((
                [0, 0, 0, 0],
                DEFAULT_RAW_PORT,
            )))),
            annotated_feed: Some(StreamConfig::default()),
            command: Some(CommandConfig::default()),
            capture: CaptureConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Set or disable the raw feed
    pub fn raw_feed(mut self, config: Option<StreamConfig>) -> Self {
        self.raw_feed = config;
        self
    }

    /// Set or disable the annotated feed
    pub fn annotated_feed(mut self, config: Option<StreamConfig>) -> Self {
        self.annotated_feed = config;
        self
    }

    /// Set or disable the command channel
    pub fn command(mut self, config: Option<CommandConfig>) -> Self {
        self.command = config;
        self
    }

    /// Set the capture options
    pub fn capture(mut self, config: CaptureConfig) -> Self {
        self.capture = config;
        self
    }
}
