//! Error types
//!
//! One crate-level [`Error`] with a sub-error per failure domain:
//!
//! - [`CaptureError`]: frame source open/read failures. Recoverable up to the
//!   retry budget, then fatal to the owning worker.
//! - [`Error::Connect`]: an upstream worker is unreachable from the hub.
//! - [`ProtocolError`]: a malformed multipart header or command envelope.
//! - [`LaunchError`]: a remote worker start could not be issued.
//!
//! Downstream write failures never surface here; the relay registry turns
//! them into evictions.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error
#[derive(Debug)]
pub enum Error {
    /// Socket-level I/O failure
    Io(io::Error),
    /// Capture device or frame source failure
    Capture(CaptureError),
    /// Could not reach an upstream endpoint
    Connect {
        addr: SocketAddr,
        source: io::Error,
    },
    /// Wire format or envelope violation
    Protocol(ProtocolError),
    /// Remote worker start failed
    Launch(LaunchError),
    /// A bounded operation did not finish in time
    Timeout(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Capture(e) => write!(f, "capture error: {}", e),
            Error::Connect { addr, source } => {
                write!(f, "failed to connect to {}: {}", addr, source)
            }
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::Launch(e) => write!(f, "launch error: {}", e),
            Error::Timeout(what) => write!(f, "timed out: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Capture(e) => Some(e),
            Error::Connect { source, .. } => Some(source),
            Error::Protocol(e) => Some(e),
            Error::Launch(e) => Some(e),
            Error::Timeout(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<CaptureError> for Error {
    fn from(e: CaptureError) -> Self {
        Error::Capture(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<LaunchError> for Error {
    fn from(e: LaunchError) -> Self {
        Error::Launch(e)
    }
}

/// Frame source failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// A strategy could not open its device
    Open { strategy: String, reason: String },
    /// The device opened but no warm-up read produced a frame
    WarmupFailed { strategy: String, attempts: u32 },
    /// A steady-state read failed
    Read(String),
    /// No strategy in the list produced a usable source
    NoUsableSource { tried: Vec<String> },
    /// The failure budget and the single reinitialization are both spent
    Exhausted { consecutive_failures: u32 },
    /// JPEG encode or decode failed
    Codec(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Open { strategy, reason } => {
                write!(f, "strategy '{}' failed to open: {}", strategy, reason)
            }
            CaptureError::WarmupFailed { strategy, attempts } => write!(
                f,
                "strategy '{}' opened but produced no frame in {} warm-up reads",
                strategy, attempts
            ),
            CaptureError::Read(reason) => write!(f, "frame read failed: {}", reason),
            CaptureError::NoUsableSource { tried } => {
                write!(f, "no usable frame source (tried: {})", tried.join(", "))
            }
            CaptureError::Exhausted {
                consecutive_failures,
            } => write!(
                f,
                "capture exhausted after {} consecutive failures and a failed reinitialization",
                consecutive_failures
            ),
            CaptureError::Codec(reason) => write!(f, "JPEG codec error: {}", reason),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Wire and envelope violations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header block did not terminate within the size limit
    HeaderTooLarge(usize),
    /// Header line was not `Name: value`
    MalformedHeader(String),
    /// No usable Content-Length header
    MissingContentLength,
    /// Declared payload exceeds the configured maximum
    ChunkTooLarge { declared: usize, max: usize },
    /// Payload was not followed by CRLF, so the declared length was wrong
    LengthMismatch { declared: usize },
    /// Command envelope was not a JSON object with a string `cmd`
    InvalidEnvelope(String),
    /// Command request exceeded the size limit
    RequestTooLarge(usize),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::HeaderTooLarge(n) => {
                write!(f, "multipart header exceeds {} bytes", n)
            }
            ProtocolError::MalformedHeader(line) => write!(f, "malformed header line: {:?}", line),
            ProtocolError::MissingContentLength => write!(f, "missing or invalid Content-Length"),
            ProtocolError::ChunkTooLarge { declared, max } => write!(
                f,
                "declared Content-Length {} exceeds maximum {}",
                declared, max
            ),
            ProtocolError::LengthMismatch { declared } => write!(
                f,
                "payload of declared length {} not terminated by CRLF",
                declared
            ),
            ProtocolError::InvalidEnvelope(reason) => {
                write!(f, "invalid command envelope: {}", reason)
            }
            ProtocolError::RequestTooLarge(n) => write!(f, "command request exceeds {} bytes", n),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Remote start failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// No launch command is configured
    NotConfigured,
    /// The launch command could not be spawned
    Spawn { command: String, reason: String },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::NotConfigured => write!(f, "no remote launch command configured"),
            LaunchError::Spawn { command, reason } => {
                write!(f, "failed to run '{}': {}", command, reason)
            }
        }
    }
}

impl std::error::Error for LaunchError {}
