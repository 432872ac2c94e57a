//! MJPEG feed as a frame source
//!
//! Lets an annotating worker consume another worker's raw feed when the
//! camera device is already owned by that worker. Runs on blocking sockets
//! since every read already happens inside `spawn_blocking`.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use image::RgbImage;

use crate::error::CaptureError;
use crate::protocol::chunk::{ChunkDecoder, DEFAULT_MAX_CHUNK_SIZE};

use super::jpeg::decode_jpeg;
use super::{CaptureStrategy, FrameSource};

const READ_SIZE: usize = 16 * 1024;

/// Strategy that connects to an MJPEG-over-TCP feed
#[derive(Debug, Clone)]
pub struct MjpegInput {
    addr: SocketAddr,
    name: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_chunk_size: usize,
}

impl MjpegInput {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            name: format!("mjpeg-input({})", addr),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-read socket timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    fn connect(&self) -> Result<TcpStream, CaptureError> {
        let open_err = |e: std::io::Error| CaptureError::Open {
            strategy: self.name.clone(),
            reason: e.to_string(),
        };

        let stream = TcpStream::connect_timeout(&self.addr, self.connect_timeout).map_err(open_err)?;
        stream
            .set_read_timeout(Some(self.read_timeout))
            .map_err(open_err)?;
        Ok(stream)
    }
}

impl CaptureStrategy for MjpegInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        let stream = self.connect()?;
        tracing::info!(addr = %self.addr, "Connected to MJPEG input");

        Ok(Box::new(MjpegInputSource {
            input: self.clone(),
            stream: Some(stream),
            decoder: ChunkDecoder::with_max_chunk_size(self.max_chunk_size),
        }))
    }
}

struct MjpegInputSource {
    input: MjpegInput,
    stream: Option<TcpStream>,
    decoder: ChunkDecoder,
}

impl MjpegInputSource {
    fn next_payload(&mut self) -> Result<bytes::Bytes, CaptureError> {
        if self.stream.is_none() {
            self.decoder.reset();
            self.stream = Some(self.input.connect()?);
            tracing::info!(addr = %self.input.addr, "Reconnected to MJPEG input");
        }

        let mut scratch = [0u8; READ_SIZE];
        loop {
            match self.decoder.decode() {
                Ok(Some(chunk)) => return Ok(chunk.payload()),
                Ok(None) => {}
                Err(e) => return Err(CaptureError::Read(e.to_string())),
            }

            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Err(CaptureError::Read("MJPEG input not connected".into())),
            };
            match stream.read(&mut scratch) {
                Ok(0) => return Err(CaptureError::Read("MJPEG input closed".into())),
                Ok(n) => self.decoder.extend(&scratch[..n]),
                Err(e) => return Err(CaptureError::Read(e.to_string())),
            }
        }
    }
}

impl FrameSource for MjpegInputSource {
    fn read(&mut self) -> Result<RgbImage, CaptureError> {
        let payload = match self.next_payload() {
            Ok(payload) => payload,
            Err(e) => {
                // Reconnect lazily on the next read
                self.stream = None;
                return Err(e);
            }
        };

        decode_jpeg(&payload)
    }
}
