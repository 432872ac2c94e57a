//! MJPEG-over-TCP framing
//!
//! Each frame on the wire is one multipart unit:
//!
//! ```text
//! --frame\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <N>\r\n
//! \r\n
//! <N bytes of JPEG>\r\n
//! ```
//!
//! The decoder locates the boundary token, then trusts `Content-Length` to
//! find the end of the unit and checks the trailing CRLF. A boundary token
//! that happens to occur inside a JPEG payload is therefore skipped over
//! rather than splitting the frame, without changing the wire format.
//!
//! A [`FramedChunk`] keeps the verbatim wire bytes so relays can forward it
//! without re-encoding. `Bytes` is reference counted, so cloning a chunk for
//! each consumer does not copy the payload.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Boundary token opening every unit
pub const BOUNDARY: &[u8] = b"--frame\r\n";

/// Boundary name as advertised in HTTP `multipart/x-mixed-replace`
pub const BOUNDARY_NAME: &str = "frame";

/// Content type of every payload
pub const CONTENT_TYPE: &str = "image/jpeg";

/// Upper bound on the header block between the boundary and the blank line
pub const MAX_HEADER_SIZE: usize = 1024;

/// Default upper bound on a single payload
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const TRAILER: &[u8] = b"\r\n";

/// One complete multipart unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedChunk {
    /// Wire bytes from the boundary through the trailing CRLF
    bytes: Bytes,
    /// Offset of the payload within `bytes`
    payload_offset: usize,
    /// Declared (and verified) payload length
    payload_len: usize,
}

impl FramedChunk {
    /// Frame an encoded JPEG for the wire
    pub fn encode(payload: &[u8]) -> Self {
        let header = format!(
            "Content-Type: {}\r\nContent-Length: {}\r\n\r\n",
            CONTENT_TYPE,
            payload.len()
        );

        let mut buf =
            BytesMut::with_capacity(BOUNDARY.len() + header.len() + payload.len() + TRAILER.len());
        buf.extend_from_slice(BOUNDARY);
        buf.extend_from_slice(header.as_bytes());
        let payload_offset = buf.len();
        buf.extend_from_slice(payload);
        buf.extend_from_slice(TRAILER);

        Self {
            bytes: buf.freeze(),
            payload_offset,
            payload_len: payload.len(),
        }
    }

    /// Verbatim wire bytes
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consume the chunk, returning its wire bytes
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Zero-copy view of the JPEG payload
    pub fn payload(&self) -> Bytes {
        self.bytes
            .slice(self.payload_offset..self.payload_offset + self.payload_len)
    }

    /// Payload length as declared in `Content-Length`
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Total length on the wire
    pub fn wire_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Frame an encoded JPEG and return the wire bytes
pub fn encode_chunk(payload: &[u8]) -> Bytes {
    FramedChunk::encode(payload).into_bytes()
}

/// Incremental decoder over an accumulating byte buffer
///
/// Feed bytes with [`ChunkDecoder::extend`] (or read straight into
/// [`ChunkDecoder::buffer_mut`]) and drain complete units with
/// [`ChunkDecoder::decode`]. Incomplete units stay buffered.
#[derive(Debug)]
pub struct ChunkDecoder {
    buf: BytesMut,
    max_chunk_size: usize,
    discarded: u64,
}

impl ChunkDecoder {
    /// Create a decoder with the default payload limit
    pub fn new() -> Self {
        Self::with_max_chunk_size(DEFAULT_MAX_CHUNK_SIZE)
    }

    /// Create a decoder with a custom payload limit
    pub fn with_max_chunk_size(max_chunk_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_chunk_size,
            discarded: 0,
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read into directly (e.g. with `AsyncReadExt::read_buf`)
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of bytes waiting to be decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes dropped because they preceded a boundary token
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drop all buffered state, e.g. after reconnecting
    pub fn reset(&mut self) {
        self.buf.clear();
        self.discarded = 0;
    }

    /// Try to decode the next complete unit
    ///
    /// Returns `Ok(None)` when more bytes are needed. An error means the
    /// stream is unusable from this point and the connection should be
    /// dropped.
    pub fn decode(&mut self) -> Result<Option<FramedChunk>, ProtocolError> {
        // Resync on the boundary token
        match find(&self.buf, BOUNDARY) {
            Some(0) => {}
            Some(pos) => {
                tracing::debug!(bytes = pos, "Discarding bytes before boundary");
                self.buf.advance(pos);
                self.discarded += pos as u64;
            }
            None => {
                // Keep a tail that could be the start of a split boundary
                let keep = BOUNDARY.len() - 1;
                if self.buf.len() > keep {
                    let stale = self.buf.len() - keep;
                    self.buf.advance(stale);
                    self.discarded += stale as u64;
                }
                return Ok(None);
            }
        }

        // The terminator's first CRLF may be the boundary line's own CRLF
        let search_from = BOUNDARY.len() - TRAILER.len();
        let terminator = match find(&self.buf[search_from..], HEADER_TERMINATOR) {
            Some(rel) => search_from + rel,
            None => {
                if self.buf.len() > BOUNDARY.len() + MAX_HEADER_SIZE {
                    return Err(ProtocolError::HeaderTooLarge(MAX_HEADER_SIZE));
                }
                return Ok(None);
            }
        };

        if terminator > BOUNDARY.len() + MAX_HEADER_SIZE {
            return Err(ProtocolError::HeaderTooLarge(MAX_HEADER_SIZE));
        }

        let header_block = if terminator > BOUNDARY.len() {
            &self.buf[BOUNDARY.len()..terminator]
        } else {
            &[][..]
        };
        let headers = parse_headers(header_block)?;

        let declared = headers
            .content_length
            .ok_or(ProtocolError::MissingContentLength)?;
        if declared > self.max_chunk_size {
            return Err(ProtocolError::ChunkTooLarge {
                declared,
                max: self.max_chunk_size,
            });
        }

        let payload_offset = terminator + HEADER_TERMINATOR.len();
        let total = payload_offset + declared + TRAILER.len();
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        if &self.buf[payload_offset + declared..total] != TRAILER {
            return Err(ProtocolError::LengthMismatch { declared });
        }

        let bytes = self.buf.split_to(total).freeze();
        Ok(Some(FramedChunk {
            bytes,
            payload_offset,
            payload_len: declared,
        }))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct ChunkHeaders<'a> {
    content_type: Option<&'a str>,
    content_length: Option<usize>,
}

fn parse_headers(block: &[u8]) -> Result<ChunkHeaders<'_>, ProtocolError> {
    let text = std::str::from_utf8(block)
        .map_err(|_| ProtocolError::MalformedHeader(String::from_utf8_lossy(block).into()))?;

    let mut headers = ChunkHeaders::default();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::MalformedHeader(line.to_string()))?;
        let value = value.trim();

        if name.trim().eq_ignore_ascii_case("content-length") {
            let len = value
                .parse::<usize>()
                .map_err(|_| ProtocolError::MissingContentLength)?;
            headers.content_length = Some(len);
        } else if name.trim().eq_ignore_ascii_case("content-type") {
            headers.content_type = Some(value);
        }
    }

    if let Some(ct) = headers.content_type {
        if !ct.eq_ignore_ascii_case(CONTENT_TYPE) {
            tracing::trace!(content_type = ct, "Unexpected chunk content type");
        }
    }

    Ok(headers)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
