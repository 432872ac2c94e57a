//! Wire protocols
//!
//! - [`chunk`]: MJPEG-over-TCP framing shared by workers, relays and the
//!   MJPEG input source
//! - [`command`]: the one-shot JSON control envelope

pub mod chunk;
pub mod command;

pub use chunk::{encode_chunk, ChunkDecoder, FramedChunk, BOUNDARY, BOUNDARY_NAME};
pub use command::{Command, CommandEnvelope, CommandReply};
