//! MJPEG-over-TCP edge streaming
//!
//! Two process roles share this crate:
//!
//! - a **worker** owns a frame source (and optionally a detector), serves it
//!   as raw and annotated MJPEG feeds over plain TCP, and accepts one-shot
//!   JSON commands that change detection labels at runtime;
//! - a **hub** relays each worker feed to any number of HTTP viewers without
//!   re-encoding, supervises worker liveness and exposes a small web UI.
//!
//! ```text
//!   camera ─► Worker ──:9000/:9001 MJPEG──► Hub relays ──HTTP :8080──► browsers
//!               ▲                             │
//!               └──────:9003 set_prompt───────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mjpeg_relay::capture::{CaptureStrategy, TestPattern};
//! use mjpeg_relay::worker::{Worker, WorkerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mjpeg_relay::Result<()> {
//!     let strategies: Vec<Box<dyn CaptureStrategy>> = vec![Box::new(TestPattern::default())];
//!     let worker = Worker::new(WorkerConfig::default(), strategies);
//!     worker.run_until(CancellationToken::new()).await
//! }
//! ```

pub mod capture;
pub mod detect;
pub mod error;
pub mod gateway;
pub mod net;
pub mod protocol;
pub mod relay;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result};
pub use gateway::{Hub, HubConfig};
pub use relay::{RelayConfig, RelayForwarder};
pub use worker::{Worker, WorkerConfig};
