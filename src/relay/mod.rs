//! Hub-side relay: one upstream worker feed fanned out to many consumers
//!
//! # Architecture
//!
//! ```text
//!   worker feed ──TCP──► RelayForwarder::run_until
//!                          │  ChunkDecoder (resync + Content-Length)
//!                          ▼
//!                    ConsumerRegistry ── offer ─────► Subscription ──► HTTP body
//!                          │                    └───► Subscription ──► HTTP body
//!                          ▼
//!                     RelayStats
//! ```
//!
//! Chunks are forwarded as the exact upstream bytes. `Bytes` is reference
//! counted, so each consumer queue holds a view of the same allocation.

pub mod config;
pub mod forwarder;
pub mod registry;

pub use config::RelayConfig;
pub use forwarder::{RelayForwarder, RelayPhase};
pub use registry::{ConsumerRegistry, Delivery, Subscription};
