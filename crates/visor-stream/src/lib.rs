//! Per-session event sequencing, buffering, and fan-out.
//!
//! One [`EventStreamer`] exists per session. A single session task drains the
//! ingest channel, assigns sequence ids, appends to the snapshot-anchored
//! ring buffer, and fans out to connected clients. Slow clients are dropped
//! back to the newest buffered FullSnapshot with a `sequence_reset` frame;
//! the ingest path never blocks on any client.

pub mod buffer;
pub mod client;
pub mod registry;
pub mod streamer;

pub use buffer::EventBuffer;
pub use client::{ClientConnection, QueuedFrame};
pub use registry::StreamerRegistry;
pub use streamer::{EventStreamer, IngestHandle, StreamerStatus};
