//! Shared types for the visor visual streaming core.
//!
//! Session ids, recorder events, the `WireEvent` envelope, control frames,
//! and the error taxonomy live here so that the streamer, server, and
//! runtime crates agree on one wire shape.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

pub use config::StreamingConfig;
pub use error::WireErrorKind;
pub use events::{ControlFrame, RecorderEvent, WireEvent, WireMetadata, FULL_SNAPSHOT_TYPE};
pub use ids::{SessionId, SessionIdError};
