//! WebSocket endpoints: stream channel and control channel.

pub mod control;
pub mod stream;
