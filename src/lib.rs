//! duplexd: server-side TCP transport for bidirectional, multiplexed
//! duplex sessions.
//!
//! The crate layers, leaves first:
//! - [`wire`]: the frame model and the two-stage framing pipeline
//!   (length prefix, then frame codec).
//! - [`connection`]: the duplex abstraction over one raw channel.
//! - [`session`]: the per-connection protocol engine and the
//!   capabilities it consumes (setup handler, flow governor, error
//!   sink).
//! - [`server`]: the bootstrap that binds the listener, composes each
//!   connection's lifecycle signal and exposes the started-server
//!   handle.

pub mod config;
pub mod connection;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod wire;
