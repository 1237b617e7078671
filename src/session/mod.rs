//! Session engine and the capabilities it consumes.
//!
//! A [`Session`] is constructed per accepted connection from the duplex
//! abstraction plus three injectable capabilities: the [`SetupHandler`]
//! that accepts or rejects the handshake, the [`FlowGovernor`] that
//! gates outbound frames, and the [`ErrorSink`] that receives
//! post-handshake errors.

mod engine;
mod flow;
mod setup;
mod sink;

pub use engine::{CloseHandle, Session, SessionError, SessionHandle};
pub use flow::{FlowGovernor, UnlimitedGovernor, WindowedGovernor};
pub use setup::{RequestHandler, SetupHandler, SetupInfo, SetupRejected};
pub use sink::{ErrorSink, LogSink};
