//! Server bootstrap, per-connection lifecycle composition and the
//! started-server handle.

mod bootstrap;
mod handle;
mod lifecycle;

pub use bootstrap::{ServerError, TcpServer, TransportOptions};
pub use handle::{HandleState, StartedServer};
