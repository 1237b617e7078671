//! Started-server handle: bound address, shutdown, shutdown waiting.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Lifecycle of a started server.
///
/// Running -> Stopping (shutdown requested) -> Stopped (accept loop has
/// exited and in-flight connections were told to close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Running,
    Stopping,
    Stopped,
}

/// Returned by `TcpServer::start`; the only surface exposed to the
/// caller once the listener is bound.
pub struct StartedServer {
    local_addr: SocketAddr,
    state: Arc<watch::Sender<HandleState>>,
}

impl StartedServer {
    pub(crate) fn new(local_addr: SocketAddr, state: Arc<watch::Sender<HandleState>>) -> Self {
        Self { local_addr, state }
    }

    /// Resolved bind address; reflects the actual port when an
    /// ephemeral port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    /// Initiate teardown. Idempotent: only the first call moves the
    /// state machine; later calls are no-ops. Teardown is forced: the
    /// accept loop stops and every in-flight connection is told to
    /// close, with no drain period at this layer.
    pub fn shutdown(&self) {
        let initiated = self.state.send_if_modified(|state| {
            if *state == HandleState::Running {
                *state = HandleState::Stopping;
                true
            } else {
                false
            }
        });
        if initiated {
            info!(address = %self.local_addr, "shutdown requested");
        }
    }

    /// Suspend until the server has stopped accepting connections.
    /// Safe to call from any number of tasks concurrently; wakes
    /// promptly when `shutdown` runs elsewhere.
    pub async fn await_shutdown(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == HandleState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
