//! Setup and request handler capabilities.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::wire::Payload;

/// Handshake data presented to the [`SetupHandler`].
#[derive(Debug, Clone)]
pub struct SetupInfo {
    pub peer: Option<SocketAddr>,
    pub version: u16,
    /// How often the client intends to send keepalives. Zero = never.
    pub keepalive_interval: Duration,
    /// Inbound silence after which the connection is considered dead.
    /// Zero disables the liveness deadline.
    pub max_lifetime: Duration,
    pub metadata: Option<Bytes>,
    pub data: Bytes,
}

/// Returned by a [`SetupHandler`] that declines a connection.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct SetupRejected {
    reason: String,
}

impl SetupRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Decides whether an incoming handshake is accepted.
///
/// Accepting produces the [`RequestHandler`] that serves the connection;
/// rejecting terminates the connection's lifecycle signal with the error.
#[async_trait]
pub trait SetupHandler: Send + Sync {
    async fn accept(&self, setup: SetupInfo) -> Result<Arc<dyn RequestHandler>, SetupRejected>;
}

/// Serves the requests of one accepted connection.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// The returned payload is sent back as the stream's terminal Response.
    async fn handle_request(&self, request: Payload) -> anyhow::Result<Payload>;

    /// Fire-and-forget messages expect no reply; errors are reported to
    /// the error sink only.
    async fn handle_fire_forget(&self, _message: Payload) -> anyhow::Result<()> {
        Ok(())
    }
}
