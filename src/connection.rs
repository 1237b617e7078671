//! Duplex connection abstraction.
//!
//! Wraps one raw byte channel in the framing pipeline and exposes a
//! symmetric inbound stream / outbound sink of [`Frame`]s. Closing
//! either side closes the channel.

use std::fmt;
use std::net::SocketAddr;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::wire::{Frame, FrameCodec, WireError};

/// Outbound half of a split duplex connection.
pub type FrameSink<S> = SplitSink<Framed<S, FrameCodec>, Frame>;

/// Inbound half of a split duplex connection.
pub type FrameStream<S> = SplitStream<Framed<S, FrameCodec>>;

/// One accepted channel with the pipeline installed.
pub struct DuplexConnection<S> {
    framed: Framed<S, FrameCodec>,
    peer: Option<SocketAddr>,
}

impl<S> DuplexConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Install the pipeline on a raw stream.
    pub fn new(stream: S, codec: FrameCodec) -> Self {
        Self {
            framed: Framed::new(stream, codec),
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Send one frame and flush it.
    pub async fn send(&mut self, frame: Frame) -> Result<(), WireError> {
        self.framed.send(frame).await
    }

    /// Receive the next frame. `None` means the peer closed the channel.
    pub async fn recv(&mut self) -> Option<Result<Frame, WireError>> {
        self.framed.next().await
    }

    /// Flush and shut down the outbound side of the channel.
    pub async fn close(&mut self) -> Result<(), WireError> {
        self.framed.close().await
    }

    /// Split into independently owned outbound and inbound halves.
    pub fn split(self) -> (FrameSink<S>, FrameStream<S>) {
        self.framed.split()
    }
}

impl<S> fmt::Debug for DuplexConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexConnection")
            .field("peer", &self.peer)
            .finish()
    }
}
