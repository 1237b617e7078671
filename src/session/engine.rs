//! Session engine: the protocol state machine run per connection.
//!
//! The engine has two phases. The starting phase reads the Setup frame,
//! consults the [`SetupHandler`] and reports the outcome through a
//! one-shot notifier. The running phase splits the duplex connection,
//! gates every outbound frame through the [`FlowGovernor`] and serves
//! requests until the channel closes. Post-start failures go to the
//! [`ErrorSink`], never to the start notifier.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, warn};

use crate::connection::{DuplexConnection, FrameSink, FrameStream};
use crate::telemetry::counters;
use crate::wire::{ErrorCode, Frame, FrameBody, WireError, PROTOCOL_VERSION};

use super::flow::FlowGovernor;
use super::setup::{RequestHandler, SetupHandler, SetupInfo, SetupRejected};
use super::sink::ErrorSink;

/// Depth of the outbound frame queue feeding the writer task.
const OUTBOUND_QUEUE: usize = 64;

/// Session-level error. During the starting phase these terminate the
/// connection's lifecycle signal; afterwards they go to the error sink.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("connection closed before setup")]
    ClosedBeforeSetup,

    #[error("session stopped before start completed")]
    Aborted,

    #[error("invalid setup: {0}")]
    InvalidSetup(&'static str),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("setup rejected: {0}")]
    Rejected(#[from] SetupRejected),

    #[error("protocol violation: {0}")]
    Violation(&'static str),

    #[error("peer error {code:?}: {message}")]
    Peer { code: ErrorCode, message: String },

    #[error("no frame received within {0:?}")]
    LivenessExpired(Duration),

    #[error("request handler failed: {0}")]
    Handler(String),
}

/// Requests teardown of a running session. Cloneable; the server's
/// shutdown path holds one per connection.
#[derive(Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseHandle {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        let _ = self.tx.send(true);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Observable lifecycle of a started session.
///
/// `started` fires exactly once with the handshake outcome; `closed`
/// fires exactly once when the session has fully torn down.
pub struct SessionHandle {
    pub started: oneshot::Receiver<Result<(), SessionError>>,
    pub closed: oneshot::Receiver<()>,
    pub closer: CloseHandle,
}

/// Server-side protocol engine for one connection.
pub struct Session<S> {
    duplex: DuplexConnection<S>,
    setup: Arc<dyn SetupHandler>,
    governor: Arc<dyn FlowGovernor>,
    sink: Arc<dyn ErrorSink>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn server(
        duplex: DuplexConnection<S>,
        setup: Arc<dyn SetupHandler>,
        governor: Arc<dyn FlowGovernor>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            duplex,
            setup,
            governor,
            sink,
        }
    }

    /// Spawn the session task and return its lifecycle handle.
    pub fn start(self) -> SessionHandle {
        let (started_tx, started_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let closer = CloseHandle::new();

        // Subscribe before spawning so a close request issued right
        // after `start` returns is never missed.
        let close_rx = closer.subscribe();
        let writer_close_rx = closer.subscribe();
        let internal = closer.clone();

        tokio::spawn(async move {
            self.run(started_tx, internal, close_rx, writer_close_rx)
                .await;
            let _ = closed_tx.send(());
        });

        SessionHandle {
            started: started_rx,
            closed: closed_rx,
            closer,
        }
    }

    async fn run(
        mut self,
        started: oneshot::Sender<Result<(), SessionError>>,
        closer: CloseHandle,
        mut close_rx: watch::Receiver<bool>,
        writer_close_rx: watch::Receiver<bool>,
    ) {
        // Starting phase: the first frame must be a valid Setup.
        let first = tokio::select! {
            biased;
            _ = close_rx.changed() => None,
            frame = self.duplex.recv() => frame,
        };

        let setup_frame = match first {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                return self
                    .fail_setup(started, SessionError::Wire(e), None)
                    .await;
            }
            None => {
                return self
                    .fail_setup(started, SessionError::ClosedBeforeSetup, None)
                    .await;
            }
        };

        let info = match validate_setup(setup_frame, self.duplex.peer()) {
            Ok(info) => info,
            Err((err, reply)) => return self.fail_setup(started, err, Some(reply)).await,
        };

        let max_lifetime = info.max_lifetime;
        let handler = match self.setup.accept(info).await {
            Ok(handler) => handler,
            Err(rejected) => {
                counters::setup_rejected();
                let reply = Frame::error(0, ErrorCode::RejectedSetup, rejected.reason());
                return self
                    .fail_setup(started, SessionError::Rejected(rejected), Some(reply))
                    .await;
            }
        };

        counters::setup_accepted();
        debug!("session started");
        let _ = started.send(Ok(()));

        self.run_started(handler, max_lifetime, closer, close_rx, writer_close_rx)
            .await;
    }

    /// Answer a failed handshake (best effort), close the channel and
    /// fire the start notifier with the error.
    async fn fail_setup(
        mut self,
        started: oneshot::Sender<Result<(), SessionError>>,
        error: SessionError,
        reply: Option<Frame>,
    ) {
        warn!(error = %error, "session setup failed");
        if let Some(frame) = reply {
            if self.duplex.send(frame).await.is_err() {
                debug!("setup error reply not delivered");
            }
        }
        let _ = self.duplex.close().await;
        let _ = started.send(Err(error));
    }

    /// Running phase: read loop on this task, writer on its own task.
    async fn run_started(
        self,
        handler: Arc<dyn RequestHandler>,
        max_lifetime: Duration,
        closer: CloseHandle,
        mut close_rx: watch::Receiver<bool>,
        writer_close_rx: watch::Receiver<bool>,
    ) {
        let Session {
            duplex,
            setup: _,
            governor,
            sink,
        } = self;

        let (writer, mut reader) = duplex.split();
        let (out_tx, out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let writer_task = tokio::spawn(write_loop(
            writer,
            out_rx,
            governor,
            closer.clone(),
            writer_close_rx,
        ));

        // Highest client stream id seen so far. Client streams are odd
        // and strictly increasing.
        let mut last_stream: u32 = 0;

        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = close_rx.changed() => break "close requested",
                item = next_frame(&mut reader, max_lifetime) => item,
            };

            let frame = match next {
                Err(_elapsed) => {
                    sink.session_error(&SessionError::LivenessExpired(max_lifetime));
                    let _ = out_tx
                        .send(Frame::error(0, ErrorCode::ConnectionError, "keepalive timeout"))
                        .await;
                    break "liveness expired";
                }
                Ok(None) => break "peer closed",
                Ok(Some(Err(e))) => {
                    sink.session_error(&SessionError::Wire(e));
                    break "decode error";
                }
                Ok(Some(Ok(frame))) => frame,
            };

            counters::frame_received(frame.kind_name());
            let stream_id = frame.stream_id;

            match frame.body {
                FrameBody::Keepalive { respond, data } => {
                    if respond {
                        let _ = out_tx.send(Frame::keepalive(data, false)).await;
                    }
                }
                FrameBody::Request { payload } => {
                    if !admit_stream(&mut last_stream, stream_id, &out_tx).await {
                        continue;
                    }
                    let handler = handler.clone();
                    let sink = sink.clone();
                    let out = out_tx.clone();
                    tokio::spawn(async move {
                        match handler.handle_request(payload).await {
                            Ok(reply) => {
                                let _ = out.send(Frame::response(stream_id, reply)).await;
                            }
                            Err(e) => {
                                sink.session_error(&SessionError::Handler(e.to_string()));
                                let _ = out
                                    .send(Frame::error(
                                        stream_id,
                                        ErrorCode::ApplicationError,
                                        e.to_string(),
                                    ))
                                    .await;
                            }
                        }
                    });
                }
                FrameBody::FireForget { payload } => {
                    if !admit_stream(&mut last_stream, stream_id, &out_tx).await {
                        continue;
                    }
                    let handler = handler.clone();
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_fire_forget(payload).await {
                            sink.session_error(&SessionError::Handler(e.to_string()));
                        }
                    });
                }
                FrameBody::Error { code, message } => {
                    if stream_id == 0 {
                        sink.session_error(&SessionError::Peer { code, message });
                        break "peer error";
                    }
                    warn!(stream = stream_id, code = ?code, %message, "peer stream error");
                }
                FrameBody::Setup { .. } => {
                    sink.session_error(&SessionError::Violation("setup after handshake"));
                    let _ = out_tx
                        .send(Frame::error(0, ErrorCode::ConnectionError, "unexpected setup"))
                        .await;
                    break "protocol violation";
                }
                FrameBody::Response { .. } => {
                    sink.session_error(&SessionError::Violation("response from client"));
                    let _ = out_tx
                        .send(Frame::error(
                            0,
                            ErrorCode::ConnectionError,
                            "unexpected response",
                        ))
                        .await;
                    break "protocol violation";
                }
            }
        };

        debug!(reason, "session closing");
        closer.close();
        drop(out_tx);
        let _ = writer_task.await;
    }
}

/// Validate the first frame of a connection and turn it into SetupInfo.
fn validate_setup(
    frame: Frame,
    peer: Option<std::net::SocketAddr>,
) -> Result<SetupInfo, (SessionError, Frame)> {
    let (version, keepalive_interval_ms, max_lifetime_ms, payload) = match frame.body {
        FrameBody::Setup {
            version,
            keepalive_interval_ms,
            max_lifetime_ms,
            payload,
        } if frame.stream_id == 0 => (version, keepalive_interval_ms, max_lifetime_ms, payload),
        FrameBody::Setup { .. } => {
            return Err((
                SessionError::InvalidSetup("setup on a non-zero stream"),
                Frame::error(0, ErrorCode::InvalidSetup, "setup must use stream 0"),
            ));
        }
        _ => {
            return Err((
                SessionError::InvalidSetup("first frame was not setup"),
                Frame::error(0, ErrorCode::InvalidSetup, "expected setup frame"),
            ));
        }
    };

    if version != PROTOCOL_VERSION {
        return Err((
            SessionError::UnsupportedVersion(version),
            Frame::error(
                0,
                ErrorCode::UnsupportedSetup,
                format!("unsupported version {version}"),
            ),
        ));
    }

    Ok(SetupInfo {
        peer,
        version,
        keepalive_interval: Duration::from_millis(u64::from(keepalive_interval_ms)),
        max_lifetime: Duration::from_millis(u64::from(max_lifetime_ms)),
        metadata: payload.metadata,
        data: payload.data,
    })
}

/// Enforce the client stream id discipline: odd, strictly increasing.
/// Violations are answered with a stream-scoped error so one buggy
/// request does not take the connection down.
async fn admit_stream(last: &mut u32, stream_id: u32, out: &mpsc::Sender<Frame>) -> bool {
    if stream_id % 2 == 1 && stream_id > *last {
        *last = stream_id;
        return true;
    }
    warn!(stream = stream_id, "stream id out of order");
    let _ = out
        .send(Frame::error(
            stream_id,
            ErrorCode::Rejected,
            "stream id out of order",
        ))
        .await;
    false
}

/// Wait for the next inbound frame, bounded by the Setup-declared
/// liveness deadline (zero disables it).
async fn next_frame<S>(
    reader: &mut FrameStream<S>,
    max_lifetime: Duration,
) -> Result<Option<Result<Frame, WireError>>, Elapsed>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if max_lifetime.is_zero() {
        Ok(reader.next().await)
    } else {
        timeout(max_lifetime, reader.next()).await
    }
}

/// Writer task: owns the outbound half, acquires a governor permit per
/// frame, closes the channel when the session ends.
async fn write_loop<S>(
    mut sink: FrameSink<S>,
    mut queue: mpsc::Receiver<Frame>,
    governor: Arc<dyn FlowGovernor>,
    closer: CloseHandle,
    mut close_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            next = queue.recv() => match next {
                Some(frame) => {
                    governor.acquire().await;
                    counters::frame_sent(frame.kind_name());
                    if let Err(e) = sink.send(frame).await {
                        debug!(error = %e, "outbound write failed");
                        // A broken channel ends the whole session.
                        closer.close();
                        break;
                    }
                }
                None => break,
            }
        }
    }

    // Flush frames queued before the close signal. Close is forced, so
    // the governor no longer gates these.
    while let Ok(frame) = queue.try_recv() {
        counters::frame_sent(frame.kind_name());
        if sink.send(frame).await.is_err() {
            break;
        }
    }

    let _ = sink.close().await;
}
