//! Server bootstrap: immutable configuration, bind, accept loop.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, error, info, span, warn, Instrument, Level};

use crate::connection::DuplexConnection;
use crate::session::{
    CloseHandle, ErrorSink, FlowGovernor, LogSink, Session, SetupHandler, UnlimitedGovernor,
};
use crate::telemetry::counters;
use crate::wire::{FrameCodec, MAX_FRAME_LEN};

use super::handle::{HandleState, StartedServer};
use super::lifecycle;

/// Fatal server errors. Everything per-connection is isolated and never
/// surfaces here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("listener setup failed: {0}")]
    Adopt(#[source] io::Error),
}

/// Transport-level knobs, fixed at configuration time and shared
/// read-only by every accepted connection.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upper bound on one encoded frame, both directions.
    pub max_frame_len: usize,
    /// Concurrent connection limit; sockets over it are dropped.
    pub max_connections: usize,
    /// TCP_NODELAY on accepted sockets.
    pub nodelay: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
            max_connections: 10_000,
            nodelay: true,
        }
    }
}

#[derive(Debug, Clone)]
enum BindTarget {
    Addr(SocketAddr),
    Listener(Arc<StdTcpListener>),
}

#[derive(Debug, Clone)]
struct ServerConfig {
    bind: BindTarget,
    options: TransportOptions,
}

/// Unbound server bootstrap.
///
/// Holds an immutable configuration value: `configure_server` produces
/// a new bootstrap and leaves this one untouched, and constructors
/// perform no network I/O. `start` binds the listener and hands back a
/// [`StartedServer`].
#[derive(Debug, Clone)]
pub struct TcpServer {
    config: ServerConfig,
}

impl TcpServer {
    /// Bind target 0.0.0.0 with an ephemeral port.
    pub fn new() -> Self {
        Self::with_port(0)
    }

    /// Bind 0.0.0.0 on the given port (0 requests an ephemeral port).
    pub fn with_port(port: u16) -> Self {
        Self::with_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Bind an explicit local address.
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            config: ServerConfig {
                bind: BindTarget::Addr(addr),
                options: TransportOptions::default(),
            },
        }
    }

    /// Adopt an already-constructed listener instead of binding one.
    pub fn from_listener(listener: StdTcpListener) -> Self {
        Self {
            config: ServerConfig {
                bind: BindTarget::Listener(Arc::new(listener)),
                options: TransportOptions::default(),
            },
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.config.options
    }

    /// Apply a pure transform to the transport options, returning a new
    /// bootstrap. `self` is left unchanged and stays usable.
    pub fn configure_server(
        &self,
        transform: impl FnOnce(TransportOptions) -> TransportOptions,
    ) -> TcpServer {
        let mut config = self.config.clone();
        config.options = transform(config.options);
        TcpServer { config }
    }

    /// Start with the default unlimited governor and logging error sink.
    pub async fn start(&self, setup: Arc<dyn SetupHandler>) -> Result<StartedServer, ServerError> {
        self.start_with(setup, Arc::new(UnlimitedGovernor), Arc::new(LogSink))
            .await
    }

    /// Bind the listener, spawn the accept loop and return the handle.
    /// Bind failure is fatal to this call; no server is produced.
    pub async fn start_with(
        &self,
        setup: Arc<dyn SetupHandler>,
        governor: Arc<dyn FlowGovernor>,
        sink: Arc<dyn ErrorSink>,
    ) -> Result<StartedServer, ServerError> {
        let listener = self.bind_listener().await?;
        let local_addr = listener.local_addr().map_err(ServerError::Adopt)?;
        let options = self.config.options.clone();

        info!(
            address = %local_addr,
            max_connections = options.max_connections,
            max_frame_len = options.max_frame_len,
            "server started"
        );
        counters::server_started();

        let state = Arc::new(watch::channel(HandleState::Running).0);
        // Subscribed here, not inside the spawned task: a receiver
        // created after a send has already marked it seen, so a
        // shutdown issued before the accept loop first polls would
        // otherwise be lost.
        let state_rx = state.subscribe();
        let acceptor = Acceptor {
            listener,
            options,
            setup,
            governor,
            sink,
            limit: Arc::new(Semaphore::new(self.config.options.max_connections)),
            next_id: AtomicU64::new(1),
            connections: Arc::new(RwLock::new(HashMap::new())),
            state: state.clone(),
            state_rx,
        };
        tokio::spawn(acceptor.run());

        Ok(StartedServer::new(local_addr, state))
    }

    async fn bind_listener(&self) -> Result<TcpListener, ServerError> {
        match &self.config.bind {
            BindTarget::Addr(addr) => {
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| ServerError::Bind {
                        addr: *addr,
                        source: e,
                    })
            }
            BindTarget::Listener(listener) => {
                let cloned = listener.try_clone().map_err(ServerError::Adopt)?;
                cloned.set_nonblocking(true).map_err(ServerError::Adopt)?;
                TcpListener::from_std(cloned).map_err(ServerError::Adopt)
            }
        }
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accept loop state. Owns the listener and the registry of in-flight
/// connection close handles.
struct Acceptor {
    listener: TcpListener,
    options: TransportOptions,
    setup: Arc<dyn SetupHandler>,
    governor: Arc<dyn FlowGovernor>,
    sink: Arc<dyn ErrorSink>,
    limit: Arc<Semaphore>,
    next_id: AtomicU64,
    connections: Arc<RwLock<HashMap<ConnectionId, CloseHandle>>>,
    state: Arc<watch::Sender<HandleState>>,
    state_rx: watch::Receiver<HandleState>,
}

impl Acceptor {
    async fn run(self) {
        // Cloning keeps the receiver's seen version, so transitions
        // published before this task ran still wake `changed`.
        let mut state_rx = self.state_rx.clone();

        loop {
            tokio::select! {
                biased;

                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow_and_update() != HandleState::Running {
                        info!("accept loop stopping");
                        break;
                    }
                }

                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => self.handle_accept(stream, peer).await,
                    Err(e) => {
                        error!(error = %e, "accept error");
                        counters::accept_error();
                    }
                }
            }
        }

        // Forced teardown: tell every in-flight connection to close.
        self.close_connections().await;
        let _ = self.state.send(HandleState::Stopped);
        info!("server stopped");
    }

    /// Per accepted connection. The only await here is the registry
    /// insert; all connection waiting happens on the spawned lifecycle
    /// task.
    async fn handle_accept(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match self.limit.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(peer = %peer, "connection limit reached, dropping");
                counters::connection_rejected("limit");
                return;
            }
        };

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let span = span!(Level::INFO, "conn", id = %id, peer = %peer);

        if self.options.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                error!(parent: &span, error = %e, "socket configuration failed");
                return;
            }
        }

        debug!(parent: &span, "connection accepted");
        counters::connection_accepted();

        let codec = FrameCodec::new(self.options.max_frame_len);
        let duplex = DuplexConnection::new(stream, codec).with_peer(peer);
        let session = Session::server(
            duplex,
            self.setup.clone(),
            self.governor.clone(),
            self.sink.clone(),
        );
        let handle = session.start();

        // Registered before the lifecycle task exists, so a forced
        // teardown snapshotting the registry can never miss a
        // connection whose task has not run yet.
        let closer = handle.closer.clone();
        self.connections.write().await.insert(id, closer);
        let connections = self.connections.clone();

        tokio::spawn(
            async move {
                // The composed lifecycle signal: a handshake failure is
                // its own terminal outcome, distinct from a normal
                // operation-until-close.
                match lifecycle::drive(handle).await {
                    Ok(()) => {
                        debug!("connection closed");
                        counters::connection_closed("closed");
                    }
                    Err(e) => {
                        info!(error = %e, "handshake failed");
                        counters::connection_closed("handshake_failed");
                    }
                }

                connections.write().await.remove(&id);
                drop(permit);
            }
            .instrument(span),
        );
    }

    async fn close_connections(&self) {
        let closers: Vec<CloseHandle> = {
            let connections = self.connections.read().await;
            connections.values().cloned().collect()
        };
        if closers.is_empty() {
            return;
        }

        info!(count = closers.len(), "closing active connections");
        for closer in closers {
            closer.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    use crate::session::{RequestHandler, SetupInfo, SetupRejected};
    use crate::wire::Payload;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle_request(&self, request: Payload) -> anyhow::Result<Payload> {
            Ok(request)
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl SetupHandler for AcceptAll {
        async fn accept(
            &self,
            _setup: SetupInfo,
        ) -> Result<Arc<dyn RequestHandler>, SetupRejected> {
            Ok(Arc::new(Echo))
        }
    }

    #[test]
    fn constructors_set_the_bind_target_without_io() {
        match TcpServer::with_port(2775).config.bind {
            BindTarget::Addr(addr) => assert_eq!(addr.port(), 2775),
            other => panic!("unexpected target: {other:?}"),
        }

        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        match TcpServer::with_addr(addr).config.bind {
            BindTarget::Addr(seen) => assert_eq!(seen, addr),
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[test]
    fn configure_server_is_pure() {
        let server = TcpServer::new();
        let tuned = server.configure_server(|mut options| {
            options.max_frame_len = 1024;
            options.max_connections = 8;
            options
        });

        assert_eq!(server.options().max_frame_len, MAX_FRAME_LEN);
        assert_eq!(server.options().max_connections, 10_000);
        assert_eq!(tuned.options().max_frame_len, 1024);
        assert_eq!(tuned.options().max_connections, 8);
    }

    #[test]
    fn configure_server_chains() {
        let server = TcpServer::new()
            .configure_server(|mut o| {
                o.max_frame_len = 512;
                o
            })
            .configure_server(|mut o| {
                o.nodelay = false;
                o
            });
        assert_eq!(server.options().max_frame_len, 512);
        assert!(!server.options().nodelay);
    }

    #[tokio::test]
    async fn accepted_connections_register_before_their_task_first_runs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(watch::channel(HandleState::Running).0);
        let acceptor = Acceptor {
            listener,
            options: TransportOptions::default(),
            setup: Arc::new(AcceptAll),
            governor: Arc::new(UnlimitedGovernor),
            sink: Arc::new(LogSink),
            limit: Arc::new(Semaphore::new(4)),
            next_id: AtomicU64::new(1),
            connections: Arc::new(RwLock::new(HashMap::new())),
            state_rx: state.subscribe(),
            state,
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = acceptor.listener.accept().await.unwrap();
        acceptor.handle_accept(stream, peer).await;

        // On the current-thread test runtime the lifecycle task has not
        // been polled yet; the close handle must already be visible to
        // a forced teardown.
        assert_eq!(acceptor.connections.read().await.len(), 1);

        acceptor.close_connections().await;
        let read = timeout(Duration::from_secs(5), client.read(&mut [0u8; 8]))
            .await
            .expect("session must observe the forced close")
            .unwrap();
        assert_eq!(read, 0, "peer must see the channel closed");
    }
}
