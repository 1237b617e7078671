//! Server lifecycle integration tests over real sockets.
//!
//! Every server binds port 0 so tests can run in parallel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use duplexd::server::{StartedServer, TcpServer};
use duplexd::session::{RequestHandler, SetupHandler, SetupInfo, SetupRejected};
use duplexd::wire::{ErrorCode, Frame, FrameBody, FrameCodec, Payload};

type Client = Framed<TcpStream, FrameCodec>;

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
    async fn accept(&self, _setup: SetupInfo) -> Result<Arc<dyn RequestHandler>, SetupRejected> {
        Ok(Arc::new(Echo))
    }
}

struct RejectAll;

#[async_trait]
impl SetupHandler for RejectAll {
    async fn accept(&self, _setup: SetupInfo) -> Result<Arc<dyn RequestHandler>, SetupRejected> {
        Err(SetupRejected::new("go away"))
    }
}

/// Rejects setups whose metadata reads "bad", accepts everything else.
struct MetadataGate;

#[async_trait]
impl SetupHandler for MetadataGate {
    async fn accept(&self, setup: SetupInfo) -> Result<Arc<dyn RequestHandler>, SetupRejected> {
        if setup.metadata.as_deref() == Some(b"bad") {
            return Err(SetupRejected::new("bad metadata"));
        }
        Ok(Arc::new(Echo))
    }
}

async fn start_server(setup: Arc<dyn SetupHandler>) -> StartedServer {
    TcpServer::with_port(0).start(setup).await.unwrap()
}

async fn connect(server: &StartedServer) -> Client {
    let addr = format!("127.0.0.1:{}", server.local_port());
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, FrameCodec::default())
}

async fn next_frame(client: &mut Client) -> Frame {
    timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended unexpectedly")
        .expect("decode error")
}

#[tokio::test]
async fn ephemeral_port_is_resolved() {
    let server = start_server(Arc::new(AcceptAll)).await;
    assert!(server.local_port() > 0);
    server.shutdown();
    server.await_shutdown().await;
}

#[tokio::test]
async fn configure_server_leaves_the_original_usable() {
    let original = TcpServer::with_port(0);
    let tuned = original.configure_server(|mut options| {
        options.max_frame_len = 4096;
        options
    });

    assert_ne!(original.options().max_frame_len, 4096);
    assert_eq!(tuned.options().max_frame_len, 4096);

    // Both bootstraps still start independently.
    let a = original.start(Arc::new(AcceptAll)).await.unwrap();
    let b = tuned.start(Arc::new(AcceptAll)).await.unwrap();
    assert_ne!(a.local_port(), b.local_port());

    a.shutdown();
    b.shutdown();
    a.await_shutdown().await;
    b.await_shutdown().await;
}

#[tokio::test]
async fn accepted_session_echoes_through_the_pipeline() {
    let server = start_server(Arc::new(AcceptAll)).await;
    let mut client = connect(&server).await;

    client
        .send(Frame::setup(0, 0, Payload::with_metadata("tok", "hello")))
        .await
        .unwrap();
    client
        .send(Frame::request(1, Payload::new("round trip")))
        .await
        .unwrap();

    let reply = next_frame(&mut client).await;
    assert_eq!(reply, Frame::response(1, Payload::new("round trip")));

    client.send(Frame::keepalive("ka", true)).await.unwrap();
    let echo = next_frame(&mut client).await;
    assert_eq!(echo, Frame::keepalive("ka", false));

    server.shutdown();
    server.await_shutdown().await;
}

#[tokio::test]
async fn rejected_setup_is_answered_and_closed() {
    let server = start_server(Arc::new(RejectAll)).await;
    let mut client = connect(&server).await;

    client.send(Frame::setup(0, 0, Payload::default())).await.unwrap();

    let frame = next_frame(&mut client).await;
    match frame.body {
        FrameBody::Error { code, message } => {
            assert_eq!(code, ErrorCode::RejectedSetup);
            assert_eq!(message, "go away");
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    // The server closes the channel after the reject.
    let eof = timeout(Duration::from_secs(5), client.next()).await.unwrap();
    assert!(eof.is_none());

    server.shutdown();
    server.await_shutdown().await;
}

#[tokio::test]
async fn handshake_failure_does_not_disturb_other_connections() {
    let server = start_server(Arc::new(MetadataGate)).await;

    let mut good = connect(&server).await;
    let mut bad = connect(&server).await;

    good.send(Frame::setup(0, 0, Payload::with_metadata("ok", "")))
        .await
        .unwrap();
    bad.send(Frame::setup(0, 0, Payload::with_metadata("bad", "")))
        .await
        .unwrap();

    // The bad connection is rejected and closed...
    let frame = next_frame(&mut bad).await;
    assert!(matches!(
        frame.body,
        FrameBody::Error {
            code: ErrorCode::RejectedSetup,
            ..
        }
    ));
    let eof = timeout(Duration::from_secs(5), bad.next()).await.unwrap();
    assert!(eof.is_none());

    // ...while the good one keeps serving requests.
    good.send(Frame::request(1, Payload::new("still here")))
        .await
        .unwrap();
    let reply = next_frame(&mut good).await;
    assert_eq!(reply, Frame::response(1, Payload::new("still here")));

    server.shutdown();
    server.await_shutdown().await;
}

#[tokio::test]
async fn shutdown_unblocks_concurrent_waiters() {
    let server = Arc::new(start_server(Arc::new(AcceptAll)).await);

    let mut waiters = Vec::new();
    for _ in 0..4 {
        let server = server.clone();
        waiters.push(tokio::spawn(async move {
            server.await_shutdown().await;
        }));
    }

    server.shutdown();
    for waiter in waiters {
        timeout(Duration::from_secs(5), waiter)
            .await
            .expect("await_shutdown must unblock after shutdown")
            .unwrap();
    }
}

#[tokio::test]
async fn shutdown_issued_right_after_start_is_observed() {
    let server = start_server(Arc::new(AcceptAll)).await;

    // No await between start and shutdown: on the current-thread test
    // runtime the accept task has not been polled yet, so the
    // transition must not be lost.
    server.shutdown();

    timeout(Duration::from_secs(5), server.await_shutdown())
        .await
        .expect("await_shutdown must unblock after an immediate shutdown");
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let server = start_server(Arc::new(AcceptAll)).await;
    server.shutdown();
    server.shutdown();
    timeout(Duration::from_secs(5), server.await_shutdown())
        .await
        .unwrap();
    // Still a no-op after the server stopped.
    server.shutdown();
}

#[tokio::test]
async fn shutdown_forces_in_flight_connections_closed() {
    let server = start_server(Arc::new(AcceptAll)).await;
    let mut client = connect(&server).await;

    client.send(Frame::setup(0, 0, Payload::default())).await.unwrap();
    client.send(Frame::request(1, Payload::new("warm"))).await.unwrap();
    let reply = next_frame(&mut client).await;
    assert_eq!(reply.stream_id, 1);

    server.shutdown();
    server.await_shutdown().await;

    // The established connection is torn down, not drained.
    let eof = timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(eof.is_ok(), "connection must close after forced shutdown");
}

#[tokio::test]
async fn unlimited_governor_never_stalls_sequential_traffic() {
    let server = start_server(Arc::new(AcceptAll)).await;
    let mut client = connect(&server).await;

    client.send(Frame::setup(0, 0, Payload::default())).await.unwrap();

    timeout(Duration::from_secs(60), async {
        for i in 0..10_000u32 {
            let stream_id = i * 2 + 1;
            client
                .send(Frame::request(stream_id, Payload::new("m")))
                .await
                .unwrap();
            let reply = client.next().await.unwrap().unwrap();
            assert_eq!(reply.stream_id, stream_id);
            assert!(matches!(reply.body, FrameBody::Response { .. }));
        }
    })
    .await
    .expect("10k sequential messages must not stall under the default governor");

    server.shutdown();
    server.await_shutdown().await;
}

#[tokio::test]
async fn bind_failure_is_fatal_to_start() {
    let first = start_server(Arc::new(AcceptAll)).await;
    let taken = format!("127.0.0.1:{}", first.local_port());

    let clash = TcpServer::with_addr(taken.parse().unwrap());
    assert!(clash.start(Arc::new(AcceptAll)).await.is_err());

    first.shutdown();
    first.await_shutdown().await;
}

#[tokio::test]
async fn adopted_listener_is_served() {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = std_listener.local_addr().unwrap().port();

    let server = TcpServer::from_listener(std_listener)
        .start(Arc::new(AcceptAll))
        .await
        .unwrap();
    assert_eq!(server.local_port(), port);

    let mut client = connect(&server).await;
    client.send(Frame::setup(0, 0, Payload::default())).await.unwrap();
    client.send(Frame::request(1, Payload::new("hi"))).await.unwrap();
    let reply = next_frame(&mut client).await;
    assert_eq!(reply, Frame::response(1, Payload::new("hi")));

    server.shutdown();
    server.await_shutdown().await;
}
