//! In-process lifecycle tests: real sockets in a TempDir, the daemon running
//! as a local task.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harbor_core::framing::{Framing, LengthPrefixed, MessageDecoder};
use harbor_daemon::{Daemon, DaemonError, SessionHandle, SocketHandler};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

const TICK: Duration = Duration::from_secs(2);

struct TestClient {
    stream: UnixStream,
    decoder: Box<dyn MessageDecoder>,
    pending: VecDeque<Vec<u8>>,
}

impl TestClient {
    async fn connect(path: &Path) -> Self {
        let stream = timeout(TICK, UnixStream::connect(path))
            .await
            .expect("connect in time")
            .expect("connect");
        Self {
            stream,
            decoder: LengthPrefixed.decoder(),
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, payload: &[u8]) {
        let frame = LengthPrefixed.encode(payload).expect("encode");
        self.stream.write_all(&frame).await.expect("write frame");
    }

    /// Next complete message, or `None` on EOF.
    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }
            let mut buf = [0u8; 4096];
            let n = timeout(TICK, self.stream.read(&mut buf))
                .await
                .expect("read in time")
                .expect("read");
            if n == 0 {
                return None;
            }
            self.pending
                .extend(self.decoder.feed(&buf[..n]).expect("decode"));
        }
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

struct EchoHandler;

#[async_trait]
impl SocketHandler for EchoHandler {
    async fn on_message(&self, session: &SessionHandle, message: Vec<u8>) -> anyhow::Result<()> {
        session.write(&message).await?;
        Ok(())
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let sock = dir.path().join("echo.sock");

    let mut daemon = Daemon::setup("echo-test", None, None, ()).expect("setup");
    daemon
        .add_unix(&sock, Arc::new(EchoHandler))
        .expect("add_unix");
    let run = tokio::spawn(daemon.run(None));

    let mut client = TestClient::connect(&sock).await;
    client.send(b"hello").await;
    assert_eq!(client.recv().await.as_deref(), Some(&b"hello"[..]));

    run.abort();
}

/// Rejects the first connection, accepts and echoes on later ones.
struct GateHandler {
    gate: AtomicBool,
    messages: AtomicUsize,
}

#[async_trait]
impl SocketHandler for GateHandler {
    fn on_connect(&self, _session: &SessionHandle) -> bool {
        self.gate.swap(true, Ordering::SeqCst)
    }

    async fn on_message(&self, session: &SessionHandle, message: Vec<u8>) -> anyhow::Result<()> {
        self.messages.fetch_add(1, Ordering::SeqCst);
        session.write(&message).await?;
        Ok(())
    }
}

#[tokio::test]
async fn rejected_connection_sees_eof_and_listener_keeps_serving() {
    let dir = TempDir::new().expect("tempdir");
    let sock = dir.path().join("gate.sock");

    let handler = Arc::new(GateHandler {
        gate: AtomicBool::new(false),
        messages: AtomicUsize::new(0),
    });

    let mut daemon = Daemon::setup("gate-test", None, None, ()).expect("setup");
    daemon.add_unix(&sock, handler.clone()).expect("add_unix");
    let run = tokio::spawn(daemon.run(None));

    // First connection is rejected: immediate EOF, no message dispatched.
    let mut rejected = TestClient::connect(&sock).await;
    assert_eq!(rejected.recv().await, None);

    // The accept loop is still alive and serves the next client.
    let mut accepted = TestClient::connect(&sock).await;
    accepted.send(b"ping").await;
    assert_eq!(accepted.recv().await.as_deref(), Some(&b"ping"[..]));
    assert_eq!(handler.messages.load(Ordering::SeqCst), 1);

    run.abort();
}

struct CountingHandler {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

#[async_trait]
impl SocketHandler for CountingHandler {
    fn on_connect(&self, _session: &SessionHandle) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn on_disconnect(&self, _session: &SessionHandle) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&self, _session: &SessionHandle, _message: Vec<u8>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn disconnect_fires_exactly_once_per_session() {
    let dir = TempDir::new().expect("tempdir");
    let sock = dir.path().join("count.sock");

    let handler = Arc::new(CountingHandler {
        connects: AtomicUsize::new(0),
        disconnects: AtomicUsize::new(0),
    });

    let mut daemon = Daemon::setup("count-test", None, None, ()).expect("setup");
    daemon.add_unix(&sock, handler.clone()).expect("add_unix");
    let run = tokio::spawn(daemon.run(None));

    // Peer-disconnect path.
    let client = TestClient::connect(&sock).await;
    drop(client);
    wait_until("first disconnect", || {
        handler.disconnects.load(Ordering::SeqCst) == 1
    })
    .await;

    // Teardown path: a session still open when the run future is cancelled.
    let _open = TestClient::connect(&sock).await;
    wait_until("second connect", || {
        handler.connects.load(Ordering::SeqCst) == 2
    })
    .await;

    run.abort();
    wait_until("teardown disconnect", || {
        handler.disconnects.load(Ordering::SeqCst) == 2
    })
    .await;

    assert_eq!(handler.connects.load(Ordering::SeqCst), 2);
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 2);
}

/// Records arrival order and flags any overlapping dispatch.
struct SlowHandler {
    log: Mutex<Vec<Vec<u8>>>,
    in_flight: AtomicBool,
    overlapped: AtomicBool,
}

#[async_trait]
impl SocketHandler for SlowHandler {
    async fn on_message(&self, _session: &SessionHandle, message: Vec<u8>) -> anyhow::Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.log
            .lock()
            .expect("handler log lock")
            .push(message);
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn messages_are_dispatched_in_order_one_at_a_time() {
    let dir = TempDir::new().expect("tempdir");
    let sock = dir.path().join("order.sock");

    let handler = Arc::new(SlowHandler {
        log: Mutex::new(Vec::new()),
        in_flight: AtomicBool::new(false),
        overlapped: AtomicBool::new(false),
    });

    let mut daemon = Daemon::setup("order-test", None, None, ()).expect("setup");
    daemon.add_unix(&sock, handler.clone()).expect("add_unix");
    let run = tokio::spawn(daemon.run(None));

    // All three frames land in one write, ahead of any handler completion.
    let mut client = TestClient::connect(&sock).await;
    let mut burst = Vec::new();
    for payload in [&b"first"[..], b"second", b"third"] {
        burst.extend_from_slice(&LengthPrefixed.encode(payload).expect("encode"));
    }
    client.stream.write_all(&burst).await.expect("write burst");

    wait_until("all messages handled", || {
        handler.log.lock().expect("handler log lock").len() == 3
    })
    .await;

    let log = handler.log.lock().expect("handler log lock");
    assert_eq!(*log, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
    assert!(
        !handler.overlapped.load(Ordering::SeqCst),
        "a message was dispatched while the previous one was in flight"
    );

    run.abort();
}

/// Echoes with a fixed prefix so replies identify their listener.
struct TagHandler(&'static [u8]);

#[async_trait]
impl SocketHandler for TagHandler {
    async fn on_message(&self, session: &SessionHandle, message: Vec<u8>) -> anyhow::Result<()> {
        let mut reply = self.0.to_vec();
        reply.extend_from_slice(&message);
        session.write(&reply).await?;
        Ok(())
    }
}

#[tokio::test]
async fn two_listeners_serve_independent_traffic() {
    let dir = TempDir::new().expect("tempdir");
    let sock_a = dir.path().join("a.sock");
    let sock_b = dir.path().join("b.sock");

    let mut daemon = Daemon::setup("multi-test", None, None, ()).expect("setup");
    daemon
        .add_unix(&sock_a, Arc::new(TagHandler(b"a:")))
        .expect("add_unix a");
    daemon
        .add_unix(&sock_b, Arc::new(TagHandler(b"b:")))
        .expect("add_unix b");
    let run = tokio::spawn(daemon.run(None));

    let mut client_a = TestClient::connect(&sock_a).await;
    let mut client_b = TestClient::connect(&sock_b).await;

    client_a.send(b"one").await;
    client_b.send(b"two").await;

    assert_eq!(client_a.recv().await.as_deref(), Some(&b"a:one"[..]));
    assert_eq!(client_b.recv().await.as_deref(), Some(&b"b:two"[..]));

    run.abort();
}

#[tokio::test]
async fn oversize_socket_path_is_rejected_before_bind() {
    let dir = TempDir::new().expect("tempdir");
    let long = dir.path().join("a".repeat(150));

    let mut daemon = Daemon::setup("path-test", None, None, ()).expect("setup");
    let err = daemon
        .add_unix(&long, Arc::new(EchoHandler))
        .expect_err("oversize path must be rejected");
    assert!(
        matches!(err, DaemonError::SocketPathTooLong { .. }),
        "got: {err}"
    );
    assert!(!long.exists(), "no socket file may be created");
}

struct FailingHandler {
    disconnects: AtomicUsize,
}

#[async_trait]
impl SocketHandler for FailingHandler {
    fn on_disconnect(&self, _session: &SessionHandle) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&self, _session: &SessionHandle, _message: Vec<u8>) -> anyhow::Result<()> {
        anyhow::bail!("handler rejects everything")
    }
}

#[tokio::test]
async fn handler_failure_destroys_only_that_session() {
    let dir = TempDir::new().expect("tempdir");
    let sock = dir.path().join("fail.sock");

    let handler = Arc::new(FailingHandler {
        disconnects: AtomicUsize::new(0),
    });

    let mut daemon = Daemon::setup("fail-test", None, None, ()).expect("setup");
    daemon.add_unix(&sock, handler.clone()).expect("add_unix");
    let run = tokio::spawn(daemon.run(None));

    let mut client = TestClient::connect(&sock).await;
    client.send(b"boom").await;
    assert_eq!(client.recv().await, None, "failed session should close");
    wait_until("disconnect after handler failure", || {
        handler.disconnects.load(Ordering::SeqCst) == 1
    })
    .await;

    // The listener survives the session's failure.
    let mut next = TestClient::connect(&sock).await;
    next.send(b"again").await;
    assert_eq!(next.recv().await, None);

    run.abort();
}

#[tokio::test]
async fn watched_pid_gone_runs_full_shutdown() {
    let dir = TempDir::new().expect("tempdir");
    let sock = dir.path().join("watched.sock");

    let mut daemon = Daemon::setup("watch-test", None, None, ()).expect("setup");
    daemon
        .add_unix(&sock, Arc::new(EchoHandler))
        .expect("add_unix");

    let mut child = tokio::process::Command::new("sleep")
        .arg("1")
        .spawn()
        .expect("spawn short-lived child");
    let pid = child.id().expect("child pid") as i32;

    // Reap the child so the zero-signal probe sees ESRCH, not a zombie.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    let result = timeout(Duration::from_secs(15), daemon.run(Some(pid)))
        .await
        .expect("run should end after the watched pid exits");

    match result {
        Err(DaemonError::WatchedPidGone { pid: gone }) => assert_eq!(gone, pid),
        other => panic!("expected WatchedPidGone, got: {other:?}"),
    }
    assert!(!sock.exists(), "shutdown must unlink the socket path");
}

#[test]
fn pid_file_daemon_replaces_stale_socket() {
    let dir = TempDir::new().expect("tempdir");
    let sock = dir.path().join("stale.sock");
    let pid_path = dir.path().join("daemon.pid");

    // A crashed predecessor left a socket file behind.
    std::fs::write(&sock, b"").expect("create stale file");

    let mut daemon = Daemon::setup("stale-test", None, Some(pid_path.as_path()), ()).expect("setup");
    daemon
        .add_unix(&sock, Arc::new(EchoHandler))
        .expect("add_unix must replace the stale socket");
    assert!(sock.exists());
}
