//! Integration tests for the client against a fake daemon.
//!
//! Each test binds a Unix socket in a temp dir, points the client at it and
//! plays the daemon side by hand: reading request heads and writing raw
//! HTTP responses, sometimes split into tiny fragments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_client::{
    ApiCall, ApiMessage, Client, ClientConfig, ClientEvent, ClientHandle, Health, PollPolicy,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

const INFO_BODY: &str = r#"{"ID":"7TRN:IPZB","Containers":2,"ContainersRunning":1,"ContainersPaused":0,"ContainersStopped":1,"Images":4}"#;

const LIST_BODY: &str = r#"[{"Id":"8dfafdbc3a40","Names":["/web"],"Image":"nginx","ImageID":"sha256:1","State":"running","Created":1522000000},{"Id":"9cd87474be90","Names":["/db"],"Image":"postgres","ImageID":"sha256:2","State":"exited","Created":1522000100}]"#;

struct FakeDaemon {
    _dir: TempDir,
    path: PathBuf,
}

impl FakeDaemon {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.sock");
        Self { _dir: dir, path }
    }

    fn bind(&self) -> UnixListener {
        UnixListener::bind(&self.path).unwrap()
    }

    fn config(&self) -> ClientConfig {
        config_for(&self.path)
    }
}

fn config_for(path: &Path) -> ClientConfig {
    ClientConfig {
        socket_path: path.to_path_buf(),
        poll_interval_ms: 60_000,
        reconnect_backoff_ms: 20,
        max_reconnect_backoff_ms: 40,
        ..ClientConfig::default()
    }
}

/// Daemon side of one accepted connection
struct DaemonConn {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl DaemonConn {
    async fn accept(listener: &UnixListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("timed out waiting for client connection")
            .unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    /// Request line of the next request head, or `None` on EOF.
    async fn next_request(&mut self) -> Option<String> {
        loop {
            if let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head: Vec<u8> = self.buf.drain(..end + 4).collect();
                let head = String::from_utf8(head).unwrap();
                assert!(head.contains("\r\nHost: localhost\r\n"), "{head:?}");
                assert!(head.contains("\r\nConnection: keep-alive\r\n"), "{head:?}");
                return head.lines().next().map(ToString::to_string);
            }

            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return None;
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn expect_request(&mut self, line: &str) {
        let request = timeout(WAIT, self.next_request())
            .await
            .expect("timed out waiting for request")
            .expect("client closed the connection");
        assert_eq!(request, line);
    }

    async fn respond(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn respond_fragmented(&mut self, bytes: &[u8], size: usize) {
        for piece in bytes.chunks(size) {
            self.respond(piece).await;
            tokio::task::yield_now().await;
        }
    }

    /// Answer the info and list requests every session starts with.
    async fn serve_initial(&mut self) {
        self.expect_request("GET /v1.30/info HTTP/1.1").await;
        self.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
            .await;
        self.respond(&json_response(INFO_BODY)).await;
        self.respond(&json_response(LIST_BODY)).await;
    }
}

fn json_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

async fn next_event(client: &mut ClientHandle) -> ClientEvent {
    timeout(WAIT, client.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client task stopped")
}

async fn expect_connected(client: &mut ClientHandle) {
    assert_eq!(
        next_event(client).await,
        ClientEvent::Health(Health::Connected)
    );
}

async fn expect_initial_messages(client: &mut ClientHandle) {
    assert!(matches!(
        next_event(client).await,
        ClientEvent::Message(ApiMessage::Info(_))
    ));
    assert!(matches!(
        next_event(client).await,
        ClientEvent::Message(ApiMessage::ResourceList { .. })
    ));
}

#[tokio::test]
async fn test_connect_issues_info_and_list() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;

    conn.expect_request("GET /v1.30/info HTTP/1.1").await;
    conn.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
        .await;

    conn.respond_fragmented(&json_response(INFO_BODY), 1).await;
    conn.respond_fragmented(&json_response(LIST_BODY), 7).await;

    let ClientEvent::Message(ApiMessage::Info(info)) = next_event(&mut client).await else {
        panic!("expected info first");
    };
    assert_eq!(info.id, "7TRN:IPZB");
    assert_eq!(info.containers_running, 1);

    let ClientEvent::Message(ApiMessage::ResourceList { resources }) =
        next_event(&mut client).await
    else {
        panic!("expected resource list second");
    };
    let names: Vec<&str> = resources.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["web", "db"]);
    assert!(resources[0].is_active());

    client.disconnect().await;
}

#[tokio::test]
async fn test_pipelined_responses_in_one_write() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;
    conn.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
        .await;

    let mut both = json_response(INFO_BODY);
    both.extend_from_slice(&json_response(LIST_BODY));
    conn.respond(&both).await;

    expect_initial_messages(&mut client).await;
    client.disconnect().await;
}

#[tokio::test]
async fn test_chunked_list_is_reassembled() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;
    conn.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
        .await;
    conn.respond(&json_response(INFO_BODY)).await;

    let (first, second) = LIST_BODY.split_at(LIST_BODY.len() / 2);
    let chunked = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n\
         {:x}\r\n{first}\r\n{:x}\r\n{second}\r\n0\r\n\r\n",
        first.len(),
        second.len()
    );
    conn.respond_fragmented(chunked.as_bytes(), 7).await;

    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Message(ApiMessage::Info(_))
    ));
    match next_event(&mut client).await {
        ClientEvent::Message(ApiMessage::ResourceList { resources }) => {
            let names: Vec<&str> = resources.iter().map(|r| r.name()).collect();
            assert_eq!(names, ["web", "db"]);
        }
        other => panic!("expected one ResourceList, got {other:?}"),
    }
    client.disconnect().await;
}

#[tokio::test]
async fn test_not_modified_does_not_swallow_next_response() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.serve_initial().await;
    expect_initial_messages(&mut client).await;

    client.send(ApiCall::Start("web".to_string())).unwrap();
    client.send(ApiCall::Info).unwrap();
    conn.expect_request("POST /v1.30/containers/web/start HTTP/1.1")
        .await;
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;

    let mut both = b"HTTP/1.1 304 Not Modified\r\nApi-Version: 1.43\r\n\r\n".to_vec();
    both.extend_from_slice(&json_response(INFO_BODY));
    conn.respond_fragmented(&both, 5).await;

    match next_event(&mut client).await {
        ClientEvent::Failed(signal) => {
            assert_eq!(signal.status, 304);
            assert!(signal.body.is_empty());
        }
        other => panic!("expected 304 signal, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Message(ApiMessage::Info(_))
    ));
    client.disconnect().await;
}

#[tokio::test]
async fn test_action_success_refreshes_list() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.serve_initial().await;
    expect_initial_messages(&mut client).await;

    client.send(ApiCall::Start("9cd87474be90".to_string())).unwrap();
    conn.expect_request("POST /v1.30/containers/9cd87474be90/start HTTP/1.1")
        .await;
    conn.respond(b"HTTP/1.1 204 No Content\r\n\r\n").await;

    assert_eq!(
        next_event(&mut client).await,
        ClientEvent::Message(ApiMessage::NoContent)
    );
    conn.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
        .await;

    client.send(ApiCall::Delete("web".to_string())).unwrap();
    conn.expect_request("DELETE /v1.30/containers/web HTTP/1.1")
        .await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_server_error_surfaces_body() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.serve_initial().await;
    expect_initial_messages(&mut client).await;

    client.send(ApiCall::Stop("web".to_string())).unwrap();
    conn.expect_request("POST /v1.30/containers/web/stop HTTP/1.1")
        .await;
    let body = r#"{"message":"cannot stop container: web"}"#;
    conn.respond(
        format!(
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        )
        .as_bytes(),
    )
    .await;

    let ClientEvent::Failed(signal) = next_event(&mut client).await else {
        panic!("expected error signal");
    };
    assert_eq!(signal.status, 500);
    assert_eq!(signal.body, body);
    assert_eq!(signal.message(), "cannot stop container: web");

    client.disconnect().await;
}

#[tokio::test]
async fn test_malformed_stream_keeps_session() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;

    conn.respond(b"SPDY/3 200 OK\r\n\r\n").await;
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Malformed { .. }
    ));

    conn.respond(&json_response(INFO_BODY)).await;
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Message(ApiMessage::Info(_))
    ));

    client.disconnect().await;
}

#[tokio::test]
async fn test_unavailable_daemon_rejects_actions() {
    let daemon = FakeDaemon::new();
    let config = ClientConfig {
        reconnect_backoff_ms: 10_000,
        max_reconnect_backoff_ms: 10_000,
        ..daemon.config()
    };
    let mut client = Client::spawn(config);

    let ClientEvent::Health(Health::Disconnected { reason }) = next_event(&mut client).await
    else {
        panic!("expected disconnected health");
    };
    assert!(reason.contains("daemon.sock"), "{reason}");

    client.send(ApiCall::Start("web".to_string())).unwrap();
    let ClientEvent::ActionRejected { action, reason } = next_event(&mut client).await else {
        panic!("expected rejected action");
    };
    assert_eq!(action, ApiCall::Start("web".to_string()));
    assert_eq!(reason, "Not connected");

    client.disconnect().await;
}

#[tokio::test]
async fn test_connects_once_daemon_appears() {
    let daemon = FakeDaemon::new();
    let mut client = Client::spawn(daemon.config());

    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Health(Health::Disconnected { .. })
    ));

    let listener = daemon.bind();
    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.serve_initial().await;
    expect_initial_messages(&mut client).await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_reconnects_after_daemon_drops_connection() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut first = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    first.serve_initial().await;
    expect_initial_messages(&mut client).await;

    // Half a response, then hang up; the fragment must never surface.
    first
        .respond(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n{\"ID\":")
        .await;
    drop(first);

    let ClientEvent::Health(Health::Disconnected { reason }) = next_event(&mut client).await
    else {
        panic!("expected disconnect");
    };
    assert!(reason.contains("closed"), "{reason}");

    let mut second = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    second.serve_initial().await;
    expect_initial_messages(&mut client).await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_interval_policy_polls_without_responses() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let config = ClientConfig {
        poll_interval_ms: 100,
        poll_policy: PollPolicy::Interval,
        ..daemon.config()
    };
    let mut client = Client::spawn(config);

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;
    conn.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
        .await;

    // Nothing answered, the ticker still fires.
    for _ in 0..2 {
        conn.expect_request("GET /v1.30/info HTTP/1.1").await;
        conn.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
            .await;
    }

    client.disconnect().await;
}

#[tokio::test]
async fn test_after_success_policy_rearms_on_info() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let config = ClientConfig {
        poll_interval_ms: 100,
        poll_policy: PollPolicy::AfterSuccess,
        poll_resources: false,
        ..daemon.config()
    };
    let mut client = Client::spawn(config);

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.serve_initial().await;
    expect_initial_messages(&mut client).await;

    conn.expect_request("GET /v1.30/info HTTP/1.1").await;
    conn.respond(&json_response(INFO_BODY)).await;
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_after_success_policy_stalls_after_failed_poll() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let config = ClientConfig {
        poll_interval_ms: 100,
        poll_policy: PollPolicy::AfterSuccess,
        ..daemon.config()
    };
    let mut client = Client::spawn(config);

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;
    conn.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
        .await;

    conn.respond(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
        .await;
    conn.respond(&json_response(LIST_BODY)).await;
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Failed(_)
    ));
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::Message(ApiMessage::ResourceList { .. })
    ));

    let next = timeout(Duration::from_millis(500), conn.next_request()).await;
    assert!(next.is_err(), "no poll expected after a failed info");

    client.disconnect().await;
}

#[tokio::test]
async fn test_invalid_resource_id_never_reaches_socket() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.serve_initial().await;
    expect_initial_messages(&mut client).await;

    client
        .send(ApiCall::Delete("web\r\nX-Injected: 1".to_string()))
        .unwrap();
    assert!(matches!(
        next_event(&mut client).await,
        ClientEvent::ActionRejected { .. }
    ));

    client.send(ApiCall::Info).unwrap();
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_closes_socket() {
    let daemon = FakeDaemon::new();
    let listener = daemon.bind();
    let mut client = Client::spawn(daemon.config());

    let mut conn = DaemonConn::accept(&listener).await;
    expect_connected(&mut client).await;
    conn.expect_request("GET /v1.30/info HTTP/1.1").await;
    conn.expect_request("GET /v1.30/containers/json?all=true HTTP/1.1")
        .await;

    client.disconnect().await;

    let eof = timeout(WAIT, conn.next_request()).await.unwrap();
    assert!(eof.is_none());
}
