//! Integration tests for `HttpEngine` against a loopback HTTP/1.1 server.
//!
//! The server is a few lines of blocking `std::net` code serving:
//! - `/data`: 1000 bytes, honouring `Range: bytes=a-b` and `bytes=a-`
//! - `/plain`: the same bytes, always `200` (ignores ranges)
//! - `/upload`: accepts a `PUT` body and answers `201`
//! - `/item`: answers `DELETE` with `204`
//! - `/stall`: announces 1000 bytes, sends 3, then waits for the client to
//!   hang up and reports it
//! - anything else: `404`
//!
//! Run with: `cargo test --test http_engine`

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rangefetch::{
    ByteRange, HttpEngine, Reactor, SparseBuffer, TransferCallback, TransferConfig,
    TransferError, TransferRequest,
};

const WAIT: Duration = Duration::from_secs(20);

// ============================================================================
// Loopback server
// ============================================================================

/// One request as seen by the server.
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    path: String,
    range: Option<String>,
    body: Vec<u8>,
}

struct TestServer {
    addr: SocketAddr,
    seen: mpsc::Receiver<Seen>,
    /// Paths whose connection the client closed.
    closed: mpsc::Receiver<String>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn resource() -> Vec<u8> {
    (0..1000u32).map(|i| (i % 256) as u8).collect()
}

fn spawn_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, seen) = mpsc::channel();
    let (closed_tx, closed) = mpsc::channel();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                break;
            };
            let tx = tx.clone();
            let closed_tx = closed_tx.clone();
            thread::spawn(move || serve(stream, tx, closed_tx));
        }
    });

    TestServer { addr, seen, closed }
}

fn serve(stream: TcpStream, seen: mpsc::Sender<Seen>, closed: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut range = None;
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "range" => range = Some(value.trim().to_string()),
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                _ => {}
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok();
    seen.send(Seen {
        method: method.clone(),
        path: path.clone(),
        range: range.clone(),
        body,
    })
    .ok();

    if path == "/stall" {
        stall(stream, &path, &closed);
        return;
    }

    let data = resource();
    let (status, extra, payload): (&str, String, Vec<u8>) = match (method.as_str(), path.as_str()) {
        ("GET", "/data") => match range.as_deref().and_then(parse_range) {
            Some((start, last)) => {
                let last = last.unwrap_or(data.len() - 1).min(data.len() - 1);
                (
                    "206 Partial Content",
                    format!("Content-Range: bytes {}-{}/{}\r\n", start, last, data.len()),
                    data[start..=last].to_vec(),
                )
            }
            None => ("200 OK", String::new(), data),
        },
        ("GET", "/plain") => ("200 OK", String::new(), data),
        ("PUT", "/upload") => ("201 Created", String::new(), Vec::new()),
        ("DELETE", "/item") => ("204 No Content", String::new(), Vec::new()),
        _ => ("404 Not Found", String::new(), b"not found".to_vec()),
    };

    let mut stream = stream;
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n",
        status,
        payload.len(),
        extra
    );
    stream.write_all(head.as_bytes()).ok();
    stream.write_all(&payload).ok();
    stream.flush().ok();
}

/// Sends a truncated body, then blocks until the peer closes the socket.
fn stall(mut stream: TcpStream, path: &str, closed: &mpsc::Sender<String>) {
    let head = "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\nabc";
    stream.write_all(head.as_bytes()).ok();
    stream.flush().ok();
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .ok();

    let started = Instant::now();
    let mut scratch = [0u8; 64];
    while started.elapsed() < Duration::from_secs(60) {
        match stream.read(&mut scratch) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(_) => break,
        }
    }
    if started.elapsed() < Duration::from_secs(60) {
        closed.send(path.to_string()).ok();
    }
}

fn parse_range(value: &str) -> Option<(usize, Option<usize>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, last) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let last = if last.is_empty() {
        None
    } else {
        Some(last.parse().ok()?)
    };
    Some((start, last))
}

// ============================================================================
// Helper Functions
// ============================================================================

type Outcome = (Arc<SparseBuffer>, bool);

fn http_reactor(config: TransferConfig) -> Reactor {
    let config = config
        .with_system_proxy(false)
        .with_idle_poll_interval(Duration::from_millis(50));
    Reactor::start(HttpEngine::new(config)).unwrap()
}

fn reporting(tx: mpsc::Sender<Outcome>) -> TransferCallback {
    Box::new(move |_, data, success| {
        tx.send((data, success)).ok();
    })
}

// ============================================================================
// Integration Tests
// ============================================================================

#[test]
fn test_closed_range_gets_partial_content() {
    let server = spawn_server();
    let reactor = http_reactor(TransferConfig::default());

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::get(
        &server.url("/data"),
        ByteRange::new(100, 50),
        vec!["X-Test: yes".to_string()],
        reporting(tx),
    )
    .unwrap();
    request.submit(&reactor).unwrap();

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success, "error: {:?}", request.last_error());
    assert_eq!(request.status(), Some(206));
    assert_eq!(data.base(), 100);
    assert_eq!(data.contiguous(), Some(&resource()[100..150]));

    let seen = server.seen.recv_timeout(WAIT).unwrap();
    assert_eq!(seen.range.as_deref(), Some("bytes=100-149"));
}

#[test]
fn test_whole_resource_sends_no_range() {
    let server = spawn_server();
    let reactor = http_reactor(TransferConfig::default().with_buffer_size(128));

    let (tx, rx) = mpsc::channel();
    let request =
        TransferRequest::get(&server.url("/data"), ByteRange::whole(), vec![], reporting(tx))
            .unwrap();
    request.submit(&reactor).unwrap();

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);
    assert_eq!(data.contiguous(), Some(&resource()[..]));
    assert_eq!(server.seen.recv_timeout(WAIT).unwrap().range, None);
}

#[test]
fn test_ignored_range_rebases_response() {
    let server = spawn_server();
    let reactor = http_reactor(TransferConfig::default());

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::get(
        &server.url("/plain"),
        ByteRange::new(100, 100),
        vec![],
        reporting(tx),
    )
    .unwrap();
    request.submit(&reactor).unwrap();

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);
    assert_eq!(data.base(), 0);
    assert_eq!(data.len(), 1000);
    assert_eq!(data.contiguous(), Some(&resource()[..]));
}

#[test]
fn test_not_found_fails_on_error() {
    let server = spawn_server();
    let reactor = http_reactor(TransferConfig::default());

    let (tx, rx) = mpsc::channel();
    let request =
        TransferRequest::get(&server.url("/nope"), ByteRange::whole(), vec![], reporting(tx))
            .unwrap();
    request.submit(&reactor).unwrap();

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(!success);
    assert_eq!(data.mapped_len(), 0);
    assert!(matches!(
        request.last_error(),
        Some(TransferError::HttpStatus { status: 404, .. })
    ));
}

#[test]
fn test_put_streams_body_through_window() {
    let server = spawn_server();
    let reactor = http_reactor(
        TransferConfig::default()
            .with_buffer_size(1000)
            .with_upload_window(2),
    );

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::put(
        &server.url("/upload"),
        SparseBuffer::from_bytes(0, payload.clone()),
        vec![],
        reporting(tx),
    )
    .unwrap();
    request.submit(&reactor).unwrap();

    let (_, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success, "error: {:?}", request.last_error());
    assert_eq!(request.status(), Some(201));

    let seen = server.seen.recv_timeout(WAIT).unwrap();
    assert_eq!(seen.method, "PUT");
    assert_eq!(seen.body, payload);
}

#[test]
fn test_delete_uses_delete_verb() {
    let server = spawn_server();
    let reactor = http_reactor(TransferConfig::default());

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::delete(&server.url("/item"), vec![], reporting(tx)).unwrap();
    request.submit(&reactor).unwrap();

    let (_, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);
    let seen = server.seen.recv_timeout(WAIT).unwrap();
    assert_eq!(seen.method, "DELETE");
    assert_eq!(seen.path, "/item");
}

#[test]
fn test_connection_refused_is_transport_failure() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let reactor = http_reactor(TransferConfig::default());

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::get(
        &format!("http://{}/gone", addr),
        ByteRange::whole(),
        vec![],
        reporting(tx),
    )
    .unwrap();
    request.submit(&reactor).unwrap();

    let (_, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(!success);
    assert!(matches!(
        request.last_error(),
        Some(TransferError::Transport { .. })
    ));
}

#[test]
fn test_abort_closes_stalled_connection() {
    let server = spawn_server();
    let reactor = http_reactor(TransferConfig::default());

    let (tx, rx) = mpsc::channel();
    let request =
        TransferRequest::get(&server.url("/stall"), ByteRange::whole(), vec![], reporting(tx))
            .unwrap();
    request.submit(&reactor).unwrap();

    assert_eq!(server.seen.recv_timeout(WAIT).unwrap().path, "/stall");
    let deadline = Instant::now() + WAIT;
    while request.response().mapped_len() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(request.response().contiguous(), None);
    assert_eq!(request.response().mapped_len(), 3);

    request.abort();
    let (_, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(!success);
    assert_eq!(reactor.active_count(), 0);
    assert_eq!(
        server.closed.recv_timeout(WAIT).expect("connection closed after abort"),
        "/stall"
    );
}

#[test]
fn test_transfers_beyond_limit_wait_for_a_slot() {
    let server = spawn_server();
    let reactor = http_reactor(TransferConfig::default().with_max_concurrent_transfers(1));

    let (stall_tx, stall_rx) = mpsc::channel();
    let stalled = TransferRequest::get(
        &server.url("/stall"),
        ByteRange::whole(),
        vec![],
        reporting(stall_tx),
    )
    .unwrap();
    stalled.submit(&reactor).unwrap();
    assert_eq!(server.seen.recv_timeout(WAIT).unwrap().path, "/stall");

    let (tx, rx) = mpsc::channel();
    let queued =
        TransferRequest::get(&server.url("/data"), ByteRange::whole(), vec![], reporting(tx))
            .unwrap();
    queued.submit(&reactor).unwrap();
    assert_eq!(reactor.active_count(), 2);
    assert!(server.seen.recv_timeout(Duration::from_millis(300)).is_err());

    stalled.abort();
    assert!(!stall_rx.recv_timeout(WAIT).unwrap().1);

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success, "error: {:?}", queued.last_error());
    assert_eq!(data.contiguous(), Some(&resource()[..]));
    assert_eq!(server.seen.recv_timeout(WAIT).unwrap().path, "/data");
}
