//! Integration tests for the reactor and request lifecycle.
//!
//! These tests drive real reactor threads over the in-memory
//! `ScriptedEngine` and verify:
//! - exactly-once callbacks under abort/complete races
//! - range handling, including servers that ignore ranges
//! - re-entrant submission and restart from inside callbacks
//! - uploads, deletes and shutdown
//!
//! Run with: `cargo test --test reactor_integration`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rangefetch::{
    ByteRange, Method, Reactor, RequestState, ScriptedControl, ScriptedEngine,
    ScriptedResponse, SparseBuffer, TransferCallback, TransferError, TransferRequest,
};

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helper Functions
// ============================================================================

type Outcome = (Arc<SparseBuffer>, bool);

fn scripted_reactor() -> (Reactor, ScriptedControl) {
    let (engine, control) = ScriptedEngine::new();
    let reactor = Reactor::start(engine).expect("reactor starts");
    (reactor, control)
}

/// Callback that forwards the outcome to `tx`.
fn reporting(tx: mpsc::Sender<Outcome>) -> TransferCallback {
    Box::new(move |_, data, success| {
        tx.send((data, success)).ok();
    })
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_callback_fires_exactly_once_under_abort_races() {
    const WORKERS: usize = 4;
    const PER_WORKER: usize = 250;

    let (reactor, control) = scripted_reactor();
    control.respond(
        "http://test/race",
        ScriptedResponse::ok(body(64)).with_chunk_size(16),
    );
    let handle = reactor.handle();

    let (tx, rx) = mpsc::channel::<usize>();
    let counters: Arc<Vec<AtomicUsize>> =
        Arc::new((0..WORKERS * PER_WORKER).map(|_| AtomicUsize::new(0)).collect());

    let workers: Vec<_> = (0..WORKERS)
        .map(|w| {
            let handle = handle.clone();
            let counters = Arc::clone(&counters);
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..PER_WORKER {
                    let index = w * PER_WORKER + i;
                    let counters = Arc::clone(&counters);
                    let tx = tx.clone();
                    let request = TransferRequest::get(
                        "http://test/race",
                        ByteRange::whole(),
                        vec![],
                        Box::new(move |_, _, _| {
                            counters[index].fetch_add(1, Ordering::SeqCst);
                            tx.send(index).ok();
                        }),
                    )
                    .unwrap();
                    request.submit_to(&handle).unwrap();
                    if i % 3 != 0 {
                        request.abort();
                    }
                }
            })
        })
        .collect();
    drop(tx);
    for worker in workers {
        worker.join().unwrap();
    }

    for _ in 0..WORKERS * PER_WORKER {
        rx.recv_timeout(WAIT).expect("every request reports");
    }
    thread::sleep(Duration::from_millis(50));

    assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    assert_eq!(reactor.active_count(), 0);
    let stats = reactor.stats();
    assert_eq!(stats.finished(), (WORKERS * PER_WORKER) as u64);
}

#[test]
fn test_abort_before_any_bytes() {
    let (reactor, control) = scripted_reactor();
    control.respond("http://test/held", ScriptedResponse::ok(body(100)).held());

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let counter = Arc::clone(&calls);
    let request = TransferRequest::get(
        "http://test/held",
        ByteRange::whole(),
        vec![],
        Box::new(move |_, data, success| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send((data, success)).ok();
        }),
    )
    .unwrap();

    request.submit(&reactor).unwrap();
    assert!(request.transport_handle().is_some());
    request.abort();

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(!success);
    assert_eq!(data.mapped_len(), 0);
    assert_eq!(request.transport_handle(), None);
    assert_eq!(request.state(), RequestState::Aborted);
    assert_eq!(reactor.active_count(), 0);

    control.release("http://test/held");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_request_outlives_dropped_owner() {
    let (reactor, control) = scripted_reactor();
    control.respond("http://test/held", ScriptedResponse::ok(b"kept".to_vec()).held());

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::get(
        "http://test/held",
        ByteRange::whole(),
        vec![],
        Box::new(move |request, data, success| {
            tx.send((request.uri().to_string(), data, success)).ok();
        }),
    )
    .unwrap();
    request.submit(&reactor).unwrap();
    drop(request);

    control.release("http://test/held");
    let (uri, data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);
    assert_eq!(uri, "http://test/held");
    assert_eq!(data.contiguous(), Some(&b"kept"[..]));
}

#[test]
fn test_invalid_range_reports_failure_without_transfer() {
    let (reactor, control) = scripted_reactor();
    let (tx, rx) = mpsc::channel();
    let request =
        TransferRequest::get("http://test/a", ByteRange::new(50, 0), vec![], reporting(tx))
            .unwrap();

    request.submit(&reactor).unwrap();
    let (data, success) = rx.try_recv().expect("reported synchronously");
    assert!(!success);
    assert!(data.is_empty());
    assert_eq!(control.request_count(), 0);
    assert!(matches!(
        request.last_error(),
        Some(TransferError::InvalidRange { .. })
    ));
}

#[test]
fn test_range_past_address_limit_reports_failure() {
    let (reactor, control) = scripted_reactor();
    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::get(
        "http://test/a",
        ByteRange::new(u64::MAX - 1, 10),
        vec![],
        reporting(tx),
    )
    .unwrap();

    request.submit(&reactor).unwrap();
    let (_, success) = rx.try_recv().expect("reported synchronously");
    assert!(!success);
    assert_eq!(control.request_count(), 0);
    assert!(matches!(
        request.last_error(),
        Some(TransferError::InvalidRange { .. })
    ));
}

#[test]
fn test_resubmit_without_reset_is_refused() {
    let (reactor, control) = scripted_reactor();
    control.respond("http://test/once", ScriptedResponse::ok(b"once".to_vec()));

    let (tx, rx) = mpsc::channel();
    let request =
        TransferRequest::get("http://test/once", ByteRange::whole(), vec![], reporting(tx))
            .unwrap();
    request.submit(&reactor).unwrap();
    let (_, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);

    assert_eq!(
        request.submit(&reactor),
        Err(TransferError::AlreadyFinished)
    );
    assert_eq!(control.request_count(), 1);
    assert_eq!(request.state(), RequestState::Completed);
}

// ============================================================================
// Ranges
// ============================================================================

#[test]
fn test_partial_content_lands_at_range_offset() {
    let (reactor, control) = scripted_reactor();
    let resource = body(4096);
    control.respond(
        "http://test/file",
        ScriptedResponse::ok(resource.clone())
            .honoring_ranges()
            .with_chunk_size(100),
    );

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::get(
        "http://test/file",
        ByteRange::new(1000, 500),
        vec![],
        reporting(tx),
    )
    .unwrap();
    request.submit(&reactor).unwrap();

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);
    assert_eq!(data.base(), 1000);
    assert_eq!(data.len(), 500);
    assert_eq!(data.contiguous(), Some(&resource[1000..1500]));
    assert_eq!(request.status(), Some(206));
    assert_eq!(control.requests()[0].range.as_deref(), Some("1000-1499"));
}

#[test]
fn test_range_ignored_by_server_rebases_to_whole_resource() {
    let (reactor, control) = scripted_reactor();
    let resource = body(1000);
    control.respond(
        "http://test/plain",
        ScriptedResponse::ok(resource.clone()).with_chunk_size(128),
    );

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::get(
        "http://test/plain",
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
    assert_eq!(data.contiguous(), Some(&resource[..]));
    assert!(request.requested_range().is_whole());
}

#[test]
fn test_content_length_presizes_before_body() {
    let (reactor, control) = scripted_reactor();
    control.respond(
        "http://test/sized",
        ScriptedResponse::ok(Vec::new())
            .without_content_length()
            .with_header("content-length", "500"),
    );

    let (tx, rx) = mpsc::channel();
    let request =
        TransferRequest::get("http://test/sized", ByteRange::whole(), vec![], reporting(tx))
            .unwrap();
    request.submit(&reactor).unwrap();

    let (data, _) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(data.len(), 500);
    assert_eq!(data.mapped_len(), 0);
    assert_eq!(data.gaps(), vec![ByteRange::new(0, 500)]);
}

#[test]
fn test_open_range_reads_to_end() {
    let (reactor, control) = scripted_reactor();
    let resource = body(300);
    control.respond(
        "http://test/tail",
        ScriptedResponse::ok(resource.clone()).honoring_ranges(),
    );

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::get(
        "http://test/tail",
        ByteRange::from_offset(250),
        vec![],
        reporting(tx),
    )
    .unwrap();
    request.submit(&reactor).unwrap();

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);
    assert_eq!(data.range(), ByteRange::new(250, 50));
    assert_eq!(data.contiguous(), Some(&resource[250..]));
    assert_eq!(control.requests()[0].range.as_deref(), Some("250-"));
}

// ============================================================================
// Re-entrancy
// ============================================================================

#[test]
fn test_submissions_from_inside_a_callback() {
    let (reactor, control) = scripted_reactor();
    for name in ["first", "second", "third"] {
        control.respond(
            &format!("http://test/{}", name),
            ScriptedResponse::ok(name.as_bytes().to_vec()),
        );
    }

    let handle = reactor.handle();
    let (tx, rx) = mpsc::channel::<(String, bool)>();
    let outer_tx = tx.clone();
    let request = TransferRequest::get(
        "http://test/third",
        ByteRange::whole(),
        vec![],
        Box::new(move |request, _, success| {
            for name in ["first", "second"] {
                let tx = outer_tx.clone();
                let inner = TransferRequest::get(
                    &format!("http://test/{}", name),
                    ByteRange::whole(),
                    vec![],
                    Box::new(move |request, data, success| {
                        let name = request.uri().path().trim_start_matches('/');
                        assert_eq!(data.contiguous(), Some(name.as_bytes()));
                        tx.send((request.uri().to_string(), success)).ok();
                    }),
                )
                .unwrap();
                inner.submit_to(&handle).unwrap();
            }
            outer_tx.send((request.uri().to_string(), success)).ok();
        }),
    )
    .unwrap();
    drop(tx);
    request.submit(&reactor).unwrap();

    let mut seen: Vec<(String, bool)> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("http://test/first".to_string(), true),
            ("http://test/second".to_string(), true),
            ("http://test/third".to_string(), true),
        ]
    );
}

#[test]
fn test_restart_from_own_callback() {
    let (reactor, control) = scripted_reactor();
    let resource = body(200);
    control.respond(
        "http://test/again",
        ScriptedResponse::ok(resource.clone()).honoring_ranges(),
    );

    let handle = reactor.handle();
    let (tx, rx) = mpsc::channel();
    let second_tx = tx.clone();
    let request = TransferRequest::get(
        "http://test/again",
        ByteRange::new(0, 10),
        vec![],
        Box::new(move |request, data, success| {
            tx.send((data, success)).ok();
            request
                .reset(ByteRange::new(100, 10), reporting(second_tx))
                .unwrap();
            request.submit_to(&handle).unwrap();
        }),
    )
    .unwrap();
    request.submit(&reactor).unwrap();

    let (first, ok) = rx.recv_timeout(WAIT).unwrap();
    assert!(ok);
    assert_eq!(first.contiguous(), Some(&resource[..10]));

    let (second, ok) = rx.recv_timeout(WAIT).unwrap();
    assert!(ok);
    assert_eq!(second.base(), 100);
    assert_eq!(second.contiguous(), Some(&resource[100..110]));
    assert_eq!(control.request_count(), 2);
}

#[test]
fn test_concurrent_transfers_interleave() {
    let (reactor, control) = scripted_reactor();
    let (tx, rx) = mpsc::channel();
    let mut expected = Vec::new();

    for i in 0..20 {
        let url = format!("http://test/file{}", i);
        let resource = body(1000 + i * 37);
        control.respond(&url, ScriptedResponse::ok(resource.clone()).with_chunk_size(64));
        expected.push(resource);

        let tx = tx.clone();
        let request = TransferRequest::get(
            &url,
            ByteRange::whole(),
            vec![],
            Box::new(move |_, data, success| {
                tx.send((i, data, success)).ok();
            }),
        )
        .unwrap();
        request.submit(&reactor).unwrap();
    }

    for _ in 0..20 {
        let (i, data, success) = rx.recv_timeout(WAIT).unwrap();
        assert!(success);
        assert_eq!(data.contiguous(), Some(&expected[i][..]));
    }
}

// ============================================================================
// Upload, delete, failures, shutdown
// ============================================================================

#[test]
fn test_put_streams_upload() {
    let (reactor, control) = scripted_reactor();
    control.respond("http://test/store", ScriptedResponse::status(201));

    let payload = body(10_000);
    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::put(
        "http://test/store",
        SparseBuffer::from_bytes(0, payload.clone()),
        vec!["Content-Type: application/octet-stream".to_string()],
        reporting(tx),
    )
    .unwrap();
    request.submit(&reactor).unwrap();

    let (_, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);
    assert_eq!(request.status(), Some(201));
    assert_eq!(control.uploads(), vec![("http://test/store".to_string(), payload)]);

    let spec = &control.requests()[0];
    assert_eq!(spec.method, Method::Put);
    assert_eq!(spec.upload_len, Some(10_000));
    assert_eq!(reactor.stats().bytes_sent, 10_000);
}

#[test]
fn test_delete_sends_no_body_request() {
    let (reactor, control) = scripted_reactor();
    control.respond(
        "http://test/gone",
        ScriptedResponse::status(204).with_header("X-Ignored", "1"),
    );

    let (tx, rx) = mpsc::channel();
    let request = TransferRequest::delete("http://test/gone", vec![], reporting(tx)).unwrap();
    request.submit(&reactor).unwrap();

    let (_, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(success);
    let spec = &control.requests()[0];
    assert_eq!(spec.method, Method::Delete);
    assert!(spec.no_body);
    assert_eq!(spec.range, None);
}

#[test]
fn test_transport_failure_keeps_partial_data() {
    let (reactor, control) = scripted_reactor();
    control.respond(
        "http://test/reset",
        ScriptedResponse::ok(body(64)).failing_with(TransferError::Transport {
            uri: "http://test/reset".to_string(),
            reason: "connection reset by peer".to_string(),
        }),
    );

    let (tx, rx) = mpsc::channel();
    let request =
        TransferRequest::get("http://test/reset", ByteRange::whole(), vec![], reporting(tx))
            .unwrap();
    request.submit(&reactor).unwrap();

    let (data, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(!success);
    assert_eq!(data.len(), 64);
    assert!(request
        .last_error()
        .map_or(false, |e| e.is_transport_failure()));
}

#[test]
fn test_http_error_status_fails() {
    let (reactor, _control) = scripted_reactor();
    let (tx, rx) = mpsc::channel();
    let request =
        TransferRequest::get("http://test/unknown", ByteRange::whole(), vec![], reporting(tx))
            .unwrap();
    request.submit(&reactor).unwrap();

    let (_, success) = rx.recv_timeout(WAIT).unwrap();
    assert!(!success);
    assert_eq!(request.status(), Some(404));
    assert!(matches!(
        request.last_error(),
        Some(TransferError::HttpStatus { status: 404, .. })
    ));
}

#[test]
fn test_shutdown_fails_transfers_in_flight() {
    let (reactor, control) = scripted_reactor();
    let (tx, rx) = mpsc::channel();
    for i in 0..5 {
        let url = format!("http://test/held{}", i);
        control.respond(&url, ScriptedResponse::ok(body(10)).held());
        let request =
            TransferRequest::get(&url, ByteRange::whole(), vec![], reporting(tx.clone()))
                .unwrap();
        request.submit(&reactor).unwrap();
    }
    assert_eq!(reactor.active_count(), 5);

    drop(reactor);
    for _ in 0..5 {
        let (_, success) = rx.recv_timeout(WAIT).unwrap();
        assert!(!success);
    }
}
