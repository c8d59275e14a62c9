use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use msg_uploader::digest::hmac_sha1_hex;
use msg_uploader::{Channel, Delivery, RuntimeOptions, Sample, SampleBuffer, UploadError, Uploader};

const UUID: &str = "0a1b2c3d-4e5f-6789-abcd-ef0123456789";
const STRIPPED: &str = "0a1b2c3d4e5f6789abcdef0123456789";

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    headers: HashMap<String, String>,
    body: String,
}

#[derive(Clone, Default)]
struct MiddlewareState {
    requests: Arc<Mutex<Vec<Recorded>>>,
    replies: Arc<Mutex<VecDeque<(u16, String)>>>,
}

/// Stand-in for the middleware. Answers each request with the next scripted
/// reply, or 200 once the script runs out.
struct FakeMiddleware {
    addr: SocketAddr,
    state: MiddlewareState,
}

impl FakeMiddleware {
    async fn start() -> Self {
        let state = MiddlewareState::default();
        let app = Router::new()
            .route("/:kind/:id", post(record))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn reply_with(&self, status: u16, body: &str) {
        self.state
            .replies
            .lock()
            .unwrap()
            .push_back((status, body.to_string()));
    }

    fn requests(&self) -> Vec<Recorded> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn record(
    State(state): State<MiddlewareState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, [(header::HeaderName, &'static str); 1], String) {
    let headers = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    state.requests.lock().unwrap().push(Recorded {
        path: uri.path().to_string(),
        headers,
        body,
    });

    let (status, reply) = state
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((200, r#"{"response":"ok"}"#.to_string()));
    (
        StatusCode::from_u16(status).unwrap(),
        [(header::CONTENT_TYPE, "application/json")],
        reply,
    )
}

fn options(middleware: &str, channel_type: &str, interval: u64) -> Map<String, Value> {
    json!({
        "middleware": middleware,
        "secretKey": "abc123",
        "type": channel_type,
        "interval": interval,
    })
    .as_object()
    .unwrap()
    .clone()
}

fn sample(secs: i64, value: f64) -> Sample {
    Sample::new(Utc.timestamp_opt(secs, 0).unwrap(), value)
}

fn setup(middleware: &str, channel_type: &str, interval: u64) -> (Uploader, Arc<SampleBuffer>) {
    let buffer = Arc::new(SampleBuffer::open_in_memory().unwrap());
    let channel = Channel::new("meter", UUID, buffer.clone());
    let uploader = Uploader::new(
        channel,
        &options(middleware, channel_type, interval),
        RuntimeOptions::default(),
    )
    .unwrap();
    (uploader, buffer)
}

fn refused_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_sensor_upload_sends_signed_deltas() {
    let server = FakeMiddleware::start().await;
    let (mut uploader, buffer) = setup(&server.url(), "sensor", 0);

    buffer.push(&sample(1000, 50.0)).unwrap();
    let first = uploader.send().await.unwrap();
    assert_eq!(first, Delivery::Accepted { measurements: 0 });

    buffer.push(&sample(2000, 70.0)).unwrap();
    let second = uploader.send().await.unwrap();
    assert_eq!(second, Delivery::Accepted { measurements: 1 });
    assert!(buffer.is_empty().unwrap());

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, r#"{"measurements":[]}"#);
    assert_eq!(requests[1].body, r#"{"measurements":[[2000000,20]]}"#);

    let req = &requests[1];
    assert_eq!(req.path, format!("/sensor/{}", STRIPPED));
    assert_eq!(req.headers["content-type"], "application/json");
    assert_eq!(req.headers["x-version"], "1.0");
    assert!(req.headers["user-agent"].starts_with("msg-uploader/"));
    assert_eq!(req.headers["x-digest"], hmac_sha1_hex("abc123", req.body.as_bytes()));
    assert_eq!(uploader.last_response(), r#"{"response":"ok"}"#);
}

#[tokio::test]
async fn test_device_registers_then_sends_heartbeat() {
    let server = FakeMiddleware::start().await;
    let (mut uploader, buffer) = setup(&server.url(), "device", 0);
    buffer.push(&sample(1, 5.0)).unwrap();

    uploader.send().await.unwrap();
    uploader.send().await.unwrap();
    uploader.send().await.unwrap();

    let requests = server.requests();
    assert_eq!(requests[0].path, format!("/device/{}", STRIPPED));
    assert_eq!(
        serde_json::from_str::<Value>(&requests[0].body).unwrap(),
        json!({"key": "abc123"})
    );
    let heartbeat = json!({
        "memtotal": "", "version": "", "memcached": "", "membuffers": "",
        "memfree": "", "uptime": "", "reset": ""
    });
    for req in &requests[1..] {
        assert_eq!(serde_json::from_str::<Value>(&req.body).unwrap(), heartbeat);
    }
    // device uploads leave the buffer alone
    assert_eq!(buffer.pending_len().unwrap(), 1);
}

#[tokio::test]
async fn test_second_send_within_interval_is_skipped() {
    let server = FakeMiddleware::start().await;
    let (mut uploader, buffer) = setup(&server.url(), "sensor", 300);
    buffer.push(&sample(1, 1.0)).unwrap();

    assert!(matches!(uploader.send().await.unwrap(), Delivery::Accepted { .. }));
    buffer.push(&sample(2, 2.0)).unwrap();
    assert_eq!(uploader.send().await.unwrap(), Delivery::Skipped);

    assert_eq!(server.requests().len(), 1);
    assert_eq!(buffer.pending_len().unwrap(), 1);
}

#[tokio::test]
async fn test_protocol_error_rolls_back_and_retries_same_data() {
    let server = FakeMiddleware::start().await;
    server.reply_with(
        500,
        r#"{"exception":{"type":"DigestError","message":"bad signature"}}"#,
    );
    let (mut uploader, buffer) = setup(&server.url(), "sensor", 0);
    buffer.push(&sample(1, 10.0)).unwrap();
    buffer.push(&sample(2, 12.0)).unwrap();

    match uploader.send().await {
        Err(UploadError::Protocol { status, message }) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(message, "DigestError: bad signature");
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(buffer.pending_len().unwrap(), 2);

    let retried = uploader.send().await.unwrap();
    assert_eq!(retried, Delivery::Accepted { measurements: 1 });

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);
    assert_eq!(requests[1].body, r#"{"measurements":[[2000,2]]}"#);
    assert!(buffer.is_empty().unwrap());
}

#[tokio::test]
async fn test_unparsable_error_body_still_reports() {
    let server = FakeMiddleware::start().await;
    server.reply_with(502, "<html>Bad Gateway</html>");
    let (mut uploader, _buffer) = setup(&server.url(), "device", 0);

    let err = uploader.send().await.unwrap_err();
    match err {
        UploadError::Protocol { status, message } => {
            assert_eq!(status.as_u16(), 502);
            assert!(!message.is_empty());
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(uploader.last_response(), "<html>Bad Gateway</html>");

    // the registration attempt counts; the next message is a heartbeat
    uploader.send().await.unwrap();
    let requests = server.requests();
    assert_eq!(requests[0].body, r#"{"key":"abc123"}"#);
    assert!(requests[1].body.contains(r#""memtotal":"""#));
}

#[tokio::test]
async fn test_failed_device_attempt_still_starts_interval() {
    let server = FakeMiddleware::start().await;
    server.reply_with(500, r#"{"response":"try later"}"#);
    let (mut uploader, _buffer) = setup(&server.url(), "device", 300);

    let err = uploader.send().await.unwrap_err();
    assert!(matches!(err, UploadError::Protocol { .. }));
    assert_eq!(uploader.send().await.unwrap(), Delivery::Skipped);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, r#"{"key":"abc123"}"#);
}

#[tokio::test]
async fn test_connection_refused_restores_samples() {
    let (mut uploader, buffer) = setup(&refused_url(), "sensor", 0);
    buffer.push(&sample(1, 10.0)).unwrap();
    buffer.push(&sample(2, 11.0)).unwrap();

    let err = uploader.send().await.unwrap_err();
    assert!(matches!(err, UploadError::Transport(_)));
    assert_eq!(buffer.pending_len().unwrap(), 2);
    assert_eq!(buffer.len().unwrap(), 2);
}

#[tokio::test]
async fn test_daemon_mode_pauses_after_failure() {
    let buffer = Arc::new(SampleBuffer::open_in_memory().unwrap());
    let channel = Channel::new("meter", UUID, buffer);
    let runtime = RuntimeOptions {
        daemon: true,
        retry_pause: Duration::from_millis(300),
    };
    let mut uploader = Uploader::new(channel, &options(&refused_url(), "device", 0), runtime).unwrap();

    let started = Instant::now();
    assert!(uploader.send().await.is_err());
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_failed_attempt_leaves_earlier_marked_rows_alone() {
    let server = FakeMiddleware::start().await;
    server.reply_with(503, r#"{"response":"maintenance"}"#);
    let (mut uploader, buffer) = setup(&server.url(), "sensor", 0);

    // rows left marked by an accepted upload whose purge did not go through
    buffer.push(&sample(1, 10.0)).unwrap();
    let leftover = buffer.mark_pending().unwrap();
    assert_eq!(leftover.ids.len(), 1);

    buffer.push(&sample(2, 12.0)).unwrap();
    assert!(uploader.send().await.is_err());
    assert_eq!(buffer.pending_len().unwrap(), 1);
    assert_eq!(buffer.len().unwrap(), 2);

    uploader.send().await.unwrap();
    let requests = server.requests();
    assert_eq!(requests[0].body, requests[1].body);
    assert!(buffer.is_empty().unwrap());
}
