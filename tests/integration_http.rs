use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use reqflow::prelude::{
    Client, Error, RequestDescriptor, StatusPolicy, TransportConfig, TransportErrorKind,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
struct ServerResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ServerResponse {
    fn new(
        status: u16,
        headers: Vec<(impl Into<String>, impl Into<String>)>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            status,
            headers: headers
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
            body: body.into().into_bytes(),
        }
    }
}

#[derive(Clone, Debug)]
struct CapturedRequest {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<ServerResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let served_clone = Arc::clone(&served);
        let captured_clone = Arc::clone(&captured);

        let join = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        if let Ok(request) = read_request(&mut stream) {
                            captured_clone
                                .lock()
                                .expect("lock captured requests")
                                .push(request);
                        }

                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;
                        let _ = write_response(&mut stream, response);
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            captured,
            join: Some(join),
        }
    }

    fn requests(&self) -> Vec<CapturedRequest> {
        self.captured
            .lock()
            .expect("lock captured requests")
            .clone()
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<CapturedRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;

    let mut raw = Vec::new();
    loop {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
        if find_header_end(&raw).is_some() {
            break;
        }
    }

    let header_end = find_header_end(&raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed request without header terminator",
        )
    })?;

    let header_text = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing request line")
    })?;
    let mut request_line_parts = request_line.split_whitespace();
    let method = request_line_parts.next().unwrap_or_default().to_owned();
    let path = request_line_parts.next().unwrap_or_default().to_owned();

    let mut headers = BTreeMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length = headers
        .get("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0_u8; 1024];
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }
    body.truncate(content_length);

    Ok(CapturedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &ServerResponse) -> std::io::Result<()> {
    let body = &response.body;
    let mut raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        status_text(response.status),
        body.len()
    );
    for (name, value) in &response.headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n");

    stream.write_all(raw.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        304 => "Not Modified",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn no_headers() -> Vec<(String, String)> {
    Vec::new()
}

/// An address nothing listens on: bind, remember, release.
fn refused_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind unused listener");
    let address = listener.local_addr().expect("read unused address");
    drop(listener);
    format!("http://{address}")
}

#[derive(Debug, Deserialize)]
struct Profile {
    name: String,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn success_captures_etag_and_sends_merged_headers() {
    let server = MockServer::start(vec![ServerResponse::new(
        200,
        vec![("Content-Type", "application/json"), ("ETag", "\"abc\"")],
        r#"{"name":"ann"}"#,
    )]);
    let client = Client::builder(server.base_url.clone())
        .try_default_header("x-client", "sdk")
        .expect("valid default header")
        .try_default_header("x-shared", "static")
        .expect("valid default header")
        .locale("fr-FR")
        .additional_headers(|| {
            let mut headers = HeaderMap::new();
            headers.insert("x-shared", HeaderValue::from_static("dynamic"));
            headers
        })
        .try_build()
        .expect("client should build");
    client
        .authenticate_bearer("token-1")
        .expect("bearer token is a valid header");

    let descriptor = RequestDescriptor::new("/profile");
    let response = client
        .get(descriptor.clone())
        .await
        .expect("request should succeed");
    let profile: Profile = response.json().expect("profile should decode");

    assert_eq!(profile.name, "ann");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.is_simulated());
    assert_eq!(client.etag(&descriptor).as_deref(), Some("\"abc\""));

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let headers = &requests[0].headers;
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/profile");
    assert_eq!(headers.get("authorization").map(String::as_str), Some("Bearer token-1"));
    assert_eq!(headers.get("accept-language").map(String::as_str), Some("fr-FR"));
    assert_eq!(headers.get("x-client").map(String::as_str), Some("sdk"));
    assert_eq!(headers.get("x-shared").map(String::as_str), Some("dynamic"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revalidating_request_sends_stored_etag() {
    let server = MockServer::start(vec![
        ServerResponse::new(200, vec![("ETag", "\"v1\"")], "first"),
        ServerResponse::new(304, no_headers(), ""),
    ]);
    let client = Client::builder(server.base_url.clone())
        .try_build()
        .expect("client should build");
    let descriptor = RequestDescriptor::new("/feed").revalidate(true);

    client
        .get(descriptor.clone())
        .await
        .expect("first request should succeed");
    let second = client
        .get(descriptor.clone())
        .await
        .expect("304 is not an error status");

    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(client.etag(&descriptor).as_deref(), Some("\"v1\""));
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].headers.contains_key("if-none-match"));
    assert_eq!(
        requests[1].headers.get("if-none-match").map(String::as_str),
        Some("\"v1\"")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn basic_auth_and_query_parameters_reach_the_wire() {
    let server = MockServer::start(vec![ServerResponse::new(200, no_headers(), "[]")]);
    let client = Client::builder(server.base_url.clone())
        .try_build()
        .expect("client should build");
    client
        .authenticate_basic("user", "pass")
        .expect("basic credentials are a valid header");

    client
        .get(
            RequestDescriptor::new("/search")
                .query_pair("q", "rust")
                .query_pair("page", "2"),
        )
        .await
        .expect("request should succeed");

    let requests = server.requests();
    assert_eq!(requests[0].path, "/search?q=rust&page=2");
    assert_eq!(
        requests[0].headers.get("authorization").map(String::as_str),
        Some("Basic dXNlcjpwYXNz")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn json_body_is_posted_with_content_type() {
    let server = MockServer::start(vec![ServerResponse::new(201, no_headers(), "")]);
    let client = Client::builder(server.base_url.clone())
        .try_build()
        .expect("client should build");

    let response = client
        .post(
            RequestDescriptor::new("/items")
                .json(&json!({ "name": "demo" }))
                .expect("json should serialize"),
        )
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.request().method(), Method::POST);
    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(
        requests[0].headers.get("content-type").map(String::as_str),
        Some("application/json")
    );
    assert_eq!(requests[0].body, br#"{"name":"demo"}"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_status_is_surfaced_and_not_persisted() {
    let server = MockServer::start(vec![ServerResponse::new(503, no_headers(), "busy")]);
    let client = Client::builder(server.base_url.clone())
        .try_build()
        .expect("client should build");

    let error = client
        .post(RequestDescriptor::new("/orders").offline_retryable())
        .await
        .expect_err("503 should be an error");

    match error {
        Error::HttpStatus { status, body, .. } => {
            assert_eq!(status, 503);
            assert_eq!(body, "busy");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.served_count(), 1);
    assert!(
        client
            .pending_capsules()
            .expect("pending capsules")
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn response_status_policy_passes_error_statuses_through() {
    let server = MockServer::start(vec![ServerResponse::new(404, no_headers(), "missing")]);
    let client = Client::builder(server.base_url.clone())
        .transport_config(TransportConfig::default().with_status_policy(StatusPolicy::Response))
        .try_build()
        .expect("client should build");

    let response = client
        .get(RequestDescriptor::new("/missing"))
        .await
        .expect("status policy should keep 404 as a response");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text_lossy(), "missing");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_body_is_rejected() {
    let server = MockServer::start(vec![ServerResponse::new(200, no_headers(), "0123456789abcdef")]);
    let client = Client::builder(server.base_url.clone())
        .transport_config(TransportConfig::default().with_max_response_body_bytes(4))
        .try_build()
        .expect("client should build");

    let error = client
        .get(RequestDescriptor::new("/large"))
        .await
        .expect_err("body above the limit should fail");

    match error {
        Error::ResponseBodyTooLarge { limit_bytes, .. } => assert_eq!(limit_bytes, 4),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_persists_offline_retryable_requests() {
    let client = Client::builder(refused_base_url())
        .transport_config(TransportConfig::default().with_connect_timeout(Duration::from_secs(1)))
        .try_build()
        .expect("client should build");
    let retryable = RequestDescriptor::new("/events")
        .json(&json!({ "kind": "opened" }))
        .expect("json should serialize")
        .offline_retryable();

    let error = client
        .post(retryable.clone())
        .await
        .expect_err("nothing listens on the port");
    match &error {
        Error::Transport { kind, .. } => assert_eq!(*kind, TransportErrorKind::Connect),
        other => panic!("unexpected error: {other}"),
    }

    client
        .post(RequestDescriptor::new("/events"))
        .await
        .expect_err("nothing listens on the port");

    let pending = client.pending_capsules().expect("pending capsules");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].descriptor.path(), "/events");
    assert_eq!(pending[0].descriptor.method(), Method::POST);
    assert_eq!(pending[0].descriptor.key(), retryable.clone().with_method(Method::POST).key());

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.offline_capsules_saved, 1);
    assert_eq!(metrics.operations_failed, 2);
    assert_eq!(metrics.error_counts.get("transport"), Some(&2));
}
