//! HTTP/2 driver tests
//!
//! A frame-level client talks to the driver over an in-memory pipe, with
//! ALPN `h2` selecting HTTP/2 from the first byte.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drover::{BoxError, Options, Request, Response};
use http::header::HeaderValue;
use http::{HeaderMap, StatusCode};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Semaphore};

mod helpers;
use helpers::h2_client::*;
use helpers::{connect, init_tracing, Harness};

const PROTOCOL_ERROR: u32 = 0x1;
const FLOW_CONTROL_ERROR: u32 = 0x3;
const REFUSED_STREAM: u32 = 0x7;
const CANCEL: u32 = 0x8;
const NO_ERROR: u32 = 0x0;

async fn echo_path(req: Request) -> Result<Response, BoxError> {
    Ok(Response::ok(req.uri().path().to_string()))
}

async fn echo_body(mut req: Request) -> Result<Response, BoxError> {
    let body = req.body_mut().bytes().await?;
    Ok(Response::ok(body))
}

async fn start(options: Options, handler: impl drover::Handler) -> (Harness, H2Client<DuplexStream>) {
    init_tracing();
    let (io, h) = connect(options, handler, Some("h2"));
    let mut client = H2Client::new(io);
    client.handshake(&[]).await.unwrap();
    (h, client)
}

#[tokio::test]
async fn test_get_round_trip() {
    let (_h, mut c) = start(Options::default(), echo_path).await;
    assert!(c.server_settings.contains(&(0x2, 0)));

    c.send_headers(1, &request("GET", "/hello"), true).await.unwrap();
    let resp = c.read_response(1).await.unwrap();
    assert_eq!(resp.status(), Some(200));
    assert_eq!(resp.body, b"/hello");
    assert_eq!(resp.header("content-length"), Some("6"));
    assert!(resp.header("date").is_some());
}

#[tokio::test]
async fn test_request_body_and_trailers() {
    let handler = |mut req: Request| async move {
        let body = req.body_mut().bytes().await?;
        let status = req.trailers().and_then(|t| t.get("x-sum")).cloned();
        let mut resp = Response::ok(body);
        if let Some(status) = status {
            resp = resp.with_header(http::header::HeaderName::from_static("x-seen"), status);
        }
        Ok::<_, BoxError>(resp)
    };
    let (_h, mut c) = start(Options::default(), handler).await;

    c.send_headers(1, &request("POST", "/upload"), false).await.unwrap();
    c.send_data(1, b"abc", false).await.unwrap();
    c.send_data(1, b"def", false).await.unwrap();
    c.send_headers(1, &[("x-sum", "42")], true).await.unwrap();

    let resp = c.read_response(1).await.unwrap();
    assert_eq!(resp.body, b"abcdef");
    assert_eq!(resp.header("x-seen"), Some("42"));
}

#[tokio::test]
async fn test_response_trailers() {
    let handler = |_req: Request| async {
        let (mut resp, writer) = Response::streaming(StatusCode::OK);
        let trailers = resp.trailers();
        tokio::spawn(async move {
            writer.write("part").await.unwrap();
            drop(writer);
            let mut fields = HeaderMap::new();
            fields.insert("grpc-status", HeaderValue::from_static("0"));
            let _ = trailers.send(fields);
        });
        Ok::<_, BoxError>(resp)
    };
    let (_h, mut c) = start(Options::default(), handler).await;

    c.send_headers(1, &request("POST", "/rpc"), true).await.unwrap();
    let resp = c.read_response(1).await.unwrap();
    assert_eq!(resp.body, b"part");
    assert_eq!(resp.trailer("grpc-status"), Some("0"));
}

#[tokio::test]
async fn test_data_bounded_by_peer_window() {
    let handler = |_req: Request| async { Ok::<_, BoxError>(Response::ok(vec![b'x'; 100])) };
    init_tracing();
    let (io, _h) = connect(Options::default(), handler, Some("h2"));
    let mut c = H2Client::new(io);
    c.handshake(&[(0x4, 16)]).await.unwrap();

    c.send_headers(1, &request("GET", "/big"), true).await.unwrap();
    loop {
        match c.try_next_frame(Duration::from_millis(200)).await.unwrap() {
            Some(f) => assert!(!(f.kind == DATA && f.has(END_STREAM))),
            None => break,
        }
    }
    assert_eq!(c.streams[&1].body.len(), 16);

    c.send_window_update(1, 50).await.unwrap();
    while c.try_next_frame(Duration::from_millis(200)).await.unwrap().is_some() {}
    assert_eq!(c.streams[&1].body.len(), 66);

    c.send_window_update(1, 34).await.unwrap();
    let resp = c.read_response(1).await.unwrap();
    assert_eq!(resp.body.len(), 100);
    assert!(resp.ended);
}

#[tokio::test]
async fn test_initial_window_change_applies_to_open_streams() {
    let handler = |_req: Request| async { Ok::<_, BoxError>(Response::ok(vec![b'y'; 40])) };
    init_tracing();
    let (io, _h) = connect(Options::default(), handler, Some("h2"));
    let mut c = H2Client::new(io);
    c.handshake(&[(0x4, 0)]).await.unwrap();

    c.send_headers(1, &request("GET", "/"), true).await.unwrap();
    c.expect(HEADERS).await.unwrap();
    assert!(c.try_next_frame(Duration::from_millis(100)).await.unwrap().is_none());

    c.send_settings(&[(0x4, 1000)]).await.unwrap();
    let resp = c.read_response(1).await.unwrap();
    assert_eq!(resp.body.len(), 40);
}

#[tokio::test]
async fn test_window_update_zero_on_connection_is_goaway() {
    let (h, mut c) = start(Options::default(), echo_path).await;
    c.send_window_update(0, 0).await.unwrap();

    let goaway = c.expect(GOAWAY).await.unwrap();
    assert_eq!(goaway.u32_at(4), PROTOCOL_ERROR);
    c.read_to_eof().await.unwrap();
    assert!(h.task.await.unwrap().is_err());
}

#[tokio::test]
async fn test_window_update_zero_on_stream_resets_it() {
    let (_h, mut c) = start(Options::default(), echo_body).await;
    c.send_headers(1, &request("POST", "/"), false).await.unwrap();
    c.send_window_update(1, 0).await.unwrap();

    let rst = c.expect(RST_STREAM).await.unwrap();
    assert_eq!((rst.stream_id, rst.u32_at(0)), (1, PROTOCOL_ERROR));

    // the connection survives
    c.send_headers(3, &request("POST", "/"), false).await.unwrap();
    c.send_data(3, b"ok", true).await.unwrap();
    assert_eq!(c.read_response(3).await.unwrap().body, b"ok");
}

#[tokio::test]
async fn test_window_overflow_is_flow_control_error() {
    let (_h, mut c) = start(Options::default(), echo_path).await;
    c.send_window_update(0, 0x7fff_ffff).await.unwrap();
    let goaway = c.expect(GOAWAY).await.unwrap();
    assert_eq!(goaway.u32_at(4), FLOW_CONTROL_ERROR);
}

#[tokio::test]
async fn test_data_beyond_content_length_resets_without_dispatch() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = move |_req: Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(Response::ok("never")) }
    };
    let (_h, mut c) = start(Options::default(), handler).await;

    let mut fields = request("POST", "/upload");
    fields.push(("content-length", "3"));
    let mut raw = c.headers_frame(1, &fields, false);
    raw.extend_from_slice(&frame(DATA, 0, 1, b"too long"));
    c.send_raw(&raw).await.unwrap();

    let rst = c.expect(RST_STREAM).await.unwrap();
    assert_eq!((rst.stream_id, rst.u32_at(0)), (1, PROTOCOL_ERROR));

    c.send_ping([7; 8]).await.unwrap();
    c.expect(PING).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_goaway_drains_in_flight_streams() {
    let gate = Arc::new(Semaphore::new(0));
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let handler = {
        let gate = gate.clone();
        move |req: Request| {
            let gate = gate.clone();
            let seen = seen_tx.clone();
            async move {
                let _ = seen.send(req.stream_id());
                let _permit = gate.acquire().await?;
                Ok::<_, BoxError>(Response::ok(req.uri().path().to_string()))
            }
        }
    };
    let (h, mut c) = start(Options::default(), handler).await;

    c.send_headers(1, &request("GET", "/one"), true).await.unwrap();
    c.send_headers(3, &request("GET", "/three"), true).await.unwrap();
    let mut started = vec![seen.recv().await.unwrap(), seen.recv().await.unwrap()];
    started.sort_unstable();
    assert_eq!(started, vec![1, 3]);

    h.client.shutdown();
    let goaway = c.expect(GOAWAY).await.unwrap();
    assert_eq!((goaway.u32_at(0), goaway.u32_at(4)), (3, NO_ERROR));

    // opened after GOAWAY: ignored
    c.send_headers(5, &request("GET", "/five"), true).await.unwrap();

    gate.add_permits(2);
    assert_eq!(c.read_response(1).await.unwrap().body, b"/one");
    assert_eq!(c.read_response(3).await.unwrap().body, b"/three");
    c.read_to_eof().await.unwrap();

    assert!(!c.streams.contains_key(&5));
    assert!(h.task.await.unwrap().is_ok());
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn test_peer_goaway_drains_then_answers_with_goaway() {
    let gate = Arc::new(Semaphore::new(0));
    let handler = {
        let gate = gate.clone();
        move |req: Request| {
            let gate = gate.clone();
            async move {
                let _permit = gate.acquire().await?;
                Ok::<_, BoxError>(Response::ok(req.uri().path().to_string()))
            }
        }
    };
    let (h, mut c) = start(Options::default(), handler).await;

    c.send_headers(1, &request("GET", "/one"), true).await.unwrap();
    let mut goaway = Vec::new();
    goaway.extend_from_slice(&0u32.to_be_bytes());
    goaway.extend_from_slice(&NO_ERROR.to_be_bytes());
    c.send_frame(GOAWAY, 0, 0, &goaway).await.unwrap();

    gate.add_permits(1);
    assert_eq!(c.read_response(1).await.unwrap().body, b"/one");
    let goaway = c.expect(GOAWAY).await.unwrap();
    assert_eq!((goaway.u32_at(0), goaway.u32_at(4)), (1, NO_ERROR));
    c.read_to_eof().await.unwrap();
    assert!(h.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_settings_acknowledged() {
    let (_h, mut c) = start(Options::default(), echo_path).await;
    c.send_settings(&[(0x1, 1024), (0x5, 20_000)]).await.unwrap();
    let ack = c.expect(SETTINGS).await.unwrap();
    assert!(ack.has(ACK));
    assert!(ack.payload.is_empty());
}

#[tokio::test]
async fn test_invalid_settings_value() {
    let (_h, mut c) = start(Options::default(), echo_path).await;
    c.send_settings(&[(0x2, 5)]).await.unwrap();
    let goaway = c.expect(GOAWAY).await.unwrap();
    assert_eq!(goaway.u32_at(4), PROTOCOL_ERROR);
}

#[tokio::test]
async fn test_ping_acknowledged() {
    let (_h, mut c) = start(Options::default(), echo_path).await;
    c.send_ping(*b"12345678").await.unwrap();
    let pong = c.expect(PING).await.unwrap();
    assert!(pong.has(ACK));
    assert_eq!(&pong.payload[..], b"12345678");
}

#[tokio::test]
async fn test_server_push() {
    let handler = |req: Request| async move {
        if req.uri().path() == "/" {
            let mut headers = HeaderMap::new();
            headers.insert("accept", HeaderValue::from_static("text/css"));
            Ok::<_, BoxError>(Response::ok("page").push("/style.css".parse().unwrap(), headers))
        } else {
            let accept = req.headers().get("accept").cloned();
            let mut resp = Response::ok(format!("css for {}", req.uri().path()));
            if let Some(accept) = accept {
                resp = resp.with_header(http::header::CONTENT_TYPE, accept);
            }
            Ok(resp)
        }
    };
    let (_h, mut c) = start(Options::default(), handler).await;

    c.send_headers(1, &request("GET", "/"), true).await.unwrap();
    assert_eq!(c.read_response(1).await.unwrap().body, b"page");

    assert_eq!(c.promises.len(), 1);
    let promise = c.promises[0].clone();
    assert_eq!((promise.parent, promise.promised), (1, 2));
    assert!(promise.fields.contains(&(":path".to_string(), "/style.css".to_string())));
    assert!(promise.fields.contains(&(":authority".to_string(), "example.com".to_string())));

    let pushed = c.read_response(2).await.unwrap();
    assert_eq!(pushed.body, b"css for /style.css");
    assert_eq!(pushed.header("content-type"), Some("text/css"));
}

#[tokio::test]
async fn test_push_disabled_by_client() {
    let handler = |_req: Request| async {
        Ok::<_, BoxError>(Response::ok("page").push("/app.js".parse().unwrap(), HeaderMap::new()))
    };
    init_tracing();
    let (io, _h) = connect(Options::default(), handler, Some("h2"));
    let mut c = H2Client::new(io);
    c.handshake(&[(0x2, 0)]).await.unwrap();

    c.send_headers(1, &request("GET", "/"), true).await.unwrap();
    c.read_response(1).await.unwrap();
    assert!(c.promises.is_empty());
}

#[tokio::test]
async fn test_header_list_too_large_is_431() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = move |_req: Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(Response::ok("never")) }
    };
    let (_h, mut c) = start(Options::default().header_size_limit(256), handler).await;

    let big = "v".repeat(200);
    let mut fields = request("GET", "/");
    fields.push(("x-big", &big));
    c.send_headers(1, &fields, true).await.unwrap();
    assert_eq!(c.read_response(1).await.unwrap().status(), Some(431));

    // the HPACK state stays in sync
    c.send_headers(3, &request("GET", "/"), true).await.unwrap();
    c.read_response(3).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_stream_limit_refuses() {
    let gate = Arc::new(Semaphore::new(0));
    let handler = {
        let gate = gate.clone();
        move |_req: Request| {
            let gate = gate.clone();
            async move {
                let _permit = gate.acquire().await?;
                Ok::<_, BoxError>(Response::ok("done"))
            }
        }
    };
    let (_h, mut c) = start(Options::default().concurrent_stream_limit(1), handler).await;
    c.send_headers(1, &request("GET", "/"), true).await.unwrap();
    c.send_headers(3, &request("GET", "/"), true).await.unwrap();

    let rst = c.expect(RST_STREAM).await.unwrap();
    assert_eq!((rst.stream_id, rst.u32_at(0)), (3, REFUSED_STREAM));
    gate.add_permits(1);
    assert_eq!(c.read_response(1).await.unwrap().body, b"done");
}

#[tokio::test]
async fn test_client_reset_cancels_handler() {
    let (done_tx, mut done) = mpsc::unbounded_channel();
    let handler = move |mut req: Request| {
        let done = done_tx.clone();
        async move {
            if req.method() == "PUT" {
                let failed = req.body_mut().bytes().await.is_err();
                let _ = done.send(failed);
            }
            Ok::<_, BoxError>(Response::ok(req.method().to_string()))
        }
    };
    let (_h, mut c) = start(Options::default(), handler).await;
    c.send_headers(1, &request("PUT", "/"), false).await.unwrap();
    c.send_data(1, b"partial", false).await.unwrap();
    c.send_frame(RST_STREAM, 0, 1, &CANCEL.to_be_bytes()).await.unwrap();

    // either the body fails or the task is aborted first
    if let Ok(Some(failed)) = tokio::time::timeout(Duration::from_millis(500), done.recv()).await {
        assert!(failed);
    }
    c.send_headers(3, &request("GET", "/"), true).await.unwrap();
    let resp = c.read_response(3).await.unwrap();
    assert_eq!(resp.status(), Some(200));
    assert_eq!(resp.body, b"GET");
    assert!(c.streams.get(&1).map_or(true, |s| s.status().is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_stream_timeout_cancels() {
    let handler = |_req: Request| async {
        std::future::pending::<()>().await;
        Ok::<_, BoxError>(Response::ok("late"))
    };
    let options = Options::default()
        .stream_timeout(Duration::from_secs(2))
        .connection_timeout(Duration::from_secs(60));
    let (h, mut c) = start(options, handler).await;
    let _sweeper = h.server.spawn_sweeper();

    c.send_headers(1, &request("GET", "/"), true).await.unwrap();
    let rst = c.expect(RST_STREAM).await.unwrap();
    assert_eq!((rst.stream_id, rst.u32_at(0)), (1, CANCEL));
}

#[tokio::test]
async fn test_continuation_assembles_header_block() {
    let (_h, mut c) = start(Options::default(), echo_path).await;
    let raw = c.headers_frame(1, &request("GET", "/split"), true);
    // split the block across HEADERS + CONTINUATION
    let block = &raw[9..];
    let (first, second) = block.split_at(block.len() / 2);
    let mut bytes = frame(HEADERS, END_STREAM, 1, first);
    bytes.extend_from_slice(&frame(CONTINUATION, END_HEADERS, 1, second));
    c.send_raw(&bytes).await.unwrap();
    assert_eq!(c.read_response(1).await.unwrap().body, b"/split");
}

#[tokio::test]
async fn test_bad_preface_is_protocol_error() {
    init_tracing();
    let (io, h) = connect(Options::default(), echo_path, Some("h2"));
    let mut c = H2Client::new(io);
    c.send_raw(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let goaway = c.expect(GOAWAY).await.unwrap();
    assert_eq!(goaway.u32_at(4), PROTOCOL_ERROR);
    assert!(h.task.await.unwrap().is_err());
}
