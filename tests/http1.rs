//! HTTP/1.x driver tests
//!
//! Raw requests are written into an in-memory pipe and the responses parsed
//! back byte for byte.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use drover::{BoxError, Options, Request, Response};
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use tokio::io::AsyncWriteExt;

mod helpers;
use helpers::h1_client::{is_closed, read_response};
use helpers::{connect, init_tracing};

/// Answers with the request path; `/slow` takes a moment.
async fn echo_path(req: Request) -> Result<Response, BoxError> {
    if req.uri().path() == "/slow" {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(Response::ok(req.uri().path().to_string()))
}

/// Answers with the request body and reports trailer `x-check`.
async fn echo_body(mut req: Request) -> Result<Response, BoxError> {
    let body = req.body_mut().bytes().await?;
    let mut response = Response::ok(body);
    if let Some(value) = req.trailers().and_then(|t| t.get("x-check")) {
        response = response.with_header(HeaderName::from_static("x-trailer"), value.clone());
    }
    Ok(response)
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    init_tracing();
    let (mut io, _h) = connect(Options::default(), echo_path, None);
    io.write_all(
        b"GET /slow HTTP/1.1\r\nHost: a\r\n\r\n\
          GET /fast HTTP/1.1\r\nHost: a\r\n\r\n\
          GET /last HTTP/1.1\r\nHost: a\r\n\r\n",
    )
    .await
    .unwrap();

    let mut buf = BytesMut::new();
    for expected in ["/slow", "/fast", "/last"] {
        let resp = read_response(&mut io, &mut buf, false).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_str(), expected);
    }
}

#[tokio::test]
async fn test_chunked_request_body_and_trailers() {
    init_tracing();
    let (mut io, _h) = connect(Options::default(), echo_body, None);
    io.write_all(
        b"POST /upload HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
          4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nx-check: yes\r\n\r\n",
    )
    .await
    .unwrap();

    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_str(), "Wikipedia");
    assert_eq!(resp.header("x-trailer"), Some("yes"));
    assert_eq!(resp.header("content-length"), Some("9"));
}

#[tokio::test]
async fn test_streamed_response_is_chunked_with_trailers() {
    init_tracing();
    let handler = |_req: Request| async {
        let (mut resp, writer) = Response::streaming(StatusCode::OK);
        let trailers = resp.trailers();
        tokio::spawn(async move {
            writer.write("hello ").await.unwrap();
            writer.write("world").await.unwrap();
            drop(writer);
            let mut fields = http::HeaderMap::new();
            fields.insert("x-digest", HeaderValue::from_static("abc"));
            let _ = trailers.send(fields);
        });
        Ok::<_, BoxError>(resp)
    };
    let (mut io, _h) = connect(Options::default(), handler, None);
    io.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();

    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.header("transfer-encoding"), Some("chunked"));
    assert_eq!(resp.body_str(), "hello world");
    assert_eq!(resp.trailers, vec![("x-digest".to_string(), "abc".to_string())]);
}

#[tokio::test]
async fn test_content_length_zero_dispatches_without_body() {
    init_tracing();
    let handler = |req: Request| async move {
        assert!(req.body().is_complete());
        Ok::<_, BoxError>(Response::new(StatusCode::NO_CONTENT))
    };
    let (mut io, _h) = connect(Options::default(), handler, None);
    io.write_all(b"POST /empty HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.status, 204);
    assert!(resp.body.is_empty());
}

#[tokio::test]
async fn test_expect_continue() {
    init_tracing();
    let (mut io, _h) = connect(Options::default(), echo_body, None);
    io.write_all(
        b"PUT /file HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n",
    )
    .await
    .unwrap();

    let mut buf = BytesMut::new();
    let interim = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(interim.status, 100);

    io.write_all(b"hello").await.unwrap();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_str(), "hello");
}

#[tokio::test]
async fn test_oversized_head_gets_one_431_and_close() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = move |_req: Request| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(Response::ok("never")) }
    };
    let (mut io, h) = connect(Options::default().header_size_limit(1024), handler, None);

    let big = "x".repeat(2000);
    let raw = format!("GET / HTTP/1.1\r\nHost: a\r\nX-Big: {big}\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n");
    io.write_all(raw.as_bytes()).await.unwrap();

    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.status, 431);
    assert_eq!(resp.header("connection"), Some("close"));
    assert!(is_closed(&mut io, &mut buf).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(h.task.await.unwrap().is_ok());
    assert!(h.client.is_closed());
}

#[tokio::test]
async fn test_malformed_request_line_is_400() {
    init_tracing();
    let (mut io, _h) = connect(Options::default(), echo_path, None);
    io.write_all(b"GET\x01/ HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.status, 400);
    assert!(is_closed(&mut io, &mut buf).await);
}

#[tokio::test]
async fn test_repeated_content_length_is_400() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        move |req: Request| {
            calls.fetch_add(1, Ordering::SeqCst);
            echo_body(req)
        }
    };
    let (mut io, _h) = connect(Options::default(), handler, None);
    io.write_all(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();
    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.status, 400);
    assert!(is_closed(&mut io, &mut buf).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_body_over_limit_is_413() {
    init_tracing();
    let (mut io, _h) = connect(Options::default().body_size_limit(4), echo_body, None);
    io.write_all(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n0123456789")
        .await
        .unwrap();
    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert!(resp.status == 413 || resp.status == 500, "status {}", resp.status);
    assert!(is_closed(&mut io, &mut buf).await);
}

#[tokio::test]
async fn test_http10_closes_after_response() {
    init_tracing();
    let (mut io, _h) = connect(Options::default(), echo_path, None);
    io.write_all(b"GET /old HTTP/1.0\r\n\r\n").await.unwrap();

    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.body_str(), "/old");
    assert!(is_closed(&mut io, &mut buf).await);
}

#[tokio::test]
async fn test_http10_keep_alive() {
    init_tracing();
    let (mut io, _h) = connect(Options::default(), echo_path, None);
    io.write_all(b"GET /a HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").await.unwrap();

    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.header("connection"), Some("keep-alive"));

    io.write_all(b"GET /b HTTP/1.0\r\n\r\n").await.unwrap();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.body_str(), "/b");
}

#[tokio::test]
async fn test_head_response_has_length_but_no_body() {
    init_tracing();
    let (mut io, _h) = connect(Options::default(), echo_path, None);
    io.write_all(b"HEAD /page HTTP/1.1\r\nHost: a\r\n\r\nGET /next HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    let head = read_response(&mut io, &mut buf, true).await.unwrap();
    assert_eq!(head.header("content-length"), Some("5"));
    let next = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(next.body_str(), "/next");
}

#[tokio::test]
async fn test_handler_error_becomes_500() {
    init_tracing();
    let handler = |_req: Request| async { Err::<Response, BoxError>("database unavailable".into()) };
    let (mut io, _h) = connect(Options::default(), handler, None);
    io.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    for _ in 0..2 {
        let resp = read_response(&mut io, &mut buf, false).await.unwrap();
        assert_eq!(resp.status, 500);
        assert!(resp.body_str().contains("500"));
    }
}

#[tokio::test]
async fn test_unread_body_is_discarded_before_next_request() {
    init_tracing();
    let (mut io, _h) = connect(Options::default(), echo_path, None);
    io.write_all(
        b"POST /first HTTP/1.1\r\nHost: a\r\nContent-Length: 7\r\n\r\nignored\
          GET /second HTTP/1.1\r\nHost: a\r\n\r\n",
    )
    .await
    .unwrap();

    let mut buf = BytesMut::new();
    assert_eq!(read_response(&mut io, &mut buf, false).await.unwrap().body_str(), "/first");
    assert_eq!(read_response(&mut io, &mut buf, false).await.unwrap().body_str(), "/second");
}

#[tokio::test]
async fn test_upgrade_hands_over_socket() {
    init_tracing();
    let handler = |_req: Request| async {
        let response = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .with_header(http::header::UPGRADE, HeaderValue::from_static("echo"))
            .upgrade(|up| async move {
                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                let mut io = up.io;
                let mut data = up.buffered.to_vec();
                let mut chunk = [0u8; 64];
                if let Ok(n) = io.read(&mut chunk).await {
                    data.extend_from_slice(&chunk[..n]);
                }
                let _ = io.write_all(&data).await;
            });
        Ok::<_, BoxError>(response)
    };
    let (mut io, h) = connect(Options::default(), handler, None);
    io.write_all(b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: upgrade\r\nUpgrade: echo\r\n\r\n")
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    let resp = read_response(&mut io, &mut buf, false).await.unwrap();
    assert_eq!(resp.status, 101);
    assert!(h.task.await.unwrap().is_ok());
    assert!(!h.client.is_closed());

    io.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::io::AsyncReadExt::read_exact(&mut io, &mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_times_out() {
    init_tracing();
    let options = Options::default().connection_timeout(Duration::from_secs(2));
    let (mut io, h) = connect(options, echo_path, None);
    let _sweeper = h.server.spawn_sweeper();

    let mut buf = BytesMut::new();
    io.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    read_response(&mut io, &mut buf, false).await.unwrap();

    assert!(is_closed(&mut io, &mut buf).await);
    assert!(h.task.await.unwrap().is_ok());
    assert!(h.server.timeouts().is_empty());
}

#[tokio::test]
async fn test_graceful_shutdown_closes_idle_keep_alive() {
    init_tracing();
    let (mut io, h) = connect(Options::default(), echo_path, None);
    io.write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").await.unwrap();
    let mut buf = BytesMut::new();
    read_response(&mut io, &mut buf, false).await.unwrap();

    h.client.shutdown();
    assert!(is_closed(&mut io, &mut buf).await);
    assert!(h.task.await.unwrap().is_ok());
}
