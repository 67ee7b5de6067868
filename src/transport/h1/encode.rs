//! HTTP/1.x response serialization.

use bytes::{BufMut, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};

use super::parse::has_token;
use crate::request::Protocol;
use crate::response::Response;
use crate::transport::http_date;

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Headers only (HEAD, 1xx, 204, 304).
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the connection closes.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Plan {
    pub framing: Framing,
    /// Value of the `content-length` header, if one is sent.
    pub content_length: Option<u64>,
    pub keep_alive: bool,
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn bodyless_status(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

/// Decide framing and persistence for a response.
///
/// `keep_alive` is what the request negotiated, already combined with any
/// pending shutdown of the client.
pub(crate) fn plan(method: &Method, version: Protocol, keep_alive: bool, response: &Response) -> Plan {
    let keep_alive = keep_alive && !has_token(&response.headers, &CONNECTION, "close");
    let declared = declared_length(&response.headers);
    let known = response.body.len();

    if bodyless_status(response.status) {
        let content_length = (response.status == StatusCode::NOT_MODIFIED).then_some(declared).flatten();
        return Plan {
            framing: Framing::Empty,
            content_length,
            keep_alive,
        };
    }
    if *method == Method::HEAD {
        let content_length = declared.or(known.filter(|n| *n > 0));
        return Plan {
            framing: Framing::Empty,
            content_length,
            keep_alive,
        };
    }

    let can_chunk = version == Protocol::Http11 && keep_alive;
    if declared.is_none() && can_chunk && (known.is_none() || response.has_trailers()) {
        return Plan {
            framing: Framing::Chunked,
            content_length: None,
            keep_alive,
        };
    }
    match declared.or(known) {
        Some(n) => Plan {
            framing: Framing::Length(n),
            content_length: Some(n),
            keep_alive,
        },
        None => Plan {
            framing: Framing::Close,
            content_length: None,
            keep_alive: false,
        },
    }
}

fn status_line(out: &mut BytesMut, version: Protocol, status: StatusCode, reason: Option<&str>) {
    let reason = reason
        .filter(|r| !r.bytes().any(|b| b == b'\r' || b == b'\n'))
        .or_else(|| status.canonical_reason())
        .unwrap_or("");
    out.put_slice(format!("HTTP/{} {} {}\r\n", version.as_str(), status.as_u16(), reason).as_bytes());
}

fn field(out: &mut BytesMut, name: &str, value: &[u8]) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

fn is_framing_header(name: &http::HeaderName) -> bool {
    name == CONNECTION || name == TRANSFER_ENCODING || name == CONTENT_LENGTH || name.as_str() == "keep-alive"
}

/// Write the status line and header section for a planned response.
pub(crate) fn encode_head(
    out: &mut BytesMut,
    version: Protocol,
    response: &Response,
    plan: &Plan,
    keep_alive_secs: u64,
) {
    status_line(out, version, response.status, response.reason.as_deref());
    for (name, value) in response.headers.iter().filter(|(n, _)| !is_framing_header(n)) {
        field(out, name.as_str(), value.as_bytes());
    }
    if !response.headers.contains_key(DATE) {
        field(out, "date", http_date().as_bytes());
    }
    if let Some(n) = plan.content_length {
        field(out, "content-length", n.to_string().as_bytes());
    }
    if plan.framing == Framing::Chunked {
        field(out, "transfer-encoding", b"chunked");
    }
    if plan.keep_alive {
        field(out, "connection", b"keep-alive");
        field(out, "keep-alive", format!("timeout={keep_alive_secs}").as_bytes());
    } else {
        field(out, "connection", b"close");
    }
    out.put_slice(b"\r\n");
}

/// Head of a response that hands the socket to an upgrade callback.
/// The handler's own `connection`/`upgrade` fields are kept as given.
pub(crate) fn encode_upgrade_head(out: &mut BytesMut, version: Protocol, response: &Response) {
    status_line(out, version, response.status, response.reason.as_deref());
    for (name, value) in response.headers.iter() {
        field(out, name.as_str(), value.as_bytes());
    }
    if !response.headers.contains_key(DATE) {
        field(out, "date", http_date().as_bytes());
    }
    out.put_slice(b"\r\n");
}

pub(crate) fn encode_continue(out: &mut BytesMut) {
    out.put_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
}

pub(crate) fn encode_h2c_switch(out: &mut BytesMut) {
    out.put_slice(b"HTTP/1.1 101 Switching Protocols\r\nconnection: Upgrade\r\nupgrade: h2c\r\n\r\n");
}
