//! HTTP/1.x request head parsing (RFC 9112 Sections 3, 5 and 6).
//!
//! Produces a [`ParsedRequest`] once a complete head is buffered. Every
//! rejection carries the status the client is answered with.

use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::ClientError;
use crate::request::{Protocol, RequestHead};
use crate::transport::h2::frame::parse_settings_payload;

/// Upper bound on header fields in one request head.
pub(crate) const MAX_HEADERS: usize = 128;

/// Prefix of the HTTP/2 connection preface as it appears to an HTTP/1 parser.
pub(crate) const PREFACE_LINE: &[u8] = b"PRI * HTTP/2.0\r\n";

/// How the request body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
}

/// An `Upgrade: h2c` request, with its decoded HTTP2-Settings payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum H2c {
    NotRequested,
    Requested(Vec<(u16, u32)>),
    /// Upgrade asked for but HTTP2-Settings missing, repeated, or undecodable.
    Invalid,
}

#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub head: RequestHead,
    pub body: BodyKind,
    pub keep_alive: bool,
    pub expect_continue: bool,
    pub h2c: H2c,
}

/// Find the end of the head (`\r\n\r\n`), returning the offset just past it.
pub(crate) fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Find the first CRLF in a buffer, returning its position.
pub(crate) fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Parse the request head at the start of `buf`.
///
/// Returns `Ok(None)` until the head is complete, then the request and the
/// number of bytes it occupied.
pub(crate) fn parse_request(buf: &[u8]) -> Result<Option<(ParsedRequest, usize)>, ClientError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut slots);
    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::Version) => {
            return Err(ClientError::new(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "unsupported HTTP version",
            ))
        }
        Err(httparse::Error::TooManyHeaders) => return Err(ClientError::headers_too_large()),
        Err(e) => return Err(ClientError::bad_request(format!("malformed request head: {e}"))),
    };

    let version = match req.version {
        Some(0) => Protocol::Http10,
        Some(1) => Protocol::Http11,
        _ => {
            return Err(ClientError::new(
                StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                "unsupported HTTP version",
            ))
        }
    };
    let method = req
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| ClientError::bad_request("invalid method"))?;
    let uri = req
        .path
        .and_then(|p| Uri::from_str(p).ok())
        .ok_or_else(|| ClientError::bad_request("invalid request target"))?;

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| ClientError::bad_request(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| ClientError::bad_request(format!("invalid value for {name}")))?;
        headers.append(name, value);
    }

    let hosts = headers.get_all(HOST).iter().count();
    if hosts > 1 || (version == Protocol::Http11 && hosts == 0) {
        return Err(ClientError::bad_request("exactly one Host header required"));
    }

    let body = body_kind(&headers)?;
    let keep_alive = keep_alive(version, &headers);
    let expect_continue = version == Protocol::Http11
        && body != BodyKind::Empty
        && headers
            .get(EXPECT)
            .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"));
    let h2c = h2c_upgrade(&headers);

    let head = RequestHead {
        method,
        uri,
        version,
        headers,
    };
    Ok(Some((
        ParsedRequest {
            head,
            body,
            keep_alive,
            expect_continue,
            h2c,
        },
        len,
    )))
}

fn body_kind(headers: &HeaderMap) -> Result<BodyKind, ClientError> {
    let mut values = headers.get_all(CONTENT_LENGTH).iter();
    let length = match (values.next(), values.next()) {
        (None, _) => None,
        (Some(value), None) => {
            let text = value
                .to_str()
                .map_err(|_| ClientError::bad_request("invalid Content-Length"))?;
            Some(parse_content_length(text)?)
        }
        (Some(_), Some(_)) => return Err(ClientError::bad_request("multiple Content-Length headers")),
    };

    let mut codings = Vec::new();
    for value in headers.get_all(TRANSFER_ENCODING) {
        let text = value
            .to_str()
            .map_err(|_| ClientError::bad_request("invalid Transfer-Encoding"))?;
        codings.extend(
            text.split(',')
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty()),
        );
    }

    if codings.is_empty() {
        return Ok(match length {
            None | Some(0) => BodyKind::Empty,
            Some(n) => BodyKind::Length(n),
        });
    }
    if length.is_some() {
        return Err(ClientError::bad_request(
            "Transfer-Encoding and Content-Length both present",
        ));
    }
    if let Some(other) = codings.iter().find(|c| *c != "chunked") {
        return Err(ClientError::new(
            StatusCode::NOT_IMPLEMENTED,
            format!("unsupported transfer coding {other:?}"),
        ));
    }
    if codings.len() > 1 {
        return Err(ClientError::bad_request("chunked applied more than once"));
    }
    Ok(BodyKind::Chunked)
}

/// Parse a Content-Length value. Comma-separated repeats must all be identical.
pub(crate) fn parse_content_length(value: &str) -> Result<u64, ClientError> {
    let mut result = None;
    for part in value.split(',').map(str::trim) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClientError::bad_request(format!("invalid Content-Length {value:?}")));
        }
        let n: u64 = part
            .parse()
            .map_err(|_| ClientError::bad_request(format!("invalid Content-Length {value:?}")))?;
        if result.is_some_and(|prev| prev != n) {
            return Err(ClientError::bad_request("conflicting Content-Length values"));
        }
        result = Some(n);
    }
    result.ok_or_else(|| ClientError::bad_request("empty Content-Length"))
}

/// True if any comma-separated token of any `name` field equals `token`.
pub(crate) fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn keep_alive(version: Protocol, headers: &HeaderMap) -> bool {
    if has_token(headers, &CONNECTION, "close") {
        return false;
    }
    match version {
        Protocol::Http10 => has_token(headers, &CONNECTION, "keep-alive"),
        _ => true,
    }
}

fn h2c_upgrade(headers: &HeaderMap) -> H2c {
    if !has_token(headers, &UPGRADE, "h2c") {
        return H2c::NotRequested;
    }
    let settings: Vec<_> = headers.get_all("http2-settings").iter().collect();
    if settings.len() != 1
        || !has_token(headers, &CONNECTION, "upgrade")
        || !has_token(headers, &CONNECTION, "http2-settings")
    {
        return H2c::Invalid;
    }
    // Tolerate padded base64url even though the token68 form omits padding.
    let raw = settings[0].as_bytes();
    let trimmed = raw.strip_suffix(b"==").or_else(|| raw.strip_suffix(b"=")).unwrap_or(raw);
    match URL_SAFE_NO_PAD
        .decode(trimmed)
        .ok()
        .and_then(|payload| parse_settings_payload(&payload))
    {
        Some(params) => H2c::Requested(params),
        None => H2c::Invalid,
    }
}

/// Parse a chunk-size line, returning (size, bytes consumed including CRLF).
/// Extensions after `;` are ignored.
pub(crate) fn parse_chunk_size(buffer: &[u8]) -> Result<Option<(u64, usize)>, ClientError> {
    let Some(end) = find_crlf(buffer) else {
        return Ok(None);
    };
    let line = &buffer[..end];
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size)
        .ok()
        .map(|s| s.trim_matches(|c| c == ' ' || c == '\t'))
        .filter(|s| !s.is_empty() && s.len() <= 16)
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| ClientError::bad_request("invalid chunk size"))?;
    Ok(Some((size, end + 2)))
}

/// Trailer fields a client may not send (RFC 9110 Section 6.5.1).
const TRAILER_DENY_LIST: &[&str] = &[
    "authorization",
    "cache-control",
    "connection",
    "content-encoding",
    "content-length",
    "content-range",
    "content-type",
    "expect",
    "host",
    "keep-alive",
    "max-forwards",
    "pragma",
    "proxy-authenticate",
    "proxy-authorization",
    "range",
    "set-cookie",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "www-authenticate",
];

pub(crate) fn is_denied_trailer(name: &HeaderName) -> bool {
    TRAILER_DENY_LIST.contains(&name.as_str())
}

/// Parse a trailer section (after the last chunk) ending with an empty line.
/// Returns the fields and bytes consumed, or `None` if incomplete.
pub(crate) fn parse_trailers(buf: &[u8]) -> Result<Option<(HeaderMap, usize)>, ClientError> {
    if buf.starts_with(b"\r\n") {
        return Ok(Some((HeaderMap::new(), 2)));
    }
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let (len, fields) = match httparse::parse_headers(buf, &mut slots) {
        Ok(httparse::Status::Complete((len, fields))) => (len, fields),
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(ClientError::bad_request(format!("malformed trailers: {e}"))),
    };
    let mut trailers = HeaderMap::with_capacity(fields.len());
    for f in fields.iter() {
        let name = HeaderName::from_bytes(f.name.as_bytes())
            .map_err(|_| ClientError::bad_request("invalid trailer name"))?;
        if is_denied_trailer(&name) {
            return Err(ClientError::bad_request(format!("trailer {name} not allowed")));
        }
        let value = HeaderValue::from_bytes(f.value)
            .map_err(|_| ClientError::bad_request("invalid trailer value"))?;
        trailers.append(name, value);
    }
    Ok(Some((trailers, len)))
}
