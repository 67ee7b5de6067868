//! Request header block validation and response header preparation
//! (RFC 9113 Section 8).

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, COOKIE, DATE, HOST};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::H2Error;
use crate::request::{Protocol, RequestHead};
use crate::response::Push;
use crate::transport::http_date;

use super::frame::ErrorCode;

/// Connection-specific fields forbidden in HTTP/2.
const CONNECTION_SPECIFIC: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Request fields a pushed request inherits from its parent.
const PUSH_INHERITED: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "authorization",
    "cache-control",
    "cookie",
    "date",
    "host",
    "user-agent",
    "via",
];

/// A validated request head plus the content-length it announced.
#[derive(Debug)]
pub(crate) struct DecodedRequest {
    pub head: RequestHead,
    pub content_length: Option<u64>,
}

/// Build a request from a decoded header block.
pub(crate) fn request_from_fields(
    stream_id: u32,
    fields: Vec<(Bytes, Bytes)>,
) -> Result<DecodedRequest, H2Error> {
    let malformed = |reason: String| H2Error::stream(stream_id, ErrorCode::ProtocolError, reason);

    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = HeaderMap::with_capacity(fields.len());
    let mut cookies: Vec<Bytes> = Vec::new();
    let mut regular_seen = false;

    for (name, value) in fields {
        if name.first() == Some(&b':') {
            if regular_seen {
                return Err(malformed("pseudo-header after regular field".into()));
            }
            let slot = match &name[..] {
                b":method" => &mut method,
                b":scheme" => &mut scheme,
                b":authority" => &mut authority,
                b":path" => &mut path,
                other => {
                    return Err(malformed(format!(
                        "unknown pseudo-header {}",
                        String::from_utf8_lossy(other)
                    )))
                }
            };
            if slot.replace(value).is_some() {
                return Err(malformed(format!("duplicate {}", String::from_utf8_lossy(&name))));
            }
            continue;
        }

        regular_seen = true;
        if name.iter().any(|b| b.is_ascii_uppercase()) {
            return Err(malformed("uppercase header name".into()));
        }
        let header = HeaderName::from_bytes(&name)
            .map_err(|_| malformed(format!("invalid header name {:?}", String::from_utf8_lossy(&name))))?;
        if CONNECTION_SPECIFIC.contains(&header.as_str()) {
            return Err(malformed(format!("connection-specific field {header}")));
        }
        if header == http::header::TE && !value.eq_ignore_ascii_case(b"trailers") {
            return Err(malformed("te other than trailers".into()));
        }
        if header == COOKIE {
            cookies.push(value);
            continue;
        }
        let value = HeaderValue::from_maybe_shared(value)
            .map_err(|_| malformed(format!("invalid value for {header}")))?;
        headers.append(header, value);
    }

    if !cookies.is_empty() {
        let joined = cookies.join(&b"; "[..]);
        let value = HeaderValue::from_bytes(&joined).map_err(|_| malformed("invalid cookie".into()))?;
        headers.insert(COOKIE, value);
    }

    let method = method.ok_or_else(|| malformed(":method missing".into()))?;
    let method = Method::from_bytes(&method).map_err(|_| malformed("invalid :method".into()))?;

    let uri = if method == Method::CONNECT {
        if scheme.is_some() || path.is_some() {
            return Err(malformed("CONNECT with :scheme or :path".into()));
        }
        let authority = authority.ok_or_else(|| malformed("CONNECT without :authority".into()))?;
        let authority = Authority::from_maybe_shared(authority).map_err(|_| malformed("invalid :authority".into()))?;
        Uri::builder()
            .authority(authority)
            .build()
            .map_err(|e| malformed(e.to_string()))?
    } else {
        let scheme = scheme.ok_or_else(|| malformed(":scheme missing".into()))?;
        let path = path.filter(|p| !p.is_empty()).ok_or_else(|| malformed(":path missing".into()))?;
        let scheme = Scheme::try_from(&scheme[..]).map_err(|_| malformed("invalid :scheme".into()))?;
        let authority = match authority {
            Some(a) => Some(a),
            None => headers.get(HOST).map(|h| Bytes::copy_from_slice(h.as_bytes())),
        };
        if &path[..] == b"*" && method == Method::OPTIONS {
            Uri::from_static("*")
        } else {
            let path = PathAndQuery::from_maybe_shared(path).map_err(|_| malformed("invalid :path".into()))?;
            match authority {
                Some(a) => {
                    let a = Authority::from_maybe_shared(a).map_err(|_| malformed("invalid :authority".into()))?;
                    Uri::builder().scheme(scheme).authority(a).path_and_query(path).build()
                }
                // an absolute URI needs an authority
                None => Uri::builder().path_and_query(path).build(),
            }
            .map_err(|e| malformed(e.to_string()))?
        }
    };

    if let Some(a) = uri.authority() {
        if !headers.contains_key(HOST) {
            let host = HeaderValue::from_str(a.as_str()).map_err(|_| malformed("invalid :authority".into()))?;
            headers.insert(HOST, host);
        }
    }

    let content_length = match headers.get(CONTENT_LENGTH) {
        Some(v) => Some(
            v.to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| malformed("invalid content-length".into()))?,
        ),
        None => None,
    };

    let mut head = RequestHead::new(method, uri, Protocol::Http2);
    head.headers = headers;
    Ok(DecodedRequest { head, content_length })
}

/// Validate a trailer block: regular fields only, same rules otherwise.
pub(crate) fn trailers_from_fields(stream_id: u32, fields: Vec<(Bytes, Bytes)>) -> Result<HeaderMap, H2Error> {
    let malformed = |reason: &str| H2Error::stream(stream_id, ErrorCode::ProtocolError, reason.to_string());
    let mut trailers = HeaderMap::with_capacity(fields.len());
    for (name, value) in fields {
        if name.first() == Some(&b':') {
            return Err(malformed("pseudo-header in trailers"));
        }
        if name.iter().any(|b| b.is_ascii_uppercase()) {
            return Err(malformed("uppercase header name"));
        }
        let name = HeaderName::from_bytes(&name).map_err(|_| malformed("invalid trailer name"))?;
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            return Err(malformed("connection-specific field in trailers"));
        }
        let value = HeaderValue::from_maybe_shared(value).map_err(|_| malformed("invalid trailer value"))?;
        trailers.append(name, value);
    }
    Ok(trailers)
}

/// Response fields in HPACK order: `:status`, then regular fields minus the
/// connection-specific ones, plus `date` when absent.
pub(crate) fn response_fields(status: StatusCode, headers: &HeaderMap) -> Vec<(Bytes, Bytes)> {
    let mut fields = Vec::with_capacity(headers.len() + 2);
    fields.push((Bytes::from_static(b":status"), Bytes::copy_from_slice(status.as_str().as_bytes())));
    for (name, value) in headers {
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            continue;
        }
        fields.push((
            Bytes::copy_from_slice(name.as_str().as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ));
    }
    if !headers.contains_key(DATE) {
        fields.push((Bytes::from_static(b"date"), Bytes::copy_from_slice(http_date().as_bytes())));
    }
    fields
}

/// Trailer fields as a header list.
pub(crate) fn trailer_fields(trailers: &HeaderMap) -> Vec<(Bytes, Bytes)> {
    trailers
        .iter()
        .filter(|(name, _)| !CONNECTION_SPECIFIC.contains(&name.as_str()))
        .map(|(n, v)| (Bytes::copy_from_slice(n.as_str().as_bytes()), Bytes::copy_from_slice(v.as_bytes())))
        .collect()
}

/// The request a push promises: GET for `push.uri` with fields inherited
/// from `parent`, overridden by the push's own fields.
pub(crate) fn push_request(parent: &RequestHead, push: &Push) -> RequestHead {
    let mut headers = HeaderMap::new();
    for name in PUSH_INHERITED {
        for value in parent.headers.get_all(*name) {
            headers.append(HeaderName::from_static(name), value.clone());
        }
    }
    for name in push.headers.keys() {
        headers.remove(name);
    }
    for (name, value) in push.headers.iter() {
        if !CONNECTION_SPECIFIC.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    let mut parts = push.uri.clone().into_parts();
    if parts.scheme.is_none() {
        parts.scheme = parent.uri.scheme().cloned().or(Some(Scheme::HTTPS));
    }
    if parts.authority.is_none() {
        parts.authority = parent.uri.authority().cloned();
    }
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    let uri = Uri::from_parts(parts).unwrap_or_else(|_| push.uri.clone());

    let mut head = RequestHead::new(Method::GET, uri, Protocol::Http2);
    head.headers = headers;
    head
}

/// PUSH_PROMISE fields for a pushed request.
pub(crate) fn promise_fields(head: &RequestHead) -> Vec<(Bytes, Bytes)> {
    let mut fields = vec![
        (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
        (
            Bytes::from_static(b":scheme"),
            Bytes::copy_from_slice(head.uri.scheme_str().unwrap_or("https").as_bytes()),
        ),
    ];
    if let Some(a) = head.uri.authority() {
        fields.push((Bytes::from_static(b":authority"), Bytes::copy_from_slice(a.as_str().as_bytes())));
    }
    let path = head.uri.path_and_query().map_or("/", |p| p.as_str());
    fields.push((Bytes::from_static(b":path"), Bytes::copy_from_slice(path.as_bytes())));
    for (name, value) in head.headers.iter().filter(|(n, _)| *n != HOST) {
        fields.push((
            Bytes::copy_from_slice(name.as_str().as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        ));
    }
    fields
}
