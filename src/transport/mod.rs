//! Protocol drivers.
//!
//! - HTTP/1.0 and HTTP/1.1 with pipelining, chunked bodies and h2c upgrade
//! - HTTP/2 with HPACK, flow control and server push

pub(crate) mod h1;
pub mod h2;

use tokio::io::{AsyncRead, AsyncWrite};

/// Byte transport a driver runs over: TCP, TLS, or an in-memory pipe in tests.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Current time as an IMF-fixdate, for the `date` response header.
pub(crate) fn http_date() -> http::HeaderValue {
    let now = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    http::HeaderValue::from_str(&now).unwrap_or(http::HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}
