//! Parsed request handed to the handler.

use std::fmt;
use std::sync::Arc;

use http::{HeaderMap, Method, Uri, Version};

use crate::body::Body;
use crate::client::Client;

/// Wire protocol a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http10,
    Http11,
    Http2,
}

impl Protocol {
    /// Version string without the `HTTP/` prefix: "1.0", "1.1" or "2".
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "1.0",
            Protocol::Http11 => "1.1",
            Protocol::Http2 => "2",
        }
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, Protocol::Http2)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Protocol> for Version {
    fn from(p: Protocol) -> Version {
        match p {
            Protocol::Http10 => Version::HTTP_10,
            Protocol::Http11 => Version::HTTP_11,
            Protocol::Http2 => Version::HTTP_2,
        }
    }
}

/// Request line and header fields.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Protocol,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri, version: Protocol) -> Self {
        Self {
            method,
            uri,
            version,
            headers: HeaderMap::new(),
        }
    }
}

/// A request with its body stream and the client it came from.
pub struct Request {
    head: RequestHead,
    body: Body,
    client: Arc<Client>,
    stream_id: u32,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("version", &self.head.version)
            .field("stream_id", &self.stream_id)
            .field("client", &self.client.id())
            .finish()
    }
}

impl Request {
    pub fn new(head: RequestHead, body: Body, client: Arc<Client>, stream_id: u32) -> Self {
        Self {
            head,
            body,
            client,
            stream_id,
        }
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn version(&self) -> Protocol {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Trailer fields, once the body has been read to the end.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.body.trailers()
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// HTTP/2 stream id; 0 on HTTP/1.x.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn into_parts(self) -> (RequestHead, Body) {
        (self.head, self.body)
    }
}
