//! Response produced by the handler and consumed once by the driver.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode, Uri};
use tokio::sync::{mpsc, oneshot};

use crate::error::{BoxError, Error, Result};
use crate::request::RequestHead;
use crate::transport::Io;

/// Response payload.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    /// Chunks fed by a [`BodyWriter`]; may be infinite.
    Stream(mpsc::Receiver<std::result::Result<Bytes, BoxError>>),
}

impl ResponseBody {
    pub fn is_empty(&self) -> bool {
        match self {
            ResponseBody::Empty => true,
            ResponseBody::Full(b) => b.is_empty(),
            ResponseBody::Stream(_) => false,
        }
    }

    /// Known length, if the body is not a stream.
    pub fn len(&self) -> Option<u64> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Full(b) => Some(b.len() as u64),
            ResponseBody::Stream(_) => None,
        }
    }

    /// Next chunk; `Ok(None)` at the end.
    pub(crate) async fn next(&mut self) -> std::result::Result<Option<Bytes>, BoxError> {
        match self {
            ResponseBody::Empty => Ok(None),
            ResponseBody::Full(b) => {
                let data = std::mem::take(b);
                *self = ResponseBody::Empty;
                Ok(if data.is_empty() { None } else { Some(data) })
            }
            ResponseBody::Stream(rx) => rx.recv().await.transpose(),
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(b) => write!(f, "Full({} bytes)", b.len()),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Producer side of a streaming response body.
#[derive(Debug, Clone)]
pub struct BodyWriter {
    tx: mpsc::Sender<std::result::Result<Bytes, BoxError>>,
}

impl BodyWriter {
    /// Queue a chunk. Waits while the driver is behind (socket or flow control).
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(Ok(data.into()))
            .await
            .map_err(|_| Error::ClientDisconnected)
    }

    /// Abort the response; HTTP/2 resets the stream, HTTP/1.x closes the connection.
    pub async fn abort(self, err: impl Into<BoxError>) {
        let _ = self.tx.send(Err(err.into())).await;
    }
}

/// Delivers trailer fields once they are known.
#[derive(Debug)]
pub struct TrailersSender(oneshot::Sender<HeaderMap>);

impl TrailersSender {
    pub fn send(self, trailers: HeaderMap) -> Result<()> {
        self.0.send(trailers).map_err(|_| Error::ClientDisconnected)
    }
}

/// A resource to push alongside the response (HTTP/2 only).
#[derive(Debug, Clone)]
pub struct Push {
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// The raw connection handed to an upgrade callback.
pub struct Upgraded {
    pub io: Box<dyn Io>,
    /// Bytes read from the socket but not consumed by the HTTP parser.
    pub buffered: Bytes,
    pub request: RequestHead,
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("buffered", &self.buffered.len())
            .field("request", &self.request)
            .finish()
    }
}

pub type UpgradeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type OnUpgrade = Box<dyn FnOnce(Upgraded) -> UpgradeFuture + Send>;

/// HTTP response.
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: ResponseBody,
    pub(crate) trailers: Option<oneshot::Receiver<HeaderMap>>,
    pub(crate) pushes: Vec<Push>,
    pub(crate) upgrade: Option<OnUpgrade>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("pushes", &self.pushes.len())
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            trailers: None,
            pushes: Vec::new(),
            upgrade: None,
        }
    }

    /// 200 with a full body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK).with_body(body)
    }

    /// A response whose body is written incrementally through the returned writer.
    pub fn streaming(status: StatusCode) -> (Self, BodyWriter) {
        let (tx, rx) = mpsc::channel(1);
        let mut response = Self::new(status);
        response.body = ResponseBody::Stream(rx);
        (response, BodyWriter { tx })
    }

    pub fn status(&self) -> StatusCode { self.status }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }
    pub fn body(&self) -> &ResponseBody { &self.body }
    pub fn pushes(&self) -> &[Push] { &self.pushes }

    /// Custom HTTP/1.x reason phrase.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = ResponseBody::Full(body.into());
        self
    }

    /// Announce trailers; the body is sent chunked on HTTP/1.1 and the
    /// fields follow the last DATA frame on HTTP/2.
    pub fn trailers(&mut self) -> TrailersSender {
        let (tx, rx) = oneshot::channel();
        self.trailers = Some(rx);
        TrailersSender(tx)
    }

    pub fn has_trailers(&self) -> bool {
        self.trailers.is_some()
    }

    /// Push `uri` to an HTTP/2 client; ignored on HTTP/1.x.
    pub fn push(mut self, uri: Uri, headers: HeaderMap) -> Self {
        self.pushes.push(Push { uri, headers });
        self
    }

    /// Take over the connection once the response head is written.
    pub fn upgrade<F, Fut>(mut self, on_upgrade: F) -> Self
    where
        F: FnOnce(Upgraded) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.upgrade = Some(Box::new(move |up| Box::pin(on_upgrade(up))));
        self
    }
}
