//! Request body stream.
//!
//! The driver owns the producing [`BodySender`]; the handler pulls chunks
//! from [`Body`]. The size limit is shared between both ends so a handler
//! can raise it after inspecting the request, and the driver re-reads it
//! for every chunk it accepts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Item travelling from the driver to the body consumer.
#[derive(Debug)]
pub(crate) enum BodyEvent {
    Data(Bytes),
    /// Body complete, with trailers if any were sent.
    End(Option<HeaderMap>),
    /// Body failed (413, malformed framing, stream reset).
    Error(Error),
}

/// Called with the number of bytes the consumer has taken, so HTTP/2 can
/// return flow-control credit.
pub(crate) type ReleaseFn = Box<dyn Fn(usize) + Send + Sync>;

enum Source {
    Bounded(mpsc::Receiver<BodyEvent>),
    Unbounded(mpsc::UnboundedReceiver<BodyEvent>),
}

impl Source {
    async fn recv(&mut self) -> Option<BodyEvent> {
        match self {
            Source::Bounded(rx) => rx.recv().await,
            Source::Unbounded(rx) => rx.recv().await,
        }
    }
}

/// A request body as a pull-based stream of chunks.
pub struct Body {
    source: Option<Source>,
    limit: Arc<AtomicU64>,
    received: u64,
    trailers: Option<HeaderMap>,
    on_release: Option<ReleaseFn>,
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("complete", &self.is_complete())
            .field("received", &self.received)
            .field("limit", &self.size_limit())
            .finish()
    }
}

impl Body {
    /// A body that is already complete.
    pub fn empty() -> Self {
        Self {
            source: None,
            limit: Arc::new(AtomicU64::new(0)),
            received: 0,
            trailers: None,
            on_release: None,
        }
    }

    /// Body fed by a bounded channel; the sender waits for the consumer.
    pub(crate) fn channel(limit: u64, capacity: usize) -> (BodySender, Body) {
        let (tx, rx) = mpsc::channel(capacity);
        Self::with_source(limit, Tx::Bounded(tx), Source::Bounded(rx))
    }

    /// Body fed without backpressure; the HTTP/2 window bounds what is buffered.
    pub(crate) fn unbounded(limit: u64, on_release: ReleaseFn) -> (BodySender, Body) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (sender, mut body) = Self::with_source(limit, Tx::Unbounded(tx), Source::Unbounded(rx));
        body.on_release = Some(on_release);
        (sender, body)
    }

    fn with_source(limit: u64, tx: Tx, source: Source) -> (BodySender, Body) {
        let limit = Arc::new(AtomicU64::new(limit));
        let sender = BodySender {
            tx,
            limit: limit.clone(),
        };
        let body = Body {
            source: Some(source),
            limit,
            received: 0,
            trailers: None,
            on_release: None,
        };
        (sender, body)
    }

    /// Next chunk, or `None` once the body is complete.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        match source.recv().await {
            Some(BodyEvent::Data(data)) => {
                self.received += data.len() as u64;
                if let Some(release) = &self.on_release {
                    release(data.len());
                }
                Ok(Some(data))
            }
            Some(BodyEvent::End(trailers)) => {
                self.trailers = trailers;
                self.source = None;
                Ok(None)
            }
            Some(BodyEvent::Error(err)) => {
                self.source = None;
                Err(err)
            }
            None => {
                self.source = None;
                Err(Error::ClientDisconnected)
            }
        }
    }

    /// Read the remaining body into one buffer.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// True once every chunk (and the end marker) has been consumed.
    pub fn is_complete(&self) -> bool {
        self.source.is_none()
    }

    /// Bytes handed to the consumer so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn size_limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Raise (or lower) the limit for the rest of this body.
    pub fn set_size_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Release);
    }

    /// Trailer fields; only available after the body completed.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }
}

#[derive(Debug)]
enum Tx {
    Bounded(mpsc::Sender<BodyEvent>),
    Unbounded(mpsc::UnboundedSender<BodyEvent>),
}

/// Producing end of a [`Body`], held by the driver.
#[derive(Debug)]
pub(crate) struct BodySender {
    tx: Tx,
    limit: Arc<AtomicU64>,
}

impl BodySender {
    /// Current limit, as possibly raised by the consumer.
    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Acquire)
    }

    /// Deliver an event, waiting for room on a bounded body.
    /// Returns false if the consumer dropped the body.
    pub async fn send(&self, event: BodyEvent) -> bool {
        match &self.tx {
            Tx::Bounded(tx) => tx.send(event).await.is_ok(),
            Tx::Unbounded(tx) => tx.send(event).is_ok(),
        }
    }

    /// Deliver an event without waiting. On a full bounded body the event is dropped.
    pub fn push(&self, event: BodyEvent) -> bool {
        match &self.tx {
            Tx::Bounded(tx) => tx.try_send(event).is_ok(),
            Tx::Unbounded(tx) => tx.send(event).is_ok(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.tx {
            Tx::Bounded(tx) => tx.is_closed(),
            Tx::Unbounded(tx) => tx.is_closed(),
        }
    }
}
