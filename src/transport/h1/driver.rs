//! HTTP/1.x connection driver.
//!
//! One request in flight at a time. The request body is pumped from the
//! socket concurrently with the handler and then with the response writer,
//! so a handler may stream its answer while still reading the upload. The
//! next request head is parsed only once both have finished.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, trace, warn};

use super::chunked::{encode_chunk, encode_last_chunk, Chunk, ChunkedDecoder};
use super::encode::{self, encode_continue, encode_h2c_switch, encode_head, encode_upgrade_head, Framing, Plan};
use super::parse::{parse_request, BodyKind, H2c, ParsedRequest, PREFACE_LINE};
use crate::body::{Body, BodyEvent, BodySender};
use crate::client::Client;
use crate::error::{BoxError, ClientError, Error, Result};
use crate::handler::{self, ErrorHandler};
use crate::request::{Protocol, Request, RequestHead};
use crate::response::{OnUpgrade, Response, ResponseBody, Upgraded};
use crate::server::Context;
use crate::timeout::TimeoutQueue;
use crate::transport::Io;

/// Bytes reserved in the read buffer before each socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Body chunks buffered between the pump and the handler.
const BODY_CHANNEL_CAPACITY: usize = 8;

/// Timeout key for the connection-level entry.
const CONNECTION_KEY: u32 = 0;

/// How an HTTP/1.x connection ended.
pub(crate) enum Outcome<T> {
    Closed,
    /// The socket was handed to a response's upgrade callback.
    Upgraded,
    /// Continue as HTTP/2 on the same transport.
    Http2(Handoff<T>),
}

/// State carried over to the HTTP/2 driver.
pub(crate) struct Handoff<T> {
    pub io: T,
    /// Unparsed bytes, starting with the client preface.
    pub buffered: BytesMut,
    /// Present for `Upgrade: h2c`; absent for prior-knowledge connections.
    pub upgrade: Option<H2cUpgrade>,
}

/// The request that asked for `Upgrade: h2c`. It becomes stream 1.
#[derive(Debug)]
pub(crate) struct H2cUpgrade {
    pub settings: Vec<(u16, u32)>,
    pub head: RequestHead,
}

/// Drive an HTTP/1.x connection until it closes or switches protocol.
pub(crate) async fn serve<T: Io>(
    io: T,
    client: Arc<Client>,
    ctx: Arc<Context>,
    buffered: BytesMut,
) -> Result<Outcome<T>> {
    debug!(client = client.id(), remote = %client.remote_addr(), "serving http/1.x");
    Driver::new(io, client, ctx, buffered).run().await
}

/// Refreshes the connection's inactivity deadline.
#[derive(Clone)]
struct Idle {
    timeouts: TimeoutQueue,
    client: Arc<Client>,
    timeout: Duration,
}

impl Idle {
    fn arm(&self) {
        let id = self.client.id();
        if !self.timeouts.update(id, CONNECTION_KEY, self.timeout) {
            let client = self.client.clone();
            self.timeouts.insert(id, CONNECTION_KEY, self.timeout, move || {
                debug!(client = client.id(), "http/1.x connection timed out");
                client.close();
            });
        }
    }

    fn disarm(&self) {
        self.timeouts.remove(self.client.id(), CONNECTION_KEY);
    }
}

enum Head {
    Request(Box<ParsedRequest>),
    Preface,
    Eof,
}

enum Step {
    Close,
    Upgrade(OnUpgrade, RequestHead),
    Http2(Option<H2cUpgrade>),
}

enum Next {
    KeepAlive,
    Close,
    Upgrade(OnUpgrade, RequestHead),
}

enum Decoder {
    Length(u64),
    Chunked(ChunkedDecoder),
}

impl Decoder {
    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Chunk>, ClientError> {
        match self {
            Decoder::Length(0) => Ok(Some(Chunk::End(None))),
            Decoder::Length(remaining) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Some(Chunk::Data(buf.split_to(take).freeze())))
            }
            Decoder::Chunked(chunked) => chunked.decode(buf),
        }
    }
}

struct Reader<T> {
    io: ReadHalf<T>,
    buf: BytesMut,
    idle: Idle,
}

impl<T: Io> Reader<T> {
    /// Read more bytes; 0 means EOF.
    async fn fill(&mut self) -> Result<usize> {
        self.buf.reserve(READ_CHUNK);
        self.idle.arm();
        let client = self.idle.client.clone();
        tokio::select! {
            n = self.io.read_buf(&mut self.buf) => Ok(n?),
            _ = client.closed() => Err(Error::ClientDisconnected),
        }
    }

    async fn read_head(&mut self, limit: usize, allow_h2: bool) -> Result<Head> {
        let client = self.idle.client.clone();
        loop {
            let awaiting_preface = allow_h2 && PREFACE_LINE.starts_with(&self.buf[..self.buf.len().min(PREFACE_LINE.len())]);
            if awaiting_preface && self.buf.len() >= PREFACE_LINE.len() {
                return Ok(Head::Preface);
            }
            if !awaiting_preface || self.buf.is_empty() {
                if let Some((parsed, len)) = parse_request(&self.buf)? {
                    if len > limit {
                        return Err(ClientError::headers_too_large().into());
                    }
                    self.buf.advance(len);
                    return Ok(Head::Request(Box::new(parsed)));
                }
                if self.buf.len() > limit {
                    return Err(ClientError::headers_too_large().into());
                }
            }

            if self.buf.is_empty() {
                if client.is_shutting_down() {
                    return Ok(Head::Eof);
                }
                let n = tokio::select! {
                    n = self.fill() => n?,
                    _ = client.shutdown_requested() => return Ok(Head::Eof),
                };
                if n == 0 {
                    return Ok(Head::Eof);
                }
            } else if self.fill().await? == 0 {
                trace!(client = client.id(), buffered = self.buf.len(), "eof inside request head");
                return Ok(Head::Eof);
            }
        }
    }

    /// Move the request body from the socket into `sender`.
    ///
    /// If the consumer drops the body the rest is read and discarded so the
    /// next pipelined request lines up.
    async fn pump(&mut self, kind: BodyKind, sender: Option<BodySender>, header_limit: usize) -> Result<()> {
        let Some(sender) = sender else {
            return Ok(());
        };
        let mut decoder = match kind {
            BodyKind::Empty => return Ok(()),
            BodyKind::Length(n) => Decoder::Length(n),
            BodyKind::Chunked => Decoder::Chunked(ChunkedDecoder::new(header_limit)),
        };
        let mut limit = sender.limit();
        let mut sink = Some(sender);
        let mut received = 0u64;

        loop {
            let chunk = match decoder.decode(&mut self.buf) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    if self.fill().await? == 0 {
                        fail(sink, Error::ClientDisconnected);
                        return Err(Error::ClientDisconnected);
                    }
                    continue;
                }
                Err(e) => {
                    fail(sink, e.clone().into());
                    return Err(e.into());
                }
            };
            match chunk {
                Chunk::Data(data) => {
                    received += data.len() as u64;
                    if let Some(tx) = &sink {
                        limit = tx.limit();
                    }
                    if received > limit {
                        let e = ClientError::payload_too_large();
                        fail(sink, e.clone().into());
                        return Err(e.into());
                    }
                    if let Some(tx) = &sink {
                        if !tx.send(BodyEvent::Data(data)).await {
                            trace!(client = self.idle.client.id(), "request body dropped, discarding the rest");
                            sink = None;
                        }
                    }
                }
                Chunk::End(trailers) => {
                    if let Some(tx) = sink {
                        tx.send(BodyEvent::End(trailers)).await;
                    }
                    return Ok(());
                }
            }
        }
    }
}

fn fail(sink: Option<BodySender>, err: Error) {
    if let Some(tx) = sink {
        tx.push(BodyEvent::Error(err));
    }
}

async fn write_out<W: AsyncWrite + Unpin>(io: &mut W, data: &[u8]) -> std::io::Result<()> {
    io.write_all(data).await?;
    io.flush().await
}

struct Writer<T> {
    io: WriteHalf<T>,
    out: BytesMut,
    flush_at: usize,
    idle: Idle,
}

impl<T: Io> Writer<T> {
    async fn flush(&mut self) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.idle.arm();
        let client = self.idle.client.clone();
        let result = tokio::select! {
            r = write_out(&mut self.io, &self.out) => r.map_err(Error::from),
            _ = client.closed() => Err(Error::ClientDisconnected),
        };
        self.out.clear();
        if result.is_err() {
            client.close();
        }
        result
    }

    async fn maybe_flush(&mut self) -> Result<()> {
        if self.out.len() >= self.flush_at {
            self.flush().await?;
        }
        Ok(())
    }

    async fn next_chunk(
        &self,
        body: &mut ResponseBody,
    ) -> Result<std::result::Result<Option<Bytes>, BoxError>> {
        tokio::select! {
            chunk = body.next() => Ok(chunk),
            _ = self.idle.client.closed() => Err(Error::ClientDisconnected),
        }
    }

    /// Write a response. Returns false if the body ended short of its
    /// framing, in which case the connection must close.
    async fn write_response(
        &mut self,
        version: Protocol,
        mut response: Response,
        plan: Plan,
        keep_alive_secs: u64,
    ) -> Result<bool> {
        encode_head(&mut self.out, version, &response, &plan, keep_alive_secs);
        let mut clean = true;
        match plan.framing {
            Framing::Empty => {}
            Framing::Length(expected) => {
                let mut remaining = expected;
                loop {
                    match self.next_chunk(&mut response.body).await? {
                        Ok(Some(data)) => {
                            if data.len() as u64 > remaining {
                                warn!(expected, "response body longer than its content-length, truncating");
                                self.out.extend_from_slice(&data[..remaining as usize]);
                                remaining = 0;
                                clean = false;
                                break;
                            }
                            remaining -= data.len() as u64;
                            self.out.extend_from_slice(&data);
                            self.maybe_flush().await?;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(error = %e, "response body aborted");
                            clean = false;
                            break;
                        }
                    }
                }
                if remaining > 0 {
                    clean = false;
                }
            }
            Framing::Chunked => loop {
                match self.next_chunk(&mut response.body).await? {
                    Ok(Some(data)) => {
                        encode_chunk(&data, &mut self.out);
                        self.maybe_flush().await?;
                    }
                    Ok(None) => {
                        let trailers = match response.trailers.take() {
                            Some(rx) => tokio::select! {
                                t = rx => t.ok(),
                                _ = self.idle.client.closed() => return Err(Error::ClientDisconnected),
                            },
                            None => None,
                        };
                        encode_last_chunk(trailers.as_ref(), &mut self.out);
                        break;
                    }
                    Err(e) => {
                        // no terminal chunk: the client sees a truncated body
                        debug!(error = %e, "response body aborted");
                        clean = false;
                        break;
                    }
                }
            },
            Framing::Close => loop {
                match self.next_chunk(&mut response.body).await? {
                    Ok(Some(data)) => {
                        self.out.extend_from_slice(&data);
                        self.maybe_flush().await?;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "response body aborted");
                        break;
                    }
                }
            },
        }
        self.flush().await?;
        Ok(clean)
    }

    /// Answer a protocol violation through the error handler. The
    /// connection closes afterwards.
    async fn write_error(
        &mut self,
        errors: &dyn ErrorHandler,
        err: ClientError,
        head: Option<&RequestHead>,
    ) -> Result<()> {
        debug!(client = self.idle.client.id(), status = %err.status, reason = %err.reason, "rejecting request");
        let response = errors.handle_error(err.status, Some(&err.reason), head);
        let version = head.map_or(Protocol::Http11, |h| h.version);
        let method = head.map_or(Method::GET, |h| h.method.clone());
        let plan = encode::plan(&method, version, false, &response);
        self.write_response(version, response, plan, 0).await.map(|_| ())
    }
}

struct Driver<T> {
    reader: Reader<T>,
    writer: Writer<T>,
    idle: Idle,
    client: Arc<Client>,
    ctx: Arc<Context>,
}

impl<T: Io> Driver<T> {
    fn new(io: T, client: Arc<Client>, ctx: Arc<Context>, buffered: BytesMut) -> Self {
        let (rd, wr) = tokio::io::split(io);
        let idle = Idle {
            timeouts: ctx.timeouts.clone(),
            client: client.clone(),
            timeout: ctx.options.connection_timeout,
        };
        Self {
            reader: Reader {
                io: rd,
                buf: buffered,
                idle: idle.clone(),
            },
            writer: Writer {
                io: wr,
                out: BytesMut::with_capacity(ctx.options.output_buffer_size),
                flush_at: ctx.options.output_buffer_size,
                idle: idle.clone(),
            },
            idle,
            client,
            ctx,
        }
    }

    async fn run(mut self) -> Result<Outcome<T>> {
        let step = self.drive().await;
        self.idle.disarm();
        match step {
            Ok(Step::Close) | Err(Error::ClientDisconnected) => {
                let _ = self.writer.io.shutdown().await;
                Ok(Outcome::Closed)
            }
            Ok(Step::Upgrade(on_upgrade, request)) => {
                let io = self.reader.io.unsplit(self.writer.io);
                let upgraded = Upgraded {
                    io: Box::new(io),
                    buffered: self.reader.buf.freeze(),
                    request,
                };
                debug!(client = self.client.id(), "connection upgraded");
                tokio::spawn(on_upgrade(upgraded));
                Ok(Outcome::Upgraded)
            }
            Ok(Step::Http2(upgrade)) => {
                let io = self.reader.io.unsplit(self.writer.io);
                debug!(client = self.client.id(), h2c = upgrade.is_some(), "switching to http/2");
                Ok(Outcome::Http2(Handoff {
                    io,
                    buffered: self.reader.buf,
                    upgrade,
                }))
            }
            Err(e) => Err(e),
        }
    }

    async fn drive(&mut self) -> Result<Step> {
        let limit = self.ctx.options.header_size_limit;
        let allow_h2 = self.ctx.options.allow_http2_upgrade;
        loop {
            let mut parsed = match self.reader.read_head(limit, allow_h2).await {
                Ok(Head::Request(parsed)) => parsed,
                Ok(Head::Preface) => return Ok(Step::Http2(None)),
                Ok(Head::Eof) => return Ok(Step::Close),
                Err(Error::Client(e)) => {
                    self.writer.write_error(&*self.ctx.errors, e, None).await?;
                    return Ok(Step::Close);
                }
                Err(e) => return Err(e),
            };
            trace!(
                client = self.client.id(),
                method = %parsed.head.method,
                uri = %parsed.head.uri,
                version = %parsed.head.version,
                "request"
            );

            if allow_h2 {
                match std::mem::replace(&mut parsed.h2c, H2c::NotRequested) {
                    H2c::Requested(settings)
                        if parsed.body == BodyKind::Empty && !self.client.is_secure() =>
                    {
                        encode_h2c_switch(&mut self.writer.out);
                        self.writer.flush().await?;
                        let upgrade = H2cUpgrade {
                            settings,
                            head: parsed.head,
                        };
                        return Ok(Step::Http2(Some(upgrade)));
                    }
                    H2c::Invalid => {
                        let e = ClientError::bad_request("invalid HTTP2-Settings");
                        self.writer.write_error(&*self.ctx.errors, e, Some(&parsed.head)).await?;
                        return Ok(Step::Close);
                    }
                    _ => {}
                }
            }

            match self.exchange(*parsed).await? {
                Next::KeepAlive => continue,
                Next::Close => return Ok(Step::Close),
                Next::Upgrade(on_upgrade, head) => return Ok(Step::Upgrade(on_upgrade, head)),
            }
        }
    }

    /// Dispatch one request and write its response.
    async fn exchange(&mut self, parsed: ParsedRequest) -> Result<Next> {
        let ParsedRequest {
            head,
            body: kind,
            keep_alive,
            expect_continue,
            ..
        } = parsed;
        let keep_alive = keep_alive && !self.client.is_shutting_down();
        let options = &self.ctx.options;

        let (sender, body) = match kind {
            BodyKind::Empty => (None, Body::empty()),
            _ => {
                let (tx, body) = Body::channel(options.body_size_limit, BODY_CHANNEL_CAPACITY);
                (Some(tx), body)
            }
        };
        if expect_continue {
            encode_continue(&mut self.writer.out);
            self.writer.flush().await?;
        }

        let request = Request::new(head.clone(), body, self.client.clone(), 0);
        let mut respond = Box::pin(handler::respond(
            self.ctx.handler.clone(),
            self.ctx.errors.clone(),
            request,
        ));
        let mut pump = Box::pin(self.reader.pump(kind, sender, options.header_size_limit));
        let mut pumped: Option<Result<()>> = None;
        if kind == BodyKind::Empty {
            pumped = Some(Ok(()));
            self.idle.disarm();
        }

        let response = loop {
            tokio::select! {
                response = &mut respond => break response,
                result = &mut pump, if pumped.is_none() => match result {
                    Err(Error::Client(e)) => {
                        drop(respond);
                        drop(pump);
                        self.writer.write_error(&*self.ctx.errors, e, Some(&head)).await?;
                        return Ok(Next::Close);
                    }
                    Err(e) => return Err(e),
                    Ok(()) => {
                        self.idle.disarm();
                        pumped = Some(Ok(()));
                    }
                },
                _ = self.client.closed() => return Err(Error::ClientDisconnected),
            }
        };
        drop(respond);

        let mut response = response;
        if let Some(on_upgrade) = response.upgrade.take() {
            if pumped.is_none() {
                pumped = Some((&mut pump).await);
            }
            drop(pump);
            if let Some(Err(e)) = pumped {
                return Err(e);
            }
            encode_upgrade_head(&mut self.writer.out, head.version, &response);
            self.writer.flush().await?;
            return Ok(Next::Upgrade(on_upgrade, head));
        }

        let plan = encode::plan(&head.method, head.version, keep_alive, &response);
        let keep_alive_secs = options.keep_alive_secs();
        let clean = match pumped {
            Some(_) => {
                drop(pump);
                self.writer
                    .write_response(head.version, response, plan, keep_alive_secs)
                    .await?
            }
            None => {
                let (written, result) = tokio::join!(
                    self.writer.write_response(head.version, response, plan, keep_alive_secs),
                    &mut pump,
                );
                drop(pump);
                match result {
                    Ok(()) => {}
                    Err(Error::Client(e)) => {
                        debug!(client = self.client.id(), status = %e.status, "request body rejected after response started");
                        written?;
                        return Ok(Next::Close);
                    }
                    Err(e) => return Err(e),
                }
                written?
            }
        };

        Ok(if plan.keep_alive && clean {
            Next::KeepAlive
        } else {
            Next::Close
        })
    }
}
