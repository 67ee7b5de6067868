//! HTTP/2 server connection state (RFC 9113).
//!
//! Synchronous core of the driver: inbound frames and outbound events
//! mutate stream state and append encoded frames to `out`. The async
//! driver owns the socket halves and the channels around it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::flow::{RecvFlow, SendWindow};
use super::frame::{
    encode_data, encode_goaway, encode_headers, encode_ping, encode_push_promise, encode_rst_stream,
    encode_settings, encode_settings_ack, encode_window_update, ErrorCode, Frame, Priority,
    SettingsId, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE,
    MAX_WINDOW_SIZE,
};
use super::headers::{
    promise_fields, push_request, request_from_fields, response_fields, trailer_fields,
    trailers_from_fields,
};
use super::hpack::{self, HpackError};
use super::stream::{state, Outbound, Outgoing, Stream};
use crate::body::{Body, BodyEvent};
use crate::client::Client;
use crate::error::{ClientError, Error, H2Error};
use crate::request::{Request, RequestHead};
use crate::response::{Push, Response};
use crate::server::Context;

/// PINGs tolerated between two HEADERS or DATA frames.
pub(crate) const MAX_PINGS_WITHOUT_REQUEST: u32 = 64;

/// Peer settings (received from the client).
#[derive(Debug, Clone)]
struct PeerSettings {
    enable_push: bool,
    max_concurrent_streams: u32,
    initial_window_size: u32,
    max_frame_size: u32,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            enable_push: true,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Header block being assembled from HEADERS + CONTINUATION.
#[derive(Debug)]
struct PendingBlock {
    stream_id: u32,
    block: BytesMut,
    end_stream: bool,
    priority: Option<Priority>,
}

/// Work for the driver once the current batch of frames is processed.
pub(crate) enum Dispatch {
    /// Run the handler.
    Request(Request),
    /// Send a response produced without the handler (431).
    Reply(u32, Response),
}

impl Dispatch {
    pub fn stream_id(&self) -> u32 {
        match self {
            Dispatch::Request(r) => r.stream_id(),
            Dispatch::Reply(id, _) => *id,
        }
    }
}

/// Internal events delivered to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    /// The body consumer took `n` bytes of `stream_id`.
    Release { stream_id: u32, n: usize },
    StreamTimeout(u32),
    Idle,
}

pub(crate) struct Connection {
    client: Arc<Client>,
    ctx: Arc<Context>,
    commands: mpsc::UnboundedSender<Command>,
    decoder: hpack::Decoder,
    encoder: hpack::Encoder,
    streams: HashMap<u32, Stream>,
    peer: PeerSettings,
    send_window: SendWindow,
    recv: RecvFlow,
    /// Highest client-initiated stream id seen.
    last_remote_id: u32,
    next_push_id: u32,
    /// URLs already pushed on this connection.
    pushed: HashSet<String>,
    pending_block: Option<PendingBlock>,
    /// Last stream id announced in our GOAWAY.
    goaway_sent: Option<u32>,
    goaway_received: bool,
    pings: u32,
    ready: Vec<Dispatch>,
    /// Encoded frames not yet handed to the writer.
    pub out: BytesMut,
    /// Data acknowledgements owed once `out` is written.
    pub acks: Vec<oneshot::Sender<()>>,
}

impl Connection {
    pub fn new(client: Arc<Client>, ctx: Arc<Context>, commands: mpsc::UnboundedSender<Command>) -> Self {
        let conn_window = ctx.options.initial_window_size.max(DEFAULT_INITIAL_WINDOW_SIZE);
        Self {
            client,
            commands,
            decoder: hpack::Decoder::new(hpack::DEFAULT_TABLE_SIZE),
            encoder: hpack::Encoder::new(),
            streams: HashMap::new(),
            peer: PeerSettings::default(),
            send_window: SendWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            recv: RecvFlow::new(conn_window),
            last_remote_id: 0,
            next_push_id: 2,
            pushed: HashSet::new(),
            pending_block: None,
            goaway_sent: None,
            goaway_received: false,
            pings: 0,
            ready: Vec::new(),
            out: BytesMut::with_capacity(ctx.options.output_buffer_size),
            acks: Vec::new(),
            ctx,
        }
    }

    /// Write the server preface: SETTINGS, then the connection window
    /// increase if we advertise more than the default.
    pub fn preface(&mut self) {
        let options = &self.ctx.options;
        encode_settings(
            &mut self.out,
            &[
                (SettingsId::MaxConcurrentStreams, options.concurrent_stream_limit),
                (SettingsId::InitialWindowSize, options.initial_window_size),
                (SettingsId::MaxFrameSize, options.max_frame_size),
                (SettingsId::MaxHeaderListSize, options.header_size_limit as u32),
                (SettingsId::EnablePush, 0),
            ],
        );
        if options.initial_window_size > DEFAULT_INITIAL_WINDOW_SIZE {
            encode_window_update(&mut self.out, 0, options.initial_window_size - DEFAULT_INITIAL_WINDOW_SIZE);
        }
        self.arm_idle();
    }

    /// Adopt the request of an `Upgrade: h2c` exchange as stream 1,
    /// half-closed (remote). The HTTP2-Settings are applied without an ACK.
    pub fn adopt_upgrade(&mut self, settings: &[(u16, u32)], head: RequestHead) -> Result<(), H2Error> {
        self.apply_settings(settings)?;
        self.last_remote_id = 1;
        let mut stream = Stream::new(1, self.peer.initial_window_size, self.ctx.options.initial_window_size);
        stream.state = state::REMOTE_CLOSED;
        if self.push_possible() {
            stream.head = Some(head.clone());
        }
        self.streams.insert(1, stream);
        self.arm_stream(1);
        let request = Request::new(head, Body::empty(), self.client.clone(), 1);
        self.ready.push(Dispatch::Request(request));
        Ok(())
    }

    pub fn take_ready(&mut self) -> Vec<Dispatch> {
        std::mem::take(&mut self.ready)
    }

    pub fn is_alive(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn set_task(&mut self, stream_id: u32, task: tokio::task::AbortHandle) {
        match self.streams.get_mut(&stream_id) {
            Some(stream) => stream.task = Some(task),
            None => task.abort(),
        }
    }

    /// GOAWAY sent or received.
    pub fn is_draining(&self) -> bool {
        self.goaway_sent.is_some() || self.goaway_received
    }

    /// Draining and every stream is finished.
    pub fn is_done(&self) -> bool {
        self.is_draining() && self.streams.is_empty()
    }

    /// Fail every stream; used when the connection goes away.
    pub fn abort_all(&mut self) {
        for (id, mut stream) in self.streams.drain() {
            stream.cancel(Error::ClientDisconnected);
            self.ctx.timeouts.remove(self.client.id(), id);
        }
        self.ctx.timeouts.remove(self.client.id(), 0);
    }

    /// Announce GOAWAY once; later calls are ignored.
    pub fn go_away(&mut self, code: ErrorCode, reason: &str) {
        if self.goaway_sent.is_some() {
            return;
        }
        debug!(client = self.client.id(), last_stream_id = self.last_remote_id, ?code, reason, "sending GOAWAY");
        encode_goaway(&mut self.out, self.last_remote_id, code, reason.as_bytes());
        self.goaway_sent = Some(self.last_remote_id);
    }

    // ===== timeouts =====

    fn arm_idle(&self) {
        let (id, timeout) = (self.client.id(), self.ctx.options.connection_timeout);
        if !self.ctx.timeouts.update(id, 0, timeout) {
            let tx = self.commands.clone();
            self.ctx.timeouts.insert(id, 0, timeout, move || {
                let _ = tx.send(Command::Idle);
            });
        }
    }

    fn arm_stream(&self, stream_id: u32) {
        let (id, timeout) = (self.client.id(), self.ctx.options.stream_timeout);
        if !self.ctx.timeouts.update(id, stream_id, timeout) {
            let tx = self.commands.clone();
            self.ctx.timeouts.insert(id, stream_id, timeout, move || {
                let _ = tx.send(Command::StreamTimeout(stream_id));
            });
        }
    }

    pub fn command(&mut self, command: Command) {
        match command {
            Command::Release { stream_id, n } => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                if stream.remote_closed() {
                    return;
                }
                if let Some(increment) = stream.recv.release(n) {
                    encode_window_update(&mut self.out, stream_id, increment);
                }
                self.arm_stream(stream_id);
            }
            Command::StreamTimeout(stream_id) => {
                if self.streams.contains_key(&stream_id) {
                    debug!(client = self.client.id(), stream_id, "stream timed out");
                    self.reset(stream_id, ErrorCode::Cancel, Error::timeout(format!("stream {stream_id}")));
                }
            }
            Command::Idle => {
                if self.streams.is_empty() {
                    debug!(client = self.client.id(), "http/2 connection idle");
                    self.go_away(ErrorCode::NoError, "idle");
                } else {
                    self.arm_idle();
                }
            }
        }
    }

    // ===== inbound =====

    /// Process one decoded frame. Stream errors are answered with
    /// RST_STREAM here; a connection error writes GOAWAY and is returned.
    pub fn receive(&mut self, frame: Result<Frame, H2Error>) -> Result<(), H2Error> {
        let result = frame.and_then(|frame| {
            trace!(client = self.client.id(), kind = frame.kind(), "frame");
            self.arm_idle();
            self.on_frame(frame)
        });
        match result {
            Ok(()) => Ok(()),
            Err(H2Error::Stream { id, code, reason }) => {
                debug!(client = self.client.id(), stream_id = id, ?code, %reason, "stream error");
                let err = Error::Http2(H2Error::stream(id, code, reason));
                self.reset(id, code, err);
                Ok(())
            }
            Err(e @ H2Error::Connection { .. }) => {
                warn!(client = self.client.id(), error = %e, "connection error");
                self.go_away(e.code(), &e.to_string());
                Err(e)
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        if let Some(pending) = &self.pending_block {
            let continues = matches!(&frame, Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id);
            if !continues {
                return Err(H2Error::protocol("expected CONTINUATION"));
            }
        }

        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => {
                self.pings = 0;
                self.on_data(stream_id, data, end_stream, flow_len)
            }
            Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
                priority,
            } => {
                self.pings = 0;
                let mut block = BytesMut::from(&fragment[..]);
                self.check_block_size(block.len())?;
                if end_headers {
                    self.on_header_block(stream_id, block.split().freeze(), end_stream, priority)
                } else {
                    self.pending_block = Some(PendingBlock {
                        stream_id,
                        block,
                        end_stream,
                        priority,
                    });
                    Ok(())
                }
            }
            Frame::Continuation {
                stream_id: _,
                fragment,
                end_headers,
            } => {
                let Some(mut pending) = self.pending_block.take() else {
                    return Err(H2Error::protocol("CONTINUATION without HEADERS"));
                };
                pending.block.extend_from_slice(&fragment);
                self.check_block_size(pending.block.len())?;
                if end_headers {
                    let PendingBlock {
                        stream_id,
                        block,
                        end_stream,
                        priority,
                    } = pending;
                    self.on_header_block(stream_id, block.freeze(), end_stream, priority)
                } else {
                    self.pending_block = Some(pending);
                    Ok(())
                }
            }
            Frame::Priority { stream_id, priority } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.priority = priority;
                }
                Ok(())
            }
            Frame::RstStream { stream_id, code } => {
                if self.is_idle(stream_id) {
                    return Err(H2Error::protocol(format!("RST_STREAM on idle stream {stream_id}")));
                }
                if let Some(mut stream) = self.streams.remove(&stream_id) {
                    debug!(client = self.client.id(), stream_id, ?code, "stream reset by peer");
                    stream.cancel(Error::Http2(H2Error::stream(stream_id, code, "reset by peer")));
                    self.ctx.timeouts.remove(self.client.id(), stream_id);
                }
                Ok(())
            }
            Frame::Settings { ack, params } => {
                if ack {
                    return Ok(());
                }
                self.apply_settings(&params)?;
                encode_settings_ack(&mut self.out);
                self.flush_all();
                Ok(())
            }
            Frame::PushPromise { .. } => Err(H2Error::protocol("client sent PUSH_PROMISE")),
            Frame::Ping { ack, payload } => {
                if ack {
                    return Ok(());
                }
                self.pings += 1;
                if self.pings > MAX_PINGS_WITHOUT_REQUEST {
                    return Err(H2Error::connection(ErrorCode::EnhanceYourCalm, "too many PINGs"));
                }
                encode_ping(&mut self.out, payload, true);
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug: payload,
            } => {
                debug!(
                    client = self.client.id(),
                    last_stream_id,
                    ?code,
                    reason = %String::from_utf8_lossy(&payload),
                    "GOAWAY received"
                );
                self.goaway_received = true;
                // pushes the peer will not process
                let dropped: Vec<u32> = self
                    .streams
                    .keys()
                    .copied()
                    .filter(|id| id % 2 == 0 && *id > last_stream_id)
                    .collect();
                for id in dropped {
                    if let Some(mut stream) = self.streams.remove(&id) {
                        stream.cancel(Error::ClientDisconnected);
                        self.ctx.timeouts.remove(self.client.id(), id);
                    }
                }
                Ok(())
            }
            Frame::WindowUpdate { stream_id, increment } => self.on_window_update(stream_id, increment),
            Frame::Unknown { kind, .. } => {
                trace!(kind, "ignoring unknown frame type");
                Ok(())
            }
        }
    }

    fn check_block_size(&self, len: usize) -> Result<(), H2Error> {
        if len > self.ctx.options.header_size_limit {
            return Err(H2Error::connection(ErrorCode::EnhanceYourCalm, "header block too large"));
        }
        Ok(())
    }

    fn is_idle(&self, stream_id: u32) -> bool {
        if stream_id % 2 == 1 {
            stream_id > self.last_remote_id
        } else {
            stream_id >= self.next_push_id
        }
    }

    fn push_possible(&self) -> bool {
        self.ctx.options.push_enabled && self.peer.enable_push
    }

    fn active_remote_streams(&self) -> usize {
        self.streams.keys().filter(|id| *id % 2 == 1).count()
    }

    fn apply_settings(&mut self, params: &[(u16, u32)]) -> Result<(), H2Error> {
        for &(id, value) in params {
            let Some(id) = SettingsId::from_u16(id) else {
                continue;
            };
            match id {
                SettingsId::HeaderTableSize => self.encoder.set_max_table_size(value as usize),
                SettingsId::EnablePush => {
                    if value > 1 {
                        return Err(H2Error::protocol("ENABLE_PUSH must be 0 or 1"));
                    }
                    self.peer.enable_push = value == 1;
                }
                SettingsId::MaxConcurrentStreams => self.peer.max_concurrent_streams = value,
                SettingsId::InitialWindowSize => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(H2Error::connection(
                            ErrorCode::FlowControlError,
                            "INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                    let delta = value as i64 - self.peer.initial_window_size as i64;
                    for stream in self.streams.values_mut() {
                        if stream.send.adjust(delta).is_err() {
                            return Err(H2Error::connection(
                                ErrorCode::FlowControlError,
                                "stream window overflow",
                            ));
                        }
                    }
                    self.peer.initial_window_size = value;
                }
                SettingsId::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err(H2Error::protocol("MAX_FRAME_SIZE out of range"));
                    }
                    self.peer.max_frame_size = value;
                }
                // advisory for responses
                SettingsId::MaxHeaderListSize => {}
            }
        }
        Ok(())
    }

    fn on_header_block(
        &mut self,
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        priority: Option<Priority>,
    ) -> Result<(), H2Error> {
        let limit = self.ctx.options.header_size_limit;
        let (fields, too_large) = match self.decoder.decode(&block, limit) {
            Ok(fields) => (fields, false),
            Err(HpackError::HeaderListTooLarge(_)) => (Vec::new(), true),
            Err(e) => {
                return Err(H2Error::connection(
                    ErrorCode::CompressionError,
                    format!("header block: {e}"),
                ))
            }
        };

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.remote_closed() {
                return Err(H2Error::stream(stream_id, ErrorCode::StreamClosed, "HEADERS after END_STREAM"));
            }
            if !end_stream || too_large {
                return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "second HEADERS without END_STREAM"));
            }
            let trailers = trailers_from_fields(stream_id, fields)?;
            if let Some(expected) = stream.expected_len {
                if stream.received != expected {
                    return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "body shorter than content-length"));
                }
            }
            stream.state |= state::REMOTE_CLOSED;
            if let Some(body) = stream.body.take() {
                body.push(BodyEvent::End(Some(trailers)));
            }
            self.arm_stream(stream_id);
            self.finish_if_done(stream_id);
            return Ok(());
        }

        if stream_id % 2 == 0 {
            return Err(H2Error::protocol(format!("client opened even stream {stream_id}")));
        }
        if stream_id <= self.last_remote_id {
            return Err(H2Error::protocol(format!(
                "stream {stream_id} opened after stream {}",
                self.last_remote_id
            )));
        }
        self.last_remote_id = stream_id;

        if let Some(last) = self.goaway_sent {
            if stream_id > last {
                trace!(stream_id, "ignoring stream opened after GOAWAY");
                return Ok(());
            }
        }
        if self.active_remote_streams() >= self.ctx.options.concurrent_stream_limit as usize {
            return Err(H2Error::stream(stream_id, ErrorCode::RefusedStream, "concurrent stream limit"));
        }

        let mut stream = Stream::new(stream_id, self.peer.initial_window_size, self.ctx.options.initial_window_size);
        stream.priority = priority.unwrap_or_default();
        if end_stream {
            stream.state |= state::REMOTE_CLOSED;
        }

        if too_large {
            debug!(client = self.client.id(), stream_id, "request header list too large");
            self.streams.insert(stream_id, stream);
            self.arm_stream(stream_id);
            let err = ClientError::headers_too_large();
            let response = self.ctx.errors.handle_error(err.status, Some(err.reason.as_str()), None);
            self.ready.push(Dispatch::Reply(stream_id, response));
            return Ok(());
        }

        let decoded = request_from_fields(stream_id, fields)?;
        if end_stream && decoded.content_length.is_some_and(|n| n > 0) {
            return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "END_STREAM short of content-length"));
        }
        stream.expected_len = decoded.content_length;
        if self.push_possible() {
            stream.head = Some(decoded.head.clone());
        }

        let body = if end_stream {
            Body::empty()
        } else {
            let tx = self.commands.clone();
            let (sender, body) = Body::unbounded(
                self.ctx.options.body_size_limit,
                Box::new(move |n| {
                    let _ = tx.send(Command::Release { stream_id, n });
                }),
            );
            stream.body = Some(sender);
            body
        };

        trace!(
            client = self.client.id(),
            stream_id,
            method = %decoded.head.method,
            uri = %decoded.head.uri,
            "request"
        );
        self.streams.insert(stream_id, stream);
        self.arm_stream(stream_id);
        let request = Request::new(decoded.head, body, self.client.clone(), stream_id);
        self.ready.push(Dispatch::Request(request));
        Ok(())
    }

    fn on_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool, flow_len: u32) -> Result<(), H2Error> {
        let flow_len = flow_len as usize;
        if self.recv.receive(flow_len).is_err() {
            return Err(H2Error::connection(ErrorCode::FlowControlError, "connection window exceeded"));
        }
        // the connection window is returned as soon as the frame is accounted
        if let Some(increment) = self.recv.release(flow_len) {
            encode_window_update(&mut self.out, 0, increment);
        }

        if self.is_idle(stream_id) {
            return Err(H2Error::protocol(format!("DATA on idle stream {stream_id}")));
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Err(H2Error::stream(stream_id, ErrorCode::StreamClosed, "DATA on closed stream"));
        };
        if stream.remote_closed() {
            return Err(H2Error::stream(stream_id, ErrorCode::StreamClosed, "DATA after END_STREAM"));
        }
        if stream.recv.receive(flow_len).is_err() {
            return Err(H2Error::stream(stream_id, ErrorCode::FlowControlError, "stream window exceeded"));
        }

        stream.received += data.len() as u64;
        if let Some(expected) = stream.expected_len {
            if stream.received > expected || (end_stream && stream.received != expected) {
                return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "body does not match content-length"));
            }
        }

        // padding, and data nobody will read, is released right away
        let mut released = flow_len - data.len();
        match &stream.body {
            Some(body) if stream.received > body.limit() => {
                debug!(client = self.client.id(), stream_id, "request body over limit");
                self.reset(
                    stream_id,
                    ErrorCode::Cancel,
                    Error::Client(ClientError::payload_too_large()),
                );
                return Ok(());
            }
            Some(body) => {
                if !data.is_empty() && !body.push(BodyEvent::Data(data.clone())) {
                    stream.body = None;
                    released += data.len();
                }
            }
            None => released += data.len(),
        }

        if end_stream {
            stream.state |= state::REMOTE_CLOSED;
            if let Some(body) = stream.body.take() {
                body.push(BodyEvent::End(None));
            }
        } else if released > 0 {
            if let Some(increment) = stream.recv.release(released) {
                encode_window_update(&mut self.out, stream_id, increment);
            }
        }
        self.arm_stream(stream_id);
        self.finish_if_done(stream_id);
        Ok(())
    }

    fn on_window_update(&mut self, stream_id: u32, increment: u32) -> Result<(), H2Error> {
        if stream_id == 0 {
            if increment == 0 {
                return Err(H2Error::protocol("WINDOW_UPDATE increment of 0"));
            }
            if self.send_window.grow(increment).is_err() {
                return Err(H2Error::connection(ErrorCode::FlowControlError, "connection window overflow"));
            }
            self.flush_all();
            return Ok(());
        }

        if self.is_idle(stream_id) {
            return Err(H2Error::protocol(format!("WINDOW_UPDATE on idle stream {stream_id}")));
        }
        if increment == 0 {
            return Err(H2Error::stream(stream_id, ErrorCode::ProtocolError, "WINDOW_UPDATE increment of 0"));
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if stream.send.grow(increment).is_err() {
            return Err(H2Error::stream(stream_id, ErrorCode::FlowControlError, "stream window overflow"));
        }
        self.flush_stream(stream_id);
        Ok(())
    }

    // ===== outbound =====

    /// Apply an event from a stream task.
    pub fn send(&mut self, event: Outbound) {
        match event {
            Outbound::Response {
                stream_id,
                status,
                headers,
                end_stream,
                pushes,
            } => {
                if !self.streams.contains_key(&stream_id) {
                    return;
                }
                for push in &pushes {
                    self.promise(stream_id, push);
                }
                let fields = response_fields(status, &headers);
                let mut block = BytesMut::new();
                self.encoder
                    .encode(fields.iter().map(|(n, v)| (&n[..], &v[..])), &mut block);
                let max_frame = self.peer.max_frame_size as usize;
                encode_headers(&mut self.out, stream_id, &block, end_stream, max_frame);
                trace!(client = self.client.id(), stream_id, %status, end_stream, "response");
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.headers_sent = true;
                    stream.state &= !state::RESERVED;
                    if end_stream {
                        stream.state |= state::LOCAL_CLOSED;
                    }
                }
                self.arm_stream(stream_id);
                self.finish_if_done(stream_id);
            }
            Outbound::Data {
                stream_id,
                data,
                end_stream,
                ack,
            } => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                stream.pending.push_back(Outgoing::Data { data, end_stream, ack });
                self.flush_stream(stream_id);
            }
            Outbound::Trailers { stream_id, trailers } => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                stream.pending.push_back(Outgoing::Trailers(trailers));
                self.flush_stream(stream_id);
            }
            Outbound::Reset { stream_id, code } => {
                if self.streams.contains_key(&stream_id) {
                    self.reset(stream_id, code, Error::ClientDisconnected);
                }
            }
        }
    }

    /// Promise `push` on `parent` and queue the pushed request for dispatch.
    fn promise(&mut self, parent: u32, push: &Push) {
        if !self.push_possible() || self.is_draining() {
            return;
        }
        let pushes = self.streams.keys().filter(|id| *id % 2 == 0).count();
        if pushes >= self.peer.max_concurrent_streams as usize {
            trace!(client = self.client.id(), "push limit reached");
            return;
        }
        let Some(parent_head) = self
            .streams
            .get(&parent)
            .filter(|s| !s.local_closed())
            .and_then(|s| s.head.as_ref())
        else {
            return;
        };
        let head = push_request(parent_head, push);
        let key = head.uri.to_string();
        if !self.pushed.insert(key) {
            return;
        }

        let promised = self.next_push_id;
        self.next_push_id += 2;
        let fields = promise_fields(&head);
        let mut block = BytesMut::new();
        self.encoder
            .encode(fields.iter().map(|(n, v)| (&n[..], &v[..])), &mut block);
        encode_push_promise(&mut self.out, parent, promised, &block, self.peer.max_frame_size as usize);
        debug!(client = self.client.id(), parent, promised, uri = %head.uri, "push promised");

        let mut stream = Stream::new(promised, self.peer.initial_window_size, self.ctx.options.initial_window_size);
        stream.state = state::RESERVED | state::REMOTE_CLOSED;
        self.streams.insert(promised, stream);
        self.arm_stream(promised);
        let request = Request::new(head, Body::empty(), self.client.clone(), promised);
        self.ready.push(Dispatch::Request(request));
    }

    /// Send as much queued output of every stream as the windows allow.
    fn flush_all(&mut self) {
        let mut ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            if self.send_window.available() == 0 {
                break;
            }
            self.flush_stream(id);
        }
    }

    /// Send queued output of one stream, gated by
    /// min(connection window, stream window, peer max frame size).
    fn flush_stream(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let max_frame = self.peer.max_frame_size as usize;

        while let Some(item) = stream.pending.front_mut() {
            match item {
                Outgoing::Data { data, end_stream, ack } => {
                    if data.is_empty() {
                        if *end_stream {
                            encode_data(&mut self.out, stream_id, &[], true);
                            stream.state |= state::LOCAL_CLOSED;
                        }
                        if let Some(ack) = ack.take() {
                            self.acks.push(ack);
                        }
                        stream.pending.pop_front();
                        continue;
                    }
                    let n = data
                        .len()
                        .min(self.send_window.available())
                        .min(stream.send.available())
                        .min(max_frame);
                    if n == 0 {
                        break;
                    }
                    let chunk = data.split_to(n);
                    self.send_window.consume(n);
                    stream.send.consume(n);
                    let last = data.is_empty();
                    encode_data(&mut self.out, stream_id, &chunk, last && *end_stream);
                    if last {
                        if *end_stream {
                            stream.state |= state::LOCAL_CLOSED;
                        }
                        if let Some(ack) = ack.take() {
                            self.acks.push(ack);
                        }
                        stream.pending.pop_front();
                    }
                }
                Outgoing::Trailers(trailers) => {
                    let fields = trailer_fields(trailers);
                    let mut block = BytesMut::new();
                    self.encoder
                        .encode(fields.iter().map(|(n, v)| (&n[..], &v[..])), &mut block);
                    encode_headers(&mut self.out, stream_id, &block, true, max_frame);
                    stream.state |= state::LOCAL_CLOSED;
                    stream.pending.pop_front();
                }
            }
        }
        self.arm_stream(stream_id);
        self.finish_if_done(stream_id);
    }

    /// Drop a stream once both sides are done. A response that completed
    /// while the peer is still sending ends with RST_STREAM(NO_ERROR).
    fn finish_if_done(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if stream.local_closed() && !stream.remote_closed() && stream.pending.is_empty() {
            encode_rst_stream(&mut self.out, stream_id, ErrorCode::NoError);
            stream.state |= state::REMOTE_CLOSED;
            if let Some(body) = stream.body.take() {
                body.push(BodyEvent::Error(Error::ClientDisconnected));
            }
        }
        if stream.is_finished() {
            trace!(client = self.client.id(), stream_id, "stream closed");
            self.streams.remove(&stream_id);
            self.ctx.timeouts.remove(self.client.id(), stream_id);
        }
    }

    /// Reset a stream with `code`, failing its body with `err`.
    fn reset(&mut self, stream_id: u32, code: ErrorCode, err: Error) {
        encode_rst_stream(&mut self.out, stream_id, code);
        if let Some(mut stream) = self.streams.remove(&stream_id) {
            stream.cancel(err);
            self.ctx.timeouts.remove(self.client.id(), stream_id);
        }
    }

    pub fn peer_max_frame_size(&self) -> u32 {
        self.peer.max_frame_size
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    #[cfg(test)]
    fn stream(&self, id: u32) -> Option<&Stream> {
        self.streams.get(&id)
    }
}
