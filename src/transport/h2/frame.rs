//! HTTP/2 frame types and binary serialization (RFC 9113 Section 4 and 6).
//!
//! Decoding validates the per-type layout rules and reports violations with
//! the scope the RFC assigns them. Encoding appends complete frames to an
//! output buffer so the driver can batch writes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::H2Error;

/// Frame header size (9 bytes per RFC 9113).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Default maximum frame size (16KB per RFC 9113).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Largest value SETTINGS_MAX_FRAME_SIZE may take.
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Largest flow-control window (2^31 - 1).
pub const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

/// Initial flow-control window of every stream and of the connection.
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

/// HTTP/2 connection preface the client sends first.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Frame type identifiers per RFC 9113.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl From<u8> for FrameType {
    fn from(v: u8) -> Self {
        match v {
            0x0 => Self::Data,
            0x1 => Self::Headers,
            0x2 => Self::Priority,
            0x3 => Self::RstStream,
            0x4 => Self::Settings,
            0x5 => Self::PushPromise,
            0x6 => Self::Ping,
            0x7 => Self::GoAway,
            0x8 => Self::WindowUpdate,
            0x9 => Self::Continuation,
            other => Self::Unknown(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        match ft {
            FrameType::Data => 0x0,
            FrameType::Headers => 0x1,
            FrameType::Priority => 0x2,
            FrameType::RstStream => 0x3,
            FrameType::Settings => 0x4,
            FrameType::PushPromise => 0x5,
            FrameType::Ping => 0x6,
            FrameType::GoAway => 0x7,
            FrameType::WindowUpdate => 0x8,
            FrameType::Continuation => 0x9,
            FrameType::Unknown(v) => v,
        }
    }
}

/// Frame flags.
pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// SETTINGS parameter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsId {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingsId {
    /// Unknown identifiers yield `None` and must be ignored.
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x1 => Self::HeaderTableSize,
            0x2 => Self::EnablePush,
            0x3 => Self::MaxConcurrentStreams,
            0x4 => Self::InitialWindowSize,
            0x5 => Self::MaxFrameSize,
            0x6 => Self::MaxHeaderListSize,
            _ => return None,
        })
    }
}

/// HTTP/2 error codes per RFC 9113 Section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Unknown codes are treated as INTERNAL_ERROR.
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Parse a frame header. The reserved bit of the stream id is ignored on receipt.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & MAX_WINDOW_SIZE;

        Some(Self {
            length,
            frame_type: FrameType::from(buf[3]),
            flags: buf[4],
            stream_id,
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u8((self.length >> 8) as u8);
        buf.put_u8(self.length as u8);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id & MAX_WINDOW_SIZE);
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Stream priority (advisory; recorded but not used for scheduling).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

impl Priority {
    fn parse(payload: &mut Bytes) -> Self {
        let raw = payload.get_u32();
        Self {
            exclusive: raw & 0x8000_0000 != 0,
            dependency: raw & MAX_WINDOW_SIZE,
            weight: payload.get_u8(),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self {
            exclusive: false,
            dependency: 0,
            weight: 16,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Whole payload length including padding; this is what flow control counts.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        fragment: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        params: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
    },
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

impl Frame {
    /// Decode a frame payload given its already parsed header.
    pub fn decode(head: &FrameHeader, mut payload: Bytes) -> Result<Frame, H2Error> {
        let sid = head.stream_id;
        let len = payload.len();
        let frame = match head.frame_type {
            FrameType::Data => {
                require_stream(sid, "DATA")?;
                strip_padding(head, &mut payload)?;
                Frame::Data {
                    stream_id: sid,
                    data: payload,
                    end_stream: head.has(flags::END_STREAM),
                    flow_len: len as u32,
                }
            }
            FrameType::Headers => {
                require_stream(sid, "HEADERS")?;
                strip_padding(head, &mut payload)?;
                let priority = if head.has(flags::PRIORITY) {
                    if payload.len() < 5 {
                        return Err(frame_size("HEADERS priority block truncated"));
                    }
                    let priority = Priority::parse(&mut payload);
                    if priority.dependency == sid {
                        return Err(H2Error::stream(
                            sid,
                            ErrorCode::ProtocolError,
                            "stream depends on itself",
                        ));
                    }
                    Some(priority)
                } else {
                    None
                };
                Frame::Headers {
                    stream_id: sid,
                    fragment: payload,
                    end_stream: head.has(flags::END_STREAM),
                    end_headers: head.has(flags::END_HEADERS),
                    priority,
                }
            }
            FrameType::Priority => {
                require_stream(sid, "PRIORITY")?;
                if len != 5 {
                    return Err(H2Error::stream(
                        sid,
                        ErrorCode::FrameSizeError,
                        "PRIORITY payload must be 5 octets",
                    ));
                }
                let priority = Priority::parse(&mut payload);
                if priority.dependency == sid {
                    return Err(H2Error::stream(
                        sid,
                        ErrorCode::ProtocolError,
                        "stream depends on itself",
                    ));
                }
                Frame::Priority {
                    stream_id: sid,
                    priority,
                }
            }
            FrameType::RstStream => {
                require_stream(sid, "RST_STREAM")?;
                if len != 4 {
                    return Err(frame_size("RST_STREAM payload must be 4 octets"));
                }
                Frame::RstStream {
                    stream_id: sid,
                    code: ErrorCode::from_u32(payload.get_u32()),
                }
            }
            FrameType::Settings => {
                require_connection(sid, "SETTINGS")?;
                let ack = head.has(flags::ACK);
                if ack && len != 0 {
                    return Err(frame_size("SETTINGS ack with payload"));
                }
                if len % 6 != 0 {
                    return Err(frame_size("SETTINGS payload not a multiple of 6"));
                }
                let mut params = Vec::with_capacity(len / 6);
                while payload.remaining() >= 6 {
                    params.push((payload.get_u16(), payload.get_u32()));
                }
                Frame::Settings { ack, params }
            }
            FrameType::PushPromise => Frame::PushPromise { stream_id: sid },
            FrameType::Ping => {
                require_connection(sid, "PING")?;
                if len != 8 {
                    return Err(frame_size("PING payload must be 8 octets"));
                }
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Frame::Ping {
                    ack: head.has(flags::ACK),
                    payload: data,
                }
            }
            FrameType::GoAway => {
                require_connection(sid, "GOAWAY")?;
                if len < 8 {
                    return Err(frame_size("GOAWAY payload shorter than 8 octets"));
                }
                Frame::GoAway {
                    last_stream_id: payload.get_u32() & MAX_WINDOW_SIZE,
                    code: ErrorCode::from_u32(payload.get_u32()),
                    debug: payload,
                }
            }
            FrameType::WindowUpdate => {
                if len != 4 {
                    return Err(frame_size("WINDOW_UPDATE payload must be 4 octets"));
                }
                Frame::WindowUpdate {
                    stream_id: sid,
                    increment: payload.get_u32() & MAX_WINDOW_SIZE,
                }
            }
            FrameType::Continuation => {
                require_stream(sid, "CONTINUATION")?;
                Frame::Continuation {
                    stream_id: sid,
                    fragment: payload,
                    end_headers: head.has(flags::END_HEADERS),
                }
            }
            FrameType::Unknown(kind) => Frame::Unknown {
                kind,
                stream_id: sid,
            },
        };
        Ok(frame)
    }

    /// Name used in trace logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::Headers { .. } => "HEADERS",
            Frame::Priority { .. } => "PRIORITY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::PushPromise { .. } => "PUSH_PROMISE",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Continuation { .. } => "CONTINUATION",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }
}

fn require_stream(sid: u32, kind: &str) -> Result<(), H2Error> {
    if sid == 0 {
        return Err(H2Error::protocol(format!("{kind} frame on stream 0")));
    }
    Ok(())
}

fn require_connection(sid: u32, kind: &str) -> Result<(), H2Error> {
    if sid != 0 {
        return Err(H2Error::protocol(format!("{kind} frame on stream {sid}")));
    }
    Ok(())
}

fn frame_size(reason: &str) -> H2Error {
    H2Error::connection(ErrorCode::FrameSizeError, reason)
}

/// Remove the pad length octet and trailing padding of a PADDED frame.
fn strip_padding(head: &FrameHeader, payload: &mut Bytes) -> Result<(), H2Error> {
    if !head.has(flags::PADDED) {
        return Ok(());
    }
    if payload.is_empty() {
        return Err(H2Error::protocol("PADDED frame missing pad length"));
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(H2Error::protocol("padding exceeds frame payload"));
    }
    payload.truncate(payload.len() - pad_len);
    Ok(())
}

fn put_header(buf: &mut BytesMut, length: usize, frame_type: FrameType, flags: u8, stream_id: u32) {
    FrameHeader {
        length: length as u32,
        frame_type,
        flags,
        stream_id,
    }
    .serialize(buf);
}

/// Append a SETTINGS frame.
pub fn encode_settings(buf: &mut BytesMut, params: &[(SettingsId, u32)]) {
    put_header(buf, params.len() * 6, FrameType::Settings, 0, 0);
    for (id, value) in params {
        buf.put_u16(*id as u16);
        buf.put_u32(*value);
    }
}

pub fn encode_settings_ack(buf: &mut BytesMut) {
    put_header(buf, 0, FrameType::Settings, flags::ACK, 0);
}

/// Append a header block as HEADERS followed by as many CONTINUATION frames as needed.
pub fn encode_headers(
    buf: &mut BytesMut,
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) {
    let first_flags = if end_stream { flags::END_STREAM } else { 0 };
    encode_header_block(buf, FrameType::Headers, stream_id, None, block, first_flags, max_frame_size);
}

/// Append a PUSH_PROMISE (plus CONTINUATION frames) reserving `promised_id`.
pub fn encode_push_promise(
    buf: &mut BytesMut,
    stream_id: u32,
    promised_id: u32,
    block: &[u8],
    max_frame_size: usize,
) {
    encode_header_block(
        buf,
        FrameType::PushPromise,
        stream_id,
        Some(promised_id),
        block,
        0,
        max_frame_size,
    );
}

fn encode_header_block(
    buf: &mut BytesMut,
    frame_type: FrameType,
    stream_id: u32,
    promised_id: Option<u32>,
    block: &[u8],
    first_flags: u8,
    max_frame_size: usize,
) {
    let prefix = if promised_id.is_some() { 4 } else { 0 };
    let first_len = block.len().min(max_frame_size - prefix);
    let (first, mut rest) = block.split_at(first_len);

    let end = if rest.is_empty() { flags::END_HEADERS } else { 0 };
    put_header(buf, prefix + first.len(), frame_type, first_flags | end, stream_id);
    if let Some(id) = promised_id {
        buf.put_u32(id & MAX_WINDOW_SIZE);
    }
    buf.extend_from_slice(first);

    while !rest.is_empty() {
        let n = rest.len().min(max_frame_size);
        let (chunk, tail) = rest.split_at(n);
        let end = if tail.is_empty() { flags::END_HEADERS } else { 0 };
        put_header(buf, chunk.len(), FrameType::Continuation, end, stream_id);
        buf.extend_from_slice(chunk);
        rest = tail;
    }
}

/// Append one DATA frame; the caller splits to the peer's max frame size.
pub fn encode_data(buf: &mut BytesMut, stream_id: u32, data: &[u8], end_stream: bool) {
    let f = if end_stream { flags::END_STREAM } else { 0 };
    put_header(buf, data.len(), FrameType::Data, f, stream_id);
    buf.extend_from_slice(data);
}

pub fn encode_rst_stream(buf: &mut BytesMut, stream_id: u32, code: ErrorCode) {
    put_header(buf, 4, FrameType::RstStream, 0, stream_id);
    buf.put_u32(code as u32);
}

pub fn encode_ping(buf: &mut BytesMut, payload: [u8; 8], ack: bool) {
    put_header(buf, 8, FrameType::Ping, if ack { flags::ACK } else { 0 }, 0);
    buf.extend_from_slice(&payload);
}

pub fn encode_goaway(buf: &mut BytesMut, last_stream_id: u32, code: ErrorCode, debug: &[u8]) {
    put_header(buf, 8 + debug.len(), FrameType::GoAway, 0, 0);
    buf.put_u32(last_stream_id & MAX_WINDOW_SIZE);
    buf.put_u32(code as u32);
    buf.extend_from_slice(debug);
}

pub fn encode_window_update(buf: &mut BytesMut, stream_id: u32, increment: u32) {
    put_header(buf, 4, FrameType::WindowUpdate, 0, stream_id);
    buf.put_u32(increment & MAX_WINDOW_SIZE);
}

/// Parse the payload of a SETTINGS frame carried outside of a frame (HTTP2-Settings).
pub fn parse_settings_payload(payload: &[u8]) -> Option<Vec<(u16, u32)>> {
    if payload.len() % 6 != 0 {
        return None;
    }
    Some(
        payload
            .chunks_exact(6)
            .map(|c| {
                (
                    u16::from_be_bytes([c[0], c[1]]),
                    u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
                )
            })
            .collect(),
    )
}
