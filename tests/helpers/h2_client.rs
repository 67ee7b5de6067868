//! Frame-level HTTP/2 client for driving the server in tests.
//!
//! Writes raw frames and records what comes back per stream, keeping the
//! HPACK decoder in step with every header block the server sends.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use drover::transport::h2::hpack;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const RST_STREAM: u8 = 0x3;
pub const SETTINGS: u8 = 0x4;
pub const PUSH_PROMISE: u8 = 0x5;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;
pub const CONTINUATION: u8 = 0x9;

pub const END_STREAM: u8 = 0x1;
pub const ACK: u8 = 0x1;
pub const END_HEADERS: u8 = 0x4;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// First four payload octets as a big-endian integer (error code,
    /// increment, promised id).
    pub fn u32_at(&self, offset: usize) -> u32 {
        let p = &self.payload[offset..offset + 4];
        u32::from_be_bytes([p[0], p[1], p[2], p[3]])
    }
}

/// Everything received on one stream.
#[derive(Debug, Default)]
pub struct StreamLog {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub trailers: Vec<(String, String)>,
    pub reset: Option<u32>,
    pub ended: bool,
}

impl StreamLog {
    pub fn status(&self) -> Option<u16> {
        self.header(":status").and_then(|s| s.parse().ok())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        self.trailers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Promise {
    pub parent: u32,
    pub promised: u32,
    pub fields: Vec<(String, String)>,
}

pub struct H2Client<T> {
    io: T,
    buf: BytesMut,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,
    pub streams: HashMap<u32, StreamLog>,
    pub promises: Vec<Promise>,
    pub server_settings: Vec<(u16, u32)>,
    /// (last stream id, error code) of a received GOAWAY.
    pub goaway: Option<(u32, u32)>,
    /// Stream whose header block is still open, with the fragments so far.
    continuation: Option<(u8, u32, u8, BytesMut)>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> H2Client<T> {
    pub fn new(io: T) -> Self {
        Self::with_buffer(io, BytesMut::new())
    }

    /// Continue on a transport whose first bytes were already read.
    pub fn with_buffer(io: T, buf: BytesMut) -> Self {
        Self {
            io,
            buf,
            encoder: hpack::Encoder::new(),
            decoder: hpack::Decoder::default(),
            streams: HashMap::new(),
            promises: Vec::new(),
            server_settings: Vec::new(),
            goaway: None,
            continuation: None,
        }
    }

    pub fn into_inner(self) -> T {
        self.io
    }

    /// Send the preface with `settings`, then exchange SETTINGS and ACKs.
    pub async fn handshake(&mut self, settings: &[(u16, u32)]) -> io::Result<()> {
        let mut out = PREFACE.to_vec();
        out.extend_from_slice(&frame(SETTINGS, 0, 0, &settings_payload(settings)));
        self.send_raw(&out).await?;

        let (mut got_settings, mut got_ack) = (false, false);
        while !(got_settings && got_ack) {
            let f = self.next_frame().await?;
            match (f.kind, f.has(ACK)) {
                (SETTINGS, false) => got_settings = true,
                (SETTINGS, true) => got_ack = true,
                _ => {}
            }
        }
        Ok(())
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.io.write_all(bytes).await?;
        self.io.flush().await
    }

    pub async fn send_frame(&mut self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> io::Result<()> {
        self.send_raw(&frame(kind, flags, stream_id, payload)).await
    }

    /// Encode a HEADERS frame without sending it.
    pub fn headers_frame(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) -> Vec<u8> {
        let mut block = BytesMut::new();
        self.encoder
            .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())), &mut block);
        let flags = END_HEADERS | if end_stream { END_STREAM } else { 0 };
        frame(HEADERS, flags, stream_id, &block)
    }

    pub async fn send_headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) -> io::Result<()> {
        let bytes = self.headers_frame(stream_id, fields, end_stream);
        self.send_raw(&bytes).await
    }

    pub async fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) -> io::Result<()> {
        let flags = if end_stream { END_STREAM } else { 0 };
        self.send_frame(DATA, flags, stream_id, data).await
    }

    pub async fn send_settings(&mut self, settings: &[(u16, u32)]) -> io::Result<()> {
        self.send_frame(SETTINGS, 0, 0, &settings_payload(settings)).await
    }

    pub async fn send_window_update(&mut self, stream_id: u32, increment: u32) -> io::Result<()> {
        self.send_frame(WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes()).await
    }

    pub async fn send_ping(&mut self, payload: [u8; 8]) -> io::Result<()> {
        self.send_frame(PING, 0, 0, &payload).await
    }

    async fn fill(&mut self) -> io::Result<()> {
        self.buf.reserve(16 * 1024);
        match timeout(READ_TIMEOUT, self.io.read_buf(&mut self.buf)).await {
            Ok(Ok(0)) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "no frame from server")),
        }
    }

    /// Read and record the next frame. SETTINGS are acknowledged.
    pub async fn next_frame(&mut self) -> io::Result<RawFrame> {
        loop {
            if self.buf.len() >= 9 {
                let len = u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]) as usize;
                if self.buf.len() >= 9 + len {
                    let head = self.buf.split_to(9);
                    let f = RawFrame {
                        kind: head[3],
                        flags: head[4],
                        stream_id: u32::from_be_bytes([head[5] & 0x7f, head[6], head[7], head[8]]),
                        payload: self.buf.split_to(len).freeze(),
                    };
                    self.record(&f).await?;
                    return Ok(f);
                }
            }
            self.fill().await?;
        }
    }

    /// Like [`next_frame`](Self::next_frame), but `None` if nothing arrives in `wait`.
    pub async fn try_next_frame(&mut self, wait: Duration) -> io::Result<Option<RawFrame>> {
        match timeout(wait, self.next_frame()).await {
            Ok(f) => f.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Read until `stream_id` ends or is reset.
    pub async fn read_response(&mut self, stream_id: u32) -> io::Result<&StreamLog> {
        loop {
            let done = self
                .streams
                .get(&stream_id)
                .is_some_and(|s| s.ended || s.reset.is_some());
            if done {
                return Ok(&self.streams[&stream_id]);
            }
            self.next_frame().await?;
        }
    }

    /// Read until a frame of `kind` arrives.
    pub async fn expect(&mut self, kind: u8) -> io::Result<RawFrame> {
        loop {
            let f = self.next_frame().await?;
            if f.kind == kind {
                return Ok(f);
            }
        }
    }

    /// Wait for the server to close the connection.
    pub async fn read_to_eof(&mut self) -> io::Result<()> {
        loop {
            match self.next_frame().await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn decode(&mut self, block: &[u8]) -> io::Result<Vec<(String, String)>> {
        let fields = self
            .decoder
            .decode(block, usize::MAX)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(fields
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect())
    }

    fn finish_block(&mut self, kind: u8, stream_id: u32, flags: u8, block: &[u8]) -> io::Result<()> {
        if kind == PUSH_PROMISE {
            let promised = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) & 0x7fff_ffff;
            let fields = self.decode(&block[4..])?;
            self.promises.push(Promise {
                parent: stream_id,
                promised,
                fields,
            });
            return Ok(());
        }
        let fields = self.decode(block)?;
        let log = self.streams.entry(stream_id).or_default();
        if log.headers.is_empty() {
            log.headers = fields;
        } else {
            log.trailers = fields;
        }
        if flags & END_STREAM != 0 {
            log.ended = true;
        }
        Ok(())
    }

    async fn record(&mut self, f: &RawFrame) -> io::Result<()> {
        match f.kind {
            DATA => {
                let log = self.streams.entry(f.stream_id).or_default();
                log.body.extend_from_slice(&f.payload);
                if f.has(END_STREAM) {
                    log.ended = true;
                }
            }
            HEADERS | PUSH_PROMISE => {
                if f.has(END_HEADERS) {
                    self.finish_block(f.kind, f.stream_id, f.flags, &f.payload)?;
                } else {
                    self.continuation = Some((f.kind, f.stream_id, f.flags, BytesMut::from(&f.payload[..])));
                }
            }
            CONTINUATION => {
                if let Some((kind, stream_id, flags, mut block)) = self.continuation.take() {
                    block.extend_from_slice(&f.payload);
                    if f.has(END_HEADERS) {
                        self.finish_block(kind, stream_id, flags, &block)?;
                    } else {
                        self.continuation = Some((kind, stream_id, flags, block));
                    }
                }
            }
            RST_STREAM => {
                self.streams.entry(f.stream_id).or_default().reset = Some(f.u32_at(0));
            }
            SETTINGS if !f.has(ACK) => {
                let mut p = f.payload.clone();
                while p.remaining() >= 6 {
                    self.server_settings.push((p.get_u16(), p.get_u32()));
                }
                // the server may already be gone
                let _ = self.send_frame(SETTINGS, ACK, 0, &[]).await;
            }
            GOAWAY => {
                self.goaway = Some((f.u32_at(0) & 0x7fff_ffff, f.u32_at(4)));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Encode one frame.
pub fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(9 + payload.len());
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.push(kind);
    out.push(flags);
    out.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn settings_payload(settings: &[(u16, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(settings.len() * 6);
    for (id, value) in settings {
        payload.extend_from_slice(&id.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());
    }
    payload
}

/// Request pseudo-headers for `method path` on example.com.
pub fn request<'a>(method: &'a str, path: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        (":method", method),
        (":scheme", "http"),
        (":authority", "example.com"),
        (":path", path),
    ]
}
