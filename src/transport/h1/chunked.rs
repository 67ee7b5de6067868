//! Chunked transfer coding (RFC 9112 Section 7.1).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::HeaderMap;

use super::parse::{parse_chunk_size, parse_trailers};
use crate::error::ClientError;

/// Upper bound on a chunk-size line including extensions.
const MAX_SIZE_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
    Done,
}

/// Output of one decoding step.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Chunk {
    Data(Bytes),
    /// Terminal chunk seen, with trailer fields if any were sent.
    End(Option<HeaderMap>),
}

/// Incremental decoder for a chunked request body.
///
/// Fed from the connection's read buffer; consumes only what belongs to the
/// body so pipelined bytes stay in place.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: State,
    header_limit: usize,
}

impl ChunkedDecoder {
    /// `header_limit` bounds the trailer section.
    pub fn new(header_limit: usize) -> Self {
        Self {
            state: State::Size,
            header_limit,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Advance over `buf`. `Ok(None)` means more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Chunk>, ClientError> {
        loop {
            match self.state {
                State::Size => {
                    let Some((size, used)) = parse_chunk_size(buf)? else {
                        if buf.len() > MAX_SIZE_LINE {
                            return Err(ClientError::bad_request("chunk size line too long"));
                        }
                        return Ok(None);
                    };
                    buf.advance(used);
                    self.state = if size == 0 { State::Trailers } else { State::Data(size) };
                }
                State::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 { State::DataCrlf } else { State::Data(left) };
                    return Ok(Some(Chunk::Data(data)));
                }
                State::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ClientError::bad_request("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.state = State::Size;
                }
                State::Trailers => {
                    let Some((trailers, used)) = parse_trailers(buf)? else {
                        if buf.len() > self.header_limit {
                            return Err(ClientError::headers_too_large());
                        }
                        return Ok(None);
                    };
                    buf.advance(used);
                    self.state = State::Done;
                    let trailers = (!trailers.is_empty()).then_some(trailers);
                    return Ok(Some(Chunk::End(trailers)));
                }
                State::Done => return Ok(None),
            }
        }
    }
}

/// Frame `data` as one chunk.
pub(crate) fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// Terminal chunk followed by trailer fields.
pub(crate) fn encode_last_chunk(trailers: Option<&HeaderMap>, out: &mut BytesMut) {
    out.put_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        for (name, value) in trailers {
            out.put_slice(name.as_str().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
    }
    out.put_slice(b"\r\n");
}
