//! HPACK header compression (RFC 7541).
//!
//! One [`Decoder`] per connection for request header blocks and one
//! [`Encoder`] for response and push-promise blocks. Both own a dynamic
//! table whose state must survive across blocks, so a block must be fully
//! decoded even when the stream it belongs to is refused.

mod huffman;
mod integer;
mod table;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub use table::DEFAULT_TABLE_SIZE;
use table::{Match, Table, ENTRY_OVERHEAD};

/// HPACK encoding/decoding errors. All map to COMPRESSION_ERROR except
/// [`HpackError::HeaderListTooLarge`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HpackError {
    #[error("unexpected end of header block")]
    UnexpectedEof,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid Huffman code")]
    InvalidHuffmanCode,

    #[error("invalid table index: {0}")]
    InvalidIndex(usize),

    #[error("table size update to {0} exceeds the advertised limit")]
    InvalidTableSizeUpdate(usize),

    #[error("table size update after the first header field")]
    MisplacedTableSizeUpdate,

    #[error("decoded header list exceeds {0} octets")]
    HeaderListTooLarge(usize),
}

/// Request header block decoder.
#[derive(Debug)]
pub struct Decoder {
    table: Table,
    /// Upper bound a size update may request, from our SETTINGS_HEADER_TABLE_SIZE.
    max_table_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(DEFAULT_TABLE_SIZE)
    }
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: Table::new(max_table_size),
            max_table_size,
        }
    }

    /// Decode a complete header block into (name, value) pairs in wire order.
    ///
    /// `max_list_size` bounds the RFC 9113 header list size (names, values and
    /// 32 octets per field).
    pub fn decode(
        &mut self,
        block: &[u8],
        max_list_size: usize,
    ) -> Result<Vec<(Bytes, Bytes)>, HpackError> {
        let mut fields = Vec::new();
        let mut list_size = 0usize;
        let mut decoded = 0usize;
        let mut pos = 0usize;

        while pos < block.len() {
            let byte = block[pos];
            let (name, value) = if byte & 0x80 != 0 {
                // Indexed field
                let index = integer::decode(block, &mut pos, 7)?;
                self.table.get(index).ok_or(HpackError::InvalidIndex(index))?
            } else if byte & 0xc0 == 0x40 {
                // Literal with incremental indexing
                let (name, value) = self.literal(block, &mut pos, 6)?;
                self.table.insert(name.clone(), value.clone());
                (name, value)
            } else if byte & 0xe0 == 0x20 {
                if decoded > 0 {
                    return Err(HpackError::MisplacedTableSizeUpdate);
                }
                let size = integer::decode(block, &mut pos, 5)?;
                if size > self.max_table_size {
                    return Err(HpackError::InvalidTableSizeUpdate(size));
                }
                self.table.set_max_size(size);
                continue;
            } else {
                // Literal without indexing (0000) or never indexed (0001)
                self.literal(block, &mut pos, 4)?
            };

            decoded += 1;
            list_size += name.len() + value.len() + ENTRY_OVERHEAD;
            // keep decoding past the limit so the dynamic table stays in sync
            if list_size <= max_list_size {
                fields.push((name, value));
            }
        }

        if list_size > max_list_size {
            return Err(HpackError::HeaderListTooLarge(max_list_size));
        }
        Ok(fields)
    }

    fn literal(
        &self,
        block: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<(Bytes, Bytes), HpackError> {
        let index = integer::decode(block, pos, prefix_bits)?;
        let name = if index == 0 {
            read_string(block, pos)?
        } else {
            self.table.get(index).ok_or(HpackError::InvalidIndex(index))?.0
        };
        let value = read_string(block, pos)?;
        Ok((name, value))
    }
}

fn read_string(block: &[u8], pos: &mut usize) -> Result<Bytes, HpackError> {
    let huffman = *block.get(*pos).ok_or(HpackError::UnexpectedEof)? & 0x80 != 0;
    let len = integer::decode(block, pos, 7)?;
    let end = pos.checked_add(len).ok_or(HpackError::IntegerOverflow)?;
    let raw = block.get(*pos..end).ok_or(HpackError::UnexpectedEof)?;
    *pos = end;
    if huffman {
        Ok(Bytes::from(huffman::decode(raw)?))
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

/// Fields whose values are emitted as never-indexed literals.
const SENSITIVE: &[&[u8]] = &[b"authorization", b"proxy-authorization", b"cookie", b"set-cookie"];

/// Values longer than this are not worth a dynamic table slot.
const MAX_INDEXED_VALUE: usize = 256;

/// Response header block encoder.
#[derive(Debug)]
pub struct Encoder {
    table: Table,
    /// Size update owed to the peer at the start of the next block.
    pending_update: Option<usize>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self {
            table: Table::new(DEFAULT_TABLE_SIZE),
            pending_update: None,
        }
    }
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. We never grow beyond the default.
    pub fn set_max_table_size(&mut self, size: usize) {
        let size = size.min(DEFAULT_TABLE_SIZE);
        if size != self.table.max_size() {
            self.table.set_max_size(size);
            self.pending_update = Some(size);
        }
    }

    /// Append the encoding of `fields` to `out`. Names must already be lowercase.
    pub fn encode<'a, I>(&mut self, fields: I, out: &mut BytesMut)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        if let Some(size) = self.pending_update.take() {
            integer::encode(size, 5, 0x20, out);
        }
        for (name, value) in fields {
            self.encode_field(name, value, out);
        }
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], out: &mut BytesMut) {
        let sensitive = SENSITIVE.contains(&name);
        let found = self.table.find(name, value);

        if let (Match::Full(index), false) = (found, sensitive) {
            integer::encode(index, 7, 0x80, out);
            return;
        }

        let name_index = match found {
            Match::Full(i) | Match::Name(i) => i,
            Match::None => 0,
        };

        if sensitive {
            integer::encode(name_index, 4, 0x10, out);
        } else if value.len() > MAX_INDEXED_VALUE {
            integer::encode(name_index, 4, 0x00, out);
        } else {
            integer::encode(name_index, 6, 0x40, out);
        }
        if name_index == 0 {
            write_string(name, out);
        }
        write_string(value, out);

        if !sensitive && value.len() <= MAX_INDEXED_VALUE {
            self.table
                .insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
        }
    }
}

fn write_string(s: &[u8], out: &mut BytesMut) {
    let huff_len = huffman::encoded_len(s);
    if huff_len < s.len() {
        integer::encode(huff_len, 7, 0x80, out);
        huffman::encode(s, out);
    } else {
        integer::encode(s.len(), 7, 0x00, out);
        out.extend_from_slice(s);
    }
}
