//! HPACK prefixed integers (RFC 7541 Section 5.1).

use bytes::{BufMut, BytesMut};

use super::HpackError;

/// Append `value` using an N-bit prefix; `flags` fills the bits above the prefix.
pub fn encode(value: usize, prefix_bits: u8, flags: u8, out: &mut BytesMut) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        out.put_u8(flags | value as u8);
        return;
    }
    out.put_u8(flags | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        out.put_u8((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    out.put_u8(rest as u8);
}

/// Decode an N-bit prefixed integer at `*pos`, advancing past it.
pub fn decode(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize, HpackError> {
    let max = (1usize << prefix_bits) - 1;
    let first = *buf.get(*pos).ok_or(HpackError::UnexpectedEof)?;
    *pos += 1;
    let mut value = (first as usize) & max;
    if value < max {
        return Ok(value);
    }

    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos).ok_or(HpackError::UnexpectedEof)?;
        *pos += 1;
        // Anything past 28 bits of continuation cannot be a sane length or index.
        if shift > 21 {
            return Err(HpackError::IntegerOverflow);
        }
        value += ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}
