//! Length-prefixed framing for keys and values.
//!
//! Every byte string is stored as an unsigned LEB128 length followed by the
//! raw bytes. Zero-length strings encode to a single `0x00` byte.

use std::io::Read;

use crate::{MassIndexError, Result};

/// Longest possible LEB128 encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `value` as an unsigned LEB128 varint.
#[inline]
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint at `offset`, returning the value and the offset just past it.
#[inline]
pub fn decode_varint(buf: &[u8], offset: usize) -> Result<(u64, usize)> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    let mut pos = offset;
    loop {
        let Some(&byte) = buf.get(pos) else {
            return Err(MassIndexError::corrupt(format!(
                "truncated length prefix at offset {}",
                offset
            )));
        };
        pos += 1;

        let payload = (byte & 0x7F) as u64;
        // the tenth byte carries the top bit of a u64 and must end the varint
        if shift >= 63 && (payload > 1 || byte & 0x80 != 0) {
            return Err(MassIndexError::corrupt(format!(
                "length prefix overflows u64 at offset {}",
                offset
            )));
        }
        result |= payload << shift;
        if byte & 0x80 == 0 {
            return Ok((result, pos));
        }
        shift += 7;
    }
}

/// Returns the framed form of `bytes`.
pub fn encode(bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bytes.len() + MAX_VARINT_LEN);
    encode_into(&mut buf, bytes);
    buf
}

/// Appends the framed form of `bytes` to `buf`.
pub fn encode_into(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_varint(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

/// Writes the framed form of `bytes` to an `io::Write` sink.
pub fn write_framed<W: std::io::Write>(writer: &mut W, bytes: &[u8]) -> std::io::Result<usize> {
    let mut prefix = Vec::with_capacity(MAX_VARINT_LEN);
    encode_varint(bytes.len() as u64, &mut prefix);
    writer.write_all(&prefix)?;
    writer.write_all(bytes)?;
    Ok(prefix.len() + bytes.len())
}

/// Decodes the framed string starting at `offset`.
///
/// Returns the payload and the offset of the next frame.
///
/// # Errors
///
/// Returns [`MassIndexError::CorruptData`] when the prefix is truncated or
/// declares more bytes than remain in `buf`.
pub fn decode(buf: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let (length, start) = decode_varint(buf, offset)?;
    let remaining = (buf.len() - start) as u64;
    if length > remaining {
        return Err(MassIndexError::corrupt(format!(
            "length prefix {} at offset {} exceeds remaining {} bytes",
            length, offset, remaining
        )));
    }
    let end = start + length as usize;
    Ok((&buf[start..end], end))
}

/// Reads one framed string from a stream.
///
/// Returns `None` when the stream ends cleanly before a new frame. A frame cut
/// short is [`MassIndexError::CorruptData`].
pub fn read_framed<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; MAX_VARINT_LEN];
    let mut len = 0;
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) if len == 0 => return Ok(None),
            Ok(0) => return Err(MassIndexError::corrupt("truncated length prefix")),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
        prefix[len] = byte[0];
        len += 1;
        if byte[0] & 0x80 == 0 {
            break;
        }
        if len == MAX_VARINT_LEN {
            return Err(MassIndexError::corrupt("length prefix overflows u64"));
        }
    }
    let (length, _) = decode_varint(&prefix[..len], 0)?;

    let mut data = Vec::new();
    Read::take(&mut *reader, length).read_to_end(&mut data)?;
    if data.len() as u64 != length {
        return Err(MassIndexError::corrupt(format!(
            "frame of {} bytes cut short after {}",
            length,
            data.len()
        )));
    }
    Ok(Some(data))
}
