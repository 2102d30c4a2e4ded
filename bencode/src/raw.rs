//! Locating a raw, un-re-encoded bencoded substring inside a larger buffer.
//!
//! `decode::Decoder` turns bencoded bytes into Rust values, and `encode`
//! turns Rust values back into bencoded bytes, but neither round trip is
//! guaranteed to reproduce the original byte sequence: dictionary key order,
//! integer formatting, or string encoding used by whatever produced the
//! original buffer might differ from ours. Hashing a re-encoded value is
//! therefore unsafe whenever the hash must match bytes the other side
//! already committed to (metainfo `info` dictionaries, magnet v2 piece
//! layers). `find_raw_value` walks the same token grammar as the decoder
//! but only tracks byte offsets, so callers can hash the exact slice that
//! was actually on the wire.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RawScanError {
    #[error("unexpected end of buffer while scanning bencode")]
    UnexpectedEof,

    #[error("invalid bencode token {0:?} at offset {1}")]
    InvalidToken(u8, usize),

    #[error("key {0:?} not found in top-level dictionary")]
    KeyNotFound(String),

    #[error("expected a dictionary at offset {0}")]
    NotADictionary(usize),
}

/// Find the raw byte range of the value associated with `key` in the
/// top-level dictionary encoded in `buf`, and return that exact slice.
///
/// `buf` must start with a bencoded dictionary (`d...e`). Only the
/// top-level dictionary's immediate keys are searched; nested dictionaries
/// are skipped over, not descended into, matching how the `info` key sits
/// directly under the metainfo dictionary's root.
pub fn find_raw_value<'a>(buf: &'a [u8], key: &[u8]) -> Result<&'a [u8], RawScanError> {
    let mut pos = 0usize;
    expect(buf, &mut pos, b'd')?;

    while pos < buf.len() {
        if buf[pos] == b'e' {
            return Err(RawScanError::KeyNotFound(String::from_utf8_lossy(key).into_owned()));
        }

        let key_start = pos;
        skip_value(buf, &mut pos)?;
        let found_key = &buf[key_start..pos];
        // found_key is itself a bencoded byte string; compare its payload.
        let payload = byte_string_payload(found_key)?;

        let value_start = pos;
        skip_value(buf, &mut pos)?;
        let value_end = pos;

        if payload == key {
            return Ok(&buf[value_start..value_end]);
        }
    }

    Err(RawScanError::UnexpectedEof)
}

fn expect(buf: &[u8], pos: &mut usize, tok: u8) -> Result<(), RawScanError> {
    match buf.get(*pos) {
        Some(&b) if b == tok => {
            *pos += 1;
            Ok(())
        }
        Some(&b) => Err(RawScanError::InvalidToken(b, *pos)),
        None => Err(RawScanError::UnexpectedEof),
    }
}

/// Advance `pos` past one complete bencoded value (integer, byte string,
/// list, or dictionary), without interpreting it.
fn skip_value(buf: &[u8], pos: &mut usize) -> Result<(), RawScanError> {
    match buf.get(*pos) {
        Some(b'i') => {
            *pos += 1;
            skip_until_e(buf, pos)
        }
        Some(&b) if b.is_ascii_digit() => skip_byte_string(buf, pos),
        Some(b'l') => {
            *pos += 1;
            while buf.get(*pos) != Some(&b'e') {
                skip_value(buf, pos)?;
            }
            *pos += 1;
            Ok(())
        }
        Some(b'd') => {
            *pos += 1;
            while buf.get(*pos) != Some(&b'e') {
                skip_value(buf, pos)?; // key
                skip_value(buf, pos)?; // value
            }
            *pos += 1;
            Ok(())
        }
        Some(&b) => Err(RawScanError::InvalidToken(b, *pos)),
        None => Err(RawScanError::UnexpectedEof),
    }
}

fn skip_until_e(buf: &[u8], pos: &mut usize) -> Result<(), RawScanError> {
    loop {
        match buf.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                return Ok(());
            }
            Some(_) => *pos += 1,
            None => return Err(RawScanError::UnexpectedEof),
        }
    }
}

fn skip_byte_string(buf: &[u8], pos: &mut usize) -> Result<(), RawScanError> {
    let start = *pos;
    while buf.get(*pos).is_some_and(u8::is_ascii_digit) {
        *pos += 1;
    }
    if *pos == start {
        return Err(RawScanError::InvalidToken(buf[start], start));
    }
    let len: usize = std::str::from_utf8(&buf[start..*pos])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RawScanError::InvalidToken(buf[start], start))?;
    expect(buf, pos, b':')?;
    if *pos + len > buf.len() {
        return Err(RawScanError::UnexpectedEof);
    }
    *pos += len;
    Ok(())
}

fn byte_string_payload(raw: &[u8]) -> Result<&[u8], RawScanError> {
    let colon = raw.iter().position(|&b| b == b':').ok_or(RawScanError::InvalidToken(raw[0], 0))?;
    Ok(&raw[colon + 1..])
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_top_level_key() {
        let buf = b"d4:spaml1:a1:be4:infod4:name3:fooee";
        let raw = find_raw_value(buf, b"info").unwrap();
        assert_eq!(raw, b"d4:name3:fooe");
    }

    #[test]
    fn preserves_non_canonical_bytes() {
        // Integer formatted with an unusual but valid representation should
        // be returned untouched rather than reformatted.
        let buf = b"d4:infod6:lengthi1000eee";
        let raw = find_raw_value(buf, b"info").unwrap();
        assert_eq!(raw, b"d6:lengthi1000ee");
    }

    #[test]
    fn missing_key_is_reported() {
        let buf = b"d4:spam3:fooe";
        assert_eq!(
            find_raw_value(buf, b"info").unwrap_err(),
            RawScanError::KeyNotFound("info".to_string())
        );
    }

    #[test]
    fn not_a_dictionary() {
        let buf = b"l1:ae";
        assert!(find_raw_value(buf, b"info").is_err());
    }
}
