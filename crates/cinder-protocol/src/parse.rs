//! Restartable RESP2/RESP3 decoder.
//!
//! Decoding is a pure function of the bytes buffered so far. Reading from
//! the transport is the caller's job; nothing here does I/O.
//!
//! A `Cursor<&[u8]>` walks the buffer without consuming it, so a call that
//! runs out of bytes leaves the buffer untouched for the next attempt. No
//! state is carried between calls: a frame split across reads is simply
//! re-scanned from its first byte once the buffer has grown. Replies are
//! bounded in practice, so the re-scan is cheaper than keeping a resumable
//! state machine around.
//!
//! # Incomplete vs malformed
//!
//! Running out of bytes anywhere inside a frame yields `Ok(None)`. Any
//! byte sequence that can never become a valid frame, no matter what
//! arrives next, is a [`ProtocolError`]. Callers must treat the latter as
//! fatal for the stream: there is no way to find the next frame boundary.
//!
//! # Attributes
//!
//! An attribute frame (`|`) is not a value on its own. It is parsed
//! together with the value that follows it and returned as
//! [`Frame::Attributed`], so a reader never mistakes the metadata for a
//! reply.
//!
//! # Zero-copy bulk strings
//!
//! [`parse_frame_bytes`] hands out bulk payloads as slices of the caller's
//! `Bytes`. [`parse_frame`] and [`parse_frame_at`] work on plain slices and
//! copy each payload.

use std::io::Cursor;

use bytes::Bytes;
use ordered_float::OrderedFloat;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Deepest aggregate nesting accepted. Decoding recurses once per level.
const MAX_NESTING_DEPTH: usize = 64;

/// Largest element count accepted for one aggregate.
const MAX_ARRAY_ELEMENTS: usize = 1_048_576;

/// Largest blob payload accepted, in bytes.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on up-front allocation for an aggregate; a declared count
/// is not trusted until its elements actually arrive.
const PREALLOC_CAP: usize = 1024;

/// Decodes one frame from the front of `buf`, slicing blob payloads out of
/// `buf` instead of copying them.
///
/// `Ok(None)` means the frame is not complete yet. On success the second
/// element is the number of bytes the frame occupies.
#[inline]
pub fn parse_frame_bytes(buf: &Bytes) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf.as_ref());
    finish(try_parse(&mut cursor, Some(buf), 0), &cursor)
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete and
/// `Ok(Some((frame, consumed)))` once it is whole. Blob payloads are
/// copied; see [`parse_frame_bytes`] for the slicing variant.
#[inline]
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    parse_frame_at(buf, 0)
}

/// Parses one frame starting at `start`.
///
/// `consumed` in the result is counted from `start`. A `start` at or past
/// the end of the buffer is reported as incomplete.
pub fn parse_frame_at(buf: &[u8], start: usize) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(input) = buf.get(start..) else {
        return Ok(None);
    };
    if input.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(input);
    finish(try_parse(&mut cursor, None, 0), &cursor)
}

fn finish(
    result: Result<Frame, ProtocolError>,
    cursor: &Cursor<&[u8]>,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    match result {
        Ok(frame) => Ok(Some((frame, cursor.position() as usize))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decodes the frame at the cursor. `Incomplete` propagates up and becomes
/// `Ok(None)` at the entry points. Blobs are sliced from `src` when given.
fn try_parse(
    cursor: &mut Cursor<&[u8]>,
    src: Option<&Bytes>,
    depth: usize,
) -> Result<Frame, ProtocolError> {
    let prefix = read_byte(cursor)?;

    match prefix {
        b'+' => {
            let line = read_line(cursor)?;
            Ok(Frame::Simple(utf8(line, "simple string")?.to_owned()))
        }
        b'-' => {
            let line = read_line(cursor)?;
            Ok(Frame::Error(utf8(line, "error string")?.to_owned()))
        }
        b':' => {
            let val = read_integer_line(cursor)?;
            Ok(Frame::Integer(val))
        }
        b'$' => match read_blob(cursor, src)? {
            Some(data) => Ok(Frame::Bulk(data)),
            None => Ok(Frame::NullBulk),
        },
        b'!' => match read_blob(cursor, src)? {
            Some(data) => Ok(Frame::Error(utf8(&data, "bulk error")?.to_owned())),
            None => Err(ProtocolError::InvalidFrameLength(-1)),
        },
        b'=' => {
            let Some(data) = read_blob(cursor, src)? else {
                return Err(ProtocolError::InvalidFrameLength(-1));
            };
            if data.len() < 4 || data[3] != b':' {
                return Err(ProtocolError::InvalidVerbatim);
            }
            let format = [data[0], data[1], data[2]];
            Ok(Frame::Verbatim {
                format,
                data: data.slice(4..),
            })
        }
        b'*' => {
            let count = read_integer_line(cursor)?;
            if count == -1 {
                return Ok(Frame::NullArray);
            }
            let items = read_elements(cursor, src, depth, count)?;
            Ok(Frame::Array(items))
        }
        b'~' => {
            let count = read_integer_line(cursor)?;
            Ok(Frame::Set(read_elements(cursor, src, depth, count)?))
        }
        b'>' => {
            let count = read_integer_line(cursor)?;
            Ok(Frame::Push(read_elements(cursor, src, depth, count)?))
        }
        b'%' => {
            let count = read_integer_line(cursor)?;
            Ok(Frame::Map(read_pairs(cursor, src, depth, count)?))
        }
        b'|' => {
            let count = read_integer_line(cursor)?;
            let attributes = read_pairs(cursor, src, depth, count)?;
            // counts as one level so chained attributes stay bounded
            let value = try_parse(cursor, src, depth + 1)?;
            Ok(Frame::Attributed {
                attributes,
                value: Box::new(value),
            })
        }
        b'_' => {
            if !read_line(cursor)?.is_empty() {
                return Err(ProtocolError::InvalidNull);
            }
            Ok(Frame::Null)
        }
        b',' => {
            let line = read_line(cursor)?;
            Ok(Frame::Double(OrderedFloat(parse_double(line)?)))
        }
        b'#' => match read_line(cursor)? {
            b"t" => Ok(Frame::Boolean(true)),
            b"f" => Ok(Frame::Boolean(false)),
            _ => Err(ProtocolError::InvalidBoolean),
        },
        b'(' => {
            let line = read_line(cursor)?;
            let digits = match line.first() {
                Some(b'-') | Some(b'+') => &line[1..],
                _ => line,
            };
            if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
                return Err(ProtocolError::InvalidBigNumber);
            }
            Ok(Frame::BigNumber(utf8(line, "big number")?.to_owned()))
        }
        other => Err(ProtocolError::InvalidPrefix(other)),
    }
}

/// Reads a length-prefixed blob (`$`, `!`, `=`). `Ok(None)` is the `-1`
/// null sentinel; callers decide whether that sentinel is legal.
fn read_blob(
    cursor: &mut Cursor<&[u8]>,
    src: Option<&Bytes>,
) -> Result<Option<Bytes>, ProtocolError> {
    let len = read_integer_line(cursor)?;
    if len == -1 {
        return Ok(None);
    }
    if len < 0 {
        return Err(ProtocolError::InvalidFrameLength(len));
    }
    if len > MAX_BULK_LEN {
        return Err(ProtocolError::BulkStringTooLarge(len as usize));
    }
    let len = len as usize;

    let pos = cursor.position() as usize;

    // each terminator byte is checked as soon as it is buffered, so a bad
    // one is reported even while the other is still in flight
    {
        let buf = cursor.get_ref();
        for (offset, expected) in [(len, b'\r'), (len + 1, b'\n')] {
            match buf.get(pos + offset) {
                Some(&byte) if byte != expected => {
                    return Err(ProtocolError::MissingTerminator(len));
                }
                Some(_) => {}
                None => return Err(ProtocolError::Incomplete),
            }
        }
    }

    cursor.set_position((pos + len + 2) as u64);

    let data = match src {
        Some(b) => b.slice(pos..pos + len),
        None => Bytes::copy_from_slice(&cursor.get_ref()[pos..pos + len]),
    };
    Ok(Some(data))
}

/// Validates an aggregate count and returns the nesting depth for children.
fn check_aggregate(depth: usize, count: i64) -> Result<(usize, usize), ProtocolError> {
    let next_depth = depth + 1;
    if next_depth > MAX_NESTING_DEPTH {
        return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    if count < 0 {
        return Err(ProtocolError::InvalidFrameLength(count));
    }
    if count as usize > MAX_ARRAY_ELEMENTS {
        return Err(ProtocolError::TooManyElements(count as usize));
    }
    Ok((next_depth, count as usize))
}

fn read_elements(
    cursor: &mut Cursor<&[u8]>,
    src: Option<&Bytes>,
    depth: usize,
    count: i64,
) -> Result<Vec<Frame>, ProtocolError> {
    let (next_depth, count) = check_aggregate(depth, count)?;
    let mut frames = Vec::with_capacity(count.min(PREALLOC_CAP));
    for _ in 0..count {
        frames.push(try_parse(cursor, src, next_depth)?);
    }
    Ok(frames)
}

/// Reads `count` key/value pairs; the count is in entries, not frames.
fn read_pairs(
    cursor: &mut Cursor<&[u8]>,
    src: Option<&Bytes>,
    depth: usize,
    count: i64,
) -> Result<Vec<(Frame, Frame)>, ProtocolError> {
    let (next_depth, count) = check_aggregate(depth, count)?;
    let mut pairs = Vec::with_capacity(count.min(PREALLOC_CAP));
    for _ in 0..count {
        let key = try_parse(cursor, src, next_depth)?;
        let val = try_parse(cursor, src, next_depth)?;
        pairs.push((key, val));
    }
    Ok(pairs)
}

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    let pos = cursor.position() as usize;
    if pos >= cursor.get_ref().len() {
        return Err(ProtocolError::Incomplete);
    }
    cursor.set_position((pos + 1) as u64);
    Ok(cursor.get_ref()[pos])
}

/// Returns the line at the cursor without its terminator and moves past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = cursor.position() as usize;
    let end = find_crlf(cursor)?;
    Ok(&cursor.get_ref()[start..end])
}

fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = read_line(cursor)?;
    parse_i64_bytes(line)
}

/// Locates the next CRLF at or after the cursor, returning the offset of
/// the CR. The cursor ends up just after the LF.
fn find_crlf(cursor: &mut Cursor<&[u8]>) -> Result<usize, ProtocolError> {
    let buf = cursor.get_ref();
    let start = cursor.position() as usize;

    if start >= buf.len() {
        return Err(ProtocolError::Incomplete);
    }

    let mut pos = start;
    while let Some(offset) = memchr::memchr(b'\r', &buf[pos..]) {
        let cr = pos + offset;
        if cr + 1 < buf.len() && buf[cr + 1] == b'\n' {
            cursor.set_position((cr + 2) as u64);
            return Ok(cr);
        }
        // lone CR inside the line
        pos = cr + 1;
    }

    Err(ProtocolError::Incomplete)
}

fn utf8<'a>(bytes: &'a [u8], what: &'static str) -> Result<&'a str, ProtocolError> {
    std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8(what))
}

/// Parses the payload of a `,` frame. Accepts everything `f64::from_str`
/// accepts, which covers `inf`, `-inf`, `nan` and exponent forms.
fn parse_double(line: &[u8]) -> Result<f64, ProtocolError> {
    let text = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidDouble)?;
    text.parse::<f64>().map_err(|_| ProtocolError::InvalidDouble)
}

/// Decimal i64 without an intermediate `String`. Negative values are
/// accumulated below zero so `i64::MIN` fits.
fn parse_i64_bytes(buf: &[u8]) -> Result<i64, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let (negative, digits) = match buf[0] {
        b'-' => (true, &buf[1..]),
        b'+' => (false, &buf[1..]),
        _ => (false, buf),
    };

    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let digit = (b - b'0') as i64;
        n = n
            .checked_mul(10)
            .and_then(|n| {
                if negative {
                    n.checked_sub(digit)
                } else {
                    n.checked_add(digit)
                }
            })
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(n)
}
