//! Direct-to-buffer RESP serialization.
//!
//! Output goes straight into the caller's `BytesMut`; integers are
//! formatted on the stack with `itoa`.
//!
//! Two entry points exist: [`encode_command`] produces the only request
//! framing a client ever sends (an array of bulk strings), and
//! [`Frame::serialize`] produces reply framing for every variant.

use std::fmt::Write;

use bytes::{BufMut, BytesMut};

use crate::types::Frame;

/// Encodes a command as an array of bulk strings:
/// `*<n>\r\n` followed by `$<len>\r\n<arg>\r\n` for every argument.
///
/// Inline command syntax is never produced.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], dst: &mut BytesMut) {
    let body: usize = args.iter().map(|a| a.as_ref().len() + 16).sum();
    dst.reserve(body + 16);

    dst.put_u8(b'*');
    write_len(args.len(), dst);
    dst.put_slice(b"\r\n");
    for arg in args {
        write_blob(b'$', arg.as_ref(), dst);
    }
}

impl Frame {
    /// Appends the wire form of this frame to `dst`.
    ///
    /// Writes the full wire representation, including type prefix
    /// and trailing `\r\n` delimiters.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Error(msg) => {
                // the line form cannot carry CR or LF
                if msg.bytes().any(|b| b == b'\r' || b == b'\n') {
                    write_blob(b'!', msg.as_bytes(), dst);
                } else {
                    dst.put_u8(b'-');
                    dst.put_slice(msg.as_bytes());
                    dst.put_slice(b"\r\n");
                }
            }
            Frame::Integer(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => write_blob(b'$', data, dst),
            Frame::NullBulk => dst.put_slice(b"$-1\r\n"),
            Frame::Array(items) => write_elements(b'*', items, dst),
            Frame::NullArray => dst.put_slice(b"*-1\r\n"),
            Frame::Null => dst.put_slice(b"_\r\n"),
            Frame::Double(v) => {
                dst.put_u8(b',');
                let v = v.into_inner();
                if v.is_nan() {
                    dst.put_slice(b"nan");
                } else if v.is_infinite() {
                    dst.put_slice(if v > 0.0 { &b"inf"[..] } else { &b"-inf"[..] });
                } else {
                    // Display for f64 is the shortest string that parses back
                    // to the same value. Writing into BytesMut cannot fail.
                    let _ = write!(dst, "{v}");
                }
                dst.put_slice(b"\r\n");
            }
            Frame::Boolean(b) => dst.put_slice(if *b { b"#t\r\n" } else { b"#f\r\n" }),
            Frame::BigNumber(digits) => {
                dst.put_u8(b'(');
                dst.put_slice(digits.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Verbatim { format, data } => {
                dst.put_u8(b'=');
                write_len(data.len() + 4, dst);
                dst.put_slice(b"\r\n");
                dst.put_slice(format);
                dst.put_u8(b':');
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Map(pairs) => write_pairs(b'%', pairs, dst),
            Frame::Set(items) => write_elements(b'~', items, dst),
            Frame::Push(items) => write_elements(b'>', items, dst),
            Frame::Attributed { attributes, value } => {
                write_pairs(b'|', attributes, dst);
                value.serialize(dst);
            }
        }
    }
}

fn write_blob(prefix: u8, data: &[u8], dst: &mut BytesMut) {
    dst.put_u8(prefix);
    write_len(data.len(), dst);
    dst.put_slice(b"\r\n");
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

fn write_elements(prefix: u8, items: &[Frame], dst: &mut BytesMut) {
    dst.put_u8(prefix);
    write_len(items.len(), dst);
    dst.put_slice(b"\r\n");
    for item in items {
        item.serialize(dst);
    }
}

/// Map-like frames declare the number of entries, not frames.
fn write_pairs(prefix: u8, pairs: &[(Frame, Frame)], dst: &mut BytesMut) {
    dst.put_u8(prefix);
    write_len(pairs.len(), dst);
    dst.put_slice(b"\r\n");
    for (key, val) in pairs {
        key.serialize(dst);
        val.serialize(dst);
    }
}

/// Appends `val` in decimal.
fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}

fn write_len(len: usize, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(len).as_bytes());
}
