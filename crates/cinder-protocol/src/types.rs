//! RESP frame types.
//!
//! The [`Frame`] enum represents a single decoded RESP2/RESP3 value.
//! Both protocol versions share one value model: RESP2 replies simply
//! never produce the RESP3-only variants.
//!
//! Blob payloads use `Bytes` for reference-counted storage that avoids
//! copies when a reply is handed from the reader task to a caller.

use bytes::Bytes;
use ordered_float::OrderedFloat;

/// A single RESP protocol frame.
///
/// Aggregates own their elements; the engine never grows or shrinks them
/// after decoding. The null sentinels (`NullBulk`, `NullArray`, `Null`) are
/// distinct from empty payloads and empty aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply. Decoded from both the simple form (`-ERR nope\r\n`)
    /// and the bulk form (`!8\r\nERR nope\r\n`).
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// The RESP2 null bulk string, `$-1\r\n`.
    NullBulk,

    /// Ordered array of frames, e.g. `*2\r\n+hello\r\n+world\r\n`.
    Array(Vec<Frame>),

    /// The RESP2 null array, `*-1\r\n`.
    NullArray,

    /// RESP3 null, `_\r\n`.
    Null,

    /// Double, e.g. `,3.14\r\n`. Infinities and NaN are carried as-is;
    /// `OrderedFloat` makes NaN compare equal to itself.
    Double(OrderedFloat<f64>),

    /// Boolean, `#t\r\n` or `#f\r\n`.
    Boolean(bool),

    /// Arbitrary-precision integer kept as its decimal digit string,
    /// e.g. `(3492890328409238509324850943850943825024385\r\n`.
    BigNumber(String),

    /// Verbatim string with its three-byte format tag, e.g.
    /// `=15\r\ntxt:Some string\r\n`.
    Verbatim { format: [u8; 3], data: Bytes },

    /// Ordered key/value pairs, e.g. `%1\r\n+key\r\n:1\r\n`.
    Map(Vec<(Frame, Frame)>),

    /// Unordered collection, kept in wire order, e.g. `~2\r\n:1\r\n:2\r\n`.
    Set(Vec<Frame>),

    /// Out-of-band message not correlated to any request, e.g.
    /// `>3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$2\r\nhi\r\n`.
    Push(Vec<Frame>),

    /// A value preceded by an attribute frame (`|1\r\n...`). The attributes
    /// are metadata about `value`; they are never a reply on their own.
    Attributed {
        attributes: Vec<(Frame, Frame)>,
        value: Box<Frame>,
    },
}

impl Frame {
    /// Returns `true` for any of the null sentinels.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::NullBulk | Frame::NullArray)
    }

    /// Returns `true` if this frame is an out-of-band push, looking through
    /// any attributes attached to it.
    pub fn is_push(&self) -> bool {
        matches!(self.without_attributes(), Frame::Push(_))
    }

    /// Returns the error text if this frame is an error reply, looking
    /// through any attributes attached to it.
    pub fn as_error(&self) -> Option<&str> {
        match self.without_attributes() {
            Frame::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns the decorated value, skipping attribute metadata.
    pub fn without_attributes(&self) -> &Frame {
        match self {
            Frame::Attributed { value, .. } => value.without_attributes(),
            other => other,
        }
    }

    /// Consumes the frame and returns the decorated value, dropping any
    /// attribute metadata.
    pub fn into_value(self) -> Frame {
        match self {
            Frame::Attributed { value, .. } => value.into_value(),
            other => other,
        }
    }

    /// Returns the attribute metadata attached to this frame, if any.
    pub fn attributes(&self) -> Option<&[(Frame, Frame)]> {
        match self {
            Frame::Attributed { attributes, .. } => Some(attributes),
            _ => None,
        }
    }

    /// Returns the textual payload of simple, bulk and verbatim strings.
    ///
    /// Bulk payloads are returned only if they are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self.without_attributes() {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            Frame::Verbatim { data, .. } => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes of simple, bulk and verbatim strings.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self.without_attributes() {
            Frame::Simple(s) => Some(s.as_bytes()),
            Frame::Bulk(b) => Some(b),
            Frame::Verbatim { data, .. } => Some(data),
            _ => None,
        }
    }
}
