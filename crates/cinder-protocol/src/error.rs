//! Protocol error types for RESP parsing.

use thiserror::Error;

/// Errors that can occur when parsing the RESP wire format.
///
/// Everything except `Incomplete` means the byte stream can no longer be
/// framed: the connection it came from must be torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete frame yet.
    /// The caller should read more data and try again.
    #[error("incomplete frame: need more data")]
    Incomplete,

    /// The first byte of a frame didn't match any known type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Failed to parse an integer value from the frame content.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A length or count was negative without being a null sentinel.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    /// A bulk payload was not followed by `\r\n`.
    #[error("missing terminator after {0}-byte payload")]
    MissingTerminator(usize),

    /// A double frame held something other than a float, `inf`, `-inf` or `nan`.
    #[error("invalid double encoding")]
    InvalidDouble,

    /// A RESP3 null (`_`) carried bytes before its terminator.
    #[error("null frame carries a payload")]
    InvalidNull,

    /// A boolean frame held something other than `t` or `f`.
    #[error("invalid boolean encoding")]
    InvalidBoolean,

    /// A big number frame held something other than an optionally signed digit run.
    #[error("invalid big number encoding")]
    InvalidBigNumber,

    /// A verbatim string was shorter than its `xxx:` header or lacked the colon.
    #[error("invalid verbatim string header")]
    InvalidVerbatim,

    /// A textual frame contained invalid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Arrays, maps, sets, pushes and attributes nested deeper than the limit.
    #[error("frame nesting exceeds {0} levels")]
    NestingTooDeep(usize),

    /// An aggregate declared more elements than the limit.
    #[error("aggregate declares {0} elements")]
    TooManyElements(usize),

    /// A bulk payload declared a length above the limit.
    #[error("bulk payload of {0} bytes exceeds limit")]
    BulkStringTooLarge(usize),
}
