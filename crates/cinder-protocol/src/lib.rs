//! cinder-protocol: RESP2/RESP3 wire protocol implementation.
//!
//! Provides zero-copy, restartable parsing and direct-to-buffer
//! serialization of the RESP protocol family. Both versions share one
//! value model, [`Frame`].
//!
//! # quick start
//!
//! ```
//! use bytes::BytesMut;
//! use cinder_protocol::{encode_command, parse_frame, Frame};
//!
//! // encode a request
//! let mut buf = BytesMut::new();
//! encode_command(&["SET", "foo", "bar"], &mut buf);
//! assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
//!
//! // parse a reply; `None` means "read more and call again"
//! assert_eq!(parse_frame(b"$3\r\nba").unwrap(), None);
//! let (frame, consumed) = parse_frame(b"$3\r\nbar\r\n").unwrap().unwrap();
//! assert_eq!(frame, Frame::Bulk("bar".into()));
//! assert_eq!(consumed, 9);
//! ```

pub mod error;
pub mod parse;
mod serialize;
pub mod types;

pub use error::ProtocolError;
pub use parse::{parse_frame, parse_frame_at, parse_frame_bytes};
pub use serialize::encode_command;
pub use types::Frame;
