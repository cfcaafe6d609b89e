//! Request routing: endpoints, hash slots and the slot ownership table.
//!
//! Keys map onto 16384 hash slots using CRC16 (XMODEM polynomial) with
//! `{hash tag}` support, the same scheme cluster-mode servers use. The
//! table only learns ownership from redirect replies and explicit
//! assignments; it never discovers topology on its own.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use cinder_protocol::encode_command;

use crate::error::ClientError;

/// Total number of hash slots.
pub const SLOT_COUNT: u16 = 16384;

/// A server address as `host:port`.
///
/// The host is kept as text and resolved by the [`Connector`] at connect
/// time. Cloning is cheap.
///
/// [`Connector`]: crate::transport::Connector
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: Arc<str>,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns a new endpoint on the same host with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: Arc::clone(&self.host),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    /// Parses `host:port`, `[v6addr]:port` or a bare IPv6 address with a
    /// trailing `:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidEndpoint(s.to_string());

        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

static CRC16_TABLE: [u16; 256] = crc16_table();

/// Builds the lookup table for CRC16 with polynomial 0x1021.
const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let idx = ((crc >> 8) ^ byte as u16) as usize;
        (crc << 8) ^ CRC16_TABLE[idx]
    })
}

/// Returns the part of `key` that is hashed.
///
/// The tag is the content between the first `{` and the first `}` after
/// it. An empty or unterminated tag means the whole key is hashed.
fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|&b| b == b'}') {
        Some(close) if close > 0 => &rest[..close],
        _ => key,
    }
}

/// Computes the hash slot for a key, in `[0, 16383]`.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// Maps each of the 16384 slots to the endpoint believed to own it.
///
/// Unassigned slots route to the default endpoint.
#[derive(Debug, Clone)]
pub struct SlotTable {
    slots: Box<[Option<Endpoint>]>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    /// Creates an empty table with no assignments.
    pub fn new() -> Self {
        Self {
            slots: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
        }
    }

    /// Returns the endpoint that owns `slot`, if known.
    pub fn owner(&self, slot: u16) -> Option<&Endpoint> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }

    /// Records `endpoint` as the owner of `slot`. Out-of-range slots are
    /// ignored.
    pub fn assign(&mut self, slot: u16, endpoint: Endpoint) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            *entry = Some(endpoint);
        }
    }

    /// Records `endpoint` as the owner of every slot in `range`.
    pub fn assign_range(&mut self, range: RangeInclusive<u16>, endpoint: &Endpoint) {
        for slot in range {
            self.assign(slot, endpoint.clone());
        }
    }

    /// Returns the number of slots with a known owner.
    pub fn assigned_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Picks the routing key out of a command's arguments.
///
/// Typed command builders know exactly where their keys live; this trait
/// lets them plug that knowledge into the multiplexer.
pub trait KeyExtractor: Send + Sync + 'static {
    fn routing_key<'a>(&self, args: &'a [Bytes]) -> Option<&'a [u8]>;
}

/// Treats the first argument after the command name as the key.
///
/// Single-word commands such as `PING` have no key and go to the default
/// endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstKey;

impl KeyExtractor for FirstKey {
    fn routing_key<'a>(&self, args: &'a [Bytes]) -> Option<&'a [u8]> {
        args.get(1).map(|k| &k[..])
    }
}

/// A command ready to submit: its arguments plus an optional pinned slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
    slot: Option<u16>,
}

impl Command {
    /// Builds a command from its name and arguments.
    ///
    /// ```
    /// use cinder_client::Command;
    ///
    /// let cmd = Command::new(["SET", "greeting", "hello"]);
    /// assert_eq!(cmd.args().len(), 3);
    /// ```
    pub fn new<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            slot: None,
        }
    }

    /// Routes the command by `key`, overriding the key extractor.
    pub fn with_key(mut self, key: &[u8]) -> Self {
        self.slot = Some(key_slot(key));
        self
    }

    /// Routes the command to a fixed slot.
    pub fn with_slot(mut self, slot: u16) -> Self {
        self.slot = Some(slot % SLOT_COUNT);
        self
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Returns the pinned slot, if any.
    pub fn slot(&self) -> Option<u16> {
        self.slot
    }

    /// Returns the command name as written by the caller.
    pub fn name(&self) -> Option<&[u8]> {
        self.args.first().map(|a| &a[..])
    }

    /// Encodes the command into its wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        encode_command(&self.args, &mut buf);
        buf.freeze()
    }
}
