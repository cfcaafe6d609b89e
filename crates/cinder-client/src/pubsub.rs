//! Subscription registry and push dispatch.
//!
//! Maps channels and patterns to broadcast senders. Connections hand every
//! push value they decode to [`SubscriptionRegistry::dispatch`], which
//! routes `message` and `pmessage` pushes to the matching subscribers.
//! The registry holds no connection state; the multiplexer uses
//! [`SubscriptionRegistry::active`] to replay subscriptions after the
//! subscriber connection is re-established.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use cinder_protocol::Frame;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Whether a subscription names an exact channel or a glob pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

impl SubscriptionKind {
    pub(crate) fn subscribe_verb(self) -> &'static [u8] {
        match self {
            SubscriptionKind::Channel => b"SUBSCRIBE",
            SubscriptionKind::Pattern => b"PSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_verb(self) -> &'static [u8] {
        match self {
            SubscriptionKind::Channel => b"UNSUBSCRIBE",
            SubscriptionKind::Pattern => b"PUNSUBSCRIBE",
        }
    }
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The channel the message was published to.
    pub channel: Bytes,
    /// For pattern subscriptions, the pattern that matched.
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

/// How a push value relates to subscription bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushKind {
    /// A published message for the registry.
    Message,
    /// The acknowledgment of a (un)subscribe request.
    Ack,
    /// Anything else, such as invalidation or monitor output.
    Other,
}

/// Classifies a push (or pub/sub-shaped RESP2 array) by its first element.
pub(crate) fn push_kind(items: &[Frame]) -> PushKind {
    let Some(kind) = items.first().and_then(Frame::as_bytes) else {
        return PushKind::Other;
    };
    const MESSAGES: [&[u8]; 3] = [b"message", b"pmessage", b"smessage"];
    const ACKS: [&[u8]; 6] = [
        b"subscribe",
        b"unsubscribe",
        b"psubscribe",
        b"punsubscribe",
        b"ssubscribe",
        b"sunsubscribe",
    ];
    if MESSAGES.iter().any(|m| kind.eq_ignore_ascii_case(m)) {
        PushKind::Message
    } else if ACKS.iter().any(|a| kind.eq_ignore_ascii_case(a)) {
        PushKind::Ack
    } else {
        PushKind::Other
    }
}

/// Channel and pattern subscriptions, shared by the multiplexer and every
/// connection.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    channels: DashMap<Bytes, broadcast::Sender<Message>>,
    patterns: DashMap<Bytes, broadcast::Sender<Message>>,
    capacity: usize,
    delivered: AtomicU64,
}

impl SubscriptionRegistry {
    /// Creates an empty registry. `capacity` is the number of messages
    /// buffered per subscription before slow consumers miss some.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            patterns: DashMap::new(),
            capacity: capacity.max(1),
            delivered: AtomicU64::new(0),
        }
    }

    fn map(&self, kind: SubscriptionKind) -> &DashMap<Bytes, broadcast::Sender<Message>> {
        match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        }
    }

    /// Adds a receiver for `name`, creating the entry if needed.
    pub(crate) fn register(
        &self,
        kind: SubscriptionKind,
        name: Bytes,
    ) -> broadcast::Receiver<Message> {
        match self.map(kind).entry(name) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let (tx, rx) = broadcast::channel(self.capacity);
                entry.insert(tx);
                rx
            }
        }
    }

    /// Removes the entry for `name` if nobody is receiving from it.
    ///
    /// Used to undo [`register`](Self::register) after the server rejected
    /// the subscription or it could not be sent.
    pub(crate) fn rollback(&self, kind: SubscriptionKind, name: &[u8]) {
        self.map(kind)
            .remove_if(name, |_, tx| tx.receiver_count() == 0);
    }

    /// Removes the entry for `name`. Existing receivers see the end of
    /// their stream. Returns true if the entry existed.
    pub(crate) fn remove(&self, kind: SubscriptionKind, name: &[u8]) -> bool {
        self.map(kind).remove(name).is_some()
    }

    /// Returns every registered subscription.
    pub fn active(&self) -> Vec<(SubscriptionKind, Bytes)> {
        let channels = self
            .channels
            .iter()
            .map(|e| (SubscriptionKind::Channel, e.key().clone()));
        let patterns = self
            .patterns
            .iter()
            .map(|e| (SubscriptionKind::Pattern, e.key().clone()));
        channels.chain(patterns).collect()
    }

    /// Returns the number of registered channels plus patterns.
    pub fn len(&self) -> usize {
        self.channels.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns how many messages have been handed to subscribers.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Routes one push value to its subscribers.
    ///
    /// Only `message`, `smessage` and `pmessage` pushes carry data for
    /// subscribers; everything else is logged and dropped.
    pub(crate) fn dispatch(&self, items: &[Frame]) {
        if push_kind(items) != PushKind::Message {
            debug!("ignoring push of {} elements", items.len());
            return;
        }

        let delivered = match items {
            [_, channel, payload] => {
                let (Some(channel), Some(payload)) = (blob(channel), blob(payload)) else {
                    warn!("malformed message push");
                    return;
                };
                self.send(&self.channels, &channel.clone(), Message {
                    channel,
                    pattern: None,
                    payload,
                })
            }
            [_, pattern, channel, payload] => {
                let (Some(pattern), Some(channel), Some(payload)) =
                    (blob(pattern), blob(channel), blob(payload))
                else {
                    warn!("malformed pmessage push");
                    return;
                };
                self.send(&self.patterns, &pattern.clone(), Message {
                    channel,
                    pattern: Some(pattern),
                    payload,
                })
            }
            _ => {
                warn!("message push with {} elements", items.len());
                return;
            }
        };
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
    }

    fn send(
        &self,
        map: &DashMap<Bytes, broadcast::Sender<Message>>,
        key: &Bytes,
        msg: Message,
    ) -> usize {
        match map.get(key) {
            // send fails only when every receiver is gone
            Some(tx) => tx.send(msg).unwrap_or(0),
            None => {
                debug!(
                    "message for unknown subscription {:?}",
                    String::from_utf8_lossy(key)
                );
                0
            }
        }
    }
}

/// Extracts a payload without copying bulk data.
fn blob(frame: &Frame) -> Option<Bytes> {
    match frame.without_attributes() {
        Frame::Bulk(b) => Some(b.clone()),
        Frame::Verbatim { data, .. } => Some(data.clone()),
        Frame::Simple(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        Frame::Integer(n) => Some(Bytes::from(n.to_string())),
        _ => None,
    }
}

/// A live subscription to a channel or pattern.
///
/// Dropping it stops local delivery; the server-side subscription stays
/// until [`Multiplexer::unsubscribe`](crate::Multiplexer::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    kind: SubscriptionKind,
    name: Bytes,
    rx: broadcast::Receiver<Message>,
}

impl Subscription {
    pub(crate) fn new(
        kind: SubscriptionKind,
        name: Bytes,
        rx: broadcast::Receiver<Message>,
    ) -> Self {
        Self { kind, name, rx }
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// The channel or pattern this subscription was made for.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Waits for the next message.
    ///
    /// Returns `None` once the subscription has been removed. A consumer
    /// that falls more than the configured capacity behind skips the
    /// oldest messages.
    pub async fn next(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(RecvError::Lagged(n)) => {
                    warn!("subscriber lagged, missed {n} messages");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Creates another handle to the same subscription that starts with
    /// the next published message.
    pub fn resubscribe(&self) -> Subscription {
        Subscription {
            kind: self.kind,
            name: self.name.clone(),
            rx: self.rx.resubscribe(),
        }
    }

    /// Converts the subscription into a `Stream` of messages.
    pub fn into_stream(self) -> impl Stream<Item = Message> + Send + 'static {
        BroadcastStream::new(self.rx).filter_map(|item| match item {
            Ok(msg) => Some(msg),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!("subscriber lagged, missed {n} messages");
                None
            }
        })
    }
}
