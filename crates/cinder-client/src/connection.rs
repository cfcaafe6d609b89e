//! A physical connection and its pending-request queue.
//!
//! Every connection runs exactly two tasks: a writer that drains unsent
//! queue entries to the transport, and a reader that decodes replies and
//! matches them to the queue head. An entry and its bytes are pushed as
//! one record under a single lock, so the order replies are matched in is
//! the order requests hit the wire.
//!
//! Cancelling a request whose bytes have not been handed to the writer
//! removes it without any network effect. Once handed over, the entry
//! stays queued so later replies still line up; its reply is dropped on
//! arrival.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use cinder_protocol::{parse_frame, Frame, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::error::ClientError;
use crate::pubsub::{push_kind, PushKind, SubscriptionRegistry};
use crate::routing::Endpoint;
use crate::transport::BoxTransport;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Pre-encoded `ASKING`.
const ASKING: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Ordinary request/reply traffic.
    Commands,
    /// Subscription traffic only. RESP2 servers deliver pub/sub messages
    /// as plain arrays on such connections, so arrays whose first element
    /// names a pub/sub kind are treated as push values.
    Subscriber,
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Ready,
    /// No new requests are admitted; queued ones still complete.
    Draining,
    Failed,
    Closed,
}

/// Why a connection failed.
#[derive(Debug, Error)]
pub enum FailureReason {
    #[error("closed by peer")]
    Eof,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol desync: {0}")]
    Desync(#[from] ProtocolError),

    #[error("reply arrived with no request outstanding")]
    UnexpectedReply,
}

/// Reported to the owner of a connection when it fails.
#[derive(Debug)]
pub enum ConnectionEvent {
    Failed {
        id: u64,
        endpoint: Endpoint,
        role: Role,
        reason: FailureReason,
    },
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Queue entries admitted before `enqueue` waits.
    pub max_in_flight: usize,
    pub read_buffer_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 4096,
            read_buffer_capacity: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Reply,
    /// A (un)subscribe acknowledgment, which arrives as a push.
    Ack,
}

type ReplySender = oneshot::Sender<Result<Frame, ClientError>>;

struct PendingEntry {
    id: u64,
    bytes: Bytes,
    sent: bool,
    expect: Expect,
    /// `None` for entries whose reply nobody waits for (`ASKING`).
    reply: Option<ReplySender>,
    _permit: Option<OwnedSemaphorePermit>,
}

struct Inner {
    state: State,
    queue: VecDeque<PendingEntry>,
    /// Number of entries at the back of `queue` not yet taken by the writer.
    unsent: usize,
    next_id: u64,
}

enum Batch {
    Ready,
    Idle,
    Stop,
}

/// How an inbound value is matched.
enum Inbound {
    Reply,
    Ack,
    Push,
}

/// One transport plus its pending-request queue.
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    role: Role,
    inner: Mutex<Inner>,
    write_ready: Notify,
    drained: Notify,
    permits: Arc<Semaphore>,
    registry: Arc<SubscriptionRegistry>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Takes ownership of a connected transport and starts the reader and
    /// writer tasks. Must be called within a tokio runtime.
    pub fn establish(
        endpoint: Endpoint,
        role: Role,
        transport: BoxTransport,
        options: ConnectionOptions,
        registry: Arc<SubscriptionRegistry>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Connection> {
        let conn = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            role,
            inner: Mutex::new(Inner {
                state: State::Connecting,
                queue: VecDeque::new(),
                unsent: 0,
                next_id: 0,
            }),
            write_ready: Notify::new(),
            drained: Notify::new(),
            permits: Arc::new(Semaphore::new(options.max_in_flight.max(1))),
            registry,
            events,
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let (reader, writer) = tokio::io::split(transport);
        let read_task = tokio::spawn(read_loop(
            Arc::clone(&conn),
            reader,
            options.read_buffer_capacity.max(64),
        ));
        let write_task = tokio::spawn(write_loop(Arc::clone(&conn), writer));
        conn.lock_tasks()
            .extend([read_task.abort_handle(), write_task.abort_handle()]);

        {
            let mut inner = conn.lock();
            // the reader may already have failed
            if inner.state == State::Connecting {
                inner.state = State::Ready;
            }
        }
        debug!(
            "connection {} to {} ready ({:?})",
            conn.id, conn.endpoint, conn.role
        );
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == State::Ready
    }

    /// Number of queued requests, sent or not.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Queues an encoded request.
    ///
    /// Waits while the connection holds `max_in_flight` requests. Fails
    /// with `ConnectionLost { sent: false }` if the connection is no
    /// longer accepting requests.
    pub async fn enqueue(self: &Arc<Self>, bytes: Bytes) -> Result<PendingReply, ClientError> {
        self.admit(bytes, Expect::Reply, false).await
    }

    /// Queues `ASKING` immediately followed by `bytes`, with nothing in
    /// between. The reply to `ASKING` is discarded.
    pub async fn enqueue_asking(
        self: &Arc<Self>,
        bytes: Bytes,
    ) -> Result<PendingReply, ClientError> {
        self.admit(bytes, Expect::Reply, true).await
    }

    /// Queues a single-channel (un)subscribe request whose
    /// acknowledgment arrives as a push value.
    pub async fn enqueue_subscription(
        self: &Arc<Self>,
        bytes: Bytes,
    ) -> Result<PendingReply, ClientError> {
        self.admit(bytes, Expect::Ack, false).await
    }

    async fn admit(
        self: &Arc<Self>,
        bytes: Bytes,
        expect: Expect,
        asking: bool,
    ) -> Result<PendingReply, ClientError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ClientError::ConnectionLost { sent: false })?;

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut inner = self.lock();
            if inner.state != State::Ready {
                return Err(ClientError::ConnectionLost { sent: false });
            }
            let id = inner.next_id;
            inner.next_id += 1;
            if asking {
                inner.queue.push_back(PendingEntry {
                    id,
                    bytes: Bytes::from_static(ASKING),
                    sent: false,
                    expect: Expect::Reply,
                    reply: None,
                    _permit: None,
                });
                inner.unsent += 1;
            }
            inner.queue.push_back(PendingEntry {
                id,
                bytes,
                sent: false,
                expect,
                reply: Some(tx),
                _permit: Some(permit),
            });
            inner.unsent += 1;
            id
        };
        self.write_ready.notify_one();

        Ok(PendingReply {
            conn: Arc::clone(self),
            id,
            rx,
            done: false,
        })
    }

    /// Decodes every complete value in `buf` and matches it.
    ///
    /// Consumed bytes are removed from `buf`; a trailing partial value is
    /// left in place for the next call. Non-push values complete the
    /// queue head, push values go to the subscription registry and
    /// subscription acknowledgments complete a head waiting for one.
    pub fn on_bytes(&self, buf: &mut BytesMut) -> Result<(), FailureReason> {
        while let Some((frame, consumed)) = parse_frame(buf)? {
            buf.advance(consumed);
            self.on_frame(frame)?;
        }
        Ok(())
    }

    fn on_frame(&self, frame: Frame) -> Result<(), FailureReason> {
        match self.classify(&frame) {
            Inbound::Push => self.dispatch(&frame),
            Inbound::Ack => match self.pop_sent_head(true) {
                Some(entry) => deliver(entry, frame),
                // acks for replayed or server-initiated changes
                None => self.dispatch(&frame),
            },
            Inbound::Reply => {
                let entry = self
                    .pop_sent_head(false)
                    .ok_or(FailureReason::UnexpectedReply)?;
                deliver(entry, frame);
            }
        }
        Ok(())
    }

    fn classify(&self, frame: &Frame) -> Inbound {
        let items = match frame.without_attributes() {
            Frame::Push(items) => items,
            Frame::Array(items) if self.role == Role::Subscriber => {
                if push_kind(items) == PushKind::Other {
                    return Inbound::Reply;
                }
                items
            }
            _ => return Inbound::Reply,
        };
        match push_kind(items) {
            PushKind::Ack => Inbound::Ack,
            _ => Inbound::Push,
        }
    }

    fn dispatch(&self, frame: &Frame) {
        if let Frame::Push(items) | Frame::Array(items) = frame.without_attributes() {
            self.registry.dispatch(items);
        }
    }

    /// Pops the queue head if its bytes were handed to the writer and, when
    /// `ack` is set, it is waiting for a subscription acknowledgment.
    fn pop_sent_head(&self, ack: bool) -> Option<PendingEntry> {
        let mut inner = self.lock();
        let head = inner.queue.front()?;
        if !head.sent || (ack && head.expect != Expect::Ack) {
            return None;
        }
        let entry = inner.queue.pop_front();
        if inner.queue.is_empty() && inner.state == State::Draining {
            self.drained.notify_waiters();
        }
        entry
    }

    /// Moves every unsent entry into `buf` and marks it sent.
    fn take_unsent(&self, buf: &mut BytesMut) -> Batch {
        let mut inner = self.lock();
        if matches!(inner.state, State::Failed | State::Closed) {
            return Batch::Stop;
        }
        if inner.unsent == 0 {
            return Batch::Idle;
        }
        let start = inner.queue.len() - inner.unsent;
        for entry in inner.queue.range_mut(start..) {
            entry.sent = true;
            buf.extend_from_slice(&entry.bytes);
        }
        inner.unsent = 0;
        Batch::Ready
    }

    /// Removes the unsent entries of request `id`. Sent entries stay so
    /// that later replies still match their requests.
    fn cancel(&self, id: u64) {
        let mut inner = self.lock();
        if inner.unsent == 0 {
            return;
        }
        let start = inner.queue.len() - inner.unsent;
        let before = inner.queue.len();
        let mut idx = 0;
        inner.queue.retain(|entry| {
            let keep = idx < start || entry.id != id;
            idx += 1;
            keep
        });
        let removed = before - inner.queue.len();
        if removed > 0 {
            inner.unsent -= removed;
            trace!("connection {}: cancelled unsent request {id}", self.id);
            if inner.queue.is_empty() && inner.state == State::Draining {
                self.drained.notify_waiters();
            }
        }
    }

    /// Fails the connection: every queued request resolves with
    /// `ConnectionLost`, both tasks stop and the owner is notified.
    pub fn fail(&self, reason: FailureReason) {
        let entries = {
            let mut inner = self.lock();
            if matches!(inner.state, State::Failed | State::Closed) {
                return;
            }
            inner.state = State::Failed;
            inner.unsent = 0;
            std::mem::take(&mut inner.queue)
        };
        warn!(
            "connection {} to {} failed with {} requests pending: {reason}",
            self.id,
            self.endpoint,
            entries.len()
        );

        resolve_lost(entries);
        self.shutdown_tasks();
        let _ = self.events.send(ConnectionEvent::Failed {
            id: self.id,
            endpoint: self.endpoint.clone(),
            role: self.role,
            reason,
        });
    }

    /// Stops admitting requests, waits up to `drain_timeout` for queued
    /// requests to complete, then closes the transport. Requests still
    /// queued after the timeout resolve with `ConnectionLost`.
    pub async fn close(&self, drain_timeout: Duration) {
        {
            let mut inner = self.lock();
            match inner.state {
                State::Connecting | State::Ready => inner.state = State::Draining,
                _ => return,
            }
        }
        debug!("connection {} to {} draining", self.id, self.endpoint);

        if tokio::time::timeout(drain_timeout, self.wait_drained())
            .await
            .is_err()
        {
            warn!(
                "connection {} to {}: drain timed out with {} requests pending",
                self.id,
                self.endpoint,
                self.pending()
            );
        }

        self.terminate();
    }

    /// Closes the connection immediately. Queued requests resolve with
    /// `ConnectionLost`. Does nothing if the connection already failed or
    /// was closed.
    pub fn terminate(&self) {
        let entries = {
            let mut inner = self.lock();
            if matches!(inner.state, State::Failed | State::Closed) {
                return;
            }
            inner.state = State::Closed;
            inner.unsent = 0;
            std::mem::take(&mut inner.queue)
        };
        resolve_lost(entries);
        self.shutdown_tasks();
        info!("connection {} to {} closed", self.id, self.endpoint);
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.lock();
                if inner.queue.is_empty() || inner.state != State::Draining {
                    return;
                }
            }
            notified.await;
        }
    }

    fn shutdown_tasks(&self) {
        self.permits.close();
        self.write_ready.notify_one();
        self.drained.notify_waiters();
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn deliver(entry: PendingEntry, frame: Frame) {
    match entry.reply {
        Some(tx) => {
            if tx.send(Ok(frame)).is_err() {
                trace!("discarding reply to abandoned request {}", entry.id);
            }
        }
        None => trace!("discarding reply to ASKING"),
    }
}

fn resolve_lost(entries: VecDeque<PendingEntry>) {
    for entry in entries {
        if let Some(tx) = entry.reply {
            let _ = tx.send(Err(ClientError::ConnectionLost { sent: entry.sent }));
        }
    }
}

async fn write_loop(conn: Arc<Connection>, mut writer: WriteHalf<BoxTransport>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match conn.take_unsent(&mut buf) {
            Batch::Ready => {}
            Batch::Idle => {
                conn.write_ready.notified().await;
                continue;
            }
            Batch::Stop => break,
        }

        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        buf.clear();

        if let Err(e) = result {
            conn.fail(FailureReason::Io(e));
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(conn: Arc<Connection>, mut reader: ReadHalf<BoxTransport>, capacity: usize) {
    let mut buf = BytesMut::with_capacity(capacity);
    let reason = loop {
        buf.reserve(capacity / 4);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break FailureReason::Eof,
            Ok(_) => {
                if let Err(reason) = conn.on_bytes(&mut buf) {
                    break reason;
                }
            }
            Err(e) => break FailureReason::Io(e),
        }
    };
    conn.fail(reason);
}

/// The eventual reply to a queued request.
///
/// Dropping it before completion cancels the request: unsent bytes are
/// withdrawn, and a reply to bytes already sent is discarded.
#[derive(Debug)]
pub struct PendingReply {
    conn: Arc<Connection>,
    id: u64,
    rx: oneshot::Receiver<Result<Frame, ClientError>>,
    done: bool,
}

impl Future for PendingReply {
    type Output = Result<Frame, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = ready!(Pin::new(&mut self.rx).poll(cx));
        self.done = true;
        // the sender is only dropped unresolved if the entry was discarded
        Poll::Ready(result.unwrap_or(Err(ClientError::ConnectionLost { sent: true })))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.done {
            self.conn.cancel(self.id);
        }
    }
}
