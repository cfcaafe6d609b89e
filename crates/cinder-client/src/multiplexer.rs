//! The multiplexer: logical requests over shared physical connections.
//!
//! Every submitted command is routed to an endpoint (a pending `ASK`
//! target, else the slot owner, else the default endpoint), queued on
//! that endpoint's connection and awaited. Error replies and connection
//! failures go through the [`RetryPolicy`](crate::RetryPolicy), whose
//! decision is carried out here: this is the only place the slot table
//! is written.
//!
//! Subscriptions share one dedicated subscriber connection. A supervisor
//! task watches connection failures, evicts dead command connections and
//! re-establishes the subscriber connection, replaying every active
//! subscription on it.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use bytes::{Bytes, BytesMut};
use cinder_protocol::{encode_command, Frame};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionOptions, PendingReply, Role};
use crate::error::ClientError;
use crate::policy::{Attempts, Decision, Failure};
use crate::pubsub::{Subscription, SubscriptionKind, SubscriptionRegistry};
use crate::routing::{key_slot, Command, Endpoint, FirstKey, KeyExtractor, SlotTable};
use crate::stats::{Stats, StatsSnapshot};
use crate::transport::{Connector, TcpConnector};

/// Configures and connects a [`Multiplexer`].
pub struct MultiplexerBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    extractor: Arc<dyn KeyExtractor>,
}

impl MultiplexerBuilder {
    /// Replaces the default TCP connector.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(connector);
        self.connector = Some(connector);
        self
    }

    /// Replaces [`FirstKey`] as the way routing keys are found.
    pub fn key_extractor(mut self, extractor: impl KeyExtractor) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    /// Validates the configuration, starts the supervisor and opens the
    /// connection to the default endpoint.
    pub async fn connect(self) -> Result<Multiplexer, ClientError> {
        self.config.validate()?;

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new(self.config.connect_timeout)),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(SubscriptionRegistry::new(self.config.subscription_capacity));

        let shared = Arc::new(Shared {
            config: self.config,
            connector,
            extractor: self.extractor,
            connections: Mutex::new(HashMap::new()),
            subscriber: AsyncMutex::new(SubscriberSlot::default()),
            slots: RwLock::new(SlotTable::new()),
            registry,
            events: events_tx,
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stats: Stats::default(),
            supervisor: Mutex::new(None),
        });

        let supervisor = tokio::spawn(supervise(Arc::downgrade(&shared), events_rx));
        *shared
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(supervisor.abort_handle());

        let default = shared.config.default_endpoint.clone();
        shared.connection_for(&default).await?;
        info!("connected to {default}");

        Ok(Multiplexer { shared })
    }
}

/// Routes logical requests over pipelined connections.
///
/// Cloning is cheap; all clones share the same connections, slot table
/// and subscriptions.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("default_endpoint", &self.shared.config.default_endpoint)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl Multiplexer {
    pub fn builder(config: ClientConfig) -> MultiplexerBuilder {
        MultiplexerBuilder {
            config,
            connector: None,
            extractor: Arc::new(FirstKey),
        }
    }

    /// Connects over TCP with the default key extractor.
    pub async fn connect(config: ClientConfig) -> Result<Multiplexer, ClientError> {
        Self::builder(config).connect().await
    }

    /// Sends a command and waits for its reply.
    ///
    /// Error replies come back as `Ok(Frame::Error(..))` once redirects and
    /// transient retries are exhausted. `Err` means no reply could be
    /// obtained; see [`ClientError`].
    pub async fn submit(&self, command: Command) -> Result<Frame, ClientError> {
        self.shared.submit(command).await
    }

    /// Subscribes to a channel.
    pub async fn subscribe(&self, channel: impl Into<Bytes>) -> Result<Subscription, ClientError> {
        self.shared
            .subscribe(SubscriptionKind::Channel, channel.into())
            .await
    }

    /// Subscribes to a glob pattern.
    pub async fn psubscribe(&self, pattern: impl Into<Bytes>) -> Result<Subscription, ClientError> {
        self.shared
            .subscribe(SubscriptionKind::Pattern, pattern.into())
            .await
    }

    /// Unsubscribes from a channel. Every [`Subscription`] for it ends.
    pub async fn unsubscribe(&self, channel: impl Into<Bytes>) -> Result<(), ClientError> {
        self.shared
            .unsubscribe(SubscriptionKind::Channel, channel.into())
            .await
    }

    /// Unsubscribes from a glob pattern.
    pub async fn punsubscribe(&self, pattern: impl Into<Bytes>) -> Result<(), ClientError> {
        self.shared
            .unsubscribe(SubscriptionKind::Pattern, pattern.into())
            .await
    }

    /// Returns the endpoint currently believed to own `slot`.
    pub fn slot_owner(&self, slot: u16) -> Option<Endpoint> {
        self.shared.read_slots().owner(slot).cloned()
    }

    /// Records `endpoint` as the owner of every slot in `range`.
    pub fn assign_slots(&self, range: RangeInclusive<u16>, endpoint: &Endpoint) {
        self.shared.write_slots().assign_range(range, endpoint);
    }

    /// Number of channels and patterns currently subscribed.
    pub fn subscription_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Stops accepting requests and closes every connection, letting
    /// queued requests complete for up to the drain timeout.
    pub async fn shutdown(&self) {
        self.shared.shutdown().await;
    }
}

/// The command connection to one endpoint. Callers for the same endpoint
/// serialize on it while a connection is being opened; other endpoints
/// are unaffected.
type EndpointSlot = Arc<AsyncMutex<Option<Arc<Connection>>>>;

#[derive(Default)]
struct SubscriberSlot {
    conn: Option<Arc<Connection>>,
    /// Set once a subscriber connection has been lost; the next one must
    /// replay the registry.
    needs_replay: bool,
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    extractor: Arc<dyn KeyExtractor>,
    connections: Mutex<HashMap<Endpoint, EndpointSlot>>,
    subscriber: AsyncMutex<SubscriberSlot>,
    slots: RwLock<SlotTable>,
    registry: Arc<SubscriptionRegistry>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    sequence: AtomicU64,
    closed: AtomicBool,
    stats: Stats,
    supervisor: Mutex<Option<AbortHandle>>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, SlotTable> {
        self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, SlotTable> {
        self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<Endpoint, EndpointSlot>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, slot: Option<u16>) -> Endpoint {
        slot.and_then(|s| self.read_slots().owner(s).cloned())
            .unwrap_or_else(|| self.config.default_endpoint.clone())
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_in_flight: self.config.max_in_flight,
            read_buffer_capacity: self.config.read_buffer_capacity,
        }
    }

    async fn submit(&self, command: Command) -> Result<Frame, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.stats.record_submit();

        let slot = command
            .slot()
            .or_else(|| self.extractor.routing_key(command.args()).map(key_slot));
        let bytes = command.encode();
        let mut attempts = Attempts::default();
        // (endpoint, send ASKING first) chosen by the last redirect
        let mut redirect: Option<(Endpoint, bool)> = None;

        loop {
            let (endpoint, asking) = redirect
                .take()
                .unwrap_or_else(|| (self.route(slot), false));
            trace!("request {seq} -> {endpoint}");

            let conn = self.connection_for(&endpoint).await?;
            let queued = if asking {
                conn.enqueue_asking(bytes.clone()).await
            } else {
                conn.enqueue(bytes.clone()).await
            };
            let outcome = match queued {
                Ok(pending) => self.await_reply(pending).await,
                Err(e) => Err(e),
            };

            let failure = match &outcome {
                Ok(frame) => frame.as_error().map(|message| Failure::Reply {
                    message: message.to_string(),
                    origin: endpoint.clone(),
                }),
                Err(ClientError::ConnectionLost { sent }) => {
                    Some(Failure::ConnectionLost { sent: *sent })
                }
                Err(_) => None,
            };
            let Some(failure) = failure else {
                return outcome;
            };

            let decision = self.config.retry.decide(&failure, attempts);
            if let Some(reason) = decision.reason() {
                self.stats.record_retransmit(reason);
            }
            match decision {
                Decision::GiveUp => return outcome,
                Decision::RetrySame { delay, reason } => {
                    attempts.retries += 1;
                    debug!("request {seq} to {endpoint}: {reason:?}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Decision::RetryElsewhereOnce { endpoint: target } => {
                    attempts.redirects += 1;
                    debug!("request {seq}: ASK from {endpoint} to {target}");
                    redirect = Some((target, true));
                }
                Decision::RetryElsewherePermanent {
                    slot: moved,
                    endpoint: target,
                } => {
                    attempts.redirects += 1;
                    debug!("request {seq}: slot {moved} moved from {endpoint} to {target}");
                    self.write_slots().assign(moved, target.clone());
                    redirect = Some((target, false));
                }
            }
        }
    }

    /// Awaits one attempt, applying the request timeout.
    async fn await_reply(&self, pending: PendingReply) -> Result<Frame, ClientError> {
        let Some(limit) = self.config.request_timeout else {
            return pending.await;
        };
        // on timeout the reply future is dropped, which cancels the request
        match tokio::time::timeout(limit, pending).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.record_timeout();
                Err(ClientError::Timeout)
            }
        }
    }

    /// Returns a ready command connection to `endpoint`, opening one if
    /// needed.
    ///
    /// Only callers routed to the same endpoint wait for each other; the
    /// map lock is never held across a connect.
    async fn connection_for(&self, endpoint: &Endpoint) -> Result<Arc<Connection>, ClientError> {
        let slot = Arc::clone(self.lock_connections().entry(endpoint.clone()).or_default());
        let mut slot = slot.lock().await;
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        if let Some(conn) = slot.as_ref().filter(|c| c.is_ready()) {
            return Ok(Arc::clone(conn));
        }
        *slot = None;

        let conn = self.open(endpoint, Role::Commands).await?;
        if self.is_closed() {
            // shutdown ran while we were connecting and cannot see this one
            conn.terminate();
            self.stats.record_connections_closed(1);
            return Err(ClientError::Shutdown);
        }
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    async fn open(&self, endpoint: &Endpoint, role: Role) -> Result<Arc<Connection>, ClientError> {
        let unavailable = |detail: String| {
            warn!("failed to connect to {endpoint}: {detail}");
            ClientError::ConnectionUnavailable(format!("{endpoint}: {detail}"))
        };
        let transport = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(endpoint),
        )
        .await
        .map_err(|_| unavailable("connect timed out".into()))?
        .map_err(|e| unavailable(e.to_string()))?;

        self.stats.record_connection_opened();
        Ok(Connection::establish(
            endpoint.clone(),
            role,
            transport,
            self.connection_options(),
            Arc::clone(&self.registry),
            self.events.clone(),
        ))
    }

    async fn subscribe(
        &self,
        kind: SubscriptionKind,
        name: Bytes,
    ) -> Result<Subscription, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        // registered before the request is sent so that no message following
        // the acknowledgment can be missed
        let rx = self.registry.register(kind, name.clone());

        let result = async {
            let conn = self.subscriber_connection().await?;
            let pending = conn
                .enqueue_subscription(encode(kind.subscribe_verb(), &name))
                .await?;
            self.await_reply(pending).await
        }
        .await;

        match result {
            Ok(reply) => match reply.as_error() {
                None => {
                    debug!("subscribed to {:?}", String::from_utf8_lossy(&name));
                    Ok(Subscription::new(kind, name, rx))
                }
                Some(message) => {
                    let err = ClientError::SubscriptionRejected(message.to_string());
                    drop(rx);
                    self.registry.rollback(kind, &name);
                    Err(err)
                }
            },
            Err(e) => {
                drop(rx);
                self.registry.rollback(kind, &name);
                Err(e)
            }
        }
    }

    async fn unsubscribe(&self, kind: SubscriptionKind, name: Bytes) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        // removed first so a concurrent replay cannot bring it back
        if !self.registry.remove(kind, &name) {
            return Ok(());
        }
        let conn = {
            let slot = self.subscriber.lock().await;
            slot.conn.as_ref().filter(|c| c.is_ready()).cloned()
        };
        let Some(conn) = conn else {
            return Ok(());
        };

        let pending = conn
            .enqueue_subscription(encode(kind.unsubscribe_verb(), &name))
            .await?;
        let reply = self.await_reply(pending).await?;
        match reply.as_error() {
            Some(message) => Err(ClientError::SubscriptionRejected(message.to_string())),
            None => Ok(()),
        }
    }

    /// Returns the subscriber connection, opening (and if needed, replaying
    /// subscriptions on) a new one when the old one is gone.
    async fn subscriber_connection(&self) -> Result<Arc<Connection>, ClientError> {
        let mut guard = self.subscriber.lock().await;
        let slot = &mut *guard;
        if self.is_closed() {
            return Err(ClientError::Shutdown);
        }
        match &slot.conn {
            Some(conn) if conn.is_ready() => return Ok(Arc::clone(conn)),
            Some(_) => slot.needs_replay = true,
            None => {}
        }

        let conn = self
            .open(&self.config.default_endpoint, Role::Subscriber)
            .await?;
        if slot.needs_replay {
            if let Err(e) = self.replay(&conn).await {
                conn.terminate();
                self.stats.record_connections_closed(1);
                return Err(e);
            }
            slot.needs_replay = false;
        }
        // published only once replayed, so a half-restored connection is
        // never handed out
        slot.conn = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Re-sends a subscribe request for every registered channel and
    /// pattern on `conn`.
    async fn replay(&self, conn: &Arc<Connection>) -> Result<(), ClientError> {
        let active = self.registry.active();
        if active.is_empty() {
            return Ok(());
        }
        info!(
            "replaying {} subscriptions on {}",
            active.len(),
            conn.endpoint()
        );

        let mut pending = Vec::with_capacity(active.len());
        for (kind, name) in &active {
            pending.push(
                conn.enqueue_subscription(encode(kind.subscribe_verb(), name))
                    .await?,
            );
        }
        for reply in pending {
            let reply = self.await_reply(reply).await?;
            if let Some(message) = reply.as_error() {
                warn!("server rejected replayed subscription: {message}");
            }
        }
        Ok(())
    }

    /// Drops a failed command connection unless it was already replaced.
    ///
    /// A slot that is busy belongs to a caller that is replacing the
    /// connection anyway, so it is skipped rather than waited on.
    fn evict(&self, endpoint: &Endpoint, id: u64) {
        let Some(slot) = self.lock_connections().get(endpoint).cloned() else {
            return;
        };
        let Ok(mut slot) = slot.try_lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|c| c.id() == id) {
            *slot = None;
            debug!("evicted connection {id} to {endpoint}");
        }
    }

    /// Re-establishes the subscriber connection after connection `id` failed.
    async fn restore_subscriber(&self, id: u64) {
        {
            let mut slot = self.subscriber.lock().await;
            if !slot.conn.as_ref().is_some_and(|c| c.id() == id) {
                return;
            }
            slot.conn = None;
            slot.needs_replay = true;
        }
        if self.registry.is_empty() {
            return;
        }

        let policy = &self.config.retry;
        for attempt in 0..=policy.max_retries {
            if self.is_closed() {
                return;
            }
            match self.subscriber_connection().await {
                Ok(conn) => {
                    info!("subscriber connection to {} restored", conn.endpoint());
                    return;
                }
                Err(e) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "restoring subscriber connection failed (attempt {}): {e}",
                        attempt + 1
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        warn!(
            "giving up on restoring {} subscriptions",
            self.registry.len()
        );
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }

        // a slot still locked is mid-connect; its caller sees `closed` and
        // terminates what it opened
        let slots: Vec<EndpointSlot> = self
            .lock_connections()
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let mut conns: Vec<Arc<Connection>> = slots
            .iter()
            .filter_map(|slot| slot.try_lock().ok().and_then(|mut c| c.take()))
            .collect();
        if let Some(conn) = self.subscriber.lock().await.conn.take() {
            conns.push(conn);
        }

        let count = conns.len();
        let drain_timeout = self.config.drain_timeout;
        let mut closing = JoinSet::new();
        for conn in conns {
            closing.spawn(async move { conn.close(drain_timeout).await });
        }
        while closing.join_next().await.is_some() {}
        self.stats.record_connections_closed(count);
        info!("shut down, closed {count} connections");
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let conns = self
            .connections
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for slot in conns.values() {
            if let Some(conn) = slot.try_lock().ok().and_then(|c| c.as_ref().cloned()) {
                conn.terminate();
            }
        }
        if let Some(conn) = &self.subscriber.get_mut().conn {
            conn.terminate();
        }
        let supervisor = self
            .supervisor
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = supervisor.take() {
            task.abort();
        }
    }
}

async fn supervise(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let ConnectionEvent::Failed {
            id,
            endpoint,
            role,
            reason,
        } = event;
        shared.stats.record_connection_failure();
        debug!("connection {id} to {endpoint} ({role:?}) failed: {reason}");

        match role {
            Role::Commands => shared.evict(&endpoint, id),
            Role::Subscriber => shared.restore_subscriber(id).await,
        }
    }
    debug!("supervisor stopped");
}

fn encode(verb: &[u8], name: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    encode_command(&[verb, name], &mut buf);
    buf.freeze()
}
