//! Broker components - the connection/channel state machine.
//!
//! A [`BrokerComponent`] is an exchange or a queue together with the
//! transport plumbing that makes it usable: a connection, a logical
//! channel, and the declaration that must succeed on the broker before the
//! component is [`BrokerState::Ready`].
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected → Connecting → ConnectionOpen → ChannelOpening
//!      ▲                                            │
//!      │ unexpected close                           ▼
//!      │ (reconnect after 5s)                  ChannelOpen
//!      │                                            │
//!      └───── Ready ◄──── Declaring ◄───────────────┘
//!                │
//!                │ close()
//!                ▼
//!             Closed
//! ```
//!
//! [`BrokerComponent::run`] drives the loop. Any unexpected closure of the
//! channel or connection is logged and answered with a reconnect after a
//! fixed 5-second delay, indefinitely - the broker is assumed eventually
//! reachable. A deliberate [`BrokerComponent::close`] sets a closing flag
//! *before* tearing the transport down, so the resulting close
//! notification stops the loop instead of scheduling a reconnect. That
//! flag is the difference between self-healing and an infinite reconnect
//! loop on shutdown.
//!
//! # Shared connections
//!
//! A queue constructed with [`BrokerComponent::subscriber_queue`] attaches
//! to an already-ready exchange and reuses its connection and channel
//! (one connection per process, many logical components). Attached
//! components have no run loop of their own: they become not-ready
//! whenever the owning component loses its channel, and closing them only
//! detaches - it never tears down the shared transport.

use crate::settings::ConnectionSettings;
use crate::transport::{
    Channel, Connection, ExchangeKind, ExchangeSpec, QueueSpec, Transport,
};
use eventline_core::MessagingError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Delay between an unexpected closure and the reconnect attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Generation marker for an attached component that was closed.
const CLOSED_GENERATION: u64 = u64::MAX;

/// Lifecycle states of a broker component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// No transport connection.
    Disconnected,
    /// Transport connection being established.
    Connecting,
    /// Connection open, no channel yet.
    ConnectionOpen,
    /// Channel being opened.
    ChannelOpening,
    /// Channel open, component not yet declared.
    ChannelOpen,
    /// Declaration in flight on the broker.
    Declaring,
    /// Declared and usable.
    Ready,
    /// Deliberately closed; the run loop has stopped.
    Closed,
}

/// A queue-to-exchange binding applied at declaration time.
#[derive(Debug, Clone)]
pub struct QueueBinding {
    /// The exchange to bind to.
    pub exchange: String,
    /// The routing key, possibly empty.
    pub routing_key: String,
}

#[derive(Debug, Clone)]
enum ComponentKind {
    Exchange {
        kind: ExchangeKind,
        auto_delete: bool,
    },
    Queue {
        exclusive: bool,
        auto_delete: bool,
        bindings: Vec<QueueBinding>,
    },
}

fn unpoisoned<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Transport slots shared by a component and anything attached to it.
struct OwnedLink {
    state: watch::Sender<BrokerState>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    closing: AtomicBool,
    /// Bumped every time a fresh channel is installed; attached
    /// components compare against it to notice that their declaration
    /// died with the old channel.
    generation: AtomicU64,
}

impl OwnedLink {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(BrokerState::Disconnected),
            connection: Mutex::new(None),
            channel: Mutex::new(None),
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: BrokerState) {
        self.state.send_replace(state);
    }

    fn store_connection(&self, connection: Option<Arc<dyn Connection>>) {
        *unpoisoned(self.connection.lock()) = connection;
    }

    fn take_connection(&self) -> Option<Arc<dyn Connection>> {
        unpoisoned(self.connection.lock()).take()
    }

    fn install_channel(&self, channel: Arc<dyn Channel>) {
        *unpoisoned(self.channel.lock()) = Some(channel);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn take_channel(&self) -> Option<Arc<dyn Channel>> {
        unpoisoned(self.channel.lock()).take()
    }

    fn current_channel(&self) -> Option<Arc<dyn Channel>> {
        unpoisoned(self.channel.lock()).clone()
    }
}

struct AttachedLink {
    owner: Arc<OwnedLink>,
    declared_generation: AtomicU64,
}

enum Link {
    Owned(Arc<OwnedLink>),
    Attached(AttachedLink),
}

/// An exchange or queue plus the transport state machine behind it.
pub struct BrokerComponent {
    name: String,
    durable: bool,
    kind: ComponentKind,
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
    link: Link,
    declared_name: Mutex<Option<String>>,
}

impl BrokerComponent {
    fn new_owned(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
        durable: bool,
        kind: ComponentKind,
    ) -> Self {
        Self {
            name: name.to_string(),
            durable,
            kind,
            settings,
            transport,
            link: Link::Owned(Arc::new(OwnedLink::new())),
            declared_name: Mutex::new(None),
        }
    }

    /// Creates an exchange component of the given `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidSettings`] when `name` is empty -
    /// the default exchange is not declarable.
    pub fn exchange(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<Self, MessagingError> {
        if name.is_empty() {
            return Err(MessagingError::InvalidSettings(
                "exchange name must not be empty".to_string(),
            ));
        }
        Ok(Self::new_owned(
            transport,
            settings,
            name,
            durable,
            ComponentKind::Exchange {
                kind,
                auto_delete: false,
            },
        ))
    }

    /// Creates a direct exchange component.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidSettings`] when `name` is empty.
    pub fn direct_exchange(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
        durable: bool,
    ) -> Result<Self, MessagingError> {
        Self::exchange(transport, settings, name, ExchangeKind::Direct, durable)
    }

    /// Creates a fanout exchange component.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidSettings`] when `name` is empty.
    pub fn fanout_exchange(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
        durable: bool,
    ) -> Result<Self, MessagingError> {
        Self::exchange(transport, settings, name, ExchangeKind::Fanout, durable)
    }

    /// Creates a topic exchange component.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidSettings`] when `name` is empty.
    pub fn topic_exchange(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
        durable: bool,
    ) -> Result<Self, MessagingError> {
        Self::exchange(transport, settings, name, ExchangeKind::Topic, durable)
    }

    /// Creates a headers exchange component.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidSettings`] when `name` is empty.
    pub fn headers_exchange(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
        durable: bool,
    ) -> Result<Self, MessagingError> {
        Self::exchange(transport, settings, name, ExchangeKind::Headers, durable)
    }

    /// Creates a non-durable, non-exclusive, non-auto-deleted queue
    /// component with its own connection.
    #[must_use]
    pub fn queue(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
    ) -> Self {
        Self::new_owned(
            transport,
            settings,
            name,
            false,
            ComponentKind::Queue {
                exclusive: false,
                auto_delete: false,
                bindings: Vec::new(),
            },
        )
    }

    /// Creates a durable, non-exclusive, non-auto-deleted queue component
    /// with its own connection.
    #[must_use]
    pub fn durable_queue(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
    ) -> Self {
        Self::new_owned(
            transport,
            settings,
            name,
            true,
            ComponentKind::Queue {
                exclusive: false,
                auto_delete: false,
                bindings: Vec::new(),
            },
        )
    }

    /// Creates a durable, exclusive, non-auto-deleted queue component
    /// with its own connection.
    #[must_use]
    pub fn durable_exclusive_queue(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        name: &str,
    ) -> Self {
        Self::new_owned(
            transport,
            settings,
            name,
            true,
            ComponentKind::Queue {
                exclusive: true,
                auto_delete: false,
                bindings: Vec::new(),
            },
        )
    }

    /// Creates a queue bound to an already-ready exchange, reusing its
    /// connection and channel.
    ///
    /// The queue is declared and bound immediately on the exchange's
    /// channel. An empty `name` asks the broker to generate one; empty
    /// `routing_keys` binds once with the empty key (the pub/sub default
    /// for fanout exchanges).
    ///
    /// # Errors
    ///
    /// - [`MessagingError::InvalidSettings`] when `exchange` is not an
    ///   exchange component
    /// - [`MessagingError::NotReady`] when the exchange is not `Ready`
    /// - [`MessagingError::DeclarationFailed`] when the declare or a bind
    ///   is refused
    pub async fn subscriber_queue(
        exchange: &Self,
        name: &str,
        routing_keys: &[&str],
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
    ) -> Result<Self, MessagingError> {
        if !exchange.is_exchange() {
            return Err(MessagingError::InvalidSettings(
                "subscriber queues attach to exchange components".to_string(),
            ));
        }
        if !exchange.is_ready() {
            return Err(MessagingError::NotReady(exchange.name.clone()));
        }
        let owner = Arc::clone(exchange.owned_link());
        let channel = owner
            .current_channel()
            .ok_or_else(|| MessagingError::NotReady(exchange.name.clone()))?;
        let generation = owner.generation.load(Ordering::SeqCst);

        let bindings: Vec<QueueBinding> = if routing_keys.is_empty() {
            vec![QueueBinding {
                exchange: exchange.name.clone(),
                routing_key: String::new(),
            }]
        } else {
            routing_keys
                .iter()
                .map(|routing_key| QueueBinding {
                    exchange: exchange.name.clone(),
                    routing_key: (*routing_key).to_string(),
                })
                .collect()
        };

        let component = Self {
            name: name.to_string(),
            durable,
            kind: ComponentKind::Queue {
                exclusive,
                auto_delete,
                bindings,
            },
            settings: exchange.settings.clone(),
            transport: Arc::clone(&exchange.transport),
            link: Link::Attached(AttachedLink {
                owner,
                declared_generation: AtomicU64::new(CLOSED_GENERATION),
            }),
            declared_name: Mutex::new(None),
        };
        component.declare_on(channel.as_ref()).await?;
        if let Link::Attached(attached) = &component.link {
            attached
                .declared_generation
                .store(generation, Ordering::SeqCst);
        }
        tracing::info!(
            queue = %component.queue_name().unwrap_or_default(),
            exchange = %exchange.name,
            "subscriber queue declared and bound"
        );
        Ok(component)
    }

    fn owned_link(&self) -> &Arc<OwnedLink> {
        match &self.link {
            Link::Owned(link) => link,
            Link::Attached(attached) => &attached.owner,
        }
    }

    /// The component's configured name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the component was declared durable.
    #[must_use]
    pub const fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether this component is an exchange.
    #[must_use]
    pub const fn is_exchange(&self) -> bool {
        matches!(self.kind, ComponentKind::Exchange { .. })
    }

    /// Whether this component is a queue.
    #[must_use]
    pub const fn is_queue(&self) -> bool {
        matches!(self.kind, ComponentKind::Queue { .. })
    }

    /// The component's name in its role as an exchange, if it is one.
    #[must_use]
    pub fn exchange_name(&self) -> Option<&str> {
        self.is_exchange().then_some(self.name.as_str())
    }

    /// The queue's effective name - the broker-assigned one once
    /// declared, the configured one otherwise. `None` for exchanges.
    #[must_use]
    pub fn queue_name(&self) -> Option<String> {
        if !self.is_queue() {
            return None;
        }
        let declared = unpoisoned(self.declared_name.lock()).clone();
        Some(declared.unwrap_or_else(|| self.name.clone()))
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BrokerState {
        match &self.link {
            Link::Owned(link) => *link.state.borrow(),
            Link::Attached(attached) => {
                let declared = attached.declared_generation.load(Ordering::SeqCst);
                if declared == CLOSED_GENERATION {
                    return BrokerState::Closed;
                }
                let owner_state = *attached.owner.state.borrow();
                let current = attached.owner.generation.load(Ordering::SeqCst);
                if owner_state == BrokerState::Ready && declared == current {
                    BrokerState::Ready
                } else {
                    BrokerState::Disconnected
                }
            }
        }
    }

    /// Whether the component is declared and usable.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == BrokerState::Ready
    }

    /// A receiver tracking the component's lifecycle. Attached components
    /// share the owning component's signal.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<BrokerState> {
        self.owned_link().state.subscribe()
    }

    /// The live channel, for producers and consumers.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotReady`] when no channel is installed.
    pub fn channel(&self) -> Result<Arc<dyn Channel>, MessagingError> {
        self.owned_link()
            .current_channel()
            .ok_or_else(|| MessagingError::NotReady(self.name.clone()))
    }

    /// Waits until the component is `Ready`, up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotReady`] on timeout and
    /// [`MessagingError::Closed`] when the component closes first.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), MessagingError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut receiver = self.watch_state();
        loop {
            // Mark the current value seen first, then inspect; a state
            // change landing in between still wakes `changed()`.
            receiver.borrow_and_update();
            if self.is_ready() {
                return Ok(());
            }
            if self.state() == BrokerState::Closed {
                return Err(MessagingError::Closed);
            }
            match tokio::time::timeout_at(deadline, receiver.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(MessagingError::Closed),
                Err(_) => return Err(MessagingError::NotReady(self.name.clone())),
            }
        }
    }

    async fn declare_on(&self, channel: &dyn Channel) -> Result<(), MessagingError> {
        match &self.kind {
            ComponentKind::Exchange { kind, auto_delete } => {
                channel
                    .declare_exchange(ExchangeSpec {
                        name: self.name.clone(),
                        kind: *kind,
                        durable: self.durable,
                        auto_delete: *auto_delete,
                    })
                    .await
            }
            ComponentKind::Queue {
                exclusive,
                auto_delete,
                bindings,
            } => {
                let actual = channel
                    .declare_queue(QueueSpec {
                        name: self.name.clone(),
                        durable: self.durable,
                        exclusive: *exclusive,
                        auto_delete: *auto_delete,
                    })
                    .await?;
                for binding in bindings {
                    channel
                        .bind_queue(
                            actual.clone(),
                            binding.exchange.clone(),
                            binding.routing_key.clone(),
                        )
                        .await?;
                }
                *unpoisoned(self.declared_name.lock()) = Some(actual);
                Ok(())
            }
        }
    }

    /// Drives the component's lifecycle until deliberately closed.
    ///
    /// Connects, opens a channel, declares, then waits for the channel or
    /// connection to go away. An unexpected closure reconnects after
    /// [`RECONNECT_DELAY`]; a closure following [`close`](Self::close)
    /// ends the loop. Attached components return immediately - their
    /// owner's loop is the one that matters.
    #[allow(clippy::cognitive_complexity)] // One loop owns the whole connection lifecycle
    pub async fn run(&self) {
        let Link::Owned(link) = &self.link else {
            tracing::debug!(component = %self.name, "attached component has no run loop");
            return;
        };
        loop {
            if link.closing.load(Ordering::SeqCst) {
                break;
            }
            link.set_state(BrokerState::Connecting);
            tracing::info!(
                component = %self.name,
                host = %self.settings.host_name(),
                port = self.settings.port(),
                "connecting to broker"
            );
            let connection = match self.transport.connect(self.settings.clone()).await {
                Ok(connection) => connection,
                Err(error) => {
                    tracing::warn!(
                        component = %self.name,
                        %error,
                        "connection open failed, retrying in {}s",
                        RECONNECT_DELAY.as_secs()
                    );
                    link.set_state(BrokerState::Disconnected);
                    metrics::counter!("eventline_broker_reconnects_total").increment(1);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            // close() may have raced the connect; drop the fresh
            // connection instead of proceeding to Ready.
            if link.closing.load(Ordering::SeqCst) {
                if let Err(error) = connection.close().await {
                    tracing::debug!(%error, "connection close during shutdown");
                }
                break;
            }
            link.set_state(BrokerState::ConnectionOpen);
            link.store_connection(Some(Arc::clone(&connection)));

            link.set_state(BrokerState::ChannelOpening);
            let channel = match connection.open_channel().await {
                Ok(channel) => channel,
                Err(error) => {
                    tracing::warn!(component = %self.name, %error, "channel open failed");
                    if let Err(close_error) = connection.close().await {
                        tracing::debug!(%close_error, "connection close after channel failure");
                    }
                    link.store_connection(None);
                    link.set_state(BrokerState::Disconnected);
                    metrics::counter!("eventline_broker_reconnects_total").increment(1);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            link.set_state(BrokerState::ChannelOpen);
            link.install_channel(Arc::clone(&channel));

            link.set_state(BrokerState::Declaring);
            if let Err(error) = self.declare_on(channel.as_ref()).await {
                tracing::warn!(component = %self.name, %error, "declaration failed");
                link.take_channel();
                if let Err(close_error) = connection.close().await {
                    tracing::debug!(%close_error, "connection close after declare failure");
                }
                link.store_connection(None);
                link.set_state(BrokerState::Disconnected);
                metrics::counter!("eventline_broker_reconnects_total").increment(1);
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
            if link.closing.load(Ordering::SeqCst) {
                if let Err(error) = connection.close().await {
                    tracing::debug!(%error, "connection close during shutdown");
                }
                link.take_channel();
                link.store_connection(None);
                break;
            }
            link.set_state(BrokerState::Ready);
            tracing::info!(component = %self.name, "broker component ready");

            let close_reason = tokio::select! {
                reason = connection.closed() => reason,
                reason = channel.closed() => reason,
            };
            link.take_channel();
            link.store_connection(None);

            if link.closing.load(Ordering::SeqCst) {
                tracing::info!(component = %self.name, "closed deliberately, not reconnecting");
                break;
            }
            tracing::warn!(
                component = %self.name,
                reason = %close_reason,
                "closed unexpectedly, reconnecting in {}s",
                RECONNECT_DELAY.as_secs()
            );
            metrics::counter!("eventline_broker_reconnects_total").increment(1);
            link.set_state(BrokerState::Disconnected);
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
        link.take_channel();
        link.store_connection(None);
        link.set_state(BrokerState::Closed);
    }

    /// Deliberately closes the component. Idempotent.
    ///
    /// Sets the closing flag first, then closes the channel, then the
    /// connection, so the close notification reaching the run loop stops
    /// it instead of scheduling a reconnect. Closing an attached
    /// component only detaches it from the shared channel.
    pub async fn close(&self) {
        match &self.link {
            Link::Owned(link) => {
                if link.closing.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(channel) = link.take_channel() {
                    if let Err(error) = channel.close().await {
                        tracing::debug!(component = %self.name, %error, "channel close");
                    }
                }
                if let Some(connection) = link.take_connection() {
                    if let Err(error) = connection.close().await {
                        tracing::debug!(component = %self.name, %error, "connection close");
                    }
                }
                // When run() was never started there is no loop to move
                // the state; reflect the closure here.
                if *link.state.borrow() == BrokerState::Disconnected {
                    link.set_state(BrokerState::Closed);
                }
            }
            Link::Attached(attached) => {
                attached
                    .declared_generation
                    .store(CLOSED_GENERATION, Ordering::SeqCst);
            }
        }
    }
}

impl std::fmt::Debug for BrokerComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerComponent")
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
