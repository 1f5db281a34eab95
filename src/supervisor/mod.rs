//! The self-healing connection.
//!
//! [`ConnectionSupervisor`] owns one [`Transport`] at a time and replaces it whenever it closes
//! without the caller asking. All state lives behind a single lock; transport notifications and
//! timer firings are funnelled into it one at a time by small background tasks, so every
//! transition below runs to completion before the next one starts:
//!
//! ```text
//! Connecting --open--> Open --close--> Reconnecting --retry--> Connecting
//!      \                                    ^
//!       `-------------close-----------------'
//!
//! any state --ConnectionSupervisor::close--> Closed (terminal)
//! ```
//!
//! Each background task holds only a weak reference to the shared state and carries the
//! generation (transports) or token (timers) it was started for, so a notification from a
//! discarded transport or a cancelled timer is recognised and dropped.

#![expect(
    clippy::module_name_repetitions,
    reason = "Supervisor types expose their domain in the name for clarity"
)]

mod keepalive;
mod retry;
mod timer;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use async_stream::try_stream;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use self::keepalive::{KeepaliveMonitor, is_keepalive};
use self::retry::RetryScheduler;
use self::timer::TimerToken;
use crate::Result;
use crate::config::{
    ConnectionConfig, KeepaliveConfig, validate_keepalive_interval, validate_keepalive_timeout,
    validate_retry_interval,
};
use crate::error::Error;
use crate::event::{ConnectionState, Event};
use crate::transport::{
    ConnectRequest, Connector, Payload, ReadyState, Transport, TransportError, TransportEvent,
    TransportEvents, WsError,
};

/// Broadcast channel capacity for lifecycle events.
const BROADCAST_CAPACITY: usize = 1024;

/// Longest close reason accepted, in bytes (a control frame payload is 125 bytes minus the code).
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// A WebSocket connection that reconnects on its own.
///
/// Construction immediately starts the first connection attempt. From then on the supervisor:
///
/// - emits [`Event::Connected`] each time a transport opens;
/// - forwards every inbound payload as [`Event::Message`], except the reserved keepalive payload;
/// - force-closes a transport whose peer misses a keepalive window;
/// - emits [`Event::Disconnected`] when an open transport closes, then reconnects after the
///   fixed retry interval, indefinitely.
///
/// Only [`ConnectionSupervisor::close`] stops it. Closing is terminal and idempotent: the first
/// call emits [`Event::Killed`], later calls return `Ok(())` and do nothing.
///
/// Handles are cheap to clone and share the same connection. Dropping the last handle cancels
/// every timer and drops the transport.
///
/// # Example
///
/// ```no_run
/// use futures::StreamExt as _;
/// use resilient_ws::{ConnectionConfig, Event, WebSocket};
///
/// # async fn run() -> resilient_ws::Result<()> {
/// let ws = WebSocket::connect(ConnectionConfig::new("wss://example.com/feed"))?;
/// let mut events = Box::pin(ws.events());
///
/// while let Some(event) = events.next().await {
///     match event? {
///         Event::Connected => ws.send("hello")?,
///         Event::Message(payload) => println!("{payload:?}"),
///         _ => {}
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct ConnectionSupervisor<C: Connector> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Connector> {
    this: Weak<Self>,
    connector: C,
    core: Mutex<Core<C::Transport>>,
    events: broadcast::Sender<Event>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

struct Core<T> {
    config: ConnectionConfig,
    /// Set once by the caller's `close`; never reset
    closed: bool,
    /// The current transport is open and has not closed yet
    connected: bool,
    generation: u64,
    current: Option<Current<T>>,
    keepalive: KeepaliveMonitor,
    retry: RetryScheduler,
}

struct Current<T> {
    generation: u64,
    transport: Arc<T>,
    /// The transport reported its terminal close
    ended: bool,
}

impl<T> Core<T> {
    fn request(&self) -> ConnectRequest<'_> {
        ConnectRequest {
            url: &self.config.url,
            protocols: &self.config.protocols,
            options: &self.config.transport_options,
        }
    }

    fn transport(&self) -> Option<&Arc<T>> {
        self.current.as_ref().map(|current| &current.transport)
    }
}

impl<C: Connector> ConnectionSupervisor<C> {
    /// Validate `config` and start the first connection attempt through `connector`.
    ///
    /// # Errors
    ///
    /// Returns a [`Kind::Validation`](crate::error::Kind::Validation) error when the
    /// configuration is invalid, for example an empty or non-WebSocket url.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(config: ConnectionConfig, connector: C) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting { attempt: 0 });
        let retry = RetryScheduler::new(&config);

        let shared = Arc::new_cyclic(|this| Shared {
            this: Weak::clone(this),
            connector,
            core: Mutex::new(Core {
                config,
                closed: false,
                connected: false,
                generation: 0,
                current: None,
                keepalive: KeepaliveMonitor::new(),
                retry,
            }),
            events,
            state_tx,
            state_rx,
        });

        {
            let mut guard = shared.lock();
            shared.start(&mut guard, 0);
        }

        Ok(Self { shared })
    }

    /// Subscribe to lifecycle events.
    ///
    /// Only events emitted after this call are received. A receiver that falls more than the
    /// channel capacity behind observes [`RecvError::Lagged`].
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Lifecycle events as a stream.
    ///
    /// A subscriber that falls behind receives a single [`WsError::Lagged`] error, after which
    /// the stream ends. It also ends once every handle to the connection has been dropped.
    pub fn events(&self) -> impl Stream<Item = Result<Event>> + use<C> {
        let mut rx = self.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(count)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Event subscriber lagged, missed {count} events");
                        Err(WsError::Lagged { count })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Send a payload on the current transport.
    ///
    /// The payload is handed to the transport even before it opens; the transport decides
    /// whether to buffer or reject it.
    ///
    /// # Errors
    ///
    /// Returns [`Kind::NotConnected`](crate::error::Kind::NotConnected) after
    /// [`close`](Self::close) or while no transport exists (between a failed attempt and the
    /// next retry), and whatever the transport reports otherwise.
    pub fn send<P: Into<Payload>>(&self, payload: P) -> Result<()> {
        let transport = {
            let core = self.shared.lock();
            if core.closed {
                return Err(Error::not_connected());
            }
            core.transport().map(Arc::clone)
        };

        match transport {
            Some(transport) => transport.send(payload.into()),
            None => Err(Error::not_connected()),
        }
    }

    /// Close the connection for good.
    ///
    /// Cancels the pending retry and keepalive timers, closes the current transport with `code`
    /// and `reason`, and emits [`Event::Killed`]. Nothing is emitted afterwards, whatever the
    /// transport reports later.
    ///
    /// Calling `close` again is a no-op that returns `Ok(())` without looking at its arguments.
    ///
    /// # Errors
    ///
    /// Returns a [`Kind::Validation`](crate::error::Kind::Validation) error, leaving the
    /// connection untouched, when `code` is not `1000` or in `3000..=4999`, when `reason` is
    /// longer than 123 bytes, or when a `reason` is given without a `code`.
    pub fn close(&self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        let mut guard = self.shared.lock();
        let core = &mut *guard;

        if core.closed {
            #[cfg(feature = "tracing")]
            tracing::debug!("Close requested on an already closed connection");
            return Ok(());
        }

        validate_close(code, reason)?;

        core.retry.cancel();
        core.keepalive.stop();
        if let Some(current) = &core.current
            && !current.ended
        {
            current.transport.close(code, reason);
        }
        core.closed = true;
        core.connected = false;

        #[cfg(feature = "tracing")]
        tracing::debug!(?code, ?reason, "Connection closed by caller");

        self.shared.set_state(ConnectionState::Closed);
        self.shared.emit(Event::Killed);

        Ok(())
    }

    /// Current state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_rx.borrow()
    }

    /// A receiver that observes every state change.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether the current transport is open.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.shared.lock().connected
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Delay between an unexpected close and the next connection attempt.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.shared.lock().retry.interval()
    }

    /// Change the delay before reconnecting. Applies from the next scheduled retry.
    ///
    /// # Errors
    ///
    /// Returns a [`Kind::Validation`](crate::error::Kind::Validation) error for a zero interval.
    pub fn set_retry_interval(&self, interval: Duration) -> Result<()> {
        validate_retry_interval(interval)?;
        let mut guard = self.shared.lock();
        let core = &mut *guard;
        core.config.retry_interval = interval;
        core.retry.set_interval(interval);
        Ok(())
    }

    /// `None` when keepalive detection is disabled.
    #[must_use]
    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.shared
            .lock()
            .config
            .keepalive
            .as_ref()
            .map(|keepalive| keepalive.interval)
    }

    /// Change the keepalive cadence. Applies from the next time a transport opens.
    ///
    /// Enables keepalive detection with default settings when it was disabled.
    ///
    /// # Errors
    ///
    /// Returns a [`Kind::Validation`](crate::error::Kind::Validation) error for a zero interval.
    pub fn set_keepalive_interval(&self, interval: Duration) -> Result<()> {
        validate_keepalive_interval(interval)?;
        self.shared
            .lock()
            .config
            .keepalive
            .get_or_insert_with(KeepaliveConfig::default)
            .interval = interval;
        Ok(())
    }

    /// `None` when keepalive detection is disabled.
    #[must_use]
    pub fn keepalive_timeout(&self) -> Option<Duration> {
        self.shared
            .lock()
            .config
            .keepalive
            .as_ref()
            .map(|keepalive| keepalive.timeout)
    }

    /// Change how long a keepalive countdown waits. Applies from the next countdown.
    ///
    /// Enables keepalive detection with default settings when it was disabled.
    ///
    /// # Errors
    ///
    /// Returns a [`Kind::Validation`](crate::error::Kind::Validation) error for a zero timeout.
    pub fn set_keepalive_timeout(&self, timeout: Duration) -> Result<()> {
        validate_keepalive_timeout(timeout)?;
        self.shared
            .lock()
            .config
            .keepalive
            .get_or_insert_with(KeepaliveConfig::default)
            .timeout = timeout;
        Ok(())
    }

    /// Bytes queued on the current transport. `None` while no transport exists.
    #[must_use]
    pub fn buffered_amount(&self) -> Option<usize> {
        self.with_transport(Transport::buffered_amount)
    }

    /// Extensions negotiated by the current transport, empty until it opens.
    #[must_use]
    pub fn extensions(&self) -> Option<String> {
        self.with_transport(Transport::extensions)
    }

    /// Sub-protocol selected by the server for the current transport.
    #[must_use]
    pub fn protocol(&self) -> Option<String> {
        self.with_transport(Transport::protocol)
    }

    /// `readyState` of the current transport.
    #[must_use]
    pub fn ready_state(&self) -> Option<ReadyState> {
        self.with_transport(Transport::ready_state)
    }

    /// Url the current transport connected to, as reported by the transport.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.with_transport(Transport::url)
    }

    fn with_transport<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&C::Transport) -> R,
    {
        self.shared.lock().transport().map(|transport| f(transport.as_ref()))
    }
}

#[cfg(feature = "ws")]
impl ConnectionSupervisor<crate::transport::tungstenite::TungsteniteConnector> {
    /// Supervise a `tokio-tungstenite` connection to `config.url`.
    ///
    /// # Errors
    ///
    /// See [`ConnectionSupervisor::new`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        Self::new(config, crate::transport::tungstenite::TungsteniteConnector::default())
    }
}

impl<C: Connector> Clone for ConnectionSupervisor<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionSupervisor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.shared.lock();
        f.debug_struct("ConnectionSupervisor")
            .field("url", &core.config.url)
            .field("state", &*self.shared.state_rx.borrow())
            .field("generation", &core.generation)
            .field("keepalive_running", &core.keepalive.is_running())
            .field("retry_pending", &core.retry.is_pending())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Core<C::Transport>> {
        // Every transition leaves the core consistent, so a poisoned lock is still usable.
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(%state, "Connection state changed");

        self.state_tx.send_replace(state);
    }

    /// Replace the current transport with a fresh connection attempt.
    fn start(&self, core: &mut Core<C::Transport>, attempt: u32) {
        core.generation = core.generation.wrapping_add(1);
        let generation = core.generation;
        // The previous transport is discarded, never reused.
        core.current = None;

        self.set_state(ConnectionState::Connecting { attempt });

        match self.connector.connect(core.request()) {
            Ok((transport, events)) => {
                core.current = Some(Current {
                    generation,
                    transport: Arc::new(transport),
                    ended: false,
                });
                self.spawn_pump(generation, events);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Unable to start connection attempt {attempt}: {e:?}");

                self.emit(Event::Error(TransportError::from(e)));
                self.schedule_retry(core);
            }
        }
    }

    /// Feed one transport's notifications into the state machine, in order.
    fn spawn_pump(&self, generation: u64, mut events: TransportEvents) {
        let this = Weak::clone(&self.this);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = this.upgrade() else {
                    break;
                };
                shared.on_transport_event(generation, event);
            }
        });
    }

    fn on_transport_event(&self, generation: u64, event: TransportEvent) {
        let mut guard = self.lock();
        let core = &mut *guard;

        if core.closed {
            return;
        }

        let live = core
            .current
            .as_ref()
            .is_some_and(|current| current.generation == generation && !current.ended);
        if !live {
            #[cfg(feature = "tracing")]
            tracing::trace!(generation, ?event, "Ignoring event from a discarded transport");
            return;
        }

        match event {
            TransportEvent::Open => self.on_open(core),
            TransportEvent::Message(payload) => self.on_message(core, payload),
            TransportEvent::Close { code, reason } => self.on_close(core, code, &reason),
            TransportEvent::Error(error) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Transport error: {error}");

                self.emit(Event::Error(error));
            }
            TransportEvent::UnexpectedResponse {
                status,
                status_text,
            } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(status, %status_text, "Upgrade request rejected");

                self.emit(Event::UnexpectedResponse {
                    status,
                    status_text,
                });
            }
        }
    }

    fn on_open(&self, core: &mut Core<C::Transport>) {
        core.connected = true;
        core.retry.reset();

        self.set_state(ConnectionState::Open {
            since: Instant::now(),
        });
        self.emit(Event::Connected);

        if let Some(keepalive) = &core.config.keepalive {
            let this = Weak::clone(&self.this);
            core.keepalive.start(keepalive.interval, move |token| {
                if let Some(shared) = this.upgrade() {
                    shared.on_keepalive_tick(token);
                }
            });
        }
    }

    fn on_message(&self, core: &mut Core<C::Transport>, payload: Payload) {
        if let Some(keepalive) = &core.config.keepalive
            && is_keepalive(&payload, &keepalive.payload)
        {
            let pending = core.keepalive.acknowledge();

            #[cfg(feature = "tracing")]
            tracing::trace!(pending, "Keepalive received");
            #[cfg(not(feature = "tracing"))]
            let _ = pending;

            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(bytes = payload.len(), "Message received");

        self.emit(Event::Message(payload));
    }

    fn on_close(&self, core: &mut Core<C::Transport>, code: u16, reason: &str) {
        if let Some(current) = core.current.as_mut() {
            current.ended = true;
        }
        core.keepalive.stop();

        #[cfg(feature = "tracing")]
        tracing::debug!(code, reason, "Transport closed unexpectedly");
        #[cfg(not(feature = "tracing"))]
        let _ = (code, reason);

        if core.connected {
            core.connected = false;
            self.emit(Event::Disconnected);
        }

        self.schedule_retry(core);
    }

    fn schedule_retry(&self, core: &mut Core<C::Transport>) {
        let this = Weak::clone(&self.this);
        let (attempt, delay) = core.retry.schedule(move |token| {
            if let Some(shared) = this.upgrade() {
                shared.on_retry(token);
            }
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(attempt, ?delay, "Reconnect scheduled");
        #[cfg(not(feature = "tracing"))]
        let _ = delay;

        self.set_state(ConnectionState::Reconnecting { attempt });
    }

    fn on_retry(&self, token: TimerToken) {
        let mut guard = self.lock();
        let core = &mut *guard;

        if core.closed {
            return;
        }
        let Some(attempt) = core.retry.fire(token) else {
            return;
        };

        self.start(core, attempt);
    }

    fn on_keepalive_tick(&self, token: TimerToken) {
        let mut guard = self.lock();
        let core = &mut *guard;

        if core.closed || !core.keepalive.is_tick_current(token) {
            return;
        }
        let Some(timeout) = core.config.keepalive.as_ref().map(|keepalive| keepalive.timeout)
        else {
            return;
        };

        // A countdown still pending from an earlier tick keeps its deadline.
        let this = Weak::clone(&self.this);
        let armed = core.keepalive.arm_countdown(timeout, move |token| {
            if let Some(shared) = this.upgrade() {
                shared.on_keepalive_expired(token);
            }
        });

        #[cfg(feature = "tracing")]
        tracing::trace!(armed, ?timeout, "Keepalive tick");
        #[cfg(not(feature = "tracing"))]
        let _ = armed;
    }

    fn on_keepalive_expired(&self, token: TimerToken) {
        let mut guard = self.lock();
        let core = &mut *guard;

        if core.closed || !core.keepalive.take_expired(token) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(
            generation = core.generation,
            "No keepalive received in time, closing transport"
        );

        // The peer is presumed dead, so no close handshake is attempted. The transport reports
        // the close like any other and reconnection follows from there.
        if let Some(transport) = core.transport() {
            transport.abort();
        }
    }
}

fn validate_close(code: Option<u16>, reason: Option<&str>) -> Result<()> {
    match code {
        None if reason.is_some() => {
            return Err(Error::validation("a close reason requires a close code"));
        }
        Some(code) if code != 1000 && !(3000..=4999).contains(&code) => {
            return Err(Error::validation(format!(
                "close code {code} is neither 1000 nor in 3000..=4999"
            )));
        }
        _ => {}
    }

    if let Some(reason) = reason
        && reason.len() > MAX_CLOSE_REASON_BYTES
    {
        return Err(Error::validation(format!(
            "close reason is {} bytes, at most {MAX_CLOSE_REASON_BYTES} are allowed",
            reason.len()
        )));
    }

    Ok(())
}
