#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use resilient_ws::error::Error;
use resilient_ws::transport::{
    ConnectRequest, Connector, Payload, ReadyState, Transport, TransportError, TransportEvent,
    TransportEvents,
};
use resilient_ws::{ConnectionState, Event, Result};
use tokio::sync::{broadcast, mpsc};

/// Scripted connector: every attempt yields a [`FakeSocket`] the test drives by hand.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

#[derive(Default)]
struct ConnectorState {
    sockets: Vec<FakeSocket>,
    attempts: usize,
    failures_left: usize,
}

impl FakeConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` attempts fail synchronously.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().failures_left = count;
    }

    /// Connection attempts so far, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    /// The socket created by the `index`th successful attempt.
    #[must_use]
    pub fn socket(&self, index: usize) -> FakeSocket {
        self.state.lock().unwrap().sockets[index].clone()
    }

    #[must_use]
    pub fn last_socket(&self) -> FakeSocket {
        self.state.lock().unwrap().sockets.last().unwrap().clone()
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.state.lock().unwrap().sockets.len()
    }
}

impl Connector for FakeConnector {
    type Transport = FakeTransport;

    fn connect(&self, request: ConnectRequest<'_>) -> Result<(FakeTransport, TransportEvents)> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;

        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(Error::validation("scripted connect failure"));
        }

        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SocketInner {
            events,
            url: request.url.to_owned(),
            protocols: request.protocols.to_vec(),
            options: request.options.clone(),
            ready_state: Mutex::new(ReadyState::Connecting),
            sent: Mutex::new(Vec::new()),
            close_calls: Mutex::new(Vec::new()),
        });
        state.sockets.push(FakeSocket {
            inner: Arc::clone(&inner),
        });

        Ok((FakeTransport { inner }, rx))
    }
}

pub type CloseCall = (Option<u16>, Option<String>);

struct SocketInner {
    events: mpsc::UnboundedSender<TransportEvent>,
    url: String,
    protocols: Vec<String>,
    options: BTreeMap<String, String>,
    ready_state: Mutex<ReadyState>,
    sent: Mutex<Vec<Payload>>,
    close_calls: Mutex<Vec<CloseCall>>,
}

impl SocketInner {
    fn emit(&self, event: TransportEvent) {
        drop(self.events.send(event));
    }
}

/// The supervisor's side of a fake socket.
pub struct FakeTransport {
    inner: Arc<SocketInner>,
}

impl Transport for FakeTransport {
    fn send(&self, payload: Payload) -> Result<()> {
        self.inner.sent.lock().unwrap().push(payload);
        Ok(())
    }

    /// Records the call and, like a real socket, reports the close back once.
    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        self.inner
            .close_calls
            .lock()
            .unwrap()
            .push((code, reason.map(str::to_owned)));

        let mut ready_state = self.inner.ready_state.lock().unwrap();
        if *ready_state != ReadyState::Closed {
            *ready_state = ReadyState::Closed;
            self.inner.emit(TransportEvent::Close {
                code: code.unwrap_or(1005),
                reason: reason.unwrap_or_default().to_owned(),
            });
        }
    }

    fn buffered_amount(&self) -> usize {
        self.inner.sent.lock().unwrap().iter().map(Payload::len).sum()
    }

    fn extensions(&self) -> String {
        String::new()
    }

    fn protocol(&self) -> String {
        self.inner.protocols.first().cloned().unwrap_or_default()
    }

    fn ready_state(&self) -> ReadyState {
        *self.inner.ready_state.lock().unwrap()
    }

    fn url(&self) -> String {
        self.inner.url.clone()
    }
}

/// The test's side of a fake socket: inject notifications, inspect what the supervisor did.
#[derive(Clone)]
pub struct FakeSocket {
    inner: Arc<SocketInner>,
}

impl FakeSocket {
    pub fn open(&self) {
        *self.inner.ready_state.lock().unwrap() = ReadyState::Open;
        self.inner.emit(TransportEvent::Open);
    }

    pub fn message<P: Into<Payload>>(&self, payload: P) {
        self.inner.emit(TransportEvent::Message(payload.into()));
    }

    /// Remote or network close.
    pub fn close(&self, code: u16, reason: &str) {
        *self.inner.ready_state.lock().unwrap() = ReadyState::Closed;
        self.inner.emit(TransportEvent::Close {
            code,
            reason: reason.to_owned(),
        });
    }

    pub fn error(&self, message: &str) {
        self.inner.emit(TransportEvent::Error(TransportError::new(
            std::io::Error::other(message.to_owned()),
        )));
    }

    pub fn unexpected_response(&self, status: u16, status_text: &str) {
        self.inner.emit(TransportEvent::UnexpectedResponse {
            status,
            status_text: status_text.to_owned(),
        });
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Payload> {
        self.inner.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn close_calls(&self) -> Vec<CloseCall> {
        self.inner.close_calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn url(&self) -> String {
        self.inner.url.clone()
    }

    #[must_use]
    pub fn protocols(&self) -> Vec<String> {
        self.inner.protocols.clone()
    }

    #[must_use]
    pub fn options(&self) -> BTreeMap<String, String> {
        self.inner.options.clone()
    }
}

/// Let every ready task run to completion without moving the clock.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

/// Events received so far, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Event names, for compact assertions.
pub fn names(events: &[Event]) -> Vec<String> {
    events.iter().map(ToString::to_string).collect()
}

pub fn is_reconnecting(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Reconnecting { .. })
}
