//! [`Connector`] implementation over `tokio-tungstenite`.
//!
//! Each transport owns one background task that performs the handshake and then shuttles
//! frames between the socket and the transport handle. Dropping every handle closes the
//! socket.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderMap, HeaderName, HeaderValue, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{
    CLOSE_ABNORMAL, CLOSE_NO_STATUS, ConnectRequest, Connector, Payload, ReadyState, Transport,
    TransportError, TransportEvent, TransportEvents, WsError,
};
use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EventSender = mpsc::UnboundedSender<TransportEvent>;

const DEFAULT_CLOSE_TIMEOUT_DURATION: Duration = Duration::from_secs(5);

/// Creates WebSocket transports with `tokio_tungstenite::connect_async`.
///
/// `transport_options` entries are sent as extra HTTP headers on the upgrade request.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    /// How long a local close waits for the server's close frame before dropping the socket
    pub close_timeout: Duration,
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT_DURATION,
        }
    }
}

impl TungsteniteConnector {
    #[must_use]
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}

impl Connector for TungsteniteConnector {
    type Transport = TungsteniteTransport;

    fn connect(&self, request: ConnectRequest<'_>) -> Result<(TungsteniteTransport, TransportEvents)> {
        let http_request = build_request(request)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SocketState {
            url: request.url.to_owned(),
            ready_state: AtomicU8::new(ReadyState::Connecting as u8),
            buffered: AtomicUsize::new(0),
            protocol: OnceLock::new(),
            extensions: OnceLock::new(),
        });

        tokio::spawn(run(
            http_request,
            command_rx,
            event_tx,
            Arc::clone(&state),
            self.close_timeout,
        ));

        Ok((
            TungsteniteTransport {
                commands: command_tx,
                state,
            },
            event_rx,
        ))
    }
}

fn build_request(request: ConnectRequest<'_>) -> Result<Request> {
    let mut http_request = request.url.into_client_request()?;
    let headers = http_request.headers_mut();

    if !request.protocols.is_empty() {
        let value = HeaderValue::from_str(&request.protocols.join(", "))
            .map_err(|e| Error::validation(format!("invalid sub-protocol list: {e}")))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    for (key, value) in request.options {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| Error::validation(format!("invalid transport option `{key}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::validation(format!("invalid value for `{key}`: {e}")))?;
        headers.insert(name, value);
    }

    Ok(http_request)
}

enum Command {
    Send(Payload),
    Close(Option<CloseFrame>),
    /// Drop the socket without a close handshake
    Abort,
}

struct SocketState {
    url: String,
    ready_state: AtomicU8,
    buffered: AtomicUsize,
    protocol: OnceLock<String>,
    extensions: OnceLock<String>,
}

impl SocketState {
    fn finish(&self, events: &EventSender, code: u16, reason: String) {
        self.ready_state
            .store(ReadyState::Closed as u8, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.url, code, %reason, "WebSocket closed");

        _ = events.send(TransportEvent::Close { code, reason });
    }
}

/// Handle to one `tokio-tungstenite` connection attempt.
pub struct TungsteniteTransport {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<SocketState>,
}

impl Transport for TungsteniteTransport {
    fn send(&self, payload: Payload) -> Result<()> {
        if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
            return Err(WsError::ConnectionClosed.into());
        }

        let len = payload.len();
        self.state.buffered.fetch_add(len, Ordering::AcqRel);
        self.commands
            .send(Command::Send(payload))
            .map_err(|_e| {
                self.state.buffered.fetch_sub(len, Ordering::AcqRel);
                WsError::ConnectionClosed
            })?;
        Ok(())
    }

    fn close(&self, code: Option<u16>, reason: Option<&str>) {
        let previous = self
            .state
            .ready_state
            .fetch_max(ReadyState::Closing as u8, Ordering::AcqRel);
        if previous >= ReadyState::Closing as u8 {
            return;
        }

        let frame = code.map(|code| CloseFrame {
            code: CloseCode::from(code),
            reason: reason.unwrap_or_default().to_owned().into(),
        });
        _ = self.commands.send(Command::Close(frame));
    }

    fn abort(&self) {
        // Also overrides a close handshake already in flight.
        let previous = self
            .state
            .ready_state
            .fetch_max(ReadyState::Closing as u8, Ordering::AcqRel);
        if previous == ReadyState::Closed as u8 {
            return;
        }

        _ = self.commands.send(Command::Abort);
    }

    fn buffered_amount(&self) -> usize {
        self.state.buffered.load(Ordering::Acquire)
    }

    fn extensions(&self) -> String {
        self.state.extensions.get().cloned().unwrap_or_default()
    }

    fn protocol(&self) -> String {
        self.state.protocol.get().cloned().unwrap_or_default()
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.ready_state.load(Ordering::Acquire))
    }

    fn url(&self) -> String {
        self.state.url.clone()
    }
}

/// Socket task: handshake, then pump frames until the connection ends.
async fn run(
    request: Request,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: EventSender,
    state: Arc<SocketState>,
    close_timeout: Duration,
) {
    let mut pending = Vec::new();
    let connect = connect_async(request);
    tokio::pin!(connect);

    let stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((stream, response)) => {
                    if let Some(protocol) = header_value(response.headers(), &SEC_WEBSOCKET_PROTOCOL) {
                        _ = state.protocol.set(protocol);
                    }
                    if let Some(extensions) = header_value(response.headers(), &SEC_WEBSOCKET_EXTENSIONS) {
                        _ = state.extensions.set(extensions);
                    }
                    break stream;
                }
                Err(e) => {
                    report_handshake_failure(&events, e);
                    state.finish(&events, CLOSE_ABNORMAL, String::new());
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(payload)) => pending.push(payload),
                Some(Command::Close(_) | Command::Abort) | None => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(url = %state.url, "WebSocket closed before the handshake completed");
                    state.finish(&events, CLOSE_ABNORMAL, String::new());
                    return;
                }
            }
        }
    };

    // A close requested during the handshake stays in effect.
    _ = state.ready_state.compare_exchange(
        ReadyState::Connecting as u8,
        ReadyState::Open as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    );

    #[cfg(feature = "tracing")]
    tracing::debug!(url = %state.url, protocol = ?state.protocol.get(), "WebSocket open");

    _ = events.send(TransportEvent::Open);

    let (mut write, mut read) = stream.split();
    let (code, reason) = pump(
        &mut write,
        &mut read,
        pending,
        &mut commands,
        &events,
        &state,
        close_timeout,
    )
    .await;

    state.finish(&events, code, reason);
}

async fn pump(
    write: &mut SplitSink<WsStream, Message>,
    read: &mut SplitStream<WsStream>,
    pending: Vec<Payload>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    events: &EventSender,
    state: &SocketState,
    close_timeout: Duration,
) -> (u16, String) {
    for payload in pending {
        if let Err(e) = write_payload(write, state, payload).await {
            report_error(events, e);
            return (CLOSE_ABNORMAL, String::new());
        }
    }

    let mut remote_close = None;

    loop {
        tokio::select! {
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(%text, "Received WebSocket text message");
                    _ = events.send(TransportEvent::Message(Payload::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    _ = events.send(TransportEvent::Message(Payload::Binary(bytes.to_vec())));
                }
                Some(Ok(Message::Close(frame))) => {
                    // tungstenite answers the close frame; the stream ends right after.
                    state
                        .ready_state
                        .store(ReadyState::Closing as u8, Ordering::Release);
                    remote_close = Some(close_parts(frame));
                }
                Some(Ok(_)) => {
                    // Ping, pong and raw frames are handled by tungstenite.
                }
                Some(Err(e)) => {
                    if let Some(parts) = remote_close {
                        return parts;
                    }
                    report_error(events, e);
                    return (CLOSE_ABNORMAL, String::new());
                }
                None => return remote_close.unwrap_or((CLOSE_ABNORMAL, String::new())),
            },
            command = commands.recv(), if remote_close.is_none() => match command {
                Some(Command::Send(payload)) => {
                    if let Err(e) = write_payload(write, state, payload).await {
                        report_error(events, e);
                        return (CLOSE_ABNORMAL, String::new());
                    }
                }
                Some(Command::Close(frame)) => {
                    return close_locally(write, read, commands, frame, close_timeout).await;
                }
                Some(Command::Abort) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(url = %state.url, "Aborting WebSocket connection");
                    return (CLOSE_ABNORMAL, String::new());
                }
                None => {
                    // Every handle was dropped.
                    return close_locally(write, read, commands, None, close_timeout).await;
                }
            }
        }
    }
}

async fn write_payload(
    write: &mut SplitSink<WsStream, Message>,
    state: &SocketState,
    payload: Payload,
) -> std::result::Result<(), TungsteniteError> {
    let len = payload.len();
    let message = match payload {
        Payload::Text(text) => Message::Text(text.into()),
        Payload::Binary(bytes) => Message::Binary(bytes.into()),
    };
    let result = write.send(message).await;
    state.buffered.fetch_sub(len, Ordering::AcqRel);
    result
}

/// Send our close frame and wait for the server's, bounded by `close_timeout`.
///
/// An abort received meanwhile ends the handshake at once.
async fn close_locally(
    write: &mut SplitSink<WsStream, Message>,
    read: &mut SplitStream<WsStream>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    frame: Option<CloseFrame>,
    close_timeout: Duration,
) -> (u16, String) {
    let handshake = async {
        if write.send(Message::Close(frame)).await.is_err() {
            return None;
        }
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Close(frame)) => return Some(close_parts(frame)),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    };
    let aborted = async {
        while let Some(command) = commands.recv().await {
            if matches!(command, Command::Abort) {
                return;
            }
        }
        std::future::pending::<()>().await;
    };

    let reply = tokio::select! {
        reply = timeout(close_timeout, handshake) => reply,
        () = aborted => Ok(None),
    };

    match reply {
        Ok(Some(parts)) => parts,
        Ok(None) => (CLOSE_ABNORMAL, String::new()),
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("No close frame from server within {close_timeout:?}, dropping socket");
            (CLOSE_ABNORMAL, String::new())
        }
    }
}

fn close_parts(frame: Option<CloseFrame>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
        None => (CLOSE_NO_STATUS, String::new()),
    }
}

fn header_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn report_handshake_failure(events: &EventSender, error: TungsteniteError) {
    if let TungsteniteError::Http(response) = &error {
        let status = response.status();

        #[cfg(feature = "tracing")]
        tracing::warn!(%status, "WebSocket upgrade rejected");

        _ = events.send(TransportEvent::UnexpectedResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
        });
        return;
    }

    report_error(events, error);
}

fn report_error(events: &EventSender, error: TungsteniteError) {
    let error = Error::from(error);

    #[cfg(feature = "tracing")]
    tracing::warn!("WebSocket transport error: {error:?}");

    _ = events.send(TransportEvent::Error(TransportError::from(error)));
}
