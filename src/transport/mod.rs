//! The socket primitive supervised by [`ConnectionSupervisor`](crate::ConnectionSupervisor).
//!
//! A [`Connector`] creates one [`Transport`] per connection attempt. The transport reports its
//! lifecycle through an ordered channel of [`TransportEvent`]s: `Open` first, then any number of
//! `Message`s, then a terminal `Close`. `Error` and `UnexpectedResponse` may appear anywhere
//! before `Close`. A transport is never reused after it closes.
//!
//! [`tungstenite::TungsteniteConnector`] is the production implementation; tests can supply
//! scripted connectors.

pub mod error;
#[cfg(feature = "ws")]
pub mod tungstenite;

use std::collections::BTreeMap;

use tokio::sync::mpsc;

pub use error::{TransportError, WsError};

use crate::Result;

/// Close code reported when a close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Receiving half of a transport's notification channel.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A raw message payload, passed through without interpretation.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Raw bytes of the payload regardless of framing.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

/// Notification emitted by a transport.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The handshake completed
    Open,
    /// A message arrived from the peer
    Message(Payload),
    /// The transport is finished; no further events follow
    Close { code: u16, reason: String },
    /// A transport-level failure
    Error(TransportError),
    /// The upgrade request was answered with a non-101 status
    UnexpectedResponse { status: u16, status_text: String },
}

/// WebSocket `readyState` values.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    /// Inverse of `state as u8`; unknown values map to `Closed`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Everything a connector needs to start one connection attempt.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'req> {
    pub url: &'req str,
    pub protocols: &'req [String],
    pub options: &'req BTreeMap<String, String>,
}

/// Operations on a single connection attempt.
///
/// Implementations must not call back into the supervisor synchronously: every notification
/// goes through the [`TransportEvents`] channel returned by [`Connector::connect`].
pub trait Transport: Send + Sync + 'static {
    /// Queue a payload for sending. The transport decides whether to buffer or reject it.
    fn send(&self, payload: Payload) -> Result<()>;

    /// Begin closing. Completion is reported as [`TransportEvent::Close`].
    fn close(&self, code: Option<u16>, reason: Option<&str>);

    /// Drop the connection without a close handshake, reporting [`CLOSE_ABNORMAL`].
    ///
    /// Used when the peer is presumed dead. Transports without a cheaper path fall back to
    /// [`close`](Self::close).
    fn abort(&self) {
        self.close(None, None);
    }

    /// Bytes queued by `send` and not yet written to the socket.
    fn buffered_amount(&self) -> usize;

    /// Extensions accepted by the server, empty until open.
    fn extensions(&self) -> String;

    /// Sub-protocol selected by the server, empty until open.
    fn protocol(&self) -> String;

    fn ready_state(&self) -> ReadyState;

    fn url(&self) -> String;
}

/// Factory for transports.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Start a connection attempt without blocking.
    ///
    /// An `Err` means no attempt was started at all (for example a malformed request); failures
    /// after the attempt starts are reported through the returned event channel.
    fn connect(&self, request: ConnectRequest<'_>) -> Result<(Self::Transport, TransportEvents)>;
}
