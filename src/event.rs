use std::time::Instant;

use crate::transport::{Payload, TransportError};

/// Lifecycle notification delivered to subscribers.
#[non_exhaustive]
#[derive(Debug, Clone, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Event {
    /// A transport finished its handshake
    Connected,
    /// An open transport closed unexpectedly; a reconnect is scheduled
    Disconnected,
    /// A non-keepalive message arrived
    Message(Payload),
    /// The connection was closed by the caller; nothing follows
    Killed,
    /// The server rejected the upgrade request
    UnexpectedResponse { status: u16, status_text: String },
    /// The transport reported a failure
    Error(TransportError),
}

/// Observable state of the supervised connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// A transport was created and its handshake is pending
    Connecting {
        /// Reconnection attempt that created the transport, `0` for the first connection
        attempt: u32,
    },
    /// The current transport is open
    Open {
        /// When the handshake completed
        since: Instant,
    },
    /// Waiting out the retry interval before the next attempt
    Reconnecting {
        /// Attempt number of the scheduled retry
        attempt: u32,
    },
    /// Closed by the caller; terminal
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open { .. })
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}
