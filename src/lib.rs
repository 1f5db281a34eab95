#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod error;
pub mod event;
pub mod supervisor;
pub mod transport;

pub use config::{ConnectionConfig, KeepaliveConfig};
pub use event::{ConnectionState, Event};
pub use supervisor::ConnectionSupervisor;
pub use transport::Payload;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A [`ConnectionSupervisor`] over `tokio-tungstenite`.
#[cfg(feature = "ws")]
pub type WebSocket = ConnectionSupervisor<transport::tungstenite::TungsteniteConnector>;
