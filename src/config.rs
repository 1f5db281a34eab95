#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::collections::BTreeMap;
use std::time::Duration;

use backoff::backoff::Constant;
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use url::Url;

use crate::Result;
use crate::error::Error;

const DEFAULT_KEEPALIVE_INTERVAL_DURATION: Duration = Duration::from_millis(5000);
const DEFAULT_KEEPALIVE_TIMEOUT_DURATION: Duration = Duration::from_millis(2500);
const DEFAULT_RETRY_INTERVAL_DURATION: Duration = Duration::from_millis(1000);

/// Payload the remote peer sends to signal liveness.
pub const DEFAULT_KEEPALIVE_PAYLOAD: &str = "ka";

/// Keepalive detection settings.
///
/// Every `interval` after the connection opens, a countdown of `timeout` is armed. Receiving
/// `payload` clears the countdown; if it elapses first, the transport is force-closed.
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct KeepaliveConfig {
    /// How often a keepalive countdown is armed
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_keepalive_interval")]
    #[builder(default = DEFAULT_KEEPALIVE_INTERVAL_DURATION)]
    pub interval: Duration,
    /// How long to wait for the keepalive payload once a countdown is armed
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_keepalive_timeout")]
    #[builder(default = DEFAULT_KEEPALIVE_TIMEOUT_DURATION)]
    pub timeout: Duration,
    /// Reserved message value that is consumed instead of delivered
    #[serde(default = "default_keepalive_payload")]
    #[builder(default = DEFAULT_KEEPALIVE_PAYLOAD.to_owned(), into)]
    pub payload: String,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for a supervised connection.
///
/// Only `url` is required; every other field has a default. Durations are (de)serialized as
/// integer milliseconds:
///
/// ```
/// # use resilient_ws::config::ConnectionConfig;
/// # use std::time::Duration;
/// let config = ConnectionConfig::new("wss://example.com/feed")
///     .with_protocols(["v2.feed"])
///     .with_retry_interval(Duration::from_millis(500));
/// assert!(config.validate().is_ok());
/// ```
#[serde_as]
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Endpoint to connect to (`ws://` or `wss://`)
    pub url: String,
    /// Sub-protocols offered during the handshake, in preference order
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Opaque options handed to the connector unmodified
    #[serde(default)]
    pub transport_options: BTreeMap<String, String>,
    /// Keepalive detection; `None` disables it entirely
    #[serde(default = "default_keepalive")]
    pub keepalive: Option<KeepaliveConfig>,
    /// Fixed delay between an unexpected close and the next connection attempt
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_retry_interval")]
    pub retry_interval: Duration,
}

impl ConnectionConfig {
    #[must_use]
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            protocols: Vec::new(),
            transport_options: BTreeMap::new(),
            keepalive: default_keepalive(),
            retry_interval: DEFAULT_RETRY_INTERVAL_DURATION,
        }
    }

    #[must_use]
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_transport_option<K: Into<String>, V: Into<String>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.transport_options.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    #[must_use]
    pub fn without_keepalive(mut self) -> Self {
        self.keepalive = None;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Check the configuration before any connection is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::validation("connection url must not be empty"));
        }

        let url = Url::parse(&self.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported url scheme `{}`, expected ws or wss",
                url.scheme()
            )));
        }

        validate_retry_interval(self.retry_interval)?;

        if let Some(keepalive) = &self.keepalive {
            validate_keepalive_interval(keepalive.interval)?;
            validate_keepalive_timeout(keepalive.timeout)?;
        }

        Ok(())
    }
}

impl From<&ConnectionConfig> for Constant {
    fn from(config: &ConnectionConfig) -> Self {
        Constant::new(config.retry_interval)
    }
}

pub(crate) fn validate_retry_interval(interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::validation("retry interval must be greater than zero"));
    }
    Ok(())
}

pub(crate) fn validate_keepalive_interval(interval: Duration) -> Result<()> {
    if interval.is_zero() {
        return Err(Error::validation("keepalive interval must be greater than zero"));
    }
    Ok(())
}

pub(crate) fn validate_keepalive_timeout(timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(Error::validation("keepalive timeout must be greater than zero"));
    }
    Ok(())
}

fn default_keepalive() -> Option<KeepaliveConfig> {
    Some(KeepaliveConfig::default())
}

fn default_keepalive_interval() -> Duration {
    DEFAULT_KEEPALIVE_INTERVAL_DURATION
}

fn default_keepalive_timeout() -> Duration {
    DEFAULT_KEEPALIVE_TIMEOUT_DURATION
}

fn default_keepalive_payload() -> String {
    DEFAULT_KEEPALIVE_PAYLOAD.to_owned()
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL_DURATION
}
