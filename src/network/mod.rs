//! Connectivity: the wireless link capability and the manager that owns
//! link state for the whole node.

mod connectivity;
mod host;

pub use connectivity::{AttachPolicy, ConnectivityManager, LinkWatch, Transition};
pub use host::HostLink;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("link driver error: {0}")]
    Driver(String),

    #[error("gave up attaching after {0} polls")]
    AttemptsExhausted(u32),

    #[error("attach interrupted by shutdown")]
    Stopped,
}

/// Network attachment state. Legal moves are
/// Disconnected → Connecting → Connected → Disconnected, plus
/// Connecting → Disconnected when an attach is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl LinkState {
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Network credentials handed to the driver on every attach
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Metadata recorded when the link comes up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub address: Option<IpAddr>,
    pub signal_dbm: Option<i32>,
    pub ssid: Option<String>,
    /// Polls spent in the current attach sequence
    pub attempts: u32,
    /// Seconds since the link was last established
    pub connected_for_secs: Option<u64>,
}

/// Wireless link capability.
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Starts associating with the network. Does not wait for completion.
    async fn begin(&self, credentials: &Credentials) -> Result<(), LinkError>;

    async fn is_attached(&self) -> bool;

    async fn disconnect(&self);

    async fn local_addr(&self) -> Option<IpAddr>;

    async fn signal_dbm(&self) -> Option<i32>;
}
