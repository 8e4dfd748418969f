//! Connection state machine.
//!
//! [`ConnectionManager`] is the one object an application constructs and
//! hands to its UI. It drives the pairing channel, owns the session
//! registry and the request dispatcher, and reports every change through
//! [`ConnectionEvent`]s.
//!
//! ```text
//! Disconnected --connect--> Connecting --approved--> Connected
//!      ^                        |                      |  |
//!      |<-------failed----------+                      |  |
//!      |<--Disconnecting <--disconnect-----------------+  |
//!      |<--------peer terminated / expired------------+  |
//!      |                                                  | relay offline
//!      |<--resume failed-- Reconnecting <-----------------+
//!                              |---resumed---> Connected
//! ```

use std::fmt;
use std::time::Duration;

use protocol::{Metadata, ProposalNamespaces};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pairing::ChannelConfig;
use crate::rpc::dispatcher::DEFAULT_REQUEST_TIMEOUT;
use crate::session::Session;

pub mod manager;

pub use manager::ConnectionManager;

/// Buffer size for the connection event broadcast.
pub const EVENT_BUFFER_SIZE: usize = 64;

/// Default interval between session expiry checks.
pub const DEFAULT_EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No pairing and no session.
    Disconnected,
    /// Waiting for the wallet to approve.
    Connecting,
    /// Session established, requests flow.
    Connected,
    /// Tearing down after a local disconnect.
    Disconnecting,
    /// Relay lost; session kept while resumption is attempted.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Events emitted by the connection manager for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ConnectionEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// The session was created, changed or cleared.
    SessionChanged(Option<Session>),
    /// A pairing URI to show to the user (QR code or deep link).
    PairingUri(String),
    /// The wallet emitted an event such as `accountsChanged`.
    PeerEvent {
        chain_id: String,
        name: String,
        data: Value,
    },
    /// The session ended on the wallet's side or by expiry.
    SessionTerminated { code: i64, message: String },
    /// Error occurred.
    Error(String),
}

/// What the client proposes and how long it waits.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Metadata shown to the user in the wallet.
    pub metadata: Metadata,
    /// Namespaces the wallet must grant.
    pub required_namespaces: ProposalNamespaces,
    /// Namespaces the wallet may grant.
    pub optional_namespaces: ProposalNamespaces,
    /// Handshake and resumption timing.
    pub channel: ChannelConfig,
    /// Deadline of each dispatched request.
    pub request_timeout: Duration,
    /// How often session expiry and overdue requests are checked.
    pub expiry_check_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            metadata: Metadata::default(),
            required_namespaces: ProposalNamespaces::new(),
            optional_namespaces: ProposalNamespaces::new(),
            channel: ChannelConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            expiry_check_interval: DEFAULT_EXPIRY_CHECK_INTERVAL,
        }
    }
}

impl ClientOptions {
    /// Options proposing `required` with the given metadata.
    pub fn new(metadata: Metadata, required: ProposalNamespaces) -> Self {
        Self {
            metadata,
            required_namespaces: required,
            ..Default::default()
        }
    }

    /// Sets the optional namespaces.
    pub fn optional_namespaces(mut self, optional: ProposalNamespaces) -> Self {
        self.optional_namespaces = optional;
        self
    }

    /// Sets the channel timing.
    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Sets the request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the expiry check interval.
    pub fn expiry_check_interval(mut self, interval: Duration) -> Self {
        self.expiry_check_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_event_serialization_shape() {
        let json =
            serde_json::to_value(ConnectionEvent::StateChanged(ConnectionState::Connected))
                .unwrap();
        assert_eq!(json["type"], "StateChanged");
        assert_eq!(json["payload"], "Connected");

        let json = serde_json::to_value(ConnectionEvent::SessionTerminated {
            code: 6000,
            message: "bye".into(),
        })
        .unwrap();
        assert_eq!(json["payload"]["code"], 6000);
    }

    #[test]
    fn test_options_builders() {
        let options = ClientOptions::default()
            .request_timeout(Duration::from_secs(1))
            .expiry_check_interval(Duration::from_millis(100));
        assert_eq!(options.request_timeout, Duration::from_secs(1));
        assert_eq!(options.expiry_check_interval, Duration::from_millis(100));
        assert!(options.required_namespaces.is_empty());
    }
}
