//! Relay transport abstraction.
//!
//! A relay moves opaque, already-encrypted byte frames between parties
//! subscribed to the same topic. It promises at-least-once delivery and
//! nothing about ordering; duplicates are possible.

use std::future::Future;

use protocol::{RelayAuth, Topic};
use tokio::sync::broadcast;

use crate::error::TransportError;

pub mod memory;

pub use memory::{MemoryRelay, MemoryRelayHub};

/// Buffer size for relay event channels.
pub const RELAY_EVENT_BUFFER_SIZE: usize = 256;

/// Events delivered by a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// An encrypted frame arrived on a subscribed topic.
    Message {
        /// Topic the frame was published on.
        topic: Topic,
        /// Encrypted payload.
        payload: Vec<u8>,
    },
    /// The connection to the relay went down or came back.
    Connectivity {
        /// Whether the relay is reachable now.
        online: bool,
    },
}

/// Connection to a relay.
///
/// Implementations never retry; callers decide what to do with a failure.
pub trait RelayTransport: Send + Sync + 'static {
    /// Present a signed credential. Required before subscribing or publishing,
    /// and again after every reconnect.
    fn authenticate(
        &self,
        auth: RelayAuth,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Start receiving frames published on `topic`.
    fn subscribe(&self, topic: &Topic) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Stop receiving frames published on `topic`.
    fn unsubscribe(
        &self,
        topic: &Topic,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publish one frame on `topic`, best effort.
    fn publish(
        &self,
        topic: &Topic,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to messages and connectivity changes.
    fn events(&self) -> broadcast::Receiver<RelayEvent>;

    /// Whether the relay is currently reachable.
    fn is_online(&self) -> bool;
}
