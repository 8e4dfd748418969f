//! Encrypted pairing channel over a relay.
//!
//! This module provides:
//! - [`Pairing`]: the shared key and topic of the current pairing
//! - [`PairingChannel`]: handshake, framing, encryption and resumption
//! - [`Subscription`]: a cancellable handle over channel events

use protocol::messages::SessionDelete;
use protocol::{Frame, SymKey, Topic};

pub mod channel;
pub mod subscription;

pub use channel::{Approved, ChannelConfig, FrameSender, PairingChannel};
pub use subscription::Subscription;

/// Buffer size for channel event broadcasts.
pub const CHANNEL_EVENT_BUFFER_SIZE: usize = 256;

/// The encrypted link shared with one wallet.
///
/// Created during the connect handshake and destroyed on disconnect or
/// expiry. A pairing becomes active once the wallet approves the proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    /// Topic the pairing's traffic is published on.
    pub topic: Topic,
    /// Shared ChaCha20-Poly1305 key.
    pub sym_key: SymKey,
    /// Unix timestamp the pairing expires.
    pub expiry: u64,
    /// Whether the wallet has approved the pairing.
    pub active: bool,
}

impl Pairing {
    /// Whether the pairing is past its expiry at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }
}

/// Events emitted by a [`PairingChannel`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A decrypted frame arrived on the pairing topic.
    Message {
        /// Topic the frame arrived on.
        topic: Topic,
        /// The decoded frame.
        frame: Frame,
    },
    /// Relay reachability changed.
    ConnectivityChanged(bool),
    /// The wallet ended the session; the pairing is already gone.
    SessionTerminatedByPeer {
        /// Topic of the terminated pairing.
        topic: Topic,
        /// Reason the wallet gave.
        reason: SessionDelete,
    },
    /// A pairing URI is ready to be handed to the wallet.
    PairingUri(String),
}
