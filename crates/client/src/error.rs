//! Error taxonomy of the pairing client.
//!
//! Transport duplication and reordering never show up here; they are
//! absorbed by correlation-id deduplication in the dispatcher.

use protocol::ProtocolError;
use thiserror::Error;

use crate::identity::IdentityError;

/// Failures of a single relay operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The relay cannot be reached.
    #[error("relay is offline")]
    Offline,

    /// The relay has not accepted our credential.
    #[error("not authenticated with the relay")]
    Unauthorized,

    /// The operation needs a subscription we do not hold.
    #[error("not subscribed to topic {0}")]
    NotSubscribed(String),

    /// The relay refused the operation.
    #[error("relay rejected the operation: {0}")]
    Rejected(String),
}

/// Failures validating or mutating session state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The wallet approved something that was never proposed.
    #[error("approved namespaces exceed the proposal: {0}")]
    NamespaceMismatch(String),

    /// The session ran past its expiry.
    #[error("session expired")]
    Expired,

    /// A peer message named a topic that is not the active session's.
    #[error("unknown session topic {0}")]
    UnknownTopic(String),

    /// No session is active.
    #[error("no active session")]
    NoActiveSession,
}

/// Failures of `connect`.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The wallet declined the proposal.
    #[error("wallet rejected the proposal ({code}): {message}")]
    Rejected {
        /// Peer-reported code.
        code: i64,
        /// Peer-reported message.
        message: String,
    },

    /// No answer before the connect deadline.
    #[error("timed out waiting for wallet approval")]
    Timeout,

    /// The relay failed underneath the handshake.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A connection is already being established, held or torn down.
    #[error("a connection is already active")]
    AlreadyActive,

    /// The approval could not be turned into a session.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// The local identity could not be loaded.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Failures of a dispatched RPC.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// No session namespace permits `method` on `chain`.
    #[error("method {method} is not allowed on {chain}")]
    MethodNotAllowed {
        /// The requested method.
        method: String,
        /// The requested chain.
        chain: String,
    },

    /// No response before the deadline.
    #[error("request timed out")]
    Timeout,

    /// The channel went away before a response arrived.
    #[error("disconnected before a response arrived")]
    Disconnected,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The wallet answered with an error, passed through verbatim.
    #[error("wallet error ({code}): {message}")]
    Remote {
        /// Peer-reported code.
        code: i64,
        /// Peer-reported message.
        message: String,
    },

    /// The one-shot send failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The request could not be encoded or the result had an unexpected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        RpcError::InvalidResponse(err.to_string())
    }
}
