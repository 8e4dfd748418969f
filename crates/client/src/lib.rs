//! # Pairlink Client Library
//!
//! This crate is the client side of Pairlink: it pairs a dApp with a remote
//! wallet over an untrusted relay, keeps the resulting session, and routes
//! signing requests to the wallet.
//!
//! ## Overview
//!
//! - **Identity**: a persistent Ed25519 key pair kept in the OS keychain
//! - **Pairing Channel**: proposal handshake and encrypted frames over the relay
//! - **Session Registry**: the single active session, validated on every change
//! - **Request Dispatcher**: correlation ids, deadlines, cancellation
//! - **Connection Manager**: the state machine tying it all together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          UI layer                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    ConnectionManager                            │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌───────────────────┐  │
//! │  │ IdentityStore│  │ SessionRegistry  │  │ RequestDispatcher │  │
//! │  │  (keychain)  │  │                  │  │   (pending ids)   │  │
//! │  └──────────────┘  └──────────────────┘  └───────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      PairingChannel                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 RelayTransport (MemoryRelay, ...)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pairlink_client::{ClientOptions, ConnectionManager, KeychainManager, MemoryRelayHub};
//!
//! let hub = MemoryRelayHub::new();
//! let manager = ConnectionManager::new(
//!     Arc::new(hub.connect()),
//!     KeychainManager::system(),
//!     ClientOptions::default(),
//! )?;
//!
//! let session = manager.connect().await?;
//! let signature = manager.personal_sign("eip155:1", "hello").await?;
//! manager.disconnect().await;
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Connection state machine and events
//! - [`pairing`]: Pairing channel and subscriptions
//! - [`session`]: Session state and registry
//! - [`rpc`]: Request dispatcher
//! - [`identity`]: Client identity persistence
//! - [`relay`]: Relay transport abstraction and in-memory relay
//! - [`storage`]: Keychain access
//! - [`actions`]: Typed wallet actions
//! - [`wallet_sim`]: Simulated wallet peer
//! - [`config`]: TOML configuration

pub mod actions;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod pairing;
pub mod relay;
pub mod rpc;
pub mod session;
pub mod storage;
pub mod wallet_sim;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use connection::{ClientOptions, ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{ConnectError, RpcError, SessionError, TransportError};
pub use identity::{IdentityError, IdentityStore};
pub use pairing::{ChannelConfig, ChannelEvent, Pairing, PairingChannel, Subscription};
pub use relay::{MemoryRelay, MemoryRelayHub, RelayEvent, RelayTransport};
pub use rpc::{PendingCall, RequestDispatcher};
pub use session::{Session, SessionEvent, SessionRegistry};
pub use storage::{KeychainBackend, KeychainManager, MemoryKeychain, SystemKeychain};
pub use wallet_sim::SimulatedWallet;

/// Returns the current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
