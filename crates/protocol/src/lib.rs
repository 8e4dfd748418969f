//! # Pairlink Protocol Library
//!
//! This crate provides wire types and cryptographic primitives for Pairlink,
//! a client-side wallet pairing system.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of Pairlink's communication layer,
//! providing:
//!
//! - **Message Definitions**: JSON-RPC 2.0 frames and the typed session params
//! - **Cryptographic Identity**: Ed25519 client identity, client ids and relay credentials
//! - **Envelope Encryption**: ChaCha20-Poly1305 sealing of every frame under the pairing key
//! - **Namespaces**: CAIP-2 chains, CAIP-10 accounts and per-namespace permissions
//! - **Pairing URI**: the out-of-band hand-off of topic and key to the wallet
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Session Messages               │  JSON-RPC 2.0
//! ├─────────────────────────────────────────┤
//! │          Envelope Encryption            │  ChaCha20-Poly1305
//! ├─────────────────────────────────────────┤
//! │          Relay Topic                    │  SHA-256(symKey)
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{seal, open, Frame, RpcRequest, SymKey, ClientIdentity};
//! use protocol::messages::methods;
//!
//! let identity = ClientIdentity::generate();
//! println!("Client ID: {}", identity.client_id());
//!
//! let key = SymKey::generate();
//! let request = RpcRequest::new(1, methods::SESSION_PING, serde_json::json!({})).unwrap();
//! let bytes = Frame::Request(request).to_json().unwrap();
//!
//! let envelope = seal(&key, &bytes).unwrap();
//! assert_eq!(open(&key, &envelope).unwrap(), bytes);
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Client identity, relay credentials and signatures
//! - [`cipher`]: Symmetric keys, topics and envelopes
//! - [`messages`]: Protocol message definitions
//! - [`namespaces`]: Chain, account and namespace types
//! - [`uri`]: Pairing URI
//! - [`error`]: Error types

pub mod cipher;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod namespaces;
pub mod uri;

pub use cipher::{open, seal, SymKey, Topic, SYM_KEY_LENGTH};
pub use crypto::{ClientId, ClientIdentity, PeerIdentity, RelayAuth, Signature};
pub use error::{ProtocolError, Result};
pub use messages::{
    ErrorObject, Frame, Metadata, Participant, Redirect, RpcRequest, RpcResponse, JSONRPC_VERSION,
};
pub use namespaces::{
    AccountId, ChainId, Namespace, Namespaces, ProposalNamespace, ProposalNamespaces,
};
pub use uri::PairingUri;
