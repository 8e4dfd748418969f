//! Protocol message definitions for Pairlink.
//!
//! All traffic between the client and the wallet is JSON-RPC 2.0. Requests
//! and responses are correlated solely by their numeric `id`; the relay
//! gives no ordering guarantee, so nothing here assumes one.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::namespaces::{Namespaces, ProposalNamespaces};

/// JSON-RPC version string carried on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// Wire method names.
pub mod methods {
    /// Client asks the wallet to open a session.
    pub const SESSION_PROPOSE: &str = "pl_sessionPropose";
    /// Client forwards a chain RPC call to the wallet.
    pub const SESSION_REQUEST: &str = "pl_sessionRequest";
    /// Wallet replaces the session namespaces.
    pub const SESSION_UPDATE: &str = "pl_sessionUpdate";
    /// Wallet pushes out the session expiry.
    pub const SESSION_EXTEND: &str = "pl_sessionExtend";
    /// Wallet emits a chain event (`accountsChanged`, `chainChanged`).
    pub const SESSION_EVENT: &str = "pl_sessionEvent";
    /// Liveness check, sent by either side.
    pub const SESSION_PING: &str = "pl_sessionPing";
    /// Either side ends the session.
    pub const SESSION_DELETE: &str = "pl_sessionDelete";
}

/// Well-known error codes.
pub mod codes {
    /// The user declined the request in the wallet.
    pub const USER_REJECTED: i64 = 5000;
    /// The wallet does not support a requested chain.
    pub const UNSUPPORTED_CHAINS: i64 = 5100;
    /// The wallet does not support a requested method.
    pub const UNSUPPORTED_METHODS: i64 = 5101;
    /// The user ended the session.
    pub const USER_DISCONNECTED: i64 = 6000;
    /// The session ran past its expiry.
    pub const SESSION_EXPIRED: i64 = 6001;
    /// JSON-RPC method not found.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// JSON-RPC invalid params.
    pub const INVALID_PARAMS: i64 = -32602;
}

// ============================================================================
// Frames
// ============================================================================

/// A JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id.
    pub id: u64,
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    /// Builds a request with typed params.
    pub fn new(id: u64, method: impl Into<String>, params: impl Serialize) -> Result<Self> {
        Ok(Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: serde_json::to_value(params)?,
        })
    }

    /// Decodes the params into a typed value.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.params.clone())?)
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Creates an error object without data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A JSON-RPC response carrying either a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Correlation id of the request being answered.
    pub id: u64,
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl RpcResponse {
    /// Builds a success response.
    pub fn success(id: u64, result: impl Serialize) -> Result<Self> {
        Ok(Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    /// Builds an error response.
    pub fn failure(id: u64, error: ErrorObject) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
        }
    }

    /// Collapses the response into a `Result`.
    ///
    /// An error wins over a result; a response with neither is a `null` result.
    pub fn into_outcome(self) -> std::result::Result<Value, ErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Any frame travelling over a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// A request (has a `method`).
    Request(RpcRequest),
    /// A response (has `result` or `error`).
    Response(RpcResponse),
}

impl Frame {
    /// The correlation id of the frame.
    pub fn id(&self) -> u64 {
        match self {
            Frame::Request(req) => req.id,
            Frame::Response(resp) => resp.id,
        }
    }

    /// Serializes the frame to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a frame from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// Participants
// ============================================================================

/// Deep-link targets used to bounce the user back to the app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirect {
    /// Native app scheme, e.g. `rn-web3modal://`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,
    /// Universal link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub universal: Option<String>,
}

/// Descriptive metadata shown to the user on the other side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Display name.
    pub name: String,
    /// Short description.
    pub description: String,
    /// Home page.
    pub url: String,
    /// Icon URLs.
    #[serde(default)]
    pub icons: Vec<String>,
    /// Deep-link targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Redirect>,
}

/// One side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Hex-encoded public key.
    pub public_key: String,
    /// Display metadata.
    pub metadata: Metadata,
}

// ============================================================================
// Session Messages
// ============================================================================

/// Params of `pl_sessionPropose`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProposal {
    /// The proposing client.
    pub proposer: Participant,
    /// Namespaces the client needs.
    pub required_namespaces: ProposalNamespaces,
    /// Namespaces the client can use if granted.
    #[serde(default)]
    pub optional_namespaces: ProposalNamespaces,
    /// Unix timestamp after which the proposal is void.
    pub expiry: u64,
}

/// Result of an approved `pl_sessionPropose`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionApproval {
    /// The approving wallet.
    pub responder: Participant,
    /// What the wallet granted.
    pub namespaces: Namespaces,
    /// Unix timestamp the session expires.
    pub expiry: u64,
}

/// Inner call of `pl_sessionRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Chain RPC method, e.g. `personal_sign`.
    pub method: String,
    /// Chain RPC params.
    #[serde(default)]
    pub params: Value,
}

/// Params of `pl_sessionRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    /// Target chain, e.g. `eip155:1`.
    pub chain_id: String,
    /// The call itself.
    pub request: RequestPayload,
}

/// Params of `pl_sessionUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdate {
    /// Replacement namespaces.
    pub namespaces: Namespaces,
}

/// Params of `pl_sessionExtend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExtend {
    /// New expiry timestamp.
    pub expiry: u64,
}

/// Event body of `pl_sessionEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Event name, e.g. `accountsChanged`.
    pub name: String,
    /// Event data.
    #[serde(default)]
    pub data: Value,
}

/// Params of `pl_sessionEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    /// Chain the event concerns.
    pub chain_id: String,
    /// The event.
    pub event: EventPayload,
}

/// Params of `pl_sessionDelete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDelete {
    /// Reason code.
    pub code: i64,
    /// Reason text.
    pub message: String,
}

impl SessionDelete {
    /// The reason used for a user-initiated disconnect.
    pub fn user_disconnected() -> Self {
        Self {
            code: codes::USER_DISCONNECTED,
            message: "User disconnected.".to_string(),
        }
    }
}
