//! Typed wallet actions.
//!
//! Thin helpers over [`ConnectionManager::dispatch`] that shape params the
//! way wallets expect them. Each resolves the signing address from the
//! active session.

use serde_json::{json, Value};

use crate::connection::ConnectionManager;
use crate::error::RpcError;
use crate::relay::RelayTransport;
use crate::storage::KeychainBackend;

/// `personal_sign`
pub const PERSONAL_SIGN: &str = "personal_sign";
/// `eth_signTypedData`
pub const ETH_SIGN_TYPED_DATA: &str = "eth_signTypedData";
/// `eth_sendTransaction`
pub const ETH_SEND_TRANSACTION: &str = "eth_sendTransaction";

/// Hex-encodes a UTF-8 message with a `0x` prefix.
pub fn utf8_to_hex(message: &str) -> String {
    format!("0x{}", hex::encode(message.as_bytes()))
}

impl<T: RelayTransport, B: KeychainBackend + 'static> ConnectionManager<T, B> {
    async fn address_for(&self, method: &str, chain_id: &str) -> Result<String, RpcError> {
        self.session()
            .await
            .and_then(|session| session.address_for(chain_id))
            .ok_or_else(|| RpcError::MethodNotAllowed {
                method: method.to_string(),
                chain: chain_id.to_string(),
            })
    }

    /// Asks the wallet to sign `message` with `personal_sign`.
    ///
    /// Returns the signature string the wallet produced.
    pub async fn personal_sign(&self, chain_id: &str, message: &str) -> Result<String, RpcError> {
        let address = self.address_for(PERSONAL_SIGN, chain_id).await?;
        let params = json!([utf8_to_hex(message), address]);
        let result = self.dispatch(PERSONAL_SIGN, params, chain_id).await?;
        as_string(result)
    }

    /// Asks the wallet to sign EIP-712 typed data.
    pub async fn eth_sign_typed_data(
        &self,
        chain_id: &str,
        typed_data: Value,
    ) -> Result<String, RpcError> {
        let address = self.address_for(ETH_SIGN_TYPED_DATA, chain_id).await?;
        let params = json!([address, typed_data]);
        let result = self.dispatch(ETH_SIGN_TYPED_DATA, params, chain_id).await?;
        as_string(result)
    }

    /// Asks the wallet to send a transaction. `from` is filled in from the
    /// session when missing.
    ///
    /// Returns the transaction hash.
    pub async fn eth_send_transaction(
        &self,
        chain_id: &str,
        mut transaction: Value,
    ) -> Result<String, RpcError> {
        let address = self.address_for(ETH_SEND_TRANSACTION, chain_id).await?;
        if let Value::Object(fields) = &mut transaction {
            fields
                .entry("from")
                .or_insert_with(|| Value::String(address));
        }
        let result = self
            .dispatch(ETH_SEND_TRANSACTION, json!([transaction]), chain_id)
            .await?;
        as_string(result)
    }
}

fn as_string(value: Value) -> Result<String, RpcError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(RpcError::InvalidResponse(format!(
            "expected a string result, got {other}"
        ))),
    }
}
