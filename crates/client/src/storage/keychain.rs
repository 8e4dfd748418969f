//! Keychain integration for restricted-access storage of client secrets.
//!
//! This module provides cross-platform keychain access using the `keyring` crate:
//! - macOS: Keychain
//! - Windows: Credential Manager
//! - Linux: Secret Service (via D-Bus)
//!
//! [`MemoryKeychain`] keeps entries in process memory and backs the demo
//! binary and the tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// The default service name used for keychain entries.
pub const SERVICE_NAME: &str = "pairlink";

/// Length of generated wrapping keys in bytes.
pub const SECRET_KEY_LENGTH: usize = 32;

/// Errors that can occur during keychain operations.
#[derive(Debug, Error)]
pub enum KeychainError {
    /// The requested entry was not found in the keychain.
    #[error("Entry not found in keychain: {0}")]
    NotFound(String),

    /// Access to the keychain was denied.
    #[error("Keychain access denied: {0}")]
    AccessDenied(String),

    /// The keychain service is unavailable.
    #[error("Keychain service unavailable: {0}")]
    ServiceUnavailable(String),

    /// An error occurred while encoding/decoding a value.
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// A platform-specific keychain error occurred.
    #[error("Keychain error: {0}")]
    PlatformError(String),

    /// Failed to generate a new key.
    #[error("Key generation failed: {0}")]
    GenerationError(String),
}

/// Result type for keychain operations.
pub type KeychainResult<T> = Result<T, KeychainError>;

/// Trait for keychain backend implementations.
pub trait KeychainBackend: Send + Sync {
    /// Retrieve a secret from the keychain.
    fn get_secret(&self, service: &str, key: &str) -> KeychainResult<String>;

    /// Store a secret in the keychain, replacing any previous value.
    fn set_secret(&self, service: &str, key: &str, value: &str) -> KeychainResult<()>;

    /// Delete a secret from the keychain.
    fn delete_secret(&self, service: &str, key: &str) -> KeychainResult<()>;
}

impl<B: KeychainBackend + ?Sized> KeychainBackend for Arc<B> {
    fn get_secret(&self, service: &str, key: &str) -> KeychainResult<String> {
        (**self).get_secret(service, key)
    }

    fn set_secret(&self, service: &str, key: &str, value: &str) -> KeychainResult<()> {
        (**self).set_secret(service, key, value)
    }

    fn delete_secret(&self, service: &str, key: &str) -> KeychainResult<()> {
        (**self).delete_secret(service, key)
    }
}

/// Keychain backend using the operating system keychain.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemKeychain;

impl SystemKeychain {
    fn entry(service: &str, key: &str) -> KeychainResult<keyring::Entry> {
        keyring::Entry::new(service, key).map_err(|e| KeychainError::PlatformError(e.to_string()))
    }

    fn map_error(key: &str, err: keyring::Error) -> KeychainError {
        match err {
            keyring::Error::NoEntry => KeychainError::NotFound(key.to_string()),
            keyring::Error::Ambiguous(_) => {
                KeychainError::PlatformError("Ambiguous keychain entry".to_string())
            }
            keyring::Error::TooLong(_, _) => {
                KeychainError::EncodingError("Value too long".to_string())
            }
            keyring::Error::Invalid(_, _) => {
                KeychainError::EncodingError("Invalid entry format".to_string())
            }
            keyring::Error::NoStorageAccess(_) => {
                KeychainError::AccessDenied("No storage access".to_string())
            }
            keyring::Error::PlatformFailure(_) => {
                KeychainError::ServiceUnavailable("Platform failure".to_string())
            }
            other => KeychainError::PlatformError(other.to_string()),
        }
    }
}

impl KeychainBackend for SystemKeychain {
    fn get_secret(&self, service: &str, key: &str) -> KeychainResult<String> {
        Self::entry(service, key)?
            .get_password()
            .map_err(|e| Self::map_error(key, e))
    }

    fn set_secret(&self, service: &str, key: &str, value: &str) -> KeychainResult<()> {
        Self::entry(service, key)?
            .set_password(value)
            .map_err(|e| Self::map_error(key, e))
    }

    fn delete_secret(&self, service: &str, key: &str) -> KeychainResult<()> {
        Self::entry(service, key)?
            .delete_credential()
            .map_err(|e| Self::map_error(key, e))
    }
}

/// In-process keychain backend.
#[derive(Debug, Default)]
pub struct MemoryKeychain {
    storage: Mutex<HashMap<String, String>>,
}

impl MemoryKeychain {
    /// Create a new, empty memory keychain.
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(service: &str, key: &str) -> String {
        format!("{}:{}", service, key)
    }

    fn storage(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.storage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored entries across all services.
    pub fn len(&self) -> usize {
        self.storage().len()
    }

    /// Whether the keychain holds no entries.
    pub fn is_empty(&self) -> bool {
        self.storage().is_empty()
    }
}

impl KeychainBackend for MemoryKeychain {
    fn get_secret(&self, service: &str, key: &str) -> KeychainResult<String> {
        self.storage()
            .get(&Self::make_key(service, key))
            .cloned()
            .ok_or_else(|| KeychainError::NotFound(key.to_string()))
    }

    fn set_secret(&self, service: &str, key: &str, value: &str) -> KeychainResult<()> {
        self.storage()
            .insert(Self::make_key(service, key), value.to_string());
        Ok(())
    }

    fn delete_secret(&self, service: &str, key: &str) -> KeychainResult<()> {
        match self.storage().remove(&Self::make_key(service, key)) {
            Some(_) => Ok(()),
            None => Err(KeychainError::NotFound(key.to_string())),
        }
    }
}

/// Keychain manager for named secret entries under one service.
pub struct KeychainManager<B: KeychainBackend> {
    backend: B,
    service: String,
}

impl<B: KeychainBackend> KeychainManager<B> {
    /// Create a new KeychainManager with the given backend.
    pub fn new(backend: B) -> Self {
        Self::with_service(backend, SERVICE_NAME)
    }

    /// Create a new KeychainManager with a custom service name.
    pub fn with_service(backend: B, service: impl Into<String>) -> Self {
        Self {
            backend,
            service: service.into(),
        }
    }

    /// Returns the service name entries are stored under.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Get the value stored under `name`.
    pub fn get(&self, name: &str) -> KeychainResult<String> {
        self.backend.get_secret(&self.service, name)
    }

    /// Store `value` under `name`.
    pub fn set(&self, name: &str, value: &str) -> KeychainResult<()> {
        self.backend.set_secret(&self.service, name, value)
    }

    /// Delete the entry `name`.
    pub fn delete(&self, name: &str) -> KeychainResult<()> {
        self.backend.delete_secret(&self.service, name)
    }

    /// Delete the entry `name`, treating a missing entry as success.
    pub fn remove(&self, name: &str) -> KeychainResult<()> {
        match self.delete(name) {
            Ok(()) | Err(KeychainError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Get the value under `name`, or `None` when absent.
    pub fn find(&self, name: &str) -> KeychainResult<Option<String>> {
        match self.get(name) {
            Ok(value) => Ok(Some(value)),
            Err(KeychainError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Get the secret key under `name`, or generate and store a new one.
    ///
    /// Returns the secret key as a base64-encoded string.
    pub fn get_or_create_secret_key(&self, name: &str) -> KeychainResult<String> {
        match self.get(name) {
            Ok(key) => Ok(key),
            Err(KeychainError::NotFound(_)) => {
                let new_key = generate_secret_key()?;
                self.set(name, &new_key)?;
                Ok(new_key)
            }
            Err(e) => Err(e),
        }
    }

    /// Check if an entry exists.
    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }
}

impl KeychainManager<SystemKeychain> {
    /// Create a new KeychainManager with the system keychain backend.
    pub fn system() -> Self {
        Self::new(SystemKeychain)
    }
}

/// Generate a new random secret key.
///
/// Returns a 32-byte random key encoded as base64.
pub fn generate_secret_key() -> KeychainResult<String> {
    use rand::RngCore;

    let mut key = [0u8; SECRET_KEY_LENGTH];
    rand::thread_rng()
        .try_fill_bytes(&mut key)
        .map_err(|e| KeychainError::GenerationError(e.to_string()))?;

    Ok(encode_secret_key(&key))
}

/// Decode a base64-encoded secret to raw bytes.
pub fn decode_secret_key(encoded: &str) -> KeychainResult<Vec<u8>> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
        .map_err(|e| KeychainError::EncodingError(e.to_string()))
}

/// Encode raw bytes as a base64 secret.
pub fn encode_secret_key(bytes: &[u8]) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_manager() -> KeychainManager<MemoryKeychain> {
        KeychainManager::new(MemoryKeychain::new())
    }

    #[test]
    fn test_set_and_get() {
        let manager = create_test_manager();
        manager.set("identity", "record").unwrap();
        assert_eq!(manager.get("identity").unwrap(), "record");
    }

    #[test]
    fn test_get_missing_entry() {
        let manager = create_test_manager();
        assert!(matches!(
            manager.get("identity"),
            Err(KeychainError::NotFound(_))
        ));
        assert_eq!(manager.find("identity").unwrap(), None);
    }

    #[test]
    fn test_delete_and_remove() {
        let manager = create_test_manager();
        manager.set("identity", "record").unwrap();
        manager.delete("identity").unwrap();

        assert!(matches!(
            manager.delete("identity"),
            Err(KeychainError::NotFound(_))
        ));
        // remove tolerates a missing entry
        manager.remove("identity").unwrap();
    }

    #[test]
    fn test_get_or_create_secret_key_creates_once() {
        let manager = create_test_manager();

        let key = manager.get_or_create_secret_key("wrap").unwrap();
        let decoded = decode_secret_key(&key).unwrap();
        assert_eq!(decoded.len(), SECRET_KEY_LENGTH);

        let again = manager.get_or_create_secret_key("wrap").unwrap();
        assert_eq!(key, again);
    }

    #[test]
    fn test_entries_are_scoped_by_service() {
        let backend = Arc::new(MemoryKeychain::new());
        let a = KeychainManager::with_service(backend.clone(), "app-a");
        let b = KeychainManager::with_service(backend.clone(), "app-b");

        a.set("identity", "one").unwrap();
        assert!(!b.has("identity"));
        assert!(a.has("identity"));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_generate_secret_key_unique() {
        let key1 = generate_secret_key().unwrap();
        let key2 = generate_secret_key().unwrap();
        assert_ne!(key1, key2);
    }

    #[test]
    fn test_decode_invalid_base64() {
        assert!(matches!(
            decode_secret_key("not-valid-base64!!!"),
            Err(KeychainError::EncodingError(_))
        ));
    }

    #[test]
    fn test_overwrite_existing_entry() {
        let manager = create_test_manager();
        manager.set("identity", "first").unwrap();
        manager.set("identity", "second").unwrap();
        assert_eq!(manager.get("identity").unwrap(), "second");
    }
}
