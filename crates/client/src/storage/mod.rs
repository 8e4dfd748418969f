//! Restricted-access storage for client secrets.

pub mod keychain;

pub use keychain::{
    KeychainBackend, KeychainError, KeychainManager, KeychainResult, MemoryKeychain,
    SystemKeychain, SERVICE_NAME,
};
