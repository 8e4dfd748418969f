//! Configuration management for the Pairlink client.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/pairlink/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::namespaces::ChainId;
use protocol::{Metadata, ProposalNamespace, ProposalNamespaces, Redirect};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::ClientOptions;
use crate::pairing::ChannelConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be greater than 0")]
    InvalidTimeout { name: &'static str },

    #[error("relay url must start with ws:// or wss://, got {0}")]
    InvalidRelayUrl(String),

    #[error("at least one namespace must be proposed")]
    EmptyNamespaces,

    #[error("invalid chain id {0}")]
    InvalidChainId(String),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Pairlink client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Relay connection settings.
    pub relay: RelayConfig,

    /// Metadata shown to the user in the wallet.
    pub metadata: MetadataConfig,

    /// Deadlines and lifetimes.
    pub timeouts: TimeoutConfig,

    /// Namespaces the wallet must grant.
    pub namespaces: ProposalNamespaces,

    /// Namespaces the wallet may grant.
    pub optional_namespaces: ProposalNamespaces,

    /// Where the identity is kept.
    pub storage: StorageConfig,

    /// Logging settings.
    pub log: LogConfig,
}

/// Relay connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket URL of the relay.
    pub url: String,

    /// Project id presented to the relay.
    pub project_id: String,

    /// Lifetime of each relay credential in seconds.
    pub auth_ttl_secs: u64,
}

/// dApp metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetadataConfig {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,

    /// Deep link back into the app.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_native: Option<String>,

    /// Universal link back into the app.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_universal: Option<String>,
}

/// Deadlines and lifetimes, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long to wait for the wallet to approve a proposal.
    pub connect_secs: u64,

    /// Deadline of each dispatched request.
    pub request_secs: u64,

    /// How long to wait for the wallet after the relay comes back.
    pub resume_secs: u64,

    /// Lifetime of an unanswered pairing URI.
    pub pairing_ttl_secs: u64,

    /// Interval between session expiry checks.
    pub expiry_check_secs: u64,
}

/// Which keychain backend holds the identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeychainKind {
    /// The OS keychain.
    #[default]
    System,
    /// Process memory; the identity is lost on exit.
    Memory,
}

/// Identity storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Keychain service name entries are stored under.
    pub keychain_service: String,

    /// Backend to use.
    pub backend: KeychainKind,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "wss://relay.pairlink.dev".to_string(),
            project_id: String::new(),
            auth_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            name: "React Native V2 dApp".to_string(),
            description: "RN dApp by Pairlink".to_string(),
            url: "https://pairlink.dev/".to_string(),
            icons: vec!["https://avatars.githubusercontent.com/u/37784886".to_string()],
            redirect_native: Some("rn-web3modal://".to_string()),
            redirect_universal: None,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 30,
            request_secs: 300,
            resume_secs: 10,
            pairing_ttl_secs: 300,
            expiry_check_secs: 5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keychain_service: crate::storage::SERVICE_NAME.to_string(),
            backend: KeychainKind::System,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// The `eip155` proposal a dApp makes when nothing else is configured.
pub fn default_namespaces() -> ProposalNamespaces {
    let methods = [
        "eth_sendTransaction",
        "eth_signTransaction",
        "eth_sign",
        "personal_sign",
        "eth_signTypedData",
    ];
    let events = ["chainChanged", "accountsChanged"];

    let mut namespaces = ProposalNamespaces::new();
    namespaces.insert(
        "eip155".to_string(),
        ProposalNamespace {
            chains: vec!["eip155:1".to_string()],
            methods: methods.iter().map(|m| m.to_string()).collect(),
            events: events.iter().map(|e| e.to_string()).collect(),
        },
    );
    namespaces
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pairlink")
        .join("config.toml")
}

impl Config {
    /// Default configuration with the default `eip155` proposal.
    ///
    /// `Config::default()` leaves the proposal empty so that a file naming
    /// its own namespaces does not inherit these.
    pub fn with_default_namespaces() -> Self {
        Self {
            namespaces: default_namespaces(),
            ..Default::default()
        }
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PAIRLINK_RELAY_URL: Override relay URL
    /// - PAIRLINK_PROJECT_ID: Override project id
    /// - PAIRLINK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("PAIRLINK_RELAY_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding relay url from environment: {}", url);
                self.relay.url = url;
            }
        }

        if let Ok(project_id) = std::env::var("PAIRLINK_PROJECT_ID") {
            if !project_id.is_empty() {
                tracing::info!("Overriding project id from environment");
                self.relay.project_id = project_id;
            }
        }

        if let Ok(level) = std::env::var("PAIRLINK_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.log.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("connect_secs", self.timeouts.connect_secs),
            ("request_secs", self.timeouts.request_secs),
            ("resume_secs", self.timeouts.resume_secs),
            ("pairing_ttl_secs", self.timeouts.pairing_ttl_secs),
            ("expiry_check_secs", self.timeouts.expiry_check_secs),
            ("auth_ttl_secs", self.relay.auth_ttl_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout { name });
            }
        }

        let relay_url = url::Url::parse(&self.relay.url)
            .map_err(|_| ConfigError::InvalidRelayUrl(self.relay.url.clone()))?;
        if !matches!(relay_url.scheme(), "ws" | "wss") || relay_url.host_str().is_none() {
            return Err(ConfigError::InvalidRelayUrl(self.relay.url.clone()));
        }

        if self.namespaces.is_empty() {
            return Err(ConfigError::EmptyNamespaces);
        }
        for namespace in self.namespaces.values().chain(self.optional_namespaces.values()) {
            for chain in &namespace.chains {
                if ChainId::parse(chain).is_err() {
                    return Err(ConfigError::InvalidChainId(chain.clone()));
                }
            }
        }

        let level = self.log.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }

        Ok(())
    }

    /// The proposal metadata.
    pub fn metadata(&self) -> Metadata {
        let m = &self.metadata;
        let redirect = (m.redirect_native.is_some() || m.redirect_universal.is_some()).then(|| {
            Redirect {
                native: m.redirect_native.clone(),
                universal: m.redirect_universal.clone(),
            }
        });
        Metadata {
            name: m.name.clone(),
            description: m.description.clone(),
            url: m.url.clone(),
            icons: m.icons.clone(),
            redirect,
        }
    }

    /// Options for a [`ConnectionManager`](crate::ConnectionManager).
    pub fn client_options(&self) -> ClientOptions {
        let t = &self.timeouts;
        let channel = ChannelConfig {
            connect_timeout: Duration::from_secs(t.connect_secs),
            resume_timeout: Duration::from_secs(t.resume_secs),
            pairing_ttl: Duration::from_secs(t.pairing_ttl_secs),
            auth_ttl: Duration::from_secs(self.relay.auth_ttl_secs),
        };
        ClientOptions::new(self.metadata(), self.namespaces.clone())
            .optional_namespaces(self.optional_namespaces.clone())
            .channel(channel)
            .request_timeout(Duration::from_secs(t.request_secs))
            .expiry_check_interval(Duration::from_secs(t.expiry_check_secs))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::with_default_namespaces());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    ///
    /// A file that proposes no namespaces gets the default `eip155` proposal.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))?;
        if config.namespaces.is_empty() {
            config.namespaces = default_namespaces();
        }
        Ok(config)
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
