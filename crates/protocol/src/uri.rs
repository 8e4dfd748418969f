//! Pairing URI handed to the wallet out of band (QR code or deep link).
//!
//! Format: `pl:{topic}@{version}?relay-protocol=irn&symKey={hex}&expiryTimestamp={unix}`

use url::Url;

use crate::cipher::{SymKey, Topic};
use crate::error::{ProtocolError, Result};

/// URI scheme.
pub const PAIRING_URI_SCHEME: &str = "pl";

/// Pairing URI version.
pub const PAIRING_URI_VERSION: u8 = 1;

/// Relay protocol advertised in the URI.
pub const DEFAULT_RELAY_PROTOCOL: &str = "irn";

/// Everything a wallet needs to join a pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUri {
    /// Topic derived from the key.
    pub topic: Topic,
    /// Shared key.
    pub sym_key: SymKey,
    /// Relay protocol name.
    pub relay_protocol: String,
    /// Unix timestamp after which the URI is void.
    pub expiry: u64,
}

impl PairingUri {
    /// Builds a URI for a freshly generated key.
    pub fn new(sym_key: SymKey, expiry: u64) -> Self {
        Self {
            topic: sym_key.topic(),
            sym_key,
            relay_protocol: DEFAULT_RELAY_PROTOCOL.to_string(),
            expiry,
        }
    }

    /// Parses a URI string.
    ///
    /// The topic in the path must match the key in the query.
    pub fn parse(value: &str) -> Result<Self> {
        let url = Url::parse(value).map_err(|e| ProtocolError::InvalidUri(e.to_string()))?;
        if url.scheme() != PAIRING_URI_SCHEME {
            return Err(ProtocolError::InvalidUri(format!(
                "unexpected scheme {}",
                url.scheme()
            )));
        }

        let (topic, version) = url
            .path()
            .split_once('@')
            .ok_or_else(|| ProtocolError::InvalidUri("missing version".into()))?;
        let version: u8 = version
            .parse()
            .map_err(|_| ProtocolError::InvalidUri(format!("bad version {version}")))?;
        if version != PAIRING_URI_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let mut sym_key = None;
        let mut relay_protocol = DEFAULT_RELAY_PROTOCOL.to_string();
        let mut expiry = None;
        for (key, val) in url.query_pairs() {
            match key.as_ref() {
                "symKey" => sym_key = Some(SymKey::from_hex(&val)?),
                "relay-protocol" => relay_protocol = val.into_owned(),
                "expiryTimestamp" => {
                    expiry = Some(val.parse::<u64>().map_err(|_| {
                        ProtocolError::InvalidUri(format!("bad expiryTimestamp {val}"))
                    })?)
                }
                _ => {}
            }
        }

        let sym_key = sym_key.ok_or_else(|| ProtocolError::InvalidUri("missing symKey".into()))?;
        let expiry =
            expiry.ok_or_else(|| ProtocolError::InvalidUri("missing expiryTimestamp".into()))?;

        if sym_key.topic().as_str() != topic {
            return Err(ProtocolError::InvalidUri(
                "topic does not match symKey".into(),
            ));
        }

        Ok(Self {
            topic: Topic::new(topic),
            sym_key,
            relay_protocol,
            expiry,
        })
    }
}

impl std::fmt::Display for PairingUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}@{}?relay-protocol={}&symKey={}&expiryTimestamp={}",
            PAIRING_URI_SCHEME,
            self.topic,
            PAIRING_URI_VERSION,
            self.relay_protocol,
            self.sym_key.to_hex(),
            self.expiry
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let uri = PairingUri::new(SymKey::generate(), 1_700_000_300);
        let text = uri.to_string();

        assert!(text.starts_with("pl:"));
        assert!(text.contains("@1?relay-protocol=irn&symKey="));

        let parsed = PairingUri::parse(&text).unwrap();
        assert_eq!(parsed, uri);
    }

    #[test]
    fn test_parse_rejects_wrong_scheme() {
        let uri = PairingUri::new(SymKey::generate(), 1).to_string();
        let wrong = uri.replacen("pl:", "wc:", 1);
        assert!(PairingUri::parse(&wrong).is_err());
    }

    #[test]
    fn test_parse_rejects_topic_key_mismatch() {
        let uri = PairingUri::new(SymKey::generate(), 1);
        let other = SymKey::generate();
        let forged = format!(
            "pl:{}@1?relay-protocol=irn&symKey={}&expiryTimestamp=1",
            uri.topic,
            other.to_hex()
        );
        assert!(matches!(
            PairingUri::parse(&forged),
            Err(ProtocolError::InvalidUri(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_version() {
        let key = SymKey::generate();
        let text = format!(
            "pl:{}@2?symKey={}&expiryTimestamp=1",
            key.topic(),
            key.to_hex()
        );
        assert!(matches!(
            PairingUri::parse(&text),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_parse_requires_expiry() {
        let key = SymKey::generate();
        let text = format!("pl:{}@1?symKey={}", key.topic(), key.to_hex());
        assert!(PairingUri::parse(&text).is_err());
    }
}
