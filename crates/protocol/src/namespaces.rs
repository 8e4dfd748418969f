//! Chain-agnostic namespaces (CAIP-2 chains, CAIP-10 accounts).
//!
//! A namespace groups the chains, accounts, RPC methods and events a session
//! covers for one blockchain family, keyed by the family prefix (`eip155`)
//! or by a single chain id (`eip155:1`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Namespaces as approved by the wallet, keyed by namespace key.
pub type Namespaces = BTreeMap<String, Namespace>;

/// Namespaces as proposed by the client, keyed by namespace key.
pub type ProposalNamespaces = BTreeMap<String, ProposalNamespace>;

/// A CAIP-2 chain id such as `eip155:1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId {
    namespace: String,
    reference: String,
}

impl ChainId {
    /// Parses `namespace:reference`.
    pub fn parse(value: &str) -> Result<Self> {
        let (namespace, reference) = value
            .split_once(':')
            .ok_or_else(|| ProtocolError::InvalidIdentifier(format!("chain id {value}")))?;

        let namespace_ok = (3..=8).contains(&namespace.len())
            && namespace
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        let reference_ok = (1..=32).contains(&reference.len())
            && reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if !namespace_ok || !reference_ok {
            return Err(ProtocolError::InvalidIdentifier(format!("chain id {value}")));
        }

        Ok(Self {
            namespace: namespace.to_string(),
            reference: reference.to_string(),
        })
    }

    /// The chain family, e.g. `eip155`.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The chain reference within the family, e.g. `1`.
    pub fn reference(&self) -> &str {
        &self.reference
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

/// A CAIP-10 account id such as `eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountId {
    chain: ChainId,
    address: String,
}

impl AccountId {
    /// Parses `namespace:reference:address`.
    pub fn parse(value: &str) -> Result<Self> {
        let (chain, address) = value
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::InvalidIdentifier(format!("account id {value}")))?;

        let chain = ChainId::parse(chain)?;
        if address.is_empty()
            || address.len() > 128
            || !address
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '%'))
        {
            return Err(ProtocolError::InvalidIdentifier(format!("account id {value}")));
        }

        Ok(Self {
            chain,
            address: address.to_string(),
        })
    }

    /// The chain the account lives on.
    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    /// The bare address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.address)
    }
}

/// Returns the namespace key a chain id falls under (`eip155:1` -> `eip155`).
pub fn namespace_of(chain_id: &str) -> &str {
    chain_id.split(':').next().unwrap_or(chain_id)
}

/// What the client asks the wallet to grant for one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposalNamespace {
    /// Chains requested. May be empty when the key itself is a chain id.
    pub chains: Vec<String>,
    /// RPC methods requested.
    pub methods: BTreeSet<String>,
    /// Events requested.
    pub events: BTreeSet<String>,
}

impl ProposalNamespace {
    /// Chains covered by this proposal entry under `key`.
    ///
    /// A chain-specific key (`eip155:1`) always covers its own chain.
    pub fn chain_set(&self, key: &str) -> BTreeSet<String> {
        let mut chains: BTreeSet<String> = self.chains.iter().cloned().collect();
        if key.contains(':') {
            chains.insert(key.to_string());
        }
        chains
    }
}

/// What the wallet granted for one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Namespace {
    /// Chains granted.
    pub chains: Vec<String>,
    /// Accounts granted, in the order the wallet listed them.
    pub accounts: Vec<String>,
    /// RPC methods the client may call.
    pub methods: BTreeSet<String>,
    /// Events the wallet may emit.
    pub events: BTreeSet<String>,
}

impl Namespace {
    /// Every chain this namespace covers, from `chains`, account prefixes
    /// and a chain-specific key.
    pub fn chain_set(&self, key: &str) -> BTreeSet<String> {
        let mut chains: BTreeSet<String> = self.chains.iter().cloned().collect();
        for account in &self.accounts {
            if let Ok(account) = AccountId::parse(account) {
                chains.insert(account.chain().to_string());
            }
        }
        if key.contains(':') {
            chains.insert(key.to_string());
        }
        chains
    }

    /// Whether `method` may be called on `chain_id` under key `key`.
    pub fn permits(&self, key: &str, chain_id: &str, method: &str) -> bool {
        self.methods.contains(method) && self.chain_set(key).contains(chain_id)
    }

    /// Parsed accounts, skipping malformed entries.
    pub fn account_ids(&self) -> Vec<AccountId> {
        self.accounts
            .iter()
            .filter_map(|a| AccountId::parse(a).ok())
            .collect()
    }

    /// Checks every account and chain entry is well formed.
    pub fn validate(&self) -> Result<()> {
        for chain in &self.chains {
            ChainId::parse(chain)?;
        }
        for account in &self.accounts {
            AccountId::parse(account)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eip155() -> Namespace {
        Namespace {
            chains: vec!["eip155:1".into()],
            accounts: vec![
                "eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb".into(),
                "eip155:137:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb".into(),
            ],
            methods: ["personal_sign".to_string()].into_iter().collect(),
            events: BTreeSet::new(),
        }
    }

    #[test]
    fn test_chain_id_parse() {
        let chain = ChainId::parse("eip155:1").unwrap();
        assert_eq!(chain.namespace(), "eip155");
        assert_eq!(chain.reference(), "1");
        assert_eq!(chain.to_string(), "eip155:1");
    }

    #[test]
    fn test_chain_id_rejects_malformed() {
        assert!(ChainId::parse("eip155").is_err());
        assert!(ChainId::parse("EIP155:1").is_err());
        assert!(ChainId::parse("eip155:").is_err());
        assert!(ChainId::parse("e:1").is_err());
    }

    #[test]
    fn test_account_id_parse() {
        let account =
            AccountId::parse("eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb").unwrap();
        assert_eq!(account.chain().to_string(), "eip155:1");
        assert_eq!(
            account.address(),
            "0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb"
        );
    }

    #[test]
    fn test_account_id_rejects_malformed() {
        assert!(AccountId::parse("0xabc").is_err());
        assert!(AccountId::parse("eip155:1:").is_err());
        assert!(AccountId::parse("eip155:1:0x abc").is_err());
    }

    #[test]
    fn test_namespace_of() {
        assert_eq!(namespace_of("eip155:1"), "eip155");
        assert_eq!(namespace_of("solana"), "solana");
    }

    #[test]
    fn test_chain_set_includes_account_chains() {
        let chains = eip155().chain_set("eip155");
        assert!(chains.contains("eip155:1"));
        assert!(chains.contains("eip155:137"));
        assert_eq!(chains.len(), 2);
    }

    #[test]
    fn test_permits() {
        let ns = eip155();
        assert!(ns.permits("eip155", "eip155:1", "personal_sign"));
        assert!(!ns.permits("eip155", "eip155:1", "eth_sendTransaction"));
        assert!(!ns.permits("eip155", "eip155:5", "personal_sign"));
    }

    #[test]
    fn test_chain_specific_key_covers_itself() {
        let ns = Namespace {
            methods: ["personal_sign".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert!(ns.permits("eip155:10", "eip155:10", "personal_sign"));

        let proposal = ProposalNamespace::default();
        assert!(proposal.chain_set("eip155:10").contains("eip155:10"));
    }

    #[test]
    fn test_validate_rejects_bad_account() {
        let mut ns = eip155();
        ns.accounts.push("not-an-account".into());
        assert!(ns.validate().is_err());
    }

    #[test]
    fn test_namespace_serde_defaults() {
        let ns: Namespace = serde_json::from_str(r#"{"methods":["personal_sign"]}"#).unwrap();
        assert!(ns.accounts.is_empty());
        assert!(ns.methods.contains("personal_sign"));
    }
}
