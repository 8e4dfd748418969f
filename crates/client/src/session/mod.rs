//! Session state.
//!
//! A [`Session`] is what the wallet granted on top of an active pairing:
//! namespaces with their accounts and permitted methods, and an expiry.
//! [`SessionRegistry`] is the only place it is mutated.

use protocol::messages::{Participant, SessionDelete};
use protocol::namespaces::namespace_of;
use protocol::{AccountId, Namespaces, ProposalNamespaces, Topic};
use serde::{Deserialize, Serialize};

pub mod registry;

pub use registry::{SessionRegistry, MAX_SESSION_TTL};

/// The active wallet session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Topic the session lives on (the pairing topic).
    pub topic: Topic,
    /// What the wallet granted.
    pub namespaces: Namespaces,
    /// Unix timestamp the session expires.
    pub expiry: u64,
    /// The wallet side.
    pub peer: Participant,
    /// Everything that was proposed; updates are checked against it.
    #[serde(skip)]
    pub(crate) proposed: ProposalNamespaces,
}

impl Session {
    /// Whether `method` may be called on `chain_id`.
    pub fn permits(&self, chain_id: &str, method: &str) -> bool {
        self.namespaces
            .iter()
            .any(|(key, ns)| ns.permits(key, chain_id, method))
    }

    /// All granted accounts, in namespace order then wallet order.
    pub fn accounts(&self) -> Vec<AccountId> {
        self.namespaces
            .values()
            .flat_map(|ns| ns.account_ids())
            .collect()
    }

    /// The first account the wallet listed for `chain_id`.
    pub fn address_for(&self, chain_id: &str) -> Option<String> {
        self.namespaces
            .iter()
            .filter(|(key, _)| key.as_str() == chain_id || key.as_str() == namespace_of(chain_id))
            .flat_map(|(_, ns)| ns.account_ids())
            .find(|account| account.chain().to_string() == chain_id)
            .map(|account| account.address().to_string())
    }

    /// The chain of the first granted account.
    pub fn default_chain(&self) -> Option<String> {
        self.accounts()
            .first()
            .map(|account| account.chain().to_string())
    }

    /// Whether the session is past its expiry at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry <= now
    }
}

/// A change to the session driven by the wallet or the clock.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The wallet replaced the namespaces.
    Update {
        /// Topic the update claims to be for.
        topic: Topic,
        /// Replacement namespaces.
        namespaces: Namespaces,
    },
    /// The wallet pushed out the expiry.
    Extend {
        /// Topic the extension claims to be for.
        topic: Topic,
        /// New expiry.
        expiry: u64,
    },
    /// The wallet ended the session.
    Terminated {
        /// Topic of the ended session.
        topic: Topic,
        /// Reason given.
        reason: SessionDelete,
    },
    /// The session ran past its expiry.
    Expired {
        /// Topic of the expired session.
        topic: Topic,
    },
}

impl SessionEvent {
    /// The topic the event claims to concern.
    pub fn topic(&self) -> &Topic {
        match self {
            SessionEvent::Update { topic, .. }
            | SessionEvent::Extend { topic, .. }
            | SessionEvent::Terminated { topic, .. }
            | SessionEvent::Expired { topic } => topic,
        }
    }
}
