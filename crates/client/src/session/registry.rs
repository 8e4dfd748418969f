//! Session registry.
//!
//! Holds zero or one [`Session`]. Every change goes through here and is
//! validated first: approvals and updates must stay within what was
//! proposed, and peer-driven events must name the active session's topic.

use std::collections::BTreeSet;

use protocol::messages::SessionApproval;
use protocol::{Namespaces, ProposalNamespace, ProposalNamespaces, Topic};
use tokio::sync::RwLock;

use super::{Session, SessionEvent};
use crate::current_timestamp;
use crate::error::SessionError;
use crate::pairing::Pairing;

/// Longest a session may be extended to, measured from now.
pub const MAX_SESSION_TTL: u64 = 7 * 24 * 60 * 60;

/// Owner of the active session.
#[derive(Default)]
pub struct SessionRegistry {
    active: RwLock<Option<Session>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The active session, if any.
    pub async fn active_session(&self) -> Option<Session> {
        self.active.read().await.clone()
    }

    /// Whether a session is active.
    pub async fn is_active(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Builds the session from the wallet's approval.
    ///
    /// Fails with [`SessionError::NamespaceMismatch`] when the approval
    /// grants anything that was not proposed or leaves out a required
    /// namespace. Nothing is stored on failure.
    pub async fn apply_proposal_result(
        &self,
        pairing: &Pairing,
        required: &ProposalNamespaces,
        optional: &ProposalNamespaces,
        approval: &SessionApproval,
    ) -> Result<Session, SessionError> {
        let now = current_timestamp();
        if !pairing.active {
            return Err(SessionError::NoActiveSession);
        }
        if approval.expiry <= now || pairing.is_expired(now) {
            return Err(SessionError::Expired);
        }

        let proposed = merge_proposals(required, optional);
        validate_namespaces(&proposed, &approval.namespaces)?;
        for key in required.keys() {
            if !approval.namespaces.contains_key(key) {
                return Err(SessionError::NamespaceMismatch(format!(
                    "required namespace {key} was not approved"
                )));
            }
        }

        let session = Session {
            topic: pairing.topic.clone(),
            namespaces: approval.namespaces.clone(),
            expiry: approval.expiry.min(now + MAX_SESSION_TTL),
            peer: approval.responder.clone(),
            proposed,
        };

        *self.active.write().await = Some(session.clone());
        tracing::info!(
            topic = %session.topic.short(),
            namespaces = session.namespaces.len(),
            expiry = session.expiry,
            "Session established"
        );
        Ok(session)
    }

    /// Replaces the namespaces of the session on `topic`.
    ///
    /// An update for any other topic is an anomaly: it is logged and
    /// rejected without touching the active session.
    pub async fn update_namespaces(
        &self,
        topic: &Topic,
        namespaces: Namespaces,
    ) -> Result<Session, SessionError> {
        let mut guard = self.active.write().await;
        let session = matching(&mut guard, topic, "update")?;

        if let Err(e) = validate_namespaces(&session.proposed, &namespaces) {
            tracing::warn!(topic = %topic.short(), error = %e, "Rejected session update");
            return Err(e);
        }

        session.namespaces = namespaces;
        tracing::info!(topic = %topic.short(), "Session namespaces updated");
        Ok(session.clone())
    }

    /// Pushes out the expiry of the session on `topic`.
    ///
    /// The expiry never moves backwards and is capped at [`MAX_SESSION_TTL`].
    pub async fn extend(&self, topic: &Topic, expiry: u64) -> Result<Session, SessionError> {
        let now = current_timestamp();
        let mut guard = self.active.write().await;
        let session = matching(&mut guard, topic, "extend")?;

        if expiry <= now {
            return Err(SessionError::Expired);
        }
        let capped = expiry.min(now + MAX_SESSION_TTL);
        if capped > session.expiry {
            session.expiry = capped;
            tracing::debug!(topic = %topic.short(), expiry = capped, "Session extended");
        }
        Ok(session.clone())
    }

    /// Applies a session event.
    ///
    /// Returns the session after the change, or `None` when the event ended it.
    pub async fn apply(&self, event: SessionEvent) -> Result<Option<Session>, SessionError> {
        match event {
            SessionEvent::Update { topic, namespaces } => {
                self.update_namespaces(&topic, namespaces).await.map(Some)
            }
            SessionEvent::Extend { topic, expiry } => self.extend(&topic, expiry).await.map(Some),
            SessionEvent::Terminated { topic, .. } | SessionEvent::Expired { topic } => {
                let mut guard = self.active.write().await;
                matching(&mut guard, &topic, "end")?;
                guard.take();
                Ok(None)
            }
        }
    }

    /// Topic of the active session if it has expired at `now`.
    pub async fn expired(&self, now: u64) -> Option<Topic> {
        self.active
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_expired(now))
            .map(|s| s.topic.clone())
    }

    /// Drops the active session.
    pub async fn clear(&self) -> Option<Session> {
        let removed = self.active.write().await.take();
        if let Some(session) = &removed {
            tracing::debug!(topic = %session.topic.short(), "Session cleared");
        }
        removed
    }
}

fn matching<'a>(
    guard: &'a mut Option<Session>,
    topic: &Topic,
    action: &str,
) -> Result<&'a mut Session, SessionError> {
    match guard.as_mut() {
        Some(session) if &session.topic == topic => Ok(session),
        Some(session) => {
            tracing::warn!(
                topic = %topic.short(),
                active = %session.topic.short(),
                action,
                "Ignoring session event for a foreign topic"
            );
            Err(SessionError::UnknownTopic(topic.to_string()))
        }
        None => {
            tracing::warn!(topic = %topic.short(), action, "Session event with no active session");
            Err(SessionError::NoActiveSession)
        }
    }
}

/// Merges required and optional proposals key by key.
fn merge_proposals(
    required: &ProposalNamespaces,
    optional: &ProposalNamespaces,
) -> ProposalNamespaces {
    let mut merged = required.clone();
    for (key, extra) in optional {
        let entry = merged
            .entry(key.clone())
            .or_insert_with(ProposalNamespace::default);
        for chain in &extra.chains {
            if !entry.chains.contains(chain) {
                entry.chains.push(chain.clone());
            }
        }
        entry.methods.extend(extra.methods.iter().cloned());
        entry.events.extend(extra.events.iter().cloned());
    }
    merged
}

/// Checks that `approved` grants nothing beyond `proposed`.
fn validate_namespaces(
    proposed: &ProposalNamespaces,
    approved: &Namespaces,
) -> Result<(), SessionError> {
    if approved.is_empty() {
        return Err(SessionError::NamespaceMismatch(
            "no namespaces approved".into(),
        ));
    }

    for (key, namespace) in approved {
        namespace
            .validate()
            .map_err(|e| SessionError::NamespaceMismatch(format!("{key}: {e}")))?;

        let proposal = proposed.get(key).ok_or_else(|| {
            SessionError::NamespaceMismatch(format!("{key} was not proposed"))
        })?;

        let methods: BTreeSet<_> = namespace.methods.difference(&proposal.methods).collect();
        if !methods.is_empty() {
            return Err(SessionError::NamespaceMismatch(format!(
                "{key}: methods not proposed: {methods:?}"
            )));
        }

        let events: BTreeSet<_> = namespace.events.difference(&proposal.events).collect();
        if !events.is_empty() {
            return Err(SessionError::NamespaceMismatch(format!(
                "{key}: events not proposed: {events:?}"
            )));
        }

        let allowed = proposal.chain_set(key);
        let chains: BTreeSet<_> = namespace
            .chain_set(key)
            .into_iter()
            .filter(|chain| !allowed.contains(chain))
            .collect();
        if !chains.is_empty() {
            return Err(SessionError::NamespaceMismatch(format!(
                "{key}: chains not proposed: {chains:?}"
            )));
        }
    }
    Ok(())
}
