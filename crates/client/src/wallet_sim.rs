//! Simulated wallet peer.
//!
//! [`SimulatedWallet`] joins a pairing through its URI over a
//! [`MemoryRelayHub`] and plays the wallet side of the protocol: it answers
//! the proposal, signs or rejects requests, and can push updates, extend
//! or end the session. The demo binary and the integration tests drive the
//! client against it.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use protocol::messages::{
    codes, methods, EventPayload, SessionApproval, SessionDelete, SessionExtend, SessionProposal,
    SessionRequest, SessionUpdate,
};
use protocol::{
    open, seal, ClientIdentity, ErrorObject, Frame, Metadata, Namespace, Namespaces, PairingUri,
    Participant, ProtocolError, RpcRequest, RpcResponse, SymKey, Topic,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

use crate::current_timestamp;
use crate::error::TransportError;
use crate::relay::{MemoryRelay, MemoryRelayHub, RelayEvent, RelayTransport};
use crate::rpc::next_request_id;

/// Account the simulated wallet holds by default.
pub const DEFAULT_ACCOUNT: &str = "eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb";

/// Errors from driving the simulated wallet.
#[derive(Debug, Error)]
pub enum WalletError {
    /// A frame could not be built or read.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The relay refused an operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The wallet has not joined a pairing.
    #[error("wallet is not paired")]
    NotPaired,
}

/// How the wallet answers a session proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalBehavior {
    /// Grant everything proposed on chains it holds accounts for.
    Approve,
    /// Decline with the given error.
    Reject { code: i64, message: String },
    /// Never answer.
    Ignore,
    /// Approve, but also grant a method that was never proposed.
    Overreach,
}

/// How the wallet answers session requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBehavior {
    /// Answer with a signature over the request.
    Respond,
    /// Decline with the given error.
    Reject { code: i64, message: String },
    /// Leave the request for [`SimulatedWallet::respond`].
    Ignore,
}

/// Wallet configuration.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// CAIP-10 accounts the wallet holds, in the order it lists them.
    pub accounts: Vec<String>,
    /// Lifetime granted to new sessions, in seconds.
    pub session_ttl: u64,
    /// Proposal answer.
    pub proposal: ProposalBehavior,
    /// Request answer.
    pub requests: RequestBehavior,
    /// Publish every answer twice.
    pub duplicate_responses: bool,
    /// Metadata shown to the dApp.
    pub metadata: Metadata,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            accounts: vec![DEFAULT_ACCOUNT.to_string()],
            session_ttl: 24 * 60 * 60,
            proposal: ProposalBehavior::Approve,
            requests: RequestBehavior::Respond,
            duplicate_responses: false,
            metadata: Metadata {
                name: "Simulated Wallet".into(),
                description: "In-process wallet".into(),
                ..Default::default()
            },
        }
    }
}

#[derive(Default)]
struct WalletState {
    pairing: Option<(Topic, SymKey)>,
    proposal: Option<SessionProposal>,
    namespaces: Option<Namespaces>,
    requests: Vec<RpcRequest>,
    answered: HashMap<u64, RpcResponse>,
    acks: HashMap<u64, RpcResponse>,
    deleted_by_peer: bool,
}

struct Shared {
    relay: MemoryRelay,
    identity: ClientIdentity,
    config: Mutex<WalletConfig>,
    state: Mutex<WalletState>,
    changed: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config(&self) -> WalletConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pairing(&self) -> Result<(Topic, SymKey), WalletError> {
        self.state().pairing.clone().ok_or(WalletError::NotPaired)
    }

    async fn publish(&self, frame: &Frame) -> Result<(), WalletError> {
        let (topic, key) = self.pairing()?;
        let sealed = seal(&key, &frame.to_json()?)?;
        self.relay.publish(&topic, sealed).await?;
        Ok(())
    }

    async fn answer(&self, response: RpcResponse) -> Result<(), WalletError> {
        let copies = if self.config().duplicate_responses { 2 } else { 1 };
        let frame = Frame::Response(response);
        for _ in 0..copies {
            self.publish(&frame).await?;
        }
        Ok(())
    }
}

/// An in-process wallet.
pub struct SimulatedWallet {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl SimulatedWallet {
    /// Creates a wallet with its own connection to `hub`.
    pub fn new(hub: &MemoryRelayHub, config: WalletConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                relay: hub.connect(),
                identity: ClientIdentity::generate(),
                config: Mutex::new(config),
                state: Mutex::new(WalletState::default()),
                changed: Notify::new(),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Joins the pairing described by `uri` and starts answering.
    ///
    /// Spawns the wallet's receive loop, so this must be called within a
    /// Tokio runtime.
    pub async fn pair(&self, uri: &str) -> Result<(), WalletError> {
        let uri = PairingUri::parse(uri)?;
        let shared = &self.shared;

        shared
            .relay
            .authenticate(shared.identity.relay_auth(current_timestamp(), 24 * 60 * 60))
            .await?;
        {
            let mut state = shared.state();
            state.pairing = Some((uri.topic.clone(), uri.sym_key.clone()));
            state.deleted_by_peer = false;
        }

        // Listen before subscribing so the backlog is not missed.
        let rx = shared.relay.events();
        tokio::spawn(run_wallet(shared.clone(), rx, self.shutdown.clone()));
        shared.relay.subscribe(&uri.topic).await?;
        tracing::debug!(topic = %uri.topic.short(), "Wallet joined pairing");
        Ok(())
    }

    /// The wallet's relay connection, for simulating connectivity.
    pub fn relay(&self) -> &MemoryRelay {
        &self.shared.relay
    }

    /// Replaces how future requests are answered.
    pub fn set_request_behavior(&self, behavior: RequestBehavior) {
        self.shared
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .requests = behavior;
    }

    /// Publish every answer twice from now on.
    pub fn set_duplicate_responses(&self, enabled: bool) {
        self.shared
            .config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .duplicate_responses = enabled;
    }

    /// Topic of the joined pairing.
    pub fn topic(&self) -> Option<Topic> {
        self.shared.state().pairing.as_ref().map(|(t, _)| t.clone())
    }

    /// The proposal the dApp sent.
    pub fn proposal(&self) -> Option<SessionProposal> {
        self.shared.state().proposal.clone()
    }

    /// What the wallet currently grants.
    pub fn namespaces(&self) -> Option<Namespaces> {
        self.shared.state().namespaces.clone()
    }

    /// Distinct session requests received, in arrival order.
    pub fn received_requests(&self) -> Vec<RpcRequest> {
        self.shared.state().requests.clone()
    }

    /// Whether the dApp ended the session.
    pub fn was_disconnected(&self) -> bool {
        self.shared.state().deleted_by_peer
    }

    /// The dApp's answer to a request the wallet pushed.
    pub fn ack(&self, id: u64) -> Option<RpcResponse> {
        self.shared.state().acks.get(&id).cloned()
    }

    /// Waits until `count` distinct requests have arrived.
    pub async fn wait_for_requests(&self, count: usize, within: Duration) -> Vec<RpcRequest> {
        self.wait_until(within, |state| state.requests.len() >= count)
            .await;
        self.received_requests()
    }

    /// Waits for the dApp's answer to pushed request `id`.
    pub async fn wait_for_ack(&self, id: u64, within: Duration) -> Option<RpcResponse> {
        self.wait_until(within, |state| state.acks.contains_key(&id))
            .await;
        self.ack(id)
    }

    /// Waits until the dApp ends the session.
    pub async fn wait_for_disconnect(&self, within: Duration) -> bool {
        self.wait_until(within, |state| state.deleted_by_peer).await
    }

    async fn wait_until(&self, within: Duration, done: impl Fn(&WalletState) -> bool) -> bool {
        let wait = async {
            loop {
                let notified = self.shared.changed.notified();
                if done(&self.shared.state()) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(within, wait).await.is_ok()
    }

    /// Answers request `id` by hand.
    pub async fn respond(
        &self,
        id: u64,
        outcome: Result<Value, ErrorObject>,
    ) -> Result<(), WalletError> {
        let response = match outcome {
            Ok(value) => RpcResponse::success(id, value)?,
            Err(error) => RpcResponse::failure(id, error),
        };
        self.shared.state().answered.insert(id, response.clone());
        self.shared.answer(response).await
    }

    /// Replaces the granted namespaces and tells the dApp.
    pub async fn push_update(&self, namespaces: Namespaces) -> Result<u64, WalletError> {
        self.shared.state().namespaces = Some(namespaces.clone());
        self.push(methods::SESSION_UPDATE, SessionUpdate { namespaces })
            .await
    }

    /// Extends the session to `expiry`.
    pub async fn extend(&self, expiry: u64) -> Result<u64, WalletError> {
        self.push(methods::SESSION_EXTEND, SessionExtend { expiry })
            .await
    }

    /// Emits a wallet event such as `accountsChanged`.
    pub async fn emit_event(
        &self,
        chain_id: &str,
        name: &str,
        data: Value,
    ) -> Result<u64, WalletError> {
        let event = protocol::messages::SessionEvent {
            chain_id: chain_id.to_string(),
            event: EventPayload {
                name: name.to_string(),
                data,
            },
        };
        self.push(methods::SESSION_EVENT, event).await
    }

    /// Ends the session from the wallet side.
    pub async fn terminate(&self, message: &str) -> Result<(), WalletError> {
        let reason = SessionDelete {
            code: codes::USER_DISCONNECTED,
            message: message.to_string(),
        };
        self.push(methods::SESSION_DELETE, reason).await?;

        let pairing = {
            let mut state = self.shared.state();
            state.namespaces = None;
            state.pairing.take()
        };
        if let Some((topic, _)) = pairing {
            let _ = self.shared.relay.unsubscribe(&topic).await;
        }
        Ok(())
    }

    async fn push(
        &self,
        method: &str,
        params: impl serde::Serialize,
    ) -> Result<u64, WalletError> {
        let id = next_request_id();
        let frame = Frame::Request(RpcRequest::new(id, method, params)?);
        self.shared.publish(&frame).await?;
        Ok(id)
    }
}

impl Drop for SimulatedWallet {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Builds the wallet's grant for `proposal`.
fn grant(proposal: &SessionProposal, accounts: &[String], overreach: bool) -> Namespaces {
    let mut namespaces = Namespaces::new();
    let entries = proposal
        .required_namespaces
        .iter()
        .map(|(key, ns)| (key, ns, true))
        .chain(
            proposal
                .optional_namespaces
                .iter()
                .map(|(key, ns)| (key, ns, false)),
        );

    for (key, proposed, required) in entries {
        let chains = proposed.chain_set(key);
        let held: Vec<String> = accounts
            .iter()
            .filter(|account| chains.iter().any(|chain| account.starts_with(&format!("{chain}:"))))
            .cloned()
            .collect();
        if held.is_empty() && !required {
            continue;
        }

        let entry = namespaces.entry(key.clone()).or_insert_with(Namespace::default);
        for account in held {
            if !entry.accounts.contains(&account) {
                entry.accounts.push(account);
            }
        }
        entry.methods.extend(proposed.methods.iter().cloned());
        entry.events.extend(proposed.events.iter().cloned());
        if overreach {
            entry.methods.insert("wallet_unproposedMethod".to_string());
        }
    }
    namespaces
}

/// Deterministic stand-in for a signature over a request.
fn sign_request(identity: &ClientIdentity, request: &SessionRequest) -> Result<String, ProtocolError> {
    let message = serde_json::to_vec(request)?;
    Ok(format!("0x{}", identity.sign(&message).to_hex()))
}

async fn run_wallet(
    shared: Arc<Shared>,
    mut rx: broadcast::Receiver<RelayEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => event,
        };

        let (topic, payload) = match event {
            Ok(RelayEvent::Message { topic, payload }) => (topic, payload),
            Ok(RelayEvent::Connectivity { .. }) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Wallet lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let key = shared
            .state()
            .pairing
            .as_ref()
            .filter(|(t, _)| *t == topic)
            .map(|(_, k)| k.clone());
        let Some(key) = key else {
            continue;
        };
        let frame = match open(&key, &payload).and_then(|plain| Frame::from_json(&plain)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Wallet dropped undecodable frame");
                continue;
            }
        };

        if let Err(e) = handle_frame(&shared, frame).await {
            tracing::debug!(error = %e, "Wallet could not answer");
        }
        shared.changed.notify_waiters();
    }
}

async fn handle_frame(shared: &Shared, frame: Frame) -> Result<(), WalletError> {
    let request = match frame {
        Frame::Response(response) => {
            shared.state().acks.insert(response.id, response);
            return Ok(());
        }
        Frame::Request(request) => request,
    };

    let cached = shared.state().answered.get(&request.id).cloned();
    if let Some(response) = cached {
        return shared.answer(response).await;
    }

    let config = shared.config();
    let response = match request.method.as_str() {
        methods::SESSION_PROPOSE => {
            let proposal: SessionProposal = request.params_as()?;
            shared.state().proposal = Some(proposal.clone());
            match &config.proposal {
                ProposalBehavior::Ignore => return Ok(()),
                ProposalBehavior::Reject { code, message } => {
                    RpcResponse::failure(request.id, ErrorObject::new(*code, message.clone()))
                }
                behavior => {
                    let overreach = *behavior == ProposalBehavior::Overreach;
                    let namespaces = grant(&proposal, &config.accounts, overreach);
                    shared.state().namespaces = Some(namespaces.clone());
                    let approval = SessionApproval {
                        responder: Participant {
                            public_key: shared.identity.public_key_hex(),
                            metadata: config.metadata.clone(),
                        },
                        namespaces,
                        expiry: current_timestamp() + config.session_ttl,
                    };
                    RpcResponse::success(request.id, approval)?
                }
            }
        }
        methods::SESSION_REQUEST => {
            let params: SessionRequest = request.params_as()?;
            {
                let mut state = shared.state();
                if !state.requests.iter().any(|r| r.id == request.id) {
                    state.requests.push(request.clone());
                }
            }
            match &config.requests {
                RequestBehavior::Ignore => return Ok(()),
                RequestBehavior::Reject { code, message } => {
                    RpcResponse::failure(request.id, ErrorObject::new(*code, message.clone()))
                }
                RequestBehavior::Respond => {
                    RpcResponse::success(request.id, sign_request(&shared.identity, &params)?)?
                }
            }
        }
        methods::SESSION_PING => RpcResponse::success(request.id, true)?,
        methods::SESSION_DELETE => {
            let response = RpcResponse::success(request.id, true)?;
            shared.answer(response.clone()).await?;
            let pairing = {
                let mut state = shared.state();
                state.deleted_by_peer = true;
                state.namespaces = None;
                state.answered.insert(request.id, response);
                state.pairing.take()
            };
            if let Some((topic, _)) = pairing {
                let _ = shared.relay.unsubscribe(&topic).await;
            }
            return Ok(());
        }
        other => RpcResponse::failure(
            request.id,
            ErrorObject::new(codes::METHOD_NOT_FOUND, format!("unsupported method {other}")),
        ),
    };

    shared
        .state()
        .answered
        .insert(request.id, response.clone());
    shared.answer(response).await
}

/// The set of methods granted across all namespaces.
pub fn granted_methods(namespaces: &Namespaces) -> BTreeSet<String> {
    namespaces
        .values()
        .flat_map(|ns| ns.methods.iter().cloned())
        .collect()
}
