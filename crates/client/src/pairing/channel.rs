//! Pairing channel implementation.
//!
//! The channel owns the current [`Pairing`]. Outgoing frames are sealed
//! with the pairing key and published on its topic; incoming relay frames
//! are opened, decoded and re-emitted as [`ChannelEvent`]s by a background
//! pump task. The channel never retries a send.

use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use protocol::messages::{methods, Participant, SessionApproval, SessionDelete, SessionProposal};
use protocol::{
    open, seal, ClientIdentity, Frame, Metadata, PairingUri, ProposalNamespaces, RpcRequest,
    RpcResponse, SymKey, Topic,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use super::{ChannelEvent, Pairing, Subscription, CHANNEL_EVENT_BUFFER_SIZE};
use crate::current_timestamp;
use crate::error::{ConnectError, SessionError, TransportError};
use crate::relay::{RelayEvent, RelayTransport};
use crate::rpc::next_request_id;

/// Default time to wait for the wallet to approve a proposal.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time to wait for the wallet to answer a resumption ping.
pub const DEFAULT_RESUME_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of an unanswered pairing URI.
pub const DEFAULT_PAIRING_TTL: Duration = Duration::from_secs(300);

/// Default lifetime of a relay credential.
pub const DEFAULT_AUTH_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing configuration for a [`PairingChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// How long `connect` waits for approval.
    pub connect_timeout: Duration,
    /// How long `resume` waits for the wallet's ping answer.
    pub resume_timeout: Duration,
    /// Lifetime of the pairing URI before approval.
    pub pairing_ttl: Duration,
    /// Lifetime of each relay credential.
    pub auth_ttl: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            resume_timeout: DEFAULT_RESUME_TIMEOUT,
            pairing_ttl: DEFAULT_PAIRING_TTL,
            auth_ttl: DEFAULT_AUTH_TTL,
        }
    }
}

impl ChannelConfig {
    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the resume timeout.
    pub fn resume_timeout(mut self, timeout: Duration) -> Self {
        self.resume_timeout = timeout;
        self
    }
}

/// A successful handshake: the now-active pairing and what the wallet granted.
#[derive(Debug, Clone)]
pub struct Approved {
    /// The active pairing.
    pub pairing: Pairing,
    /// The wallet's approval.
    pub approval: SessionApproval,
}

/// Anything that can put a frame on a topic.
///
/// The dispatcher only needs this much of the channel.
pub trait FrameSender: Send + Sync + 'static {
    /// Send one frame, best effort, without retrying.
    fn send_frame(
        &self,
        topic: &Topic,
        frame: &Frame,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// The encrypted channel between this client and one wallet.
pub struct PairingChannel<T: RelayTransport> {
    transport: Arc<T>,
    identity: RwLock<Arc<ClientIdentity>>,
    pairing: Arc<RwLock<Option<Pairing>>>,
    events: broadcast::Sender<ChannelEvent>,
    config: ChannelConfig,
    shutdown: CancellationToken,
}

impl<T: RelayTransport> PairingChannel<T> {
    /// Creates a channel over `transport` for `identity`.
    ///
    /// Spawns the receive pump, so this must be called within a Tokio runtime.
    pub fn new(transport: Arc<T>, identity: Arc<ClientIdentity>, config: ChannelConfig) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_EVENT_BUFFER_SIZE);
        let pairing = Arc::new(RwLock::new(None));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_pump(
            transport.clone(),
            transport.events(),
            pairing.clone(),
            events.clone(),
            shutdown.clone(),
        ));

        Self {
            transport,
            identity: RwLock::new(identity),
            pairing,
            events,
            config,
            shutdown,
        }
    }

    fn pairing_read(&self) -> RwLockReadGuard<'_, Option<Pairing>> {
        self.pairing.read().unwrap_or_else(|e| e.into_inner())
    }

    fn pairing_write(&self) -> RwLockWriteGuard<'_, Option<Pairing>> {
        self.pairing.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The identity used to authenticate with the relay.
    pub fn identity(&self) -> Arc<ClientIdentity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces the identity used for subsequent relay authentication.
    pub fn set_identity(&self, identity: Arc<ClientIdentity>) {
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }

    /// The current pairing, if any.
    pub fn current(&self) -> Option<Pairing> {
        self.pairing_read().clone()
    }

    /// Moves the expiry of the active pairing on `topic` forward to `expiry`.
    ///
    /// Returns `false` when no active pairing uses `topic`. An earlier
    /// expiry leaves the pairing unchanged.
    pub fn extend(&self, topic: &Topic, expiry: u64) -> bool {
        let mut guard = self.pairing_write();
        match guard.as_mut() {
            Some(pairing) if pairing.active && &pairing.topic == topic => {
                if expiry > pairing.expiry {
                    pairing.expiry = expiry;
                    tracing::debug!(topic = %topic.short(), expiry, "Pairing extended");
                }
                true
            }
            _ => false,
        }
    }

    /// The channel's timing configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Whether the relay is reachable.
    pub fn is_online(&self) -> bool {
        self.transport.is_online()
    }

    /// Subscribe to channel events.
    pub fn subscribe(&self) -> Subscription<ChannelEvent> {
        Subscription::new(self.events.subscribe())
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    /// Performs the pairing handshake.
    ///
    /// Generates a fresh key, announces the pairing URI, publishes the
    /// session proposal and waits for the wallet's answer. Any failure
    /// leaves no pairing behind.
    pub async fn connect(
        &self,
        metadata: &Metadata,
        required: &ProposalNamespaces,
        optional: &ProposalNamespaces,
    ) -> Result<Approved, ConnectError> {
        if self.pairing_read().is_some() {
            return Err(ConnectError::AlreadyActive);
        }

        let identity = self.identity();
        let now = current_timestamp();
        self.transport
            .authenticate(identity.relay_auth(now, self.config.auth_ttl.as_secs()))
            .await?;

        let sym_key = SymKey::generate();
        let uri = PairingUri::new(sym_key.clone(), now + self.config.pairing_ttl.as_secs());
        let topic = uri.topic.clone();

        self.transport.subscribe(&topic).await?;
        *self.pairing_write() = Some(Pairing {
            topic: topic.clone(),
            sym_key,
            expiry: uri.expiry,
            active: false,
        });
        tracing::debug!(topic = %topic.short(), "Pairing created, proposing session");

        let approval = match self
            .propose(&identity, &uri, metadata, required, optional)
            .await
        {
            Ok(approval) => approval,
            Err(e) => {
                tracing::debug!(topic = %topic.short(), error = %e, "Proposal failed");
                self.abandon(&topic).await;
                return Err(e);
            }
        };

        let activated = {
            let mut guard = self.pairing_write();
            match guard.as_mut() {
                Some(pairing) if pairing.topic == topic => {
                    pairing.active = true;
                    pairing.expiry = approval.expiry;
                    Some(pairing.clone())
                }
                _ => None,
            }
        };

        match activated {
            Some(pairing) => {
                tracing::info!(topic = %topic.short(), "Pairing approved");
                Ok(Approved { pairing, approval })
            }
            // Torn down while waiting for the answer.
            None => Err(ConnectError::Transport(TransportError::NotSubscribed(
                topic.to_string(),
            ))),
        }
    }

    async fn propose(
        &self,
        identity: &ClientIdentity,
        uri: &PairingUri,
        metadata: &Metadata,
        required: &ProposalNamespaces,
        optional: &ProposalNamespaces,
    ) -> Result<SessionApproval, ConnectError> {
        let id = next_request_id();
        let proposal = SessionProposal {
            proposer: Participant {
                public_key: identity.public_key_hex(),
                metadata: metadata.clone(),
            },
            required_namespaces: required.clone(),
            optional_namespaces: optional.clone(),
            expiry: uri.expiry,
        };
        let frame = Frame::Request(RpcRequest::new(id, methods::SESSION_PROPOSE, &proposal)?);

        let mut rx = self.events.subscribe();
        self.emit(ChannelEvent::PairingUri(uri.to_string()));
        self.send(&uri.topic, &frame).await?;

        let response = await_response(&mut rx, &uri.topic, id, self.config.connect_timeout)
            .await
            .ok_or(ConnectError::Timeout)?;

        match response.into_outcome() {
            Ok(value) => serde_json::from_value(value).map_err(|e| ConnectError::Protocol(e.into())),
            Err(error) => Err(ConnectError::Rejected {
                code: error.code,
                message: error.message,
            }),
        }
    }

    async fn abandon(&self, topic: &Topic) {
        let removed = {
            let mut guard = self.pairing_write();
            if guard.as_ref().is_some_and(|p| &p.topic == topic) {
                guard.take()
            } else {
                None
            }
        };
        if removed.is_some() {
            if let Err(e) = self.transport.unsubscribe(topic).await {
                tracing::debug!(topic = %topic.short(), error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Tears down the current pairing.
    ///
    /// The pairing is dropped before the wallet is notified, and whether the
    /// notification gets through does not matter.
    pub async fn disconnect(&self, reason: SessionDelete) {
        let pairing = self.pairing_write().take();
        let Some(pairing) = pairing else {
            return;
        };

        if pairing.active && self.transport.is_online() {
            let notice = RpcRequest::new(next_request_id(), methods::SESSION_DELETE, &reason)
                .map(Frame::Request);
            match notice {
                Ok(frame) => {
                    if let Err(e) =
                        publish_sealed(&*self.transport, &pairing.topic, &pairing.sym_key, &frame)
                            .await
                    {
                        tracing::debug!(topic = %pairing.topic.short(), error = %e, "Peer not notified of disconnect");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Could not encode disconnect notice"),
            }
        }

        if let Err(e) = self.transport.unsubscribe(&pairing.topic).await {
            tracing::debug!(topic = %pairing.topic.short(), error = %e, "Unsubscribe failed");
        }
        tracing::info!(topic = %pairing.topic.short(), code = reason.code, "Pairing closed");
    }

    /// Sends one frame on `topic`. No retry.
    pub async fn send(&self, topic: &Topic, frame: &Frame) -> Result<(), TransportError> {
        let key = self
            .pairing_read()
            .as_ref()
            .filter(|p| &p.topic == topic)
            .map(|p| p.sym_key.clone())
            .ok_or_else(|| TransportError::NotSubscribed(topic.to_string()))?;
        publish_sealed(&*self.transport, topic, &key, frame).await
    }

    /// Re-establishes the active pairing after the relay came back.
    ///
    /// Re-authenticates, re-subscribes (which also delivers anything missed
    /// while offline) and pings the wallet within the resume timeout.
    pub async fn resume(&self) -> Result<(), ConnectError> {
        let (topic, expiry) = self
            .pairing_read()
            .as_ref()
            .filter(|p| p.active)
            .map(|p| (p.topic.clone(), p.expiry))
            .ok_or(SessionError::NoActiveSession)?;

        let now = current_timestamp();
        if expiry <= now {
            return Err(SessionError::Expired.into());
        }

        let identity = self.identity();
        self.transport
            .authenticate(identity.relay_auth(now, self.config.auth_ttl.as_secs()))
            .await?;
        self.transport.subscribe(&topic).await?;

        let id = next_request_id();
        let ping = Frame::Request(RpcRequest::new(
            id,
            methods::SESSION_PING,
            serde_json::json!({}),
        )?);
        let mut rx = self.events.subscribe();
        self.send(&topic, &ping).await?;

        let response = await_response(&mut rx, &topic, id, self.config.resume_timeout)
            .await
            .ok_or(ConnectError::Timeout)?;
        if let Err(error) = response.into_outcome() {
            return Err(ConnectError::Rejected {
                code: error.code,
                message: error.message,
            });
        }

        tracing::info!(topic = %topic.short(), "Pairing resumed");
        Ok(())
    }
}

impl<T: RelayTransport> FrameSender for PairingChannel<T> {
    async fn send_frame(&self, topic: &Topic, frame: &Frame) -> Result<(), TransportError> {
        self.send(topic, frame).await
    }
}

impl<T: RelayTransport> Drop for PairingChannel<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn publish_sealed<T: RelayTransport>(
    transport: &T,
    topic: &Topic,
    key: &SymKey,
    frame: &Frame,
) -> Result<(), TransportError> {
    let envelope = frame
        .to_json()
        .and_then(|json| seal(key, &json))
        .map_err(|e| TransportError::Rejected(e.to_string()))?;
    transport.publish(topic, envelope).await
}

async fn await_response(
    rx: &mut broadcast::Receiver<ChannelEvent>,
    topic: &Topic,
    id: u64,
    within: Duration,
) -> Option<RpcResponse> {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(ChannelEvent::Message {
                    topic: from,
                    frame: Frame::Response(response),
                }) if &from == topic && response.id == id => return Some(response),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Handshake listener lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(within, wait).await.ok().flatten()
}

/// Receive pump: relay events in, channel events out.
async fn run_pump<T: RelayTransport>(
    transport: Arc<T>,
    mut relay_rx: broadcast::Receiver<RelayEvent>,
    pairing: Arc<RwLock<Option<Pairing>>>,
    events: broadcast::Sender<ChannelEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = relay_rx.recv() => event,
        };

        match event {
            Ok(RelayEvent::Message { topic, payload }) => {
                let key = pairing
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .filter(|p| p.topic == topic)
                    .map(|p| p.sym_key.clone());
                let Some(key) = key else {
                    tracing::debug!(topic = %topic.short(), "Dropping frame for unknown topic");
                    continue;
                };

                let frame = match open(&key, &payload).and_then(|plain| Frame::from_json(&plain)) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(topic = %topic.short(), error = %e, "Dropping undecodable frame");
                        continue;
                    }
                };

                match frame {
                    Frame::Request(request) if request.method == methods::SESSION_DELETE => {
                        handle_peer_delete(&*transport, &pairing, &events, topic, &key, request)
                            .await;
                    }
                    frame => {
                        let _ = events.send(ChannelEvent::Message { topic, frame });
                    }
                }
            }
            Ok(RelayEvent::Connectivity { online }) => {
                tracing::info!(online, "Relay connectivity changed");
                let _ = events.send(ChannelEvent::ConnectivityChanged(online));
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Relay events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!("Pairing channel pump stopped");
}

async fn handle_peer_delete<T: RelayTransport>(
    transport: &T,
    pairing: &RwLock<Option<Pairing>>,
    events: &broadcast::Sender<ChannelEvent>,
    topic: Topic,
    key: &SymKey,
    request: RpcRequest,
) {
    let reason = request
        .params_as::<SessionDelete>()
        .unwrap_or_else(|_| SessionDelete::user_disconnected());

    // Acknowledge before the key is forgotten.
    if let Ok(ack) = RpcResponse::success(request.id, true) {
        let _ = publish_sealed(transport, &topic, key, &Frame::Response(ack)).await;
    }

    let removed = {
        let mut guard = pairing.write().unwrap_or_else(|e| e.into_inner());
        if guard.as_ref().is_some_and(|p| p.topic == topic) {
            guard.take()
        } else {
            None
        }
    };
    if removed.is_none() {
        // Duplicate delivery of a delete we already handled.
        return;
    }

    let _ = transport.unsubscribe(&topic).await;
    tracing::info!(topic = %topic.short(), code = reason.code, message = %reason.message, "Session terminated by peer");
    let _ = events.send(ChannelEvent::SessionTerminatedByPeer { topic, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{MemoryRelay, MemoryRelayHub};
    use protocol::messages::codes;
    use protocol::{Namespace, ProposalNamespace};

    fn proposal() -> ProposalNamespaces {
        let mut namespaces = ProposalNamespaces::new();
        namespaces.insert(
            "eip155".into(),
            ProposalNamespace {
                chains: vec!["eip155:1".into()],
                methods: ["personal_sign".to_string()].into_iter().collect(),
                events: Default::default(),
            },
        );
        namespaces
    }

    fn channel(hub: &MemoryRelayHub, config: ChannelConfig) -> PairingChannel<MemoryRelay> {
        PairingChannel::new(
            Arc::new(hub.connect()),
            Arc::new(ClientIdentity::generate()),
            config,
        )
    }

    /// Minimal wallet: joins via the URI and answers the proposal with `answer`.
    async fn answer_proposal(
        hub: &MemoryRelayHub,
        uri: &str,
        answer: impl Fn(u64) -> RpcResponse,
    ) -> (MemoryRelay, PairingUri) {
        let uri = PairingUri::parse(uri).unwrap();
        let wallet = hub.connect();
        wallet
            .authenticate(ClientIdentity::generate().relay_auth(current_timestamp(), 60))
            .await
            .unwrap();
        let mut rx = wallet.events();
        wallet.subscribe(&uri.topic).await.unwrap();

        let payload = match rx.recv().await.unwrap() {
            RelayEvent::Message { payload, .. } => payload,
            other => panic!("unexpected {:?}", other),
        };
        let request = match Frame::from_json(&open(&uri.sym_key, &payload).unwrap()).unwrap() {
            Frame::Request(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(request.method, methods::SESSION_PROPOSE);

        let response = Frame::Response(answer(request.id));
        let sealed = seal(&uri.sym_key, &response.to_json().unwrap()).unwrap();
        wallet.publish(&uri.topic, sealed).await.unwrap();
        (wallet, uri)
    }

    fn approval() -> SessionApproval {
        let mut namespaces = protocol::Namespaces::new();
        namespaces.insert(
            "eip155".into(),
            Namespace {
                accounts: vec!["eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb".into()],
                methods: ["personal_sign".to_string()].into_iter().collect(),
                ..Default::default()
            },
        );
        SessionApproval {
            responder: Participant {
                public_key: "00".repeat(32),
                metadata: Metadata::default(),
            },
            namespaces,
            expiry: current_timestamp() + 3600,
        }
    }

    async fn next_uri(events: &mut Subscription<ChannelEvent>) -> String {
        loop {
            if let Some(ChannelEvent::PairingUri(uri)) = events.recv().await {
                return uri;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_approved() {
        let hub = MemoryRelayHub::new();
        let channel = Arc::new(channel(&hub, ChannelConfig::default()));
        let mut events = channel.subscribe();

        let connecting = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .connect(&Metadata::default(), &proposal(), &ProposalNamespaces::new())
                    .await
            })
        };

        let uri = next_uri(&mut events).await;
        let expected = approval();
        let reply = expected.clone();
        let (_wallet, uri) =
            answer_proposal(&hub, &uri, move |id| RpcResponse::success(id, &reply).unwrap()).await;

        let approved = connecting.await.unwrap().unwrap();
        assert_eq!(approved.pairing.topic, uri.topic);
        assert!(approved.pairing.active);
        assert_eq!(approved.pairing.expiry, expected.expiry);
        assert_eq!(approved.approval, expected);
        assert_eq!(channel.current().unwrap().topic, uri.topic);

        assert!(channel.extend(&uri.topic, expected.expiry + 600));
        assert_eq!(channel.current().unwrap().expiry, expected.expiry + 600);
        assert!(channel.extend(&uri.topic, expected.expiry));
        assert_eq!(channel.current().unwrap().expiry, expected.expiry + 600);
        assert!(!channel.extend(&Topic::new("ff".repeat(32)), expected.expiry + 900));
    }

    #[tokio::test]
    async fn test_connect_rejected_leaves_no_pairing() {
        let hub = MemoryRelayHub::new();
        let channel = Arc::new(channel(&hub, ChannelConfig::default()));
        let mut events = channel.subscribe();

        let connecting = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .connect(&Metadata::default(), &proposal(), &ProposalNamespaces::new())
                    .await
            })
        };

        let uri = next_uri(&mut events).await;
        answer_proposal(&hub, &uri, |id| {
            RpcResponse::failure(
                id,
                protocol::ErrorObject::new(codes::USER_REJECTED, "User rejected."),
            )
        })
        .await;

        match connecting.await.unwrap() {
            Err(ConnectError::Rejected { code, message }) => {
                assert_eq!(code, codes::USER_REJECTED);
                assert_eq!(message, "User rejected.");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(channel.current().is_none());
    }

    #[tokio::test]
    async fn test_connect_times_out() {
        let hub = MemoryRelayHub::new();
        let channel = channel(
            &hub,
            ChannelConfig::default().connect_timeout(Duration::from_millis(50)),
        );

        let result = channel
            .connect(&Metadata::default(), &proposal(), &ProposalNamespaces::new())
            .await;
        assert!(matches!(result, Err(ConnectError::Timeout)));
        assert!(channel.current().is_none());
    }

    #[tokio::test]
    async fn test_connect_offline_is_transport_error() {
        let hub = MemoryRelayHub::new();
        let relay = Arc::new(hub.connect());
        relay.set_online(false);
        let channel = PairingChannel::new(
            relay,
            Arc::new(ClientIdentity::generate()),
            ChannelConfig::default(),
        );

        let result = channel
            .connect(&Metadata::default(), &proposal(), &ProposalNamespaces::new())
            .await;
        assert!(matches!(
            result,
            Err(ConnectError::Transport(TransportError::Offline))
        ));
    }

    #[tokio::test]
    async fn test_send_without_pairing() {
        let hub = MemoryRelayHub::new();
        let channel = channel(&hub, ChannelConfig::default());
        let frame = Frame::Request(RpcRequest::new(1, methods::SESSION_PING, ()).unwrap());

        assert!(matches!(
            channel.send(&Topic::new("ff"), &frame).await,
            Err(TransportError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_pairing_is_noop() {
        let hub = MemoryRelayHub::new();
        let channel = channel(&hub, ChannelConfig::default());
        channel.disconnect(SessionDelete::user_disconnected()).await;
        assert!(channel.current().is_none());
    }

    #[tokio::test]
    async fn test_peer_delete_terminates_pairing() {
        let hub = MemoryRelayHub::new();
        let channel = Arc::new(channel(&hub, ChannelConfig::default()));
        let mut events = channel.subscribe();

        let connecting = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .connect(&Metadata::default(), &proposal(), &ProposalNamespaces::new())
                    .await
            })
        };
        let uri = next_uri(&mut events).await;
        let reply = approval();
        let (wallet, uri) =
            answer_proposal(&hub, &uri, move |id| RpcResponse::success(id, &reply).unwrap()).await;
        connecting.await.unwrap().unwrap();

        let delete = Frame::Request(
            RpcRequest::new(
                next_request_id(),
                methods::SESSION_DELETE,
                SessionDelete {
                    code: codes::USER_DISCONNECTED,
                    message: "bye".into(),
                },
            )
            .unwrap(),
        );
        let sealed = seal(&uri.sym_key, &delete.to_json().unwrap()).unwrap();
        wallet.publish(&uri.topic, sealed).await.unwrap();

        loop {
            match events.recv().await {
                Some(ChannelEvent::SessionTerminatedByPeer { topic, reason }) => {
                    assert_eq!(topic, uri.topic);
                    assert_eq!(reason.message, "bye");
                    break;
                }
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
        assert!(channel.current().is_none());
    }
}
