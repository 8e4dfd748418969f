//! Connection manager implementation.
//!
//! Transitions are serialized by one async mutex. `connect` only tries the
//! lock, so a second connect fails fast instead of queueing. Everything the
//! wallet pushes arrives through a single pump task that also runs the
//! periodic expiry check.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use protocol::messages::{codes, methods, SessionDelete, SessionExtend, SessionUpdate};
use protocol::{ClientId, ErrorObject, Frame, RpcRequest, RpcResponse, Topic};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{ClientOptions, ConnectionEvent, ConnectionState, EVENT_BUFFER_SIZE};
use crate::current_timestamp;
use crate::error::{ConnectError, RpcError, SessionError};
use crate::identity::{IdentityError, IdentityStore, SessionRecord};
use crate::pairing::{ChannelEvent, PairingChannel, Subscription};
use crate::relay::RelayTransport;
use crate::rpc::{PendingCall, PendingInfo, RequestDispatcher};
use crate::session::{Session, SessionEvent, SessionRegistry};
use crate::storage::{KeychainBackend, KeychainManager};

/// How many answered peer request ids are remembered for replay.
const PEER_REQUEST_CACHE_SIZE: usize = 256;

/// The session manager an application constructs once and shares.
pub struct ConnectionManager<T: RelayTransport, B: KeychainBackend + 'static> {
    inner: Arc<Inner<T, B>>,
    pump: CancellationToken,
}

struct Inner<T: RelayTransport, B: KeychainBackend + 'static> {
    identity: IdentityStore<B>,
    channel: Arc<PairingChannel<T>>,
    registry: Arc<SessionRegistry>,
    dispatcher: RequestDispatcher<PairingChannel<T>>,
    options: ClientOptions,
    state: RwLock<ConnectionState>,
    transition: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
    answered: Mutex<VecDeque<(u64, RpcResponse)>>,
}

impl<T: RelayTransport, B: KeychainBackend + 'static> ConnectionManager<T, B> {
    /// Creates a manager over `transport`, loading or creating the identity
    /// kept in `keychain`.
    ///
    /// Spawns the event pump, so this must be called within a Tokio runtime.
    pub fn new(
        transport: Arc<T>,
        keychain: KeychainManager<B>,
        options: ClientOptions,
    ) -> Result<Self, IdentityError> {
        let identity = IdentityStore::new(keychain);
        let client = identity.get_or_create_identity()?;

        let channel = Arc::new(PairingChannel::new(
            transport,
            client.clone(),
            options.channel.clone(),
        ));
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher =
            RequestDispatcher::new(channel.clone(), registry.clone(), options.request_timeout);
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);

        let inner = Arc::new(Inner {
            identity,
            channel,
            registry,
            dispatcher,
            options,
            state: RwLock::new(ConnectionState::Disconnected),
            transition: tokio::sync::Mutex::new(()),
            events,
            answered: Mutex::new(VecDeque::new()),
        });

        let pump = CancellationToken::new();
        let channel_events = inner.channel.subscribe();
        tokio::spawn(run_pump(inner.clone(), channel_events, pump.clone()));

        tracing::info!(client_id = %client.client_id(), "Connection manager ready");
        Ok(Self { inner, pump })
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// The active session, if any.
    pub async fn session(&self) -> Option<Session> {
        self.inner.registry.active_session().await
    }

    /// This client's id, for display.
    pub fn client_id(&self) -> Result<ClientId, IdentityError> {
        self.inner.identity.client_id()
    }

    /// The session remembered from a previous run, if not yet expired.
    pub fn last_session(&self) -> Result<Option<SessionRecord>, IdentityError> {
        self.inner.identity.last_session(current_timestamp())
    }

    /// The options this manager was built with.
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        Subscription::new(self.inner.events.subscribe())
    }

    /// Pairs with a wallet and establishes a session.
    ///
    /// The pairing URI is published as [`ConnectionEvent::PairingUri`] while
    /// this waits for approval. Fails with [`ConnectError::AlreadyActive`]
    /// unless the state is `Disconnected` and no other transition is running.
    pub async fn connect(&self) -> Result<Session, ConnectError> {
        let Ok(_guard) = self.inner.transition.try_lock() else {
            return Err(ConnectError::AlreadyActive);
        };
        if self.inner.state() != ConnectionState::Disconnected {
            return Err(ConnectError::AlreadyActive);
        }

        self.inner.set_state(ConnectionState::Connecting);
        match self.inner.establish().await {
            Ok(session) => {
                self.inner.set_state(ConnectionState::Connected);
                self.inner
                    .emit(ConnectionEvent::SessionChanged(Some(session.clone())));
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Connect failed");
                self.inner.set_state(ConnectionState::Disconnected);
                self.inner.emit(ConnectionEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Ends the session.
    ///
    /// Outstanding requests fail with [`RpcError::Disconnected`] and the
    /// session and pairing are gone before this returns. The wallet is told
    /// when the relay allows, but its answer is not awaited. Waits for an
    /// in-flight connect to finish first.
    pub async fn disconnect(&self) {
        let _guard = self.inner.transition.lock().await;
        if self.inner.state() == ConnectionState::Disconnected {
            return;
        }
        self.inner.set_state(ConnectionState::Disconnecting);
        self.inner.teardown(SessionDelete::user_disconnected()).await;
    }

    /// Discards the identity and generates a new one.
    ///
    /// Any session is ended first, since the wallet knows the old identity.
    pub async fn reset_identity(&self) -> Result<ClientId, IdentityError> {
        let _guard = self.inner.transition.lock().await;
        if self.inner.state() != ConnectionState::Disconnected {
            self.inner.set_state(ConnectionState::Disconnecting);
            self.inner.teardown(SessionDelete::user_disconnected()).await;
        }

        self.inner.identity.reset()?;
        let identity = self.inner.identity.get_or_create_identity()?;
        self.inner.channel.set_identity(identity.clone());
        Ok(identity.client_id().clone())
    }

    /// Sends `method` to the wallet on `chain_id` and waits for the result.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Value,
        chain_id: &str,
    ) -> Result<Value, RpcError> {
        self.inner.dispatcher.dispatch(method, params, chain_id).await
    }

    /// Sends `method` and returns a handle that can be awaited or cancelled.
    pub async fn start_request(
        &self,
        method: &str,
        params: Value,
        chain_id: &str,
    ) -> Result<PendingCall, RpcError> {
        self.inner.dispatcher.start(method, params, chain_id).await
    }

    /// Cancels an outstanding request.
    pub fn cancel(&self, id: u64) -> bool {
        self.inner.dispatcher.cancel(id)
    }

    /// Snapshot of outstanding requests.
    pub fn pending_requests(&self) -> Vec<PendingInfo> {
        self.inner.dispatcher.pending_requests()
    }
}

impl<T: RelayTransport, B: KeychainBackend + 'static> Drop for ConnectionManager<T, B> {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}

impl<T: RelayTransport, B: KeychainBackend + 'static> Inner<T, B> {
    fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Connection state changed");
            self.emit(ConnectionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn establish(&self) -> Result<Session, ConnectError> {
        let approved = self
            .channel
            .connect(
                &self.options.metadata,
                &self.options.required_namespaces,
                &self.options.optional_namespaces,
            )
            .await?;

        let session = match self
            .registry
            .apply_proposal_result(
                &approved.pairing,
                &self.options.required_namespaces,
                &self.options.optional_namespaces,
                &approved.approval,
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let reason = SessionDelete {
                    code: error_object(&e).code,
                    message: e.to_string(),
                };
                self.channel.disconnect(reason).await;
                return Err(e.into());
            }
        };

        self.dispatcher.reopen();
        if let Err(e) = self.identity.record_session(&session.topic, session.expiry) {
            tracing::warn!(error = %e, "Could not persist session record");
        }
        Ok(session)
    }

    /// Fails outstanding requests, then drops session and pairing, then
    /// reports `Disconnected`. Callers hold the transition lock.
    async fn teardown(&self, reason: SessionDelete) {
        let failed = self.dispatcher.close();
        self.registry.clear().await;
        self.emit(ConnectionEvent::SessionChanged(None));
        if let Err(e) = self.identity.clear_session_record() {
            tracing::warn!(error = %e, "Could not clear session record");
        }
        self.channel.disconnect(reason).await;
        tracing::debug!(failed, "Connection torn down");
        self.set_state(ConnectionState::Disconnected);
    }

    async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message {
                frame: Frame::Response(response),
                ..
            } => {
                self.dispatcher.handle_response(response);
            }
            ChannelEvent::Message {
                topic,
                frame: Frame::Request(request),
            } => self.handle_peer_request(topic, request).await,
            ChannelEvent::ConnectivityChanged(false) => self.on_offline().await,
            ChannelEvent::ConnectivityChanged(true) => self.on_online().await,
            ChannelEvent::SessionTerminatedByPeer { topic, reason } => {
                self.on_peer_terminated(topic, reason).await
            }
            ChannelEvent::PairingUri(uri) => self.emit(ConnectionEvent::PairingUri(uri)),
        }
    }

    async fn on_offline(&self) {
        // Connecting is left to the handshake's own timeout.
        if self.state() != ConnectionState::Connected {
            return;
        }
        let _guard = self.transition.lock().await;
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.dispatcher.close();
        self.set_state(ConnectionState::Reconnecting);
    }

    async fn on_online(&self) {
        if self.state() != ConnectionState::Reconnecting {
            return;
        }
        let _guard = self.transition.lock().await;
        if self.state() != ConnectionState::Reconnecting {
            return;
        }

        match self.channel.resume().await {
            Ok(()) => {
                self.dispatcher.reopen();
                self.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session resumption failed");
                self.emit(ConnectionEvent::Error(e.to_string()));
                let code = match e {
                    ConnectError::Session(SessionError::Expired) => codes::SESSION_EXPIRED,
                    _ => codes::USER_DISCONNECTED,
                };
                self.teardown(SessionDelete {
                    code,
                    message: e.to_string(),
                })
                .await;
            }
        }
    }

    async fn on_peer_terminated(&self, topic: Topic, reason: SessionDelete) {
        let _guard = self.transition.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        let event = SessionEvent::Terminated {
            topic,
            reason: reason.clone(),
        };
        if self.registry.apply(event).await.is_err() {
            return;
        }

        self.emit(ConnectionEvent::SessionTerminated {
            code: reason.code,
            message: reason.message.clone(),
        });
        self.teardown(reason).await;
    }

    async fn check_expiry(&self) {
        self.dispatcher.expire_overdue();

        let now = current_timestamp();
        if self.registry.expired(now).await.is_none() {
            return;
        }
        // A running transition gets another look on the next tick.
        let Ok(_guard) = self.transition.try_lock() else {
            return;
        };
        let Some(topic) = self.registry.expired(now).await else {
            return;
        };

        tracing::info!(topic = %topic.short(), "Session expired");
        if self.registry.apply(SessionEvent::Expired { topic }).await.is_err() {
            return;
        }
        let reason = SessionDelete {
            code: codes::SESSION_EXPIRED,
            message: "Session expired".into(),
        };
        self.emit(ConnectionEvent::SessionTerminated {
            code: reason.code,
            message: reason.message.clone(),
        });
        self.teardown(reason).await;
    }

    /// Answers a request the wallet sent us.
    ///
    /// A redelivered request gets the answer it got the first time and is
    /// not applied again.
    async fn handle_peer_request(&self, topic: Topic, request: RpcRequest) {
        let cached = self
            .answered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(id, _)| *id == request.id)
            .map(|(_, response)| response.clone());

        let response = match cached {
            Some(response) => {
                tracing::debug!(id = request.id, method = %request.method, "Replaying answer to duplicate peer request");
                response
            }
            None => {
                let outcome = self.apply_peer_request(&topic, &request).await;
                let response = match outcome {
                    Ok(value) => match RpcResponse::success(request.id, value) {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::warn!(error = %e, "Could not encode peer answer");
                            return;
                        }
                    },
                    Err(error) => RpcResponse::failure(request.id, error),
                };
                let mut answered = self.answered.lock().unwrap_or_else(|e| e.into_inner());
                answered.push_back((request.id, response.clone()));
                while answered.len() > PEER_REQUEST_CACHE_SIZE {
                    answered.pop_front();
                }
                response
            }
        };

        if let Err(e) = self.channel.send(&topic, &Frame::Response(response)).await {
            tracing::debug!(id = request.id, error = %e, "Could not answer peer request");
        }
    }

    async fn apply_peer_request(
        &self,
        topic: &Topic,
        request: &RpcRequest,
    ) -> Result<Value, ErrorObject> {
        match request.method.as_str() {
            methods::SESSION_UPDATE => {
                let update: SessionUpdate = request
                    .params_as()
                    .map_err(|e| ErrorObject::new(codes::INVALID_PARAMS, e.to_string()))?;
                let event = SessionEvent::Update {
                    topic: topic.clone(),
                    namespaces: update.namespaces,
                };
                let session = self.registry.apply(event).await.map_err(|e| error_object(&e))?;
                self.emit(ConnectionEvent::SessionChanged(session));
                Ok(Value::Bool(true))
            }
            methods::SESSION_EXTEND => {
                let extend: SessionExtend = request
                    .params_as()
                    .map_err(|e| ErrorObject::new(codes::INVALID_PARAMS, e.to_string()))?;
                let event = SessionEvent::Extend {
                    topic: topic.clone(),
                    expiry: extend.expiry,
                };
                let session = self.registry.apply(event).await.map_err(|e| error_object(&e))?;
                if let Some(session) = &session {
                    // Resumption checks the pairing's expiry, so it follows the session.
                    self.channel.extend(&session.topic, session.expiry);
                    if let Err(e) = self.identity.record_session(&session.topic, session.expiry) {
                        tracing::warn!(error = %e, "Could not persist session record");
                    }
                }
                self.emit(ConnectionEvent::SessionChanged(session));
                Ok(Value::Bool(true))
            }
            methods::SESSION_EVENT => {
                let event: protocol::messages::SessionEvent = request
                    .params_as()
                    .map_err(|e| ErrorObject::new(codes::INVALID_PARAMS, e.to_string()))?;
                let known = self
                    .registry
                    .active_session()
                    .await
                    .is_some_and(|session| &session.topic == topic);
                if !known {
                    return Err(error_object(&SessionError::UnknownTopic(topic.to_string())));
                }
                tracing::debug!(name = %event.event.name, chain = %event.chain_id, "Wallet event");
                self.emit(ConnectionEvent::PeerEvent {
                    chain_id: event.chain_id,
                    name: event.event.name,
                    data: event.event.data,
                });
                Ok(Value::Bool(true))
            }
            methods::SESSION_PING => Ok(Value::Bool(true)),
            other => {
                tracing::debug!(method = other, "Unsupported peer request");
                Err(ErrorObject::new(
                    codes::METHOD_NOT_FOUND,
                    format!("unsupported method {other}"),
                ))
            }
        }
    }
}

fn error_object(error: &SessionError) -> ErrorObject {
    let code = match error {
        SessionError::NamespaceMismatch(_) => codes::UNSUPPORTED_METHODS,
        SessionError::Expired => codes::SESSION_EXPIRED,
        SessionError::UnknownTopic(_) | SessionError::NoActiveSession => codes::INVALID_PARAMS,
    };
    ErrorObject::new(code, error.to_string())
}

async fn run_pump<T: RelayTransport, B: KeychainBackend + 'static>(
    inner: Arc<Inner<T, B>>,
    mut events: Subscription<ChannelEvent>,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(inner.options.expiry_check_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => inner.handle_channel_event(event).await,
                None => break,
            },
            _ = tick.tick() => inner.check_expiry().await,
        }
    }
    events.cancel();
    tracing::debug!("Connection pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{MemoryRelay, MemoryRelayHub};
    use crate::storage::MemoryKeychain;
    use std::time::Duration;

    fn manager(hub: &MemoryRelayHub) -> ConnectionManager<MemoryRelay, Arc<MemoryKeychain>> {
        let keychain = KeychainManager::new(Arc::new(MemoryKeychain::new()));
        ConnectionManager::new(Arc::new(hub.connect()), keychain, ClientOptions::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_starts_disconnected() {
        let hub = MemoryRelayHub::new();
        let manager = manager(&hub);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.session().await.is_none());
        assert!(manager.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_client_id_is_stable() {
        let hub = MemoryRelayHub::new();
        let manager = manager(&hub);
        assert_eq!(manager.client_id().unwrap(), manager.client_id().unwrap());
    }

    #[tokio::test]
    async fn test_reset_identity_changes_client_id() {
        let hub = MemoryRelayHub::new();
        let manager = manager(&hub);
        let before = manager.client_id().unwrap();

        let after = manager.reset_identity().await.unwrap();
        assert_ne!(before, after);
        assert_eq!(manager.client_id().unwrap(), after);
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_noop() {
        let hub = MemoryRelayHub::new();
        let manager = manager(&hub);
        let mut events = manager.subscribe();

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_without_session() {
        let hub = MemoryRelayHub::new();
        let manager = manager(&hub);

        let result = manager
            .dispatch("personal_sign", serde_json::json!([]), "eip155:1")
            .await;
        assert!(matches!(result, Err(RpcError::MethodNotAllowed { .. })));
    }

    #[tokio::test]
    async fn test_connect_timeout_returns_to_disconnected() {
        let hub = MemoryRelayHub::new();
        let keychain = KeychainManager::new(Arc::new(MemoryKeychain::new()));
        let options = ClientOptions::default().channel(
            crate::pairing::ChannelConfig::default().connect_timeout(Duration::from_millis(50)),
        );
        let manager =
            ConnectionManager::new(Arc::new(hub.connect()), keychain, options).unwrap();
        let mut events = manager.subscribe();

        let result = manager.connect().await;
        assert!(matches!(result, Err(ConnectError::Timeout)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let mut states = Vec::new();
        while let Some(event) = events.try_recv() {
            if let ConnectionEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );
    }

    #[test]
    fn test_error_object_codes() {
        assert_eq!(error_object(&SessionError::Expired).code, codes::SESSION_EXPIRED);
        assert_eq!(
            error_object(&SessionError::NamespaceMismatch("x".into())).code,
            codes::UNSUPPORTED_METHODS
        );
        assert_eq!(
            error_object(&SessionError::NoActiveSession).code,
            codes::INVALID_PARAMS
        );
    }
}
