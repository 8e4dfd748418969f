//! Request dispatcher.
//!
//! Every outgoing wallet request gets a fresh correlation id and an entry in
//! the pending table. The entry is removed exactly once, by whichever comes
//! first: the matching response, the deadline, a cancel, or a disconnect.
//! Anything arriving for an id that is no longer pending is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use protocol::messages::{methods, RequestPayload, SessionRequest};
use protocol::{Frame, RpcRequest, RpcResponse};
use serde_json::Value;
use tokio::sync::oneshot;

use super::next_request_id;
use crate::error::RpcError;
use crate::pairing::FrameSender;
use crate::session::SessionRegistry;

/// Default time a request may stay unanswered.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

type Resolver = oneshot::Sender<Result<Value, RpcError>>;

struct PendingEntry {
    method: String,
    chain_id: String,
    created_at: Instant,
    deadline: Instant,
    tx: Resolver,
}

type PendingTable = Arc<DashMap<u64, PendingEntry>>;

/// Snapshot of one outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    /// Correlation id.
    pub id: u64,
    /// Wallet method.
    pub method: String,
    /// Chain the request targets.
    pub chain_id: String,
    /// Time since the request was sent.
    pub age: Duration,
}

/// A sent request waiting for its outcome.
///
/// Dropping the call without waiting removes its pending entry.
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
    pending: PendingTable,
    deadline: Instant,
}

impl PendingCall {
    /// Correlation id of the request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the outcome.
    pub async fn wait(mut self) -> Result<Value, RpcError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => {
                if self.pending.remove(&self.id).is_some() {
                    tracing::debug!(id = self.id, "Request timed out");
                    return Err(RpcError::Timeout);
                }
                // Resolved by someone else right at the deadline.
                self.rx.try_recv().unwrap_or(Err(RpcError::Timeout))
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Correlates wallet requests with their responses.
pub struct RequestDispatcher<S: FrameSender> {
    sender: Arc<S>,
    registry: Arc<SessionRegistry>,
    pending: PendingTable,
    open: AtomicBool,
    request_timeout: Duration,
}

impl<S: FrameSender> RequestDispatcher<S> {
    /// Creates a dispatcher. It starts closed; call [`reopen`](Self::reopen)
    /// once a session is established.
    pub fn new(sender: Arc<S>, registry: Arc<SessionRegistry>, request_timeout: Duration) -> Self {
        Self {
            sender,
            registry,
            pending: Arc::new(DashMap::new()),
            open: AtomicBool::new(false),
            request_timeout,
        }
    }

    /// Per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Whether requests are currently accepted.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Sends `method` to the wallet and waits for the result.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Value,
        chain_id: &str,
    ) -> Result<Value, RpcError> {
        self.start(method, params, chain_id).await?.wait().await
    }

    /// Sends `method` to the wallet and returns a handle to its outcome.
    ///
    /// Fails before anything is sent when no session permits `method` on
    /// `chain_id`, or when the dispatcher is closed.
    pub async fn start(
        &self,
        method: &str,
        params: Value,
        chain_id: &str,
    ) -> Result<PendingCall, RpcError> {
        let session = self
            .registry
            .active_session()
            .await
            .filter(|session| session.permits(chain_id, method));
        let Some(session) = session else {
            tracing::debug!(method, chain = chain_id, "Method not permitted by session");
            return Err(RpcError::MethodNotAllowed {
                method: method.to_string(),
                chain: chain_id.to_string(),
            });
        };
        if !self.is_open() {
            return Err(RpcError::Disconnected);
        }

        let id = next_request_id();
        let request = SessionRequest {
            chain_id: chain_id.to_string(),
            request: RequestPayload {
                method: method.to_string(),
                params,
            },
        };
        let frame = Frame::Request(RpcRequest::new(id, methods::SESSION_REQUEST, &request)?);

        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + self.request_timeout;
        self.pending.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                chain_id: chain_id.to_string(),
                created_at,
                deadline,
                tx,
            },
        );

        // close() may have drained the table between the gate check and the insert.
        if !self.is_open() {
            self.pending.remove(&id);
            return Err(RpcError::Disconnected);
        }

        if let Err(e) = self.sender.send_frame(&session.topic, &frame).await {
            self.pending.remove(&id);
            tracing::warn!(id, method, error = %e, "Request send failed");
            return Err(RpcError::Transport(e));
        }

        tracing::debug!(id, method, chain = chain_id, "Request sent");
        Ok(PendingCall {
            id,
            rx,
            pending: self.pending.clone(),
            deadline,
        })
    }

    /// Resolves the request `response` answers.
    ///
    /// Returns `false` when no such request is pending, which covers
    /// duplicates, late answers after a timeout, and unsolicited ids.
    pub fn handle_response(&self, response: RpcResponse) -> bool {
        let id = response.id;
        let Some((_, entry)) = self.pending.remove(&id) else {
            tracing::debug!(id, "Discarding response for unknown or resolved request");
            return false;
        };

        let outcome = response.into_outcome().map_err(|error| RpcError::Remote {
            code: error.code,
            message: error.message,
        });
        tracing::debug!(
            id,
            method = %entry.method,
            ok = outcome.is_ok(),
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "Request resolved"
        );
        let _ = entry.tx.send(outcome);
        true
    }

    /// Cancels the request `id`.
    ///
    /// The wallet may still act on it; only local delivery is prevented.
    pub fn cancel(&self, id: u64) -> bool {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                tracing::debug!(id, method = %entry.method, "Request cancelled");
                let _ = entry.tx.send(Err(RpcError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Stops accepting requests and fails everything outstanding with
    /// [`RpcError::Disconnected`].
    pub fn close(&self) -> usize {
        self.open.store(false, Ordering::SeqCst);
        self.fail_all(RpcError::Disconnected)
    }

    /// Starts accepting requests again.
    pub fn reopen(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Resolves every outstanding request with `error`.
    pub fn fail_all(&self, error: RpcError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::info!(failed, error = %error, "Failed outstanding requests");
        }
        failed
    }

    /// Resolves requests whose deadline passed with [`RpcError::Timeout`].
    ///
    /// Callers waiting on [`PendingCall::wait`] time out on their own; this
    /// covers handles that are held but not polled.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<u64> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for id in overdue {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.tx.send(Err(RpcError::Timeout));
                expired += 1;
            }
        }
        expired
    }

    /// Number of outstanding requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Ids of outstanding requests, ascending.
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of outstanding requests, oldest first.
    pub fn pending_requests(&self) -> Vec<PendingInfo> {
        let mut requests: Vec<PendingInfo> = self
            .pending
            .iter()
            .map(|entry| PendingInfo {
                id: *entry.key(),
                method: entry.method.clone(),
                chain_id: entry.chain_id.clone(),
                age: entry.created_at.elapsed(),
            })
            .collect();
        requests.sort_by(|a, b| b.age.cmp(&a.age));
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::current_timestamp;
    use crate::error::TransportError;
    use crate::pairing::Pairing;
    use protocol::messages::{Participant, SessionApproval};
    use protocol::{ErrorObject, Metadata, Namespace, Namespaces, ProposalNamespace, ProposalNamespaces, SymKey, Topic};
    use std::sync::Mutex;

    /// Records every frame instead of sending it.
    #[derive(Default)]
    struct RecordingSender {
        frames: Mutex<Vec<(Topic, Frame)>>,
        fail: AtomicBool,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<(Topic, Frame)> {
            self.frames.lock().unwrap().clone()
        }

        fn last_request(&self) -> (RpcRequest, SessionRequest) {
            let frames = self.sent();
            match frames.last() {
                Some((_, Frame::Request(request))) => {
                    let params = request.params_as::<SessionRequest>().unwrap();
                    (request.clone(), params)
                }
                other => panic!("no request sent: {:?}", other),
            }
        }
    }

    impl FrameSender for RecordingSender {
        async fn send_frame(&self, topic: &Topic, frame: &Frame) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Offline);
            }
            self.frames
                .lock()
                .unwrap()
                .push((topic.clone(), frame.clone()));
            Ok(())
        }
    }

    async fn setup(
        timeout: Duration,
    ) -> (
        RequestDispatcher<RecordingSender>,
        Arc<RecordingSender>,
        Topic,
    ) {
        let sender = Arc::new(RecordingSender::default());
        let registry = Arc::new(SessionRegistry::new());

        let methods: std::collections::BTreeSet<String> = ["personal_sign", "eth_sendTransaction"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut proposed = ProposalNamespaces::new();
        proposed.insert(
            "eip155".into(),
            ProposalNamespace {
                chains: vec!["eip155:1".into()],
                methods: methods.clone(),
                events: Default::default(),
            },
        );
        let mut namespaces = Namespaces::new();
        namespaces.insert(
            "eip155".into(),
            Namespace {
                accounts: vec!["eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb".into()],
                methods,
                ..Default::default()
            },
        );

        let key = SymKey::generate();
        let pairing = Pairing {
            topic: key.topic(),
            sym_key: key,
            expiry: current_timestamp() + 3600,
            active: true,
        };
        let approval = SessionApproval {
            responder: Participant {
                public_key: "00".repeat(32),
                metadata: Metadata::default(),
            },
            namespaces,
            expiry: current_timestamp() + 3600,
        };
        registry
            .apply_proposal_result(&pairing, &proposed, &ProposalNamespaces::new(), &approval)
            .await
            .unwrap();

        let dispatcher = RequestDispatcher::new(sender.clone(), registry, timeout);
        dispatcher.reopen();
        (dispatcher, sender, pairing.topic)
    }

    fn params() -> Value {
        serde_json::json!(["0x68656c6c6f", "0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb"])
    }

    #[tokio::test]
    async fn test_dispatch_sends_one_correlated_frame() {
        let (dispatcher, sender, topic) = setup(Duration::from_secs(5)).await;

        let call = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();
        let (request, payload) = sender.last_request();
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(sender.sent()[0].0, topic);
        assert_eq!(request.id, call.id());
        assert_eq!(request.method, methods::SESSION_REQUEST);
        assert_eq!(payload.chain_id, "eip155:1");
        assert_eq!(payload.request.method, "personal_sign");
        assert_eq!(payload.request.params, params());

        assert!(dispatcher.handle_response(RpcResponse::success(call.id(), "0xSIGNATURE").unwrap()));
        assert_eq!(call.wait().await, Ok(Value::String("0xSIGNATURE".into())));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_method_not_allowed_sends_nothing() {
        let (dispatcher, sender, _) = setup(Duration::from_secs(5)).await;

        let result = dispatcher.dispatch("eth_sign", params(), "eip155:1").await;
        assert_eq!(
            result,
            Err(RpcError::MethodNotAllowed {
                method: "eth_sign".into(),
                chain: "eip155:1".into(),
            })
        );

        let result = dispatcher
            .dispatch("personal_sign", params(), "eip155:137")
            .await;
        assert!(matches!(result, Err(RpcError::MethodNotAllowed { .. })));
        assert!(sender.sent().is_empty());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_session_is_method_not_allowed() {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = RequestDispatcher::new(
            sender.clone(),
            Arc::new(SessionRegistry::new()),
            Duration::from_secs(1),
        );
        dispatcher.reopen();

        let result = dispatcher
            .dispatch("personal_sign", params(), "eip155:1")
            .await;
        assert!(matches!(result, Err(RpcError::MethodNotAllowed { .. })));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_closed_dispatcher_is_disconnected() {
        let (dispatcher, sender, _) = setup(Duration::from_secs(5)).await;
        dispatcher.close();

        let result = dispatcher
            .dispatch("personal_sign", params(), "eip155:1")
            .await;
        assert_eq!(result, Err(RpcError::Disconnected));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_responses_match_by_id_in_any_order() {
        let (dispatcher, _, _) = setup(Duration::from_secs(5)).await;

        let first = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();
        let second = dispatcher
            .start("eth_sendTransaction", serde_json::json!([{}]), "eip155:1")
            .await
            .unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(dispatcher.pending_count(), 2);

        dispatcher.handle_response(RpcResponse::success(second.id(), "0xTX").unwrap());
        dispatcher.handle_response(RpcResponse::success(first.id(), "0xSIG").unwrap());

        assert_eq!(first.wait().await, Ok(Value::String("0xSIG".into())));
        assert_eq!(second.wait().await, Ok(Value::String("0xTX".into())));
    }

    #[tokio::test]
    async fn test_duplicate_response_is_noop() {
        let (dispatcher, _, _) = setup(Duration::from_secs(5)).await;
        let call = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();
        let id = call.id();

        assert!(dispatcher.handle_response(RpcResponse::success(id, "0xA").unwrap()));
        assert!(!dispatcher.handle_response(RpcResponse::success(id, "0xB").unwrap()));
        assert_eq!(call.wait().await, Ok(Value::String("0xA".into())));
    }

    #[tokio::test]
    async fn test_remote_error_passes_through() {
        let (dispatcher, _, _) = setup(Duration::from_secs(5)).await;
        let call = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();

        dispatcher.handle_response(RpcResponse::failure(
            call.id(),
            ErrorObject::new(5000, "User rejected."),
        ));
        assert_eq!(
            call.wait().await,
            Err(RpcError::Remote {
                code: 5000,
                message: "User rejected.".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_discarded() {
        let (dispatcher, _, _) = setup(Duration::from_millis(50)).await;
        let call = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();
        let id = call.id();

        assert_eq!(call.wait().await, Err(RpcError::Timeout));
        assert_eq!(dispatcher.pending_count(), 0);
        assert!(!dispatcher.handle_response(RpcResponse::success(id, "0xLATE").unwrap()));
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_with_disconnected() {
        let (dispatcher, _, _) = setup(Duration::from_secs(5)).await;
        let first = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();
        let second = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();

        assert_eq!(dispatcher.close(), 2);
        assert_eq!(first.wait().await, Err(RpcError::Disconnected));
        assert_eq!(second.wait().await, Err(RpcError::Disconnected));
        assert!(!dispatcher.is_open());
    }

    #[tokio::test]
    async fn test_cancel() {
        let (dispatcher, _, _) = setup(Duration::from_secs(5)).await;
        let call = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();
        let id = call.id();

        assert!(dispatcher.cancel(id));
        assert!(!dispatcher.cancel(id));
        assert_eq!(call.wait().await, Err(RpcError::Cancelled));
        assert!(!dispatcher.handle_response(RpcResponse::success(id, "0xA").unwrap()));
    }

    #[tokio::test]
    async fn test_dropped_call_removes_entry() {
        let (dispatcher, _, _) = setup(Duration::from_secs(5)).await;
        let call = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();
        assert_eq!(dispatcher.pending_ids(), vec![call.id()]);

        drop(call);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_is_transport_error() {
        let (dispatcher, sender, _) = setup(Duration::from_secs(5)).await;
        sender.fail.store(true, Ordering::SeqCst);

        let result = dispatcher
            .dispatch("personal_sign", params(), "eip155:1")
            .await;
        assert_eq!(result, Err(RpcError::Transport(TransportError::Offline)));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let (dispatcher, _, _) = setup(Duration::from_millis(20)).await;
        let call = dispatcher
            .start("personal_sign", params(), "eip155:1")
            .await
            .unwrap();
        let info = dispatcher.pending_requests();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].method, "personal_sign");
        assert_eq!(info[0].chain_id, "eip155:1");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(dispatcher.expire_overdue(), 1);
        assert_eq!(call.wait().await, Err(RpcError::Timeout));
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_resolves_each_once() {
        let (dispatcher, sender, _) = setup(Duration::from_secs(5)).await;
        let dispatcher = Arc::new(dispatcher);

        let mut calls = Vec::new();
        for _ in 0..16 {
            calls.push(
                dispatcher
                    .start("personal_sign", params(), "eip155:1")
                    .await
                    .unwrap(),
            );
        }

        for (_, frame) in sender.sent().into_iter().rev() {
            let id = frame.id();
            let response = RpcResponse::success(id, format!("sig-{id}")).unwrap();
            dispatcher.handle_response(response.clone());
            dispatcher.handle_response(response);
        }

        for call in calls {
            let id = call.id();
            assert_eq!(call.wait().await, Ok(Value::String(format!("sig-{id}"))));
        }
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
