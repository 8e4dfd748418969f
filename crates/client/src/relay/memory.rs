//! In-process relay with mailbox semantics.
//!
//! [`MemoryRelayHub`] plays the relay server; each [`MemoryRelay`] is one
//! party's connection to it. Frames are stored per topic so a party that
//! subscribes late, or comes back after going offline and re-subscribing,
//! still receives what it missed. Connectivity loss and duplicate delivery
//! can be simulated per connection.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use protocol::{ClientId, RelayAuth, Topic};
use tokio::sync::broadcast;

use super::{RelayEvent, RelayTransport, RELAY_EVENT_BUFFER_SIZE};
use crate::error::TransportError;

/// Frames kept per topic for late subscribers.
pub const MAILBOX_CAPACITY: usize = 1024;

struct StoredMessage {
    sender: u64,
    payload: Vec<u8>,
    delivered: HashSet<u64>,
}

#[derive(Default)]
struct Mailbox {
    messages: VecDeque<StoredMessage>,
}

struct Connection {
    online: AtomicBool,
    duplicate_delivery: AtomicBool,
    reject_publish: AtomicBool,
    authenticated: Mutex<Option<ClientId>>,
    subscriptions: Mutex<HashSet<Topic>>,
    published: AtomicU64,
    events: broadcast::Sender<RelayEvent>,
}

impl Connection {
    fn new() -> Self {
        let (events, _) = broadcast::channel(RELAY_EVENT_BUFFER_SIZE);
        Self {
            online: AtomicBool::new(true),
            duplicate_delivery: AtomicBool::new(false),
            reject_publish: AtomicBool::new(false),
            authenticated: Mutex::new(None),
            subscriptions: Mutex::new(HashSet::new()),
            published: AtomicU64::new(0),
            events,
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashSet<Topic>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn authenticated(&self) -> MutexGuard<'_, Option<ClientId>> {
        self.authenticated.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_listening(&self, topic: &Topic) -> bool {
        self.online.load(Ordering::SeqCst) && self.subscriptions().contains(topic)
    }

    fn push(&self, topic: &Topic, payload: &[u8]) {
        let copies = if self.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        for _ in 0..copies {
            // No receivers just means nobody is listening right now.
            let _ = self.events.send(RelayEvent::Message {
                topic: topic.clone(),
                payload: payload.to_vec(),
            });
        }
    }

    fn check_ready(&self) -> Result<(), TransportError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(TransportError::Offline);
        }
        if self.authenticated().is_none() {
            return Err(TransportError::Unauthorized);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Hub {
    mailboxes: DashMap<Topic, Mailbox>,
    connections: DashMap<u64, Arc<Connection>>,
    next_connection: AtomicU64,
}

/// The relay server side, shared by every connection.
#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    hub: Arc<Hub>,
}

impl MemoryRelayHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the hub.
    pub fn connect(&self) -> MemoryRelay {
        let id = self.hub.next_connection.fetch_add(1, Ordering::SeqCst);
        let connection = Arc::new(Connection::new());
        self.hub.connections.insert(id, connection.clone());
        MemoryRelay {
            hub: self.hub.clone(),
            id,
            connection,
        }
    }

    /// Number of frames stored for `topic`.
    pub fn stored_count(&self, topic: &Topic) -> usize {
        self.hub
            .mailboxes
            .get(topic)
            .map(|m| m.messages.len())
            .unwrap_or(0)
    }
}

/// One party's connection to a [`MemoryRelayHub`].
pub struct MemoryRelay {
    hub: Arc<Hub>,
    id: u64,
    connection: Arc<Connection>,
}

impl MemoryRelay {
    /// Simulate losing or regaining the connection.
    ///
    /// Going offline drops authentication and all subscriptions, as a real
    /// relay does when the socket closes.
    pub fn set_online(&self, online: bool) {
        let was = self.connection.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        if !online {
            self.connection.authenticated().take();
            self.connection.subscriptions().clear();
        }
        tracing::debug!(connection = self.id, online, "Relay connectivity changed");
        let _ = self.connection.events.send(RelayEvent::Connectivity { online });
    }

    /// Deliver every incoming frame twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.connection
            .duplicate_delivery
            .store(enabled, Ordering::SeqCst);
    }

    /// Make the relay refuse publishes from this connection.
    pub fn set_reject_publish(&self, enabled: bool) {
        self.connection.reject_publish.store(enabled, Ordering::SeqCst);
    }

    /// Number of frames this connection has published.
    pub fn publish_count(&self) -> u64 {
        self.connection.published.load(Ordering::SeqCst)
    }

    /// The client id this connection authenticated as.
    pub fn client_id(&self) -> Option<ClientId> {
        self.connection.authenticated().clone()
    }

    /// Whether this connection is subscribed to `topic`.
    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        self.connection.subscriptions().contains(topic)
    }

    fn deliver_backlog(&self, topic: &Topic) {
        if let Some(mut mailbox) = self.hub.mailboxes.get_mut(topic) {
            for message in mailbox.messages.iter_mut() {
                if message.sender != self.id && message.delivered.insert(self.id) {
                    self.connection.push(topic, &message.payload);
                }
            }
        }
    }
}

impl Drop for MemoryRelay {
    fn drop(&mut self) {
        self.hub.connections.remove(&self.id);
    }
}

impl RelayTransport for MemoryRelay {
    async fn authenticate(&self, auth: RelayAuth) -> Result<(), TransportError> {
        if !self.connection.online.load(Ordering::SeqCst) {
            return Err(TransportError::Offline);
        }
        let peer = auth.verify(crate::current_timestamp()).map_err(|e| {
            tracing::warn!(connection = self.id, error = %e, "Relay credential refused");
            TransportError::Unauthorized
        })?;
        *self.connection.authenticated() = Some(peer.client_id().clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        self.connection.check_ready()?;
        self.connection.subscriptions().insert(topic.clone());
        self.deliver_backlog(topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<(), TransportError> {
        self.connection.check_ready()?;
        if self.connection.subscriptions().remove(topic) {
            Ok(())
        } else {
            Err(TransportError::NotSubscribed(topic.to_string()))
        }
    }

    async fn publish(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), TransportError> {
        self.connection.check_ready()?;
        if self.connection.reject_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected("publish refused".into()));
        }
        self.connection.published.fetch_add(1, Ordering::SeqCst);

        let mut mailbox = self.hub.mailboxes.entry(topic.clone()).or_default();
        let mut delivered = HashSet::new();
        for entry in self.hub.connections.iter() {
            if *entry.key() != self.id && entry.value().is_listening(topic) {
                entry.value().push(topic, &payload);
                delivered.insert(*entry.key());
            }
        }

        mailbox.messages.push_back(StoredMessage {
            sender: self.id,
            payload,
            delivered,
        });
        while mailbox.messages.len() > MAILBOX_CAPACITY {
            mailbox.messages.pop_front();
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.connection.events.subscribe()
    }

    fn is_online(&self) -> bool {
        self.connection.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::ClientIdentity;

    async fn authed(hub: &MemoryRelayHub) -> MemoryRelay {
        let relay = hub.connect();
        let identity = ClientIdentity::generate();
        relay
            .authenticate(identity.relay_auth(crate::current_timestamp(), 300))
            .await
            .unwrap();
        relay
    }

    fn topic() -> Topic {
        Topic::new("11".repeat(32))
    }

    #[tokio::test]
    async fn test_requires_authentication() {
        let hub = MemoryRelayHub::new();
        let relay = hub.connect();

        assert_eq!(
            relay.subscribe(&topic()).await,
            Err(TransportError::Unauthorized)
        );
        assert_eq!(
            relay.publish(&topic(), vec![1]).await,
            Err(TransportError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn test_rejects_expired_credential() {
        let hub = MemoryRelayHub::new();
        let relay = hub.connect();
        let auth = ClientIdentity::generate().relay_auth(1_000, 60);

        assert_eq!(
            relay.authenticate(auth).await,
            Err(TransportError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_other_subscribers_only() {
        let hub = MemoryRelayHub::new();
        let a = authed(&hub).await;
        let b = authed(&hub).await;
        a.subscribe(&topic()).await.unwrap();
        b.subscribe(&topic()).await.unwrap();

        let mut a_events = a.events();
        let mut b_events = b.events();
        a.publish(&topic(), b"hello".to_vec()).await.unwrap();

        assert_eq!(
            b_events.recv().await.unwrap(),
            RelayEvent::Message {
                topic: topic(),
                payload: b"hello".to_vec()
            }
        );
        assert!(a_events.try_recv().is_err());
        assert_eq!(a.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_late_subscriber_receives_backlog() {
        let hub = MemoryRelayHub::new();
        let a = authed(&hub).await;
        let b = authed(&hub).await;

        a.publish(&topic(), b"early".to_vec()).await.unwrap();
        assert_eq!(hub.stored_count(&topic()), 1);

        let mut events = b.events();
        b.subscribe(&topic()).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            RelayEvent::Message { payload, .. } if payload == b"early"
        ));

        // Re-subscribing does not replay what was already delivered.
        b.unsubscribe(&topic()).await.unwrap();
        b.subscribe(&topic()).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_drops_session_state() {
        let hub = MemoryRelayHub::new();
        let a = authed(&hub).await;
        let b = authed(&hub).await;
        b.subscribe(&topic()).await.unwrap();

        let mut events = b.events();
        b.set_online(false);
        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::Connectivity { online: false }
        );
        assert!(!b.is_online());
        assert!(!b.is_subscribed(&topic()));
        assert_eq!(
            b.publish(&topic(), vec![0]).await,
            Err(TransportError::Offline)
        );

        a.publish(&topic(), b"missed".to_vec()).await.unwrap();

        b.set_online(true);
        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::Connectivity { online: true }
        );
        assert_eq!(
            b.subscribe(&topic()).await,
            Err(TransportError::Unauthorized)
        );

        b.authenticate(ClientIdentity::generate().relay_auth(crate::current_timestamp(), 60))
            .await
            .unwrap();
        b.subscribe(&topic()).await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            RelayEvent::Message { payload, .. } if payload == b"missed"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let hub = MemoryRelayHub::new();
        let a = authed(&hub).await;
        let b = authed(&hub).await;
        b.subscribe(&topic()).await.unwrap();
        b.set_duplicate_delivery(true);

        let mut events = b.events();
        a.publish(&topic(), b"twice".to_vec()).await.unwrap();

        assert!(events.recv().await.is_ok());
        assert!(events.recv().await.is_ok());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_publish() {
        let hub = MemoryRelayHub::new();
        let a = authed(&hub).await;
        a.set_reject_publish(true);

        assert!(matches!(
            a.publish(&topic(), vec![1]).await,
            Err(TransportError::Rejected(_))
        ));
        assert_eq!(a.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_topic() {
        let hub = MemoryRelayHub::new();
        let a = authed(&hub).await;
        assert!(matches!(
            a.unsubscribe(&topic()).await,
            Err(TransportError::NotSubscribed(_))
        ));
    }
}
