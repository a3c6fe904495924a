//! In-process bus: exact-subject routing, queue groups, pending limits and
//! request/reply over unique inbox subjects.
//!
//! A single [`MemoryBus`] plays the server; each [`MemoryTransport`] is one
//! client connection to it, so several services can share a process in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::transport::{
    BusError, BusEvent, Connector, Message, PendingLimits, Subscription, Transport,
};

/// Prefix of the per-request reply subjects.
pub const INBOX_PREFIX: &str = "_INBOX.";

const EVENT_CHANNEL_CAPACITY: usize = 16;

struct SubEntry {
    client_id: u64,
    queue: Option<String>,
    tx: mpsc::Sender<Message>,
    pending_bytes: Arc<AtomicUsize>,
    limits: PendingLimits,
}

impl SubEntry {
    /// Enqueue without blocking; drops the message when a pending limit is hit.
    fn offer(&self, msg: Message) -> bool {
        let size = msg.payload.len();
        let pending = self.pending_bytes.fetch_add(size, Ordering::Relaxed);
        if pending + size > self.limits.bytes {
            self.pending_bytes.fetch_sub(size, Ordering::Relaxed);
            warn!(subject = %msg.subject, pending_bytes = pending, "slow consumer, message dropped");
            return false;
        }
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                self.pending_bytes.fetch_sub(size, Ordering::Relaxed);
                warn!(subject = %msg.subject, "slow consumer, message dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.pending_bytes.fetch_sub(size, Ordering::Relaxed);
                false
            }
        }
    }
}

struct BusInner {
    subjects: DashMap<String, Vec<SubEntry>>,
    next_client_id: AtomicU64,
    online: AtomicBool,
}

/// The in-process "server". Cloning is cheap and shares state.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subjects: DashMap::new(),
                next_client_id: AtomicU64::new(1),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// While offline, new connections are refused.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Opens a client connection.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Transport` while the bus is offline.
    pub fn connect_client(&self, name: &str) -> Result<Arc<MemoryTransport>, BusError> {
        if !self.is_online() {
            return Err(BusError::Transport(
                "no servers available for connection".to_string(),
            ));
        }
        let client_id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        debug!(client_id, name, "memory bus client connected");
        Ok(Arc::new(MemoryTransport {
            bus: self.clone(),
            client_id,
            name: name.to_string(),
            connected: AtomicBool::new(true),
            events,
        }))
    }

    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { bus: self.clone() }
    }

    /// Number of live subscriptions on `subject`.
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner.subjects.get(subject).map_or(0, |subs| {
            subs.iter().filter(|s| !s.tx.is_closed()).count()
        })
    }

    fn add_subscription(&self, subject: &str, entry: SubEntry) {
        self.inner
            .subjects
            .entry(subject.to_string())
            .or_default()
            .push(entry);
    }

    /// Delivers `msg` to every plain subscriber and to one member of each
    /// queue group. Returns the number of deliveries.
    fn route(&self, msg: &Message) -> usize {
        let Some(mut subs) = self.inner.subjects.get_mut(&msg.subject) else {
            return 0;
        };
        subs.retain(|s| !s.tx.is_closed());

        let mut groups: HashMap<&str, Vec<&SubEntry>> = HashMap::new();
        let mut delivered = 0;
        for sub in subs.iter() {
            match sub.queue.as_deref() {
                Some(queue) => groups.entry(queue).or_default().push(sub),
                None => delivered += usize::from(sub.offer(msg.clone())),
            }
        }

        let mut rng = rand::rng();
        for members in groups.values() {
            let pick = rng.random_range(0..members.len());
            delivered += usize::from(members[pick].offer(msg.clone()));
        }
        delivered
    }

    fn remove_client(&self, client_id: u64) {
        for mut subs in self.inner.subjects.iter_mut() {
            subs.retain(|s| s.client_id != client_id);
        }
        self.inner.subjects.retain(|_, subs| !subs.is_empty());
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One client connection to a [`MemoryBus`].
pub struct MemoryTransport {
    bus: MemoryBus,
    client_id: u64,
    name: String,
    connected: AtomicBool,
    events: broadcast::Sender<BusEvent>,
}

impl MemoryTransport {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulates a dropped and recovered link: the server forgets this
    /// client's subscriptions, then `Disconnected` and `Reconnected` are emitted.
    pub fn simulate_reconnect(&self) {
        self.bus.remove_client(self.client_id);
        let _ = self.events.send(BusEvent::Disconnected);
        let _ = self.events.send(BusEvent::Reconnected);
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }

    fn open_subscription(
        &self,
        subject: &str,
        queue: Option<&str>,
        limits: PendingLimits,
    ) -> Subscription {
        let (tx, rx) = mpsc::channel(limits.messages.max(1));
        let pending_bytes = Arc::new(AtomicUsize::new(0));
        self.bus.add_subscription(
            subject,
            SubEntry {
                client_id: self.client_id,
                queue: queue.filter(|q| !q.is_empty()).map(str::to_string),
                tx,
                pending_bytes: pending_bytes.clone(),
                limits,
            },
        );
        Subscription::new(subject, rx, pending_bytes)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.ensure_open()?;
        self.bus.route(&Message::new(subject, payload));
        Ok(())
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.bus
            .route(&Message::new(subject, payload).with_reply(reply));
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
        limits: PendingLimits,
    ) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        Ok(self.open_subscription(subject, queue, limits))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        self.ensure_open()?;
        let inbox = format!("{INBOX_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let mut replies = self.open_subscription(
            &inbox,
            None,
            PendingLimits {
                messages: 1,
                ..PendingLimits::DEFAULT
            },
        );
        self.bus
            .route(&Message::new(subject, payload).with_reply(inbox.as_str()));

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BusError::Closed),
            Err(_elapsed) => Err(BusError::Timeout),
        }
    }

    async fn flush(&self) -> Result<(), BusError> {
        self.ensure_open()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.bus.remove_client(self.client_id);
            let _ = self.events.send(BusEvent::Closed);
            debug!(client_id = self.client_id, name = %self.name, "memory bus client closed");
        }
    }

    fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

/// [`Connector`] opening [`MemoryTransport`]s on a shared bus. URLs are ignored.
#[derive(Clone)]
pub struct MemoryConnector {
    bus: MemoryBus,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, urls: &[String], name: &str) -> Result<Arc<dyn Transport>, BusError> {
        debug!(?urls, name, "connecting to memory bus");
        let transport: Arc<dyn Transport> = self.bus.connect_client(name)?;
        Ok(transport)
    }
}
