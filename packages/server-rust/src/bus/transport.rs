//! Transport seam: the publish/subscribe primitives the runtime needs from a bus client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

/// A message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    /// Subject the sender listens on for a reply, if it expects one.
    pub reply: Option<String>,
    pub payload: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Payload as lossy UTF-8, for logs and error reports.
    #[must_use]
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Per-subscription backlog bounds. Messages beyond either bound are dropped
/// by the transport (slow consumer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLimits {
    pub messages: usize,
    pub bytes: usize,
}

impl PendingLimits {
    /// Transport defaults for a single subscription.
    pub const DEFAULT: PendingLimits = PendingLimits {
        messages: 65_536,
        bytes: 64 * 1024 * 1024,
    };

    #[must_use]
    pub fn scaled(self, factor: usize) -> Self {
        Self {
            messages: self.messages.saturating_mul(factor),
            bytes: self.bytes.saturating_mul(factor),
        }
    }
}

impl Default for PendingLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Connection lifecycle notifications emitted by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// The link to the server dropped; the transport is trying to recover.
    Disconnected,
    /// The link is back. Subscriptions made before the drop are gone.
    Reconnected,
    /// The transport was closed and will not recover.
    Closed,
}

/// Errors surfaced by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection is not established")]
    NotConnected,
    #[error("bus: timeout")]
    Timeout,
    #[error("bus connection closed")]
    Closed,
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

impl BusError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout)
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    rx: mpsc::Receiver<Message>,
    pending_bytes: Arc<AtomicUsize>,
}

impl Subscription {
    /// Wraps a receiver fed by the transport. `pending_bytes` is shared with
    /// the sending side and is decremented as messages are taken.
    #[must_use]
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::Receiver<Message>,
        pending_bytes: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            pending_bytes,
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next delivered message, or `None` once the transport dropped the subscription.
    pub async fn next(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await?;
        self.pending_bytes
            .fetch_sub(msg.payload.len(), Ordering::Relaxed);
        Some(msg)
    }
}

/// Bus client primitives. Implementations own their wire protocol and
/// reconnection algorithm; the runtime only relies on this surface.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Publish carrying a reply subject.
    async fn publish_request(&self, subject: &str, reply: &str, payload: Bytes)
        -> Result<(), BusError>;

    /// Subscribe to `subject`. With a queue group, each message goes to exactly
    /// one member of the group; without one, every subscriber receives it.
    async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
        limits: PendingLimits,
    ) -> Result<Subscription, BusError>;

    /// Publish and wait for the first reply, up to `timeout`.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration)
        -> Result<Message, BusError>;

    /// Wait until everything published so far has reached the server.
    async fn flush(&self) -> Result<(), BusError>;

    /// Non-blocking liveness probe.
    fn is_connected(&self) -> bool;

    /// Close the link. Subsequent operations fail with `BusError::Closed`.
    async fn close(&self);

    /// Lifecycle notifications (reconnects in particular).
    fn events(&self) -> broadcast::Receiver<BusEvent>;
}

/// Establishes transports. One attempt per call; retry policy lives in the caller.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, urls: &[String], name: &str) -> Result<Arc<dyn Transport>, BusError>;
}
