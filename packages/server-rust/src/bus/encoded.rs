//! JSON-encoding wrapper around a bare transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::transport::{BusError, Message, PendingLimits, Subscription, Transport};

/// Typed view of a transport: values in, values out, JSON on the wire.
pub struct JsonConnection {
    transport: Arc<dyn Transport>,
}

impl JsonConnection {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// The bare transport this wrapper encodes for.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Encodes `value` and publishes it to `subject`.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Codec` if encoding fails, or the transport error.
    pub async fn publish<T>(&self, subject: &str, value: &T) -> Result<(), BusError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        self.transport.publish(subject, payload).await
    }

    /// Encodes `value`, waits for one reply and decodes it.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Timeout` when no reply arrives in time,
    /// `BusError::Codec` when either side fails to (de)serialize, or the
    /// transport error.
    pub async fn request<T, R>(
        &self,
        subject: &str,
        value: &T,
        timeout: Duration,
    ) -> Result<R, BusError>
    where
        T: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let payload = Bytes::from(serde_json::to_vec(value)?);
        let reply: Message = self.transport.request(subject, payload, timeout).await?;
        Ok(serde_json::from_slice(&reply.payload)?)
    }

    /// # Errors
    ///
    /// Returns the transport error if the subscription cannot be created.
    pub async fn subscribe(
        &self,
        subject: &str,
        queue: Option<&str>,
        limits: PendingLimits,
    ) -> Result<Subscription, BusError> {
        self.transport.subscribe(subject, queue, limits).await
    }

    /// # Errors
    ///
    /// Returns the transport error if the flush fails.
    pub async fn flush(&self) -> Result<(), BusError> {
        self.transport.flush().await
    }
}
