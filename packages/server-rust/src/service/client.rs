//! Callers of internal and external services.
//!
//! A request waits for its reply up to the timeout; a timeout (and only a
//! timeout) is retried once with the identical request, so a caller waits at
//! most twice the timeout.

use std::sync::Arc;
use std::time::Duration;

use buskit_core::{ExternalRequest, ExternalResponse, InternalRequest, InternalResponse};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::connection::ConnectionManager;
use crate::bus::transport::BusError;

/// Sends `value` to `subject` and decodes the reply, retrying once on timeout.
async fn request_with_retry<T, R>(
    connection: &ConnectionManager,
    subject: &str,
    value: &T,
    timeout: Duration,
) -> Result<R, BusError>
where
    T: Serialize + Sync,
    R: DeserializeOwned,
{
    let encoded = connection.encoded()?;
    encoded.flush().await?;

    match encoded.request(subject, value, timeout).await {
        Err(err) if err.is_timeout() => {
            warn!(subject, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "request timed out, retrying once");
            connection.encoded()?.request(subject, value, timeout).await
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// InternalClient
// ---------------------------------------------------------------------------

/// Caller of `{service}.internal` functions.
#[derive(Clone)]
pub struct InternalClient {
    connection: Arc<ConnectionManager>,
    timeout: Duration,
}

impl InternalClient {
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, timeout: Duration) -> Self {
        Self { connection, timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fire-and-forget call; no reply is awaited.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the request cannot be published.
    pub async fn publish(&self, request: &InternalRequest) -> Result<(), BusError> {
        debug!(
            service = %request.service,
            function = %request.function,
            request_id = %request.request_id,
            "publishing internal request without reply"
        );
        self.connection
            .encoded()?
            .publish(&request.subject(), request)
            .await
    }

    /// Calls a function and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Timeout` if neither attempt got a reply, or any
    /// other transport or codec error. Handler failures are not errors here:
    /// they arrive in the response's `error` field.
    pub async fn request_reply(&self, request: &InternalRequest) -> Result<InternalResponse, BusError> {
        self.request_reply_with_timeout(request, self.timeout).await
    }

    /// [`request_reply`](Self::request_reply) with an explicit per-attempt timeout.
    ///
    /// # Errors
    ///
    /// As for [`request_reply`](Self::request_reply).
    pub async fn request_reply_with_timeout(
        &self,
        request: &InternalRequest,
        timeout: Duration,
    ) -> Result<InternalResponse, BusError> {
        let result = request_with_retry(&self.connection, &request.subject(), request, timeout).await;
        if let Err(err) = &result {
            info!(
                error = %err,
                service = %request.service,
                function = %request.function,
                request_id = %request.request_id,
                "internal request failed"
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// ExternalClient
// ---------------------------------------------------------------------------

/// Caller of `{service}.external` routes, as used by the gateway.
#[derive(Clone)]
pub struct ExternalClient {
    connection: Arc<ConnectionManager>,
    timeout: Duration,
}

impl ExternalClient {
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, timeout: Duration) -> Self {
        Self { connection, timeout }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Forwards `request` and waits for the HTTP-shaped reply.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Timeout` if neither attempt got a reply, or any
    /// other transport or codec error.
    pub async fn request_reply(&self, request: &ExternalRequest) -> Result<ExternalResponse, BusError> {
        let result = request_with_retry(&self.connection, &request.subject(), request, self.timeout).await;
        if let Err(err) = &result {
            info!(
                error = %err,
                request_id = %request.request_id,
                request_ip = %request.client_ip,
                request_method = %request.method,
                "external request failed"
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
