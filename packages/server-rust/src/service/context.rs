use std::sync::Arc;

use buskit_core::ExternalResponse;

use super::client::{ExternalClient, InternalClient};
use super::config::ServiceConfig;
use super::notify::{ErrorNotifier, TracingNotifier};
use super::response::respond_error;
use crate::bus::connection::ConnectionManager;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Collaborators shared by every router and caller of a process.
#[derive(Clone)]
pub struct ServiceContext {
    pub connection: Arc<ConnectionManager>,
    pub config: Arc<ServiceConfig>,
    pub notifier: Arc<dyn ErrorNotifier>,
}

impl ServiceContext {
    /// Context that reports failures through [`TracingNotifier`].
    #[must_use]
    pub fn new(connection: Arc<ConnectionManager>, config: ServiceConfig) -> Self {
        Self {
            connection,
            config: Arc::new(config),
            notifier: Arc::new(TracingNotifier),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn ErrorNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Caller for internal services using the configured timeout.
    #[must_use]
    pub fn internal_client(&self) -> InternalClient {
        InternalClient::new(self.connection.clone(), self.config.default_timeout())
    }

    /// Caller for external services using the configured timeout.
    #[must_use]
    pub fn external_client(&self) -> ExternalClient {
        ExternalClient::new(self.connection.clone(), self.config.default_timeout())
    }
}

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// Per-invocation view handed to request handlers.
#[derive(Clone)]
pub struct HandlerContext {
    subject: Arc<str>,
    service: ServiceContext,
}

impl HandlerContext {
    #[must_use]
    pub fn new(subject: Arc<str>, service: ServiceContext) -> Self {
        Self { subject, service }
    }

    /// Subject the request arrived on.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn service(&self) -> &ServiceContext {
        &self.service
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.service.connection
    }

    #[must_use]
    pub fn notifier(&self) -> &Arc<dyn ErrorNotifier> {
        &self.service.notifier
    }

    /// Classifies `err` into an HTTP-shaped reply, notifying it first.
    #[must_use]
    pub fn respond_error(&self, err: &anyhow::Error, meta: serde_json::Value) -> ExternalResponse {
        respond_error(self.service.notifier.as_ref(), err, &meta)
    }
}
