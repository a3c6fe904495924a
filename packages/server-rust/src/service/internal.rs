//! Function-addressed service-to-service router.
//!
//! Requests on `{service}.internal` carry a function name; the handler
//! registered last under that name answers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use buskit_core::messages::internal_subject;
use buskit_core::{InternalRequest, InternalResponse};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use super::context::{HandlerContext, ServiceContext};
use super::dispatch::{self, failure_meta, run_guarded, Dispatcher};
use crate::bus::connection::ConnectionError;
use crate::bus::transport::Message;

/// Error text of a request naming an unknown function.
pub const HANDLER_NOT_FOUND: &str = "handler not found";

// ---------------------------------------------------------------------------
// InternalHandler
// ---------------------------------------------------------------------------

/// Handler of one internal function.
///
/// Implemented for every `Fn(HandlerContext, InternalRequest) -> Future`
/// returning `anyhow::Result<InternalResponse>`; an `Err` is sent back in the
/// response's `error` field.
pub trait InternalHandler: Send + Sync + 'static {
    fn call(
        &self,
        ctx: HandlerContext,
        request: InternalRequest,
    ) -> BoxFuture<'static, anyhow::Result<InternalResponse>>;
}

impl<F, Fut> InternalHandler for F
where
    F: Fn(HandlerContext, InternalRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<InternalResponse>> + Send + 'static,
{
    fn call(
        &self,
        ctx: HandlerContext,
        request: InternalRequest,
    ) -> BoxFuture<'static, anyhow::Result<InternalResponse>> {
        Box::pin(self(ctx, request))
    }
}

// ---------------------------------------------------------------------------
// InternalRouter
// ---------------------------------------------------------------------------

/// Routes internal requests by exact function name.
pub struct InternalRouter {
    service_name: String,
    subject: Arc<str>,
    service: ServiceContext,
    handlers: RwLock<HashMap<String, Arc<dyn InternalHandler>>>,
}

impl InternalRouter {
    /// Router for `service_name` that is not yet subscribed.
    #[must_use]
    pub fn new(service: &ServiceContext, service_name: &str) -> Arc<Self> {
        Arc::new(Self {
            service_name: service_name.to_string(),
            subject: internal_subject(service_name).into(),
            service: service.clone(),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Creates a router every instance of the service receives messages on.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::DuplicateActiveHandler` if the subject is
    /// already subscribed on this connection.
    pub async fn subscribe(
        service: &ServiceContext,
        service_name: &str,
    ) -> Result<Arc<Self>, ConnectionError> {
        let router = Self::new(service, service_name);
        dispatch::subscribe(&router, None).await?;
        Ok(router)
    }

    /// Creates a router whose messages are load-balanced across every
    /// instance of the service (queue group = subject).
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::DuplicateActiveHandler` if the subject is
    /// already subscribed on this connection.
    pub async fn queue_subscribe(
        service: &ServiceContext,
        service_name: &str,
    ) -> Result<Arc<Self>, ConnectionError> {
        let router = Self::new(service, service_name);
        let queue = router.subject.to_string();
        dispatch::subscribe(&router, Some(queue)).await?;
        Ok(router)
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Registers `handler` for `function`, replacing any previous one.
    pub fn add_handler<F, Fut>(&self, function: impl Into<String>, handler: F)
    where
        F: Fn(HandlerContext, InternalRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<InternalResponse>> + Send + 'static,
    {
        self.handlers.write().insert(function.into(), Arc::new(handler));
    }

    #[must_use]
    pub fn resolve(&self, function: &str) -> Option<Arc<dyn InternalHandler>> {
        self.handlers.read().get(function).cloned()
    }

    fn handler_context(&self) -> HandlerContext {
        HandlerContext::new(self.subject.clone(), self.service.clone())
    }
}

#[async_trait]
impl Dispatcher for InternalRouter {
    type Response = InternalResponse;

    fn subject(&self) -> &str {
        &self.subject
    }

    fn service(&self) -> &ServiceContext {
        &self.service
    }

    async fn dispatch(&self, msg: &Message) -> InternalResponse {
        let request: InternalRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(subject = %msg.subject, error = %err, data = %msg.payload_text(), "undecodable internal request");
                return InternalResponse::error(err.to_string());
            }
        };

        let function = request.function.clone();
        let request_id = request.request_id.clone();
        debug!(subject = %msg.subject, function = %function, request_id = %request_id, "handling internal request");

        let Some(handler) = self.resolve(&function) else {
            warn!(subject = %msg.subject, function = %function, request_id = %request_id, "handler not found");
            return InternalResponse::error(HANDLER_NOT_FOUND);
        };

        match run_guarded(handler.call(self.handler_context(), request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                error!(
                    subject = %msg.subject,
                    function = %function,
                    request_id = %request_id,
                    error = %message,
                    "internal handler error"
                );
                InternalResponse::error(message)
            }
            Err(failure) => {
                self.service.notifier.notify_error(&failure, &failure_meta(msg));
                InternalResponse::error(failure.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
