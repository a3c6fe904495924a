//! HTTP-shaped router for gateway-fronted traffic.
//!
//! Requests on `{service}.external` are matched against routes in
//! registration order: the first route whose method equals the request's and
//! whose pattern matches the whole path answers. Named capture groups become
//! path parameters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use buskit_core::messages::external_subject;
use buskit_core::{ExternalRequest, ExternalResponse, Value};
use futures_util::future::BoxFuture;
use http::{Method, StatusCode};
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, warn};

use super::context::{HandlerContext, ServiceContext};
use super::dispatch::{self, failure_meta, run_guarded, Dispatcher};
use crate::bus::connection::ConnectionError;
use crate::bus::transport::Message;

/// Route registration errors.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid path pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

// ---------------------------------------------------------------------------
// ExternalHandler
// ---------------------------------------------------------------------------

/// Handler of one external route.
///
/// Implemented for every `Fn(HandlerContext, ExternalRequest) -> Future`
/// yielding an [`ExternalResponse`]. Errors are turned into responses by the
/// handler itself, usually through [`HandlerContext::respond_error`].
pub trait ExternalHandler: Send + Sync + 'static {
    fn call(&self, ctx: HandlerContext, request: ExternalRequest) -> BoxFuture<'static, ExternalResponse>;
}

impl<F, Fut> ExternalHandler for F
where
    F: Fn(HandlerContext, ExternalRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExternalResponse> + Send + 'static,
{
    fn call(&self, ctx: HandlerContext, request: ExternalRequest) -> BoxFuture<'static, ExternalResponse> {
        Box::pin(self(ctx, request))
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// One registered route.
pub struct Route {
    method: Method,
    pattern: Regex,
    auth_required: bool,
    raw_body: bool,
    handler: Arc<dyn ExternalHandler>,
}

impl Route {
    /// Compiles `pattern` anchored to the whole path.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::InvalidPattern` if `pattern` is not a valid regex.
    pub fn new(
        method: Method,
        pattern: &str,
        auth_required: bool,
        raw_body: bool,
        handler: Arc<dyn ExternalHandler>,
    ) -> Result<Self, RouteError> {
        let compiled = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
            RouteError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(Self {
            method,
            pattern: compiled,
            auth_required,
            raw_body,
            handler,
        })
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn auth_required(&self) -> bool {
        self.auth_required
    }

    #[must_use]
    pub fn raw_body(&self) -> bool {
        self.raw_body
    }

    /// Named captures of `path` if this route serves (`method`, `path`).
    /// Groups that did not participate in the match map to `""`.
    #[must_use]
    pub fn matches(&self, method: &str, path: &str) -> Option<HashMap<String, String>> {
        if self.method.as_str() != method {
            return None;
        }
        let captures = self.pattern.captures(path)?;
        let params = self
            .pattern
            .capture_names()
            .flatten()
            .map(|name| {
                let value = captures.name(name).map_or("", |m| m.as_str());
                (name.to_string(), value.to_string())
            })
            .collect();
        Some(params)
    }
}

// ---------------------------------------------------------------------------
// ExternalRouter
// ---------------------------------------------------------------------------

/// Routes external requests by method and path pattern.
pub struct ExternalRouter {
    service_name: String,
    subject: Arc<str>,
    service: ServiceContext,
    routes: RwLock<Vec<Arc<Route>>>,
}

impl ExternalRouter {
    /// Router for `service_name` that is not yet subscribed.
    #[must_use]
    pub fn new(service: &ServiceContext, service_name: &str) -> Arc<Self> {
        Arc::new(Self {
            service_name: service_name.to_string(),
            subject: external_subject(service_name).into(),
            service: service.clone(),
            routes: RwLock::new(Vec::new()),
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

    /// Route requiring auth and a mapping (or absent) body.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::InvalidPattern` if `pattern` does not compile.
    pub fn add_handler<F, Fut>(&self, method: Method, pattern: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(HandlerContext, ExternalRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExternalResponse> + Send + 'static,
    {
        self.add_route(Route::new(method, pattern, true, false, Arc::new(handler))?);
        Ok(())
    }

    /// Route open to unauthenticated requests.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::InvalidPattern` if `pattern` does not compile.
    pub fn add_public_handler<F, Fut>(&self, method: Method, pattern: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(HandlerContext, ExternalRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExternalResponse> + Send + 'static,
    {
        self.add_route(Route::new(method, pattern, false, false, Arc::new(handler))?);
        Ok(())
    }

    /// Route requiring auth whose body is passed through uninterpreted.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::InvalidPattern` if `pattern` does not compile.
    pub fn add_raw_handler<F, Fut>(&self, method: Method, pattern: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(HandlerContext, ExternalRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ExternalResponse> + Send + 'static,
    {
        self.add_route(Route::new(method, pattern, true, true, Arc::new(handler))?);
        Ok(())
    }

    /// Appends a prebuilt route.
    pub fn add_route(&self, route: Route) {
        self.routes.write().push(Arc::new(route));
    }

    /// First route serving (`method`, `path`) with its path parameters.
    #[must_use]
    pub fn resolve(&self, method: &str, path: &str) -> Option<(Arc<Route>, HashMap<String, String>)> {
        self.routes
            .read()
            .iter()
            .find_map(|route| route.matches(method, path).map(|params| (route.clone(), params)))
    }

    fn handler_context(&self) -> HandlerContext {
        HandlerContext::new(self.subject.clone(), self.service.clone())
    }
}

#[async_trait]
impl Dispatcher for ExternalRouter {
    type Response = ExternalResponse;

    fn subject(&self) -> &str {
        &self.subject
    }

    fn service(&self) -> &ServiceContext {
        &self.service
    }

    async fn dispatch(&self, msg: &Message) -> ExternalResponse {
        let mut request: ExternalRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(subject = %msg.subject, error = %err, data = %msg.payload_text(), "undecodable external request");
                return ExternalResponse::status(StatusCode::BAD_REQUEST);
            }
        };
        request.raw_request = msg.payload.clone();

        debug!(
            subject = %msg.subject,
            request_id = %request.request_id,
            method = %request.method,
            path = %request.path,
            "handling external request"
        );

        let Some((route, params)) = self.resolve(&request.method, &request.path) else {
            warn!(method = %request.method, path = %request.path, request_id = %request.request_id, "handler not found");
            return ExternalResponse::status(StatusCode::NOT_FOUND);
        };

        request.resolve_auth();
        if route.auth_required && request.auth.is_none() {
            warn!(method = %request.method, path = %request.path, request_id = %request.request_id, "request is unauthorized");
            return ExternalResponse::status(StatusCode::UNAUTHORIZED);
        }

        if !route.raw_body {
            match &request.body {
                None | Some(Value::Null) => {}
                Some(Value::Map(map)) => request.body_map = Some(map.clone()),
                Some(_) => {
                    warn!(method = %request.method, path = %request.path, request_id = %request.request_id, "request body is not a mapping");
                    return ExternalResponse::status(StatusCode::BAD_REQUEST);
                }
            }
        }

        request.params = params;

        match run_guarded(route.handler.call(self.handler_context(), request)).await {
            Ok(response) => {
                debug!(subject = %msg.subject, status = response.status_code, "external request handled");
                response
            }
            Err(failure) => {
                self.service.notifier.notify_error(&failure, &failure_meta(msg));
                ExternalResponse::status(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
