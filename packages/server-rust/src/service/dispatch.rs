//! Shared dispatch runtime: subscription, failure isolation and replies.
//!
//! Each router implements [`Dispatcher`] (decode, route, execute). This
//! module wraps it into a tower service that publishes the reply, layers the
//! latency audit on top and pumps a bus subscription through it, one spawned
//! task per message.

use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use serde::Serialize;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info};

use super::context::ServiceContext;
use super::middleware::build_dispatch_pipeline;
use crate::bus::connection::ConnectionError;
use crate::bus::transport::{BusError, Message};

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Router-specific half of the dispatch pipeline.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    type Response: Serialize + Send + Sync + 'static;

    /// Subject this dispatcher serves.
    fn subject(&self) -> &str;

    fn service(&self) -> &ServiceContext;

    /// Decodes, routes and executes one message. Never fails: every failure
    /// becomes an error-shaped response.
    async fn dispatch(&self, msg: &Message) -> Self::Response;
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

/// Abnormal end of a handler invocation.
#[derive(Debug, thiserror::Error)]
pub enum HandlerFailure {
    #[error("{0}")]
    Panicked(String),
    #[error("handler task was cancelled")]
    Cancelled,
}

/// Runs `fut` on its own task so a panic inside it is captured instead of
/// unwinding into the dispatch loop.
///
/// # Errors
///
/// Returns `HandlerFailure` if the task panicked or was cancelled.
pub async fn run_guarded<F, T>(fut: F) -> Result<T, HandlerFailure>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => Err(HandlerFailure::Panicked(panic_message(err.into_panic()))),
        Err(_) => Err(HandlerFailure::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<anyhow::Error>() {
        format!("{err:#}")
    } else if let Some(n) = payload.downcast_ref::<i64>() {
        n.to_string()
    } else if let Some(n) = payload.downcast_ref::<i32>() {
        n.to_string()
    } else if let Some(n) = payload.downcast_ref::<u64>() {
        n.to_string()
    } else if let Some(n) = payload.downcast_ref::<u32>() {
        n.to_string()
    } else {
        "handler panicked with an unprintable payload".to_string()
    }
}

/// Notification context of a failed message.
#[must_use]
pub fn failure_meta(msg: &Message) -> serde_json::Value {
    serde_json::json!({
        "request": msg.payload_text(),
        "subject": msg.subject,
    })
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Publishes `response` to the reply subject of `msg`, if it has one.
/// Failures are logged; there is nobody left to report them to.
pub async fn reply<T>(service: &ServiceContext, msg: &Message, response: &T)
where
    T: Serialize + Sync,
{
    let Some(reply) = msg.reply.as_deref() else {
        return;
    };
    let result = match service.connection.encoded() {
        Ok(encoded) => encoded.publish(reply, response).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        error!(
            error = %err,
            subject = %msg.subject,
            reply,
            data = %msg.payload_text(),
            "failed to publish reply"
        );
    }
}

// ---------------------------------------------------------------------------
// DispatchService
// ---------------------------------------------------------------------------

/// Tower service answering one message: dispatch, then reply.
pub struct DispatchService<D> {
    dispatcher: Arc<D>,
}

impl<D> DispatchService<D> {
    #[must_use]
    pub fn new(dispatcher: Arc<D>) -> Self {
        Self { dispatcher }
    }
}

impl<D> Clone for DispatchService<D> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<D: Dispatcher> Service<Message> for DispatchService<D> {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, msg: Message) -> Self::Future {
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move {
            let response = dispatcher.dispatch(&msg).await;
            reply(dispatcher.service(), &msg, &response).await;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Subscribes `dispatcher` to its subject and keeps it subscribed across
/// reconnects.
///
/// Registers an active handler named `"{subject} subscriber"` and runs it
/// right away when the connection is already up. With a non-empty `queue`
/// each message reaches one member of the group; otherwise every
/// subscriber receives it.
///
/// # Errors
///
/// Returns `ConnectionError::DuplicateActiveHandler` if the subject is
/// already subscribed on this connection. Failing to subscribe right away is
/// only logged; the next reconnect retries it.
pub async fn subscribe<D: Dispatcher>(
    dispatcher: &Arc<D>,
    queue: Option<String>,
) -> Result<(), ConnectionError> {
    let connection = dispatcher.service().connection.clone();
    let name = format!("{} subscriber", dispatcher.subject());

    // Weak: the connection outlives routers and must not keep them alive.
    let weak = Arc::downgrade(dispatcher);
    let handler_queue = queue.clone();
    connection.add_active_handler(name.clone(), move || {
        let weak = weak.clone();
        let queue = handler_queue.clone();
        async move {
            let Some(dispatcher) = weak.upgrade() else {
                return Ok::<(), anyhow::Error>(());
            };
            listen(dispatcher, queue.as_deref()).await?;
            Ok(())
        }
    })?;

    if connection.is_connected() {
        if let Err(err) = listen(dispatcher.clone(), queue.as_deref()).await {
            error!(error = %err, name = %name, "subscriber error");
        }
    }
    Ok(())
}

/// Opens the subscription and spawns its pump.
async fn listen<D: Dispatcher>(dispatcher: Arc<D>, queue: Option<&str>) -> Result<(), BusError> {
    let service = dispatcher.service();
    let queue = queue.filter(|q| !q.is_empty());
    let encoded = service.connection.encoded()?;
    let mut subscription = encoded
        .subscribe(dispatcher.subject(), queue, service.config.pending_limits())
        .await?;
    info!(subject = %dispatcher.subject(), queue, "subscribed");

    let sla = service.config.default_timeout();
    let pipeline = build_dispatch_pipeline(dispatcher, sla);
    tokio::spawn(async move {
        while let Some(msg) = subscription.next().await {
            tokio::spawn(pipeline.clone().oneshot(msg));
        }
        debug!(subject = %subscription.subject(), "subscription closed");
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
