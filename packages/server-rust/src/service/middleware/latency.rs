//! Latency audit middleware.
//!
//! Measures receipt-to-reply time of every message. Completion is logged at
//! `debug`; a message that took longer than the service budget raises a
//! warning notification. The reply itself is never affected.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tower::{Layer, Service};
use tracing::{debug, debug_span, Instrument};

use crate::bus::transport::Message;
use crate::service::notify::ErrorNotifier;

/// Reported when a message took longer than its latency budget.
#[derive(Debug, thiserror::Error)]
#[error("service took too long to finish")]
pub struct SlaExceeded;

// ---------------------------------------------------------------------------
// LatencyAuditLayer
// ---------------------------------------------------------------------------

/// Tower layer that audits per-message latency against a budget.
#[derive(Clone)]
pub struct LatencyAuditLayer {
    subject: Arc<str>,
    budget: Duration,
    notifier: Arc<dyn ErrorNotifier>,
}

impl LatencyAuditLayer {
    #[must_use]
    pub fn new(subject: impl Into<Arc<str>>, budget: Duration, notifier: Arc<dyn ErrorNotifier>) -> Self {
        Self {
            subject: subject.into(),
            budget,
            notifier,
        }
    }
}

impl<S> Layer<S> for LatencyAuditLayer {
    type Service = LatencyAuditService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LatencyAuditService {
            inner,
            subject: self.subject.clone(),
            budget: self.budget,
            notifier: self.notifier.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// LatencyAuditService
// ---------------------------------------------------------------------------

/// Service wrapper that times each call of the inner service.
#[derive(Clone)]
pub struct LatencyAuditService<S> {
    inner: S,
    subject: Arc<str>,
    budget: Duration,
    notifier: Arc<dyn ErrorNotifier>,
}

impl<S> Service<Message> for LatencyAuditService<S>
where
    S: Service<Message, Response = ()> + Send,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = ();
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<(), S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, msg: Message) -> Self::Future {
        let start = Instant::now();
        let payload = msg.payload.clone();
        let subject = self.subject.clone();
        let budget = self.budget;
        let notifier = self.notifier.clone();

        let span = debug_span!("dispatch", subject = %subject);
        let fut = self.inner.call(msg);

        Box::pin(
            async move {
                let result = fut.await;
                let elapsed = start.elapsed();
                let latency_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

                debug!(subject = %subject, latency_ms, "request completed");

                if elapsed > budget {
                    let meta = serde_json::json!({
                        "subject": &*subject,
                        "request": String::from_utf8_lossy(&payload),
                        "latency_ms": latency_ms,
                    });
                    notifier.notify_warning(&SlaExceeded, &meta);
                }
                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
