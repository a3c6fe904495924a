//! Pipeline composition: wraps a dispatcher into the per-message service stack.

use std::sync::Arc;
use std::time::Duration;

use tower::ServiceBuilder;

use super::latency::{LatencyAuditLayer, LatencyAuditService};
use crate::service::dispatch::{DispatchService, Dispatcher};

/// Service stack that answers one inbound message.
pub type DispatchPipeline<D> = LatencyAuditService<DispatchService<D>>;

/// Build the dispatch pipeline for `dispatcher`.
///
/// Layer order (outermost to innermost):
/// 1. `LatencyAuditLayer` -- receipt-to-reply timing against `budget`
/// 2. `DispatchService` -- decode, route, execute, reply
#[must_use]
pub fn build_dispatch_pipeline<D: Dispatcher>(dispatcher: Arc<D>, budget: Duration) -> DispatchPipeline<D> {
    let service = dispatcher.service();
    let audit = LatencyAuditLayer::new(dispatcher.subject(), budget, service.notifier.clone());
    ServiceBuilder::new()
        .layer(audit)
        .service(DispatchService::new(dispatcher))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
