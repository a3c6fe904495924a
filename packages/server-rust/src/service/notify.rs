//! Error-notification sink.
//!
//! Dispatch failures and SLA violations are forwarded here together with
//! request context. Deployments plug in their error-tracking client; the
//! default just logs.

use std::error::Error;

use tracing::{error, warn};

/// Error message treated as expected and reported as a warning.
const NOT_FOUND: &str = "not found";

/// Receives errors and warnings raised while serving requests.
pub trait ErrorNotifier: Send + Sync + 'static {
    fn notify_error(&self, err: &(dyn Error + 'static), meta: &serde_json::Value);

    fn notify_warning(&self, err: &(dyn Error + 'static), meta: &serde_json::Value);
}

/// Logs notifications through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl ErrorNotifier for TracingNotifier {
    fn notify_error(&self, err: &(dyn Error + 'static), meta: &serde_json::Value) {
        if err.to_string() == NOT_FOUND {
            self.notify_warning(err, meta);
            return;
        }
        error!(error = %err, meta = %meta, "service error");
    }

    fn notify_warning(&self, err: &(dyn Error + 'static), meta: &serde_json::Value) {
        warn!(error = %err, meta = %meta, "service warning");
    }
}
