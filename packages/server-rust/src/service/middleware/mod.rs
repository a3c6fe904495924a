//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`latency`]: Receipt-to-reply timing and SLA warnings
//! - [`pipeline`]: Composes the layers around a dispatcher

pub mod latency;
pub mod pipeline;

pub use latency::{LatencyAuditLayer, SlaExceeded};
pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};
