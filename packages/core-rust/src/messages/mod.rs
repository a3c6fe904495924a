//! Wire-compatible message schemas for bus requests and replies.
//!
//! All types serialize to JSON with `snake_case` field names. Optional fields
//! are omitted when absent so replies stay compact on the wire.

pub mod external;
pub mod internal;

pub use external::{ExternalRequest, ExternalResponse, MultiMap};
pub use internal::{InternalRequest, InternalResponse};

/// Subject suffix for function-addressed service-to-service calls.
pub const INTERNAL_SUFFIX: &str = "internal";

/// Subject suffix for gateway-fronted, HTTP-shaped calls.
pub const EXTERNAL_SUFFIX: &str = "external";

/// Bus subject that serves internal calls for `service`.
#[must_use]
pub fn internal_subject(service: &str) -> String {
    format!("{service}.{INTERNAL_SUFFIX}")
}

/// Bus subject that serves external calls for `service`.
#[must_use]
pub fn external_subject(service: &str) -> String {
    format!("{service}.{EXTERNAL_SUFFIX}")
}

/// Fresh identifier used to trace a request through service chaining.
#[must_use]
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
