//! Maps handler errors onto HTTP-shaped replies.

use buskit_core::ExternalResponse;

use super::notify::ErrorNotifier;

/// Classifies `err` by its lower-cased message, context chain included, after forwarding it to
/// `notifier` with `meta`.
///
/// | message contains                         | reply                           |
/// |------------------------------------------|---------------------------------|
/// | `not found`                              | 404                             |
/// | `duplicate key error`                    | 400 `Duplicate Key Error`       |
/// | `request canceled` / `context canceled`  | 400 `Request Canceled`          |
/// | anything else                            | 500                             |
#[must_use]
pub fn respond_error(
    notifier: &dyn ErrorNotifier,
    err: &anyhow::Error,
    meta: &serde_json::Value,
) -> ExternalResponse {
    let message = format!("{err:#}").to_lowercase();

    notifier.notify_error(err.as_ref(), meta);

    if message.contains("not found") {
        ExternalResponse::not_found(None)
    } else if message.contains("duplicate key error") {
        ExternalResponse::bad_request(vec!["Duplicate Key Error".to_string()])
    } else if message.contains("request canceled") || message.contains("context canceled") {
        ExternalResponse::bad_request(vec!["Request Canceled".to_string()])
    } else {
        ExternalResponse::server_error(None)
    }
}
