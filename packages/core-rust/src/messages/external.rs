//! HTTP-shaped request/response pair forwarded by the gateway.
//!
//! The gateway terminates client HTTP, wraps the call into an
//! [`ExternalRequest`] and replays the [`ExternalResponse`] status, headers
//! and body to the client unchanged.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use http::{StatusCode, Uri};
use serde::{Deserialize, Serialize};

use crate::auth::Auth;
use crate::id::{DocumentId, IdError};
use crate::types::{Value, ValueMap};

use super::external_subject;

/// Multi-valued string mapping, used for query strings and headers.
pub type MultiMap = BTreeMap<String, Vec<String>>;

/// Request sent to `{service}.external`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalRequest {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub request_id: String,
    /// Client address as seen by the gateway.
    #[serde(rename = "request_ip", default)]
    pub client_ip: String,
    /// Upper-case HTTP method, e.g. `"GET"`.
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(skip_serializing_if = "MultiMap::is_empty", default)]
    pub query: MultiMap,
    /// Auth data as produced by the auth service, decoded lazily by the callee.
    #[serde(rename = "auth", skip_serializing_if = "Option::is_none", default)]
    pub raw_auth: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<Value>,
    #[serde(rename = "header", skip_serializing_if = "MultiMap::is_empty", default)]
    pub headers: MultiMap,

    /// Resolved auth; `None` when absent or undecodable.
    #[serde(skip)]
    pub auth: Option<Auth>,
    /// Named captures of the matched path pattern.
    #[serde(skip)]
    pub params: HashMap<String, String>,
    /// Body as a mapping, populated for non-raw handlers.
    #[serde(skip)]
    pub body_map: Option<ValueMap>,
    /// Undecoded request payload as received from the bus.
    #[serde(skip)]
    pub raw_request: Bytes,
}

impl ExternalRequest {
    #[must_use]
    pub fn new(service: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            request_id: super::new_request_id(),
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.entry(key.into()).or_default().push(value.into());
        self
    }

    #[must_use]
    pub fn subject(&self) -> String {
        external_subject(&self.service)
    }

    /// Path parameter `key`, falling back to the first query-string value.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.params.get(key) {
            return Some(value);
        }
        self.query
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Reads [`param`](Self::param) as a document identifier.
    ///
    /// # Errors
    ///
    /// Returns `IdError` when the parameter is absent or malformed.
    pub fn param_document_id(&self, key: &str) -> Result<DocumentId, IdError> {
        DocumentId::parse_hex(self.param(key).unwrap_or_default())
    }

    /// Serializes `auth` into the forwarded raw auth field.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `auth` cannot be encoded.
    pub fn set_auth(&mut self, auth: &Auth) -> Result<(), serde_json::Error> {
        self.raw_auth = Some(serde_json::to_value(auth)?);
        Ok(())
    }

    /// Decodes the raw auth field into [`auth`](Self::auth).
    ///
    /// A payload that does not decode clears the auth: the request is then
    /// treated as unauthenticated rather than rejected.
    pub fn resolve_auth(&mut self) {
        self.auth = self
            .raw_auth
            .as_ref()
            .and_then(|raw| serde_json::from_value::<Auth>(raw.clone()).ok());
    }
}

/// HTTP-shaped reply to an [`ExternalRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResponse {
    pub status_code: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<Value>,
}

impl ExternalResponse {
    /// Status-only response with no headers or body.
    #[must_use]
    pub fn status(status: StatusCode) -> Self {
        Self {
            status_code: status.as_u16(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Response with body `{"errors": [message]}`; the message defaults to the
    /// canonical reason phrase of `status`.
    #[must_use]
    pub fn with_error(status: StatusCode, message: Option<&str>) -> Self {
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or_default().to_string());
        Self::with_errors(status, vec![message])
    }

    fn with_errors(status: StatusCode, errors: Vec<String>) -> Self {
        let errors = Value::Array(errors.into_iter().map(Value::String).collect());
        Self {
            body: Some([("errors", errors)].into_iter().collect()),
            ..Self::status(status)
        }
    }

    /// 400 listing every given error, or the reason phrase when empty.
    #[must_use]
    pub fn bad_request(errors: Vec<String>) -> Self {
        if errors.is_empty() {
            return Self::with_error(StatusCode::BAD_REQUEST, None);
        }
        Self::with_errors(StatusCode::BAD_REQUEST, errors)
    }

    #[must_use]
    pub fn not_found(message: Option<&str>) -> Self {
        Self::with_error(StatusCode::NOT_FOUND, message)
    }

    #[must_use]
    pub fn forbidden(message: Option<&str>) -> Self {
        Self::with_error(StatusCode::FORBIDDEN, message)
    }

    #[must_use]
    pub fn unauthorized(message: Option<&str>) -> Self {
        Self::with_error(StatusCode::UNAUTHORIZED, message)
    }

    #[must_use]
    pub fn payment_required(message: Option<&str>) -> Self {
        Self::with_error(StatusCode::PAYMENT_REQUIRED, message)
    }

    #[must_use]
    pub fn unavailable_for_legal_reasons(message: Option<&str>) -> Self {
        Self::with_error(StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS, message)
    }

    #[must_use]
    pub fn server_error(message: Option<&str>) -> Self {
        Self::with_error(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    #[must_use]
    pub fn success(body: impl Into<Value>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::status(StatusCode::OK)
        }
    }

    #[must_use]
    pub fn created(body: impl Into<Value>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::status(StatusCode::CREATED)
        }
    }

    #[must_use]
    pub fn no_content() -> Self {
        Self::status(StatusCode::NO_CONTENT)
    }

    #[must_use]
    pub fn not_modified() -> Self {
        Self::status(StatusCode::NOT_MODIFIED)
    }

    /// 302 with a `Location` header pointing at `location`.
    #[must_use]
    pub fn redirect(location: &Uri) -> Self {
        let mut resp = Self::status(StatusCode::FOUND);
        resp.headers
            .insert(http::header::LOCATION.as_str().to_string(), location.to_string());
        resp
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn errors_of(resp: &ExternalResponse) -> Vec<String> {
        resp.body
            .as_ref()
            .and_then(|b| b.get("errors"))
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn error_builders_default_to_reason_phrase() {
        let resp = ExternalResponse::not_found(None);
        assert_eq!(resp.status_code, 404);
        assert_eq!(errors_of(&resp), vec!["Not Found"]);

        assert_eq!(errors_of(&ExternalResponse::unauthorized(None)), vec!["Unauthorized"]);
        assert_eq!(
            errors_of(&ExternalResponse::server_error(None)),
            vec!["Internal Server Error"]
        );
        assert_eq!(ExternalResponse::payment_required(None).status_code, 402);
        assert_eq!(ExternalResponse::unavailable_for_legal_reasons(None).status_code, 451);
    }

    #[test]
    fn error_builders_carry_custom_message() {
        let resp = ExternalResponse::forbidden(Some("no access to account"));
        assert_eq!(resp.status_code, 403);
        assert_eq!(errors_of(&resp), vec!["no access to account"]);
    }

    #[test]
    fn bad_request_lists_errors() {
        let resp = ExternalResponse::bad_request(vec!["name missing".into(), "age invalid".into()]);
        assert_eq!(errors_of(&resp), vec!["name missing", "age invalid"]);
        assert_eq!(errors_of(&ExternalResponse::bad_request(Vec::new())), vec!["Bad Request"]);
    }

    #[test]
    fn success_shapes() {
        assert_eq!(ExternalResponse::success("ok").status_code, 200);
        assert_eq!(ExternalResponse::created("ok").status_code, 201);
        let empty = ExternalResponse::no_content();
        assert_eq!(empty.status_code, 204);
        assert!(empty.body.is_none());
        assert_eq!(ExternalResponse::not_modified().status_code, 304);
    }

    #[test]
    fn redirect_sets_location() {
        let uri: Uri = "https://example.com/next".parse().unwrap();
        let resp = ExternalResponse::redirect(&uri);
        assert_eq!(resp.status_code, 302);
        assert_eq!(resp.headers.get("location").unwrap(), "https://example.com/next");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"headers\""));
        assert!(!json.contains("\"body\""));
    }

    #[test]
    fn param_prefers_path_over_query() {
        let mut req = ExternalRequest::new("users", "GET", "/users/42").with_query("id", "7");
        assert_eq!(req.param("id"), Some("7"));
        req.params.insert("id".to_string(), "42".to_string());
        assert_eq!(req.param("id"), Some("42"));
        assert_eq!(req.param("other"), None);
    }

    #[test]
    fn auth_round_trips_through_raw_field() {
        let mut req = ExternalRequest::new("users", "GET", "/me");
        let auth = Auth {
            plain_token: "tok".to_string(),
            ..Auth::default()
        };
        req.set_auth(&auth).unwrap();

        let wire = serde_json::to_vec(&req).unwrap();
        let mut decoded: ExternalRequest = serde_json::from_slice(&wire).unwrap();
        assert!(decoded.auth.is_none());
        decoded.resolve_auth();
        assert_eq!(decoded.auth, Some(auth));
    }

    #[test]
    fn undecodable_auth_is_cleared() {
        let mut req: ExternalRequest =
            serde_json::from_str(r#"{"method":"GET","path":"/","auth":"not-an-object"}"#).unwrap();
        req.resolve_auth();
        assert!(req.auth.is_none());
    }
}
