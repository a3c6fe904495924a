//! Function-addressed request/response pair for service-to-service calls.

use serde::{Deserialize, Serialize};

use crate::id::{DocumentId, IdError};
use crate::types::Value;

use super::internal_subject;

/// Request sent to `{service}.internal`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InternalRequest {
    /// Callee service name, e.g. `"billing"`.
    #[serde(default)]
    pub service: String,
    /// Handler name within the callee.
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub request_id: String,
}

impl InternalRequest {
    #[must_use]
    pub fn new(service: impl Into<String>, function: impl Into<String>, arguments: Value) -> Self {
        Self {
            service: service.into(),
            function: function.into(),
            arguments,
            request_id: super::new_request_id(),
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn subject(&self) -> String {
        internal_subject(&self.service)
    }

    /// Reads `key` from `arguments` treated as a mapping.
    ///
    /// Returns `None` when the key is missing or `arguments` is not a mapping.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }

    /// Reads `key` as a document identifier.
    ///
    /// # Errors
    ///
    /// Returns `IdError` when the parameter is absent, not a string, or not a
    /// well-formed identifier.
    pub fn param_document_id(&self, key: &str) -> Result<DocumentId, IdError> {
        match self.param(key) {
            Some(Value::String(s)) => DocumentId::parse_hex(s),
            Some(other) => Err(IdError {
                input: serde_json::to_string(other).unwrap_or_default(),
            }),
            None => Err(IdError {
                input: String::new(),
            }),
        }
    }
}

/// Reply to an [`InternalRequest`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InternalResponse {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<Value>,
}

impl InternalResponse {
    #[must_use]
    pub fn ok(body: impl Into<Value>) -> Self {
        Self {
            error: None,
            body: Some(body.into()),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            body: None,
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
