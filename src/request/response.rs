//! HTTP-shaped values returned or thrown by loaders and actions.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;

use crate::error::status_text;

/// Response payload. The engine never streams bodies itself; `Bytes` exists
/// so `query_route` callers can hand binary payloads through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Empty,
    Text(String),
    Json(Value),
    Bytes(Bytes),
}

/// A response-like object: status, headers, body.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl RouterResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
        }
    }

    /// A JSON response; sets `Content-Type: application/json`.
    pub fn json(value: Value) -> Self {
        let mut response = Self::new(StatusCode::OK);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        response.body = ResponseBody::Json(value);
        response
    }

    pub fn text(text: impl Into<String>) -> Self {
        let mut response = Self::new(StatusCode::OK);
        response.body = ResponseBody::Text(text.into());
        response
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Append a header; invalid names/values are ignored rather than panic.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.headers.append(name, value);
        } else {
            tracing::warn!(header = name, "Dropping invalid response header");
        }
        self
    }

    pub fn status_text(&self) -> String {
        status_text(self.status)
    }

    /// A redirect: 3xx status with a `Location` header.
    pub(crate) fn is_redirect(&self) -> bool {
        self.status.is_redirection() && self.headers.contains_key(LOCATION)
    }

    pub(crate) fn location_header(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }

    /// Whether the content type starts with `application/json`.
    pub(crate) fn is_json(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim_start().starts_with("application/json"))
    }

    /// Unwrap the body into data the way a consumer would: JSON when the
    /// content type says so, text otherwise.
    pub(crate) fn parsed_body(&self) -> Value {
        match &self.body {
            ResponseBody::Empty => Value::Null,
            ResponseBody::Json(value) => value.clone(),
            ResponseBody::Text(text) => {
                if self.is_json() {
                    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
                } else {
                    Value::String(text.clone())
                }
            }
            ResponseBody::Bytes(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                if self.is_json() {
                    serde_json::from_str(&text)
                        .unwrap_or_else(|_| Value::String(text.into_owned()))
                } else {
                    Value::String(text.into_owned())
                }
            }
        }
    }
}

/// Shorthand for a `302 Found` redirect.
pub fn redirect(location: &str) -> RouterResponse {
    redirect_with_status(location, StatusCode::FOUND)
}

/// A redirect with an explicit 3xx status (307/308 preserve method+body).
pub fn redirect_with_status(location: &str, status: StatusCode) -> RouterResponse {
    RouterResponse::new(status).header(LOCATION.as_str(), location)
}

/// Shorthand for a `200 OK` JSON response.
pub fn json(value: Value) -> RouterResponse {
    RouterResponse::json(value)
}
