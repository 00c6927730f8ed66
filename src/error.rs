//! Error taxonomy for the routing engine.
//!
//! # Responsibilities
//! - Structural errors raised synchronously at factory time
//! - HTTP-shaped route errors (`ErrorResponse`) with status and parsed data
//! - The error values stored in router state and serialized for hydration
//!
//! # Design Decisions
//! - Structural misuse (empty tree, duplicate ids, bad basename) fails fast
//!   at construction; it is never surfaced through router state
//! - Thrown values from loaders/actions are kept as data, not trait objects,
//!   so state snapshots stay serializable
//! - Abort errors are internal control flow and never land in `state.errors`

use http::StatusCode;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::request::RouterResponse;

/// Errors raised synchronously by the engine factories and one-shot handlers.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The route tree passed to the factory was empty.
    #[error("route tree must contain at least one route")]
    EmptyRouteTree,

    /// Two routes in the tree share an id.
    #[error("duplicate route id \"{0}\" in route tree")]
    DuplicateRouteId(String),

    /// An index route declared children.
    #[error("index route \"{0}\" cannot have child routes")]
    IndexRouteWithChildren(String),

    /// The initial location does not live under the configured basename.
    #[error("location \"{location}\" does not begin with basename \"{basename}\"")]
    UnknownBasename { location: String, basename: String },

    /// `query_route` was asked for a route id that is not in the tree.
    #[error("no route matching route id \"{0}\"")]
    NoMatchingRouteId(String),

    /// `query_route` matched the URL but found no route with the id.
    #[error("route id \"{0}\" does not match URL \"{1}\"")]
    RouteIdMismatch(String, String),

    /// The static handler rejects methods it cannot service.
    #[error("query does not support method {0}")]
    UnsupportedMethod(String),

    /// The request signal was aborted while a static handler call ran.
    #[error("{0} call aborted: {1}")]
    QueryAborted(&'static str, String),

    /// The router was disposed while an operation was pending.
    #[error("router has been disposed")]
    Disposed,
}

/// An HTTP-shaped error produced by a thrown non-redirect response or
/// synthesized by the engine (404/405/400).
///
/// Distinguishable from plain errors via [`is_route_error_response`].
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub status_text: String,
    pub data: Value,
    /// True when the engine itself synthesized the response.
    pub internal: bool,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, data: Value) -> Self {
        Self {
            status,
            status_text: status_text(status),
            data,
            internal: false,
        }
    }

    pub(crate) fn internal(status: StatusCode, data: Value) -> Self {
        Self {
            internal: true,
            ..Self::new(status, data)
        }
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.status_text)
    }
}

/// Canonical reason phrase, falling back to the bare code.
pub(crate) fn status_text(status: StatusCode) -> String {
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_u16().to_string())
}

/// A value thrown by a loader or action.
///
/// Loaders and actions return `Result<RouteValue, RouteError>`; the `Err`
/// side models JavaScript's `throw`. Thrown redirect responses drive a
/// follow-up navigation instead of surfacing as errors.
#[derive(Debug, Clone)]
pub enum RouteError {
    /// A thrown HTTP response. 3xx with a `Location` header redirects;
    /// anything else is wrapped into an [`ErrorResponse`].
    Response(RouterResponse),
    /// An error with a message. Stacks are never carried.
    Error(String),
    /// Arbitrary thrown data.
    Data(Value),
}

impl RouteError {
    pub fn error(message: impl Into<String>) -> Self {
        RouteError::Error(message.into())
    }
}

impl From<&str> for RouteError {
    fn from(message: &str) -> Self {
        RouteError::Error(message.to_string())
    }
}

impl From<RouterResponse> for RouteError {
    fn from(response: RouterResponse) -> Self {
        RouteError::Response(response)
    }
}

/// An error value as stored in `state.errors` and static handler contexts,
/// keyed by the boundary route id it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteErrorValue {
    /// Wrapped thrown response or engine-synthesized 400/404/405.
    Response(ErrorResponse),
    /// Plain error; serializes with only its message.
    Error(String),
    /// Arbitrary thrown data, serialized as-is.
    Data(Value),
}

impl RouteErrorValue {
    /// Convert a thrown value into its stored shape. Thrown non-redirect
    /// responses are wrapped with their body parsed per content type.
    pub(crate) fn from_thrown(error: RouteError) -> Self {
        match error {
            RouteError::Response(response) => RouteErrorValue::Response(ErrorResponse {
                status: response.status,
                status_text: response.status_text(),
                data: response.parsed_body(),
                internal: false,
            }),
            RouteError::Error(message) => RouteErrorValue::Error(message),
            RouteError::Data(value) => RouteErrorValue::Data(value),
        }
    }

    /// Message or a terse rendering, for logging.
    pub fn message(&self) -> String {
        match self {
            RouteErrorValue::Response(response) => response.to_string(),
            RouteErrorValue::Error(message) => message.clone(),
            RouteErrorValue::Data(value) => value.to_string(),
        }
    }
}

/// Check whether an error value is the HTTP-shaped sentinel type.
pub fn is_route_error_response(error: &RouteErrorValue) -> bool {
    matches!(error, RouteErrorValue::Response(_))
}

// Hydration payloads tag the two special shapes so the client can revive
// them; plain thrown data round-trips untouched.
impl Serialize for RouteErrorValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RouteErrorValue::Response(response) => {
                let mut map = serializer.serialize_map(Some(5))?;
                map.serialize_entry("__type", "RouteErrorResponse")?;
                map.serialize_entry("status", &response.status.as_u16())?;
                map.serialize_entry("statusText", &response.status_text)?;
                map.serialize_entry("data", &response.data)?;
                if response.internal {
                    map.serialize_entry("internal", &true)?;
                }
                map.end()
            }
            RouteErrorValue::Error(message) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("__type", "Error")?;
                map.serialize_entry("message", message)?;
                map.end()
            }
            RouteErrorValue::Data(value) => value.serialize(serializer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_response_display() {
        let error = ErrorResponse::new(StatusCode::NOT_FOUND, json!(null));
        assert_eq!(error.to_string(), "404 Not Found");
        assert!(!error.internal);
    }

    #[test]
    fn test_sentinel_check() {
        let response = RouteErrorValue::Response(ErrorResponse::internal(
            StatusCode::METHOD_NOT_ALLOWED,
            json!("No action found"),
        ));
        let plain = RouteErrorValue::Error("boom".to_string());

        assert!(is_route_error_response(&response));
        assert!(!is_route_error_response(&plain));
    }

    #[test]
    fn test_serialization_tags() {
        let response = RouteErrorValue::Response(ErrorResponse::new(
            StatusCode::BAD_REQUEST,
            json!({"field": "name"}),
        ));
        let serialized = serde_json::to_value(&response).unwrap();
        assert_eq!(serialized["__type"], "RouteErrorResponse");
        assert_eq!(serialized["status"], 400);
        assert_eq!(serialized["statusText"], "Bad Request");

        let plain = RouteErrorValue::Error("kaboom".to_string());
        let serialized = serde_json::to_value(&plain).unwrap();
        assert_eq!(serialized, json!({"__type": "Error", "message": "kaboom"}));

        let data = RouteErrorValue::Data(json!([1, 2, 3]));
        assert_eq!(serde_json::to_value(&data).unwrap(), json!([1, 2, 3]));
    }
}
