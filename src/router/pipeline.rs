//! Shared loader/action call pipeline.
//!
//! # Responsibilities
//! - Invoke a route's loader or action and normalize the outcome
//! - Classify results: data / streamed / redirect / error / aborted
//! - Fold per-route results into loaderData + boundary-keyed errors
//!
//! # Design Decisions
//! - Redirect classification happens here so callers only see one shape;
//!   the thrown/returned distinction is preserved for sibling-abort rules
//! - Errors never abort sibling loaders; each result commits independently
//! - Boundary lookup walks self-then-ancestors and falls back to the root,
//!   which is implicitly a boundary

use std::collections::HashMap;
use std::sync::Arc;

use http::{HeaderMap, StatusCode};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::deferred::DeferredData;
use crate::error::{ErrorResponse, RouteErrorValue};
use crate::matching::route::{ActionArgs, LoaderArgs, RouteRecord};
use crate::matching::{Params, RouteMatch, RouteValue};
use crate::request::{RouterRequest, RouterResponse};
use crate::router::state::RouteData;

/// Response header that forces full revalidation on the follow-up
/// navigation after a redirect.
pub(crate) const REVALIDATE_HEADER: &str = "x-remix-revalidate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    Loader,
    Action,
}

/// Normalized outcome of one loader/action call.
pub(crate) enum DataResult {
    Data {
        value: Value,
        status: Option<StatusCode>,
        headers: Option<HeaderMap>,
    },
    Deferred(Arc<DeferredData>),
    Redirect(RedirectResult),
    Error {
        error: RouteErrorValue,
        status: Option<StatusCode>,
        headers: Option<HeaderMap>,
    },
    /// The call's signal fired before it settled; the result is dropped.
    Aborted,
}

impl DataResult {
    pub(crate) fn is_redirect(&self) -> bool {
        matches!(self, DataResult::Redirect(_))
    }

    pub(crate) fn from_error(error: RouteErrorValue) -> Self {
        let status = match &error {
            RouteErrorValue::Response(response) => Some(response.status),
            _ => None,
        };
        DataResult::Error {
            error,
            status,
            headers: None,
        }
    }
}

/// A 3xx response carrying a `Location` header.
#[derive(Debug, Clone)]
pub(crate) struct RedirectResult {
    /// Resolved target: an app path for same-origin targets, the full URL
    /// otherwise (which then falls into normal 404 handling).
    pub location: String,
    pub status: StatusCode,
    /// `X-Remix-Revalidate` was present.
    pub revalidate: bool,
    /// Thrown rather than returned; thrown redirects abort sibling loaders.
    pub thrown: bool,
}

/// Call one route's loader or action, racing the request signal.
pub(crate) async fn call_loader_or_action(
    kind: HandlerKind,
    route: &Arc<RouteRecord>,
    params: Params,
    request: RouterRequest,
) -> DataResult {
    let signal = request.signal.clone();
    let request_url = request.url.clone();

    let future = match kind {
        HandlerKind::Loader => match &route.loader {
            Some(loader) => loader(LoaderArgs { request, params }),
            None => {
                return DataResult::from_error(RouteErrorValue::Error(format!(
                    "Could not find the loader to run on the \"{}\" route",
                    route.id
                )))
            }
        },
        HandlerKind::Action => match &route.action {
            Some(action) => action(ActionArgs { request, params }),
            None => {
                return DataResult::from_error(RouteErrorValue::Error(format!(
                    "Could not find the action to run on the \"{}\" route",
                    route.id
                )))
            }
        },
    };

    let result = tokio::select! {
        _ = signal.cancelled() => {
            tracing::debug!(route = %route.id, "Handler call aborted");
            return DataResult::Aborted;
        }
        result = future => result,
    };

    convert_result(kind, result, &request_url, &signal)
}

fn convert_result(
    kind: HandlerKind,
    result: Result<RouteValue, crate::error::RouteError>,
    request_url: &Url,
    signal: &CancellationToken,
) -> DataResult {
    match result {
        Ok(RouteValue::Response(response)) if response.is_redirect() => {
            redirect_result(response, request_url, false)
        }
        Ok(RouteValue::Response(response)) => DataResult::Data {
            value: response.parsed_body(),
            status: Some(response.status),
            headers: Some(response.headers),
        },
        Ok(RouteValue::Data(value)) => DataResult::Data {
            value,
            status: None,
            headers: None,
        },
        Ok(RouteValue::Deferred(deferred)) => {
            if kind == HandlerKind::Action {
                DataResult::from_error(RouteErrorValue::Error(
                    "Streamed values are not supported in actions".to_string(),
                ))
            } else {
                DataResult::Deferred(DeferredData::new(deferred, signal))
            }
        }
        Err(crate::error::RouteError::Response(response)) if response.is_redirect() => {
            redirect_result(response, request_url, true)
        }
        Err(thrown) => {
            let (status, headers) = match &thrown {
                crate::error::RouteError::Response(response) => {
                    (Some(response.status), Some(response.headers.clone()))
                }
                _ => (None, None),
            };
            DataResult::Error {
                error: RouteErrorValue::from_thrown(thrown),
                status,
                headers,
            }
        }
    }
}

fn redirect_result(response: RouterResponse, request_url: &Url, thrown: bool) -> DataResult {
    let raw = response.location_header().unwrap_or_default().to_string();
    let location = match request_url.join(&raw) {
        Ok(resolved) if resolved.origin() == request_url.origin() => {
            let mut path = resolved.path().to_string();
            if let Some(query) = resolved.query() {
                path.push('?');
                path.push_str(query);
            }
            if let Some(fragment) = resolved.fragment() {
                path.push('#');
                path.push_str(fragment);
            }
            path
        }
        Ok(resolved) => resolved.to_string(),
        Err(_) => raw,
    };

    DataResult::Redirect(RedirectResult {
        location,
        status: response.status,
        revalidate: response.headers.contains_key(REVALIDATE_HEADER),
        thrown,
    })
}

/// The nearest error boundary at or above `route_id` (leaf when absent),
/// falling back to the root.
pub(crate) fn find_nearest_boundary<'m>(
    matches: &'m [RouteMatch],
    route_id: Option<&str>,
) -> &'m RouteMatch {
    let eligible: &[RouteMatch] = match route_id {
        Some(id) => match matches.iter().position(|m| m.route.id == id) {
            Some(index) => &matches[..=index],
            None => matches,
        },
        None => matches,
    };
    eligible
        .iter()
        .rev()
        .find(|m| m.route.has_error_boundary)
        .unwrap_or(&matches[0])
}

/// Folded results of a loading phase.
pub(crate) struct ProcessedLoaderData {
    pub loader_data: HashMap<String, RouteData>,
    pub errors: Option<HashMap<String, RouteErrorValue>>,
    /// Shallowest error status, else the deepest non-200 loader status.
    pub status_code: Option<StatusCode>,
    pub loader_headers: HashMap<String, HeaderMap>,
}

/// Fold per-route results into committed data and boundary-keyed errors.
/// An action-phase error takes precedence over the first loader error and
/// lands at its own boundary.
pub(crate) fn process_route_loader_data(
    matches: &[RouteMatch],
    matches_to_load: &[RouteMatch],
    results: Vec<DataResult>,
    pending_action_error: Option<&(String, RouteErrorValue)>,
    active_deferreds: Option<&mut HashMap<String, Arc<DeferredData>>>,
) -> ProcessedLoaderData {
    let mut loader_data: HashMap<String, RouteData> = HashMap::new();
    let mut errors: Option<HashMap<String, RouteErrorValue>> = None;
    let mut status_code: Option<StatusCode> = None;
    let mut found_error = false;
    let mut loader_headers: HashMap<String, HeaderMap> = HashMap::new();
    let mut pending_action_error = pending_action_error.cloned();
    let mut deferred_sink = active_deferreds;

    for (route_match, result) in matches_to_load.iter().zip(results) {
        let id = route_match.route.id.clone();
        debug_assert!(!result.is_redirect(), "redirects are handled before processing");

        match result {
            DataResult::Error {
                error,
                status,
                headers,
            } => {
                let boundary = find_nearest_boundary(matches, Some(&id));
                // The action error wins over the first loader error
                let error = match pending_action_error.take() {
                    Some((_, action_error)) => action_error,
                    None => error,
                };
                let entry = errors.get_or_insert_with(HashMap::new);
                entry
                    .entry(boundary.route.id.clone())
                    .or_insert(error);
                // An errored route commits no loader data
                loader_data.remove(&id);
                if !found_error {
                    status_code =
                        Some(status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
                    found_error = true;
                }
                if let Some(headers) = headers {
                    loader_headers.insert(id, headers);
                }
            }
            DataResult::Deferred(deferred) => {
                if let Some(sink) = deferred_sink.as_deref_mut() {
                    sink.insert(id.clone(), deferred.clone());
                }
                loader_data.insert(id, RouteData::Deferred(deferred));
            }
            DataResult::Data {
                value,
                status,
                headers,
            } => {
                loader_data.insert(id.clone(), RouteData::Value(value));
                if let Some(status) = status {
                    if status != StatusCode::OK && !found_error {
                        status_code = Some(status);
                    }
                }
                if let Some(headers) = headers {
                    loader_headers.insert(id, headers);
                }
            }
            DataResult::Redirect(_) | DataResult::Aborted => {}
        }
    }

    // No loader consumed the action error: place it at its own boundary
    if let Some((boundary_id, action_error)) = pending_action_error {
        let entry = errors.get_or_insert_with(HashMap::new);
        entry.insert(boundary_id, action_error.clone());
        if !found_error {
            status_code = Some(match &action_error {
                RouteErrorValue::Response(response) => response.status,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            });
        }
    }

    ProcessedLoaderData {
        loader_data,
        errors,
        status_code,
        loader_headers,
    }
}

/// Carry forward prior data for still-matched routes that did not re-run,
/// stopping below the shallowest errored boundary.
pub(crate) fn merge_loader_data(
    old_loader_data: &HashMap<String, RouteData>,
    new_loader_data: HashMap<String, RouteData>,
    matches: &[RouteMatch],
    errors: Option<&HashMap<String, RouteErrorValue>>,
) -> HashMap<String, RouteData> {
    let mut merged = new_loader_data;
    for route_match in matches {
        let id = &route_match.route.id;
        if !merged.contains_key(id) {
            if let Some(previous) = old_loader_data.get(id) {
                if route_match.route.has_loader() {
                    merged.insert(id.clone(), previous.clone());
                }
            }
        }
        if errors.is_some_and(|errors| errors.contains_key(id)) {
            break;
        }
    }
    merged
}

/// Synthesized 404 for an unmatched URL.
pub(crate) fn not_found_error(pathname: &str) -> RouteErrorValue {
    RouteErrorValue::Response(ErrorResponse::internal(
        StatusCode::NOT_FOUND,
        json!(format!("No route matches URL \"{pathname}\"")),
    ))
}

/// Synthesized 405 for a submission whose target exposes no action.
pub(crate) fn no_action_error(pathname: &str) -> RouteErrorValue {
    RouteErrorValue::Response(ErrorResponse::internal(
        StatusCode::METHOD_NOT_ALLOWED,
        json!(format!("No action found for {pathname}")),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::route::{convert_routes, Route};

    fn matches_for(routes: Vec<Route>, pathname: &str) -> Vec<RouteMatch> {
        let (records, _) = convert_routes(routes).unwrap();
        let branches = crate::matching::matcher::flatten_branches(&records);
        crate::matching::matcher::match_routes(&branches, pathname, "/").unwrap()
    }

    fn noop_loader(route: Route) -> Route {
        route.loader(|_args| async { Ok(crate::matching::RouteValue::Data(Value::Null)) })
    }

    fn boundary_tree() -> Vec<RouteMatch> {
        matches_for(
            vec![noop_loader(Route::new("/").id("root")).child(
                noop_loader(Route::new("parent").id("parent").error_boundary())
                    .child(noop_loader(Route::new("child").id("child"))),
            )],
            "/parent/child",
        )
    }

    #[test]
    fn test_boundary_walks_to_nearest_ancestor() {
        let matches = boundary_tree();
        assert_eq!(find_nearest_boundary(&matches, Some("child")).route.id, "parent");
        assert_eq!(find_nearest_boundary(&matches, Some("parent")).route.id, "parent");
        // No boundary anywhere falls back to the root
        let bare = matches_for(
            vec![Route::new("/").id("root").child(Route::new("leaf").id("leaf"))],
            "/leaf",
        );
        assert_eq!(find_nearest_boundary(&bare, Some("leaf")).route.id, "root");
    }

    #[test]
    fn test_error_clears_route_data_and_keys_boundary() {
        let matches = boundary_tree();
        let to_load = matches.clone();
        let results = vec![
            DataResult::Data {
                value: json!("ROOT"),
                status: None,
                headers: None,
            },
            DataResult::Data {
                value: json!("PARENT"),
                status: None,
                headers: None,
            },
            DataResult::from_error(RouteErrorValue::Error("boom".to_string())),
        ];

        let processed = process_route_loader_data(&matches, &to_load, results, None, None);
        let errors = processed.errors.unwrap();
        assert!(matches!(&errors["parent"], RouteErrorValue::Error(m) if m == "boom"));
        assert!(!processed.loader_data.contains_key("child"));
        assert!(processed.loader_data.contains_key("root"));
        assert_eq!(processed.status_code, Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn test_merge_stops_below_errored_boundary() {
        let matches = boundary_tree();
        let mut old = HashMap::new();
        old.insert("root".to_string(), RouteData::Value(json!("OLD_ROOT")));
        old.insert("parent".to_string(), RouteData::Value(json!("OLD_PARENT")));
        old.insert("child".to_string(), RouteData::Value(json!("OLD_CHILD")));

        let mut errors = HashMap::new();
        errors.insert("parent".to_string(), RouteErrorValue::Error("x".to_string()));

        let merged = merge_loader_data(&old, HashMap::new(), &matches, Some(&errors));
        assert_eq!(merged.get("root"), Some(&RouteData::Value(json!("OLD_ROOT"))));
        // Boundary keeps its own data, descendants are dropped
        assert_eq!(merged.get("parent"), Some(&RouteData::Value(json!("OLD_PARENT"))));
        assert!(!merged.contains_key("child"));
    }

    #[test]
    fn test_deepest_success_status_wins_without_errors() {
        let matches = boundary_tree();
        let results = vec![
            DataResult::Data {
                value: json!(1),
                status: Some(StatusCode::CREATED),
                headers: None,
            },
            DataResult::Data {
                value: json!(2),
                status: Some(StatusCode::ACCEPTED),
                headers: None,
            },
            DataResult::Data {
                value: json!(3),
                status: None,
                headers: None,
            },
        ];
        let processed = process_route_loader_data(&matches, &matches.clone(), results, None, None);
        assert_eq!(processed.status_code, Some(StatusCode::ACCEPTED));
    }
}
