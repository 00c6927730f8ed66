//! One-shot request handling for server rendering.
//!
//! # Responsibilities
//! - Run matching + action + loaders for a single request
//! - Await every streamed value before returning (no partial commits)
//! - Produce a serializable context the client hydrates from
//!
//! # Design Decisions
//! - Stateless per call: the handler owns only the frozen route tree, so
//!   one handler may serve many requests concurrently
//! - Redirect responses short-circuit and are handed back untouched
//! - `query_route` never unwraps returned responses, so callers can stream
//!   binary payloads straight through

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use http::{HeaderMap, Method, StatusCode};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::deferred::DeferredData;
use crate::error::{ErrorResponse, RouteError, RouteErrorValue, RouterError};
use crate::history::{parse_path, Location};
use crate::matching::matcher::{
    flatten_branches, get_target_match, match_routes, Branch,
};
use crate::matching::route::{
    convert_routes, ActionArgs, LoaderArgs, Route, RouteRecord,
};
use crate::matching::{Params, RouteMatch, RouteValue};
use crate::request::{RouterRequest, RouterResponse};
use crate::router::pipeline::{
    find_nearest_boundary, no_action_error, not_found_error, process_route_loader_data,
    DataResult,
};

/// Create a static handler over a route tree.
pub fn create_static_handler(
    routes: Vec<Route>,
    basename: Option<&str>,
) -> Result<StaticHandler, RouterError> {
    let (routes, manifest) = convert_routes(routes)?;
    let branches = flatten_branches(&routes);
    Ok(StaticHandler {
        routes,
        manifest,
        branches,
        basename: basename.unwrap_or("/").to_string(),
    })
}

/// Server-side variant of the engine: same matching and data pipeline, one
/// request at a time, no history.
pub struct StaticHandler {
    routes: Vec<Arc<RouteRecord>>,
    manifest: HashMap<String, Arc<RouteRecord>>,
    branches: Vec<Branch>,
    basename: String,
}

/// Serializable result of a full [`StaticHandler::query`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticContext {
    pub location: Location,
    pub basename: String,
    pub matches: Vec<RouteMatch>,
    pub loader_data: HashMap<String, Value>,
    pub action_data: Option<HashMap<String, Value>>,
    pub errors: Option<HashMap<String, RouteErrorValue>>,
    #[serde(serialize_with = "serialize_status")]
    pub status_code: StatusCode,
    #[serde(skip_serializing)]
    pub loader_headers: HashMap<String, HeaderMap>,
    #[serde(skip_serializing)]
    pub action_headers: HashMap<String, HeaderMap>,
}

fn serialize_status<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u16(status.as_u16())
}

/// Outcome of [`StaticHandler::query`].
pub enum QueryResult {
    /// The rendered context.
    Context(StaticContext),
    /// A redirect response from a loader or action, returned as-is.
    Response(RouterResponse),
}

/// Outcome of [`StaticHandler::query_route`]: the single route handler's
/// raw value.
pub enum QueryRouteResult {
    Data(Value),
    /// A returned response, unwrapped by no one.
    Response(RouterResponse),
    /// A thrown non-redirect value.
    Error(RouteErrorValue),
}

enum StaticCall {
    Result(DataResult),
    ShortCircuit(RouterResponse),
}

impl StaticHandler {
    /// Run the full pipeline for one request and build a hydration context.
    pub async fn query(&self, request: RouterRequest) -> Result<QueryResult, RouterError> {
        self.check_method(&request)?;
        let path = request.path();
        let location = location_for(&path);

        let Some(matches) =
            match_routes(&self.branches, &location.pathname, &self.basename)
        else {
            tracing::debug!(path = %path, "Static query matched nothing");
            let matches = vec![RouteMatch {
                route: self.routes[0].clone(),
                params: Params::new(),
                pathname: "/".to_string(),
                pathname_base: "/".to_string(),
            }];
            let mut errors = HashMap::new();
            errors.insert(matches[0].route.id.clone(), not_found_error(&location.pathname));
            return Ok(QueryResult::Context(StaticContext {
                location,
                basename: self.basename.clone(),
                matches,
                loader_data: HashMap::new(),
                action_data: None,
                errors: Some(errors),
                status_code: StatusCode::NOT_FOUND,
                loader_headers: HashMap::new(),
                action_headers: HashMap::new(),
            }));
        };

        let mut action_data: Option<HashMap<String, Value>> = None;
        let mut action_headers: HashMap<String, HeaderMap> = HashMap::new();
        let mut action_status: Option<StatusCode> = None;
        let mut pending_action_error: Option<(String, RouteErrorValue)> = None;

        // Action phase for mutations
        if request.method != Method::GET {
            let target = get_target_match(&matches, &location.search).clone();
            if !target.route.has_action() {
                let boundary = find_nearest_boundary(&matches, Some(&target.route.id));
                pending_action_error = Some((
                    boundary.route.id.clone(),
                    no_action_error(&location.pathname),
                ));
            } else {
                match self
                    .call(HandlerSide::Action, &target, request.clone())
                    .await?
                {
                    StaticCall::ShortCircuit(response) => {
                        return Ok(QueryResult::Response(response))
                    }
                    StaticCall::Result(DataResult::Error { error, headers, .. }) => {
                        let boundary = find_nearest_boundary(&matches, Some(&target.route.id));
                        if let Some(headers) = headers {
                            action_headers.insert(target.route.id.clone(), headers);
                        }
                        pending_action_error = Some((boundary.route.id.clone(), error));
                    }
                    StaticCall::Result(DataResult::Data { value, status, headers }) => {
                        if let Some(headers) = headers {
                            action_headers.insert(target.route.id.clone(), headers);
                        }
                        action_status = status;
                        let mut data = HashMap::new();
                        data.insert(target.route.id.clone(), value);
                        action_data = Some(data);
                    }
                    StaticCall::Result(_) => {
                        return Err(RouterError::QueryAborted(
                            "query",
                            request.url.to_string(),
                        ))
                    }
                }
            }
        }

        // Loading phase: every matched loader (above the boundary when the
        // action errored), streamed values awaited in full
        let boundary_matches: Vec<RouteMatch> = match &pending_action_error {
            Some((boundary_id, _)) => {
                let index = matches
                    .iter()
                    .position(|m| &m.route.id == boundary_id)
                    .unwrap_or(matches.len() - 1);
                matches[..=index].to_vec()
            }
            None => matches.clone(),
        };
        let matches_to_load: Vec<RouteMatch> = boundary_matches
            .iter()
            .filter(|m| m.route.has_loader())
            .cloned()
            .collect();

        let calls = matches_to_load
            .iter()
            .map(|route_match| self.call(HandlerSide::Loader, route_match, request.clone()));
        let mut results = Vec::with_capacity(matches_to_load.len());
        for call in join_all(calls).await {
            match call? {
                StaticCall::ShortCircuit(response) => {
                    return Ok(QueryResult::Response(response))
                }
                StaticCall::Result(DataResult::Aborted) => {
                    return Err(RouterError::QueryAborted("query", request.url.to_string()))
                }
                StaticCall::Result(result) => results.push(result),
            }
        }

        let processed = process_route_loader_data(
            &matches,
            &matches_to_load,
            results,
            pending_action_error.as_ref(),
            None,
        );

        let status_code = if let Some(status) = processed.status_code.filter(|_| {
            processed.errors.is_some()
        }) {
            status
        } else if let Some(status) = action_status {
            status
        } else {
            processed.status_code.unwrap_or(StatusCode::OK)
        };

        let loader_data: HashMap<String, Value> = processed
            .loader_data
            .into_iter()
            .map(|(id, data)| (id, data.value()))
            .collect();

        Ok(QueryResult::Context(StaticContext {
            location,
            basename: self.basename.clone(),
            matches,
            loader_data,
            action_data: if pending_action_error.is_some() {
                None
            } else {
                action_data
            },
            errors: processed.errors,
            status_code,
            loader_headers: processed.loader_headers,
            action_headers,
        }))
    }

    /// Run a single route's loader or action and hand back the raw value.
    pub async fn query_route(
        &self,
        request: RouterRequest,
        route_id: Option<&str>,
    ) -> Result<QueryRouteResult, RouterError> {
        self.check_method(&request)?;
        let path = request.path();
        let location = location_for(&path);

        if let Some(route_id) = route_id {
            if !self.manifest.contains_key(route_id) {
                return Err(RouterError::NoMatchingRouteId(route_id.to_string()));
            }
        }

        let Some(matches) =
            match_routes(&self.branches, &location.pathname, &self.basename)
        else {
            return Ok(QueryRouteResult::Error(not_found_error(&location.pathname)));
        };

        let target = match route_id {
            Some(route_id) => matches
                .iter()
                .find(|m| m.route.id == route_id)
                .cloned()
                .ok_or_else(|| {
                    RouterError::RouteIdMismatch(route_id.to_string(), path.clone())
                })?,
            None => get_target_match(&matches, &location.search).clone(),
        };

        let side = if request.method == Method::GET {
            if !target.route.has_loader() {
                return Ok(QueryRouteResult::Error(RouteErrorValue::Response(
                    ErrorResponse::internal(
                        StatusCode::BAD_REQUEST,
                        Value::String(format!("No loader found for {}", location.pathname)),
                    ),
                )));
            }
            HandlerSide::Loader
        } else {
            if !target.route.has_action() {
                return Ok(QueryRouteResult::Error(no_action_error(&location.pathname)));
            }
            HandlerSide::Action
        };

        let result = self.call_raw(side, &target, request.clone()).await;
        match result {
            None => Err(RouterError::QueryAborted(
                "queryRoute",
                request.url.to_string(),
            )),
            Some(Ok(RouteValue::Response(response))) => {
                Ok(QueryRouteResult::Response(response))
            }
            Some(Ok(RouteValue::Data(value))) => Ok(QueryRouteResult::Data(value)),
            Some(Ok(RouteValue::Deferred(deferred))) => {
                let data = DeferredData::new(deferred, &request.signal);
                if data.resolve_data(&request.signal).await {
                    Err(RouterError::QueryAborted(
                        "queryRoute",
                        request.url.to_string(),
                    ))
                } else {
                    Ok(QueryRouteResult::Data(data.unwrapped_data()))
                }
            }
            Some(Err(RouteError::Response(response))) => {
                // Thrown responses come back raw too; callers discriminate
                // redirects by status
                Ok(QueryRouteResult::Response(response))
            }
            Some(Err(thrown)) => Ok(QueryRouteResult::Error(RouteErrorValue::from_thrown(
                thrown,
            ))),
        }
    }

    fn check_method(&self, request: &RouterRequest) -> Result<(), RouterError> {
        if request.method == Method::HEAD || request.method == Method::OPTIONS {
            return Err(RouterError::UnsupportedMethod(request.method.to_string()));
        }
        Ok(())
    }

    // The raw handler call: None when the signal fired first
    async fn call_raw(
        &self,
        side: HandlerSide,
        route_match: &RouteMatch,
        request: RouterRequest,
    ) -> Option<Result<RouteValue, RouteError>> {
        let signal = request.signal.clone();
        let params = route_match.params.clone();
        let future = match side {
            HandlerSide::Loader => {
                let loader = route_match.route.loader.as_ref()?;
                loader(LoaderArgs { request, params })
            }
            HandlerSide::Action => {
                let action = route_match.route.action.as_ref()?;
                action(ActionArgs { request, params })
            }
        };
        tokio::select! {
            _ = signal.cancelled() => None,
            result = future => Some(result),
        }
    }

    async fn call(
        &self,
        side: HandlerSide,
        route_match: &RouteMatch,
        request: RouterRequest,
    ) -> Result<StaticCall, RouterError> {
        let signal = request.signal.clone();
        let url = request.url.to_string();
        let Some(result) = self.call_raw(side, route_match, request).await else {
            return Err(RouterError::QueryAborted("query", url));
        };

        let call = match result {
            Ok(RouteValue::Response(response)) if response.is_redirect() => {
                StaticCall::ShortCircuit(response)
            }
            Err(RouteError::Response(response)) if response.is_redirect() => {
                StaticCall::ShortCircuit(response)
            }
            Ok(RouteValue::Response(response)) => StaticCall::Result(DataResult::Data {
                value: response.parsed_body(),
                status: Some(response.status),
                headers: Some(response.headers),
            }),
            Ok(RouteValue::Data(value)) => StaticCall::Result(DataResult::Data {
                value,
                status: None,
                headers: None,
            }),
            Ok(RouteValue::Deferred(deferred)) => match side {
                HandlerSide::Action => StaticCall::Result(DataResult::from_error(
                    RouteErrorValue::Error(
                        "Streamed values are not supported in actions".to_string(),
                    ),
                )),
                HandlerSide::Loader => {
                    // SSR awaits the whole stream before rendering
                    let data = DeferredData::new(deferred, &signal);
                    if data.resolve_data(&signal).await {
                        StaticCall::Result(DataResult::Aborted)
                    } else {
                        StaticCall::Result(DataResult::Data {
                            value: data.unwrapped_data(),
                            status: None,
                            headers: None,
                        })
                    }
                }
            },
            Err(thrown) => {
                let (status, headers) = match &thrown {
                    RouteError::Response(response) => {
                        (Some(response.status), Some(response.headers.clone()))
                    }
                    _ => (None, None),
                };
                StaticCall::Result(DataResult::Error {
                    error: RouteErrorValue::from_thrown(thrown),
                    status,
                    headers,
                })
            }
        };
        Ok(call)
    }
}

#[derive(Clone, Copy)]
enum HandlerSide {
    Loader,
    Action,
}

fn location_for(path: &str) -> Location {
    let parsed = parse_path(path);
    Location {
        pathname: parsed.pathname,
        search: parsed.search,
        hash: parsed.hash,
        state: None,
        key: "default".to_string(),
    }
}
