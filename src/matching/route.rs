//! Route definitions and tree validation.
//!
//! # Responsibilities
//! - Builder-style route declaration (`Route`)
//! - Assign stable ids to routes missing one
//! - Validate the tree (non-empty, unique ids, childless index routes)
//! - Freeze definitions into immutable `RouteRecord`s

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::deferred::Deferred;
use crate::error::{RouteError, RouterError};
use crate::request::{RouterRequest, RouterResponse};
use crate::revalidation::{ShouldRevalidateArgs, ShouldRevalidateFn};

/// Path parameters extracted by the matcher, keyed by segment name. A splat
/// binds under `"*"`.
pub type Params = HashMap<String, String>;

/// Arguments handed to a loader.
pub struct LoaderArgs {
    pub request: RouterRequest,
    pub params: Params,
}

/// Arguments handed to an action.
pub struct ActionArgs {
    pub request: RouterRequest,
    pub params: Params,
}

/// What a loader or action produces on the success path.
pub enum RouteValue {
    /// Plain data committed to `loaderData`/`actionData`.
    Data(Value),
    /// An HTTP response; 3xx with `Location` redirects, anything else is
    /// unwrapped into data.
    Response(RouterResponse),
    /// A streamed value: sync fields commit immediately, promised fields
    /// settle later.
    Deferred(Deferred),
}

impl From<Value> for RouteValue {
    fn from(value: Value) -> Self {
        RouteValue::Data(value)
    }
}

impl From<RouterResponse> for RouteValue {
    fn from(response: RouterResponse) -> Self {
        RouteValue::Response(response)
    }
}

impl From<Deferred> for RouteValue {
    fn from(deferred: Deferred) -> Self {
        RouteValue::Deferred(deferred)
    }
}

/// Result of a loader/action call; `Err` models a thrown value.
pub type LoaderResult = Result<RouteValue, RouteError>;

pub(crate) type LoaderFunction =
    Arc<dyn Fn(LoaderArgs) -> BoxFuture<'static, LoaderResult> + Send + Sync>;
pub(crate) type ActionFunction =
    Arc<dyn Fn(ActionArgs) -> BoxFuture<'static, LoaderResult> + Send + Sync>;

/// A user-declared route node.
///
/// ```
/// use waypoint::{Route, RouteValue};
/// use serde_json::json;
///
/// let routes = vec![Route::new("/")
///     .id("root")
///     .loader(|_args| async { Ok(RouteValue::Data(json!("ROOT"))) })
///     .error_boundary()
///     .children(vec![
///         Route::index().id("home"),
///         Route::new("users/:id").id("user"),
///     ])];
/// ```
pub struct Route {
    pub(crate) id: Option<String>,
    pub(crate) path: Option<String>,
    pub(crate) index: bool,
    pub(crate) loader: Option<LoaderFunction>,
    pub(crate) action: Option<ActionFunction>,
    pub(crate) has_error_boundary: bool,
    pub(crate) should_revalidate: Option<ShouldRevalidateFn>,
    pub(crate) children: Vec<Route>,
}

impl Route {
    /// A route matching the given path pattern (static, `:param`, optional
    /// `segment?`, trailing `*` splat).
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            id: None,
            path: Some(path.into()),
            index: false,
            loader: None,
            action: None,
            has_error_boundary: false,
            should_revalidate: None,
            children: Vec::new(),
        }
    }

    /// A pathless layout route; contributes no segments, only behavior.
    pub fn layout() -> Self {
        Self {
            path: None,
            ..Self::new("")
        }
    }

    /// An index route: the default child rendered at its parent's path.
    pub fn index() -> Self {
        Self {
            index: true,
            ..Self::layout()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn loader<F, Fut>(mut self, loader: F) -> Self
    where
        F: Fn(LoaderArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LoaderResult> + Send + 'static,
    {
        self.loader = Some(Arc::new(move |args| loader(args).boxed()));
        self
    }

    pub fn action<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(ActionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LoaderResult> + Send + 'static,
    {
        self.action = Some(Arc::new(move |args| action(args).boxed()));
        self
    }

    /// Mark this route as an error boundary: errors from descendants stop
    /// here instead of bubbling further.
    pub fn error_boundary(mut self) -> Self {
        self.has_error_boundary = true;
        self
    }

    /// Override the default revalidation policy. Return `Some(bool)` to
    /// force a verdict, `None` to defer to the default.
    pub fn should_revalidate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ShouldRevalidateArgs) -> Option<bool> + Send + Sync + 'static,
    {
        self.should_revalidate = Some(Arc::new(predicate));
        self
    }

    pub fn children(mut self, children: Vec<Route>) -> Self {
        self.children = children;
        self
    }

    pub fn child(mut self, child: Route) -> Self {
        self.children.push(child);
        self
    }
}

/// An immutable, validated route node. Lives as long as the engine.
pub struct RouteRecord {
    pub id: String,
    pub path: Option<String>,
    pub index: bool,
    pub has_error_boundary: bool,
    pub(crate) loader: Option<LoaderFunction>,
    pub(crate) action: Option<ActionFunction>,
    pub(crate) should_revalidate: Option<ShouldRevalidateFn>,
    pub children: Vec<Arc<RouteRecord>>,
}

impl RouteRecord {
    pub fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }
}

impl std::fmt::Debug for RouteRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRecord")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("index", &self.index)
            .field("loader", &self.loader.is_some())
            .field("action", &self.action.is_some())
            .field("has_error_boundary", &self.has_error_boundary)
            .field("children", &self.children)
            .finish()
    }
}

/// Validate a route tree and freeze it, assigning positional ids ("0",
/// "0-1", ...) where the caller supplied none.
pub(crate) fn convert_routes(
    routes: Vec<Route>,
) -> Result<(Vec<Arc<RouteRecord>>, HashMap<String, Arc<RouteRecord>>), RouterError> {
    if routes.is_empty() {
        return Err(RouterError::EmptyRouteTree);
    }
    let mut manifest = HashMap::new();
    let records = convert_level(routes, None, &mut manifest)?;
    Ok((records, manifest))
}

fn convert_level(
    routes: Vec<Route>,
    parent_id: Option<&str>,
    manifest: &mut HashMap<String, Arc<RouteRecord>>,
) -> Result<Vec<Arc<RouteRecord>>, RouterError> {
    let mut records = Vec::with_capacity(routes.len());
    for (position, route) in routes.into_iter().enumerate() {
        let id = route.id.clone().unwrap_or_else(|| match parent_id {
            Some(parent) => format!("{parent}-{position}"),
            None => position.to_string(),
        });

        if route.index && !route.children.is_empty() {
            return Err(RouterError::IndexRouteWithChildren(id));
        }

        let children = convert_level(route.children, Some(&id), manifest)?;
        let record = Arc::new(RouteRecord {
            id: id.clone(),
            path: route.path,
            index: route.index,
            has_error_boundary: route.has_error_boundary,
            loader: route.loader,
            action: route.action,
            should_revalidate: route.should_revalidate,
            children,
        });

        if manifest.insert(id.clone(), record.clone()).is_some() {
            return Err(RouterError::DuplicateRouteId(id));
        }
        records.push(record);
    }
    Ok(records)
}
