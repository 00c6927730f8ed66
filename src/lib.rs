//! Data-aware routing engine.
//!
//! A framework-agnostic state machine that owns a client-side location,
//! matches URLs against a nested route tree, orchestrates loaders and
//! actions per navigation, and exposes an observable, serializable state
//! snapshot. A companion static handler runs the same pipeline for
//! server-side rendering of a single request.
//!
//! # Architecture Overview
//!
//! ```text
//!   navigate / fetch / revalidate / POP
//!        │
//!        ▼
//!   ┌──────────┐   ┌──────────┐   ┌──────────────┐
//!   │ history  │──▶│ matching │──▶│ revalidation │
//!   │ adapter  │   │ (ranked) │   │   planner    │
//!   └──────────┘   └──────────┘   └──────┬───────┘
//!        ▲                               │
//!        │                               ▼
//!   ┌────┴─────┐   ┌──────────┐   ┌──────────────┐
//!   │ snapshot │◀──│ deferred │◀──│ loader/action│
//!   │  commit  │   │ tracker  │   │   pipeline   │
//!   └──────────┘   └──────────┘   └──────────────┘
//! ```
//!
//! The view layer subscribes to snapshots and never mutates engine state;
//! platform history adapters implement [`history::History`]; loaders and
//! actions are async callables on route records.
//!
//! ```no_run
//! use serde_json::json;
//! use waypoint::{create_router, MemoryHistory, NavigateOptions, Route, RouterInit, RouteValue};
//!
//! # async fn run() -> Result<(), waypoint::RouterError> {
//! let routes = vec![Route::new("/")
//!     .id("root")
//!     .loader(|_args| async { Ok(RouteValue::Data(json!("ROOT"))) })
//!     .error_boundary()
//!     .children(vec![
//!         Route::index().id("home"),
//!         Route::new("users/:id").id("user"),
//!     ])];
//!
//! let router = create_router(RouterInit::new(routes, MemoryHistory::new(&["/"])))?;
//! router.initialize().await?;
//! router.navigate("/users/42", NavigateOptions::default()).await?;
//! assert_eq!(router.state().location.pathname, "/users/42");
//! # Ok(())
//! # }
//! ```

// Core subsystems
pub mod history;
pub mod matching;
pub mod request;
pub mod router;

// Data pipeline
pub mod deferred;
pub mod revalidation;

// Server rendering
pub mod static_handler;

// Cross-cutting concerns
pub mod error;

pub use deferred::{Deferred, DeferredData, DeferredState};
pub use error::{is_route_error_response, ErrorResponse, RouteError, RouteErrorValue, RouterError};
pub use history::{
    create_path, parse_path, strip_basename, History, HistoryAction, Location, MemoryHistory,
    Path, To,
};
pub use matching::{
    generate_path, ActionArgs, LoaderArgs, LoaderResult, Params, Route, RouteMatch, RouteRecord,
    RouteValue,
};
pub use request::{
    json, redirect, redirect_with_status, FormData, FormEncType, FormValue, ResponseBody,
    RouterRequest, RouterResponse, Submission,
};
pub use revalidation::{ActionOutcome, ShouldRevalidateArgs};
pub use router::{
    create_router, revive_errors, FetchOptions, Fetcher, FetcherState, HydrationData,
    NavigateOptions, Navigation, RelativeRouting, RestoreScroll, RevalidationState, RouteData,
    Router, RouterInit, RouterState, Subscription,
};
pub use static_handler::{
    create_static_handler, QueryResult, QueryRouteResult, StaticContext, StaticHandler,
};
