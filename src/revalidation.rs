//! Revalidation planning.
//!
//! # Responsibilities
//! - Decide which route loaders run on a given transition
//! - Decide which idle fetchers revalidate alongside them
//! - Apply per-route `should_revalidate` overrides
//!
//! # Default policy
//! ```text
//! load when:
//!     route newly matched, or its prior data is missing
//!     params changed for this route instance
//!     URL search changed
//!     same URL navigated again (explicit refresh)
//!     a mutation was just processed / revalidation was forced
//!     the route's streamed data was cancelled
//! skip when:
//!     only the hash changed (handled before planning)
//!     the route's should_revalidate returns Some(false)
//! ```
//!
//! # Design Decisions
//! - Only a strict override flips the default: `Some(bool)` wins, `None`
//!   defers
//! - A route whose previous pass errored has no loader data, so it re-runs
//!   through the missing-data rule
//! - Fetchers that never completed a load cannot opt out

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use http::Method;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::RouteErrorValue;
use crate::history::Location;
use crate::matching::matcher::{get_target_match, match_routes, Branch};
use crate::matching::route::RouteRecord;
use crate::matching::{Params, RouteMatch};
use crate::request::{create_url, FormData, FormEncType, Submission};
use crate::router::state::{FetchLoadMatch, FetcherState, RouterState};

/// Arguments handed to a route's `should_revalidate` predicate.
#[derive(Clone)]
pub struct ShouldRevalidateArgs {
    pub current_url: Url,
    pub current_params: Params,
    pub next_url: Url,
    pub next_params: Params,
    pub form_method: Option<Method>,
    pub form_enc_type: Option<FormEncType>,
    pub form_data: Option<FormData>,
    pub form_action: Option<String>,
    pub action_result: Option<ActionOutcome>,
    /// What the default policy decided for this route.
    pub default_should_revalidate: bool,
}

/// Outcome of the action phase, as seen by revalidation predicates.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    Data(Value),
    Error(RouteErrorValue),
}

pub(crate) type ShouldRevalidateFn =
    Arc<dyn Fn(&ShouldRevalidateArgs) -> Option<bool> + Send + Sync>;

/// A fetcher scheduled to revalidate during a loading phase.
pub(crate) struct RevalidatingFetcher {
    pub key: String,
    pub route_id: String,
    pub path: String,
    /// `None` when the fetcher's href no longer matches (becomes a 404).
    pub matches: Option<Vec<RouteMatch>>,
    pub target: Option<RouteMatch>,
    pub controller: Option<CancellationToken>,
}

pub(crate) struct PlanArgs<'a> {
    pub state: &'a RouterState,
    pub matches: &'a [RouteMatch],
    pub location: &'a Location,
    pub submission: Option<&'a Submission>,
    pub is_initial_load: bool,
    pub is_revalidation_required: bool,
    pub cancelled_deferred_routes: &'a [String],
    pub cancelled_fetcher_loads: &'a HashSet<String>,
    pub deleted_fetchers: &'a HashSet<String>,
    pub fetch_load_matches: &'a HashMap<String, FetchLoadMatch>,
    pub fetch_redirect_ids: &'a HashSet<String>,
    pub branches: &'a [Branch],
    pub basename: &'a str,
    /// `(route id, outcome)` from the action phase; an error cuts the
    /// loader set at that boundary.
    pub pending_action_result: Option<&'a (String, ActionOutcome)>,
}

/// Plan a loading phase: the navigation loaders to run and the fetchers
/// revalidating with them.
pub(crate) fn get_matches_to_load(
    args: PlanArgs<'_>,
) -> (Vec<RouteMatch>, Vec<RevalidatingFetcher>) {
    let current_url = create_url(&args.state.location.to_path());
    let next_url = create_url(&args.location.to_path());

    let action_outcome = args
        .pending_action_result
        .map(|(_, outcome)| outcome.clone());

    // An action error stops the loader set at its boundary (inclusive), so
    // the boundary renders with its ancestors' fresh data
    let boundary_matches: &[RouteMatch] = match args.pending_action_result {
        Some((boundary_id, ActionOutcome::Error(_))) => {
            match args.matches.iter().position(|m| &m.route.id == boundary_id) {
                Some(index) => &args.matches[..=index],
                None => args.matches,
            }
        }
        _ => args.matches,
    };

    let navigation_matches: Vec<RouteMatch> = boundary_matches
        .iter()
        .enumerate()
        .filter(|(index, route_match)| {
            let route = &route_match.route;
            if !route.has_loader() {
                return false;
            }

            if args.is_initial_load {
                return should_load_on_hydration(route, args.state);
            }

            if args
                .cancelled_deferred_routes
                .iter()
                .any(|id| id == &route.id)
            {
                return true;
            }

            let current_match = args.state.matches.get(*index);
            if is_new_loader(&args.state.loader_data, current_match, route_match) {
                return true;
            }
            let current_match = match current_match {
                Some(m) => m,
                None => return true,
            };

            let default_should_revalidate = args.is_revalidation_required
                // Same link clicked again: explicit refresh
                || same_path_and_search(&current_url, &next_url)
                // Search params feed every loader
                || current_url.query() != next_url.query()
                || is_new_route_instance(current_match, route_match);

            should_revalidate_loader(
                route,
                &ShouldRevalidateArgs {
                    current_url: current_url.clone(),
                    current_params: current_match.params.clone(),
                    next_url: next_url.clone(),
                    next_params: route_match.params.clone(),
                    form_method: args.submission.map(|s| s.form_method.clone()),
                    form_enc_type: args.submission.map(|s| s.form_enc_type),
                    form_data: args.submission.map(|s| s.form_data.clone()),
                    form_action: args.submission.map(|s| s.form_action.clone()),
                    action_result: action_outcome.clone(),
                    default_should_revalidate,
                },
            )
        })
        .map(|(_, route_match)| route_match.clone())
        .collect();

    // Fetcher participation
    let mut revalidating_fetchers = Vec::new();
    if args.is_initial_load {
        return (navigation_matches, revalidating_fetchers);
    }

    for (key, load_match) in args.fetch_load_matches {
        if args.deleted_fetchers.contains(key) {
            continue;
        }
        // Owner no longer rendered: the fetcher has nowhere to land
        if !args
            .matches
            .iter()
            .any(|m| m.route.id == load_match.route_id)
        {
            continue;
        }

        let fetcher_matches = match_routes(
            args.branches,
            &crate::history::parse_path(&load_match.path).pathname,
            args.basename,
        );
        let Some(fetcher_matches) = fetcher_matches else {
            // Matched once, no longer does; surface a 404 during the pass
            revalidating_fetchers.push(RevalidatingFetcher {
                key: key.clone(),
                route_id: load_match.route_id.clone(),
                path: load_match.path.clone(),
                matches: None,
                target: None,
                controller: None,
            });
            continue;
        };
        let search = crate::history::parse_path(&load_match.path).search;
        let target = get_target_match(&fetcher_matches, &search).clone();

        let fetcher = args.state.fetchers.get(key);
        let should_revalidate = if args.fetch_redirect_ids.contains(key) {
            // Mid-redirect fetchers are handled by the redirect itself
            false
        } else if args.cancelled_fetcher_loads.contains(key) {
            // Their data was invalidated by a deferred cancellation
            true
        } else if fetcher
            .map(|f| f.state != FetcherState::Idle && f.data.is_none())
            .unwrap_or(false)
        {
            // Never finished a first load: not a revalidation, re-run only
            // when one is being forced
            args.is_revalidation_required
        } else {
            let current_params = args
                .state
                .matches
                .last()
                .map(|m| m.params.clone())
                .unwrap_or_default();
            let next_params = args
                .matches
                .last()
                .map(|m| m.params.clone())
                .unwrap_or_default();
            should_revalidate_loader(
                &target.route,
                &ShouldRevalidateArgs {
                    current_url: current_url.clone(),
                    current_params,
                    next_url: next_url.clone(),
                    next_params,
                    form_method: args.submission.map(|s| s.form_method.clone()),
                    form_enc_type: args.submission.map(|s| s.form_enc_type),
                    form_data: args.submission.map(|s| s.form_data.clone()),
                    form_action: args.submission.map(|s| s.form_action.clone()),
                    action_result: action_outcome.clone(),
                    default_should_revalidate: args.is_revalidation_required,
                },
            )
        };

        if should_revalidate {
            revalidating_fetchers.push(RevalidatingFetcher {
                key: key.clone(),
                route_id: load_match.route_id.clone(),
                path: load_match.path.clone(),
                matches: Some(fetcher_matches),
                target: Some(target),
                controller: Some(CancellationToken::new()),
            });
        }
    }

    (navigation_matches, revalidating_fetchers)
}

fn same_path_and_search(a: &Url, b: &Url) -> bool {
    a.path() == b.path() && a.query() == b.query()
}

fn should_load_on_hydration(route: &RouteRecord, state: &RouterState) -> bool {
    let hydrated = state.loader_data.contains_key(&route.id);
    let errored = state
        .errors
        .as_ref()
        .is_some_and(|errors| errors.contains_key(&route.id));
    !hydrated && !errored
}

/// Newly matched, or matched but without committed data (covers post-error
/// re-runs, since an error clears the route's entry).
fn is_new_loader(
    loader_data: &HashMap<String, crate::router::state::RouteData>,
    current_match: Option<&RouteMatch>,
    next_match: &RouteMatch,
) -> bool {
    let is_new = match current_match {
        None => true,
        Some(current) => current.route.id != next_match.route.id,
    };
    let missing_data = !loader_data.contains_key(&next_match.route.id);
    is_new || missing_data
}

/// Same route, different URL slice: a dynamic param or splat changed.
fn is_new_route_instance(current: &RouteMatch, next: &RouteMatch) -> bool {
    if current.pathname != next.pathname {
        return true;
    }
    current
        .route
        .path
        .as_ref()
        .is_some_and(|path| path.ends_with('*'))
        && current.params.get("*") != next.params.get("*")
}

pub(crate) fn should_revalidate_loader(
    route: &RouteRecord,
    args: &ShouldRevalidateArgs,
) -> bool {
    if let Some(predicate) = &route.should_revalidate {
        if let Some(verdict) = predicate(args) {
            tracing::trace!(
                route = %route.id,
                verdict,
                default = args.default_should_revalidate,
                "shouldRevalidate override"
            );
            return verdict;
        }
    }
    args.default_should_revalidate
}
