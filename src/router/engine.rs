//! Navigation orchestration.
//!
//! # State Machine
//! ```text
//! navigate GET        → loading    (plan loaders, abort prior navigation)
//! navigate non-GET    → submitting (action on target) → loading (all loaders)
//! action/loader 3xx   → loading    (follow-up navigation, new id)
//! loaders settled     → idle       (commit snapshot, write history)
//! newer navigation    → aborted    (token cancelled, late results dropped)
//! ```
//!
//! # Design Decisions
//! - Every navigation gets a monotonically increasing id; only the latest
//!   id may commit, so late settlements are dropped by comparison instead
//!   of unwound
//! - Internal bookkeeping lives behind one mutex, never held across await;
//!   loaders run lock-free and re-acquire to commit
//! - Fetchers are independent: a navigation never aborts a fetcher, but a
//!   mutation forces idle fetchers through the next loading phase
//! - Fetch controllers carry a generation so a superseded operation can
//!   tell it lost without comparing token identities

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use futures_util::future::{join, join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::deferred::DeferredData;
use crate::error::{ErrorResponse, RouteErrorValue, RouterError};
use crate::history::{
    create_location, create_path, parse_path, prepend_basename, resolve_to, strip_basename,
    History, HistoryAction, HistoryUpdate, Location, Path, To,
};
use crate::matching::matcher::{
    flatten_branches, get_target_match, match_routes, path_contributing_matches, Branch,
};
use crate::matching::route::{convert_routes, RouteRecord};
use crate::matching::RouteMatch;
use crate::request::{
    create_client_request, normalize_submission, NormalizedSubmission, Submission,
};
use crate::revalidation::{get_matches_to_load, ActionOutcome, PlanArgs, RevalidatingFetcher};
use crate::router::pipeline::{
    call_loader_or_action, find_nearest_boundary, merge_loader_data, no_action_error,
    not_found_error, process_route_loader_data, DataResult, HandlerKind, RedirectResult,
};
use crate::router::state::{
    FetchLoadMatch, FetchOptions, Fetcher, NavigateOptions, Navigation, RelativeRouting,
    RestoreScroll, RevalidationState, RouteData, RouterInit, RouterState,
};

type Subscriber = Arc<dyn Fn(&RouterState) + Send + Sync>;
type ScrollPositions = Arc<Mutex<HashMap<String, f64>>>;
type GetScrollPosition = Arc<dyn Fn() -> f64 + Send + Sync>;
type GetScrollKey = Arc<dyn Fn(&Location, &[RouteMatch]) -> Option<String> + Send + Sync>;

/// Create a router from a route tree and a history adapter.
///
/// Fails fast on structural misuse: empty trees, duplicate ids, index
/// routes with children, or an initial location outside the basename.
pub fn create_router(init: RouterInit) -> Result<Router, RouterError> {
    let (routes, manifest) = convert_routes(init.routes)?;
    let branches = flatten_branches(&routes);
    let basename = if init.basename.is_empty() {
        "/".to_string()
    } else {
        init.basename
    };

    let location = init.history.location();
    if strip_basename(&location.pathname, &basename).is_none() {
        return Err(RouterError::UnknownBasename {
            location: location.pathname,
            basename,
        });
    }

    let hydration = init.hydration_data.unwrap_or_default();
    let mut startup_404 = false;
    let (matches, preset_errors) = match match_routes(&branches, &location.pathname, &basename) {
        Some(matches) => (matches, None),
        None => {
            // Unmatched startup URL renders the root boundary with a 404
            startup_404 = true;
            let matches = short_circuit_matches(&routes);
            let boundary_id = matches[0].route.id.clone();
            let mut errors = HashMap::new();
            errors.insert(boundary_id, not_found_error(&location.pathname));
            (matches, Some(errors))
        }
    };

    let loader_data: HashMap<String, RouteData> = hydration
        .loader_data
        .into_iter()
        .map(|(id, value)| (id, RouteData::Value(value)))
        .collect();
    let errors = preset_errors.or(hydration.errors);

    let any_matched_loader = matches.iter().any(|m| m.route.has_loader());
    let hydrated = errors.is_some()
        || matches
            .iter()
            .any(|m| loader_data.contains_key(&m.route.id));
    let initialized = !any_matched_loader || hydrated;
    let initial_load_pending = !startup_404
        && matches.iter().any(|m| {
            m.route.has_loader()
                && !loader_data.contains_key(&m.route.id)
                && !errors
                    .as_ref()
                    .is_some_and(|errors| errors.contains_key(&m.route.id))
        });

    let state = RouterState {
        history_action: init.history.action(),
        location,
        matches,
        initialized,
        navigation: Navigation::Idle,
        revalidation: RevalidationState::Idle,
        loader_data,
        action_data: hydration.action_data,
        errors,
        fetchers: HashMap::new(),
        prevent_scroll_reset: false,
        restore_scroll_position: RestoreScroll::Unsaved,
    };

    let inner = Arc::new(RouterInner {
        routes,
        manifest,
        branches,
        history: init.history,
        basename,
        internals: Mutex::new(Internals {
            state,
            initial_load_pending,
            pending_nav_id: 0,
            pending_action: HistoryAction::Pop,
            pending_location: None,
            pending_controller: None,
            pending_prevent_scroll_reset: false,
            pending_navigation_load_id: 0,
            is_revalidation_required: false,
            is_uninterrupted_revalidation: false,
            active_deferreds: HashMap::new(),
            fetch_controllers: HashMap::new(),
            fetch_load_matches: HashMap::new(),
            fetch_reload_ids: HashMap::new(),
            fetch_redirect_ids: HashSet::new(),
            cancelled_deferred_routes: Vec::new(),
            cancelled_fetcher_loads: HashSet::new(),
            deleted_fetchers: HashSet::new(),
            scroll_positions: None,
            get_scroll_position: None,
            get_scroll_key: None,
        }),
        subscribers: DashMap::new(),
        subscriber_ids: AtomicU64::new(0),
        nav_ids: AtomicU64::new(0),
        sequence: AtomicU64::new(0),
        disposed: AtomicBool::new(false),
    });

    // POPs arrive through the adapter; drive them as navigations
    let weak = Arc::downgrade(&inner);
    inner.history.listen(Box::new(move |update: HistoryUpdate| {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let router = Router { inner };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    router.handle_pop(update).await;
                });
            }
            Err(_) => {
                tracing::error!("History POP outside of a runtime context; dropped");
            }
        }
    }));

    Ok(Router { inner })
}

fn short_circuit_matches(routes: &[Arc<RouteRecord>]) -> Vec<RouteMatch> {
    vec![RouteMatch {
        route: routes[0].clone(),
        params: Default::default(),
        pathname: "/".to_string(),
        pathname_base: "/".to_string(),
    }]
}

/// The data-aware routing engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    routes: Vec<Arc<RouteRecord>>,
    #[allow(dead_code)]
    manifest: HashMap<String, Arc<RouteRecord>>,
    branches: Vec<Branch>,
    history: Arc<dyn History>,
    basename: String,
    internals: Mutex<Internals>,
    subscribers: DashMap<u64, Subscriber>,
    subscriber_ids: AtomicU64,
    nav_ids: AtomicU64,
    /// Shared monotonic counter: load ids and fetch generations.
    sequence: AtomicU64,
    disposed: AtomicBool,
}

/// An abortable handle for one fetcher operation. The generation lets a
/// settling operation check whether it is still the current one.
struct FetchController {
    generation: u64,
    token: CancellationToken,
}

struct Internals {
    state: RouterState,
    initial_load_pending: bool,
    /// Id of the in-flight navigation; 0 when idle.
    pending_nav_id: u64,
    pending_action: HistoryAction,
    pending_location: Option<Location>,
    pending_controller: Option<CancellationToken>,
    pending_prevent_scroll_reset: bool,
    pending_navigation_load_id: u64,
    is_revalidation_required: bool,
    is_uninterrupted_revalidation: bool,
    active_deferreds: HashMap<String, Arc<DeferredData>>,
    fetch_controllers: HashMap<String, FetchController>,
    fetch_load_matches: HashMap<String, FetchLoadMatch>,
    fetch_reload_ids: HashMap<String, u64>,
    fetch_redirect_ids: HashSet<String>,
    cancelled_deferred_routes: Vec<String>,
    cancelled_fetcher_loads: HashSet<String>,
    deleted_fetchers: HashSet<String>,
    scroll_positions: Option<ScrollPositions>,
    get_scroll_position: Option<GetScrollPosition>,
    get_scroll_key: Option<GetScrollKey>,
}

/// Subscription guard; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    inner: Weak<RouterInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.remove(&self.id);
        }
    }
}

#[derive(Default)]
struct NavigationOpts {
    submission: Option<Submission>,
    fetcher_submission: Option<Submission>,
    override_navigation: Option<Navigation>,
    pending_error: Option<ErrorResponse>,
    start_uninterrupted_revalidation: bool,
    prevent_scroll_reset: bool,
    is_initial_load: bool,
}

#[derive(Default)]
struct CommitState {
    matches: Vec<RouteMatch>,
    loader_data: HashMap<String, RouteData>,
    errors: Option<HashMap<String, RouteErrorValue>>,
    action_data: Option<HashMap<String, Value>>,
    fetchers: Option<HashMap<String, Fetcher>>,
}

enum ActionPhase {
    ShortCircuit,
    Redirect(RedirectResult),
    Outcome((String, ActionOutcome)),
}

impl Router {
    fn lock(&self) -> MutexGuard<'_, Internals> {
        self.inner
            .internals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current state snapshot.
    pub fn state(&self) -> RouterState {
        self.lock().state.clone()
    }

    /// The frozen route tree.
    pub fn routes(&self) -> Vec<Arc<RouteRecord>> {
        self.inner.routes.clone()
    }

    pub fn basename(&self) -> &str {
        &self.inner.basename
    }

    /// Subscribe to committed snapshots. Dropping the returned guard
    /// unsubscribes.
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&RouterState) + Send + Sync + 'static,
    {
        let id = self.inner.subscriber_ids.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.insert(id, Arc::new(subscriber));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn notify(&self, snapshot: &RouterState) {
        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for subscriber in subscribers {
            subscriber(snapshot);
        }
    }

    fn update_state(&self, mutate: impl FnOnce(&mut Internals)) {
        let snapshot = {
            let mut internals = self.lock();
            mutate(&mut internals);
            internals.state.clone()
        };
        self.notify(&snapshot);
    }

    /// Serialize a target into an href, basename included.
    pub fn create_href(&self, to: impl Into<To>) -> String {
        let state = self.state();
        let path = self.normalize_to(&state, to.into(), RelativeRouting::Route);
        self.inner.history.create_href(&path)
    }

    fn normalize_to(&self, state: &RouterState, to: To, relative: RelativeRouting) -> Path {
        let target = to.into_path();
        let route_pathnames: Vec<String> = path_contributing_matches(&state.matches)
            .iter()
            .map(|m| m.pathname_base.clone())
            .collect();
        let location_pathname = strip_basename(&state.location.pathname, &self.inner.basename)
            .unwrap_or_else(|| state.location.pathname.clone());
        let mut path = resolve_to(
            &target,
            &route_pathnames,
            &location_pathname,
            relative == RelativeRouting::Path,
        );
        path.pathname = prepend_basename(&self.inner.basename, &path.pathname);
        path
    }

    /// Run the initial load: matched loader routes without hydration data.
    /// Resolves once the router reaches `initialized`.
    pub async fn initialize(&self) -> Result<(), RouterError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RouterError::Disposed);
        }
        let (pending, action, location) = {
            let mut internals = self.lock();
            let pending = internals.initial_load_pending;
            internals.initial_load_pending = false;
            (
                pending,
                internals.state.history_action,
                internals.state.location.clone(),
            )
        };
        if pending {
            self.start_navigation(
                action,
                location,
                NavigationOpts {
                    is_initial_load: true,
                    ..Default::default()
                },
            )
            .await;
        }
        Ok(())
    }

    /// Navigate to a target, running the data pipeline to completion (or
    /// until a newer operation supersedes this one).
    pub async fn navigate(
        &self,
        to: impl Into<To>,
        opts: NavigateOptions,
    ) -> Result<(), RouterError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RouterError::Disposed);
        }
        let state = self.state();
        let path = self.normalize_to(&state, to.into(), opts.relative);

        let (path, submission, pending_error) =
            match normalize_submission(path, opts.form_method, opts.form_enc_type, opts.form_data)
            {
                NormalizedSubmission::Plain { path } => (path, None, None),
                NormalizedSubmission::Submission { path, submission } => {
                    (path, Some(submission), None)
                }
                NormalizedSubmission::Invalid { path, error } => (path, None, Some(error)),
            };

        let mut location = create_location(&state.location.pathname, &path, opts.state, None);
        let history_action = if opts.replace {
            HistoryAction::Replace
        } else if location.to_path() == state.location.to_path() {
            // Auto-replace: re-navigating to the current location keeps the
            // entry (and its key) stable
            location.key = state.location.key.clone();
            HistoryAction::Replace
        } else {
            HistoryAction::Push
        };

        self.start_navigation(
            history_action,
            location,
            NavigationOpts {
                submission,
                pending_error,
                prevent_scroll_reset: opts.prevent_scroll_reset,
                ..Default::default()
            },
        )
        .await;
        Ok(())
    }

    /// Traverse the history stack; the resulting POP drives a navigation.
    pub fn go(&self, delta: i64) {
        self.inner.history.go(delta);
    }

    async fn handle_pop(&self, update: HistoryUpdate) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!(location = %update.location.to_path(), "History POP");
        self.start_navigation(HistoryAction::Pop, update.location, NavigationOpts::default())
            .await;
    }

    /// Re-run loaders for the current matches without changing location.
    pub async fn revalidate(&self) {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.update_state(|internals| {
            interrupt_active_loads(internals);
            internals.state.revalidation = RevalidationState::Loading;
        });
        tracing::debug!("Revalidation requested");

        let (navigation, action, location, pending_action, pending_location) = {
            let internals = self.lock();
            (
                internals.state.navigation.clone(),
                internals.state.history_action,
                internals.state.location.clone(),
                internals.pending_action,
                internals.pending_location.clone(),
            )
        };

        match navigation {
            // Let the in-flight action finish; its loading phase picks up
            // the forced revalidation
            Navigation::Submitting { .. } => {}
            Navigation::Idle => {
                self.start_navigation(
                    action,
                    location,
                    NavigationOpts {
                        start_uninterrupted_revalidation: true,
                        ..Default::default()
                    },
                )
                .await;
            }
            Navigation::Loading { .. } => {
                // Restart the interrupted navigation's loading phase; the
                // action (if any) already ran and must not run again
                let target = pending_location.unwrap_or(location);
                self.start_navigation(
                    pending_action,
                    target,
                    NavigationOpts {
                        override_navigation: Some(navigation),
                        ..Default::default()
                    },
                )
                .await;
            }
        }
    }

    fn start_navigation(
        &self,
        history_action: HistoryAction,
        location: Location,
        opts: NavigationOpts,
    ) -> BoxFuture<'_, ()> {
        async move {
            let nav_id = self.inner.nav_ids.fetch_add(1, Ordering::SeqCst) + 1;
            let controller = CancellationToken::new();
            {
                let mut internals = self.lock();
                save_scroll_position(&mut internals);
                if let Some(previous) = internals.pending_controller.take() {
                    previous.cancel();
                }
                internals.pending_nav_id = nav_id;
                internals.pending_action = history_action;
                internals.pending_location = Some(location.clone());
                internals.pending_controller = Some(controller.clone());
                internals.pending_prevent_scroll_reset = opts.prevent_scroll_reset;
                internals.is_uninterrupted_revalidation = opts.start_uninterrupted_revalidation;
            }
            tracing::debug!(
                id = nav_id,
                action = ?history_action,
                location = %location.to_path(),
                "Starting navigation"
            );

            let matches =
                match_routes(&self.inner.branches, &location.pathname, &self.inner.basename);
            let Some(matches) = matches else {
                let matches = short_circuit_matches(&self.inner.routes);
                let boundary_id = matches[0].route.id.clone();
                let mut errors = HashMap::new();
                errors.insert(boundary_id, not_found_error(&location.pathname));
                tracing::warn!(location = %location.pathname, "No route matched");
                self.complete_navigation(
                    nav_id,
                    location,
                    CommitState {
                        matches,
                        errors: Some(errors),
                        ..Default::default()
                    },
                );
                return;
            };

            // Hash-only changes need no data: commit synchronously
            let (is_hash_change, revalidation_required) = {
                let internals = self.lock();
                (
                    is_hash_change_only(&internals.state.location, &location),
                    internals.is_revalidation_required,
                )
            };
            if is_hash_change
                && opts.submission.is_none()
                && opts.pending_error.is_none()
                && !revalidation_required
                && !opts.is_initial_load
            {
                self.complete_navigation(
                    nav_id,
                    location,
                    CommitState {
                        matches,
                        ..Default::default()
                    },
                );
                return;
            }

            let mut pending_action_result: Option<(String, ActionOutcome)> = None;

            if let Some(error) = opts.pending_error {
                // Rejected before any handler ran (binary-over-GET)
                let target = get_target_match(&matches, &location.search);
                let boundary = find_nearest_boundary(&matches, Some(&target.route.id));
                pending_action_result = Some((
                    boundary.route.id.clone(),
                    ActionOutcome::Error(RouteErrorValue::Response(error)),
                ));
            } else if let Some(submission) = opts
                .submission
                .clone()
                .filter(|submission| submission.is_mutation())
            {
                match self
                    .handle_action(nav_id, &controller, &location, &matches, submission.clone())
                    .await
                {
                    ActionPhase::ShortCircuit => return,
                    ActionPhase::Redirect(redirect) => {
                        self.start_redirect_navigation(redirect, Some(submission), None, true)
                            .await;
                        return;
                    }
                    ActionPhase::Outcome(outcome) => pending_action_result = Some(outcome),
                }
            }

            self.handle_loaders(
                nav_id,
                controller,
                location,
                matches,
                opts.submission,
                opts.fetcher_submission,
                opts.override_navigation,
                pending_action_result,
                opts.is_initial_load,
            )
            .await;
        }
        .boxed()
    }

    async fn handle_action(
        &self,
        nav_id: u64,
        controller: &CancellationToken,
        location: &Location,
        matches: &[RouteMatch],
        submission: Submission,
    ) -> ActionPhase {
        // A mutation invalidates all in-flight data
        self.update_state(|internals| {
            interrupt_active_loads(internals);
            internals.state.navigation = Navigation::Submitting {
                location: location.clone(),
                submission: submission.clone(),
            };
        });

        let target = get_target_match(matches, &location.search).clone();
        if !target.route.has_action() {
            tracing::warn!(
                pathname = %location.pathname,
                method = %submission.form_method,
                "Submission target has no action"
            );
            let boundary = find_nearest_boundary(matches, Some(&target.route.id));
            return ActionPhase::Outcome((
                boundary.route.id.clone(),
                ActionOutcome::Error(no_action_error(&location.pathname)),
            ));
        }

        let href = strip_hash_href(location);
        let request = create_client_request(&href, controller.child_token(), Some(&submission));
        let result = call_loader_or_action(
            HandlerKind::Action,
            &target.route,
            target.params.clone(),
            request,
        )
        .await;

        if self.lock().pending_nav_id != nav_id {
            return ActionPhase::ShortCircuit;
        }

        match result {
            DataResult::Aborted => ActionPhase::ShortCircuit,
            DataResult::Redirect(redirect) => ActionPhase::Redirect(redirect),
            DataResult::Error { error, .. } => {
                let boundary = find_nearest_boundary(matches, Some(&target.route.id));
                ActionPhase::Outcome((boundary.route.id.clone(), ActionOutcome::Error(error)))
            }
            DataResult::Deferred(_) => {
                let boundary = find_nearest_boundary(matches, Some(&target.route.id));
                ActionPhase::Outcome((
                    boundary.route.id.clone(),
                    ActionOutcome::Error(RouteErrorValue::Error(
                        "Streamed values are not supported in actions".to_string(),
                    )),
                ))
            }
            DataResult::Data { value, .. } => {
                ActionPhase::Outcome((target.route.id.clone(), ActionOutcome::Data(value)))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_loaders(
        &self,
        nav_id: u64,
        controller: CancellationToken,
        location: Location,
        matches: Vec<RouteMatch>,
        submission: Option<Submission>,
        fetcher_submission: Option<Submission>,
        override_navigation: Option<Navigation>,
        pending_action_result: Option<(String, ActionOutcome)>,
        is_initial_load: bool,
    ) {
        let loading_navigation = override_navigation.unwrap_or_else(|| Navigation::Loading {
            location: location.clone(),
            submission: submission.clone(),
        });
        let active_submission = submission.clone().or(fetcher_submission);

        // Plan the pass, and capture the pre-commit view needed afterwards
        let (matches_to_load, revalidating_fetchers, prev_matches, prev_loader_data, uninterrupted) = {
            let mut internals = self.lock();
            let (matches_to_load, revalidating_fetchers) = get_matches_to_load(PlanArgs {
                state: &internals.state,
                matches: &matches,
                location: &location,
                submission: active_submission.as_ref(),
                is_initial_load,
                is_revalidation_required: internals.is_revalidation_required,
                cancelled_deferred_routes: &internals.cancelled_deferred_routes,
                cancelled_fetcher_loads: &internals.cancelled_fetcher_loads,
                deleted_fetchers: &internals.deleted_fetchers,
                fetch_load_matches: &internals.fetch_load_matches,
                fetch_redirect_ids: &internals.fetch_redirect_ids,
                branches: &self.inner.branches,
                basename: &self.inner.basename,
                pending_action_result: pending_action_result.as_ref(),
            });
            internals.cancelled_fetcher_loads.clear();

            // Streamed data dies with routes leaving the tree, and with
            // routes about to reload (a fresh instance replaces it)
            let matched_ids: HashSet<String> =
                matches.iter().map(|m| m.route.id.clone()).collect();
            let reloading_ids: HashSet<String> = matches_to_load
                .iter()
                .map(|m| m.route.id.clone())
                .collect();
            let cancelled = cancel_active_deferreds(&mut internals, |id| {
                !matched_ids.contains(id) || reloading_ids.contains(id)
            });
            internals.cancelled_deferred_routes.extend(cancelled);

            (
                matches_to_load,
                revalidating_fetchers,
                internals.state.matches.clone(),
                internals.state.loader_data.clone(),
                internals.is_uninterrupted_revalidation,
            )
        };

        if matches_to_load.is_empty() && revalidating_fetchers.is_empty() {
            self.complete_navigation(
                nav_id,
                location,
                CommitState {
                    matches,
                    errors: pending_action_result.as_ref().and_then(action_error_map),
                    action_data: pending_action_result.as_ref().and_then(action_data_map),
                    ..Default::default()
                },
            );
            return;
        }

        let load_id = self.next_sequence();
        let fetcher_generations = self.install_fetch_controllers(&revalidating_fetchers);
        {
            let mut internals = self.lock();
            internals.pending_navigation_load_id = load_id;
        }

        if !uninterrupted {
            self.update_state(|internals| {
                internals.state.navigation = loading_navigation.clone();
                match &pending_action_result {
                    Some((route_id, ActionOutcome::Data(value))) => {
                        let mut action_data = HashMap::new();
                        action_data.insert(route_id.clone(), value.clone());
                        internals.state.action_data = Some(action_data);
                    }
                    Some((_, ActionOutcome::Error(_))) => {
                        internals.state.action_data = None;
                    }
                    None => {}
                }
                mark_fetchers_loading(internals, &revalidating_fetchers);
            });
        }

        tracing::debug!(
            id = nav_id,
            loaders = matches_to_load.len(),
            fetchers = revalidating_fetchers.len(),
            "Running loading phase"
        );

        let (results, fetcher_results) = self
            .call_loaders(&controller, &location, &matches_to_load, &revalidating_fetchers)
            .await;

        // Only the current navigation may proceed
        if self.lock().pending_nav_id != nav_id {
            return;
        }

        // Redirects preempt data processing
        if let Some((redirect, fetcher_key)) =
            find_redirect(&results, &fetcher_results, &revalidating_fetchers)
        {
            let replace = {
                let mut internals = self.lock();
                if let Some(key) = &fetcher_key {
                    internals.fetch_redirect_ids.insert(key.clone());
                }
                internals.pending_action == HistoryAction::Replace
            };
            self.start_redirect_navigation(redirect, active_submission, None, replace)
                .await;
            return;
        }

        if controller.is_cancelled() {
            return;
        }

        // Await streamed values for reused route instances (revalidations
        // commit whole); new instances commit partially
        let results = resolve_navigation_deferreds(
            results,
            &matches_to_load,
            &prev_matches,
            &prev_loader_data,
            &controller,
        )
        .await;

        let pending_action_error = pending_action_result
            .as_ref()
            .and_then(|(id, outcome)| match outcome {
                ActionOutcome::Error(error) => Some((id.clone(), error.clone())),
                ActionOutcome::Data(_) => None,
            });

        let (loader_data, mut errors) = {
            let mut internals = self.lock();
            let processed = process_route_loader_data(
                &matches,
                &matches_to_load,
                results,
                pending_action_error.as_ref(),
                Some(&mut internals.active_deferreds),
            );
            (processed.loader_data, processed.errors)
        };

        // Fold fetcher results into the registry
        let fetchers = {
            let mut internals = self.lock();
            let mut fetchers = internals.state.fetchers.clone();
            for (fetcher, result) in revalidating_fetchers.iter().zip(fetcher_results) {
                if let Some(generation) = fetcher_generations.get(&fetcher.key) {
                    remove_fetch_controller(&mut internals, &fetcher.key, *generation);
                }
                match result {
                    DataResult::Error { error, .. } => {
                        let boundary = find_nearest_boundary(&matches, Some(&fetcher.route_id));
                        errors
                            .get_or_insert_with(HashMap::new)
                            .entry(boundary.route.id.clone())
                            .or_insert(error);
                        // An errored fetcher is dropped, data included
                        fetchers.remove(&fetcher.key);
                        internals.fetch_load_matches.remove(&fetcher.key);
                    }
                    DataResult::Data { value, .. } => {
                        fetchers.insert(fetcher.key.clone(), Fetcher::idle(Some(value)));
                    }
                    DataResult::Aborted
                    | DataResult::Deferred(_)
                    | DataResult::Redirect(_) => {}
                }
            }
            fetchers
        };

        self.complete_navigation(
            nav_id,
            location,
            CommitState {
                matches,
                loader_data,
                errors,
                action_data: pending_action_result.as_ref().and_then(action_data_map),
                fetchers: Some(fetchers),
            },
        );
    }

    /// Abort any prior operation per key and install the new controllers,
    /// returning each key's generation for later cleanup.
    fn install_fetch_controllers(
        &self,
        revalidating_fetchers: &[RevalidatingFetcher],
    ) -> HashMap<String, u64> {
        let mut generations = HashMap::new();
        let mut internals = self.lock();
        for fetcher in revalidating_fetchers {
            abort_fetcher(&mut internals, &fetcher.key);
            if let Some(token) = &fetcher.controller {
                let generation = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                internals.fetch_controllers.insert(
                    fetcher.key.clone(),
                    FetchController {
                        generation,
                        token: token.clone(),
                    },
                );
                generations.insert(fetcher.key.clone(), generation);
            }
        }
        generations
    }

    async fn call_loaders(
        &self,
        controller: &CancellationToken,
        location: &Location,
        matches_to_load: &[RouteMatch],
        revalidating_fetchers: &[RevalidatingFetcher],
    ) -> (Vec<DataResult>, Vec<DataResult>) {
        let href = strip_hash_href(location);

        let navigation_futures = matches_to_load.iter().map(|route_match| {
            let request = create_client_request(&href, controller.child_token(), None);
            let route = route_match.route.clone();
            let params = route_match.params.clone();
            let controller = controller.clone();
            async move {
                let result =
                    call_loader_or_action(HandlerKind::Loader, &route, params, request).await;
                if let DataResult::Redirect(redirect) = &result {
                    // A thrown redirect aborts its in-flight siblings; a
                    // returned one lets them settle
                    if redirect.thrown {
                        controller.cancel();
                    }
                }
                result
            }
        });

        let fetcher_futures = revalidating_fetchers.iter().map(|fetcher| {
            let path = fetcher.path.clone();
            let target = fetcher.target.clone();
            let fetch_controller = fetcher.controller.clone();
            async move {
                match (target, fetch_controller) {
                    (Some(target), Some(fetch_controller)) => {
                        let request =
                            create_client_request(&path, fetch_controller.child_token(), None);
                        let result = call_loader_or_action(
                            HandlerKind::Loader,
                            &target.route,
                            target.params.clone(),
                            request,
                        )
                        .await;
                        resolve_fetcher_deferred(result, &fetch_controller).await
                    }
                    _ => DataResult::from_error(not_found_error(&path)),
                }
            }
        });

        join(join_all(navigation_futures), join_all(fetcher_futures)).await
    }

    /// Follow a redirect: reseed the pipeline with a new navigation id.
    async fn start_redirect_navigation(
        &self,
        redirect: RedirectResult,
        submission: Option<Submission>,
        fetcher_submission: Option<Submission>,
        action_induced_or_replace: bool,
    ) {
        let path = parse_path(&redirect.location);
        let (current_location, preserved_key) = {
            let mut internals = self.lock();
            if redirect.revalidate {
                internals.is_revalidation_required = true;
            }
            // A redirect resolving a GET navigation keeps that navigation's
            // intended key, so a POP back to the origin stays stable
            let preserved_key = match (&submission, &internals.pending_location) {
                (Some(s), _) if s.is_mutation() => None,
                (_, Some(pending)) => Some(pending.key.clone()),
                _ => None,
            };
            (internals.state.location.clone(), preserved_key)
        };
        let location = create_location(&current_location.pathname, &path, None, preserved_key);

        let replace =
            action_induced_or_replace || location.to_path() == current_location.to_path();
        let history_action = if replace {
            HistoryAction::Replace
        } else {
            HistoryAction::Push
        };

        tracing::info!(
            to = %redirect.location,
            status = %redirect.status,
            revalidate = redirect.revalidate,
            "Following redirect"
        );

        let preserve_method = matches!(redirect.status.as_u16(), 307 | 308);
        match submission {
            Some(submission) if submission.is_mutation() && preserve_method => {
                // 307/308 carry the method and body forward
                let resubmission = Submission {
                    form_action: redirect.location.clone(),
                    ..submission
                };
                self.start_navigation(
                    history_action,
                    location,
                    NavigationOpts {
                        submission: Some(resubmission),
                        ..Default::default()
                    },
                )
                .await;
            }
            submission => {
                // Everything else degrades to GET; keep the submission
                // visible on the loading navigation for optimistic UI
                let loading_submission = submission
                    .filter(|s| s.is_mutation())
                    .or(fetcher_submission.clone());
                let override_navigation = Some(Navigation::Loading {
                    location: location.clone(),
                    submission: loading_submission.clone(),
                });
                self.start_navigation(
                    history_action,
                    location,
                    NavigationOpts {
                        override_navigation,
                        fetcher_submission,
                        ..Default::default()
                    },
                )
                .await;
            }
        }
    }

    fn complete_navigation(&self, nav_id: u64, location: Location, commit: CommitState) {
        let snapshot = {
            let mut internals = self.lock();
            if internals.pending_nav_id != nav_id {
                tracing::debug!(id = nav_id, "Dropping stale navigation commit");
                return;
            }

            let state = &internals.state;
            let pending_action = internals.pending_action;
            let was_initialized = state.initialized;
            let uninterrupted = internals.is_uninterrupted_revalidation;

            // actionData survives only "action succeeded at this location"
            let action_data = if commit.action_data.is_some() {
                commit.action_data
            } else if let (Some(current), Navigation::Loading { submission: Some(sub), .. }) =
                (&state.action_data, &state.navigation)
            {
                let action_pathname = sub.form_action.split('?').next().unwrap_or("");
                if sub.is_mutation() && action_pathname == location.pathname {
                    Some(current.clone())
                } else {
                    None
                }
            } else {
                None
            };

            let loader_data = merge_loader_data(
                &state.loader_data,
                commit.loader_data,
                &commit.matches,
                commit.errors.as_ref(),
            );

            // Settled streamed values need no further tracking
            internals
                .active_deferreds
                .retain(|_, deferred| !deferred.is_done());

            if was_initialized && !uninterrupted {
                match pending_action {
                    HistoryAction::Pop => {}
                    HistoryAction::Push => self.inner.history.push(location.clone()),
                    HistoryAction::Replace => self.inner.history.replace(location.clone()),
                }
            }

            let restore_scroll_position =
                get_saved_scroll_position(&internals, &location, &commit.matches);
            let prevent_scroll_reset = internals.pending_prevent_scroll_reset;

            let history_action = if uninterrupted {
                internals.state.history_action
            } else {
                pending_action
            };

            // Fetchers whose redirect this navigation resolved settle back
            // to idle with their last data
            let mut fetchers = commit
                .fetchers
                .unwrap_or_else(|| internals.state.fetchers.clone());
            for key in std::mem::take(&mut internals.fetch_redirect_ids) {
                if let Some(fetcher) = fetchers.get_mut(&key) {
                    if fetcher.state == crate::router::state::FetcherState::Loading {
                        *fetcher = Fetcher::idle(fetcher.data.clone());
                    }
                }
            }

            internals.state = RouterState {
                history_action,
                location,
                matches: commit.matches,
                initialized: true,
                navigation: Navigation::Idle,
                revalidation: RevalidationState::Idle,
                loader_data,
                action_data,
                errors: commit.errors,
                fetchers,
                prevent_scroll_reset,
                restore_scroll_position,
            };

            internals.pending_nav_id = 0;
            internals.pending_controller = None;
            internals.pending_location = None;
            internals.pending_prevent_scroll_reset = false;
            internals.is_revalidation_required = false;
            internals.is_uninterrupted_revalidation = false;
            internals.cancelled_deferred_routes.clear();

            internals.state.clone()
        };

        tracing::debug!(
            id = nav_id,
            location = %snapshot.location.to_path(),
            action = ?snapshot.history_action,
            "Navigation complete"
        );
        self.notify(&snapshot);
    }

    // ===== Fetchers =====

    /// Run a keyed fetcher: GET loads the target's loader; anything else
    /// runs its action and then revalidates the page and other fetchers.
    pub async fn fetch(
        &self,
        key: &str,
        route_id: &str,
        href: &str,
        opts: FetchOptions,
    ) -> Result<(), RouterError> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(RouterError::Disposed);
        }
        let state = self.state();
        let path = self.normalize_to(&state, To::Href(href.to_string()), opts.relative);

        {
            let mut internals = self.lock();
            internals.deleted_fetchers.remove(key);
        }

        let (path, submission) = match normalize_submission(
            path,
            opts.form_method,
            opts.form_enc_type,
            opts.form_data,
        ) {
            NormalizedSubmission::Plain { path } => (path, None),
            NormalizedSubmission::Submission { path, submission } => (path, Some(submission)),
            NormalizedSubmission::Invalid { error, .. } => {
                self.set_fetcher_error(key, route_id, RouteErrorValue::Response(error));
                return Ok(());
            }
        };

        let href = create_path(&path);
        let Some(matches) =
            match_routes(&self.inner.branches, &path.pathname, &self.inner.basename)
        else {
            self.set_fetcher_error(key, route_id, not_found_error(&path.pathname));
            return Ok(());
        };
        let target = get_target_match(&matches, &path.search).clone();

        match submission {
            Some(submission) if submission.is_mutation() => {
                self.handle_fetcher_action(key, route_id, &href, target, submission)
                    .await;
            }
            submission => {
                self.handle_fetcher_loader(key, route_id, &href, target, submission)
                    .await;
            }
        }
        Ok(())
    }

    async fn handle_fetcher_action(
        &self,
        key: &str,
        route_id: &str,
        href: &str,
        target: RouteMatch,
        submission: Submission,
    ) {
        if !target.route.has_action() {
            self.set_fetcher_error(key, route_id, no_action_error(&parse_path(href).pathname));
            return;
        }

        let controller = CancellationToken::new();
        let generation = self.next_sequence();
        self.update_state(|internals| {
            interrupt_active_loads(internals);
            abort_fetcher(internals, key);
            internals.fetch_controllers.insert(
                key.to_string(),
                FetchController {
                    generation,
                    token: controller.clone(),
                },
            );
            let data = internals
                .state
                .fetchers
                .get(key)
                .and_then(|f| f.data.clone());
            internals
                .state
                .fetchers
                .insert(key.to_string(), Fetcher::submitting(data, submission.clone()));
        });
        tracing::debug!(key, href, method = %submission.form_method, "Fetcher submitting");

        let request = create_client_request(href, controller.child_token(), Some(&submission));
        let result = call_loader_or_action(
            HandlerKind::Action,
            &target.route,
            target.params.clone(),
            request,
        )
        .await;

        if self.fetcher_superseded(key, generation) {
            return;
        }

        let action_data = match result {
            DataResult::Aborted => return,
            DataResult::Redirect(redirect) => {
                self.update_state(|internals| {
                    internals.fetch_redirect_ids.insert(key.to_string());
                    let data = internals
                        .state
                        .fetchers
                        .get(key)
                        .and_then(|f| f.data.clone());
                    internals.state.fetchers.insert(
                        key.to_string(),
                        Fetcher::loading(data, Some(submission.clone())),
                    );
                });
                // Fetcher redirects navigate from the engine's active
                // location with a push
                self.start_redirect_navigation(redirect, None, Some(submission), false)
                    .await;
                return;
            }
            DataResult::Error { error, .. } => {
                self.remove_fetch_controller_if_current(key, generation);
                self.set_fetcher_error(key, route_id, error);
                return;
            }
            DataResult::Deferred(_) => {
                self.remove_fetch_controller_if_current(key, generation);
                self.set_fetcher_error(
                    key,
                    route_id,
                    RouteErrorValue::Error(
                        "Streamed values are not supported in actions".to_string(),
                    ),
                );
                return;
            }
            DataResult::Data { value, .. } => value,
        };

        // Revalidation phase: the mutation invalidates the page's data and
        // every other fetcher's
        let load_id = self.next_sequence();
        let (next_location, next_matches, prev_matches, prev_loader_data) = {
            let mut internals = self.lock();
            internals.fetch_reload_ids.insert(key.to_string(), load_id);
            let next_location = internals
                .state
                .navigation
                .location()
                .cloned()
                .unwrap_or_else(|| internals.state.location.clone());
            let next_matches = match internals.state.navigation.location() {
                Some(nav_location) => match_routes(
                    &self.inner.branches,
                    &nav_location.pathname,
                    &self.inner.basename,
                )
                .unwrap_or_else(|| internals.state.matches.clone()),
                None => internals.state.matches.clone(),
            };
            (
                next_location,
                next_matches,
                internals.state.matches.clone(),
                internals.state.loader_data.clone(),
            )
        };

        let (matches_to_load, revalidating_fetchers) = {
            let mut internals = self.lock();
            let (loads, fetchers) = get_matches_to_load(PlanArgs {
                state: &internals.state,
                matches: &next_matches,
                location: &next_location,
                submission: Some(&submission),
                is_initial_load: false,
                is_revalidation_required: internals.is_revalidation_required,
                cancelled_deferred_routes: &internals.cancelled_deferred_routes,
                cancelled_fetcher_loads: &internals.cancelled_fetcher_loads,
                deleted_fetchers: &internals.deleted_fetchers,
                fetch_load_matches: &internals.fetch_load_matches,
                fetch_redirect_ids: &internals.fetch_redirect_ids,
                branches: &self.inner.branches,
                basename: &self.inner.basename,
                pending_action_result: None,
            });
            internals.cancelled_fetcher_loads.clear();
            let fetchers: Vec<RevalidatingFetcher> =
                fetchers.into_iter().filter(|f| f.key != key).collect();
            (loads, fetchers)
        };

        let fetcher_generations = self.install_fetch_controllers(&revalidating_fetchers);
        self.update_state(|internals| {
            internals.state.fetchers.insert(
                key.to_string(),
                Fetcher::loading(Some(action_data.clone()), Some(submission.clone())),
            );
            mark_fetchers_loading(internals, &revalidating_fetchers);
        });

        let (results, fetcher_results) = self
            .call_loaders(
                &controller,
                &next_location,
                &matches_to_load,
                &revalidating_fetchers,
            )
            .await;

        if controller.is_cancelled() {
            return;
        }

        if let Some((redirect, fetcher_key)) =
            find_redirect(&results, &fetcher_results, &revalidating_fetchers)
        {
            {
                let mut internals = self.lock();
                internals.fetch_reload_ids.remove(key);
                if let Some(redirect_key) = &fetcher_key {
                    internals.fetch_redirect_ids.insert(redirect_key.clone());
                }
            }
            self.start_redirect_navigation(redirect, None, None, false).await;
            return;
        }

        let results = resolve_navigation_deferreds(
            results,
            &matches_to_load,
            &prev_matches,
            &prev_loader_data,
            &controller,
        )
        .await;

        let commit_into_pending_navigation = {
            let mut internals = self.lock();
            let processed = process_route_loader_data(
                &next_matches,
                &matches_to_load,
                results,
                None,
                Some(&mut internals.active_deferreds),
            );
            let mut errors = processed.errors;

            let mut fetchers = internals.state.fetchers.clone();
            fetchers.insert(key.to_string(), Fetcher::idle(Some(action_data)));
            for (fetcher, result) in revalidating_fetchers.iter().zip(fetcher_results) {
                if let Some(generation) = fetcher_generations.get(&fetcher.key) {
                    remove_fetch_controller(&mut internals, &fetcher.key, *generation);
                }
                match result {
                    DataResult::Error { error, .. } => {
                        let boundary =
                            find_nearest_boundary(&prev_matches, Some(&fetcher.route_id));
                        errors
                            .get_or_insert_with(HashMap::new)
                            .entry(boundary.route.id.clone())
                            .or_insert(error);
                        fetchers.remove(&fetcher.key);
                        internals.fetch_load_matches.remove(&fetcher.key);
                    }
                    DataResult::Data { value, .. } => {
                        fetchers.insert(fetcher.key.clone(), Fetcher::idle(Some(value)));
                    }
                    _ => {}
                }
            }

            internals.fetch_reload_ids.remove(key);
            remove_fetch_controller(&mut internals, key, generation);

            let navigation_in_flight = !internals.state.navigation.is_idle();
            if navigation_in_flight && load_id > internals.pending_navigation_load_id {
                // Our data is fresher than the pending navigation's; finish
                // that navigation with it
                let pending_nav_id = internals.pending_nav_id;
                let pending_location = internals.pending_location.clone();
                if let Some(pending_controller) = internals.pending_controller.take() {
                    pending_controller.cancel();
                }
                drop(internals);
                Some((
                    pending_nav_id,
                    pending_location,
                    processed.loader_data,
                    errors,
                    fetchers,
                ))
            } else {
                internals.state.loader_data = merge_loader_data(
                    &internals.state.loader_data,
                    processed.loader_data,
                    &next_matches,
                    errors.as_ref(),
                );
                if errors.is_some() {
                    internals.state.errors = errors;
                }
                internals.state.fetchers = fetchers;
                internals.is_revalidation_required = false;
                None
            }
        };

        match commit_into_pending_navigation {
            Some((pending_nav_id, Some(pending_location), loader_data, errors, fetchers)) => {
                self.complete_navigation(
                    pending_nav_id,
                    pending_location,
                    CommitState {
                        matches: next_matches,
                        loader_data,
                        errors,
                        fetchers: Some(fetchers),
                        ..Default::default()
                    },
                );
            }
            Some((_, None, ..)) => {}
            None => {
                let snapshot = self.state();
                tracing::debug!(key, "Fetcher action complete");
                self.notify(&snapshot);
            }
        }
    }

    async fn handle_fetcher_loader(
        &self,
        key: &str,
        route_id: &str,
        href: &str,
        target: RouteMatch,
        submission: Option<Submission>,
    ) {
        let controller = CancellationToken::new();
        let generation = self.next_sequence();
        self.update_state(|internals| {
            internals.fetch_load_matches.insert(
                key.to_string(),
                FetchLoadMatch {
                    route_id: route_id.to_string(),
                    path: href.to_string(),
                },
            );
            abort_fetcher(internals, key);
            internals.fetch_controllers.insert(
                key.to_string(),
                FetchController {
                    generation,
                    token: controller.clone(),
                },
            );
            let data = internals
                .state
                .fetchers
                .get(key)
                .and_then(|f| f.data.clone());
            internals
                .state
                .fetchers
                .insert(key.to_string(), Fetcher::loading(data, submission.clone()));
        });
        tracing::debug!(key, href, "Fetcher loading");

        let request = create_client_request(href, controller.child_token(), None);
        let result = call_loader_or_action(
            HandlerKind::Loader,
            &target.route,
            target.params.clone(),
            request,
        )
        .await;
        // Fetchers always observe fully-settled streamed values
        let result = resolve_fetcher_deferred(result, &controller).await;

        if self.fetcher_superseded(key, generation) {
            return;
        }

        match result {
            DataResult::Aborted => {}
            DataResult::Redirect(redirect) => {
                {
                    let mut internals = self.lock();
                    internals.fetch_redirect_ids.insert(key.to_string());
                }
                self.start_redirect_navigation(redirect, None, None, false).await;
            }
            DataResult::Error { error, .. } => {
                self.remove_fetch_controller_if_current(key, generation);
                self.set_fetcher_error(key, route_id, error);
            }
            DataResult::Data { value, .. } => {
                self.remove_fetch_controller_if_current(key, generation);
                self.update_state(|internals| {
                    internals
                        .state
                        .fetchers
                        .insert(key.to_string(), Fetcher::idle(Some(value)));
                });
                tracing::debug!(key, "Fetcher load complete");
            }
            DataResult::Deferred(_) => {}
        }
    }

    fn fetcher_superseded(&self, key: &str, generation: u64) -> bool {
        let internals = self.lock();
        if internals.deleted_fetchers.contains(key) {
            return true;
        }
        internals
            .fetch_controllers
            .get(key)
            .map_or(true, |controller| controller.generation != generation)
    }

    fn remove_fetch_controller_if_current(&self, key: &str, generation: u64) {
        let mut internals = self.lock();
        remove_fetch_controller(&mut internals, key, generation);
    }

    fn set_fetcher_error(&self, key: &str, route_id: &str, error: RouteErrorValue) {
        tracing::warn!(key, route_id, error = %error.message(), "Fetcher error");
        self.update_state(|internals| {
            let boundary = find_nearest_boundary(&internals.state.matches, Some(route_id))
                .route
                .id
                .clone();
            let mut errors = internals.state.errors.clone().unwrap_or_default();
            errors.insert(boundary, error);
            internals.state.errors = Some(errors);
            internals.state.fetchers.remove(key);
            internals.fetch_load_matches.remove(key);
        });
    }

    /// Current fetcher state; unknown keys read as idle with no data.
    pub fn get_fetcher(&self, key: &str) -> Fetcher {
        self.lock()
            .state
            .fetchers
            .get(key)
            .cloned()
            .unwrap_or_else(|| Fetcher::idle(None))
    }

    /// Abort and forget a fetcher.
    pub fn delete_fetcher(&self, key: &str) {
        self.update_state(|internals| {
            abort_fetcher(internals, key);
            internals.state.fetchers.remove(key);
            internals.fetch_load_matches.remove(key);
            internals.fetch_reload_ids.remove(key);
            internals.fetch_redirect_ids.remove(key);
            internals.deleted_fetchers.insert(key.to_string());
        });
        tracing::debug!(key, "Fetcher deleted");
    }

    // ===== Scroll restoration =====

    /// Wire up scroll position capture/restore. `positions` is the caller's
    /// storage (so it may persist it); `get_scroll_position` samples the
    /// current offset; `get_key` overrides the per-entry key.
    pub fn enable_scroll_restoration<P>(
        &self,
        positions: ScrollPositions,
        get_scroll_position: P,
        get_key: Option<GetScrollKey>,
    ) where
        P: Fn() -> f64 + Send + Sync + 'static,
    {
        let mut internals = self.lock();
        internals.scroll_positions = Some(positions);
        internals.get_scroll_position = Some(Arc::new(get_scroll_position));
        internals.get_scroll_key = get_key;
    }

    // ===== Lifecycle =====

    /// Tear down: abort all in-flight work and release internal resources.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        {
            let mut internals = self.lock();
            if let Some(controller) = internals.pending_controller.take() {
                controller.cancel();
            }
            for (_, controller) in internals.fetch_controllers.drain() {
                controller.token.cancel();
            }
            for (_, deferred) in internals.active_deferreds.drain() {
                deferred.cancel();
            }
            internals.fetch_load_matches.clear();
            internals.state.fetchers.clear();
        }
        self.inner.subscribers.clear();
        tracing::debug!("Router disposed");
    }
}

// Mutations and explicit revalidations invalidate everything in flight
fn interrupt_active_loads(internals: &mut Internals) {
    internals.is_revalidation_required = true;
    let cancelled = cancel_active_deferreds(internals, |_| true);
    internals.cancelled_deferred_routes.extend(cancelled);

    let keys: Vec<String> = internals.fetch_load_matches.keys().cloned().collect();
    for key in keys {
        if let Some(controller) = internals.fetch_controllers.remove(&key) {
            controller.token.cancel();
            internals.cancelled_fetcher_loads.insert(key);
        }
    }
}

fn mark_fetchers_loading(internals: &mut Internals, revalidating_fetchers: &[RevalidatingFetcher]) {
    for fetcher in revalidating_fetchers {
        let data = internals
            .state
            .fetchers
            .get(&fetcher.key)
            .and_then(|f| f.data.clone());
        internals
            .state
            .fetchers
            .insert(fetcher.key.clone(), Fetcher::loading(data, None));
    }
}

fn abort_fetcher(internals: &mut Internals, key: &str) {
    if let Some(controller) = internals.fetch_controllers.remove(key) {
        controller.token.cancel();
    }
}

fn remove_fetch_controller(internals: &mut Internals, key: &str, generation: u64) {
    if internals
        .fetch_controllers
        .get(key)
        .is_some_and(|controller| controller.generation == generation)
    {
        internals.fetch_controllers.remove(key);
    }
}

fn save_scroll_position(internals: &mut Internals) {
    let (Some(positions), Some(get_position)) = (
        internals.scroll_positions.clone(),
        internals.get_scroll_position.clone(),
    ) else {
        return;
    };
    let key = scroll_key(internals, &internals.state.location, &internals.state.matches);
    if let Ok(mut positions) = positions.lock() {
        positions.insert(key, get_position());
    };
}

fn get_saved_scroll_position(
    internals: &Internals,
    location: &Location,
    matches: &[RouteMatch],
) -> RestoreScroll {
    let Some(positions) = &internals.scroll_positions else {
        return RestoreScroll::Disabled;
    };
    let key = scroll_key(internals, location, matches);
    match positions.lock() {
        Ok(positions) => match positions.get(&key) {
            Some(y) => RestoreScroll::Position(*y),
            None => RestoreScroll::Unsaved,
        },
        Err(_) => RestoreScroll::Unsaved,
    }
}

fn scroll_key(internals: &Internals, location: &Location, matches: &[RouteMatch]) -> String {
    internals
        .get_scroll_key
        .as_ref()
        .and_then(|get_key| get_key(location, matches))
        .unwrap_or_else(|| location.key.clone())
}

fn cancel_active_deferreds(
    internals: &mut Internals,
    predicate: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut cancelled = Vec::new();
    internals.active_deferreds.retain(|route_id, deferred| {
        if predicate(route_id) {
            if deferred.cancel() {
                cancelled.push(route_id.clone());
            }
            false
        } else {
            true
        }
    });
    cancelled
}

fn is_hash_change_only(current: &Location, next: &Location) -> bool {
    current.pathname == next.pathname
        && current.search == next.search
        && current.hash != next.hash
}

fn strip_hash_href(location: &Location) -> String {
    create_path(&Path {
        pathname: location.pathname.clone(),
        search: location.search.clone(),
        hash: String::new(),
    })
}

fn action_error_map(
    pending: &(String, ActionOutcome),
) -> Option<HashMap<String, RouteErrorValue>> {
    match pending {
        (boundary_id, ActionOutcome::Error(error)) => {
            let mut errors = HashMap::new();
            errors.insert(boundary_id.clone(), error.clone());
            Some(errors)
        }
        _ => None,
    }
}

fn action_data_map(pending: &(String, ActionOutcome)) -> Option<HashMap<String, Value>> {
    match pending {
        (route_id, ActionOutcome::Data(value)) => {
            let mut data = HashMap::new();
            data.insert(route_id.clone(), value.clone());
            Some(data)
        }
        _ => None,
    }
}

fn find_redirect(
    results: &[DataResult],
    fetcher_results: &[DataResult],
    revalidating_fetchers: &[RevalidatingFetcher],
) -> Option<(RedirectResult, Option<String>)> {
    for result in results {
        if let DataResult::Redirect(redirect) = result {
            return Some((redirect.clone(), None));
        }
    }
    for (fetcher, result) in revalidating_fetchers.iter().zip(fetcher_results) {
        if let DataResult::Redirect(redirect) = result {
            return Some((redirect.clone(), Some(fetcher.key.clone())));
        }
    }
    None
}

/// Unwrap a streamed result to settled data, or mark it aborted.
async fn resolve_fetcher_deferred(
    result: DataResult,
    controller: &CancellationToken,
) -> DataResult {
    match result {
        DataResult::Deferred(deferred) => {
            let aborted = deferred.resolve_data(controller).await;
            if aborted {
                DataResult::Aborted
            } else {
                DataResult::Data {
                    value: deferred.unwrapped_data(),
                    status: None,
                    headers: None,
                }
            }
        }
        other => other,
    }
}

/// Revalidated route instances wait for their streamed values; only fresh
/// instances commit partially and stream to the UI.
async fn resolve_navigation_deferreds(
    results: Vec<DataResult>,
    matches_to_load: &[RouteMatch],
    prev_matches: &[RouteMatch],
    prev_loader_data: &HashMap<String, RouteData>,
    controller: &CancellationToken,
) -> Vec<DataResult> {
    let resolved = results
        .into_iter()
        .zip(matches_to_load)
        .map(|(result, route_match)| async move {
            let DataResult::Deferred(deferred) = &result else {
                return result;
            };
            let current = prev_matches
                .iter()
                .find(|m| m.route.id == route_match.route.id);
            let is_revalidating = current.is_some_and(|current| {
                current.pathname == route_match.pathname
                    && prev_loader_data.contains_key(&route_match.route.id)
            });
            if !is_revalidating {
                return result;
            }
            let aborted = deferred.resolve_data(controller).await;
            if aborted {
                DataResult::Aborted
            } else {
                DataResult::Data {
                    value: deferred.unwrapped_data(),
                    status: None,
                    headers: None,
                }
            }
        });
    join_all(resolved).await
}
