//! Observable router state.
//!
//! # Responsibilities
//! - The single state snapshot UI layers subscribe to
//! - Navigation and fetcher sub-states
//! - Factory and per-call option structs
//!
//! # Design Decisions
//! - Snapshots are plain data: cloning one is cheap (`Arc`s and `Value`s)
//!   and subscribers treat them as immutable
//! - Serialization uses camelCase keys so hydration payloads match the
//!   wire shape SSR produced

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::deferred::DeferredData;
use crate::error::RouteErrorValue;
use crate::history::{History, HistoryAction, Location};
use crate::matching::{Route, RouteMatch};
use crate::request::{FormData, FormEncType, Submission};

/// Factory input for [`create_router`](crate::create_router).
pub struct RouterInit {
    pub routes: Vec<Route>,
    pub history: Arc<dyn History>,
    /// App mount point; stripped before matching, prepended to hrefs.
    pub basename: String,
    /// Server-rendered data to hydrate from.
    pub hydration_data: Option<HydrationData>,
}

impl RouterInit {
    pub fn new(routes: Vec<Route>, history: Arc<dyn History>) -> Self {
        Self {
            routes,
            history,
            basename: "/".to_string(),
            hydration_data: None,
        }
    }

    pub fn basename(mut self, basename: impl Into<String>) -> Self {
        self.basename = basename.into();
        self
    }

    pub fn hydration_data(mut self, hydration_data: HydrationData) -> Self {
        self.hydration_data = Some(hydration_data);
        self
    }
}

/// Server-rendered state keyed by route id.
#[derive(Debug, Clone, Default)]
pub struct HydrationData {
    pub loader_data: HashMap<String, Value>,
    pub action_data: Option<HashMap<String, Value>>,
    pub errors: Option<HashMap<String, RouteErrorValue>>,
}

/// Revive a serialized error map (`__type`-tagged payload) for hydration.
pub fn revive_errors(serialized: &HashMap<String, Value>) -> HashMap<String, RouteErrorValue> {
    serialized
        .iter()
        .map(|(id, value)| (id.clone(), revive_error(value)))
        .collect()
}

fn revive_error(value: &Value) -> RouteErrorValue {
    match value.get("__type").and_then(Value::as_str) {
        Some("RouteErrorResponse") => {
            let status = value
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| http::StatusCode::from_u16(s as u16).ok())
                .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
            RouteErrorValue::Response(crate::error::ErrorResponse {
                status,
                status_text: value
                    .get("statusText")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| crate::error::status_text(status)),
                data: value.get("data").cloned().unwrap_or(Value::Null),
                internal: value
                    .get("internal")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        }
        Some("Error") => RouteErrorValue::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unexpected error")
                .to_string(),
        ),
        _ => RouteErrorValue::Data(value.clone()),
    }
}

/// The in-flight navigation, if any.
#[derive(Debug, Clone)]
pub enum Navigation {
    Idle,
    /// GET navigation (or post-action loading phase). Keeps the submission
    /// fields so the UI can render optimistic state through revalidation.
    Loading {
        location: Location,
        submission: Option<Submission>,
    },
    /// Non-GET navigation running its action.
    Submitting {
        location: Location,
        submission: Submission,
    },
}

impl Navigation {
    pub fn is_idle(&self) -> bool {
        matches!(self, Navigation::Idle)
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            Navigation::Idle => None,
            Navigation::Loading { location, .. } | Navigation::Submitting { location, .. } => {
                Some(location)
            }
        }
    }

    pub fn submission(&self) -> Option<&Submission> {
        match self {
            Navigation::Idle => None,
            Navigation::Loading { submission, .. } => submission.as_ref(),
            Navigation::Submitting { submission, .. } => Some(submission),
        }
    }

    pub fn form_method(&self) -> Option<&Method> {
        self.submission().map(|s| &s.form_method)
    }

    fn state_str(&self) -> &'static str {
        match self {
            Navigation::Idle => "idle",
            Navigation::Loading { .. } => "loading",
            Navigation::Submitting { .. } => "submitting",
        }
    }
}

impl Serialize for Navigation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("state", self.state_str())?;
        if let Some(location) = self.location() {
            map.serialize_entry("location", location)?;
        }
        if let Some(submission) = self.submission() {
            map.serialize_entry("formMethod", &submission.form_method.as_str().to_lowercase())?;
            map.serialize_entry("formEncType", &submission.form_enc_type)?;
            map.serialize_entry("formData", &submission.form_data)?;
            map.serialize_entry("formAction", &submission.form_action)?;
        }
        map.end()
    }
}

/// Whether a `revalidate()` pass is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RevalidationState {
    Idle,
    Loading,
}

/// Fetcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetcherState {
    Idle,
    Loading,
    Submitting,
}

/// A keyed data operation independent of the active navigation.
#[derive(Debug, Clone, Serialize)]
pub struct Fetcher {
    pub state: FetcherState,
    /// Last committed data; idle fetchers keep it until deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub submission: Option<Submission>,
}

impl Fetcher {
    pub(crate) fn idle(data: Option<Value>) -> Self {
        Self {
            state: FetcherState::Idle,
            data,
            submission: None,
        }
    }

    pub(crate) fn loading(data: Option<Value>, submission: Option<Submission>) -> Self {
        Self {
            state: FetcherState::Loading,
            data,
            submission,
        }
    }

    pub(crate) fn submitting(data: Option<Value>, submission: Submission) -> Self {
        Self {
            state: FetcherState::Submitting,
            data,
            submission: Some(submission),
        }
    }
}

/// One route's committed loader data: plain or streamed.
#[derive(Debug, Clone)]
pub enum RouteData {
    Value(Value),
    Deferred(Arc<DeferredData>),
}

impl RouteData {
    /// The plain value, or the current snapshot of a streamed value.
    pub fn value(&self) -> Value {
        match self {
            RouteData::Value(value) => value.clone(),
            RouteData::Deferred(deferred) => deferred.unwrapped_data(),
        }
    }

    pub fn deferred(&self) -> Option<&Arc<DeferredData>> {
        match self {
            RouteData::Deferred(deferred) => Some(deferred),
            RouteData::Value(_) => None,
        }
    }
}

impl PartialEq for RouteData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RouteData::Value(a), RouteData::Value(b)) => a == b,
            (RouteData::Deferred(a), RouteData::Deferred(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Serialize for RouteData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value().serialize(serializer)
    }
}

impl From<Value> for RouteData {
    fn from(value: Value) -> Self {
        RouteData::Value(value)
    }
}

/// Scroll hint carried on each committed snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RestoreScroll {
    /// Restoration is not applicable (disabled, or a fresh entry).
    Disabled,
    /// Restoration applies but no position was saved for this entry.
    Unsaved,
    /// Restore to this saved Y offset.
    Position(f64),
}

impl Serialize for RestoreScroll {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RestoreScroll::Disabled => serializer.serialize_bool(false),
            RestoreScroll::Unsaved => serializer.serialize_none(),
            RestoreScroll::Position(y) => serializer.serialize_f64(*y),
        }
    }
}

/// The single observable snapshot. Every commit replaces changed top-level
/// fields; subscribers compare references, not contents.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterState {
    pub history_action: HistoryAction,
    pub location: Location,
    pub matches: Vec<RouteMatch>,
    pub initialized: bool,
    pub navigation: Navigation,
    pub revalidation: RevalidationState,
    pub loader_data: HashMap<String, RouteData>,
    pub action_data: Option<HashMap<String, Value>>,
    pub errors: Option<HashMap<String, RouteErrorValue>>,
    pub fetchers: HashMap<String, Fetcher>,
    pub prevent_scroll_reset: bool,
    pub restore_scroll_position: RestoreScroll,
}

/// Options for [`Router::navigate`](crate::Router::navigate).
#[derive(Default, Clone)]
pub struct NavigateOptions {
    /// Replace the current history entry instead of pushing.
    pub replace: bool,
    /// Opaque state stored on the new location.
    pub state: Option<Value>,
    /// Suppress the scroll-to-top hint for this navigation.
    pub prevent_scroll_reset: bool,
    pub form_method: Option<Method>,
    pub form_enc_type: Option<FormEncType>,
    pub form_data: Option<FormData>,
    /// How relative targets resolve: against the route hierarchy or the URL.
    pub relative: RelativeRouting,
}

impl NavigateOptions {
    /// Shorthand for a form submission.
    pub fn submit(method: Method, form_data: FormData) -> Self {
        Self {
            form_method: Some(method),
            form_data: Some(form_data),
            ..Self::default()
        }
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }
}

/// Options for [`Router::fetch`](crate::Router::fetch).
#[derive(Default, Clone)]
pub struct FetchOptions {
    pub form_method: Option<Method>,
    pub form_enc_type: Option<FormEncType>,
    pub form_data: Option<FormData>,
    pub relative: RelativeRouting,
}

impl FetchOptions {
    pub fn submit(method: Method, form_data: FormData) -> Self {
        Self {
            form_method: Some(method),
            form_data: Some(form_data),
            ..Self::default()
        }
    }
}

/// Relative target resolution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelativeRouting {
    /// Resolve against the matched route hierarchy.
    #[default]
    Route,
    /// Resolve against the URL path, one segment per `..`.
    Path,
}

/// Where a fetcher last loaded from; drives its revalidation.
#[derive(Debug, Clone)]
pub(crate) struct FetchLoadMatch {
    pub route_id: String,
    pub path: String,
}
