//! Streamed loader values.
//!
//! # Responsibilities
//! - Wrap loader results that mix settled fields and in-flight futures
//! - Track per-key status (pending / resolved / rejected / aborted)
//! - Bulk-abort pending fields when a transition invalidates them
//!
//! # Data Flow
//! ```text
//! loader returns Deferred (values + futures)
//!     → DeferredData spawns one task per future
//!     → settles record into the shared entry map, waiters notified
//!
//! cancel(): pending entries flip to Aborted synchronously;
//!           late settlements of cancelled futures are discarded
//! ```
//!
//! # Design Decisions
//! - `cancel` marks entries aborted before the tasks observe the token, so
//!   state is deterministic the moment a transition decides to cancel
//! - Settled entries are never overwritten, in either direction
//! - Await-all (`resolve_data`) serves SSR and revalidations; client
//!   navigations commit the synchronous portion immediately

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{RouteError, RouteErrorValue};

/// A streamed value under construction, returned from a loader.
#[derive(Default)]
pub struct Deferred {
    pub(crate) entries: Vec<(String, DeferredEntry)>,
}

pub(crate) enum DeferredEntry {
    Value(Value),
    Future(BoxFuture<'static, Result<Value, RouteError>>),
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    /// A field that is already settled.
    pub fn value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries
            .push((key.into(), DeferredEntry::Value(value.into())));
        self
    }

    /// A field that settles later. The engine tracks it; untracked futures
    /// never exist here, so a plain-object loader result streams nothing.
    pub fn future<F>(mut self, key: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<Value, RouteError>> + Send + 'static,
    {
        self.entries
            .push((key.into(), DeferredEntry::Future(future.boxed())));
        self
    }
}

/// Status of one streamed field.
#[derive(Debug, Clone, PartialEq)]
pub enum DeferredState {
    Pending,
    Resolved(Value),
    Rejected(RouteErrorValue),
    /// Cancelled before settling; distinguishable from a normal rejection.
    Aborted,
}

impl DeferredState {
    pub fn is_pending(&self) -> bool {
        matches!(self, DeferredState::Pending)
    }
}

/// Tracked streamed data for one route, shared with the view layer through
/// `loaderData`.
pub struct DeferredData {
    entries: Mutex<HashMap<String, DeferredState>>,
    keys: Vec<String>,
    pending: AtomicUsize,
    cancelled: AtomicBool,
    token: CancellationToken,
    notify: Notify,
}

impl DeferredData {
    pub(crate) fn new(deferred: Deferred, parent_signal: &CancellationToken) -> Arc<Self> {
        let mut entries = HashMap::new();
        let mut keys = Vec::new();
        let mut futures = Vec::new();

        for (key, entry) in deferred.entries {
            keys.push(key.clone());
            match entry {
                DeferredEntry::Value(value) => {
                    entries.insert(key, DeferredState::Resolved(value));
                }
                DeferredEntry::Future(future) => {
                    entries.insert(key.clone(), DeferredState::Pending);
                    futures.push((key, future));
                }
            }
        }

        let data = Arc::new(Self {
            entries: Mutex::new(entries),
            keys,
            pending: AtomicUsize::new(futures.len()),
            cancelled: AtomicBool::new(false),
            token: parent_signal.child_token(),
            notify: Notify::new(),
        });

        for (key, future) in futures {
            let weak = Arc::downgrade(&data);
            let token = data.token.clone();
            tokio::spawn(track(weak, token, key, future));
        }

        data
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeferredState>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keys in declaration order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Current status of a field.
    pub fn state(&self, key: &str) -> Option<DeferredState> {
        self.lock().get(key).cloned()
    }

    /// True once no field is pending.
    pub fn is_done(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Abort all pending fields. Settled fields are untouched; later
    /// settlements of the aborted futures are discarded. Returns whether
    /// anything was actually pending.
    pub(crate) fn cancel(&self) -> bool {
        let mut had_pending = false;
        {
            let mut entries = self.lock();
            for state in entries.values_mut() {
                if state.is_pending() {
                    *state = DeferredState::Aborted;
                    had_pending = true;
                }
            }
        }
        if had_pending {
            self.cancelled.store(true, Ordering::SeqCst);
            self.pending.store(0, Ordering::SeqCst);
            self.token.cancel();
            self.notify.notify_waiters();
        }
        had_pending
    }

    /// Await every tracked field (SSR and revalidation path). Returns true
    /// if the wait ended by cancellation rather than settlement.
    pub(crate) async fn resolve_data(&self, signal: &CancellationToken) -> bool {
        loop {
            if self.is_done() {
                return self.is_cancelled();
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = signal.cancelled() => {
                    self.cancel();
                    return true;
                }
                _ = notified => {}
            }
        }
    }

    /// Wait until a field settles, returning its terminal state. `None` for
    /// unknown keys.
    pub async fn wait(&self, key: &str) -> Option<DeferredState> {
        loop {
            let notified = self.notify.notified();
            match self.state(key) {
                None => return None,
                Some(DeferredState::Pending) => notified.await,
                Some(settled) => return Some(settled),
            }
        }
    }

    /// Snapshot of the data: resolved values, with rejected/aborted fields
    /// rendered as tagged placeholders and pending fields as `null`.
    pub fn unwrapped_data(&self) -> Value {
        let entries = self.lock();
        let mut out = Map::new();
        for key in &self.keys {
            let rendered = match entries.get(key) {
                Some(DeferredState::Resolved(value)) => value.clone(),
                Some(DeferredState::Rejected(error)) => {
                    serde_json::to_value(error).unwrap_or(Value::Null)
                }
                Some(DeferredState::Aborted) => {
                    Value::String("__deferred_aborted".to_string())
                }
                Some(DeferredState::Pending) | None => Value::Null,
            };
            out.insert(key.clone(), rendered);
        }
        Value::Object(out)
    }

    // The abort path taken when the parent signal dies without an explicit
    // cancel(): each task flips its own entry.
    fn abort_entry(&self, key: &str) {
        let mut entries = self.lock();
        let Some(state) = entries.get_mut(key) else {
            return;
        };
        if !state.is_pending() {
            return;
        }
        *state = DeferredState::Aborted;
        drop(entries);
        self.cancelled.store(true, Ordering::SeqCst);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn settle(&self, key: &str, result: Result<Value, RouteError>) {
        let mut entries = self.lock();
        let Some(state) = entries.get_mut(key) else {
            return;
        };
        if !state.is_pending() {
            // Cancelled while the task raced us; drop the late settlement
            return;
        }
        *state = match result {
            Ok(value) => DeferredState::Resolved(value),
            Err(error) => DeferredState::Rejected(RouteErrorValue::from_thrown(error)),
        };
        drop(entries);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for DeferredData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredData")
            .field("keys", &self.keys)
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

async fn track(
    data: Weak<DeferredData>,
    token: CancellationToken,
    key: String,
    future: BoxFuture<'static, Result<Value, RouteError>>,
) {
    tokio::select! {
        _ = token.cancelled() => {
            if let Some(data) = data.upgrade() {
                data.abort_entry(&key);
            }
        }
        result = future => {
            if let Some(data) = data.upgrade() {
                data.settle(&key, result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn tracked(deferred: Deferred) -> (Arc<DeferredData>, CancellationToken) {
        let signal = CancellationToken::new();
        (DeferredData::new(deferred, &signal), signal)
    }

    #[tokio::test]
    async fn test_sync_fields_resolve_immediately() {
        let (data, _signal) = tracked(Deferred::new().value("critical", json!("now")));
        assert!(data.is_done());
        assert_eq!(data.state("critical"), Some(DeferredState::Resolved(json!("now"))));
    }

    #[tokio::test]
    async fn test_futures_settle_and_notify() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let (data, _signal) = tracked(
            Deferred::new()
                .value("critical", json!(1))
                .future("slow", async move {
                    let value = rx.await.map_err(|_| RouteError::error("dropped"))?;
                    Ok(value)
                }),
        );

        assert!(!data.is_done());
        assert_eq!(data.state("slow"), Some(DeferredState::Pending));

        tx.send(json!("later")).unwrap();
        let settled = data.wait("slow").await.unwrap();
        assert_eq!(settled, DeferredState::Resolved(json!("later")));
        assert!(data.is_done());
    }

    #[tokio::test]
    async fn test_cancel_marks_pending_aborted_only() {
        let (data, _signal) = tracked(
            Deferred::new()
                .value("done", json!(true))
                .future("never", std::future::pending()),
        );

        assert!(data.cancel());
        assert_eq!(data.state("never"), Some(DeferredState::Aborted));
        assert_eq!(data.state("done"), Some(DeferredState::Resolved(json!(true))));
        assert!(data.is_done());
        assert!(data.is_cancelled());

        // Idempotent once nothing is pending
        assert!(!data.cancel());
    }

    #[tokio::test]
    async fn test_late_settlement_after_cancel_is_discarded() {
        let (tx, rx) = tokio::sync::oneshot::channel::<Value>();
        let (data, _signal) = tracked(Deferred::new().future("field", async move {
            Ok(rx.await.unwrap_or(json!("fallback")))
        }));

        data.cancel();
        let _ = tx.send(json!("too late"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(data.state("field"), Some(DeferredState::Aborted));
    }

    #[tokio::test]
    async fn test_resolve_data_awaits_all() {
        let (data, signal) = tracked(
            Deferred::new()
                .future("a", async { Ok(json!(1)) })
                .future("b", async { Err(RouteError::error("nope")) }),
        );

        let aborted = data.resolve_data(&signal).await;
        assert!(!aborted);
        assert_eq!(data.state("a"), Some(DeferredState::Resolved(json!(1))));
        assert!(matches!(
            data.state("b"),
            Some(DeferredState::Rejected(RouteErrorValue::Error(message))) if message == "nope"
        ));
    }

    #[tokio::test]
    async fn test_resolve_data_observes_signal() {
        let (data, signal) = tracked(Deferred::new().future("field", std::future::pending()));
        signal.cancel();
        let aborted = data.resolve_data(&signal).await;
        assert!(aborted);
        assert_eq!(data.state("field"), Some(DeferredState::Aborted));
    }
}
