//! Shared utilities for router integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;
use waypoint::{LoaderArgs, LoaderResult, Router, RouterState, RouteValue};

/// A loader that always returns the same value.
pub fn static_loader(
    value: Value,
) -> impl Fn(LoaderArgs) -> std::pin::Pin<Box<dyn std::future::Future<Output = LoaderResult> + Send>>
       + Send
       + Sync
       + 'static {
    move |_args| {
        let value = value.clone();
        Box::pin(async move { Ok(RouteValue::Data(value)) })
    }
}

/// A loader returning `"<tag>-<n>"` where n counts invocations.
pub fn counting_loader(
    tag: &'static str,
    counter: Arc<AtomicUsize>,
) -> impl Fn(LoaderArgs) -> std::pin::Pin<Box<dyn std::future::Future<Output = LoaderResult> + Send>>
       + Send
       + Sync
       + 'static {
    move |_args| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Ok(RouteValue::Data(json!(format!("{tag}-{n}")))) })
    }
}

/// A manually-released latch for holding a handler mid-flight.
pub struct Gate {
    notify: Notify,
    open: AtomicBool,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            open: AtomicBool::new(false),
        })
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        loop {
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.notify.notified();
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Poll the router until `predicate` holds; panics after ~2s.
pub async fn wait_for<F>(router: &Router, what: &str, predicate: F) -> RouterState
where
    F: Fn(&RouterState) -> bool,
{
    for _ in 0..400 {
        let state = router.state();
        if predicate(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Loader data entry as a plain value, for assertions.
pub fn loader_value(state: &RouterState, id: &str) -> Option<Value> {
    state.loader_data.get(id).map(|data| data.value())
}
