//! Streamed (deferred) loader value integration tests.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{loader_value, Gate};
use serde_json::json;
use waypoint::{
    create_router, Deferred, DeferredState, FetchOptions, FetcherState, MemoryHistory,
    NavigateOptions, Route, RouterInit, RouteValue,
};

fn invoice_routes(gate_one: Arc<Gate>, gate_two: Arc<Gate>) -> Vec<Route> {
    vec![Route::new("/")
        .id("root")
        .error_boundary()
        .children(vec![
            Route::index().id("home"),
            Route::new("invoices/:id").id("invoice").loader(move |args| {
                let id = args.params["id"].clone();
                let gate = if id == "1" { gate_one.clone() } else { gate_two.clone() };
                async move {
                    let slow_id = id.clone();
                    Ok(RouteValue::Deferred(
                        Deferred::new()
                            .value("critical", json!(format!("INV {id}")))
                            .future("slow", async move {
                                gate.wait().await;
                                Ok(json!(format!("SLOW {slow_id}")))
                            }),
                    ))
                }
            }),
        ])]
}

#[tokio::test]
async fn test_new_route_instance_cancels_pending_deferred() {
    let gate_one = Gate::new();
    let gate_two = Gate::new();
    let router = create_router(RouterInit::new(
        invoice_routes(gate_one.clone(), gate_two.clone()),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    // Partial commit: the navigation lands while "slow" is still pending
    router.navigate("/invoices/1", NavigateOptions::default()).await.unwrap();
    let state = router.state();
    let first = state.loader_data["invoice"].deferred().unwrap().clone();
    assert_eq!(first.state("critical"), Some(DeferredState::Resolved(json!("INV 1"))));
    assert_eq!(first.state("slow"), Some(DeferredState::Pending));

    // A new dynamic instance of the same route aborts the old stream
    router.navigate("/invoices/2", NavigateOptions::default()).await.unwrap();
    assert_eq!(first.state("slow"), Some(DeferredState::Aborted));

    let state = router.state();
    let second = state.loader_data["invoice"].deferred().unwrap().clone();
    assert_eq!(second.state("critical"), Some(DeferredState::Resolved(json!("INV 2"))));
    assert_eq!(second.state("slow"), Some(DeferredState::Pending));

    // A late resolution of the aborted stream changes nothing
    gate_one.open();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(first.state("slow"), Some(DeferredState::Aborted));
    assert_eq!(second.state("slow"), Some(DeferredState::Pending));

    gate_two.open();
    let settled = second.wait("slow").await.unwrap();
    assert_eq!(settled, DeferredState::Resolved(json!("SLOW 2")));
}

#[tokio::test]
async fn test_revalidation_cancels_and_awaits_in_full() {
    let gate_one = Gate::new();
    let gate_two = Gate::new();
    let router = create_router(RouterInit::new(
        invoice_routes(gate_one.clone(), gate_two.clone()),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    router.navigate("/invoices/1", NavigateOptions::default()).await.unwrap();
    let first = router.state().loader_data["invoice"].deferred().unwrap().clone();
    assert_eq!(first.state("slow"), Some(DeferredState::Pending));

    // Revalidation kills the old stream, re-runs the loader, and waits for
    // the replacement to settle before committing
    let revalidator = router.clone();
    let revalidate_task = tokio::spawn(async move { revalidator.revalidate().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(first.state("slow"), Some(DeferredState::Aborted));

    gate_one.open();
    revalidate_task.await.unwrap();

    let state = router.state();
    assert!(state.navigation.is_idle());
    assert_eq!(
        loader_value(&state, "invoice"),
        Some(json!({"critical": "INV 1", "slow": "SLOW 1"}))
    );
}

#[tokio::test]
async fn test_fetchers_always_observe_settled_streams() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let routes = vec![Route::new("/")
        .id("root")
        .error_boundary()
        .children(vec![
            Route::index().id("home"),
            Route::new("stream").id("stream").loader(move |_args| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(RouteValue::Deferred(
                        Deferred::new()
                            .value("fast", json!(1))
                            .future("later", async {
                                tokio::time::sleep(Duration::from_millis(10)).await;
                                Ok(json!(2))
                            }),
                    ))
                }
            }),
        ])];
    let router =
        create_router(RouterInit::new(routes, MemoryHistory::new(&["/"]))).unwrap();
    router.initialize().await.unwrap();

    router
        .fetch("s", "root", "/stream", FetchOptions::default())
        .await
        .unwrap();

    // The fetcher committed only after every field settled
    let fetcher = router.get_fetcher("s");
    assert_eq!(fetcher.state, FetcherState::Idle);
    assert_eq!(fetcher.data, Some(json!({"fast": 1, "later": 2})));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
