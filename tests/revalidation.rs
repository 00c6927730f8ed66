//! Revalidation policy integration tests.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::counting_loader;
use http::Method;
use serde_json::json;
use waypoint::{
    create_router, FormData, MemoryHistory, NavigateOptions, Route, RouterInit, RouteValue,
};

struct Counters {
    root: Arc<AtomicUsize>,
    opt_out: Arc<AtomicUsize>,
    deferring: Arc<AtomicUsize>,
    search: Arc<AtomicUsize>,
}

fn policy_routes(counters: &Counters) -> Vec<Route> {
    vec![Route::new("/")
        .id("root")
        .error_boundary()
        .loader(counting_loader("ROOT", counters.root.clone()))
        .children(vec![
            Route::index().id("home"),
            Route::new("page").id("page").children(vec![
                Route::index().id("page-index"),
                Route::new("opt-out")
                    .id("opt-out")
                    .loader(counting_loader("OPT", counters.opt_out.clone()))
                    .action(|_args| async { Ok(RouteValue::Data(json!("ACTED"))) })
                    .should_revalidate(|_args| Some(false)),
                Route::new("deferring")
                    .id("deferring")
                    .loader(counting_loader("DEF", counters.deferring.clone()))
                    .action(|_args| async { Ok(RouteValue::Data(json!("ACTED"))) })
                    .should_revalidate(|_args| None),
            ]),
            Route::new("search")
                .id("search")
                .loader(counting_loader("SEARCH", counters.search.clone())),
        ])]
}

fn counters() -> Counters {
    Counters {
        root: Arc::new(AtomicUsize::new(0)),
        opt_out: Arc::new(AtomicUsize::new(0)),
        deferring: Arc::new(AtomicUsize::new(0)),
        search: Arc::new(AtomicUsize::new(0)),
    }
}

#[tokio::test]
async fn test_strict_false_opts_out_of_forced_revalidation() {
    let counters = counters();
    let router = create_router(RouterInit::new(
        policy_routes(&counters),
        MemoryHistory::new(&["/page/opt-out"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();
    assert_eq!(counters.opt_out.load(Ordering::SeqCst), 1);

    // A mutation defaults every loader to revalidate; strict false refuses
    router
        .navigate(
            "/page/opt-out",
            NavigateOptions::submit(Method::POST, FormData::new().append("a", "1")),
        )
        .await
        .unwrap();

    let state = router.state();
    assert_eq!(state.action_data.as_ref().unwrap()["opt-out"], json!("ACTED"));
    assert_eq!(counters.root.load(Ordering::SeqCst), 2);
    // The opted-out loader sat the forced revalidation out
    assert_eq!(counters.opt_out.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_none_defers_to_the_default_policy() {
    let counters = counters();
    let router = create_router(RouterInit::new(
        policy_routes(&counters),
        MemoryHistory::new(&["/page/deferring"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();
    assert_eq!(counters.deferring.load(Ordering::SeqCst), 1);

    router
        .navigate(
            "/page/deferring",
            NavigateOptions::submit(Method::POST, FormData::new().append("a", "1")),
        )
        .await
        .unwrap();

    // Deferring to the default means revalidating after the mutation
    assert_eq!(counters.root.load(Ordering::SeqCst), 2);
    assert_eq!(counters.deferring.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_search_change_revalidates_but_hash_does_not() {
    let counters = counters();
    let router = create_router(RouterInit::new(
        policy_routes(&counters),
        MemoryHistory::new(&["/search?q=a"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();
    assert_eq!(counters.search.load(Ordering::SeqCst), 1);

    router.navigate("/search?q=b", NavigateOptions::default()).await.unwrap();
    assert_eq!(counters.search.load(Ordering::SeqCst), 2);
    // The parent saw the same search change and revalidated too
    assert_eq!(counters.root.load(Ordering::SeqCst), 2);

    router.navigate("/search?q=b#frag", NavigateOptions::default()).await.unwrap();
    // Hash-only: nobody ran
    assert_eq!(counters.search.load(Ordering::SeqCst), 2);
    assert_eq!(counters.root.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_get_submission_serializes_form_and_runs_loaders_only() {
    let counters = counters();
    let router = create_router(RouterInit::new(
        policy_routes(&counters),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    router
        .navigate(
            "/search",
            NavigateOptions {
                form_data: Some(FormData::new().append("q", "rust lang")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let state = router.state();
    assert!(state.navigation.is_idle());
    assert_eq!(state.location.pathname, "/search");
    assert_eq!(state.location.search, "?q=rust+lang");
    assert_eq!(counters.search.load(Ordering::SeqCst), 1);
    // GET submissions never produce action data
    assert!(state.action_data.is_none());
}

#[tokio::test]
async fn test_revalidate_reruns_current_matches() {
    let counters = counters();
    let router = create_router(RouterInit::new(
        policy_routes(&counters),
        MemoryHistory::new(&["/search?q=a"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();
    let before = router.state();

    router.revalidate().await;

    let state = router.state();
    assert_eq!(counters.search.load(Ordering::SeqCst), 2);
    assert_eq!(counters.root.load(Ordering::SeqCst), 2);
    // Location and key are untouched by a revalidation
    assert_eq!(state.location, before.location);
}
