//! Navigation orchestrator integration tests.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::{counting_loader, loader_value, static_loader, wait_for, Gate};
use http::{Method, StatusCode};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use waypoint::{
    create_router, is_route_error_response, redirect, FormData, HistoryAction, MemoryHistory,
    NavigateOptions, Navigation, Route, RouteError, RouteErrorValue, RouterInit, RouteValue,
};

fn basic_routes(root_counter: Arc<AtomicUsize>, tasks_counter: Arc<AtomicUsize>) -> Vec<Route> {
    vec![Route::new("/")
        .id("root")
        .error_boundary()
        .loader(counting_loader("ROOT", root_counter))
        .children(vec![
            Route::index().id("home"),
            Route::new("tasks")
                .id("tasks")
                .loader(counting_loader("TASKS", tasks_counter))
                .action(|args| async move {
                    let title = args
                        .request
                        .body
                        .and_then(|form| form.get_text("title").map(str::to_string))
                        .unwrap_or_default();
                    Ok(RouteValue::Data(json!(format!("CREATED {title}"))))
                }),
            Route::new("users/:id").id("user").loader(|args| async move {
                Ok(RouteValue::Data(json!(format!("USER {}", args.params["id"]))))
            }),
        ])]
}

#[tokio::test]
async fn test_initialize_runs_matched_loaders() {
    let root = Arc::new(AtomicUsize::new(0));
    let tasks = Arc::new(AtomicUsize::new(0));
    let router = create_router(RouterInit::new(
        basic_routes(root.clone(), tasks.clone()),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();

    assert!(!router.state().initialized);
    router.initialize().await.unwrap();

    let state = router.state();
    assert!(state.initialized);
    assert!(state.navigation.is_idle());
    assert_eq!(loader_value(&state, "root"), Some(json!("ROOT-1")));
    assert_eq!(state.location.key, "default");
    assert_eq!(state.history_action, HistoryAction::Pop);
    // Only the matched branch loaded
    assert_eq!(tasks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_get_navigation_loads_new_branch_and_reuses_parent() {
    let root = Arc::new(AtomicUsize::new(0));
    let tasks = Arc::new(AtomicUsize::new(0));
    let router = create_router(RouterInit::new(
        basic_routes(root.clone(), tasks.clone()),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    router.navigate("/tasks", NavigateOptions::default()).await.unwrap();

    let state = router.state();
    assert_eq!(state.location.pathname, "/tasks");
    assert_eq!(state.history_action, HistoryAction::Push);
    assert_eq!(loader_value(&state, "tasks"), Some(json!("TASKS-1")));
    // Parent data was reused, not reloaded
    assert_eq!(loader_value(&state, "root"), Some(json!("ROOT-1")));
    assert_eq!(root.load(Ordering::SeqCst), 1);
    assert_eq!(
        state.matches.iter().map(|m| m.route.id.as_str()).collect::<Vec<_>>(),
        ["root", "tasks"]
    );
}

#[tokio::test]
async fn test_params_reach_loaders() {
    let router = create_router(RouterInit::new(
        basic_routes(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    router.navigate("/users/42", NavigateOptions::default()).await.unwrap();
    assert_eq!(loader_value(&router.state(), "user"), Some(json!("USER 42")));
}

#[tokio::test]
async fn test_hash_only_navigation_skips_loaders() {
    let root = Arc::new(AtomicUsize::new(0));
    let router = create_router(RouterInit::new(
        basic_routes(root.clone(), Arc::new(AtomicUsize::new(0))),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();
    let prev = router.state();

    // Observe every committed snapshot: none may be mid-navigation
    let seen_loading = Arc::new(Mutex::new(false));
    let sink = seen_loading.clone();
    let _subscription = router.subscribe(move |state| {
        if !state.navigation.is_idle() {
            *sink.lock().unwrap() = true;
        }
    });

    router.navigate("/#section", NavigateOptions::default()).await.unwrap();

    let state = router.state();
    assert_eq!(state.location.hash, "#section");
    assert_ne!(state.location.key, prev.location.key);
    assert_eq!(state.history_action, HistoryAction::Push);
    // Loader was not called again and we never left idle
    assert_eq!(root.load(Ordering::SeqCst), 1);
    assert!(!*seen_loading.lock().unwrap());
    assert_eq!(loader_value(&state, "root"), Some(json!("ROOT-1")));
}

#[tokio::test]
async fn test_unmatched_url_keys_404_at_root_and_preserves_root_data() {
    let router = create_router(RouterInit::new(
        basic_routes(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    router.navigate("/no/such/route", NavigateOptions::default()).await.unwrap();

    let state = router.state();
    let errors = state.errors.as_ref().unwrap();
    let error = &errors["root"];
    assert!(is_route_error_response(error));
    match error {
        RouteErrorValue::Response(response) => {
            assert_eq!(response.status, StatusCode::NOT_FOUND);
            assert!(response.internal);
        }
        other => panic!("unexpected error shape: {other:?}"),
    }
    // Root loader data survives a 404
    assert_eq!(loader_value(&state, "root"), Some(json!("ROOT-1")));
    assert_eq!(state.matches.len(), 1);
}

#[tokio::test]
async fn test_action_error_stops_at_parent_boundary() {
    let parent_loader = Arc::new(AtomicUsize::new(0));
    let child_loader = Arc::new(AtomicUsize::new(0));
    let routes = vec![Route::new("/")
        .id("root")
        .child(
            Route::new("parent")
                .id("parent")
                .error_boundary()
                .loader(counting_loader("PARENT", parent_loader.clone()))
                .child(
                    Route::new("child")
                        .id("child")
                        .loader(counting_loader("CHILD", child_loader.clone()))
                        .action(|_args| async { Err(RouteError::error("X")) }),
                ),
        )];
    let router =
        create_router(RouterInit::new(routes, MemoryHistory::new(&["/"]))).unwrap();
    router.initialize().await.unwrap();

    router
        .navigate(
            "/parent/child",
            NavigateOptions::submit(Method::POST, FormData::new().append("k", "v")),
        )
        .await
        .unwrap();

    let state = router.state();
    let errors = state.errors.as_ref().unwrap();
    assert!(matches!(&errors["parent"], RouteErrorValue::Error(m) if m == "X"));
    assert!(state.action_data.is_none());
    // Ancestors above the boundary loaded; the leaf's loader never ran
    assert_eq!(parent_loader.load(Ordering::SeqCst), 1);
    assert_eq!(child_loader.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_post_without_action_produces_405_and_runs_ancestors() {
    let root = Arc::new(AtomicUsize::new(0));
    let router = create_router(RouterInit::new(
        basic_routes(root.clone(), Arc::new(AtomicUsize::new(0))),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    router
        .navigate(
            "/users/9",
            NavigateOptions::submit(Method::POST, FormData::new().append("a", "1")),
        )
        .await
        .unwrap();

    let state = router.state();
    let errors = state.errors.as_ref().unwrap();
    match &errors["root"] {
        RouteErrorValue::Response(response) => {
            assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(response.data, json!("No action found for /users/9"));
        }
        other => panic!("unexpected error shape: {other:?}"),
    }
    // The mutation still forced ancestor revalidation
    assert_eq!(root.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_action_success_commits_action_data_and_revalidates_all() {
    let root = Arc::new(AtomicUsize::new(0));
    let tasks = Arc::new(AtomicUsize::new(0));
    let router = create_router(RouterInit::new(
        basic_routes(root.clone(), tasks.clone()),
        MemoryHistory::new(&["/tasks"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();
    assert_eq!(tasks.load(Ordering::SeqCst), 1);

    router
        .navigate(
            "/tasks",
            NavigateOptions::submit(Method::POST, FormData::new().append("title", "ship")),
        )
        .await
        .unwrap();

    let state = router.state();
    let action_data = state.action_data.as_ref().unwrap();
    assert_eq!(action_data["tasks"], json!("CREATED ship"));
    // A mutation revalidates every matched loader
    assert_eq!(root.load(Ordering::SeqCst), 2);
    assert_eq!(tasks.load(Ordering::SeqCst), 2);
    assert!(state.errors.is_none());
}

#[tokio::test]
async fn test_loader_redirect_with_revalidate_header() {
    let root = Arc::new(AtomicUsize::new(0));
    let routes = vec![Route::new("/")
        .id("root")
        .error_boundary()
        .loader(counting_loader("ROOT", root.clone()))
        .children(vec![
            Route::index().id("home"),
            Route::new("foo").id("foo").loader(|_args| async {
                Ok(RouteValue::Response(
                    redirect("/bar").header("X-Remix-Revalidate", "1"),
                ))
            }),
            Route::new("bar").id("bar").loader(static_loader(json!("BAR"))),
        ])];
    let history = MemoryHistory::new(&["/"]);
    let router = create_router(RouterInit::new(routes, history.clone())).unwrap();
    router.initialize().await.unwrap();
    assert_eq!(loader_value(&router.state(), "root"), Some(json!("ROOT-1")));

    router.navigate("/foo", NavigateOptions::default()).await.unwrap();

    let state = router.state();
    assert_eq!(state.location.pathname, "/bar");
    assert_eq!(loader_value(&state, "bar"), Some(json!("BAR")));
    // The revalidate header forced the root loader to re-run
    assert_eq!(loader_value(&state, "root"), Some(json!("ROOT-2")));
    // The whole chain produced a single push
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_action_redirect_replaces_and_degrades_to_get() {
    let action_calls = Arc::new(AtomicUsize::new(0));
    let calls = action_calls.clone();
    let routes = vec![Route::new("/")
        .id("root")
        .error_boundary()
        .children(vec![
            Route::index().id("home"),
            Route::new("login").id("login").action(move |_args| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(RouteValue::Response(redirect("/account"))) }
            }),
            Route::new("account")
                .id("account")
                .loader(static_loader(json!("ACCOUNT"))),
        ])];
    let history = MemoryHistory::new(&["/"]);
    let router = create_router(RouterInit::new(routes, history.clone())).unwrap();
    router.initialize().await.unwrap();

    router
        .navigate(
            "/login",
            NavigateOptions::submit(Method::POST, FormData::new().append("user", "kim")),
        )
        .await
        .unwrap();

    let state = router.state();
    assert_eq!(state.location.pathname, "/account");
    assert_eq!(loader_value(&state, "account"), Some(json!("ACCOUNT")));
    // 302 degrades the method: the action ran exactly once
    assert_eq!(action_calls.load(Ordering::SeqCst), 1);
    // Action-induced redirects replace instead of pushing twice
    assert_eq!(history.len(), 1);
    assert_eq!(state.history_action, HistoryAction::Replace);
}

#[tokio::test]
async fn test_interrupted_submission_forces_full_revalidation() {
    let root = Arc::new(AtomicUsize::new(0));
    let gate = Gate::new();
    let action_gate = gate.clone();
    let seen_signal: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    let signal_sink = seen_signal.clone();

    let routes = vec![Route::new("/")
        .id("root")
        .error_boundary()
        .loader(counting_loader("ROOT", root.clone()))
        .children(vec![
            Route::index().id("home"),
            Route::new("foo").id("foo").action(move |args| {
                *signal_sink.lock().unwrap() = Some(args.request.signal.clone());
                let gate = action_gate.clone();
                async move {
                    gate.wait().await;
                    Ok(RouteValue::Data(json!("UNREACHED")))
                }
            }),
            Route::new("bar").id("bar").loader(static_loader(json!("BAR"))),
        ])];
    let router =
        create_router(RouterInit::new(routes, MemoryHistory::new(&["/"]))).unwrap();
    router.initialize().await.unwrap();
    assert_eq!(root.load(Ordering::SeqCst), 1);

    let submitter = router.clone();
    let submit_task = tokio::spawn(async move {
        submitter
            .navigate(
                "/foo",
                NavigateOptions::submit(Method::POST, FormData::new().append("x", "1")),
            )
            .await
    });
    wait_for(&router, "submitting state", |state| {
        matches!(state.navigation, Navigation::Submitting { .. })
    })
    .await;

    router.navigate("/bar", NavigateOptions::default()).await.unwrap();
    gate.open();
    submit_task.await.unwrap().unwrap();

    let state = router.state();
    assert_eq!(state.location.pathname, "/bar");
    assert!(state.navigation.is_idle());
    // The abandoned submission's signal fired
    assert!(seen_signal.lock().unwrap().as_ref().unwrap().is_cancelled());
    // The interrupted mutation forced even unchanged loaders to re-run
    assert_eq!(root.load(Ordering::SeqCst), 2);
    // The dead action's data never landed
    assert!(state.action_data.is_none());
}

#[tokio::test]
async fn test_same_location_navigation_replaces_and_refreshes() {
    let tasks = Arc::new(AtomicUsize::new(0));
    let router = create_router(RouterInit::new(
        basic_routes(Arc::new(AtomicUsize::new(0)), tasks.clone()),
        MemoryHistory::new(&["/tasks"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();
    let first = router.state();
    assert_eq!(tasks.load(Ordering::SeqCst), 1);

    router.navigate("/tasks", NavigateOptions::default()).await.unwrap();

    let state = router.state();
    // Explicit refresh: loaders re-ran, the entry was replaced in place
    assert_eq!(tasks.load(Ordering::SeqCst), 2);
    assert_eq!(state.history_action, HistoryAction::Replace);
    assert_eq!(state.location.key, first.location.key);
}

#[tokio::test]
async fn test_pop_restores_original_key() {
    let router = create_router(RouterInit::new(
        basic_routes(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    router.navigate("/tasks", NavigateOptions::default()).await.unwrap();
    let tasks_key = router.state().location.key.clone();
    router.navigate("/users/1", NavigateOptions::default()).await.unwrap();

    router.go(-1);
    let state = wait_for(&router, "POP back to /tasks", |state| {
        state.location.pathname == "/tasks" && state.navigation.is_idle()
    })
    .await;

    assert_eq!(state.history_action, HistoryAction::Pop);
    assert_eq!(state.location.key, tasks_key);
}

#[tokio::test]
async fn test_binary_get_submission_rejected_before_loaders() {
    let child_loader = Arc::new(AtomicUsize::new(0));
    let parent_loader = Arc::new(AtomicUsize::new(0));
    let routes = vec![Route::new("/")
        .id("root")
        .child(
            Route::new("parent")
                .id("parent")
                .error_boundary()
                .loader(counting_loader("PARENT", parent_loader.clone()))
                .child(
                    Route::new("child")
                        .id("child")
                        .loader(counting_loader("CHILD", child_loader.clone())),
                ),
        )];
    let router =
        create_router(RouterInit::new(routes, MemoryHistory::new(&["/"]))).unwrap();
    router.initialize().await.unwrap();

    let form = FormData::new().append_file(
        "upload",
        "blob.bin",
        "application/octet-stream",
        bytes::Bytes::from_static(b"\x00\x01"),
    );
    router
        .navigate(
            "/parent/child",
            NavigateOptions {
                form_method: Some(Method::GET),
                form_data: Some(form),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let state = router.state();
    match &state.errors.as_ref().unwrap()["parent"] {
        RouteErrorValue::Response(response) => {
            assert_eq!(response.status, StatusCode::BAD_REQUEST);
            assert_eq!(
                response.data,
                json!("Cannot submit binary form data using GET")
            );
        }
        other => panic!("unexpected error shape: {other:?}"),
    }
    // Ancestors loaded; the target's loader never ran
    assert_eq!(parent_loader.load(Ordering::SeqCst), 1);
    assert_eq!(child_loader.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scroll_positions_save_and_restore_on_pop() {
    let router = create_router(RouterInit::new(
        basic_routes(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();

    let positions = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let scroll_y = Arc::new(Mutex::new(0.0_f64));
    let sampled = scroll_y.clone();
    router.enable_scroll_restoration(
        positions.clone(),
        move || *sampled.lock().unwrap(),
        None,
    );

    // Scroll down on "/", then navigate away: the position is captured
    *scroll_y.lock().unwrap() = 480.0;
    router.navigate("/tasks", NavigateOptions::default()).await.unwrap();
    assert_eq!(
        router.state().restore_scroll_position,
        waypoint::RestoreScroll::Unsaved
    );

    router.go(-1);
    let state = wait_for(&router, "POP back to /", |state| {
        state.location.pathname == "/" && state.navigation.is_idle()
    })
    .await;
    assert_eq!(state.restore_scroll_position, waypoint::RestoreScroll::Position(480.0));
}

#[tokio::test]
async fn test_prevent_scroll_reset_flag_carries_through() {
    let router = create_router(RouterInit::new(
        basic_routes(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))),
        MemoryHistory::new(&["/"]),
    ))
    .unwrap();
    router.initialize().await.unwrap();
    assert!(!router.state().prevent_scroll_reset);

    router
        .navigate(
            "/tasks",
            NavigateOptions {
                prevent_scroll_reset: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(router.state().prevent_scroll_reset);

    router.navigate("/users/1", NavigateOptions::default()).await.unwrap();
    assert!(!router.state().prevent_scroll_reset);
}

#[tokio::test]
async fn test_dispose_aborts_everything() {
    let gate = Gate::new();
    let loader_gate = gate.clone();
    let routes = vec![Route::new("/")
        .id("root")
        .children(vec![
            Route::index().id("home"),
            Route::new("slow").id("slow").loader(move |_args| {
                let gate = loader_gate.clone();
                async move {
                    gate.wait().await;
                    Ok(RouteValue::Data(json!("SLOW")))
                }
            }),
        ])];
    let router =
        create_router(RouterInit::new(routes, MemoryHistory::new(&["/"]))).unwrap();
    router.initialize().await.unwrap();

    let navigator = router.clone();
    let nav_task = tokio::spawn(async move {
        navigator.navigate("/slow", NavigateOptions::default()).await
    });
    wait_for(&router, "loading state", |state| !state.navigation.is_idle()).await;

    router.dispose();
    gate.open();
    nav_task.await.unwrap().unwrap();

    // A disposed router refuses further work
    assert!(router.navigate("/", NavigateOptions::default()).await.is_err());
    assert!(router
        .fetch("k", "root", "/", waypoint::FetchOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_structural_validation_fails_fast() {
    let empty = create_router(RouterInit::new(vec![], MemoryHistory::new(&["/"])));
    assert!(empty.is_err());

    let duplicate = create_router(RouterInit::new(
        vec![Route::new("/a").id("dup"), Route::new("/b").id("dup")],
        MemoryHistory::new(&["/a"]),
    ));
    assert!(duplicate.is_err());

    let outside_basename = create_router(
        RouterInit::new(vec![Route::new("/").id("root")], MemoryHistory::new(&["/"]))
            .basename("/app"),
    );
    assert!(outside_basename.is_err());
}

#[tokio::test]
async fn test_basename_round_trip() {
    let routes = vec![Route::new("/")
        .id("root")
        .loader(static_loader(json!("ROOT")))
        .children(vec![Route::index().id("home"), Route::new("tasks").id("tasks")])];
    let router = create_router(
        RouterInit::new(routes, MemoryHistory::new(&["/app"])).basename("/app"),
    )
    .unwrap();
    router.initialize().await.unwrap();

    assert_eq!(router.create_href("/tasks"), "/app/tasks");

    router.navigate("/tasks", NavigateOptions::default()).await.unwrap();
    let state = router.state();
    assert_eq!(state.location.pathname, "/app/tasks");
    assert_eq!(state.matches.last().unwrap().route.id, "tasks");
}
