//! The routing engine.
//!
//! # Data Flow
//! ```text
//! navigate / fetch / revalidate / history POP
//!     → engine.rs (navigation ids, action phase, abort handling)
//!     → revalidation planner (which loaders run)
//!     → pipeline.rs (call handlers, classify results)
//!     → state.rs snapshot commit
//!     → subscribers notified synchronously
//! ```
//!
//! # Design Decisions
//! - One engine instance owns one history adapter and all abort handles
//! - Snapshots are immutable to subscribers; each commit replaces changed
//!   top-level fields
//! - The static handler reuses the pipeline but never this engine

pub mod engine;
pub(crate) mod pipeline;
pub mod state;

pub use engine::{create_router, Router, Subscription};
pub use state::{
    revive_errors, Fetcher, FetcherState, FetchOptions, HydrationData, NavigateOptions,
    Navigation, RelativeRouting, RestoreScroll, RevalidationState, RouteData, RouterInit,
    RouterState,
};
