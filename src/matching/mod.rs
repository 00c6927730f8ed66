//! Route tree and URL matching.
//!
//! # Data Flow
//! ```text
//! Route tree (user-declared, builder API)
//!     → route.rs (id assignment, structural validation)
//!     → matcher.rs (flatten to branches, explode optionals, rank)
//!     → Freeze as immutable branch list
//!
//! Per navigation:
//!     pathname
//!     → ranked branch scan (first full match wins)
//!     → Vec<RouteMatch> root-to-leaf with params
//! ```
//!
//! # Design Decisions
//! - Branches compiled once at factory time, immutable afterwards
//! - No regex: segment-by-segment comparison keeps matching O(path)
//! - Deterministic ranking: static > dynamic > splat, index routes beat
//!   their parent as leaf, declaration order breaks ties
//! - Captured params are percent-decoded; splats bind the raw remainder

pub mod matcher;
pub mod route;

pub use matcher::{generate_path, RouteMatch};
pub use route::{
    ActionArgs, LoaderArgs, LoaderResult, Params, Route, RouteRecord, RouteValue,
};
