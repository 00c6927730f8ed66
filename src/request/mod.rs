//! Request construction and HTTP-shaped values.
//!
//! # Responsibilities
//! - Model form submissions (method, encoding, ordered fields)
//! - Build the request-like object each loader/action call receives
//! - Model responses returned/thrown by loaders and actions
//! - Normalize submission options (GET serialization, binary rejection)
//!
//! # Design Decisions
//! - The engine performs no transport; requests only carry URL, method,
//!   headers, body, and an abort token
//! - GET submissions serialize the form into the query and never enter the
//!   `submitting` state
//! - Binary fields force multipart encoding and are rejected on GET with a
//!   synthesized 400 before any handler runs

mod builder;
mod form;
mod response;

pub use builder::{RouterRequest, Submission};
pub use form::{FormData, FormEncType, FormValue};
pub use response::{json, redirect, redirect_with_status, ResponseBody, RouterResponse};

pub(crate) use builder::{
    create_client_request, create_url, normalize_submission, NormalizedSubmission,
};
