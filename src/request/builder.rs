//! Per-call request construction and submission normalization.

use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::ErrorResponse;
use crate::history::{create_path, Path};
use crate::matching::matcher::has_naked_index_query;

use super::form::{FormData, FormEncType};

const ORIGIN: &str = "http://localhost/";

/// Absolute URL for an app-relative href, on the engine's opaque origin.
pub(crate) fn create_url(href: &str) -> Url {
    let base = Url::parse(ORIGIN).expect("static origin URL");
    base.join(href).unwrap_or(base)
}

/// The request-like object handed to loaders and actions.
///
/// Carries no transport: just URL, method, headers, optional form body, and
/// the abort token the orchestrator cancels when the call is superseded.
#[derive(Debug, Clone)]
pub struct RouterRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<FormData>,
    pub signal: CancellationToken,
}

impl RouterRequest {
    /// A GET request for the given href, with a fresh abort token.
    pub fn get(href: &str) -> Self {
        Self::new(Method::GET, href)
    }

    pub fn new(method: Method, href: &str) -> Self {
        Self {
            url: create_url(href),
            method,
            headers: HeaderMap::new(),
            body: None,
            signal: CancellationToken::new(),
        }
    }

    pub fn with_form_data(mut self, form_data: FormData) -> Self {
        self.body = Some(form_data);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    /// Pathname + search + hash of the request URL.
    pub fn path(&self) -> String {
        let mut path = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }
        path
    }
}

/// A normalized form submission attached to a navigation or fetcher call.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub form_method: Method,
    pub form_enc_type: FormEncType,
    pub form_data: FormData,
    /// The href the submission targets, hash stripped.
    pub form_action: String,
}

impl Submission {
    pub fn is_mutation(&self) -> bool {
        self.form_method != Method::GET
    }
}

impl Serialize for Submission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("formMethod", &self.form_method.as_str().to_lowercase())?;
        map.serialize_entry("formEncType", &self.form_enc_type)?;
        map.serialize_entry("formData", &self.form_data)?;
        map.serialize_entry("formAction", &self.form_action)?;
        map.end()
    }
}

/// Outcome of submission normalization.
pub(crate) enum NormalizedSubmission {
    /// Plain navigation, no form involved.
    Plain { path: Path },
    /// A submission; GET submissions have their form serialized into the
    /// query already.
    Submission { path: Path, submission: Submission },
    /// Synchronously rejected before any handler runs.
    Invalid { path: Path, error: ErrorResponse },
}

/// Apply the submission rules to navigation/fetch options: default the
/// method, infer the encoding, serialize GET forms into the query, and
/// reject binary-over-GET.
pub(crate) fn normalize_submission(
    mut path: Path,
    form_method: Option<Method>,
    form_enc_type: Option<FormEncType>,
    form_data: Option<FormData>,
) -> NormalizedSubmission {
    if form_data.is_none() && form_method.is_none() {
        return NormalizedSubmission::Plain { path };
    }

    let method = form_method.unwrap_or(Method::GET);
    let form_data = form_data.unwrap_or_default();
    let form_enc_type = form_enc_type.unwrap_or_else(|| FormEncType::for_form_data(&form_data));

    if method != Method::GET {
        let form_action = strip_hash(&path);
        return NormalizedSubmission::Submission {
            path,
            submission: Submission {
                form_method: method,
                form_enc_type,
                form_data,
                form_action,
            },
        };
    }

    // GET: the form body becomes the query string
    if form_data.has_binary() {
        return NormalizedSubmission::Invalid {
            path,
            error: ErrorResponse::internal(
                StatusCode::BAD_REQUEST,
                json!("Cannot submit binary form data using GET"),
            ),
        };
    }

    let mut query = form_data.to_query_string();
    if has_naked_index_query(&path.search) {
        // Keep addressing the index child through the rewrite
        if query.is_empty() {
            query = "index".to_string();
        } else {
            query = format!("index&{query}");
        }
    }
    path.search = if query.is_empty() {
        String::new()
    } else {
        format!("?{query}")
    };

    let form_action = strip_hash(&path);
    NormalizedSubmission::Submission {
        path,
        submission: Submission {
            form_method: Method::GET,
            form_enc_type,
            form_data,
            form_action,
        },
    }
}

fn strip_hash(path: &Path) -> String {
    create_path(&Path {
        pathname: path.pathname.clone(),
        search: path.search.clone(),
        hash: String::new(),
    })
}

/// Build the request for one loader/action call.
pub(crate) fn create_client_request(
    href: &str,
    signal: CancellationToken,
    submission: Option<&Submission>,
) -> RouterRequest {
    let mut headers = HeaderMap::new();
    let (method, body) = match submission {
        Some(submission) if submission.is_mutation() => {
            let content_type = match submission.form_enc_type {
                FormEncType::UrlEncoded => "application/x-www-form-urlencoded;charset=UTF-8",
                FormEncType::Multipart => "multipart/form-data",
            };
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            (
                submission.form_method.clone(),
                Some(submission.form_data.clone()),
            )
        }
        _ => (Method::GET, None),
    };

    RouterRequest {
        url: create_url(href),
        method,
        headers,
        body,
        signal,
    }
}
