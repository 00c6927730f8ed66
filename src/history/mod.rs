//! Location model and history adapters.
//!
//! # Responsibilities
//! - Define `Location` (pathname/search/hash/state/key) and `HistoryAction`
//! - Parse and serialize path strings
//! - Define the `History` trait platform adapters implement
//! - Resolve relative navigation targets against the current matches
//!
//! # Design Decisions
//! - The engine creates `Location` values (including keys) and hands them to
//!   the adapter; adapters never invent keys
//! - Only POP flows through `listen` — push/replace are initiated by the
//!   engine, so echoing them back would double-drive the state machine
//! - Keys are short random strings; the very first entry uses "default" so
//!   hydrated and fresh routers agree on the initial key

mod memory;

pub use memory::MemoryHistory;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the current location was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    #[serde(rename = "POP")]
    Pop,
    #[serde(rename = "PUSH")]
    Push,
    #[serde(rename = "REPLACE")]
    Replace,
}

/// A unique client-side location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub pathname: String,
    /// Search string including the leading `?`, or empty.
    pub search: String,
    /// Hash including the leading `#`, or empty.
    pub hash: String,
    /// Opaque state attached at navigation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Unique key per distinct history entry.
    pub key: String,
}

impl Location {
    /// The serialized path: pathname + search + hash.
    pub fn to_path(&self) -> String {
        format!("{}{}{}", self.pathname, self.search, self.hash)
    }
}

/// The pieces of a URL path; any piece may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path {
    pub pathname: String,
    pub search: String,
    pub hash: String,
}

impl Path {
    pub fn parse(path: &str) -> Self {
        parse_path(path)
    }
}

impl From<&Location> for Path {
    fn from(location: &Location) -> Self {
        Path {
            pathname: location.pathname.clone(),
            search: location.search.clone(),
            hash: location.hash.clone(),
        }
    }
}

/// A navigation target: either a raw href or pre-split path pieces.
#[derive(Debug, Clone)]
pub enum To {
    Href(String),
    Path(Path),
}

impl From<&str> for To {
    fn from(href: &str) -> Self {
        To::Href(href.to_string())
    }
}

impl From<String> for To {
    fn from(href: String) -> Self {
        To::Href(href)
    }
}

impl From<Path> for To {
    fn from(path: Path) -> Self {
        To::Path(path)
    }
}

impl To {
    pub(crate) fn into_path(self) -> Path {
        match self {
            To::Href(href) => parse_path(&href),
            To::Path(path) => path,
        }
    }
}

/// Split an href into pathname/search/hash pieces.
pub fn parse_path(path: &str) -> Path {
    let mut parsed = Path::default();
    let mut rest = path;

    if let Some(hash_index) = rest.find('#') {
        let hash = &rest[hash_index..];
        if hash.len() > 1 {
            parsed.hash = hash.to_string();
        }
        rest = &rest[..hash_index];
    }

    if let Some(search_index) = rest.find('?') {
        let search = &rest[search_index..];
        if search.len() > 1 {
            parsed.search = search.to_string();
        }
        rest = &rest[..search_index];
    }

    parsed.pathname = rest.to_string();
    parsed
}

/// Join path pieces back into an href.
pub fn create_path(path: &Path) -> String {
    let mut href = path.pathname.clone();
    if !path.search.is_empty() && path.search != "?" {
        if !path.search.starts_with('?') {
            href.push('?');
        }
        href.push_str(&path.search);
    }
    if !path.hash.is_empty() && path.hash != "#" {
        if !path.hash.starts_with('#') {
            href.push('#');
        }
        href.push_str(&path.hash);
    }
    href
}

/// Build the location for a navigation target, assigning a fresh key unless
/// the caller preserves one.
pub(crate) fn create_location(
    current_pathname: &str,
    to: &Path,
    state: Option<Value>,
    key: Option<String>,
) -> Location {
    Location {
        pathname: if to.pathname.is_empty() {
            current_pathname.to_string()
        } else {
            to.pathname.clone()
        },
        search: to.search.clone(),
        hash: to.hash.clone(),
        state,
        key: key.unwrap_or_else(create_key),
    }
}

/// Short random key for a history entry.
pub(crate) fn create_key() -> String {
    let key = uuid::Uuid::new_v4().simple().to_string();
    key[..8].to_string()
}

/// Strip a basename prefix, returning the remaining pathname.
///
/// Returns `None` when the pathname is outside the basename. Matching is
/// case-insensitive and requires a segment boundary, so basename `/app`
/// does not claim `/application`.
pub fn strip_basename(pathname: &str, basename: &str) -> Option<String> {
    if basename == "/" {
        return Some(pathname.to_string());
    }

    if !pathname
        .to_lowercase()
        .starts_with(&basename.to_lowercase())
    {
        return None;
    }

    let start = if basename.ends_with('/') {
        basename.len() - 1
    } else {
        basename.len()
    };
    // Require a segment boundary after the prefix
    match pathname.as_bytes().get(start) {
        Some(b'/') | None => {}
        Some(_) => return None,
    }

    let stripped = pathname.get(start..).unwrap_or_default();
    Some(if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    })
}

/// Prefix a path with the basename.
pub(crate) fn prepend_basename(basename: &str, pathname: &str) -> String {
    if basename == "/" {
        pathname.to_string()
    } else {
        format!(
            "{}/{}",
            basename.trim_end_matches('/'),
            pathname.trim_start_matches('/')
        )
    }
}

/// Resolve a relative pathname against a base pathname, handling `.` and
/// `..` segments.
pub fn resolve_pathname(relative: &str, from_pathname: &str) -> String {
    let mut segments: Vec<&str> = from_pathname.trim_end_matches('/').split('/').collect();
    for segment in relative.split('/') {
        if segment == ".." {
            if segments.len() > 1 {
                segments.pop();
            }
        } else if segment != "." {
            segments.push(segment);
        }
    }
    if segments.len() > 1 {
        segments.join("/")
    } else {
        "/".to_string()
    }
}

fn resolve_path(to: &Path, from_pathname: &str) -> Path {
    let pathname = if to.pathname.is_empty() {
        from_pathname.to_string()
    } else if to.pathname.starts_with('/') {
        to.pathname.clone()
    } else {
        resolve_pathname(&to.pathname, from_pathname)
    };
    Path {
        pathname,
        search: normalize_search(&to.search),
        hash: normalize_hash(&to.hash),
    }
}

fn normalize_search(search: &str) -> String {
    if search.is_empty() || search == "?" {
        String::new()
    } else if search.starts_with('?') {
        search.to_string()
    } else {
        format!("?{search}")
    }
}

fn normalize_hash(hash: &str) -> String {
    if hash.is_empty() || hash == "#" {
        String::new()
    } else if hash.starts_with('#') {
        hash.to_string()
    } else {
        format!("#{hash}")
    }
}

/// Resolve a navigation target against the matched route context.
///
/// `route_pathnames` are the pathname bases of the path-contributing
/// matches; `..` climbs one route per occurrence (route-relative mode) or
/// one URL segment (path-relative mode).
pub(crate) fn resolve_to(
    to: &Path,
    route_pathnames: &[String],
    location_pathname: &str,
    is_path_relative: bool,
) -> Path {
    let mut to = to.clone();
    let from: String;

    if to.pathname.is_empty() {
        from = location_pathname.to_string();
    } else if is_path_relative {
        from = location_pathname.to_string();
    } else {
        let mut route_pathname_index = route_pathnames.len() as i64 - 1;
        if to.pathname.starts_with("..") {
            let mut segments: Vec<&str> = to.pathname.split('/').collect();
            while segments.first() == Some(&"..") {
                segments.remove(0);
                route_pathname_index -= 1;
            }
            to.pathname = segments.join("/");
        }
        from = if route_pathname_index >= 0 {
            route_pathnames[route_pathname_index as usize].clone()
        } else {
            "/".to_string()
        };
    }

    let mut path = resolve_path(&to, &from);

    // Preserve an explicitly-typed trailing slash
    let had_trailing_slash = to.pathname != "/" && to.pathname.ends_with('/');
    if had_trailing_slash && !path.pathname.ends_with('/') {
        path.pathname.push('/');
    }
    path
}

/// Notification payload delivered to `History::listen` subscribers on POP.
#[derive(Debug, Clone)]
pub struct HistoryUpdate {
    pub action: HistoryAction,
    pub location: Location,
    /// Entries traversed, when the adapter can compute it.
    pub delta: Option<i64>,
}

pub type HistoryListener = Box<dyn Fn(HistoryUpdate) + Send + Sync>;

/// A client-side URL stack.
///
/// The engine drives `push`/`replace`/`go` and reads `location`; adapters
/// only call back through `listen` for externally-initiated POPs.
pub trait History: Send + Sync {
    /// Action that produced the current location.
    fn action(&self) -> HistoryAction;

    /// The current location.
    fn location(&self) -> Location;

    /// Serialize a path for links.
    fn create_href(&self, path: &Path) -> String {
        create_path(path)
    }

    /// Append an entry, dropping any forward entries.
    fn push(&self, location: Location);

    /// Overwrite the current entry.
    fn replace(&self, location: Location);

    /// Move through the stack; fires the POP listener.
    fn go(&self, delta: i64);

    /// Register the single POP listener. Later calls replace earlier ones.
    fn listen(&self, listener: HistoryListener);
}
