//! Ranked nested route matching.
//!
//! # Responsibilities
//! - Flatten the route tree into scored branches (optionals exploded)
//! - Match a pathname against branches, best score first
//! - Extract percent-decoded path parameters
//!
//! # Design Decisions
//! - Scoring: static segment 10, dynamic 3, empty 1, index bonus 2, splat
//!   penalty -2; ties resolved by declaration order among siblings
//! - Matching is case-insensitive on static segments; a trailing slash on
//!   the URL is tolerated
//! - A splat binds the literal remainder, which may be empty

use std::sync::Arc;

use percent_encoding::percent_decode_str;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::history::strip_basename;

use super::route::{Params, RouteRecord};

/// A route bound to concrete params and pathname segments for one URL.
#[derive(Clone)]
pub struct RouteMatch {
    pub route: Arc<RouteRecord>,
    /// Cumulative params from the root down to this route.
    pub params: Params,
    /// The portion of the pathname this route owns.
    pub pathname: String,
    /// The portion inherited by child routes.
    pub pathname_base: String,
}

impl std::fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatch")
            .field("route", &self.route.id)
            .field("params", &self.params)
            .field("pathname", &self.pathname)
            .field("pathname_base", &self.pathname_base)
            .finish()
    }
}

impl Serialize for RouteMatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("id", &self.route.id)?;
        map.serialize_entry("pathname", &self.pathname)?;
        map.serialize_entry("pathnameBase", &self.pathname_base)?;
        map.serialize_entry("params", &self.params)?;
        map.end()
    }
}

/// One root-to-leaf candidate, compiled at factory time.
pub(crate) struct Branch {
    score: i32,
    child_indexes: Vec<usize>,
    levels: Vec<BranchLevel>,
}

#[derive(Clone)]
struct BranchLevel {
    relative_path: String,
    route: Arc<RouteRecord>,
}

/// Flatten a validated route tree into ranked branches.
pub(crate) fn flatten_branches(routes: &[Arc<RouteRecord>]) -> Vec<Branch> {
    let mut branches = Vec::new();
    flatten_level(routes, &[], &[], "", &mut branches);
    branches.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| compare_child_indexes(&a.child_indexes, &b.child_indexes))
    });
    branches
}

fn flatten_level(
    routes: &[Arc<RouteRecord>],
    parent_levels: &[BranchLevel],
    parent_indexes: &[usize],
    parent_path: &str,
    branches: &mut Vec<Branch>,
) {
    for (child_index, route) in routes.iter().enumerate() {
        let declared = route.path.clone().unwrap_or_default();
        for exploded in explode_optional_segments(&declared) {
            // Absolute child paths restate the parent prefix
            let relative = match exploded.strip_prefix('/') {
                Some(_) if parent_path.is_empty() || parent_path == "/" => exploded.clone(),
                Some(_) => exploded
                    .strip_prefix(parent_path)
                    .map(str::to_string)
                    .unwrap_or(exploded.clone()),
                None => exploded.clone(),
            };

            let mut levels = parent_levels.to_vec();
            levels.push(BranchLevel {
                relative_path: relative.clone(),
                route: route.clone(),
            });
            let mut indexes = parent_indexes.to_vec();
            indexes.push(child_index);
            let full_path = join_paths(&[parent_path, &relative]);

            if !route.children.is_empty() {
                flatten_level(&route.children, &levels, &indexes, &full_path, branches);
            }

            // Pathless non-index layouts never terminate a branch
            if route.path.is_none() && !route.index {
                continue;
            }

            branches.push(Branch {
                score: compute_score(&full_path, route.index),
                child_indexes: indexes,
                levels,
            });
        }
    }
}

/// `about/settings?` yields both `about/settings` and `about`; variants with
/// the segment present sort ahead of variants without it.
fn explode_optional_segments(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').collect();
    explode_segments(&segments)
}

fn explode_segments(segments: &[&str]) -> Vec<String> {
    let Some((first, rest)) = segments.split_first() else {
        return vec![String::new()];
    };
    let is_optional = first.ends_with('?');
    let required = first.trim_end_matches('?');

    if rest.is_empty() {
        return if is_optional {
            vec![required.to_string(), String::new()]
        } else {
            vec![required.to_string()]
        };
    }

    let rest_exploded = explode_segments(rest);
    let mut result: Vec<String> = rest_exploded
        .iter()
        .map(|subpath| {
            if subpath.is_empty() {
                required.to_string()
            } else {
                format!("{required}/{subpath}")
            }
        })
        .collect();
    if is_optional {
        result.extend(rest_exploded);
    }
    result
}

const STATIC_SEGMENT_VALUE: i32 = 10;
const DYNAMIC_SEGMENT_VALUE: i32 = 3;
const INDEX_ROUTE_VALUE: i32 = 2;
const EMPTY_SEGMENT_VALUE: i32 = 1;
const SPLAT_PENALTY: i32 = -2;

fn compute_score(path: &str, index: bool) -> i32 {
    let segments: Vec<&str> = path.split('/').collect();
    let mut score = segments.len() as i32;
    if segments.iter().any(|s| *s == "*") {
        score += SPLAT_PENALTY;
    }
    if index {
        score += INDEX_ROUTE_VALUE;
    }
    for segment in segments.iter().filter(|s| **s != "*") {
        score += if segment.starts_with(':') {
            DYNAMIC_SEGMENT_VALUE
        } else if segment.is_empty() {
            EMPTY_SEGMENT_VALUE
        } else {
            STATIC_SEGMENT_VALUE
        };
    }
    score
}

// Declaration order decides between same-score siblings; unrelated branches
// keep their stable sort order.
fn compare_child_indexes(a: &[usize], b: &[usize]) -> std::cmp::Ordering {
    let siblings = a.len() == b.len()
        && a[..a.len() - 1]
            .iter()
            .zip(&b[..b.len() - 1])
            .all(|(x, y)| x == y);
    if siblings {
        a[a.len() - 1].cmp(&b[b.len() - 1])
    } else {
        std::cmp::Ordering::Equal
    }
}

/// Match a pathname (with basename stripped first) against the branch list.
/// Returns root-to-leaf matches for the best-ranked branch, or `None`.
pub(crate) fn match_routes(
    branches: &[Branch],
    pathname: &str,
    basename: &str,
) -> Option<Vec<RouteMatch>> {
    let stripped = strip_basename(pathname, basename)?;
    branches
        .iter()
        .find_map(|branch| match_branch(branch, &stripped))
}

fn match_branch(branch: &Branch, pathname: &str) -> Option<Vec<RouteMatch>> {
    let mut matched_params = Params::new();
    let mut matched_pathname = String::from("/");
    let mut matches = Vec::with_capacity(branch.levels.len());

    for (i, level) in branch.levels.iter().enumerate() {
        let end = i == branch.levels.len() - 1;
        let remaining = if matched_pathname == "/" {
            pathname.to_string()
        } else {
            let rest = pathname.get(matched_pathname.len()..).unwrap_or("");
            if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            }
        };

        let path_match = match_path(&level.relative_path, &remaining, end)?;
        matched_params.extend(path_match.params);

        matches.push(RouteMatch {
            route: level.route.clone(),
            params: matched_params.clone(),
            pathname: join_paths(&[&matched_pathname, &path_match.pathname]),
            pathname_base: normalize_pathname(&join_paths(&[
                &matched_pathname,
                &path_match.pathname_base,
            ])),
        });

        if path_match.pathname_base != "/" {
            matched_pathname = join_paths(&[&matched_pathname, &path_match.pathname_base]);
        }
    }

    Some(matches)
}

struct PathMatch {
    params: Params,
    pathname: String,
    pathname_base: String,
}

fn match_path(pattern: &str, pathname: &str, end: bool) -> Option<PathMatch> {
    let trimmed = pattern.trim_start_matches('/');
    let (body, has_splat) = if trimmed == "*" {
        ("", true)
    } else if let Some(stripped) = trimmed.strip_suffix("/*") {
        (stripped, true)
    } else {
        (trimmed, false)
    };

    let pattern_segments: Vec<&str> = if body.is_empty() {
        Vec::new()
    } else {
        body.split('/').collect()
    };
    let path_segments: Vec<&str> = pathname
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    if pattern_segments.len() > path_segments.len() {
        return None;
    }

    let mut params = Params::new();
    for (pattern_segment, path_segment) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = pattern_segment.strip_prefix(':') {
            params.insert(name.to_string(), decode_param(name, path_segment));
        } else if !pattern_segment.eq_ignore_ascii_case(path_segment) {
            return None;
        }
    }
    let consumed = pattern_segments.len();

    if has_splat {
        let remainder = path_segments[consumed..].join("/");
        params.insert("*".to_string(), decode_param("*", &remainder));
        return Some(PathMatch {
            params,
            pathname: join_segments(&path_segments),
            pathname_base: join_segments(&path_segments[..consumed]),
        });
    }

    if end && consumed != path_segments.len() {
        return None;
    }

    let matched = join_segments(&path_segments[..consumed]);
    Some(PathMatch {
        params,
        pathname: matched.clone(),
        pathname_base: matched,
    })
}

fn join_segments(segments: &[&str]) -> String {
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn decode_param(name: &str, value: &str) -> String {
    match percent_decode_str(value).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => {
            tracing::warn!(param = name, value, "Malformed percent-encoding in path param");
            value.to_string()
        }
    }
}

/// Join path pieces, collapsing duplicate slashes.
pub(crate) fn join_paths(paths: &[&str]) -> String {
    let joined = paths.join("/");
    let mut out = String::with_capacity(joined.len());
    let mut previous_slash = false;
    for c in joined.chars() {
        if c == '/' {
            if !previous_slash {
                out.push(c);
            }
            previous_slash = true;
        } else {
            previous_slash = false;
            out.push(c);
        }
    }
    out
}

/// Strip trailing slashes, keeping at least "/".
pub(crate) fn normalize_pathname(pathname: &str) -> String {
    let trimmed = pathname.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `?index` (with an empty value) addresses a layout's index child.
pub(crate) fn has_naked_index_query(search: &str) -> bool {
    url::form_urlencoded::parse(search.trim_start_matches('?').as_bytes())
        .any(|(key, value)| key == "index" && value.is_empty())
}

/// Matches that contribute path segments (the root always counts).
pub(crate) fn path_contributing_matches(matches: &[RouteMatch]) -> Vec<&RouteMatch> {
    matches
        .iter()
        .enumerate()
        .filter(|(i, m)| {
            *i == 0 || m.route.path.as_ref().is_some_and(|path| !path.is_empty())
        })
        .map(|(_, m)| m)
        .collect()
}

/// The match a submission targets: the index child when addressed with a
/// naked `?index`, otherwise the deepest path-contributing match.
pub(crate) fn get_target_match<'m>(matches: &'m [RouteMatch], search: &str) -> &'m RouteMatch {
    let last = &matches[matches.len() - 1];
    if last.route.index && has_naked_index_query(search) {
        return last;
    }
    let contributing = path_contributing_matches(matches);
    contributing[contributing.len() - 1]
}

/// Fill params into a path pattern: `users/:id` + `{id: 7}` -> `users/7`.
/// Optional segments without a param are dropped; a missing splat binds
/// empty.
pub fn generate_path(path: &str, params: &Params) -> String {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        if segment == "*" {
            if let Some(splat) = params.get("*") {
                if !splat.is_empty() {
                    segments.push(splat.clone());
                }
            }
            continue;
        }
        let optional = segment.ends_with('?');
        let required = segment.trim_end_matches('?');
        if let Some(name) = required.strip_prefix(':') {
            match params.get(name) {
                Some(value) => segments.push(value.clone()),
                None if optional => continue,
                None => segments.push(required.to_string()),
            }
        } else {
            segments.push(required.to_string());
        }
    }
    let joined = segments.join("/");
    if path.starts_with('/') && !joined.starts_with('/') {
        format!("/{}", joined.trim_start_matches('/'))
    } else {
        joined
    }
}
