//! Segment trie behind the router.
//!
//! Patterns and paths are split on `/` (empty segments are ignored, so
//! `/users/` and `/users` are the same path). Each node has literal children
//! keyed by segment and at most one parameter child. Resolution walks the
//! path one segment at a time, trying the literal child first and falling
//! back to the parameter child only when the literal branch has no route:
//!
//! ```text
//!        /users/active   →  literal "users" → literal "active"      ✔ wins
//!        /users/42       →  literal "users" → literal "42"? no → {id} ✔
//! ```
//!
//! So a literal segment always beats a parameter at the same depth, and a
//! longer literal prefix beats a shorter one. Among routes registered on the
//! same node for the same method, the first registration wins.
//!
//! Cost is O(depth) hash lookups unless a literal branch dead-ends and the
//! walk has to back up into a parameter sibling.

use std::collections::HashMap;

use tracing::warn;

use crate::error::HandlerError;
use crate::method::{Method, UnknownMethod};

// ── RouteError ────────────────────────────────────────────────────────────────

/// A route pattern or method that cannot be registered.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum RouteError {
    #[error("invalid route `{0}`: pattern must start with `/`")]
    MissingSlash(String),

    #[error("invalid route `{pattern}`: bad segment `{segment}`")]
    BadSegment { pattern: String, segment: String },

    #[error("invalid route `{pattern}`: duplicate parameter `{name}`")]
    DuplicateParam { pattern: String, name: String },

    #[error(transparent)]
    Method(#[from] UnknownMethod),
}

// ── Params ────────────────────────────────────────────────────────────────────

/// Path parameters captured by a route, URL-decoded.
///
/// For the route `/users/{id}`, a request to `/users/42` yields
/// `params.get("id") == Some("42")`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Params(HashMap<String, String>);

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Like [`get`](Params::get), but a missing parameter is a
    /// `400 Bad Request`.
    pub fn require(&self, name: &str) -> Result<&str, HandlerError> {
        self.get(name)
            .ok_or_else(|| HandlerError::bad_request(format!("missing argument: {name}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ── Table ─────────────────────────────────────────────────────────────────────

enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
}

struct Route<T> {
    method: Method,
    pattern: String,
    params: Vec<String>,
    value: T,
}

#[derive(Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Node>>,
    // indices into `RouteTable::routes`, in registration order
    routes: Vec<usize>,
}

/// Outcome of [`RouteTable::resolve`].
pub(crate) enum Resolution<'a, T> {
    Matched(Match<'a, T>),
    /// The path matched, the method did not. Carries the methods that would
    /// have matched, sorted, for the `Allow` header.
    MethodNotAllowed(Vec<Method>),
    NotFound,
}

pub(crate) struct Match<'a, T> {
    pub(crate) value: &'a T,
    pub(crate) pattern: &'a str,
    pub(crate) params: Params,
}

/// Method + path-pattern table. Written during setup, read-only afterwards.
pub(crate) struct RouteTable<T> {
    root: Node,
    routes: Vec<Route<T>>,
}

impl<T> RouteTable<T> {
    pub(crate) fn new() -> Self {
        Self { root: Node::default(), routes: Vec::new() }
    }

    pub(crate) fn insert(&mut self, method: Method, pattern: &str, value: T) -> Result<(), RouteError> {
        let segments = parse_pattern(pattern)?;

        let mut node = &mut self.root;
        let mut params = Vec::new();
        for segment in segments {
            node = match segment {
                Segment::Literal(lit) => node.literals.entry(lit.to_owned()).or_default(),
                Segment::Param(name) => {
                    params.push(name.to_owned());
                    node.param.get_or_insert_with(Box::default).as_mut()
                }
            };
        }

        if let Some(&first) = node.routes.iter().find(|&&i| self.routes[i].method == method) {
            warn!(
                %method,
                pattern,
                shadowed_by = %self.routes[first].pattern,
                "route registered twice, first registration wins"
            );
        }

        node.routes.push(self.routes.len());
        self.routes.push(Route { method, pattern: pattern.to_owned(), params, value });
        Ok(())
    }

    pub(crate) fn resolve(&self, method: Method, path: &str) -> Resolution<'_, T> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut captures = Vec::with_capacity(segments.len());
        let mut allowed = Vec::new();

        let Some(index) = self.walk(&self.root, &segments, &mut captures, method, &mut allowed) else {
            if allowed.is_empty() {
                return Resolution::NotFound;
            }
            if allowed.contains(&Method::Get) {
                allowed.push(Method::Head);
            }
            allowed.sort();
            allowed.dedup();
            return Resolution::MethodNotAllowed(allowed);
        };

        let route = &self.routes[index];
        let params = route
            .params
            .iter()
            .zip(captures)
            .map(|(name, raw)| (name.clone(), percent_decode(raw)))
            .collect();
        Resolution::Matched(Match { value: &route.value, pattern: &route.pattern, params })
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }

    fn walk<'p>(
        &self,
        node: &Node,
        segments: &[&'p str],
        captures: &mut Vec<&'p str>,
        method: Method,
        allowed: &mut Vec<Method>,
    ) -> Option<usize> {
        let Some((head, rest)) = segments.split_first() else {
            return self.pick(node, method, allowed);
        };

        if let Some(child) = node.literals.get(*head) {
            if let Some(found) = self.walk(child, rest, captures, method, allowed) {
                return Some(found);
            }
        }
        if let Some(child) = &node.param {
            captures.push(head);
            if let Some(found) = self.walk(child, rest, captures, method, allowed) {
                return Some(found);
            }
            captures.pop();
        }
        None
    }

    /// First route on `node` for `method`; `HEAD` falls back to `GET`.
    fn pick(&self, node: &Node, method: Method, allowed: &mut Vec<Method>) -> Option<usize> {
        let first = |m: Method| node.routes.iter().copied().find(|&i| self.routes[i].method == m);

        let found = first(method).or_else(|| {
            if method == Method::Head { first(Method::Get) } else { None }
        });
        if found.is_none() {
            allowed.extend(node.routes.iter().map(|&i| self.routes[i].method));
        }
        found
    }
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment<'_>>, RouteError> {
    if !pattern.starts_with('/') {
        return Err(RouteError::MissingSlash(pattern.to_owned()));
    }

    let mut segments = Vec::new();
    let mut names: Vec<&str> = Vec::new();
    for raw in pattern.split('/').filter(|s| !s.is_empty()) {
        let bad = || RouteError::BadSegment { pattern: pattern.to_owned(), segment: raw.to_owned() };

        let Some(inner) = raw.strip_prefix('{') else {
            if raw.contains(['{', '}']) {
                return Err(bad());
            }
            segments.push(Segment::Literal(raw));
            continue;
        };

        let name = inner.strip_suffix('}').ok_or_else(bad)?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(bad());
        }
        if names.contains(&name) {
            return Err(RouteError::DuplicateParam {
                pattern: pattern.to_owned(),
                name: name.to_owned(),
            });
        }
        names.push(name);
        segments.push(Segment::Param(name));
    }
    Ok(segments)
}

fn percent_decode(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(raw.as_bytes())).into_owned(),
    }
}
