//! Trie router (component B).
//!
//! Routes are stored in a node table addressed by index rather than raw pointers
//! (§10 "Hand-managed pointer graphs in the trie"): each [`TrieNode`] holds a small
//! ordered map from literal segment to child index, plus at most one parameter-child
//! index. This keeps `match_route` an `O(depth)` walk with no lifetime gymnastics and
//! makes [`Router::remove_route`] a pure index operation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router capacity exceeded")]
    CapacityExceeded,
    #[error("path segment {0:?} is not a valid literal or {{param}} segment")]
    InvalidSegment(String),
}

/// Opaque handler identifier. The router never calls this itself — the connection
/// pipeline (component C) owns invocation; the router only stores and returns it.
pub type HandlerId = u64;

/// A registered route (§3 "Route").
#[derive(Debug, Clone)]
pub struct Route {
    pub id: u64,
    pub method: String,
    pub path: String,
    pub handler: HandlerId,
    pub param_names: Vec<String>,
    pub middleware_chain: Vec<(u64, u32)>,
}

#[derive(Default)]
struct TrieNode {
    static_children: HashMap<String, usize>,
    param_child: Option<usize>,
    param_name: Option<String>,
    handlers: HashMap<String, Route>,
    /// Methods in the order they were first registered at this node, so the
    /// materialized `Allow:` header reflects registration order rather than
    /// an arbitrary hash order (§6 "405 responses MUST include ... methods in
    /// registration order").
    method_order: Vec<String>,
    allowed_methods_cache: String,
}

impl TrieNode {
    /// Recompute `allowed_methods_cache`: every registered method in registration
    /// order, plus an implicit `HEAD` whenever `GET` is present (§3 Trie node
    /// invariant ii).
    fn recompute_allowed_methods(&mut self) {
        let mut out = self.method_order.join(", ");
        if self.handlers.contains_key("GET") && !self.handlers.contains_key("HEAD") {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str("HEAD");
        }
        self.allowed_methods_cache = out;
    }
}

/// Outcome of normalizing and splitting a path into segments.
fn split_segments(path: &str) -> Vec<&str> {
    if path == "/" {
        return Vec::new();
    }
    path.trim_start_matches('/').split('/').collect()
}

/// Normalize a path per §4.B: must start with `/`; trailing `/` stripped except for
/// root; doubled slashes collapsed.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut prev_was_slash = false;
    for c in path.chars() {
        if c == '/' {
            if prev_was_slash {
                continue;
            }
            prev_was_slash = true;
        } else {
            prev_was_slash = false;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Segment kind after parsing a normalized path.
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
}

fn parse_segment(raw: &str) -> Result<Segment<'_>, RouterError> {
    if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        if inner.is_empty() {
            return Err(RouterError::InvalidSegment(raw.to_string()));
        }
        Ok(Segment::Param(inner))
    } else {
        Ok(Segment::Literal(raw))
    }
}

/// Result of [`Router::match_route`] (§3 "Route match").
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Option<Route>,
    pub params: Vec<(String, String)>,
    pub allowed_methods: Option<String>,
    pub status_hint: u16,
}

impl RouteMatch {
    fn not_found() -> Self {
        RouteMatch {
            route: None,
            params: Vec::new(),
            allowed_methods: None,
            status_hint: 404,
        }
    }

    fn method_not_allowed(allowed: String) -> Self {
        RouteMatch {
            route: None,
            params: Vec::new(),
            allowed_methods: Some(allowed),
            status_hint: 405,
        }
    }
}

const MAX_ROUTES: u64 = 1_000_000;

/// The trie router. Built at startup and treated as read-mostly (§5); dynamic
/// mutation after startup is not required to be thread-safe by the spec and callers
/// must serialize it themselves (the router does not take an internal lock).
pub struct Router {
    nodes: Vec<TrieNode>,
    next_id: AtomicU64,
    /// The live route index: ids present here are routable; ids removed via
    /// `remove_route` stay in their trie node's `handlers` map but are filtered out
    /// by `live_handler` on every lookup.
    index: HashSet<u64>,
}

impl Router {
    pub fn init() -> Self {
        Router {
            nodes: vec![TrieNode::default()],
            next_id: AtomicU64::new(1),
            index: HashSet::new(),
        }
    }

    pub fn cleanup(self) {
        drop(self);
    }

    const ROOT: usize = 0;

    fn child_or_insert_static(&mut self, node: usize, segment: &str) -> usize {
        if let Some(&idx) = self.nodes[node].static_children.get(segment) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(TrieNode::default());
        self.nodes[node]
            .static_children
            .insert(segment.to_string(), idx);
        idx
    }

    fn child_or_insert_param(&mut self, node: usize, name: &str) -> usize {
        if let Some(idx) = self.nodes[node].param_child {
            // Tie-break rule (ii): the parameter name at a given depth is fixed by the
            // first route that introduced it; later routes reuse that name even if they
            // spelled it differently.
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(TrieNode::default());
        self.nodes[node].param_child = Some(idx);
        self.nodes[node].param_name = Some(name.to_string());
        idx
    }

    /// Register a route. Returns `0` on capacity exhaustion or an invalid path,
    /// matching §4.B's sentinel failure mode.
    pub fn add_route(
        &mut self,
        method: &str,
        path: &str,
        handler: HandlerId,
        overwrite: bool,
    ) -> u64 {
        self.add_route_with_middleware(method, path, handler, overwrite, Vec::new())
    }

    pub fn add_route_with_middleware(
        &mut self,
        method: &str,
        path: &str,
        handler: HandlerId,
        overwrite: bool,
        middleware_chain: Vec<(u64, u32)>,
    ) -> u64 {
        if self.next_id.load(Ordering::Relaxed) >= MAX_ROUTES {
            tracing::warn!("router capacity exceeded");
            return 0;
        }
        let method = method.to_ascii_uppercase();
        let normalized = normalize_path(path);
        let mut param_names = Vec::new();

        let mut node = Self::ROOT;
        for raw_segment in split_segments(&normalized) {
            let segment = match parse_segment(raw_segment) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "invalid route segment");
                    return 0;
                }
            };
            node = match segment {
                Segment::Literal(s) => self.child_or_insert_static(node, s),
                Segment::Param(name) => {
                    param_names.push(name.to_string());
                    self.child_or_insert_param(node, name)
                }
            };
        }

        if self.nodes[node].handlers.contains_key(&method) {
            if !overwrite {
                tracing::warn!(
                    method = %method,
                    path = %normalized,
                    "route already registered; keeping existing handler (overwrite=false)"
                );
                // Still report success with the existing route's id (§9 Open Question:
                // keep the existing handler rather than silently replacing it).
                return self.nodes[node].handlers[&method].id;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let route = Route {
            id,
            method: method.clone(),
            path: normalized.clone(),
            handler,
            param_names,
            middleware_chain,
        };
        if !self.nodes[node].handlers.contains_key(&method) {
            self.nodes[node].method_order.push(method.clone());
        }
        self.nodes[node].handlers.insert(method, route.clone());
        self.nodes[node].recompute_allowed_methods();
        self.index.insert(id);
        id
    }

    /// Descend the trie for `(method, path)`, backtracking one parameter binding at a
    /// time when a branch dead-ends (§4.B match algorithm).
    pub fn match_route(&self, method: &str, path: &str) -> RouteMatch {
        let method = method.to_ascii_uppercase();
        let normalized = normalize_path(path);
        let segments: Vec<&str> = split_segments(&normalized);

        let mut params = Vec::new();
        match self.descend(Self::ROOT, &segments, 0, &mut params) {
            Some(node) => self.resolve_handlers(node, &method, params),
            None => RouteMatch::not_found(),
        }
    }

    fn descend(
        &self,
        node: usize,
        segments: &[&str],
        depth: usize,
        params: &mut Vec<(String, String)>,
    ) -> Option<usize> {
        if depth == segments.len() {
            return Some(node);
        }
        let segment = segments[depth];

        // Static children always beat parameter children (tie-break rule i).
        if let Some(&next) = self.nodes[node].static_children.get(segment) {
            if let Some(found) = self.descend(next, segments, depth + 1, params) {
                return Some(found);
            }
        }

        if let Some(next) = self.nodes[node].param_child {
            let name = self.nodes[node].param_name.clone().unwrap_or_default();
            params.push((name, segment.to_string()));
            if let Some(found) = self.descend(next, segments, depth + 1, params) {
                return Some(found);
            }
            params.pop();
        }

        None
    }

    fn resolve_handlers(&self, node: usize, method: &str, params: Vec<(String, String)>) -> RouteMatch {
        let trie_node = &self.nodes[node];

        if let Some(route) = self.live_handler(trie_node, method) {
            return RouteMatch {
                route: Some(route),
                params,
                allowed_methods: None,
                status_hint: 200,
            };
        }

        // HEAD falls back to GET when no HEAD handler is registered.
        if method == "HEAD" {
            if let Some(route) = self.live_handler(trie_node, "GET") {
                return RouteMatch {
                    route: Some(route),
                    params,
                    allowed_methods: None,
                    status_hint: 200,
                };
            }
        }

        if trie_node.handlers.values().any(|r| self.index.contains(&r.id)) {
            RouteMatch::method_not_allowed(trie_node.allowed_methods_cache.clone())
        } else {
            RouteMatch::not_found()
        }
    }

    /// Look up a handler at a node, re-verifying against the live route index so a
    /// `remove_route`'d handler (whose slot may still linger in the trie) is treated
    /// as absent without rewriting the trie (§4.B `remove_route`, §10 Open Question).
    fn live_handler(&self, node: &TrieNode, method: &str) -> Option<Route> {
        let route = node.handlers.get(method)?;
        if self.index.contains(&route.id) {
            Some(route.clone())
        } else {
            None
        }
    }

    /// Unlink a route from the live index without rewriting the trie. The trie node's
    /// handler slot is left in place; `match_route` re-verifies liveness via the index
    /// on every lookup (§4.B `remove_route`).
    pub fn remove_route(&mut self, id: u64) -> bool {
        self.index.remove(&id)
    }

    /// Introspection: up to `max` live routes.
    pub fn get_routes(&self, max: usize) -> Vec<Route> {
        let mut out = Vec::new();
        for node in &self.nodes {
            for route in node.handlers.values() {
                if self.index.contains(&route.id) {
                    out.push(route.clone());
                    if out.len() >= max {
                        return out;
                    }
                }
            }
        }
        out
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_is_idempotent() {
        for p in ["/a//b/", "a/b", "/", "//", "/a/b/c//"] {
            let once = normalize_path(p);
            let twice = normalize_path(&once);
            assert_eq!(once, twice, "input {p:?}");
        }
    }

    #[test]
    fn scenario_param_route_matches_and_extracts() {
        let mut router = Router::init();
        router.add_route("GET", "/users/{user_id}", 1, true);

        let m = router.match_route("GET", "/users/42");
        assert_eq!(m.status_hint, 200);
        assert_eq!(m.params, vec![("user_id".to_string(), "42".to_string())]);
        assert_eq!(m.route.unwrap().handler, 1);
    }

    #[test]
    fn scenario_method_not_allowed_includes_head() {
        let mut router = Router::init();
        router.add_route("GET", "/users/{user_id}", 1, true);

        let m = router.match_route("POST", "/users/42");
        assert_eq!(m.status_hint, 405);
        assert_eq!(m.allowed_methods.unwrap(), "GET, HEAD");
    }

    #[test]
    fn scenario_static_beats_param() {
        let mut router = Router::init();
        router.add_route("GET", "/a/{x}", 1, true);
        router.add_route("GET", "/a/b", 2, true);

        let static_match = router.match_route("GET", "/a/b");
        assert_eq!(static_match.route.unwrap().handler, 2);

        let param_match = router.match_route("GET", "/a/c");
        assert_eq!(param_match.params, vec![("x".to_string(), "c".to_string())]);
        assert_eq!(param_match.route.unwrap().handler, 1);
    }

    #[test]
    fn head_falls_back_to_get() {
        let mut router = Router::init();
        router.add_route("GET", "/ping", 7, true);

        let m = router.match_route("HEAD", "/ping");
        assert_eq!(m.status_hint, 200);
        assert_eq!(m.route.unwrap().handler, 7);
    }

    #[test]
    fn no_route_at_all_is_404() {
        let router = Router::init();
        let m = router.match_route("GET", "/nope");
        assert_eq!(m.status_hint, 404);
    }

    #[test]
    fn remove_route_hides_handler_without_rewriting_trie() {
        let mut router = Router::init();
        let id = router.add_route("GET", "/a", 1, true);
        assert!(router.remove_route(id));

        let m = router.match_route("GET", "/a");
        assert_eq!(m.status_hint, 404);
    }

    #[test]
    fn overwrite_false_keeps_existing_handler() {
        let mut router = Router::init();
        let first = router.add_route("GET", "/a", 1, true);
        let second = router.add_route("GET", "/a", 2, false);
        assert_eq!(first, second);

        let m = router.match_route("GET", "/a");
        assert_eq!(m.route.unwrap().handler, 1);
    }

    #[test]
    fn overwrite_true_replaces_silently() {
        let mut router = Router::init();
        router.add_route("GET", "/a", 1, true);
        router.add_route("GET", "/a", 2, true);

        let m = router.match_route("GET", "/a");
        assert_eq!(m.route.unwrap().handler, 2);
    }

    #[test]
    fn param_name_fixed_by_first_route_at_depth() {
        let mut router = Router::init();
        router.add_route("GET", "/items/{id}", 1, true);
        // A later route at the same depth with a different param spelling reuses the
        // original name instead of renaming the node (§4.B tie-break rule ii).
        router.add_route("POST", "/items/{item_id}", 2, true);

        let m = router.match_route("GET", "/items/9");
        assert_eq!(m.params[0].0, "id");
    }

    #[test]
    fn get_routes_respects_max() {
        let mut router = Router::init();
        router.add_route("GET", "/a", 1, true);
        router.add_route("GET", "/b", 2, true);
        router.add_route("GET", "/c", 3, true);

        assert_eq!(router.get_routes(2).len(), 2);
    }

    #[test]
    fn zero_capacity_registration_returns_zero_id_is_never_reused() {
        // A route id of 0 is never handed out for a successful registration.
        let mut router = Router::init();
        let id = router.add_route("GET", "/x", 1, true);
        assert_ne!(id, 0);
    }
}
