//! # Route Table
//!
//! Immutable table mapping `(method, path pattern)` to a handler kind and a
//! backend target. The table is assembled once at startup through
//! `RouteTableBuilder` and then shared read-only behind an `Arc`, so the
//! lookup path takes no locks.
//!
//! ## Matching Rules
//! - Patterns are `/`-separated segments; a segment is either a literal or a
//!   whole-segment parameter `{name}`. Partial-segment wildcards are rejected.
//! - When several patterns match a path, the one with the fewest parameters
//!   wins; equally specific patterns are ordered by their left-most literal.
//! - Two patterns with the same method and the same shape (identical once
//!   parameter names are erased) conflict at registration time.
//! - Captured values are percent-decoded.

use axum::http::Method;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::HandlerKind;
use crate::protocols::grpc::RpcMethod;
use crate::protocols::BackendTarget;

/// A registered route
#[derive(Clone)]
pub struct Route {
    pub method: Method,

    /// Path pattern (e.g., "/api/v1/user/avatar/download/{code}")
    pub pattern: String,

    pub handler: HandlerKind,

    /// Backend target, resolved at startup
    pub backend: Arc<BackendTarget>,

    /// Backend method for transcoded routes
    pub rpc: Option<RpcMethod>,
}

impl Route {
    /// Create a route served by transcoding onto an rpc method
    pub fn transcode(
        method: Method,
        pattern: impl Into<String>,
        handler: HandlerKind,
        backend: Arc<BackendTarget>,
        rpc: RpcMethod,
    ) -> Self {
        Self {
            method,
            pattern: pattern.into(),
            handler,
            backend,
            rpc: Some(rpc),
        }
    }

    /// Create a route forwarded verbatim to a plain-HTTP backend
    pub fn passthrough(method: Method, pattern: impl Into<String>, backend: Arc<BackendTarget>) -> Self {
        Self {
            method,
            pattern: pattern.into(),
            handler: HandlerKind::Passthrough,
            backend,
            rpc: None,
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("handler", &self.handler)
            .field("backend", &self.backend.name)
            .field("rpc", &self.rpc.as_ref().map(|m| m.qualified_name()))
            .finish()
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<Route>,

    /// Decoded values of the pattern's `{name}` segments
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed pattern plus the ordering key used to pick between matches
#[derive(Debug, Clone)]
struct CompiledPattern {
    segments: Vec<Segment>,
    param_count: usize,
}

impl CompiledPattern {
    fn parse(pattern: &str) -> GatewayResult<Self> {
        let rest = pattern.strip_prefix('/').ok_or_else(|| {
            GatewayError::config(format!("Route pattern '{}' must start with '/'", pattern))
        })?;

        let mut segments = Vec::new();
        let mut names: Vec<&str> = Vec::new();

        for raw in rest.split('/') {
            let is_param = raw.starts_with('{') && raw.ends_with('}') && raw.len() >= 2;
            if is_param {
                let name = &raw[1..raw.len() - 1];
                if name.is_empty() || name.contains(['{', '}']) {
                    return Err(GatewayError::config(format!(
                        "Route pattern '{}' has an invalid parameter segment '{}'",
                        pattern, raw
                    )));
                }
                if names.contains(&name) {
                    return Err(GatewayError::config(format!(
                        "Route pattern '{}' repeats parameter '{}'",
                        pattern, name
                    )));
                }
                names.push(name);
                segments.push(Segment::Param(name.to_string()));
            } else if raw.contains(['{', '}']) {
                return Err(GatewayError::config(format!(
                    "Route pattern '{}' uses a partial-segment wildcard in '{}'",
                    pattern, raw
                )));
            } else {
                segments.push(Segment::Literal(raw.to_string()));
            }
        }

        Ok(Self {
            param_count: names.len(),
            segments,
        })
    }

    /// Pattern with parameter names erased; equal shapes always match the same paths
    fn shape(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(literal) => literal.as_str(),
                Segment::Param(_) => "{}",
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Fewer parameters first, then the pattern whose first literal comes earliest
    fn specificity(&self, other: &Self) -> Ordering {
        self.param_count.cmp(&other.param_count).then_with(|| {
            let mine = self.segments.iter().map(|s| matches!(s, Segment::Param(_)));
            let theirs = other.segments.iter().map(|s| matches!(s, Segment::Param(_)));
            mine.cmp(theirs)
        })
    }

    fn capture(&self, path_segments: &[&str]) -> Option<Vec<(String, String)>> {
        if path_segments.len() != self.segments.len() {
            return None;
        }

        let mut raw_params = Vec::with_capacity(self.param_count);
        for (segment, value) in self.segments.iter().zip(path_segments) {
            match segment {
                Segment::Literal(literal) if literal == value => {}
                Segment::Literal(_) => return None,
                Segment::Param(_) if value.is_empty() => return None,
                Segment::Param(name) => raw_params.push((name.clone(), value.to_string())),
            }
        }
        Some(raw_params)
    }
}

struct Entry {
    route: Arc<Route>,
    compiled: CompiledPattern,
    shape: String,
}

/// Accumulates routes and checks them for conflicts
#[derive(Default)]
pub struct RouteTableBuilder {
    entries: Vec<Entry>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route; fails on invalid pattern syntax or a conflicting registration
    pub fn register(&mut self, route: Route) -> GatewayResult<()> {
        let compiled = CompiledPattern::parse(&route.pattern)?;
        let shape = compiled.shape();

        if let Some(existing) = self
            .entries
            .iter()
            .find(|entry| entry.route.method == route.method && entry.shape == shape)
        {
            return Err(GatewayError::RouteConflict {
                method: route.method.to_string(),
                pattern: route.pattern.clone(),
                existing: existing.route.pattern.clone(),
            });
        }

        self.entries.push(Entry {
            route: Arc::new(route),
            compiled,
            shape,
        });
        Ok(())
    }

    /// Builder-style variant of `register`
    pub fn route(mut self, route: Route) -> GatewayResult<Self> {
        self.register(route)?;
        Ok(self)
    }

    pub fn build(mut self) -> RouteTable {
        self.entries
            .sort_by(|a, b| a.compiled.specificity(&b.compiled));
        RouteTable {
            entries: self.entries,
        }
    }
}

/// Read-only route table consulted for every request
pub struct RouteTable {
    /// Sorted most specific first, so the first hit is the answer
    entries: Vec<Entry>,
}

impl RouteTable {
    /// Find the most specific route for a method and concrete path
    pub fn match_route(&self, method: &Method, path: &str) -> GatewayResult<RouteMatch> {
        let not_found = || GatewayError::not_found(method.as_str(), path);

        let rest = path.strip_prefix('/').ok_or_else(not_found)?;
        let path_segments: Vec<&str> = rest.split('/').collect();

        for entry in &self.entries {
            if entry.route.method != *method {
                continue;
            }
            if let Some(raw_params) = entry.compiled.capture(&path_segments) {
                let mut params = HashMap::with_capacity(raw_params.len());
                for (name, raw) in raw_params {
                    let decoded = urlencoding::decode(&raw).map_err(|e| {
                        GatewayError::bad_request(format!(
                            "Path parameter '{}' is not valid UTF-8 once decoded: {}",
                            name, e
                        ))
                    })?;
                    params.insert(name, decoded.into_owned());
                }
                return Ok(RouteMatch {
                    route: entry.route.clone(),
                    params,
                });
            }
        }

        Err(not_found())
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.entries.iter().map(|entry| &entry.route)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::HttpForwarder;

    fn backend() -> Arc<BackendTarget> {
        let forwarder = HttpForwarder::new("user-http", "http://127.0.0.1:1").unwrap();
        Arc::new(BackendTarget::http("user-http", forwarder))
    }

    fn route(method: Method, pattern: &str) -> Route {
        Route::passthrough(method, pattern, backend())
    }

    fn table(patterns: &[(Method, &str)]) -> RouteTable {
        let mut builder = RouteTableBuilder::new();
        for (method, pattern) in patterns {
            builder.register(route(method.clone(), pattern)).unwrap();
        }
        builder.build()
    }

    // ============================================================================
    // Matching
    // ============================================================================

    #[test]
    fn test_literal_and_param_matching() {
        let table = table(&[
            (Method::GET, "/api/v1/user/avatar/download/{code}"),
            (Method::POST, "/api/v1/user/avatar/upload"),
        ]);

        let m = table
            .match_route(&Method::GET, "/api/v1/user/avatar/download/abc123")
            .unwrap();
        assert_eq!(m.route.pattern, "/api/v1/user/avatar/download/{code}");
        assert_eq!(m.params.get("code").map(String::as_str), Some("abc123"));

        let m = table
            .match_route(&Method::POST, "/api/v1/user/avatar/upload")
            .unwrap();
        assert!(m.params.is_empty());
    }

    #[test]
    fn test_fewest_parameters_wins() {
        let table = table(&[
            (Method::GET, "/users/{id}/{tab}"),
            (Method::GET, "/users/{id}/profile"),
            (Method::GET, "/users/me/profile"),
        ]);

        let m = table.match_route(&Method::GET, "/users/me/profile").unwrap();
        assert_eq!(m.route.pattern, "/users/me/profile");

        let m = table.match_route(&Method::GET, "/users/42/profile").unwrap();
        assert_eq!(m.route.pattern, "/users/{id}/profile");

        let m = table.match_route(&Method::GET, "/users/42/posts").unwrap();
        assert_eq!(m.route.pattern, "/users/{id}/{tab}");
    }

    #[test]
    fn test_equal_specificity_prefers_leftmost_literal() {
        // Registration order must not matter
        for order in [[0, 1], [1, 0]] {
            let patterns = [(Method::GET, "/a/{x}"), (Method::GET, "/{y}/b")];
            let table = table(&[patterns[order[0]].clone(), patterns[order[1]].clone()]);
            let m = table.match_route(&Method::GET, "/a/b").unwrap();
            assert_eq!(m.route.pattern, "/a/{x}");
        }
    }

    #[test]
    fn test_every_path_has_at_most_one_answer() {
        let table = table(&[
            (Method::GET, "/{a}/{b}/{c}"),
            (Method::GET, "/x/{b}/{c}"),
            (Method::GET, "/{a}/y/{c}"),
            (Method::GET, "/{a}/{b}/z"),
            (Method::GET, "/x/y/{c}"),
            (Method::GET, "/x/{b}/z"),
            (Method::GET, "/{a}/y/z"),
        ]);

        let expectations = [
            ("/x/y/z", "/x/y/{c}"),
            ("/q/y/z", "/{a}/y/z"),
            ("/x/q/z", "/x/{b}/z"),
            ("/q/q/z", "/{a}/{b}/z"),
            ("/q/y/q", "/{a}/y/{c}"),
            ("/q/q/q", "/{a}/{b}/{c}"),
        ];
        for (path, expected) in expectations {
            for _ in 0..3 {
                let m = table.match_route(&Method::GET, path).unwrap();
                assert_eq!(m.route.pattern, expected, "path {}", path);
            }
        }
    }

    #[test]
    fn test_not_found() {
        let table = table(&[(Method::GET, "/api/v1/user/avatar/download/{code}")]);

        for (method, path) in [
            (Method::POST, "/api/v1/user/avatar/download/abc"),
            (Method::GET, "/api/v1/user/avatar/download"),
            (Method::GET, "/api/v1/user/avatar/download/abc/extra"),
            (Method::GET, "/api/v1/user/avatar/download/"),
            (Method::GET, "no-leading-slash"),
        ] {
            let err = table.match_route(&method, path).unwrap_err();
            assert!(matches!(err, GatewayError::NotFound { .. }), "{} {}", method, path);
        }
    }

    #[test]
    fn test_params_are_percent_decoded() {
        let table = table(&[(Method::GET, "/files/{name}")]);
        let m = table.match_route(&Method::GET, "/files/hello%20world").unwrap();
        assert_eq!(m.params["name"], "hello world");

        let err = table.match_route(&Method::GET, "/files/%FF%FE").unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest { .. }));
    }

    // ============================================================================
    // Registration
    // ============================================================================

    #[test]
    fn test_duplicate_registration_conflicts() {
        let mut builder = RouteTableBuilder::new();
        builder.register(route(Method::GET, "/users/{id}")).unwrap();

        let err = builder.register(route(Method::GET, "/users/{id}")).unwrap_err();
        assert!(matches!(err, GatewayError::RouteConflict { .. }));

        let err = builder.register(route(Method::GET, "/users/{user_id}")).unwrap_err();
        assert!(matches!(err, GatewayError::RouteConflict { .. }));

        builder.register(route(Method::DELETE, "/users/{id}")).unwrap();
        assert_eq!(builder.build().len(), 2);
    }

    #[test]
    fn test_invalid_patterns_are_rejected() {
        for pattern in ["/file-{id}", "/a/{}", "/a/{id}/{id}", "relative/{id}", "/a/{b}c"] {
            let mut builder = RouteTableBuilder::new();
            let err = builder.register(route(Method::GET, pattern)).unwrap_err();
            assert!(
                matches!(err, GatewayError::Configuration { .. }),
                "pattern {}",
                pattern
            );
        }
    }

    #[test]
    fn test_builder_chaining() {
        let table = RouteTableBuilder::new()
            .route(route(Method::GET, "/health"))
            .unwrap()
            .route(route(Method::GET, "/ready"))
            .unwrap()
            .build();
        assert_eq!(table.len(), 2);
        assert!(!table.is_empty());
        assert_eq!(table.routes().count(), 2);
    }
}
