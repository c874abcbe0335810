//! Route table: virtual hosts, route entries, redirects, and the
//! per-route policies the router consumes (retry, shadow, hash, virtual
//! clusters, header finalization).

use std::sync::Arc;
use std::time::Duration;

use protocol_http1::{HeaderMap, InlineName};

use crate::upstream::ring::hash_key;
use crate::upstream::Priority;

/// Retry condition bits, from route config or `x-envoy-retry-on`.
pub mod retry_on {
    pub const FIVE_XX: u32 = 0x1;
    pub const CONNECT_FAILURE: u32 = 0x2;
    pub const RETRIABLE_4XX: u32 = 0x4;
    pub const REFUSED_STREAM: u32 = 0x8;

    /// Parse a comma-separated condition list. Unknown tokens are ignored.
    pub fn parse(value: &str) -> u32 {
        let mut mask = 0;
        for token in value.split(',') {
            mask |= match token.trim() {
                "5xx" => FIVE_XX,
                "connect-failure" => CONNECT_FAILURE,
                "retriable-4xx" => RETRIABLE_4XX,
                "refused-stream" => REFUSED_STREAM,
                _ => 0,
            };
        }
        mask
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub retry_on: u32,
    pub num_retries: u32,
}

#[derive(Debug, Clone)]
pub struct ShadowPolicy {
    /// Mirror cluster.
    pub cluster: String,
    /// Runtime key sampled out of 10000; absent means always shadow.
    pub runtime_key: Option<String>,
}

/// Maps request headers to an optional 64-bit LB hash key.
#[derive(Debug, Clone)]
pub struct HashPolicy {
    pub header_name: String,
}

impl HashPolicy {
    pub fn generate_hash(&self, headers: &HeaderMap) -> Option<u64> {
        headers
            .get(&self.header_name)
            .map(|value| hash_key(value.as_bytes()))
    }
}

/// Named request classes for per-virtual-cluster stats.
#[derive(Debug, Clone)]
pub struct VirtualCluster {
    pub name: String,
    pub path_prefix: String,
    pub method: Option<String>,
}

impl VirtualCluster {
    fn matches(&self, headers: &HeaderMap) -> bool {
        if let Some(method) = &self.method {
            if headers.get_inline(InlineName::Method) != Some(method.as_str()) {
                return false;
            }
        }
        path_of(headers).starts_with(&self.path_prefix)
    }
}

#[derive(Debug, Clone)]
pub enum RouteMatch {
    Prefix(String),
    Path(String),
}

impl RouteMatch {
    fn matches(&self, path: &str) -> bool {
        match self {
            RouteMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
            RouteMatch::Path(exact) => path == exact,
        }
    }
}

/// A redirect: produces a URL from the request headers.
#[derive(Debug, Clone, Default)]
pub struct RedirectEntry {
    pub host_redirect: Option<String>,
    pub path_redirect: Option<String>,
}

impl RedirectEntry {
    pub fn new_path(&self, headers: &HeaderMap) -> String {
        let host = self
            .host_redirect
            .as_deref()
            .or_else(|| headers.get_inline(InlineName::Authority))
            .unwrap_or("");
        let path = self
            .path_redirect
            .as_deref()
            .unwrap_or_else(|| headers.get_inline(InlineName::Path).unwrap_or("/"));
        format!("http://{host}{path}")
    }
}

/// A forwarding route: target cluster plus policies.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub cluster: String,
    pub timeout: Duration,
    pub priority: Priority,
    pub prefix_rewrite: Option<String>,
    pub host_rewrite: Option<String>,
    pub auto_host_rewrite: bool,
    pub retry_policy: RetryPolicy,
    pub shadow_policy: Option<ShadowPolicy>,
    pub hash_policy: Option<HashPolicy>,
    pub request_headers_to_add: Vec<(String, String)>,
}

impl Default for RouteEntry {
    fn default() -> Self {
        RouteEntry {
            cluster: String::new(),
            timeout: Duration::from_secs(15),
            priority: Priority::Default,
            prefix_rewrite: None,
            host_rewrite: None,
            auto_host_rewrite: false,
            retry_policy: RetryPolicy::default(),
            shadow_policy: None,
            hash_policy: None,
            request_headers_to_add: Vec::new(),
        }
    }
}

impl RouteEntry {
    /// Apply route-level request mutations before the upstream encode:
    /// prefix rewrite, host rewrite, added headers.
    pub fn finalize_request_headers(&self, headers: &mut HeaderMap, matched: &RouteMatch) {
        if let Some(rewrite) = &self.prefix_rewrite {
            if let RouteMatch::Prefix(prefix) = matched {
                if let Some(path) = headers.get_inline(InlineName::Path) {
                    if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                        let new_path = format!("{rewrite}{rest}");
                        headers.set_inline(InlineName::Path, new_path);
                    }
                }
            }
        }
        if let Some(host) = &self.host_rewrite {
            headers.set_inline(InlineName::Authority, host.clone());
        }
        for (name, value) in &self.request_headers_to_add {
            headers.insert(name, value.clone());
        }
    }
}

#[derive(Debug, Clone)]
pub enum RouteAction {
    Route(RouteEntry),
    Redirect(RedirectEntry),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub matcher: RouteMatch,
    pub action: RouteAction,
}

#[derive(Debug, Clone, Default)]
pub struct VirtualHost {
    pub name: String,
    /// Exact domains, `*.suffix` wildcards, or the catch-all `*`.
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
    pub virtual_clusters: Vec<VirtualCluster>,
}

impl VirtualHost {
    fn matches_domain(&self, authority: &str) -> DomainMatch {
        let mut best = DomainMatch::None;
        for domain in &self.domains {
            if domain == authority {
                return DomainMatch::Exact;
            }
            if domain == "*" {
                best = best.max(DomainMatch::CatchAll);
            } else if let Some(suffix) = domain.strip_prefix('*') {
                if authority.ends_with(suffix) {
                    best = best.max(DomainMatch::Wildcard);
                }
            }
        }
        best
    }

    pub fn virtual_cluster(&self, headers: &HeaderMap) -> Option<&VirtualCluster> {
        self.virtual_clusters.iter().find(|vc| vc.matches(headers))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DomainMatch {
    None,
    CatchAll,
    Wildcard,
    Exact,
}

/// A resolved route: the owning virtual host and the matched route.
#[derive(Clone)]
pub struct ResolvedRoute {
    pub vhost: Arc<VirtualHost>,
    pub matcher: RouteMatch,
    pub action: RouteAction,
}

/// The full route table for one listener.
#[derive(Default)]
pub struct RouteConfig {
    vhosts: Vec<Arc<VirtualHost>>,
    pub response_headers_to_add: Vec<(String, String)>,
    pub response_headers_to_remove: Vec<String>,
    pub internal_only_headers: Vec<String>,
}

impl RouteConfig {
    pub fn new(vhosts: Vec<VirtualHost>) -> RouteConfig {
        RouteConfig {
            vhosts: vhosts.into_iter().map(Arc::new).collect(),
            ..RouteConfig::default()
        }
    }

    /// Resolve the route for a request: best-matching virtual host by
    /// `:authority`, then first route whose matcher accepts `:path`.
    pub fn route(&self, headers: &HeaderMap) -> Option<ResolvedRoute> {
        let authority = headers.get_inline(InlineName::Authority).unwrap_or("");
        let vhost = self.match_vhost(authority)?;
        let path = path_of(headers);
        for route in &vhost.routes {
            if route.matcher.matches(path) {
                return Some(ResolvedRoute {
                    vhost: vhost.clone(),
                    matcher: route.matcher.clone(),
                    action: route.action.clone(),
                });
            }
        }
        None
    }

    fn match_vhost(&self, authority: &str) -> Option<&Arc<VirtualHost>> {
        let mut best: Option<(&Arc<VirtualHost>, DomainMatch)> = None;
        for vhost in &self.vhosts {
            let quality = vhost.matches_domain(authority);
            if quality == DomainMatch::Exact {
                return Some(vhost);
            }
            if quality != DomainMatch::None
                && best.map(|(_, q)| quality > q).unwrap_or(true)
            {
                best = Some((vhost, quality));
            }
        }
        best.map(|(vhost, _)| vhost)
    }
}

/// Path component of `:path`, with the query string stripped.
pub fn path_of(headers: &HeaderMap) -> &str {
    let path = headers.get_inline(InlineName::Path).unwrap_or("/");
    path.split('?').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(authority: &str, path: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.set_inline(InlineName::Method, "GET");
        h.set_inline(InlineName::Authority, authority);
        h.set_inline(InlineName::Path, path);
        h
    }

    fn config() -> RouteConfig {
        RouteConfig::new(vec![
            VirtualHost {
                name: "api".into(),
                domains: vec!["api.example.com".into()],
                routes: vec![
                    Route {
                        matcher: RouteMatch::Path("/health".into()),
                        action: RouteAction::Route(RouteEntry {
                            cluster: "health".into(),
                            ..RouteEntry::default()
                        }),
                    },
                    Route {
                        matcher: RouteMatch::Prefix("/v1/".into()),
                        action: RouteAction::Route(RouteEntry {
                            cluster: "backend_v1".into(),
                            prefix_rewrite: Some("/".into()),
                            ..RouteEntry::default()
                        }),
                    },
                ],
                virtual_clusters: vec![VirtualCluster {
                    name: "writes".into(),
                    path_prefix: "/v1/write".into(),
                    method: Some("POST".into()),
                }],
            },
            VirtualHost {
                name: "default".into(),
                domains: vec!["*".into()],
                routes: vec![Route {
                    matcher: RouteMatch::Prefix("/".into()),
                    action: RouteAction::Route(RouteEntry {
                        cluster: "fallback".into(),
                        ..RouteEntry::default()
                    }),
                }],
                virtual_clusters: Vec::new(),
            },
        ])
    }

    fn cluster_of(resolved: &ResolvedRoute) -> &str {
        match &resolved.action {
            RouteAction::Route(entry) => &entry.cluster,
            RouteAction::Redirect(_) => panic!("expected route"),
        }
    }

    #[test]
    fn exact_domain_wins_over_catch_all() {
        let config = config();
        let resolved = config.route(&headers("api.example.com", "/v1/x")).unwrap();
        assert_eq!(cluster_of(&resolved), "backend_v1");
        let resolved = config.route(&headers("other.example.com", "/v1/x")).unwrap();
        assert_eq!(cluster_of(&resolved), "fallback");
    }

    #[test]
    fn path_match_beats_later_prefix() {
        let config = config();
        let resolved = config.route(&headers("api.example.com", "/health")).unwrap();
        assert_eq!(cluster_of(&resolved), "health");
    }

    #[test]
    fn query_string_ignored_for_matching() {
        let config = config();
        let resolved = config
            .route(&headers("api.example.com", "/health?verbose=1"))
            .unwrap();
        assert_eq!(cluster_of(&resolved), "health");
    }

    #[test]
    fn wildcard_domain_suffix() {
        let config = RouteConfig::new(vec![VirtualHost {
            name: "wild".into(),
            domains: vec!["*.example.com".into()],
            routes: vec![Route {
                matcher: RouteMatch::Prefix("/".into()),
                action: RouteAction::Route(RouteEntry {
                    cluster: "wild".into(),
                    ..RouteEntry::default()
                }),
            }],
            virtual_clusters: Vec::new(),
        }]);
        assert!(config.route(&headers("a.example.com", "/")).is_some());
        assert!(config.route(&headers("example.org", "/")).is_none());
    }

    #[test]
    fn prefix_rewrite_preserves_suffix() {
        let config = config();
        let mut h = headers("api.example.com", "/v1/users?id=3");
        let resolved = config.route(&h).unwrap();
        let RouteAction::Route(entry) = &resolved.action else {
            panic!("expected route");
        };
        entry.finalize_request_headers(&mut h, &resolved.matcher);
        assert_eq!(h.get_inline(InlineName::Path), Some("/users?id=3"));
    }

    #[test]
    fn host_rewrite_and_added_headers() {
        let entry = RouteEntry {
            cluster: "c".into(),
            host_rewrite: Some("internal.host".into()),
            request_headers_to_add: vec![("x-edge".into(), "1".into())],
            ..RouteEntry::default()
        };
        let mut h = headers("public.host", "/x");
        entry.finalize_request_headers(&mut h, &RouteMatch::Prefix("/".into()));
        assert_eq!(h.get_inline(InlineName::Authority), Some("internal.host"));
        assert_eq!(h.get("x-edge"), Some("1"));
    }

    #[test]
    fn redirect_builds_location() {
        let redirect = RedirectEntry {
            host_redirect: Some("new.example.com".into()),
            path_redirect: None,
        };
        let h = headers("old.example.com", "/path");
        assert_eq!(redirect.new_path(&h), "http://new.example.com/path");
    }

    #[test]
    fn virtual_cluster_requires_method_and_prefix() {
        let config = config();
        let resolved = config
            .route(&headers("api.example.com", "/v1/write/doc"))
            .unwrap();
        let mut h = headers("api.example.com", "/v1/write/doc");
        assert!(resolved.vhost.virtual_cluster(&h).is_none()); // GET
        h.set_inline(InlineName::Method, "POST");
        assert_eq!(
            resolved.vhost.virtual_cluster(&h).map(|vc| vc.name.as_str()),
            Some("writes")
        );
    }

    #[test]
    fn retry_on_parsing() {
        assert_eq!(retry_on::parse("5xx"), retry_on::FIVE_XX);
        assert_eq!(
            retry_on::parse("5xx,connect-failure"),
            retry_on::FIVE_XX | retry_on::CONNECT_FAILURE
        );
        assert_eq!(
            retry_on::parse(" retriable-4xx , refused-stream "),
            retry_on::RETRIABLE_4XX | retry_on::REFUSED_STREAM
        );
        assert_eq!(retry_on::parse("bogus"), 0);
    }

    #[test]
    fn hash_policy_from_header() {
        let policy = HashPolicy {
            header_name: "x-consistent-hash".into(),
        };
        let mut h = headers("a", "/");
        assert!(policy.generate_hash(&h).is_none());
        h.insert("x-consistent-hash", "k");
        let first = policy.generate_hash(&h).unwrap();
        assert_eq!(policy.generate_hash(&h), Some(first));
    }
}
