//! Bootstrap configuration: listeners, route tables, clusters, runtime
//! overrides. Loaded once at startup from the JSON file named by
//! `--config-path`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::Error;
use crate::route::{
    retry_on, HashPolicy, RedirectEntry, RetryPolicy, Route, RouteAction, RouteConfig,
    RouteEntry, RouteMatch, ShadowPolicy, VirtualCluster, VirtualHost,
};
use crate::upstream::{CircuitBreakerLimits, LbPolicy, OutlierConfig, Priority};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bootstrap {
    pub listeners: Vec<ListenerConfig>,
    pub clusters: Vec<ClusterConfig>,
    /// Cluster describing this proxy's own fleet, for zone-aware routing.
    #[serde(default)]
    pub local_cluster_name: Option<String>,
    /// Runtime key overrides (integers and percentages).
    #[serde(default)]
    pub runtime: HashMap<String, u64>,
    #[serde(default)]
    pub access_log_path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub address: SocketAddr,
    #[serde(default = "default_true")]
    pub use_remote_address: bool,
    #[serde(default = "default_read_buffer_limit")]
    pub read_buffer_limit: usize,
    pub route_config: RouteConfigDef,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfigDef {
    pub virtual_hosts: Vec<VirtualHostDef>,
    #[serde(default)]
    pub response_headers_to_add: Vec<HeaderValueDef>,
    #[serde(default)]
    pub response_headers_to_remove: Vec<String>,
    /// Stripped from requests arriving from external callers.
    #[serde(default)]
    pub internal_only_headers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualHostDef {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<RouteDef>,
    #[serde(default)]
    pub virtual_clusters: Vec<VirtualClusterDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualClusterDef {
    pub name: String,
    pub path_prefix: String,
    #[serde(default)]
    pub method: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDef {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub host_redirect: Option<String>,
    #[serde(default)]
    pub path_redirect: Option<String>,
    #[serde(default = "default_route_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub prefix_rewrite: Option<String>,
    #[serde(default)]
    pub host_rewrite: Option<String>,
    #[serde(default)]
    pub auto_host_rewrite: bool,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicyDef>,
    #[serde(default)]
    pub shadow: Option<ShadowDef>,
    #[serde(default)]
    pub hash_header: Option<String>,
    #[serde(default)]
    pub request_headers_to_add: Vec<HeaderValueDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicyDef {
    pub retry_on: String,
    #[serde(default)]
    pub num_retries: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShadowDef {
    pub cluster: String,
    #[serde(default)]
    pub runtime_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeaderValueDef {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub lb_type: LbPolicy,
    pub hosts: Vec<HostDef>,
    #[serde(default)]
    pub max_requests_per_connection: u64,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub circuit_breakers: HashMap<Priority, CircuitBreakerLimits>,
    #[serde(default)]
    pub outlier_detection: Option<OutlierConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDef {
    pub address: SocketAddr,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub canary: bool,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_true() -> bool {
    true
}

fn default_read_buffer_limit() -> usize {
    1024 * 1024
}

fn default_route_timeout_ms() -> u64 {
    15_000
}

fn default_connect_timeout_ms() -> u64 {
    250
}

fn default_weight() -> u32 {
    1
}

impl Bootstrap {
    pub fn load(path: &Path) -> Result<Bootstrap, Error> {
        let contents = std::fs::read_to_string(path)?;
        let bootstrap: Bootstrap = serde_json::from_str(&contents)?;
        bootstrap.validate()?;
        Ok(bootstrap)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.listeners.is_empty() {
            return Err(Error::Config("at least one listener is required".into()));
        }
        for listener in &self.listeners {
            for vhost in &listener.route_config.virtual_hosts {
                for route in &vhost.routes {
                    let is_redirect =
                        route.host_redirect.is_some() || route.path_redirect.is_some();
                    if route.cluster.is_some() == is_redirect {
                        return Err(Error::Config(format!(
                            "virtual host '{}': each route needs exactly one of cluster or redirect",
                            vhost.name
                        )));
                    }
                    if route.prefix.is_some() == route.path.is_some() {
                        return Err(Error::Config(format!(
                            "virtual host '{}': each route needs exactly one of prefix or path",
                            vhost.name
                        )));
                    }
                    if let Some(cluster) = &route.cluster {
                        if !self.clusters.iter().any(|c| &c.name == cluster) {
                            return Err(Error::Config(format!(
                                "route references unknown cluster '{cluster}'"
                            )));
                        }
                    }
                }
            }
        }
        if let Some(local) = &self.local_cluster_name {
            if !self.clusters.iter().any(|c| &c.name == local) {
                return Err(Error::Config(format!(
                    "local_cluster_name references unknown cluster '{local}'"
                )));
            }
        }
        Ok(())
    }
}

impl RouteConfigDef {
    pub fn build(&self) -> RouteConfig {
        let vhosts = self
            .virtual_hosts
            .iter()
            .map(|vhost| VirtualHost {
                name: vhost.name.clone(),
                domains: vhost.domains.clone(),
                routes: vhost.routes.iter().map(RouteDef::build).collect(),
                virtual_clusters: vhost
                    .virtual_clusters
                    .iter()
                    .map(|vc| VirtualCluster {
                        name: vc.name.clone(),
                        path_prefix: vc.path_prefix.clone(),
                        method: vc.method.clone(),
                    })
                    .collect(),
            })
            .collect();
        let mut route_config = RouteConfig::new(vhosts);
        route_config.response_headers_to_add = self
            .response_headers_to_add
            .iter()
            .map(|h| (h.key.clone(), h.value.clone()))
            .collect();
        route_config.response_headers_to_remove = self.response_headers_to_remove.clone();
        route_config.internal_only_headers = self.internal_only_headers.clone();
        route_config
    }
}

impl RouteDef {
    fn build(&self) -> Route {
        let matcher = match (&self.prefix, &self.path) {
            (Some(prefix), _) => RouteMatch::Prefix(prefix.clone()),
            (None, Some(path)) => RouteMatch::Path(path.clone()),
            (None, None) => RouteMatch::Prefix("/".to_string()),
        };
        let action = match &self.cluster {
            Some(cluster) => RouteAction::Route(RouteEntry {
                cluster: cluster.clone(),
                timeout: std::time::Duration::from_millis(self.timeout_ms),
                priority: self.priority,
                prefix_rewrite: self.prefix_rewrite.clone(),
                host_rewrite: self.host_rewrite.clone(),
                auto_host_rewrite: self.auto_host_rewrite,
                retry_policy: self
                    .retry_policy
                    .as_ref()
                    .map(|p| RetryPolicy {
                        retry_on: retry_on::parse(&p.retry_on),
                        num_retries: p.num_retries,
                    })
                    .unwrap_or_default(),
                shadow_policy: self.shadow.as_ref().map(|s| ShadowPolicy {
                    cluster: s.cluster.clone(),
                    runtime_key: s.runtime_key.clone(),
                }),
                hash_policy: self.hash_header.as_ref().map(|name| HashPolicy {
                    header_name: name.clone(),
                }),
                request_headers_to_add: self
                    .request_headers_to_add
                    .iter()
                    .map(|h| (h.key.clone(), h.value.clone()))
                    .collect(),
            }),
            None => RouteAction::Redirect(RedirectEntry {
                host_redirect: self.host_redirect.clone(),
                path_redirect: self.path_redirect.clone(),
            }),
        };
        Route { matcher, action }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "listeners": [{
                "address": "127.0.0.1:10000",
                "route_config": {
                    "virtual_hosts": [{
                        "name": "default",
                        "domains": ["*"],
                        "routes": [{"prefix": "/", "cluster": "backend"}]
                    }]
                }
            }],
            "clusters": [{
                "name": "backend",
                "hosts": [{"address": "127.0.0.1:8080"}]
            }]
        })
    }

    fn parse(value: serde_json::Value) -> Result<Bootstrap, Error> {
        let bootstrap: Bootstrap = serde_json::from_value(value)?;
        bootstrap.validate()?;
        Ok(bootstrap)
    }

    #[test]
    fn minimal_config_parses() {
        let bootstrap = parse(minimal()).unwrap();
        assert_eq!(bootstrap.listeners.len(), 1);
        assert_eq!(bootstrap.clusters[0].connect_timeout_ms, 250);
        assert_eq!(bootstrap.clusters[0].lb_type, LbPolicy::RoundRobin);
        let route_config = bootstrap.listeners[0].route_config.build();
        let mut headers = protocol_http1::HeaderMap::new();
        headers.set_inline(protocol_http1::InlineName::Authority, "anything");
        headers.set_inline(protocol_http1::InlineName::Path, "/x");
        assert!(route_config.route(&headers).is_some());
    }

    #[test]
    fn unknown_cluster_rejected() {
        let mut value = minimal();
        value["listeners"][0]["route_config"]["virtual_hosts"][0]["routes"][0]["cluster"] =
            "missing".into();
        assert!(parse(value).is_err());
    }

    #[test]
    fn route_needs_cluster_or_redirect() {
        let mut value = minimal();
        value["listeners"][0]["route_config"]["virtual_hosts"][0]["routes"][0] =
            serde_json::json!({"prefix": "/"});
        assert!(parse(value).is_err());
    }

    #[test]
    fn redirect_route_accepted() {
        let mut value = minimal();
        value["listeners"][0]["route_config"]["virtual_hosts"][0]["routes"][0] =
            serde_json::json!({"prefix": "/", "host_redirect": "elsewhere.example.com"});
        let bootstrap = parse(value).unwrap();
        let route_config = bootstrap.listeners[0].route_config.build();
        let mut headers = protocol_http1::HeaderMap::new();
        headers.set_inline(protocol_http1::InlineName::Authority, "x");
        headers.set_inline(protocol_http1::InlineName::Path, "/a");
        let resolved = route_config.route(&headers).unwrap();
        assert!(matches!(resolved.action, RouteAction::Redirect(_)));
    }

    #[test]
    fn full_route_options_parse() {
        let mut value = minimal();
        value["listeners"][0]["route_config"]["virtual_hosts"][0]["routes"][0] = serde_json::json!({
            "prefix": "/api/",
            "cluster": "backend",
            "timeout_ms": 500,
            "prefix_rewrite": "/",
            "auto_host_rewrite": true,
            "retry_policy": {"retry_on": "5xx,connect-failure", "num_retries": 2},
            "shadow": {"cluster": "backend", "runtime_key": "shadow.api"},
            "hash_header": "x-consistent-hash",
            "request_headers_to_add": [{"key": "x-edge", "value": "1"}]
        });
        let bootstrap = parse(value).unwrap();
        let route_config = bootstrap.listeners[0].route_config.build();
        let mut headers = protocol_http1::HeaderMap::new();
        headers.set_inline(protocol_http1::InlineName::Authority, "x");
        headers.set_inline(protocol_http1::InlineName::Path, "/api/y");
        let resolved = route_config.route(&headers).unwrap();
        let RouteAction::Route(entry) = &resolved.action else {
            panic!("expected route");
        };
        assert_eq!(entry.timeout, std::time::Duration::from_millis(500));
        assert_eq!(
            entry.retry_policy.retry_on,
            retry_on::FIVE_XX | retry_on::CONNECT_FAILURE
        );
        assert_eq!(entry.retry_policy.num_retries, 2);
        assert!(entry.shadow_policy.is_some());
        assert!(entry.hash_policy.is_some());
    }

    #[test]
    fn outlier_and_breaker_config_parse() {
        let mut value = minimal();
        value["clusters"][0]["outlier_detection"] = serde_json::json!({
            "consecutive_5xx": 3,
            "interval_ms": 5000
        });
        value["clusters"][0]["circuit_breakers"] = serde_json::json!({
            "default": {"max_connections": 7}
        });
        let bootstrap = parse(value).unwrap();
        let outlier = bootstrap.clusters[0].outlier_detection.as_ref().unwrap();
        assert_eq!(outlier.consecutive_5xx, 3);
        assert_eq!(outlier.interval_ms, 5000);
        // Unset fields keep defaults.
        assert_eq!(outlier.max_ejection_percent, 10);
        assert_eq!(
            bootstrap.clusters[0]
                .circuit_breakers
                .get(&Priority::Default)
                .unwrap()
                .max_connections,
            7
        );
    }

    #[test]
    fn listeners_required() {
        let value = serde_json::json!({"listeners": [], "clusters": []});
        assert!(parse(value).is_err());
    }
}
