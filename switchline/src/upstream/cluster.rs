//! Cluster identity, limits, stats, and host-set snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;

use crate::runtime::Snapshot;
use crate::stats::{Counter, Gauge, Histogram, Scope};
use crate::upstream::host::HostRef;

/// Load-balancer selection policy. A small closed set, so a tagged enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    LeastRequest,
    Random,
    RingHash,
}

/// Request priority; circuit-breaker limits are tracked per priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Default,
    High,
}

/// One bounded resource: a current count against a maximum.
#[derive(Debug)]
pub struct Resource {
    current: AtomicU64,
    max: u64,
}

impl Resource {
    pub fn new(max: u64) -> Resource {
        Resource {
            current: AtomicU64::new(0),
            max,
        }
    }

    pub fn can_create(&self) -> bool {
        self.current.load(Ordering::Relaxed) < self.max
    }

    pub fn inc(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let prev = self.current.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    pub fn count(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

/// Circuit-breaker limits for one priority.
#[derive(Debug)]
pub struct ResourceManager {
    pub connections: Resource,
    pub pending_requests: Resource,
    pub requests: Resource,
    pub retries: Resource,
}

/// Circuit-breaker configuration, per priority.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct CircuitBreakerLimits {
    pub max_connections: u64,
    pub max_pending_requests: u64,
    pub max_requests: u64,
    pub max_retries: u64,
}

impl Default for CircuitBreakerLimits {
    fn default() -> Self {
        CircuitBreakerLimits {
            max_connections: 1024,
            max_pending_requests: 1024,
            max_requests: 1024,
            max_retries: 3,
        }
    }
}

impl CircuitBreakerLimits {
    fn build(&self) -> ResourceManager {
        ResourceManager {
            connections: Resource::new(self.max_connections),
            pending_requests: Resource::new(self.max_pending_requests),
            requests: Resource::new(self.max_requests),
            retries: Resource::new(self.max_retries),
        }
    }
}

/// Pre-resolved cluster counters the hot paths touch.
pub struct ClusterStats {
    pub upstream_cx_total: Counter,
    pub upstream_cx_active: Gauge,
    pub upstream_cx_connect_fail: Counter,
    pub upstream_cx_connect_timeout: Counter,
    pub upstream_cx_overflow: Counter,
    pub upstream_cx_close_header: Counter,
    pub upstream_cx_max_requests: Counter,
    pub upstream_cx_destroy_with_active_rq: Counter,
    pub upstream_cx_connect_ms: Histogram,
    pub upstream_rq_total: Counter,
    pub upstream_rq_active: Gauge,
    pub upstream_rq_pending_total: Counter,
    pub upstream_rq_pending_active: Gauge,
    pub upstream_rq_pending_overflow: Counter,
    pub upstream_rq_pending_failure_eject: Counter,
    pub upstream_rq_cancelled: Counter,
    pub upstream_rq_timeout: Counter,
    pub upstream_rq_per_try_timeout: Counter,
    pub upstream_rq_retry: Counter,
    pub upstream_rq_retry_success: Counter,
    pub upstream_rq_retry_overflow: Counter,
    pub upstream_rq_maintenance_mode: Counter,
    pub upstream_rq_time: Histogram,
    pub lb_healthy_panic: Counter,
    pub lb_recalculate_zone_structures: Counter,
    pub lb_zone_cluster_too_small: Counter,
    pub lb_zone_number_differs: Counter,
    pub lb_zone_routing_all_directly: Counter,
    pub lb_zone_routing_sampled: Counter,
    pub lb_zone_routing_cross_zone: Counter,
    pub lb_zone_no_capacity_left: Counter,
    pub lb_local_cluster_not_ok: Counter,
    pub membership_change: Counter,
    pub membership_healthy: Gauge,
}

impl ClusterStats {
    pub(crate) fn new(scope: &Scope) -> ClusterStats {
        ClusterStats {
            upstream_cx_total: scope.counter("upstream_cx_total"),
            upstream_cx_active: scope.gauge("upstream_cx_active"),
            upstream_cx_connect_fail: scope.counter("upstream_cx_connect_fail"),
            upstream_cx_connect_timeout: scope.counter("upstream_cx_connect_timeout"),
            upstream_cx_overflow: scope.counter("upstream_cx_overflow"),
            upstream_cx_close_header: scope.counter("upstream_cx_close_header"),
            upstream_cx_max_requests: scope.counter("upstream_cx_max_requests"),
            upstream_cx_destroy_with_active_rq: scope
                .counter("upstream_cx_destroy_with_active_rq"),
            upstream_cx_connect_ms: scope.histogram("upstream_cx_connect_ms"),
            upstream_rq_total: scope.counter("upstream_rq_total"),
            upstream_rq_active: scope.gauge("upstream_rq_active"),
            upstream_rq_pending_total: scope.counter("upstream_rq_pending_total"),
            upstream_rq_pending_active: scope.gauge("upstream_rq_pending_active"),
            upstream_rq_pending_overflow: scope.counter("upstream_rq_pending_overflow"),
            upstream_rq_pending_failure_eject: scope.counter("upstream_rq_pending_failure_eject"),
            upstream_rq_cancelled: scope.counter("upstream_rq_cancelled"),
            upstream_rq_timeout: scope.counter("upstream_rq_timeout"),
            upstream_rq_per_try_timeout: scope.counter("upstream_rq_per_try_timeout"),
            upstream_rq_retry: scope.counter("upstream_rq_retry"),
            upstream_rq_retry_success: scope.counter("upstream_rq_retry_success"),
            upstream_rq_retry_overflow: scope.counter("upstream_rq_retry_overflow"),
            upstream_rq_maintenance_mode: scope.counter("upstream_rq_maintenance_mode"),
            upstream_rq_time: scope.histogram("upstream_rq_time"),
            lb_healthy_panic: scope.counter("lb_healthy_panic"),
            lb_recalculate_zone_structures: scope.counter("lb_recalculate_zone_structures"),
            lb_zone_cluster_too_small: scope.counter("lb_zone_cluster_too_small"),
            lb_zone_number_differs: scope.counter("lb_zone_number_differs"),
            lb_zone_routing_all_directly: scope.counter("lb_zone_routing_all_directly"),
            lb_zone_routing_sampled: scope.counter("lb_zone_routing_sampled"),
            lb_zone_routing_cross_zone: scope.counter("lb_zone_routing_cross_zone"),
            lb_zone_no_capacity_left: scope.counter("lb_zone_no_capacity_left"),
            lb_local_cluster_not_ok: scope.counter("lb_local_cluster_not_ok"),
            membership_change: scope.counter("membership_change"),
            membership_healthy: scope.gauge("membership_healthy"),
        }
    }
}

/// Stable cluster identity plus limits. Shared across workers.
pub struct ClusterInfo {
    name: String,
    pub connect_timeout: Duration,
    pub lb_policy: LbPolicy,
    /// 0 means unlimited.
    pub max_requests_per_connection: u64,
    /// Drives `:scheme` on egress; TLS termination itself is external.
    pub tls: bool,
    pub stats: ClusterStats,
    scope: Scope,
    resources: [ResourceManager; 2],
}

impl ClusterInfo {
    pub fn new(
        name: impl Into<String>,
        connect_timeout: Duration,
        lb_policy: LbPolicy,
        max_requests_per_connection: u64,
        tls: bool,
        limits: &HashMap<Priority, CircuitBreakerLimits>,
        store_scope: &Scope,
    ) -> Arc<ClusterInfo> {
        let name = name.into();
        let scope = store_scope.scope(&format!("cluster.{name}"));
        let default_limits = CircuitBreakerLimits::default();
        let resources = [
            limits.get(&Priority::Default).unwrap_or(&default_limits).build(),
            limits.get(&Priority::High).unwrap_or(&default_limits).build(),
        ];
        Arc::new(ClusterInfo {
            stats: ClusterStats::new(&scope),
            scope,
            name,
            connect_timeout,
            lb_policy,
            max_requests_per_connection,
            tls,
            resources,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cluster's stats scope, for code- and zone-suffixed counters.
    pub fn stats_scope(&self) -> &Scope {
        &self.scope
    }

    pub fn resources(&self, priority: Priority) -> &ResourceManager {
        &self.resources[priority as usize]
    }

    /// Maintenance mode is a runtime kill switch per cluster.
    pub fn maintenance_mode(&self, runtime: &Snapshot, rng: &mut SmallRng) -> bool {
        runtime.feature_enabled(
            &format!("upstream.maintenance_mode.{}", self.name),
            0,
            rng,
        )
    }
}

impl std::fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("name", &self.name)
            .field("lb_policy", &self.lb_policy)
            .finish()
    }
}

/// Hosts added and removed by a membership change.
#[derive(Debug, Default)]
pub struct MemberUpdate {
    pub added: Vec<HostRef>,
    pub removed: Vec<HostRef>,
}

impl MemberUpdate {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Immutable snapshot of a cluster's hosts with health and zone partitions.
///
/// Zone index 0 is the local zone; remaining zones are ordered by name.
/// Zone names must match between the local and upstream clusters for
/// zone-aware routing; there is no aliasing.
#[derive(Debug, Clone, Default)]
pub struct HostSet {
    pub hosts: Vec<HostRef>,
    pub healthy: Vec<HostRef>,
    pub hosts_per_zone: Vec<Vec<HostRef>>,
    pub healthy_per_zone: Vec<Vec<HostRef>>,
    pub version: u64,
}

impl HostSet {
    /// Build a snapshot from the current host list and health flags.
    pub fn build(hosts: Vec<HostRef>, local_zone: &str, version: u64) -> HostSet {
        let healthy: Vec<HostRef> = hosts.iter().filter(|h| h.healthy()).cloned().collect();

        let mut zones: Vec<&str> = hosts
            .iter()
            .map(|h| h.zone())
            .filter(|z| !z.is_empty() && *z != local_zone)
            .collect();
        zones.sort_unstable();
        zones.dedup();

        let mut zone_names: Vec<String> = Vec::with_capacity(zones.len() + 1);
        zone_names.push(local_zone.to_string());
        zone_names.extend(zones.iter().map(|z| z.to_string()));

        let partition = |set: &[HostRef]| -> Vec<Vec<HostRef>> {
            zone_names
                .iter()
                .map(|zone| {
                    set.iter()
                        .filter(|h| h.zone() == zone)
                        .cloned()
                        .collect()
                })
                .collect()
        };

        HostSet {
            hosts_per_zone: partition(&hosts),
            healthy_per_zone: partition(&healthy),
            hosts,
            healthy,
            version,
        }
    }

    /// Compute the membership diff from `self` to `next` by address.
    pub fn diff(&self, next: &HostSet) -> MemberUpdate {
        let mut update = MemberUpdate::default();
        for host in &next.hosts {
            if !self.hosts.iter().any(|h| h.address() == host.address()) {
                update.added.push(host.clone());
            }
        }
        for host in &self.hosts {
            if !next.hosts.iter().any(|h| h.address() == host.address()) {
                update.removed.push(host.clone());
            }
        }
        update
    }
}
