//! Host selection: round-robin, least-request, random, ring hash.
//!
//! All policies except ring hash share the zone-aware host filtering
//! layer: panic mode when too few hosts are healthy, direct local-zone
//! routing when the upstream cluster over-provisions the local zone, and
//! residual-capacity sampling when it under-provisions it.

use rand::rngs::SmallRng;
use rand::Rng;

use crate::runtime::Snapshot;
use crate::upstream::cluster::{ClusterStats, HostSet, LbPolicy};
use crate::upstream::host::HostRef;
use crate::upstream::ring::Ring;

const RUNTIME_ZONE_ENABLED: &str = "upstream.zone_routing.enabled";
const RUNTIME_MIN_CLUSTER_SIZE: &str = "upstream.zone_routing.min_cluster_size";
const RUNTIME_PANIC_THRESHOLD: &str = "upstream.healthy_panic_threshold";
const RUNTIME_RING_SIZE: &str = "upstream.ring_hash.min_ring_size";
const RUNTIME_WEIGHT_ENABLED: &str = "upstream.weight_enabled";

/// Per-request balancer input.
#[derive(Debug, Clone, Copy, Default)]
pub struct LbContext {
    /// Hash from the route's hash policy, when one applied.
    pub hash: Option<u64>,
}

/// A cluster's balancer. One per (worker, cluster); selection state is
/// never shared across workers.
pub struct Balancer {
    policy: LbPolicy,
    zone: ZoneState,
    rr_index: usize,
    last_host: Option<HostRef>,
    hits_left: u32,
    max_host_weight: u32,
    all_ring: Ring,
    healthy_ring: Ring,
    seen_versions: (u64, u64),
    initialized: bool,
}

impl Balancer {
    pub fn new(policy: LbPolicy) -> Balancer {
        Balancer {
            policy,
            zone: ZoneState::default(),
            rr_index: 0,
            last_host: None,
            hits_left: 0,
            max_host_weight: 1,
            all_ring: Ring::default(),
            healthy_ring: Ring::default(),
            seen_versions: (0, 0),
            initialized: false,
        }
    }

    /// Pick a host, or None when the cluster has no usable hosts.
    pub fn choose_host(
        &mut self,
        host_set: &HostSet,
        local_host_set: Option<&HostSet>,
        stats: &ClusterStats,
        runtime: &Snapshot,
        ctx: &LbContext,
        rng: &mut SmallRng,
    ) -> Option<HostRef> {
        self.refresh(host_set, local_host_set, stats, runtime);
        match self.policy {
            LbPolicy::RoundRobin => {
                let hosts = hosts_to_use(
                    &mut self.zone,
                    host_set,
                    local_host_set,
                    stats,
                    runtime,
                    rng,
                );
                if hosts.is_empty() {
                    return None;
                }
                let host = hosts[self.rr_index % hosts.len()].clone();
                self.rr_index = self.rr_index.wrapping_add(1);
                Some(host)
            }
            LbPolicy::Random => {
                let hosts = hosts_to_use(
                    &mut self.zone,
                    host_set,
                    local_host_set,
                    stats,
                    runtime,
                    rng,
                );
                if hosts.is_empty() {
                    return None;
                }
                Some(hosts[rng.gen_range(0..hosts.len())].clone())
            }
            LbPolicy::LeastRequest => self.choose_least_request(
                host_set,
                local_host_set,
                stats,
                runtime,
                rng,
            ),
            LbPolicy::RingHash => {
                let ring = if is_global_panic(host_set, stats, runtime) {
                    &self.all_ring
                } else {
                    &self.healthy_ring
                };
                // No request hash degrades to random placement on the ring.
                let hash = ctx.hash.unwrap_or_else(|| rng.gen());
                ring.choose(hash)
            }
        }
    }

    fn choose_least_request(
        &mut self,
        host_set: &HostSet,
        local_host_set: Option<&HostSet>,
        stats: &ClusterStats,
        runtime: &Snapshot,
        rng: &mut SmallRng,
    ) -> Option<HostRef> {
        let weight_imbalanced = self.max_host_weight != 1;
        let weight_enabled = runtime.get_integer(RUNTIME_WEIGHT_ENABLED, 1) != 0;

        if weight_imbalanced && weight_enabled && self.hits_left > 0 {
            self.hits_left -= 1;
            return self.last_host.clone();
        }
        self.hits_left = 0;
        self.last_host = None;

        let hosts = hosts_to_use(
            &mut self.zone,
            host_set,
            local_host_set,
            stats,
            runtime,
            rng,
        );
        if hosts.is_empty() {
            return None;
        }

        if weight_imbalanced && weight_enabled {
            let host = hosts[rng.gen_range(0..hosts.len())].clone();
            self.hits_left = host.weight() - 1;
            self.last_host = Some(host.clone());
            return Some(host);
        }

        // Power of two choices over distinct hosts.
        if hosts.len() == 1 {
            return Some(hosts[0].clone());
        }
        let i1 = rng.gen_range(0..hosts.len());
        let mut i2 = rng.gen_range(0..hosts.len() - 1);
        if i2 >= i1 {
            i2 += 1;
        }
        let (h1, h2) = (&hosts[i1], &hosts[i2]);
        if h1.stats.rq_active() < h2.stats.rq_active() {
            Some(h1.clone())
        } else {
            Some(h2.clone())
        }
    }

    /// Rebuild per-membership state when the snapshot versions move.
    fn refresh(
        &mut self,
        host_set: &HostSet,
        local_host_set: Option<&HostSet>,
        stats: &ClusterStats,
        runtime: &Snapshot,
    ) {
        let versions = (
            host_set.version,
            local_host_set.map(|s| s.version).unwrap_or(0),
        );
        if self.initialized && versions == self.seen_versions {
            return;
        }
        self.initialized = true;
        self.seen_versions = versions;

        self.zone.regenerate(host_set, local_host_set, stats, runtime);
        self.max_host_weight = host_set
            .hosts
            .iter()
            .map(|h| h.weight())
            .max()
            .unwrap_or(1);
        if let Some(last) = &self.last_host {
            if !host_set.hosts.iter().any(|h| h.address() == last.address()) {
                self.last_host = None;
                self.hits_left = 0;
            }
        }
        if self.policy == LbPolicy::RingHash {
            let min_ring_size = runtime.get_integer(RUNTIME_RING_SIZE, 1024);
            self.all_ring = Ring::build(&host_set.hosts, min_ring_size);
            self.healthy_ring = Ring::build(&host_set.healthy, min_ring_size);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ZoneRouting {
    #[default]
    NoZoneRouting,
    Direct,
    Residual,
}

#[derive(Debug, Default)]
struct ZoneState {
    routing: ZoneRouting,
    local_percent_to_route: u64,
    residual_capacity: Vec<u64>,
}

impl ZoneState {
    fn regenerate(
        &mut self,
        host_set: &HostSet,
        local_host_set: Option<&HostSet>,
        stats: &ClusterStats,
        runtime: &Snapshot,
    ) {
        stats.lb_recalculate_zone_structures.increment();
        let Some(local) = local_host_set else {
            self.routing = ZoneRouting::NoZoneRouting;
            return;
        };
        if self.early_exit(host_set, local, stats, runtime) {
            self.routing = ZoneRouting::NoZoneRouting;
            return;
        }

        let num_zones = host_set.healthy_per_zone.len();
        let local_percentage = zone_percentages(&local.healthy_per_zone);
        let upstream_percentage = zone_percentages(&host_set.healthy_per_zone);

        // The upstream cluster over-provisions the local zone: everything
        // can stay local.
        if upstream_percentage[0] >= local_percentage[0] {
            self.routing = ZoneRouting::Direct;
            return;
        }

        self.routing = ZoneRouting::Residual;
        self.local_percent_to_route = upstream_percentage[0] * 10000 / local_percentage[0];

        // Cross-zone traffic is sampled proportionally to each zone's
        // residual capacity, accumulated so a sampled value can be located
        // with a forward scan.
        self.residual_capacity = vec![0; num_zones];
        for i in 1..num_zones {
            self.residual_capacity[i] = self.residual_capacity[i - 1]
                + upstream_percentage[i].saturating_sub(local_percentage[i]);
        }
    }

    fn early_exit(
        &self,
        host_set: &HostSet,
        local: &HostSet,
        stats: &ClusterStats,
        runtime: &Snapshot,
    ) -> bool {
        if host_set.healthy_per_zone.len() < 2 {
            return true;
        }
        if host_set.healthy_per_zone[0].is_empty() {
            return true;
        }
        if host_set.healthy_per_zone.len() != local.healthy_per_zone.len() {
            stats.lb_zone_number_differs.increment();
            return true;
        }
        let min_cluster_size = runtime.get_integer(RUNTIME_MIN_CLUSTER_SIZE, 6);
        if (host_set.healthy.len() as u64) < min_cluster_size {
            stats.lb_zone_cluster_too_small.increment();
            return true;
        }
        false
    }

    fn local_zone_hosts<'a>(
        &self,
        host_set: &'a HostSet,
        stats: &ClusterStats,
        rng: &mut SmallRng,
    ) -> &'a [HostRef] {
        let num_zones = host_set.healthy_per_zone.len();
        if self.routing == ZoneRouting::Direct {
            stats.lb_zone_routing_all_directly.increment();
            return &host_set.healthy_per_zone[0];
        }

        if rng.gen_range(0..10000u64) < self.local_percent_to_route {
            stats.lb_zone_routing_sampled.increment();
            return &host_set.healthy_per_zone[0];
        }

        stats.lb_zone_routing_cross_zone.increment();

        // Rounding can leave no residual capacity anywhere; fall back to a
        // random zone.
        let total = self.residual_capacity[num_zones - 1];
        if total == 0 {
            stats.lb_zone_no_capacity_left.increment();
            return &host_set.healthy_per_zone[rng.gen_range(0..num_zones)];
        }

        let threshold = rng.gen_range(0..total);
        let mut i = 0;
        while threshold > self.residual_capacity[i] {
            i += 1;
        }
        &host_set.healthy_per_zone[i]
    }
}

/// Per-zone share of hosts, in units of 1/10000.
fn zone_percentages(hosts_per_zone: &[Vec<HostRef>]) -> Vec<u64> {
    let total: u64 = hosts_per_zone.iter().map(|z| z.len() as u64).sum();
    hosts_per_zone
        .iter()
        .map(|z| {
            if total == 0 {
                0
            } else {
                10000 * z.len() as u64 / total
            }
        })
        .collect()
}

/// Whether too few hosts are healthy to trust health checking at all.
pub fn is_global_panic(host_set: &HostSet, stats: &ClusterStats, runtime: &Snapshot) -> bool {
    if host_set.hosts.is_empty() {
        return false;
    }
    let threshold = runtime.get_integer(RUNTIME_PANIC_THRESHOLD, 50).min(100);
    let healthy_percent = 100.0 * host_set.healthy.len() as f64 / host_set.hosts.len() as f64;
    if healthy_percent < threshold as f64 {
        stats.lb_healthy_panic.increment();
        return true;
    }
    false
}

fn hosts_to_use<'a>(
    zone: &mut ZoneState,
    host_set: &'a HostSet,
    local_host_set: Option<&'a HostSet>,
    stats: &ClusterStats,
    runtime: &Snapshot,
    rng: &mut SmallRng,
) -> &'a [HostRef] {
    if host_set.hosts.is_empty() || is_global_panic(host_set, stats, runtime) {
        return &host_set.hosts;
    }
    if zone.routing == ZoneRouting::NoZoneRouting {
        return &host_set.healthy;
    }
    if !runtime.feature_enabled(RUNTIME_ZONE_ENABLED, 100, rng) {
        return &host_set.healthy;
    }
    let local = local_host_set.expect("zone routing requires a local host set");
    if local.hosts.is_empty() || is_global_panic(local, stats, runtime) {
        stats.lb_local_cluster_not_ok.increment();
        return &host_set.healthy;
    }
    zone.local_zone_hosts(host_set, stats, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Store;
    use crate::upstream::host::{HealthFlag, Host, StatCounter};
    use rand::SeedableRng;

    fn stats() -> ClusterStats {
        ClusterStats::new(&Store::new().scope("lb_test"))
    }

    fn hosts_in_zones(zones: &[(&str, usize)]) -> Vec<HostRef> {
        let mut out = Vec::new();
        let mut octet = 1;
        for (zone, count) in zones {
            for _ in 0..*count {
                out.push(Host::new(
                    format!("10.1.0.{octet}:80").parse().unwrap(),
                    "",
                    *zone,
                    false,
                    1,
                ));
                octet += 1;
            }
        }
        out
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn round_robin_visits_each_healthy_host_per_period() {
        let hosts = hosts_in_zones(&[("z", 4)]);
        let set = HostSet::build(hosts, "z", 1);
        let stats = stats();
        let runtime = Snapshot::default();
        let mut lb = Balancer::new(LbPolicy::RoundRobin);
        let mut rng = rng();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..set.healthy.len() {
            let host = lb
                .choose_host(&set, None, &stats, &runtime, &LbContext::default(), &mut rng)
                .unwrap();
            seen.insert(host.address());
        }
        assert_eq!(seen.len(), set.healthy.len());
    }

    #[test]
    fn panic_mode_uses_all_hosts() {
        let hosts = hosts_in_zones(&[("z", 4)]);
        // 1 of 4 healthy: 25% < 50% threshold.
        for host in hosts.iter().take(3) {
            host.health_flag_set(HealthFlag::FailedOutlierCheck);
        }
        let set = HostSet::build(hosts, "z", 1);
        let stats = stats();
        let runtime = Snapshot::default();
        let mut lb = Balancer::new(LbPolicy::RoundRobin);
        let mut rng = rng();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..set.hosts.len() {
            let host = lb
                .choose_host(&set, None, &stats, &runtime, &LbContext::default(), &mut rng)
                .unwrap();
            seen.insert(host.address());
        }
        // Unhealthy hosts are selectable again.
        assert_eq!(seen.len(), set.hosts.len());
    }

    #[test]
    fn no_hosts_selects_none() {
        let set = HostSet::build(Vec::new(), "z", 1);
        let stats = stats();
        let runtime = Snapshot::default();
        let mut rng = rng();
        for policy in [
            LbPolicy::RoundRobin,
            LbPolicy::LeastRequest,
            LbPolicy::Random,
            LbPolicy::RingHash,
        ] {
            let mut lb = Balancer::new(policy);
            assert!(lb
                .choose_host(&set, None, &stats, &runtime, &LbContext::default(), &mut rng)
                .is_none());
        }
    }

    #[test]
    fn least_request_prefers_less_loaded() {
        let hosts = hosts_in_zones(&[("z", 2)]);
        hosts[0].stats.rq_active.inc();
        hosts[0].stats.rq_active.inc();
        let set = HostSet::build(hosts, "z", 1);
        let stats = stats();
        let runtime = Snapshot::default();
        let mut lb = Balancer::new(LbPolicy::LeastRequest);
        let mut rng = rng();

        for _ in 0..20 {
            let host = lb
                .choose_host(&set, None, &stats, &runtime, &LbContext::default(), &mut rng)
                .unwrap();
            assert_eq!(host.address(), set.hosts[1].address());
        }
    }

    #[test]
    fn weighted_least_request_sticks_for_weight_minus_one() {
        let heavy = Host::new("10.1.0.1:80".parse().unwrap(), "", "z", false, 3);
        let light = Host::new("10.1.0.2:80".parse().unwrap(), "", "z", false, 1);
        let set = HostSet::build(vec![heavy, light], "z", 1);
        let stats = stats();
        let runtime = Snapshot::default();
        let mut lb = Balancer::new(LbPolicy::LeastRequest);
        let mut rng = rng();

        let first = lb
            .choose_host(&set, None, &stats, &runtime, &LbContext::default(), &mut rng)
            .unwrap();
        if first.weight() == 3 {
            for _ in 0..2 {
                let again = lb
                    .choose_host(&set, None, &stats, &runtime, &LbContext::default(), &mut rng)
                    .unwrap();
                assert_eq!(again.address(), first.address());
            }
        }
    }

    #[test]
    fn ring_hash_stable_for_same_key() {
        let hosts = hosts_in_zones(&[("z", 5)]);
        let set = HostSet::build(hosts, "z", 1);
        let stats = stats();
        let runtime = Snapshot::default();
        let mut lb = Balancer::new(LbPolicy::RingHash);
        let mut rng = rng();
        let ctx = LbContext {
            hash: Some(crate::upstream::ring::hash_key(b"k")),
        };
        let a = lb
            .choose_host(&set, None, &stats, &runtime, &ctx, &mut rng)
            .unwrap();
        let b = lb
            .choose_host(&set, None, &stats, &runtime, &ctx, &mut rng)
            .unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn zone_direct_routing_stays_local() {
        // Upstream local-zone share (50%) is at least the local cluster's
        // share (50%), so every request routes to the local zone.
        let upstream = HostSet::build(
            hosts_in_zones(&[("local", 3), ("remote", 3)]),
            "local",
            1,
        );
        let local = HostSet::build(
            hosts_in_zones(&[("local", 2), ("remote", 2)]),
            "local",
            1,
        );
        let stats = stats();
        let runtime = Snapshot::default();
        let mut lb = Balancer::new(LbPolicy::RoundRobin);
        let mut rng = rng();

        for _ in 0..20 {
            let host = lb
                .choose_host(
                    &upstream,
                    Some(&local),
                    &stats,
                    &runtime,
                    &LbContext::default(),
                    &mut rng,
                )
                .unwrap();
            assert_eq!(host.zone(), "local");
        }
        assert!(stats.lb_zone_routing_all_directly.value() >= 20);
    }

    #[test]
    fn zone_residual_routing_splits_traffic() {
        // Local cluster: 2/3 of hosts in the local zone. Upstream: 1/3.
        // Only half the traffic can stay local.
        let upstream = HostSet::build(
            hosts_in_zones(&[("local", 2), ("remote", 4)]),
            "local",
            1,
        );
        let local = HostSet::build(
            hosts_in_zones(&[("local", 4), ("remote", 2)]),
            "local",
            1,
        );
        let stats = stats();
        let runtime = Snapshot::default();
        let mut lb = Balancer::new(LbPolicy::RoundRobin);
        let mut rng = rng();

        let mut local_picks = 0;
        let mut remote_picks = 0;
        for _ in 0..2000 {
            let host = lb
                .choose_host(
                    &upstream,
                    Some(&local),
                    &stats,
                    &runtime,
                    &LbContext::default(),
                    &mut rng,
                )
                .unwrap();
            if host.zone() == "local" {
                local_picks += 1;
            } else {
                remote_picks += 1;
            }
        }
        // Expect roughly 50/50 with generous slack.
        assert!(local_picks > 700, "local_picks={local_picks}");
        assert!(remote_picks > 700, "remote_picks={remote_picks}");
    }

    #[test]
    fn zone_routing_skipped_for_small_clusters() {
        let upstream = HostSet::build(
            hosts_in_zones(&[("local", 1), ("remote", 1)]),
            "local",
            1,
        );
        let local = HostSet::build(
            hosts_in_zones(&[("local", 1), ("remote", 1)]),
            "local",
            1,
        );
        let stats = stats();
        let runtime = Snapshot::default();
        let mut lb = Balancer::new(LbPolicy::RoundRobin);
        let mut rng = rng();
        // 2 healthy < default min_cluster_size 6: all healthy hosts used.
        let mut zones = std::collections::HashSet::new();
        for _ in 0..10 {
            let host = lb
                .choose_host(
                    &upstream,
                    Some(&local),
                    &stats,
                    &runtime,
                    &LbContext::default(),
                    &mut rng,
                )
                .unwrap();
            zones.insert(host.zone().to_string());
        }
        assert_eq!(zones.len(), 2);
        assert!(stats.lb_zone_cluster_too_small.value() > 0);
    }
}
