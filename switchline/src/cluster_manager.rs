//! Authoritative cluster state.
//!
//! The cluster manager lives on the main thread. It owns every cluster's
//! host list, runs the outlier detectors on their interval timers, applies
//! health-flag changes, and publishes immutable snapshots to the workers.
//! Workers never mutate membership; they send [`ControlMsg`]s back here
//! (consecutive-5xx threshold crossings) and swap in whole snapshots.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::access_log::Sink;
use crate::config::ClusterConfig;
use crate::event::TimerQueue;
use crate::runtime::Snapshot;
use crate::stats::Scope;
use crate::upstream::{
    ClusterInfo, Detector, Host, HostRef, HostSet, OutlierEvent,
};

/// One cluster as a worker sees it: shared info plus an immutable host
/// snapshot. The consecutive-5xx threshold is resolved at publish time so
/// workers do not consult the detector.
#[derive(Clone)]
pub struct ClusterSnapshot {
    pub info: Arc<ClusterInfo>,
    pub hosts: Arc<HostSet>,
    pub consecutive_5xx_threshold: u32,
}

/// The full per-worker view, swapped wholesale on each publish.
#[derive(Clone, Default)]
pub struct SnapshotMap {
    clusters: HashMap<String, ClusterSnapshot>,
    pub local_cluster: Option<String>,
}

impl SnapshotMap {
    pub fn get(&self, name: &str) -> Option<&ClusterSnapshot> {
        self.clusters.get(name)
    }

    pub fn local_hosts(&self) -> Option<Arc<HostSet>> {
        let name = self.local_cluster.as_ref()?;
        self.clusters.get(name).map(|c| c.hosts.clone())
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.clusters.keys()
    }
}

/// Messages workers send to the manager.
#[derive(Debug)]
pub enum ControlMsg {
    /// A host crossed the consecutive-5xx threshold on some worker.
    Consecutive5xx { cluster: String, address: SocketAddr },
    /// Stop the manager loop (tests and shutdown).
    Shutdown,
}

struct ManagedCluster {
    info: Arc<ClusterInfo>,
    hosts: Vec<HostRef>,
    host_set: Arc<HostSet>,
    detector: Option<Detector>,
    version: u64,
}

/// A subscriber worker: a channel plus a waker to interrupt its poll.
pub struct Subscriber {
    pub tx: Sender<Arc<SnapshotMap>>,
    pub waker: Arc<mio::Waker>,
}

pub struct ClusterManager {
    clusters: HashMap<String, ManagedCluster>,
    local_cluster: Option<String>,
    local_zone: String,
    runtime: Snapshot,
    rng: SmallRng,
    subscribers: Vec<Subscriber>,
    event_log: Sink,
}

impl ClusterManager {
    pub fn new(
        configs: &[ClusterConfig],
        local_cluster: Option<String>,
        local_zone: String,
        runtime: Snapshot,
        store_scope: &Scope,
        event_log: Sink,
    ) -> ClusterManager {
        let mut clusters = HashMap::new();
        for config in configs {
            let info = ClusterInfo::new(
                config.name.clone(),
                Duration::from_millis(config.connect_timeout_ms),
                config.lb_type,
                config.max_requests_per_connection,
                config.tls,
                &config.circuit_breakers,
                store_scope,
            );
            let hosts: Vec<HostRef> = config
                .hosts
                .iter()
                .map(|h| {
                    Host::new(
                        h.address,
                        h.hostname.clone().unwrap_or_default(),
                        h.zone.clone(),
                        h.canary,
                        h.weight,
                    )
                })
                .collect();
            let host_set = Arc::new(HostSet::build(hosts.clone(), &local_zone, 1));
            info.stats.membership_healthy.set(host_set.healthy.len() as i64);
            let detector = config
                .outlier_detection
                .as_ref()
                .map(|outlier| Detector::new(outlier.clone(), info.stats_scope()));
            clusters.insert(
                config.name.clone(),
                ManagedCluster {
                    info,
                    hosts,
                    host_set,
                    detector,
                    version: 1,
                },
            );
        }
        ClusterManager {
            clusters,
            local_cluster,
            local_zone,
            runtime,
            rng: SmallRng::from_entropy(),
            subscribers: Vec::new(),
            event_log,
        }
    }

    /// Register a worker; it receives the current snapshot immediately.
    pub fn subscribe(&mut self, subscriber: Subscriber) {
        let snapshot = self.snapshot();
        let _ = subscriber.tx.send(snapshot);
        let _ = subscriber.waker.wake();
        self.subscribers.push(subscriber);
    }

    pub fn snapshot(&self) -> Arc<SnapshotMap> {
        let clusters = self
            .clusters
            .iter()
            .map(|(name, managed)| {
                let threshold = managed
                    .detector
                    .as_ref()
                    .map(|d| d.consecutive_5xx_threshold(&self.runtime))
                    .unwrap_or(u32::MAX);
                (
                    name.clone(),
                    ClusterSnapshot {
                        info: managed.info.clone(),
                        hosts: managed.host_set.clone(),
                        consecutive_5xx_threshold: threshold,
                    },
                )
            })
            .collect();
        Arc::new(SnapshotMap {
            clusters,
            local_cluster: self.local_cluster.clone(),
        })
    }

    fn publish(&mut self) {
        let snapshot = self.snapshot();
        for subscriber in &self.subscribers {
            let _ = subscriber.tx.send(snapshot.clone());
            let _ = subscriber.waker.wake();
        }
    }

    /// Replace a cluster's host list (control-plane update). Rebuilds the
    /// snapshot and publishes when anything changed.
    pub fn update_hosts(&mut self, cluster: &str, hosts: Vec<HostRef>) {
        let local_zone = self.local_zone.clone();
        let Some(managed) = self.clusters.get_mut(cluster) else {
            return;
        };
        managed.version += 1;
        let next = Arc::new(HostSet::build(hosts.clone(), &local_zone, managed.version));
        let update = managed.host_set.diff(&next);
        managed.hosts = hosts;
        managed.host_set = next;
        if !update.is_empty() {
            managed.info.stats.membership_change.increment();
            tracing::debug!(
                cluster,
                added = update.added.len(),
                removed = update.removed.len(),
                "membership update"
            );
        }
        managed
            .info
            .stats
            .membership_healthy
            .set(managed.host_set.healthy.len() as i64);
        self.publish();
    }

    /// Recompute healthy sets after health-flag changes, then publish.
    fn refresh_health(&mut self, cluster: &str) {
        let local_zone = self.local_zone.clone();
        if let Some(managed) = self.clusters.get_mut(cluster) {
            managed.version += 1;
            managed.host_set = Arc::new(HostSet::build(
                managed.hosts.clone(),
                &local_zone,
                managed.version,
            ));
            managed
                .info
                .stats
                .membership_healthy
                .set(managed.host_set.healthy.len() as i64);
        }
        self.publish();
    }

    fn handle_consecutive_5xx(&mut self, cluster: &str, address: SocketAddr, now: Instant) {
        let Some(managed) = self.clusters.get(cluster) else {
            return;
        };
        let Some(detector) = &managed.detector else {
            return;
        };
        let Some(host) = managed
            .hosts
            .iter()
            .find(|h| h.address() == address)
            .cloned()
        else {
            return;
        };
        let event =
            detector.on_consecutive_5xx(&host, &managed.hosts, &self.runtime, &mut self.rng, now);
        if let Some(event) = event {
            let enforced = self.log_outlier_event(cluster, &event);
            if enforced {
                self.refresh_health(cluster);
            }
        }
    }

    fn run_detector_interval(&mut self, cluster: &str, now: Instant) {
        let Some(managed) = self.clusters.get(cluster) else {
            return;
        };
        let Some(detector) = &managed.detector else {
            return;
        };
        let events = detector.on_interval(&managed.hosts, &self.runtime, &mut self.rng, now);
        let mut changed = false;
        for event in &events {
            changed |= self.log_outlier_event(cluster, event);
        }
        if changed {
            self.refresh_health(cluster);
        }
    }

    /// Emit a structured ejection/unejection record. Returns whether the
    /// healthy set changed.
    fn log_outlier_event(&self, cluster: &str, event: &OutlierEvent) -> bool {
        let record = match event {
            OutlierEvent::Eject {
                host,
                kind,
                enforced,
                num_ejections,
                host_success_rate,
                cluster_average,
                cluster_threshold,
            } => serde_json::json!({
                "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "cluster": cluster,
                "upstream_url": host.address().to_string(),
                "action": "eject",
                "type": kind.as_str(),
                "num_ejections": num_ejections,
                "enforced": enforced,
                "host_success_rate": host_success_rate,
                "cluster_average_success_rate": cluster_average,
                "cluster_success_rate_ejection_threshold": cluster_threshold,
            }),
            OutlierEvent::Uneject {
                host,
                num_ejections,
            } => serde_json::json!({
                "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "cluster": cluster,
                "upstream_url": host.address().to_string(),
                "action": "uneject",
                "num_ejections": num_ejections,
            }),
        };
        self.event_log.log(record.to_string());
        match event {
            OutlierEvent::Eject { enforced, .. } => *enforced,
            OutlierEvent::Uneject { .. } => true,
        }
    }

    /// Main-thread loop: outlier interval timers plus worker control
    /// messages. Returns on [`ControlMsg::Shutdown`].
    pub fn run(&mut self, control: Receiver<ControlMsg>) {
        let mut timers: TimerQueue<String> = TimerQueue::new();
        let now = Instant::now();
        for (name, managed) in &self.clusters {
            if let Some(detector) = &managed.detector {
                timers.schedule(now, detector.interval(&self.runtime), name.clone());
            }
        }

        loop {
            let now = Instant::now();
            while let Some(cluster) = timers.pop_expired(now) {
                self.run_detector_interval(&cluster, now);
                let interval = self
                    .clusters
                    .get(&cluster)
                    .and_then(|m| m.detector.as_ref())
                    .map(|d| d.interval(&self.runtime))
                    .unwrap_or(Duration::from_secs(10));
                timers.schedule(now, interval, cluster);
            }

            let timeout = timers
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            match control.recv_timeout(timeout) {
                Ok(ControlMsg::Consecutive5xx { cluster, address }) => {
                    self.handle_consecutive_5xx(&cluster, address, Instant::now());
                }
                Ok(ControlMsg::Shutdown) => return,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}
