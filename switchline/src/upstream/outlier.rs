//! Outlier detection: consecutive-5xx and success-rate host ejection.
//!
//! Workers account every upstream response into the host's
//! [`OutlierState`] with atomics. Crossing the consecutive-5xx threshold
//! is reported to the cluster manager thread, which owns the
//! [`Detector`]: it enforces ejections, scans hosts on a periodic
//! interval timer for unejection and success-rate outliers, and emits
//! structured events for the event log.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;

use crate::runtime::Snapshot;
use crate::stats::{Counter, Gauge, Scope};
use crate::upstream::host::{HealthFlag, HostRef};

/// Why a host was ejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EjectionKind {
    Consecutive5xx,
    SuccessRate,
}

impl EjectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EjectionKind::Consecutive5xx => "5xx",
            EjectionKind::SuccessRate => "SuccessRate",
        }
    }
}

/// Structured ejection/unejection record for the event log.
#[derive(Debug)]
pub enum OutlierEvent {
    Eject {
        host: HostRef,
        kind: EjectionKind,
        enforced: bool,
        num_ejections: u32,
        host_success_rate: Option<f64>,
        cluster_average: Option<f64>,
        cluster_threshold: Option<f64>,
    },
    Uneject {
        host: HostRef,
        num_ejections: u32,
    },
}

/// Per-host accounting shared with workers.
///
/// The success-rate window is two swap buckets: workers write the active
/// bucket; the detector rotates buckets each interval and reads the
/// drained one, so the window length is exactly one detector interval.
#[derive(Debug, Default)]
pub struct OutlierState {
    consecutive_5xx: AtomicU32,
    buckets: [Bucket; 2],
    active_bucket: AtomicUsize,
    num_ejections: AtomicU32,
    last_ejection: Mutex<Option<Instant>>,
    last_unejection: Mutex<Option<Instant>>,
}

#[derive(Debug, Default)]
struct Bucket {
    success: AtomicU64,
    total: AtomicU64,
}

impl OutlierState {
    /// Account one upstream response. Returns true when this response made
    /// the consecutive-5xx counter reach `threshold` exactly; the caller
    /// then notifies the detector.
    pub fn put_response(&self, code: u16, threshold: u32) -> bool {
        let bucket = &self.buckets[self.active_bucket.load(Ordering::Relaxed)];
        bucket.total.fetch_add(1, Ordering::Relaxed);
        if (500..600).contains(&code) {
            self.consecutive_5xx.fetch_add(1, Ordering::Relaxed) + 1 == threshold
        } else {
            bucket.success.fetch_add(1, Ordering::Relaxed);
            self.consecutive_5xx.store(0, Ordering::Relaxed);
            false
        }
    }

    pub fn num_ejections(&self) -> u32 {
        self.num_ejections.load(Ordering::Relaxed)
    }

    pub fn last_ejection_time(&self) -> Option<Instant> {
        *self.last_ejection.lock().unwrap()
    }

    pub fn last_unejection_time(&self) -> Option<Instant> {
        *self.last_unejection.lock().unwrap()
    }

    fn eject(&self, now: Instant) {
        self.num_ejections.fetch_add(1, Ordering::Relaxed);
        *self.last_ejection.lock().unwrap() = Some(now);
    }

    fn uneject(&self, now: Instant) {
        *self.last_unejection.lock().unwrap() = Some(now);
    }

    /// Swap buckets and return the (success, total) counts of the window
    /// that just closed.
    fn rotate_bucket(&self) -> (u64, u64) {
        let active = self.active_bucket.load(Ordering::Relaxed);
        let inactive = 1 - active;
        self.buckets[inactive].success.store(0, Ordering::Relaxed);
        self.buckets[inactive].total.store(0, Ordering::Relaxed);
        self.active_bucket.store(inactive, Ordering::Relaxed);
        (
            self.buckets[active].success.load(Ordering::Relaxed),
            self.buckets[active].total.load(Ordering::Relaxed),
        )
    }
}

/// Detector tunables. Runtime keys under `outlier_detection.` override
/// each of these at evaluation time.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    /// Interval between detector sweeps; also the success-rate window.
    pub interval_ms: u64,
    pub base_ejection_time_ms: u64,
    pub consecutive_5xx: u32,
    pub max_ejection_percent: u64,
    pub success_rate_minimum_hosts: u64,
    pub success_rate_request_volume: u64,
    pub enforcing_consecutive_5xx: u64,
    pub enforcing_success_rate: u64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        OutlierConfig {
            interval_ms: 10_000,
            base_ejection_time_ms: 30_000,
            consecutive_5xx: 5,
            max_ejection_percent: 10,
            success_rate_minimum_hosts: 5,
            success_rate_request_volume: 100,
            enforcing_consecutive_5xx: 100,
            enforcing_success_rate: 100,
        }
    }
}

// Success rates skew negative (mass near 100 with a left tail), so the
// factor is tighter than the canonical 2.0 for normal distributions.
const SUCCESS_RATE_STDEV_FACTOR: f64 = 1.9;

struct DetectorStats {
    ejections_total: Counter,
    ejections_active: Gauge,
    ejections_overflow: Counter,
    ejections_consecutive_5xx: Counter,
    ejections_success_rate: Counter,
}

/// Cluster-scoped detector. Lives on the cluster manager thread.
pub struct Detector {
    config: OutlierConfig,
    stats: DetectorStats,
}

impl Detector {
    pub fn new(config: OutlierConfig, cluster_scope: &Scope) -> Detector {
        let scope = cluster_scope.scope("outlier_detection");
        Detector {
            config,
            stats: DetectorStats {
                ejections_total: scope.counter("ejections_total"),
                ejections_active: scope.gauge("ejections_active"),
                ejections_overflow: scope.counter("ejections_overflow"),
                ejections_consecutive_5xx: scope.counter("ejections_consecutive_5xx"),
                ejections_success_rate: scope.counter("ejections_success_rate"),
            },
        }
    }

    /// The consecutive-5xx threshold workers test against.
    pub fn consecutive_5xx_threshold(&self, runtime: &Snapshot) -> u32 {
        runtime.get_integer(
            "outlier_detection.consecutive_5xx",
            self.config.consecutive_5xx as u64,
        ) as u32
    }

    /// Interval until the next sweep.
    pub fn interval(&self, runtime: &Snapshot) -> Duration {
        Duration::from_millis(
            runtime.get_integer("outlier_detection.interval_ms", self.config.interval_ms),
        )
    }

    /// A worker observed the consecutive-5xx threshold being crossed. The
    /// host may already have been ejected or removed; both are ignored.
    pub fn on_consecutive_5xx(
        &self,
        host: &HostRef,
        hosts: &[HostRef],
        runtime: &Snapshot,
        rng: &mut SmallRng,
        now: Instant,
    ) -> Option<OutlierEvent> {
        if !hosts.iter().any(|h| h.address() == host.address()) {
            return None;
        }
        if host.health_flag_get(HealthFlag::FailedOutlierCheck) {
            return None;
        }
        self.stats.ejections_consecutive_5xx.increment();
        self.eject(host, hosts, EjectionKind::Consecutive5xx, None, None, None, runtime, rng, now)
    }

    /// Periodic sweep: uneject hosts whose penalty elapsed, rotate
    /// success-rate windows, and eject statistical outliers.
    pub fn on_interval(
        &self,
        hosts: &[HostRef],
        runtime: &Snapshot,
        rng: &mut SmallRng,
        now: Instant,
    ) -> Vec<OutlierEvent> {
        let mut events = Vec::new();

        let base_ejection = Duration::from_millis(runtime.get_integer(
            "outlier_detection.base_ejection_time_ms",
            self.config.base_ejection_time_ms,
        ));

        let mut rates: Vec<(HostRef, f64)> = Vec::with_capacity(hosts.len());
        let volume = runtime.get_integer(
            "outlier_detection.success_rate_request_volume",
            self.config.success_rate_request_volume,
        );

        for host in hosts {
            if let Some(event) = self.check_uneject(host, base_ejection, now) {
                events.push(event);
            }

            let (success, total) = host.outlier.rotate_bucket();
            if !host.health_flag_get(HealthFlag::FailedOutlierCheck) && total >= volume {
                rates.push((host.clone(), success as f64 * 100.0 / total as f64));
            }
        }

        let minimum_hosts = runtime.get_integer(
            "outlier_detection.success_rate_minimum_hosts",
            self.config.success_rate_minimum_hosts,
        );
        if (rates.len() as u64) >= minimum_hosts {
            let (mean, threshold) = success_rate_ejection_threshold(&rates);
            for (host, rate) in &rates {
                if *rate < threshold {
                    self.stats.ejections_success_rate.increment();
                    if let Some(event) = self.eject(
                        host,
                        hosts,
                        EjectionKind::SuccessRate,
                        Some(*rate),
                        Some(mean),
                        Some(threshold),
                        runtime,
                        rng,
                        now,
                    ) {
                        events.push(event);
                    }
                }
            }
        }

        events
    }

    fn check_uneject(
        &self,
        host: &HostRef,
        base_ejection: Duration,
        now: Instant,
    ) -> Option<OutlierEvent> {
        if !host.health_flag_get(HealthFlag::FailedOutlierCheck) {
            return None;
        }
        let ejected_at = host.outlier.last_ejection_time()?;
        let penalty = base_ejection * host.outlier.num_ejections();
        if now.duration_since(ejected_at) >= penalty {
            self.stats.ejections_active.decrement();
            host.health_flag_clear(HealthFlag::FailedOutlierCheck);
            host.outlier.uneject(now);
            Some(OutlierEvent::Uneject {
                host: host.clone(),
                num_ejections: host.outlier.num_ejections(),
            })
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn eject(
        &self,
        host: &HostRef,
        hosts: &[HostRef],
        kind: EjectionKind,
        host_success_rate: Option<f64>,
        cluster_average: Option<f64>,
        cluster_threshold: Option<f64>,
        runtime: &Snapshot,
        rng: &mut SmallRng,
        now: Instant,
    ) -> Option<OutlierEvent> {
        let max_percent = runtime
            .get_integer(
                "outlier_detection.max_ejection_percent",
                self.config.max_ejection_percent,
            )
            .min(100);
        let ejected_percent =
            100.0 * self.stats.ejections_active.value() as f64 / hosts.len().max(1) as f64;
        if ejected_percent >= max_percent as f64 {
            self.stats.ejections_overflow.increment();
            return None;
        }

        self.stats.ejections_total.increment();
        let enforced = match kind {
            EjectionKind::Consecutive5xx => runtime.feature_enabled(
                "outlier_detection.enforcing_consecutive_5xx",
                self.config.enforcing_consecutive_5xx,
                rng,
            ),
            EjectionKind::SuccessRate => runtime.feature_enabled(
                "outlier_detection.enforcing_success_rate",
                self.config.enforcing_success_rate,
                rng,
            ),
        };
        if enforced {
            self.stats.ejections_active.increment();
            host.health_flag_set(HealthFlag::FailedOutlierCheck);
            host.outlier.eject(now);
        }
        Some(OutlierEvent::Eject {
            host: host.clone(),
            kind,
            enforced,
            num_ejections: host.outlier.num_ejections(),
            host_success_rate,
            cluster_average,
            cluster_threshold,
        })
    }
}

/// Mean and ejection threshold (`mean - factor * stdev`) over the hosts'
/// success rates.
fn success_rate_ejection_threshold(rates: &[(HostRef, f64)]) -> (f64, f64) {
    let mean = rates.iter().map(|(_, r)| r).sum::<f64>() / rates.len() as f64;
    let variance = rates
        .iter()
        .map(|(_, r)| (r - mean).powi(2))
        .sum::<f64>()
        / rates.len() as f64;
    let stdev = variance.sqrt();
    (mean, mean - SUCCESS_RATE_STDEV_FACTOR * stdev)
}
