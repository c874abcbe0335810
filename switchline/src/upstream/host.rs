//! Upstream hosts.
//!
//! A [`Host`] is shared (`Arc`) between the authoritative cluster state,
//! per-worker snapshots, and in-flight streams; removal from a host set
//! never invalidates a stream's reference. Health flags and stats are
//! atomics so any worker can touch them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::upstream::outlier::OutlierState;

pub type HostRef = Arc<Host>;

/// Health flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HealthFlag {
    FailedActiveHealthCheck = 0x1,
    FailedOutlierCheck = 0x2,
}

pub struct Host {
    address: SocketAddr,
    hostname: String,
    zone: String,
    canary: bool,
    weight: u32,
    health_flags: AtomicU32,
    pub stats: HostStats,
    pub outlier: OutlierState,
}

impl Host {
    pub fn new(
        address: SocketAddr,
        hostname: impl Into<String>,
        zone: impl Into<String>,
        canary: bool,
        weight: u32,
    ) -> HostRef {
        Arc::new(Host {
            address,
            hostname: hostname.into(),
            zone: zone.into(),
            canary,
            weight: weight.max(1),
            health_flags: AtomicU32::new(0),
            stats: HostStats::default(),
            outlier: OutlierState::default(),
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn canary(&self) -> bool {
        self.canary
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn healthy(&self) -> bool {
        self.health_flags.load(Ordering::Relaxed) == 0
    }

    pub fn health_flag_get(&self, flag: HealthFlag) -> bool {
        self.health_flags.load(Ordering::Relaxed) & flag as u32 != 0
    }

    pub fn health_flag_set(&self, flag: HealthFlag) {
        self.health_flags.fetch_or(flag as u32, Ordering::Relaxed);
    }

    pub fn health_flag_clear(&self, flag: HealthFlag) {
        self.health_flags.fetch_and(!(flag as u32), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("zone", &self.zone)
            .field("canary", &self.canary)
            .field("weight", &self.weight)
            .field("healthy", &self.healthy())
            .finish()
    }
}

/// Per-host counters and gauges.
#[derive(Debug, Default)]
pub struct HostStats {
    pub rq_total: AtomicU64,
    pub rq_active: AtomicI64,
    pub rq_timeout: AtomicU64,
    pub cx_total: AtomicU64,
    pub cx_active: AtomicI64,
    pub cx_connect_fail: AtomicU64,
}

impl HostStats {
    pub fn rq_active(&self) -> i64 {
        self.rq_active.load(Ordering::Relaxed)
    }
}

/// Relaxed-ordering helpers; these are statistics, not synchronization.
pub trait StatCounter {
    fn inc(&self);
    fn dec(&self);
}

impl StatCounter for AtomicU64 {
    fn inc(&self) {
        self.fetch_add(1, Ordering::Relaxed);
    }
    fn dec(&self) {
        self.fetch_sub(1, Ordering::Relaxed);
    }
}

impl StatCounter for AtomicI64 {
    fn inc(&self) {
        self.fetch_add(1, Ordering::Relaxed);
    }
    fn dec(&self) {
        self.fetch_sub(1, Ordering::Relaxed);
    }
}
