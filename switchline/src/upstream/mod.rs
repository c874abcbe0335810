//! Upstream cluster model: hosts, host sets, load balancing, outlier
//! detection, and per-worker connection pools.

pub mod cluster;
pub mod host;
pub mod lb;
pub mod outlier;
pub mod pool;
pub mod ring;

pub use cluster::{
    CircuitBreakerLimits, ClusterInfo, ClusterStats, HostSet, LbPolicy, MemberUpdate, Priority,
};
pub use host::{HealthFlag, Host, HostRef, StatCounter};
pub use lb::{Balancer, LbContext};
pub use outlier::{Detector, EjectionKind, OutlierConfig, OutlierEvent};
pub use pool::{ClientId, Http1Pool, PoolAction, PoolFailure};
