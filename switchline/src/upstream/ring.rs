//! Consistent hash ring over upstream hosts.
//!
//! A sorted list of (hash point, host) pairs. Each host contributes
//! `max(1, ceil(min_ring_size / N))` virtual nodes, so adding or removing
//! one host remaps only its own arc of keys. Selection binary-searches for
//! the first point at or above the request hash, wrapping to the start.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::upstream::host::HostRef;

#[derive(Debug, Clone, Default)]
pub struct Ring {
    points: Vec<(u64, HostRef)>,
}

impl Ring {
    /// Build a ring from `hosts`. An empty host list yields an empty ring.
    pub fn build(hosts: &[HostRef], min_ring_size: u64) -> Ring {
        if hosts.is_empty() {
            return Ring::default();
        }

        let n = hosts.len() as u64;
        let mut hashes_per_host = min_ring_size / n;
        if min_ring_size % n != 0 {
            hashes_per_host += 1;
        }
        let hashes_per_host = hashes_per_host.max(1);

        let mut points = Vec::with_capacity((n * hashes_per_host) as usize);
        for host in hosts {
            for i in 0..hashes_per_host {
                let key = format!("{}_{}", host.address(), i);
                points.push((hash_key(key.as_bytes()), host.clone()));
            }
        }
        points.sort_unstable_by_key(|&(hash, _)| hash);
        Ring { points }
    }

    /// Host owning `hash`: the first ring point at or above it, wrapping.
    pub fn choose(&self, hash: u64) -> Option<HostRef> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        Some(self.points[idx].1.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Total virtual nodes on the ring.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

/// 64-bit hash used for both ring points and request hash policies.
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
