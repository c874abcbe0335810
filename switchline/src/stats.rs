//! Scoped runtime statistics.
//!
//! Counters, gauges, and histograms are created by name through a
//! [`Scope`], registered with `metriken` for exposition, and cached so a
//! name resolves to the same storage everywhere. Counters are atomic adds,
//! gauges atomic stores; both are safe to touch from any worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metriken::dynmetrics::{DynBoxedMetric, MetricBuilder};

/// Shared handle to a named counter.
#[derive(Clone)]
pub struct Counter {
    inner: Arc<DynBoxedMetric<metriken::Counter>>,
}

impl Counter {
    #[inline]
    pub fn increment(&self) {
        self.inner.increment();
    }

    #[inline]
    pub fn add(&self, value: u64) {
        self.inner.add(value);
    }

    pub fn value(&self) -> u64 {
        self.inner.value()
    }
}

/// Shared handle to a named gauge.
#[derive(Clone)]
pub struct Gauge {
    inner: Arc<DynBoxedMetric<metriken::Gauge>>,
}

impl Gauge {
    #[inline]
    pub fn increment(&self) {
        self.inner.increment();
    }

    #[inline]
    pub fn decrement(&self) {
        self.inner.decrement();
    }

    pub fn set(&self, value: i64) {
        self.inner.set(value);
    }

    pub fn value(&self) -> i64 {
        self.inner.value()
    }
}

/// Shared handle to a named histogram.
#[derive(Clone)]
pub struct Histogram {
    inner: Arc<DynBoxedMetric<metriken::AtomicHistogram>>,
}

impl Histogram {
    pub fn record(&self, value: u64) {
        // Out-of-range values are clamped by the histogram config; a
        // recording failure is not worth surfacing on the data path.
        let _ = self.inner.increment(value);
    }
}

#[derive(Default)]
struct Registry {
    counters: Mutex<HashMap<String, Counter>>,
    gauges: Mutex<HashMap<String, Gauge>>,
    histograms: Mutex<HashMap<String, Histogram>>,
}

/// The stats store. Cheap to clone; all clones share storage.
#[derive(Clone, Default)]
pub struct Store {
    registry: Arc<Registry>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }

    /// Root scope with an empty prefix.
    pub fn root(&self) -> Scope {
        Scope {
            store: self.clone(),
            prefix: String::new(),
        }
    }

    /// Scope all names with `prefix` (a trailing `.` is appended).
    pub fn scope(&self, prefix: &str) -> Scope {
        self.root().scope(prefix)
    }

    fn counter(&self, name: String) -> Counter {
        let mut counters = self.registry.counters.lock().unwrap();
        counters
            .entry(name)
            .or_insert_with_key(|name| Counter {
                inner: Arc::new(
                    MetricBuilder::new(name.clone()).build(metriken::Counter::new()),
                ),
            })
            .clone()
    }

    fn gauge(&self, name: String) -> Gauge {
        let mut gauges = self.registry.gauges.lock().unwrap();
        gauges
            .entry(name)
            .or_insert_with_key(|name| Gauge {
                inner: Arc::new(MetricBuilder::new(name.clone()).build(metriken::Gauge::new())),
            })
            .clone()
    }

    fn histogram(&self, name: String) -> Histogram {
        let mut histograms = self.registry.histograms.lock().unwrap();
        histograms
            .entry(name)
            .or_insert_with_key(|name| Histogram {
                inner: Arc::new(
                    MetricBuilder::new(name.clone())
                        .build(metriken::AtomicHistogram::new(7, 64)),
                ),
            })
            .clone()
    }
}

/// A name prefix over a [`Store`].
#[derive(Clone)]
pub struct Scope {
    store: Store,
    prefix: String,
}

impl Scope {
    /// Child scope: `cluster.` + `foo` -> `cluster.foo.`.
    pub fn scope(&self, prefix: &str) -> Scope {
        Scope {
            store: self.store.clone(),
            prefix: format!("{}{}.", self.prefix, prefix),
        }
    }

    pub fn counter(&self, name: &str) -> Counter {
        self.store.counter(format!("{}{}", self.prefix, name))
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.store.gauge(format!("{}{}", self.prefix, name))
    }

    pub fn histogram(&self, name: &str) -> Histogram {
        self.store.histogram(format!("{}{}", self.prefix, name))
    }
}
