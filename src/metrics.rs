//! In-process dispatch metrics.
//!
//! Counters and latency histograms are keyed by (server, method, capability,
//! success) and accumulated with atomics, so concurrent dispatches record
//! without contention. The only synchronised structure is the key table
//! itself, which is read-mostly after the first sample per key.
//!
//! Export is pull-based: [`MetricsRegistry::snapshot`] renders the current
//! totals for an external collector; the registry itself persists nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

/// Latency histogram bucket upper bounds in milliseconds.
pub const LATENCY_BUCKETS_MS: &[u64] =
    &[1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

/// Method label for capability dispatches.
pub const METHOD_CALL: &str = "call";

/// Identifies one counter/histogram series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SampleKey {
    /// Server label (the configured server name).
    pub server: String,
    /// Method label.
    pub method: String,
    /// Capability label.
    pub capability: String,
    /// Whether the dispatch succeeded.
    pub success: bool,
}

/// Atomic accumulation for one series.
#[derive(Debug)]
struct SampleRecorder {
    count: AtomicU64,
    total_micros: AtomicU64,
    // One counter per bucket bound, plus an overflow bucket.
    buckets: Vec<AtomicU64>,
}

impl SampleRecorder {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            buckets: (0..=LATENCY_BUCKETS_MS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
        }
    }

    fn record(&self, duration: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);

        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        let index = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        if let Some(bucket) = self.buckets.get(index) {
            bucket.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn totals(&self) -> (u64, u64, Vec<u64>) {
        (
            self.count.load(Ordering::Relaxed),
            self.total_micros.load(Ordering::Relaxed),
            self.buckets
                .iter()
                .map(|bucket| bucket.load(Ordering::Relaxed))
                .collect(),
        )
    }
}

/// One exported series.
#[derive(Debug, Clone, Serialize)]
pub struct SampleSnapshot {
    /// Series key.
    #[serde(flatten)]
    pub key: SampleKey,
    /// Number of recorded samples.
    pub count: u64,
    /// Cumulative latency in microseconds.
    pub total_micros: u64,
    /// Per-bucket counts; the final entry is the overflow bucket.
    pub buckets: Vec<u64>,
}

/// A pull-based export of all series.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Bucket upper bounds in milliseconds, shared by every series.
    pub bucket_bounds_ms: Vec<u64>,
    /// Exported series, ordered by key for stable output.
    pub samples: Vec<SampleSnapshot>,
}

/// Concurrent counter/histogram aggregation.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    series: RwLock<HashMap<SampleKey, Arc<SampleRecorder>>>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sample.
    pub fn record(&self, key: SampleKey, duration: Duration) {
        let existing = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();

        let recorder = match existing {
            Some(recorder) => recorder,
            None => Arc::clone(
                self.series
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entry(key)
                    .or_insert_with(|| Arc::new(SampleRecorder::new())),
            ),
        };

        recorder.record(duration);
    }

    /// Renders the current totals.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut samples: Vec<SampleSnapshot> = self
            .series
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, recorder)| {
                let (count, total_micros, buckets) = recorder.totals();
                SampleSnapshot {
                    key: key.clone(),
                    count,
                    total_micros,
                    buckets,
                }
            })
            .collect();
        samples.sort_by(|a, b| a.key.cmp(&b.key));

        MetricsSnapshot {
            bucket_bounds_ms: LATENCY_BUCKETS_MS.to_vec(),
            samples,
        }
    }
}
