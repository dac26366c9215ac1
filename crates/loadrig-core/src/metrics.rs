use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::warn;

// Metric names the engine records on its own.
pub const ITERATIONS: &str = "iterations";
pub const ITERATION_DURATION: &str = "iteration_duration";
pub const ERRORS: &str = "errors";
pub const CHECKS: &str = "checks";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const VUS: &str = "vus";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

/// Streaming value distribution backing Trend metrics.
///
/// Percentiles come from an auto-resizing HDR histogram holding values scaled
/// to thousandths of a unit at three significant figures, so any quantile
/// estimate is within 0.1% of the exact value. Min, max, mean and count are
/// tracked exactly. Merging partial states adds the underlying histograms,
/// which preserves the same bound.
#[derive(Debug, Clone)]
pub struct TrendState {
    hist: Histogram<u64>,
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

const TREND_SCALE: f64 = 1000.0;

impl TrendState {
    pub fn new() -> Self {
        // Only fails for significant figures outside 0..=5.
        let hist = Histogram::new(3).expect("3 significant figures is valid");
        Self {
            hist,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        }
    }

    /// Records one observation. Negative and non-finite values are clamped
    /// or dropped; trends carry durations and sizes, never deltas.
    pub fn record(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let value = value.max(0.0);
        self.hist.saturating_record((value * TREND_SCALE).round() as u64);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    /// Folds another partial state into this one.
    pub fn merge(&mut self, other: &TrendState) {
        if other.count == 0 {
            return;
        }
        self.hist
            .add(&other.hist)
            .expect("auto-resizing histograms always merge");
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.count += other.count;
    }

    /// Value at quantile `q` in `[0, 1]`; `None` with no observations.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(self.hist.value_at_quantile(q) as f64 / TREND_SCALE)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.sum / self.count as f64)
    }
}

impl Default for TrendState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum MetricState {
    Counter { sum: f64, count: u64 },
    Rate { trues: u64, total: u64 },
    Trend(TrendState),
}

#[derive(Debug)]
struct Metric {
    kind: MetricKind,
    state: Mutex<MetricState>,
}

impl Metric {
    fn new(kind: MetricKind) -> Self {
        let state = match kind {
            MetricKind::Counter => MetricState::Counter { sum: 0.0, count: 0 },
            MetricKind::Rate => MetricState::Rate { trues: 0, total: 0 },
            MetricKind::Trend => MetricState::Trend(TrendState::new()),
        };
        Self {
            kind,
            state: Mutex::new(state),
        }
    }

    fn apply(&self, value: f64) {
        let mut state = self.state.lock();
        match &mut *state {
            // Counters are monotonic; negative deltas are dropped.
            MetricState::Counter { sum, count } => {
                *sum += value.max(0.0);
                *count += 1;
            }
            MetricState::Rate { trues, total } => {
                if value != 0.0 {
                    *trues += 1;
                }
                *total += 1;
            }
            MetricState::Trend(trend) => trend.record(value),
        }
    }

    fn summarize(&self) -> MetricSummary {
        let state = self.state.lock();
        match &*state {
            MetricState::Counter { sum, count } => MetricSummary::Counter {
                sum: *sum,
                count: *count,
            },
            MetricState::Rate { trues, total } => MetricSummary::Rate {
                rate: if *total == 0 {
                    0.0
                } else {
                    *trues as f64 / *total as f64
                },
                trues: *trues,
                total: *total,
                no_data: *total == 0,
            },
            MetricState::Trend(trend) => MetricSummary::Trend {
                count: trend.count(),
                min: trend.min().unwrap_or(0.0),
                max: trend.max().unwrap_or(0.0),
                mean: trend.mean().unwrap_or(0.0),
                p50: trend.quantile(0.50).unwrap_or(0.0),
                p90: trend.quantile(0.90).unwrap_or(0.0),
                p95: trend.quantile(0.95).unwrap_or(0.0),
                p99: trend.quantile(0.99).unwrap_or(0.0),
            },
        }
    }
}

/// Point-in-time aggregate of one metric, as reported in results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricSummary {
    Counter {
        sum: f64,
        count: u64,
    },
    Rate {
        rate: f64,
        trues: u64,
        total: u64,
        no_data: bool,
    },
    Trend {
        count: u64,
        min: f64,
        max: f64,
        mean: f64,
        p50: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
}

/// Thread-safe accumulator shared by every VU and the threshold evaluator.
///
/// The registry write lock is held only while a name is first created; every
/// record after that takes the read lock plus the target metric's own mutex,
/// so writers on different metrics never contend. Samples from one VU land
/// in emission order because each record completes before the VU issues the
/// next one.
#[derive(Clone, Default)]
pub struct MetricSink {
    metrics: Arc<RwLock<HashMap<String, Arc<Metric>>>>,
}

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one sample. The first sample for a name fixes its kind; a
    /// sample with a conflicting kind is dropped with a warning.
    pub fn record(&self, name: &str, kind: MetricKind, value: f64) {
        let existing = self.metrics.read().get(name).cloned();
        let metric = match existing {
            Some(metric) => metric,
            None => {
                let mut metrics = self.metrics.write();
                metrics
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(Metric::new(kind)))
                    .clone()
            }
        };
        if metric.kind != kind {
            warn!(
                metric = name,
                expected = ?metric.kind,
                got = ?kind,
                "dropping sample with mismatched metric kind"
            );
            return;
        }
        metric.apply(value);
    }

    pub fn add_counter(&self, name: &str, value: f64) {
        self.record(name, MetricKind::Counter, value);
    }

    pub fn add_rate(&self, name: &str, hit: bool) {
        self.record(name, MetricKind::Rate, if hit { 1.0 } else { 0.0 });
    }

    pub fn add_trend(&self, name: &str, value: f64) {
        self.record(name, MetricKind::Trend, value);
    }

    /// Trend quantile read, `q` in `[0, 1]`. `None` for unknown names,
    /// non-Trend metrics, and empty trends.
    pub fn quantile(&self, name: &str, q: f64) -> Option<f64> {
        let metric = self.metrics.read().get(name).cloned()?;
        let state = metric.state.lock();
        match &*state {
            MetricState::Trend(trend) => trend.quantile(q),
            _ => None,
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<MetricSummary> {
        let metric = self.metrics.read().get(name).cloned()?;
        Some(metric.summarize())
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, MetricSummary> {
        let metrics: Vec<(String, Arc<Metric>)> = self
            .metrics
            .read()
            .iter()
            .map(|(name, metric)| (name.clone(), metric.clone()))
            .collect();
        metrics
            .into_iter()
            .map(|(name, metric)| (name, metric.summarize()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_rate_basic() {
        let sink = MetricSink::new();

        sink.add_counter("iterations", 1.0);
        sink.add_counter("iterations", 1.0);
        sink.add_rate("errors", true);
        sink.add_rate("errors", false);
        sink.add_rate("errors", false);
        sink.add_rate("errors", false);

        assert_eq!(
            sink.snapshot("iterations"),
            Some(MetricSummary::Counter { sum: 2.0, count: 2 })
        );
        match sink.snapshot("errors") {
            Some(MetricSummary::Rate { rate, total, .. }) => {
                assert!((rate - 0.25).abs() < 1e-9);
                assert_eq!(total, 4);
            }
            other => panic!("unexpected summary: {other:?}"),
        }
    }

    #[test]
    fn test_trend_percentiles() {
        let sink = MetricSink::new();

        for _ in 0..50 {
            sink.add_trend("latency", 10.0);
        }
        for _ in 0..30 {
            sink.add_trend("latency", 20.0);
        }
        for _ in 0..20 {
            sink.add_trend("latency", 50.0);
        }

        let p50 = sink.quantile("latency", 0.50).unwrap();
        let p95 = sink.quantile("latency", 0.95).unwrap();
        assert!(p50 <= 20.0, "p50 should be around 10-20, got {p50}");
        assert!(p95 >= 20.0, "p95 should be >= 20, got {p95}");

        match sink.snapshot("latency") {
            Some(MetricSummary::Trend {
                count, min, max, mean, ..
            }) => {
                assert_eq!(count, 100);
                assert_eq!(min, 10.0);
                assert_eq!(max, 50.0);
                assert!((mean - 21.0).abs() < 1e-9);
            }
            other => panic!("unexpected summary: {other:?}"),
        }
    }

    #[test]
    fn test_kind_conflict_drops_sample() {
        let sink = MetricSink::new();

        sink.add_counter("mixed", 1.0);
        sink.add_trend("mixed", 25.0);

        assert_eq!(
            sink.snapshot("mixed"),
            Some(MetricSummary::Counter { sum: 1.0, count: 1 })
        );
    }

    #[test]
    fn test_empty_rate_reports_no_data_via_missing_metric() {
        let sink = MetricSink::new();
        assert_eq!(sink.snapshot("nothing"), None);
        assert_eq!(sink.quantile("nothing", 0.95), None);
    }

    #[test]
    fn test_concurrent_writers() {
        let sink = MetricSink::new();
        let mut handles = Vec::new();

        for worker in 0..8 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    sink.add_counter("iterations", 1.0);
                    sink.add_trend("latency", (worker * 1000 + i) as f64);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            sink.snapshot("iterations"),
            Some(MetricSummary::Counter {
                sum: 8000.0,
                count: 8000
            })
        );
        match sink.snapshot("latency") {
            Some(MetricSummary::Trend { count, .. }) => assert_eq!(count, 8000),
            other => panic!("unexpected summary: {other:?}"),
        }
    }

    #[test]
    fn test_merge_matches_single_threaded_accumulation() {
        // Any partition of the same samples must agree with straight-line
        // accumulation within the histogram's 0.1% bound.
        let values: Vec<f64> = (1..=1000).map(|v| (v * 3 % 997) as f64).collect();

        let mut whole = TrendState::new();
        for v in &values {
            whole.record(*v);
        }

        let mut parts = [TrendState::new(), TrendState::new(), TrendState::new()];
        for (i, v) in values.iter().enumerate() {
            parts[i % 3].record(*v);
        }
        let mut merged = TrendState::new();
        for part in &parts {
            merged.merge(part);
        }

        assert_eq!(merged.count(), whole.count());
        assert_eq!(merged.min(), whole.min());
        assert_eq!(merged.max(), whole.max());
        for q in [0.5, 0.9, 0.95, 0.99] {
            let a = whole.quantile(q).unwrap();
            let b = merged.quantile(q).unwrap();
            assert!(
                (a - b).abs() <= a * 0.002 + 0.001,
                "q={q}: {a} vs {b} diverged beyond the documented bound"
            );
        }
    }
}
