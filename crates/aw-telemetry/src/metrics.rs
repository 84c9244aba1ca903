use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use ahash::RandomState;
use dashmap::DashMap;

// Metric names shared by the daemon, agents and QA engine.
pub const TASKS_TOTAL: &str = "aw_tasks_total";
pub const ATTEMPTS_TOTAL: &str = "aw_attempts_total";
pub const TRANSIENT_RETRIES_TOTAL: &str = "aw_transient_retries_total";
pub const DEFERRALS_TOTAL: &str = "aw_lock_deferrals_total";
pub const STALE_AGENTS_TOTAL: &str = "aw_stale_agents_total";
pub const QA_REPORTS_TOTAL: &str = "aw_qa_reports_total";
pub const AGENTS_RUNNING: &str = "aw_agents_running";
pub const CURRENT_WAVE: &str = "aw_current_wave";
pub const ATTEMPT_DURATION: &str = "aw_attempt_duration_seconds";
pub const QA_CHECK_DURATION: &str = "aw_qa_check_duration_seconds";

/// Bucket boundaries in seconds. Attempts run from seconds to tens of
/// minutes, so the buckets are much wider than request-latency defaults.
fn duration_buckets() -> Vec<f64> {
    vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
}

#[derive(Debug)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// f64 bits.
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// `(upper bound, cumulative count)` per bucket.
    fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.buckets
            .iter()
            .zip(&self.counts)
            .map(|(b, c)| {
                running += c.load(Ordering::Relaxed);
                (*b, running)
            })
            .collect()
    }
}

/// Sorted `key=value` pairs distinguishing series of one metric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Labels(Vec<(String, String)>);

impl Labels {
    fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    /// `{key="value",...}`, or empty when there are no labels.
    fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

type Series<V> = DashMap<(String, Labels), V, RandomState>;

/// Process-wide metrics registry. Series are created on first use.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Series<AtomicU64>,
    gauges: Series<AtomicI64>,
    histograms: Series<Histogram>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.counters
            .entry((name.to_string(), Labels::new(labels)))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        self.gauges
            .entry((name.to_string(), Labels::new(labels)))
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        self.gauges
            .entry((name.to_string(), Labels::new(labels)))
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn observe_duration(&self, name: &str, labels: &[(&str, &str)], elapsed: Duration) {
        self.histograms
            .entry((name.to_string(), Labels::new(labels)))
            .or_insert_with(|| Histogram::new(duration_buckets()))
            .observe(elapsed.as_secs_f64());
    }

    /// Prometheus text exposition format, series sorted by name then labels.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let mut counters: Vec<((String, Labels), u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        write_family(&mut out, "counter", &counters);

        let mut gauges: Vec<((String, Labels), i64)> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        write_family(&mut out, "gauge", &gauges);

        let mut keys: Vec<(String, Labels)> =
            self.histograms.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        let mut last: Option<String> = None;
        for key in keys {
            let Some(h) = self.histograms.get(&key) else {
                continue;
            };
            let (name, labels) = &key;
            if last.as_deref() != Some(name.as_str()) {
                out.push_str(&format!("# TYPE {name} histogram\n"));
                last = Some(name.clone());
            }
            for (bound, cumulative) in h.cumulative() {
                let le = bucket_labels(labels, &bound.to_string());
                out.push_str(&format!("{name}_bucket{le} {cumulative}\n"));
            }
            let inf = bucket_labels(labels, "+Inf");
            out.push_str(&format!("{name}_bucket{inf} {}\n", h.count()));
            out.push_str(&format!("{name}_sum{} {}\n", labels.prometheus_str(), h.sum()));
            out.push_str(&format!("{name}_count{} {}\n", labels.prometheus_str(), h.count()));
        }
        out
    }
}

fn write_family<V: std::fmt::Display>(out: &mut String, kind: &str, series: &[((String, Labels), V)]) {
    let mut last: Option<&str> = None;
    for ((name, labels), value) in series {
        if last != Some(name.as_str()) {
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            last = Some(name.as_str());
        }
        out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
    }
}

fn bucket_labels(labels: &Labels, le: &str) -> String {
    let mut pairs: Vec<(&str, &str)> = labels
        .0
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.push(("le", le));
    Labels::new(&pairs).prometheus_str()
}

/// The process-wide collector.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}
