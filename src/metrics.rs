//! Per-session metrics collection
//!
//! Counts API calls by `tool:op`, keeps a bounded window of latency
//! samples per operation, and tracks incident counters (blocked
//! commands, file conflicts). Reports compare observed latencies
//! against fixed per-operation targets; snapshot comparison flags
//! regressions between two points in time.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MAX_LATENCY_SAMPLES;

/// Latency budget per operation (milliseconds)
const LATENCY_TARGETS: &[(&str, f64)] = &[
    ("mux:capture", 50.0),
    ("mux:send", 20.0),
    ("backend:switch", 2000.0),
    ("quota:fetch", 1500.0),
    ("workflow:step", 5000.0),
];

/// Current average must exceed baseline by this ratio to count as a regression
const REGRESSION_RATIO: f64 = 1.2;

/// Summary statistics over one operation's latency samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Incident counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentCounts {
    pub blocked_commands: u64,
    pub file_conflicts: u64,
}

/// Point-in-time copy of the collector's state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub api_calls: HashMap<String, u64>,
    pub latency: HashMap<String, LatencyStats>,
    pub incidents: IncidentCounts,
}

/// One row of the report's target comparison table
#[derive(Debug, Clone, Serialize)]
pub struct TargetRow {
    pub operation: String,
    pub target_ms: f64,
    pub actual_avg_ms: f64,
    pub met: bool,
}

/// Full report emitted by `generate_report`
#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    pub total_api_calls: u64,
    pub api_calls: HashMap<String, u64>,
    pub latency: HashMap<String, LatencyStats>,
    pub incidents: IncidentCounts,
    pub targets: Vec<TargetRow>,
}

/// Differences between two snapshots
#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotComparison {
    pub improvements: Vec<String>,
    pub regressions: Vec<String>,
    /// Signed per-key call-count deltas (current - baseline)
    pub api_call_deltas: HashMap<String, i64>,
}

struct Inner {
    api_calls: HashMap<String, u64>,
    latencies: HashMap<String, VecDeque<f64>>,
    incidents: IncidentCounts,
}

/// Thread-safe metrics collector for one session
pub struct MetricsCollector {
    inner: RwLock<Inner>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                api_calls: HashMap::new(),
                latencies: HashMap::new(),
                incidents: IncidentCounts::default(),
            }),
        }
    }

    /// Count one API call under a `tool:op` key
    pub fn record_call(&self, key: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner.api_calls.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Record one latency sample; oldest samples evict past the cap
    pub fn record_latency(&self, key: &str, ms: f64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let samples = inner.latencies.entry(key.to_string()).or_default();
        samples.push_back(ms);
        while samples.len() > MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn record_blocked_command(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.incidents.blocked_commands += 1;
    }

    #[allow(dead_code)] // Raised by worktree merge tooling
    pub fn record_file_conflict(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.incidents.file_conflicts += 1;
    }

    /// Stats for one operation; zeroed when no samples exist
    #[allow(dead_code)] // Per-op inspection; exercised in tests
    pub fn latency_stats(&self, key: &str) -> LatencyStats {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .latencies
            .get(key)
            .map(|samples| compute_stats(samples.iter().copied()))
            .unwrap_or_default()
    }

    /// Copy out the full state
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        MetricsSnapshot {
            api_calls: inner.api_calls.clone(),
            latency: inner
                .latencies
                .iter()
                .map(|(k, v)| (k.clone(), compute_stats(v.iter().copied())))
                .collect(),
            incidents: inner.incidents,
        }
    }

    /// Build the session report with target comparisons
    pub fn generate_report(&self) -> MetricsReport {
        let snapshot = self.snapshot();
        let targets = LATENCY_TARGETS
            .iter()
            .map(|(op, target)| {
                let actual = snapshot.latency.get(*op).map_or(0.0, |s| s.avg);
                TargetRow {
                    operation: (*op).to_string(),
                    target_ms: *target,
                    actual_avg_ms: actual,
                    met: actual <= *target,
                }
            })
            .collect();

        MetricsReport {
            generated_at: Utc::now(),
            total_api_calls: snapshot.api_calls.values().sum(),
            api_calls: snapshot.api_calls,
            latency: snapshot.latency,
            incidents: snapshot.incidents,
            targets,
        }
    }
}

/// Percentile over a sorted slice
///
/// Empty input is 0; `p = 0` returns the first element; `p >= 100`
/// returns the last.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 100.0 {
        return sorted[sorted.len() - 1];
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn compute_stats(samples: impl Iterator<Item = f64>) -> LatencyStats {
    let mut sorted: Vec<f64> = samples.collect();
    if sorted.is_empty() {
        return LatencyStats::default();
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    LatencyStats {
        count,
        min: sorted[0],
        max: sorted[count - 1],
        avg: sum / count as f64,
        p50: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    }
}

/// Compare two snapshots, flagging regressions and improvements
#[allow(dead_code)] // Session-over-session comparison; exercised in tests
pub fn compare_snapshots(baseline: &MetricsSnapshot, current: &MetricsSnapshot) -> SnapshotComparison {
    let mut comparison = SnapshotComparison::default();

    for (op, cur) in &current.latency {
        let Some(base) = baseline.latency.get(op) else {
            continue;
        };
        if base.count == 0 || cur.count == 0 {
            continue;
        }
        if cur.avg > base.avg * REGRESSION_RATIO {
            comparison.regressions.push(format!(
                "{op}: avg latency {:.1}ms -> {:.1}ms",
                base.avg, cur.avg
            ));
        } else if cur.avg < base.avg / REGRESSION_RATIO {
            comparison.improvements.push(format!(
                "{op}: avg latency {:.1}ms -> {:.1}ms",
                base.avg, cur.avg
            ));
        }
    }

    if current.incidents.blocked_commands > baseline.incidents.blocked_commands {
        comparison.regressions.push(format!(
            "blocked_commands: {} -> {}",
            baseline.incidents.blocked_commands, current.incidents.blocked_commands
        ));
    }
    if current.incidents.file_conflicts > baseline.incidents.file_conflicts {
        comparison.regressions.push(format!(
            "file_conflicts: {} -> {}",
            baseline.incidents.file_conflicts, current.incidents.file_conflicts
        ));
    }

    let keys: std::collections::HashSet<&String> = baseline
        .api_calls
        .keys()
        .chain(current.api_calls.keys())
        .collect();
    for key in keys {
        let base = *baseline.api_calls.get(key).unwrap_or(&0) as i64;
        let cur = *current.api_calls.get(key).unwrap_or(&0) as i64;
        if base != cur {
            comparison.api_call_deltas.insert(key.clone(), cur - base);
        }
    }

    comparison
}
