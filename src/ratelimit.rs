//! Sliding-window rate-limit tracker
//!
//! Records per-provider send outcomes and derives an adaptive stagger
//! delay: clean windows keep the base delay, failure-heavy windows
//! stretch it toward the cap. Consulted by the prompt injector in
//! adaptive mode and fed by it on every send.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::agent::Provider;

/// Default observation window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

/// Delay recommended when the window is clean
pub const BASE_DELAY: Duration = Duration::from_millis(300);

/// Delay recommended when every recent send failed
pub const MAX_DELAY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    ok: bool,
    latency: Option<Duration>,
}

/// Aggregate view of one provider's window
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct WindowStats {
    pub successes: usize,
    pub failures: usize,
    pub avg_latency_ms: f64,
}

/// Per-provider sliding-window success/failure store
pub struct RateLimitTracker {
    windows: RwLock<HashMap<Provider, VecDeque<Sample>>>,
    window: Duration,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, BASE_DELAY, MAX_DELAY)
    }
}

impl RateLimitTracker {
    pub fn new(window: Duration, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            window,
            base_delay,
            max_delay,
        }
    }

    /// Record a successful send with its observed latency
    pub fn record_success(&self, provider: Provider, latency: Duration) {
        self.push(
            provider,
            Sample {
                at: Instant::now(),
                ok: true,
                latency: Some(latency),
            },
        );
    }

    /// Record a failed or refused send
    pub fn record_failure(&self, provider: Provider) {
        self.push(
            provider,
            Sample {
                at: Instant::now(),
                ok: false,
                latency: None,
            },
        );
    }

    fn push(&self, provider: Provider, sample: Sample) {
        let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
        let queue = windows.entry(provider).or_default();
        queue.push_back(sample);
        Self::prune(queue, self.window);
    }

    fn prune(queue: &mut VecDeque<Sample>, window: Duration) {
        let cutoff = Instant::now() - window;
        while queue.front().is_some_and(|s| s.at < cutoff) {
            queue.pop_front();
        }
    }

    /// Fraction of failed sends in the current window (0.0 when empty)
    pub fn failure_rate(&self, provider: Provider) -> f64 {
        let windows = self.windows.read().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = windows.get(&provider) else {
            return 0.0;
        };
        let cutoff = Instant::now() - self.window;
        let live: Vec<&Sample> = queue.iter().filter(|s| s.at >= cutoff).collect();
        if live.is_empty() {
            return 0.0;
        }
        let failures = live.iter().filter(|s| !s.ok).count();
        failures as f64 / live.len() as f64
    }

    /// Stagger delay for the next send to this provider
    ///
    /// Scales linearly from base delay (clean window) to the cap
    /// (all-failure window).
    pub fn recommended_delay(&self, provider: Provider) -> Duration {
        let rate = self.failure_rate(provider);
        let spread = self.max_delay.saturating_sub(self.base_delay);
        self.base_delay + spread.mul_f64(rate)
    }

    /// Window aggregates for a provider
    #[allow(dead_code)] // Dashboard usage view; exercised in tests
    pub fn stats(&self, provider: Provider) -> WindowStats {
        let windows = self.windows.read().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = windows.get(&provider) else {
            return WindowStats::default();
        };
        let cutoff = Instant::now() - self.window;
        let mut stats = WindowStats::default();
        let mut latency_sum = 0.0;
        for sample in queue.iter().filter(|s| s.at >= cutoff) {
            if sample.ok {
                stats.successes += 1;
                if let Some(lat) = sample.latency {
                    latency_sum += lat.as_secs_f64() * 1000.0;
                }
            } else {
                stats.failures += 1;
            }
        }
        if stats.successes > 0 {
            stats.avg_latency_ms = latency_sum / stats.successes as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_uses_base_delay() {
        let tracker = RateLimitTracker::default();
        assert_eq!(tracker.failure_rate(Provider::Anthropic), 0.0);
        assert_eq!(tracker.recommended_delay(Provider::Anthropic), BASE_DELAY);
    }

    #[test]
    fn test_failure_rate_scales_delay() {
        let tracker = RateLimitTracker::default();
        tracker.record_success(Provider::OpenAI, Duration::from_millis(100));
        tracker.record_failure(Provider::OpenAI);

        assert!((tracker.failure_rate(Provider::OpenAI) - 0.5).abs() < f64::EPSILON);

        let delay = tracker.recommended_delay(Provider::OpenAI);
        assert!(delay > BASE_DELAY);
        assert!(delay < MAX_DELAY);
    }

    #[test]
    fn test_all_failures_hits_cap() {
        let tracker = RateLimitTracker::default();
        for _ in 0..5 {
            tracker.record_failure(Provider::Google);
        }
        assert_eq!(tracker.recommended_delay(Provider::Google), MAX_DELAY);
    }

    #[test]
    fn test_providers_are_independent() {
        let tracker = RateLimitTracker::default();
        tracker.record_failure(Provider::OpenAI);
        assert_eq!(tracker.failure_rate(Provider::Anthropic), 0.0);
        assert_eq!(tracker.recommended_delay(Provider::Anthropic), BASE_DELAY);
    }

    #[test]
    fn test_old_samples_age_out() {
        // 50ms window so samples expire quickly
        let tracker = RateLimitTracker::new(Duration::from_millis(50), BASE_DELAY, MAX_DELAY);
        tracker.record_failure(Provider::Anthropic);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(tracker.failure_rate(Provider::Anthropic), 0.0);
    }

    #[test]
    fn test_stats_aggregates() {
        let tracker = RateLimitTracker::default();
        tracker.record_success(Provider::Anthropic, Duration::from_millis(100));
        tracker.record_success(Provider::Anthropic, Duration::from_millis(300));
        tracker.record_failure(Provider::Anthropic);

        let stats = tracker.stats(Provider::Anthropic);
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 1);
        assert!((stats.avg_latency_ms - 200.0).abs() < 1.0);
    }
}
