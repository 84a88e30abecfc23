//! Per-pane provider quota tracking
//!
//! Caches `QuotaInfo` per pane with a TTL and optionally runs one
//! polling task per pane. Fetching goes through the pluggable
//! `QuotaFetcher` seam so tests and alternative providers do not need
//! a real usage endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::Provider;
use crate::config::{DEFAULT_QUOTA_POLL_SECS, DEFAULT_QUOTA_TTL_SECS, MIN_QUOTA_POLL_MS};
use crate::errors::Result;

/// Usage snapshot for one pane's provider account
///
/// Immutable once emitted; staleness is `fetched_at + ttl < now`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub provider: Provider,
    pub pane_index: String,
    pub account_id: String,
    /// Percent of the session budget consumed (0-100)
    pub session_usage: u8,
    /// Percent of the 5-hour period budget consumed (0-100)
    pub period_usage: u8,
    /// Percent of the weekly budget consumed (0-100)
    pub weekly_usage: u8,
    /// Percent of the model-specific budget consumed (0-100)
    pub sonnet_usage: u8,
    /// When the current limit window resets
    pub reset_time: Option<DateTime<Utc>>,
    pub is_limited: bool,
    pub fetched_at: DateTime<Utc>,
    /// Fetch-side error message, when the snapshot is degraded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QuotaInfo {
    /// Clamp all usage percentages into 0-100
    pub fn clamped(mut self) -> Self {
        self.session_usage = self.session_usage.min(100);
        self.period_usage = self.period_usage.min(100);
        self.weekly_usage = self.weekly_usage.min(100);
        self.sonnet_usage = self.sonnet_usage.min(100);
        self
    }
}

/// Source of quota snapshots
#[async_trait]
pub trait QuotaFetcher: Send + Sync {
    async fn fetch(&self, pane_id: &str, provider: Provider) -> Result<QuotaInfo>;
}

/// Fetcher shelling out to a usage CLI
///
/// Expects `<binary> usage <provider> --json` to print a JSON object
/// with percentage fields; missing fields default to zero.
pub struct CliQuotaFetcher {
    binary: String,
    timeout: Duration,
}

impl CliQuotaFetcher {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsageDoc {
    #[serde(default)]
    account: String,
    #[serde(default)]
    session: u8,
    #[serde(default)]
    period: u8,
    #[serde(default)]
    weekly: u8,
    #[serde(default)]
    sonnet: u8,
    #[serde(default)]
    limited: bool,
    #[serde(default)]
    reset: Option<DateTime<Utc>>,
}

#[async_trait]
impl QuotaFetcher for CliQuotaFetcher {
    async fn fetch(&self, pane_id: &str, provider: Provider) -> Result<QuotaInfo> {
        let command = tokio::process::Command::new(&self.binary)
            .args(["usage", provider.as_str(), "--json"])
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, command)
            .await
            .map_err(|_| crate::errors::NtmError::Timeout {
                operation: format!("{} usage", self.binary),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    crate::errors::NtmError::ToolUnavailable(self.binary.clone())
                } else {
                    crate::errors::NtmError::Io(e)
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(crate::errors::NtmError::Io(std::io::Error::other(format!(
                "{} usage exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            ))));
        }

        let doc: UsageDoc = serde_json::from_slice(&output.stdout)?;
        Ok(QuotaInfo {
            provider,
            pane_index: pane_id.to_string(),
            account_id: doc.account,
            session_usage: doc.session,
            period_usage: doc.period,
            weekly_usage: doc.weekly,
            sonnet_usage: doc.sonnet,
            reset_time: doc.reset,
            is_limited: doc.limited,
            fetched_at: Utc::now(),
            error: None,
        }
        .clamped())
    }
}

struct CachedQuota {
    info: QuotaInfo,
    expires_at: DateTime<Utc>,
}

struct Poller {
    token: CancellationToken,
    generation: u64,
}

/// Per-pane quota cache with one optional polling task per pane
pub struct QuotaTracker {
    fetcher: Arc<dyn QuotaFetcher>,
    cache: Arc<RwLock<HashMap<String, CachedQuota>>>,
    pollers: Arc<Mutex<HashMap<String, Poller>>>,
    next_generation: Mutex<u64>,
    ttl: chrono::Duration,
    poll_interval: Duration,
}

impl QuotaTracker {
    pub fn new(fetcher: Arc<dyn QuotaFetcher>) -> Self {
        Self::with_timing(
            fetcher,
            Duration::from_secs(DEFAULT_QUOTA_TTL_SECS),
            Duration::from_secs(DEFAULT_QUOTA_POLL_SECS),
        )
    }

    pub fn with_timing(fetcher: Arc<dyn QuotaFetcher>, ttl: Duration, poll_interval: Duration) -> Self {
        // Sub-100ms tickers would hammer the provider; clamp silently
        let poll_interval = if poll_interval < Duration::from_millis(MIN_QUOTA_POLL_MS) {
            Duration::from_secs(DEFAULT_QUOTA_POLL_SECS)
        } else {
            poll_interval
        };
        Self {
            fetcher,
            cache: Arc::new(RwLock::new(HashMap::new())),
            pollers: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Mutex::new(0),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5)),
            poll_interval,
        }
    }

    /// Cached quota for a pane, or None when absent/expired
    #[allow(dead_code)] // Dashboard quota view; exercised in tests
    pub fn get_quota(&self, pane_id: &str) -> Option<QuotaInfo> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .get(pane_id)
            .filter(|c| c.expires_at > Utc::now())
            .map(|c| c.info.clone())
    }

    /// Fetch now and cache the result
    pub async fn query_quota(&self, pane_id: &str, provider: Provider) -> Result<QuotaInfo> {
        let info = self.fetcher.fetch(pane_id, provider).await?.clamped();
        self.publish(pane_id, info.clone(), None);
        Ok(info)
    }

    fn publish(&self, pane_id: &str, info: QuotaInfo, generation: Option<u64>) {
        // A fetch started by a replaced poller must not clobber the
        // newer poller's data.
        if let Some(generation) = generation {
            let pollers = self.pollers.lock().unwrap_or_else(|e| e.into_inner());
            match pollers.get(pane_id) {
                Some(poller) if poller.generation == generation => {}
                _ => {
                    tracing::debug!(pane_id = %pane_id, "Dropping stale quota fetch result");
                    return;
                }
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            pane_id.to_string(),
            CachedQuota {
                info,
                expires_at: Utc::now() + self.ttl,
            },
        );
    }

    /// Start a polling task for a pane, replacing any predecessor
    ///
    /// The cancellation handle is registered before this returns, so a
    /// `stop_polling` immediately afterwards always takes effect.
    pub fn start_polling(&self, parent: &CancellationToken, pane_id: &str, provider: Provider) {
        let token = parent.child_token();
        let generation = {
            let mut next = self.next_generation.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };

        {
            let mut pollers = self.pollers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = pollers.insert(
                pane_id.to_string(),
                Poller {
                    token: token.clone(),
                    generation,
                },
            ) {
                old.token.cancel();
            }
        }

        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        let pollers = Arc::clone(&self.pollers);
        let ttl = self.ttl;
        let poll_interval = self.poll_interval;
        let pane = pane_id.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match fetcher.fetch(&pane, provider).await {
                            Ok(info) => {
                                // Re-check registration: a newer poller may
                                // have replaced us while the fetch ran.
                                let current = {
                                    let pollers = pollers.lock().unwrap_or_else(|e| e.into_inner());
                                    pollers.get(&pane).map(|p| p.generation)
                                };
                                if current != Some(generation) {
                                    tracing::debug!(pane_id = %pane, "Poller superseded, dropping fetch result");
                                    break;
                                }
                                let mut cache = cache.write().unwrap_or_else(|e| e.into_inner());
                                cache.insert(pane.clone(), CachedQuota {
                                    info: info.clamped(),
                                    expires_at: Utc::now() + ttl,
                                });
                            }
                            Err(e) => {
                                tracing::warn!(pane_id = %pane, error = %e, "Quota fetch failed");
                            }
                        }
                    }
                }
            }
            tracing::debug!(pane_id = %pane, "Quota poller stopped");
        });
    }

    /// Stop the poller for one pane
    #[allow(dead_code)] // Per-pane teardown on pane close; exercised in tests
    pub fn stop_polling(&self, pane_id: &str) {
        let mut pollers = self.pollers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(poller) = pollers.remove(pane_id) {
            poller.token.cancel();
        }
    }

    /// Stop every poller
    pub fn stop_all_polling(&self) {
        let mut pollers = self.pollers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, poller) in pollers.drain() {
            poller.token.cancel();
        }
    }

    /// Panes with an active poller
    #[allow(dead_code)] // Dashboard poller view; exercised in tests
    pub fn polled_panes(&self) -> Vec<String> {
        let pollers = self.pollers.lock().unwrap_or_else(|e| e.into_inner());
        pollers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeFetcher {
        calls: AtomicU32,
        limited: bool,
    }

    impl FakeFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                limited: false,
            }
        }
    }

    #[async_trait]
    impl QuotaFetcher for FakeFetcher {
        async fn fetch(&self, pane_id: &str, provider: Provider) -> Result<QuotaInfo> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(QuotaInfo {
                provider,
                pane_index: pane_id.to_string(),
                account_id: "acct-1".to_string(),
                session_usage: (n % 100) as u8,
                period_usage: 10,
                weekly_usage: 20,
                sonnet_usage: 30,
                reset_time: None,
                is_limited: self.limited,
                fetched_at: Utc::now(),
                error: None,
            })
        }
    }

    #[tokio::test]
    async fn test_query_and_get() {
        let tracker = QuotaTracker::new(Arc::new(FakeFetcher::new()));
        assert!(tracker.get_quota("%1").is_none());

        let info = tracker.query_quota("%1", Provider::Anthropic).await.unwrap();
        assert_eq!(info.account_id, "acct-1");

        let cached = tracker.get_quota("%1").unwrap();
        assert_eq!(cached.account_id, "acct-1");
    }

    #[tokio::test]
    async fn test_expired_entry_misses() {
        let tracker = QuotaTracker::with_timing(
            Arc::new(FakeFetcher::new()),
            Duration::from_millis(10),
            Duration::from_secs(60),
        );
        tracker.query_quota("%1", Provider::Anthropic).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(tracker.get_quota("%1").is_none());
    }

    #[tokio::test]
    async fn test_stop_immediately_after_start() {
        let tracker = QuotaTracker::with_timing(
            Arc::new(FakeFetcher::new()),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );
        let parent = CancellationToken::new();
        tracker.start_polling(&parent, "%1", Provider::Anthropic);
        // Registration is synchronous, so this cancels the poller even
        // though its task may not have started yet.
        tracker.stop_polling("%1");
        assert!(tracker.polled_panes().is_empty());
    }

    #[tokio::test]
    async fn test_polling_populates_cache() {
        let tracker = QuotaTracker::with_timing(
            Arc::new(FakeFetcher::new()),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );
        let parent = CancellationToken::new();
        tracker.start_polling(&parent, "%1", Provider::OpenAI);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(tracker.get_quota("%1").is_some());
        tracker.stop_all_polling();
    }

    #[tokio::test]
    async fn test_replacing_poller_cancels_predecessor() {
        let tracker = QuotaTracker::with_timing(
            Arc::new(FakeFetcher::new()),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );
        let parent = CancellationToken::new();
        tracker.start_polling(&parent, "%1", Provider::Anthropic);
        tracker.start_polling(&parent, "%1", Provider::Anthropic);

        // Only one registration remains
        assert_eq!(tracker.polled_panes().len(), 1);
        tracker.stop_all_polling();
        assert!(tracker.polled_panes().is_empty());
    }

    #[tokio::test]
    async fn test_sub_100ms_period_clamped() {
        let tracker = QuotaTracker::with_timing(
            Arc::new(FakeFetcher::new()),
            Duration::from_secs(60),
            Duration::from_millis(10),
        );
        assert_eq!(
            tracker.poll_interval,
            Duration::from_secs(DEFAULT_QUOTA_POLL_SECS)
        );
    }

    #[test]
    fn test_usage_clamped() {
        let info = QuotaInfo {
            provider: Provider::Anthropic,
            pane_index: "1".to_string(),
            account_id: "a".to_string(),
            session_usage: 250,
            period_usage: 100,
            weekly_usage: 7,
            sonnet_usage: 101,
            reset_time: None,
            is_limited: false,
            fetched_at: Utc::now(),
            error: None,
        }
        .clamped();
        assert_eq!(info.session_usage, 100);
        assert_eq!(info.sonnet_usage, 100);
        assert_eq!(info.weekly_usage, 7);
    }
}
