//! Deduplicating alert tracker
//!
//! Maintains active alerts keyed by a stable fingerprint plus a
//! time-ordered log of resolved alerts. The surveillance loop feeds it
//! full scan sets through `update`; event-driven producers use
//! `add_alert`. Severity only escalates while an alert stays active.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Alert severity, ranked info < warning < error < critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Numeric rank; unknown severity strings rank 0, below Info
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Info => 1,
            Severity::Warning => 2,
            Severity::Error => 3,
            Severity::Critical => 4,
        }
    }

    /// Parse a severity name; unknown strings yield None (rank 0)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// 16-hex fingerprint of (type, session, pane)
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    /// Producing component (e.g. "surveillance", "disk")
    pub source: String,
    pub session: String,
    pub pane: String,
    /// Free-form context attached by the producer
    #[serde(default)]
    pub context: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Times this alert has been observed while active
    pub count: u32,
}

impl Alert {
    /// Build a new alert with a stable fingerprint id
    pub fn new(
        alert_type: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        source: impl Into<String>,
        session: impl Into<String>,
        pane: impl Into<String>,
    ) -> Self {
        let alert_type = alert_type.into();
        let session = session.into();
        let pane = pane.into();
        let now = Utc::now();
        Self {
            id: alert_id(&alert_type, &session, &pane),
            alert_type,
            severity,
            message: message.into(),
            source: source.into(),
            session,
            pane,
            context: HashMap::new(),
            created_at: now,
            updated_at: now,
            resolved_at: None,
            count: 1,
        }
    }

    /// Attach a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Stable dedup key: first 16 hex chars of SHA-256("type|session|pane")
pub fn alert_id(alert_type: &str, session: &str, pane: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(alert_type.as_bytes());
    hasher.update(b"|");
    hasher.update(session.as_bytes());
    hasher.update(b"|");
    hasher.update(pane.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Counts by severity and type
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertSummary {
    pub active_total: usize,
    pub resolved_total: usize,
    pub by_severity: HashMap<String, usize>,
    pub by_type: HashMap<String, usize>,
}

struct Store {
    active: HashMap<String, Alert>,
    resolved: Vec<Alert>,
}

/// Active + resolved alert store
pub struct AlertTracker {
    store: RwLock<Store>,
    resolved_prune: chrono::Duration,
}

impl Default for AlertTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::DEFAULT_RESOLVED_PRUNE_MINUTES * 60))
    }
}

impl AlertTracker {
    pub fn new(resolved_prune: Duration) -> Self {
        Self {
            store: RwLock::new(Store {
                active: HashMap::new(),
                resolved: Vec::new(),
            }),
            resolved_prune: chrono::Duration::from_std(resolved_prune)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
        }
    }

    /// Reconcile the store against a full scan set
    ///
    /// Existing ids are refreshed (count bump, severity promotion);
    /// new ids are inserted; active ids absent from the input move to
    /// resolved. An absent alert survives if it was refreshed after
    /// `generated_after` (event-driven alerts raised mid-scan).
    pub fn update(&self, observed: Vec<Alert>, generated_after: Option<DateTime<Utc>>) {
        let now = Utc::now();
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        Self::prune_locked(&mut store, self.resolved_prune, now);

        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        for alert in observed {
            seen.insert(alert.id.clone());
            Self::upsert_locked(&mut store, alert, now);
        }

        // Resolve everything active but unobserved, unless refreshed
        // after the scan cutoff.
        let to_resolve: Vec<String> = store
            .active
            .iter()
            .filter(|(id, alert)| {
                !seen.contains(*id)
                    && generated_after.is_none_or(|cutoff| alert.updated_at <= cutoff)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in to_resolve {
            if let Some(mut alert) = store.active.remove(&id) {
                alert.resolved_at = Some(now);
                tracing::debug!(id = %alert.id, alert_type = %alert.alert_type, "Alert resolved by reconciliation");
                store.resolved.push(alert);
            }
        }
    }

    /// Insert or refresh one alert without reconciling the rest
    pub fn add_alert(&self, alert: Alert) {
        let now = Utc::now();
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        Self::prune_locked(&mut store, self.resolved_prune, now);

        // Re-raising a resolved alert reactivates it
        store.resolved.retain(|a| a.id != alert.id);
        Self::upsert_locked(&mut store, alert, now);
    }

    fn upsert_locked(store: &mut Store, incoming: Alert, now: DateTime<Utc>) {
        match store.active.get_mut(&incoming.id) {
            Some(existing) => {
                existing.count += 1;
                existing.updated_at = now;
                existing.message = incoming.message;
                if incoming.severity.rank() > existing.severity.rank() {
                    tracing::debug!(
                        id = %existing.id,
                        from = %existing.severity,
                        to = %incoming.severity,
                        "Alert severity escalated"
                    );
                    existing.severity = incoming.severity;
                }
                for (k, v) in incoming.context {
                    existing.context.insert(k, v);
                }
            }
            None => {
                let mut alert = incoming;
                alert.count = 1;
                alert.resolved_at = None;
                alert.updated_at = now;
                store.active.insert(alert.id.clone(), alert);
            }
        }
    }

    /// Manually resolve an alert; false if the id is not active
    #[allow(dead_code)] // Dashboard-driven resolution; exercised in tests
    pub fn resolve(&self, id: &str) -> bool {
        let now = Utc::now();
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        Self::prune_locked(&mut store, self.resolved_prune, now);

        match store.active.remove(id) {
            Some(mut alert) => {
                alert.resolved_at = Some(now);
                store.resolved.push(alert);
                true
            }
            None => false,
        }
    }

    fn prune_locked(store: &mut Store, prune: chrono::Duration, now: DateTime<Utc>) {
        store
            .resolved
            .retain(|a| a.resolved_at.is_none_or(|t| now - t < prune));
    }

    /// Copies of all active alerts
    pub fn active(&self) -> Vec<Alert> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut alerts: Vec<Alert> = store.active.values().cloned().collect();
        alerts.sort_by(|a, b| b.severity.rank().cmp(&a.severity.rank()));
        alerts
    }

    /// Copies of resolved alerts, oldest first
    pub fn resolved(&self) -> Vec<Alert> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        store.resolved.clone()
    }

    /// Active then resolved
    #[allow(dead_code)] // Dashboard listing; exercised in tests
    pub fn all(&self) -> Vec<Alert> {
        let mut alerts = self.active();
        alerts.extend(self.resolved());
        alerts
    }

    /// Lookup by id in either set
    #[allow(dead_code)] // Dashboard detail view; exercised in tests
    pub fn get(&self, id: &str) -> Option<Alert> {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        store
            .active
            .get(id)
            .cloned()
            .or_else(|| store.resolved.iter().find(|a| a.id == id).cloned())
    }

    /// Active alerts filtered by type and/or minimum severity
    #[allow(dead_code)] // Dashboard filtering; exercised in tests
    pub fn active_filtered(
        &self,
        alert_type: Option<&str>,
        min_severity: Option<Severity>,
    ) -> Vec<Alert> {
        self.active()
            .into_iter()
            .filter(|a| alert_type.is_none_or(|t| a.alert_type == t))
            .filter(|a| min_severity.is_none_or(|s| a.severity.rank() >= s.rank()))
            .collect()
    }

    /// Counts by severity and type
    pub fn summary(&self) -> AlertSummary {
        let store = self.store.read().unwrap_or_else(|e| e.into_inner());
        let mut summary = AlertSummary {
            active_total: store.active.len(),
            resolved_total: store.resolved.len(),
            ..AlertSummary::default()
        };
        for alert in store.active.values() {
            *summary
                .by_severity
                .entry(alert.severity.as_str().to_string())
                .or_insert(0) += 1;
            *summary
                .by_type
                .entry(alert.alert_type.clone())
                .or_insert(0) += 1;
        }
        summary
    }

    /// Drop everything, active and resolved
    #[allow(dead_code)] // Session reset; exercised in tests
    pub fn clear(&self) {
        let mut store = self.store.write().unwrap_or_else(|e| e.into_inner());
        store.active.clear();
        store.resolved.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(alert_type: &str, severity: Severity) -> Alert {
        Alert::new(alert_type, severity, "msg", "test", "dev", "%1")
    }

    #[test]
    fn test_alert_id_deterministic() {
        let a = alert_id("error", "dev", "%1");
        let b = alert_id("error", "dev", "%1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        // Different pane or session changes the id
        assert_ne!(alert_id("error", "dev", "%2"), a);
        assert_ne!(alert_id("error", "prod", "%1"), a);
    }

    #[test]
    fn test_dedup_bumps_count_and_escalates() {
        let tracker = AlertTracker::default();
        tracker.add_alert(alert("error", Severity::Warning));
        tracker.add_alert(alert("error", Severity::Error));

        let active = tracker.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].severity, Severity::Error);
        assert_eq!(active[0].count, 2);
    }

    #[test]
    fn test_severity_never_downgrades() {
        let tracker = AlertTracker::default();
        tracker.add_alert(alert("error", Severity::Critical));
        tracker.add_alert(alert("error", Severity::Info));

        let active = tracker.active();
        assert_eq!(active[0].severity, Severity::Critical);
        assert_eq!(active[0].count, 2);
    }

    #[test]
    fn test_update_resolves_absent() {
        let tracker = AlertTracker::default();
        tracker.update(
            vec![alert("a", Severity::Warning), alert("b", Severity::Warning)],
            None,
        );
        assert_eq!(tracker.active().len(), 2);

        // Next scan only sees "a"
        tracker.update(vec![alert("a", Severity::Warning)], None);

        let active = tracker.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_type, "a");
        assert_eq!(active[0].count, 2);

        let resolved = tracker.resolved();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].alert_type, "b");
        assert!(resolved[0].resolved_at.is_some());
    }

    #[test]
    fn test_update_cutoff_spares_fresh_alerts() {
        let tracker = AlertTracker::default();
        let cutoff = Utc::now() - chrono::Duration::seconds(10);

        // Raised after the cutoff, absent from the scan set
        tracker.add_alert(alert("event", Severity::Error));
        tracker.update(vec![alert("scan", Severity::Info)], Some(cutoff));

        let types: Vec<String> = tracker.active().iter().map(|a| a.alert_type.clone()).collect();
        assert!(types.contains(&"event".to_string()));
        assert!(types.contains(&"scan".to_string()));
    }

    #[test]
    fn test_never_both_active_and_resolved() {
        let tracker = AlertTracker::default();
        tracker.add_alert(alert("a", Severity::Warning));
        tracker.update(vec![], None);
        assert!(tracker.active().is_empty());
        assert_eq!(tracker.resolved().len(), 1);

        // Re-raising reactivates and removes from resolved
        tracker.add_alert(alert("a", Severity::Warning));
        assert_eq!(tracker.active().len(), 1);
        assert!(tracker.resolved().is_empty());
    }

    #[test]
    fn test_manual_resolve() {
        let tracker = AlertTracker::default();
        let a = alert("a", Severity::Warning);
        let id = a.id.clone();
        tracker.add_alert(a);

        assert!(tracker.resolve(&id));
        assert!(!tracker.resolve(&id));
        assert!(tracker.get(&id).unwrap().resolved_at.is_some());
    }

    #[test]
    fn test_prune_drops_old_resolved() {
        let tracker = AlertTracker::new(Duration::from_millis(10));
        tracker.add_alert(alert("a", Severity::Warning));
        tracker.update(vec![], None);
        assert_eq!(tracker.resolved().len(), 1);

        std::thread::sleep(Duration::from_millis(30));
        // Any mutating operation triggers the prune
        tracker.add_alert(alert("b", Severity::Info));
        assert!(tracker.resolved().is_empty());
    }

    #[test]
    fn test_filtered_and_summary() {
        let tracker = AlertTracker::default();
        tracker.add_alert(alert("error", Severity::Critical));
        tracker.add_alert(alert("disk", Severity::Info));

        let critical = tracker.active_filtered(None, Some(Severity::Error));
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].alert_type, "error");

        let disk = tracker.active_filtered(Some("disk"), None);
        assert_eq!(disk.len(), 1);

        let summary = tracker.summary();
        assert_eq!(summary.active_total, 2);
        assert_eq!(summary.by_severity["critical"], 1);
        assert_eq!(summary.by_type["disk"], 1);
    }

    #[test]
    fn test_unknown_severity_ranks_zero() {
        assert!(Severity::parse("bogus").is_none());
        assert_eq!(Severity::parse("critical").unwrap().rank(), 4);
        // None maps to rank 0, below every known severity
        let rank = Severity::parse("bogus").map_or(0, |s| s.rank());
        assert!(rank < Severity::Info.rank());
    }

    #[test]
    fn test_clear() {
        let tracker = AlertTracker::default();
        tracker.add_alert(alert("a", Severity::Warning));
        tracker.update(vec![], None);
        tracker.add_alert(alert("b", Severity::Warning));
        tracker.clear();
        assert!(tracker.active().is_empty());
        assert!(tracker.resolved().is_empty());
    }
}
