//! Account rotation
//!
//! Per-pane rotation state machine triggered by rate-limit events from
//! the surveillance loop, plus manual switches. Rotations within the
//! cooldown window are rejected before touching the account backend.
//! Every successful rotation is recorded in memory and, when enabled,
//! in a persisted per-pane history file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{AgentType, Provider};
use crate::config::ACCOUNT_BACKEND_TIMEOUT_SECS;
use crate::errors::{NtmError, Result};
use crate::history::atomic_write;
use crate::surveillance::LimitHitEvent;

/// One account known to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub name: String,
    #[serde(default)]
    pub active: bool,
    /// Provider tag, when the backend manages several
    #[serde(default)]
    pub provider: Option<Provider>,
}

/// Result of a `switch --next` operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchOutcome {
    pub from: String,
    pub to: String,
}

/// Minimal capability set of an external account manager
#[async_trait]
pub trait AccountBackend: Send + Sync {
    async fn list(&self, provider: Provider) -> Result<Vec<AccountInfo>>;
    async fn active_account(&self, provider: Provider) -> Result<String>;
    async fn switch_next(&self, provider: Provider) -> Result<SwitchOutcome>;
    async fn switch_named(&self, provider: Provider, account: &str) -> Result<()>;
}

/// Backend shelling out to an account-manager CLI
///
/// The binary's PATH availability is checked once and cached; call
/// `reset_availability` after installing the tool mid-session.
pub struct CliAccountBackend {
    binary: String,
    timeout: Duration,
    available: Mutex<Option<bool>>,
}

impl CliAccountBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(ACCOUNT_BACKEND_TIMEOUT_SECS),
            available: Mutex::new(None),
        }
    }

    /// Whether the backend binary exists on PATH (cached)
    pub fn is_available(&self) -> bool {
        let mut cached = self.available.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(known) = *cached {
            return known;
        }
        let found = std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| {
                    let candidate = dir.join(&self.binary);
                    candidate.is_file()
                })
            })
            .unwrap_or(false);
        *cached = Some(found);
        found
    }

    /// Forget the cached availability result
    #[allow(dead_code)] // Invalidation after installing the backend; exercised in tests
    pub fn reset_availability(&self) {
        *self.available.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        if !self.is_available() {
            return Err(NtmError::ToolUnavailable(self.binary.clone()));
        }

        let child = tokio::process::Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| NtmError::Timeout {
                operation: format!("{} {}", self.binary, args.join(" ")),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    NtmError::ToolUnavailable(self.binary.clone())
                } else {
                    NtmError::Io(e)
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NtmError::Io(std::io::Error::other(format!(
                "{} exited with {}: {}",
                self.binary,
                output.status,
                stderr.trim()
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl AccountBackend for CliAccountBackend {
    async fn list(&self, provider: Provider) -> Result<Vec<AccountInfo>> {
        let out = self.run(&["list", "--json"]).await?;
        #[derive(Deserialize)]
        struct ListDoc {
            accounts: Vec<AccountInfo>,
        }
        let doc: ListDoc = serde_json::from_str(&out)?;
        Ok(doc
            .accounts
            .into_iter()
            .filter(|a| a.provider.is_none_or(|p| p == provider))
            .collect())
    }

    async fn active_account(&self, provider: Provider) -> Result<String> {
        let accounts = self.list(provider).await?;
        accounts
            .into_iter()
            .find(|a| a.active)
            .map(|a| a.name)
            .ok_or_else(|| NtmError::Io(std::io::Error::other("no active account")))
    }

    async fn switch_next(&self, provider: Provider) -> Result<SwitchOutcome> {
        let out = self
            .run(&["switch", provider.as_str(), "--next", "--json"])
            .await?;
        Ok(serde_json::from_str(&out)?)
    }

    async fn switch_named(&self, _provider: Provider, account: &str) -> Result<()> {
        self.run(&["switch", account]).await?;
        Ok(())
    }
}

/// Rotation state for one pane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationState {
    pub current_account: String,
    pub previous_accounts: Vec<String>,
    pub rotation_count: u32,
    pub last_rotation: Option<DateTime<Utc>>,
}

/// Append-only log entry for one rotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationRecord {
    pub provider: Provider,
    pub agent_type: AgentType,
    pub project: String,
    pub from_account: String,
    pub to_account: String,
    pub rotated_at: DateTime<Utc>,
    pub session_pane: String,
    /// "limit_hit" or "manual"
    pub triggered_by: String,
    /// The rate-limit text that triggered the rotation, when any
    #[serde(default)]
    pub trigger_pattern: String,
    /// Seconds since the previous rotation on the same pane (0 for the first)
    #[serde(default)]
    pub time_since_last: i64,
}

/// Aggregates over rotation history for one agent type
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationStats {
    pub total_rotations: usize,
    /// Rotations landing on each account
    pub per_account: HashMap<String, usize>,
    pub unique_panes: usize,
    /// Mean seconds between rotations, over records with a predecessor
    pub avg_secs_between: f64,
}

/// Persisted per-pane rotation history
///
/// File shape: `{"history": {"<SessionPane>": [RotationRecord, ...]}}`.
/// Unknown fields are ignored on read; writes replace atomically.
pub struct AccountRotationHistory {
    path: PathBuf,
    history: RwLock<HashMap<String, Vec<RotationRecord>>>,
}

#[derive(Serialize, Deserialize, Default)]
struct HistoryDoc {
    #[serde(default)]
    history: HashMap<String, Vec<RotationRecord>>,
}

impl AccountRotationHistory {
    /// Load (or initialize) the history file under `<data_dir>/.ntm/`
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(".ntm").join("rotation_history.json");
        let history = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let doc: HistoryDoc = serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable rotation history, starting fresh");
                HistoryDoc::default()
            });
            doc.history
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            history: RwLock::new(history),
        })
    }

    /// Append a record and persist
    pub fn record(&self, record: RotationRecord) -> Result<()> {
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        history
            .entry(record.session_pane.clone())
            .or_default()
            .push(record);

        let doc = HistoryDoc {
            history: history.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        atomic_write(&self.path, &bytes)
    }

    /// Records for one pane, oldest first
    #[allow(dead_code)] // History inspection; exercised in tests
    pub fn for_pane(&self, session_pane: &str) -> Vec<RotationRecord> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history.get(session_pane).cloned().unwrap_or_default()
    }

    /// All records across panes
    #[allow(dead_code)] // History inspection; exercised in tests
    pub fn all(&self) -> Vec<RotationRecord> {
        let history = self.history.read().unwrap_or_else(|e| e.into_inner());
        history.values().flatten().cloned().collect()
    }
}

/// Per-pane rotation state machine
pub struct AccountRotator {
    backend: Box<dyn AccountBackend>,
    states: RwLock<HashMap<String, RotationState>>,
    memory: RwLock<Vec<RotationRecord>>,
    persisted: RwLock<Option<AccountRotationHistory>>,
    cooldown: chrono::Duration,
}

impl AccountRotator {
    pub fn new(backend: Box<dyn AccountBackend>, cooldown: Duration) -> Self {
        Self {
            backend,
            states: RwLock::new(HashMap::new()),
            memory: RwLock::new(Vec::new()),
            persisted: RwLock::new(None),
            cooldown: chrono::Duration::from_std(cooldown)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
        }
    }

    /// Load and attach the persistent history under `data_dir`
    pub fn enable_rotation_history(&self, data_dir: &Path) -> Result<()> {
        let history = AccountRotationHistory::load(data_dir)?;
        *self.persisted.write().unwrap_or_else(|e| e.into_inner()) = Some(history);
        Ok(())
    }

    /// Handle a rate-limit event from the surveillance loop
    ///
    /// Rejected with a cooldown error when the pane rotated less than
    /// the cooldown interval ago.
    pub async fn on_limit_hit(&self, event: &LimitHitEvent) -> Result<RotationRecord> {
        let provider = event
            .agent_type
            .provider()
            .ok_or_else(|| NtmError::Validation {
                field: "agent_type".to_string(),
                message: "user panes have no provider to rotate".to_string(),
            })?;

        let now = Utc::now();
        {
            let states = self.states.read().unwrap_or_else(|e| e.into_inner());
            if let Some(state) = states.get(&event.session_pane) {
                if let Some(last) = state.last_rotation {
                    let elapsed = now - last;
                    if elapsed < self.cooldown {
                        let remaining = (self.cooldown - elapsed).num_seconds().max(1);
                        return Err(NtmError::CooldownActive {
                            pane: event.session_pane.clone(),
                            remaining_secs: remaining,
                        });
                    }
                }
            }
        }

        // The backend reports who is active before we ask it to move on;
        // the switch result's own `from` is the fallback.
        let active = self.backend.active_account(provider).await?;
        let mut outcome = self.backend.switch_next(provider).await?;
        if !active.is_empty() {
            outcome.from = active;
        }

        let detection_lag_ms = (now - event.detected_at).num_milliseconds();
        tracing::debug!(
            pane = %event.session_pane,
            lag_ms = detection_lag_ms,
            "Rotating after rate-limit detection"
        );
        self.record_rotation(
            provider,
            event.agent_type,
            &event.session_pane,
            &event.project,
            outcome,
            "limit_hit",
            &event.pattern,
        )
    }

    /// Manual rotation to the next account; no cooldown applies
    pub async fn switch_account(
        &self,
        agent_type: AgentType,
        session_pane: &str,
    ) -> Result<RotationRecord> {
        let provider = agent_type.provider().ok_or_else(|| NtmError::Validation {
            field: "agent_type".to_string(),
            message: "user panes have no provider to rotate".to_string(),
        })?;
        let outcome = self.backend.switch_next(provider).await?;
        self.record_rotation(provider, agent_type, session_pane, "", outcome, "limit_hit", "")
    }

    /// Manual rotation to a named account
    pub async fn switch_to_account(
        &self,
        agent_type: AgentType,
        session_pane: &str,
        account: &str,
    ) -> Result<RotationRecord> {
        let provider = agent_type.provider().ok_or_else(|| NtmError::Validation {
            field: "agent_type".to_string(),
            message: "user panes have no provider to rotate".to_string(),
        })?;

        let from = self.backend.active_account(provider).await?;
        self.backend.switch_named(provider, account).await?;
        self.record_rotation(
            provider,
            agent_type,
            session_pane,
            "",
            SwitchOutcome {
                from,
                to: account.to_string(),
            },
            "manual",
            "",
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn record_rotation(
        &self,
        provider: Provider,
        agent_type: AgentType,
        session_pane: &str,
        project: &str,
        outcome: SwitchOutcome,
        triggered_by: &str,
        pattern: &str,
    ) -> Result<RotationRecord> {
        let now = Utc::now();

        let time_since_last = {
            let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
            memory
                .iter()
                .rev()
                .find(|r| r.session_pane == session_pane)
                .map_or(0, |prev| (now - prev.rotated_at).num_seconds())
        };

        let record = RotationRecord {
            provider,
            agent_type,
            project: project.to_string(),
            from_account: outcome.from.clone(),
            to_account: outcome.to.clone(),
            rotated_at: now,
            session_pane: session_pane.to_string(),
            triggered_by: triggered_by.to_string(),
            trigger_pattern: pattern.to_string(),
            time_since_last,
        };

        {
            let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
            let state = states.entry(session_pane.to_string()).or_default();
            if !state.current_account.is_empty() {
                state.previous_accounts.push(state.current_account.clone());
            } else if !outcome.from.is_empty() {
                state.previous_accounts.push(outcome.from.clone());
            }
            state.current_account = outcome.to;
            state.rotation_count += 1;
            state.last_rotation = Some(now);
        }

        self.memory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());

        let persisted = self.persisted.read().unwrap_or_else(|e| e.into_inner());
        if let Some(history) = persisted.as_ref() {
            if let Err(e) = history.record(record.clone()) {
                tracing::warn!(error = %e, "Failed to persist rotation record");
            }
        }

        tracing::info!(
            session_pane = %record.session_pane,
            from = %record.from_account,
            to = %record.to_account,
            triggered_by = %record.triggered_by,
            "Account rotated"
        );
        Ok(record)
    }

    /// Snapshot of one pane's rotation state
    #[allow(dead_code)] // Dashboard rotation view; exercised in tests
    pub fn state(&self, session_pane: &str) -> Option<RotationState> {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states.get(session_pane).cloned()
    }

    /// Aggregate statistics for one agent type
    pub fn rotation_stats(&self, agent_type: AgentType) -> RotationStats {
        let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
        let records: Vec<&RotationRecord> = memory
            .iter()
            .filter(|r| r.agent_type == agent_type)
            .collect();

        let mut stats = RotationStats {
            total_rotations: records.len(),
            ..RotationStats::default()
        };

        let mut panes: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let mut gap_sum = 0i64;
        let mut gap_count = 0usize;
        for record in &records {
            *stats
                .per_account
                .entry(record.to_account.clone())
                .or_insert(0) += 1;
            panes.insert(record.session_pane.as_str());
            if record.time_since_last > 0 {
                gap_sum += record.time_since_last;
                gap_count += 1;
            }
        }
        stats.unique_panes = panes.len();
        if gap_count > 0 {
            stats.avg_secs_between = gap_sum as f64 / gap_count as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeBackend {
        switches: AtomicU32,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                switches: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AccountBackend for FakeBackend {
        async fn list(&self, _provider: Provider) -> Result<Vec<AccountInfo>> {
            Ok(vec![
                AccountInfo {
                    name: "alpha".to_string(),
                    active: true,
                    provider: None,
                },
                AccountInfo {
                    name: "beta".to_string(),
                    active: false,
                    provider: None,
                },
            ])
        }

        async fn active_account(&self, _provider: Provider) -> Result<String> {
            Ok("alpha".to_string())
        }

        async fn switch_next(&self, _provider: Provider) -> Result<SwitchOutcome> {
            let n = self.switches.fetch_add(1, Ordering::SeqCst);
            Ok(SwitchOutcome {
                from: format!("acct-{n}"),
                to: format!("acct-{}", n + 1),
            })
        }

        async fn switch_named(&self, _provider: Provider, _account: &str) -> Result<()> {
            Ok(())
        }
    }

    fn limit_event(pane: &str) -> LimitHitEvent {
        LimitHitEvent {
            session_pane: pane.to_string(),
            agent_type: AgentType::Claude,
            pattern: "usage limit reached".to_string(),
            detected_at: Utc::now(),
            project: "/work/app".to_string(),
        }
    }

    #[tokio::test]
    async fn test_limit_hit_rotates_and_updates_state() {
        let rotator = AccountRotator::new(Box::new(FakeBackend::new()), Duration::from_secs(60));
        let record = rotator.on_limit_hit(&limit_event("dev:1")).await.unwrap();

        assert_eq!(record.triggered_by, "limit_hit");
        assert_eq!(record.trigger_pattern, "usage limit reached");
        assert_eq!(record.time_since_last, 0);
        // `from` comes from the backend's active-account query
        assert_eq!(record.from_account, "alpha");

        let state = rotator.state("dev:1").unwrap();
        assert_eq!(state.current_account, "acct-1");
        assert_eq!(state.rotation_count, 1);
        assert_eq!(state.previous_accounts, vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_cooldown_rejects_then_allows() {
        let rotator = AccountRotator::new(Box::new(FakeBackend::new()), Duration::from_millis(100));

        rotator.on_limit_hit(&limit_event("dev:1")).await.unwrap();

        // Within cooldown: rejected with a descriptive error
        let err = rotator.on_limit_hit(&limit_event("dev:1")).await.unwrap_err();
        assert_eq!(err.code(), Some("COOLDOWN_ACTIVE"));
        assert!(err.to_string().contains("Cooldown active"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let record = rotator.on_limit_hit(&limit_event("dev:1")).await.unwrap();
        assert!(record.time_since_last >= 0);
    }

    #[tokio::test]
    async fn test_cooldown_is_per_pane() {
        let rotator = AccountRotator::new(Box::new(FakeBackend::new()), Duration::from_secs(60));
        rotator.on_limit_hit(&limit_event("dev:1")).await.unwrap();
        // A different pane is unaffected by dev:1's cooldown
        rotator.on_limit_hit(&limit_event("dev:2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_switch_has_no_cooldown() {
        let rotator = AccountRotator::new(Box::new(FakeBackend::new()), Duration::from_secs(60));
        rotator.on_limit_hit(&limit_event("dev:1")).await.unwrap();

        // Manual switch right after an automatic one succeeds
        let record = rotator
            .switch_to_account(AgentType::Claude, "dev:1", "beta")
            .await
            .unwrap();
        assert_eq!(record.triggered_by, "manual");
        assert_eq!(record.to_account, "beta");
    }

    #[tokio::test]
    async fn test_user_pane_cannot_rotate() {
        let rotator = AccountRotator::new(Box::new(FakeBackend::new()), Duration::from_secs(60));
        let err = rotator
            .switch_account(AgentType::User, "dev:1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn test_rotation_stats() {
        let rotator = AccountRotator::new(Box::new(FakeBackend::new()), Duration::from_millis(1));
        rotator.on_limit_hit(&limit_event("dev:1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        rotator.on_limit_hit(&limit_event("dev:2")).await.unwrap();

        let stats = rotator.rotation_stats(AgentType::Claude);
        assert_eq!(stats.total_rotations, 2);
        assert_eq!(stats.unique_panes, 2);
        assert_eq!(stats.per_account.len(), 2);
        // Neither record has a same-pane predecessor
        assert_eq!(stats.avg_secs_between, 0.0);

        assert_eq!(rotator.rotation_stats(AgentType::Codex).total_rotations, 0);
    }

    #[tokio::test]
    async fn test_history_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = AccountRotator::new(Box::new(FakeBackend::new()), Duration::from_millis(1));
        rotator.enable_rotation_history(dir.path()).unwrap();

        rotator.on_limit_hit(&limit_event("dev:1")).await.unwrap();

        // A fresh load sees the record
        let history = AccountRotationHistory::load(dir.path()).unwrap();
        let records = history.for_pane("dev:1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].to_account, "acct-1");
    }

    #[test]
    fn test_history_ignores_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let ntm = dir.path().join(".ntm");
        std::fs::create_dir_all(&ntm).unwrap();
        std::fs::write(
            ntm.join("rotation_history.json"),
            r#"{"history": {}, "version": 9, "junk": true}"#,
        )
        .unwrap();

        let history = AccountRotationHistory::load(dir.path()).unwrap();
        assert!(history.all().is_empty());
    }

    #[tokio::test]
    async fn test_missing_backend_is_unavailable() {
        let backend = CliAccountBackend::new("definitely-not-a-real-binary-ntm");
        let err = backend.list(Provider::Anthropic).await.unwrap_err();
        assert_eq!(err.code(), Some("TOOL_UNAVAILABLE"));

        // Cached; reset clears the cache
        assert!(!backend.is_available());
        backend.reset_availability();
        assert!(!backend.is_available());
    }
}
