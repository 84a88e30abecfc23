//! Agent and provider types shared across the orchestrator
//!
//! Tracks which agent CLI runs in each pane and how that maps to an
//! upstream provider. Classification results from the surveillance loop
//! are snapshotted as `AgentStatus` values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of agent CLI running in a pane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Claude Code (Anthropic)
    Claude,
    /// Codex CLI (OpenAI)
    Codex,
    /// Gemini CLI (Google)
    Gemini,
    /// A plain user shell, no agent
    #[default]
    User,
}

impl AgentType {
    /// Parse from a pane title or command name
    ///
    /// Matches on prefix so titled panes like "claude-2" resolve correctly.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.starts_with("claude") {
            AgentType::Claude
        } else if lower.starts_with("codex") {
            AgentType::Codex
        } else if lower.starts_with("gemini") {
            AgentType::Gemini
        } else {
            AgentType::User
        }
    }

    /// Upstream provider for this agent, if any
    pub fn provider(&self) -> Option<Provider> {
        match self {
            AgentType::Claude => Some(Provider::Anthropic),
            AgentType::Codex => Some(Provider::OpenAI),
            AgentType::Gemini => Some(Provider::Google),
            AgentType::User => None,
        }
    }

    /// Whether this agent's input box needs a second Enter to submit
    ///
    /// Codex and Gemini CLIs open a multi-line composer; the first Enter
    /// inserts a newline and only the second submits. Claude submits on
    /// a single Enter.
    pub fn needs_double_enter(&self) -> bool {
        matches!(self, AgentType::Codex | AgentType::Gemini)
    }

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Gemini => "gemini",
            AgentType::User => "user",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream model provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    Google,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::OpenAI => "openai",
            Provider::Google => "google",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(Provider::Anthropic),
            "openai" => Ok(Provider::OpenAI),
            "google" => Ok(Provider::Google),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

/// Classified activity state of a pane at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Agent is actively processing (spinner, tool output scrolling)
    Working,
    /// Agent is waiting at its prompt or has gone silent
    Idle,
    /// Error keywords present in recent output
    Error,
    /// Provider refused further requests for a bounded period
    RateLimited,
    /// Context compaction banner seen; transcript was reset
    Compacted,
    /// Could not classify
    #[default]
    Unknown,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Working => "working",
            AgentState::Idle => "idle",
            AgentState::Error => "error",
            AgentState::RateLimited => "rate_limited",
            AgentState::Compacted => "compacted",
            AgentState::Unknown => "unknown",
        }
    }
}

/// Snapshot of one pane's classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Pane identifier (e.g. "%3")
    pub pane_id: String,
    /// Classified state
    pub state: AgentState,
    /// Percent of context window consumed, when the banner exposes it
    pub context_percent: Option<u8>,
    /// Context window size in tokens, when known
    pub context_limit: Option<u32>,
    /// When this snapshot was taken
    pub updated_at: DateTime<Utc>,
}

impl AgentStatus {
    pub fn new(pane_id: impl Into<String>, state: AgentState) -> Self {
        Self {
            pane_id: pane_id.into(),
            state,
            context_percent: None,
            context_limit: None,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_type_from_label() {
        let cases: Vec<(&str, AgentType)> = vec![
            ("claude", AgentType::Claude),
            ("claude-2", AgentType::Claude),
            ("Codex", AgentType::Codex),
            ("gemini-pro", AgentType::Gemini),
            ("bash", AgentType::User),
            ("", AgentType::User),
        ];

        for (label, expected) in cases {
            assert_eq!(AgentType::from_label(label), expected, "label: {label}");
        }
    }

    #[test]
    fn test_provider_mapping() {
        assert_eq!(AgentType::Claude.provider(), Some(Provider::Anthropic));
        assert_eq!(AgentType::Codex.provider(), Some(Provider::OpenAI));
        assert_eq!(AgentType::Gemini.provider(), Some(Provider::Google));
        assert_eq!(AgentType::User.provider(), None);
    }

    #[test]
    fn test_double_enter_quirk() {
        assert!(!AgentType::Claude.needs_double_enter());
        assert!(AgentType::Codex.needs_double_enter());
        assert!(AgentType::Gemini.needs_double_enter());
    }

    #[test]
    fn test_provider_round_trip() {
        for p in [Provider::Anthropic, Provider::OpenAI, Provider::Google] {
            let parsed: Provider = p.as_str().parse().unwrap();
            assert_eq!(parsed, p);
        }
        assert!("mistral".parse::<Provider>().is_err());
    }
}
