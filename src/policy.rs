//! Command policy matching
//!
//! Ordered regex matcher over a command string, used to gate
//! destructive operations before they reach an agent pane. Evaluation
//! order is strict: allowed rules first, then blocked, then
//! approval-required; the first match in that order decides. A command
//! matching nothing is implicitly allowed.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{NtmError, Result};

/// One rule from the policy file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub pattern: String,
    #[serde(default)]
    pub reason: String,
    /// Two-person approval requirement for especially dangerous actions
    #[serde(default)]
    pub slb: bool,
}

/// Release automation modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForceRelease {
    #[default]
    Never,
    Approval,
    Auto,
}

/// Automation toggles from the policy file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationPolicy {
    pub auto_push: bool,
    pub auto_commit: bool,
    pub force_release: ForceRelease,
}

/// On-disk policy document at `.ntm/policy.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub version: u32,
    pub blocked: Vec<PolicyRule>,
    pub allowed: Vec<PolicyRule>,
    pub approval_required: Vec<PolicyRule>,
    pub automation: AutomationPolicy,
}

/// Decision for one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Explicitly allowed, or matched no rule
    Allowed,
    Blocked { reason: String, slb: bool },
    ApprovalRequired { reason: String, slb: bool },
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Blocked { .. })
    }
}

#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    reason: String,
    slb: bool,
}

fn compile(rules: &[PolicyRule], field: &str) -> Result<Vec<CompiledRule>> {
    rules
        .iter()
        .map(|rule| {
            let regex = Regex::new(&rule.pattern).map_err(|e| NtmError::Validation {
                field: field.to_string(),
                message: format!("invalid pattern '{}': {e}", rule.pattern),
            })?;
            Ok(CompiledRule {
                regex,
                reason: rule.reason.clone(),
                slb: rule.slb,
            })
        })
        .collect()
}

/// Compiled policy matcher
#[derive(Debug)]
pub struct PolicyMatcher {
    allowed: Vec<CompiledRule>,
    blocked: Vec<CompiledRule>,
    approval_required: Vec<CompiledRule>,
    /// Automation toggles consumed by release tooling
    #[allow(dead_code)] // Read by the release pipeline; exercised in tests
    pub automation: AutomationPolicy,
}

impl PolicyMatcher {
    /// Compile a parsed policy file; invalid regexes are validation errors
    pub fn from_file(file: &PolicyFile) -> Result<Self> {
        Ok(Self {
            allowed: compile(&file.allowed, "allowed")?,
            blocked: compile(&file.blocked, "blocked")?,
            approval_required: compile(&file.approval_required, "approval_required")?,
            automation: file.automation.clone(),
        })
    }

    /// Empty matcher: everything is implicitly allowed
    pub fn permissive() -> Self {
        Self {
            allowed: Vec::new(),
            blocked: Vec::new(),
            approval_required: Vec::new(),
            automation: AutomationPolicy::default(),
        }
    }

    /// Decide a command: allowed, then blocked, then approval-required
    pub fn evaluate(&self, command: &str) -> Decision {
        if self.allowed.iter().any(|r| r.regex.is_match(command)) {
            return Decision::Allowed;
        }
        if let Some(rule) = self.blocked.iter().find(|r| r.regex.is_match(command)) {
            return Decision::Blocked {
                reason: rule.reason.clone(),
                slb: rule.slb,
            };
        }
        if let Some(rule) = self
            .approval_required
            .iter()
            .find(|r| r.regex.is_match(command))
        {
            return Decision::ApprovalRequired {
                reason: rule.reason.clone(),
                slb: rule.slb,
            };
        }
        Decision::Allowed
    }
}

/// Candidate policy file locations, most specific first
fn policy_paths(project_dir: &Path) -> Vec<PathBuf> {
    let mut paths = vec![project_dir.join(".ntm").join("policy.yaml")];
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".ntm").join("policy.yaml"));
    }
    paths
}

/// Load the policy from the project dir, falling back to `$HOME`
///
/// No file anywhere yields the permissive matcher.
pub fn load_policy(project_dir: &Path) -> Result<PolicyMatcher> {
    for path in policy_paths(project_dir) {
        if !path.exists() {
            continue;
        }
        let content = std::fs::read_to_string(&path)?;
        let file: PolicyFile = serde_yaml::from_str(&content).map_err(|e| NtmError::Validation {
            field: "policy".to_string(),
            message: format!("{}: {e}", path.display()),
        })?;
        tracing::debug!(path = %path.display(), "Loaded policy file");
        return PolicyMatcher::from_file(&file);
    }
    Ok(PolicyMatcher::permissive())
}
