//! Pane-backed step runner
//!
//! Delivers a step's rendered prompt to a live agent pane through the
//! prompt injector, then watches the pane's output until the agent
//! settles: idle means the step completed, an error classification
//! fails it. Prompts are gated by the command policy before delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentState, AgentType};
use crate::config::DEFAULT_CAPTURE_LINES;
use crate::errors::{NtmError, Result};
use crate::inject::{PromptInjector, Target};
use crate::metrics::MetricsCollector;
use crate::mux::MuxDriver;
use crate::policy::{Decision, PolicyMatcher};
use crate::surveillance::{classify, strip_ansi};
use crate::workflow::executor::StepRunner;

/// How long the pane must sit unchanged mid-step before it counts as stuck
const STEP_STUCK_AFTER: Duration = Duration::from_secs(20 * 60);

/// Runs steps against real panes in one session
pub struct PaneStepRunner {
    driver: Arc<dyn MuxDriver>,
    injector: Arc<PromptInjector>,
    policy: Arc<PolicyMatcher>,
    metrics: Arc<MetricsCollector>,
    session: String,
    /// Seconds between completion polls
    poll_interval: Duration,
}

impl PaneStepRunner {
    pub fn new(
        driver: Arc<dyn MuxDriver>,
        injector: Arc<PromptInjector>,
        policy: Arc<PolicyMatcher>,
        metrics: Arc<MetricsCollector>,
        session: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            driver,
            injector,
            policy,
            metrics,
            session: session.into(),
            poll_interval,
        }
    }

    /// Pick the first pane running the requested agent type
    fn resolve_pane(&self, agent: Option<&str>) -> Result<(String, AgentType)> {
        let agent_type = agent.map_or(AgentType::Claude, AgentType::from_label);
        let panes = self.driver.list_panes(&self.session)?;
        panes
            .iter()
            .find(|p| p.agent_type == agent_type)
            .map(|p| (format!("{}:{}", self.session, p.index), p.agent_type))
            .ok_or_else(|| NtmError::Validation {
                field: "agent".to_string(),
                message: format!(
                    "no pane in session '{}' is running {agent_type}",
                    self.session
                ),
            })
    }
}

#[async_trait]
impl StepRunner for PaneStepRunner {
    async fn run_step(&self, step_id: &str, agent: Option<&str>, prompt: &str) -> Result<String> {
        let step_start = std::time::Instant::now();
        self.metrics.record_call("workflow:step");
        match self.policy.evaluate(prompt) {
            Decision::Blocked { reason, .. } => {
                self.metrics.record_blocked_command();
                return Err(NtmError::Validation {
                    field: "prompt".to_string(),
                    message: format!("blocked by policy: {reason}"),
                });
            }
            Decision::ApprovalRequired { reason, .. } => {
                return Err(NtmError::Validation {
                    field: "prompt".to_string(),
                    message: format!("requires approval: {reason}"),
                });
            }
            Decision::Allowed => {}
        }

        let (target, agent_type) = self.resolve_pane(agent)?;
        tracing::info!(step = %step_id, target = %target, "Delivering step prompt");

        let token = CancellationToken::new();
        let batch = self
            .injector
            .send_batch(&token, &[Target::new(target.clone(), agent_type)], prompt)
            .await;
        if batch.sent == 0 {
            let reason = batch
                .results
                .first()
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| "send failed".to_string());
            return Err(NtmError::Io(std::io::Error::other(reason)));
        }

        // Give the agent a moment to leave its prompt before polling
        tokio::time::sleep(self.poll_interval).await;

        let mut silent_ticks = 0u32;
        let mut last_text = String::new();
        loop {
            let raw = self.driver.capture_tail(&target, DEFAULT_CAPTURE_LINES)?;
            let text = strip_ansi(&raw);
            if text == last_text {
                silent_ticks += 1;
            } else {
                silent_ticks = 0;
                last_text = text.clone();
            }
            let silent_for = self.poll_interval * silent_ticks;

            match classify(agent_type, &text, silent_for, STEP_STUCK_AFTER) {
                AgentState::Idle => {
                    tracing::debug!(step = %step_id, "Agent settled, step complete");
                    self.metrics
                        .record_latency("workflow:step", step_start.elapsed().as_secs_f64() * 1000.0);
                    return Ok(text.trim().to_string());
                }
                AgentState::Error => {
                    return Err(NtmError::Io(std::io::Error::other(format!(
                        "agent reported an error during step '{step_id}'"
                    ))));
                }
                AgentState::RateLimited => {
                    return Err(NtmError::Io(std::io::Error::other(format!(
                        "agent rate-limited during step '{step_id}'"
                    ))));
                }
                AgentState::Working | AgentState::Compacted | AgentState::Unknown => {}
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InjectorConfig;
    use crate::mux::testing::{pane, MockMux};
    use crate::ratelimit::RateLimitTracker;

    fn runner(mux: Arc<MockMux>, policy: PolicyMatcher) -> PaneStepRunner {
        let injector = Arc::new(PromptInjector::new(
            mux.clone(),
            Arc::new(RateLimitTracker::default()),
            InjectorConfig {
                stagger_delay_ms: 1,
                enter_delay_ms: 1,
                double_enter_delay_ms: 1,
                adaptive: false,
            },
        ));
        PaneStepRunner::new(
            mux,
            injector,
            Arc::new(policy),
            Arc::new(MetricsCollector::new()),
            "dev",
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_completes_when_agent_goes_idle() {
        let mux = Arc::new(MockMux::new());
        mux.add_pane(pane("%1", "claude"));
        mux.set_capture("dev:0", "all done\n❯");

        let r = runner(mux.clone(), PolicyMatcher::permissive());
        let output = r.run_step("s1", Some("claude"), "do the thing").await.unwrap();
        assert!(output.contains("all done"));

        // The prompt actually reached the pane
        let sends = mux.sent_to("dev:0");
        assert_eq!(sends[0].text.as_deref(), Some("do the thing"));
    }

    #[tokio::test]
    async fn test_fails_on_agent_error() {
        let mux = Arc::new(MockMux::new());
        mux.add_pane(pane("%1", "claude"));
        mux.set_capture("dev:0", "error: tool exploded");

        let r = runner(mux, PolicyMatcher::permissive());
        let err = r.run_step("s1", Some("claude"), "go").await.unwrap_err();
        assert!(err.to_string().contains("error"));
    }

    #[tokio::test]
    async fn test_no_matching_pane() {
        let mux = Arc::new(MockMux::new());
        mux.add_pane(pane("%1", "claude"));

        let r = runner(mux, PolicyMatcher::permissive());
        let err = r.run_step("s1", Some("gemini"), "go").await.unwrap_err();
        assert!(err.to_string().contains("no pane"));
    }

    #[tokio::test]
    async fn test_policy_blocks_prompt() {
        let mux = Arc::new(MockMux::new());
        mux.add_pane(pane("%1", "claude"));

        let file = crate::policy::PolicyFile {
            blocked: vec![crate::policy::PolicyRule {
                pattern: "rm -rf".to_string(),
                reason: "destructive".to_string(),
                slb: false,
            }],
            ..crate::policy::PolicyFile::default()
        };
        let r = runner(mux.clone(), PolicyMatcher::from_file(&file).unwrap());

        let err = r
            .run_step("s1", Some("claude"), "please run rm -rf /tmp/x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("blocked by policy"));
        // Nothing was sent to the pane
        assert!(mux.sent_to("dev:0").is_empty());
    }
}
