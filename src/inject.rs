//! Prompt injection across panes
//!
//! Delivers a prompt to one or many agent panes in strict order with a
//! stagger delay between sends, honoring each agent's submit quirk:
//! Claude submits on a single Enter, Codex and Gemini need a second
//! Enter after a pause. A failed send never aborts the batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::agent::AgentType;
use crate::config::InjectorConfig;
use crate::mux::MuxDriver;
use crate::ratelimit::RateLimitTracker;

/// One destination for a prompt
#[derive(Debug, Clone)]
pub struct Target {
    /// "session:pane" address understood by the driver
    pub session_pane: String,
    pub agent_type: AgentType,
}

impl Target {
    pub fn new(session_pane: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            session_pane: session_pane.into(),
            agent_type,
        }
    }
}

/// Outcome of one target's send
#[derive(Debug, Clone)]
pub struct SendResult {
    pub target: String,
    pub success: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Aggregated outcome of a batch
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub results: Vec<SendResult>,
    pub sent: usize,
    pub failed: usize,
    pub total_duration: Duration,
}

/// Ordered, staggered prompt deliverer
pub struct PromptInjector {
    driver: Arc<dyn MuxDriver>,
    ratelimit: Arc<RateLimitTracker>,
    config: InjectorConfig,
}

impl PromptInjector {
    pub fn new(
        driver: Arc<dyn MuxDriver>,
        ratelimit: Arc<RateLimitTracker>,
        config: InjectorConfig,
    ) -> Self {
        Self {
            driver,
            ratelimit,
            config,
        }
    }

    /// Send a prompt to a batch of targets in order
    ///
    /// Targets are processed in the given order; between sends the
    /// injector sleeps for the stagger delay (or the rate-limit
    /// tracker's recommendation in adaptive mode). Cancellation marks
    /// the remaining targets failed with reason "cancelled".
    pub async fn send_batch(
        &self,
        token: &CancellationToken,
        targets: &[Target],
        prompt: &str,
    ) -> BatchResult {
        let batch_start = Instant::now();
        let mut result = BatchResult::default();

        for (i, target) in targets.iter().enumerate() {
            if i > 0 {
                let delay = self.delay_for(target.agent_type);
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if token.is_cancelled() {
                result.failed += 1;
                result.results.push(SendResult {
                    target: target.session_pane.clone(),
                    success: false,
                    duration: Duration::ZERO,
                    error: Some("cancelled".to_string()),
                });
                continue;
            }

            let send_start = Instant::now();
            match self.send_one(target, prompt).await {
                Ok(()) => {
                    let duration = send_start.elapsed();
                    if self.config.adaptive {
                        if let Some(provider) = target.agent_type.provider() {
                            self.ratelimit.record_success(provider, duration);
                        }
                    }
                    result.sent += 1;
                    result.results.push(SendResult {
                        target: target.session_pane.clone(),
                        success: true,
                        duration,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(target = %target.session_pane, error = %e, "Send failed, continuing batch");
                    if self.config.adaptive {
                        if let Some(provider) = target.agent_type.provider() {
                            self.ratelimit.record_failure(provider);
                        }
                    }
                    result.failed += 1;
                    result.results.push(SendResult {
                        target: target.session_pane.clone(),
                        success: false,
                        duration: send_start.elapsed(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        result.total_duration = batch_start.elapsed();
        tracing::info!(
            sent = result.sent,
            failed = result.failed,
            duration_ms = result.total_duration.as_millis() as u64,
            "Prompt batch finished"
        );
        result
    }

    /// Type the prompt, then submit with the agent's Enter quirk
    async fn send_one(&self, target: &Target, prompt: &str) -> crate::errors::Result<()> {
        self.driver.send_text(&target.session_pane, prompt)?;
        tokio::time::sleep(self.config.enter_delay()).await;
        self.driver.send_enter(&target.session_pane)?;

        if target.agent_type.needs_double_enter() {
            tokio::time::sleep(self.config.double_enter_delay()).await;
            self.driver.send_enter(&target.session_pane)?;
        }
        Ok(())
    }

    fn delay_for(&self, agent_type: AgentType) -> Duration {
        if self.config.adaptive {
            if let Some(provider) = agent_type.provider() {
                return self.ratelimit.recommended_delay(provider);
            }
        }
        self.config.stagger_delay()
    }
}

/// A named prompt template
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub name: String,
    pub body: String,
}

impl PromptTemplate {
    /// Substitute `{task}` with the given task text
    pub fn render(&self, task: &str) -> String {
        self.body.replace("{task}", task)
    }
}

/// Registry of named templates with a guaranteed default
pub struct TemplateRegistry {
    templates: Vec<PromptTemplate>,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self {
            templates: vec![
                PromptTemplate {
                    name: "default".to_string(),
                    body: "{task}".to_string(),
                },
                PromptTemplate {
                    name: "review".to_string(),
                    body: "Review the following changes and report problems before anything else:\n{task}"
                        .to_string(),
                },
                PromptTemplate {
                    name: "test".to_string(),
                    body: "Write tests for the following, then run them and fix failures:\n{task}"
                        .to_string(),
                },
            ],
        }
    }
}

impl TemplateRegistry {
    /// Look up a template; unknown names fall back to `default`
    pub fn get(&self, name: &str) -> &PromptTemplate {
        self.templates
            .iter()
            .find(|t| t.name == name)
            .unwrap_or(&self.templates[0])
    }

    /// Register or replace a template
    #[allow(dead_code)] // Custom templates from config; exercised in tests
    pub fn register(&mut self, template: PromptTemplate) {
        self.templates.retain(|t| t.name != template.name);
        self.templates.push(template);
    }

    #[allow(dead_code)] // Template listing; exercised in tests
    pub fn names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::testing::MockMux;

    fn injector(mux: Arc<MockMux>, config: InjectorConfig) -> PromptInjector {
        PromptInjector::new(mux, Arc::new(RateLimitTracker::default()), config)
    }

    fn fast_config() -> InjectorConfig {
        InjectorConfig {
            stagger_delay_ms: 50,
            enter_delay_ms: 1,
            double_enter_delay_ms: 1,
            adaptive: false,
        }
    }

    #[tokio::test]
    async fn test_single_enter_for_claude() {
        let mux = Arc::new(MockMux::new());
        let inj = injector(mux.clone(), fast_config());
        let token = CancellationToken::new();

        let result = inj
            .send_batch(&token, &[Target::new("dev:1", AgentType::Claude)], "hello")
            .await;

        assert_eq!(result.sent, 1);
        let sends = mux.sent_to("dev:1");
        // text + one Enter
        assert_eq!(sends.len(), 2);
        assert_eq!(sends[0].text.as_deref(), Some("hello"));
        assert!(sends[1].text.is_none());
    }

    #[tokio::test]
    async fn test_double_enter_for_codex() {
        let mux = Arc::new(MockMux::new());
        let inj = injector(mux.clone(), fast_config());
        let token = CancellationToken::new();

        inj.send_batch(&token, &[Target::new("dev:2", AgentType::Codex)], "go")
            .await;

        let sends = mux.sent_to("dev:2");
        // text + two Enters
        assert_eq!(sends.len(), 3);
        assert!(sends[1].text.is_none());
        assert!(sends[2].text.is_none());
    }

    #[tokio::test]
    async fn test_stagger_spacing_and_wall_clock() {
        let mux = Arc::new(MockMux::new());
        let inj = injector(mux.clone(), fast_config());
        let token = CancellationToken::new();

        let targets: Vec<Target> = (1..=4)
            .map(|i| Target::new(format!("dev:{i}"), AgentType::Claude))
            .collect();
        let start = Instant::now();
        let result = inj.send_batch(&token, &targets, "ping").await;

        assert_eq!(result.sent, 4);
        // Three gaps of >= 50ms
        assert!(start.elapsed() >= Duration::from_millis(150));

        // First-keystroke timestamps are non-decreasing with >= stagger gaps
        let sends = mux.sends.lock().unwrap();
        let first_sends: Vec<_> = sends.iter().filter(|s| s.text.is_some()).collect();
        for pair in first_sends.windows(2) {
            let gap = pair[1].at - pair[0].at;
            assert!(gap >= Duration::from_millis(50), "gap too small: {gap:?}");
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let mux = Arc::new(MockMux::new());
        mux.fail_target("dev:1");
        let inj = injector(mux.clone(), fast_config());
        let token = CancellationToken::new();

        let targets = vec![
            Target::new("dev:1", AgentType::Claude),
            Target::new("dev:2", AgentType::Claude),
        ];
        let result = inj.send_batch(&token, &targets, "hi").await;

        assert_eq!(result.failed, 1);
        assert_eq!(result.sent, 1);
        assert!(result.results[0].error.is_some());
        assert!(result.results[1].success);
    }

    #[tokio::test]
    async fn test_cancellation_marks_remaining_failed() {
        let mux = Arc::new(MockMux::new());
        let inj = injector(mux.clone(), fast_config());
        let token = CancellationToken::new();
        token.cancel();

        let targets = vec![
            Target::new("dev:1", AgentType::Claude),
            Target::new("dev:2", AgentType::Claude),
        ];
        let result = inj.send_batch(&token, &targets, "hi").await;

        assert_eq!(result.sent, 0);
        assert_eq!(result.failed, 2);
        for r in &result.results {
            assert_eq!(r.error.as_deref(), Some("cancelled"));
        }
    }

    #[tokio::test]
    async fn test_adaptive_reports_to_tracker() {
        let mux = Arc::new(MockMux::new());
        let tracker = Arc::new(RateLimitTracker::default());
        let mut config = fast_config();
        config.adaptive = true;
        let inj = PromptInjector::new(mux, tracker.clone(), config);
        let token = CancellationToken::new();

        inj.send_batch(&token, &[Target::new("dev:1", AgentType::Claude)], "hi")
            .await;

        let stats = tracker.stats(crate::agent::Provider::Anthropic);
        assert_eq!(stats.successes, 1);
    }

    #[test]
    fn test_template_fallback() {
        let registry = TemplateRegistry::default();
        assert_eq!(registry.get("review").name, "review");
        assert_eq!(registry.get("nonexistent").name, "default");
        assert_eq!(registry.get("default").render("do it"), "do it");
    }

    #[test]
    fn test_template_register_replaces() {
        let mut registry = TemplateRegistry::default();
        registry.register(PromptTemplate {
            name: "review".to_string(),
            body: "custom {task}".to_string(),
        });
        assert_eq!(registry.get("review").render("x"), "custom x");
        assert_eq!(registry.names().len(), 3);
    }
}
