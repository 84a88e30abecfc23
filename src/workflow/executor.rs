//! Workflow execution
//!
//! Ready-set DAG scheduler over a validated workflow. Every step list
//! is a container scheduled the same way: steps whose in-container
//! dependencies have all completed run concurrently. Parallel blocks
//! schedule their children as a nested container; loop blocks schedule
//! one container per item. Containers nest to any depth. Every step
//! transition is checkpointed atomically and mirrored to an optional
//! progress channel (non-blocking, dropped when unconsumed).

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::{NtmError, Result};
use crate::workflow::expr::ExprContext;
use crate::workflow::model::{OnError, Settings, Step, Workflow};
use crate::workflow::state::{ExecutionState, RunStatus, StepResult, StepStatus};

/// Progress event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    WorkflowStart,
    StepStart,
    StepComplete,
    StepFailed,
    WorkflowComplete,
    WorkflowFailed,
    WorkflowCancelled,
}

/// One progress event; ordering is causal within a run
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Executes one step's prompt against its agent
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run the step; returns its output text
    async fn run_step(&self, step_id: &str, agent: Option<&str>, prompt: &str) -> Result<String>;
}

/// Executor options
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Short-circuit every step to success without running it
    pub dry_run: bool,
    /// Per-step timeout when the workflow does not set one
    pub default_step_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            default_step_timeout: Duration::from_secs(600),
        }
    }
}

/// Outcome of one step's execution
#[derive(Debug, Clone)]
enum StepOutcome {
    Completed(String),
    Failed(String),
    Cancelled,
}

/// Aggregate outcome of one container's scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Result of running one container: status plus sibling outputs
struct ContainerResult {
    status: ContainerStatus,
    /// Outputs of completed steps, keyed by plain (unsuffixed) id
    outputs: HashMap<String, String>,
}

/// Everything a spawned step task needs, cloned per task
#[derive(Clone)]
struct TaskEnv {
    ctx: Arc<RunCtx>,
    runner: Arc<dyn StepRunner>,
    options: ExecutorOptions,
    settings: Settings,
    timeout: Duration,
    token: CancellationToken,
}

/// Shared run context: state under a lock, checkpointed on every change
struct RunCtx {
    state: Mutex<ExecutionState>,
    project_dir: PathBuf,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl RunCtx {
    fn emit(&self, kind: ProgressKind, step_id: Option<&str>, detail: Option<String>) {
        let Some(sender) = &self.progress else {
            return;
        };
        // Non-blocking by contract: no receiver (or a full buffer)
        // drops the event rather than stalling the run.
        let _ = sender.try_send(ProgressEvent {
            kind,
            step_id: step_id.map(str::to_string),
            timestamp: Utc::now(),
            detail,
        });
    }

    /// Mutate one step's result, checkpoint, and optionally emit
    fn transition<F>(&self, record_id: &str, kind: Option<ProgressKind>, f: F)
    where
        F: FnOnce(&mut StepResult),
    {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let result = state.steps.entry(record_id.to_string()).or_default();
            f(result);
            state.clone()
        };
        if let Err(e) = snapshot.save(&self.project_dir) {
            tracing::warn!(error = %e, "Checkpoint write failed");
        }
        if let Some(kind) = kind {
            self.emit(kind, Some(record_id), None);
        }
    }

    fn set_run_status(&self, status: RunStatus) {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.status = status;
            state.clone()
        };
        if let Err(e) = snapshot.save(&self.project_dir) {
            tracing::warn!(error = %e, "Checkpoint write failed");
        }
    }
}

/// DAG-driven workflow executor
pub struct WorkflowExecutor {
    runner: Arc<dyn StepRunner>,
    project_dir: PathBuf,
    options: ExecutorOptions,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl WorkflowExecutor {
    pub fn new(runner: Arc<dyn StepRunner>, project_dir: PathBuf, options: ExecutorOptions) -> Self {
        Self {
            runner,
            project_dir,
            options,
            progress: None,
        }
    }

    /// Attach a progress channel; events are dropped if not drained
    pub fn with_progress(mut self, sender: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Execute a workflow to completion, failure, or cancellation
    pub async fn execute(
        &self,
        workflow: &Workflow,
        overrides: &HashMap<String, serde_json::Value>,
        token: &CancellationToken,
    ) -> Result<ExecutionState> {
        workflow.validate()?;
        let variables = workflow.bind_variables(overrides)?;

        let mut state = ExecutionState::new(&workflow.name, variables.clone());
        register_steps(&mut state, &workflow.steps);
        state.status = RunStatus::Running;
        state.save(&self.project_dir)?;
        let run_id = state.run_id.clone();

        let ctx = Arc::new(RunCtx {
            state: Mutex::new(state),
            project_dir: self.project_dir.clone(),
            progress: self.progress.clone(),
        });
        ctx.emit(ProgressKind::WorkflowStart, None, Some(workflow.name.clone()));
        tracing::info!(
            run_id = %run_id,
            workflow = %workflow.name,
            dry_run = self.options.dry_run,
            "Workflow started"
        );

        let timeout = workflow
            .settings
            .timeout
            .map_or(self.options.default_step_timeout, Duration::from_secs);
        let env = TaskEnv {
            ctx: Arc::clone(&ctx),
            runner: Arc::clone(&self.runner),
            options: self.options.clone(),
            settings: workflow.settings.clone(),
            timeout,
            token: token.clone(),
        };
        let base_scope = ExprContext {
            vars: variables.into_iter().collect(),
            step_outputs: HashMap::new(),
            loop_vars: HashMap::new(),
        };

        let result = run_container(&env, &workflow.steps, &base_scope, "").await;
        let outcome_status = match result.status {
            ContainerStatus::Completed => RunStatus::Completed,
            ContainerStatus::Failed => RunStatus::Failed,
            ContainerStatus::Cancelled => RunStatus::Cancelled,
        };

        ctx.set_run_status(outcome_status);
        let kind = match outcome_status {
            RunStatus::Completed => ProgressKind::WorkflowComplete,
            RunStatus::Cancelled => ProgressKind::WorkflowCancelled,
            _ => ProgressKind::WorkflowFailed,
        };
        ctx.emit(kind, None, None);
        tracing::info!(run_id = %run_id, status = ?outcome_status, "Workflow finished");

        let state = ctx.state.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(state)
    }
}

/// Register a container's steps (and parallel children) as pending
fn register_steps(state: &mut ExecutionState, steps: &[Step]) {
    for step in steps {
        state.steps.insert(step.id.clone(), StepResult::default());
        if let Some(children) = &step.parallel {
            register_steps(state, children);
        }
        // Loop children are registered per-iteration once the item
        // list is known.
    }
}

/// Ready-set scheduling over one step list
///
/// A step becomes ready when every id it depends on has completed in
/// this container. Completed siblings' outputs extend the scope handed
/// to later steps, so `${steps.X.output}` resolves within a container.
/// `suffix` tags record ids with the enclosing loop iterations
/// (e.g. `[2]`), composing across nesting levels.
async fn run_container(
    env: &TaskEnv,
    steps: &[Step],
    base_scope: &ExprContext,
    suffix: &str,
) -> ContainerResult {
    let mut pending: Vec<Step> = steps.to_vec();
    let mut completed: HashSet<String> = HashSet::new();
    let mut outputs: HashMap<String, String> = HashMap::new();
    let mut any_failed = false;
    let mut any_cancelled = false;
    let mut abort = false;
    let mut tasks: JoinSet<(String, StepOutcome)> = JoinSet::new();

    loop {
        // Launch every step whose dependencies are all completed
        if !abort && !env.token.is_cancelled() {
            let mut i = 0;
            while i < pending.len() {
                let deps_met = pending[i].depends_on.iter().all(|d| completed.contains(d));
                if !deps_met {
                    i += 1;
                    continue;
                }
                let step = pending.remove(i);
                let mut scope = base_scope.clone();
                scope
                    .step_outputs
                    .extend(outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
                let record_id = format!("{}{suffix}", step.id);
                let env = env.clone();
                env.ctx
                    .transition(&record_id, None, |r| r.status = StepStatus::Queued);
                tasks.spawn(async move {
                    let plain_id = step.id.clone();
                    let outcome = run_step_tree(&env, &step, &record_id, scope).await;
                    (plain_id, outcome)
                });
            }
        }

        if tasks.is_empty() {
            break;
        }

        let joined = if env.token.is_cancelled() {
            // Children observe the token themselves; just drain them.
            tasks.join_next().await
        } else {
            tokio::select! {
                joined = tasks.join_next() => joined,
                // Wake up so the next iteration stops scheduling
                _ = env.token.cancelled() => continue,
            }
        };
        let Some(joined) = joined else {
            break;
        };

        let (step_id, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "Step task panicked");
                any_failed = true;
                abort = true;
                continue;
            }
        };

        match outcome {
            StepOutcome::Completed(output) => {
                outputs.insert(step_id.clone(), output);
                completed.insert(step_id);
            }
            StepOutcome::Failed(error) => {
                any_failed = true;
                tracing::warn!(step = %step_id, error = %error, "Step failed");
                if env.settings.on_error != OnError::Continue {
                    abort = true;
                }
            }
            StepOutcome::Cancelled => {
                any_cancelled = true;
            }
        }
    }

    let status = if env.token.is_cancelled() || any_cancelled {
        ContainerStatus::Cancelled
    } else if any_failed {
        ContainerStatus::Failed
    } else {
        ContainerStatus::Completed
    };
    ContainerResult { status, outputs }
}

/// Execute one step, dispatching on its body kind
///
/// Boxed because containers recurse: a parallel child may itself hold
/// a loop whose body holds another parallel block.
fn run_step_tree<'a>(
    env: &'a TaskEnv,
    step: &'a Step,
    record_id: &'a str,
    scope: ExprContext,
) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>> {
    Box::pin(async move {
        if step.parallel.is_some() {
            return run_parallel(env, step, record_id, scope).await;
        }
        if step.loop_spec.is_some() {
            return run_loop(env, step, record_id, scope).await;
        }
        run_prompt_step(env, step, record_id, &scope).await
    })
}

/// The iteration suffix a parent passes down to its children
fn child_suffix<'a>(parent: &Step, record_id: &'a str) -> &'a str {
    record_id.strip_prefix(parent.id.as_str()).unwrap_or("")
}

/// Run a prompt step with retries under the effective error policy
async fn run_prompt_step(
    env: &TaskEnv,
    step: &Step,
    record_id: &str,
    scope: &ExprContext,
) -> StepOutcome {
    let retry_enabled = step.on_error.unwrap_or(env.settings.on_error) == OnError::Retry;
    let max_attempts = if retry_enabled { 1 + step.retry_count } else { 1 };

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let first = attempts == 1;
        env.ctx
            .transition(record_id, first.then_some(ProgressKind::StepStart), |r| {
                r.status = StepStatus::Running;
                r.attempts = attempts;
                if r.started_at.is_none() {
                    r.started_at = Some(Utc::now());
                }
            });

        let prompt = match step
            .prompt
            .as_deref()
            .map_or(Ok(String::new()), |p| scope.render(p))
        {
            Ok(prompt) => prompt,
            Err(e) => {
                let message = e.to_string();
                env.ctx
                    .transition(record_id, Some(ProgressKind::StepFailed), |r| {
                        r.status = StepStatus::Failed;
                        r.finished_at = Some(Utc::now());
                        r.error = Some(message.clone());
                    });
                return StepOutcome::Failed(message);
            }
        };

        if env.options.dry_run {
            // Dry runs pass through the full lifecycle with a
            // short-circuited success.
            env.ctx
                .transition(record_id, Some(ProgressKind::StepComplete), |r| {
                    r.status = StepStatus::Completed;
                    r.finished_at = Some(Utc::now());
                    r.output = Some(String::new());
                });
            return StepOutcome::Completed(String::new());
        }

        let attempt = tokio::select! {
            _ = env.token.cancelled() => {
                env.ctx.transition(record_id, None, |r| {
                    r.status = StepStatus::Cancelled;
                    r.finished_at = Some(Utc::now());
                });
                return StepOutcome::Cancelled;
            }
            result = tokio::time::timeout(
                env.timeout,
                env.runner.run_step(record_id, step.agent.as_deref(), &prompt),
            ) => match result {
                Ok(inner) => inner,
                Err(_) => Err(NtmError::Timeout {
                    operation: format!("step '{record_id}'"),
                    seconds: env.timeout.as_secs(),
                }),
            },
        };

        match attempt {
            Ok(output) => {
                env.ctx
                    .transition(record_id, Some(ProgressKind::StepComplete), |r| {
                        r.status = StepStatus::Completed;
                        r.finished_at = Some(Utc::now());
                        r.output = Some(output.clone());
                    });
                return StepOutcome::Completed(output);
            }
            Err(e) => {
                let message = e.to_string();
                if attempts < max_attempts {
                    tracing::info!(
                        step = %record_id,
                        attempt = attempts,
                        error = %message,
                        "Step failed, retrying"
                    );
                    continue;
                }
                env.ctx
                    .transition(record_id, Some(ProgressKind::StepFailed), |r| {
                        r.status = StepStatus::Failed;
                        r.finished_at = Some(Utc::now());
                        r.error = Some(message.clone());
                    });
                return StepOutcome::Failed(message);
            }
        }
    }
}

/// Run a parallel block: children as one nested container
async fn run_parallel(
    env: &TaskEnv,
    parent: &Step,
    record_id: &str,
    scope: ExprContext,
) -> StepOutcome {
    let Some(children) = &parent.parallel else {
        return StepOutcome::Failed("parallel step without children".to_string());
    };

    env.ctx
        .transition(record_id, Some(ProgressKind::StepStart), |r| {
            r.status = StepStatus::Running;
            r.started_at = Some(Utc::now());
            r.attempts = 1;
        });

    let suffix = child_suffix(parent, record_id);
    let result = run_container(env, children, &scope, suffix).await;

    match result.status {
        ContainerStatus::Cancelled => {
            env.ctx.transition(record_id, None, |r| {
                r.status = StepStatus::Cancelled;
                r.finished_at = Some(Utc::now());
            });
            StepOutcome::Cancelled
        }
        ContainerStatus::Failed => {
            let message = "one or more parallel children failed".to_string();
            env.ctx
                .transition(record_id, Some(ProgressKind::StepFailed), |r| {
                    r.status = StepStatus::Failed;
                    r.finished_at = Some(Utc::now());
                    r.error = Some(message.clone());
                });
            StepOutcome::Failed(message)
        }
        ContainerStatus::Completed => {
            env.ctx
                .transition(record_id, Some(ProgressKind::StepComplete), |r| {
                    r.status = StepStatus::Completed;
                    r.finished_at = Some(Utc::now());
                    r.output = Some(String::new());
                });
            StepOutcome::Completed(String::new())
        }
    }
}

/// Run a loop block: one independent container per item
async fn run_loop(
    env: &TaskEnv,
    parent: &Step,
    record_id: &str,
    scope: ExprContext,
) -> StepOutcome {
    let Some(spec) = &parent.loop_spec else {
        return StepOutcome::Failed("loop step without a loop body".to_string());
    };

    env.ctx
        .transition(record_id, Some(ProgressKind::StepStart), |r| {
            r.status = StepStatus::Running;
            r.started_at = Some(Utc::now());
            r.attempts = 1;
        });

    let items = match scope.evaluate_items(&spec.items) {
        Ok(items) => items,
        Err(e) => {
            let message = e.to_string();
            env.ctx
                .transition(record_id, Some(ProgressKind::StepFailed), |r| {
                    r.status = StepStatus::Failed;
                    r.finished_at = Some(Utc::now());
                    r.error = Some(message.clone());
                });
            return StepOutcome::Failed(message);
        }
    };

    let suffix = child_suffix(parent, record_id);
    // An iteration's output is its final step's output (document order)
    let last_id = spec.steps.last().map(|s| s.id.clone()).unwrap_or_default();

    let mut tasks: JoinSet<(usize, ContainerStatus, String)> = JoinSet::new();
    for (index, item) in items.iter().enumerate() {
        let env = env.clone();
        let steps = spec.steps.clone();
        let iter_scope = scope.with_loop_binding(&spec.bind, item.clone());
        let iter_suffix = format!("{suffix}[{index}]");
        let last_id = last_id.clone();
        tasks.spawn(async move {
            let result = run_container(&env, &steps, &iter_scope, &iter_suffix).await;
            let output = result.outputs.get(&last_id).cloned().unwrap_or_default();
            (index, result.status, output)
        });
    }

    let mut outputs: Vec<Option<String>> = vec![None; items.len()];
    let mut failed = false;
    let mut cancelled = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, ContainerStatus::Completed, output)) => outputs[index] = Some(output),
            Ok((_, ContainerStatus::Failed, _)) => failed = true,
            Ok((_, ContainerStatus::Cancelled, _)) => cancelled = true,
            Err(e) => {
                tracing::error!(error = %e, "Loop iteration panicked");
                failed = true;
            }
        }
    }

    if cancelled {
        env.ctx.transition(record_id, None, |r| {
            r.status = StepStatus::Cancelled;
            r.finished_at = Some(Utc::now());
        });
        return StepOutcome::Cancelled;
    }
    if failed {
        let message = "one or more loop iterations failed".to_string();
        env.ctx
            .transition(record_id, Some(ProgressKind::StepFailed), |r| {
                r.status = StepStatus::Failed;
                r.finished_at = Some(Utc::now());
                r.error = Some(message.clone());
            });
        return StepOutcome::Failed(message);
    }

    let output = serde_json::to_string(
        &outputs
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect::<Vec<String>>(),
    )
    .unwrap_or_default();
    env.ctx
        .transition(record_id, Some(ProgressKind::StepComplete), |r| {
            r.status = StepStatus::Completed;
            r.finished_at = Some(Utc::now());
            r.output = Some(output.clone());
        });
    StepOutcome::Completed(output)
}

/// Runner used for dry runs and validation passes
pub struct DryRunRunner;

#[async_trait]
impl StepRunner for DryRunRunner {
    async fn run_step(&self, _step_id: &str, _agent: Option<&str>, _prompt: &str) -> Result<String> {
        Ok(String::new())
    }
}
