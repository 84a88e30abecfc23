// Clippy configuration: enable pedantic but allow overly strict lints
#![allow(clippy::missing_errors_doc)] // Internal functions don't need # Errors docs
#![allow(clippy::missing_panics_doc)] // Internal functions don't need # Panics docs
#![allow(clippy::must_use_candidate)] // Not all getters need #[must_use]
#![allow(clippy::module_name_repetitions)] // e.g., RotationState in rotation module is fine
#![allow(clippy::too_many_lines)] // Some functions are naturally long
#![allow(clippy::cast_possible_truncation)] // We're careful with our casts
#![allow(clippy::cast_sign_loss)] // Timestamp conversions are safe
#![allow(clippy::cast_precision_loss)] // Duration to f64 precision loss is acceptable
#![allow(clippy::struct_excessive_bools)] // Config structs can have multiple bool fields

//! ntm - multi-agent tmux orchestrator for AI coding agents
//!
//! A single binary that watches agent panes, raises alerts, rotates
//! rate-limited accounts, delivers prompts, and executes declarative
//! workflows against a tmux session.
//!
//! Usage:
//!   ntm watch            # Surveillance loop with auto-rotation
//!   ntm status           # One-shot pane classification
//!   ntm run wf.yaml      # Execute a workflow

mod agent;
mod alerts;
mod cache;
mod cli;
mod config;
mod context_pack;
mod errors;
mod history;
mod inject;
mod metrics;
mod mux;
mod policy;
mod quota;
mod ratelimit;
mod rotation;
mod surveillance;
mod workflow;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent::{AgentType, Provider};
use alerts::AlertTracker;
use cli::{Cli, Commands};
use config::Config;
use context_pack::ContextPackBuilder;
use errors::NtmError;
use history::HistoryLog;
use inject::{PromptInjector, Target, TemplateRegistry};
use metrics::MetricsCollector;
use mux::{MuxDriver, TmuxDriver};
use quota::{CliQuotaFetcher, QuotaTracker};
use ratelimit::RateLimitTracker;
use rotation::{AccountRotator, CliAccountBackend};
use surveillance::{SurvEvent, SurveillanceLoop};
use workflow::runner::PaneStepRunner;
use workflow::{
    DryRunRunner, ExecutionState, ExecutorOptions, ProgressEvent, ProgressKind, RunStatus,
    StepRunner, Workflow, WorkflowExecutor,
};

/// Get the log directory path
fn get_log_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("/tmp/ntm/logs"),
        |dirs| dirs.cache_dir().join("ntm").join("logs"),
    )
}

/// Initialize tracing: env-filtered stderr plus daily-rolling file logs
fn init_tracing(log_level: &str) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = get_log_dir();
    let file_appender = tracing_appender::rolling::daily(log_dir, "ntm.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    guard
}

/// Resolve the session to operate on: explicit flag or the first one
fn resolve_session(driver: &dyn MuxDriver, session: Option<String>) -> errors::Result<String> {
    match session {
        Some(name) => Ok(name),
        None => {
            let sessions = driver.list_sessions()?;
            sessions.into_iter().next().ok_or(NtmError::NoSessions)
        }
    }
}

/// Print an error in the configured format and exit non-zero
fn bail_with(err: &NtmError, json: bool) -> ! {
    if json {
        println!("{}", err.to_json());
    } else {
        eprintln!("error: {err}");
        if let Some(hint) = err.hint() {
            eprintln!("hint: {hint}");
        }
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let _guard = init_tracing(&cli.log_level);

    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let config = match Config::load(&project_dir) {
        Ok(config) => config,
        Err(e) => bail_with(&e, cli.json),
    };

    let result = match cli.command {
        Commands::Watch { session } => cmd_watch(&project_dir, &config, session).await,
        Commands::Status { session } => cmd_status(&project_dir, &config, session, cli.json),
        Commands::Alerts { session } => cmd_alerts(&project_dir, &config, session, cli.json),
        Commands::Send {
            prompt,
            agents,
            template,
            session,
        } => cmd_send(&config, &prompt, agents.as_deref(), &template, session, cli.json).await,
        Commands::History { limit } => cmd_history(limit, cli.json),
        Commands::Run {
            workflow,
            dry_run,
            vars,
            session,
        } => cmd_run(&project_dir, &config, &workflow, dry_run, &vars, session, cli.json).await,
        Commands::Runs { run_id } => cmd_runs(&project_dir, &run_id, cli.json),
        Commands::Rotate {
            agent,
            account,
            pane,
        } => cmd_rotate(&config, &agent, account.as_deref(), &pane, cli.json).await,
        Commands::Quota { pane, provider } => {
            cmd_quota(&config, &pane, &provider, cli.json).await
        }
        Commands::Policy { command } => cmd_policy(&project_dir, &command, cli.json),
        Commands::Completions { shell } => {
            cli::print_completions(shell);
            Ok(())
        }
    };

    if let Err(e) = result {
        bail_with(&e, cli.json);
    }
    Ok(())
}

/// Long-running watcher: surveillance plus rotation and recovery wiring
async fn cmd_watch(
    project_dir: &std::path::Path,
    config: &Config,
    session: Option<String>,
) -> errors::Result<()> {
    let driver: Arc<dyn MuxDriver> = Arc::new(TmuxDriver);
    let session = resolve_session(driver.as_ref(), session)?;

    let alerts = Arc::new(AlertTracker::default());
    let ratelimit = Arc::new(RateLimitTracker::default());
    let injector = Arc::new(PromptInjector::new(
        Arc::clone(&driver),
        Arc::clone(&ratelimit),
        config.injector.clone(),
    ));
    let rotator = Arc::new(AccountRotator::new(
        Box::new(CliAccountBackend::new(config.rotation.backend_binary.clone())),
        Duration::from_secs(config.rotation.cooldown_secs),
    ));
    if config.rotation.persist_history {
        if let Some(dirs) = directories::BaseDirs::new() {
            if let Err(e) = rotator.enable_rotation_history(dirs.home_dir()) {
                tracing::warn!(error = %e, "Rotation history disabled");
            }
        }
    }
    let packs = Arc::new(ContextPackBuilder::new(Arc::clone(&driver)));

    // One quota poller per agent pane, torn down on shutdown
    let quota = Arc::new(QuotaTracker::with_timing(
        Arc::new(CliQuotaFetcher::new(
            config.rotation.backend_binary.clone(),
            Duration::from_secs(config::ACCOUNT_BACKEND_TIMEOUT_SECS),
        )),
        Duration::from_secs(config.quota.ttl_secs),
        Duration::from_secs(config.quota.poll_secs),
    ));

    let (tx, mut rx) = mpsc::channel::<SurvEvent>(64);
    let surveillance = Arc::new(SurveillanceLoop::new(
        Arc::clone(&driver),
        Arc::clone(&alerts),
        config.surveillance.clone(),
        session.clone(),
        project_dir.to_path_buf(),
        tx,
    ));

    let token = CancellationToken::new();
    let loop_token = token.clone();
    let loop_handle = {
        let surveillance = Arc::clone(&surveillance);
        tokio::spawn(async move { surveillance.run(loop_token).await })
    };

    for pane in driver.list_panes(&session)? {
        if let Some(provider) = pane.agent_type.provider() {
            quota.start_polling(&token, &pane.id, provider);
        }
    }

    tracing::info!(session = %session, "Watching session (ctrl-c to stop)");

    let consumer_token = token.clone();
    let project = project_dir.to_path_buf();
    let consumer_rotator = Arc::clone(&rotator);
    let consumer = tokio::spawn(async move {
        let rotator = consumer_rotator;
        loop {
            let event = tokio::select! {
                _ = consumer_token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                SurvEvent::LimitHit(hit) => match rotator.on_limit_hit(&hit).await {
                    Ok(record) => {
                        tracing::info!(
                            pane = %record.session_pane,
                            to = %record.to_account,
                            "Rotated account after rate limit"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(pane = %hit.session_pane, error = %e, "Rotation skipped");
                    }
                },
                SurvEvent::CompactionDetected {
                    session_pane,
                    agent_type,
                } => {
                    let request = context_pack::recovery_request(&project, &session_pane);
                    match packs.build(&request) {
                        Ok(pack) => {
                            let targets = [Target::new(session_pane.clone(), agent_type)];
                            let batch = injector
                                .send_batch(&CancellationToken::new(), &targets, &pack)
                                .await;
                            tracing::info!(
                                pane = %session_pane,
                                sent = batch.sent,
                                "Recovery context re-sent after compaction"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to build recovery pack");
                        }
                    }
                }
                SurvEvent::StatusChanged(status) => {
                    tracing::debug!(
                        pane = %status.pane_id,
                        state = status.state.as_str(),
                        "Status changed"
                    );
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.map_err(NtmError::Io)?;
    tracing::info!("Shutting down");
    quota.stop_all_polling();
    token.cancel();
    let _ = loop_handle.await;
    let _ = consumer.await;

    for agent_type in [AgentType::Claude, AgentType::Codex, AgentType::Gemini] {
        let stats = rotator.rotation_stats(agent_type);
        if stats.total_rotations > 0 {
            tracing::info!(
                agent = %agent_type,
                rotations = stats.total_rotations,
                panes = stats.unique_panes,
                avg_secs_between = stats.avg_secs_between,
                "Rotation summary"
            );
        }
    }
    Ok(())
}

/// Send a templated prompt to matching agent panes
async fn cmd_send(
    config: &Config,
    prompt: &str,
    agents: Option<&str>,
    template: &str,
    session: Option<String>,
    json: bool,
) -> errors::Result<()> {
    let driver: Arc<dyn MuxDriver> = Arc::new(TmuxDriver);
    let session = resolve_session(driver.as_ref(), session)?;

    let wanted: Option<Vec<AgentType>> = agents.map(|csv| {
        csv.split(',')
            .map(|s| AgentType::from_label(s.trim()))
            .collect()
    });
    let targets: Vec<Target> = driver
        .list_panes(&session)?
        .into_iter()
        .filter(|p| p.agent_type != AgentType::User)
        .filter(|p| {
            wanted
                .as_ref()
                .is_none_or(|types| types.contains(&p.agent_type))
        })
        .map(|p| Target::new(format!("{session}:{}", p.index), p.agent_type))
        .collect();
    if targets.is_empty() {
        return Err(NtmError::Validation {
            field: "agents".to_string(),
            message: format!("no matching agent panes in session '{session}'"),
        });
    }

    let registry = TemplateRegistry::default();
    let rendered = registry.get(template).render(prompt);

    let ratelimit = Arc::new(RateLimitTracker::default());
    let injector = PromptInjector::new(driver, ratelimit, config.injector.clone());
    let batch = injector
        .send_batch(&CancellationToken::new(), &targets, &rendered)
        .await;

    let history = HistoryLog::at_default_path();
    if let Err(e) = history.append(&serde_json::json!({
        "kind": "send",
        "session": session,
        "template": template,
        "targets": targets.len(),
        "sent": batch.sent,
        "failed": batch.failed,
        "at": chrono::Utc::now(),
    })) {
        tracing::warn!(error = %e, "Failed to append history entry");
    }

    if json {
        let results: Vec<serde_json::Value> = batch
            .results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "target": r.target,
                    "success": r.success,
                    "duration_ms": r.duration.as_millis() as u64,
                    "error": r.error,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!(
            "sent to {}/{} panes in {}ms",
            batch.sent,
            batch.sent + batch.failed,
            batch.total_duration.as_millis()
        );
    }
    Ok(())
}

/// Print recent history log entries
fn cmd_history(limit: usize, json: bool) -> errors::Result<()> {
    let log = HistoryLog::at_default_path();
    let entries: Vec<serde_json::Value> = log.read_all()?;
    let recent: Vec<&serde_json::Value> = entries.iter().rev().take(limit).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&recent)?);
    } else if recent.is_empty() {
        println!("history is empty");
    } else {
        for entry in recent.iter().rev() {
            println!("{entry}");
        }
    }
    Ok(())
}

/// One-shot scan printing classified pane states
fn cmd_status(
    project_dir: &std::path::Path,
    config: &Config,
    session: Option<String>,
    json: bool,
) -> errors::Result<()> {
    let driver: Arc<dyn MuxDriver> = Arc::new(TmuxDriver);
    let session = resolve_session(driver.as_ref(), session)?;

    let alerts = Arc::new(AlertTracker::default());
    let (tx, _rx) = mpsc::channel(64);
    let surveillance = SurveillanceLoop::new(
        driver,
        alerts,
        config.surveillance.clone(),
        session.clone(),
        project_dir.to_path_buf(),
        tx,
    );
    let statuses = surveillance.sweep()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else if statuses.is_empty() {
        println!("no agent panes in session '{session}'");
    } else {
        for status in statuses {
            let context = status
                .context_percent
                .map_or(String::new(), |p| format!(" (context {p}%)"));
            println!("{}  {}{}", status.pane_id, status.state.as_str(), context);
        }
    }
    Ok(())
}

/// One-shot scan printing the active alert set
fn cmd_alerts(
    project_dir: &std::path::Path,
    config: &Config,
    session: Option<String>,
    json: bool,
) -> errors::Result<()> {
    let driver: Arc<dyn MuxDriver> = Arc::new(TmuxDriver);
    let session = resolve_session(driver.as_ref(), session)?;

    let alerts = Arc::new(AlertTracker::default());
    let (tx, _rx) = mpsc::channel(64);
    let surveillance = SurveillanceLoop::new(
        driver,
        Arc::clone(&alerts),
        config.surveillance.clone(),
        session,
        project_dir.to_path_buf(),
        tx,
    );
    surveillance.sweep()?;

    let active = alerts.active();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "alerts": active,
                "summary": alerts.summary(),
            }))?
        );
    } else if active.is_empty() {
        println!("no active alerts");
    } else {
        for alert in &active {
            println!(
                "[{}] {} {} - {}",
                alert.severity, alert.id, alert.alert_type, alert.message
            );
        }
        let summary = alerts.summary();
        let mut counts: Vec<String> = summary
            .by_severity
            .iter()
            .map(|(severity, n)| format!("{n} {severity}"))
            .collect();
        counts.sort();
        println!("{} active ({})", summary.active_total, counts.join(", "));
    }
    Ok(())
}

/// Execute a workflow file
async fn cmd_run(
    project_dir: &std::path::Path,
    config: &Config,
    workflow_path: &std::path::Path,
    dry_run: bool,
    vars: &[String],
    session: Option<String>,
    json: bool,
) -> errors::Result<()> {
    let workflow = Workflow::parse_file(workflow_path)?;
    let overrides = cli::parse_var_overrides(vars)?;

    let options = ExecutorOptions {
        dry_run,
        default_step_timeout: Duration::from_secs(config.workflow.step_timeout_secs),
    };
    let metrics = Arc::new(MetricsCollector::new());
    let runner: Arc<dyn StepRunner> = if dry_run {
        Arc::new(DryRunRunner)
    } else {
        let driver: Arc<dyn MuxDriver> = Arc::new(TmuxDriver);
        let session = resolve_session(driver.as_ref(), session)?;
        let ratelimit = Arc::new(RateLimitTracker::default());
        let injector = Arc::new(PromptInjector::new(
            Arc::clone(&driver),
            ratelimit,
            config.injector.clone(),
        ));
        let policy = Arc::new(policy::load_policy(project_dir)?);
        Arc::new(PaneStepRunner::new(
            driver,
            injector,
            policy,
            Arc::clone(&metrics),
            session,
            Duration::from_secs(config.workflow.poll_secs),
        ))
    };

    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let step = event.step_id.as_deref().unwrap_or("-");
            match event.kind {
                ProgressKind::StepStart => println!("  ▸ {step}"),
                ProgressKind::StepComplete => println!("  ✓ {step}"),
                ProgressKind::StepFailed => println!("  ✗ {step}"),
                _ => {}
            }
        }
    });

    let executor =
        WorkflowExecutor::new(runner, project_dir.to_path_buf(), options).with_progress(tx);

    let token = CancellationToken::new();
    let cancel_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_token.cancel();
        }
    });

    let state = executor.execute(&workflow, &overrides, &token).await?;
    // The executor owns the progress sender; drop it so the printer
    // task sees the channel close and drains out.
    drop(executor);
    let _ = printer.await;

    let history = HistoryLog::at_default_path();
    if let Err(e) = history.append(&serde_json::json!({
        "kind": "run",
        "workflow": state.workflow_id,
        "run_id": state.run_id,
        "status": state.status,
        "steps": state.steps.len(),
        "at": chrono::Utc::now(),
    })) {
        tracing::warn!(error = %e, "Failed to append history entry");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!(
            "run {} finished: {:?} ({} steps)",
            state.run_id,
            state.status,
            state.steps.len()
        );
        if !dry_run {
            let report = metrics.generate_report();
            let stats = report
                .latency
                .get("workflow:step")
                .copied()
                .unwrap_or_default();
            if stats.count > 0 {
                println!(
                    "steps: {} runs, avg {:.0}ms, p95 {:.0}ms",
                    stats.count, stats.avg, stats.p95
                );
            }
        }
    }
    if state.status != RunStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}

/// Print a checkpointed run
fn cmd_runs(project_dir: &std::path::Path, run_id: &str, json: bool) -> errors::Result<()> {
    let state = ExecutionState::load(project_dir, run_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("run {} [{:?}] workflow={}", state.run_id, state.status, state.workflow_id);
        for (id, result) in &state.steps {
            println!("  {id}: {:?} (attempts {})", result.status, result.attempts);
        }
    }
    Ok(())
}

/// Manual account rotation
async fn cmd_rotate(
    config: &Config,
    agent: &str,
    account: Option<&str>,
    pane: &str,
    json: bool,
) -> errors::Result<()> {
    let agent_type = AgentType::from_label(agent);
    let rotator = AccountRotator::new(
        Box::new(CliAccountBackend::new(config.rotation.backend_binary.clone())),
        Duration::from_secs(config.rotation.cooldown_secs),
    );
    if config.rotation.persist_history {
        if let Some(dirs) = directories::BaseDirs::new() {
            rotator.enable_rotation_history(dirs.home_dir())?;
        }
    }

    let record = match account {
        Some(name) => rotator.switch_to_account(agent_type, pane, name).await?,
        None => rotator.switch_account(agent_type, pane).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("rotated {} -> {}", record.from_account, record.to_account);
    }
    Ok(())
}

/// One-shot quota query
async fn cmd_quota(config: &Config, pane: &str, provider: &str, json: bool) -> errors::Result<()> {
    let provider: Provider = provider
        .parse()
        .map_err(|e: String| NtmError::InvalidFlag(e))?;
    let fetcher = Arc::new(CliQuotaFetcher::new(
        config.rotation.backend_binary.clone(),
        Duration::from_secs(config::ACCOUNT_BACKEND_TIMEOUT_SECS),
    ));
    let tracker = QuotaTracker::new(fetcher);
    let info = tracker.query_quota(pane, provider).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!(
            "{} ({}): session {}% period {}% weekly {}%{}",
            info.account_id,
            info.provider,
            info.session_usage,
            info.period_usage,
            info.weekly_usage,
            if info.is_limited { " [LIMITED]" } else { "" }
        );
    }
    Ok(())
}

/// Check one command against the policy
fn cmd_policy(project_dir: &std::path::Path, command: &str, json: bool) -> errors::Result<()> {
    let matcher = policy::load_policy(project_dir)?;
    let decision = matcher.evaluate(command);

    if json {
        let (verdict, reason, slb) = match &decision {
            policy::Decision::Allowed => ("allowed", String::new(), false),
            policy::Decision::Blocked { reason, slb } => ("blocked", reason.clone(), *slb),
            policy::Decision::ApprovalRequired { reason, slb } => {
                ("approval_required", reason.clone(), *slb)
            }
        };
        println!(
            "{}",
            serde_json::json!({ "decision": verdict, "reason": reason, "slb": slb })
        );
    } else {
        match &decision {
            policy::Decision::Allowed => println!("allowed"),
            policy::Decision::Blocked { reason, .. } => println!("blocked: {reason}"),
            policy::Decision::ApprovalRequired { reason, .. } => {
                println!("approval required: {reason}");
            }
        }
    }
    if decision.is_blocked() {
        std::process::exit(2);
    }
    Ok(())
}
