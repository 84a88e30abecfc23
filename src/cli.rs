//! CLI argument parsing
//!
//! Uses clap for argument parsing with derive macros. The binary is
//! both the long-running watcher (`ntm watch`) and a set of one-shot
//! operations (status, run, rotate, quota, alerts, policy).

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

/// Multi-agent tmux orchestrator for AI coding agents
#[derive(Parser, Debug)]
#[command(name = "ntm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project directory (default: current directory)
    #[arg(short, long, env = "NTM_PROJECT_DIR", global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Emit JSON instead of human-readable output
    #[arg(long, default_value_t = false, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch a session: surveillance loop, alerts, auto-rotation
    Watch {
        /// Session to watch (default: first session)
        session: Option<String>,
    },

    /// One-shot scan of a session's agent panes
    Status {
        /// Session to scan (default: first session)
        session: Option<String>,
    },

    /// Show active alerts from a one-shot scan
    Alerts {
        /// Session to scan (default: first session)
        session: Option<String>,
    },

    /// Send a prompt to agent panes
    Send {
        /// The prompt text (substituted into the template's {task})
        prompt: String,

        /// Comma-separated agent types to target (default: all agents)
        #[arg(short, long)]
        agents: Option<String>,

        /// Prompt template name (default, review, test)
        #[arg(short, long, default_value = "default")]
        template: String,

        /// Session whose panes receive the prompt
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Show recent history log entries
    History {
        /// Maximum entries to print
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Execute a workflow file
    Run {
        /// Workflow document (YAML or TOML)
        workflow: PathBuf,

        /// Validate and walk the DAG without touching any pane
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Variable overrides as key=value (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Session whose panes receive step prompts
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Inspect a checkpointed run by its run id
    Runs {
        /// Run id (file name under .ntm/runs/ without extension)
        run_id: String,
    },

    /// Rotate the account for an agent type
    Rotate {
        /// Agent type (claude, codex, gemini)
        agent: String,

        /// Switch to this named account instead of the next one
        #[arg(long)]
        account: Option<String>,

        /// Session:pane the rotation is recorded against
        #[arg(long, default_value = "manual:0")]
        pane: String,
    },

    /// Query provider usage for a pane
    Quota {
        /// Pane id (e.g. "%1")
        pane: String,

        /// Provider (anthropic, openai, google)
        #[arg(default_value = "anthropic")]
        provider: String,
    },

    /// Check a command against the policy file
    Policy {
        /// The command line to evaluate
        command: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse repeated `key=value` overrides into JSON values
///
/// Values that parse as JSON (numbers, bools, arrays) are taken
/// structurally; everything else is a string.
pub fn parse_var_overrides(
    pairs: &[String],
) -> Result<std::collections::HashMap<String, serde_json::Value>, crate::errors::NtmError> {
    let mut overrides = std::collections::HashMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            return Err(crate::errors::NtmError::InvalidFlag(format!(
                "--var '{pair}' is not key=value"
            )));
        };
        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        overrides.insert(key.to_string(), value);
    }
    Ok(overrides)
}

/// Generate shell completions and print to stdout
pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "ntm", &mut io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_overrides() {
        let pairs = vec![
            "target=release".to_string(),
            "count=3".to_string(),
            "flag=true".to_string(),
            "files=[\"a\",\"b\"]".to_string(),
        ];
        let overrides = parse_var_overrides(&pairs).unwrap();
        assert_eq!(overrides["target"], serde_json::json!("release"));
        assert_eq!(overrides["count"], serde_json::json!(3));
        assert_eq!(overrides["flag"], serde_json::json!(true));
        assert_eq!(overrides["files"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_parse_var_overrides_rejects_bare_key() {
        let err = parse_var_overrides(&["oops".to_string()]).unwrap_err();
        assert_eq!(err.code(), Some("INVALID_FLAG"));
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "ntm", "run", "wf.yaml", "--dry-run", "--var", "a=1", "--var", "b=x",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { dry_run, vars, .. } => {
                assert!(dry_run);
                assert_eq!(vars.len(), 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
