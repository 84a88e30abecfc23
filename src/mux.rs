//! Terminal multiplexer driver
//!
//! Narrow interface over tmux used by the rest of the orchestrator:
//! - Listing sessions and panes
//! - Sending keystrokes to agents (text and Enter are separate sends)
//! - Capturing pane output for the surveillance loop
//!
//! Key tmux quirks:
//! - Enter must be a separate argument to send-keys
//! - `-l` sends text literally so prompts are not interpreted as key names
//! - capture-pane with a negative `-S` reads the last N lines

use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::agent::AgentType;
use crate::config::MAX_CAPTURE_BYTES;
use crate::errors::{NtmError, Result};

/// Snapshot of one multiplexer pane
///
/// Created by the driver on each listing; never mutated by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pane {
    /// Pane identifier (e.g. "%3")
    pub id: String,
    /// Index within the window
    pub index: String,
    /// Pane title
    pub title: String,
    /// Agent CLI running in the pane
    pub agent_type: AgentType,
    /// Model variant, when the title carries one (e.g. "claude:opus")
    pub variant: Option<String>,
    pub width: u16,
    pub height: u16,
    /// Foreground command
    pub command: String,
    pub active: bool,
}

/// Operations the core needs from a terminal multiplexer
///
/// Implemented by `TmuxDriver` for real sessions and by `MockMux` in
/// tests. Text and Enter are separate operations so the injector can
/// control submission timing.
pub trait MuxDriver: Send + Sync {
    /// List sessions by name
    fn list_sessions(&self) -> Result<Vec<String>>;

    /// List panes of a session
    fn list_panes(&self, session: &str) -> Result<Vec<Pane>>;

    /// Send literal text to a target without pressing Enter
    fn send_text(&self, target: &str, text: &str) -> Result<()>;

    /// Press Enter on a target
    fn send_enter(&self, target: &str) -> Result<()>;

    /// Capture the last `lines` lines of a target's output
    fn capture_tail(&self, target: &str, lines: usize) -> Result<String>;

    /// Whether the pane exists and its process is alive
    fn is_pane_alive(&self, target: &str) -> Result<bool>;
}

/// Driver shelling out to the tmux CLI
pub struct TmuxDriver;

impl TmuxDriver {
    fn run(args: &[&str]) -> Result<std::process::Output> {
        let output = Command::new("tmux").args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NtmError::ToolUnavailable("tmux".to_string())
            } else {
                NtmError::Io(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // tmux reports "no server running" when there are no sessions
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Err(NtmError::NoSessions);
            }
            return Err(NtmError::Io(std::io::Error::other(format!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ))));
        }

        Ok(output)
    }
}

/// Format string handed to `tmux list-panes -F`
const PANE_FORMAT: &str =
    "#{pane_id}\t#{pane_index}\t#{pane_title}\t#{pane_width}\t#{pane_height}\t#{pane_current_command}\t#{pane_active}";

/// Parse one `list-panes` output line into a Pane
fn parse_pane_line(line: &str) -> Option<Pane> {
    let mut fields = line.split('\t');
    let id = fields.next()?.to_string();
    let index = fields.next()?.to_string();
    let title = fields.next()?.to_string();
    let width = fields.next()?.parse().ok()?;
    let height = fields.next()?.parse().ok()?;
    let command = fields.next()?.to_string();
    let active = fields.next()? == "1";

    // Title prefix wins over the foreground command: a Claude pane shows
    // "node" as its command but carries the agent in its title.
    let mut agent_type = AgentType::from_label(&title);
    if agent_type == AgentType::User {
        agent_type = AgentType::from_label(&command);
    }

    // "claude:opus" style titles carry the model variant after a colon
    let variant = title
        .split_once(':')
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty());

    Some(Pane {
        id,
        index,
        title,
        agent_type,
        variant,
        width,
        height,
        command,
        active,
    })
}

impl MuxDriver for TmuxDriver {
    fn list_sessions(&self) -> Result<Vec<String>> {
        let output = Self::run(&["list-sessions", "-F", "#{session_name}"])?;
        let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(NtmError::NoSessions);
        }
        Ok(names)
    }

    fn list_panes(&self, session: &str) -> Result<Vec<Pane>> {
        let output = Self::run(&["list-panes", "-s", "-t", session, "-F", PANE_FORMAT])?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_pane_line)
            .collect())
    }

    fn send_text(&self, target: &str, text: &str) -> Result<()> {
        Self::run(&["send-keys", "-t", target, "-l", text])?;
        tracing::debug!(target = %target, len = text.len(), "Sent text to pane");
        Ok(())
    }

    fn send_enter(&self, target: &str) -> Result<()> {
        Self::run(&["send-keys", "-t", target, "Enter"])?;
        Ok(())
    }

    fn capture_tail(&self, target: &str, lines: usize) -> Result<String> {
        let start_line = format!("-{lines}");
        let output = Self::run(&["capture-pane", "-t", target, "-p", "-S", &start_line])?;

        if output.stdout.len() > MAX_CAPTURE_BYTES {
            return Err(NtmError::Io(std::io::Error::other(format!(
                "pane capture exceeded {} bytes",
                MAX_CAPTURE_BYTES
            ))));
        }

        match String::from_utf8(output.stdout.clone()) {
            Ok(s) => Ok(s),
            Err(_) => {
                tracing::warn!(target = %target, "Non-UTF-8 pane output, using lossy conversion");
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
        }
    }

    fn is_pane_alive(&self, target: &str) -> Result<bool> {
        let output = Self::run(&["display-message", "-t", target, "-p", "#{pane_dead}"])?;
        let result = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // pane_dead returns "0" if alive, "1" if dead
        Ok(result != "1")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pane_line() {
        let line = "%3\t1\tclaude:opus\t120\t40\tnode\t1";
        let pane = parse_pane_line(line).unwrap();
        assert_eq!(pane.id, "%3");
        assert_eq!(pane.agent_type, AgentType::Claude);
        assert_eq!(pane.variant.as_deref(), Some("opus"));
        assert!(pane.active);
    }

    #[test]
    fn test_parse_pane_line_falls_back_to_command() {
        let line = "%0\t0\tzsh\t80\t24\tcodex\t0";
        let pane = parse_pane_line(line).unwrap();
        assert_eq!(pane.agent_type, AgentType::Codex);
        assert!(pane.variant.is_none());
    }

    #[test]
    fn test_parse_pane_line_malformed() {
        assert!(parse_pane_line("%3\tonly-two").is_none());
        assert!(parse_pane_line("").is_none());
    }
}
