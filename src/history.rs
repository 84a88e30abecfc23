//! Append-only history log
//!
//! JSON-lines file at `${XDG_DATA_HOME:-~/.local/share}/ntm/history.jsonl`.
//! One JSON object per line; malformed lines are skipped on read so a
//! torn write never poisons the whole log. Also home to the atomic
//! file-replace helper used by every persisted JSON file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::MAX_HISTORY_LINE_BYTES;
use crate::errors::{NtmError, Result};

/// Replace a file's contents atomically: temp file, fsync, rename
///
/// A reader never observes a half-written file; a crash leaves either
/// the old contents or the new.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Default history log path under the XDG data dir
pub fn default_history_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("ntm").join("history.jsonl");
        }
    }
    directories::BaseDirs::new().map_or_else(
        || {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home)
                .join(".local")
                .join("share")
                .join("ntm")
                .join("history.jsonl")
        },
        |dirs| dirs.data_dir().join("ntm").join("history.jsonl"),
    )
}

/// Append-only JSONL log
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn at_default_path() -> Self {
        Self::new(default_history_path())
    }

    #[allow(dead_code)] // Log location for diagnostics
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single JSON line
    ///
    /// Entries serializing over the line cap are rejected rather than
    /// written, keeping the log readable by capped readers.
    pub fn append<T: Serialize>(&self, entry: &T) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        if line.len() > MAX_HISTORY_LINE_BYTES {
            return Err(NtmError::Validation {
                field: "entry".to_string(),
                message: format!("history line exceeds {} bytes", MAX_HISTORY_LINE_BYTES),
            });
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read all well-formed entries; malformed and oversize lines are skipped
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            if line.len() > MAX_HISTORY_LINE_BYTES {
                tracing::warn!(line = i + 1, "Skipping oversize history line");
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(line = i + 1, error = %e, "Skipping malformed history line");
                }
            }
        }
        Ok(entries)
    }
}
