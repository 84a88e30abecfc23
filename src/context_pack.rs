//! Context pack assembly
//!
//! Builds a prompt from ordered sources (brief files, recent pane
//! output, git status, inline text) under an approximate token budget.
//! Earlier sources have priority: when the budget runs out the current
//! section is truncated with a marker and later sections are dropped.
//! Assembled packs are cached briefly so compaction recovery for many
//! panes does not redo the same file reads.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::cache::Cache;
use crate::errors::Result;
use crate::mux::MuxDriver;

/// Default token budget for a pack
pub const DEFAULT_BUDGET_TOKENS: usize = 4000;

/// How long an assembled pack stays cached
pub const PACK_CACHE_TTL: Duration = Duration::from_secs(30);

/// One ordered source feeding the pack
#[derive(Debug, Clone, Serialize)]
pub enum ContextSource {
    /// A file's contents, titled with its path
    File { path: PathBuf },
    /// The tail of a pane's output
    PaneOutput { pane_id: String, lines: usize },
    /// `git status --short` for a directory
    GitStatus { dir: PathBuf },
    /// Inline text with a caller-chosen title
    Text { title: String, body: String },
}

/// A pack request: ordered sources plus a budget
#[derive(Debug, Clone, Serialize)]
pub struct PackRequest {
    pub sources: Vec<ContextSource>,
    pub budget_tokens: usize,
}

impl PackRequest {
    pub fn new(sources: Vec<ContextSource>) -> Self {
        Self {
            sources,
            budget_tokens: DEFAULT_BUDGET_TOKENS,
        }
    }

    #[allow(dead_code)] // Caller-tuned budgets; exercised in tests
    pub fn with_budget(mut self, budget_tokens: usize) -> Self {
        self.budget_tokens = budget_tokens;
        self
    }
}

/// Rough token estimate: four characters per token
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Truncation marker appended to a cut section
const TRUNCATION_MARKER: &str = "\n[... truncated to fit context budget]";

/// Token-budgeted prompt assembler
pub struct ContextPackBuilder {
    driver: Arc<dyn MuxDriver>,
    cache: Cache<String, String>,
}

impl ContextPackBuilder {
    /// Create a builder; must run inside a tokio runtime (cache eviction)
    pub fn new(driver: Arc<dyn MuxDriver>) -> Self {
        Self {
            driver,
            cache: Cache::new(crate::cache::DEFAULT_EVICTION_INTERVAL),
        }
    }

    /// Assemble the pack, serving repeats from cache
    pub fn build(&self, request: &PackRequest) -> Result<String> {
        let key = cache_key(request);
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!("Context pack served from cache");
            return Ok(cached);
        }

        let mut remaining = request.budget_tokens;
        let mut out = String::new();

        for source in &request.sources {
            if remaining == 0 {
                tracing::debug!("Context budget exhausted, dropping remaining sources");
                break;
            }

            let (title, body) = match self.render(source) {
                Ok(section) => section,
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unavailable context source");
                    continue;
                }
            };
            if body.trim().is_empty() {
                continue;
            }

            let section = format!("## {title}\n\n{body}\n\n");
            let cost = estimate_tokens(&section);
            if cost <= remaining {
                out.push_str(&section);
                remaining -= cost;
            } else {
                // Cut the body to the remaining budget and stop
                let keep_chars = remaining.saturating_mul(4);
                let truncated: String = section.chars().take(keep_chars).collect();
                out.push_str(&truncated);
                out.push_str(TRUNCATION_MARKER);
                out.push('\n');
                remaining = 0;
            }
        }

        self.cache.insert(key, out.clone(), PACK_CACHE_TTL);
        Ok(out)
    }

    fn render(&self, source: &ContextSource) -> Result<(String, String)> {
        match source {
            ContextSource::File { path } => {
                let body = std::fs::read_to_string(path)?;
                Ok((path.display().to_string(), body))
            }
            ContextSource::PaneOutput { pane_id, lines } => {
                let raw = self.driver.capture_tail(pane_id, *lines)?;
                let body = crate::surveillance::strip_ansi(&raw);
                Ok((format!("Recent output ({pane_id})"), body))
            }
            ContextSource::GitStatus { dir } => {
                let output = Command::new("git")
                    .args(["-C", &dir.display().to_string(), "status", "--short"])
                    .output()?;
                let body = String::from_utf8_lossy(&output.stdout).into_owned();
                Ok(("Git status".to_string(), body))
            }
            ContextSource::Text { title, body } => Ok((title.clone(), body.clone())),
        }
    }

    /// Stop the cache's eviction task
    pub fn close(&self) {
        self.cache.close();
    }
}

fn cache_key(request: &PackRequest) -> String {
    let serialized = serde_json::to_vec(request).unwrap_or_default();
    let digest = Sha256::digest(&serialized);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Standard recovery pack sent to a pane after compaction
pub fn recovery_request(project_dir: &std::path::Path, pane_id: &str) -> PackRequest {
    PackRequest::new(vec![
        ContextSource::Text {
            title: "Recovery".to_string(),
            body: "Your context was compacted. The sections below restore the working state; \
                   continue the task you were on."
                .to_string(),
        },
        ContextSource::File {
            path: project_dir.join(".ntm").join("brief.md"),
        },
        ContextSource::GitStatus {
            dir: project_dir.to_path_buf(),
        },
        ContextSource::PaneOutput {
            pane_id: pane_id.to_string(),
            lines: 100,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::testing::MockMux;

    fn text_source(title: &str, chars: usize) -> ContextSource {
        ContextSource::Text {
            title: title.to_string(),
            body: "x".repeat(chars),
        }
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_sections_in_order() {
        let builder = ContextPackBuilder::new(Arc::new(MockMux::new()));
        let request = PackRequest::new(vec![
            text_source("first", 40),
            text_source("second", 40),
        ]);

        let pack = builder.build(&request).unwrap();
        let first = pack.find("## first").unwrap();
        let second = pack.find("## second").unwrap();
        assert!(first < second);
        builder.close();
    }

    #[tokio::test]
    async fn test_budget_truncates_and_drops() {
        let builder = ContextPackBuilder::new(Arc::new(MockMux::new()));
        let request = PackRequest::new(vec![
            text_source("kept", 100),
            text_source("cut", 4000),
            text_source("dropped", 100),
        ])
        .with_budget(200);

        let pack = builder.build(&request).unwrap();
        assert!(pack.contains("## kept"));
        assert!(pack.contains("truncated to fit"));
        assert!(!pack.contains("## dropped"));
        // The whole pack respects the budget (plus the marker)
        assert!(estimate_tokens(&pack) <= 200 + estimate_tokens(TRUNCATION_MARKER) + 1);
        builder.close();
    }

    #[tokio::test]
    async fn test_missing_file_skipped() {
        let builder = ContextPackBuilder::new(Arc::new(MockMux::new()));
        let request = PackRequest::new(vec![
            ContextSource::File {
                path: PathBuf::from("/nonexistent/ntm-brief.md"),
            },
            text_source("present", 40),
        ]);

        let pack = builder.build(&request).unwrap();
        assert!(pack.contains("## present"));
        builder.close();
    }

    #[tokio::test]
    async fn test_pane_output_stripped() {
        let mux = Arc::new(MockMux::new());
        mux.set_capture("%1", "\u{1b}[32mok\u{1b}[0m done");
        let builder = ContextPackBuilder::new(mux);

        let request = PackRequest::new(vec![ContextSource::PaneOutput {
            pane_id: "%1".to_string(),
            lines: 10,
        }]);
        let pack = builder.build(&request).unwrap();
        assert!(pack.contains("ok done"));
        assert!(!pack.contains('\u{1b}'));
        builder.close();
    }

    #[tokio::test]
    async fn test_cache_serves_repeat() {
        let mux = Arc::new(MockMux::new());
        mux.set_capture("%1", "state one");
        let builder = ContextPackBuilder::new(mux.clone());

        let request = PackRequest::new(vec![ContextSource::PaneOutput {
            pane_id: "%1".to_string(),
            lines: 10,
        }]);
        let first = builder.build(&request).unwrap();

        // Pane output changed, but the cached pack is returned
        mux.set_capture("%1", "state two");
        let second = builder.build(&request).unwrap();
        assert_eq!(first, second);
        builder.close();
    }

    #[test]
    fn test_recovery_request_shape() {
        let request = recovery_request(std::path::Path::new("/work/app"), "%3");
        assert_eq!(request.sources.len(), 4);
        assert_eq!(request.budget_tokens, DEFAULT_BUDGET_TOKENS);
    }
}
