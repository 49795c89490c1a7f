//! Runbook loading.
//!
//! Operators drop markdown runbooks (one per alert type, named after it)
//! into the runbook directory; the parsed structure is injected into the
//! model's context when the matching alert fires. Reload is exposed over
//! HTTP so editing a runbook does not require a restart.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// A parsed runbook.
#[derive(Debug, Clone, Serialize)]
pub struct Runbook {
    pub alert_name: String,
    pub title: String,
    pub overview: String,
    pub investigation_steps: Vec<String>,
    pub common_causes: Vec<String>,
    pub remediation_steps: Vec<String>,
    pub commands: Vec<String>,
    pub risk_level: String,
    pub estimated_duration: String,
}

static H1_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#\s+(.+)$").expect("h1 pattern"));
static LIST_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:\d+\.|[-*])\s*(.+)$").expect("list pattern"));
static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:bash|sh|shell)?\n(.*?)```").expect("code pattern"));

/// Loads and serves runbooks from a directory of markdown files.
pub struct RunbookManager {
    runbook_dir: PathBuf,
    runbooks: HashMap<String, Runbook>,
}

impl RunbookManager {
    #[must_use]
    pub fn new(runbook_dir: &str) -> Self {
        Self {
            runbook_dir: PathBuf::from(runbook_dir),
            runbooks: HashMap::new(),
        }
    }

    /// Load all `*.md` files from the runbook directory. Returns the number
    /// loaded; a missing directory is fine (no runbooks).
    pub fn load(&mut self) -> usize {
        self.runbooks.clear();

        if !self.runbook_dir.exists() {
            warn!(path = %self.runbook_dir.display(), "Runbook directory not found");
            return 0;
        }

        let Ok(entries) = std::fs::read_dir(&self.runbook_dir) else {
            warn!(path = %self.runbook_dir.display(), "Runbook directory unreadable");
            return 0;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }

            match parse_runbook(&path) {
                Ok(runbook) => {
                    debug!(alert_name = %runbook.alert_name, file = %path.display(), "Runbook loaded");
                    self.runbooks
                        .insert(runbook.alert_name.to_lowercase(), runbook);
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "Runbook parse failed");
                }
            }
        }

        info!(
            count = self.runbooks.len(),
            directory = %self.runbook_dir.display(),
            "Runbooks loaded"
        );
        self.runbooks.len()
    }

    /// Get the runbook for an alert type.
    #[must_use]
    pub fn get(&self, alert_name: &str) -> Option<&Runbook> {
        self.runbooks.get(&alert_name.to_lowercase())
    }

    /// All loaded runbooks (for the inventory endpoint).
    #[must_use]
    pub fn list(&self) -> Vec<&Runbook> {
        self.runbooks.values().collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.runbooks.len()
    }

    /// Render a runbook into model context text. Empty when no runbook
    /// exists for the alert.
    #[must_use]
    pub fn context_for(&self, alert_name: &str) -> Option<String> {
        let runbook = self.get(alert_name)?;

        let mut lines = vec![
            format!("## Runbook: {}", runbook.title),
            String::new(),
            runbook.overview.clone(),
        ];

        if !runbook.investigation_steps.is_empty() {
            lines.push("\n### Investigation".to_string());
            for (i, step) in runbook.investigation_steps.iter().enumerate() {
                lines.push(format!("{}. {step}", i + 1));
            }
        }
        if !runbook.common_causes.is_empty() {
            lines.push("\n### Common Causes".to_string());
            for cause in &runbook.common_causes {
                lines.push(format!("- {cause}"));
            }
        }
        if !runbook.remediation_steps.is_empty() {
            lines.push("\n### Remediation".to_string());
            for (i, step) in runbook.remediation_steps.iter().enumerate() {
                lines.push(format!("{}. {step}", i + 1));
            }
        }
        if !runbook.commands.is_empty() {
            lines.push("\n### Known Commands".to_string());
            lines.push("```bash".to_string());
            lines.extend(runbook.commands.iter().cloned());
            lines.push("```".to_string());
        }

        Some(lines.join("\n"))
    }
}

fn parse_runbook(path: &Path) -> std::io::Result<Runbook> {
    let content = std::fs::read_to_string(path)?;

    // The filename (minus extension) is the alert name.
    let alert_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string();

    let title = H1_RE
        .captures(&content)
        .map_or_else(|| format!("{alert_name} Runbook"), |c| c[1].to_string());

    Ok(Runbook {
        overview: extract_section(&content, "Overview"),
        investigation_steps: extract_list(&content, "Investigation"),
        common_causes: extract_list(&content, "Common Causes"),
        remediation_steps: extract_list(&content, "Remediation"),
        commands: extract_code_blocks(&content),
        risk_level: extract_metadata(&content, "risk_level").unwrap_or_else(|| "medium".to_string()),
        estimated_duration: extract_metadata(&content, "estimated_duration")
            .unwrap_or_else(|| "5-10 minutes".to_string()),
        alert_name,
        title,
    })
}

/// Text between `## <section>` and the next `##` header.
fn extract_section(content: &str, section: &str) -> String {
    let pattern = format!(r"(?is)##\s+{}\s*\n(.*?)(?:\n##\s|\z)", regex::escape(section));
    let Ok(re) = Regex::new(&pattern) else {
        return String::new();
    };
    re.captures(content)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default()
}

/// Bullet/numbered items within a section.
fn extract_list(content: &str, section: &str) -> Vec<String> {
    let section_text = extract_section(content, section);
    LIST_ITEM_RE
        .captures_iter(&section_text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Non-comment lines from fenced shell blocks.
fn extract_code_blocks(content: &str) -> Vec<String> {
    CODE_BLOCK_RE
        .captures_iter(content)
        .flat_map(|c| {
            c[1].lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// `key: value` metadata lines (frontmatter-ish).
fn extract_metadata(content: &str, key: &str) -> Option<String> {
    let pattern = format!(r"(?m)^{}\s*:\s*(.+)$", regex::escape(key));
    let re = Regex::new(&pattern).ok()?;
    re.captures(content).map(|c| c[1].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"# Container Unhealthy Response
risk_level: low
estimated_duration: 2 minutes

## Overview
A container is failing its health check. Usually transient.

## Investigation
1. Check the container logs
2. Check host memory pressure

## Common Causes
- OOM-killed child process
- Upstream dependency down

## Remediation
1. Restart the container
2. If it recurs, check disk space

```bash
docker restart caddy
# a comment that should be skipped
docker ps --filter name=caddy
```
";

    fn write_sample(dir: &std::path::Path, name: &str) {
        std::fs::write(dir.join(format!("{name}.md")), SAMPLE).unwrap();
    }

    #[test]
    fn test_load_and_lookup() {
        let dir = std::env::temp_dir().join(format!("warden-runbooks-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        write_sample(&dir, "ContainerUnhealthy");

        let mut manager = RunbookManager::new(dir.to_str().unwrap());
        assert_eq!(manager.load(), 1);

        let runbook = manager.get("containerunhealthy").unwrap();
        assert_eq!(runbook.alert_name, "ContainerUnhealthy");
        assert_eq!(runbook.title, "Container Unhealthy Response");
        assert_eq!(runbook.risk_level, "low");
        assert_eq!(runbook.investigation_steps.len(), 2);
        assert_eq!(runbook.common_causes.len(), 2);
        assert_eq!(
            runbook.commands,
            vec!["docker restart caddy", "docker ps --filter name=caddy"]
        );

        // Lookup is case-insensitive.
        assert!(manager.get("CONTAINERUNHEALTHY").is_some());
        assert!(manager.get("SomeOtherAlert").is_none());

        let context = manager.context_for("ContainerUnhealthy").unwrap();
        assert!(context.contains("## Runbook: Container Unhealthy Response"));
        assert!(context.contains("docker restart caddy"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let mut manager = RunbookManager::new("/nonexistent/warden-runbooks");
        assert_eq!(manager.load(), 0);
        assert!(manager.context_for("Anything").is_none());
    }

    #[test]
    fn test_section_extraction_stops_at_next_header() {
        let overview = extract_section(SAMPLE, "Overview");
        assert!(overview.contains("health check"));
        assert!(!overview.contains("Investigation"));
    }
}
