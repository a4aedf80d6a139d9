//! Aggregate test reports.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::orchestrator::ExecutionMode;
use crate::runner::ProfileResult;

/// Name of the copy of the most recent report.
pub const LATEST_REPORT: &str = "latest.json";

/// Exit code used when the run was interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Pass/fail counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Profiles that produced a result.
    pub total: usize,
    /// Profiles that succeeded.
    pub passed: usize,
    /// Profiles that failed.
    pub failed: usize,
}

/// Result of a whole test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Run identifier.
    pub run_id: String,
    /// When the run started.
    pub timestamp: DateTime<Utc>,
    /// How profiles were scheduled.
    pub mode: ExecutionMode,
    /// Per-profile results.
    pub results: BTreeMap<String, ProfileResult>,
    /// Counts over `results`.
    pub summary: Summary,
    /// True if the operator stopped the run.
    #[serde(default)]
    pub interrupted: bool,
    /// Requested profiles that never ran.
    #[serde(default)]
    pub skipped: Vec<String>,
}

/// Files a report was written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    /// Full JSON report.
    pub json: PathBuf,
    /// Human-readable summary.
    pub summary: PathBuf,
    /// Copy of the JSON report under a fixed name.
    pub latest: PathBuf,
}

impl TestReport {
    /// Builds a report, deriving the summary and skipped profiles.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        mode: ExecutionMode,
        requested: &[String],
        results: BTreeMap<String, ProfileResult>,
        interrupted: bool,
    ) -> Self {
        let passed = results.values().filter(|r| r.succeeded()).count();
        let summary = Summary {
            total: results.len(),
            passed,
            failed: results.len() - passed,
        };
        let skipped = requested
            .iter()
            .filter(|p| !results.contains_key(*p))
            .cloned()
            .collect();

        Self {
            run_id: run_id.into(),
            timestamp,
            mode,
            results,
            summary,
            interrupted,
            skipped,
        }
    }

    /// Returns true if every tested profile passed and nothing was cut short.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0 && !self.interrupted && self.skipped.is_empty()
    }

    /// Process exit code: 0 if all passed, otherwise the failed count.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.summary.failed > 0 {
            i32::try_from(self.summary.failed.min(125)).unwrap_or(125)
        } else if self.interrupted {
            INTERRUPTED_EXIT_CODE
        } else {
            i32::from(!self.skipped.is_empty())
        }
    }

    /// Renders the human-readable summary.
    #[must_use]
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "NixOS installation test report");
        let _ = writeln!(out, "Run:       {}", self.run_id);
        let _ = writeln!(out, "Started:   {}", self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out, "Mode:      {}", self.mode.as_str());
        let _ = writeln!(
            out,
            "Profiles:  {} total, {} passed, {} failed",
            self.summary.total, self.summary.passed, self.summary.failed
        );
        if self.interrupted {
            let _ = writeln!(out, "Status:    INTERRUPTED");
        }
        let _ = writeln!(out);

        for (name, result) in &self.results {
            let verdict = if result.succeeded() { "PASS" } else { "FAIL" };
            let _ = writeln!(
                out,
                "[{verdict}] {name}: {} attempt(s), {} healing action(s), {:.0}s",
                result.attempts.len(),
                result.healing_count(),
                result.total_duration_seconds
            );
            for attempt in &result.attempts {
                for action in &attempt.healing_actions_applied {
                    let _ = writeln!(
                        out,
                        "       attempt {}: healed with {} ({:.0}%)",
                        attempt.attempt_number,
                        action.name(),
                        action.confidence() * 100.0
                    );
                }
            }
            if let Some(error) = &result.error {
                let state = result.failed_in.map_or("unknown", |s| s.as_str());
                let _ = writeln!(out, "       failed while {state}: {error}");
            }
            for warning in &result.warnings {
                let _ = writeln!(out, "       warning: {warning}");
            }
            let _ = writeln!(out, "       log: {}", result.log_path.display());
        }

        for name in &self.skipped {
            let _ = writeln!(out, "[SKIP] {name}");
        }

        out
    }

    /// Writes the JSON report, the summary and `latest.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub async fn write(&self, dir: &Path) -> Result<ReportPaths> {
        tokio::fs::create_dir_all(dir).await?;

        let stamp = self.timestamp.format("%Y%m%d-%H%M%S").to_string();
        let paths = ReportPaths {
            json: dir.join(format!("report-{stamp}-{}.json", self.run_id)),
            summary: dir.join(format!("summary-{stamp}-{}.txt", self.run_id)),
            latest: dir.join(LATEST_REPORT),
        };

        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&paths.json, &json).await?;
        tokio::fs::write(&paths.summary, self.render_summary()).await?;
        tokio::fs::write(&paths.latest, &json).await?;

        tracing::info!(report = %paths.json.display(), "Test report written");
        Ok(paths)
    }

    /// Loads the most recent report from `dir`, if there is one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load_latest(dir: &Path) -> Result<Option<Self>> {
        let content = match tokio::fs::read_to_string(dir.join(LATEST_REPORT)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }
}
