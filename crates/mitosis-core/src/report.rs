//! Run reports: one JSON document per coordinator run, keyed by timestamp.
//! The report is the only durable state the orchestrator owns besides the
//! server logs inside each tree.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::coordinator::CoordinatorMetrics;
use crate::engine::TaskResult;
use crate::{CoreError, Result};

/// Everything worth keeping from one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub branch: String,
    pub mode: String,
    pub metrics: CoordinatorMetrics,
    pub tasks: Vec<TaskResult>,
}

/// Writes reports under a fixed directory.
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Persist a report as `run-<timestamp>.json`, creating the directory
    /// as needed. Returns the path written.
    pub fn write(&self, report: &RunReport) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            CoreError::Report(format!(
                "failed to create report dir {}: {e}",
                self.dir.display()
            ))
        })?;

        let name = format!(
            "run-{}.json",
            report.generated_at.format("%Y%m%dT%H%M%S%3f")
        );
        let path = self.dir.join(name);

        let json = serde_json::to_string_pretty(report)
            .map_err(|e| CoreError::Report(format!("failed to serialize report: {e}")))?;
        std::fs::write(&path, json).map_err(|e| {
            CoreError::Report(format!("failed to write {}: {e}", path.display()))
        })?;

        info!(path = %path.display(), tasks = report.tasks.len(), "run report written");
        Ok(path)
    }

    /// Read a report back from disk.
    pub fn read(path: &Path) -> Result<RunReport> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Report(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| CoreError::Report(format!("failed to parse {}: {e}", path.display())))
    }
}
