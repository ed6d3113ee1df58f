use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::QueueError;
use crate::audit::EventType;
use crate::pipeline::{Outcome, Processed};

/// Contents of a `.result` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: String,
    pub request_id: Uuid,
    pub source: String,
    pub status: EventType,
    /// True only when a command ran (or was dry-run) and exited zero.
    pub success: bool,
    pub command: Option<String>,
    pub return_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_secs: Option<f64>,
    /// Human-readable summary, including any rejection reason.
    pub message: String,
    pub completed_at: DateTime<Utc>,
}

impl TaskReport {
    pub fn from_processed(task: &str, processed: &Processed) -> Self {
        let outcome = &processed.outcome;
        let result = outcome.result();
        Self {
            task: task.to_string(),
            request_id: processed.request.id,
            source: processed.request.source.clone(),
            status: outcome.event_type(),
            success: outcome.succeeded(),
            command: outcome.command().map(String::from),
            return_code: result.map(|r| r.return_code),
            stdout: result.map(|r| r.stdout.clone()).unwrap_or_default(),
            stderr: match outcome {
                Outcome::Executed { result, .. } => result.stderr.clone(),
                _ => String::new(),
            },
            elapsed_secs: result.map(|r| r.elapsed.as_secs_f64()),
            message: outcome.to_string(),
            completed_at: Utc::now(),
        }
    }
}

/// The `.result` path paired with a `.task` path.
pub fn result_path(task: &Path) -> PathBuf {
    task.with_extension("result")
}

/// Write `report` next to the task: a temporary sibling first, renamed into
/// place so readers never observe a partial file.
pub async fn write_report(path: &Path, report: &TaskReport) -> Result<(), QueueError> {
    let body = serde_json::to_string_pretty(report)?;
    let tmp = path.with_extension("result.tmp");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|source| QueueError::io(&tmp, source))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| QueueError::io(path, source))
}

/// Read and parse a `.result` file.
pub async fn read_report(path: &Path) -> Result<TaskReport, QueueError> {
    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| QueueError::io(path, source))?;
    Ok(serde_json::from_str(&body)?)
}
