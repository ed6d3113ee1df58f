//! Producer side of the queue: drop a task, then wait for its answer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::debug;
use uuid::Uuid;

use super::{QueueError, TASK_EXTENSION, TaskReport, read_report, result_path};

/// `{source}_{timestamp}_{short-id}` with the source reduced to filename-safe
/// characters.
pub fn task_name(source: &str) -> String {
    let source: String = source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let source = if source.is_empty() { "task" } else { &source };
    let id = Uuid::new_v4().simple().to_string();
    format!(
        "{source}_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S_%6f"),
        &id[..8]
    )
}

/// Write `text` as a new task in `dir` and return its path.
///
/// The content goes to a temporary sibling first and is renamed into place,
/// so the queue never sees a half-written task.
pub fn submit(dir: &Path, text: &str, source: &str) -> Result<PathBuf, QueueError> {
    std::fs::create_dir_all(dir).map_err(|e| QueueError::io(dir, e))?;
    let name = task_name(source);
    let tmp = dir.join(format!("{name}.{TASK_EXTENSION}.tmp"));
    let task = dir.join(format!("{name}.{TASK_EXTENSION}"));
    std::fs::write(&tmp, text).map_err(|e| QueueError::io(&tmp, e))?;
    std::fs::rename(&tmp, &task).map_err(|e| QueueError::io(&task, e))?;
    debug!("submitted {}", task.display());
    Ok(task)
}

/// Poll for the `.result` paired with `task`. Returns `Ok(None)` if nothing
/// arrives within `timeout`.
pub async fn wait_for_result(
    task: &Path,
    timeout: Duration,
) -> Result<Option<TaskReport>, QueueError> {
    let result = result_path(task);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if tokio::fs::try_exists(&result).await.unwrap_or(false) {
            return read_report(&result).await.map(Some);
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
