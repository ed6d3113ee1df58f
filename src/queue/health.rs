//! Point-in-time view of the trigger directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;

use super::{QueueError, RESULT_EXTENSION, TASK_EXTENSION};

/// Pending tasks older than this are reported.
pub const STALE_TASK_AGE: Duration = Duration::from_secs(300);
/// More pending tasks than this are reported.
pub const BACKLOG_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileAge {
    pub file: String,
    pub age_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub dir: PathBuf,
    pub pending: usize,
    pub completed: usize,
    pub oldest_pending: Option<FileAge>,
    pub newest_result: Option<FileAge>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub status: Option<QueueStatus>,
}

fn age(modified: SystemTime, now: SystemTime) -> u64 {
    now.duration_since(modified).unwrap_or_default().as_secs()
}

/// Count tasks and results in `dir`.
pub fn queue_status(dir: &Path) -> Result<QueueStatus, QueueError> {
    let now = SystemTime::now();
    let mut status = QueueStatus {
        dir: dir.to_path_buf(),
        pending: 0,
        completed: 0,
        oldest_pending: None,
        newest_result: None,
    };

    for entry in std::fs::read_dir(dir).map_err(|e| QueueError::io(dir, e))? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        let this = FileAge {
            file: entry.file_name().to_string_lossy().into_owned(),
            age_secs: age(modified, now),
        };
        if ext == TASK_EXTENSION {
            status.pending += 1;
            if status
                .oldest_pending
                .as_ref()
                .is_none_or(|o| this.age_secs > o.age_secs)
            {
                status.oldest_pending = Some(this);
            }
        } else if ext == RESULT_EXTENSION {
            status.completed += 1;
            if status
                .newest_result
                .as_ref()
                .is_none_or(|n| this.age_secs < n.age_secs)
            {
                status.newest_result = Some(this);
            }
        }
    }
    Ok(status)
}

/// Judge the queue directory. A missing or unreadable directory is an issue;
/// stale or backed-up tasks are warnings.
pub fn health(dir: &Path) -> Health {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();

    if !dir.is_dir() {
        issues.push(format!("trigger directory {} does not exist", dir.display()));
        return Health {
            healthy: false,
            issues,
            warnings,
            status: None,
        };
    }

    let status = match queue_status(dir) {
        Ok(s) => s,
        Err(e) => {
            issues.push(e.to_string());
            return Health {
                healthy: false,
                issues,
                warnings,
                status: None,
            };
        }
    };

    if let Some(oldest) = &status.oldest_pending
        && oldest.age_secs > STALE_TASK_AGE.as_secs()
    {
        warnings.push(format!(
            "task {} pending for {}s",
            oldest.file, oldest.age_secs
        ));
    }
    if status.pending > BACKLOG_LIMIT {
        warnings.push(format!("{} tasks pending", status.pending));
    }

    Health {
        healthy: issues.is_empty(),
        issues,
        warnings,
        status: Some(status),
    }
}
