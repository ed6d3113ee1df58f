//! File-based trigger queue.
//!
//! Producers drop `*.task` files into the watched directory. Each task is run
//! through the [`RequestPipeline`]; the outcome lands in `{base}.result` and
//! only then is the `.task` removed.
//!
//! ```text
//! notify events ─┐
//!                ├→ mpsc → dispatcher (claim set) → workers (semaphore)
//! periodic scan ─┘
//! ```

mod bridge;
mod health;
mod report;

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

pub use bridge::{submit, task_name, wait_for_result};
pub use health::{FileAge, Health, QueueStatus, health, queue_status};
pub use report::{TaskReport, read_report, result_path, write_report};

use crate::config::TriggerConfig;
use crate::pipeline::RequestPipeline;

pub const TASK_EXTENSION: &str = "task";
pub const RESULT_EXTENSION: &str = "result";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed task report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("filesystem watcher: {0}")]
    Watch(#[from] notify::Error),
}

impl QueueError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        QueueError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub(crate) fn is_task(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == TASK_EXTENSION)
}

/// Pending `.task` files in `dir`, oldest name first.
pub fn pending_tasks(dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let entries = std::fs::read_dir(dir).map_err(|e| QueueError::io(dir, e))?;
    let mut tasks: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_task(p) && p.is_file())
        .collect();
    tasks.sort();
    Ok(tasks)
}

/// Watches a directory and feeds `.task` files to the pipeline.
pub struct TriggerQueue {
    dir: PathBuf,
    pipeline: Arc<RequestPipeline>,
    workers: usize,
    poll_interval: Duration,
    settle: Duration,
    /// Tasks dispatched and not yet finished. Tasks that failed to produce a
    /// result stay here so they are not retried in a loop.
    claimed: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for TriggerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerQueue")
            .field("dir", &self.dir)
            .field("workers", &self.workers)
            .finish()
    }
}

impl TriggerQueue {
    pub fn new(dir: impl Into<PathBuf>, pipeline: Arc<RequestPipeline>) -> Self {
        Self::with_settings(dir, pipeline, &TriggerConfig::default())
    }

    /// Queue over the configured `watch_dir`.
    pub fn from_config(config: &TriggerConfig, pipeline: Arc<RequestPipeline>) -> Self {
        Self::with_settings(
            crate::config::expand_path(&config.watch_dir),
            pipeline,
            config,
        )
    }

    fn with_settings(
        dir: impl Into<PathBuf>,
        pipeline: Arc<RequestPipeline>,
        config: &TriggerConfig,
    ) -> Self {
        Self {
            dir: dir.into(),
            pipeline,
            workers: config.workers.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            settle: Duration::from_millis(config.settle_ms),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    fn claim(&self, path: &Path) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf())
    }

    fn release(&self, path: &Path) {
        self.claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    /// Process one task file end to end.
    ///
    /// If a `.result` already exists for this task (an earlier run wrote it
    /// but could not delete the task), the task is not run again; only the
    /// deletion is retried.
    pub async fn process_task(&self, task: &Path) -> Result<Option<TaskReport>, QueueError> {
        let result = result_path(task);
        if tokio::fs::try_exists(&result).await.unwrap_or(false) {
            warn!(
                "{} already answered by {}; removing task",
                task.display(),
                result.display()
            );
            remove_task(task).await;
            return Ok(None);
        }

        let bytes = tokio::fs::read(task)
            .await
            .map_err(|e| QueueError::io(task, e))?;
        let content = String::from_utf8_lossy(&bytes);
        let name = task
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = format!("file:{name}");

        let processed = self.pipeline.process(&source, content.trim()).await;
        let report = TaskReport::from_processed(&name, &processed);
        write_report(&result, &report).await?;
        debug!("wrote {}", result.display());

        remove_task(task).await;
        Ok(Some(report))
    }

    /// Process every task currently pending, up to `workers` at a time, and
    /// return how many produced a result.
    pub async fn drain(self: &Arc<Self>) -> Result<usize, QueueError> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::new();
        for task in pending_tasks(&self.dir)? {
            if !self.claim(&task) {
                continue;
            }
            let queue = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                queue.finish(&task).await
            }));
        }

        let mut done = 0;
        for handle in handles {
            if let Ok(Some(_)) = handle.await {
                done += 1;
            }
        }
        Ok(done)
    }

    /// Run a claimed task and settle its claim.
    async fn finish(&self, task: &Path) -> Option<TaskReport> {
        match self.process_task(task).await {
            Ok(report) => {
                self.release(task);
                report
            }
            Err(QueueError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} vanished before processing", task.display());
                self.release(task);
                None
            }
            Err(e) => {
                error!("task {} failed: {e}", task.display());
                None
            }
        }
    }

    /// Watch the directory until `shutdown` resolves, then wait for in-flight
    /// tasks to finish.
    pub async fn run<F>(self: Arc<Self>, shutdown: F) -> Result<(), QueueError>
    where
        F: Future<Output = ()>,
    {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| QueueError::io(&self.dir, e))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        // Keep the watcher alive for the whole loop; dropping it stops events.
        let _watcher = match self.start_watcher(tx) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("{e}; falling back to polling only");
                None
            }
        };

        info!(
            "watching {} for .{TASK_EXTENSION} files ({} workers, poll every {:?})",
            self.dir.display(),
            self.workers,
            self.poll_interval
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut workers = JoinSet::new();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("trigger queue shutting down");
                    break;
                }
                Some(path) = rx.recv() => {
                    self.dispatch(path, &semaphore, &mut workers);
                }
                _ = ticker.tick() => {
                    match pending_tasks(&self.dir) {
                        Ok(tasks) => {
                            for task in tasks {
                                self.dispatch(task, &semaphore, &mut workers);
                            }
                        }
                        Err(e) => warn!("scan failed: {e}"),
                    }
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        // Tasks still waiting for a slot give up; running ones finish.
        semaphore.close();
        if !workers.is_empty() {
            info!("waiting for {} in-flight task(s)", workers.len());
        }
        while workers.join_next().await.is_some() {}
        Ok(())
    }

    fn start_watcher(
        &self,
        tx: mpsc::UnboundedSender<PathBuf>,
    ) -> Result<RecommendedWatcher, QueueError> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths.into_iter().filter(|p| is_task(p)) {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!("filesystem watcher error: {e}"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Hand a task to a worker unless it is already claimed. The worker waits
    /// for a free slot; the dispatcher never does.
    fn dispatch(
        self: &Arc<Self>,
        task: PathBuf,
        semaphore: &Arc<Semaphore>,
        workers: &mut JoinSet<()>,
    ) {
        if !is_task(&task) || !self.claim(&task) {
            return;
        }
        let queue = Arc::clone(self);
        let semaphore = Arc::clone(semaphore);
        workers.spawn(async move {
            // Closed on shutdown.
            let Ok(_permit) = semaphore.acquire_owned().await else {
                queue.release(&task);
                return;
            };
            // Let the producer finish writing before reading.
            tokio::time::sleep(queue.settle).await;
            if !tokio::fs::try_exists(&task).await.unwrap_or(false) {
                queue.release(&task);
                return;
            }
            queue.finish(&task).await;
        });
    }
}

async fn remove_task(task: &Path) {
    if let Err(e) = tokio::fs::remove_file(task).await {
        warn!("could not remove {}: {e}", task.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalError, ApprovalGate, StaticApproval};
    use crate::audit::{AuditFilter, AuditLog, EventType};
    use crate::config::Config;
    use crate::reload::ConfigWatcher;

    fn queue(dir: &Path, overlay: &str) -> Arc<TriggerQueue> {
        let mut config = Config::default_config();
        config
            .apply_overlay_str(&format!("[model]\ntype = \"passthrough\"\n{overlay}"))
            .unwrap();
        let pipeline = RequestPipeline::new(
            Arc::new(ConfigWatcher::fixed(config)),
            Arc::new(AuditLog::in_memory().unwrap()),
            Arc::new(StaticApproval(true)),
        );
        Arc::new(TriggerQueue::new(dir, Arc::new(pipeline)))
    }

    const AUTO: &str = "[settings]\nexecution_mode = \"auto_approve\"\n";

    #[tokio::test]
    async fn task_produces_result_and_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("job_1.task");
        std::fs::write(&task, "  echo hello\n").unwrap();

        let q = queue(dir.path(), AUTO);
        let report = q.process_task(&task).await.unwrap().unwrap();

        assert!(!task.exists());
        let result = dir.path().join("job_1.result");
        assert!(std::fs::metadata(&result).unwrap().len() > 0);
        assert_eq!(report.status, EventType::CommandExecuted);
        assert!(report.success);
        assert!(report.stdout.contains("hello"));
        assert_eq!(report.source, "file:job_1.task");
        assert_eq!(read_report(&result).await.unwrap(), report);
    }

    #[tokio::test]
    async fn rejected_task_still_gets_result() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("bad.task");
        std::fs::write(&task, "rm -rf /").unwrap();

        let q = queue(dir.path(), AUTO);
        let report = q.process_task(&task).await.unwrap().unwrap();
        assert_eq!(report.status, EventType::ValidationFailed);
        assert!(!report.success);
        assert!(dir.path().join("bad.result").exists());
        assert!(!task.exists());
    }

    #[tokio::test]
    async fn existing_result_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("again.task");
        let result = dir.path().join("again.result");
        std::fs::write(&task, "echo twice").unwrap();
        std::fs::write(&result, "{\"kept\": true}").unwrap();

        let q = queue(dir.path(), AUTO);
        assert!(q.process_task(&task).await.unwrap().is_none());
        assert!(!task.exists());
        assert_eq!(std::fs::read_to_string(&result).unwrap(), "{\"kept\": true}");
        assert_eq!(q.pipeline.audit().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn unwritable_result_keeps_task() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("blocked.task");
        std::fs::write(&task, "echo hi").unwrap();
        // A directory where the temporary result file would go.
        std::fs::create_dir(dir.path().join("blocked.result.tmp")).unwrap();

        let q = queue(dir.path(), AUTO);
        assert!(q.process_task(&task).await.is_err());
        assert!(task.exists());
        assert!(!dir.path().join("blocked.result").exists());
    }

    #[tokio::test]
    async fn non_utf8_task_is_processed_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("bin.task");
        std::fs::write(&task, b"echo caf\xe9").unwrap();

        let q = queue(dir.path(), AUTO);
        assert_eq!(q.drain().await.unwrap(), 1);
        assert!(!task.exists());

        let report = read_report(&dir.path().join("bin.result")).await.unwrap();
        assert_eq!(report.status, EventType::CommandExecuted);
        assert!(report.stdout.contains("caf"));
        assert!(report.command.unwrap().contains('\u{FFFD}'));
    }

    #[tokio::test]
    async fn drain_processes_all_pending() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("t{i}.task")), "echo hi").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let q = queue(dir.path(), AUTO);
        assert_eq!(q.drain().await.unwrap(), 5);
        assert!(pending_tasks(dir.path()).unwrap().is_empty());
        assert!(dir.path().join("notes.txt").exists());

        let rows = q.pipeline.audit().query(&AuditFilter::default()).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.source.starts_with("file:t")));
    }

    #[tokio::test]
    async fn run_picks_up_new_tasks_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let q = {
            let mut config = Config::default_config();
            config
                .apply_overlay_str(&format!(
                    "[model]\ntype = \"passthrough\"\n{AUTO}[triggers]\npoll_interval_ms = 50\nsettle_ms = 10\n"
                ))
                .unwrap();
            let pipeline = RequestPipeline::new(
                Arc::new(ConfigWatcher::fixed(config.clone())),
                Arc::new(AuditLog::in_memory().unwrap()),
                Arc::new(StaticApproval(true)),
            );
            Arc::new(TriggerQueue::with_settings(
                dir.path(),
                Arc::new(pipeline),
                &config.triggers,
            ))
        };

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(Arc::clone(&q).run(async {
            let _ = stop_rx.await;
        }));

        let task = submit(dir.path(), "echo from-queue", "test").unwrap();
        let report = wait_for_result(&task, Duration::from_secs(10))
            .await
            .unwrap()
            .expect("result within timeout");
        assert!(report.stdout.contains("from-queue"));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!task.exists());
        assert_eq!(q.pipeline.audit().count().unwrap(), 1);
    }

    /// Blocks every approval until the test releases it once.
    struct HeldGate {
        calls: std::sync::atomic::AtomicUsize,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl ApprovalGate for HeldGate {
        fn request_approval(&self, _command: &str, _context: &str) -> Result<bool, ApprovalError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let release = self.release.lock().unwrap();
            release.recv().map_err(|_| ApprovalError::Closed)?;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn shutdown_is_noticed_while_all_workers_are_busy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.task"), "echo a").unwrap();
        std::fs::write(dir.path().join("b.task"), "echo b").unwrap();

        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let gate = Arc::new(HeldGate {
            calls: std::sync::atomic::AtomicUsize::new(0),
            release: Mutex::new(release_rx),
        });
        let mut config = Config::default_config();
        config
            .apply_overlay_str(
                "[model]\ntype = \"passthrough\"\n[settings]\nexecution_mode = \"prompt\"\n\
                 [triggers]\nworkers = 1\npoll_interval_ms = 20\nsettle_ms = 0\n",
            )
            .unwrap();
        let pipeline = RequestPipeline::new(
            Arc::new(ConfigWatcher::fixed(config.clone())),
            Arc::new(AuditLog::in_memory().unwrap()),
            Arc::clone(&gate) as Arc<dyn ApprovalGate>,
        );
        let q = Arc::new(TriggerQueue::with_settings(
            dir.path(),
            Arc::new(pipeline),
            &config.triggers,
        ));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(Arc::clone(&q).run(async {
            let _ = stop_rx.await;
        }));

        // The only worker is now parked in the approval prompt.
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while gate.calls.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "first task never reached the gate");

        stop_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        release_tx.send(()).unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
        drop(release_tx);
        stopped.expect("run returned after shutdown").unwrap().unwrap();

        assert_eq!(gate.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pending_tasks(dir.path()).unwrap().len(), 1);
        assert_eq!(q.pipeline.audit().count().unwrap(), 1);
    }
}
