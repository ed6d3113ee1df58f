//! Hot reload of the configuration file.
//!
//! The active configuration is an immutable [`Snapshot`] behind an
//! [`ArcSwap`]. A reload builds a complete new snapshot and swaps the pointer;
//! requests that already loaded the old snapshot keep using it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use log::{error, info, warn};

use crate::backend::Backend;
use crate::config::{Config, ConfigError, ExecutionMode};
use crate::policy::PolicyStore;

/// Everything a request needs from configuration, frozen at one point in time.
#[derive(Debug)]
pub struct Snapshot {
    pub config: Config,
    pub policy: Arc<PolicyStore>,
    pub mode: ExecutionMode,
    pub timeout: Duration,
    pub backend: Backend,
}

impl Snapshot {
    pub fn from_config(config: Config) -> Self {
        Self {
            policy: Arc::new(PolicyStore::from_config(&config.security)),
            mode: config.settings.execution_mode,
            timeout: config.timeout(),
            backend: Backend::from_config(&config.model),
            config,
        }
    }
}

/// Watches a configuration file's modification time and swaps in a new
/// [`Snapshot`] when it changes.
pub struct ConfigWatcher {
    path: Option<PathBuf>,
    current: ArcSwap<Snapshot>,
    /// Last observed modification time. The mutex also serializes reloads.
    last_modified: Mutex<Option<SystemTime>>,
}

impl std::fmt::Debug for ConfigWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigWatcher")
            .field("path", &self.path)
            .finish()
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ConfigWatcher {
    /// Load `path` and start tracking it. A missing file means defaults; a
    /// malformed one is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mtime = modified(&path);
        let config = Config::load_from(&path)?;
        Ok(Self {
            current: ArcSwap::from_pointee(Snapshot::from_config(config)),
            last_modified: Mutex::new(mtime),
            path: Some(path),
        })
    }

    /// Track `path` but start from the embedded defaults. Used when the file
    /// is malformed at startup; the next edit is picked up by
    /// [`check_and_reload`](Self::check_and_reload).
    pub fn with_defaults(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            current: ArcSwap::from_pointee(Snapshot::from_config(Config::default_config())),
            last_modified: Mutex::new(modified(&path)),
            path: Some(path),
        }
    }

    /// A watcher with a fixed configuration and no backing file.
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            current: ArcSwap::from_pointee(Snapshot::from_config(config)),
            last_modified: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The current snapshot. Callers hold it for the duration of a request.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Reload if the file's modification time changed since the last check.
    ///
    /// Returns `true` when a new snapshot was installed. Read or parse
    /// failures keep the current snapshot; the new modification time is still
    /// recorded so a broken file is reported once rather than on every check.
    pub fn check_and_reload(&self) -> bool {
        let Some(path) = &self.path else {
            return false;
        };
        let mut last = self
            .last_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(mtime) = modified(path) else {
            return false;
        };
        if *last == Some(mtime) {
            return false;
        }
        *last = Some(mtime);

        match Config::load_from(path) {
            Ok(config) => {
                let previous = self.snapshot();
                if previous.config.settings.audit_log_path != config.settings.audit_log_path {
                    warn!("audit_log_path changes take effect after restart");
                }
                if previous.config.triggers != config.triggers {
                    warn!("[triggers] changes take effect after restart");
                }
                let snapshot = Snapshot::from_config(config);
                info!(
                    "configuration reloaded from {}: mode={}, backend={}",
                    path.display(),
                    snapshot.mode.as_str(),
                    snapshot.backend.name()
                );
                self.current.store(Arc::new(snapshot));
                true
            }
            Err(e) => {
                error!("config reload failed, keeping previous configuration: {e}");
                false
            }
        }
    }

    /// Poll for changes every `interval` until the task is dropped.
    pub async fn poll(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.check_and_reload();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use super::*;

    /// Rewrite the file and push its mtime forward so the change is visible
    /// regardless of filesystem timestamp granularity.
    fn rewrite(path: &Path, content: &str, bump_secs: u64) {
        std::fs::write(path, content).unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(bump_secs))
            .unwrap();
    }

    #[test]
    fn unchanged_file_does_not_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[settings]\nexecution_mode = \"dry_run\"\n").unwrap();
        let watcher = ConfigWatcher::load(&path).unwrap();
        assert_eq!(watcher.snapshot().mode, ExecutionMode::DryRun);
        assert!(!watcher.check_and_reload());
    }

    #[test]
    fn change_swaps_snapshot_without_touching_held_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[settings]\nexecution_mode = \"dry_run\"\n").unwrap();
        let watcher = ConfigWatcher::load(&path).unwrap();
        let held = watcher.snapshot();

        rewrite(
            &path,
            "[settings]\nexecution_mode = \"audit_only\"\n[security]\nwhitelist = [\"uptime\"]\n",
            10,
        );
        assert!(watcher.check_and_reload());

        let fresh = watcher.snapshot();
        assert_eq!(fresh.mode, ExecutionMode::AuditOnly);
        assert!(fresh.policy.whitelist().contains("uptime"));
        assert_eq!(held.mode, ExecutionMode::DryRun);
        assert!(!held.policy.whitelist().contains("uptime"));
        assert!(!watcher.check_and_reload());
    }

    #[test]
    fn broken_file_keeps_last_known_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[settings]\nexecution_mode = \"auto_approve\"\n").unwrap();
        let watcher = ConfigWatcher::load(&path).unwrap();

        rewrite(&path, "[settings]\nexecution_mode = \"sometimes\"\n", 10);
        assert!(!watcher.check_and_reload());
        assert_eq!(watcher.snapshot().mode, ExecutionMode::AutoApprove);

        rewrite(&path, "[settings]\nexecution_mode = \"prompt\"\n", 20);
        assert!(watcher.check_and_reload());
        assert_eq!(watcher.snapshot().mode, ExecutionMode::Prompt);
    }

    #[test]
    fn missing_file_starts_with_defaults_and_picks_up_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let watcher = ConfigWatcher::load(&path).unwrap();
        assert_eq!(watcher.snapshot().mode, ExecutionMode::Prompt);
        assert!(!watcher.check_and_reload());

        rewrite(&path, "[settings]\ntimeout_seconds = 7\n", 5);
        assert!(watcher.check_and_reload());
        assert_eq!(watcher.snapshot().timeout, Duration::from_secs(7));
    }

    #[test]
    fn defaults_watcher_recovers_when_file_is_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[settings\n").unwrap();
        assert!(ConfigWatcher::load(&path).is_err());

        let watcher = ConfigWatcher::with_defaults(&path);
        assert_eq!(watcher.snapshot().mode, ExecutionMode::Prompt);
        assert!(!watcher.check_and_reload());

        rewrite(&path, "[settings]\nexecution_mode = \"dry_run\"\n", 10);
        assert!(watcher.check_and_reload());
        assert_eq!(watcher.snapshot().mode, ExecutionMode::DryRun);
    }

    #[test]
    fn fixed_watcher_never_reloads() {
        let watcher = ConfigWatcher::fixed(Config::default_config());
        assert!(!watcher.check_and_reload());
        assert!(watcher.path().is_none());
    }
}
