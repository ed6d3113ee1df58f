use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Embedded default configuration.
const DEFAULT_CONFIG: &str = include_str!("../config.default.toml");

/// Errors raised while reading or parsing a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

// ── Final (merged) config types ──

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How an approved command is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run without asking unless the policy demands approval.
    AutoApprove,
    /// Ask the approval gate before every execution.
    #[default]
    Prompt,
    /// Report a simulated success without spawning anything.
    DryRun,
    /// Record the decision, never execute.
    AuditOnly,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::AutoApprove => "auto_approve",
            ExecutionMode::Prompt => "prompt",
            ExecutionMode::DryRun => "dry_run",
            ExecutionMode::AuditOnly => "audit_only",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            timeout_seconds: default_timeout_seconds(),
            audit_log_path: default_audit_log_path(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_audit_log_path() -> String {
    "cmdgate_audit.db".into()
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SecurityConfig {
    /// Base commands allowed to run. Empty means no whitelist restriction.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Substrings that reject a command wherever they appear.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Base commands that always go through the approval gate.
    #[serde(default)]
    pub require_approval_for: Vec<String>,
}

/// Inference backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    Mock,
    Passthrough,
    Deepseek,
    Llama,
    Qwen,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(rename = "type", default)]
    pub kind: ModelKind,
    /// Model weights for the llama.cpp families.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_model_binary")]
    pub binary: String,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            kind: ModelKind::default(),
            path: None,
            binary: default_model_binary(),
            context_size: default_context_size(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_model_binary() -> String {
    "llama-cli".into()
}

fn default_context_size() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    128
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TriggerConfig {
    #[serde(default = "default_watch_dir")]
    pub watch_dir: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Delay between noticing a task file and reading it, so producers that
    /// write in place can finish.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            watch_dir: default_watch_dir(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

fn default_watch_dir() -> String {
    "./triggers".into()
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_settle_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file appended to in addition to stderr. Empty disables it.
    #[serde(default)]
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: String::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

// ── Overlay types (user config that merges with defaults) ──

#[derive(Debug, Deserialize, Default)]
struct ConfigOverlay {
    #[serde(default)]
    settings: SettingsOverlay,
    #[serde(default)]
    security: SecurityOverlay,
    #[serde(default)]
    model: ModelOverlay,
    #[serde(default)]
    triggers: TriggersOverlay,
    #[serde(default)]
    logging: LoggingOverlay,
}

#[derive(Debug, Deserialize, Default)]
struct SettingsOverlay {
    execution_mode: Option<ExecutionMode>,
    timeout_seconds: Option<u64>,
    audit_log_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SecurityOverlay {
    /// Replace all three lists.
    #[serde(default)]
    replace: bool,
    #[serde(default)]
    replace_whitelist: bool,
    #[serde(default)]
    replace_blacklist: bool,
    #[serde(default)]
    replace_require_approval_for: bool,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    blacklist: Vec<String>,
    #[serde(default)]
    require_approval_for: Vec<String>,
    #[serde(default)]
    remove_whitelist: Vec<String>,
    #[serde(default)]
    remove_blacklist: Vec<String>,
    #[serde(default)]
    remove_require_approval_for: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelOverlay {
    #[serde(rename = "type")]
    kind: Option<ModelKind>,
    path: Option<String>,
    binary: Option<String>,
    context_size: Option<u32>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TriggersOverlay {
    watch_dir: Option<String>,
    workers: Option<usize>,
    poll_interval_ms: Option<u64>,
    settle_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingOverlay {
    level: Option<String>,
    file: Option<String>,
}

// ── Merge logic ──

/// Merge a user list into a default list.
/// In replace mode: user list replaces default entirely.
/// In merge mode: remove items first, then extend with additions (deduped).
fn merge_list(base: &mut Vec<String>, add: Vec<String>, remove: &[String], replace: bool) {
    if replace {
        *base = add;
    } else {
        base.retain(|item| !remove.contains(item));
        for item in add {
            if !base.contains(&item) {
                base.push(item);
            }
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

/// Expand `~` and `$VARS` in a configured path, keeping it verbatim when a
/// variable is undefined.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            log::warn!("cannot expand path {raw:?}: {e}");
            PathBuf::from(raw)
        }
    }
}

impl Config {
    /// Load the default embedded configuration.
    pub fn default_config() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("embedded default config must parse")
    }

    /// Load configuration with resolution order:
    /// 1. Start with embedded defaults
    /// 2. Merge the overlay at `path` (if it exists)
    ///
    /// A missing file yields the defaults; an unreadable or malformed file is
    /// an error so the caller can keep its last-known-good state.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default_config();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let overlay = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_overlay(overlay);
        Ok(config)
    }

    /// Apply an overlay on top of this config (merge semantics).
    fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        let s = overlay.settings;
        set(&mut self.settings.execution_mode, s.execution_mode);
        set(&mut self.settings.timeout_seconds, s.timeout_seconds);
        set(&mut self.settings.audit_log_path, s.audit_log_path);

        let sec = overlay.security;
        merge_list(
            &mut self.security.whitelist,
            sec.whitelist,
            &sec.remove_whitelist,
            sec.replace || sec.replace_whitelist,
        );
        merge_list(
            &mut self.security.blacklist,
            sec.blacklist,
            &sec.remove_blacklist,
            sec.replace || sec.replace_blacklist,
        );
        merge_list(
            &mut self.security.require_approval_for,
            sec.require_approval_for,
            &sec.remove_require_approval_for,
            sec.replace || sec.replace_require_approval_for,
        );

        let m = overlay.model;
        set(&mut self.model.kind, m.kind);
        if m.path.is_some() {
            self.model.path = m.path;
        }
        set(&mut self.model.binary, m.binary);
        set(&mut self.model.context_size, m.context_size);
        set(&mut self.model.temperature, m.temperature);
        set(&mut self.model.max_tokens, m.max_tokens);

        let t = overlay.triggers;
        set(&mut self.triggers.watch_dir, t.watch_dir);
        set(&mut self.triggers.workers, t.workers);
        set(&mut self.triggers.poll_interval_ms, t.poll_interval_ms);
        set(&mut self.triggers.settle_ms, t.settle_ms);

        let l = overlay.logging;
        set(&mut self.logging.level, l.level);
        set(&mut self.logging.file, l.file);
    }

    /// Apply an overlay from a TOML string.
    pub fn apply_overlay_str(&mut self, toml_str: &str) -> Result<(), toml::de::Error> {
        let overlay: ConfigOverlay = toml::from_str(toml_str)?;
        self.apply_overlay(overlay);
        Ok(())
    }

    /// Execution timeout, never below one second.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_seconds.max(1))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        expand_path(&self.settings.audit_log_path)
    }

    pub fn watch_dir(&self) -> PathBuf {
        expand_path(&self.triggers.watch_dir)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        if self.logging.file.is_empty() {
            None
        } else {
            Some(expand_path(&self.logging.file))
        }
    }
}
