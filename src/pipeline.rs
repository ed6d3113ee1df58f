//! The request pipeline: suggestion → extraction → validation → approval →
//! execution → audit.
//!
//! Each call to [`RequestPipeline::process`] ends in exactly one audit record,
//! written before the call returns.

use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::approval::{ApprovalError, ApprovalGate};
use crate::audit::{AuditLog, AuditRecord, EventType};
use crate::config::ExecutionMode;
use crate::exec::{CommandExecutor, ExecutionResult};
use crate::extract::extract_command;
use crate::reload::{ConfigWatcher, Snapshot};

/// One mediation attempt. Only its audit record is persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: Uuid,
    pub source: String,
    pub raw_input: String,
    pub suggestion: Option<String>,
    pub extracted_command: Option<String>,
}

impl Request {
    pub fn new(source: impl Into<String>, raw_input: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            raw_input: raw_input.into(),
            suggestion: None,
            extracted_command: None,
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The suggestion held no actionable command.
    NoCommand,
    /// The policy rejected the command.
    Rejected { command: String, reason: String },
    /// The approval gate said no (or failed).
    Denied { command: String, reason: String },
    /// Approved but deliberately not executed.
    AuditOnly { command: String },
    /// Executed (or dry-run simulated).
    Executed {
        command: String,
        result: ExecutionResult,
    },
}

impl Outcome {
    pub fn event_type(&self) -> EventType {
        match self {
            Outcome::NoCommand => EventType::NoCommandExtracted,
            Outcome::Rejected { .. } => EventType::ValidationFailed,
            Outcome::Denied { .. } => EventType::UserRejected,
            Outcome::AuditOnly { .. } => EventType::AuditOnly,
            Outcome::Executed { .. } => EventType::CommandExecuted,
        }
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Outcome::Executed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn command(&self) -> Option<&str> {
        match self {
            Outcome::NoCommand => None,
            Outcome::Rejected { command, .. }
            | Outcome::Denied { command, .. }
            | Outcome::AuditOnly { command }
            | Outcome::Executed { command, .. } => Some(command),
        }
    }

    /// True only for an execution that exited successfully.
    pub fn succeeded(&self) -> bool {
        self.result().is_some_and(|r| r.success)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::NoCommand => write!(f, "no actionable command"),
            Outcome::Rejected { command, reason } => write!(f, "rejected `{command}`: {reason}"),
            Outcome::Denied { command, reason } => write!(f, "denied `{command}`: {reason}"),
            Outcome::AuditOnly { command } => write!(f, "recorded `{command}` (audit only)"),
            Outcome::Executed { command, result } => write!(
                f,
                "executed `{command}`: exit {} in {:.2}s",
                result.return_code,
                result.elapsed.as_secs_f64()
            ),
        }
    }
}

/// The request together with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Processed {
    pub request: Request,
    pub outcome: Outcome,
}

/// Orchestrates a request through every stage.
pub struct RequestPipeline {
    config: Arc<ConfigWatcher>,
    audit: Arc<AuditLog>,
    approval: Arc<dyn ApprovalGate>,
}

impl RequestPipeline {
    pub fn new(
        config: Arc<ConfigWatcher>,
        audit: Arc<AuditLog>,
        approval: Arc<dyn ApprovalGate>,
    ) -> Self {
        Self {
            config,
            audit,
            approval,
        }
    }

    pub fn config(&self) -> &Arc<ConfigWatcher> {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Run one request to completion. Never fails: every ending is an
    /// [`Outcome`] with its audit record already written.
    pub async fn process(&self, source: &str, raw_input: &str) -> Processed {
        self.config.check_and_reload();
        let snapshot = self.config.snapshot();

        let mut request = Request::new(source, raw_input);
        info!(
            "request {} from {source}: {raw_input:?} (mode={})",
            request.id,
            snapshot.mode.as_str()
        );

        let (outcome, record) = self.run(&snapshot, &mut request).await;
        self.audit.record(&record);
        info!("request {}: {outcome}", request.id);

        Processed { request, outcome }
    }

    async fn run(&self, snapshot: &Snapshot, request: &mut Request) -> (Outcome, AuditRecord) {
        // Received → Extracted
        match snapshot.backend.generate_suggestion(&request.raw_input).await {
            Ok(s) => {
                request.extracted_command = extract_command(&s);
                request.suggestion = Some(s);
            }
            Err(e) => {
                warn!("backend {} failed: {e}", snapshot.backend.name());
                request.suggestion = Some(format!("backend error: {e}"));
            }
        }
        let Some(command) = request.extracted_command.clone() else {
            return (Outcome::NoCommand, AuditRecord::no_command(request));
        };

        // Extracted → Validated
        let verdict = snapshot.policy.validate(&command);
        if !verdict.ok {
            warn!("rejected {command:?}: {}", verdict.reason);
            let record = AuditRecord::validation_failed(request, &verdict.reason);
            return (
                Outcome::Rejected {
                    command,
                    reason: verdict.reason,
                },
                record,
            );
        }

        // Validated → Approved | Rejected
        let needs_approval =
            snapshot.mode == ExecutionMode::Prompt || snapshot.policy.needs_approval(&command);
        if needs_approval {
            let denial = match self.approve(&command, &request.raw_input).await {
                Ok(true) => None,
                Ok(false) => Some("rejected by approval gate".to_string()),
                Err(e) => {
                    warn!("approval gate failed for {command:?}: {e}");
                    Some(format!("approval gate failed: {e}"))
                }
            };
            if let Some(reason) = denial {
                let record = AuditRecord::user_rejected(request, &reason);
                return (Outcome::Denied { command, reason }, record);
            }
        }

        // Approved → Executed | Skipped
        if snapshot.mode == ExecutionMode::AuditOnly {
            return (
                Outcome::AuditOnly { command },
                AuditRecord::audit_only(request),
            );
        }
        let result = CommandExecutor::new(snapshot.timeout)
            .execute(&command, snapshot.mode == ExecutionMode::DryRun)
            .await;
        let record = AuditRecord::executed(request, &result);
        (Outcome::Executed { command, result }, record)
    }

    /// Run the gate on the blocking pool so an interactive prompt does not
    /// stall other requests.
    async fn approve(&self, command: &str, context: &str) -> Result<bool, ApprovalError> {
        let gate = Arc::clone(&self.approval);
        let command = command.to_string();
        let context = context.to_string();
        tokio::task::spawn_blocking(move || gate.request_approval(&command, &context))
            .await
            .map_err(|e| ApprovalError::Aborted(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::approval::StaticApproval;
    use crate::audit::AuditFilter;
    use crate::config::Config;

    struct CountingGate {
        answer: bool,
        calls: AtomicUsize,
    }

    impl ApprovalGate for CountingGate {
        fn request_approval(&self, _command: &str, _context: &str) -> Result<bool, ApprovalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    struct RecordingGate {
        seen: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl ApprovalGate for RecordingGate {
        fn request_approval(&self, command: &str, context: &str) -> Result<bool, ApprovalError> {
            self.seen
                .lock()
                .unwrap()
                .push((command.to_string(), context.to_string()));
            Ok(false)
        }
    }

    struct BrokenGate;

    impl ApprovalGate for BrokenGate {
        fn request_approval(&self, _command: &str, _context: &str) -> Result<bool, ApprovalError> {
            Err(ApprovalError::Closed)
        }
    }

    fn pipeline(overlay: &str, gate: Arc<dyn ApprovalGate>) -> RequestPipeline {
        pipeline_raw(&format!("[model]\ntype = \"passthrough\"\n{overlay}"), gate)
    }

    fn pipeline_raw(overlay: &str, gate: Arc<dyn ApprovalGate>) -> RequestPipeline {
        let mut config = Config::default_config();
        config.apply_overlay_str(overlay).unwrap();
        RequestPipeline::new(
            Arc::new(ConfigWatcher::fixed(config)),
            Arc::new(AuditLog::in_memory().unwrap()),
            gate,
        )
    }

    fn only_record(p: &RequestPipeline) -> AuditRecord {
        let rows = p.audit().query(&AuditFilter::default()).unwrap();
        assert_eq!(rows.len(), 1, "expected exactly one audit record");
        rows.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn empty_suggestion_is_no_command() {
        let p = pipeline("", Arc::new(StaticApproval(true)));
        let out = p.process("cli", "   ").await;
        assert_eq!(out.outcome, Outcome::NoCommand);
        let rec = only_record(&p);
        assert_eq!(rec.event_type, EventType::NoCommandExtracted);
        assert_eq!(rec.executed, None);
    }

    #[tokio::test]
    async fn approval_required_by_policy_in_auto_mode() {
        let gate = Arc::new(CountingGate {
            answer: false,
            calls: AtomicUsize::new(0),
        });
        let p = pipeline(
            "[settings]\nexecution_mode = \"auto_approve\"\n[security]\nwhitelist = [\"rm\"]\n",
            gate.clone(),
        );
        let out = p.process("cli", "rm /tmp/cmdgate-nonexistent").await;
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(out.outcome, Outcome::Denied { .. }));
        assert_eq!(only_record(&p).event_type, EventType::UserRejected);
    }

    #[tokio::test]
    async fn auto_mode_skips_gate_for_plain_commands() {
        let gate = Arc::new(CountingGate {
            answer: false,
            calls: AtomicUsize::new(0),
        });
        let p = pipeline("[settings]\nexecution_mode = \"dry_run\"\n", gate.clone());
        // dry_run is not prompt, and echo needs no approval.
        let out = p.process("cli", "echo hi").await;
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);
        assert_eq!(out.outcome.result().unwrap().stdout, "[DRY RUN] echo hi");
        let rec = only_record(&p);
        assert_eq!(rec.event_type, EventType::CommandExecuted);
        assert_eq!(rec.approved, Some(true));
        assert_eq!(rec.executed, Some(true));
    }

    #[tokio::test]
    async fn gate_failure_is_recorded_as_rejection() {
        let p = pipeline("", Arc::new(BrokenGate));
        let out = p.process("cli", "ls").await;
        match &out.outcome {
            Outcome::Denied { reason, .. } => assert!(reason.contains("approval gate failed")),
            other => panic!("unexpected outcome {other:?}"),
        }
        let rec = only_record(&p);
        assert_eq!(rec.event_type, EventType::UserRejected);
        assert!(rec.result_summary.unwrap().contains("approval input closed"));
    }

    #[tokio::test]
    async fn backend_failure_is_no_command() {
        let p = pipeline_raw(
            "[model]\ntype = \"qwen\"\npath = \"/nowhere.gguf\"\nbinary = \"cmdgate-no-such-llama\"\n",
            Arc::new(StaticApproval(true)),
        );
        let out = p.process("cli", "show disk usage").await;
        assert_eq!(out.outcome, Outcome::NoCommand);
        let rec = only_record(&p);
        assert_eq!(rec.event_type, EventType::NoCommandExtracted);
        assert!(rec.suggestion.unwrap().starts_with("backend error:"));
    }

    #[tokio::test]
    async fn extraction_feeds_validation() {
        let p = pipeline(
            "[settings]\nexecution_mode = \"audit_only\"\n",
            Arc::new(StaticApproval(true)),
        );
        let out = p.process("cli", "Command: ```\nuptime\n```").await;
        assert_eq!(
            out.outcome,
            Outcome::AuditOnly {
                command: "uptime".into()
            }
        );
        assert_eq!(out.request.extracted_command.as_deref(), Some("uptime"));
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let p = pipeline(
            "[settings]\nexecution_mode = \"audit_only\"\n",
            Arc::new(StaticApproval(true)),
        );
        let a = p.process("cli", "ls").await;
        let b = p.process("cli", "ls").await;
        assert_ne!(a.request.id, b.request.id);
        assert_eq!(p.audit().count().unwrap(), 2);
    }

    #[tokio::test]
    async fn gate_sees_extracted_command_and_raw_input() {
        let gate = Arc::new(RecordingGate {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let p = pipeline("[settings]\nexecution_mode = \"prompt\"\n", gate.clone());
        let out = p.process("cli", "Command: ls").await;
        assert!(matches!(out.outcome, Outcome::Denied { .. }));
        assert_eq!(
            *gate.seen.lock().unwrap(),
            vec![("ls".to_string(), "Command: ls".to_string())]
        );
        let rec = only_record(&p);
        assert_eq!(rec.input, "Command: ls");
        assert_eq!(rec.extracted_command.as_deref(), Some("ls"));
    }
}
