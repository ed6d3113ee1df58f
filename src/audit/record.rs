use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exec::ExecutionResult;
use crate::pipeline::Request;

/// Terminal decision recorded for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NoCommandExtracted,
    ValidationFailed,
    UserRejected,
    AuditOnly,
    CommandExecuted,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::NoCommandExtracted,
        EventType::ValidationFailed,
        EventType::UserRejected,
        EventType::AuditOnly,
        EventType::CommandExecuted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::NoCommandExtracted => "no_command_extracted",
            EventType::ValidationFailed => "validation_failed",
            EventType::UserRejected => "user_rejected",
            EventType::AuditOnly => "audit_only",
            EventType::CommandExecuted => "command_executed",
        }
    }

    /// Validation failures and approval denials.
    pub fn is_rejection(self) -> bool {
        matches!(self, EventType::ValidationFailed | EventType::UserRejected)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// One row of the audit log.
///
/// The per-event constructors keep `executed == Some(true)` tied to
/// `approved == Some(true)` and a result summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Row id, present on records read back from the store.
    pub id: Option<i64>,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub source: String,
    pub input: String,
    pub suggestion: Option<String>,
    pub extracted_command: Option<String>,
    pub approved: Option<bool>,
    pub executed: Option<bool>,
    pub result_summary: Option<String>,
}

impl AuditRecord {
    fn base(request: &Request, event_type: EventType) -> Self {
        Self {
            id: None,
            request_id: request.id,
            // Stored with microsecond precision.
            timestamp: Utc::now().trunc_subsecs(6),
            event_type,
            source: request.source.clone(),
            input: request.raw_input.clone(),
            suggestion: request.suggestion.clone(),
            extracted_command: request.extracted_command.clone(),
            approved: None,
            executed: None,
            result_summary: None,
        }
    }

    pub fn no_command(request: &Request) -> Self {
        Self {
            result_summary: Some("no actionable command".into()),
            ..Self::base(request, EventType::NoCommandExtracted)
        }
    }

    pub fn validation_failed(request: &Request, reason: &str) -> Self {
        Self {
            approved: Some(false),
            executed: Some(false),
            result_summary: Some(reason.to_string()),
            ..Self::base(request, EventType::ValidationFailed)
        }
    }

    pub fn user_rejected(request: &Request, reason: &str) -> Self {
        Self {
            approved: Some(false),
            executed: Some(false),
            result_summary: Some(reason.to_string()),
            ..Self::base(request, EventType::UserRejected)
        }
    }

    pub fn audit_only(request: &Request) -> Self {
        Self {
            approved: Some(true),
            executed: Some(false),
            result_summary: Some("execution skipped (audit_only mode)".into()),
            ..Self::base(request, EventType::AuditOnly)
        }
    }

    pub fn executed(request: &Request, result: &ExecutionResult) -> Self {
        Self {
            approved: Some(true),
            executed: Some(true),
            result_summary: Some(result.to_summary()),
            ..Self::base(request, EventType::CommandExecuted)
        }
    }

    /// Parse the stored execution result, for `command_executed` rows.
    pub fn execution_result(&self) -> Option<ExecutionResult> {
        if self.event_type != EventType::CommandExecuted {
            return None;
        }
        serde_json::from_str(self.result_summary.as_deref()?).ok()
    }
}
