//! Human-in-the-loop approval before execution.

use std::io::{BufRead, Write};
use std::sync::{Mutex, PoisonError};

use log::info;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval prompt failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("approval input closed")]
    Closed,
    #[error("approval task aborted: {0}")]
    Aborted(String),
}

/// Decides whether an approved-by-policy command may run.
///
/// Implementations may block (e.g. waiting on a terminal); the pipeline calls
/// them from the blocking thread pool.
pub trait ApprovalGate: Send + Sync {
    fn request_approval(&self, command: &str, context: &str) -> Result<bool, ApprovalError>;
}

/// Fixed answer, for non-interactive deployments and tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticApproval(pub bool);

impl ApprovalGate for StaticApproval {
    fn request_approval(&self, command: &str, _context: &str) -> Result<bool, ApprovalError> {
        info!(
            "{} {command:?} without prompting",
            if self.0 { "approving" } else { "denying" }
        );
        Ok(self.0)
    }
}

/// Asks on the terminal: prints the command and its context, reads `y`/`N`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalApproval;

impl TerminalApproval {
    /// Prompt on arbitrary streams. Only `y`/`yes` (any case) approves.
    pub fn ask<R: BufRead, W: Write>(
        input: &mut R,
        output: &mut W,
        command: &str,
        context: &str,
    ) -> Result<bool, ApprovalError> {
        writeln!(output, "\nAPPROVAL REQUIRED: {command}")?;
        writeln!(output, "Context: {context}")?;
        write!(output, "Approve execution? [y/N]: ")?;
        output.flush()?;

        let mut answer = String::new();
        if input.read_line(&mut answer)? == 0 {
            return Err(ApprovalError::Closed);
        }
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

/// Concurrent requests take turns at the terminal.
static PROMPT: Mutex<()> = Mutex::new(());

impl ApprovalGate for TerminalApproval {
    fn request_approval(&self, command: &str, context: &str) -> Result<bool, ApprovalError> {
        let _turn = PROMPT.lock().unwrap_or_else(PoisonError::into_inner);
        let stdin = std::io::stdin();
        let stderr = std::io::stderr();
        Self::ask(&mut stdin.lock(), &mut stderr.lock(), command, context)
    }
}
