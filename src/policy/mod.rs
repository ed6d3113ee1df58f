pub mod patterns;
pub mod verdict;

pub use verdict::Verdict;

use std::collections::BTreeSet;

use crate::config::SecurityConfig;

/// Immutable security policy. A reload builds a new store; existing holders
/// keep the one they captured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyStore {
    whitelist: BTreeSet<String>,
    blacklist: Vec<String>,
    require_approval_for: BTreeSet<String>,
}

impl PolicyStore {
    pub fn new<W, B, A>(whitelist: W, blacklist: B, require_approval_for: A) -> Self
    where
        W: IntoIterator,
        W::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        Self {
            whitelist: whitelist.into_iter().map(Into::into).collect(),
            blacklist: blacklist
                .into_iter()
                .map(Into::into)
                .filter(|s: &String| !s.is_empty())
                .collect(),
            require_approval_for: require_approval_for.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the store from the `[security]` section.
    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(
            config.whitelist.iter().cloned(),
            config.blacklist.iter().cloned(),
            config.require_approval_for.iter().cloned(),
        )
    }

    pub fn whitelist(&self) -> &BTreeSet<String> {
        &self.whitelist
    }

    pub fn blacklist(&self) -> &[String] {
        &self.blacklist
    }

    pub fn require_approval_for(&self) -> &BTreeSet<String> {
        &self.require_approval_for
    }

    /// Validate a command. Checks run in a fixed order: empty, dangerous
    /// patterns, blacklist, whitelist.
    pub fn validate(&self, command: &str) -> Verdict {
        let cmd = command.trim();
        if cmd.is_empty() {
            return Verdict::reject("empty command");
        }

        if let Some(pattern) = patterns::find_dangerous(cmd) {
            return Verdict::reject(format!("command contains dangerous pattern: {pattern}"));
        }

        if let Some(blocked) = self.blacklist.iter().find(|b| cmd.contains(b.as_str())) {
            return Verdict::reject(format!(
                "command contains blacklisted pattern: {blocked}"
            ));
        }

        let base = base_command(cmd);
        if !self.whitelist.is_empty() && !self.whitelist.contains(base) {
            return Verdict::reject(format!("command '{base}' not in whitelist"));
        }

        Verdict::accept()
    }

    /// Whether the command's base command always requires approval.
    pub fn needs_approval(&self, command: &str) -> bool {
        self.require_approval_for.contains(base_command(command))
    }
}

/// The first whitespace-delimited token of a command.
pub fn base_command(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}
