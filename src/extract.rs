//! Pull an executable command out of a model suggestion.

/// Prefixes stripped from a suggestion, in priority order. Each is tried
/// once, after the previous strip.
const SUGGESTION_PREFIXES: &[&str] = &["I suggest running:", "Execute:", "Command:", "$", "#"];

const FENCE: &str = "```";

/// Derive the command from a suggestion. Returns `None` when nothing
/// actionable remains.
pub fn extract_command(suggestion: &str) -> Option<String> {
    let mut text = suggestion.trim();
    for prefix in SUGGESTION_PREFIXES {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim();
        }
    }

    let command = if text.starts_with(FENCE) {
        unfence(text)
    } else {
        text.to_string()
    };

    let command = command.trim();
    if command.is_empty() {
        None
    } else {
        Some(command.to_string())
    }
}

/// Drop the opening fence line (with any language tag) and the closing fence
/// line if present, keeping the interior.
fn unfence(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().skip(1).collect();
    if lines.last().is_some_and(|l| l.trim_start().starts_with(FENCE)) {
        lines.pop();
    }
    lines.join("\n")
}
