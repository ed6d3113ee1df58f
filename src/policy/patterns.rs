//! Built-in dangerous patterns. These are not configurable and win over any
//! whitelist entry.

/// Substrings rejected wherever they appear in a command.
pub const DANGEROUS_SUBSTRINGS: &[&str] = &[
    "rm -rf /",
    "dd if=",
    "> /dev/",
    "chmod 777",
    "curl | sh",
    "wget | sh",
];

/// Interpreters that must never receive piped input.
const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash", "ksh", "fish"];

/// Return the first dangerous pattern found in `command`, as a label suitable
/// for a rejection reason.
pub fn find_dangerous(command: &str) -> Option<String> {
    if let Some(p) = DANGEROUS_SUBSTRINGS.iter().find(|p| command.contains(*p)) {
        return Some((*p).to_string());
    }
    pipe_to_shell(command).map(|shell| format!("| {shell}"))
}

/// Detect `... | sh` style pipes: any `|`-separated segment after the first
/// whose leading token names a shell interpreter (optionally by path).
fn pipe_to_shell(command: &str) -> Option<&'static str> {
    command.split('|').skip(1).find_map(|segment| {
        let word = segment.split_whitespace().next()?;
        let name = word.rsplit('/').next().unwrap_or(word);
        SHELLS.iter().copied().find(|s| *s == name)
    })
}
