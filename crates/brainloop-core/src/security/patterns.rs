//! The dangerous-pattern deny-list.
//!
//! This is a table-driven constant shared by the validator's promotion gate
//! and the executor's pre-flight check. A match disqualifies a command from
//! automatic promotion and from forced execution. The list is matched
//! case-insensitively against the trimmed command text.
//!
//! Every rejection produces a [`SecurityEvent`] carrying the command hash
//! and the matched pattern; the full command text is never logged.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::command_hash;

/// Patterns whose match marks a command as dangerous. Case-insensitive
/// where it matters; the fork-bomb signature is matched literally.
pub const DANGEROUS_PATTERNS: &[&str] = &[
    r"(?i)rm\s+-rf\s+/",
    r"(?i)chmod\s+777",
    r"(?i)mkfs\.[a-z0-9]+",
    r"(?i)dd\s+if=/dev/",
    r":\(\)\{.*\|.*&\s*\};:",
    r"(?i)wget.*\|.*sh",
    r"(?i)curl.*\|.*bash",
    r"(?i)eval\s+\$",
    r"(?i)sudo\s+(su|-i)",
    r"(?i)>\s*/dev/",
    r"(?i)rm\s+-rf\s+.*\*",
    r"(?i)chmod\s+-R\s+777",
    r"(?i)chown\s+-R\s+root",
    r"(?i)shred\s+.*\*",
    r"(?i)dd\s+of=/dev/",
    r"(?i)exec\s+.*sh",
    r"(?i)system\s*\(",
    r"(?i)export\s+PATH=.*\.\.",
    r"(?i)\$\(\s*.*\|\s*sh\s*\)",
    r"(?i)`\s*.*\|\s*sh\s*`",
];

static COMPILED: Lazy<Vec<Regex>> = Lazy::new(|| {
    DANGEROUS_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("dangerous pattern must compile"))
        .collect()
});

/// A security-relevant rejection, logged as structured JSON.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub timestamp: i64,
    pub command_hash: String,
    pub event_type: String,
    pub details: String,
}

impl SecurityEvent {
    #[must_use]
    pub fn new(command: &str, event_type: &str, details: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            command_hash: command_hash(command),
            event_type: event_type.to_string(),
            details: details.to_string(),
        }
    }

    /// Emits the event to the log stream. The command text itself is not
    /// part of the event; only its hash is.
    pub fn emit(&self) {
        tracing::warn!(
            command_hash = %self.command_hash,
            event_type = %self.event_type,
            details = %self.details,
            "SECURITY event"
        );
    }
}

/// An attempt to execute or promote a command that matches the deny-list.
#[derive(Debug, Error)]
#[error("command blocked by dangerous pattern: {pattern}")]
pub struct SecurityError {
    pub pattern: String,
}

/// Returns the first dangerous pattern that matches `command`, if any.
///
/// The command is trimmed and lowercased before matching, so callers do not
/// need to normalize.
#[must_use]
pub fn matches_dangerous_pattern(command: &str) -> Option<&'static str> {
    let normalized = command.trim().to_lowercase();
    COMPILED
        .iter()
        .zip(DANGEROUS_PATTERNS)
        .find(|(re, _)| re.is_match(&normalized))
        .map(|(_, pattern)| *pattern)
}

/// The promotion security gate: refuses any command matching the deny-list
/// and records a `DANGEROUS_PATTERN_BLOCKED` event.
///
/// This runs once in the policy engine and again inside the registry's
/// promotion transaction, so a command can never reach `auto_approve` while
/// matching the list.
///
/// # Errors
///
/// Returns [`SecurityError`] naming the matched pattern.
pub fn validate_promotion(command: &str) -> Result<(), SecurityError> {
    if let Some(pattern) = matches_dangerous_pattern(command) {
        SecurityEvent::new(command, "DANGEROUS_PATTERN_BLOCKED", pattern).emit();
        return Err(SecurityError {
            pattern: pattern.to_string(),
        });
    }
    Ok(())
}
