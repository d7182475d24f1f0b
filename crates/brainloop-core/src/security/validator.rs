//! Stateless pre-execution command validation.
//!
//! The validator answers two questions about a piece of operator-supplied
//! shell text before anything else looks at it:
//!
//! 1. Is it structurally acceptable? (`validate` / `sanitize`)
//! 2. How risky does it look? (`risk_score`, in `[0, 1]`)
//!
//! Rejections are terminal: the governor fails the request with
//! `InvalidInput` and a [`super::SecurityEvent`] is recorded. The risk score
//! is advisory; it feeds the policy engine's promotion gate and the
//! `pending_validation` response body.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::patterns::SecurityEvent;

/// Maximum accepted command length, in bytes.
pub const MAX_COMMAND_LENGTH: usize = 4096;

/// Command-substitution shapes that smuggle a download or interpreter
/// invocation into an otherwise innocuous command line.
const INJECTION_PATTERNS: &[&str] = &[
    r"\$\(\s*wget",
    r"\$\(\s*curl",
    r"\$\(\s*nc",
    r"\$\(\s*netcat",
    r"`[^`]*`",
    r"\$\(\s*sh",
    r"\$\(\s*bash",
    r"\$\(\s*zsh",
    r"\$\(\s*python",
    r"\$\(\s*perl",
    r"\$\(\s*ruby",
    r"\$\(\s*node",
    r"\$\(\s*php",
];

static INJECTION: Lazy<Vec<Regex>> = Lazy::new(|| {
    INJECTION_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("injection pattern must compile"))
        .collect()
});

static BASE64_DECODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(base64\s+-d|echo\s+[^|]*\|\s*base64\s+-d)").unwrap());
static XXD_DECODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(xxd\s+-r|echo\s+[^|]*\|\s*xxd\s+-r)").unwrap());

/// Terms that escalate privileges or touch block devices; none of them has
/// a legitimate use under this worker.
const FORBIDDEN_TERMS: &[&str] = &[
    "sudo", "su ", "passwd", "chroot", "mount ", "umount ", "fdisk", "mkfs", "format",
];

/// Why a command failed validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("command exceeds maximum length of {max} bytes (got {len})")]
    TooLong { len: usize, max: usize },

    #[error("command contains a forbidden control character")]
    ControlCharacter,

    #[error("command is empty after trimming")]
    Empty,

    #[error("command contains a non-printable character")]
    NonPrintable,

    #[error("potential injection detected: {pattern}")]
    Injection { pattern: String },

    #[error("network redirection via /dev/tcp or /dev/udp is not allowed")]
    NetworkRedirection,

    #[error("forbidden term detected: {term}")]
    ForbiddenTerm { term: &'static str },

    #[error("{kind} decoding pipeline detected")]
    DecodePipeline { kind: &'static str },
}

/// Stateless command validator. One instance is shared by the governor and
/// the policy engine; it holds no mutable state.
#[derive(Debug, Clone)]
pub struct Validator {
    max_length: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            max_length: MAX_COMMAND_LENGTH,
        }
    }
}

impl Validator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the structural acceptability of `command`.
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a [`ValidationError`]; a
    /// `SECURITY` event is emitted for the rejection.
    pub fn validate(&self, command: &str) -> Result<(), ValidationError> {
        self.validate_inner(command).map_err(|err| {
            SecurityEvent::new(command, "VALIDATION_REJECTED", &err.to_string()).emit();
            err
        })
    }

    fn validate_inner(&self, command: &str) -> Result<(), ValidationError> {
        if command.len() > self.max_length {
            return Err(ValidationError::TooLong {
                len: command.len(),
                max: self.max_length,
            });
        }

        if command.contains('\0') || command.contains('\r') || command.contains('\n') {
            return Err(ValidationError::ControlCharacter);
        }

        for (re, pattern) in INJECTION.iter().zip(INJECTION_PATTERNS) {
            if re.is_match(command) {
                return Err(ValidationError::Injection {
                    pattern: (*pattern).to_string(),
                });
            }
        }

        if command.contains("/dev/tcp") || command.contains("/dev/udp") {
            return Err(ValidationError::NetworkRedirection);
        }

        let lowered = command.to_lowercase();
        for term in FORBIDDEN_TERMS {
            if lowered.contains(term) {
                return Err(ValidationError::ForbiddenTerm { term });
            }
        }

        if BASE64_DECODE.is_match(command) {
            return Err(ValidationError::DecodePipeline { kind: "base64" });
        }
        if XXD_DECODE.is_match(command) {
            return Err(ValidationError::DecodePipeline { kind: "hex" });
        }

        Ok(())
    }

    /// Trims the command, rejects empty and non-printable input, then runs
    /// [`Self::validate`] on the result. The governor always goes through
    /// this entry point.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for the first failing check.
    pub fn sanitize(&self, command: &str) -> Result<String, ValidationError> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::Empty);
        }

        if trimmed
            .chars()
            .any(|c| c.is_control() && c != ' ' && c != '\t')
        {
            // Control chars inside the trimmed text; CR/LF/NUL are caught
            // again below with their specific error.
            if trimmed.contains('\0') || trimmed.contains('\r') || trimmed.contains('\n') {
                return Err(ValidationError::ControlCharacter);
            }
            return Err(ValidationError::NonPrintable);
        }

        self.validate(trimmed)?;
        Ok(trimmed.to_string())
    }

    /// Additive risk score in `[0, 1]`.
    ///
    /// Base 0.3; +0.3 for destructive substrings; +0.2 for permission
    /// changes; +0.1 for more than two pipes; +0.05 for any redirection;
    /// clamped at 1.0.
    #[must_use]
    pub fn risk_score(&self, command: &str) -> f64 {
        let mut score: f64 = 0.3;

        const DESTRUCTIVE: &[&str] = &["rm ", "dd ", "mkfs", "format", "fdisk"];
        if DESTRUCTIVE.iter().any(|s| command.contains(s)) {
            score += 0.3;
        }

        const PERMISSION: &[&str] = &["chmod", "chown", "chgrp"];
        if PERMISSION.iter().any(|s| command.contains(s)) {
            score += 0.2;
        }

        if command.matches('|').count() > 2 {
            score += 0.1;
        }

        const REDIRECTION: &[&str] = &[">>", ">", "<", "2>", "2>>"];
        if REDIRECTION.iter().any(|s| command.contains(s)) {
            score += 0.05;
        }

        score.min(1.0)
    }
}
