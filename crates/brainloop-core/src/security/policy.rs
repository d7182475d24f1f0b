//! Policy evolution rules.
//!
//! A pure reducer over a command's observed execution history. The registry
//! loads a [`CommandStats`] snapshot, [`evaluate`] picks at most one state
//! change, and the registry applies it in its own transaction. Rules are
//! advisory and one-directional: a success streak may promote, but a failure
//! streak never demotes (demotion is operator-only via `user_override`).

use serde::{Deserialize, Serialize};

use super::patterns::matches_dangerous_pattern;

/// Executions required before a command is eligible for promotion.
pub const PROMOTION_MIN_EXECUTIONS: u64 = 20;

/// Minimum success rate for promotion.
pub const PROMOTION_MIN_SUCCESS_RATE: f64 = 0.95;

/// Risk score at or above which a command is never promoted.
pub const PROMOTION_MAX_RISK: f64 = 0.7;

/// Promotion requires an execution within this many seconds of now.
pub const PROMOTION_RECENCY_SECS: i64 = 30 * 24 * 3600;

/// Executions required before the monitoring rule can fire.
pub const MONITORING_MIN_EXECUTIONS: u64 = 50;

/// Mean interval (seconds) below which the last ten executions look like a
/// polling loop.
pub const MONITORING_MAX_INTERVAL_SECS: f64 = 5.0;

/// Mean interval (seconds) above which a command counts as rare.
pub const RARITY_MIN_INTERVAL_SECS: f64 = 3600.0;

/// Duplicate threshold applied to rare commands, in milliseconds.
pub const RARITY_THRESHOLD_MS: i64 = 30_000;

/// Engine-computed policy for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    AutoApprove,
    Ask,
    AskWarning,
}

impl Policy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoApprove => "auto_approve",
            Self::Ask => "ask",
            Self::AskWarning => "ask_warning",
        }
    }

    /// Parses the stored text form; unknown values fall back to `Ask`,
    /// the safe default.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "auto_approve" => Self::AutoApprove,
            "ask_warning" => Self::AskWarning,
            _ => Self::Ask,
        }
    }
}

/// Operator override; dominates [`Policy`] when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserOverride {
    AlwaysAllow,
    AlwaysAsk,
    Never,
}

impl UserOverride {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysAllow => "always_allow",
            Self::AlwaysAsk => "always_ask",
            Self::Never => "never",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "always_allow" => Some(Self::AlwaysAllow),
            "always_ask" => Some(Self::AlwaysAsk),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

/// Snapshot of a registry row plus derived fields, as consumed by the
/// policy rules.
#[derive(Debug, Clone)]
pub struct CommandStats {
    pub hash: String,
    pub command_text: String,
    pub first_seen: i64,
    pub last_executed: i64,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_duration_ms: i64,
    pub min_duration_ms: i64,
    pub max_duration_ms: i64,
    pub total_duration_ms: i64,
    pub current_policy: Policy,
    pub policy_reason: Option<String>,
    pub promoted_at: Option<i64>,
    pub user_override: Option<UserOverride>,
    pub duplicate_threshold_ms: i64,
    pub duplicate_check_enabled: bool,
    pub risk_score: f64,
    /// Parsed execution timestamps, oldest first, at most 100.
    pub timestamps: Vec<i64>,
    /// `(last_executed - first_seen) / (execution_count - 1)`, defined for
    /// two or more executions.
    pub avg_interval_seconds: Option<f64>,
}

impl CommandStats {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        self.success_count as f64 / self.execution_count as f64
    }

    /// The effective policy: override first, computed policy otherwise.
    #[must_use]
    pub fn effective_policy(&self) -> EffectivePolicy {
        match self.user_override {
            Some(over) => EffectivePolicy::Override(over),
            None => EffectivePolicy::Computed(self.current_policy),
        }
    }
}

/// Resolution of override-vs-computed policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectivePolicy {
    Override(UserOverride),
    Computed(Policy),
}

/// The single state change (if any) chosen by one evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Promote `ask` → `auto_approve`; carries the audit reason.
    Promote { reason: String },
    /// The command is a polling loop; stop flagging duplicates.
    DisableDuplicateCheck,
    /// The command is rare; widen the duplicate threshold.
    RaiseDuplicateThreshold { threshold_ms: i64 },
    /// No change.
    None,
}

/// Mean gap between consecutive timestamps, in seconds.
#[must_use]
pub fn mean_interval_secs(timestamps: &[i64]) -> Option<f64> {
    if timestamps.len() < 2 {
        return None;
    }
    let total: i64 = timestamps.windows(2).map(|w| w[1] - w[0]).sum();
    Some(total as f64 / (timestamps.len() - 1) as f64)
}

/// Applies the evolution rules in order and returns the first that fires.
///
/// Rule order matters: promotion is considered before the duplicate-check
/// adjustments, and at most one change is committed per call. The
/// dangerous-pattern check here is a pre-filter; the registry re-checks
/// inside the promotion transaction before writing.
#[must_use]
pub fn evaluate(stats: &CommandStats, now: i64) -> PolicyDecision {
    if should_promote(stats, now) {
        return PolicyDecision::Promote {
            reason: format!(
                "auto: {}+ executions, {:.0}%+ success",
                PROMOTION_MIN_EXECUTIONS,
                PROMOTION_MIN_SUCCESS_RATE * 100.0
            ),
        };
    }

    if stats.duplicate_check_enabled
        && stats.execution_count >= MONITORING_MIN_EXECUTIONS
        && is_monitoring_pattern(&stats.timestamps)
    {
        return PolicyDecision::DisableDuplicateCheck;
    }

    if stats.execution_count >= 2
        && stats.duplicate_threshold_ms != RARITY_THRESHOLD_MS
        && stats
            .avg_interval_seconds
            .is_some_and(|avg| avg > RARITY_MIN_INTERVAL_SECS)
    {
        return PolicyDecision::RaiseDuplicateThreshold {
            threshold_ms: RARITY_THRESHOLD_MS,
        };
    }

    PolicyDecision::None
}

fn should_promote(stats: &CommandStats, now: i64) -> bool {
    stats.current_policy == Policy::Ask
        && stats.execution_count >= PROMOTION_MIN_EXECUTIONS
        && stats.success_rate() >= PROMOTION_MIN_SUCCESS_RATE
        && stats.risk_score < PROMOTION_MAX_RISK
        && stats.last_executed > 0
        && now - stats.last_executed <= PROMOTION_RECENCY_SECS
        && matches_dangerous_pattern(&stats.command_text).is_none()
}

/// True when the mean interval of the last ten executions is under
/// [`MONITORING_MAX_INTERVAL_SECS`].
#[must_use]
pub fn is_monitoring_pattern(timestamps: &[i64]) -> bool {
    if timestamps.len() < 10 {
        return false;
    }
    let tail = &timestamps[timestamps.len() - 10..];
    mean_interval_secs(tail).is_some_and(|avg| avg < MONITORING_MAX_INTERVAL_SECS)
}
