//! The command governor: the orchestrated `execute_bash` workflow.
//!
//! validate → lookup → policy → duplicate-check → execute → update →
//! evolve. Observable side effects happen only in the execute/update/evolve
//! tail; everything before it is read-only. The registry transaction in the
//! update step serializes concurrent invocations of the same hash, and the
//! evolution step is best-effort: its failure is logged, never surfaced.

use std::sync::Arc;

use brainloop_core::security::policy::{EffectivePolicy, Policy, PolicyDecision, UserOverride};
use brainloop_core::security::Validator;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::metrics::Histogram;
use crate::registry::CommandRegistry;
use crate::storage::{now_unix_millis, MetadataStore};

/// Outcome of one `execute_bash` request. Soft outcomes (pending,
/// duplicate) are values, not errors; only hard failures escape as
/// [`Error`].
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ExecuteOutcome {
    Executed(ExecutionReport),
    Pending(PendingValidation),
    Duplicate(DuplicateWarning),
}

/// The approved path's response body.
#[derive(Debug, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub policy_used: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub was_timeout: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub was_truncated: bool,
}

/// Returned when the policy requires operator confirmation.
#[derive(Debug, Serialize)]
pub struct PendingValidation {
    pub status: &'static str,
    pub command: String,
    pub policy: String,
    pub risk_score: f64,
}

/// Returned when an identical invocation arrived inside the duplicate
/// threshold.
#[derive(Debug, Serialize)]
pub struct DuplicateWarning {
    pub status: &'static str,
    pub command: String,
    pub seconds_since_last: f64,
}

pub struct Governor {
    validator: Validator,
    registry: Arc<CommandRegistry>,
    executor: Executor,
    metadata: MetadataStore,
    histogram: Histogram,
}

impl Governor {
    #[must_use]
    pub fn new(
        registry: Arc<CommandRegistry>,
        executor: Executor,
        metadata: MetadataStore,
        histogram: Histogram,
    ) -> Self {
        Self {
            validator: Validator::new(),
            registry,
            executor,
            metadata,
            histogram,
        }
    }

    /// The `execute_bash` action.
    ///
    /// # Errors
    ///
    /// - `InvalidInput` when validation rejects the command.
    /// - `PolicyDenied` on a `never` override, or when the executor's
    ///   dangerous-pattern pre-flight fires (including `force_execute`
    ///   requests).
    pub async fn execute_bash(
        &self,
        command: &str,
        force_execute: bool,
    ) -> Result<ExecuteOutcome> {
        let command = self
            .validator
            .sanitize(command)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let risk_score = self.validator.risk_score(&command);
        if risk_score >= 0.8 {
            tracing::warn!(risk_score, "high risk command submitted");
        }

        let hash = self.registry.get_or_create(&command)?;
        let effective = self.registry.get_policy(&hash)?;

        if matches!(effective, EffectivePolicy::Override(UserOverride::Never)) {
            return Err(Error::PolicyDenied(
                "command blocked by operator override".to_string(),
            ));
        }

        let approved = force_execute
            || matches!(
                effective,
                EffectivePolicy::Computed(Policy::AutoApprove)
                    | EffectivePolicy::Override(UserOverride::AlwaysAllow)
            );

        if !approved {
            let check = self.registry.get_duplication_check(&hash)?;
            if check.enabled {
                if let Some(last) = check.last_executed {
                    let elapsed_ms = now_unix_millis() - last * 1000;
                    if elapsed_ms < check.threshold_ms {
                        tracing::info!(
                            command_hash = %hash,
                            elapsed_ms,
                            threshold_ms = check.threshold_ms,
                            "duplicate invocation suppressed"
                        );
                        return Ok(ExecuteOutcome::Duplicate(DuplicateWarning {
                            status: "duplicate_warning",
                            command,
                            seconds_since_last: elapsed_ms as f64 / 1000.0,
                        }));
                    }
                }
            }

            let policy = match effective {
                EffectivePolicy::Computed(p) => p.as_str(),
                EffectivePolicy::Override(o) => o.as_str(),
            };
            return Ok(ExecuteOutcome::Pending(PendingValidation {
                status: "pending_validation",
                command,
                policy: policy.to_string(),
                risk_score,
            }));
        }

        self.run_approved(&command, &hash, effective).await
    }

    async fn run_approved(
        &self,
        command: &str,
        hash: &str,
        effective: EffectivePolicy,
    ) -> Result<ExecuteOutcome> {
        let result = self.executor.execute(command).await?;

        // The registry update must land before evolution runs; a failure
        // here is the request's failure.
        self.registry
            .update_execution(hash, result.exit_code, result.duration_ms)?;

        if result.exit_code != 0 {
            if let Err(err) = self.registry.record_error_sample(hash, &result.stderr) {
                tracing::warn!(command_hash = %hash, error = %err, "failed to record error sample");
            }
        }

        // Policy evolution is best-effort.
        match self.registry.check_auto_evolution(hash) {
            Ok(PolicyDecision::Promote { reason }) => {
                self.metadata.record_event(
                    "policy_promoted",
                    &format!("command {hash} promoted to auto_approve ({reason})"),
                );
            },
            Ok(_) => {},
            Err(err) => {
                tracing::warn!(command_hash = %hash, error = %err, "policy evolution failed");
            },
        }

        if let Err(err) = self.histogram.record("execute_bash", result.duration_ms) {
            tracing::warn!(error = %err, "failed to record execution latency");
        }

        let policy_used = match effective {
            EffectivePolicy::Computed(p) => p.as_str().to_string(),
            EffectivePolicy::Override(o) => o.as_str().to_string(),
        };

        Ok(ExecuteOutcome::Executed(ExecutionReport {
            success: result.success(),
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            duration_ms: result.duration_ms,
            policy_used,
            was_timeout: result.was_timeout,
            was_truncated: result.was_truncated,
        }))
    }
}
