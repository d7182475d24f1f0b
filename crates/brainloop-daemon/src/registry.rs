//! The persistent command registry.
//!
//! One row per unique command text in `command_security.db`, keyed by the
//! SHA-256 of the raw text. The registry owns every mutation of registry
//! state; the policy rules themselves are pure functions in
//! `brainloop_core::security::policy`, applied here inside transactions.
//!
//! Counter updates and promotions run under `BEGIN IMMEDIATE` so that
//! concurrent governors serialize on the row. The dangerous-pattern
//! re-check runs inside the promotion transaction: a command matching the
//! deny-list cannot reach `auto_approve` under any interleaving.

use std::path::Path;

use brainloop_core::security::policy::{
    evaluate, CommandStats, EffectivePolicy, Policy, PolicyDecision, UserOverride,
};
use brainloop_core::security::{command_hash, validate_promotion, Validator};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Error, Result};
use crate::storage::{lock, now_unix, open_database, SharedConnection};

/// Default minimum gap between identical invocations, in milliseconds.
pub const DEFAULT_DUPLICATE_THRESHOLD_MS: i64 = 2000;

/// Maximum entries kept in the timestamp series.
pub const TIMESTAMP_SERIES_CAP: usize = 100;

/// Maximum distinct stderr samples kept per command.
pub const COMMON_ERROR_SAMPLES: usize = 10;

/// Duplicate-detection inputs for one command.
#[derive(Debug, Clone, Copy)]
pub struct DuplicationCheck {
    pub last_executed: Option<i64>,
    pub threshold_ms: i64,
    pub enabled: bool,
}

pub struct CommandRegistry {
    conn: SharedConnection,
    validator: Validator,
}

impl CommandRegistry {
    /// Opens (or creates) the command-security database with the standard
    /// pragmas and schema.
    ///
    /// # Errors
    ///
    /// `Fatal` on open or schema failure.
    pub fn open(db_path: &Path, schema_path: &Path) -> Result<Self> {
        Ok(Self {
            conn: open_database(db_path, schema_path)?,
            validator: Validator::new(),
        })
    }

    /// Ensures a row exists for `command_text` and returns its hash.
    /// Idempotent: repeated calls return the same hash and leave the row
    /// count unchanged.
    pub fn get_or_create(&self, command_text: &str) -> Result<String> {
        let hash = command_hash(command_text);
        let now = now_unix();
        let risk = self.validator.risk_score(command_text);
        lock(&self.conn).execute(
            "INSERT OR IGNORE INTO commands_registry
             (command_hash, command_text, first_seen, created_at, updated_at, risk_score)
             VALUES (?1, ?2, ?3, ?3, ?3, ?4)",
            params![hash, command_text, now, risk],
        )?;
        Ok(hash)
    }

    /// Records one execution atomically: appends the timestamp (evicting
    /// past 100), bumps `execution_count` and exactly one of the outcome
    /// counters, and recomputes the duration aggregates.
    pub fn update_execution(&self, hash: &str, exit_code: i32, duration_ms: i64) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (series, mut exec, mut ok, mut fail, mut min, mut max, mut total): (
            String,
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = tx
            .query_row(
                "SELECT last_100_timestamps, execution_count, success_count, failure_count,
                        min_duration_ms, max_duration_ms, total_duration_ms
                 FROM commands_registry WHERE command_hash = ?1",
                params![hash],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| Error::InvalidInput(format!("unknown command hash {hash}")))?;

        let now = now_unix();
        let mut timestamps = parse_timestamps(&series);
        timestamps.push(now);
        if timestamps.len() > TIMESTAMP_SERIES_CAP {
            let drop = timestamps.len() - TIMESTAMP_SERIES_CAP;
            timestamps.drain(..drop);
        }

        exec += 1;
        if exit_code == 0 {
            ok += 1;
        } else {
            fail += 1;
        }
        min = if exec == 1 { duration_ms } else { min.min(duration_ms) };
        max = max.max(duration_ms);
        total += duration_ms;
        let avg = if exec > 0 {
            (total as f64 / exec as f64).round() as i64
        } else {
            0
        };

        tx.execute(
            "UPDATE commands_registry
             SET execution_count = ?1, success_count = ?2, failure_count = ?3,
                 avg_duration_ms = ?4, min_duration_ms = ?5, max_duration_ms = ?6,
                 total_duration_ms = ?7, last_executed = ?8, last_100_timestamps = ?9,
                 typical_exit_codes = ?10, updated_at = ?8
             WHERE command_hash = ?11",
            params![
                exec,
                ok,
                fail,
                avg,
                min,
                max,
                total,
                now,
                format_timestamps(&timestamps),
                bump_exit_code_json(&tx, hash, exit_code)?,
                hash
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Loads a full stats snapshot with derived fields, as consumed by the
    /// policy rules. The risk score is recomputed from the stored text so
    /// it always reflects the current validator.
    pub fn get_stats(&self, hash: &str) -> Result<CommandStats> {
        let conn = lock(&self.conn);
        self.stats_on(&conn, hash)
    }

    fn stats_on(&self, conn: &Connection, hash: &str) -> Result<CommandStats> {
        let row = conn
            .query_row(
                "SELECT command_text, first_seen, last_executed, execution_count, success_count,
                        failure_count, avg_duration_ms, min_duration_ms, max_duration_ms,
                        total_duration_ms, current_policy, policy_reason, promoted_at,
                        user_override, duplicate_threshold_ms, duplicate_check_enabled,
                        last_100_timestamps
                 FROM commands_registry WHERE command_hash = ?1",
                params![hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, Option<i64>>(12)?,
                        row.get::<_, Option<String>>(13)?,
                        row.get::<_, i64>(14)?,
                        row.get::<_, bool>(15)?,
                        row.get::<_, String>(16)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| Error::InvalidInput(format!("unknown command hash {hash}")))?;

        let (
            command_text,
            first_seen,
            last_executed,
            execution_count,
            success_count,
            failure_count,
            avg_duration_ms,
            min_duration_ms,
            max_duration_ms,
            total_duration_ms,
            current_policy,
            policy_reason,
            promoted_at,
            user_override,
            duplicate_threshold_ms,
            duplicate_check_enabled,
            series,
        ) = row;

        let timestamps = parse_timestamps(&series);
        let last_executed = last_executed.unwrap_or(0);
        let avg_interval_seconds = if execution_count >= 2 && last_executed > 0 {
            Some((last_executed - first_seen).max(0) as f64 / (execution_count - 1) as f64)
        } else {
            None
        };

        Ok(CommandStats {
            hash: hash.to_string(),
            risk_score: self.validator.risk_score(&command_text),
            command_text,
            first_seen,
            last_executed,
            execution_count: execution_count.max(0) as u64,
            success_count: success_count.max(0) as u64,
            failure_count: failure_count.max(0) as u64,
            avg_duration_ms,
            min_duration_ms,
            max_duration_ms,
            total_duration_ms,
            current_policy: Policy::parse(&current_policy),
            policy_reason,
            promoted_at,
            user_override: user_override.as_deref().and_then(UserOverride::parse),
            duplicate_threshold_ms,
            duplicate_check_enabled,
            timestamps,
            avg_interval_seconds,
        })
    }

    /// Resolves the effective policy: the operator override when present,
    /// otherwise the engine-computed policy (`ask` for unknown rows).
    pub fn get_policy(&self, hash: &str) -> Result<EffectivePolicy> {
        let row: Option<(String, Option<String>)> = lock(&self.conn)
            .query_row(
                "SELECT current_policy, user_override FROM commands_registry
                 WHERE command_hash = ?1",
                params![hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(match row {
            Some((_, Some(over))) if UserOverride::parse(&over).is_some() => {
                EffectivePolicy::Override(UserOverride::parse(&over).expect("checked"))
            },
            Some((policy, _)) => EffectivePolicy::Computed(Policy::parse(&policy)),
            None => EffectivePolicy::Computed(Policy::Ask),
        })
    }

    /// Duplicate-detection inputs: the last execution timestamp, the
    /// per-command threshold, and whether the check is enabled at all.
    pub fn get_duplication_check(&self, hash: &str) -> Result<DuplicationCheck> {
        let row: Option<(String, i64, bool)> = lock(&self.conn)
            .query_row(
                "SELECT last_100_timestamps, duplicate_threshold_ms, duplicate_check_enabled
                 FROM commands_registry WHERE command_hash = ?1",
                params![hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(match row {
            Some((series, threshold_ms, enabled)) => DuplicationCheck {
                last_executed: parse_timestamps(&series).last().copied(),
                threshold_ms,
                enabled,
            },
            None => DuplicationCheck {
                last_executed: None,
                threshold_ms: DEFAULT_DUPLICATE_THRESHOLD_MS,
                enabled: true,
            },
        })
    }

    /// Sets an operator override with its audit fields.
    pub fn set_user_override(
        &self,
        hash: &str,
        over: UserOverride,
        reason: &str,
    ) -> Result<()> {
        let changed = lock(&self.conn).execute(
            "UPDATE commands_registry
             SET user_override = ?1, user_override_reason = ?2, user_override_at = ?3,
                 updated_at = ?3
             WHERE command_hash = ?4",
            params![over.as_str(), reason, now_unix(), hash],
        )?;
        if changed == 0 {
            return Err(Error::InvalidInput(format!("unknown command hash {hash}")));
        }
        Ok(())
    }

    /// Applies one policy-evolution pass and returns the decision that was
    /// committed, if any. Called by the governor after every
    /// `update_execution`.
    ///
    /// Promotion re-runs the dangerous-pattern gate inside its own
    /// `BEGIN IMMEDIATE` transaction with the row locked; a match there
    /// fails the promotion with `PolicyDenied`.
    pub fn check_auto_evolution(&self, hash: &str) -> Result<PolicyDecision> {
        let stats = self.get_stats(hash)?;
        let decision = evaluate(&stats, now_unix());
        match &decision {
            PolicyDecision::Promote { reason } => self.promote(hash, reason)?,
            PolicyDecision::DisableDuplicateCheck => {
                lock(&self.conn).execute(
                    "UPDATE commands_registry
                     SET duplicate_check_enabled = 0, policy_reason = 'monitoring loop detected',
                         policy_last_updated = ?1, updated_at = ?1
                     WHERE command_hash = ?2",
                    params![now_unix(), hash],
                )?;
            },
            PolicyDecision::RaiseDuplicateThreshold { threshold_ms } => {
                lock(&self.conn).execute(
                    "UPDATE commands_registry
                     SET duplicate_threshold_ms = ?1, policy_reason = 'rare command',
                         policy_last_updated = ?2, updated_at = ?2
                     WHERE command_hash = ?3",
                    params![threshold_ms, now_unix(), hash],
                )?;
            },
            PolicyDecision::None => {},
        }
        Ok(decision)
    }

    /// Promotes `ask` → `auto_approve` under the row lock, re-running the
    /// dangerous-pattern gate first.
    ///
    /// # Errors
    ///
    /// `PolicyDenied` when the stored text matches the deny-list; the
    /// transaction rolls back and the row is unchanged.
    pub fn promote(&self, hash: &str, reason: &str) -> Result<()> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let command_text: String = tx
            .query_row(
                "SELECT command_text FROM commands_registry WHERE command_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::InvalidInput(format!("unknown command hash {hash}")))?;

        validate_promotion(&command_text)
            .map_err(|err| Error::PolicyDenied(err.to_string()))?;

        let now = now_unix();
        tx.execute(
            "UPDATE commands_registry
             SET current_policy = ?1, policy_reason = ?2, policy_last_updated = ?3,
                 promoted_at = ?3, updated_at = ?3
             WHERE command_hash = ?4",
            params![Policy::AutoApprove.as_str(), reason, now, hash],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Records the first line of a failed command's stderr into the
    /// `common_errors` sample, keeping the most recent distinct entries.
    pub fn record_error_sample(&self, hash: &str, error_text: &str) -> Result<()> {
        let first_line = error_text.lines().next().unwrap_or("").trim();
        if first_line.is_empty() {
            return Ok(());
        }
        let truncated: String = first_line.chars().take(200).collect();

        let mut conn = lock(&self.conn);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored: String = tx
            .query_row(
                "SELECT common_errors FROM commands_registry WHERE command_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::InvalidInput(format!("unknown command hash {hash}")))?;

        let mut samples: Vec<String> = serde_json::from_str(&stored).unwrap_or_default();
        samples.retain(|s| s != &truncated);
        samples.push(truncated);
        if samples.len() > COMMON_ERROR_SAMPLES {
            let drop = samples.len() - COMMON_ERROR_SAMPLES;
            samples.drain(..drop);
        }

        tx.execute(
            "UPDATE commands_registry SET common_errors = ?1, updated_at = ?2
             WHERE command_hash = ?3",
            params![
                serde_json::to_string(&samples)
                    .map_err(|e| Error::ExternalFailure(e.to_string()))?,
                now_unix(),
                hash
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Parsed `common_errors` sample for one command.
    pub fn error_samples(&self, hash: &str) -> Result<Vec<String>> {
        let stored: Option<String> = lock(&self.conn)
            .query_row(
                "SELECT common_errors FROM commands_registry WHERE command_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    /// Total registered commands; used by `get_stats` reporting.
    pub fn command_count(&self) -> Result<i64> {
        let count = lock(&self.conn).query_row(
            "SELECT COUNT(*) FROM commands_registry",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Parses the semicolon-separated timestamp series, tolerating surrounding
/// whitespace and skipping malformed tokens.
#[must_use]
pub fn parse_timestamps(series: &str) -> Vec<i64> {
    series
        .split(';')
        .filter_map(|token| token.trim().parse::<i64>().ok())
        .collect()
}

#[must_use]
pub fn format_timestamps(timestamps: &[i64]) -> String {
    timestamps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";")
}

/// Increments this exit code's count in the stored `typical_exit_codes`
/// JSON object and returns the updated serialization.
fn bump_exit_code_json(conn: &Connection, hash: &str, exit_code: i32) -> Result<String> {
    let stored: String = conn
        .query_row(
            "SELECT typical_exit_codes FROM commands_registry WHERE command_hash = ?1",
            params![hash],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or_else(|| "{}".to_string());

    let mut map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&stored).unwrap_or_default();
    let key = exit_code.to_string();
    let count = map.get(&key).and_then(serde_json::Value::as_i64).unwrap_or(0);
    map.insert(key, serde_json::Value::from(count + 1));
    Ok(serde_json::Value::Object(map).to_string())
}
