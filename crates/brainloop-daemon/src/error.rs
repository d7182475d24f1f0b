//! Worker error kinds and their RPC mapping.
//!
//! Terminal failures are variants of [`Error`]; the soft conditions
//! (`duplicate_warning`, `was_truncated`, ledger conflicts) are fields of
//! successful result bodies and never appear here. `Transient` is retried
//! once at the call site before it escalates; `Fatal` aborts the worker.

use thiserror::Error;

/// RPC error code for action failures.
pub const RPC_ACTION_FAILED: i64 = -32000;
/// RPC error code for parse errors.
pub const RPC_PARSE_ERROR: i64 = -32700;
/// RPC error code for unknown methods.
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
/// RPC error code for invalid params.
pub const RPC_INVALID_PARAMS: i64 = -32602;

/// Terminal failure of a worker operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The request failed static validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Blocked by a `never` override or a dangerous-pattern match.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// An operation exceeded its wall-clock budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The completion API failed after retries.
    #[error("external failure: {0}")]
    ExternalFailure(String),

    /// The database stayed busy past its timeout; retried once before
    /// escalating to `ExternalFailure`.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Unrecoverable: missing schema, held lock, corrupt database.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    /// The JSON-RPC error code this failure surfaces as.
    #[must_use]
    pub const fn rpc_code(&self) -> i64 {
        RPC_ACTION_FAILED
    }

    /// Whether one retry at the call site is warranted.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::DatabaseBusy
                    || code.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                Self::Transient(err.to_string())
            },
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::NotADatabase
                    || code.code == rusqlite::ErrorCode::DatabaseCorrupt =>
            {
                Self::Fatal(err.to_string())
            },
            _ => Self::ExternalFailure(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(Error::from(err).is_transient());
    }

    #[test]
    fn all_terminal_kinds_share_the_action_code() {
        for err in [
            Error::InvalidInput("x".into()),
            Error::PolicyDenied("x".into()),
            Error::Timeout("x".into()),
            Error::ExternalFailure("x".into()),
        ] {
            assert_eq!(err.rpc_code(), RPC_ACTION_FAILED);
        }
    }
}
