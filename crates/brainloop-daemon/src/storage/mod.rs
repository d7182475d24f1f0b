//! The embedded storage layer.
//!
//! brainloop persists all operational state in five SQLite databases, each
//! with a single responsibility:
//!
//! | Database | File | Holds |
//! |---|---|---|
//! | input | `brainloop.input.db` | descriptions of external sources (read-mostly) |
//! | lifecycle | `brainloop.lifecycle.db` | sessions, blocks, refinements, the processed-log ledger, reader cache |
//! | output | `brainloop.output.db` | published results, heartbeat, metrics, digests, latency histogram |
//! | metadata | `brainloop.metadata.db` | secrets, telemetry events, poison pill |
//! | command security | `command_security.db` | the command registry (isolated from the session hot path) |
//!
//! Every database is opened with the same pragma set, applied in order and
//! verified: `journal_mode = WAL`, `synchronous = NORMAL`,
//! `foreign_keys = ON`, `busy_timeout = 5000`, `cache_size = -64000`.
//! Schemas load from `*_schema.sql` files in the working directory and are
//! idempotent. No runtime path ever ATTACHes one database to another;
//! cross-database references carry an identifier only.

pub mod lifecycle;
pub mod metadata;
pub mod output;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::{Error, Result};

pub use lifecycle::LifecycleStore;
pub use metadata::MetadataStore;
pub use output::OutputStore;

/// A database handle shared between repositories and request tasks.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Locks a shared connection, recovering from a poisoned mutex (a panicked
/// holder cannot corrupt SQLite state mid-statement).
pub fn lock(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Database file names, fixed by the on-disk contract.
pub const INPUT_DB: &str = "brainloop.input.db";
pub const LIFECYCLE_DB: &str = "brainloop.lifecycle.db";
pub const OUTPUT_DB: &str = "brainloop.output.db";
pub const METADATA_DB: &str = "brainloop.metadata.db";
pub const COMMAND_SECURITY_DB: &str = "command_security.db";

/// Schema file names, read from the working directory on first open.
pub const INPUT_SCHEMA: &str = "brainloop.input_schema.sql";
pub const LIFECYCLE_SCHEMA: &str = "brainloop.lifecycle_schema.sql";
pub const OUTPUT_SCHEMA: &str = "brainloop.output_schema.sql";
pub const METADATA_SCHEMA: &str = "brainloop.metadata_schema.sql";
pub const COMMAND_SECURITY_SCHEMA: &str = "command_security_schema.sql";

/// Opens one database, applies and verifies the standard pragmas, and runs
/// its schema file.
///
/// # Errors
///
/// `Fatal` when the schema file is missing or unreadable, when the WAL
/// pragma does not take effect, or when the database cannot be opened.
pub fn open_database(db_path: &Path, schema_path: &Path) -> Result<SharedConnection> {
    let conn = Connection::open(db_path)
        .map_err(|e| Error::Fatal(format!("cannot open {}: {e}", db_path.display())))?;

    apply_pragmas(&conn)?;

    let schema = std::fs::read_to_string(schema_path).map_err(|e| {
        Error::Fatal(format!(
            "cannot read schema file {}: {e}",
            schema_path.display()
        ))
    })?;
    conn.execute_batch(&schema).map_err(|e| {
        Error::Fatal(format!(
            "schema {} failed to apply: {e}",
            schema_path.display()
        ))
    })?;

    Ok(Arc::new(Mutex::new(conn)))
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    let mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .map_err(Error::from)?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(Error::Fatal(format!(
            "journal_mode is {mode}, expected wal"
        )));
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "cache_size", -64000)?;
    Ok(())
}

/// The four general-purpose database handles. The command-security database
/// is owned by the registry and not listed here.
pub struct Databases {
    pub input: SharedConnection,
    pub lifecycle: SharedConnection,
    pub output: SharedConnection,
    pub metadata: SharedConnection,
    dir: PathBuf,
}

impl Databases {
    /// Opens all four databases in `dir`, reading schema files from the
    /// same directory.
    ///
    /// # Errors
    ///
    /// `Fatal` on any open or schema failure; partial opens are dropped.
    pub fn open(dir: &Path) -> Result<Self> {
        let open = |db: &str, schema: &str| open_database(&dir.join(db), &dir.join(schema));
        Ok(Self {
            input: open(INPUT_DB, INPUT_SCHEMA)?,
            lifecycle: open(LIFECYCLE_DB, LIFECYCLE_SCHEMA)?,
            output: open(OUTPUT_DB, OUTPUT_SCHEMA)?,
            metadata: open(METADATA_DB, METADATA_SCHEMA)?,
            dir: dir.to_path_buf(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs `PRAGMA wal_checkpoint(RESTART)` against every handle. Part of
    /// shutdown phase 3; failures are reported, not fatal.
    pub fn checkpoint_all(&self) -> Vec<(&'static str, Result<()>)> {
        let checkpoint = |conn: &SharedConnection| -> Result<()> {
            lock(conn)
                .query_row("PRAGMA wal_checkpoint(RESTART)", [], |_| Ok(()))
                .map_err(Error::from)?;
            Ok(())
        };
        vec![
            ("input", checkpoint(&self.input)),
            ("lifecycle", checkpoint(&self.lifecycle)),
            ("output", checkpoint(&self.output)),
            ("metadata", checkpoint(&self.metadata)),
        ]
    }
}

/// Current time as unix seconds.
#[must_use]
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current time as unix milliseconds.
#[must_use]
pub fn now_unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    /// Writes the repository's schema files into a test directory so
    /// `Databases::open` finds them where the worker would.
    pub fn write_schema_files(dir: &Path) {
        const SCHEMAS: &[(&str, &str)] = &[
            (
                super::INPUT_SCHEMA,
                include_str!("../../../../brainloop.input_schema.sql"),
            ),
            (
                super::LIFECYCLE_SCHEMA,
                include_str!("../../../../brainloop.lifecycle_schema.sql"),
            ),
            (
                super::OUTPUT_SCHEMA,
                include_str!("../../../../brainloop.output_schema.sql"),
            ),
            (
                super::METADATA_SCHEMA,
                include_str!("../../../../brainloop.metadata_schema.sql"),
            ),
            (
                super::COMMAND_SECURITY_SCHEMA,
                include_str!("../../../../command_security_schema.sql"),
            ),
        ];
        for (name, contents) in SCHEMAS {
            std::fs::write(dir.join(name), contents).expect("write schema file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_with_verified_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        testutil::write_schema_files(dir.path());
        let dbs = Databases::open(dir.path()).unwrap();

        let conn = lock(&dbs.lifecycle);
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let busy: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |r| r.get(0))
            .unwrap();
        assert_eq!(busy, 5000);
        let fks: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fks, 1);
    }

    #[test]
    fn schemas_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        testutil::write_schema_files(dir.path());
        drop(Databases::open(dir.path()).unwrap());
        // A second open re-runs every schema file against existing tables.
        drop(Databases::open(dir.path()).unwrap());
    }

    #[test]
    fn missing_schema_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = Databases::open(dir.path());
        assert!(matches!(result, Err(Error::Fatal(_))));
    }

    #[test]
    fn checkpoint_runs_on_every_database() {
        let dir = tempfile::tempdir().unwrap();
        testutil::write_schema_files(dir.path());
        let dbs = Databases::open(dir.path()).unwrap();
        let results = dbs.checkpoint_all();
        assert_eq!(results.len(), 4);
        for (name, result) in results {
            assert!(result.is_ok(), "checkpoint failed for {name}");
        }
    }

    #[test]
    fn dimension_descriptors_are_seeded() {
        let dir = tempfile::tempdir().unwrap();
        testutil::write_schema_files(dir.path());
        let dbs = Databases::open(dir.path()).unwrap();
        let count: i64 = lock(&dbs.lifecycle)
            .query_row("SELECT COUNT(*) FROM dimension_descriptors", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(count, 15);
    }
}
