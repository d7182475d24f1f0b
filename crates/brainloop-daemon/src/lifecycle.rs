//! Worker lifecycle: single-instance lock, working-directory validation,
//! heartbeat, and graceful-shutdown sequencing.
//!
//! Shutdown runs three ordered phases with a strict sub-60-second budget:
//!
//! 1. (≤5 s) final heartbeat with status `shutting_down`, root context
//!    cancelled, no new requests accepted.
//! 2. (≤55 s) wait for in-flight operations.
//! 3. (≤5 s) WAL checkpoint on every database, `shutdown` telemetry
//!    event, lock removed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::storage::lifecycle::LifecycleStore;
use crate::storage::output::HeartbeatRow;
use crate::storage::{now_unix, Databases, MetadataStore, OutputStore};

/// The single-instance lock file name.
pub const LOCK_FILE: &str = "brainloop.lock";

/// Heartbeat period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Phase-2 budget for in-flight operations.
pub const DRAIN_BUDGET: Duration = Duration::from_secs(55);

/// Schema files that must exist in the working directory.
pub const REQUIRED_SCHEMA_FILES: &[&str] = &[
    crate::storage::INPUT_SCHEMA,
    crate::storage::LIFECYCLE_SCHEMA,
    crate::storage::OUTPUT_SCHEMA,
    crate::storage::METADATA_SCHEMA,
    crate::storage::COMMAND_SECURITY_SCHEMA,
];

/// The directory-name guard looks for this substring.
pub const PROJECT_NAME: &str = "brainloop";

/// An exclusive-create PID lock. Held for the worker's lifetime; removed
/// on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    released: bool,
}

impl InstanceLock {
    /// Acquires the lock, reaping a stale one (dead PID) if present.
    ///
    /// # Errors
    ///
    /// `Fatal` when another live process holds the lock or the file
    /// cannot be created.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match Self::try_create(&path) {
            Ok(()) => {},
            Err(first_err) => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|contents| contents.trim().parse::<i32>().ok());
                match holder {
                    Some(pid) if process_alive(pid) => {
                        return Err(Error::Fatal(format!(
                            "brainloop is already running with PID {pid}"
                        )));
                    },
                    Some(_) | None => {
                        // Stale or unreadable lock: remove and retry once.
                        std::fs::remove_file(&path).map_err(|e| {
                            Error::Fatal(format!("cannot remove stale lock: {e} ({first_err})"))
                        })?;
                        Self::try_create(&path)?;
                    },
                }
            },
        }
        Ok(Self {
            path,
            released: false,
        })
    }

    fn try_create(path: &Path) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| Error::Fatal(format!("cannot create lock {}: {e}", path.display())))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|e| Error::Fatal(format!("cannot write lock: {e}")))?;
        Ok(())
    }

    /// Removes the lock file. Also runs on drop.
    pub fn release(&mut self) {
        if !self.released {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(error = %err, "failed to remove lock file");
            }
            self.released = true;
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Signal-0 liveness probe.
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Validates the working directory: every schema file present, and the
/// directory name carries the project identifier unless the check is
/// explicitly skipped.
///
/// # Errors
///
/// `Fatal` naming the first missing schema file or the offending path.
pub fn validate_working_directory(dir: &Path, skip_name_check: bool) -> Result<()> {
    for file in REQUIRED_SCHEMA_FILES {
        if !dir.join(file).is_file() {
            return Err(Error::Fatal(format!(
                "required schema file {file} not found in {}; brainloop must run from its \
                 project directory",
                dir.display()
            )));
        }
    }

    if !skip_name_check {
        let dir_text = dir.to_string_lossy();
        if !dir_text.contains(PROJECT_NAME) {
            return Err(Error::Fatal(format!(
                "working directory {dir_text} does not look like a {PROJECT_NAME} project \
                 directory (pass --skip-workdir-check to override)"
            )));
        }
    }
    Ok(())
}

/// Computes and writes one heartbeat row, reaping zombies first. Returns
/// the number of zombie rows removed.
pub fn send_heartbeat(
    worker_id: &str,
    status: &str,
    lifecycle: &LifecycleStore,
    output: &OutputStore,
) -> Result<usize> {
    let counts = lifecycle.session_counts()?;
    output.write_heartbeat(&HeartbeatRow {
        worker_id: worker_id.to_string(),
        timestamp: now_unix(),
        status: status.to_string(),
        sessions_active: counts.active,
        sessions_completed: counts.completed,
        cache_hit_rate: counts.cache_hit_rate,
    })
}

/// Phase 3 of shutdown: checkpoint every database, record the `shutdown`
/// event, release the lock.
pub fn finalize_shutdown(
    worker_id: &str,
    databases: &Databases,
    metadata: &MetadataStore,
    lock: &mut InstanceLock,
) {
    for (name, result) in databases.checkpoint_all() {
        if let Err(err) = result {
            tracing::warn!(database = name, error = %err, "WAL checkpoint failed");
        }
    }
    metadata.record_event(
        "shutdown",
        &format!("worker {worker_id} shutdown gracefully"),
    );
    lock.release();
}
