//! brainloop - the worker binary.
//!
//! Startup order matters: working-directory validation, then the
//! single-instance lock, then the databases, then the component graph.
//! Everything mutable hangs off one root [`Worker`] built here; there is
//! no ambient global state.
//!
//! The runtime runs three concurrent pieces: the stdio MCP server, the
//! 15-second heartbeat ticker, and the Unix signal listener. A signal
//! triggers the three-phase shutdown in [`brainloop_daemon::lifecycle`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use brainloop_core::ratelimit::RateLimiter;
use brainloop_daemon::executor::Executor;
use brainloop_daemon::gateway::{Gateway, HttpGenerator, DEFAULT_BASE_URL, DEFAULT_MODEL};
use brainloop_daemon::governor::Governor;
use brainloop_daemon::lifecycle::{
    finalize_shutdown, send_heartbeat, validate_working_directory, InstanceLock, DRAIN_BUDGET,
    HEARTBEAT_INTERVAL, LOCK_FILE,
};
use brainloop_daemon::mcp::{Dispatcher, Server};
use brainloop_daemon::metrics::Histogram;
use brainloop_daemon::readers::ReaderHub;
use brainloop_daemon::registry::CommandRegistry;
use brainloop_daemon::session::SessionManager;
use brainloop_daemon::storage::{
    Databases, LifecycleStore, MetadataStore, OutputStore, COMMAND_SECURITY_DB,
    COMMAND_SECURITY_SCHEMA,
};
use clap::Parser;
use secrecy::SecretString;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The secret name (and fallback environment variable) holding the
/// completion-API credential.
const API_KEY_NAME: &str = "CEREBRAS_API_KEY";

/// brainloop worker - MCP server for governed execution and generation
#[derive(Parser, Debug)]
#[command(name = "brainloop")]
#[command(version, about, long_about = None)]
struct Args {
    /// Working directory holding the databases and schema files
    /// (defaults to the current directory)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Skip the project-name check on the working directory
    #[arg(long)]
    skip_workdir_check: bool,

    /// Completion-API requests per minute
    #[arg(long, default_value_t = 60)]
    rpm: u32,

    /// Completion-API base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    api_base_url: String,

    /// Completion model
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// The process-singleton component graph.
struct Worker {
    worker_id: String,
    databases: Databases,
    lifecycle_store: LifecycleStore,
    output_store: OutputStore,
    metadata_store: MetadataStore,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Worker {
    fn build(args: &Args, workdir: &PathBuf) -> Result<Self> {
        let databases = Databases::open(workdir).context("database initialization failed")?;
        let lifecycle_store = LifecycleStore::new(databases.lifecycle.clone());
        let output_store = OutputStore::new(databases.output.clone());
        let metadata_store = MetadataStore::new(databases.metadata.clone());
        let histogram = Histogram::new(databases.output.clone());

        let registry = Arc::new(
            CommandRegistry::open(
                &workdir.join(COMMAND_SECURITY_DB),
                &workdir.join(COMMAND_SECURITY_SCHEMA),
            )
            .context("command registry initialization failed")?,
        );

        // The credential lives in metadata.secrets; the environment is a
        // fallback for first-run bootstrapping.
        let api_key: SecretString = match metadata_store.get_secret(API_KEY_NAME)? {
            Some(secret) => secret,
            None => std::env::var(API_KEY_NAME)
                .map(SecretString::new)
                .context("completion-API credential not found in metadata.secrets or environment")?,
        };

        let cancel = CancellationToken::new();
        let generator = HttpGenerator::new(&args.api_base_url, api_key, &args.model)?;
        let gateway = Arc::new(Gateway::new(
            Arc::new(generator),
            Arc::new(RateLimiter::new(args.rpm)),
            lifecycle_store.clone(),
            output_store.clone(),
            histogram.clone(),
            cancel.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher {
            governor: Governor::new(
                Arc::clone(&registry),
                Executor::new(workdir.clone()),
                metadata_store.clone(),
                histogram.clone(),
            ),
            sessions: SessionManager::new(
                lifecycle_store.clone(),
                output_store.clone(),
                metadata_store.clone(),
                Arc::clone(&gateway),
            ),
            readers: ReaderHub::new(lifecycle_store.clone(), output_store.clone()),
            gateway,
            lifecycle: lifecycle_store.clone(),
            output: output_store.clone(),
            histogram,
            registry,
            version: env!("CARGO_PKG_VERSION"),
        });

        Ok(Self {
            worker_id: format!("brainloop-{}", chrono::Utc::now().timestamp()),
            databases,
            lifecycle_store,
            output_store,
            metadata_store,
            dispatcher,
            cancel,
            tracker: TaskTracker::new(),
        })
    }

    fn heartbeat(&self, status: &str) {
        match send_heartbeat(
            &self.worker_id,
            status,
            &self.lifecycle_store,
            &self.output_store,
        ) {
            Ok(reaped) if reaped > 0 => {
                info!(reaped, "reaped zombie heartbeats");
            },
            Ok(_) => {},
            Err(err) => warn!(error = %err, "heartbeat failed"),
        }
    }

    /// The three-phase shutdown. Total budget is strictly under 60 s.
    async fn shutdown(&self, lock: &mut InstanceLock) {
        info!("starting graceful shutdown");

        // Phase 1: last heartbeat, stop accepting work.
        self.heartbeat("shutting_down");
        self.cancel.cancel();
        self.tracker.close();

        // Phase 2: wait for in-flight operations, bounded.
        if tokio::time::timeout(DRAIN_BUDGET, self.tracker.wait())
            .await
            .is_err()
        {
            warn!("in-flight operations did not finish within the drain budget");
        }

        // Phase 3: checkpoint, record, unlock.
        finalize_shutdown(&self.worker_id, &self.databases, &self.metadata_store, lock);
        info!(worker_id = %self.worker_id, "graceful shutdown complete");
    }
}

fn main() -> std::process::ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("brainloop: {err:#}");
            std::process::ExitCode::FAILURE
        },
    }
}

fn run(args: Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let workdir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("cannot determine working directory")?,
    };
    validate_working_directory(&workdir, args.skip_workdir_check)
        .context("working directory validation failed")?;
    info!(workdir = %workdir.display(), "running from validated directory");

    let mut lock = InstanceLock::acquire(workdir.join(LOCK_FILE))
        .context("single instance check failed")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    runtime.block_on(async_main(args, workdir, &mut lock))
}

async fn async_main(args: Args, workdir: PathBuf, lock: &mut InstanceLock) -> Result<()> {
    let worker = Worker::build(&args, &workdir)?;
    worker
        .metadata_store
        .record_event("startup", &format!("worker {} starting", worker.worker_id));
    info!(worker_id = %worker.worker_id, "worker started");

    // The stdio MCP server.
    let server = Server::new(
        Arc::clone(&worker.dispatcher),
        worker.cancel.clone(),
        worker.tracker.clone(),
    );
    let server_task = tokio::spawn(async move {
        if let Err(err) = server.serve(tokio::io::stdin(), tokio::io::stdout()).await {
            error!(error = %err, "MCP server error");
        }
    });

    // Signals.
    let mut sigterm = signal(SignalKind::terminate()).context("cannot register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("cannot register SIGINT")?;

    // Heartbeat ticker.
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => worker.heartbeat("running"),
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
            () = worker.cancel.cancelled() => break,
        }
    }

    worker.shutdown(lock).await;
    server_task.abort();

    // Give the runtime a moment to drop the aborted server task before the
    // databases close with the worker.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
