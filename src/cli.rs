//! CLI front-end and harness entry point.
//!
//! Test files are compiled into the user's harness binary, whose `main`
//! hands the registered [`FileSpec`]s to [`run`]. The same binary doubles as
//! the worker executable: when the pool spawns it with the worker port in
//! the environment, [`run`] skips argument parsing and serves RPC instead.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config;
use crate::loader::{self, FileSpec};
use crate::orchestrator::{ExecutionOptions, Orchestrator};
use crate::pool::WorkerPool;
use crate::reporter::ListReporter;
use crate::worker;

#[derive(Debug, Parser)]
#[command(name = "tact", about = "Terminal-application test runner", version)]
struct Cli {
    /// Write captured snapshots instead of comparing against them.
    #[arg(long)]
    update_snapshot: bool,

    /// Configuration file to use instead of `tact.toml` in the working
    /// directory.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Regexes over resolved test-file paths; only tests in matching files
    /// run. No filters means everything runs.
    filters: Vec<String>,
}

/// Harness entry point; returns the process exit code.
///
/// Exit codes: `0` when every selected test ends expected (flaky allowed
/// unless configured otherwise), otherwise the failure count; `1` for
/// configuration errors and the global timeout.
pub fn run(files: &[FileSpec]) -> ExitCode {
    let filter = EnvFilter::try_from_env("TACT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("tact: failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async {
        if worker::is_worker_process() {
            match worker::worker_main(files).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    eprintln!("tact worker: {err:#}");
                    ExitCode::FAILURE
                }
            }
        } else {
            main_process(files).await
        }
    })
}

async fn main_process(files: &[FileSpec]) -> ExitCode {
    let cli = Cli::parse();

    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(err) => {
            eprintln!("tact: failed to resolve working directory: {err}");
            return ExitCode::from(1);
        }
    };

    let config = match &cli.config {
        Some(path) => config::load_file(path),
        None => config::load(&cwd),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("tact: {err:#}");
            return ExitCode::from(1);
        }
    };

    let root = match loader::load(&config, files, &cwd) {
        Ok(root) => Arc::new(root),
        Err(err) => {
            eprintln!("tact: {err:#}");
            return ExitCode::from(1);
        }
    };
    debug!("loaded {} test(s) from {} file(s)", root.all_tests().len(), files.len());

    let pool = match WorkerPool::new(config.worker_count()).await {
        Ok(pool) => pool,
        Err(err) => {
            eprintln!("tact: {err:#}");
            return ExitCode::from(1);
        }
    };

    let reporter = ListReporter::new(config.fail_on_flaky);
    let options = ExecutionOptions {
        update_snapshots: cli.update_snapshot,
        test_filter: cli.filters,
    };
    let orchestrator = Orchestrator::new(config, pool, reporter, options);

    match orchestrator.run(root).await {
        Ok(report) => {
            if report.failures == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(report.failures.min(255) as u8)
            }
        }
        Err(err) => {
            eprintln!("tact: {err}");
            ExitCode::from(1)
        }
    }
}
