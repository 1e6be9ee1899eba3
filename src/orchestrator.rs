//! Orchestration: test selection, concurrent dispatch, retries, and the
//! global deadline.
//!
//! The orchestrator walks the frozen suite tree, applies the `only` gate and
//! path filters, and spawns one task per selected test. Tasks run attempts
//! strictly in sequence and suspend only on the [`Executor`] dispatch; the
//! pool's idle channel is the concurrency limit. Reporter calls are
//! serialized behind a mutex.
//!
//! Only two things abort a run: an invalid filter (configuration error,
//! before anything is dispatched) and the global timeout (which force-kills
//! in-flight workers and discards their partial events).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::pool::{AttemptOutcome, Executor};
use crate::protocol::{FileSummary, ProjectSummary, RunRequest, SuiteSummary};
use crate::reporter::Reporter;
use crate::shell::{self, Shell};
use crate::suite::{Annotation, Status, Suite, TestCase, TestResult, counts_as_failure};

/// How long workers get to exit on their own before being killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Fatal run errors; everything else is localized to one test attempt.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid test filter {pattern:?}: {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("global timeout ({0} ms) exceeded")]
    GlobalTimeout(u64),

    #[error("{0}")]
    Setup(String),
}

/// Per-invocation execution options, from the CLI.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Rewrite snapshots instead of comparing against them.
    pub update_snapshots: bool,
    /// Regexes over resolved file paths; empty means everything.
    pub test_filter: Vec<String>,
}

/// Aggregate result of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub total: usize,
    pub failures: usize,
    pub flaky: usize,
    pub duration: Duration,
}

/// Coordinates one run end to end.
pub struct Orchestrator<E> {
    config: Config,
    executor: Arc<E>,
    reporter: Arc<Mutex<dyn Reporter>>,
    options: ExecutionOptions,
}

impl<E: Executor + 'static> Orchestrator<E> {
    pub fn new(
        config: Config,
        executor: E,
        reporter: impl Reporter + 'static,
        options: ExecutionOptions,
    ) -> Orchestrator<E> {
        Orchestrator {
            config,
            executor: Arc::new(executor),
            reporter: Arc::new(Mutex::new(reporter)),
            options,
        }
    }

    /// Runs every selected test, racing the whole thing against the global
    /// deadline when one is configured.
    pub async fn run(&self, root: Arc<Suite>) -> Result<RunReport, RunError> {
        let global_timeout = self.config.global_timeout;
        if global_timeout == 0 {
            return self.run_inner(root).await;
        }
        tokio::select! {
            report = self.run_inner(root) => report,
            _ = tokio::time::sleep(Duration::from_millis(global_timeout)) => {
                // Dropping run_inner aborts every in-flight task; workers it
                // held die with it. Pooled workers are killed here.
                self.executor.shutdown(Duration::ZERO).await;
                Err(RunError::GlobalTimeout(global_timeout))
            }
        }
    }

    async fn run_inner(&self, root: Arc<Suite>) -> Result<RunReport, RunError> {
        let started = std::time::Instant::now();

        let filters = compile_filters(&self.options.test_filter)?;
        let specs = self.select(&root, &filters);
        let total = specs.len();
        info!("selected {total} test(s)");

        let shells: BTreeSet<Shell> = specs.iter().map(|s| s.shell).collect();
        let cwd = std::env::current_dir().map_err(|e| RunError::Setup(e.to_string()))?;
        shell::prepare(&shells, &cwd).map_err(|e| RunError::Setup(format!("{e:#}")))?;

        let shells: Vec<Shell> = shells.into_iter().collect();
        self.reporter.lock().await.start(total, &shells).await;

        let mut tasks = JoinSet::new();
        for spec in &specs {
            let root = Arc::clone(&root);
            let executor = Arc::clone(&self.executor);
            let reporter = Arc::clone(&self.reporter);
            let spec = spec.clone();
            let retries = self.config.retries;
            tasks.spawn(async move {
                run_one_test(&root, executor, reporter, spec, retries).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!("test task failed: {err}");
            }
        }

        self.executor.shutdown(SHUTDOWN_GRACE).await;

        let mut failures = 0;
        let mut flaky = 0;
        for spec in &specs {
            let Some(test) = root.find_test(&spec.id) else { continue };
            let outcome = test.outcome();
            if counts_as_failure(outcome, self.config.fail_on_flaky) {
                failures += 1;
            }
            if outcome == Status::Flaky {
                flaky += 1;
            }
        }

        let reported = self.reporter.lock().await.end(&root).await;
        debug!("reporter counted {reported} failure(s)");

        Ok(RunReport { total, failures, flaky, duration: started.elapsed() })
    }

    /// The selection pipeline: collect, apply the global `only` gate, apply
    /// path filters. Skip-annotated tests stay selected; they are emitted as
    /// skipped without dispatch.
    fn select(&self, root: &Suite, filters: &[regex::Regex]) -> Vec<DispatchSpec> {
        let planned = root.plan();
        let has_only = planned.iter().any(|p| p.test.annotation == Some(Annotation::Only));

        planned
            .iter()
            .filter(|p| !has_only || p.test.annotation == Some(Annotation::Only))
            .filter(|p| {
                if filters.is_empty() {
                    return true;
                }
                let path = p
                    .file
                    .source
                    .as_deref()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                filters.iter().any(|f| f.is_match(&path))
            })
            .map(|p| DispatchSpec {
                id: p.test.id.clone(),
                annotation: p.test.annotation,
                shell: p.shell(),
                request: RunRequest {
                    test_id: p.test.id.clone(),
                    summary: SuiteSummary {
                        project: ProjectSummary {
                            title: p.project.map(|s| s.title.clone()).unwrap_or_default(),
                            options: p.project.map(|s| s.options.clone()).unwrap_or_default(),
                        },
                        file: FileSummary {
                            title: p.file.title.clone(),
                            source: p.file.source.clone().unwrap_or_default(),
                        },
                    },
                    source: p.file.source.clone().unwrap_or_default(),
                    timeout_ms: self.config.timeout,
                    expect_timeout_ms: self.config.expect.timeout,
                    update_snapshots: self.options.update_snapshots,
                },
            })
            .collect()
    }
}

/// Everything a per-test task needs, owned.
#[derive(Clone)]
struct DispatchSpec {
    id: String,
    annotation: Option<Annotation>,
    shell: Shell,
    request: RunRequest,
}

/// Runs the attempts of one test strictly in sequence: up to `retries + 1`,
/// stopping early on an expected or skipped result.
async fn run_one_test<E: Executor>(
    root: &Suite,
    executor: Arc<E>,
    reporter: Arc<Mutex<dyn Reporter>>,
    spec: DispatchSpec,
    retries: u32,
) {
    let Some(test) = root.find_test(&spec.id) else {
        error!("selected test {:?} vanished from the tree", spec.id);
        return;
    };

    if spec.annotation == Some(Annotation::Skip) {
        let result = TestResult {
            status: Status::Skipped,
            error: None,
            duration: Duration::ZERO,
            snapshots: Vec::new(),
        };
        record(test, result, &reporter).await;
        return;
    }

    let max_attempts = retries as usize + 1;
    for attempt in 1..=max_attempts {
        debug!("dispatching {:?} (attempt {attempt}/{max_attempts})", spec.id);
        let outcome = executor.run_test(spec.request.clone()).await;
        let result = classify(outcome, spec.annotation);
        let stop = matches!(result.status, Status::Expected | Status::Skipped);
        record(test, result, &reporter).await;
        if stop {
            break;
        }
    }
}

async fn record(test: &TestCase, result: TestResult, reporter: &Arc<Mutex<dyn Reporter>>) {
    test.push_result(result.clone());
    reporter.lock().await.end_test(test, &result).await;
}

/// Maps a worker outcome and the test's annotation to a recorded status.
/// Timeouts are unexpected no matter the annotation.
fn classify(outcome: AttemptOutcome, annotation: Option<Annotation>) -> TestResult {
    let expects_failure = annotation == Some(Annotation::Fail);
    match outcome {
        AttemptOutcome::Passed { duration, snapshots } => {
            if expects_failure {
                TestResult {
                    status: Status::Unexpected,
                    error: Some("test was expected to fail but passed".to_string()),
                    duration,
                    snapshots,
                }
            } else {
                TestResult { status: Status::Expected, error: None, duration, snapshots }
            }
        }
        AttemptOutcome::Failed { message, duration, snapshots } => {
            if expects_failure {
                TestResult { status: Status::Expected, error: None, duration, snapshots }
            } else {
                TestResult { status: Status::Unexpected, error: Some(message), duration, snapshots }
            }
        }
        AttemptOutcome::TimedOut { limit } => TestResult {
            status: Status::Unexpected,
            error: Some(format!("timed out after {} ms", limit.as_millis())),
            duration: limit,
            snapshots: Vec::new(),
        },
        AttemptOutcome::Crashed { detail } => TestResult {
            status: Status::Unexpected,
            error: Some(detail),
            duration: Duration::ZERO,
            snapshots: Vec::new(),
        },
    }
}

fn compile_filters(patterns: &[String]) -> Result<Vec<regex::Regex>, RunError> {
    patterns
        .iter()
        .map(|pattern| {
            regex::Regex::new(pattern).map_err(|source| RunError::InvalidFilter {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}
