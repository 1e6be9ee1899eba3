//! Worker-side test runtime.
//!
//! A worker process connects back to the pool, then serves run requests one
//! at a time until the pool closes the connection. For each request it
//! rebuilds the test's suite chain (registering the file at most once per
//! project), spawns a fresh terminal, drives hooks and the test body, and
//! streams events back. Nothing leaks between attempts except the read-only
//! import cache.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::loader::{self, FileSpec};
use crate::protocol::{self, Conn, RunRequest, WORKER_ID_ENV, WORKER_PORT_ENV, WorkerEvent};
use crate::snapshot::SnapshotStore;
use crate::suite::{Suite, SuiteKind};
use crate::term::{AttemptCx, SpawnSpec, Terminal, TestRun};

/// Whether this process was spawned as a worker.
pub(crate) fn is_worker_process() -> bool {
    std::env::var_os(WORKER_PORT_ENV).is_some()
}

/// Worker entry point: connect, handshake, serve requests until EOF.
pub(crate) async fn worker_main(files: &[FileSpec]) -> Result<()> {
    let port: u16 = std::env::var(WORKER_PORT_ENV)
        .context("missing worker port")?
        .parse()
        .context("invalid worker port")?;
    let worker_id: usize = std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|id| id.parse().ok())
        .unwrap_or(0);

    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .context("failed to connect to the worker pool")?;
    let mut conn = protocol::frame(stream);
    protocol::send(&mut conn, &WorkerEvent::Hello { worker_id }).await?;
    debug!("worker {worker_id} ready");

    let mut registry = Registry::new(files);
    while let Some(request) = protocol::recv::<RunRequest>(&mut conn).await? {
        serve(&mut conn, &mut registry, &request).await?;
    }
    debug!("worker {worker_id} shutting down");
    Ok(())
}

/// Per-worker import cache: each source is registered at most once per
/// project chain. Re-imports are not supported; tests are addressed by their
/// pre-assigned id.
struct Registry<'a> {
    files: &'a [FileSpec],
    imported: HashMap<(String, PathBuf), Suite>,
}

impl<'a> Registry<'a> {
    fn new(files: &'a [FileSpec]) -> Registry<'a> {
        Registry { files, imported: HashMap::new() }
    }

    fn import(&mut self, request: &RunRequest) -> Result<&Suite> {
        let key = (request.summary.project.title.clone(), request.source.clone());
        if !self.imported.contains_key(&key) {
            let spec = self
                .files
                .iter()
                .find(|f| f.path == request.summary.file.title)
                .with_context(|| {
                    format!("test file {:?} is not registered", request.summary.file.title)
                })?;
            let cwd = std::env::current_dir().context("failed to resolve working directory")?;

            let mut project = Suite::new(SuiteKind::Project, request.summary.project.title.clone());
            project.options = request.summary.project.options.clone();
            project.suites.push(loader::load_file(spec, &cwd));

            let mut root = Suite::new(SuiteKind::Root, "");
            root.suites.push(project);
            root.finalize();

            debug!("imported {:?}", request.summary.file.title);
            self.imported.insert(key.clone(), root);
        }
        Ok(&self.imported[&key])
    }
}

/// Runs one request, forwarding attempt events as they are produced and
/// finishing with the terminal `Done`/`Error` frame.
async fn serve(conn: &mut Conn, registry: &mut Registry<'_>, request: &RunRequest) -> Result<()> {
    let started = Instant::now();
    let (events, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();

    let attempt = run_attempt(registry, request, events.clone());
    tokio::pin!(attempt);

    let result = loop {
        tokio::select! {
            Some(event) = event_rx.recv() => protocol::send(conn, &event).await?,
            result = &mut attempt => break result,
        }
    };
    while let Ok(event) = event_rx.try_recv() {
        protocol::send(conn, &event).await?;
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let terminal_event = match result {
        Ok(()) => WorkerEvent::Done { duration_ms },
        Err(err) => WorkerEvent::Error { message: format!("{err:?}"), duration_ms },
    };
    protocol::send(conn, &terminal_event).await
}

async fn run_attempt(
    registry: &mut Registry<'_>,
    request: &RunRequest,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<()> {
    let root = registry.import(request)?;
    let resolved = root
        .resolve(&request.test_id)
        .with_context(|| format!("test {:?} is not registered", request.test_id))?;

    let options = &resolved.options;
    let spec = SpawnSpec {
        shell: options.shell.unwrap_or_else(crate::shell::Shell::platform_default),
        rows: options.rows.unwrap_or(30),
        cols: options.columns.unwrap_or(80),
        env: options.env.clone(),
        cwd: options.cwd.clone(),
    };
    let terminal = Terminal::spawn(&spec)?;
    let _ = events.send(WorkerEvent::Started { t0_ms: unix_millis() });

    // Snapshots key off the original source path so .snap files sit next to
    // the test file, not its cached transform.
    let store = SnapshotStore::for_test_file(Path::new(&request.summary.file.title));
    let (snapshot_events, mut snapshot_rx) = mpsc::unbounded_channel();
    let forward = events.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(status) = snapshot_rx.recv().await {
            let _ = forward.send(WorkerEvent::Snapshot { status });
        }
    });

    let cx = AttemptCx {
        test_id: Arc::from(request.test_id.as_str()),
        snapshot_seq: Arc::new(AtomicU32::new(0)),
        store: Arc::new(Mutex::new(store)),
        update_snapshots: request.update_snapshots,
        expect_timeout: Duration::from_millis(request.expect_timeout_ms),
        snapshot_events,
    };
    let run = TestRun::new(terminal.clone(), cx);

    let mut result = Ok(());
    for hook in &resolved.before_each {
        if result.is_ok() {
            result = guarded(hook(run.clone())).await;
        }
    }
    if result.is_ok() {
        result = guarded((resolved.test.body)(run.clone())).await;
    }
    // after_each hooks run regardless; the first error wins.
    for hook in &resolved.after_each {
        let hook_result = guarded(hook(run.clone())).await;
        if result.is_ok() {
            result = hook_result;
        }
    }

    drop(run);
    terminal.kill();
    let _ = forwarder.await;
    result
}

/// Converts panics inside a test body or hook into ordinary errors so the
/// worker survives to run the next test.
async fn guarded(fut: impl Future<Output = Result<()>>) -> Result<()> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow!("test body panicked: {message}"))
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Dsl;
    use crate::protocol::{FileSummary, ProjectSummary, SuiteSummary};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static REGISTRATIONS: AtomicUsize = AtomicUsize::new(0);

    fn register_counted(t: &mut Dsl) {
        REGISTRATIONS.fetch_add(1, Ordering::SeqCst);
        t.test("x", |_run| async { Ok(()) });
    }

    fn request_for(path: &'static str) -> RunRequest {
        RunRequest {
            test_id: String::new(),
            summary: SuiteSummary {
                project: ProjectSummary {
                    title: "p".into(),
                    options: Default::default(),
                },
                file: FileSummary { title: path.into(), source: PathBuf::from(path) },
            },
            source: PathBuf::from(path),
            timeout_ms: 0,
            expect_timeout_ms: 5000,
            update_snapshots: false,
        }
    }

    #[test]
    fn files_are_imported_at_most_once() {
        let files = [FileSpec::new("tests/counted.rs", register_counted)];
        let mut registry = Registry::new(&files);
        let request = request_for("tests/counted.rs");

        let before = REGISTRATIONS.load(Ordering::SeqCst);
        registry.import(&request).unwrap();
        registry.import(&request).unwrap();
        registry.import(&request).unwrap();
        assert_eq!(REGISTRATIONS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn imported_tree_carries_project_options_and_ids() {
        fn register(t: &mut Dsl) {
            t.test("x", |_run| async { Ok(()) });
        }
        let files = [FileSpec::new("tests/ids.rs", register)];
        let mut registry = Registry::new(&files);
        let root = registry.import(&request_for("tests/ids.rs")).unwrap();

        let tests = root.all_tests();
        assert_eq!(tests.len(), 1);
        assert!(tests[0].id.starts_with("[p] > tests/ids.rs:"));
        let resolved = root.resolve(&tests[0].id).unwrap();
        assert_eq!(resolved.test.title, "x");
    }

    #[test]
    fn unknown_file_is_an_error() {
        let files: [FileSpec; 0] = [];
        let mut registry = Registry::new(&files);
        assert!(registry.import(&request_for("tests/missing.rs")).is_err());
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let err = guarded(async { panic!("kaboom") }).await.unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }
}
