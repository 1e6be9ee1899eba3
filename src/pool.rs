//! The worker pool: N child processes and the dispatch path onto them.
//!
//! Workers are re-executions of the current binary with
//! [`WORKER_PORT_ENV`](crate::protocol::WORKER_PORT_ENV) set; they connect
//! back over loopback and identify themselves with a `Hello` frame. A worker
//! runs one test at a time; idle workers sit in a channel that doubles as
//! the concurrency limit. A worker that times out or crashes is killed and
//! replaced before its slot is reused, so one bad test cannot shrink the
//! pool.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, warn};

use crate::protocol::{self, Conn, RunRequest, WORKER_ID_ENV, WORKER_PORT_ENV, WorkerEvent};
use crate::snapshot::SnapshotStatus;

/// How long a freshly spawned worker gets to connect back.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The resolution of one dispatched attempt, as seen by the orchestrator.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// The test body completed without error.
    Passed { duration: Duration, snapshots: Vec<SnapshotStatus> },
    /// The test body (or a hook, or an assertion) failed.
    Failed { message: String, duration: Duration, snapshots: Vec<SnapshotStatus> },
    /// No terminal event before the per-call deadline; the worker was
    /// killed.
    TimedOut { limit: Duration },
    /// The worker died or closed the stream without a terminal event.
    Crashed { detail: String },
}

/// Dispatch seam between the orchestrator and the worker processes.
///
/// The production implementation is [`WorkerPool`]; orchestrator tests stub
/// it to exercise scheduling without spawning processes.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs one attempt to completion, enforcing the request's deadline.
    async fn run_test(&self, request: RunRequest) -> AttemptOutcome;

    /// Stops all workers, forcing after `grace`.
    async fn shutdown(&self, grace: Duration);
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for std::sync::Arc<E> {
    async fn run_test(&self, request: RunRequest) -> AttemptOutcome {
        (**self).run_test(request).await
    }

    async fn shutdown(&self, grace: Duration) {
        (**self).shutdown(grace).await
    }
}

struct Worker {
    id: usize,
    child: tokio::process::Child,
    conn: Conn,
    poisoned: bool,
}

impl Worker {
    /// Sends the request and consumes events until a terminal one, the
    /// deadline, or a dead stream. Partial events from a killed worker are
    /// discarded with it.
    async fn call(&mut self, request: &RunRequest) -> AttemptOutcome {
        if let Err(err) = protocol::send(&mut self.conn, request).await {
            warn!("worker {}: failed to send request: {err:#}", self.id);
            return self.crashed().await;
        }

        let limit = Duration::from_millis(request.timeout_ms);
        let deadline = (request.timeout_ms > 0).then(|| Instant::now() + limit);
        let mut snapshots = Vec::new();

        loop {
            let next = protocol::recv::<WorkerEvent>(&mut self.conn);
            let frame = match deadline {
                Some(at) => match timeout_at(at, next).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        debug!("worker {}: deadline hit, killing", self.id);
                        self.poison().await;
                        return AttemptOutcome::TimedOut { limit };
                    }
                },
                None => next.await,
            };

            match frame {
                Ok(Some(WorkerEvent::Started { t0_ms })) => {
                    debug!("worker {}: attempt started at t0={t0_ms}", self.id);
                }
                Ok(Some(WorkerEvent::Snapshot { status })) => snapshots.push(status),
                Ok(Some(WorkerEvent::Done { duration_ms })) => {
                    return AttemptOutcome::Passed {
                        duration: Duration::from_millis(duration_ms),
                        snapshots,
                    };
                }
                Ok(Some(WorkerEvent::Error { message, duration_ms })) => {
                    return AttemptOutcome::Failed {
                        message,
                        duration: Duration::from_millis(duration_ms),
                        snapshots,
                    };
                }
                Ok(Some(WorkerEvent::Hello { .. })) => {}
                Ok(None) | Err(_) => return self.crashed().await,
            }
        }
    }

    async fn poison(&mut self) {
        self.poisoned = true;
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// Best-effort diagnostic for a worker that died mid-call. Stderr is
    /// inherited, so whatever the worker printed is already on the user's
    /// terminal; the diagnostic carries the exit status.
    async fn crashed(&mut self) -> AttemptOutcome {
        self.poisoned = true;
        let detail = match timeout(Duration::from_secs(1), self.child.wait()).await {
            Ok(Ok(status)) => {
                format!("worker exited with {status} before reporting a result")
            }
            _ => {
                let _ = self.child.start_kill();
                "worker closed its event stream before reporting a result".to_string()
            }
        };
        AttemptOutcome::Crashed { detail }
    }
}

/// A fixed-size pool of worker processes.
pub struct WorkerPool {
    listener: TcpListener,
    port: u16,
    call_slots: mpsc::Sender<Worker>,
    idle: Mutex<mpsc::Receiver<Worker>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    /// Binds the RPC listener and spawns `size` workers.
    pub async fn new(size: usize) -> Result<WorkerPool> {
        let size = size.max(1);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind worker listener")?;
        let port = listener.local_addr().context("failed to read listener address")?.port();
        let (tx, rx) = mpsc::channel(size);

        let pool = WorkerPool {
            listener,
            port,
            call_slots: tx,
            idle: Mutex::new(rx),
            next_id: AtomicUsize::new(0),
        };
        for _ in 0..size {
            let worker = pool.spawn_worker().await?;
            pool.call_slots.send(worker).await.expect("pool channel has capacity");
        }
        Ok(pool)
    }

    /// Spawns one worker and waits for its handshake. Workers are accepted
    /// one at a time, so the accepted connection belongs to the child just
    /// spawned.
    async fn spawn_worker(&self) -> Result<Worker> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let exe = std::env::current_exe().context("failed to locate the harness binary")?;
        let child = tokio::process::Command::new(exe)
            .env(WORKER_PORT_ENV, self.port.to_string())
            .env(WORKER_ID_ENV, id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn worker process")?;

        let (stream, _) = timeout(HANDSHAKE_TIMEOUT, self.listener.accept())
            .await
            .context("worker did not connect in time")?
            .context("failed to accept worker connection")?;
        let mut conn = protocol::frame(stream);

        match protocol::recv::<WorkerEvent>(&mut conn).await? {
            Some(WorkerEvent::Hello { worker_id }) => {
                debug!("worker {worker_id} connected");
            }
            other => bail!("unexpected worker handshake: {other:?}"),
        }
        Ok(Worker { id, child, conn, poisoned: false })
    }

    async fn checkout(&self) -> Option<Worker> {
        self.idle.lock().await.recv().await
    }

    async fn checkin(&self, worker: Worker) {
        if worker.poisoned {
            drop(worker); // kill_on_drop reaps anything still alive
            match self.spawn_worker().await {
                Ok(fresh) => {
                    let _ = self.call_slots.send(fresh).await;
                }
                Err(err) => error!("failed to replace a dead worker: {err:#}"),
            }
        } else {
            let _ = self.call_slots.send(worker).await;
        }
    }
}

#[async_trait]
impl Executor for WorkerPool {
    async fn run_test(&self, request: RunRequest) -> AttemptOutcome {
        let Some(mut worker) = self.checkout().await else {
            return AttemptOutcome::Crashed { detail: "worker pool is shut down".to_string() };
        };
        let outcome = worker.call(&request).await;
        self.checkin(worker).await;
        outcome
    }

    async fn shutdown(&self, grace: Duration) {
        let mut idle = self.idle.lock().await;
        while let Ok(worker) = idle.try_recv() {
            let Worker { id, mut child, conn, .. } = worker;
            // Closing the connection asks the worker to exit on its own.
            drop(conn);
            match timeout(grace, child.wait()).await {
                Ok(_) => debug!("worker {id} exited"),
                Err(_) => {
                    debug!("worker {id} ignored shutdown, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
    }
}
