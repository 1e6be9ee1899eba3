//! The per-test terminal: a real PTY, an emulated screen, and the matcher
//! surface exposed to test bodies.
//!
//! A [`Terminal`] owns a shell process attached to the slave side of a PTY
//! pair. A background thread drains the master side into the
//! [`Screen`](screen::Screen) emulator; test bodies observe the emulated
//! grid and type through [`Terminal::write`]. Handles are cheap clones over
//! shared state so the runtime can keep one for teardown while the test body
//! owns another.

pub mod expect;
pub mod screen;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::shell::Shell;
use crate::snapshot::{SnapshotOutcome, SnapshotStatus, SnapshotStore};
use expect::{POLL_INTERVAL, Pattern, failure_message, poll};
use screen::Screen;

/// Everything needed to spawn the shell under test.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub shell: Shell,
    pub rows: u16,
    pub cols: u16,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// A live shell on a PTY with an emulated screen.
#[derive(Clone)]
pub struct Terminal {
    screen: Arc<Mutex<Screen>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
}

impl Terminal {
    /// Spawns the configured shell on a fresh PTY.
    ///
    /// The child inherits the calling process's environment merged with the
    /// per-test env; `TERM` is pinned so emulator output does not depend on
    /// the invoking terminal. The worker runtime creates one terminal per
    /// attempt through this; it is public so harnesses can drive a shell
    /// directly.
    pub fn spawn(spec: &SpawnSpec) -> Result<Terminal> {
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open pty")?;

        let cwd = match &spec.cwd {
            Some(cwd) => cwd.clone(),
            None => std::env::current_dir().context("failed to resolve working directory")?,
        };

        let mut cmd = CommandBuilder::new(spec.shell.program());
        for arg in spec.shell.args() {
            cmd.arg(arg);
        }
        cmd.cwd(&cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in spec.shell.env(&cwd) {
            cmd.env(key, value);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn {}", spec.shell))?;
        // The parent keeps only the master side.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("failed to clone pty reader")?;
        let writer = pair.master.take_writer().context("failed to take pty writer")?;

        let screen = Arc::new(Mutex::new(Screen::new(spec.rows, spec.cols)));
        let sink = Arc::clone(&screen);
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().unwrap().advance(&buf[..n]),
                }
            }
        });

        debug!("spawned {} on a {}x{} pty", spec.shell, spec.rows, spec.cols);
        Ok(Terminal {
            screen,
            writer: Arc::new(Mutex::new(writer)),
            master: Arc::new(Mutex::new(pair.master)),
            child: Arc::new(Mutex::new(child)),
        })
    }

    /// Writes bytes to the PTY master, i.e. types into the shell.
    pub fn write(&self, bytes: impl AsRef<[u8]>) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer.write_all(bytes.as_ref()).context("failed to write to pty")?;
        writer.flush().context("failed to flush pty")?;
        Ok(())
    }

    /// Propagates a window-size change to the child and the emulator.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .lock()
            .unwrap()
            .resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .context("failed to resize pty")?;
        self.screen.lock().unwrap().resize(rows, cols);
        Ok(())
    }

    /// The current on-screen grid, row-major.
    pub fn viewable_buffer(&self) -> Vec<Vec<char>> {
        self.screen.lock().unwrap().viewable_buffer()
    }

    /// Scrollback plus the on-screen grid, row-major.
    pub fn buffer(&self) -> Vec<Vec<char>> {
        self.screen.lock().unwrap().buffer()
    }

    /// Terminates the shell and releases the PTY. Idempotent.
    ///
    /// On unix the PTY slave makes the shell a session leader, so its pid is
    /// also its process-group id; the whole group is signaled and anything
    /// the test left running inside the shell dies with it. Elsewhere only
    /// the shell process itself can be killed.
    pub fn kill(&self) {
        let mut child = self.child.lock().unwrap();
        #[cfg(unix)]
        if let Some(pid) = child.process_id() {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("pty group kill: {err}");
            }
        }
        if let Err(err) = child.kill() {
            debug!("pty child kill: {err}");
        }
        let _ = child.try_wait();
    }

    fn render(&self, full: bool) -> String {
        let screen = self.screen.lock().unwrap();
        if full {
            screen::render_text(&screen.buffer())
        } else {
            screen::render_text(&screen.viewable_buffer())
        }
    }
}

/// Shared per-attempt context behind [`TestRun`].
#[derive(Clone)]
pub(crate) struct AttemptCx {
    pub test_id: Arc<str>,
    pub snapshot_seq: Arc<AtomicU32>,
    pub store: Arc<Mutex<SnapshotStore>>,
    pub update_snapshots: bool,
    pub expect_timeout: Duration,
    pub snapshot_events: UnboundedSender<SnapshotStatus>,
}

/// The argument handed to every test body.
///
/// Cloneable: hooks and the body share the same terminal and snapshot
/// sequence.
#[derive(Clone)]
pub struct TestRun {
    pub terminal: Terminal,
    cx: AttemptCx,
}

impl TestRun {
    pub(crate) fn new(terminal: Terminal, cx: AttemptCx) -> TestRun {
        TestRun { terminal, cx }
    }

    /// Starts an assertion against this terminal's buffer.
    pub fn expect(&self) -> Expectation<'_> {
        Expectation { run: self, negated: false, full: false, timeout: None }
    }
}

/// Builder for one assertion; consumed by the terminal matcher methods.
pub struct Expectation<'a> {
    run: &'a TestRun,
    negated: bool,
    full: bool,
    timeout: Option<Duration>,
}

impl Expectation<'_> {
    /// Inverts the assertion: succeed when the value is absent.
    pub fn not(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Matches against scrollback plus screen instead of the screen only.
    pub fn full(mut self) -> Self {
        self.full = true;
        self
    }

    /// Overrides the configured assertion timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Polls the selected buffer every 50 ms until `expected` is found (or,
    /// negated, until it is absent), failing at the deadline.
    pub async fn to_have_value(self, expected: impl Into<Pattern>) -> Result<()> {
        let pattern = expected.into();
        let deadline = self.timeout.unwrap_or(self.run.cx.expect_timeout);
        let terminal = &self.run.terminal;
        let full = self.full;
        let ok = poll(
            || pattern.matches(&terminal.render(full)),
            POLL_INTERVAL,
            deadline,
            !self.negated,
        )
        .await;
        if ok {
            Ok(())
        } else {
            bail!(failure_message(&pattern, self.negated, deadline));
        }
    }

    /// Compares the full buffer against the stored snapshot for this call
    /// site's position in the test, writing it when absent or when update
    /// mode is on.
    pub async fn to_match_snapshot(self) -> Result<()> {
        let cx = &self.run.cx;
        let seq = cx.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("{} #{seq}", cx.test_id);

        let screen = self.run.terminal.screen.lock().unwrap();
        let value = screen::render_lines(&screen.buffer());
        drop(screen);

        let mut store = cx.store.lock().unwrap();
        let stored = store.get(&name).map(str::to_owned);
        let outcome = store.check(&name, &value, cx.update_snapshots);
        drop(store);

        let _ = cx.snapshot_events.send(SnapshotStatus { name: name.clone(), outcome });

        match outcome {
            SnapshotOutcome::Matched | SnapshotOutcome::Written | SnapshotOutcome::Updated => {
                Ok(())
            }
            SnapshotOutcome::Mismatched => bail!(
                "snapshot {name:?} mismatched\n--- stored\n{}\n--- received\n{value}",
                stored.unwrap_or_default(),
            ),
            SnapshotOutcome::Missing => bail!("snapshot {name:?} could not be written"),
        }
    }
}

#[cfg(test)]
pub(crate) fn attempt_cx_for_tests(
    test_id: &str,
    store: SnapshotStore,
    update: bool,
) -> (AttemptCx, tokio::sync::mpsc::UnboundedReceiver<SnapshotStatus>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let cx = AttemptCx {
        test_id: Arc::from(test_id),
        snapshot_seq: Arc::new(AtomicU32::new(0)),
        store: Arc::new(Mutex::new(store)),
        update_snapshots: update,
        expect_timeout: Duration::from_secs(5),
        snapshot_events: tx,
    };
    (cx, rx)
}

// PTY-backed tests need a bourne-compatible shell on PATH, which matches the
// runner's own support matrix on unix.
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn run_with_bash(dir: &Path) -> (TestRun, tokio::sync::mpsc::UnboundedReceiver<SnapshotStatus>) {
        let terminal = Terminal::spawn(&SpawnSpec {
            shell: crate::shell::Shell::Bash,
            rows: 24,
            cols: 80,
            env: BTreeMap::new(),
            cwd: Some(dir.to_path_buf()),
        })
        .unwrap();
        let store = SnapshotStore::for_test_file(&dir.join("smoke.rs"));
        let (cx, rx) = attempt_cx_for_tests("smoke.rs:1:1 > t", store, false);
        (TestRun::new(terminal, cx), rx)
    }

    #[tokio::test]
    async fn shell_output_reaches_the_emulated_screen() {
        let dir = TempDir::new().unwrap();
        let (run, _rx) = run_with_bash(dir.path());

        // Computed marker so the echoed command line itself cannot match.
        run.terminal.write("echo tact-$((40+2))\r").unwrap();
        run.expect()
            .timeout(Duration::from_secs(10))
            .to_have_value("tact-42")
            .await
            .unwrap();

        // The same value is in the full buffer too.
        run.expect()
            .full()
            .timeout(Duration::from_secs(1))
            .to_have_value("tact-42")
            .await
            .unwrap();

        run.terminal.kill();
    }

    #[tokio::test]
    async fn negated_matcher_resolves_on_absent_value() {
        let dir = TempDir::new().unwrap();
        let (run, _rx) = run_with_bash(dir.path());

        run.expect()
            .not()
            .timeout(Duration::from_millis(300))
            .to_have_value("never-printed-value")
            .await
            .unwrap();

        // And the failure message carries value and mode.
        run.terminal.write("echo tact-$((1+1))\r").unwrap();
        run.expect()
            .timeout(Duration::from_secs(10))
            .to_have_value("tact-2")
            .await
            .unwrap();
        let err = run
            .expect()
            .not()
            .timeout(Duration::from_millis(200))
            .to_have_value("tact-2")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not to contain"));
        assert!(err.to_string().contains("\"tact-2\""));

        run.terminal.kill();
    }

    #[tokio::test]
    async fn snapshots_capture_the_full_buffer() {
        let dir = TempDir::new().unwrap();
        let (run, mut rx) = run_with_bash(dir.path());

        run.terminal.write("echo tact-$((2+1))\r").unwrap();
        run.expect().timeout(Duration::from_secs(10)).to_have_value("tact-3").await.unwrap();

        run.expect().to_match_snapshot().await.unwrap();
        run.expect().to_match_snapshot().await.unwrap();
        run.terminal.kill();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.name, "smoke.rs:1:1 > t #1");
        assert_eq!(first.outcome, SnapshotOutcome::Written);
        assert_eq!(second.name, "smoke.rs:1:1 > t #2");
        assert!(dir.path().join("__snapshots__/smoke.rs.snap").exists());
    }

    #[tokio::test]
    async fn resize_propagates_to_the_emulator() {
        let dir = TempDir::new().unwrap();
        let (run, _rx) = run_with_bash(dir.path());

        run.terminal.resize(10, 40).unwrap();
        let grid = run.terminal.viewable_buffer();
        assert_eq!(grid.len(), 10);
        assert_eq!(grid[0].len(), 40);

        run.terminal.kill();
    }
}
