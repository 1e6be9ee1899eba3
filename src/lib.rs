//! # tact
//!
//! A terminal-application test runner: every test drives a real shell on a
//! real PTY, and assertions run against an emulated screen. The contract
//! under test is what the user would see in their terminal.
//!
//! ## Architecture
//!
//! - [`loader`] evaluates registered test files into a tree of suites
//!   (projects, files, describe groups) with inherited options.
//! - [`orchestrator`] selects tests, runs attempts with retries, and feeds
//!   the [`reporter`].
//! - [`pool`] keeps N worker processes (re-executions of the harness
//!   binary) and dispatches one test per call with a kill-on-timeout
//!   deadline.
//! - The worker-side runtime spawns a [`term::Terminal`] per attempt: a
//!   shell on a PTY whose output feeds a deterministic VT emulator.
//! - [`term::Expectation`] polls the emulated screen (`to_have_value`) and
//!   checks stored screens (`to_match_snapshot`, backed by [`snapshot`]).
//!
//! ## Quick start
//!
//! Create a test target with `harness = false` and register test files:
//!
//! ```no_run
//! use tact::{Dsl, FileSpec};
//!
//! fn prompt(t: &mut Dsl) {
//!     t.test("shows a prompt", |run| async move {
//!         run.expect().to_have_value("$").await
//!     });
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     tact::run(&[FileSpec::new("tests/ui/prompt.rs", prompt)])
//! }
//! ```
//!
//! Configuration lives in `tact.toml` (see [`config`]); snapshots next to
//! each test file; filters and `--update-snapshot` on the command line.

pub mod cache;
pub mod cli;
pub mod config;
pub mod loader;
pub mod orchestrator;
pub mod pool;
pub mod protocol;
pub mod reporter;
pub mod shell;
pub mod snapshot;
pub mod suite;
pub mod term;

mod worker;

pub use cli::run;
pub use loader::{Dsl, FileSpec};
pub use orchestrator::{ExecutionOptions, Orchestrator, RunError, RunReport};
pub use pool::{AttemptOutcome, Executor, WorkerPool};
pub use reporter::{ListReporter, NullReporter, Reporter};
pub use shell::Shell;
pub use snapshot::{SnapshotOutcome, SnapshotStatus};
pub use suite::{Annotation, Status, Suite, TestCase, TestOptions, TestResult};
pub use term::{Expectation, SpawnSpec, Terminal, TestRun};
