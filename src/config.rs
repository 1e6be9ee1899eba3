//! Configuration loading.
//!
//! Configuration comes from a `tact.toml` in the working directory and is
//! immutable for the rest of the run. Every field has a default, and a
//! missing file is the default configuration, so a project without a
//! `tact.toml` still runs.
//!
//! ```toml
//! timeout = 10000
//! retries = 1
//! global-timeout = 600000
//!
//! [expect]
//! timeout = 5000
//!
//! [[projects]]
//! name = "shells"
//! test-match = ["tests/ui/**/*.rs"]
//!
//! [projects.use]
//! shell = "zsh"
//! rows = 30
//! columns = 80
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::suite::TestOptions;

/// Name of the config file looked up in the working directory.
pub const CONFIG_FILE: &str = "tact.toml";

/// Root configuration record.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Per-test timeout in milliseconds; the pool kills the worker when it
    /// elapses. `0` disables the limit.
    pub timeout: u64,

    /// Assertion defaults.
    pub expect: ExpectConfig,

    /// Retries per test beyond the first attempt.
    pub retries: u32,

    /// Wall-clock limit for the whole run in milliseconds; `0` disables it.
    pub global_timeout: u64,

    /// Worker process count. Defaults to half the available cores.
    pub workers: Option<usize>,

    /// Count flaky outcomes as failures for the exit code.
    pub fail_on_flaky: bool,

    /// Project partitions of the registered test files.
    pub projects: Vec<ProjectConfig>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            timeout: 10_000,
            expect: ExpectConfig::default(),
            retries: 0,
            global_timeout: 0,
            workers: None,
            fail_on_flaky: false,
            projects: Vec::new(),
        }
    }
}

/// Defaults applied to `to_have_value`-style assertions.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExpectConfig {
    /// Assertion poll deadline in milliseconds.
    pub timeout: u64,
}

impl Default for ExpectConfig {
    fn default() -> ExpectConfig {
        ExpectConfig { timeout: 5_000 }
    }
}

/// One named project: a glob-selected slice of the registered files plus
/// options inherited by every test in it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: String,

    /// Glob patterns over registered source paths.
    pub test_match: Vec<String>,

    /// Options applied at the project level of the suite tree.
    #[serde(rename = "use")]
    pub use_options: TestOptions,
}

impl Config {
    /// Number of worker processes to maintain.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism().map(usize::from).unwrap_or(2);
            (cores / 2).max(1)
        })
    }
}

/// Loads `tact.toml` from `dir`, or the defaults when it does not exist.
///
/// # Errors
///
/// A present-but-malformed file is a configuration error.
pub fn load(dir: &Path) -> Result<Config> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Config::default());
    }
    load_file(&path)
}

/// Loads configuration from an explicit file path (the `--config` override).
///
/// Unlike [`load`], a missing file is an error here: the user asked for this
/// file specifically.
pub fn load_file(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    load_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

/// Parses configuration from a TOML string.
pub fn load_str(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("invalid configuration")?;
    Ok(config)
}
