//! Supported shells and one-time shell preparation.
//!
//! Every test runs inside a real shell on the PTY slave side. The set of
//! shells is closed: spawning arbitrary programs is not a goal, and each
//! variant knows how to start itself in a deterministic, rc-file-free way so
//! that screen contents do not depend on the user's dotfiles.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A shell that tests can run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    Cmd,
    Powershell,
    Pwsh,
}

impl Shell {
    /// The shell used when neither the config nor the test selects one.
    pub fn platform_default() -> Shell {
        if cfg!(windows) { Shell::Powershell } else { Shell::Bash }
    }

    /// Program name to execute. Resolved through `PATH` by the PTY layer.
    pub(crate) fn program(self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Zsh => "zsh",
            Shell::Fish => "fish",
            Shell::Cmd => "cmd.exe",
            Shell::Powershell => "powershell.exe",
            Shell::Pwsh => "pwsh",
        }
    }

    /// Arguments that keep startup deterministic across machines.
    pub(crate) fn args(self) -> &'static [&'static str] {
        match self {
            Shell::Bash => &["--noprofile", "--norc"],
            Shell::Zsh => &[],
            Shell::Fish => &["--no-config"],
            Shell::Cmd => &[],
            Shell::Powershell | Shell::Pwsh => &["-NoProfile", "-NoLogo"],
        }
    }

    /// Extra environment required by this shell.
    ///
    /// Zsh reads its dotfiles from `ZDOTDIR`, which [`prepare`] points at a
    /// directory tact owns.
    pub(crate) fn env(self, cwd: &Path) -> Vec<(String, String)> {
        match self {
            Shell::Zsh => vec![(
                "ZDOTDIR".to_string(),
                zdotdir(cwd).to_string_lossy().into_owned(),
            )],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Shell::Bash => "bash",
            Shell::Zsh => "zsh",
            Shell::Fish => "fish",
            Shell::Cmd => "cmd",
            Shell::Powershell => "powershell",
            Shell::Pwsh => "pwsh",
        };
        f.write_str(name)
    }
}

/// Directory holding the zsh dotfiles tact controls.
pub(crate) fn zdotdir(cwd: &Path) -> PathBuf {
    cwd.join(".tact").join("zdotdir")
}

/// Runs the one-time preparation steps for every shell in `shells`.
///
/// Called by the orchestrator before any test is dispatched, with the union
/// of effective shells across the selected tests. Workers rely on the
/// produced files existing; they never write them.
///
/// # Errors
///
/// Returns an error if a required dotfile cannot be written.
pub fn prepare(shells: &BTreeSet<Shell>, cwd: &Path) -> Result<()> {
    for shell in shells {
        if let Shell::Zsh = shell {
            let dir = zdotdir(cwd);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let rc = dir.join(".zshrc");
            std::fs::write(&rc, ZSHRC)
                .with_context(|| format!("failed to write {}", rc.display()))?;
            debug!("prepared zsh dotfiles at {}", dir.display());
        }
    }
    Ok(())
}

/// Fixed prompt so assertions see the same screen on every machine.
const ZSHRC: &str = "unsetopt beep prompt_sp\nPROMPT='%~ %# '\n";
