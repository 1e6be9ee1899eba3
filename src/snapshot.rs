//! On-disk snapshot storage for `to_match_snapshot`.
//!
//! Snapshots live next to the test file that produced them, in a
//! `__snapshots__` directory: `tests/ui/prompt.rs` stores its snapshots in
//! `tests/ui/__snapshots__/prompt.rs.snap`. Each `.snap` file is a JSON
//! object mapping `"<test id> #<sequence>"` to the recorded screen text, kept
//! sorted so reruns produce byte-identical files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What happened to a single snapshot assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOutcome {
    /// Stored value equals the captured value.
    Matched,
    /// Stored value differs from the captured value; the test fails.
    Mismatched,
    /// No stored value existed; the captured value was recorded.
    Written,
    /// Stored value was replaced because update mode is on.
    Updated,
    /// A new value was captured but could not be persisted.
    Missing,
}

/// A named snapshot outcome, streamed back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub name: String,
    pub outcome: SnapshotOutcome,
}

/// Snapshot storage for one test file.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl SnapshotStore {
    /// Opens the store backing `source`, loading existing entries if any.
    ///
    /// A missing or unreadable `.snap` file yields an empty store; the first
    /// recorded snapshot creates it.
    pub fn for_test_file(source: &Path) -> SnapshotStore {
        let dir = source.parent().unwrap_or_else(|| Path::new(".")).join("__snapshots__");
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        let path = dir.join(format!("{file_name}.snap"));

        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("ignoring malformed snapshot file {}: {err}", path.display());
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };

        SnapshotStore { path, entries }
    }

    /// The stored value for `name`, if one exists.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Compares `value` against the stored snapshot `name`.
    ///
    /// Line endings in `value` are normalized before comparison. New and
    /// updated values are persisted immediately; if persisting fails the
    /// outcome degrades to [`SnapshotOutcome::Missing`].
    pub fn check(&mut self, name: &str, value: &str, update: bool) -> SnapshotOutcome {
        let value = normalize(value);
        match self.entries.get(name) {
            None => {
                self.entries.insert(name.to_string(), value);
                match self.persist() {
                    Ok(()) => SnapshotOutcome::Written,
                    Err(err) => {
                        warn!("failed to write snapshot {name:?}: {err:#}");
                        SnapshotOutcome::Missing
                    }
                }
            }
            Some(stored) if *stored == value => SnapshotOutcome::Matched,
            Some(_) if update => {
                self.entries.insert(name.to_string(), value);
                match self.persist() {
                    Ok(()) => SnapshotOutcome::Updated,
                    Err(err) => {
                        warn!("failed to update snapshot {name:?}: {err:#}");
                        SnapshotOutcome::Missing
                    }
                }
            }
            Some(_) => SnapshotOutcome::Mismatched,
        }
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, contents)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        debug!("persisted {} snapshot(s) to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

fn normalize(value: &str) -> String {
    value.replace("\r\n", "\n")
}
