//! Transform-cache resolution.
//!
//! The source transform itself is an external concern; the runner only
//! resolves, per registered test file, the loadable path it dispatches to
//! workers. Transformed files live under `<cwd>/.tact/cache/` mirroring the
//! source tree, and each one opens with a `//# hash=<hex>` line. A cache
//! entry is used only when that hex equals the SHA-256 of the source file;
//! anything else falls back to the source path itself.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

const HASH_PREFIX: &str = "//# hash=";

/// Root of the transform cache below `cwd`.
pub fn cache_root(cwd: &Path) -> PathBuf {
    cwd.join(".tact").join("cache")
}

/// Resolves a registered source path to its loadable path.
pub fn resolve(source: &Path, cwd: &Path) -> PathBuf {
    let relative = source.strip_prefix(cwd).unwrap_or(source);
    let candidate = cache_root(cwd).join(relative);
    match cache_entry_is_valid(source, &candidate) {
        Ok(true) => {
            debug!("using cached transform for {}", source.display());
            candidate
        }
        Ok(false) => source.to_path_buf(),
        Err(err) => {
            debug!("cache probe failed for {}: {err:#}", source.display());
            source.to_path_buf()
        }
    }
}

fn cache_entry_is_valid(source: &Path, candidate: &Path) -> Result<bool> {
    if !candidate.is_file() {
        return Ok(false);
    }
    let contents = std::fs::read_to_string(candidate)
        .with_context(|| format!("failed to read {}", candidate.display()))?;
    let Some(first_line) = contents.lines().next() else {
        return Ok(false);
    };
    let Some(recorded) = first_line.strip_prefix(HASH_PREFIX) else {
        return Ok(false);
    };
    Ok(recorded == file_hash(source)?)
}

/// SHA-256 of a file, as lowercase hex. Reads in chunks.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
