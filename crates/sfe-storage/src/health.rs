//! Data directory health check

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Verify the data directory exists, is a directory and accepts writes
pub fn check_health(root: &Path) -> Result<()> {
    let meta = fs::metadata(root)
        .with_context(|| format!("data directory {} is not reachable", root.display()))?;
    if !meta.is_dir() {
        anyhow::bail!("data directory {} is not a directory", root.display());
    }
    let probe = root.join(format!(".sfe-health-{}", std::process::id()));
    fs::write(&probe, b"ok")
        .with_context(|| format!("data directory {} is not writable", root.display()))?;
    fs::remove_file(&probe).with_context(|| format!("removing {}", probe.display()))?;
    Ok(())
}

/// Returns true if the data directory is usable, false otherwise
pub fn is_healthy(root: &Path) -> bool {
    check_health(root).is_ok()
}
