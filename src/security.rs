//! Shared security helpers used by the tubecast binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The cache directory is
/// world-readable media; nothing here needs elevated privileges, and running
/// the fetch tool as root would hand it far more filesystem than it needs.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; use a dedicated service account");
    }
    Ok(())
}
