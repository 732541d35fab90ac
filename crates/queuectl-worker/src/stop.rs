//! Out-of-process stop requests.
//!
//! `worker stop` drops a marker file; every running pool polls for it and
//! turns its appearance into cancellation of its own token.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

/// Ask every pool watching `marker` to drain and exit.
pub fn request_stop(marker: &Path) -> Result<()> {
    if let Some(parent) = marker.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(marker, b"stop\n")?;
    info!(marker = %marker.display(), "stop requested");
    Ok(())
}

/// Remove a leftover marker. Missing is fine.
pub fn clear_stop(marker: &Path) -> Result<()> {
    match std::fs::remove_file(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn stop_requested(marker: &Path) -> bool {
    marker.exists()
}

/// Poll for `marker` every `interval` and cancel `token` once it appears.
/// Returns when the marker is seen or `token` is cancelled some other way.
pub async fn watch_stop_marker(marker: PathBuf, interval: Duration, token: CancellationToken) {
    loop {
        if stop_requested(&marker) {
            info!(marker = %marker.display(), "stop marker found, draining workers");
            token.cancel();
            return;
        }
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
