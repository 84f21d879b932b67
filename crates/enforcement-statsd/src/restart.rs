//! Switch restart detection.
//!
//! The switch daemon's pid is persisted across our own restarts; a different
//! pid means the switch restarted and its counters were reset.

use crate::collaborators::RestartInfoStore;
use crate::error::Result;
use tokio::process::Command;
use tracing::{info, instrument, warn};

/// Pid of `process`, or 0 when it cannot be determined.
#[instrument]
pub async fn process_pid(process: &str) -> u32 {
    let output = match Command::new("pidof").arg("-s").arg(process).output().await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "Failed to run pidof");
            return 0;
        }
    };
    if !output.status.success() {
        warn!("Process not running");
        return 0;
    }
    parse_pidof(&String::from_utf8_lossy(&output.stdout))
}

fn parse_pidof(output: &str) -> u32 {
    output
        .split_whitespace()
        .next()
        .and_then(|pid| pid.parse().ok())
        .unwrap_or(0)
}

/// Stores `observed_pid` under `key` and reports whether it differs from
/// the previously stored one.
pub async fn was_restarted(
    store: &dyn RestartInfoStore,
    key: &str,
    observed_pid: u32,
) -> Result<bool> {
    let previous = store.get(key).await?.unwrap_or(0);
    store.set(key, observed_pid).await?;

    let restarted = previous != observed_pid;
    if restarted {
        info!(key, previous, observed_pid, "Switch restart detected, requesting rule version resync");
    }
    Ok(restarted)
}
