use std::time::Duration;

use horizon_core::CoordError;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Wait until every kind reports synced, in order. Fails naming the first kind
/// still unsynced when `cancel` fires, the deadline passes, or its mirror goes away.
pub async fn wait_for_sync(
    kinds: Vec<(String, watch::Receiver<bool>)>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<(), CoordError> {
    let deadline = timeout.map(|t| Instant::now() + t);
    for (label, mut rx) in kinds {
        let synced = tokio::select! {
            biased;
            r = rx.wait_for(|s| *s) => r.is_ok(),
            _ = cancel.cancelled() => false,
            _ = sleep_until(deadline) => false,
        };
        if !synced {
            warn!(kind = %label, "failed to sync resource");
            return Err(CoordError::SyncTimeout { kind: label });
        }
        debug!(kind = %label, "resource synced");
    }
    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
