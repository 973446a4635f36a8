//! Background sweep of expired files.
//!
//! Only enumerable backends are swept; the object store relies on lazy
//! expiry alone.

use crate::services::storage::{EnumerableBackend, StorageResult};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Delete every expired file once.
///
/// Files whose metadata cannot be read are counted as failures and left in
/// place. Only a failure to list keys aborts the sweep.
pub async fn sweep(backend: &dyn EnumerableBackend) -> StorageResult<SweepReport> {
    let keys = backend.list().await?;
    let mut report = SweepReport {
        scanned: keys.len(),
        ..Default::default()
    };

    for key in keys {
        let metadata = match backend.head(&key).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(key = %key, error = %err, "skipping file with unreadable metadata");
                report.failed += 1;
                continue;
            }
        };
        if !metadata.expiry.is_expired() {
            continue;
        }
        match backend.delete(&key).await {
            Ok(()) => {
                debug!(key = %key, "deleted expired file");
                report.deleted += 1;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "failed to delete expired file");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Run [`sweep`] every `every` until `cancel` fires.
pub fn spawn_periodic(
    backend: Arc<dyn EnumerableBackend>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("cleanup task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match sweep(backend.as_ref()).await {
                        Ok(report) => info!(
                            scanned = report.scanned,
                            deleted = report.deleted,
                            failed = report.failed,
                            "cleanup sweep finished"
                        ),
                        Err(err) => error!(error = %err, "cleanup sweep failed"),
                    }
                }
            }
        }
    })
}
