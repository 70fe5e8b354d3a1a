//! Scheduled housekeeping: dedup fingerprint pruning.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::store::DedupStore;

/// Next fire time of `schedule` strictly after `after`.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Run one prune pass, logging the result.
pub async fn prune_once(dedup: &dyn DedupStore, retention_days: u32) -> usize {
    match dedup.prune(retention_days).await {
        Ok(removed) => {
            info!(removed, retention_days, "Dedup prune finished");
            removed
        }
        Err(e) => {
            error!(error = %e, "Dedup prune failed");
            0
        }
    }
}

/// Spawn a task that prunes fingerprints older than `retention_days`
/// whenever `schedule` fires.
pub fn spawn_prune_ticker(
    dedup: Arc<dyn DedupStore>,
    schedule: cron::Schedule,
    retention_days: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let Some(next) = next_fire(&schedule, now) else {
                warn!("Prune schedule has no upcoming fire time, stopping ticker");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next, "Next dedup prune scheduled");
            tokio::time::sleep(wait).await;
            prune_once(dedup.as_ref(), retention_days).await;
        }
    })
}
