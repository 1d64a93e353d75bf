//! Expired lease prune job.
//!
//! Lease rows are never deleted by the lease protocol itself, so ids that
//! are no longer used accumulate. This job deletes rows that have no live
//! holder and have not been touched for the retention window.

use crate::background_jobs::{Job, JobContext, JobError};
use crate::clock::{to_chrono, SharedClock};
use crate::lease::SqliteLeaseStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct ExpiredLeasePruneJob {
    store: Arc<SqliteLeaseStore>,
    clock: SharedClock,
    retention: Duration,
}

impl ExpiredLeasePruneJob {
    pub const NAME: &'static str = "expired_lease_prune";

    pub fn new(store: Arc<SqliteLeaseStore>, clock: SharedClock, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }
}

#[async_trait]
impl Job for ExpiredLeasePruneJob {
    async fn run(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let cutoff = self.clock.now() - to_chrono(self.retention);
        debug!(
            "Pruning idle leases untouched since {} (fencing token {:?})",
            cutoff, ctx.fencing_token
        );

        let store = Arc::clone(&self.store);
        let deleted = tokio::task::spawn_blocking(move || store.prune_idle(cutoff))
            .await
            .map_err(|e| JobError::ExecutionFailed(format!("Prune task failed: {}", e)))?
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;

        if deleted > 0 {
            info!("Pruned {} idle lease rows", deleted);
        }
        Ok(())
    }
}
