//! Lease schema migration job.
//!
//! Runs in-line at the Starting point, before any lease is requested, and
//! brings the SQLite lease database to the latest schema version.

use crate::background_jobs::{Job, JobContext, JobError};
use crate::lease::SqliteLeaseStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct LeaseSchemaMigrationJob {
    store: Arc<SqliteLeaseStore>,
}

impl LeaseSchemaMigrationJob {
    pub const NAME: &'static str = "lease_schema_migration";

    pub fn new(store: Arc<SqliteLeaseStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Job for LeaseSchemaMigrationJob {
    async fn run(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let store = Arc::clone(&self.store);
        let version = tokio::task::spawn_blocking(move || store.migrate())
            .await
            .map_err(|e| JobError::ExecutionFailed(format!("Migration task failed: {}", e)))??;

        info!("Lease schema ready at version {}", version);
        Ok(())
    }
}
