use super::job::JobTrigger;
use crate::lease::FencingToken;
use tokio_util::sync::CancellationToken;

/// Context provided to jobs during execution.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Fires on shutdown and, for leased runs, as soon as the lease is lost.
    pub cancellation_token: CancellationToken,

    pub job_name: &'static str,

    pub trigger: JobTrigger,

    /// Fencing token of the lease guarding this run, if any. Jobs writing to
    /// stores that support fencing should pass it along.
    pub fencing_token: Option<FencingToken>,
}

impl JobContext {
    pub fn new(
        cancellation_token: CancellationToken,
        job_name: &'static str,
        trigger: JobTrigger,
        fencing_token: Option<FencingToken>,
    ) -> Self {
        Self {
            cancellation_token,
            job_name,
            trigger,
            fencing_token,
        }
    }

    /// Check if cancellation has been requested.
    ///
    /// Jobs should periodically check this during long-running operations
    /// and return early with `JobError::Cancelled` if true.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
