use super::context::JobContext;
use super::job::{JobError, JobTrigger};
use super::registration::JobRegistration;
use crate::lease::FencingToken;
use crate::server::metrics;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct JobRunResult {
    pub name: &'static str,
    pub duration: Duration,
    pub error: Option<JobError>,
}

impl JobRunResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub fn was_cancelled(&self) -> bool {
        matches!(self.error, Some(JobError::Cancelled))
    }
}

/// Builds a fresh job instance and runs it to completion on its own task.
///
/// The job is never aborted: `token` only asks it to stop. A panic inside the
/// job is captured as [`JobError::Panicked`].
pub async fn execute(
    registration: &JobRegistration,
    trigger: JobTrigger,
    token: CancellationToken,
    fencing_token: Option<FencingToken>,
) -> JobRunResult {
    let name = registration.name();
    let mut job = registration.create_job();
    let ctx = JobContext::new(token, name, trigger, fencing_token);
    let span = info_span!("job_run", job = name, trigger = %trigger);

    metrics::record_job_started(name);
    let start_time = Instant::now();

    let handle = tokio::spawn(
        async move {
            info!("Starting job");
            job.run(&ctx).await
        }
        .instrument(span),
    );
    let result = handle.await;
    let duration = start_time.elapsed();

    let error = match result {
        Ok(Ok(())) => {
            info!("Job {} ({}) completed in {:?}", name, trigger, duration);
            None
        }
        Ok(Err(JobError::Cancelled)) => {
            info!("Job {} ({}) was cancelled after {:?}", name, trigger, duration);
            Some(JobError::Cancelled)
        }
        Ok(Err(e)) => {
            error!("Job {} ({}) failed after {:?}: {}", name, trigger, duration, e);
            Some(e)
        }
        Err(e) if e.is_panic() => {
            error!("Job {} ({}) panicked after {:?}", name, trigger, duration);
            Some(JobError::Panicked(panic_message(e.into_panic())))
        }
        Err(e) => {
            warn!("Job {} ({}) task ended abnormally: {}", name, trigger, e);
            Some(JobError::Cancelled)
        }
    };

    metrics::record_job_finished(name, error.is_none(), duration);

    JobRunResult {
        name,
        duration,
        error,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
