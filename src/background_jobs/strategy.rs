//! The two per-job scheduling loops.
//!
//! Unleased jobs wait a full interval between runs. Leased jobs pace
//! themselves against the lease store so that every replica converges on the
//! same cadence: the next start is always derived from the store's
//! `last_acquired_at` plus the interval, never from local "now + interval".

use super::job::{JobError, JobTrigger};
use super::registration::{JobRegistration, SchedulerError};
use super::runner::{self, JobRunResult};
use super::tracker::RunTracker;
use crate::clock::{to_chrono, until, SharedClock};
use crate::lease::{LeaseManager, LeaseState};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a loop needs besides its registration.
#[derive(Clone)]
pub struct LoopContext {
    pub clock: SharedClock,
    pub tracker: RunTracker,
    pub token: CancellationToken,
}

/// Chosen once per registration from the presence of a lease name.
#[derive(Clone)]
pub enum ScheduleStrategy {
    Unleased,
    Leased {
        lease_name: String,
        manager: LeaseManager,
    },
}

/// What the loop should do after an execution.
enum Flow {
    Continue,
    Exit,
}

impl ScheduleStrategy {
    pub fn for_registration(
        registration: &JobRegistration,
        manager: Option<&LeaseManager>,
    ) -> Result<Self, SchedulerError> {
        match (registration.lease_name(), manager) {
            (None, _) => Ok(ScheduleStrategy::Unleased),
            (Some(lease_name), Some(manager)) => Ok(ScheduleStrategy::Leased {
                lease_name: lease_name.to_string(),
                manager: manager.clone(),
            }),
            (Some(_), None) => Err(SchedulerError::NoLeaseManager(
                registration.name().to_string(),
            )),
        }
    }

    /// Runs the job every `interval` until `ctx.token` is cancelled.
    pub async fn run_loop(
        self,
        registration: Arc<JobRegistration>,
        interval: Duration,
        ctx: LoopContext,
    ) {
        info!(
            "Scheduling job {} every {:?}{}",
            registration.name(),
            interval,
            match &self {
                ScheduleStrategy::Unleased => String::new(),
                ScheduleStrategy::Leased { lease_name, .. } => format!(" under lease {}", lease_name),
            }
        );

        match self {
            ScheduleStrategy::Unleased => unleased_loop(&registration, interval, &ctx).await,
            ScheduleStrategy::Leased {
                lease_name,
                manager,
            } => leased_loop(&registration, interval, &lease_name, &manager, &ctx).await,
        }

        debug!("Loop for job {} exited", registration.name());
    }
}

async fn unleased_loop(registration: &JobRegistration, interval: Duration, ctx: &LoopContext) {
    loop {
        tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let result = tracked_execute(registration, ctx, ctx.token.child_token(), None).await;
        if let Flow::Exit = after_run(&result, ctx) {
            break;
        }
    }
}

async fn leased_loop(
    registration: &JobRegistration,
    interval: Duration,
    lease_name: &str,
    manager: &LeaseManager,
    ctx: &LoopContext,
) {
    let step = to_chrono(interval);
    let origin = ctx.clock.now();
    let mut next_start = origin + step;

    loop {
        let wait = until(ctx.clock.now(), next_start);
        tokio::select! {
            biased;
            _ = ctx.token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let mut observed: Option<LeaseState> = None;
        let now = ctx.clock.now();
        let attempt = manager
            .acquire_when(
                lease_name,
                |state| {
                    observed = Some(state.clone());
                    is_due(state, origin, step, now)
                },
                &ctx.token,
            )
            .await;

        let lease = match attempt {
            Some(lease) if lease.is_acquired() => lease,
            Some(lease) => {
                // Held elsewhere: assume the holder finishes around its expiry
                let completed = lease.state().completion_estimate().unwrap_or(now);
                debug!(
                    "Job {} not acquired, holder expected done at {}",
                    registration.name(),
                    completed
                );
                next_start = completed + step;
                continue;
            }
            None => {
                next_start = match observed {
                    Some(state) => state.last_acquired_at.unwrap_or(origin) + step,
                    None => now + step,
                };
                debug!(
                    "Job {} not due, next attempt at {}",
                    registration.name(),
                    next_start
                );
                continue;
            }
        };

        let fencing_token = lease.ticket().map(|ticket| ticket.token);
        let result = tracked_execute(registration, ctx, lease.validity(), fencing_token).await;

        if lease.is_lost() {
            warn!(
                "Job {} lost lease {} during its run",
                registration.name(),
                lease_name
            );
        }
        lease.release().await;

        next_start = lease.last_acquired_at().unwrap_or(now) + step;
        debug!(
            "Job {} next start at {} (last released {:?})",
            registration.name(),
            next_start,
            lease.last_released_at()
        );

        if let Flow::Exit = after_run(&result, ctx) {
            break;
        }
    }
}

/// A leased job is due once a full interval has passed since the last
/// acquisition by any replica.
fn is_due(
    state: &LeaseState,
    origin: DateTime<Utc>,
    step: chrono::Duration,
    now: DateTime<Utc>,
) -> bool {
    state.last_acquired_at.unwrap_or(origin) + step <= now
}

async fn tracked_execute(
    registration: &JobRegistration,
    ctx: &LoopContext,
    token: CancellationToken,
    fencing_token: Option<crate::lease::FencingToken>,
) -> JobRunResult {
    let _guard = ctx.tracker.track();
    runner::execute(registration, JobTrigger::Interval, token, fencing_token).await
}

/// Only cancellation by the loop's own token ends the loop. Any other failure,
/// including a cancellation caused by a lost lease, waits for the next tick.
fn after_run(result: &JobRunResult, ctx: &LoopContext) -> Flow {
    match &result.error {
        Some(JobError::Cancelled) if ctx.token.is_cancelled() => Flow::Exit,
        _ => Flow::Continue,
    }
}
