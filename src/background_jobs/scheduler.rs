use super::job::{JobTrigger, LifecyclePoint};
use super::registration::{JobRegistration, SchedulerError};
use super::runner;
use super::strategy::{LoopContext, ScheduleStrategy};
use super::tracker::RunTracker;
use crate::clock::SharedClock;
use crate::host::HostedService;
use crate::lease::LeaseManager;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default floor for job intervals.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(10);

struct ScheduledJob {
    registration: Arc<JobRegistration>,
    strategy: ScheduleStrategy,
}

/// Runs registered jobs at host lifecycle points and on their intervals.
///
/// Each interval job gets its own loop task, all driven by one shutdown token.
/// Leased jobs coordinate with other instances through the lease manager so
/// that at most one instance runs a given job at a time.
pub struct JobScheduler {
    clock: SharedClock,
    lease_manager: Option<LeaseManager>,
    min_interval: Duration,

    jobs: Vec<ScheduledJob>,

    /// Root of every loop token and every lease validity token.
    shutdown_token: CancellationToken,

    /// Loop tasks launched at Start, awaited at Stop.
    loops: Mutex<Vec<JoinHandle<()>>>,

    started: AtomicBool,

    tracker: RunTracker,
}

impl JobScheduler {
    pub fn new(clock: SharedClock, lease_manager: Option<LeaseManager>) -> Self {
        Self {
            clock,
            lease_manager,
            min_interval: DEFAULT_MIN_INTERVAL,
            jobs: Vec::new(),
            shutdown_token: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            tracker: RunTracker::new(),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Register a job with the scheduler. Configuration problems are reported
    /// here, never later.
    pub fn register(&mut self, registration: JobRegistration) -> Result<(), SchedulerError> {
        let name = registration.name();
        if self.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted(name.to_string()));
        }
        registration.validate(self.min_interval)?;
        if self.jobs.iter().any(|job| job.registration.name() == name) {
            return Err(SchedulerError::DuplicateJob(name.to_string()));
        }
        let strategy = ScheduleStrategy::for_registration(&registration, self.lease_manager.as_ref())?;

        info!("Registering job: {:?}", registration);
        self.jobs.push(ScheduledJob {
            registration: Arc::new(registration),
            strategy,
        });
        Ok(())
    }

    /// Get the number of registered jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Handle over all interval-triggered work currently in flight.
    pub fn running_work(&self) -> RunTracker {
        self.tracker.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Runs every job attached to `point`, in registration order.
    ///
    /// Unleased jobs propagate their failure and abort the sequence. Leased
    /// jobs try the lease once, are skipped when it is unavailable, and never
    /// propagate.
    async fn run_lifecycle(
        &self,
        point: LifecyclePoint,
        token: &CancellationToken,
    ) -> Result<(), SchedulerError> {
        let trigger = JobTrigger::Lifecycle(point);

        for job in self
            .jobs
            .iter()
            .filter(|job| job.registration.lifecycle().includes(point))
        {
            let registration = &job.registration;
            match &job.strategy {
                ScheduleStrategy::Unleased => {
                    let result =
                        runner::execute(registration, trigger, token.child_token(), None).await;
                    if let Some(source) = result.error {
                        return Err(SchedulerError::LifecycleJobFailed {
                            job: registration.name().to_string(),
                            point,
                            source,
                        });
                    }
                }
                ScheduleStrategy::Leased {
                    lease_name,
                    manager,
                } => {
                    let lease = manager.acquire(lease_name, token).await;
                    if !lease.is_acquired() {
                        info!(
                            "Skipping {} job {}: lease {} is held elsewhere",
                            point,
                            registration.name(),
                            lease_name
                        );
                        continue;
                    }
                    let fencing_token = lease.ticket().map(|ticket| ticket.token);
                    let result =
                        runner::execute(registration, trigger, lease.validity(), fencing_token)
                            .await;
                    lease.release().await;
                    if let Some(e) = result.error {
                        warn!(
                            "Leased {} job {} failed, not propagating: {}",
                            point,
                            registration.name(),
                            e
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn launch_loops(&self) {
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        for job in &self.jobs {
            let Some(interval) = job.registration.interval() else {
                continue;
            };
            let ctx = LoopContext {
                clock: Arc::clone(&self.clock),
                tracker: self.tracker.clone(),
                token: self.shutdown_token.child_token(),
            };
            loops.push(tokio::spawn(job.strategy.clone().run_loop(
                Arc::clone(&job.registration),
                interval,
                ctx,
            )));
        }
        info!("Launched {} job loops", loops.len());
    }

    pub async fn on_starting(&self) -> Result<(), SchedulerError> {
        self.started.store(true, Ordering::SeqCst);
        self.run_lifecycle(LifecyclePoint::Starting, &self.shutdown_token)
            .await
    }

    /// Runs Start jobs, then launches the interval loops.
    pub async fn on_start(&self) -> Result<(), SchedulerError> {
        self.started.store(true, Ordering::SeqCst);
        info!("Starting job scheduler with {} registered jobs", self.jobs.len());
        self.run_lifecycle(LifecyclePoint::Start, &self.shutdown_token)
            .await?;
        self.launch_loops();
        Ok(())
    }

    pub async fn on_started(&self) -> Result<(), SchedulerError> {
        self.run_lifecycle(LifecyclePoint::Started, &self.shutdown_token)
            .await
    }

    pub async fn on_stopping(&self) -> Result<(), SchedulerError> {
        self.run_lifecycle(LifecyclePoint::Stopping, &self.shutdown_token)
            .await
    }

    /// Cancels every loop and waits for them, unless `forced` fires first.
    /// Stop jobs then run under `forced`.
    pub async fn on_stop(&self, forced: &CancellationToken) -> Result<(), SchedulerError> {
        info!("Job scheduler received shutdown signal");
        self.shutdown_token.cancel();

        let loops = std::mem::take(&mut *self.loops.lock().unwrap_or_else(|e| e.into_inner()));
        let loop_count = loops.len();

        tokio::select! {
            results = join_all(loops) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Job loop ended abnormally: {}", e);
                    }
                }
                info!("All {} job loops stopped", loop_count);
            }
            _ = forced.cancelled() => {
                warn!(
                    "Forced shutdown: no longer waiting for {} job loops ({} runs in flight)",
                    loop_count,
                    self.tracker.in_flight()
                );
            }
        }

        self.run_lifecycle(LifecyclePoint::Stop, forced).await
    }

    pub async fn on_stopped(&self, forced: &CancellationToken) -> Result<(), SchedulerError> {
        let result = self.run_lifecycle(LifecyclePoint::Stopped, forced).await;
        info!("Job scheduler stopped");
        result
    }
}

#[async_trait]
impl HostedService for JobScheduler {
    fn name(&self) -> &str {
        "job-scheduler"
    }

    async fn starting(&self) -> anyhow::Result<()> {
        Ok(self.on_starting().await?)
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(self.on_start().await?)
    }

    async fn started(&self) -> anyhow::Result<()> {
        Ok(self.on_started().await?)
    }

    async fn stopping(&self) -> anyhow::Result<()> {
        Ok(self.on_stopping().await?)
    }

    async fn stop(&self, forced: &CancellationToken) -> anyhow::Result<()> {
        Ok(self.on_stop(forced).await?)
    }

    async fn stopped(&self, forced: &CancellationToken) -> anyhow::Result<()> {
        Ok(self.on_stopped(forced).await?)
    }
}
