use super::job::{Job, JobError, LifecyclePoint, RunAt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Builds one fresh job instance per execution.
pub type JobFactory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;

/// Errors raised by the scheduler: configuration problems at registration
/// time and failures of in-line lifecycle jobs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Job {0} has neither a positive interval nor a lifecycle point")]
    EmptySchedule(String),

    #[error("Job {job} interval {interval:?} is below the minimum of {min:?}")]
    IntervalTooShort {
        job: String,
        interval: Duration,
        min: Duration,
    },

    #[error("Job {0} cannot take a lease at the Starting point")]
    LeaseAtStarting(String),

    #[error("Job {0} has an empty lease name")]
    EmptyLeaseName(String),

    #[error("Job {0} needs a lease but the scheduler has no lease manager")]
    NoLeaseManager(String),

    #[error("Job {0} is already registered")]
    DuplicateJob(String),

    #[error("Cannot register job {0} after the scheduler started")]
    AlreadyStarted(String),

    #[error("Lifecycle job {job} failed at {point}: {source}")]
    LifecycleJobFailed {
        job: String,
        point: LifecyclePoint,
        source: JobError,
    },
}

/// Binds a job type to its schedule: an interval, lifecycle points, or both,
/// plus an optional lease guarding every execution.
#[derive(Clone)]
pub struct JobRegistration {
    name: &'static str,
    interval: Option<Duration>,
    run_at: RunAt,
    lease_name: Option<String>,
    factory: JobFactory,
}

impl JobRegistration {
    /// Creates a registration with an empty schedule. `name` identifies the
    /// job in logs and metrics and must be unique per scheduler. The factory
    /// is only invoked when the job runs.
    pub fn new<F, J>(name: &'static str, factory: F) -> Self
    where
        F: Fn() -> J + Send + Sync + 'static,
        J: Job + 'static,
    {
        Self {
            name,
            interval: None,
            run_at: RunAt::NONE,
            lease_name: None,
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Job>),
        }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval).filter(|interval| !interval.is_zero());
        self
    }

    pub fn run_at(mut self, run_at: RunAt) -> Self {
        self.run_at = self.run_at | run_at;
        self
    }

    pub fn with_lease(mut self, lease_name: impl Into<String>) -> Self {
        self.lease_name = Some(lease_name.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn lifecycle(&self) -> RunAt {
        self.run_at
    }

    pub fn lease_name(&self) -> Option<&str> {
        self.lease_name.as_deref()
    }

    pub fn create_job(&self) -> Box<dyn Job> {
        (self.factory)()
    }

    /// Checks the schedule against the configured interval floor.
    pub fn validate(&self, min_interval: Duration) -> Result<(), SchedulerError> {
        let job = self.name.to_string();

        if self.interval.is_none() && self.run_at.is_empty() {
            return Err(SchedulerError::EmptySchedule(job));
        }
        if let Some(interval) = self.interval {
            if interval < min_interval {
                return Err(SchedulerError::IntervalTooShort {
                    job,
                    interval,
                    min: min_interval,
                });
            }
        }
        if let Some(lease_name) = &self.lease_name {
            if lease_name.trim().is_empty() {
                return Err(SchedulerError::EmptyLeaseName(job));
            }
            if self.run_at.includes(LifecyclePoint::Starting) {
                return Err(SchedulerError::LeaseAtStarting(job));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for JobRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistration")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("run_at", &self.run_at)
            .field("lease_name", &self.lease_name)
            .finish()
    }
}
