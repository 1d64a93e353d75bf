//! Background job scheduling and execution system.
//!
//! Jobs run at host lifecycle points (awaited in-line) and/or on fixed
//! intervals. Interval jobs may be guarded by a named lease so that only one
//! instance in a cluster executes them per tick.

mod context;
mod job;
pub mod jobs;
mod registration;
mod runner;
mod scheduler;
mod strategy;
mod tracker;

pub use context::JobContext;
pub use job::{Job, JobError, JobTrigger, LifecyclePoint, RunAt};
pub use registration::{JobFactory, JobRegistration, SchedulerError};
pub use runner::JobRunResult;
pub use scheduler::{JobScheduler, DEFAULT_MIN_INTERVAL};
pub use tracker::{RunGuard, RunTracker};
