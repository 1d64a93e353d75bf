//! Registry Scheduler Library
//!
//! Lease-coordinated background job scheduling for horizontally scaled
//! registry service instances.

pub mod background_jobs;
pub mod clock;
pub mod config;
pub mod host;
pub mod lease;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use background_jobs::{Job, JobRegistration, JobScheduler, RunAt};
pub use host::{run_host, HostSettings, HostedService};
pub use lease::{LeaseManager, LeaseOptions, LeaseStore};
