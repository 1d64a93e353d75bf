use super::context::JobContext;
use async_trait::async_trait;
use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

/// A named moment in the host lifecycle at which jobs run in-line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePoint {
    Starting,
    Start,
    Started,
    Stopping,
    Stop,
    Stopped,
}

impl LifecyclePoint {
    pub const ALL: [LifecyclePoint; 6] = [
        LifecyclePoint::Starting,
        LifecyclePoint::Start,
        LifecyclePoint::Started,
        LifecyclePoint::Stopping,
        LifecyclePoint::Stop,
        LifecyclePoint::Stopped,
    ];

    pub fn flag(self) -> RunAt {
        match self {
            LifecyclePoint::Starting => RunAt::STARTING,
            LifecyclePoint::Start => RunAt::START,
            LifecyclePoint::Started => RunAt::STARTED,
            LifecyclePoint::Stopping => RunAt::STOPPING,
            LifecyclePoint::Stop => RunAt::STOP,
            LifecyclePoint::Stopped => RunAt::STOPPED,
        }
    }
}

impl fmt::Display for LifecyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePoint::Starting => write!(f, "Starting"),
            LifecyclePoint::Start => write!(f, "Start"),
            LifecyclePoint::Started => write!(f, "Started"),
            LifecyclePoint::Stopping => write!(f, "Stopping"),
            LifecyclePoint::Stop => write!(f, "Stop"),
            LifecyclePoint::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Set of lifecycle points a job is attached to. Flags combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RunAt(u8);

impl RunAt {
    pub const NONE: RunAt = RunAt(0);
    pub const STARTING: RunAt = RunAt(1 << 0);
    pub const START: RunAt = RunAt(1 << 1);
    pub const STARTED: RunAt = RunAt(1 << 2);
    pub const STOPPING: RunAt = RunAt(1 << 3);
    pub const STOP: RunAt = RunAt(1 << 4);
    pub const STOPPED: RunAt = RunAt(1 << 5);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: RunAt) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn includes(self, point: LifecyclePoint) -> bool {
        self.contains(point.flag())
    }

    pub fn points(self) -> impl Iterator<Item = LifecyclePoint> {
        LifecyclePoint::ALL
            .into_iter()
            .filter(move |point| self.includes(*point))
    }
}

impl BitOr for RunAt {
    type Output = RunAt;

    fn bitor(self, rhs: RunAt) -> RunAt {
        RunAt(self.0 | rhs.0)
    }
}

impl From<LifecyclePoint> for RunAt {
    fn from(point: LifecyclePoint) -> Self {
        point.flag()
    }
}

/// What caused a particular execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTrigger {
    Interval,
    Lifecycle(LifecyclePoint),
}

impl fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTrigger::Interval => write!(f, "interval"),
            JobTrigger::Lifecycle(point) => write!(f, "lifecycle:{}", point),
        }
    }
}

/// Errors that can occur during job execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError::ExecutionFailed(format!("{:#}", e))
    }
}

/// A unit of background work.
///
/// A fresh instance is built from the registration's factory for every
/// execution, so implementations may keep per-run state in `&mut self`.
/// Dropping the instance is its disposal. The job's name belongs to its
/// registration and is available at run time as `ctx.job_name`.
#[async_trait]
pub trait Job: Send {
    /// Execute the job.
    ///
    /// Long-running work should check `ctx.is_cancelled()` (or await
    /// `ctx.cancellation_token.cancelled()`) and return
    /// `JobError::Cancelled` early. Cancellation fires on shutdown and, for
    /// leased jobs, when the lease is lost.
    async fn run(&mut self, ctx: &JobContext) -> Result<(), JobError>;
}
