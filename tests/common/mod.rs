//! Common test infrastructure
//!
//! Deterministic clocks, shared lease stores and a handful of scripted jobs
//! for driving schedulers under paused tokio time.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use registry_scheduler::background_jobs::{Job, JobContext, JobError, JobRegistration};
use registry_scheduler::clock::{SharedClock, TokioClock};
use registry_scheduler::lease::{InMemoryLeaseStore, LeaseManager, LeaseOptions};
use registry_scheduler::JobScheduler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub const INTERVAL: Duration = Duration::from_secs(30);

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    epoch() + chrono::Duration::seconds(secs)
}

/// Clock and store shared by every simulated instance in a test.
pub struct Cluster {
    pub clock: SharedClock,
    pub store: Arc<InMemoryLeaseStore>,
}

impl Cluster {
    /// Must be called inside a paused runtime; the clock starts at [`epoch`].
    pub fn new() -> Self {
        let clock: SharedClock = Arc::new(TokioClock::new(epoch()));
        let store = Arc::new(InMemoryLeaseStore::new(Arc::clone(&clock)));
        Self { clock, store }
    }

    pub fn manager(&self, options: LeaseOptions) -> LeaseManager {
        LeaseManager::new(self.store.clone(), options)
    }

    pub fn scheduler(&self) -> JobScheduler {
        JobScheduler::new(
            Arc::clone(&self.clock),
            Some(self.manager(LeaseOptions::default())),
        )
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// One recorded execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub instance: &'static str,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

#[derive(Clone, Default)]
pub struct Journal {
    runs: Arc<Mutex<Vec<Run>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Journal {
    fn begin(&self, instance: &'static str, started: DateTime<Utc>) -> usize {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let mut runs = self.runs.lock().unwrap();
        runs.push(Run {
            instance,
            started,
            finished: None,
            cancelled: false,
        });
        runs.len() - 1
    }

    fn end(&self, index: usize, finished: DateTime<Utc>, cancelled: bool) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let mut runs = self.runs.lock().unwrap();
        runs[index].finished = Some(finished);
        runs[index].cancelled = cancelled;
    }

    pub fn runs(&self) -> Vec<Run> {
        self.runs.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn starts(&self) -> Vec<DateTime<Utc>> {
        self.runs().into_iter().map(|run| run.started).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// How a [`ScriptedJob`] behaves once started.
#[derive(Clone)]
pub enum Script {
    /// Sleeps for `durations[run % len]`, ignoring cancellation.
    Sleep(Vec<Duration>),
    /// Sleeps for the duration but gives up as soon as cancellation fires.
    Cooperative(Duration),
    /// Blocks until `release` is notified or cancellation fires.
    Gate(Arc<Notify>),
}

pub struct ScriptedJob {
    pub instance: &'static str,
    pub clock: SharedClock,
    pub journal: Journal,
    pub script: Script,
}

#[async_trait]
impl Job for ScriptedJob {
    async fn run(&mut self, ctx: &JobContext) -> Result<(), JobError> {
        let index = self.journal.begin(self.instance, self.clock.now());

        let cancelled = match &self.script {
            Script::Sleep(durations) => {
                let duration = durations[index % durations.len()];
                tokio::time::sleep(duration).await;
                false
            }
            Script::Cooperative(duration) => {
                tokio::select! {
                    _ = ctx.cancellation_token.cancelled() => true,
                    _ = tokio::time::sleep(*duration) => false,
                }
            }
            Script::Gate(release) => {
                tokio::select! {
                    _ = ctx.cancellation_token.cancelled() => true,
                    _ = release.notified() => false,
                }
            }
        };

        self.journal.end(index, self.clock.now(), cancelled);
        if cancelled {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Registration for a scripted job with an empty schedule.
pub fn scripted(
    name: &'static str,
    instance: &'static str,
    clock: &SharedClock,
    journal: &Journal,
    script: Script,
) -> JobRegistration {
    let clock = Arc::clone(clock);
    let journal = journal.clone();
    JobRegistration::new(name, move || ScriptedJob {
        instance,
        clock: Arc::clone(&clock),
        journal: journal.clone(),
        script: script.clone(),
    })
}

/// Lets every task that became ready at the current instant run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
