//! Hosted-service lifecycle driver.
//!
//! Services are started in order (Starting, Start, Started for each phase),
//! run until the shutdown signal resolves, then stopped in reverse order
//! (Stopping, Stop, Stopped). The stop phase receives a token that fires once
//! the graceful shutdown deadline passes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-lived component with lifecycle hooks.
#[async_trait]
pub trait HostedService: Send + Sync {
    fn name(&self) -> &str;

    async fn starting(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()>;

    async fn started(&self) -> Result<()> {
        Ok(())
    }

    async fn stopping(&self) -> Result<()> {
        Ok(())
    }

    /// `forced` fires when the graceful shutdown deadline passes.
    async fn stop(&self, forced: &CancellationToken) -> Result<()>;

    async fn stopped(&self, _forced: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSettings {
    pub shutdown_timeout: Duration,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartPhase {
    Starting,
    Start,
    Started,
}

async fn run_start_phase(service: &dyn HostedService, phase: StartPhase) -> Result<()> {
    let result = match phase {
        StartPhase::Starting => service.starting().await,
        StartPhase::Start => service.start().await,
        StartPhase::Started => service.started().await,
    };
    result.with_context(|| format!("Service {} failed at {:?}", service.name(), phase))
}

/// Runs `services` through their whole lifecycle.
///
/// Returns the first startup error (after stopping whatever was already
/// started), otherwise the first error raised while stopping.
pub async fn run_host<F>(
    services: Vec<Arc<dyn HostedService>>,
    shutdown_signal: F,
    settings: HostSettings,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    // Services whose `starting` hook ran get the stop hooks
    let mut entered = 0;
    let mut startup_error = None;

    'phases: for phase in [StartPhase::Starting, StartPhase::Start, StartPhase::Started] {
        for (index, service) in services.iter().enumerate() {
            if phase == StartPhase::Starting {
                entered = index + 1;
            }
            if let Err(e) = run_start_phase(service.as_ref(), phase).await {
                error!("{:#}", e);
                startup_error = Some(e);
                break 'phases;
            }
        }
    }

    if startup_error.is_none() {
        info!("Host started {} services", services.len());
        shutdown_signal.await;
        info!("Shutdown requested");
    }

    let stop_result = stop_services(&services[..entered], settings).await;
    match startup_error {
        Some(e) => Err(e),
        None => stop_result,
    }
}

async fn stop_services(services: &[Arc<dyn HostedService>], settings: HostSettings) -> Result<()> {
    let forced = CancellationToken::new();
    let deadline = {
        let forced = forced.clone();
        let timeout = settings.shutdown_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            warn!("Graceful shutdown deadline of {:?} passed, forcing shutdown", timeout);
            forced.cancel();
        })
    };

    let mut first_error = None;
    let mut record = |result: Result<()>, service: &dyn HostedService, hook: &str| {
        if let Err(e) = result {
            error!("Service {} failed at {}: {:#}", service.name(), hook, e);
            first_error.get_or_insert(e);
        }
    };

    for service in services.iter().rev() {
        record(service.stopping().await, service.as_ref(), "Stopping");
    }
    for service in services.iter().rev() {
        record(service.stop(&forced).await, service.as_ref(), "Stop");
    }
    for service in services.iter().rev() {
        record(service.stopped(&forced).await, service.as_ref(), "Stopped");
    }

    deadline.abort();
    info!("Host stopped");
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
