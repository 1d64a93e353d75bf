use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Import modules from the library crate
use registry_scheduler::background_jobs::jobs::{ExpiredLeasePruneJob, LeaseSchemaMigrationJob};
use registry_scheduler::background_jobs::{JobRegistration, JobScheduler, RunAt};
use registry_scheduler::clock::{SharedClock, SystemClock};
use registry_scheduler::config;
use registry_scheduler::host::{run_host, HostSettings, HostedService};
use registry_scheduler::lease::{LeaseManager, SqliteLeaseStore};
use registry_scheduler::server::{metrics, run_metrics_server};

/// Lease name guarding the prune job across instances.
const LEASE_PRUNE_LEASE: &str = "maintenance.expired_lease_prune";

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing the lease database (leases.db), shared by every
    /// instance on this host. Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9091)]
    pub metrics_port: u16,

    /// Name of this instance, used in logs.
    #[clap(long)]
    pub instance_name: Option<String>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            metrics_port: args.metrics_port,
            instance_name: args.instance_name.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  instance: {}", app_config.instance_name);
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  lease: {:?}", app_config.lease);
    info!("  scheduler: {:?}", app_config.scheduler);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let clock: SharedClock = Arc::new(SystemClock);
    let lease_store = Arc::new(SqliteLeaseStore::open(
        app_config.lease_db_path(),
        Arc::clone(&clock),
    )?);
    let lease_manager = LeaseManager::new(lease_store.clone(), app_config.lease.options());

    let mut scheduler = JobScheduler::new(Arc::clone(&clock), Some(lease_manager))
        .with_min_interval(app_config.scheduler.min_interval);

    // Register jobs
    let migration_store = lease_store.clone();
    scheduler.register(
        JobRegistration::new(LeaseSchemaMigrationJob::NAME, move || {
            LeaseSchemaMigrationJob::new(migration_store.clone())
        })
        .run_at(RunAt::STARTING),
    )?;

    let prune_store = lease_store.clone();
    let prune_clock = Arc::clone(&clock);
    let retention = app_config.jobs.lease_retention;
    scheduler.register(
        JobRegistration::new(ExpiredLeasePruneJob::NAME, move || {
            ExpiredLeasePruneJob::new(prune_store.clone(), prune_clock.clone(), retention)
        })
        .every(app_config.jobs.lease_prune_interval)
        .with_lease(LEASE_PRUNE_LEASE),
    )?;
    info!("Registered {} jobs", scheduler.job_count());

    let shutdown_token = CancellationToken::new();
    let metrics_server = tokio::spawn(run_metrics_server(
        app_config.metrics_port,
        shutdown_token.child_token(),
    ));

    let services: Vec<Arc<dyn HostedService>> = vec![Arc::new(scheduler)];
    let host_settings = HostSettings {
        shutdown_timeout: app_config.scheduler.shutdown_timeout,
    };
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
    };

    let result = run_host(services, shutdown_signal, host_settings).await;

    shutdown_token.cancel();
    match metrics_server.await {
        Ok(Err(e)) => error!("{:#}", e),
        Err(e) => error!("Metrics server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("{} stopped", app_config.instance_name);
    result
}
