mod file_config;

pub use file_config::{FileConfig, JobsConfig, LeaseConfig, SchedulerConfig};

use crate::lease::{LeaseOptions, RENEW_FRACTION_RANGE};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub instance_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub metrics_port: u16,
    pub instance_name: String,

    // Feature configs (with defaults)
    pub scheduler: SchedulerSettings,
    pub lease: LeaseSettings,
    pub jobs: JobsSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        // Validate db_dir exists
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let instance_name = file
            .instance_name
            .or_else(|| cli.instance_name.clone())
            .unwrap_or_else(|| format!("registry-scheduler-{}", std::process::id()));

        let defaults = SchedulerSettings::default();
        let scheduler_file = file.scheduler.unwrap_or_default();
        let scheduler = SchedulerSettings {
            min_interval: scheduler_file
                .min_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.min_interval),
            shutdown_timeout: scheduler_file
                .shutdown_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        };
        if scheduler.min_interval.is_zero() {
            bail!("scheduler.min_interval_secs must be positive");
        }

        let defaults = LeaseSettings::default();
        let lease_file = file.lease.unwrap_or_default();
        let lease = LeaseSettings {
            duration: lease_file
                .duration_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.duration),
            renew_fraction: lease_file.renew_fraction.unwrap_or(defaults.renew_fraction),
        };
        if lease.duration.is_zero() {
            bail!("lease.duration_secs must be positive");
        }
        if !RENEW_FRACTION_RANGE.contains(&lease.renew_fraction) {
            bail!(
                "lease.renew_fraction must be within {:?}, got {}",
                RENEW_FRACTION_RANGE,
                lease.renew_fraction
            );
        }

        let defaults = JobsSettings::default();
        let jobs_file = file.jobs.unwrap_or_default();
        let jobs = JobsSettings {
            lease_prune_interval: jobs_file
                .lease_prune_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_prune_interval),
            lease_retention: jobs_file
                .lease_retention_hours
                .map(|hours| Duration::from_secs(hours * 60 * 60))
                .unwrap_or(defaults.lease_retention),
        };
        if jobs.lease_prune_interval < scheduler.min_interval {
            bail!(
                "jobs.lease_prune_interval_secs ({:?}) is below scheduler.min_interval_secs ({:?})",
                jobs.lease_prune_interval,
                scheduler.min_interval
            );
        }

        Ok(Self {
            db_dir,
            metrics_port,
            instance_name,
            scheduler,
            lease,
            jobs,
        })
    }

    pub fn lease_db_path(&self) -> PathBuf {
        self.db_dir.join("leases.db")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub min_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseSettings {
    pub duration: Duration,
    pub renew_fraction: f64,
}

impl LeaseSettings {
    pub fn options(&self) -> LeaseOptions {
        LeaseOptions::new(self.duration, self.renew_fraction)
    }
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            renew_fraction: 1.0 / 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobsSettings {
    pub lease_prune_interval: Duration,
    pub lease_retention: Duration,
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self {
            lease_prune_interval: Duration::from_secs(60 * 60),
            lease_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    fn make_cli(temp_dir: &TempDir) -> CliConfig {
        CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            metrics_port: 9091,
            instance_name: Some("node-a".to_string()),
        }
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let config = AppConfig::resolve(&make_cli(&temp_dir), None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.instance_name, "node-a");
        assert_eq!(config.scheduler, SchedulerSettings::default());
        assert_eq!(config.lease, LeaseSettings::default());
        assert_eq!(config.jobs, JobsSettings::default());
        assert_eq!(config.lease_db_path(), temp_dir.path().join("leases.db"));
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            metrics_port: 9091,
            instance_name: Some("cli-name".to_string()),
        };
        let toml_str = format!(
            r#"
            db_dir = "{}"
            metrics_port = 9999
            instance_name = "toml-name"

            [scheduler]
            min_interval_secs = 5
            shutdown_timeout_secs = 12

            [lease]
            duration_secs = 90
            renew_fraction = 0.5

            [jobs]
            lease_prune_interval_secs = 600
            lease_retention_hours = 48
            "#,
            temp_dir.path().display()
        );
        let file_config: FileConfig = toml::from_str(&toml_str).unwrap();

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.metrics_port, 9999);
        assert_eq!(config.instance_name, "toml-name");
        assert_eq!(config.scheduler.min_interval, Duration::from_secs(5));
        assert_eq!(config.scheduler.shutdown_timeout, Duration::from_secs(12));
        assert_eq!(config.lease.duration, Duration::from_secs(90));
        assert_eq!(config.lease.options().renew_every, Duration::from_secs(45));
        assert_eq!(config.jobs.lease_prune_interval, Duration::from_secs(600));
        assert_eq!(config.jobs.lease_retention, Duration::from_secs(48 * 3600));
    }

    #[test]
    fn test_resolve_partial_toml_keeps_defaults() {
        let temp_dir = make_temp_db_dir();
        let file_config: FileConfig = toml::from_str(
            r#"
            [lease]
            duration_secs = 20
            "#,
        )
        .unwrap();

        let config = AppConfig::resolve(&make_cli(&temp_dir), Some(file_config)).unwrap();
        assert_eq!(config.lease.duration, Duration::from_secs(20));
        assert_eq!(config.lease.renew_fraction, 1.0 / 3.0);
        assert_eq!(config.scheduler, SchedulerSettings::default());
    }

    #[test]
    fn test_resolve_missing_db_dir() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("db_dir"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/to/db")),
            ..CliConfig::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_rejects_invalid_values() {
        let temp_dir = make_temp_db_dir();

        for toml_str in [
            "[lease]\nrenew_fraction = 1.5",
            "[lease]\nrenew_fraction = 0.05",
            "[lease]\nrenew_fraction = 0.95",
            "[lease]\nduration_secs = 0",
            "[scheduler]\nmin_interval_secs = 0",
            "[jobs]\nlease_prune_interval_secs = 1",
        ] {
            let file_config: FileConfig = toml::from_str(toml_str).unwrap();
            assert!(
                AppConfig::resolve(&make_cli(&temp_dir), Some(file_config)).is_err(),
                "expected {:?} to be rejected",
                toml_str
            );
        }
    }

    #[test]
    fn test_renew_fraction_bounds_are_accepted() {
        let temp_dir = make_temp_db_dir();

        for fraction in [0.1, 0.9] {
            let file_config: FileConfig =
                toml::from_str(&format!("[lease]\nrenew_fraction = {}", fraction)).unwrap();
            let config = AppConfig::resolve(&make_cli(&temp_dir), Some(file_config)).unwrap();
            assert_eq!(
                config.lease.options().renew_every,
                config.lease.duration.mul_f64(fraction)
            );
        }
    }

    #[test]
    fn test_file_config_load() {
        let temp_dir = make_temp_db_dir();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "metrics_port = 9100\n").unwrap();

        let file_config = FileConfig::load(&path).unwrap();
        assert_eq!(file_config.metrics_port, Some(9100));

        std::fs::write(&path, "metrics_port = \"nope\"\n").unwrap();
        assert!(FileConfig::load(&path).is_err());
    }
}
