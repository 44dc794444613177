//! Service Configuration
//!
//! Settings shared by the coordinator and the backend adapters, loaded
//! from a YAML file. Every field has a default, so an absent file or a
//! partial one is fine.
//!
//! # Example
//!
//! ```yaml
//! data_dir: /var/lib/portability
//! adapter_timeout_secs: 20
//! single_node:
//!   timeout_minutes: 120
//!   engine_command: ["java", "-jar", "cromwell.jar", "run", "{workflow}", "--inputs", "{inputs}"]
//! job_graph:
//!   api_url: https://api.dnanexus.com
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{PortabilityError, Result};

/// Default location of the file-backed stores.
pub const DEFAULT_DATA_DIR: &str = ".portability";

/// Top-level service configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root directory of the file-backed registry, tables and objects
    pub data_dir: PathBuf,

    /// Upper bound for any single adapter call
    pub adapter_timeout_secs: u64,

    pub single_node: SingleNodeConfig,

    pub job_graph: JobGraphConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            adapter_timeout_secs: 30,
            single_node: SingleNodeConfig::default(),
            job_graph: JobGraphConfig::default(),
        }
    }
}

/// Settings for runs on a dedicated, self-terminating instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SingleNodeConfig {
    pub instance_type: String,

    pub volume_size_gb: u32,

    /// Wall-clock bound after which the instance terminates itself
    pub timeout_minutes: u64,

    /// Extra time allowed for the exit handler to record the outcome
    pub grace_secs: u64,

    /// Engine argv; `{workflow}` and `{inputs}` are substituted
    pub engine_command: Vec<String>,

    /// Engine's per-task execution directories, relative to the work dir
    pub executions_dir: String,

    /// Where instances lay out their per-run work directories
    pub work_root: PathBuf,
}

impl Default for SingleNodeConfig {
    fn default() -> Self {
        Self {
            instance_type: "t2.medium".to_string(),
            volume_size_gb: 100,
            timeout_minutes: 90,
            grace_secs: 300,
            engine_command: [
                "java",
                "-jar",
                "cromwell.jar",
                "run",
                "{workflow}",
                "--inputs",
                "{inputs}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            executions_dir: "cromwell-executions".to_string(),
            work_root: std::env::temp_dir().join("portability-runs"),
        }
    }
}

impl SingleNodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Settings for the remote job-graph platform.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct JobGraphConfig {
    pub api_url: String,

    pub localizer_applet_version: String,

    pub runner_applet_version: String,

    /// Concurrent job log downloads; 0 sizes it from the CPU count
    pub log_fetch_concurrency: usize,
}

impl Default for JobGraphConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.dnanexus.com".to_string(),
            localizer_applet_version: "0.1.4".to_string(),
            runner_applet_version: "0.0.17".to_string(),
            log_fetch_concurrency: 8,
        }
    }
}

impl JobGraphConfig {
    /// Number of job logs fetched at once.
    pub fn log_concurrency(&self) -> usize {
        if self.log_fetch_concurrency == 0 {
            num_cpus::get().max(1)
        } else {
            self.log_fetch_concurrency
        }
    }
}

impl ServiceConfig {
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    /// Checks values that would make the service misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.adapter_timeout_secs == 0 {
            return Err(PortabilityError::Invalid(
                "adapter_timeout_secs must be positive".to_string(),
            ));
        }
        if self.single_node.timeout_minutes == 0 {
            return Err(PortabilityError::Invalid(
                "single_node.timeout_minutes must be positive".to_string(),
            ));
        }
        if self.single_node.engine_command.is_empty() {
            return Err(PortabilityError::Invalid(
                "single_node.engine_command must name a program".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from a YAML file.
///
/// A missing file yields the defaults; a file that exists but does not
/// parse or validate is an error.
pub fn load_config(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let path = path.as_ref();

    if !path.exists() {
        debug!("No config at {}, using defaults", path.display());
        return Ok(ServiceConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config: ServiceConfig = if content.trim().is_empty() {
        ServiceConfig::default()
    } else {
        serde_yaml::from_str(&content)?
    };
    config.validate()?;

    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.adapter_timeout(), Duration::from_secs(30));
        assert_eq!(config.single_node.timeout(), Duration::from_secs(90 * 60));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = load_config("/nonexistent/portability.yaml").unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "adapter_timeout_secs: 5\nsingle_node:\n  timeout_minutes: 10\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.adapter_timeout_secs, 5);
        assert_eq!(config.single_node.timeout_minutes, 10);
        assert_eq!(config.single_node.grace_secs, 300);
        assert_eq!(config.job_graph, JobGraphConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "adapter_timeout_secs: 0\n").unwrap();
        assert!(load_config(&path).is_err());

        fs::write(&path, "single_node:\n  engine_command: []\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_malformed_yaml_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "adapter_timeout_secs: [not a number").unwrap();

        let err = load_config(&path).unwrap_err();
        assert_eq!(err.kind(), "SUBMISSION_ERROR");
    }

    #[test]
    fn test_log_concurrency_from_cpus() {
        let mut config = JobGraphConfig::default();
        assert_eq!(config.log_concurrency(), 8);
        config.log_fetch_concurrency = 0;
        assert!(config.log_concurrency() >= 1);
    }
}
