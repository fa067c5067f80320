use anyhow::{anyhow, Result};
use bench_core::{Scalar, TestDefinition};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PASSWORD_ENV: &str = "BENCH_TESTBED_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
pub struct TestSet {
    pub id: String,
    pub experiment: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub options: BTreeMap<String, Scalar>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_secs: u64,
    #[serde(default = "default_backoff_capacity_base")]
    pub capacity_base_secs: u64,
    #[serde(default = "default_backoff_step")]
    pub step: f64,
    #[serde(default = "default_backoff_max")]
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base(),
            capacity_base_secs: default_backoff_capacity_base(),
            step: default_backoff_step(),
            max_secs: default_backoff_max(),
        }
    }
}

/// Declarative run configuration, loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub tests: Vec<TestSet>,
    #[serde(default)]
    pub options: BTreeMap<String, Scalar>,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_experiments_path")]
    pub experiments_path: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub ssh_cert: Option<String>,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default)]
    pub password_path: Option<PathBuf>,
    #[serde(default)]
    pub headless: Option<bool>,
    #[serde(default)]
    pub testbed_url: Option<String>,
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: u32,
    #[serde(default = "default_remote_config")]
    pub remote_config: String,
    #[serde(default = "default_provision_retries")]
    pub provision_retries: u32,
    #[serde(default = "default_terminate_retries")]
    pub terminate_retries: u32,
    #[serde(default = "default_transfer_retries")]
    pub transfer_retries: u32,
    #[serde(default = "default_terminal_retries")]
    pub terminal_retries: u32,
    #[serde(default = "default_sequence_retries")]
    pub sequence_retries: u32,
    #[serde(default = "default_results_retries")]
    pub results_retries: u32,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
    #[serde(default)]
    pub interrupt_script_on_timeout: bool,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Values supplied on the command line. They only fill keys the file leaves
/// unset.
#[derive(Debug, Clone, Default)]
pub struct CliDefaults {
    pub ssh_cert: Option<String>,
    pub max_concurrency: Option<usize>,
    pub password_path: Option<PathBuf>,
    pub headless: Option<bool>,
}

fn default_replicas() -> u32 {
    1
}
fn default_experiments_path() -> String {
    ".".to_string()
}
fn default_retry_delay() -> u64 {
    120
}
fn default_duration_minutes() -> u32 {
    300
}
fn default_remote_config() -> String {
    "config.sh".to_string()
}
fn default_provision_retries() -> u32 {
    5
}
fn default_terminate_retries() -> u32 {
    5
}
fn default_transfer_retries() -> u32 {
    10
}
fn default_terminal_retries() -> u32 {
    10
}
fn default_sequence_retries() -> u32 {
    10
}
fn default_results_retries() -> u32 {
    5
}
fn default_command_timeout() -> u64 {
    30
}
fn default_script_timeout() -> u64 {
    120
}
fn default_ready_timeout() -> u64 {
    1800
}
fn default_backoff_base() -> u64 {
    60
}
fn default_backoff_capacity_base() -> u64 {
    300
}
fn default_backoff_step() -> f64 {
    0.5
}
fn default_backoff_max() -> u64 {
    1800
}

impl RunConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| anyhow!("config_error: invalid run config: {}", e))
    }

    pub fn apply_cli_defaults(&mut self, cli: CliDefaults) {
        if self.ssh_cert.is_none() {
            self.ssh_cert = cli.ssh_cert;
        }
        if self.max_concurrency.is_none() {
            self.max_concurrency = cli.max_concurrency;
        }
        if self.password_path.is_none() {
            self.password_path = cli.password_path;
        }
        if self.headless.is_none() {
            self.headless = cli.headless;
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(1)
    }

    pub fn ssh_cert(&self) -> &str {
        self.ssh_cert.as_deref().unwrap_or("id_rsa")
    }

    /// Account used on provisioned hosts; the testbed account name.
    pub fn remote_user(&self) -> &str {
        self.username.as_deref().unwrap_or("root")
    }

    pub fn headless(&self) -> bool {
        self.headless.unwrap_or(false)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn experiments_dir(&self, repo_path: &Path) -> PathBuf {
        repo_path.join(&self.experiments_path)
    }

    /// Checks everything that can be checked before contacting the testbed.
    pub fn validate(&self, repo_path: &Path) -> Result<()> {
        let mut missing = Vec::new();
        if self.tests.is_empty() {
            missing.push("tests");
        }
        if self.repo.is_none() {
            missing.push("repo");
        }
        if self.username.is_none() {
            missing.push("username");
        }
        if self.profile.is_none() {
            missing.push("profile");
        }
        if !missing.is_empty() {
            return Err(anyhow!(
                "config_error: missing required keys: {}",
                missing.join(", ")
            ));
        }
        let mut ids = BTreeSet::new();
        for set in &self.tests {
            if !ids.insert(set.id.as_str()) {
                return Err(anyhow!("config_error: duplicate test set id '{}'", set.id));
            }
        }
        if self.max_concurrency() == 0 {
            return Err(anyhow!("config_error: max_concurrency must be at least 1"));
        }
        if !self.backoff.step.is_finite() || self.backoff.step < 0.0 {
            return Err(anyhow!(
                "config_error: backoff.step must be a finite non-negative number"
            ));
        }
        let experiments_dir = self.experiments_dir(repo_path);
        if !experiments_dir.exists() {
            return Err(anyhow!(
                "config_error: experiment directory {} not found",
                experiments_dir.display()
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<RunConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("config_error: could not read {}: {}", path.display(), e))?;
    RunConfig::from_yaml_str(&raw)
}

/// Expands every test set into its remaining replicas. Set-level options win
/// over global options.
pub fn flatten_tests(config: &RunConfig) -> Vec<TestDefinition> {
    let mut flattened = Vec::new();
    for set in &config.tests {
        let mut options = config.options.clone();
        for (key, value) in &set.options {
            options.insert(key.clone(), value.clone());
        }
        for replica in set.completed..set.replicas {
            flattened.push(TestDefinition::new(
                format!("{}-{}", set.id, replica),
                options.clone(),
                set.experiment.clone(),
            ));
        }
    }
    flattened
}

pub fn load_password(config: &RunConfig) -> Result<String> {
    if let Some(path) = config.password_path.as_ref() {
        let raw = fs::read_to_string(path).map_err(|e| {
            anyhow!(
                "config_error: could not load testbed password file at {}: {}",
                path.display(),
                e
            )
        })?;
        return Ok(raw.trim().to_string());
    }
    if let Ok(value) = std::env::var(PASSWORD_ENV) {
        return Ok(value);
    }
    let mut line = String::new();
    eprintln!(
        "Testbed password for {}: ",
        config.username.as_deref().unwrap_or("user")
    );
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
