use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// A scalar option value as it appears in the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Text as it should appear on the right-hand side of a shell assignment.
    pub fn shell_literal(&self) -> String {
        match self {
            Scalar::Str(s) => format!("\"{}\"", s),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{:?}", x),
            Scalar::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestDefinition {
    id: String,
    options: BTreeMap<String, Scalar>,
    experiment: String,
}

impl TestDefinition {
    pub fn new(
        id: impl Into<String>,
        options: BTreeMap<String, Scalar>,
        experiment: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            options,
            experiment: experiment.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &BTreeMap<String, Scalar> {
        &self.options
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }
}

impl fmt::Display for TestDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] - {}", self.id, self.experiment)
    }
}

/// A leased set of hosts. The first hostname is the executor host; the rest
/// are worker hosts handed to the workload's host placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedResource {
    uuid: String,
    name: String,
    hostnames: Vec<String>,
}

impl ProvisionedResource {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, hostnames: Vec<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            hostnames,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn executor_host(&self) -> Option<&str> {
        self.hostnames.first().map(|s| s.as_str())
    }

    pub fn worker_hosts(&self) -> &[String] {
        self.hostnames.get(1..).unwrap_or(&[])
    }
}

impl fmt::Display for ProvisionedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unauthenticated,
    Authenticating,
    Requesting,
    AwaitingReady,
    Ready,
    Terminating,
    Terminated,
    Failed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Requesting => "requesting",
            Self::AwaitingReady => "awaiting_ready",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Succeeded,
    Failed,
    ExitedEarly,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::ExitedEarly => "exited_early",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RecordOutcome {
    status: TestStatus,
    finished_at: DateTime<Utc>,
    failed_step: Option<String>,
}

/// One worker's account of one test. Created when the worker starts; the
/// outcome can be set exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct TestExecutionRecord {
    test_id: String,
    executor_host: String,
    config_path: PathBuf,
    log_path: PathBuf,
    results_path: PathBuf,
    config_digest: Option<String>,
    started_at: DateTime<Utc>,
    outcome: Option<RecordOutcome>,
}

impl TestExecutionRecord {
    pub fn start(
        test_id: &str,
        executor_host: &str,
        config_path: &Path,
        log_path: &Path,
        results_path: &Path,
        config_digest: Option<String>,
    ) -> Self {
        Self {
            test_id: test_id.to_string(),
            executor_host: executor_host.to_string(),
            config_path: config_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
            results_path: results_path.to_path_buf(),
            config_digest,
            started_at: Utc::now(),
            outcome: None,
        }
    }

    pub fn finish(&mut self, status: TestStatus, failed_step: Option<&str>) -> Result<()> {
        if self.outcome.is_some() {
            return Err(anyhow!(
                "record_already_finished: test {} already has an outcome",
                self.test_id
            ));
        }
        self.outcome = Some(RecordOutcome {
            status,
            finished_at: Utc::now(),
            failed_step: failed_step.map(|s| s.to_string()),
        });
        Ok(())
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn executor_host(&self) -> &str {
        &self.executor_host
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn results_path(&self) -> &Path {
        &self.results_path
    }

    pub fn status(&self) -> Option<TestStatus> {
        self.outcome.as_ref().map(|o| o.status)
    }

    pub fn failed_step(&self) -> Option<&str> {
        self.outcome.as_ref().and_then(|o| o.failed_step.as_deref())
    }

    pub fn to_json(&self) -> Value {
        json!({
            "schema_version": "test_record_v1",
            "test_id": self.test_id,
            "executor_host": self.executor_host,
            "config_path": self.config_path.display().to_string(),
            "log_path": self.log_path.display().to_string(),
            "results_path": self.results_path.display().to_string(),
            "config_digest": self.config_digest,
            "started_at": self.started_at.to_rfc3339(),
            "status": self.status().map(|s| s.as_str()),
            "finished_at": self.outcome.as_ref().map(|o| o.finished_at.to_rfc3339()),
            "failed_step": self.failed_step(),
        })
    }
}
