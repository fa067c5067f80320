use crate::config::RunConfig;
use crate::context::OrchestratorContext;
use crate::lifecycle::Lease;
use crate::remote::{Direction, RemoteError, RemoteHost, RemoteSession, StreamEvent};
use anyhow::Result;
use bench_core::{
    atomic_write_json_pretty, ensure_dir, sha256_file, LifecycleState, TestDefinition,
    TestExecutionRecord, TestStatus,
};
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

const REMOTE_CERT_PATH: &str = ".ssh/id_rsa";
const REMOTE_REPO_DIR: &str = "repo";
const ENTRY_SCRIPT: &str = "./scripts/run.sh";
const RESULTS_ARCHIVE: &str = "results.tar.gz";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("step '{step}' failed after {attempts} attempts: {last}")]
    TestFailed {
        step: &'static str,
        attempts: u32,
        last: String,
    },
    #[error("stopped during step '{step}'")]
    ExitedEarly { step: &'static str },
}

impl WorkerError {
    pub fn step(&self) -> &'static str {
        match self {
            Self::TestFailed { step, .. } | Self::ExitedEarly { step } => *step,
        }
    }

    pub fn status(&self) -> TestStatus {
        match self {
            Self::TestFailed { .. } => TestStatus::Failed,
            Self::ExitedEarly { .. } => TestStatus::ExitedEarly,
        }
    }
}

/// Output directories of a run: `working/`, `logs/` and `results/` under one
/// root.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prepare(&self) -> Result<()> {
        for dir in ["working", "logs", "results"] {
            ensure_dir(&self.root.join(dir))?;
        }
        Ok(())
    }

    pub fn paths(&self, test_id: &str) -> TestPaths {
        let working_dir = self.root.join("working").join(test_id);
        TestPaths {
            config_path: working_dir.join("config.sh"),
            record_path: working_dir.join("record.json"),
            working_dir,
            log_path: self.root.join("logs").join(format!("{}.log", test_id)),
            results_path: self.root.join("results").join(format!("{}.tar.gz", test_id)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestPaths {
    pub working_dir: PathBuf,
    pub config_path: PathBuf,
    pub record_path: PathBuf,
    pub log_path: PathBuf,
    pub results_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub repo: String,
    pub experiments_path: String,
    pub remote_config: String,
    pub cert_path: PathBuf,
    pub retry_delay: Duration,
    pub transfer_retries: u32,
    pub terminal_retries: u32,
    pub sequence_retries: u32,
    pub results_retries: u32,
    pub command_timeout: Duration,
    pub script_timeout: Duration,
    pub interrupt_script_on_timeout: bool,
}

impl WorkerSettings {
    pub fn from_config(config: &RunConfig, cert_path: PathBuf) -> Self {
        Self {
            repo: config.repo.clone().unwrap_or_default(),
            experiments_path: config.experiments_path.clone(),
            remote_config: config.remote_config.clone(),
            cert_path,
            retry_delay: config.retry_delay(),
            transfer_retries: config.transfer_retries,
            terminal_retries: config.terminal_retries,
            sequence_retries: config.sequence_retries,
            results_retries: config.results_retries,
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            script_timeout: Duration::from_secs(config.script_timeout_secs),
            interrupt_script_on_timeout: config.interrupt_script_on_timeout,
        }
    }

    fn remote_experiment_dir(&self, experiment: &str) -> String {
        let sub = self.experiments_path.trim_matches('/');
        if sub.is_empty() || sub == "." {
            format!("{}/{}", REMOTE_REPO_DIR, experiment)
        } else {
            format!("{}/{}/{}", REMOTE_REPO_DIR, sub, experiment)
        }
    }
}

/// Private per-test log. Operator-facing messages also go to tracing.
struct WorkerLog {
    test_id: String,
    file: Option<File>,
}

impl WorkerLog {
    fn open(path: &Path, test_id: &str) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| warn!(test = test_id, path = %path.display(), "cannot open test log: {}", e))
            .ok();
        Self {
            test_id: test_id.to_string(),
            file,
        }
    }

    fn write(&mut self, level: &str, message: &str) {
        if let Some(file) = self.file.as_mut() {
            let _ = writeln!(
                file,
                "[{} {}] [{}] {}",
                level,
                Local::now().format("%H:%M:%S"),
                self.test_id,
                message
            );
        }
    }

    fn info(&mut self, message: &str) {
        info!(test = %self.test_id, "{}", message);
        self.write("INFO", message);
    }

    fn warn(&mut self, message: &str) {
        warn!(test = %self.test_id, "{}", message);
        self.write("WARNING", message);
    }

    fn error(&mut self, message: &str) {
        error!(test = %self.test_id, "{}", message);
        self.write("ERROR", message);
    }

    fn output(&mut self, line: &str) {
        self.write("OUTPUT", line);
    }
}

/// One failed attempt at a step. A closed session cannot recover by running
/// the same commands again, so it is not retried.
#[derive(Debug)]
struct StepFailure {
    message: String,
    retryable: bool,
}

impl From<String> for StepFailure {
    fn from(message: String) -> Self {
        Self {
            message,
            retryable: true,
        }
    }
}

impl From<RemoteError> for StepFailure {
    fn from(err: RemoteError) -> Self {
        Self {
            retryable: !matches!(err, RemoteError::SessionClosed { .. }),
            message: err.to_string(),
        }
    }
}

/// Runs `op` up to `retries` times, sleeping `delay` between attempts. A stop
/// observed during the sleep ends the step early.
fn with_retries<T>(
    log: &mut WorkerLog,
    ctx: &OrchestratorContext,
    delay: Duration,
    step: &'static str,
    retries: u32,
    mut op: impl FnMut() -> std::result::Result<T, StepFailure>,
) -> std::result::Result<T, WorkerError> {
    let attempts = retries.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(failure) => {
                log.warn(&format!(
                    "{} failed (attempt {}/{}): {}",
                    step, attempt, attempts, failure.message
                ));
                if !failure.retryable {
                    return Err(WorkerError::TestFailed {
                        step,
                        attempts: attempt,
                        last: failure.message,
                    });
                }
                last = failure.message;
            }
        }
        if attempt < attempts && !ctx.wait(delay) {
            log.warn(&format!("stop requested while retrying {}", step));
            return Err(WorkerError::ExitedEarly { step });
        }
    }
    Err(WorkerError::TestFailed {
        step,
        attempts,
        last,
    })
}

/// Drives one test on one leased resource: setup, execute, collect results,
/// then release the lease no matter how the earlier phases ended.
pub struct ExecutionWorker {
    test: TestDefinition,
    lease: Lease,
    ctx: Arc<OrchestratorContext>,
    remote: Arc<dyn RemoteHost>,
    settings: Arc<WorkerSettings>,
    paths: TestPaths,
    log: WorkerLog,
}

impl ExecutionWorker {
    pub fn new(
        test: TestDefinition,
        lease: Lease,
        ctx: Arc<OrchestratorContext>,
        remote: Arc<dyn RemoteHost>,
        settings: Arc<WorkerSettings>,
        paths: TestPaths,
    ) -> Self {
        let log = WorkerLog::open(&paths.log_path, test.id());
        Self {
            test,
            lease,
            ctx,
            remote,
            settings,
            paths,
            log,
        }
    }

    fn executor_host(&self) -> String {
        self.lease
            .resource()
            .executor_host()
            .unwrap_or_default()
            .to_string()
    }

    fn check_stop(&mut self, step: &'static str) -> std::result::Result<(), WorkerError> {
        if self.ctx.is_stopping() {
            self.log.warn(&format!("stop requested before {}", step));
            return Err(WorkerError::ExitedEarly { step });
        }
        Ok(())
    }

    fn setup(&mut self) -> std::result::Result<(), WorkerError> {
        self.check_stop("setup")?;
        let host = self.executor_host();
        let settings = Arc::clone(&self.settings);
        let remote = Arc::clone(&self.remote);
        let delay = settings.retry_delay;

        self.log.info(&format!("transferring certificate to {}", host));
        with_retries(&mut self.log, &self.ctx, delay, "transfer", settings.transfer_retries, || {
            remote
                .copy(&host, Direction::ToRemote, &settings.cert_path, REMOTE_CERT_PATH)
                .map_err(StepFailure::from)
        })?;

        self.log.info(&format!("transferring config to {}", host));
        let config_path = self.paths.config_path.clone();
        with_retries(&mut self.log, &self.ctx, delay, "transfer", settings.transfer_retries, || {
            remote
                .copy(&host, Direction::ToRemote, &config_path, &settings.remote_config)
                .map_err(StepFailure::from)
        })?;
        Ok(())
    }

    fn run_sequence(
        &mut self,
        session: &mut dyn RemoteSession,
        step: &'static str,
        commands: Vec<String>,
        retries: u32,
    ) -> std::result::Result<(), WorkerError> {
        let timeout = self.settings.command_timeout;
        with_retries(&mut self.log, &self.ctx, self.settings.retry_delay, step, retries, || {
            let out = session.run(&commands, timeout)?;
            if out.exit_code == 0 {
                return Ok(());
            }
            let tail = out.output.lines().last().unwrap_or("").to_string();
            Err(StepFailure::from(format!(
                "`{}` exited with {}: {}",
                out.failed_command.unwrap_or_default(),
                out.exit_code,
                tail
            )))
        })
    }

    fn execute(&mut self) -> std::result::Result<(), WorkerError> {
        self.check_stop("execute")?;
        let host = self.executor_host();
        let remote = Arc::clone(&self.remote);
        self.log.info(&format!("opening terminal on {}", host));
        let mut session = with_retries(
            &mut self.log,
            &self.ctx,
            self.settings.retry_delay,
            "terminal",
            self.settings.terminal_retries,
            || remote.open_session(&host).map_err(StepFailure::from),
        )?;
        let result = self.drive(session.as_mut());
        session.close();
        result
    }

    fn drive(&mut self, session: &mut dyn RemoteSession) -> std::result::Result<(), WorkerError> {
        let settings = Arc::clone(&self.settings);
        let experiment_dir = settings.remote_experiment_dir(self.test.experiment());

        self.log.info("cloning repository");
        self.run_sequence(
            session,
            "clone",
            vec![
                format!("sudo rm -rf {}", REMOTE_REPO_DIR),
                format!("git clone \"{}\" {}", settings.repo, REMOTE_REPO_DIR),
            ],
            settings.sequence_retries,
        )?;

        self.log.info("placing config");
        self.run_sequence(
            session,
            "config",
            vec![format!(
                "mv {} {}/conf/{}",
                settings.remote_config, experiment_dir, settings.remote_config
            )],
            settings.sequence_retries,
        )?;

        self.run_sequence(session, "cd", vec![format!("cd {}", experiment_dir)], 1)?;

        self.check_stop("run")?;
        self.log.info(&format!("running {}", ENTRY_SCRIPT));
        let script_timeout = settings.script_timeout;
        let log = &mut self.log;
        let exit = session
            .stream(
                ENTRY_SCRIPT,
                script_timeout,
                settings.interrupt_script_on_timeout,
                &mut |event| match event {
                    StreamEvent::Line(line) => log.output(line),
                    StreamEvent::Idle { interrupted } => log.warn(&format!(
                        "no output for {}s{}",
                        script_timeout.as_secs(),
                        if interrupted { "; sent interrupt" } else { "" }
                    )),
                },
            )
            .map_err(|e| WorkerError::TestFailed {
                step: "run",
                attempts: 1,
                last: e.to_string(),
            })?;
        if exit == 0 {
            self.log.info("workload finished");
        } else {
            self.log
                .warn(&format!("{} exited with status {}", ENTRY_SCRIPT, exit));
        }
        Ok(())
    }

    fn collect_results(&mut self) -> std::result::Result<(), WorkerError> {
        let host = self.executor_host();
        let remote = Arc::clone(&self.remote);
        let remote_path = format!(
            "{}/{}",
            self.settings.remote_experiment_dir(self.test.experiment()),
            RESULTS_ARCHIVE
        );
        let local = self.paths.results_path.clone();
        self.log.info(&format!("copying results to {}", local.display()));
        with_retries(
            &mut self.log,
            &self.ctx,
            self.settings.retry_delay,
            "results",
            self.settings.results_retries,
            || {
                remote
                    .copy(&host, Direction::FromRemote, &local, &remote_path)
                    .map_err(StepFailure::from)
            },
        )
    }

    fn phases(&mut self) -> std::result::Result<(), WorkerError> {
        self.setup()?;
        self.execute()?;
        self.collect_results()
    }

    pub fn run(mut self) -> TestExecutionRecord {
        let host = self.executor_host();
        let digest = sha256_file(&self.paths.config_path).ok();
        let mut record = TestExecutionRecord::start(
            self.test.id(),
            &host,
            &self.paths.config_path,
            &self.paths.log_path,
            &self.paths.results_path,
            digest,
        );
        self.log.info(&format!(
            "starting {} on {} ({})",
            self.test,
            host,
            self.lease.resource()
        ));

        let outcome = self.phases();

        let ExecutionWorker {
            lease, mut log, paths, ..
        } = self;
        let released = lease.release();
        if released != LifecycleState::Terminated {
            log.error(&format!("resource release ended in state {}", released));
        }

        let finished = match &outcome {
            Ok(()) => {
                log.info("test succeeded");
                record.finish(TestStatus::Succeeded, None)
            }
            Err(err) => {
                log.error(&err.to_string());
                record.finish(err.status(), Some(err.step()))
            }
        };
        if let Err(err) = finished {
            log.error(&err.to_string());
        }
        if let Err(err) = atomic_write_json_pretty(&paths.record_path, &record.to_json()) {
            log.error(&format!("could not write {}: {}", paths.record_path.display(), err));
        }
        record
    }
}
