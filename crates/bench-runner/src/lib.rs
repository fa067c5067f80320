use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub mod config;
pub mod context;
pub mod lifecycle;
pub mod remote;
pub mod render;
pub mod scheduler;
pub mod testbed;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{flatten_tests, load_config, load_password, CliDefaults, RunConfig};
pub use context::OrchestratorContext;
pub use lifecycle::{BackoffPolicy, Lease, Lifecycle, LifecycleError, LifecycleSettings};
pub use remote::{RemoteHost, SshConfig, SshRemote};
pub use render::{parse_assignments, render_config, RenderedConfig};
pub use scheduler::{RunPhase, RunSummary, Scheduler, SchedulerSettings, SkippedTest};
pub use testbed::{HttpTestbed, HttpTestbedConfig, Testbed, TestbedError};
pub use worker::{RunLayout, WorkerSettings};

/// Validates the configuration, logs in, and runs every queued test. The
/// context must be sized from `config.max_concurrency()`; the caller keeps a
/// handle to it to request a stop.
pub fn run_tests(
    config: &RunConfig,
    repo_path: &Path,
    layout: &RunLayout,
    testbed: Box<dyn Testbed>,
    remote: Arc<dyn RemoteHost>,
    ctx: Arc<OrchestratorContext>,
) -> Result<RunSummary> {
    config.validate(repo_path)?;
    layout.prepare()?;
    let tests = flatten_tests(config);
    info!(
        tests = tests.len(),
        max_concurrency = ctx.capacity(),
        out_dir = %layout.root().display(),
        "starting run"
    );

    let lifecycle = Arc::new(Lifecycle::new(
        testbed,
        LifecycleSettings {
            duration_minutes: config.duration_minutes,
            terminate_retries: config.terminate_retries,
            backoff: BackoffPolicy::from(&config.backoff),
        },
        Arc::clone(&ctx),
    ));
    lifecycle
        .authenticate()
        .map_err(|e| anyhow!("testbed_auth_failed: {}", e))?;

    let scheduler = Scheduler::new(
        tests,
        lifecycle,
        remote,
        Arc::clone(&ctx),
        Arc::new(WorkerSettings::from_config(
            config,
            PathBuf::from(config.ssh_cert()),
        )),
        SchedulerSettings {
            experiments_dir: config.experiments_dir(repo_path),
            provision_retries: config.provision_retries,
        },
        layout.clone(),
    );
    let summary = scheduler.run();
    info!(
        succeeded = summary.count(bench_core::TestStatus::Succeeded),
        failed = summary.count(bench_core::TestStatus::Failed),
        exited_early = summary.count(bench_core::TestStatus::ExitedEarly),
        skipped = summary.skipped.len(),
        cancelled = summary.cancelled,
        "run finished"
    );
    Ok(summary)
}
