use crate::context::OrchestratorContext;
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::remote::RemoteHost;
use crate::render::render_config;
use crate::worker::{ExecutionWorker, RunLayout, WorkerSettings};
use bench_core::{atomic_write_bytes, TestDefinition, TestExecutionRecord, TestStatus};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedTest {
    pub test_id: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct RunSummary {
    pub records: Vec<TestExecutionRecord>,
    pub skipped: Vec<SkippedTest>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn count(&self, status: TestStatus) -> usize {
        self.records
            .iter()
            .filter(|r| r.status() == Some(status))
            .count()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "cancelled": self.cancelled,
            "succeeded": self.count(TestStatus::Succeeded),
            "failed": self.count(TestStatus::Failed),
            "exited_early": self.count(TestStatus::ExitedEarly),
            "records": self.records.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
            "skipped": self.skipped.iter().map(|s| json!({
                "test_id": s.test_id,
                "reason": s.reason,
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Local directory holding one subdirectory per experiment.
    pub experiments_dir: PathBuf,
    pub provision_retries: u32,
}

/// Frees the test's slot in the context when the worker is done with it.
struct SlotGuard {
    ctx: Arc<OrchestratorContext>,
    test_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.ctx.vacate(&self.test_id);
    }
}

enum Admission {
    Dispatched(JoinHandle<TestExecutionRecord>),
    Skipped(String),
    Stopped,
}

pub struct Scheduler {
    queue: VecDeque<TestDefinition>,
    phase: RunPhase,
    lifecycle: Arc<Lifecycle>,
    remote: Arc<dyn RemoteHost>,
    ctx: Arc<OrchestratorContext>,
    worker_settings: Arc<WorkerSettings>,
    settings: SchedulerSettings,
    layout: RunLayout,
}

impl Scheduler {
    pub fn new(
        tests: Vec<TestDefinition>,
        lifecycle: Arc<Lifecycle>,
        remote: Arc<dyn RemoteHost>,
        ctx: Arc<OrchestratorContext>,
        worker_settings: Arc<WorkerSettings>,
        settings: SchedulerSettings,
        layout: RunLayout,
    ) -> Self {
        Self {
            queue: tests.into(),
            phase: RunPhase::Idle,
            lifecycle,
            remote,
            ctx,
            worker_settings,
            settings,
            layout,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn set_phase(&mut self, phase: RunPhase) {
        if self.phase != phase {
            info!(from = ?self.phase, to = ?phase, queued = self.queue.len(), "scheduler phase");
            self.phase = phase;
        }
    }

    /// Prepares and dispatches one test that already holds a slot.
    fn admit(&self, test: TestDefinition, slot: SlotGuard) -> Admission {
        let template_path = self
            .settings
            .experiments_dir
            .join(test.experiment())
            .join("conf")
            .join(&self.worker_settings.remote_config);
        let template = match fs::read_to_string(&template_path) {
            Ok(text) => text,
            Err(e) => {
                return Admission::Skipped(format!(
                    "config_error: template {} unreadable: {}",
                    template_path.display(),
                    e
                ));
            }
        };

        let lease = match self
            .lifecycle
            .acquire(Some(test.id()), self.settings.provision_retries)
        {
            Ok(lease) => lease,
            Err(LifecycleError::Cancelled) => return Admission::Stopped,
            Err(err) => return Admission::Skipped(err.to_string()),
        };

        let rendered = render_config(&template, lease.resource().worker_hosts(), test.options());
        if !rendered.unassigned_placeholders.is_empty() {
            warn!(test = test.id(), placeholders = ?rendered.unassigned_placeholders, "more host placeholders than worker hosts");
        }
        if !rendered.unused_hosts.is_empty() {
            warn!(test = test.id(), hosts = ?rendered.unused_hosts, "worker hosts left unassigned");
        }
        let paths = self.layout.paths(test.id());
        if let Err(e) = atomic_write_bytes(&paths.config_path, rendered.text.as_bytes()) {
            lease.release();
            return Admission::Skipped(format!(
                "config_error: could not write {}: {}",
                paths.config_path.display(),
                e
            ));
        }

        let worker = ExecutionWorker::new(
            test.clone(),
            lease,
            Arc::clone(&self.ctx),
            Arc::clone(&self.remote),
            Arc::clone(&self.worker_settings),
            paths,
        );
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", test.id()))
            .spawn(move || {
                let _slot = slot;
                worker.run()
            });
        match spawned {
            Ok(handle) => Admission::Dispatched(handle),
            // The closure is dropped here, which releases the lease and the slot.
            Err(e) => Admission::Skipped(format!("could not start worker thread: {}", e)),
        }
    }

    /// Admits tests in queue order until the queue is empty or a stop is
    /// requested, then waits for every dispatched worker.
    pub fn run(mut self) -> RunSummary {
        self.set_phase(RunPhase::Running);
        let mut workers: Vec<(String, JoinHandle<TestExecutionRecord>)> = Vec::new();
        let mut skipped = Vec::new();

        while let Some(test) = self.queue.pop_front() {
            if !self.ctx.admit(test.id()) {
                self.queue.push_front(test);
                break;
            }
            let slot = SlotGuard {
                ctx: Arc::clone(&self.ctx),
                test_id: test.id().to_string(),
            };
            let test_id = test.id().to_string();
            info!(test = %test_id, experiment = test.experiment(), queued = self.queue.len(), "admitting test");
            match self.admit(test.clone(), slot) {
                Admission::Dispatched(handle) => workers.push((test_id, handle)),
                Admission::Skipped(reason) => {
                    error!(test = %test_id, "skipping test: {}", reason);
                    skipped.push(SkippedTest { test_id, reason });
                }
                Admission::Stopped => {
                    self.queue.push_front(test);
                    break;
                }
            }
        }

        if !self.queue.is_empty() || self.ctx.is_stopping() {
            self.set_phase(RunPhase::Draining);
        }
        for test in self.queue.drain(..) {
            skipped.push(SkippedTest {
                test_id: test.id().to_string(),
                reason: "not started: run stopped".to_string(),
            });
        }

        let mut records = Vec::with_capacity(workers.len());
        for (test_id, handle) in workers {
            match handle.join() {
                Ok(record) => records.push(record),
                Err(_) => {
                    error!(test = %test_id, "worker thread panicked");
                    skipped.push(SkippedTest {
                        test_id,
                        reason: "worker thread panicked".to_string(),
                    });
                }
            }
        }
        for handle in self.lifecycle.outstanding() {
            self.lifecycle.release_handle(handle, 1);
        }
        self.set_phase(RunPhase::Stopped);

        RunSummary {
            records,
            skipped,
            cancelled: self.ctx.is_stopping(),
        }
    }
}
