//! Resource lifecycle: acquire a ready resource from the testbed, hand it out
//! as a `Lease`, and take it back.
//!
//! Every resource ever requested gets an entry in an owned table and is
//! addressed by `ResourceHandle`. Calls into the testbed are serialized by a
//! single mutex; backoff sleeps happen outside that mutex so releases from
//! other workers are never stuck behind a provisioning retry.

use crate::config::BackoffConfig;
use crate::context::OrchestratorContext;
use crate::testbed::{BackoffClass, PendingResource, Testbed, TestbedError};
use bench_core::{LifecycleState, ProvisionedResource};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("provisioning failed after {attempts} attempts: {last}")]
    ProvisioningFailed {
        attempts: u32,
        last: TestbedError,
        backoffs: Vec<Duration>,
    },
    #[error("testbed reached an unrecognized state: {0}")]
    UnknownState(String),
    #[error("cancelled before a resource was ready")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub capacity_base: Duration,
    pub step: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    /// `attempt` counts failures so far, starting at 0.
    pub fn delay_for(&self, class: BackoffClass, attempt: u32) -> Duration {
        let base = match class {
            BackoffClass::Transient => self.base,
            BackoffClass::Capacity => self.capacity_base,
        };
        let growth = if attempt == 0 {
            0.0
        } else {
            f64::from(attempt) * self.step.max(0.0)
        };
        let factor = 1.0 + growth;
        let secs = base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_secs),
            capacity_base: Duration::from_secs(config.capacity_base_secs),
            step: config.step,
            max: Duration::from_secs(config.max_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle(usize);

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Entry {
    state: LifecycleState,
    pending: Option<PendingResource>,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub duration_minutes: u32,
    pub terminate_retries: u32,
    pub backoff: BackoffPolicy,
}

pub struct Lifecycle {
    testbed: Mutex<Box<dyn Testbed>>,
    table: Mutex<Vec<Entry>>,
    settings: LifecycleSettings,
    ctx: Arc<OrchestratorContext>,
}

impl Lifecycle {
    pub fn new(
        testbed: Box<dyn Testbed>,
        settings: LifecycleSettings,
        ctx: Arc<OrchestratorContext>,
    ) -> Self {
        Self {
            testbed: Mutex::new(testbed),
            table: Mutex::new(Vec::new()),
            settings,
            ctx,
        }
    }

    fn lock_testbed(&self) -> MutexGuard<'_, Box<dyn Testbed>> {
        self.testbed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_table(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self) -> ResourceHandle {
        let mut table = self.lock_table();
        table.push(Entry {
            state: LifecycleState::Unauthenticated,
            pending: None,
        });
        ResourceHandle(table.len() - 1)
    }

    fn transition(&self, handle: ResourceHandle, to: LifecycleState) {
        let mut table = self.lock_table();
        if let Some(entry) = table.get_mut(handle.0) {
            debug!(resource = %handle, from = %entry.state, to = %to, "lifecycle transition");
            entry.state = to;
        }
    }

    pub fn state(&self, handle: ResourceHandle) -> Option<LifecycleState> {
        self.lock_table().get(handle.0).map(|e| e.state)
    }

    /// Handles whose entries are not yet terminal.
    pub fn outstanding(&self) -> Vec<ResourceHandle> {
        self.lock_table()
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.state.is_terminal())
            .map(|(i, _)| ResourceHandle(i))
            .collect()
    }

    /// Establishes the testbed session up front. Any failure here is fatal to
    /// the run.
    pub fn authenticate(&self) -> Result<(), LifecycleError> {
        let mut testbed = self.lock_testbed();
        testbed.authenticate().map_err(|err| match err {
            TestbedError::UnknownState(msg) => LifecycleError::UnknownState(msg),
            other => LifecycleError::ProvisioningFailed {
                attempts: 1,
                last: other,
                backoffs: Vec::new(),
            },
        })
    }

    /// One provisioning attempt under the testbed lock. The handle is returned
    /// on failure too so the caller can roll back whatever was created.
    fn provision_once(
        &self,
        handle: ResourceHandle,
        name: Option<&str>,
    ) -> Result<ProvisionedResource, TestbedError> {
        let mut testbed = self.lock_testbed();
        self.transition(handle, LifecycleState::Authenticating);
        testbed.authenticate()?;
        self.transition(handle, LifecycleState::Requesting);
        let pending = testbed.instantiate(name, self.settings.duration_minutes)?;
        {
            let mut table = self.lock_table();
            if let Some(entry) = table.get_mut(handle.0) {
                entry.pending = Some(pending.clone());
            }
        }
        self.transition(handle, LifecycleState::AwaitingReady);
        info!(resource = %handle, uuid = %pending.uuid, name = %pending.name, "waiting for resource");
        let hostnames = testbed.await_ready(&pending)?;
        self.transition(handle, LifecycleState::Ready);
        Ok(ProvisionedResource::new(
            pending.uuid,
            pending.name,
            hostnames,
        ))
    }

    /// Provisions a ready resource, retrying recoverable failures up to
    /// `retry_count` more times. Anything created by a failed attempt is
    /// terminated before the next one.
    pub fn acquire(
        self: &Arc<Self>,
        name: Option<&str>,
        retry_count: u32,
    ) -> Result<Lease, LifecycleError> {
        let mut backoffs = Vec::new();
        let mut attempt: u32 = 0;
        loop {
            if self.ctx.is_stopping() {
                return Err(LifecycleError::Cancelled);
            }
            attempt += 1;
            let handle = self.insert();
            let err = match self.provision_once(handle, name) {
                Ok(resource) => {
                    info!(resource = %handle, hosts = resource.hostnames().len(), attempt, "resource ready: {}", resource);
                    return Ok(Lease {
                        lifecycle: Arc::clone(self),
                        handle,
                        resource,
                        backoffs,
                        released: false,
                    });
                }
                Err(err) => err,
            };
            self.release_handle(handle, self.settings.terminate_retries);

            let class = match &err {
                TestbedError::UnknownState(msg) => {
                    error!(resource = %handle, attempt, "testbed reported an unknown state: {}", msg);
                    return Err(LifecycleError::UnknownState(msg.clone()));
                }
                other => other.backoff_class().unwrap_or(BackoffClass::Transient),
            };
            if attempt > retry_count {
                error!(attempts = attempt, "giving up on provisioning: {}", err);
                return Err(LifecycleError::ProvisioningFailed {
                    attempts: attempt,
                    last: err,
                    backoffs,
                });
            }
            let delay = self.settings.backoff.delay_for(class, attempt - 1);
            warn!(attempt, retries = retry_count, delay_secs = delay.as_secs_f64(), "provisioning failed: {}", err);
            backoffs.push(delay);
            if !self.ctx.wait(delay) {
                return Err(LifecycleError::Cancelled);
            }
        }
    }

    /// Terminates the resource behind `handle`. Never fails: after the retry
    /// budget is spent the entry is marked `Failed` and the leak is logged.
    pub fn release_handle(&self, handle: ResourceHandle, retry_count: u32) -> LifecycleState {
        let pending = {
            let mut table = self.lock_table();
            let Some(entry) = table.get_mut(handle.0) else {
                warn!(resource = %handle, "release of unknown resource handle");
                return LifecycleState::Failed;
            };
            if entry.state.is_terminal() || entry.state == LifecycleState::Terminating {
                return entry.state;
            }
            match entry.pending.clone() {
                Some(pending) => {
                    entry.state = LifecycleState::Terminating;
                    pending
                }
                None => {
                    // Nothing was created on the testbed.
                    entry.state = LifecycleState::Failed;
                    return entry.state;
                }
            }
        };

        let attempts = retry_count.max(1);
        for attempt in 1..=attempts {
            let result = self.lock_testbed().terminate(&pending);
            match result {
                Ok(()) => {
                    info!(resource = %handle, uuid = %pending.uuid, "resource terminated");
                    self.transition(handle, LifecycleState::Terminated);
                    return LifecycleState::Terminated;
                }
                Err(TestbedError::NotFound(_)) => {
                    debug!(resource = %handle, uuid = %pending.uuid, "resource already gone");
                    self.transition(handle, LifecycleState::Terminated);
                    return LifecycleState::Terminated;
                }
                Err(err) => {
                    warn!(resource = %handle, attempt, retries = attempts, "termination failed: {}", err);
                    if attempt < attempts {
                        let delay = self
                            .settings
                            .backoff
                            .delay_for(BackoffClass::Transient, attempt - 1);
                        if !self.ctx.wait_unless_forced(delay) {
                            break;
                        }
                    }
                }
            }
        }
        error!(resource = %handle, uuid = %pending.uuid, name = %pending.name, "could not terminate resource; it may need manual cleanup");
        self.transition(handle, LifecycleState::Failed);
        LifecycleState::Failed
    }
}

/// Exclusive ownership of one ready resource. Releasing consumes the lease;
/// dropping an unreleased lease releases it.
pub struct Lease {
    lifecycle: Arc<Lifecycle>,
    handle: ResourceHandle,
    resource: ProvisionedResource,
    backoffs: Vec<Duration>,
    released: bool,
}

impl Lease {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn resource(&self) -> &ProvisionedResource {
        &self.resource
    }

    /// Delays slept before this resource was obtained.
    pub fn backoffs(&self) -> &[Duration] {
        &self.backoffs
    }

    pub fn release(mut self) -> LifecycleState {
        self.released = true;
        self.lifecycle
            .release_handle(self.handle, self.lifecycle.settings.terminate_retries)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            warn!(resource = %self.handle, "lease dropped without release; releasing now");
            self.lifecycle
                .release_handle(self.handle, self.lifecycle.settings.terminate_retries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTestbed;
    use std::thread;
    use std::time::Instant;

    fn settings(step_ms: u64) -> LifecycleSettings {
        LifecycleSettings {
            duration_minutes: 60,
            terminate_retries: 3,
            backoff: BackoffPolicy {
                base: Duration::from_millis(step_ms),
                capacity_base: Duration::from_millis(step_ms * 5),
                step: 0.5,
                max: Duration::from_secs(60),
            },
        }
    }

    fn lifecycle(fake: &FakeTestbed, step_ms: u64) -> Arc<Lifecycle> {
        Arc::new(Lifecycle::new(
            fake.boxed(),
            settings(step_ms),
            Arc::new(OrchestratorContext::new(4)),
        ))
    }

    #[test]
    fn capacity_backoff_is_non_decreasing_and_capped() {
        let policy = BackoffPolicy::from(&BackoffConfig::default());
        let delays: Vec<Duration> = (0..12)
            .map(|i| policy.delay_for(BackoffClass::Capacity, i))
            .collect();
        assert_eq!(delays[0], Duration::from_secs(300));
        assert_eq!(delays[1], Duration::from_secs(450));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{:?}", delays);
        assert_eq!(*delays.last().expect("delays"), Duration::from_secs(1800));
        assert!(
            policy.delay_for(BackoffClass::Transient, 0) < policy.delay_for(BackoffClass::Capacity, 0)
        );
    }

    #[test]
    fn oversized_backoff_step_saturates_at_the_cap() {
        for step in [f64::INFINITY, 1e300, f64::NAN] {
            let policy = BackoffPolicy {
                base: Duration::from_secs(60),
                capacity_base: Duration::from_secs(300),
                step,
                max: Duration::from_secs(1800),
            };
            assert_eq!(
                policy.delay_for(BackoffClass::Capacity, 0),
                Duration::from_secs(300)
            );
            let later = policy.delay_for(BackoffClass::Capacity, u32::MAX);
            if step.is_nan() {
                assert_eq!(later, Duration::from_secs(300));
            } else {
                assert_eq!(later, Duration::from_secs(1800));
            }
        }
    }

    #[test]
    fn acquire_and_release_walk_the_states() {
        let fake = FakeTestbed::new(3);
        let lifecycle = lifecycle(&fake, 1);
        let lease = lifecycle.acquire(Some("t-0"), 2).expect("acquire");
        let handle = lease.handle();
        assert_eq!(lifecycle.state(handle), Some(LifecycleState::Ready));
        assert_eq!(lease.resource().hostnames().len(), 3);
        assert!(lease.backoffs().is_empty());

        assert_eq!(lease.release(), LifecycleState::Terminated);
        assert_eq!(lifecycle.state(handle), Some(LifecycleState::Terminated));
        assert_eq!(fake.terminate_calls(), 1);
        assert!(lifecycle.outstanding().is_empty());
    }

    #[test]
    fn releasing_a_terminated_resource_is_a_no_op() {
        let fake = FakeTestbed::new(1);
        let lifecycle = lifecycle(&fake, 1);
        let lease = lifecycle.acquire(None, 0).expect("acquire");
        let handle = lease.handle();
        lease.release();
        assert_eq!(lifecycle.release_handle(handle, 5), LifecycleState::Terminated);
        assert_eq!(lifecycle.release_handle(handle, 5), LifecycleState::Terminated);
        assert_eq!(fake.terminate_calls(), 1);
    }

    #[test]
    fn repeated_capacity_failures_back_off_and_roll_back() {
        let fake = FakeTestbed::new(2);
        for _ in 0..3 {
            fake.fail_next_ready(TestbedError::InsufficientCapacity("2 nodes".into()));
        }
        let lifecycle = lifecycle(&fake, 1);
        let lease = lifecycle.acquire(None, 5).expect("acquire after retries");
        let backoffs = lease.backoffs().to_vec();
        assert_eq!(backoffs.len(), 3);
        assert!(backoffs.windows(2).all(|w| w[0] <= w[1]), "{:?}", backoffs);
        assert_eq!(fake.instantiated(), 4);
        // Every failed attempt was rolled back; only the leased resource lives.
        assert_eq!(fake.live().len(), 1);
        lease.release();
        assert!(fake.live().is_empty());
    }

    #[test]
    fn exhausting_retries_reports_provisioning_failed() {
        let fake = FakeTestbed::new(1);
        for _ in 0..10 {
            fake.fail_next_ready(TestbedError::ReservationViolation("quota".into()));
        }
        let lifecycle = lifecycle(&fake, 1);
        let err = lifecycle.acquire(None, 2).err().expect("must fail");
        match err {
            LifecycleError::ProvisioningFailed {
                attempts,
                last,
                backoffs,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(backoffs.len(), 2);
                assert!(matches!(last, TestbedError::ReservationViolation(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(fake.live().is_empty());
        assert!(lifecycle.outstanding().is_empty());
    }

    #[test]
    fn unknown_state_is_not_retried() {
        let fake = FakeTestbed::new(1);
        fake.fail_next_ready(TestbedError::UnknownState("weird".into()));
        let lifecycle = lifecycle(&fake, 1);
        let err = lifecycle.acquire(None, 5).err().expect("must fail");
        assert!(matches!(err, LifecycleError::UnknownState(_)));
        assert_eq!(fake.instantiated(), 1);
        assert!(fake.live().is_empty());
    }

    #[test]
    fn stop_during_backoff_cancels_promptly() {
        let fake = FakeTestbed::new(1);
        fake.fail_next_ready(TestbedError::InsufficientCapacity("none".into()));
        let ctx = Arc::new(OrchestratorContext::new(1));
        let lifecycle = Arc::new(Lifecycle::new(fake.boxed(), settings(30_000), Arc::clone(&ctx)));
        let started = Instant::now();
        let worker = {
            let lifecycle = Arc::clone(&lifecycle);
            thread::spawn(move || lifecycle.acquire(None, 5).err())
        };
        thread::sleep(Duration::from_millis(100));
        ctx.request_stop();
        let err = worker.join().expect("join").expect("must be cancelled");
        assert!(matches!(err, LifecycleError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(fake.live().is_empty());
    }

    #[test]
    fn release_failures_are_swallowed_and_not_found_counts_as_gone() {
        let fake = FakeTestbed::new(1);
        let lifecycle = lifecycle(&fake, 1);

        let lease = lifecycle.acquire(None, 0).expect("acquire");
        for _ in 0..3 {
            fake.fail_next_terminate(TestbedError::Transport("reset".into()));
        }
        assert_eq!(lease.release(), LifecycleState::Failed);
        assert_eq!(fake.terminate_calls(), 3);

        let lease = lifecycle.acquire(None, 0).expect("acquire");
        fake.fail_next_terminate(TestbedError::NotFound("gone".into()));
        assert_eq!(lease.release(), LifecycleState::Terminated);
    }

    #[test]
    fn testbed_calls_are_serialized_across_threads() {
        let fake = FakeTestbed::new(1).with_call_latency(Duration::from_millis(5));
        let lifecycle = lifecycle(&fake, 1);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                thread::spawn(move || {
                    let lease = lifecycle.acquire(None, 0).expect("acquire");
                    lease.release()
                })
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().expect("join"), LifecycleState::Terminated);
        }
        assert_eq!(fake.max_concurrent_calls(), 1);
        assert!(fake.live().is_empty());
    }

    #[test]
    fn dropped_lease_is_released() {
        let fake = FakeTestbed::new(1);
        let lifecycle = lifecycle(&fake, 1);
        let handle = {
            let lease = lifecycle.acquire(None, 0).expect("acquire");
            lease.handle()
        };
        assert_eq!(lifecycle.state(handle), Some(LifecycleState::Terminated));
        assert!(fake.live().is_empty());
    }
}
