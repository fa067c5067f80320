//! Scripted in-memory testbed and remote host used by unit tests.

use crate::remote::{CommandOutput, Direction, RemoteError, RemoteHost, RemoteSession, StreamEvent};
use crate::testbed::{PendingResource, Testbed, TestbedError};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct TestbedState {
    hosts_per_resource: usize,
    call_latency: Duration,
    next_id: usize,
    ready_failures: VecDeque<TestbedError>,
    terminate_failures: VecDeque<TestbedError>,
    instantiated: usize,
    terminate_calls: usize,
    live: BTreeSet<String>,
    ready: BTreeSet<String>,
    max_ready: usize,
    in_call: usize,
    max_in_call: usize,
}

#[derive(Clone)]
pub struct FakeTestbed {
    state: Arc<Mutex<TestbedState>>,
}

impl FakeTestbed {
    pub fn new(hosts_per_resource: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TestbedState {
                hosts_per_resource,
                ..TestbedState::default()
            })),
        }
    }

    pub fn with_call_latency(self, latency: Duration) -> Self {
        self.lock().call_latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, TestbedState> {
        self.state.lock().expect("fake testbed state")
    }

    pub fn boxed(&self) -> Box<dyn Testbed> {
        Box::new(self.clone())
    }

    pub fn fail_next_ready(&self, err: TestbedError) {
        self.lock().ready_failures.push_back(err);
    }

    pub fn fail_next_terminate(&self, err: TestbedError) {
        self.lock().terminate_failures.push_back(err);
    }

    pub fn instantiated(&self) -> usize {
        self.lock().instantiated
    }

    pub fn terminate_calls(&self) -> usize {
        self.lock().terminate_calls
    }

    pub fn live(&self) -> Vec<String> {
        self.lock().live.iter().cloned().collect()
    }

    pub fn max_ready(&self) -> usize {
        self.lock().max_ready
    }

    pub fn max_concurrent_calls(&self) -> usize {
        self.lock().max_in_call
    }

    fn enter(&self) {
        let latency = {
            let mut state = self.lock();
            state.in_call += 1;
            state.max_in_call = state.max_in_call.max(state.in_call);
            state.call_latency
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
    }

    fn leave(&self) {
        self.lock().in_call -= 1;
    }
}

impl Testbed for FakeTestbed {
    fn authenticate(&mut self) -> Result<(), TestbedError> {
        Ok(())
    }

    fn instantiate(
        &mut self,
        name: Option<&str>,
        _duration_minutes: u32,
    ) -> Result<PendingResource, TestbedError> {
        self.enter();
        let pending = {
            let mut state = self.lock();
            state.next_id += 1;
            state.instantiated += 1;
            let uuid = format!("uuid-{}", state.next_id);
            state.live.insert(uuid.clone());
            PendingResource {
                uuid,
                name: name.unwrap_or("exp").to_string(),
            }
        };
        self.leave();
        Ok(pending)
    }

    fn await_ready(&mut self, resource: &PendingResource) -> Result<Vec<String>, TestbedError> {
        self.enter();
        let result = {
            let mut state = self.lock();
            match state.ready_failures.pop_front() {
                Some(err) => Err(err),
                None => {
                    state.ready.insert(resource.uuid.clone());
                    state.max_ready = state.max_ready.max(state.ready.len());
                    Ok((0..state.hosts_per_resource)
                        .map(|i| format!("{}-node{}", resource.uuid, i))
                        .collect())
                }
            }
        };
        self.leave();
        result
    }

    fn terminate(&mut self, resource: &PendingResource) -> Result<(), TestbedError> {
        self.enter();
        let result = {
            let mut state = self.lock();
            state.terminate_calls += 1;
            match state.terminate_failures.pop_front() {
                Some(err) => Err(err),
                None => {
                    state.ready.remove(&resource.uuid);
                    if state.live.remove(&resource.uuid) {
                        Ok(())
                    } else {
                        Err(TestbedError::NotFound(resource.uuid.clone()))
                    }
                }
            }
        };
        self.leave();
        result
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    connect_failures: usize,
    copy_failures: usize,
    command_failures: usize,
    sessions_closed: bool,
    run_calls: usize,
    script_duration: Duration,
    script_exit: i32,
    commands: Vec<String>,
    copies: Vec<(Direction, String)>,
}

#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().expect("fake remote state")
    }

    pub fn fail_connects(&self, count: usize) {
        self.lock().connect_failures = count;
    }

    pub fn fail_copies(&self, count: usize) {
        self.lock().copy_failures = count;
    }

    pub fn fail_commands(&self, count: usize) {
        self.lock().command_failures = count;
    }

    /// Every session `run` reports the shell as gone.
    pub fn close_sessions(&self) {
        self.lock().sessions_closed = true;
    }

    pub fn run_calls(&self) -> usize {
        self.lock().run_calls
    }

    pub fn script(&self, duration: Duration, exit_code: i32) {
        let mut state = self.lock();
        state.script_duration = duration;
        state.script_exit = exit_code;
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn copies(&self) -> Vec<(Direction, String)> {
        self.lock().copies.clone()
    }
}

impl RemoteHost for FakeRemote {
    fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let mut state = self.lock();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RemoteError::ConnectFailed {
                host: host.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeSession {
            remote: self.clone(),
            host: host.to_string(),
        }))
    }

    fn copy(
        &self,
        host: &str,
        direction: Direction,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        if state.copy_failures > 0 {
            state.copy_failures -= 1;
            return Err(RemoteError::TransferFailed {
                host: host.to_string(),
                direction,
                reason: "lost connection".to_string(),
            });
        }
        state.copies.push((direction, remote_path.to_string()));
        if direction == Direction::FromRemote {
            fs::write(local_path, b"results").map_err(|e| RemoteError::TransferFailed {
                host: host.to_string(),
                direction,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

struct FakeSession {
    remote: FakeRemote,
    host: String,
}

impl RemoteSession for FakeSession {
    fn run(&mut self, commands: &[String], _timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let mut state = self.remote.lock();
        state.run_calls += 1;
        if state.sessions_closed {
            return Err(RemoteError::SessionClosed {
                host: self.host.clone(),
            });
        }
        if state.command_failures > 0 {
            state.command_failures -= 1;
            return Ok(CommandOutput {
                output: "fatal: unable to access repository\n".to_string(),
                exit_code: 128,
                failed_command: commands.first().cloned(),
            });
        }
        state.commands.extend(commands.iter().cloned());
        Ok(CommandOutput {
            output: String::new(),
            exit_code: 0,
            failed_command: None,
        })
    }

    fn stream(
        &mut self,
        command: &str,
        _iteration_timeout: Duration,
        _interrupt_on_timeout: bool,
        sink: &mut dyn FnMut(StreamEvent<'_>),
    ) -> Result<i32, RemoteError> {
        let (duration, exit_code) = {
            let mut state = self.remote.lock();
            state.commands.push(command.to_string());
            (state.script_duration, state.script_exit)
        };
        sink(StreamEvent::Line("benchmark started"));
        thread::sleep(duration);
        sink(StreamEvent::Line("benchmark finished"));
        Ok(exit_code)
    }

    fn close(&mut self) {}
}
