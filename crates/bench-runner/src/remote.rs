//! Remote host contract: shell sessions and file copies.
//!
//! `SshRemote` keeps one interactive `ssh -tt` shell per session so that state
//! such as the working directory carries from one command to the next. Each
//! command line is suffixed with an echo of its exit status tagged with a
//! per-session sequence number; output is read line by line until the marker
//! for the current sequence shows up.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const EXIT_MARKER: &str = "__BENCH_RC__:";
// Split with an empty string so the typed command never contains the marker.
const EXIT_MARKER_TYPED: &str = "__BENCH_\"\"RC__:";
const READY_MARKER: &str = "__BENCH_READY__";
const READY_PROBE: &str = "echo __BENCH_\"\"READY__";
const INTERRUPT: &[u8] = b"\x03\n";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("could not connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },
    #[error("transfer {direction} {host} failed: {reason}")]
    TransferFailed {
        host: String,
        direction: Direction,
        reason: String,
    },
    #[error("session to {host} closed unexpectedly")]
    SessionClosed { host: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToRemote,
    FromRemote,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToRemote => f.write_str("to"),
            Direction::FromRemote => f.write_str("from"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
    /// The command that returned non-zero, if any; later commands were not run.
    pub failed_command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    Line(&'a str),
    /// Nothing arrived within one iteration timeout.
    Idle { interrupted: bool },
}

pub trait RemoteSession: Send {
    /// Runs commands in order; the first non-zero exit aborts the rest.
    /// `timeout` bounds each wait for output; when it elapses an interrupt is
    /// sent and waiting continues.
    fn run(&mut self, commands: &[String], timeout: Duration) -> Result<CommandOutput, RemoteError>;

    /// Runs one command, handing each output line to `sink` as it arrives.
    fn stream(
        &mut self,
        command: &str,
        iteration_timeout: Duration,
        interrupt_on_timeout: bool,
        sink: &mut dyn FnMut(StreamEvent<'_>),
    ) -> Result<i32, RemoteError>;

    fn close(&mut self);
}

pub trait RemoteHost: Send + Sync {
    fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError>;

    fn copy(
        &self,
        host: &str,
        direction: Direction,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError>;
}

fn exit_marker_command(seq: u64) -> String {
    format!("echo \"{}{}:$?\"", EXIT_MARKER_TYPED, seq)
}

/// Returns `(seq, exit_code)` for an exit marker line.
fn parse_exit_marker(line: &str) -> Option<(u64, i32)> {
    let start = line.find(EXIT_MARKER)? + EXIT_MARKER.len();
    let rest = line[start..].trim();
    let (seq, code) = rest.split_once(':')?;
    let code: String = code.chars().take_while(|c| c.is_ascii_digit()).collect();
    Some((seq.parse().ok()?, code.parse().ok()?))
}

fn is_typed_echo(line: &str) -> bool {
    line.contains(EXIT_MARKER_TYPED) || line.contains(READY_PROBE)
}

fn pump_lines<R: Read + Send + 'static>(reader: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(|c: char| c == '\n' || c == '\r')
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// A line-oriented shell running in a child process.
pub struct ShellSession {
    host: String,
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
    seq: u64,
    closed: bool,
}

impl ShellSession {
    pub fn spawn(host: &str, mut command: Command) -> Result<Self, RemoteError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|e| RemoteError::ConnectFailed {
            host: host.to_string(),
            reason: e.to_string(),
        })?;
        let connect_failed = |reason: &str| RemoteError::ConnectFailed {
            host: host.to_string(),
            reason: reason.to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(|| connect_failed("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| connect_failed("no stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| connect_failed("no stderr"))?;
        let (tx, rx) = mpsc::channel();
        pump_lines(stdout, tx.clone());
        pump_lines(stderr, tx);
        Ok(Self {
            host: host.to_string(),
            child,
            stdin,
            lines: rx,
            seq: 0,
            closed: false,
        })
    }

    fn send_line(&mut self, line: &str) -> Result<(), RemoteError> {
        let closed = |_| RemoteError::SessionClosed {
            host: self.host.clone(),
        };
        self.stdin
            .write_all(format!("{}\n", line).as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(closed)
    }

    /// Waits for the probe echo; anything else printed before it is returned
    /// as the failure reason if the shell exits or the deadline passes.
    pub fn probe(&mut self, timeout: Duration) -> Result<(), RemoteError> {
        self.send_line(READY_PROBE)?;
        let deadline = Instant::now() + timeout;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(line) if line.trim() == READY_MARKER => return Ok(()),
                Ok(line) => seen.push(line),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    self.close();
                    let tail = seen.last().cloned().unwrap_or_else(|| "no response".to_string());
                    return Err(RemoteError::ConnectFailed {
                        host: self.host.clone(),
                        reason: tail,
                    });
                }
            }
        }
    }

    fn wait_for_exit(
        &mut self,
        seq: u64,
        iteration_timeout: Duration,
        interrupt_on_timeout: bool,
        sink: &mut dyn FnMut(StreamEvent<'_>),
    ) -> Result<i32, RemoteError> {
        loop {
            match self.lines.recv_timeout(iteration_timeout) {
                Ok(line) => match parse_exit_marker(&line) {
                    Some((got, code)) if got == seq => return Ok(code),
                    Some(_) => {}
                    None if is_typed_echo(&line) => {}
                    None => sink(StreamEvent::Line(&line)),
                },
                Err(RecvTimeoutError::Timeout) => {
                    if interrupt_on_timeout {
                        self.stdin
                            .write_all(INTERRUPT)
                            .and_then(|_| self.stdin.flush())
                            .map_err(|_| RemoteError::SessionClosed {
                                host: self.host.clone(),
                            })?;
                        self.send_line(&exit_marker_command(seq))?;
                    }
                    sink(StreamEvent::Idle {
                        interrupted: interrupt_on_timeout,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RemoteError::SessionClosed {
                        host: self.host.clone(),
                    });
                }
            }
        }
    }

    fn submit(&mut self, command: &str) -> Result<u64, RemoteError> {
        self.seq += 1;
        let seq = self.seq;
        self.send_line(&format!("{}; {}", command, exit_marker_command(seq)))?;
        Ok(seq)
    }
}

impl RemoteSession for ShellSession {
    fn run(&mut self, commands: &[String], timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let mut output = String::new();
        for command in commands {
            let seq = self.submit(command)?;
            let code = self.wait_for_exit(seq, timeout, true, &mut |event| {
                if let StreamEvent::Line(line) = event {
                    output.push_str(line);
                    output.push('\n');
                }
            })?;
            debug!(host = %self.host, command = %command, exit_code = code, "remote command finished");
            if code != 0 {
                return Ok(CommandOutput {
                    output,
                    exit_code: code,
                    failed_command: Some(command.clone()),
                });
            }
        }
        Ok(CommandOutput {
            output,
            exit_code: 0,
            failed_command: None,
        })
    }

    fn stream(
        &mut self,
        command: &str,
        iteration_timeout: Duration,
        interrupt_on_timeout: bool,
        sink: &mut dyn FnMut(StreamEvent<'_>),
    ) -> Result<i32, RemoteError> {
        let seq = self.submit(command)?;
        self.wait_for_exit(seq, iteration_timeout, interrupt_on_timeout, sink)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.send_line("exit");
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                _ => break,
            }
        }
        warn!(host = %self.host, "shell did not exit; killing it");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub username: String,
    pub identity: PathBuf,
    pub connect_timeout: Duration,
}

pub struct SshRemote {
    config: SshConfig,
}

impl SshRemote {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            "-i".to_string(),
            self.config.identity.to_string_lossy().to_string(),
        ]
    }

    fn destination(&self, host: &str) -> String {
        format!("{}@{}", self.config.username, host)
    }

    fn scp_args(
        &self,
        host: &str,
        direction: Direction,
        local_path: &Path,
        remote_path: &str,
    ) -> Vec<String> {
        let remote = format!("{}:{}", self.destination(host), remote_path);
        let local = local_path.to_string_lossy().to_string();
        let mut args = self.options();
        match direction {
            Direction::ToRemote => args.extend([local, remote]),
            Direction::FromRemote => args.extend([remote, local]),
        }
        args
    }
}

impl RemoteHost for SshRemote {
    fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let mut command = Command::new("ssh");
        command
            .args(self.options())
            .arg("-tt")
            .arg(self.destination(host));
        let mut session = ShellSession::spawn(host, command)?;
        session.send_line("stty -echo")?;
        session.probe(self.config.connect_timeout)?;
        Ok(Box::new(session))
    }

    fn copy(
        &self,
        host: &str,
        direction: Direction,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), RemoteError> {
        let failed = |reason: String| RemoteError::TransferFailed {
            host: host.to_string(),
            direction,
            reason,
        };
        let output = Command::new("scp")
            .args(self.scp_args(host, direction, local_path, remote_path))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| failed(e.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .unwrap_or_else(|| format!("scp exited with {}", output.status));
        Err(failed(reason))
    }
}
