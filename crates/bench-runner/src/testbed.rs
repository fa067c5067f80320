//! Testbed client contract and a JSON-over-HTTP implementation.
//!
//! The orchestrator only needs four operations from a testbed: authenticate,
//! instantiate a resource, wait for it to become ready, and terminate it. None
//! of them are safe for concurrent use; callers serialize access (see
//! `lifecycle`).
//!
//! `HttpTestbed` speaks this API:
//!
//! ```text
//! POST   /login              {username, password}             -> {token}
//! POST   /experiments        {profile, name?, duration_minutes} -> {uuid, name}
//! GET    /experiments/{uuid}                                  -> {status, error?, ssh_urls}
//! DELETE /experiments/{uuid}
//! ```

use anyhow::Result;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestbedError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("resource not ready: {0}")]
    NotReady(String),
    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),
    #[error("resource reservation violation: {0}")]
    ReservationViolation(String),
    #[error("resource is terminating: {0}")]
    Terminating(String),
    #[error("provisioning failed: {0}")]
    Failed(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown testbed state: {0}")]
    UnknownState(String),
}

/// How long to wait before retrying after a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffClass {
    Transient,
    Capacity,
}

impl TestbedError {
    /// `None` means the failure must not be retried.
    pub fn backoff_class(&self) -> Option<BackoffClass> {
        match self {
            Self::InsufficientCapacity(_) | Self::ReservationViolation(_) | Self::Terminating(_) => {
                Some(BackoffClass::Capacity)
            }
            Self::Unauthorized(_) | Self::NotReady(_) | Self::Failed(_) | Self::Transport(_) => {
                Some(BackoffClass::Transient)
            }
            Self::NotFound(_) | Self::UnknownState(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResource {
    pub uuid: String,
    pub name: String,
}

pub trait Testbed: Send {
    /// No-op when a session is already established.
    fn authenticate(&mut self) -> Result<(), TestbedError>;

    /// Asks the testbed for a new resource. The resource exists on the backend
    /// once this returns `Ok`.
    fn instantiate(
        &mut self,
        name: Option<&str>,
        duration_minutes: u32,
    ) -> Result<PendingResource, TestbedError>;

    /// Polls until the resource is ready, failed, or terminating; returns the
    /// hostnames on success.
    fn await_ready(&mut self, resource: &PendingResource) -> Result<Vec<String>, TestbedError>;

    fn terminate(&mut self, resource: &PendingResource) -> Result<(), TestbedError>;
}

/// Maps a testbed error message onto the failure kinds that warrant different
/// backoff.
pub fn classify_failure(message: &str) -> TestbedError {
    if message.contains("Resource reservation violation") {
        TestbedError::ReservationViolation(message.to_string())
    } else if mentions_insufficient_nodes(message) {
        TestbedError::InsufficientCapacity(message.to_string())
    } else {
        TestbedError::Failed(message.to_string())
    }
}

// "<n> nodes of type <t> requested, but only <m> available nodes of type <t> found"
fn mentions_insufficient_nodes(message: &str) -> bool {
    message.lines().any(|line| {
        let Some((head, tail)) = line.split_once(" requested, but only ") else {
            return false;
        };
        let Some((before, node_type)) = head.rsplit_once(" nodes of type ") else {
            return false;
        };
        let requested = before.rsplit(' ').next().unwrap_or("");
        let Some((available, rest)) = tail.split_once(" available nodes of type ") else {
            return false;
        };
        is_count(requested)
            && is_count(available)
            && !node_type.trim().is_empty()
            && rest.contains(" found")
    })
}

fn is_count(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Extracts the host from an `ssh -p <port> <user>@<host>` command line.
pub fn parse_ssh_hostname(ssh_url: &str) -> Option<String> {
    let parts: Vec<&str> = ssh_url.split_whitespace().collect();
    parts.windows(4).find_map(|w| {
        if w[0] == "ssh" && w[1] == "-p" && is_count(w[2]) {
            w[3].split_once('@')
                .map(|(_, host)| host.to_string())
                .filter(|host| !host.is_empty())
        } else {
            None
        }
    })
}

#[derive(Debug, Clone)]
pub struct HttpTestbedConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub profile: String,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    uuid: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ssh_urls: Vec<String>,
}

pub struct HttpTestbed {
    config: HttpTestbedConfig,
    client: Client,
    token: Option<String>,
}

impl HttpTestbed {
    pub fn new(config: HttpTestbedConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            config,
            client,
            token: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Sends an authenticated request, logging in again once if the session
    /// has expired.
    fn send<F>(&mut self, build: F) -> Result<Response, TestbedError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        for attempt in 0..2 {
            self.authenticate()?;
            let token = self.token.clone().unwrap_or_default();
            let response = build(&self.client)
                .bearer_auth(&token)
                .send()
                .map_err(|e| TestbedError::Transport(e.to_string()))?;
            if response.status() == StatusCode::UNAUTHORIZED {
                warn!(attempt, "testbed session expired; logging in again");
                self.token = None;
                continue;
            }
            return Ok(response);
        }
        Err(TestbedError::Unauthorized(
            "session rejected after re-authentication".to_string(),
        ))
    }

    fn read_error_text(response: Response) -> String {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if body.trim().is_empty() {
            format!("http {}", status)
        } else {
            body
        }
    }
}

impl Testbed for HttpTestbed {
    fn authenticate(&mut self) -> Result<(), TestbedError> {
        if self.token.is_some() {
            return Ok(());
        }
        let response = self
            .client
            .post(self.url("/login"))
            .json(&json!({
                "username": self.config.username,
                "password": self.config.password,
            }))
            .send()
            .map_err(|e| TestbedError::Transport(e.to_string()))?;
        match response.status() {
            s if s.is_success() => {
                let body: LoginResponse = response
                    .json()
                    .map_err(|e| TestbedError::UnknownState(format!("login response: {}", e)))?;
                self.token = Some(body.token);
                info!(username = %self.config.username, "testbed login successful");
                Ok(())
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TestbedError::Unauthorized(
                Self::read_error_text(response),
            )),
            s if s.is_server_error() => Err(TestbedError::Transport(Self::read_error_text(response))),
            s => Err(TestbedError::UnknownState(format!(
                "login answered {}: {}",
                s,
                Self::read_error_text(response)
            ))),
        }
    }

    fn instantiate(
        &mut self,
        name: Option<&str>,
        duration_minutes: u32,
    ) -> Result<PendingResource, TestbedError> {
        let url = self.url("/experiments");
        let body = json!({
            "profile": self.config.profile,
            "name": name,
            "duration_minutes": duration_minutes,
        });
        let response = self.send(|client| client.post(&url).json(&body))?;
        let status = response.status();
        if status.is_success() {
            let created: CreateResponse = response
                .json()
                .map_err(|e| TestbedError::UnknownState(format!("instantiate response: {}", e)))?;
            debug!(uuid = %created.uuid, name = %created.name, "instantiated resource");
            return Ok(PendingResource {
                uuid: created.uuid,
                name: created.name,
            });
        }
        if status.is_server_error() {
            return Err(TestbedError::Transport(Self::read_error_text(response)));
        }
        Err(classify_failure(&Self::read_error_text(response)))
    }

    fn await_ready(&mut self, resource: &PendingResource) -> Result<Vec<String>, TestbedError> {
        let url = self.url(&format!("/experiments/{}", resource.uuid));
        let deadline = Instant::now() + self.config.ready_timeout;
        let mut last_status = String::new();
        loop {
            let response = self.send(|client| client.get(&url))?;
            match response.status() {
                s if s.is_success() => {}
                StatusCode::NOT_FOUND => {
                    return Err(TestbedError::NotFound(resource.uuid.clone()));
                }
                s if s.is_server_error() => {
                    return Err(TestbedError::Transport(Self::read_error_text(response)));
                }
                s => {
                    return Err(TestbedError::UnknownState(format!(
                        "status query answered {}",
                        s
                    )));
                }
            }
            let body: StatusResponse = response
                .json()
                .map_err(|e| TestbedError::UnknownState(format!("status response: {}", e)))?;
            if body.status != last_status {
                debug!(uuid = %resource.uuid, status = %body.status, "resource status changed");
                last_status = body.status.clone();
            }
            let error_text = body.error.unwrap_or_default();
            match body.status.as_str() {
                "ready" => {
                    let hostnames: Vec<String> = body
                        .ssh_urls
                        .iter()
                        .filter_map(|u| parse_ssh_hostname(u))
                        .collect();
                    if hostnames.is_empty() {
                        return Err(TestbedError::Failed(
                            "hostnames list was empty once the resource was ready".to_string(),
                        ));
                    }
                    return Ok(hostnames);
                }
                "created" | "provisioning" | "booting" => {}
                "terminating" => return Err(TestbedError::Terminating(error_text)),
                "failed" => return Err(classify_failure(&error_text)),
                other => {
                    return Err(TestbedError::UnknownState(format!(
                        "resource {} reported status '{}'",
                        resource.uuid, other
                    )));
                }
            }
            if Instant::now() >= deadline {
                return Err(TestbedError::NotReady(format!(
                    "resource {} still '{}' after {:?}",
                    resource.uuid, last_status, self.config.ready_timeout
                )));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn terminate(&mut self, resource: &PendingResource) -> Result<(), TestbedError> {
        let url = self.url(&format!("/experiments/{}", resource.uuid));
        let response = self.send(|client| client.delete(&url))?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(TestbedError::NotFound(resource.uuid.clone())),
            s if s.is_server_error() => Err(TestbedError::Transport(Self::read_error_text(response))),
            _ => Err(TestbedError::Failed(Self::read_error_text(response))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    type Handler = Box<dyn FnMut(&str, &str, &str) -> (u16, String) + Send>;

    struct MockServer {
        server: Arc<tiny_http::Server>,
        handle: Option<thread::JoinHandle<()>>,
        requests: Arc<Mutex<Vec<String>>>,
        base_url: String,
    }

    impl MockServer {
        fn start(mut handler: Handler) -> Self {
            let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").expect("bind mock"));
            let addr = server.server_addr().to_ip().expect("ip listener");
            let requests = Arc::new(Mutex::new(Vec::new()));
            let srv = Arc::clone(&server);
            let log = Arc::clone(&requests);
            let handle = thread::spawn(move || {
                for mut request in srv.incoming_requests() {
                    let method = request.method().to_string();
                    let url = request.url().to_string();
                    let mut body = String::new();
                    let _ = request.as_reader().read_to_string(&mut body);
                    log.lock().expect("log").push(format!("{} {}", method, url));
                    let (code, payload) = handler(&method, &url, &body);
                    let _ = request
                        .respond(tiny_http::Response::from_string(payload).with_status_code(code));
                }
            });
            Self {
                server,
                handle: Some(handle),
                requests,
                base_url: format!("http://{}", addr),
            }
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().expect("log").clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.requests()
                .iter()
                .filter(|r| r.starts_with(prefix))
                .count()
        }
    }

    impl Drop for MockServer {
        fn drop(&mut self) {
            self.server.unblock();
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn client_for(server: &MockServer) -> HttpTestbed {
        HttpTestbed::new(HttpTestbedConfig {
            base_url: server.base_url.clone(),
            username: "alice".to_string(),
            password: "secret".to_string(),
            profile: "small-lan".to_string(),
            poll_interval: Duration::from_millis(5),
            ready_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        })
        .expect("client")
    }

    fn login_ok() -> (u16, String) {
        (200, r#"{"token":"t1"}"#.to_string())
    }

    #[test]
    fn classify_failure_distinguishes_capacity_and_reservation() {
        let capacity = "Error: 3 nodes of type m510 requested, but only 1 available nodes of type m510 found";
        assert!(matches!(
            classify_failure(capacity),
            TestbedError::InsufficientCapacity(_)
        ));
        assert!(matches!(
            classify_failure("Resource reservation violation: project over quota"),
            TestbedError::ReservationViolation(_)
        ));
        assert!(matches!(
            classify_failure("nodes requested, but only some found"),
            TestbedError::Failed(_)
        ));
        assert!(matches!(classify_failure(""), TestbedError::Failed(_)));
    }

    #[test]
    fn backoff_classes_follow_failure_kind() {
        assert_eq!(
            TestbedError::InsufficientCapacity(String::new()).backoff_class(),
            Some(BackoffClass::Capacity)
        );
        assert_eq!(
            TestbedError::Transport(String::new()).backoff_class(),
            Some(BackoffClass::Transient)
        );
        assert_eq!(TestbedError::UnknownState(String::new()).backoff_class(), None);
    }

    #[test]
    fn parse_ssh_hostname_reads_user_at_host() {
        assert_eq!(
            parse_ssh_hostname("ssh -p 22 alice@node0.exp.example.net").as_deref(),
            Some("node0.exp.example.net")
        );
        assert_eq!(parse_ssh_hostname("ssh alice@host"), None);
        assert_eq!(parse_ssh_hostname("ssh -p x alice@host"), None);
    }

    #[test]
    fn provision_polls_until_ready_and_extracts_hostnames() {
        let mut polls = 0;
        let server = MockServer::start(Box::new(move |method, url, body| {
            match (method, url) {
                ("POST", "/login") => {
                    assert!(body.contains("\"alice\""));
                    login_ok()
                }
                ("POST", "/experiments") => {
                    assert!(body.contains("small-lan"));
                    (201, r#"{"uuid":"u1","name":"bench-a-0"}"#.to_string())
                }
                ("GET", "/experiments/u1") => {
                    polls += 1;
                    if polls < 3 {
                        (200, r#"{"status":"booting"}"#.to_string())
                    } else {
                        (
                            200,
                            r#"{"status":"ready","ssh_urls":["ssh -p 22 alice@h0.net","ssh -p 22 alice@h1.net"]}"#
                                .to_string(),
                        )
                    }
                }
                _ => (500, "unexpected".to_string()),
            }
        }));
        let mut testbed = client_for(&server);
        let pending = testbed.instantiate(Some("bench-a-0"), 60).expect("instantiate");
        assert_eq!(pending.uuid, "u1");
        let hosts = testbed.await_ready(&pending).expect("ready");
        assert_eq!(hosts, vec!["h0.net".to_string(), "h1.net".to_string()]);
        assert_eq!(server.count("POST /login"), 1);
        assert_eq!(server.count("GET /experiments/u1"), 3);
    }

    #[test]
    fn expired_session_is_renewed_once() {
        let mut rejected = false;
        let server = MockServer::start(Box::new(move |method, url, _| match (method, url) {
            ("POST", "/login") => login_ok(),
            ("POST", "/experiments") if !rejected => {
                rejected = true;
                (401, "expired".to_string())
            }
            ("POST", "/experiments") => (201, r#"{"uuid":"u2","name":"n"}"#.to_string()),
            _ => (500, "unexpected".to_string()),
        }));
        let mut testbed = client_for(&server);
        testbed.authenticate().expect("login");
        testbed.authenticate().expect("idempotent login");
        assert_eq!(server.count("POST /login"), 1);
        let pending = testbed.instantiate(None, 60).expect("instantiate");
        assert_eq!(pending.uuid, "u2");
        assert_eq!(server.count("POST /login"), 2);
    }

    #[test]
    fn failed_status_is_classified() {
        let server = MockServer::start(Box::new(|method, url, _| match (method, url) {
            ("POST", "/login") => login_ok(),
            ("GET", "/experiments/u3") => (
                200,
                r#"{"status":"failed","error":"2 nodes of type d430 requested, but only 0 available nodes of type d430 found"}"#
                    .to_string(),
            ),
            _ => (500, "unexpected".to_string()),
        }));
        let mut testbed = client_for(&server);
        let pending = PendingResource {
            uuid: "u3".to_string(),
            name: "n".to_string(),
        };
        let err = testbed.await_ready(&pending).expect_err("failed");
        assert!(matches!(err, TestbedError::InsufficientCapacity(_)), "{:?}", err);
    }

    #[test]
    fn unrecognized_status_is_unknown_state() {
        let server = MockServer::start(Box::new(|method, url, _| match (method, url) {
            ("POST", "/login") => login_ok(),
            ("GET", "/experiments/u4") => (200, r#"{"status":"quarantined"}"#.to_string()),
            _ => (500, "unexpected".to_string()),
        }));
        let mut testbed = client_for(&server);
        let pending = PendingResource {
            uuid: "u4".to_string(),
            name: "n".to_string(),
        };
        let err = testbed.await_ready(&pending).expect_err("unknown");
        assert!(matches!(err, TestbedError::UnknownState(_)), "{:?}", err);
    }

    #[test]
    fn terminate_maps_missing_resource_to_not_found() {
        let server = MockServer::start(Box::new(|method, url, _| match (method, url) {
            ("POST", "/login") => login_ok(),
            ("DELETE", "/experiments/gone") => (404, String::new()),
            ("DELETE", "/experiments/u5") => (204, String::new()),
            _ => (500, "unexpected".to_string()),
        }));
        let mut testbed = client_for(&server);
        let gone = PendingResource {
            uuid: "gone".to_string(),
            name: "n".to_string(),
        };
        assert!(matches!(
            testbed.terminate(&gone),
            Err(TestbedError::NotFound(_))
        ));
        let live = PendingResource {
            uuid: "u5".to_string(),
            name: "n".to_string(),
        };
        testbed.terminate(&live).expect("terminate");
    }

    #[test]
    fn rejected_credentials_are_unauthorized() {
        let server = MockServer::start(Box::new(|_, _, _| (401, "bad password".to_string())));
        let mut testbed = client_for(&server);
        assert!(matches!(
            testbed.authenticate(),
            Err(TestbedError::Unauthorized(_))
        ));
    }
}
