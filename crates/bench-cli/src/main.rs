use anyhow::{anyhow, Result};
use bench_core::TestDefinition;
use bench_runner::{
    flatten_tests, load_config, load_password, render_config, run_tests, CliDefaults,
    HttpTestbed, HttpTestbedConfig, OrchestratorContext, RunConfig, RunLayout, RunSummary,
    SshConfig, SshRemote,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "bench", version, about = "Provision testbed resources and run benchmark workloads on them")]
struct Cli {
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every queued test in the configuration.
    Run {
        config: PathBuf,
        #[arg(long, default_value = ".")]
        repo_path: PathBuf,
        #[arg(long)]
        cert: Option<String>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        password: Option<PathBuf>,
        #[arg(long)]
        headless: bool,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the flattened test queue without contacting the testbed.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the rendered config for one test.
    Render {
        config: PathBuf,
        #[arg(long)]
        test: String,
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<String>,
        #[arg(long, default_value = ".")]
        repo_path: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Outcome { payload, cancelled }) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if cancelled {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                let code = err
                    .to_string()
                    .split_once(':')
                    .map(|(prefix, _)| prefix.to_string())
                    .filter(|p| !p.contains(' '))
                    .unwrap_or_else(|| "command_failed".to_string());
                emit_json(&json_error(&code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

struct Outcome {
    payload: Option<Value>,
    cancelled: bool,
}

impl Outcome {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            cancelled: false,
        }
    }
}

fn run_command(command: Commands) -> Result<Outcome> {
    match command {
        Commands::Run {
            config,
            repo_path,
            cert,
            threads,
            password,
            headless,
            out_dir,
            json,
        } => {
            let mut run_config = load_config(&config)?;
            run_config.apply_cli_defaults(CliDefaults {
                ssh_cert: cert,
                max_concurrency: threads,
                password_path: password,
                headless: headless.then_some(true),
            });
            let summary = execute_run(&run_config, &repo_path, &out_dir)?;
            let cancelled = summary.cancelled;
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": true,
                        "command": "run",
                        "out_dir": out_dir.display().to_string(),
                        "summary": summary.to_json(),
                    })),
                    cancelled,
                });
            }
            print_run_summary(&summary);
            Ok(Outcome {
                payload: None,
                cancelled,
            })
        }
        Commands::Describe { config, json } => {
            let run_config = load_config(&config)?;
            let tests = flatten_tests(&run_config);
            if json {
                return Ok(Outcome::done(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "max_concurrency": run_config.max_concurrency(),
                    "tests": tests.iter().map(test_to_json).collect::<Vec<_>>(),
                }))));
            }
            println!("max_concurrency: {}", run_config.max_concurrency());
            println!("tests: {}", tests.len());
            for test in &tests {
                println!("{}", test);
                for (key, value) in test.options() {
                    println!("  {}={}", key, value.shell_literal());
                }
            }
            Ok(Outcome::done(None))
        }
        Commands::Render {
            config,
            test,
            hosts,
            repo_path,
            json,
        } => {
            let run_config = load_config(&config)?;
            let definition = flatten_tests(&run_config)
                .into_iter()
                .find(|t| t.id() == test)
                .ok_or_else(|| anyhow!("unknown_test: no queued test named {}", test))?;
            let template_path = run_config
                .experiments_dir(&repo_path)
                .join(definition.experiment())
                .join("conf")
                .join(&run_config.remote_config);
            let template = fs::read_to_string(&template_path).map_err(|e| {
                anyhow!(
                    "config_error: could not read template {}: {}",
                    template_path.display(),
                    e
                )
            })?;
            let rendered = render_config(&template, &hosts, definition.options());
            if json {
                return Ok(Outcome::done(Some(json!({
                    "ok": true,
                    "command": "render",
                    "test": test_to_json(&definition),
                    "template": template_path.display().to_string(),
                    "text": rendered.text,
                    "unassigned_placeholders": rendered.unassigned_placeholders,
                    "unused_hosts": rendered.unused_hosts,
                    "applied_overrides": rendered.applied_overrides,
                }))));
            }
            print!("{}", rendered.text);
            for key in &rendered.unassigned_placeholders {
                warn!(placeholder = %key, "no host left for placeholder");
            }
            Ok(Outcome::done(None))
        }
    }
}

fn execute_run(config: &RunConfig, repo_path: &Path, out_dir: &Path) -> Result<RunSummary> {
    config.validate(repo_path)?;
    let base_url = config
        .testbed_url
        .clone()
        .ok_or_else(|| anyhow!("config_error: testbed_url is required"))?;
    if config.headless() {
        info!("headless mode requested; the HTTP testbed client has no browser to hide");
    }
    let password = load_password(config)?;
    let testbed = HttpTestbed::new(HttpTestbedConfig {
        base_url,
        username: config.username.clone().unwrap_or_default(),
        password,
        profile: config.profile.clone().unwrap_or_default(),
        poll_interval: POLL_INTERVAL,
        ready_timeout: Duration::from_secs(config.ready_timeout_secs),
        request_timeout: REQUEST_TIMEOUT,
    })?;
    let remote = SshRemote::new(SshConfig {
        username: config.remote_user().to_string(),
        identity: PathBuf::from(config.ssh_cert()),
        connect_timeout: Duration::from_secs(config.command_timeout_secs),
    });

    let ctx = Arc::new(OrchestratorContext::new(config.max_concurrency()));
    install_interrupt_handler(Arc::clone(&ctx))?;
    run_tests(
        config,
        repo_path,
        &RunLayout::new(out_dir),
        Box::new(testbed),
        Arc::new(remote),
        ctx,
    )
}

/// Reads the answer to the quit prompt. A closed or unreadable stdin counts as
/// yes, so unattended runs can still be stopped.
fn confirms_quit(input: &mut impl BufRead) -> bool {
    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(0) | Err(_) => true,
        Ok(_) => answer.trim().eq_ignore_ascii_case("y"),
    }
}

/// First Ctrl-C asks for confirmation before draining; a second one while the
/// question is pending abandons release retries as well.
fn install_interrupt_handler(ctx: Arc<OrchestratorContext>) -> Result<()> {
    let presses = Arc::new(AtomicUsize::new(0));
    ctrlc::set_handler(move || {
        let count = presses.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            let prompt_ctx = Arc::clone(&ctx);
            let prompt_presses = Arc::clone(&presses);
            let spawned = thread::Builder::new()
                .name("quit-prompt".to_string())
                .spawn(move || {
                    eprint!("Really quit? (y/n) ");
                    if confirms_quit(&mut std::io::stdin().lock()) {
                        prompt_ctx.request_stop();
                    } else {
                        prompt_presses.store(0, Ordering::SeqCst);
                    }
                });
            if spawned.is_err() {
                ctx.request_stop();
            }
        } else {
            warn!("second interrupt; stopping without further retries");
            ctx.force();
        }
    })?;
    Ok(())
}

fn test_to_json(test: &TestDefinition) -> Value {
    json!({
        "id": test.id(),
        "experiment": test.experiment(),
        "options": test.options(),
    })
}

fn print_run_summary(summary: &RunSummary) {
    for record in &summary.records {
        println!(
            "{}: {} (host {}, log {})",
            record.test_id(),
            record.status().map(|s| s.as_str()).unwrap_or("unknown"),
            record.executor_host(),
            record.log_path().display()
        );
        if let Some(step) = record.failed_step() {
            println!("  failed_step: {}", step);
        }
    }
    for skipped in &summary.skipped {
        println!("{}: skipped ({})", skipped.test_id, skipped.reason);
    }
    if summary.cancelled {
        println!("run cancelled by operator");
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Render { json, .. } => *json,
    }
}
