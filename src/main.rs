use clap::{Parser, ValueEnum};
use nix::sys::signal::{kill, Signal as UnixSignal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use agentq::config::{
    parse_agent_keys, EventBusBackend, QueueBackend, RuntimeConfig, ShellConfig, WorkerConfig,
};
use agentq::run::{NewRun, Run};
use agentq::shutdown::install_shutdown_handler;
use agentq::worker::{Dispatcher, EchoExecutor, ExecutorRegistry, ShellExecutor};
use agentq::Runtime;

#[derive(Parser, Debug)]
#[command(name = "agentq")]
#[command(version)]
#[command(about = "A leased job queue for long-running agent runs")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a worker that claims and executes runs
    Worker(WorkerArgs),

    /// Run management commands
    Run {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: RunCommands,
    },

    /// Conversation management commands
    Conversation {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: ConversationCommands,
    },
}

// =============================================================================
// Runtime Arguments (shared by every command)
// =============================================================================

#[derive(Parser, Debug)]
struct RuntimeArgs {
    /// Queue backend: "memory" or "sqlite:<path>"
    #[arg(long, env = "AGENTQ_QUEUE_BACKEND", default_value = "sqlite:agentq.db", global = true)]
    store: String,

    /// Event bus backend: "local" or "polling"
    #[arg(long, env = "AGENTQ_EVENT_BUS_BACKEND", default_value = "polling", global = true)]
    event_bus: String,

    /// Lease time-to-live in seconds
    #[arg(long, env = "AGENTQ_LEASE_TTL_SECONDS", default_value = "30", global = true)]
    lease_ttl_secs: u64,

    /// Wall-clock budget for one attempt, in seconds
    #[arg(long, env = "AGENTQ_RUN_TIMEOUT_SECONDS", default_value = "900", global = true)]
    run_timeout_secs: u64,

    /// Attempts a new run gets unless overridden at submit time
    #[arg(long, env = "AGENTQ_MAX_RETRIES", default_value = "3", global = true)]
    max_attempts: u32,
}

impl RuntimeArgs {
    fn to_config(&self) -> agentq::Result<RuntimeConfig> {
        let mut config = RuntimeConfig::with_lease_ttl(Duration::from_secs(self.lease_ttl_secs));
        config.queue_backend = self.store.parse::<QueueBackend>()?;
        config.event_bus_backend = self.event_bus.parse::<EventBusBackend>()?;
        config.run_timeout = Duration::from_secs(self.run_timeout_secs);
        config.max_attempts = self.max_attempts;
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Worker processes to run; more than one spawns child processes
    #[arg(long, env = "AGENTQ_PROCESSES", default_value = "1")]
    processes: usize,

    /// Concurrent runs per process
    #[arg(long, env = "AGENTQ_CONCURRENCY", default_value = "10")]
    concurrency: usize,

    /// Comma-separated agent keys to claim (default: every registered agent)
    #[arg(long, env = "AGENTQ_AGENT_KEYS", default_value = "")]
    agent_keys: String,

    /// Sleep between claims when the queue is empty, in milliseconds
    #[arg(long, env = "AGENTQ_POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// How long shutdown waits for in-flight runs, in seconds
    #[arg(long, env = "AGENTQ_SHUTDOWN_GRACE_SECONDS", default_value = "30")]
    shutdown_grace_secs: u64,

    /// Worker identity prefix
    #[arg(long, env = "AGENTQ_WORKER_ID", default_value = "worker")]
    worker_id: String,

    /// Docker image for the shell agent (default: run on the host)
    #[arg(long, env = "AGENTQ_SHELL_IMAGE")]
    shell_image: Option<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Run Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum RunCommands {
    /// Queue a new run
    Submit {
        /// Agent key that executes the run (e.g., "echo")
        agent_key: String,

        /// User message; repeat for several
        #[arg(long, short = 'm')]
        message: Vec<String>,

        /// Raw JSON input, used instead of --message
        #[arg(long, conflicts_with = "message")]
        input: Option<String>,

        /// Conversation the run belongs to
        #[arg(long)]
        conversation: Option<Uuid>,

        #[arg(long)]
        max_attempts: Option<u32>,

        #[arg(long)]
        idempotency_key: Option<String>,

        /// Follow the run's events until it finishes
        #[arg(long)]
        wait: bool,
    },
    /// Get status of a run
    Status {
        run_id: Uuid,
    },
    /// Cancel a run
    Cancel {
        run_id: Uuid,
    },
    /// Print a run's events, following live ones until the run finishes
    Events {
        run_id: Uuid,

        /// Only events after this sequence number
        #[arg(long, default_value = "0")]
        since: u64,
    },
    /// List runs
    List {
        #[arg(long)]
        conversation: Option<Uuid>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConversationCommands {
    /// Create a conversation
    Create {
        agent_key: String,

        #[arg(long, default_value = "")]
        title: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct RunListItem {
    run_id: Uuid,
    agent_key: String,
    status: String,
    attempt: u32,
    max_attempts: u32,
    created_at: String,
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(runtime_args: RuntimeArgs, args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = runtime_args.to_config()?;
    let worker = WorkerConfig {
        worker_id: args.worker_id.clone(),
        processes: args.processes,
        concurrency: args.concurrency,
        agent_keys: parse_agent_keys(&args.agent_keys),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
    };
    worker.validate()?;

    if worker.processes > 1 {
        if config.queue_backend == QueueBackend::Memory {
            return Err("multi-process workers need a shared store, use --store sqlite:<path>".into());
        }
        return run_worker_processes(&worker).await;
    }

    let shell = match args.shell_image {
        Some(image) => ShellConfig::sandboxed(image),
        None => ShellConfig::default(),
    };
    let executors = ExecutorRegistry::new()
        .register("echo", EchoExecutor)
        .register("shell", ShellExecutor::new(shell));

    let runtime = Runtime::open(config)?;
    let dispatcher = Dispatcher::new(&runtime, executors, worker)?;
    let shutdown = install_shutdown_handler()?;
    dispatcher.run(shutdown).await?;
    Ok(())
}

/// Re-exec this binary once per process with `--processes 1` and wait for all of them.
///
/// Children run in their own process group, so a terminal Ctrl-C reaches only the
/// parent. The parent forwards one SIGTERM to each child on shutdown; each child then
/// drains on its own.
async fn run_worker_processes(worker: &WorkerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let exe = std::env::current_exe()?;
    let mut child_args: Vec<String> = std::env::args().skip(1).collect();
    strip_flag(&mut child_args, "--processes");
    child_args.extend(["--processes".to_string(), "1".to_string()]);

    let shutdown = install_shutdown_handler()?;
    tracing::info!(processes = worker.processes, exe = %exe.display(), "Spawning worker processes");
    let mut children = Vec::with_capacity(worker.processes);
    for index in 0..worker.processes {
        let child = tokio::process::Command::new(&exe)
            .args(&child_args)
            .env("AGENTQ_PROCESSES", "1")
            .env("AGENTQ_WORKER_ID", format!("{}-{}", worker.worker_id, index))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        children.push(child);
    }

    let failed = wait_for_workers(children, shutdown).await;
    if failed > 0 {
        return Err(format!("{} worker process(es) failed", failed).into());
    }
    Ok(())
}

/// Wait for every child, forwarding SIGTERM once `shutdown` fires. Returns how many
/// exited unsuccessfully.
async fn wait_for_workers(children: Vec<Child>, shutdown: CancellationToken) -> usize {
    let pids: Vec<u32> = children.iter().filter_map(Child::id).collect();
    let mut waits = JoinSet::new();
    for (index, mut child) in children.into_iter().enumerate() {
        waits.spawn(async move { (index, child.wait().await) });
    }

    let mut forwarded = false;
    let mut failed = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled(), if !forwarded => {
                forwarded = true;
                tracing::info!(processes = pids.len(), "Forwarding shutdown to worker processes");
                for pid in &pids {
                    forward_sigterm(*pid);
                }
            }
            joined = waits.join_next() => match joined {
                None => break,
                Some(Ok((_, Ok(status)))) if status.success() => {}
                Some(Ok((index, Ok(status)))) => {
                    tracing::warn!(index, status = %status, "Worker process exited with failure");
                    failed += 1;
                }
                Some(Ok((index, Err(e)))) => {
                    tracing::warn!(index, error = %e, "Failed to wait for worker process");
                    failed += 1;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Worker process watcher failed");
                    failed += 1;
                }
            },
        }
    }
    failed
}

fn forward_sigterm(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // ESRCH just means the child already exited
    if let Err(e) = kill(Pid::from_raw(raw), UnixSignal::SIGTERM) {
        tracing::debug!(pid, error = %e, "Could not signal worker process");
    }
}

/// Remove `flag` and its value (`--flag v` or `--flag=v`) from an argument list.
fn strip_flag(args: &mut Vec<String>, flag: &str) {
    let prefix = format!("{}=", flag);
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            let end = (i + 2).min(args.len());
            args.drain(i..end);
        } else if args[i].starts_with(&prefix) {
            args.remove(i);
        } else {
            i += 1;
        }
    }
}

// =============================================================================
// Run Command Handlers
// =============================================================================

fn print_run(run: &Run, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(run)?),
        OutputFormat::Table => {
            println!("Run ID:       {}", run.id);
            println!("Agent:        {}", run.agent_key);
            println!("Status:       {}", run.status);
            println!("Attempt:      {}/{}", run.attempt, run.max_attempts);
            if let Some(conversation_id) = run.conversation_id {
                println!("Conversation: {}", conversation_id);
            }
            if let Some(owner) = &run.lease_owner {
                println!("Lease Owner:  {}", owner);
            }
            if run.cancel_requested_at.is_some() {
                println!("Cancel:       requested");
            }
            if let Some(output) = &run.output {
                println!("Output:");
                for line in render_value(output).lines() {
                    println!("  {}", line);
                }
            }
            if let Some(error) = &run.error {
                println!("Error:        {} ({})", error.message, error.kind);
            }
        }
    }
    Ok(())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

async fn handle_run_submit(
    runtime: &Runtime,
    new: NewRun,
    wait: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let run = runtime.create_run(new).await?;
    if !wait {
        match output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run)?),
            OutputFormat::Table => {
                println!("Run submitted successfully!");
                println!("Run ID: {}", run.id);
            }
        }
        return Ok(());
    }

    handle_run_events(runtime, run.id, 0, output_format).await?;
    let finished = runtime.get_run(run.id).await?;
    print_run(&finished, output_format)
}

async fn handle_run_events(
    runtime: &Runtime,
    run_id: Uuid,
    since: u64,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = runtime.stream_events(run_id, since).await?;
    while let Some(event) = events.next().await {
        let event = event?;
        match output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
            OutputFormat::Table => println!(
                "{:>4}  {:<18} {}",
                event.seq,
                event.event_type,
                serde_json::to_string(&event.payload)?
            ),
        }
    }
    Ok(())
}

async fn handle_run_list(
    runtime: &Runtime,
    conversation: Option<Uuid>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let runs = runtime.list_runs(conversation).await?;
    match output_format {
        OutputFormat::Json => {
            let items: Vec<RunListItem> = runs
                .iter()
                .map(|run| RunListItem {
                    run_id: run.id,
                    agent_key: run.agent_key.clone(),
                    status: run.status.to_string(),
                    attempt: run.attempt,
                    max_attempts: run.max_attempts,
                    created_at: run.created_at.to_rfc3339(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Table => {
            if runs.is_empty() {
                println!("No runs found.");
                return Ok(());
            }
            println!("{:<38} {:<12} {:<10} {:<8}", "RUN ID", "AGENT", "STATUS", "ATTEMPT");
            println!("{}", "-".repeat(70));
            for run in &runs {
                println!(
                    "{:<38} {:<12} {:<10} {}/{}",
                    run.id, run.agent_key, run.status, run.attempt, run.max_attempts
                );
            }
            println!("\nTotal: {} runs", runs.len());
        }
    }
    Ok(())
}

fn build_new_run(
    agent_key: String,
    message: Vec<String>,
    input: Option<String>,
    conversation: Option<Uuid>,
    max_attempts: Option<u32>,
    idempotency_key: Option<String>,
) -> Result<NewRun, Box<dyn std::error::Error>> {
    let mut new = match input {
        Some(raw) => NewRun::new(agent_key, serde_json::from_str(&raw)?),
        None => {
            let messages: Vec<&str> = message.iter().map(String::as_str).collect();
            NewRun::from_messages(agent_key, &messages)
        }
    };
    if let Some(conversation_id) = conversation {
        new = new.in_conversation(conversation_id);
    }
    if let Some(max_attempts) = max_attempts {
        new = new.with_max_attempts(max_attempts);
    }
    if let Some(key) = idempotency_key {
        new = new.with_idempotency_key(key);
    }
    Ok(new)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Worker(worker_args) => {
            run_worker(args.runtime, worker_args).await?;
        }
        Commands::Run { output, command } => {
            let runtime = Runtime::open(args.runtime.to_config()?)?;

            match command {
                RunCommands::Submit {
                    agent_key,
                    message,
                    input,
                    conversation,
                    max_attempts,
                    idempotency_key,
                    wait,
                } => {
                    let new = build_new_run(
                        agent_key,
                        message,
                        input,
                        conversation,
                        max_attempts,
                        idempotency_key,
                    )?;
                    handle_run_submit(&runtime, new, wait, &output).await?;
                }
                RunCommands::Status { run_id } => {
                    let run = runtime.get_run(run_id).await?;
                    print_run(&run, &output)?;
                }
                RunCommands::Cancel { run_id } => {
                    let run = runtime.cancel_run(run_id).await?;
                    print_run(&run, &output)?;
                }
                RunCommands::Events { run_id, since } => {
                    handle_run_events(&runtime, run_id, since, &output).await?;
                }
                RunCommands::List { conversation } => {
                    handle_run_list(&runtime, conversation, &output).await?;
                }
            }
        }
        Commands::Conversation { output, command } => {
            let runtime = Runtime::open(args.runtime.to_config()?)?;

            match command {
                ConversationCommands::Create { agent_key, title } => {
                    let conversation = runtime.create_conversation(agent_key, title).await?;
                    match output {
                        OutputFormat::Json => {
                            println!("{}", serde_json::to_string_pretty(&conversation)?)
                        }
                        OutputFormat::Table => println!("Conversation ID: {}", conversation.id),
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_is_forwarded_to_worker_processes() {
        let children = vec![
            sh("trap 'exit 0' TERM; while true; do sleep 0.05; done"),
            sh("trap 'exit 0' TERM; while true; do sleep 0.05; done"),
        ];
        // let the traps install
        tokio::time::sleep(Duration::from_millis(200)).await;

        let shutdown = CancellationToken::new();
        let waiting = tokio::spawn(wait_for_workers(children, shutdown.clone()));
        shutdown.cancel();

        let failed = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .expect("worker processes ignored shutdown")
            .unwrap();
        assert_eq!(failed, 0);
    }

    #[tokio::test]
    async fn test_failed_worker_processes_are_counted() {
        let children = vec![sh("exit 0"), sh("exit 3")];
        let failed = wait_for_workers(children, CancellationToken::new()).await;
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_strip_flag_removes_both_forms() {
        let mut args: Vec<String> = ["worker", "--processes", "4", "--concurrency=2", "--processes=3"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        strip_flag(&mut args, "--processes");
        assert_eq!(args, ["worker", "--concurrency=2"]);
    }

    #[test]
    fn test_cli_parses_worker_flags() {
        let args = Args::try_parse_from([
            "agentq",
            "--store",
            "memory",
            "worker",
            "--concurrency",
            "4",
            "--agent-keys",
            "echo,shell",
        ])
        .unwrap();
        assert_eq!(args.runtime.store, "memory");
        match args.command {
            Commands::Worker(worker) => {
                assert_eq!(worker.concurrency, 4);
                assert_eq!(parse_agent_keys(&worker.agent_keys), ["echo", "shell"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_runtime_args_build_validated_config() {
        let args = Args::try_parse_from([
            "agentq",
            "--store",
            "sqlite:/tmp/q.db",
            "--lease-ttl-secs",
            "6",
            "run",
            "list",
        ])
        .unwrap();
        let config = args.runtime.to_config().unwrap();
        assert_eq!(config.lease_ttl, Duration::from_secs(6));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.event_bus_backend, EventBusBackend::Polling);
    }
}
