use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use renderq::config::{DependFailurePolicy, SchedulerConfig};
use renderq::protocol::{Event, Response};
use renderq::scheduler::{JobId, JobSpec, Scheduler};
use renderq::server::{Server, ServerHandle};
use renderq::shutdown::install_shutdown_handler;
use renderq::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "renderq")]
#[command(version)]
#[command(about = "A render-farm job scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler, reading newline-delimited JSON requests from stdin
    /// and writing one JSON response per line to stdout
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Seconds without a heartbeat before a render is marked offline
    #[arg(long, default_value = "30")]
    render_timeout: i64,

    /// Refresh sweep period in milliseconds
    #[arg(long, default_value = "1000")]
    refresh_interval_ms: u64,

    /// Maximum number of live jobs
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Refuse new jobs once live state weighs this many bytes
    #[arg(long)]
    max_weight: Option<usize>,

    /// What dependents do when a dependency fails: "hold" or "cascade"
    #[arg(long, default_value = "hold")]
    depend_failure: DependFailurePolicy,

    /// Fraction of terminally failed tasks that makes a job fail
    #[arg(long, default_value = "1.0")]
    job_error_fraction: f32,
}

impl ServeArgs {
    fn into_config(self) -> SchedulerConfig {
        let mut config = SchedulerConfig::default()
            .with_render_timeout(self.render_timeout)
            .with_max_jobs(self.max_jobs)
            .with_depend_failure(self.depend_failure)
            .with_job_error_fraction(self.job_error_fraction);
        config.refresh_interval_ms = self.refresh_interval_ms;
        if let Some(bytes) = self.max_weight {
            config = config.with_max_weight(bytes);
        }
        config
    }
}

/// Requests the line driver answers itself, next to the scheduler events.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Command {
    SubmitJob(JobSpec),
    DeleteJob { job_id: JobId },
    PauseJob { job_id: JobId },
    StartJob { job_id: JobId },
    SkipJob { job_id: JobId },
    RestartErrors { job_id: JobId },
    ListJobs,
    ListUsers,
    ListRenders,
    Weight,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Line {
    Command(Command),
    Event(Event),
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum Reply {
    JobSubmitted { job_id: JobId },
    Data { data: serde_json::Value },
    Error { reason: String },
}

async fn run_command(scheduler: &Scheduler, command: Command) -> Result<serde_json::Value, String> {
    let now = Utc::now();
    let ack = || json(&Response::Ack);
    let result = match command {
        Command::SubmitJob(spec) => scheduler
            .add_job(spec, now)
            .await
            .map(|job_id| json(&Reply::JobSubmitted { job_id })),
        Command::DeleteJob { job_id } => scheduler.delete_job(job_id, now).await.map(|_| ack()),
        Command::PauseJob { job_id } => scheduler.pause_job(job_id, now).await.map(|_| ack()),
        Command::StartJob { job_id } => scheduler.start_job(job_id, now).await.map(|_| ack()),
        Command::SkipJob { job_id } => scheduler.skip_job(job_id, now).await.map(|executions| {
            if executions.is_empty() {
                ack()
            } else {
                json(&Response::Stop { executions })
            }
        }),
        Command::RestartErrors { job_id } => scheduler
            .restart_error_tasks(job_id, now)
            .await
            .map(|_| ack()),
        Command::ListJobs => Ok(data(&scheduler.job_summaries().await)),
        Command::ListUsers => Ok(data(&scheduler.users().await)),
        Command::ListRenders => Ok(data(&scheduler.renders().await)),
        Command::Weight => Ok(data(&scheduler.total_weight().await)),
    };
    result.map_err(|e| e.to_string())
}

fn json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn data<T: Serialize>(value: &T) -> serde_json::Value {
    json(&Reply::Data { data: json(value) })
}

async fn handle_line(scheduler: &Scheduler, handle: &ServerHandle, line: &str) -> serde_json::Value {
    match serde_json::from_str::<Line>(line) {
        Ok(Line::Command(command)) => match run_command(scheduler, command).await {
            Ok(value) => value,
            Err(reason) => json(&Reply::Error { reason }),
        },
        Ok(Line::Event(event)) => match handle.call(event).await {
            Some(response) => json(&response),
            None => json(&Reply::Error {
                reason: "server stopped".to_string(),
            }),
        },
        Err(e) => json(&Reply::Error {
            reason: format!("invalid request: {}", e),
        }),
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config();
    tracing::info!(
        render_timeout = config.render_timeout_secs,
        max_jobs = config.max_jobs,
        depend_failure = ?config.depend_failure,
        "Starting renderq"
    );

    let scheduler = Arc::new(Scheduler::new(config, Arc::new(MemoryStore::new())));
    scheduler.restore(Utc::now()).await?;

    let shutdown = install_shutdown_handler()?;
    let (server, handle) = Server::new(scheduler.clone());
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    let mut notices = scheduler.subscribe_notices();
    let notice_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notice_shutdown.cancelled() => break,
                notice = notices.recv() => match notice {
                    Ok(n) => tracing::info!(address = %n.address, task = %n.pos, state = ?n.state, "Listener notice"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Listener notices dropped");
                    }
                    Err(_) => break,
                },
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&scheduler, &handle, &line).await;
        stdout.write_all(format!("{}\n", reply).as_bytes()).await?;
        stdout.flush().await?;
    }

    shutdown.cancel();
    drop(handle);
    server_task.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Serve(args) => run_server(args).await,
    }
}
