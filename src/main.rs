use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use sharesync::config::AppConfig;
use sharesync::context::AppContext;
use sharesync::core::models::{Job, JobState};
use sharesync::core::transfer_engine::TransferEngineType;
use sharesync::logging::{self, LogConfig};
use sharesync::rpc::{RpcClient, RpcServer};
use sharesync::{adapters, db};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sharesync")]
#[command(about = "Queued copies from SMB shares", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon address for client commands (defaults to `rpc_bind`).
    #[arg(long, global = true)]
    rpc: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue and the RPC server in the foreground.
    Daemon(ServerArgs),
    Status,
    /// List jobs in queue order.
    Jobs {
        #[arg(long)]
        state: Option<JobState>,
    },
    /// Queue a copy of one or more source directories.
    Submit {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        #[arg(long, short)]
        destination: PathBuf,
        #[arg(long)]
        host: Option<String>,
        /// Copy tool argument; repeat for several. Replaces the configured defaults.
        #[arg(long = "arg", allow_hyphen_values = true)]
        tool_args: Vec<String>,
    },
    Cancel {
        id: String,
    },
    Retry {
        id: String,
    },
    /// Move the jobs at the given positions before position `--to`.
    Move {
        #[arg(required = true)]
        from: Vec<usize>,
        #[arg(long)]
        to: usize,
    },
    /// Remove completed, failed and cancelled jobs.
    Prune,
    Connect {
        host: String,
        #[arg(long, short, default_value = "")]
        username: String,
        #[arg(long, env = "SHARESYNC_PASSWORD", hide_env_values = true, default_value = "")]
        password: String,
        /// Save the credentials for later sessions.
        #[arg(long)]
        persist: bool,
    },
    /// Mount shares of the connected host (all when none are named).
    Mount {
        shares: Vec<String>,
    },
    Disconnect,
    Diagnose {
        host: String,
    },
    /// Print the merged configuration.
    Config(ServerArgs),
}

#[derive(Args, Serialize)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    mount_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    log_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    transfer_engine: Option<TransferEngineType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) | Commands::Config(args) => AppConfig::new(Some(args))?,
        _ => AppConfig::new(None::<&ServerArgs>)?,
    };

    match cli.command {
        Commands::Daemon(_) => {
            logging::init(LogConfig::from(&config));
            run_daemon(config).await.context("Daemon failed")?
        }
        Commands::Config(_) => print!("{}", toml::to_string_pretty(&config)?),
        command => {
            let client = RpcClient::new(cli.rpc.unwrap_or(config.rpc_bind));
            run_client(&client, command)
                .await
                .context("Request to daemon failed")?
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let conn = db::init(&config.database_path)
        .await
        .context("Failed to open job database")?;
    let stored = db::jobs::load_all(&conn)
        .await
        .context("Failed to load stored jobs")?;

    let adapter = adapters::get_adapter(&config);
    let ctx = AppContext::new(config, conn, adapter);

    let stop_persistence = CancellationToken::new();
    let persistence =
        db::persist::spawn(ctx.db.clone(), ctx.queue.clone(), stop_persistence.clone());
    info!(jobs = stored.len(), "Restoring job queue");
    ctx.queue.restore(stored);

    let server = RpcServer::bind(ctx.clone(), ctx.config.rpc_bind)
        .await
        .context("Failed to bind RPC server")?;

    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    server.shutdown();
    ctx.queue.shutdown().await;
    for failure in ctx.session.disconnect().await {
        warn!(error = %failure, "Share left mounted");
    }

    stop_persistence.cancel();
    persistence.await?;
    info!("Daemon stopped");
    Ok(())
}

async fn run_client(client: &RpcClient, command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            let status: Value = client.call_no_params("daemon.status").await?;
            print_json(&status)?;
        }
        Commands::Jobs { state } => {
            let params = state.map(|s| json!({ "state": s }));
            let jobs: Vec<Job> = client.call("jobs.list", params).await?;
            print_jobs(&jobs);
        }
        Commands::Submit {
            sources,
            destination,
            host,
            tool_args,
        } => {
            let mut params = json!({ "sources": sources, "destination": destination, "host": host });
            if !tool_args.is_empty() {
                params["tool_args"] = json!(tool_args);
            }
            let job: Job = client.call("jobs.submit", Some(params)).await?;
            println!("{} {}", job.id, job.status_message());
        }
        Commands::Cancel { id } => {
            let result: Value = client.call("jobs.cancel", Some(json!({ "id": id }))).await?;
            match result["state"].as_str() {
                Some("running") => println!("{} stopping", id),
                Some(state) => println!("{} {}", id, state),
                None => print_json(&result)?,
            }
        }
        Commands::Retry { id } => {
            let job: Job = client.call("jobs.retry", Some(json!({ "id": id }))).await?;
            println!("{} {}", job.id, job.status_message());
        }
        Commands::Move { from, to } => {
            let order: Vec<String> = client
                .call("jobs.reorder", Some(json!({ "from": from, "to": to })))
                .await?;
            for (position, id) in order.iter().enumerate() {
                println!("{:>3}  {}", position, id);
            }
        }
        Commands::Prune => {
            let removed: Vec<String> = client.call_no_params("jobs.prune").await?;
            println!("Removed {} job(s)", removed.len());
        }
        Commands::Connect {
            host,
            username,
            password,
            persist,
        } => {
            let params = json!({
                "host": host,
                "username": username,
                "secret": password,
                "persist": persist,
            });
            let outcome: Value = client.call("remote.connect", Some(params)).await?;
            print_json(&outcome)?;
        }
        Commands::Mount { shares } => {
            let paths: Vec<PathBuf> = client
                .call("remote.mount", Some(json!({ "shares": shares })))
                .await?;
            for path in paths {
                println!("{}", path.display());
            }
        }
        Commands::Disconnect => {
            let failures: Vec<String> = client.call_no_params("remote.disconnect").await?;
            for failure in &failures {
                eprintln!("{}", failure);
            }
        }
        Commands::Diagnose { host } => {
            let report: Value = client
                .call("remote.diagnose", Some(json!({ "host": host })))
                .await?;
            print_json(&report)?;
        }
        Commands::Daemon(_) | Commands::Config(_) => {}
    }

    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }
    for (position, job) in jobs.iter().enumerate() {
        let sources: Vec<String> = job
            .inputs
            .sources
            .iter()
            .map(|s| s.display().to_string())
            .collect();
        println!(
            "{:>3}  {}  {:<9}  {:>4.0}%  {} -> {}",
            position,
            job.id,
            job.state.as_str(),
            job.progress * 100.0,
            sources.join(", "),
            job.inputs.destination.display()
        );
        if let Some(error) = &job.error {
            println!("       {}", error);
        }
    }
}
