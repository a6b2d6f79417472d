//! loopctl - CLI client for loopd
//!
//! Local control plane client for the agent loop daemon (Section 6.1).

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI client for the loopd agent loop daemon.
#[derive(Parser)]
#[command(name = "loopctl")]
#[command(about = "Control plane for loopd agent loop daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:4170)
    #[arg(long, global = true, env = "LOOPD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "LOOPD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a new task to run
    Submit {
        /// Natural-language task for the agent loop to perform
        task: String,

        /// Workspace directory the run is confined to
        #[arg(long)]
        workspace: String,

        /// LLM provider label
        #[arg(long)]
        provider: Option<String>,

        /// Model name
        #[arg(long)]
        model: Option<String>,

        /// Maximum iterations before the run gives up
        #[arg(long)]
        max_iters: Option<u32>,
    },

    /// List known runs
    List,

    /// Show detailed information about a run
    Inspect {
        /// Run ID
        run_id: String,
    },

    /// Cancel a run
    Cancel {
        /// Run ID
        run_id: String,
    },

    /// Stream a run's event log
    Tail {
        /// Run ID
        run_id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli.addr.unwrap_or_else(|| "http://127.0.0.1:4170".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.wait_for_ready().await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Submit { task, workspace, provider, model, max_iters } => {
            run_submit(&client, task, workspace, provider, model, max_iters).await
        }
        Command::List => run_list(&client).await,
        Command::Inspect { run_id } => run_inspect(&client, &run_id).await,
        Command::Cancel { run_id } => run_cancel(&client, &run_id).await,
        Command::Tail { run_id } => run_tail(&client, &run_id).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_submit(
    client: &Client,
    task: String,
    workspace: String,
    provider: Option<String>,
    model: Option<String>,
    max_iters: Option<u32>,
) -> Result<(), ClientError> {
    let req = client::CreateRunRequest { task, workspace, provider, model, max_iters };
    let run_id = client.create_run(req).await?;
    render::print_run_created(&run_id);
    Ok(())
}

async fn run_list(client: &Client) -> Result<(), ClientError> {
    let runs = client.list_runs().await?;
    render::print_run_list(&runs);
    Ok(())
}

async fn run_inspect(client: &Client, run_id: &str) -> Result<(), ClientError> {
    let run = client.get_run(run_id).await?;
    let iterations = client.list_iterations(run_id).await?;
    render::print_run_details(&run, &iterations);
    Ok(())
}

async fn run_cancel(client: &Client, run_id: &str) -> Result<(), ClientError> {
    client.cancel_run(run_id).await?;
    println!("Run {} canceled", run_id);
    Ok(())
}

async fn run_tail(client: &Client, run_id: &str) -> Result<(), ClientError> {
    client.stream_events(run_id).await
}
