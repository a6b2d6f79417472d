//! loopd - autonomous agent loop daemon
//!
//! Main entry point for the daemon binary.

use clap::Parser;
use loop_core::Config;
use loopd::{Daemon, DaemonConfig};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "loopd", about = "Autonomous agent loop daemon")]
struct Args {
    /// Path to a key=value config file. Defaults are used for anything it
    /// doesn't set, then `AGENTLOOP_`-prefixed env vars override both.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible chat completions endpoint.
    #[arg(long, env = "AGENTLOOP_LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    llm_base_url: String,

    /// API key for the LLM provider, if required.
    #[arg(long, env = "AGENTLOOP_LLM_API_KEY")]
    llm_api_key: Option<String>,
}

fn main() {
    fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Err(e) = config.apply_env() {
        error!("invalid environment configuration: {e}");
        std::process::exit(1);
    }
    let workspace = config.workspace.clone();
    config.resolve_paths(&workspace);

    let daemon_config = DaemonConfig { config, llm_base_url: args.llm_base_url, llm_api_key: args.llm_api_key };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(daemon_config).await {
            Ok(daemon) => {
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {e}");
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        daemon.shutdown();
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        }
    });
}
