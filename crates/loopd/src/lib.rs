//! loopd - autonomous agent loop daemon
//!
//! Library components for the daemon process (Section 2, Section 6).

pub mod agent_loop;
pub mod planner;
pub mod provider;
pub mod sandbox;
pub mod scheduler;
pub mod server;
pub mod store;

use agent_loop::{AgentLoop, LoopConfig};
use loop_core::Config;
use provider::OpenAiCompatibleProvider;
use sandbox::SandboxConfig;
use scheduler::Scheduler;
use std::sync::Arc;
use store::RunStore;
use tracing::{info, warn};

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Daemon configuration, derived from `loop_core::Config` plus the handful
/// of process-level settings `Config` doesn't cover.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub config: Config,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
}

/// Owns the durable store, the bounded-capability executor configuration,
/// the scheduler, and the HTTP surface.
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<RunStore>,
    scheduler: Arc<Scheduler<OpenAiCompatibleProvider>>,
}

impl Daemon {
    pub async fn new(config: DaemonConfig) -> AppResult<Self> {
        let store = Arc::new(RunStore::new(&config.config.runs_dir)?);

        let sandbox_config = SandboxConfig {
            workspace: config.config.workspace.clone(),
            safe_commands: config.config.safe_commands.clone(),
            exec_timeout_sec: config.config.exec_timeout_sec,
            exec_runtime: config.config.exec_runtime,
            exec_container_lifecycle: config.config.exec_container_lifecycle,
            exec_container_image: config.config.exec_container_image.clone(),
            exec_container_network: config.config.exec_container_network.clone(),
            exec_container_cpus: config.config.exec_container_cpus,
            exec_container_memory: config.config.exec_container_memory.clone(),
            exec_container_pids_limit: config.config.exec_container_pids_limit,
            exec_container_env_vars: config.config.exec_container_env_vars.clone(),
            max_action_output_chars: config.config.max_action_output_chars,
            web_fetch_tls_verify: config.config.web_fetch_tls_verify,
            run_id: loop_core::Id::from_string("daemon"),
        };

        let provider = OpenAiCompatibleProvider::new(
            config.llm_base_url.clone(),
            config.llm_api_key.clone(),
            config.config.model.clone(),
        );

        let loop_config = LoopConfig {
            max_iters: config.config.max_iters,
            run_max_wall_time_sec: config.config.run_max_wall_time_sec,
            no_progress_repeat_threshold: config.config.no_progress_repeat_threshold,
            max_previous_output_chars: config.config.max_previous_output_chars,
            planner_retry_max_attempts: config.config.planner_retry_max_attempts,
        };

        let agent_loop = Arc::new(AgentLoop::new(Arc::clone(&store), sandbox_config, provider, loop_config));
        let scheduler = Arc::new(Scheduler::new(
            agent_loop,
            config.config.max_concurrent_runs,
            config.config.max_runs_per_workspace,
        ));

        Ok(Self { config, store, scheduler })
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<OpenAiCompatibleProvider>> {
        &self.scheduler
    }

    /// Re-spawn every run whose persisted status was still `Running` when
    /// the daemon last stopped.
    pub fn resume_interrupted_runs(&self) -> AppResult<()> {
        for run_id in self.store.list_run_ids()? {
            let state = self.store.read_state(&run_id)?;
            if state.status == loop_core::RunStatus::Running {
                info!(run_id = %run_id, "resuming interrupted run");
                if let Err(err) = self.scheduler.spawn(run_id.clone(), state.workspace.clone()) {
                    warn!(run_id = %run_id, error = %err, "failed to resume run");
                }
            }
        }
        Ok(())
    }

    /// Run the daemon: resume interrupted runs, then serve the HTTP API
    /// until the process is asked to stop.
    pub async fn run(&self) -> AppResult<()> {
        info!(bind_addr = %self.config.config.bind_addr, "loopd starting");
        self.resume_interrupted_runs()?;
        server::serve(Arc::clone(&self.store), Arc::clone(&self.scheduler), &self.config.config).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.scheduler.shutdown();
    }
}
