//! Scheduler: admission control and concurrency limiting for runs.
//!
//! Grounded in the reference scheduler's semaphore-based admission pattern
//! (`concurrency_semaphore`, `DEFAULT_MAX_CONCURRENT_RUNS`), simplified to
//! match this crate's single `AgentLoop::run` unit of work instead of a
//! multi-phase step pipeline, and extended with the per-workspace cap
//! (Section 4.A).

use crate::agent_loop::AgentLoop;
use crate::planner::LlmProvider;
use loop_core::Id;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Default maximum concurrent runs.
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 3;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler shutdown")]
    Shutdown,
    #[error("workspace at capacity: {0}")]
    WorkspaceAtCapacity(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Bounds how many runs execute concurrently, globally and per workspace.
pub struct Scheduler<P: LlmProvider + Send + Sync + 'static> {
    agent_loop: Arc<AgentLoop<P>>,
    semaphore: Arc<Semaphore>,
    max_runs_per_workspace: Option<usize>,
    workspace_counts: Mutex<HashMap<String, usize>>,
    active_runs: AtomicUsize,
    shutdown: std::sync::atomic::AtomicBool,
}

impl<P: LlmProvider + Send + Sync + 'static> Scheduler<P> {
    pub fn new(agent_loop: Arc<AgentLoop<P>>, max_concurrent: usize, max_runs_per_workspace: Option<usize>) -> Self {
        Self {
            agent_loop,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            max_runs_per_workspace,
            workspace_counts: Mutex::new(HashMap::new()),
            active_runs: AtomicUsize::new(0),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn with_defaults(agent_loop: Arc<AgentLoop<P>>) -> Self {
        Self::new(agent_loop, DEFAULT_MAX_CONCURRENT_RUNS, None)
    }

    pub fn active_run_count(&self) -> usize {
        self.active_runs.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Spawn a previously-persisted run, enforcing the global semaphore and
    /// the optional per-workspace cap. Returns immediately; the run
    /// executes on a background task.
    pub fn spawn(self: &Arc<Self>, run_id: Id, workspace: String) -> Result<()> {
        if self.is_shutdown() {
            return Err(SchedulerError::Shutdown);
        }
        if let Some(cap) = self.max_runs_per_workspace {
            let mut counts = self.workspace_counts.lock().unwrap();
            let current = counts.get(&workspace).copied().unwrap_or(0);
            if current >= cap {
                warn!(%workspace, cap, "run blocked by per-workspace cap");
                return Err(SchedulerError::WorkspaceAtCapacity(workspace));
            }
            *counts.entry(workspace.clone()).or_insert(0) += 1;
        }

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let permit = match scheduler.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            scheduler.active_runs.fetch_add(1, Ordering::SeqCst);
            info!(run_id = %run_id, "run started");

            scheduler.agent_loop.run(run_id.clone()).await;

            scheduler.active_runs.fetch_sub(1, Ordering::SeqCst);
            if scheduler.max_runs_per_workspace.is_some() {
                let mut counts = scheduler.workspace_counts.lock().unwrap();
                if let Some(count) = counts.get_mut(&workspace) {
                    *count = count.saturating_sub(1);
                }
            }
            drop(permit);
            info!(run_id = %run_id, "run finished");
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_loop::LoopConfig;
    use crate::planner::LlmResponse;
    use crate::sandbox::SandboxConfig;
    use crate::store::RunStore;
    use async_trait::async_trait;
    use loop_core::error::PlannerError;
    use loop_core::TokenUsage;
    use tempfile::tempdir;

    struct ImmediateDoneProvider;

    #[async_trait]
    impl LlmProvider for ImmediateDoneProvider {
        async fn complete(&self, _system: &str, _user: &str) -> std::result::Result<LlmResponse, PlannerError> {
            Ok(LlmResponse {
                text: r#"{"done": true, "final_output": "ok"}"#.to_string(),
                token_usage: TokenUsage::default(),
            })
        }
    }

    fn make_agent_loop(runs_dir: &std::path::Path, workspace: &std::path::Path) -> Arc<AgentLoop<ImmediateDoneProvider>> {
        let store = Arc::new(RunStore::new(runs_dir).unwrap());
        let sandbox_config = SandboxConfig {
            workspace: workspace.to_path_buf(),
            safe_commands: vec![],
            exec_timeout_sec: 5,
            exec_runtime: loop_core::ExecRuntime::Host,
            exec_container_lifecycle: loop_core::ContainerLifecycle::PerAction,
            exec_container_image: "n/a".to_string(),
            exec_container_network: "none".to_string(),
            exec_container_cpus: 1.0,
            exec_container_memory: "512m".to_string(),
            exec_container_pids_limit: 64,
            exec_container_env_vars: vec![],
            max_action_output_chars: 4000,
            web_fetch_tls_verify: true,
            run_id: Id::from_string("sched-test"),
        };
        let loop_config = LoopConfig {
            max_iters: 5,
            run_max_wall_time_sec: 60,
            no_progress_repeat_threshold: 3,
            max_previous_output_chars: 4000,
            planner_retry_max_attempts: 2,
        };
        Arc::new(AgentLoop::new(store, sandbox_config, ImmediateDoneProvider, loop_config))
    }

    #[tokio::test]
    async fn spawn_runs_an_unknown_run_without_panicking() {
        let runs_dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let agent_loop = make_agent_loop(runs_dir.path(), workspace.path());
        let scheduler = Arc::new(Scheduler::new(agent_loop, 2, None));

        scheduler.spawn(Id::new(), workspace.path().to_string_lossy().to_string()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(scheduler.active_run_count(), 0);
    }

    #[tokio::test]
    async fn spawn_rejects_when_shutdown() {
        let runs_dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let agent_loop = make_agent_loop(runs_dir.path(), workspace.path());
        let scheduler = Arc::new(Scheduler::new(agent_loop, 2, None));
        scheduler.shutdown();

        let err = scheduler.spawn(Id::new(), workspace.path().to_string_lossy().to_string()).unwrap_err();
        assert!(matches!(err, SchedulerError::Shutdown));
    }

    #[tokio::test]
    async fn spawn_enforces_workspace_cap() {
        let runs_dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let agent_loop = make_agent_loop(runs_dir.path(), workspace.path());
        let scheduler = Arc::new(Scheduler::new(agent_loop, 4, Some(1)));
        let ws = workspace.path().to_string_lossy().to_string();

        scheduler.spawn(Id::new(), ws.clone()).unwrap();
        let err = scheduler.spawn(Id::new(), ws.clone()).unwrap_err();
        assert!(matches!(err, SchedulerError::WorkspaceAtCapacity(_)));
    }
}
