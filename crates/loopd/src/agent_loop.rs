//! `AgentLoop`: orchestrates the iterative plan-execute-validate cycle
//! (Section 4.E).
//!
//! Grounded in the reference `AgentLoopRunner._run_loop`, with no-progress
//! detection folded in directly (Section 4.E step 10, grounded in the
//! teacher's `Watchdog::detect_signals` repeated-signature idea, simplified
//! to the three triggers the design calls out: repeated action signature,
//! repeated capability-block error, and a parser-error streak).

use crate::planner::{LlmProvider, Planner, PlannerContext};
use crate::sandbox::{ActionSandbox, SandboxConfig};
use crate::store::RunStore;
use loop_core::error::ValidationError;
use loop_core::validator::TaskContractParser;
use loop_core::{snapshot_workspace_file, ActionResult, Id, IterationRecord, RunState, RunStatus, StopReason};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Recursively list every file under `dir`. Missing/unreadable directories
/// yield an empty set rather than an error (Section 4.E step 7).
fn list_files_recursive(dir: &Path) -> HashSet<PathBuf> {
    let mut out = HashSet::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.is_file() {
                out.insert(path);
            }
        }
    }
    out
}

/// Normalize a planner-supplied relative path the same way the task
/// contract's own candidates are normalized, so the two can be compared.
fn normalize_rel_path(raw: &str) -> String {
    let mut value = raw.trim().replace('\\', "/");
    if let Some(rest) = value.strip_prefix("./") {
        value = rest.to_string();
    }
    value
}

/// Tunables for one run's loop (Section 6, Section 4.E).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iters: u32,
    pub run_max_wall_time_sec: u64,
    pub no_progress_repeat_threshold: u32,
    pub max_previous_output_chars: usize,
    pub planner_retry_max_attempts: u32,
}

/// Orchestrates a single run from `Running` to a terminal status.
pub struct AgentLoop<P: LlmProvider> {
    store: Arc<RunStore>,
    sandbox: ActionSandbox,
    planner: Planner<P>,
    config: LoopConfig,
    validator: TaskContractParser,
}

impl<P: LlmProvider> AgentLoop<P> {
    pub fn new(
        store: Arc<RunStore>,
        sandbox_config: SandboxConfig,
        provider: P,
        config: LoopConfig,
    ) -> Self {
        let planner = Planner::new(provider, config.max_previous_output_chars, config.planner_retry_max_attempts);
        Self {
            store,
            sandbox: ActionSandbox::new(sandbox_config),
            planner,
            config,
            validator: TaskContractParser::new(),
        }
    }

    /// Create and persist a fresh `RunState`, then run it to completion.
    pub async fn start_run(
        &self,
        task: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        workspace: impl Into<String>,
        skills_dir: impl Into<String>,
        max_iters: u32,
    ) -> Result<Id, loop_core::error::StoreError> {
        let run_id = Id::new();
        let state = RunState::new(run_id.clone(), task, provider, model, workspace, skills_dir, max_iters);
        self.store.init_run(&state)?;
        self.run(run_id.clone()).await;
        Ok(run_id)
    }

    /// Run a previously-prepared run to completion (Section 4.E).
    pub async fn run(&self, run_id: Id) {
        let start = Instant::now();
        let mut action_signatures: Vec<String> = Vec::new();
        let mut blocked_error_streak: u32 = 0;
        let mut parse_error_streak: u32 = 0;

        loop {
            let Ok(mut state) = self.store.read_state(&run_id) else {
                return;
            };
            if state.is_terminal() {
                return;
            }
            if state.cancel_requested {
                self.finish(&mut state, RunStatus::Canceled, StopReason::Canceled, loop_core::events::stopped_cancel_request());
                return;
            }
            if start.elapsed() > Duration::from_secs(self.config.run_max_wall_time_sec) {
                self.finish(&mut state, RunStatus::Failed, StopReason::NoProgress, loop_core::events::stopped_wall_time_limit());
                return;
            }

            let previous_output = state.last_output.clone();
            let ctx = PlannerContext {
                task: state.task.clone(),
                iteration: state.iteration + 1,
                max_iters: state.max_iters,
                previous_output,
                skill_context: String::new(),
            };

            let (plan, token_usage, unknown_validation_kinds) = match self.planner.build_plan(&ctx).await {
                Ok(result) => result,
                Err(_) => {
                    self.finish(&mut state, RunStatus::Failed, StopReason::Error, "planner retries exhausted".to_string());
                    return;
                }
            };
            for kind in &unknown_validation_kinds {
                let _ = self.store.log_event(&run_id, &loop_core::events::unknown_validation_kind(kind));
            }

            let is_parse_error = plan.final_output.starts_with("planner_parse_error:");
            parse_error_streak = if is_parse_error { parse_error_streak + 1 } else { 0 };

            let contract = self.validator.parse(&state.task);
            let workspace = Path::new(&state.workspace);
            let pre_existing_hinted: Vec<(PathBuf, HashSet<PathBuf>)> = contract
                .hinted_directories
                .iter()
                .map(|dir| {
                    let abs = workspace.join(dir);
                    let existing = list_files_recursive(&abs);
                    (abs, existing)
                })
                .collect();

            let mut action_results = Vec::new();
            let mut signature_parts = Vec::new();
            let mut had_blocked_error = false;
            let mut newly_written: HashSet<String> = HashSet::new();
            for action in &plan.actions {
                let result = self.sandbox.execute(&action.name, &action.params).await;
                signature_parts.push(format!("{}:{}", action.name, serde_json::to_string(&action.params).unwrap_or_default()));
                if !result.ok {
                    if let Some(err) = &result.error {
                        if err.contains("not allowlisted") || err.contains("escapes") || err.contains("Blocked") {
                            had_blocked_error = true;
                        }
                    }
                }
                self.snapshot_if_write_action(&state, &action.name, &action.params, &result, &mut newly_written).await;
                if action.name == "run_python_code" && result.ok {
                    self.snapshot_new_files_in_hinted_dirs(&state, &pre_existing_hinted, &mut newly_written).await;
                }
                action_results.push(result);
            }

            blocked_error_streak = if had_blocked_error { blocked_error_streak + 1 } else { 0 };
            let signature = signature_parts.join("|");
            action_signatures.push(signature);
            if action_signatures.len() > self.config.no_progress_repeat_threshold as usize {
                action_signatures.remove(0);
            }

            let output = Self::compose_output(&plan.final_output, &action_results);
            let current_iteration_failed = action_results.iter().any(|r| !r.ok);

            let eval_result =
                self.evaluate_objective(&state, &contract, &plan, &action_results, current_iteration_failed, &newly_written);
            let accepted = eval_result.is_ok();
            if accepted && !plan.done {
                let _ = self.store.log_event(&run_id, &loop_core::events::auto_completed_from_inferred_validations());
            }

            state.iteration += 1;
            state.last_output = match &eval_result {
                Ok(()) => output.clone(),
                Err(err) => err.to_string(),
            };
            state.updated_at = chrono::Utc::now();

            let record = IterationRecord {
                run_id: run_id.clone(),
                iteration: state.iteration,
                timestamp: chrono::Utc::now(),
                prompt: ctx.task.clone(),
                plan: serde_json::to_value(&plan).unwrap_or_default(),
                actions: plan.actions.iter().map(|a| serde_json::json!({"name": a.name, "params": a.params})).collect(),
                action_results: action_results.clone(),
                output: output.clone(),
                done: accepted,
                error: if current_iteration_failed { Some("one or more actions failed".to_string()) } else { None },
                token_usage,
            };
            let _ = self.store.append_iteration(&record);
            let _ = self.store.log_event(&run_id, &loop_core::events::iteration_summary(state.iteration, accepted));

            if accepted {
                self.finish(&mut state, RunStatus::Completed, StopReason::Completed, String::new());
                return;
            }

            let repeated_signature = action_signatures.len() == self.config.no_progress_repeat_threshold as usize
                && action_signatures.iter().all(|s| s == &action_signatures[0])
                && !action_signatures[0].is_empty();
            if repeated_signature
                || blocked_error_streak >= self.config.no_progress_repeat_threshold
                || parse_error_streak >= self.config.no_progress_repeat_threshold
            {
                self.finish(&mut state, RunStatus::Failed, StopReason::NoProgress, loop_core::events::stopped_no_progress());
                return;
            }

            if state.iteration >= state.max_iters {
                self.finish(&mut state, RunStatus::Failed, StopReason::MaxIters, loop_core::events::stopped_max_iters());
                return;
            }

            let _ = self.store.write_state(&state);
        }
    }

    fn finish(&self, state: &mut RunState, status: RunStatus, reason: StopReason, event: String) {
        state.status = status;
        state.stop_reason = Some(reason);
        state.updated_at = chrono::Utc::now();
        let _ = self.store.write_state(state);
        if !event.is_empty() {
            let _ = self.store.log_event(&state.run_id, &event);
        }
    }

    /// Compose the per-iteration output string (Section 4.E "Per-iteration
    /// output composition").
    fn compose_output(final_output: &str, action_results: &[ActionResult]) -> String {
        if !final_output.is_empty() {
            return final_output.to_string();
        }
        if action_results.is_empty() {
            return String::new();
        }
        action_results
            .iter()
            .map(|r| {
                let mut section = format!("[{}] ok={}\n{}", r.name, r.ok, r.output);
                if let Some(err) = &r.error {
                    section.push_str(&format!("\nerror={err}"));
                }
                section.trim().to_string()
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    async fn snapshot_if_write_action(
        &self,
        state: &RunState,
        action_name: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        result: &ActionResult,
        newly_written: &mut HashSet<String>,
    ) {
        if action_name != "write_workspace_file" && action_name != "write_file" {
            return;
        }
        if !result.ok {
            return;
        }
        let Some(rel_path) = params.get("path").or_else(|| params.get("file_path")).and_then(|v| v.as_str()) else {
            return;
        };
        let workspace = Path::new(&state.workspace);
        let run_dir = self.store.run_dir(&state.run_id);
        match snapshot_workspace_file(workspace, &run_dir, &state.run_id, rel_path) {
            Ok(_) => {
                let _ = self.store.log_event(&state.run_id, &loop_core::events::artifact_saved(rel_path));
            }
            Err(err) => {
                let _ = self.store.log_event(&state.run_id, &loop_core::events::artifact_snapshot_failed(&err.to_string()));
            }
        }
        newly_written.insert(normalize_rel_path(rel_path));
    }

    /// Snapshot files that appeared under a task's hinted output directories
    /// as a side effect of `run_python_code` (Section 4.E step 7).
    async fn snapshot_new_files_in_hinted_dirs(
        &self,
        state: &RunState,
        pre_existing: &[(PathBuf, HashSet<PathBuf>)],
        newly_written: &mut HashSet<String>,
    ) {
        let workspace = Path::new(&state.workspace);
        let run_dir = self.store.run_dir(&state.run_id);
        for (abs_dir, before) in pre_existing {
            for path in list_files_recursive(abs_dir).difference(before) {
                let Ok(rel) = path.strip_prefix(workspace) else {
                    continue;
                };
                let rel_str = normalize_rel_path(&rel.to_string_lossy());
                match snapshot_workspace_file(workspace, &run_dir, &state.run_id, &rel_str) {
                    Ok(_) => {
                        let _ = self.store.log_event(&state.run_id, &loop_core::events::artifact_saved(&rel_str));
                    }
                    Err(err) => {
                        let _ = self.store.log_event(&state.run_id, &loop_core::events::artifact_snapshot_failed(&err.to_string()));
                    }
                }
                newly_written.insert(rel_str);
            }
        }
    }

    /// A previous iteration's composed output embeds `"ok=false"` for any
    /// failed action (Section 4.E "Per-iteration output composition").
    fn previous_output_signals_failure(previous_output: &str) -> bool {
        previous_output.contains("ok=false") || previous_output.starts_with("planner_parse_error:")
    }

    /// Accept or reject `done=true` (Section 4.D acceptance rule).
    fn evaluate_objective(
        &self,
        state: &RunState,
        contract: &loop_core::TaskContract,
        plan: &loop_core::Plan,
        action_results: &[ActionResult],
        current_iteration_failed: bool,
        newly_written: &HashSet<String>,
    ) -> Result<(), ValidationError> {
        if current_iteration_failed {
            return Err(ValidationError::CurrentIterationFailed);
        }
        if Self::previous_output_signals_failure(&state.last_output) && action_results.is_empty() {
            return Err(ValidationError::UnrecoveredFailure);
        }

        let workspace = Path::new(&state.workspace);
        for validation in &plan.validations {
            if !Self::check_validation(workspace, validation) {
                return Err(ValidationError::ExplicitFailed(format!("{validation:?}")));
            }
        }

        for output in &contract.required_outputs {
            if !workspace.join(output).is_file() {
                return Err(ValidationError::MissingOutput(output.clone()));
            }
            if !newly_written.contains(output) {
                return Err(ValidationError::StaleOutput(output.clone()));
            }
        }
        for marker in &contract.expected_text_markers {
            let found = contract.required_outputs.iter().any(|out| {
                std::fs::read_to_string(workspace.join(out))
                    .map(|content| content.contains(marker))
                    .unwrap_or(false)
            });
            if !found && !contract.required_outputs.is_empty() {
                return Err(ValidationError::ExplicitFailed(format!("expected text marker missing: {marker}")));
            }
        }

        if plan.done {
            return Ok(());
        }
        if !contract.required_outputs.is_empty() && !action_results.is_empty() {
            return Ok(());
        }
        Err(ValidationError::ExplicitFailed("plan did not declare done".to_string()))
    }

    fn check_validation(workspace: &std::path::Path, validation: &loop_core::Validation) -> bool {
        match validation {
            loop_core::Validation::FileExists { path } => workspace.join(path).is_file(),
            loop_core::Validation::TextInFile { path, text } => std::fs::read_to_string(workspace.join(path))
                .map(|content| content.contains(text))
                .unwrap_or(false),
            loop_core::Validation::JsonKeyExists { path, key } => std::fs::read_to_string(workspace.join(path))
                .ok()
                .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
                .map(|value| value.get(key).is_some())
                .unwrap_or(false),
            loop_core::Validation::JsonKeyEquals { path, key, value } => std::fs::read_to_string(workspace.join(path))
                .ok()
                .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
                .and_then(|content| content.get(key).cloned())
                .map(|actual| &actual == value)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::LlmResponse;
    use crate::store::RunStore;
    use async_trait::async_trait;
    use loop_core::error::PlannerError;
    use loop_core::{ContainerLifecycle, ExecRuntime, TokenUsage, Validation};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct ScriptedProvider {
        responses: Vec<String>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _system: &str, _user: &str) -> Result<LlmResponse, PlannerError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let text = self.responses.get(index).cloned().unwrap_or_else(|| self.responses.last().cloned().unwrap_or_default());
            Ok(LlmResponse { text, token_usage: TokenUsage::default() })
        }
    }

    fn sandbox_config(workspace: &std::path::Path) -> SandboxConfig {
        SandboxConfig {
            workspace: workspace.to_path_buf(),
            safe_commands: vec![],
            exec_timeout_sec: 5,
            exec_runtime: ExecRuntime::Host,
            exec_container_lifecycle: ContainerLifecycle::PerAction,
            exec_container_image: "n/a".to_string(),
            exec_container_network: "none".to_string(),
            exec_container_cpus: 1.0,
            exec_container_memory: "512m".to_string(),
            exec_container_pids_limit: 64,
            exec_container_env_vars: vec![],
            max_action_output_chars: 4000,
            web_fetch_tls_verify: true,
            run_id: Id::from_string("agent-loop-test"),
        }
    }

    fn loop_config(max_iters: u32) -> LoopConfig {
        LoopConfig {
            max_iters,
            run_max_wall_time_sec: 60,
            no_progress_repeat_threshold: 3,
            max_previous_output_chars: 4000,
            planner_retry_max_attempts: 2,
        }
    }

    #[test]
    fn compose_output_prefers_final_output_when_present() {
        let results = vec![ActionResult { name: "list_dir".to_string(), ok: true, output: "a.txt".to_string(), error: None }];
        let output = AgentLoop::<ScriptedProvider>::compose_output("done: wrote out.txt", &results);
        assert_eq!(output, "done: wrote out.txt");
    }

    #[test]
    fn compose_output_synthesizes_from_action_results_when_final_output_empty() {
        let results = vec![
            ActionResult { name: "write_file".to_string(), ok: true, output: "wrote 10 bytes".to_string(), error: None },
            ActionResult { name: "run_safe_command".to_string(), ok: false, output: String::new(), error: Some("exit 1".to_string()) },
        ];
        let output = AgentLoop::<ScriptedProvider>::compose_output("", &results);
        assert!(output.contains("[write_file] ok=true"));
        assert!(output.contains("[run_safe_command] ok=false"));
        assert!(output.contains("error=exit 1"));
    }

    #[test]
    fn compose_output_empty_when_no_final_output_and_no_actions() {
        assert_eq!(AgentLoop::<ScriptedProvider>::compose_output("", &[]), "");
    }

    #[test]
    fn check_validation_file_exists() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "hello").unwrap();
        assert!(AgentLoop::<ScriptedProvider>::check_validation(dir.path(), &Validation::FileExists { path: "out.txt".to_string() }));
        assert!(!AgentLoop::<ScriptedProvider>::check_validation(dir.path(), &Validation::FileExists { path: "missing.txt".to_string() }));
    }

    #[test]
    fn check_validation_text_in_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("out.txt"), "hello world").unwrap();
        assert!(AgentLoop::<ScriptedProvider>::check_validation(
            dir.path(),
            &Validation::TextInFile { path: "out.txt".to_string(), text: "world".to_string() }
        ));
        assert!(!AgentLoop::<ScriptedProvider>::check_validation(
            dir.path(),
            &Validation::TextInFile { path: "out.txt".to_string(), text: "absent".to_string() }
        ));
    }

    #[test]
    fn check_validation_json_key_exists_and_equals() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("out.json"), r#"{"status": "ok"}"#).unwrap();
        assert!(AgentLoop::<ScriptedProvider>::check_validation(
            dir.path(),
            &Validation::JsonKeyExists { path: "out.json".to_string(), key: "status".to_string() }
        ));
        assert!(!AgentLoop::<ScriptedProvider>::check_validation(
            dir.path(),
            &Validation::JsonKeyExists { path: "out.json".to_string(), key: "missing".to_string() }
        ));
        assert!(AgentLoop::<ScriptedProvider>::check_validation(
            dir.path(),
            &Validation::JsonKeyEquals { path: "out.json".to_string(), key: "status".to_string(), value: serde_json::json!("ok") }
        ));
        assert!(!AgentLoop::<ScriptedProvider>::check_validation(
            dir.path(),
            &Validation::JsonKeyEquals { path: "out.json".to_string(), key: "status".to_string(), value: serde_json::json!("bad") }
        ));
    }

    #[tokio::test]
    async fn run_completes_when_plan_declares_done_with_no_outstanding_validations() {
        let runs_dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let store = Arc::new(RunStore::new(runs_dir.path()).unwrap());
        let provider = ScriptedProvider {
            responses: vec![r#"{"done": true, "final_output": "all set"}"#.to_string()],
            calls: AtomicU32::new(0),
        };
        let agent_loop = AgentLoop::new(store.clone(), sandbox_config(workspace.path()), provider, loop_config(5));

        let run_id = agent_loop
            .start_run("do nothing in particular", "test", "test-model", workspace.path().to_string_lossy(), "", 5)
            .await
            .unwrap();

        let state = store.read_state(&run_id).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.stop_reason, Some(StopReason::Completed));
        assert_eq!(state.last_output, "all set");
    }

    #[tokio::test]
    async fn run_fails_with_max_iters_when_plan_never_finishes() {
        let runs_dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let store = Arc::new(RunStore::new(runs_dir.path()).unwrap());
        let provider = ScriptedProvider {
            responses: vec![r#"{"done": false, "final_output": "still working"}"#.to_string()],
            calls: AtomicU32::new(0),
        };
        let agent_loop = AgentLoop::new(store.clone(), sandbox_config(workspace.path()), provider, loop_config(2));

        let run_id = agent_loop
            .start_run("write out.txt", "test", "test-model", workspace.path().to_string_lossy(), "", 2)
            .await
            .unwrap();

        let state = store.read_state(&run_id).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stop_reason, Some(StopReason::MaxIters));
        assert_eq!(state.iteration, 2);
    }

    #[tokio::test]
    async fn run_stops_on_no_progress_after_repeated_identical_actions() {
        let runs_dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let store = Arc::new(RunStore::new(runs_dir.path()).unwrap());
        let repeated = r#"{"done": false, "actions": [{"name": "list_dir", "path": "."}]}"#.to_string();
        let provider = ScriptedProvider {
            responses: vec![repeated.clone(), repeated.clone(), repeated.clone(), repeated],
            calls: AtomicU32::new(0),
        };
        let agent_loop = AgentLoop::new(store.clone(), sandbox_config(workspace.path()), provider, loop_config(10));

        let run_id = agent_loop
            .start_run("write out.txt", "test", "test-model", workspace.path().to_string_lossy(), "", 10)
            .await
            .unwrap();

        let state = store.read_state(&run_id).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stop_reason, Some(StopReason::NoProgress));
    }

    #[tokio::test]
    async fn run_reports_missing_output_file_when_plan_declares_done_without_writing_it() {
        let runs_dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let store = Arc::new(RunStore::new(runs_dir.path()).unwrap());
        let provider = ScriptedProvider {
            responses: vec![r#"{"done": true, "final_output": "saved result.txt", "actions": []}"#.to_string()],
            calls: AtomicU32::new(0),
        };
        let agent_loop = AgentLoop::new(store.clone(), sandbox_config(workspace.path()), provider, loop_config(3));

        let run_id = agent_loop
            .start_run("write the result to result.txt", "test", "test-model", workspace.path().to_string_lossy(), "", 3)
            .await
            .unwrap();

        let state = store.read_state(&run_id).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.last_output.contains("missing output file: result.txt"), "{}", state.last_output);
    }

    #[tokio::test]
    async fn run_fails_with_error_when_planner_retries_exhausted() {
        let runs_dir = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        let store = Arc::new(RunStore::new(runs_dir.path()).unwrap());
        let provider = ScriptedProvider {
            responses: vec!["not json".to_string(), "also not json".to_string()],
            calls: AtomicU32::new(0),
        };
        let agent_loop = AgentLoop::new(store.clone(), sandbox_config(workspace.path()), provider, loop_config(10));

        let run_id = agent_loop
            .start_run("write out.txt", "test", "test-model", workspace.path().to_string_lossy(), "", 10)
            .await
            .unwrap();

        let state = store.read_state(&run_id).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.stop_reason, Some(StopReason::Error));
    }
}
