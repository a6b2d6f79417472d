//! `ActionSandbox`: bounded-capability action execution (Section 4.B).
//!
//! Every action is dispatched through here, never executed directly by the
//! planner or the loop. Confinement (path/command/network) is enforced at
//! the boundary; failures are folded into an `ActionResult` rather than
//! propagated as a Rust error, except for a handful of programmer-error
//! conditions (missing required parameter) that indicate a malformed plan.
//!
//! Subprocess handling (timeout, output capture) is grounded in the
//! teacher's `Runner::execute_single` Command/timeout pattern.

use loop_core::error::SandboxError;
use loop_core::{ActionResult, ContainerLifecycle, ExecRuntime, Id};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

const BLOCKED_TOKENS: &[&str] = &["sudo", "curl", "wget", "ssh", "scp", "mv"];

/// Parsed redirect parameters for `run_safe_command` (Section 4.B).
struct RedirectTargets {
    output_file: Option<String>,
    stdout_file: Option<String>,
    stderr_file: Option<String>,
    append: bool,
}

/// Confinement and execution configuration for one run.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub workspace: PathBuf,
    pub safe_commands: Vec<String>,
    pub exec_timeout_sec: u64,
    pub exec_runtime: ExecRuntime,
    pub exec_container_lifecycle: ContainerLifecycle,
    pub exec_container_image: String,
    pub exec_container_network: String,
    pub exec_container_cpus: f64,
    pub exec_container_memory: String,
    pub exec_container_pids_limit: u32,
    pub exec_container_env_vars: Vec<String>,
    pub max_action_output_chars: usize,
    pub web_fetch_tls_verify: bool,
    pub run_id: Id,
}

/// Bounded-capability executor for one run's actions (Section 4.B).
pub struct ActionSandbox {
    config: SandboxConfig,
    container_started: std::sync::atomic::AtomicBool,
    container_profile_logged: std::sync::atomic::AtomicBool,
}

impl ActionSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            container_started: std::sync::atomic::AtomicBool::new(false),
            container_profile_logged: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Dispatch one planned action by name. Never returns `Err` for a
    /// handled action name; unrecognized actions produce `ok: false`.
    pub async fn execute(&self, name: &str, params: &Map<String, Value>) -> ActionResult {
        let result = match name {
            "read_file" => self.read_file(params).await,
            "write_file" | "write_workspace_file" => self.write_workspace_file(params).await,
            "list_dir" => self.list_dir(params).await,
            "run_shell_command" | "run_safe_command" => self.run_safe_command(params).await,
            "run_python_code" => self.run_python_code(params).await,
            "web_fetch" => self.web_fetch(params).await,
            other => Err(SandboxError::ActionNotAllowed(other.to_string())),
        };

        match result {
            Ok(output) => ActionResult {
                name: name.to_string(),
                ok: true,
                output: self.truncate_output(&output),
                error: None,
            },
            Err(err) => ActionResult {
                name: name.to_string(),
                ok: false,
                output: String::new(),
                error: Some(err.to_string()),
            },
        }
    }

    fn truncate_output(&self, output: &str) -> String {
        let max = self.config.max_action_output_chars;
        if output.chars().count() <= max {
            return output.to_string();
        }
        let truncated: String = output.chars().take(max).collect();
        format!("{truncated}\n[truncated to {max} chars]")
    }

    fn get_path_param<'a>(&self, params: &'a Map<String, Value>) -> Result<&'a str, SandboxError> {
        params
            .get("path")
            .or_else(|| params.get("file_path"))
            .and_then(Value::as_str)
            .ok_or(SandboxError::MissingParam("path"))
    }

    /// Resolve a relative path against the workspace, rejecting escapes.
    fn resolve_workspace_path(&self, rel_path: &str) -> Result<PathBuf, SandboxError> {
        if rel_path.starts_with('/') {
            return Err(SandboxError::PathEscape(rel_path.to_string()));
        }
        let joined = self.config.workspace.join(rel_path);
        if !Self::is_within_workspace(&self.config.workspace, &joined) {
            return Err(SandboxError::PathEscape(rel_path.to_string()));
        }
        Ok(joined)
    }

    /// Lexical containment check: does not require the path to exist.
    fn is_within_workspace(root: &Path, candidate: &Path) -> bool {
        let mut depth: i64 = 0;
        for component in candidate.strip_prefix(root).unwrap_or(candidate).components() {
            match component {
                Component::ParentDir => depth -= 1,
                Component::Normal(_) => depth += 1,
                _ => {}
            }
            if depth < 0 {
                return false;
            }
        }
        true
    }

    async fn read_file(&self, params: &Map<String, Value>) -> Result<String, SandboxError> {
        let rel = self.get_path_param(params)?;
        let path = self.resolve_workspace_path(rel)?;
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    async fn write_workspace_file(&self, params: &Map<String, Value>) -> Result<String, SandboxError> {
        let rel = self.get_path_param(params)?;
        let path = self.resolve_workspace_path(rel)?;
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .ok_or(SandboxError::MissingParam("content"))?;
        let append = params.get("append").and_then(Value::as_bool).unwrap_or(false);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(content.as_bytes()).await?;
        } else {
            tokio::fs::write(&path, content).await?;
        }
        Ok(format!("wrote {} bytes to {}", content.len(), rel))
    }

    async fn list_dir(&self, params: &Map<String, Value>) -> Result<String, SandboxError> {
        let rel = params.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = self.resolve_workspace_path(rel)?;
        let mut entries = tokio::fs::read_dir(&path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names.join("\n"))
    }

    fn split_command(command: &str) -> Result<Vec<String>, SandboxError> {
        shell_words_split(command).map_err(|_| SandboxError::Other("unbalanced quotes in command".to_string()))
    }

    async fn run_safe_command(&self, params: &Map<String, Value>) -> Result<String, SandboxError> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or(SandboxError::MissingParam("command"))?;

        let mut tokens = Self::split_command(command)?;
        tokens.extend(Self::parse_args_param(params)?);

        let Some(program) = tokens.first().cloned() else {
            return Err(SandboxError::CommandNotAllowlisted(command.to_string()));
        };

        if !self.config.safe_commands.iter().any(|c| c == &program) {
            return Err(SandboxError::CommandNotAllowlisted(program));
        }
        if tokens.iter().any(|t| BLOCKED_TOKENS.contains(&t.as_str())) {
            return Err(SandboxError::BlockedToken);
        }
        if program == "rm" {
            tokens = Self::hydrate_rm_targets(tokens, params);
            self.validate_rm_paths(&tokens)?;
        }

        let redirect = Self::parse_redirect_targets(params)?;
        let (stdout, stderr, exit_code) = self.dispatch_subprocess(&tokens).await?;

        let mut written = Vec::new();
        if let Some(target) = &redirect.output_file {
            let combined = if stderr.is_empty() { stdout.clone() } else { format!("{stdout}\n{stderr}") };
            self.write_command_output_file(target, &combined, redirect.append).await?;
            written.push(target.clone());
        } else {
            if let Some(target) = &redirect.stdout_file {
                self.write_command_output_file(target, &stdout, redirect.append).await?;
                written.push(target.clone());
            }
            if let Some(target) = &redirect.stderr_file {
                self.write_command_output_file(target, &stderr, redirect.append).await?;
                written.push(target.clone());
            }
        }

        let mut output = Self::format_exec_output(&stdout, &stderr, exit_code);
        if !written.is_empty() {
            let suffix = written.iter().map(|p| format!("redirected output: {p}")).collect::<Vec<_>>().join("\n");
            output = format!("{}\n{suffix}", output.trim());
        }
        Ok(output)
    }

    /// Extract `rm`'s path targets from already-tokenized argv, skipping
    /// flags (mirroring the reference's `_validate_rm_paths` scan).
    fn extract_rm_targets(tokens: &[String]) -> Vec<String> {
        let mut targets = Vec::new();
        let mut treat_as_target = false;
        for token in &tokens[1..] {
            if token == "--" {
                treat_as_target = true;
                continue;
            }
            if !treat_as_target && token.starts_with('-') {
                continue;
            }
            targets.push(token.clone());
        }
        targets
    }

    /// If the planner named `rm` with no inline path targets, fall back to
    /// `path`/`paths` params (Section 4.B rule #3, `_hydrate_rm_targets`).
    fn hydrate_rm_targets(tokens: Vec<String>, params: &Map<String, Value>) -> Vec<String> {
        if !Self::extract_rm_targets(&tokens).is_empty() {
            return tokens;
        }
        let mut extra: Vec<String> = Vec::new();
        if let Some(path) = params.get("path").and_then(Value::as_str) {
            extra.push(path.to_string());
        }
        if let Some(paths) = params.get("paths").and_then(Value::as_array) {
            extra.extend(paths.iter().filter_map(Value::as_str).map(str::to_string));
        }
        if extra.is_empty() {
            return tokens;
        }
        let mut tokens = tokens;
        tokens.extend(extra);
        tokens
    }

    /// Resolve and confine every `rm` target to the workspace before the
    /// command is ever dispatched (Section 4.B rule #3).
    fn validate_rm_paths(&self, tokens: &[String]) -> Result<(), SandboxError> {
        let targets = Self::extract_rm_targets(tokens);
        if targets.is_empty() {
            return Err(SandboxError::Other("rm requires at least one path".to_string()));
        }
        for target in &targets {
            self.resolve_workspace_path(target)?;
        }
        Ok(())
    }

    fn parse_args_param(params: &Map<String, Value>) -> Result<Vec<String>, SandboxError> {
        match params.get("args") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).ok_or_else(|| SandboxError::Other("args must be a list of strings".to_string())))
                .collect(),
            Some(_) => Err(SandboxError::Other("args must be a list".to_string())),
        }
    }

    fn parse_redirect_targets(params: &Map<String, Value>) -> Result<RedirectTargets, SandboxError> {
        let str_param = |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string).filter(|s| !s.is_empty());
        let output_file = str_param("redirect_output").or_else(|| str_param("output_file"));
        let stdout_file = str_param("stdout_path").or_else(|| str_param("redirect_stdout"));
        let stderr_file = str_param("stderr_path").or_else(|| str_param("redirect_stderr"));
        if output_file.is_some() && (stdout_file.is_some() || stderr_file.is_some()) {
            return Err(SandboxError::Other(
                "use either redirect_output/output_file or stdout_path/stderr_path, not both".to_string(),
            ));
        }
        let append = params
            .get("append")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| str_param("mode").map(|m| m == "append").unwrap_or(false));
        Ok(RedirectTargets { output_file, stdout_file, stderr_file, append })
    }

    async fn write_command_output_file(&self, rel_path: &str, content: &str, append: bool) -> Result<(), SandboxError> {
        let path = self.resolve_workspace_path(rel_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(content.as_bytes()).await?;
        } else {
            tokio::fs::write(&path, content).await?;
        }
        Ok(())
    }

    /// Collapse the `python3`/`python` alias the same way the reference
    /// normalizer does, preferring whichever spelling is allowlisted.
    fn normalize_python_bin_alias(python_bin: &str, safe_commands: &[String]) -> String {
        if python_bin != "python3" {
            return python_bin.to_string();
        }
        if safe_commands.iter().any(|c| c == "python") {
            "python".to_string()
        } else {
            python_bin.to_string()
        }
    }

    async fn run_python_code(&self, params: &Map<String, Value>) -> Result<String, SandboxError> {
        let code = params.get("code").and_then(Value::as_str);
        let rel_script_path = params.get("path").and_then(Value::as_str);
        if code.is_none() && rel_script_path.is_none() {
            return Err(SandboxError::MissingParam("code"));
        }

        let python_bin = params.get("python_bin").and_then(Value::as_str).unwrap_or("python");
        let python_bin = Self::normalize_python_bin_alias(python_bin, &self.config.safe_commands);
        if !self.config.safe_commands.iter().any(|c| c == &python_bin) {
            return Err(SandboxError::CommandNotAllowlisted(python_bin));
        }
        let extra_args = Self::parse_args_param(params)?;

        let script_rel = if let Some(rel) = rel_script_path {
            let script_path = self.resolve_workspace_path(rel)?;
            if let Some(parent) = script_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if let Some(code) = code {
                tokio::fs::write(&script_path, code).await?;
            } else if !script_path.is_file() {
                return Err(SandboxError::Other(format!("script file not found: {rel}")));
            }
            rel.to_string()
        } else {
            let staging = self.config.workspace.join(".agent_exec");
            tokio::fs::create_dir_all(&staging).await?;
            let script_path = staging.join(format!("script-{}.py", Id::new()));
            tokio::fs::write(&script_path, code.unwrap()).await?;
            script_path
                .strip_prefix(&self.config.workspace)
                .unwrap_or(&script_path)
                .to_string_lossy()
                .replace('\\', "/")
        };

        let mut tokens = vec![python_bin, script_rel];
        tokens.extend(extra_args);

        let (stdout, stderr, exit_code) = self.dispatch_subprocess(&tokens).await?;
        let mut output = Self::format_exec_output(&stdout, &stderr, exit_code);

        if let Some(target) = params.get("stdout_path").and_then(Value::as_str) {
            self.write_command_output_file(target, &stdout, false).await?;
            output = format!("{}\nredirected output: {target}", output.trim());
        }

        Ok(output)
    }

    async fn dispatch_subprocess(&self, tokens: &[String]) -> Result<(String, String, i32), SandboxError> {
        match self.config.exec_runtime {
            ExecRuntime::Host => self.run_subprocess_captured(tokens).await,
            ExecRuntime::Container => self.run_subprocess_containerized_captured(tokens).await,
        }
    }

    fn format_exec_output(stdout: &str, stderr: &str, exit_code: i32) -> String {
        format!("exit_code={exit_code}\nstdout:\n{stdout}\nstderr:\n{stderr}")
    }

    async fn run_subprocess_captured(&self, tokens: &[String]) -> Result<(String, String, i32), SandboxError> {
        let mut cmd = Command::new(&tokens[0]);
        cmd.args(&tokens[1..])
            .current_dir(&self.config.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn()?;
        let duration = Duration::from_secs(self.config.exec_timeout_sec);
        let output = match timeout(duration, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(SandboxError::Timeout(self.config.exec_timeout_sec)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);
        Ok((stdout, stderr, exit_code))
    }

    /// Build the `docker run`/`docker exec` argv for a container-confined
    /// command, mirroring the reference's per-action and per-run argv
    /// construction (Section 4.B container contract).
    fn build_container_name(&self) -> String {
        let sanitized: String = self
            .config
            .run_id
            .as_ref()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("agent-run-{sanitized}")
    }

    fn build_per_action_container_command(&self, tokens: &[String]) -> Vec<String> {
        let mut argv = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/workspace", self.config.workspace.display()),
            "-w".to_string(),
            "/workspace".to_string(),
            "--network".to_string(),
            self.config.exec_container_network.clone(),
            "--cpus".to_string(),
            self.config.exec_container_cpus.to_string(),
            "--memory".to_string(),
            self.config.exec_container_memory.clone(),
            "--pids-limit".to_string(),
            self.config.exec_container_pids_limit.to_string(),
        ];
        for name in &self.config.exec_container_env_vars {
            argv.push("-e".to_string());
            argv.push(name.clone());
        }
        argv.push(self.config.exec_container_image.clone());
        argv.extend(tokens.iter().cloned());
        argv
    }

    fn build_container_bootstrap_command(&self) -> Vec<String> {
        vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.build_container_name(),
            "-v".to_string(),
            format!("{}:/workspace", self.config.workspace.display()),
            "-w".to_string(),
            "/workspace".to_string(),
            "--network".to_string(),
            self.config.exec_container_network.clone(),
            "--cpus".to_string(),
            self.config.exec_container_cpus.to_string(),
            "--memory".to_string(),
            self.config.exec_container_memory.clone(),
            "--pids-limit".to_string(),
            self.config.exec_container_pids_limit.to_string(),
            self.config.exec_container_image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]
    }

    fn build_container_exec_command(&self, tokens: &[String]) -> Vec<String> {
        let mut argv = vec!["exec".to_string(), self.build_container_name()];
        argv.extend(tokens.iter().cloned());
        argv
    }

    async fn ensure_run_container_started(&self) -> Result<(), SandboxError> {
        use std::sync::atomic::Ordering;
        if self.container_started.load(Ordering::SeqCst) {
            return Ok(());
        }
        let argv = self.build_container_bootstrap_command();
        let status = Command::new("docker").args(&argv).status().await?;
        if !status.success() {
            return Err(SandboxError::Other("failed to start run container".to_string()));
        }
        self.container_started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Log the container runtime profile once per sandbox, the first time a
    /// container-mode action actually runs (Section 4.B container contract).
    fn log_container_profile_once(&self) {
        use std::sync::atomic::Ordering;
        if self.container_profile_logged.swap(true, Ordering::SeqCst) {
            return;
        }
        let profile = match self.config.exec_container_lifecycle {
            ContainerLifecycle::PerAction => "per_action",
            ContainerLifecycle::PerRun => "per_run",
        };
        info!("{}", loop_core::events::container_runtime_profile(profile, &self.config.exec_container_image));
    }

    async fn run_subprocess_containerized_captured(&self, tokens: &[String]) -> Result<(String, String, i32), SandboxError> {
        self.log_container_profile_once();
        let argv = match self.config.exec_container_lifecycle {
            ContainerLifecycle::PerAction => self.build_per_action_container_command(tokens),
            ContainerLifecycle::PerRun => {
                self.ensure_run_container_started().await?;
                self.build_container_exec_command(tokens)
            }
        };

        let mut cmd = Command::new("docker");
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn()?;
        let duration = Duration::from_secs(self.config.exec_timeout_sec);
        let output = match timeout(duration, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => return Err(SandboxError::Timeout(self.config.exec_timeout_sec)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let exit_code = output.status.code().unwrap_or(-1);
        Ok((stdout, stderr, exit_code))
    }

    /// Shut down any per-run container. Idempotent.
    pub async fn shutdown(&self) {
        use std::sync::atomic::Ordering;
        if !self.container_started.load(Ordering::SeqCst) {
            return;
        }
        let name = self.build_container_name();
        if let Err(err) = Command::new("docker").args(["rm", "-f", &name]).status().await {
            warn!(error = %err, "failed to remove run container");
        }
    }

    async fn web_fetch(&self, params: &Map<String, Value>) -> Result<String, SandboxError> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or(SandboxError::MissingParam("url"))?;

        let parsed = reqwest::Url::parse(url).map_err(|_| SandboxError::InvalidUrl)?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(SandboxError::UnsupportedScheme);
        }
        if matches!(parsed.host_str(), Some("localhost") | Some("127.0.0.1") | Some("::1")) {
            return Err(SandboxError::LocalhostTarget);
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!self.config.web_fetch_tls_verify)
            .build()
            .map_err(|err| SandboxError::Other(err.to_string()))?;
        let response = client
            .get(parsed)
            .send()
            .await
            .map_err(|err| SandboxError::Other(err.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|err| SandboxError::Other(err.to_string()))?;
        Ok(text)
    }
}

/// Minimal POSIX-shell-like tokenizer (no shell is ever invoked; this only
/// splits the command string into argv).
fn shell_words_split(input: &str) -> Result<Vec<String>, ()> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    for ch in input.chars() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_single || in_double {
        return Err(());
    }
    if has_token {
        tokens.push(current);
    }
    Ok(tokens)
}
