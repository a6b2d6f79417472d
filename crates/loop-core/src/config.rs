//! Configuration for the agent runtime (Section 6, Section 6.2).
//!
//! Precedence: compiled-in defaults -> `key=value` config file -> environment
//! variables (`AGENTLOOP_`-prefixed). Unrecognized config-file keys are a
//! hard error rather than a warning, since this settings record is the only
//! channel through which components are configured.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid float value for {key}: {value}")]
    InvalidFloat { key: String, value: String },
    #[error("invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Execution runtime for `ActionSandbox` (Section 4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecRuntime {
    Host,
    Container,
}

/// Container lifecycle when `exec_runtime = container` (Section 4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerLifecycle {
    PerAction,
    PerRun,
}

/// The flat settings record consumed by every component constructor
/// (Section 6, Section 9 "Global state" design note).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: String,
    pub model: String,
    pub max_iters: u32,
    pub workspace: PathBuf,
    pub runs_dir: PathBuf,
    pub skills_dir: PathBuf,
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
    pub max_previous_output_chars: usize,
    pub no_progress_repeat_threshold: u32,
    pub planner_retry_max_attempts: u32,
    pub run_max_wall_time_sec: u64,
    pub web_fetch_tls_verify: bool,

    pub max_concurrent_runs: usize,
    pub max_runs_per_workspace: Option<usize>,

    pub bind_addr: String,
    pub auth_token: Option<String>,
    pub sse_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_iters: 10,
            workspace: PathBuf::from("."),
            runs_dir: PathBuf::from(".agent/runs"),
            skills_dir: PathBuf::from("skillpacks"),
            safe_commands: vec![
                "ls".to_string(),
                "pwd".to_string(),
                "cat".to_string(),
                "echo".to_string(),
                "python".to_string(),
                "pytest".to_string(),
                "rm".to_string(),
            ],
            exec_timeout_sec: 30,
            exec_runtime: ExecRuntime::Host,
            exec_container_lifecycle: ContainerLifecycle::PerAction,
            exec_container_image: "python:3.11-slim".to_string(),
            exec_container_network: "none".to_string(),
            exec_container_cpus: 1.0,
            exec_container_memory: "512m".to_string(),
            exec_container_pids_limit: 256,
            exec_container_env_vars: Vec::new(),
            max_action_output_chars: 12_000,
            max_previous_output_chars: 4_000,
            no_progress_repeat_threshold: 3,
            planner_retry_max_attempts: 2,
            run_max_wall_time_sec: 3600,
            web_fetch_tls_verify: true,
            max_concurrent_runs: 3,
            max_runs_per_workspace: None,
            bind_addr: "127.0.0.1:4170".to_string(),
            auth_token: None,
            sse_poll_interval_ms: 500,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Overlay `AGENTLOOP_`-prefixed environment variables, highest precedence.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        for (key, value) in std::env::vars() {
            let Some(field) = key.strip_prefix("AGENTLOOP_") else {
                continue;
            };
            self.apply_value(&field.to_lowercase(), &value)?;
        }
        Ok(())
    }

    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            self.apply_value(key.trim(), &Self::unquote(value.trim()))?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    #[allow(clippy::too_many_lines)]
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "provider" => self.provider = value.to_string(),
            "model" => self.model = value.to_string(),
            "max_iters" => self.max_iters = Self::parse_int(key, value)?,
            "workspace" => self.workspace = PathBuf::from(value),
            "runs_dir" => self.runs_dir = PathBuf::from(value),
            "skills_dir" => self.skills_dir = PathBuf::from(value),
            "safe_commands" => {
                self.safe_commands = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "exec_timeout_sec" => self.exec_timeout_sec = Self::parse_int(key, value)?,
            "exec_runtime" => {
                self.exec_runtime = match value {
                    "host" => ExecRuntime::Host,
                    "container" => ExecRuntime::Container,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                            reason: "must be 'host' or 'container'",
                        })
                    }
                };
            }
            "exec_container_lifecycle" => {
                self.exec_container_lifecycle = match value {
                    "per_action" => ContainerLifecycle::PerAction,
                    "per_run" => ContainerLifecycle::PerRun,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                            reason: "must be 'per_action' or 'per_run'",
                        })
                    }
                };
            }
            "exec_container_image" => self.exec_container_image = value.to_string(),
            "exec_container_network" => self.exec_container_network = value.to_string(),
            "exec_container_cpus" => self.exec_container_cpus = Self::parse_float(key, value)?,
            "exec_container_memory" => self.exec_container_memory = value.to_string(),
            "exec_container_pids_limit" => {
                self.exec_container_pids_limit = Self::parse_int(key, value)?;
            }
            "exec_container_env_vars" => {
                self.exec_container_env_vars = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "max_action_output_chars" => {
                self.max_action_output_chars = Self::parse_int(key, value)?;
            }
            "max_previous_output_chars" => {
                self.max_previous_output_chars = Self::parse_int(key, value)?;
            }
            "no_progress_repeat_threshold" => {
                self.no_progress_repeat_threshold = Self::parse_int(key, value)?;
            }
            "planner_retry_max_attempts" => {
                self.planner_retry_max_attempts = Self::parse_int(key, value)?;
            }
            "run_max_wall_time_sec" => self.run_max_wall_time_sec = Self::parse_int(key, value)?,
            "web_fetch_tls_verify" => self.web_fetch_tls_verify = Self::parse_bool(key, value)?,
            "max_concurrent_runs" => self.max_concurrent_runs = Self::parse_int(key, value)?,
            "max_runs_per_workspace" => {
                self.max_runs_per_workspace = if value.is_empty() {
                    None
                } else {
                    Some(Self::parse_int(key, value)?)
                };
            }
            "bind_addr" => self.bind_addr = value.to_string(),
            "auth_token" => {
                self.auth_token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "sse_poll_interval_ms" => self.sse_poll_interval_ms = Self::parse_int(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_float(key: &str, value: &str) -> Result<f64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidFloat {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve relative directories against a workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.runs_dir.is_relative() {
            self.runs_dir = workspace_root.join(&self.runs_dir);
        }
        if self.skills_dir.is_relative() {
            self.skills_dir = workspace_root.join(&self.skills_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.max_iters, 10);
        assert_eq!(config.exec_runtime, ExecRuntime::Host);
        assert_eq!(config.max_concurrent_runs, 3);
        assert!(config.safe_commands.contains(&"rm".to_string()));
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        config
            .parse_content("model=\"gpt-4o\"\nmax_iters=25\nweb_fetch_tls_verify=false\n")
            .unwrap();
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.max_iters, 25);
        assert!(!config.web_fetch_tls_verify);
    }

    #[test]
    fn parse_safe_commands_csv() {
        let mut config = Config::default();
        config.parse_content("safe_commands=ls, cat, rm\n").unwrap();
        assert_eq!(config.safe_commands, vec!["ls", "cat", "rm"]);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut config = Config::default();
        let err = config.parse_content("bogus_key=1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(k) if k == "bogus_key"));
    }

    #[test]
    fn invalid_exec_runtime_is_rejected() {
        let mut config = Config::default();
        let err = config.parse_content("exec_runtime=chroot\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("k", "true").unwrap());
        assert!(Config::parse_bool("k", "1").unwrap());
        assert!(Config::parse_bool("k", "yes").unwrap());
        assert!(Config::parse_bool("k", "on").unwrap());
        assert!(!Config::parse_bool("k", "false").unwrap());
        assert!(!Config::parse_bool("k", "off").unwrap());
    }

    #[test]
    fn unquote_removes_matching_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("bare"), "bare");
    }
}
