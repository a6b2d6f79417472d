//! Core types for the agent runtime.
//!
//! These types match the data model in Section 3 of the design.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, short, unique identifier for a run.
///
/// Time-ordered (derived from `UUIDv7`) but truncated to 12 hex characters,
/// matching the short run-id convention the store directory layout expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        let full = Uuid::now_v7().simple().to_string();
        Self(full[..12].to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Run lifecycle status (Section 3, Section 4.E state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

/// Why a run reached (or has not yet reached) a terminal status.
///
/// `None` while `status == Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    MaxIters,
    Interrupted,
    Error,
    Canceled,
    NoProgress,
}

/// Durable per-run state (Section 3).
///
/// Once `status != Running`, `stop_reason` is set and every field besides
/// incidental audit metadata (`updated_at`) is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Id,
    pub task: String,
    pub provider: String,
    pub model: String,
    pub workspace: String,
    pub skills_dir: String,
    pub max_iters: u32,
    #[serde(default)]
    pub iteration: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_output: String,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl RunState {
    pub fn new(
        run_id: Id,
        task: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        workspace: impl Into<String>,
        skills_dir: impl Into<String>,
        max_iters: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            task: task.into(),
            provider: provider.into(),
            model: model.into(),
            workspace: workspace.into(),
            skills_dir: skills_dir.into(),
            max_iters,
            iteration: 0,
            status: RunStatus::Running,
            stop_reason: None,
            created_at: now,
            updated_at: now,
            last_output: String::new(),
            cancel_requested: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != RunStatus::Running
    }
}

/// Token accounting reported by the `LLMProvider` for one planner call.
///
/// Unknown keys are tolerated: the provider may report extra counters
/// beyond the three tracked here, and those are simply dropped on
/// deserialization rather than rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Result of executing one action (Section 3).
///
/// `output` is always already truncated to the configured output cap
/// by the sandbox before it reaches this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub name: String,
    pub ok: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One append-only record of a completed iteration (Section 3).
///
/// Written atomically after all of the iteration's actions have executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub run_id: Id,
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub prompt: String,
    pub plan: serde_json::Value,
    pub actions: Vec<serde_json::Value>,
    pub action_results: Vec<ActionResult>,
    pub output: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

/// A workspace file archived into the run's durable artifact tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Id,
    pub run_id: Id,
    /// Path relative to the run's `artifacts/` root, using `/` separators.
    pub rel_path: String,
    pub checksum: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_new_produces_12_char_lowercase_hex() {
        let id = Id::new();
        assert_eq!(id.0.len(), 12);
        assert!(id.0.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn id_new_is_unique() {
        let a = Id::new();
        let b = Id::new();
        assert_ne!(a, b);
    }

    #[test]
    fn run_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RunStatus::Running).unwrap(), "\"running\"");
        assert_eq!(serde_json::to_string(&RunStatus::Canceled).unwrap(), "\"canceled\"");
    }

    #[test]
    fn run_state_new_defaults() {
        let state = RunState::new(Id::from_string("abc"), "do thing", "openai", "gpt-4o", "/ws", "/skills", 5);
        assert_eq!(state.iteration, 0);
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.stop_reason.is_none());
        assert!(!state.cancel_requested);
        assert_eq!(state.max_iters, 5);
    }

    #[test]
    fn run_state_round_trips_through_json() {
        let state = RunState::new(Id::new(), "task", "openai", "gpt-4o", "/ws", "/skills", 3);
        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn stop_reason_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&StopReason::MaxIters).unwrap(), "\"max_iters\"");
        assert_eq!(serde_json::to_string(&StopReason::NoProgress).unwrap(), "\"no_progress\"");
    }
}
