//! Shared error taxonomy (Section 7).
//!
//! Confinement and Validation errors are recorded into an `ActionResult` or
//! `last_output` and never abort a run; Store errors during normal iteration
//! are fatal and transition the run to `Failed`/`Error`.

use thiserror::Error;

/// Errors raised by the durable run store (Section 4.A).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("run already exists: {0}")]
    AlreadyExists(String),
    #[error("path escapes {root}: {path}")]
    PathEscape { root: &'static str, path: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record in {0}: {1}")]
    Corrupt(String, String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can surface from inside the sandbox.
///
/// Most of these never propagate as Rust errors past `ActionSandbox::execute`
/// (Section 4.B's contract: "never raises for a handled action") — this type
/// exists so that internal helpers have a typed way to signal the condition
/// before it is folded into an `ActionResult`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("escapes workspace: {0}")]
    PathEscape(String),
    #[error("Command is not allowlisted: {0}")]
    CommandNotAllowlisted(String),
    #[error("Command contains blocked token")]
    BlockedToken,
    #[error("Action not allowed: {0}")]
    ActionNotAllowed(String),
    #[error("Only http/https URLs are allowed")]
    UnsupportedScheme,
    #[error("Fetching localhost is not allowed")]
    LocalhostTarget,
    #[error("invalid URL")]
    InvalidUrl,
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),
    #[error("subprocess timed out after {0}s")]
    Timeout(u64),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Planner-facing errors.
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),
    #[error("planner retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

/// Errors surfaced by the objective validator (Section 4.D).
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("explicit validation failed: {0}")]
    ExplicitFailed(String),
    #[error("missing output file: {0}")]
    MissingOutput(String),
    #[error("output file present but empty: {0}")]
    EmptyOutput(String),
    #[error("output file predates this run's actions: {0}")]
    StaleOutput(String),
    #[error("required module not imported in {script}: {module}")]
    MissingImport { script: String, module: String },
    #[error("previous iteration reported a failure with no recovery action")]
    UnrecoveredFailure,
    #[error("current iteration has a failed action")]
    CurrentIterationFailed,
}
