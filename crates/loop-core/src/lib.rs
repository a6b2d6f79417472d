pub mod artifacts;
pub mod config;
pub mod error;
pub mod events;
pub mod plan;
pub mod types;
pub mod validator;

pub use artifacts::{list_artifacts, snapshot_workspace_file, ArtifactError};
pub use config::{Config, ConfigError, ContainerLifecycle, ExecRuntime};
pub use error::{PlannerError, SandboxError, StoreError, StoreResult, ValidationError};
pub use plan::{compact_previous_output, parse_plan_json, Plan, PlannedAction, Validation};
pub use types::{
    ActionResult, Artifact, Id, IterationRecord, RunState, RunStatus, StopReason, TokenUsage,
};
pub use validator::{PathDiscoveryPolicy, TaskContract, TaskContractParser};
