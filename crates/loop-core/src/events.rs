//! The append-only, human-readable events log (Section 3, Section 6).
//!
//! Unlike the iterations log, events are plain `"<rfc3339> <message>\n"`
//! lines, not structured JSON: they exist for an operator tailing a file,
//! not for a machine to parse. A handful of stable message-builders are
//! provided so call sites never hand-format the substrings other
//! components or tests key off of.

use chrono::Utc;

/// Render one event line. Does not append a trailing newline.
pub fn format_event(message: &str) -> String {
    format!("{} {}", Utc::now().to_rfc3339(), message)
}

pub fn run_initialized() -> String {
    "run initialized".to_string()
}

pub fn iteration_summary(iteration: u32, done: bool) -> String {
    format!("iteration={iteration} done={done}")
}

pub fn stopped_max_iters() -> String {
    "stopped: max_iters".to_string()
}

pub fn stopped_no_progress() -> String {
    "stopped: no_progress detected".to_string()
}

pub fn stopped_wall_time_limit() -> String {
    "stopped: wall_time_limit reached".to_string()
}

pub fn stopped_cancel_request() -> String {
    "stopped by cancel request".to_string()
}

pub fn auto_completed_from_inferred_validations() -> String {
    "objective auto-completed from inferred validations".to_string()
}

pub fn artifact_saved(rel_path: &str) -> String {
    format!("artifact saved: {rel_path}")
}

pub fn artifact_snapshot_failed(err: &str) -> String {
    format!("artifact snapshot failed: {err}")
}

pub fn container_runtime_profile(profile: &str, image: &str) -> String {
    format!("container runtime profile={profile} image={image}")
}

pub fn planner_retry_attempt(attempt: u32, max_attempts: u32) -> String {
    format!("planner retry attempt={attempt}/{max_attempts} mode=reduced_context")
}

pub fn unknown_validation_kind(kind: &str) -> String {
    format!("unknown validation kind ignored: {kind}")
}
