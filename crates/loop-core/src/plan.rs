//! Plan parsing and previous-output compaction (Section 4.C).
//!
//! The planner's output is treated as untrusted text: providers routinely
//! wrap JSON in code fences, emit trailing prose, or simply fail. Everything
//! in this module exists to turn that into a usable `Plan` without ever
//! raising past `Planner::build_plan`.

use serde::{Deserialize, Serialize};

/// One action the planner wants executed this iteration.
///
/// Deliberately untyped: the action vocabulary lives entirely in
/// `ActionSandbox` and new action kinds should not require a planner-side
/// schema change. `name` selects the handler; everything else is a bag of
/// parameters the sandbox interprets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    pub name: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// A single validation the planner wants checked before it declares `done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Validation {
    FileExists { path: String },
    TextInFile { path: String, text: String },
    JsonKeyExists { path: String, key: String },
    JsonKeyEquals {
        path: String,
        key: String,
        value: serde_json::Value,
    },
}

/// A parsed planner response for one iteration (Section 3, Section 4.C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub final_output: String,
    #[serde(default)]
    pub actions: Vec<PlannedAction>,
    #[serde(default)]
    pub validations: Vec<Validation>,
}

impl Plan {
    /// The sentinel plan returned when every parse strategy fails
    /// (Section 4.C, grounded in the reference planner's fallback literal).
    fn parse_error(reason: &str) -> Self {
        Self {
            thought: "fallback parse after planner output could not be parsed as JSON".to_string(),
            done: false,
            final_output: format!("planner_parse_error: {reason}"),
            actions: Vec::new(),
            validations: Vec::new(),
        }
    }
}

/// Strip a single leading/trailing markdown code fence, if present.
///
/// Handles both ` ```json ... ``` ` and bare ` ``` ... ``` `.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a planner response into a `Plan`, never failing.
///
/// Tries, in order: direct JSON parse of the fence-stripped text, then the
/// outermost `{...}` span in the raw text, then falls back to a sentinel
/// plan recording the parse failure as `final_output` so the run can
/// continue and the operator can see what happened (Section 4.C).
///
/// An unrecognized `validations[].type` does not fail the whole plan: that
/// entry is dropped and its `type` string is returned alongside the plan so
/// the caller can log a warning event per entry (Section 4.D).
pub fn parse_plan_json(raw: &str) -> (Plan, Vec<String>) {
    let stripped = strip_code_fence(raw);
    if let Some(parsed) = parse_object(stripped) {
        return parsed;
    }

    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            if let Some(parsed) = parse_object(&raw[start..=end]) {
                return parsed;
            }
        }
    }

    (Plan::parse_error("no valid JSON object found in planner output"), Vec::new())
}

/// Parse one JSON object into a `Plan`, filtering unrecognized entries out
/// of `validations` instead of letting them fail the whole object.
fn parse_object(text: &str) -> Option<(Plan, Vec<String>)> {
    let mut value: serde_json::Value = serde_json::from_str(text).ok()?;
    let mut unknown_kinds = Vec::new();

    if let Some(obj) = value.as_object_mut() {
        if let Some(serde_json::Value::Array(validations)) = obj.get_mut("validations") {
            let mut kept = Vec::new();
            for entry in validations.drain(..) {
                if serde_json::from_value::<Validation>(entry.clone()).is_ok() {
                    kept.push(entry);
                } else {
                    let kind = entry.get("type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                    unknown_kinds.push(kind);
                }
            }
            *validations = kept;
        }
    }

    let plan: Plan = serde_json::from_value(value).ok()?;
    Some((plan, unknown_kinds))
}

/// Truncate a previous iteration's output to fit within `max_chars`,
/// keeping the start and end and marking what was dropped (Section 4.C).
///
/// Matches the reference compaction formula exactly: `head_len =
/// max(200, 0.8 * max_chars)`, `tail_len = max(120, max_chars - head_len)`.
pub fn compact_previous_output(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let head_len = ((max_chars as f64) * 0.8).round().max(200.0) as usize;
    let head_len = head_len.min(chars.len());
    let tail_len = max_chars.saturating_sub(head_len).max(120).min(chars.len() - head_len);

    let head: String = chars[..head_len].iter().collect();
    let tail: String = chars[chars.len() - tail_len..].iter().collect();
    let dropped = chars.len() - head_len - tail_len;

    format!("{head}\n...[truncated {dropped} chars]...\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_code_fence_removes_json_fence() {
        let raw = "```json\n{\"done\": true}\n```";
        assert_eq!(strip_code_fence(raw), "{\"done\": true}");
    }

    #[test]
    fn strip_code_fence_removes_bare_fence() {
        let raw = "```\n{\"done\": true}\n```";
        assert_eq!(strip_code_fence(raw), "{\"done\": true}");
    }

    #[test]
    fn strip_code_fence_is_noop_without_fence() {
        assert_eq!(strip_code_fence("{\"done\": true}"), "{\"done\": true}");
    }

    #[test]
    fn parse_plan_json_direct() {
        let raw = r#"{"thought": "t", "done": true, "final_output": "ok", "actions": []}"#;
        let (plan, unknown) = parse_plan_json(raw);
        assert!(plan.done);
        assert_eq!(plan.final_output, "ok");
        assert!(unknown.is_empty());
    }

    #[test]
    fn parse_plan_json_from_fenced_text() {
        let raw = "```json\n{\"done\": false, \"actions\": []}\n```";
        let (plan, _) = parse_plan_json(raw);
        assert!(!plan.done);
    }

    #[test]
    fn parse_plan_json_recovers_outermost_braces_with_leading_prose() {
        let raw = "Sure thing, here is the plan:\n{\"done\": true, \"final_output\": \"x\"}\nHope that helps!";
        let (plan, _) = parse_plan_json(raw);
        assert!(plan.done);
        assert_eq!(plan.final_output, "x");
    }

    #[test]
    fn parse_plan_json_skips_unrecognized_validation_kind_without_failing_plan() {
        let raw = r#"{"done": false, "validations": [
            {"type": "file_exists", "path": "out.txt"},
            {"type": "totally_unknown", "path": "x"}
        ]}"#;
        let (plan, unknown) = parse_plan_json(raw);
        assert_eq!(plan.validations.len(), 1);
        assert!(matches!(plan.validations[0], Validation::FileExists { .. }));
        assert_eq!(unknown, vec!["totally_unknown".to_string()]);
    }

    #[test]
    fn parse_plan_json_falls_back_to_sentinel_on_garbage() {
        let (plan, _) = parse_plan_json("not json at all");
        assert!(!plan.done);
        assert!(plan.final_output.starts_with("planner_parse_error:"));
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn compact_previous_output_is_noop_under_limit() {
        let text = "short text";
        assert_eq!(compact_previous_output(text, 4000), text);
    }

    #[test]
    fn compact_previous_output_truncates_with_marker() {
        let text = "a".repeat(5000);
        let compacted = compact_previous_output(&text, 4000);
        assert!(compacted.contains("truncated"));
        assert!(compacted.len() < text.len());
        assert!(compacted.starts_with("aaaa"));
        assert!(compacted.ends_with('a'));
    }
}
