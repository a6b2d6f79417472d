//! Planner: asks an `LLMProvider` for the next iteration's plan and turns
//! its response into a `Plan`, retrying on parse failure (Section 4.C).
//!
//! Grounded in the reference `Planner.build_plan`/`SYSTEM_PROMPT`.

use async_trait::async_trait;
use loop_core::error::PlannerError;
use loop_core::{compact_previous_output, parse_plan_json, Plan, TokenUsage};
use tracing::warn;

pub const SYSTEM_PROMPT: &str = r#"You are the Agent Planner.
Return STRICT JSON only with shape:
{
  "thought": "short reasoning",
  "done": boolean,
  "final_output": "string when done=true else optional",
  "validations": [
    {"type": "file_exists|text_in_file|json_key_exists|json_key_equals", "path": "relative/path", "text": "optional"}
  ],
  "actions": [
    {"name": "list_dir|read_file|write_workspace_file|write_file|run_safe_command|run_shell_command|run_python_code|web_fetch", ...params}
  ]
}
Rules:
- Do not include markdown or code fences.
- Prefer small, safe actions: write code, run it, inspect the result, refine.
- Use done=true only once the task is complete and, for file-producing tasks, only after the output file has actually been created and verified.
- If you create a script you must execute it in a later action.
- After execution, verify the expected output with list_dir/read_file before done=true.
- Provide validations whenever an objective check is known, especially for output files.
- Use paths relative to the workspace, never absolute.
- For web_fetch, use a full http/https URL.
- Never rely on shell redirection operators; use stdout_path/stderr_path instead.
- Keep responses compact and valid JSON."#;

/// Everything the planner needs to build one iteration's prompt.
#[derive(Debug, Clone)]
pub struct PlannerContext {
    pub task: String,
    pub iteration: u32,
    pub max_iters: u32,
    pub previous_output: String,
    pub skill_context: String,
}

/// One LLM call's raw text response plus token accounting.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub token_usage: TokenUsage,
}

/// Abstraction over an LLM backend. Swappable for tests.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<LlmResponse, PlannerError>;
}

pub struct Planner<P: LlmProvider> {
    provider: P,
    max_previous_output_chars: usize,
    retry_max_attempts: u32,
}

impl<P: LlmProvider> Planner<P> {
    pub fn new(provider: P, max_previous_output_chars: usize, retry_max_attempts: u32) -> Self {
        Self {
            provider,
            max_previous_output_chars,
            retry_max_attempts,
        }
    }

    fn build_user_prompt(&self, ctx: &PlannerContext, previous_output: &str) -> String {
        format!(
            "Task: {}\nIteration: {}/{}\nPrevious output:\n{}\nSkill context:\n{}",
            ctx.task, ctx.iteration, ctx.max_iters, previous_output, ctx.skill_context
        )
    }

    /// Build the next plan, retrying with a shrunken `previous_output` when
    /// the response can't be parsed as JSON (Section 4.E step 4).
    ///
    /// The returned `Vec<String>` holds the `type` of any validation entry
    /// the planner emitted that this build doesn't recognize (Section 4.D);
    /// the caller logs one warning event per entry.
    pub async fn build_plan(&self, ctx: &PlannerContext) -> Result<(Plan, TokenUsage, Vec<String>), PlannerError> {
        let mut budget = self.max_previous_output_chars;
        let mut last_token_usage = TokenUsage::default();

        for attempt in 1..=self.retry_max_attempts.max(1) {
            let compacted = compact_previous_output(&ctx.previous_output, budget);
            let user_prompt = self.build_user_prompt(ctx, &compacted);
            let response = self.provider.complete(SYSTEM_PROMPT, &user_prompt).await?;
            last_token_usage = response.token_usage;

            let (plan, unknown_kinds) = parse_plan_json(&response.text);
            if !plan.final_output.starts_with("planner_parse_error:") {
                return Ok((plan, last_token_usage, unknown_kinds));
            }

            warn!(
                attempt,
                max_attempts = self.retry_max_attempts,
                message = %loop_core::events::planner_retry_attempt(attempt, self.retry_max_attempts),
                "planner output failed to parse, retrying"
            );
            budget = (budget / 2).max(200);
        }

        Err(PlannerError::RetriesExhausted(self.retry_max_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        responses: Vec<String>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<LlmResponse, PlannerError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let text = self.responses.get(index).cloned().unwrap_or_default();
            Ok(LlmResponse { text, token_usage: TokenUsage::default() })
        }
    }

    fn ctx() -> PlannerContext {
        PlannerContext {
            task: "write out.txt".to_string(),
            iteration: 1,
            max_iters: 5,
            previous_output: String::new(),
            skill_context: String::new(),
        }
    }

    #[tokio::test]
    async fn build_plan_parses_valid_json_on_first_attempt() {
        let provider = ScriptedProvider {
            responses: vec![r#"{"done": true, "final_output": "ok"}"#.to_string()],
            calls: AtomicU32::new(0),
        };
        let planner = Planner::new(provider, 4000, 2);
        let (plan, _, _) = planner.build_plan(&ctx()).await.unwrap();
        assert!(plan.done);
        assert_eq!(plan.final_output, "ok");
    }

    #[tokio::test]
    async fn build_plan_retries_on_parse_failure() {
        let provider = ScriptedProvider {
            responses: vec!["garbage".to_string(), r#"{"done": false}"#.to_string()],
            calls: AtomicU32::new(0),
        };
        let planner = Planner::new(provider, 4000, 2);
        let (plan, _, _) = planner.build_plan(&ctx()).await.unwrap();
        assert!(!plan.done);
    }

    #[tokio::test]
    async fn build_plan_exhausts_retries_and_errors() {
        let provider = ScriptedProvider {
            responses: vec!["garbage".to_string(), "still garbage".to_string()],
            calls: AtomicU32::new(0),
        };
        let planner = Planner::new(provider, 4000, 2);
        let err = planner.build_plan(&ctx()).await.unwrap_err();
        assert!(matches!(err, PlannerError::RetriesExhausted(2)));
    }
}
