//! Output rendering for loopctl CLI.
//!
//! Formats run and iteration information for terminal display.

use loop_core::{IterationRecord, RunState, RunStatus, StopReason};

/// Print confirmation after creating a run.
pub fn print_run_created(run_id: &str) {
    println!("Created run: {}", run_id);
}

/// Print a list of runs in tabular format.
pub fn print_run_list(runs: &[RunState]) {
    if runs.is_empty() {
        println!("No runs found.");
        return;
    }

    println!("{:<14}  {:<10}  {:<6}  {:<20}  {}", "ID", "STATUS", "ITER", "CREATED", "WORKSPACE");
    println!("{}", "-".repeat(100));

    for run in runs {
        println!(
            "{:<14}  {:<10}  {:<6}  {:<20}  {}",
            run.run_id,
            format_status(run.status),
            format!("{}/{}", run.iteration, run.max_iters),
            format_time(&run.created_at),
            truncate(&run.workspace, 40),
        );
    }

    println!();
    println!("{} run(s)", runs.len());
}

/// Print detailed information about a run and its iterations.
pub fn print_run_details(run: &RunState, iterations: &[IterationRecord]) {
    println!("Run: {}", run.run_id);
    println!();
    println!("  Task:           {}", run.task);
    println!("  Status:         {}", format_status(run.status));
    if let Some(reason) = run.stop_reason {
        println!("  Stop Reason:    {}", format_stop_reason(reason));
    }
    println!("  Provider/Model: {}/{}", run.provider, run.model);
    println!("  Workspace:      {}", run.workspace);
    println!("  Iteration:      {}/{}", run.iteration, run.max_iters);
    println!("  Created:        {}", format_time(&run.created_at));
    println!("  Updated:        {}", format_time(&run.updated_at));

    if !run.last_output.is_empty() {
        println!();
        println!("  Last Output:");
        for line in run.last_output.lines() {
            println!("    {}", line);
        }
    }

    if !iterations.is_empty() {
        println!();
        println!("  Iterations:");
        println!("    {:<6}  {:<8}  {:<6}  {}", "ITER", "DONE", "ERROR", "TIMESTAMP");
        println!("    {}", "-".repeat(70));

        for record in iterations {
            println!(
                "    {:<6}  {:<8}  {:<6}  {}",
                record.iteration,
                record.done,
                record.error.is_some(),
                format_time(&record.timestamp),
            );
        }
    }
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Completed => "COMPLETED",
        RunStatus::Failed => "FAILED",
        RunStatus::Canceled => "CANCELED",
    }
}

fn format_stop_reason(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Completed => "completed",
        StopReason::MaxIters => "max_iters",
        StopReason::Interrupted => "interrupted",
        StopReason::Error => "error",
        StopReason::Canceled => "canceled",
        StopReason::NoProgress => "no_progress",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
