//! Read-only commands.

use anyhow::{Context, Result};
use harness::config::HarnessConfig;
use harness::run::{RunContext, TestRun};
use harness::store::latest_runs;
use std::time::Duration;

pub fn cmd_status(settings: HarnessConfig, id: u64) -> Result<()> {
    let run = TestRun::load(RunContext::local(settings), id)?;
    println!("Run {} ({})", id, run.name());
    for entry in run.status().history()? {
        println!(
            "{:<14} {}  {}",
            entry.state,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.message
        );
    }
    Ok(())
}

pub async fn cmd_wait(settings: HarnessConfig, id: u64, timeout: Option<f64>) -> Result<()> {
    let timeout = timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("Invalid --timeout")?;
    let run = TestRun::load(RunContext::local(settings), id)?;
    let completed = run.wait(timeout).await?;
    println!("Run {} completed at {}", id, completed.to_rfc3339());
    Ok(())
}

pub fn cmd_results(settings: HarnessConfig, id: u64) -> Result<()> {
    let run = TestRun::load(RunContext::local(settings), id)?;
    match run.results()? {
        Some(results) => println!("{}", serde_json::to_string_pretty(&results)?),
        None => println!("No results for run {}.", id),
    }
    Ok(())
}

pub fn cmd_list(settings: HarnessConfig, limit: usize) -> Result<()> {
    let ctx = RunContext::local(settings);
    let ids = latest_runs(&ctx.runs_dir(), limit)?;
    if ids.is_empty() {
        println!("No test runs.");
        return Ok(());
    }

    println!("{:<6} {:<14} Name", "Id", "State");
    for id in ids {
        match TestRun::load(ctx.clone(), id) {
            Ok(run) => {
                let state = run
                    .status()
                    .current()?
                    .map(|e| e.state.to_string())
                    .unwrap_or_default();
                println!("{:<6} {:<14} {}", id, state, run.name());
            }
            Err(e) => println!("{:<6} {:<14} {}", id, "?", e),
        }
    }
    Ok(())
}
