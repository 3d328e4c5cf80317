//! Commands that move a run through its lifecycle.

use anyhow::{Context, Result, bail};
use harness::builder::BUILD_LOG_FN;
use harness::config::HarnessConfig;
use harness::run::{RunContext, TestRun, load_test_config};
use harness::store::RunOptions;
use harness::variables::VariableSet;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn load_vars(path: Option<&Path>) -> Result<VariableSet> {
    match path {
        Some(path) => VariableSet::load(path)
            .with_context(|| format!("Failed to load variables from {}", path.display())),
        None => Ok(VariableSet::new()),
    }
}

/// A token that fires on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling build");
            trigger.cancel();
        }
    });
    token
}

pub fn cmd_create(
    settings: HarnessConfig,
    test_config: &Path,
    build_only: bool,
    rebuild: bool,
    vars: Option<&Path>,
) -> Result<()> {
    let config = load_test_config(test_config)?;
    let vars = load_vars(vars)?;
    let options = RunOptions {
        build_only,
        rebuild,
    };

    let run = TestRun::create(RunContext::local(settings), config, vars, options)?;
    println!("{}", run.id());
    if run.skipped() {
        eprintln!("Run {} will be skipped: {}", run.id(), run.skip_reasons().join(" "));
    }
    Ok(())
}

pub fn cmd_finalize(settings: HarnessConfig, id: u64, vars: Option<&Path>) -> Result<()> {
    let mut run = TestRun::load(RunContext::local(settings), id)?;
    run.finalize(&load_vars(vars)?)?;
    println!("Run {} finalized.", id);
    Ok(())
}

pub async fn cmd_build(settings: HarnessConfig, id: u64) -> Result<()> {
    let run = TestRun::load(RunContext::local(settings), id)?;
    if !run.build(interrupt_token()).await? {
        bail!(
            "Build {} failed for run {}; see {}",
            run.build_name(),
            id,
            run.build_path().join(BUILD_LOG_FN).display()
        );
    }
    println!("Run {} built ({}).", id, run.build_name());
    Ok(())
}

/// Everything a run does inside its allocation.
///
/// However the lifecycle ends, the run is marked complete so observers
/// waiting on it are released.
pub async fn cmd_run(settings: HarnessConfig, id: u64, vars: Option<&Path>) -> Result<()> {
    let mut run = TestRun::load(RunContext::local(settings), id)?;

    let outcome = drive(&mut run, vars).await;
    if let Err(e) = run.mark_complete() {
        warn!(run_id = id, err = %e, "could not mark run complete");
        if outcome.is_ok() {
            return Err(e.into());
        }
    }
    let summary = outcome?;
    info!(run_id = id, "run complete");
    println!("Run {} {}", id, summary);
    Ok(())
}

async fn drive(run: &mut TestRun, vars: Option<&Path>) -> Result<String> {
    if !run.config().is_finalized() && !run.skipped() {
        run.finalize(&load_vars(vars)?)?;
    }
    if run.skipped() {
        return Ok(format!("skipped: {}", run.skip_reasons().join(" ")));
    }

    if !run.is_built() && !run.build(interrupt_token()).await? {
        bail!("Build failed for run {}", run.id());
    }
    if run.options().build_only {
        return Ok("built (build only).".to_string());
    }

    let succeeded = run.runnable()?.run().await?;
    let results = run.gather_results(succeeded)?;
    Ok(results
        .get("result")
        .and_then(|r| r.as_str())
        .unwrap_or("finished")
        .to_string())
}

pub fn cmd_set_job_id(settings: HarnessConfig, id: u64, job_id: &str) -> Result<()> {
    let mut run = TestRun::load(RunContext::local(settings), id)?;
    run.set_job_id(job_id);
    Ok(())
}
