use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use harness::config::{HarnessConfig, WORKING_DIR_ENV};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod cmd;

#[derive(Parser)]
#[command(name = "harness")]
#[command(version, about = "Test run lifecycle for a shared-filesystem HPC test harness")]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Directory holding test_runs/ and builds/
    #[arg(long, env = WORKING_DIR_ENV, global = true)]
    pub working_dir: Option<PathBuf>,

    /// Harness config file (defaults to <working_dir>/harness.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a test run from a JSON or TOML test config
    Create {
        test_config: PathBuf,
        #[arg(long)]
        build_only: bool,
        #[arg(long)]
        rebuild: bool,
        /// Variable set file (JSON)
        #[arg(long)]
        vars: Option<PathBuf>,
    },
    /// Resolve deferred values and write the run script
    Finalize {
        id: u64,
        /// Newly known variables (JSON)
        #[arg(long)]
        vars: Option<PathBuf>,
    },
    /// Build a test run
    Build { id: u64 },
    /// Finalize, build, run, gather results and mark complete
    Run {
        id: u64,
        #[arg(long)]
        vars: Option<PathBuf>,
    },
    /// Show a run's status history
    Status { id: u64 },
    /// Wait for a run to be marked complete
    Wait {
        id: u64,
        /// Seconds to wait (forever if omitted)
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Print a run's results
    Results { id: u64 },
    /// List the most recent runs
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Record the scheduler job id for a run
    SetJobId { id: u64, job_id: String },
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let settings = HarnessConfig::resolve(cli.working_dir.clone(), cli.config.as_deref())?;

    match &cli.command {
        Commands::Create {
            test_config,
            build_only,
            rebuild,
            vars,
        } => cmd::cmd_create(settings, test_config, *build_only, *rebuild, vars.as_deref())?,
        Commands::Finalize { id, vars } => cmd::cmd_finalize(settings, *id, vars.as_deref())?,
        Commands::Build { id } => cmd::cmd_build(settings, *id).await?,
        Commands::Run { id, vars } => cmd::cmd_run(settings, *id, vars.as_deref()).await?,
        Commands::Status { id } => cmd::cmd_status(settings, *id)?,
        Commands::Wait { id, timeout } => cmd::cmd_wait(settings, *id, *timeout).await?,
        Commands::Results { id } => cmd::cmd_results(settings, *id)?,
        Commands::List { limit } => cmd::cmd_list(settings, *limit)?,
        Commands::SetJobId { id, job_id } => cmd::cmd_set_job_id(settings, *id, job_id)?,
    }

    Ok(())
}
