//! A single test run and its lifecycle.
//!
//! Every step reads and writes only the run's directory, so each one may be
//! performed by a different process on a different host:
//!
//! create → finalize → build → run → gather_results → mark_complete
//!
//! Fatal problems are written to the status log before they are returned.

pub mod config;
pub mod context;

pub use config::{ConfigMap, FinalizedConfig, RunConfig, UnresolvedConfig, load_test_config};
pub use context::RunContext;

use crate::builder::{BuildRequest, Builder};
use crate::errors::RunError;
use crate::executor::{ScriptInvocation, Supervision, supervise};
use crate::results::{FAIL, PASS, ResultMap};
use crate::script::compose_from_section;
use crate::skip;
use crate::status::{StatusLog, StatusState};
use crate::store::options::OptionsSave;
use crate::store::{CompletionMarker, ConfigFile, RunOptions, allocate_id, run_path};
use crate::variables::VariableSet;
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CONFIG_FN: &str = "config";
pub const OPTIONS_FN: &str = "options";
pub const VARIABLES_FN: &str = "variables";
pub const STATUS_FN: &str = "status";
pub const BUILD_SCRIPT_FN: &str = "build.sh";
pub const RUN_TEMPLATE_FN: &str = "run.tmpl";
pub const RUN_SCRIPT_FN: &str = "run.sh";
pub const BUILD_NAME_FN: &str = "build_name";
pub const BUILD_ORIGIN_FN: &str = "build_origin";
pub const BUILD_DIR: &str = "build";
pub const JOB_ID_FN: &str = "job_id";
pub const RUN_LOG_FN: &str = "run.log";
pub const RESULTS_FN: &str = "results.json";
pub const COMPLETE_FN: &str = "RUN_COMPLETE";

pub struct TestRun {
    ctx: RunContext,
    id: u64,
    path: PathBuf,
    config: RunConfig,
    vars: VariableSet,
    options: RunOptions,
    status: StatusLog,
    completion: CompletionMarker,
    builder: Box<dyn Builder>,
    skip_reasons: Vec<String>,
    created: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    job_id: Option<String>,
    results: Option<ResultMap>,
}

impl fmt::Debug for TestRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestRun")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("path", &self.path)
            .field("finalized", &self.config.is_finalized())
            .field("build", &self.builder.name())
            .finish()
    }
}

static EMPTY_SECTION: LazyLock<ConfigMap> = LazyLock::new(ConfigMap::new);

impl TestRun {
    /// Allocate a new run directory and set it up from `config`.
    pub fn create(
        ctx: RunContext,
        config: ConfigMap,
        mut vars: VariableSet,
        options: RunOptions,
    ) -> Result<Self, RunError> {
        let (id, path) = allocate_id(&ctx.runs_dir(), ctx.settings.allocation_timeout)?;
        let status = StatusLog::new(path.join(STATUS_FN));
        let created = status.set(StatusState::Created, "Test directory and status file created.")?;
        info!(run_id = id, path = %path.display(), "created test run");

        for (name, value) in [
            ("sys_name", ctx.settings.sys_name.clone()),
            ("user", ctx.settings.user.clone()),
        ] {
            if vars.get("sys", name).is_none() && !vars.is_deferred("sys", name) {
                vars.set("sys", name, value);
            }
        }

        let run = Self::setup(ctx, id, path, status.clone(), config, vars, options, created.timestamp);
        if let Err(e) = &run {
            status.note(StatusState::BuildError, &e.to_string());
        }
        let mut run = run?;

        run.skip_reasons = run.recorded(StatusState::BuildError, skip::evaluate(run.config.as_map()))?;
        run.record_skip()?;
        Ok(run)
    }

    #[allow(clippy::too_many_arguments)]
    fn setup(
        ctx: RunContext,
        id: u64,
        path: PathBuf,
        status: StatusLog,
        config: ConfigMap,
        vars: VariableSet,
        options: RunOptions,
        created: DateTime<Utc>,
    ) -> Result<Self, RunError> {
        config::validate(&config)?;
        ConfigFile::new(path.join(CONFIG_FN), ctx.settings.config_lock_timeout).save(&config)?;
        vars.save(&path.join(VARIABLES_FN))?;

        match options.save(&path.join(OPTIONS_FN)) {
            Ok(OptionsSave::Written) => {}
            Ok(OptionsSave::AlreadyPresent) => return Err(RunError::OptionsAlreadyWritten { id }),
            Err(e) => {
                let msg = format!("Could not write options file: {}", e);
                warn!(run_id = id, "{}", msg);
                status.note(StatusState::Info, &msg);
            }
        }

        let build_section = config::section(&config, "build")?.unwrap_or(&EMPTY_SECTION);
        let build_script = path.join(BUILD_SCRIPT_FN);
        compose_from_section(&build_script, build_section).write()?;

        let builder = ctx.builds.builder(BuildRequest {
            run_id: id,
            script: &build_script,
            section: build_section,
            timeout: config::timeout(&config, "build")?,
            existing_name: None,
            rebuild: options.rebuild,
        })?;
        let name_path = path.join(BUILD_NAME_FN);
        fs::write(&name_path, builder.name()).map_err(|e| RunError::storage(&name_path, e))?;

        let run_section = config::section(&config, "run")?.unwrap_or(&EMPTY_SECTION);
        compose_from_section(&path.join(RUN_TEMPLATE_FN), run_section).write()?;

        status.set(StatusState::Created, "Test directory setup complete.")?;

        Ok(Self {
            completion: CompletionMarker::new(path.join(COMPLETE_FN), ctx.settings.poll_interval),
            ctx,
            id,
            path,
            config: RunConfig::Unresolved(UnresolvedConfig::new(config)),
            vars,
            options,
            status,
            builder,
            skip_reasons: Vec::new(),
            created: Some(created),
            started: None,
            finished: None,
            job_id: None,
            results: None,
        })
    }

    /// Load a run some process created earlier.
    pub fn load(ctx: RunContext, id: u64) -> Result<Self, RunError> {
        let path = run_path(&ctx.runs_dir(), id);
        if !path.is_dir() {
            return Err(RunError::NotFound { id, path });
        }
        let status = StatusLog::new(path.join(STATUS_FN));

        let saved: ConfigMap =
            ConfigFile::new(path.join(CONFIG_FN), ctx.settings.config_lock_timeout).load()?;
        let config = if path.join(RUN_SCRIPT_FN).exists() {
            RunConfig::Finalized(FinalizedConfig::from_saved(saved))
        } else {
            RunConfig::Unresolved(UnresolvedConfig::new(saved))
        };

        let vars = VariableSet::load(&path.join(VARIABLES_FN))?;
        let options = RunOptions::load(&path.join(OPTIONS_FN)).unwrap_or_else(|e| {
            let msg = format!("Could not read options file, using defaults: {}", e);
            warn!(run_id = id, "{}", msg);
            status.note(StatusState::Info, &msg);
            RunOptions::default()
        });

        let name_path = path.join(BUILD_NAME_FN);
        let build_name = fs::read_to_string(&name_path).map_err(|e| RunError::storage(&name_path, e))?;

        let build_section = config.section("build")?.unwrap_or(&EMPTY_SECTION);
        let builder = ctx.builds.builder(BuildRequest {
            run_id: id,
            script: &path.join(BUILD_SCRIPT_FN),
            section: build_section,
            timeout: config::timeout(config.as_map(), "build")?,
            existing_name: Some(build_name.trim()),
            rebuild: options.rebuild,
        })?;

        let skip_reasons = skip::evaluate(config.as_map())?;
        debug!(run_id = id, finalized = config.is_finalized(), "loaded test run");

        Ok(Self {
            completion: CompletionMarker::new(path.join(COMPLETE_FN), ctx.settings.poll_interval),
            ctx,
            id,
            path,
            config,
            vars,
            options,
            status,
            builder,
            skip_reasons,
            created: None,
            started: None,
            finished: None,
            job_id: None,
            results: None,
        })
    }

    /// Fill deferred variables, resolve the config, and write the run script.
    pub fn finalize(&mut self, new_vars: &VariableSet) -> Result<(), RunError> {
        let RunConfig::Unresolved(unresolved) = &self.config else {
            return Err(RunError::AlreadyFinalized { id: self.id });
        };
        let unresolved = unresolved.clone();

        let finalized = self.finalize_config(unresolved, new_vars);
        let finalized = self.recorded(StatusState::RunError, finalized)?;
        self.config = RunConfig::Finalized(finalized);

        if self.skip_reasons.is_empty() {
            self.skip_reasons = self.recorded(StatusState::RunError, skip::evaluate(self.config.as_map()))?;
            self.record_skip()?;
        }

        let run_section = self.config.section("run")?.unwrap_or(&EMPTY_SECTION);
        let written = compose_from_section(&self.run_script_path(), run_section)
            .write()
            .map_err(RunError::from);
        self.recorded(StatusState::RunError, written)?;
        info!(run_id = self.id, "finalized");
        Ok(())
    }

    fn finalize_config(
        &mut self,
        unresolved: UnresolvedConfig,
        new_vars: &VariableSet,
    ) -> Result<FinalizedConfig, RunError> {
        self.vars.undefer(new_vars);
        let finalized = unresolved.finalize(&self.vars)?;
        ConfigFile::new(self.path.join(CONFIG_FN), self.ctx.settings.config_lock_timeout)
            .save(finalized.as_map())?;
        self.vars.save(&self.path.join(VARIABLES_FN))?;
        Ok(finalized)
    }

    fn record_skip(&self) -> Result<(), RunError> {
        if !self.skip_reasons.is_empty() {
            info!(run_id = self.id, reasons = ?self.skip_reasons, "skipping test run");
            self.status.set(StatusState::Complete, &self.skip_reasons.join(" "))?;
        }
        Ok(())
    }

    /// Write the failure to the status log on its way out.
    fn recorded<T>(&self, state: StatusState, result: Result<T, RunError>) -> Result<T, RunError> {
        if let Err(e) = &result {
            self.status.note(state, &e.to_string());
        }
        result
    }

    /// Build (or reuse) this run's build and copy it into the run directory.
    ///
    /// `Ok(false)` means the build failed or was cancelled; its working tree
    /// is moved into the run's build directory for inspection.
    pub async fn build(&self, cancel: CancellationToken) -> Result<bool, RunError> {
        let origin = self.path.join(BUILD_ORIGIN_FN);
        if fs::symlink_metadata(&origin).is_ok() {
            let err = RunError::AlreadyBuilt { id: self.id };
            self.status.note(StatusState::Info, &err.to_string());
            return Err(err);
        }

        let build_path = self.build_path();
        if build_path.exists() {
            let err = RunError::BuildFailed {
                id: self.id,
                path: build_path,
            };
            self.status.note(StatusState::BuildError, &err.to_string());
            return Err(err);
        }

        self.status
            .set(StatusState::Building, &format!("Building {}.", self.builder.name()))?;

        let built = self.recorded(StatusState::BuildError, self.builder.build(cancel.clone()).await)?;
        if built {
            let copied = self.recorded(StatusState::BuildError, self.install_build(&origin))?;
            self.status.set(
                StatusState::BuildDone,
                &format!("Build {} copied into the test run.", self.builder.name()),
            )?;
            return Ok(copied);
        }

        let fail_path = self.builder.fail_path();
        if fail_path.exists() {
            let moved = fs::rename(fail_path, self.build_path())
                .map_err(|e| RunError::storage(self.build_path(), e));
            self.recorded(StatusState::BuildError, moved)?;
        }
        if cancel.is_cancelled() {
            self.status.set(StatusState::Aborted, "Build cancelled.")?;
        } else {
            self.status.set(
                StatusState::BuildFailed,
                &format!("Build {} failed.", self.builder.name()),
            )?;
        }
        Ok(false)
    }

    fn install_build(&self, origin: &Path) -> Result<bool, RunError> {
        #[cfg(unix)]
        std::os::unix::fs::symlink(self.builder.path(), origin)
            .map_err(|e| RunError::storage(origin, e))?;
        #[cfg(not(unix))]
        fs::write(origin, self.builder.path().display().to_string())
            .map_err(|e| RunError::storage(origin, e))?;

        self.builder.copy_build(&self.build_path())
    }

    /// Borrow this run for execution.
    ///
    /// Only a finalized run with no failed build can be executed.
    pub fn runnable(&mut self) -> Result<Runnable<'_>, RunError> {
        let RunConfig::Finalized(config) = &self.config else {
            let err = RunError::NotFinalized { id: self.id };
            self.status.note(StatusState::RunError, &err.to_string());
            return Err(err);
        };
        let timeout = config.run_timeout();
        let timeout = self.recorded(StatusState::RunError, timeout)?;

        let build_path = self.build_path();
        if build_path.exists() && !self.is_built() {
            let err = RunError::BuildFailed {
                id: self.id,
                path: build_path,
            };
            self.status.note(StatusState::RunError, &err.to_string());
            return Err(err);
        }
        Ok(Runnable { run: self, timeout })
    }

    /// Produce, cache and persist this run's results.
    pub fn gather_results(&mut self, run_succeeded: bool) -> Result<ResultMap, RunError> {
        if self.finished().is_none() {
            let err = RunError::NotRun { id: self.id };
            self.status.note(StatusState::Info, &err.to_string());
            return Err(err);
        }
        if self.results_path().exists() {
            return Err(RunError::ResultsAlreadyWritten { id: self.id });
        }

        let pipeline = self.ctx.results.clone();
        let mut results = pipeline.base_results(self);
        results.insert(
            "result".into(),
            (if run_succeeded { PASS } else { FAIL }).into(),
        );

        let parser_count = self
            .config
            .section("results")?
            .map(|s| s.len())
            .unwrap_or(0);
        self.status.set(
            StatusState::Results,
            &format!("Parsing {} result types.", parser_count),
        )?;

        let results = self.recorded(StatusState::RunError, pipeline.parse_results(self, results))?;
        self.save_results(&results)?;
        self.results = Some(results.clone());
        Ok(results)
    }

    fn save_results(&self, results: &ResultMap) -> Result<(), RunError> {
        let path = self.results_path();
        let json = serde_json::to_vec(results)
            .map_err(|e| RunError::config(format!("results are not serializable: {}", e)))?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(RunError::ResultsAlreadyWritten { id: self.id });
            }
            Err(e) => return Err(RunError::storage(&path, e)),
        };
        file.write_all(&json)
            .and_then(|_| file.flush())
            .map_err(|e| RunError::storage(&path, e))
    }

    /// The results on disk, if they have been saved.
    pub fn load_results(&self) -> Result<Option<ResultMap>, RunError> {
        let path = self.results_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RunError::storage(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| RunError::config(format!("could not parse {}: {}", path.display(), e)))
    }

    /// Saved results, else whatever this process gathered.
    pub fn results(&self) -> Result<Option<ResultMap>, RunError> {
        Ok(self.load_results()?.or_else(|| self.results.clone()))
    }

    /// Signal observers that nothing about this run will change again.
    pub fn mark_complete(&self) -> Result<(), RunError> {
        self.completion.mark()?;
        debug!(run_id = self.id, "marked complete");
        Ok(())
    }

    pub fn complete(&self) -> Option<DateTime<Utc>> {
        self.completion.completed_at()
    }

    /// Wait for the completion marker. `None` waits forever.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<DateTime<Utc>, RunError> {
        self.completion
            .wait(timeout)
            .await
            .ok_or(RunError::CompletionTimeout {
                id: self.id,
                timeout: timeout.unwrap_or_default(),
            })
    }

    pub fn job_id(&self) -> Option<String> {
        if let Some(job_id) = &self.job_id {
            return Some(job_id.clone());
        }
        let path = self.path.join(JOB_ID_FN);
        match fs::read_to_string(&path) {
            Ok(job_id) => Some(job_id),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                error!(path = %path.display(), err = %e, "could not read job id file");
                None
            }
        }
    }

    /// Record the scheduler's job id. A failed write is logged, not returned.
    pub fn set_job_id(&mut self, job_id: &str) {
        let path = self.path.join(JOB_ID_FN);
        if let Err(e) = fs::write(&path, job_id) {
            error!(path = %path.display(), err = %e, "could not write job id file");
        }
        self.job_id = Some(job_id.to_string());
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
            .or_else(|| self.from_status(|log| log.first(StatusState::Created)))
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.started
            .or_else(|| self.from_status(|log| log.first(StatusState::Running)))
    }

    pub fn finished(&self) -> Option<DateTime<Utc>> {
        self.finished.or_else(|| {
            self.from_status(|log| log.last_of(&[StatusState::RunDone, StatusState::RunTimeout]))
        })
    }

    fn from_status(
        &self,
        query: impl FnOnce(&StatusLog) -> anyhow::Result<Option<crate::status::StatusEntry>>,
    ) -> Option<DateTime<Utc>> {
        match query(&self.status) {
            Ok(entry) => entry.map(|e| e.timestamp),
            Err(e) => {
                warn!(run_id = self.id, err = %e, "could not read status log");
                None
            }
        }
    }

    /// Shell command that runs this test from scratch in its allocation.
    pub fn run_cmd(&self) -> String {
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "harness".to_string());
        format!(
            "{} --working-dir {} run {}",
            exe,
            self.ctx.settings.working_dir.display(),
            self.id
        )
    }

    /// Whether a build was installed. A failed build leaves `build/` behind
    /// but never the origin link.
    pub fn is_built(&self) -> bool {
        fs::symlink_metadata(self.path.join(BUILD_ORIGIN_FN)).is_ok()
    }

    pub fn skipped(&self) -> bool {
        !self.skip_reasons.is_empty()
    }

    pub fn skip_reasons(&self) -> &[String] {
        &self.skip_reasons
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        self.config.test_name()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn variables(&self) -> &VariableSet {
        &self.vars
    }

    pub fn options(&self) -> RunOptions {
        self.options
    }

    pub fn status(&self) -> &StatusLog {
        &self.status
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn build_name(&self) -> &str {
        self.builder.name()
    }

    pub fn build_path(&self) -> PathBuf {
        self.path.join(BUILD_DIR)
    }

    pub fn run_script_path(&self) -> PathBuf {
        self.path.join(RUN_SCRIPT_FN)
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.path.join(RUN_LOG_FN)
    }

    pub fn results_path(&self) -> PathBuf {
        self.path.join(RESULTS_FN)
    }
}

/// A finalized run, ready to execute its run script.
#[derive(Debug)]
pub struct Runnable<'a> {
    run: &'a mut TestRun,
    timeout: Option<Duration>,
}

impl Runnable<'_> {
    /// Execute the run script under the quiet timeout.
    ///
    /// Returns whether the script exited zero. A timeout is an error, raised
    /// after the child is killed and the timeout recorded.
    pub async fn run(self) -> Result<bool, RunError> {
        let Runnable { run, timeout } = self;
        if run.options.build_only {
            run.status
                .set(StatusState::RunError, "Tried to run a 'build_only' test object.")?;
            return Ok(false);
        }

        run.status
            .set(StatusState::PreppingRun, "Converting run template into run script.")?;
        let entry = run.status.set(StatusState::Running, "Starting the run script.")?;
        run.started = Some(entry.timestamp);

        let build_path = run.build_path();
        let invocation = ScriptInvocation {
            script: run.run_script_path(),
            args: vec![run.id.to_string()],
            cwd: build_path.is_dir().then_some(build_path),
            log_path: run.run_log_path(),
        };
        let child = invocation.spawn().await;
        let mut child = run.recorded(StatusState::RunError, child)?;
        run.status.set(StatusState::Running, "Currently running.")?;
        info!(run_id = run.id, timeout = ?timeout, "running");

        let outcome = supervise(&mut child, &invocation.log_path, timeout, None).await;
        let outcome = run.recorded(StatusState::RunError, outcome)?;

        if let Supervision::QuietTimeout { quiet } = outcome {
            let secs = timeout.unwrap_or(Duration::ZERO).as_secs();
            let entry = run.status.set(
                StatusState::RunTimeout,
                &format!("Run timed out after {} seconds", secs),
            )?;
            run.finished = Some(entry.timestamp);
            return Err(RunError::RunTimeout { id: run.id, quiet });
        }

        let entry = run.status.set(StatusState::RunDone, "Test run has completed.")?;
        run.finished = Some(entry.timestamp);
        Ok(outcome.success())
    }
}
