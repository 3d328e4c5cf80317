use crate::builder::{BuildSubsystem, LocalBuilds};
use crate::config::HarnessConfig;
use crate::results::{DefaultResults, ResultPipeline};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a run needs from outside its own directory.
#[derive(Clone)]
pub struct RunContext {
    pub settings: HarnessConfig,
    pub builds: Arc<dyn BuildSubsystem>,
    pub results: Arc<dyn ResultPipeline>,
}

impl RunContext {
    pub fn new(
        settings: HarnessConfig,
        builds: Arc<dyn BuildSubsystem>,
        results: Arc<dyn ResultPipeline>,
    ) -> Self {
        Self {
            settings,
            builds,
            results,
        }
    }

    /// Local builds under `<working_dir>/builds` and the default result keys.
    pub fn local(settings: HarnessConfig) -> Self {
        let builds = LocalBuilds::new(settings.builds_dir(), settings.build_lock_timeout);
        Self::new(settings, Arc::new(builds), Arc::new(DefaultResults))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.settings.runs_dir()
    }
}
