//! Result pipeline.
//!
//! Result parsers are pluggable and live outside this crate. A run only needs
//! the default keys and a hook that may rewrite them.

use crate::errors::RunError;
use crate::run::TestRun;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

pub type ResultMap = Map<String, Value>;

pub const PASS: &str = "PASS";
pub const FAIL: &str = "FAIL";

pub trait ResultPipeline: Send + Sync {
    /// The keys every run's results carry.
    fn base_results(&self, run: &TestRun) -> ResultMap;

    /// Run the configured parsers over `results`.
    fn parse_results(&self, run: &TestRun, results: ResultMap) -> Result<ResultMap, RunError>;
}

/// Default keys only; parsing leaves the results as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResults;

fn timestamp(ts: Option<DateTime<Utc>>) -> Value {
    ts.map(|t| Value::String(t.to_rfc3339()))
        .unwrap_or(Value::Null)
}

impl ResultPipeline for DefaultResults {
    fn base_results(&self, run: &TestRun) -> ResultMap {
        let created = run.created();
        let started = run.started();
        let finished = run.finished();
        let duration = match (started, finished) {
            (Some(s), Some(f)) => json!((f - s).num_milliseconds() as f64 / 1000.0),
            _ => Value::Null,
        };

        let mut results = ResultMap::new();
        results.insert("name".into(), json!(run.name()));
        results.insert("id".into(), json!(run.id()));
        results.insert("created".into(), timestamp(created));
        results.insert("started".into(), timestamp(started));
        results.insert("finished".into(), timestamp(finished));
        results.insert("duration".into(), duration);
        results.insert("user".into(), json!(run.context().settings.user));
        results.insert("sys_name".into(), json!(run.context().settings.sys_name));
        results.insert("job_id".into(), run.job_id().map(Value::String).unwrap_or(Value::Null));
        results.insert("sched".into(), run.variables().set_as_json("sched"));
        results.insert("result".into(), Value::Null);
        results
    }

    fn parse_results(&self, _run: &TestRun, results: ResultMap) -> Result<ResultMap, RunError> {
        Ok(results)
    }
}
