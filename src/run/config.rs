//! A run's test configuration and its two phases.
//!
//! The config is written unresolved at creation and rewritten once, resolved,
//! by `finalize`. Only a finalized config can be run.

use crate::errors::RunError;
use crate::variables::{VariableSet, resolve_deferred, was_deferred};
use serde_json::{Map, Number, Value};
use std::path::Path;
use std::time::Duration;

pub type ConfigMap = Map<String, Value>;

/// Config as written at creation; may still hold deferred strings.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedConfig(ConfigMap);

/// Config with every deferred value resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedConfig(ConfigMap);

#[derive(Debug, Clone, PartialEq)]
pub enum RunConfig {
    Unresolved(UnresolvedConfig),
    Finalized(FinalizedConfig),
}

impl UnresolvedConfig {
    pub fn new(config: ConfigMap) -> Self {
        Self(config)
    }

    pub fn as_map(&self) -> &ConfigMap {
        &self.0
    }

    /// Resolve deferred strings against `vars`.
    pub fn finalize(self, vars: &VariableSet) -> Result<FinalizedConfig, RunError> {
        Ok(FinalizedConfig(resolve_deferred(self.0, vars)?))
    }
}

impl FinalizedConfig {
    /// A config read back from a run that already wrote its run script.
    pub(super) fn from_saved(config: ConfigMap) -> Self {
        Self(config)
    }

    pub fn as_map(&self) -> &ConfigMap {
        &self.0
    }

    pub fn run_timeout(&self) -> Result<Option<Duration>, RunError> {
        timeout(&self.0, "run")
    }
}

impl RunConfig {
    pub fn as_map(&self) -> &ConfigMap {
        match self {
            RunConfig::Unresolved(c) => c.as_map(),
            RunConfig::Finalized(c) => c.as_map(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, RunConfig::Finalized(_))
    }

    pub fn section(&self, name: &str) -> Result<Option<&ConfigMap>, RunError> {
        section(self.as_map(), name)
    }

    /// `suite.name[.subtitle]`
    pub fn test_name(&self) -> String {
        let config = self.as_map();
        let field = |key: &str, default: &str| {
            config
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let mut name = format!("{}.{}", field("suite", "<unknown>"), field("name", "<unnamed>"));
        if let Some(subtitle) = config.get("subtitle").and_then(Value::as_str)
            && !subtitle.is_empty()
        {
            name.push('.');
            name.push_str(subtitle);
        }
        name
    }
}

/// A sub-mapping of the config. Missing or null is `None`.
pub fn section<'a>(config: &'a ConfigMap, name: &str) -> Result<Option<&'a ConfigMap>, RunError> {
    match config.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(other) => Err(RunError::config(format!(
            "'{}' section must be a mapping, got {}",
            name, other
        ))),
    }
}

/// `<section>.timeout` in seconds. Accepts an integer or a string of digits.
pub fn timeout(config: &ConfigMap, section_name: &str) -> Result<Option<Duration>, RunError> {
    let invalid = || {
        RunError::config(format!(
            "Invalid value for {} timeout. Must be a positive int.",
            section_name
        ))
    };

    let Some(value) = section(config, section_name)?.and_then(|s| s.get("timeout")) else {
        return Ok(None);
    };
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n.as_u64().map(|s| Some(Duration::from_secs(s))).ok_or_else(invalid),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                s.parse().map(|secs| Some(Duration::from_secs(secs))).map_err(|_| invalid())
            } else {
                Err(invalid())
            }
        }
        _ => Err(invalid()),
    }
}

/// Check the parts of a config that must be valid before anything is built.
pub fn validate(config: &ConfigMap) -> Result<(), RunError> {
    if let Some(build) = section(config, "build")? {
        let set = |key: &str| build.get(key).is_some_and(|v| !v.is_null());
        if set("source_download_name") && !set("source_location") {
            return Err(RunError::config(
                "'source_download_name' is set without a 'source_location'",
            ));
        }
    }
    timeout(config, "build")?;
    let run_timeout_deferred = section(config, "run")?
        .and_then(|s| s.get("timeout"))
        .and_then(Value::as_str)
        .is_some_and(was_deferred);
    if !run_timeout_deferred {
        timeout(config, "run")?;
    }
    Ok(())
}

/// Read a test configuration from a JSON or TOML file (by extension).
pub fn load_test_config(path: &Path) -> Result<ConfigMap, RunError> {
    let content = std::fs::read_to_string(path).map_err(|e| RunError::storage(path, e))?;
    let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
    if is_toml {
        let table: toml::Table = toml::from_str(&content).map_err(|e| {
            RunError::config(format!("could not parse {}: {}", path.display(), e))
        })?;
        table
            .into_iter()
            .map(|(k, v)| Ok((k, toml_to_json(v)?)))
            .collect()
    } else {
        match serde_json::from_str(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(RunError::config(format!(
                "{} must contain a mapping",
                path.display()
            ))),
            Err(e) => Err(RunError::config(format!(
                "could not parse {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn toml_to_json(value: toml::Value) -> Result<Value, RunError> {
    Ok(match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| RunError::config(format!("{} is not representable in a config", f)))?,
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => {
            return Err(RunError::config(format!(
                "datetime {} is not representable in a config",
                dt
            )));
        }
        toml::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(toml_to_json)
                .collect::<Result<_, _>>()?,
        ),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| Ok((k, toml_to_json(v)?)))
                .collect::<Result<_, RunError>>()?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::defer;
    use serde_json::json;
    use tempfile::tempdir;

    fn map(v: Value) -> ConfigMap {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_timeout_forms() {
        let config = map(json!({"run": {"timeout": 30}, "build": {"timeout": " 5 "}}));
        assert_eq!(timeout(&config, "run").unwrap(), Some(Duration::from_secs(30)));
        assert_eq!(timeout(&config, "build").unwrap(), Some(Duration::from_secs(5)));
        assert_eq!(timeout(&map(json!({})), "run").unwrap(), None);
        assert_eq!(timeout(&map(json!({"run": {}})), "run").unwrap(), None);
    }

    #[test]
    fn test_bad_timeouts_are_config_errors() {
        for bad in [json!(-1), json!(1.5), json!("ten"), json!(""), json!([1])] {
            let config = map(json!({"run": {"timeout": bad}}));
            assert!(timeout(&config, "run").unwrap_err().is_config());
        }
    }

    #[test]
    fn test_validate_allows_deferred_run_timeout() {
        let config = map(json!({"run": {"timeout": defer("{{sched.limit}}")}}));
        assert!(validate(&config).is_ok());
        let config = map(json!({"build": {"timeout": defer("{{sched.limit}}")}}));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_download_name_needs_location() {
        let config = map(json!({"build": {"source_download_name": "src.tgz"}}));
        assert!(validate(&config).unwrap_err().is_config());
        let config = map(json!({"build": {
            "source_download_name": "src.tgz",
            "source_location": "https://example.com/src.tgz"
        }}));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_name_with_subtitle() {
        let config = RunConfig::Unresolved(UnresolvedConfig::new(map(
            json!({"suite": "s", "name": "n", "subtitle": "big"}),
        )));
        assert_eq!(config.test_name(), "s.n.big");
        let config = RunConfig::Unresolved(UnresolvedConfig::new(map(json!({"name": "n"}))));
        assert_eq!(config.test_name(), "<unknown>.n");
    }

    #[test]
    fn test_finalize_resolves() {
        let mut vars = VariableSet::new();
        vars.set("sched", "nodes", "4");
        let config = UnresolvedConfig::new(map(json!({"run": {"cmds": [defer("srun -N {{sched.nodes}}")]}})));
        let finalized = config.finalize(&vars).unwrap();
        assert_eq!(
            Value::Object(finalized.as_map().clone()),
            json!({"run": {"cmds": ["srun -N 4"]}})
        );
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.toml");
        std::fs::write(
            &path,
            "name = \"hello\"\n[run]\ncmds = [\"echo hi\"]\ntimeout = 10\n",
        )
        .unwrap();
        let config = load_test_config(&path).unwrap();
        assert_eq!(
            Value::Object(config),
            json!({"name": "hello", "run": {"cmds": ["echo hi"], "timeout": 10}})
        );
    }

    #[test]
    fn test_toml_datetime_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.toml");
        std::fs::write(&path, "when = 1979-05-27T07:32:00Z\n").unwrap();
        assert!(load_test_config(&path).unwrap_err().is_config());
    }

    #[test]
    fn test_json_config_must_be_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(load_test_config(&path).unwrap_err().is_config());
    }
}
